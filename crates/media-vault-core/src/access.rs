use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use crate::error::{AccessError, AccessErrorKind};

/// Capability-scoped reference to a file on the user's own filesystem.
///
/// The library reads through it but never writes or deletes the target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalHandle {
    path: PathBuf,
}

impl ExternalHandle {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_name(&self) -> Option<String> {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
    }

    /// Confirms the handle still grants read access and returns the current size.
    pub fn verify_access(&self) -> Result<u64, AccessError> {
        let metadata =
            fs::metadata(&self.path).map_err(|err| AccessError::from_io(&err, &self.path))?;
        if !metadata.is_file() {
            return Err(AccessError::new(
                AccessErrorKind::Unknown,
                format!("{} is not a regular file", self.path.display()),
            ));
        }
        File::open(&self.path).map_err(|err| AccessError::from_io(&err, &self.path))?;
        Ok(metadata.len())
    }
}
