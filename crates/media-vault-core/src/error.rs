use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::storage::models::MediaId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Access(#[from] AccessError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Processing timed out after {0:?}")]
    ProcessingTimeout(Duration),

    #[error("Storage quota exceeded: {required} bytes required, {available} bytes available")]
    QuotaExceeded { required: u64, available: u64 },

    #[error("Media not found: {0}")]
    MediaNotFound(MediaId),

    #[error("No active project")]
    NoActiveProject,

    #[error("Reference count for content {hash} would drop below zero")]
    RefCountUnderflow { hash: String },

    #[error("Media {0} is not handle-backed")]
    NotHandleBacked(MediaId),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("All {failed} items in the batch failed; first error: {first}")]
    BatchFailed { failed: usize, first: String },

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// The access classification, when this error is one the UI can act on
    /// (re-grant permission or pick a replacement file).
    pub fn access_kind(&self) -> Option<AccessErrorKind> {
        match self {
            Error::Access(err) => Some(err.kind),
            Error::Worker(err) => match err.kind {
                WorkerErrorKind::NotFound => Some(AccessErrorKind::FileMissing),
                WorkerErrorKind::PermissionDenied => Some(AccessErrorKind::PermissionDenied),
                _ => None,
            },
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessErrorKind {
    PermissionDenied,
    FileMissing,
    Unknown,
}

impl AccessErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessErrorKind::PermissionDenied => "permission_denied",
            AccessErrorKind::FileMissing => "file_missing",
            AccessErrorKind::Unknown => "unknown",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "permission_denied" => Some(AccessErrorKind::PermissionDenied),
            "file_missing" => Some(AccessErrorKind::FileMissing),
            "unknown" => Some(AccessErrorKind::Unknown),
            _ => None,
        }
    }
}

impl fmt::Display for AccessErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure to reach a user-owned file through its handle.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct AccessError {
    pub kind: AccessErrorKind,
    pub message: String,
}

impl AccessError {
    pub fn new(kind: AccessErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn from_io(err: &io::Error, path: &Path) -> Self {
        let kind = match err.kind() {
            io::ErrorKind::PermissionDenied => AccessErrorKind::PermissionDenied,
            io::ErrorKind::NotFound => AccessErrorKind::FileMissing,
            _ => AccessErrorKind::Unknown,
        };
        Self::new(kind, format!("{}: {}", path.display(), err))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerErrorKind {
    NotFound,
    PermissionDenied,
    InvalidPath,
    Unavailable,
    TimedOut,
    Unexpected,
    Io,
}

/// Failure reported across a worker channel. Cloneable so a single failed
/// read can be handed to every caller that coalesced onto it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct WorkerError {
    pub kind: WorkerErrorKind,
    pub message: String,
}

impl WorkerError {
    pub fn new(kind: WorkerErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn unavailable(worker: &str) -> Self {
        Self::new(
            WorkerErrorKind::Unavailable,
            format!("{} worker is not running", worker),
        )
    }

    pub fn timed_out(worker: &str, limit: Duration) -> Self {
        Self::new(
            WorkerErrorKind::TimedOut,
            format!("{} worker did not answer within {:?}", worker, limit),
        )
    }

    pub fn unexpected(operation: &str) -> Self {
        Self::new(
            WorkerErrorKind::Unexpected,
            format!("unexpected payload for {} request", operation),
        )
    }

    pub fn with_path(err: io::Error, path: &Path) -> Self {
        let kind = match err.kind() {
            io::ErrorKind::NotFound => WorkerErrorKind::NotFound,
            io::ErrorKind::PermissionDenied => WorkerErrorKind::PermissionDenied,
            _ => WorkerErrorKind::Io,
        };
        Self::new(kind, format!("{}: {}", path.display(), err))
    }
}

impl From<io::Error> for WorkerError {
    fn from(err: io::Error) -> Self {
        let kind = match err.kind() {
            io::ErrorKind::NotFound => WorkerErrorKind::NotFound,
            io::ErrorKind::PermissionDenied => WorkerErrorKind::PermissionDenied,
            _ => WorkerErrorKind::Io,
        };
        Self::new(kind, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_error_from_io_kinds() {
        let path = Path::new("/media/clip.mp4");

        let denied = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        assert_eq!(
            AccessError::from_io(&denied, path).kind,
            AccessErrorKind::PermissionDenied
        );

        let missing = io::Error::new(io::ErrorKind::NotFound, "gone");
        assert_eq!(
            AccessError::from_io(&missing, path).kind,
            AccessErrorKind::FileMissing
        );

        let other = io::Error::new(io::ErrorKind::Other, "disk on fire");
        assert_eq!(
            AccessError::from_io(&other, path).kind,
            AccessErrorKind::Unknown
        );
    }

    #[test]
    fn test_access_kind_roundtrips_through_str() {
        for kind in [
            AccessErrorKind::PermissionDenied,
            AccessErrorKind::FileMissing,
            AccessErrorKind::Unknown,
        ] {
            assert_eq!(AccessErrorKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(AccessErrorKind::parse("bogus"), None);
    }

    #[test]
    fn test_worker_not_found_maps_to_file_missing() {
        let err: Error = WorkerError::new(WorkerErrorKind::NotFound, "nope").into();
        assert_eq!(err.access_kind(), Some(AccessErrorKind::FileMissing));
        assert_eq!(Error::NoActiveProject.access_kind(), None);
    }
}
