//! Thread-safe access to the SQLite catalog.

use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::info;

use crate::error::{Error, Result};
use crate::storage::models::{MediaId, MediaRecord};
use crate::storage::Database;

#[derive(Clone)]
pub struct Catalog {
    db: Arc<Mutex<Database>>,
}

impl Catalog {
    pub fn new(db: Database) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
        }
    }

    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let db = Database::open(path)?;
        info!("Catalog opened at {}", path.display());
        Ok(Self::new(db))
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::new(Database::open_in_memory()?))
    }

    /// Run `f` with exclusive access to the database. Never hold this across
    /// an await point.
    pub fn with<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Database) -> Result<T>,
    {
        let db = self
            .db
            .lock()
            .map_err(|_| Error::Other("catalog lock poisoned".to_string()))?;
        f(&db)
    }

    /// Like [`Catalog::with`], but every statement commits or rolls back together.
    pub fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Database) -> Result<T>,
    {
        self.with(|db| db.in_transaction(f))
    }

    pub fn find_media(&self, id: &MediaId) -> Result<Option<MediaRecord>> {
        self.with(|db| Ok(db.get_media(id)?))
    }

    pub fn media(&self, id: &MediaId) -> Result<MediaRecord> {
        self.find_media(id)?
            .ok_or_else(|| Error::MediaNotFound(id.clone()))
    }
}
