pub mod access;
pub mod cache;
pub mod catalog;
pub mod config;
pub mod content_store;
pub mod error;
pub mod extractor;
pub mod gateway;
pub mod hasher;
pub mod integrity;
pub mod layout;
pub mod library;
pub mod mime;
pub mod progress;
pub mod proxy;
pub mod scanner;
pub mod storage;
pub mod worker;

pub use access::ExternalHandle;
pub use config::AppConfig;
pub use error::{AccessError, AccessErrorKind, Error, Result};
pub use library::{
    BatchReport, ImportSource, ImportedMedia, LibraryBuilder, MediaLibrary, MediaObserver,
    RemovalOutcome,
};
pub use progress::{ProgressReporter, SilentReporter};
pub use storage::models::{MediaId, MediaKind, MediaRecord, ProjectId, StorageBackend};
