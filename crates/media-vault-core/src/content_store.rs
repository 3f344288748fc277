//! Content-addressed bytes with reference counting.
//!
//! Bytes for a hash exist on disk exactly while its reference count is above
//! zero. Every count mutation for one hash runs under that hash's lock, so a
//! release reaching zero cannot interleave with a store or retain of the same
//! content.

use bytes::Bytes;
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, warn};

use crate::catalog::Catalog;
use crate::error::{Error, Result};
use crate::gateway::FileGateway;
use crate::hasher::ContentHash;
use crate::layout::StorageLayout;
use crate::worker::{ProgressSink, UploadSource};

/// Upload attempts before giving up on content that keeps vanishing
/// underneath a concurrent release.
const STORE_ATTEMPTS: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredContent {
    pub hash: ContentHash,
    pub size: u64,
    pub ref_count: i64,
    /// The bytes were already in the store before this call.
    pub deduplicated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReleaseOutcome {
    pub ref_count: i64,
    pub deleted: bool,
}

pub struct ContentStore {
    gateway: FileGateway,
    catalog: Catalog,
    locks: DashMap<ContentHash, Arc<AsyncMutex<()>>>,
}

impl ContentStore {
    pub fn new(gateway: FileGateway, catalog: Catalog) -> Self {
        Self {
            gateway,
            catalog,
            locks: DashMap::new(),
        }
    }

    fn lock_for(&self, hash: &ContentHash) -> Arc<AsyncMutex<()>> {
        Arc::clone(
            self.locks
                .entry(hash.clone())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .value(),
        )
    }

    /// Drop the lock entry once nobody else holds or waits on it.
    fn prune_lock(&self, hash: &ContentHash) {
        self.locks
            .remove_if(hash, |_, lock| Arc::strong_count(lock) == 1);
    }

    pub fn absolute_path(&self, hash: &ContentHash) -> PathBuf {
        self.gateway.root().join(StorageLayout::content_path(hash))
    }

    /// Stream new bytes into the store and take one reference on them.
    pub async fn store(
        &self,
        source: UploadSource,
        progress: Option<ProgressSink>,
    ) -> Result<StoredContent> {
        let required = match &source {
            UploadSource::Bytes(bytes) => bytes.len() as u64,
            UploadSource::File(path) => tokio::fs::metadata(path).await?.len(),
        };
        let quota = self.gateway.check_quota(required).await?;
        if !quota.fits {
            warn!(
                "Refusing {} byte write, {} bytes available",
                required, quota.available
            );
            return Err(Error::QuotaExceeded {
                required,
                available: quota.available,
            });
        }

        for attempt in 1..=STORE_ATTEMPTS {
            let receipt = self
                .gateway
                .process_upload(source.clone(), progress.clone())
                .await?;
            let hash = receipt
                .hash
                .ok_or_else(|| Error::Other("upload returned no content hash".to_string()))?;

            let lock = self.lock_for(&hash);
            let stored = {
                let _guard = lock.lock().await;
                let ref_count = self
                    .catalog
                    .with(|db| Ok(db.increment_content(&hash, receipt.size)?))?;

                if tokio::fs::try_exists(self.absolute_path(&hash)).await? {
                    Some(StoredContent {
                        hash: hash.clone(),
                        size: receipt.size,
                        ref_count,
                        deduplicated: ref_count > 1 || receipt.already_present,
                    })
                } else {
                    // A release deleted the bytes between upload and increment.
                    warn!(
                        "Content {} vanished before it was referenced (attempt {})",
                        hash, attempt
                    );
                    self.undo_increment(&hash).await?;
                    None
                }
            };
            drop(lock);
            self.prune_lock(&hash);

            if let Some(stored) = stored {
                debug!(
                    "Stored content {} ({} bytes, ref_count {})",
                    stored.hash, stored.size, stored.ref_count
                );
                return Ok(stored);
            }
        }

        Err(Error::Other(format!(
            "content disappeared during {} upload attempts",
            STORE_ATTEMPTS
        )))
    }

    async fn undo_increment(&self, hash: &ContentHash) -> Result<()> {
        let remaining = self.decrement(hash)?;
        if remaining == 0 {
            self.catalog
                .with(|db| Ok(db.delete_content_record(hash)?))?;
        }
        Ok(())
    }

    /// Take an additional reference on content already in the store, without
    /// re-uploading it.
    pub async fn retain(&self, hash: &ContentHash) -> Result<i64> {
        let lock = self.lock_for(hash);
        let result = {
            let _guard = lock.lock().await;
            let record = self.catalog.with(|db| Ok(db.get_content(hash)?))?;
            match record {
                Some(record) if record.ref_count > 0 => self.increment(hash, record.size),
                _ => Err(Error::Validation(format!(
                    "content {} is not in the store",
                    hash
                ))),
            }
        };
        drop(lock);
        self.prune_lock(hash);
        result
    }

    /// Raw increment. Callers outside this module go through `store` or
    /// `retain`, which hold the per-hash lock.
    pub fn increment(&self, hash: &ContentHash, size: u64) -> Result<i64> {
        self.catalog
            .with(|db| Ok(db.increment_content(hash, size)?))
    }

    /// Raw decrement returning the new count. Going below zero is an
    /// invariant violation and is reported, never clamped.
    pub fn decrement(&self, hash: &ContentHash) -> Result<i64> {
        self.catalog.with(|db| match db.decrement_content(hash)? {
            Some(count) => Ok(count),
            None => {
                let current = db.get_content(hash)?.map(|record| record.ref_count);
                error!(
                    "Reference count underflow for content {} (current: {:?})",
                    hash, current
                );
                Err(Error::RefCountUnderflow {
                    hash: hash.to_string(),
                })
            }
        })
    }

    /// Delete the bytes, then the record.
    pub async fn delete_content(&self, hash: &ContentHash) -> Result<()> {
        self.gateway
            .delete_file(&StorageLayout::content_dir(hash))
            .await?;
        self.catalog
            .with(|db| Ok(db.delete_content_record(hash)?))?;
        info!("Deleted content {}", hash);
        Ok(())
    }

    /// Drop one reference and delete the content when none remain.
    pub async fn release(&self, hash: &ContentHash) -> Result<ReleaseOutcome> {
        let lock = self.lock_for(hash);
        let result = {
            let _guard = lock.lock().await;
            match self.decrement(hash) {
                Ok(0) => self.delete_content(hash).await.map(|_| ReleaseOutcome {
                    ref_count: 0,
                    deleted: true,
                }),
                Ok(ref_count) => Ok(ReleaseOutcome {
                    ref_count,
                    deleted: false,
                }),
                Err(err) => Err(err),
            }
        };
        drop(lock);
        self.prune_lock(hash);
        result
    }

    /// Force the stored count to `actual`, the number of media records that
    /// really reference the content. Content nobody references is deleted.
    /// Returns whether it was deleted.
    pub async fn reconcile(&self, hash: &ContentHash, actual: i64) -> Result<bool> {
        let lock = self.lock_for(hash);
        let result = {
            let _guard = lock.lock().await;
            if actual <= 0 {
                self.delete_content(hash).await.map(|_| true)
            } else {
                warn!("Resetting reference count of {} to {}", hash, actual);
                self.catalog
                    .with(|db| Ok(db.set_content_ref_count(hash, actual)?))
                    .map(|_| false)
            }
        };
        drop(lock);
        self.prune_lock(hash);
        result
    }

    pub async fn read(&self, hash: &ContentHash) -> Result<Bytes> {
        Ok(self
            .gateway
            .get_file(&StorageLayout::content_path(hash))
            .await?)
    }

    pub fn ref_count(&self, hash: &ContentHash) -> Result<i64> {
        self.catalog.with(|db| {
            Ok(db
                .get_content(hash)?
                .map(|record| record.ref_count)
                .unwrap_or(0))
        })
    }
}
