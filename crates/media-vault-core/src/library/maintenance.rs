use bytes::Bytes;
use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use super::batch::{BatchFailure, BatchReport};
use super::import::validate_import;
use super::MediaLibrary;
use crate::access::ExternalHandle;
use crate::error::{AccessErrorKind, Error, Result};
use crate::extractor::{ExtractRequest, Thumbnail};
use crate::integrity::{self, IntegrityOptions, IntegrityReport};
use crate::storage::models::{MediaId, MediaRecord, StorageBackend, ThumbnailRecord};

impl MediaLibrary {
    /// Persist the broken flag for a record. `None` clears it.
    pub(super) fn flag_broken(&self, id: &MediaId, reason: Option<AccessErrorKind>) -> Result<()> {
        let now = Utc::now();
        self.mutate(
            |index| {
                index.update(id, |record| {
                    record.broken_reason = reason;
                    record.updated_at = now;
                });
            },
            |db| {
                db.set_media_broken(id, reason, now)?;
                Ok(())
            },
        )?;
        match reason {
            Some(reason) => warn!("{} flagged broken: {}", id, reason),
            None => info!("{} is reachable again", id),
        }
        Ok(())
    }

    /// Point a handle-backed record at a different file, e.g. after the user
    /// moved or re-granted it. Metadata is kept as is.
    pub fn relink(&self, id: &MediaId, handle: ExternalHandle) -> Result<MediaRecord> {
        let record = self.media(id)?;
        if record.external_handle().is_none() {
            return Err(Error::NotHandleBacked(id.clone()));
        }

        let file_size = handle.verify_access()?;
        let file_name = handle.file_name().ok_or_else(|| {
            Error::Validation(format!("{} has no file name", handle.path().display()))
        })?;
        let mime_type = validate_import(&file_name, file_size, self.config.import.max_file_size)?;

        let now = Utc::now();
        let mut updated = record;
        updated.backend = StorageBackend::HandleBacked {
            external_handle: handle.clone(),
        };
        updated.file_name = file_name.clone();
        updated.mime_type = mime_type.to_string();
        updated.file_size = file_size;
        updated.broken_reason = None;
        updated.updated_at = now;

        self.mutate(
            |index| {
                index.update(id, |record| *record = updated.clone());
            },
            |db| {
                db.update_media_source(id, &handle, &file_name, mime_type, file_size, now)?;
                Ok(())
            },
        )?;
        self.thumbnails.invalidate(id);
        info!("Relinked {} to {}", id, handle.path().display());
        Ok(updated)
    }

    /// Re-check that a record's bytes are reachable and persist the result.
    /// Returns the reason it is broken, if it is.
    pub async fn verify_media(&self, id: &MediaId) -> Result<Option<AccessErrorKind>> {
        let record = self.media(id)?;
        let reason = match (record.external_handle(), record.content_hash()) {
            (Some(handle), _) => handle.verify_access().err().map(|err| err.kind),
            (None, Some(hash)) => {
                if tokio::fs::try_exists(self.content.absolute_path(hash)).await? {
                    None
                } else {
                    Some(AccessErrorKind::FileMissing)
                }
            }
            (None, None) => None,
        };
        if reason != record.broken_reason {
            self.flag_broken(id, reason)?;
        }
        Ok(reason)
    }

    /// Verify every media item of the active project; returns the broken ones.
    pub async fn verify_project(&self) -> Result<Vec<(MediaId, AccessErrorKind)>> {
        self.require_project()?;
        let ids = self.index()?.ids();
        let mut broken = Vec::new();
        for id in ids {
            if let Some(reason) = self.verify_media(&id).await? {
                broken.push((id, reason));
            }
        }
        info!("Verified project media: {} broken", broken.len());
        Ok(broken)
    }

    /// Swap in a freshly extracted thumbnail, or drop the old one when
    /// extraction produced none. Returns whether the media has a thumbnail.
    fn replace_thumbnail(&self, id: &MediaId, thumbnail: Option<&Thumbnail>) -> Result<bool> {
        let now = Utc::now();
        let record = thumbnail.map(|thumb| ThumbnailRecord {
            id: Uuid::new_v4().to_string(),
            media_id: id.clone(),
            image: thumb.image.clone(),
            width: thumb.width,
            height: thumb.height,
            created_at: now,
        });
        let thumbnail_id = record.as_ref().map(|thumb| thumb.id.clone());

        self.mutate(
            |index| {
                index.update(id, |media| {
                    media.thumbnail_id = thumbnail_id.clone();
                    media.updated_at = now;
                });
            },
            |db| {
                match &record {
                    Some(thumb) => db.upsert_thumbnail(thumb)?,
                    None => {
                        db.delete_thumbnail(id)?;
                    }
                }
                db.set_media_thumbnail(id, thumbnail_id.as_deref(), now)?;
                Ok(())
            },
        )?;

        self.thumbnails.invalidate(id);
        let has_thumbnail = record.is_some();
        if let Some(thumb) = record {
            self.thumbnails.insert(id.clone(), Bytes::from(thumb.image));
        }
        Ok(has_thumbnail)
    }

    pub(super) fn extract_request(&self, record: &MediaRecord) -> ExtractRequest {
        ExtractRequest {
            path: self.source_path(record),
            mime_type: record.mime_type.clone(),
        }
    }

    pub async fn regenerate_thumbnail(&self, id: &MediaId) -> Result<bool> {
        let record = self.media(id)?;
        self.ensure_reachable(&record)?;
        let extraction = self.extractor.extract(self.extract_request(&record)).await?;
        self.replace_thumbnail(id, extraction.thumbnail.as_ref())
    }

    /// Regenerate thumbnails for several media, extracting them concurrently.
    pub async fn regenerate_thumbnails(&self, ids: &[MediaId]) -> Result<BatchReport<MediaId>> {
        self.reporter.on_batch_start(ids.len());
        let mut report = BatchReport::default();
        let mut targets = Vec::new();
        for (index, id) in ids.iter().enumerate() {
            let reachable = self
                .media(id)
                .and_then(|record| self.ensure_reachable(&record).map(|_| record));
            match reachable {
                Ok(record) => targets.push((index, record)),
                Err(error) => report.failures.push(BatchFailure {
                    index,
                    label: id.to_string(),
                    error,
                }),
            }
        }

        let requests = targets
            .iter()
            .map(|(_, record)| self.extract_request(record))
            .collect();
        let results = self
            .extractor
            .extract_batch(requests, self.reporter.as_ref())
            .await;

        for ((index, record), result) in targets.into_iter().zip(results) {
            let replaced = result
                .and_then(|extraction| self.replace_thumbnail(&record.id, extraction.thumbnail.as_ref()));
            match replaced {
                Ok(_) => report.succeeded.push(record.id),
                Err(error) => report.failures.push(BatchFailure {
                    index,
                    label: record.id.to_string(),
                    error,
                }),
            }
        }
        report.failures.sort_by_key(|failure| failure.index);

        self.reporter
            .on_batch_complete(report.succeeded.len(), report.failed());
        report.into_result()
    }

    /// Compare the content tree with the catalog, optionally repairing what
    /// can be repaired.
    pub async fn check_integrity(&self, repair: bool) -> Result<IntegrityReport> {
        let options = IntegrityOptions {
            repair,
            ..IntegrityOptions::default()
        };
        integrity::check_integrity(&self.gateway, &self.catalog, &self.content, options).await
    }
}
