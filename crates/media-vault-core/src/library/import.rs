use bytes::Bytes;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::batch::{run_isolated, BatchReport};
use super::MediaLibrary;
use crate::access::ExternalHandle;
use crate::error::{Error, Result};
use crate::extractor::Extraction;
use crate::hasher::ContentHash;
use crate::mime;
use crate::scanner;
use crate::storage::models::{
    MediaId, MediaRecord, ProjectId, StorageBackend, ThumbnailRecord,
};
use crate::worker::UploadSource;

pub const MAX_FILE_NAME_LENGTH: usize = 255;

/// Where the bytes of a new media item come from.
#[derive(Debug, Clone)]
pub enum ImportSource {
    /// A file on the user's disk, referenced in place.
    Handle(ExternalHandle),
    /// A file on the user's disk, copied into the content store.
    File(PathBuf),
    /// Bytes already in memory, stored in the content store.
    Bytes { file_name: String, bytes: Bytes },
}

impl ImportSource {
    pub fn label(&self) -> String {
        match self {
            ImportSource::Handle(handle) => handle.path().display().to_string(),
            ImportSource::File(path) => path.display().to_string(),
            ImportSource::Bytes { file_name, .. } => file_name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImportedMedia {
    pub record: MediaRecord,
    /// The project already held a media item with this name and size; the
    /// existing record is returned and nothing was stored or extracted.
    pub is_duplicate: bool,
    pub audio_supported: bool,
}

/// A source that passed its access check, with everything validation needs.
struct Resolved {
    file_name: String,
    file_size: u64,
    origin: Origin,
}

enum Origin {
    Handle(ExternalHandle),
    Upload(UploadSource),
}

/// Check the limits every import must satisfy. Returns the MIME type.
pub fn validate_import(file_name: &str, file_size: u64, max_file_size: u64) -> Result<&'static str> {
    if file_size == 0 {
        return Err(Error::Validation(format!("{} is empty", file_name)));
    }
    if file_size > max_file_size {
        return Err(Error::Validation(format!(
            "{} is {} bytes, over the {} byte limit",
            file_name, file_size, max_file_size
        )));
    }
    if file_name.chars().count() > MAX_FILE_NAME_LENGTH {
        return Err(Error::Validation(format!(
            "file name longer than {} characters",
            MAX_FILE_NAME_LENGTH
        )));
    }
    mime::mime_from_file_name(file_name)
        .ok_or_else(|| Error::Validation(format!("{} is not a supported media type", file_name)))
}

fn file_name_of(path: &Path) -> Result<String> {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| Error::Validation(format!("{} has no file name", path.display())))
}

fn resolve(source: ImportSource) -> Result<Resolved> {
    match source {
        ImportSource::Handle(handle) => {
            let file_size = handle.verify_access()?;
            Ok(Resolved {
                file_name: file_name_of(handle.path())?,
                file_size,
                origin: Origin::Handle(handle),
            })
        }
        ImportSource::File(path) => {
            let file_size = ExternalHandle::new(&path).verify_access()?;
            Ok(Resolved {
                file_name: file_name_of(&path)?,
                file_size,
                origin: Origin::Upload(UploadSource::File(path)),
            })
        }
        ImportSource::Bytes { file_name, bytes } => Ok(Resolved {
            file_size: bytes.len() as u64,
            file_name,
            origin: Origin::Upload(UploadSource::Bytes(bytes)),
        }),
    }
}

impl MediaLibrary {
    /// Import one media item into the active project.
    pub async fn import(&self, source: ImportSource) -> Result<ImportedMedia> {
        let project = self.require_project()?;
        let resolved = resolve(source)?;
        let mime_type = validate_import(
            &resolved.file_name,
            resolved.file_size,
            self.config.import.max_file_size,
        )?;

        let duplicate = self.catalog.with(|db| {
            Ok(db.find_duplicate_in_project(&project, &resolved.file_name, resolved.file_size)?)
        })?;
        if let Some(record) = duplicate {
            debug!("{} is already in project {}", resolved.file_name, project);
            return Ok(ImportedMedia {
                audio_supported: record.properties.audio_codec_supported,
                record,
                is_duplicate: true,
            });
        }

        let backend = match resolved.origin {
            Origin::Handle(external_handle) => StorageBackend::HandleBacked { external_handle },
            Origin::Upload(upload) => {
                let sink = self.upload_sink(&resolved.file_name);
                let stored = self.content.store(upload, Some(sink)).await?;
                StorageBackend::ContentAddressed { hash: stored.hash }
            }
        };
        let stored_hash = match &backend {
            StorageBackend::ContentAddressed { hash } => Some(hash.clone()),
            StorageBackend::HandleBacked { .. } => None,
        };

        let now = Utc::now();
        let mut record = MediaRecord {
            id: MediaId::generate(),
            backend,
            file_name: resolved.file_name,
            file_size: resolved.file_size,
            mime_type: mime_type.to_string(),
            properties: Default::default(),
            thumbnail_id: None,
            broken_reason: None,
            created_at: now,
            updated_at: now,
        };

        let extraction = match self.extractor.extract(self.extract_request(&record)).await {
            Ok(extraction) => extraction,
            Err(err) => {
                self.abandon_content(stored_hash.as_ref()).await;
                return Err(err);
            }
        };

        let thumbnail = thumbnail_record(&record.id, &extraction);
        record.properties = extraction.properties;
        record.thumbnail_id = thumbnail.as_ref().map(|thumb| thumb.id.clone());

        if let Err(err) = self.persist(&project, &record, thumbnail.as_ref()) {
            self.abandon_content(stored_hash.as_ref()).await;
            return Err(err);
        }
        if let Some(thumbnail) = thumbnail {
            self.thumbnails
                .insert(record.id.clone(), Bytes::from(thumbnail.image));
        }

        if self.config.proxy.auto_generate {
            if let Some(source) = self.proxy_source(&record) {
                if let Err(err) = self.proxies.start(source).await {
                    warn!("{}: could not start proxy: {}", record.id, err);
                }
            }
        }

        info!(
            "Imported {} as {} ({} bytes, {})",
            record.file_name,
            record.id,
            record.file_size,
            record.backend.as_str()
        );
        Ok(ImportedMedia {
            audio_supported: record.properties.audio_codec_supported,
            record,
            is_duplicate: false,
        })
    }

    /// Media row, thumbnail and association, all or nothing.
    fn persist(
        &self,
        project: &ProjectId,
        record: &MediaRecord,
        thumbnail: Option<&ThumbnailRecord>,
    ) -> Result<()> {
        let active = self.index()?.is_active(project);
        self.mutate(
            |index| {
                if active {
                    index.upsert(record.clone());
                }
            },
            |db| {
                db.insert_media(record)?;
                if let Some(thumbnail) = thumbnail {
                    db.upsert_thumbnail(thumbnail)?;
                }
                db.add_association(project, &record.id)?;
                Ok(())
            },
        )
    }

    /// Give back the reference a failed import took on stored content.
    async fn abandon_content(&self, hash: Option<&ContentHash>) {
        if let Some(hash) = hash {
            if let Err(err) = self.content.release(hash).await {
                warn!("Could not release content {} after failed import: {}", hash, err);
            }
        }
    }

    /// Import each source on its own; see [`BatchReport`].
    pub async fn import_batch(&self, sources: Vec<ImportSource>) -> Result<BatchReport<ImportedMedia>> {
        self.require_project()?;
        let reporter = Arc::clone(&self.reporter);
        run_isolated(sources, reporter.as_ref(), ImportSource::label, move |source| {
            self.import(source)
        })
        .await
    }

    /// Import every supported file under `dir` that the ignore patterns let through.
    pub async fn import_directory(&self, dir: &Path) -> Result<BatchReport<ImportedMedia>> {
        self.require_project()?;
        let roots = vec![dir.to_path_buf()];
        let patterns = self.config.import.ignore_patterns.clone();
        let files = tokio::task::spawn_blocking(move || scanner::collect_media_files(&roots, &patterns))
            .await
            .map_err(|err| Error::Other(format!("directory scan failed: {}", err)))??;
        info!("Importing {} files from {}", files.len(), dir.display());

        let copy = self.config.import.copy_into_store;
        let sources = files
            .into_iter()
            .map(|path| {
                if copy {
                    ImportSource::File(path)
                } else {
                    ImportSource::Handle(ExternalHandle::new(path))
                }
            })
            .collect();
        self.import_batch(sources).await
    }

    /// Put an independent copy of a media item into `target`. The copy is a
    /// new record; content-addressed bytes are shared, not duplicated.
    pub async fn copy_to_project(&self, id: &MediaId, target: &ProjectId) -> Result<MediaRecord> {
        let source = self.media(id)?;
        let thumbnail = self.catalog.with(|db| Ok(db.get_thumbnail(id)?))?;

        if let Some(hash) = source.content_hash() {
            self.content.retain(hash).await?;
        }

        let now = Utc::now();
        let mut copy = source.clone();
        copy.id = MediaId::generate();
        copy.created_at = now;
        copy.updated_at = now;
        let thumbnail = thumbnail.map(|thumb| ThumbnailRecord {
            id: Uuid::new_v4().to_string(),
            media_id: copy.id.clone(),
            created_at: now,
            ..thumb
        });
        copy.thumbnail_id = thumbnail.as_ref().map(|thumb| thumb.id.clone());

        if let Err(err) = self.persist(target, &copy, thumbnail.as_ref()) {
            self.abandon_content(source.content_hash()).await;
            return Err(err);
        }
        info!("Copied {} to project {} as {}", id, target, copy.id);
        Ok(copy)
    }

    /// Share an existing media record with `target`. Returns `false` when it
    /// was already there.
    pub fn attach_to_project(&self, id: &MediaId, target: &ProjectId) -> Result<bool> {
        let record = self.media(id)?;
        let active = self.index()?.is_active(target);
        let added = self.mutate(
            |index| {
                if active {
                    index.upsert(record.clone());
                }
            },
            |db| Ok(db.add_association(target, id)?),
        )?;
        debug!("Attached {} to project {}: {}", id, target, added);
        Ok(added)
    }
}

fn thumbnail_record(media_id: &MediaId, extraction: &Extraction) -> Option<ThumbnailRecord> {
    extraction.thumbnail.as_ref().map(|thumb| ThumbnailRecord {
        id: Uuid::new_v4().to_string(),
        media_id: media_id.clone(),
        image: thumb.image.clone(),
        width: thumb.width,
        height: thumb.height,
        created_at: Utc::now(),
    })
}
