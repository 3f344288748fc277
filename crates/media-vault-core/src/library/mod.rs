//! The media library: the one place that ties catalog, content store,
//! extractor and proxy pipeline together.
//!
//! All services are built once by [`LibraryBuilder`] and owned by the
//! [`MediaLibrary`]. Nothing here is global.

mod batch;
mod import;
mod index;
mod maintenance;
mod removal;

pub use batch::{BatchFailure, BatchReport};
pub use import::{validate_import, ImportSource, ImportedMedia};
pub use index::MediaIndex;
pub use removal::RemovalOutcome;

use bytes::Bytes;
use futures::future::join_all;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

use crate::cache::ThumbnailCache;
use crate::catalog::Catalog;
use crate::config::AppConfig;
use crate::content_store::ContentStore;
use crate::error::{AccessError, Error, Result};
use crate::extractor::{Extractor, FfmpegDecoder, MediaDecoder};
use crate::gateway::{FileGateway, StorageEstimate};
use crate::layout::StorageLayout;
use crate::progress::{ProgressReporter, SilentReporter};
use crate::proxy::{FfmpegTranscoder, ProxyPipeline, ProxySource, ProxyState, Transcoder};
use crate::storage::models::{LibraryStats, MediaId, MediaKind, MediaRecord, ProjectId};
use crate::storage::Database;
use crate::worker::{ProgressSink, UploadProgress, UploadSource};

const THUMBNAIL_CACHE_CAPACITY: usize = 256;

/// Told which media ids left a project, so layers holding references to
/// them (timelines, selections) can drop those references.
pub trait MediaObserver: Send + Sync {
    fn on_media_removed(&self, project: &ProjectId, media: &[MediaId]);
}

pub struct LibraryBuilder {
    config: AppConfig,
    catalog: Option<Catalog>,
    decoder: Option<Arc<dyn MediaDecoder>>,
    transcoder: Option<Arc<dyn Transcoder>>,
    reporter: Arc<dyn ProgressReporter>,
}

impl LibraryBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            catalog: None,
            decoder: None,
            transcoder: None,
            reporter: Arc::new(SilentReporter),
        }
    }

    pub fn with_catalog(mut self, catalog: Catalog) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn with_decoder(mut self, decoder: Arc<dyn MediaDecoder>) -> Self {
        self.decoder = Some(decoder);
        self
    }

    pub fn with_transcoder(mut self, transcoder: Arc<dyn Transcoder>) -> Self {
        self.transcoder = Some(transcoder);
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Construct every service. Must be called inside a Tokio runtime.
    pub fn build(self) -> Result<MediaLibrary> {
        let storage = &self.config.storage;
        fs::create_dir_all(&storage.root_dir)?;

        let catalog = match self.catalog {
            Some(catalog) => catalog,
            None => Catalog::open(&storage.catalog_path)?,
        };
        let decoder = self.decoder.unwrap_or_else(|| {
            Arc::new(FfmpegDecoder::new(
                self.config.extractor.ffmpeg_path.clone(),
                self.config.extractor.ffprobe_path.clone(),
            ))
        });
        let transcoder = self.transcoder.unwrap_or_else(|| {
            Arc::new(FfmpegTranscoder::new(self.config.extractor.ffmpeg_path.clone()))
        });

        let gateway = FileGateway::new(
            storage.root_dir.clone(),
            storage.chunk_size,
            storage.quota_bytes,
        );
        let content = ContentStore::new(gateway.clone(), catalog.clone());
        let extractor = Extractor::new(decoder, &self.config.extractor)?;
        let proxies = ProxyPipeline::new(
            gateway.clone(),
            transcoder,
            self.config.proxy.clone(),
            Arc::clone(&self.reporter),
        );
        let layout = StorageLayout::new(storage.root_dir.clone(), self.config.proxy.extension.clone());

        info!("Media library ready at {}", storage.root_dir.display());
        Ok(MediaLibrary {
            config: self.config,
            catalog,
            gateway,
            layout,
            content,
            extractor,
            proxies,
            thumbnails: ThumbnailCache::new(THUMBNAIL_CACHE_CAPACITY),
            index: RwLock::new(MediaIndex::default()),
            observers: RwLock::new(Vec::new()),
            reporter: self.reporter,
        })
    }
}

pub struct MediaLibrary {
    config: AppConfig,
    catalog: Catalog,
    gateway: FileGateway,
    layout: StorageLayout,
    content: ContentStore,
    extractor: Extractor,
    proxies: ProxyPipeline,
    thumbnails: ThumbnailCache,
    index: RwLock<MediaIndex>,
    observers: RwLock<Vec<Arc<dyn MediaObserver>>>,
    reporter: Arc<dyn ProgressReporter>,
}

impl MediaLibrary {
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn gateway(&self) -> &FileGateway {
        &self.gateway
    }

    pub fn content(&self) -> &ContentStore {
        &self.content
    }

    pub fn proxies(&self) -> &ProxyPipeline {
        &self.proxies
    }

    pub fn thumbnail_cache(&self) -> &ThumbnailCache {
        &self.thumbnails
    }

    fn index(&self) -> Result<RwLockReadGuard<'_, MediaIndex>> {
        self.index
            .read()
            .map_err(|_| Error::Other("media index lock poisoned".to_string()))
    }

    fn index_mut(&self) -> Result<RwLockWriteGuard<'_, MediaIndex>> {
        self.index
            .write()
            .map_err(|_| Error::Other("media index lock poisoned".to_string()))
    }

    /// Apply `apply` to the index, then run `commit` in one catalog
    /// transaction. A failed commit puts the index back as it was.
    fn mutate<T, A, C>(&self, apply: A, commit: C) -> Result<T>
    where
        A: FnOnce(&mut MediaIndex),
        C: FnOnce(&Database) -> Result<T>,
    {
        let mut index = self.index_mut()?;
        let snapshot = index.clone();
        apply(&mut index);
        match self.catalog.transaction(commit) {
            Ok(value) => Ok(value),
            Err(err) => {
                warn!("Catalog update failed, restoring media index: {}", err);
                *index = snapshot;
                Err(err)
            }
        }
    }

    // ── Projects ─────────────────────────────────────────────────

    /// Make `project` the active project: load its media and restore any
    /// proxies left on disk for them. Returns the number of media loaded.
    pub async fn open_project(&self, project: ProjectId) -> Result<usize> {
        let records = self
            .catalog
            .with(|db| Ok(db.list_project_media(&project)?))?;
        let ids: Vec<MediaId> = records.iter().map(|record| record.id.clone()).collect();
        let count = records.len();
        *self.index_mut()? = MediaIndex::load(project.clone(), records);
        self.thumbnails.clear();

        let ready = self.proxies.discover(&ids).await?;
        info!(
            "Opened project {} ({} media, {} ready proxies)",
            project,
            count,
            ready.len()
        );
        Ok(count)
    }

    pub fn close_project(&self) -> Result<()> {
        *self.index_mut()? = MediaIndex::default();
        self.thumbnails.clear();
        Ok(())
    }

    pub fn active_project(&self) -> Result<Option<ProjectId>> {
        Ok(self.index()?.project().cloned())
    }

    fn require_project(&self) -> Result<ProjectId> {
        self.active_project()?.ok_or(Error::NoActiveProject)
    }

    /// Media of the active project, in the order they were added.
    pub fn list_media(&self) -> Result<Vec<MediaRecord>> {
        let index = self.index()?;
        if index.project().is_none() {
            return Err(Error::NoActiveProject);
        }
        Ok(index.records())
    }

    pub fn media(&self, id: &MediaId) -> Result<MediaRecord> {
        if let Some(record) = self.index()?.get(id) {
            return Ok(record.clone());
        }
        self.catalog.media(id)
    }

    pub fn projects_for(&self, id: &MediaId) -> Result<Vec<ProjectId>> {
        self.catalog.with(|db| Ok(db.projects_for_media(id)?))
    }

    pub fn add_observer(&self, observer: Arc<dyn MediaObserver>) -> Result<()> {
        self.observers
            .write()
            .map_err(|_| Error::Other("observer lock poisoned".to_string()))?
            .push(observer);
        Ok(())
    }

    fn notify_removed(&self, project: &ProjectId, ids: &[MediaId]) {
        if ids.is_empty() {
            return;
        }
        match self.observers.read() {
            Ok(observers) => {
                for observer in observers.iter() {
                    observer.on_media_removed(project, ids);
                }
            }
            Err(_) => warn!("observer lock poisoned, {} removals not announced", ids.len()),
        }
    }

    // ── Reading ──────────────────────────────────────────────────

    /// Absolute path a decoder or transcoder can open for this record.
    fn source_path(&self, record: &MediaRecord) -> PathBuf {
        match (record.content_hash(), record.external_handle()) {
            (Some(hash), _) => self.content.absolute_path(hash),
            (None, Some(handle)) => handle.path().to_path_buf(),
            (None, None) => self.gateway.root().to_path_buf(),
        }
    }

    /// Check that a handle-backed record is still reachable, flagging it
    /// broken when it is not.
    fn ensure_reachable(&self, record: &MediaRecord) -> Result<()> {
        let Some(handle) = record.external_handle() else {
            return Ok(());
        };
        if let Err(err) = handle.verify_access() {
            self.flag_broken(&record.id, Some(err.kind))?;
            return Err(err.into());
        }
        Ok(())
    }

    pub async fn read_media(&self, id: &MediaId) -> Result<Bytes> {
        let record = self.media(id)?;
        if let Some(hash) = record.content_hash() {
            return match self.content.read(hash).await {
                Ok(data) => Ok(data),
                Err(err) => {
                    if let Some(kind) = err.access_kind() {
                        self.flag_broken(id, Some(kind))?;
                    }
                    Err(err)
                }
            };
        }
        self.ensure_reachable(&record)?;
        let path = self.source_path(&record);
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(err) => {
                let access = AccessError::from_io(&err, &path);
                self.flag_broken(id, Some(access.kind))?;
                Err(access.into())
            }
        }
    }

    /// Thumbnail bytes, served from the cache when possible.
    pub fn thumbnail(&self, id: &MediaId) -> Result<Option<Bytes>> {
        if let Some(cached) = self.thumbnails.get(id) {
            return Ok(Some(cached));
        }
        let record = self.catalog.with(|db| Ok(db.get_thumbnail(id)?))?;
        Ok(record.map(|thumbnail| {
            let image = Bytes::from(thumbnail.image);
            self.thumbnails.insert(id.clone(), image.clone());
            image
        }))
    }

    /// Copy the media's bytes out to `exports/{id}/{file_name}` under the
    /// storage root and return the absolute path written.
    pub async fn export_media(&self, id: &MediaId) -> Result<PathBuf> {
        let record = self.media(id)?;
        self.ensure_reachable(&record)?;
        let relative = StorageLayout::export_path(&record.id, &record.file_name);
        let sink = self.upload_sink(&record.file_name);
        let receipt = self
            .gateway
            .save_upload(
                UploadSource::File(self.source_path(&record)),
                &relative,
                Some(sink),
            )
            .await?;
        debug!("Exported {} ({} bytes)", record.id, receipt.size);
        Ok(self.layout.absolute(&relative))
    }

    fn upload_sink(&self, file_name: &str) -> ProgressSink {
        let reporter = Arc::clone(&self.reporter);
        let file_name = file_name.to_string();
        Arc::new(move |progress: UploadProgress| {
            reporter.on_upload_progress(&file_name, progress.bytes_written, progress.percent)
        })
    }

    // ── Proxies ──────────────────────────────────────────────────

    fn proxy_source(&self, record: &MediaRecord) -> Option<ProxySource> {
        if record.kind() != Some(MediaKind::Video) {
            return None;
        }
        Some(ProxySource {
            media_id: record.id.clone(),
            input: self.source_path(record),
            width: record.properties.width?,
            height: record.properties.height?,
            duration: record.properties.duration,
        })
    }

    /// Start a proxy for a video. `false` when the media does not need one.
    pub async fn start_proxy(&self, id: &MediaId) -> Result<bool> {
        let record = self.media(id)?;
        self.ensure_reachable(&record)?;
        match self.proxy_source(&record) {
            Some(source) => self.proxies.start(source).await,
            None => Ok(false),
        }
    }

    /// Wait for every proxy among `ids` that is still generating. Callers
    /// that are about to shut the runtime down use this so running jobs are
    /// not dropped halfway. Returns the settled state of each one waited on.
    pub async fn settle_proxies(&self, ids: &[MediaId]) -> Vec<(MediaId, ProxyState)> {
        let waits = ids
            .iter()
            .filter(|id| self.proxies.is_generating(id))
            .map(|id| async move { (id.clone(), self.proxies.wait_settled(id).await) });
        join_all(waits).await
    }

    pub async fn cancel_proxy(&self, id: &MediaId) -> Result<bool> {
        self.proxies.cancel(id).await
    }

    pub fn proxy_state(&self, id: &MediaId) -> ProxyState {
        self.proxies.state(id)
    }

    /// Bytes of a ready proxy, or `None` when there is none.
    pub async fn proxy_bytes(&self, id: &MediaId) -> Result<Option<Bytes>> {
        self.proxies.read(id).await
    }

    // ── Statistics ───────────────────────────────────────────────

    pub fn stats(&self) -> Result<LibraryStats> {
        self.catalog.with(|db| Ok(db.library_stats()?))
    }

    pub async fn storage_estimate(&self) -> Result<StorageEstimate> {
        Ok(self.gateway.storage_estimate().await?)
    }
}
