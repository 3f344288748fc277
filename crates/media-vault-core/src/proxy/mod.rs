//! Cancellable background generation of low-resolution playback proxies.
//!
//! Per media id the state moves `Idle → Generating → Ready | Error`, and back
//! to `Idle` on cancel. Each start gets a generation number; whoever removes
//! the active entry for that generation first (completion or cancel) decides
//! the outcome, so a transcode finishing after its cancel is ignored.

pub mod meta;
pub mod sizing;
pub mod transcoder;

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::ProxyConfig;
use crate::error::{Error, Result, WorkerErrorKind};
use crate::gateway::FileGateway;
use crate::layout::StorageLayout;
use crate::progress::ProgressReporter;
use crate::storage::models::MediaId;

pub use meta::{ProxyMeta, ProxyStatus, META_SCHEMA_VERSION};
pub use sizing::{is_eligible, proxy_dimensions};
pub use transcoder::{FfmpegTranscoder, TranscodeJob, TranscodeOutput, Transcoder};

/// How long a cancel waits for the interrupted transcode to exit before
/// removing its files anyway.
const CANCEL_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyInfo {
    pub width: u32,
    pub height: u32,
    pub source_width: u32,
    pub source_height: u32,
    /// Relative to the storage root.
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProxyState {
    Idle,
    Generating { progress: f64 },
    Ready(ProxyInfo),
    Error(String),
}

impl ProxyState {
    pub fn name(&self) -> &'static str {
        match self {
            ProxyState::Idle => "idle",
            ProxyState::Generating { .. } => "generating",
            ProxyState::Ready(_) => "ready",
            ProxyState::Error(_) => "error",
        }
    }

    pub fn is_settled(&self) -> bool {
        !matches!(self, ProxyState::Generating { .. })
    }
}

/// What the pipeline needs to know about a source video.
#[derive(Debug, Clone, PartialEq)]
pub struct ProxySource {
    pub media_id: MediaId,
    /// Absolute path readable by the transcoder.
    pub input: PathBuf,
    pub width: u32,
    pub height: u32,
    pub duration: Option<f64>,
}

struct ActiveJob {
    generation: u64,
    cancel: Arc<AtomicBool>,
    done: watch::Receiver<bool>,
}

#[derive(Clone)]
pub struct ProxyPipeline {
    inner: Arc<PipelineInner>,
}

struct PipelineInner {
    gateway: FileGateway,
    layout: StorageLayout,
    transcoder: Arc<dyn Transcoder>,
    config: ProxyConfig,
    reporter: Arc<dyn ProgressReporter>,
    states: DashMap<MediaId, watch::Sender<ProxyState>>,
    active: DashMap<MediaId, ActiveJob>,
    generation: AtomicU64,
}

impl ProxyPipeline {
    pub fn new(
        gateway: FileGateway,
        transcoder: Arc<dyn Transcoder>,
        config: ProxyConfig,
        reporter: Arc<dyn ProgressReporter>,
    ) -> Self {
        let layout = StorageLayout::new(gateway.root().to_path_buf(), config.extension.clone());
        Self {
            inner: Arc::new(PipelineInner {
                gateway,
                layout,
                transcoder,
                config,
                reporter,
                states: DashMap::new(),
                active: DashMap::new(),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.inner.config
    }

    pub fn is_eligible(&self, width: u32, height: u32) -> bool {
        is_eligible(width, height, &self.inner.config)
    }

    pub fn state(&self, id: &MediaId) -> ProxyState {
        self.inner
            .states
            .get(id)
            .map(|sender| sender.borrow().clone())
            .unwrap_or(ProxyState::Idle)
    }

    pub fn subscribe(&self, id: &MediaId) -> watch::Receiver<ProxyState> {
        self.inner
            .states
            .entry(id.clone())
            .or_insert_with(|| watch::channel(ProxyState::Idle).0)
            .subscribe()
    }

    /// Wait until the proxy for `id` is no longer generating.
    pub async fn wait_settled(&self, id: &MediaId) -> ProxyState {
        let mut receiver = self.subscribe(id);
        let settled = match receiver.wait_for(|state| state.is_settled()).await {
            Ok(state) => state.clone(),
            Err(_) => self.state(id),
        };
        settled
    }

    pub fn is_generating(&self, id: &MediaId) -> bool {
        self.inner.active.contains_key(id)
    }

    /// Relative path of a ready proxy.
    pub fn ready_path(&self, id: &MediaId) -> Option<PathBuf> {
        match self.state(id) {
            ProxyState::Ready(info) => Some(info.path),
            _ => None,
        }
    }

    pub async fn read(&self, id: &MediaId) -> Result<Option<Bytes>> {
        match self.ready_path(id) {
            Some(path) => Ok(Some(self.inner.gateway.get_file(&path).await?)),
            None => Ok(None),
        }
    }

    fn publish(&self, id: &MediaId, state: ProxyState) {
        publish(&self.inner, id, state);
    }

    /// Begin generating a proxy. Returns `false` when the source does not
    /// qualify, and `true` when a job is running, including one started earlier.
    pub async fn start(&self, source: ProxySource) -> Result<bool> {
        if !self.is_eligible(source.width, source.height) {
            debug!(
                "{}: {}x{} below proxy threshold",
                source.media_id, source.width, source.height
            );
            return Ok(false);
        }

        let config = &self.inner.config;
        let (width, height) =
            proxy_dimensions(source.width, source.height, config.max_width, config.max_height);
        let cancel = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = watch::channel(false);
        let generation = match self.inner.active.entry(source.media_id.clone()) {
            Entry::Occupied(_) => return Ok(true),
            Entry::Vacant(slot) => {
                let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
                slot.insert(ActiveJob {
                    generation,
                    cancel: Arc::clone(&cancel),
                    done: done_rx,
                });
                generation
            }
        };
        self.publish(&source.media_id, ProxyState::Generating { progress: 0.0 });

        let meta = ProxyMeta::generating(width, height, source.width, source.height);
        if let Err(err) = self.write_meta(&source.media_id, &meta).await {
            self.inner.active.remove(&source.media_id);
            self.publish(&source.media_id, ProxyState::Error(err.to_string()));
            return Err(err);
        }

        let job = TranscodeJob {
            input: source.input.clone(),
            output: self
                .inner
                .layout
                .absolute(&self.inner.layout.proxy_path(&source.media_id)),
            width,
            height,
            audio_bitrate_kbps: config.audio_bitrate_kbps,
            duration: source.duration,
        };
        info!(
            "{}: generating {}x{} proxy from {}x{}",
            source.media_id, width, height, source.width, source.height
        );

        let pipeline = self.clone();
        tokio::spawn(async move {
            pipeline
                .run_job(source.media_id, generation, job, meta, cancel)
                .await;
            let _ = done_tx.send(true);
        });
        Ok(true)
    }

    async fn run_job(
        &self,
        id: MediaId,
        generation: u64,
        job: TranscodeJob,
        meta: ProxyMeta,
        cancel: Arc<AtomicBool>,
    ) {
        let transcoder = Arc::clone(&self.inner.transcoder);
        let inner = Arc::clone(&self.inner);
        let progress_id = id.clone();
        let progress_cancel = Arc::clone(&cancel);
        let blocking_job = job.clone();

        let outcome = tokio::task::spawn_blocking(move || {
            let report = |fraction: f64| {
                if !progress_cancel.load(Ordering::SeqCst) {
                    inner.reporter.on_proxy_progress(&progress_id, fraction);
                    publish(&inner, &progress_id, ProxyState::Generating { progress: fraction });
                }
            };
            transcoder.transcode(&blocking_job, &cancel, &report)
        })
        .await
        .unwrap_or_else(|err| Err(Error::Other(format!("transcode task failed: {}", err))));

        // Only the path that removes this generation's entry may finish it.
        let owned = self
            .inner
            .active
            .remove_if(&id, |_, active| active.generation == generation)
            .is_some();
        if !owned {
            debug!("{}: ignoring late proxy completion (generation {})", id, generation);
            return;
        }

        match self.finish(&id, &job, meta, outcome).await {
            Ok(info) => {
                info!("{}: proxy ready at {}x{}", id, info.width, info.height);
                self.publish(&id, ProxyState::Ready(info));
            }
            Err(err) => {
                warn!("{}: proxy generation failed: {}", id, err);
                if let Err(cleanup) = self.delete_files(&id).await {
                    error!("{}: failed to clean up proxy files: {}", id, cleanup);
                }
                self.publish(&id, ProxyState::Error(err.to_string()));
            }
        }
    }

    async fn finish(
        &self,
        id: &MediaId,
        job: &TranscodeJob,
        meta: ProxyMeta,
        outcome: Result<TranscodeOutput>,
    ) -> Result<ProxyInfo> {
        let output = outcome?;
        let size = tokio::fs::metadata(&job.output).await?.len();
        if size == 0 {
            return Err(Error::Other("transcoder produced an empty proxy".to_string()));
        }
        let meta = meta.into_ready(output.width, output.height);
        self.write_meta(id, &meta).await?;
        Ok(self.info_from_meta(id, &meta))
    }

    fn info_from_meta(&self, id: &MediaId, meta: &ProxyMeta) -> ProxyInfo {
        ProxyInfo {
            width: meta.width,
            height: meta.height,
            source_width: meta.source_width,
            source_height: meta.source_height,
            path: self.inner.layout.proxy_path(id),
        }
    }

    async fn write_meta(&self, id: &MediaId, meta: &ProxyMeta) -> Result<()> {
        let json = serde_json::to_vec_pretty(meta)?;
        self.inner
            .gateway
            .save_file(&StorageLayout::proxy_meta_path(id), Bytes::from(json))
            .await?;
        Ok(())
    }

    async fn delete_files(&self, id: &MediaId) -> Result<()> {
        self.inner
            .gateway
            .delete_file(&StorageLayout::proxy_dir(id))
            .await?;
        Ok(())
    }

    /// Interrupt a running job and remove its partial output. Returns whether
    /// anything was running.
    pub async fn cancel(&self, id: &MediaId) -> Result<bool> {
        let Some((_, job)) = self.inner.active.remove(id) else {
            return Ok(false);
        };
        job.cancel.store(true, Ordering::SeqCst);
        self.publish(id, ProxyState::Idle);

        let mut done = job.done;
        if tokio::time::timeout(CANCEL_GRACE, done.wait_for(|finished| *finished))
            .await
            .is_err()
        {
            warn!("{}: transcode still running {:?} after cancel", id, CANCEL_GRACE);
        }
        self.delete_files(id).await?;
        info!("{}: proxy generation cancelled", id);
        Ok(true)
    }

    /// Drop everything the pipeline holds for `id`, on disk and in memory.
    pub async fn remove(&self, id: &MediaId) -> Result<()> {
        self.cancel(id).await?;
        self.delete_files(id).await?;
        if let Some((_, sender)) = self.inner.states.remove(id) {
            sender.send_replace(ProxyState::Idle);
        }
        Ok(())
    }

    /// Restore ready proxies left by an earlier run, for the given ids only.
    /// Entries whose meta still says `generating` were interrupted and are removed.
    pub async fn discover(&self, known: &[MediaId]) -> Result<Vec<MediaId>> {
        let known: HashSet<&str> = known.iter().map(|id| id.as_str()).collect();
        let entries = self
            .inner
            .gateway
            .list_files(&StorageLayout::proxy_root())
            .await?;

        let mut ready = Vec::new();
        for entry in entries.iter().filter(|e| e.is_dir && known.contains(e.name.as_str())) {
            let id = MediaId::from(entry.name.as_str());
            if self.is_generating(&id) {
                continue;
            }
            match self.inspect(&id).await {
                Ok(Some(info)) => {
                    self.publish(&id, ProxyState::Ready(info));
                    ready.push(id);
                }
                Ok(None) => {
                    warn!("{}: removing incomplete proxy from an earlier run", id);
                    self.delete_files(&id).await?;
                }
                Err(err) => warn!("{}: skipping unreadable proxy: {}", id, err),
            }
        }
        info!("Discovered {} ready proxies", ready.len());
        Ok(ready)
    }

    /// `Some` only for a ready meta with a non-empty output file.
    async fn inspect(&self, id: &MediaId) -> Result<Option<ProxyInfo>> {
        let raw = match self
            .inner
            .gateway
            .get_file(&StorageLayout::proxy_meta_path(id))
            .await
        {
            Ok(raw) => raw,
            Err(err) if err.kind == WorkerErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let meta: ProxyMeta = serde_json::from_slice(&raw)?;
        if meta.status != ProxyStatus::Ready {
            return Ok(None);
        }

        let file_name = self.inner.layout.proxy_file_name();
        let listing = self
            .inner
            .gateway
            .list_files(&StorageLayout::proxy_dir(id))
            .await?;
        let has_output = listing
            .iter()
            .any(|entry| !entry.is_dir && entry.name == file_name && entry.size > 0);
        Ok(has_output.then(|| self.info_from_meta(id, &meta)))
    }
}

fn publish(inner: &PipelineInner, id: &MediaId, state: ProxyState) {
    inner.reporter.on_proxy_state(id, &state);
    inner
        .states
        .entry(id.clone())
        .or_insert_with(|| watch::channel(ProxyState::Idle).0)
        .send_replace(state);
}
