//! Async façade over the file worker.
//!
//! The worker thread is started on first use and restarted if it has died.
//! Concurrent reads of one path share a single worker request; every other
//! operation is one round trip per call.

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::{WorkerError, WorkerErrorKind};
use crate::worker::{
    Correlator, DirEntry, FilePayload, FileRequest, FileResponse, FileWorker, ProgressSink,
    UploadReceipt, UploadSource,
};

/// Headroom required on top of a write before it is considered to fit.
const QUOTA_SAFETY_MARGIN: f64 = 0.10;
/// Utilization at which a write is flagged, advisory only.
const QUOTA_WARNING_RATIO: f64 = 0.80;

type FileCorrelator = Correlator<FileRequest, FileResponse>;
type SharedRead = Shared<BoxFuture<'static, Result<Bytes, WorkerError>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageEstimate {
    pub usage: u64,
    pub quota: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaCheck {
    pub fits: bool,
    pub warning: bool,
    pub required: u64,
    pub available: u64,
}

#[derive(Clone)]
pub struct FileGateway {
    inner: Arc<GatewayInner>,
}

struct GatewayInner {
    root: PathBuf,
    chunk_size: usize,
    quota_bytes: u64,
    worker: Mutex<Option<Arc<FileCorrelator>>>,
    reads: Arc<DashMap<PathBuf, SharedRead>>,
    handle_opens: Arc<AtomicUsize>,
}

impl FileGateway {
    pub fn new(root: impl Into<PathBuf>, chunk_size: usize, quota_bytes: u64) -> Self {
        Self {
            inner: Arc::new(GatewayInner {
                root: root.into(),
                chunk_size,
                quota_bytes,
                worker: Mutex::new(None),
                reads: Arc::new(DashMap::new()),
                handle_opens: Arc::new(AtomicUsize::new(0)),
            }),
        }
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// Synchronous handle opens performed by the worker since start-up.
    pub fn handle_opens(&self) -> usize {
        self.inner.handle_opens.load(Ordering::SeqCst)
    }

    /// Reads currently in flight, one per distinct path.
    pub fn pending_reads(&self) -> usize {
        self.inner.reads.len()
    }

    fn worker(&self) -> Result<Arc<FileCorrelator>, WorkerError> {
        let mut slot = self
            .inner
            .worker
            .lock()
            .map_err(|_| WorkerError::unavailable("file"))?;

        if let Some(worker) = slot.as_ref() {
            if worker.is_alive() {
                return Ok(Arc::clone(worker));
            }
            warn!("file worker died, restarting");
        }

        let mut file_worker = FileWorker::new(
            self.inner.root.clone(),
            self.inner.chunk_size,
            Arc::clone(&self.inner.handle_opens),
        );
        let correlator = Correlator::spawn("file-worker", move |request, emitter| {
            file_worker.handle(request, emitter)
        })
        .map_err(|err| {
            WorkerError::new(
                WorkerErrorKind::Unavailable,
                format!("failed to start file worker: {}", err),
            )
        })?;
        info!("file worker started for {}", self.inner.root.display());

        let correlator = Arc::new(correlator);
        *slot = Some(Arc::clone(&correlator));
        Ok(correlator)
    }

    async fn round_trip(
        &self,
        request: FileRequest,
        progress: Option<ProgressSink>,
    ) -> Result<FilePayload, WorkerError> {
        let worker = self.worker()?;
        worker.call(request, progress, None).await?
    }

    /// Read a file under the root. Callers racing on the same path share one
    /// worker request and all receive its outcome.
    pub async fn get_file(&self, path: &Path) -> Result<Bytes, WorkerError> {
        let key = path.to_path_buf();
        let read = match self.inner.reads.entry(key.clone()) {
            Entry::Occupied(entry) => {
                debug!("gateway: joining in-flight read of {}", key.display());
                entry.get().clone()
            }
            Entry::Vacant(entry) => {
                let worker = self.worker()?;
                let reads = Arc::clone(&self.inner.reads);
                let read_path = key.clone();
                let read = async move {
                    let outcome = match worker
                        .call(FileRequest::Get { path: read_path.clone() }, None, None)
                        .await
                    {
                        Ok(Ok(FilePayload::Bytes(bytes))) => Ok(bytes),
                        Ok(Ok(_)) => Err(WorkerError::unexpected("get")),
                        Ok(Err(err)) | Err(err) => Err(err),
                    };
                    reads.remove(&read_path);
                    outcome
                }
                .boxed()
                .shared();
                entry.insert(read.clone());
                read
            }
        };
        read.await
    }

    pub async fn save_file(&self, path: &Path, bytes: Bytes) -> Result<(), WorkerError> {
        let request = FileRequest::Save {
            path: path.to_path_buf(),
            bytes,
        };
        match self.round_trip(request, None).await? {
            FilePayload::Unit => Ok(()),
            _ => Err(WorkerError::unexpected("save")),
        }
    }

    pub async fn delete_file(&self, path: &Path) -> Result<(), WorkerError> {
        let request = FileRequest::Delete {
            path: path.to_path_buf(),
        };
        match self.round_trip(request, None).await? {
            FilePayload::Unit => Ok(()),
            _ => Err(WorkerError::unexpected("delete")),
        }
    }

    pub async fn list_files(&self, dir: &Path) -> Result<Vec<DirEntry>, WorkerError> {
        let request = FileRequest::List {
            dir: dir.to_path_buf(),
        };
        match self.round_trip(request, None).await? {
            FilePayload::Listing(entries) => Ok(entries),
            _ => Err(WorkerError::unexpected("list")),
        }
    }

    pub async fn process_upload(
        &self,
        source: UploadSource,
        progress: Option<ProgressSink>,
    ) -> Result<UploadReceipt, WorkerError> {
        match self
            .round_trip(FileRequest::ProcessUpload { source }, progress)
            .await?
        {
            FilePayload::Upload(receipt) => Ok(receipt),
            _ => Err(WorkerError::unexpected("process_upload")),
        }
    }

    pub async fn save_upload(
        &self,
        source: UploadSource,
        path: &Path,
        progress: Option<ProgressSink>,
    ) -> Result<UploadReceipt, WorkerError> {
        let request = FileRequest::SaveUpload {
            source,
            path: path.to_path_buf(),
        };
        match self.round_trip(request, progress).await? {
            FilePayload::Upload(receipt) => Ok(receipt),
            _ => Err(WorkerError::unexpected("save_upload")),
        }
    }

    /// Bytes currently stored under the root against the configured quota.
    pub async fn storage_estimate(&self) -> Result<StorageEstimate, WorkerError> {
        let root = self.inner.root.clone();
        let usage = tokio::task::spawn_blocking(move || directory_usage(&root))
            .await
            .map_err(|err| {
                WorkerError::new(WorkerErrorKind::Unexpected, format!("usage scan failed: {}", err))
            })?;
        Ok(StorageEstimate {
            usage,
            quota: self.inner.quota_bytes,
        })
    }

    pub async fn check_quota(&self, required: u64) -> Result<QuotaCheck, WorkerError> {
        let estimate = self.storage_estimate().await?;
        let check = evaluate_quota(estimate, required);
        if check.warning {
            warn!(
                "storage at {:.0}% of quota after a {} byte write",
                (estimate.usage + required) as f64 / estimate.quota.max(1) as f64 * 100.0,
                required
            );
        }
        Ok(check)
    }
}

fn directory_usage(root: &Path) -> u64 {
    WalkDir::new(root)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|metadata| metadata.len())
        .sum()
}

pub fn evaluate_quota(estimate: StorageEstimate, required: u64) -> QuotaCheck {
    let padded = required as f64 * (1.0 + QUOTA_SAFETY_MARGIN);
    let fits = estimate.usage as f64 + padded <= estimate.quota as f64;
    let warning = estimate.quota == 0
        || (estimate.usage + required) as f64 / estimate.quota as f64 >= QUOTA_WARNING_RATIO;
    QuotaCheck {
        fits,
        warning,
        required,
        available: estimate.quota.saturating_sub(estimate.usage),
    }
}
