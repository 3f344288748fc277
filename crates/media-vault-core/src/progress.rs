use crate::proxy::ProxyState;
use crate::storage::models::MediaId;

/// Trait for reporting long-running work.
///
/// CLI implements with indicatif bars; library callers that do not care use
/// [`SilentReporter`]. All methods have default no-op implementations.
pub trait ProgressReporter: Send + Sync {
    fn on_upload_progress(&self, _file_name: &str, _bytes_written: u64, _percent: f64) {}
    fn on_batch_start(&self, _total: usize) {}
    fn on_batch_progress(&self, _completed: usize, _total: usize) {}
    fn on_batch_complete(&self, _succeeded: usize, _failed: usize) {}
    fn on_extract_progress(&self, _completed: usize, _total: usize) {}
    fn on_proxy_state(&self, _media_id: &MediaId, _state: &ProxyState) {}
    fn on_proxy_progress(&self, _media_id: &MediaId, _fraction: f64) {}
}

/// No-op progress reporter for silent operation.
pub struct SilentReporter;

impl ProgressReporter for SilentReporter {}
