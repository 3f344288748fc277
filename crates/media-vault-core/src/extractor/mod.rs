//! Background metadata and thumbnail extraction.
//!
//! Decoding runs on a small pool of OS threads behind a [`Correlator`]. Each
//! call is bounded on the caller side; a timed-out request is abandoned, not
//! killed, and the pool keeps serving.

pub mod analysis;
pub mod decoder;

use futures::stream::{self, StreamExt};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

use crate::config::ExtractorConfig;
use crate::error::{Error, Result, WorkerErrorKind};
use crate::progress::ProgressReporter;
use crate::storage::models::MediaProperties;
use crate::worker::{Correlator, ProgressEmitter};

pub use analysis::{
    clamp_thumbnail_time, estimate_fps, fit_within, is_audio_codec_supported,
    UNSUPPORTED_AUDIO_CODECS,
};
pub use decoder::{AudioStream, FfmpegDecoder, MediaDecoder, ProbeReport, VideoStream};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractRequest {
    pub path: PathBuf,
    pub mime_type: String,
}

/// JPEG-encoded thumbnail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Thumbnail {
    pub image: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub properties: MediaProperties,
    pub thumbnail: Option<Thumbnail>,
}

type ExtractCorrelator = Correlator<ExtractRequest, Result<Extraction>>;

pub struct Extractor {
    decoder: Arc<dyn MediaDecoder>,
    pool: Mutex<Arc<ExtractCorrelator>>,
    timeout: Duration,
    concurrency: usize,
    thumbnail_size: u32,
}

impl Extractor {
    /// Must be called inside a Tokio runtime.
    pub fn new(decoder: Arc<dyn MediaDecoder>, config: &ExtractorConfig) -> Result<Self> {
        let concurrency = config.batch_concurrency.max(1);
        let pool = Self::spawn_pool(Arc::clone(&decoder), concurrency, config.thumbnail_size)?;
        Ok(Self {
            decoder,
            pool: Mutex::new(Arc::new(pool)),
            timeout: config.timeout(),
            concurrency,
            thumbnail_size: config.thumbnail_size,
        })
    }

    fn spawn_pool(
        decoder: Arc<dyn MediaDecoder>,
        size: usize,
        thumbnail_size: u32,
    ) -> Result<ExtractCorrelator> {
        let pool = Correlator::spawn_pool(
            "extractor",
            size,
            move |request: ExtractRequest, _: &ProgressEmitter<'_, Result<Extraction>>| {
                analysis::extract_media(decoder.as_ref(), &request, thumbnail_size)
            },
        )?;
        info!("Extractor pool started with {} threads", size);
        Ok(pool)
    }

    /// The live pool, restarted if every thread in it has died.
    fn pool(&self) -> Result<Arc<ExtractCorrelator>> {
        let mut slot = self
            .pool
            .lock()
            .map_err(|_| Error::Other("extractor lock poisoned".to_string()))?;
        if !slot.is_alive() {
            warn!("Extractor pool died, restarting");
            *slot = Arc::new(Self::spawn_pool(
                Arc::clone(&self.decoder),
                self.concurrency,
                self.thumbnail_size,
            )?);
        }
        Ok(Arc::clone(&slot))
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn extract(&self, request: ExtractRequest) -> Result<Extraction> {
        let pool = self.pool()?;
        match pool.call(request, None, Some(self.timeout)).await {
            Ok(result) => result,
            Err(err) if err.kind == WorkerErrorKind::TimedOut => {
                Err(Error::ProcessingTimeout(self.timeout))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Extract up to `batch_concurrency` files at a time. Results come back in
    /// request order; progress is reported after each completion.
    pub async fn extract_batch(
        &self,
        requests: Vec<ExtractRequest>,
        reporter: &dyn ProgressReporter,
    ) -> Vec<Result<Extraction>> {
        let total = requests.len();
        let mut results: Vec<Option<Result<Extraction>>> = (0..total).map(|_| None).collect();
        let mut completed = 0;

        let mut pending = stream::iter(requests.into_iter().enumerate())
            .map(|(index, request)| async move { (index, self.extract(request).await) })
            .buffer_unordered(self.concurrency);

        while let Some((index, result)) = pending.next().await {
            completed += 1;
            reporter.on_extract_progress(completed, total);
            results[index] = Some(result);
        }

        results
            .into_iter()
            .map(|slot| slot.unwrap_or_else(|| Err(Error::Other("extraction lost".to_string()))))
            .collect()
    }
}
