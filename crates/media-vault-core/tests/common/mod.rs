#![allow(dead_code)]

use image::{DynamicImage, Rgb, RgbImage};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use media_vault_core::catalog::Catalog;
use media_vault_core::extractor::{AudioStream, MediaDecoder, ProbeReport, VideoStream};
use media_vault_core::proxy::{ProxyState, TranscodeJob, TranscodeOutput, Transcoder};
use media_vault_core::{
    AppConfig, Error, LibraryBuilder, MediaId, MediaLibrary, MediaObserver, ProgressReporter,
    ProjectId, Result,
};

/// Decoder that reads the first bytes of a file to decide what it is:
/// `4K…` is 3840x2160, `HD…` is 1920x1080, `BROKEN…` fails, anything else
/// is 1280x720.
#[derive(Default)]
pub struct FakeDecoder {
    pub probes: AtomicUsize,
}

impl FakeDecoder {
    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }
}

impl MediaDecoder for FakeDecoder {
    fn probe(&self, path: &Path) -> Result<ProbeReport> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        let data = fs::read(path)?;
        if data.starts_with(b"BROKEN") {
            return Err(Error::Other("undecodable stream".to_string()));
        }
        let (width, height) = if data.starts_with(b"4K") {
            (3840, 2160)
        } else if data.starts_with(b"HD") {
            (1920, 1080)
        } else {
            (1280, 720)
        };
        Ok(ProbeReport {
            duration: Some(10.0),
            bitrate: Some(8_000_000),
            video: Some(VideoStream {
                codec: Some("h264".to_string()),
                width,
                height,
                avg_frame_rate: Some(25.0),
            }),
            audio: Some(AudioStream {
                codec: Some("aac".to_string()),
                channels: Some(2),
                sample_rate: Some(48_000),
            }),
            video_packet_pts: (0..10).map(|i| i as f64 * 0.04).collect(),
        })
    }

    fn frame_at(&self, _path: &Path, _seconds: f64) -> Result<DynamicImage> {
        Ok(DynamicImage::ImageRgb8(RgbImage::from_pixel(
            64,
            36,
            Rgb([40, 80, 120]),
        )))
    }
}

/// Writes a small placeholder proxy and reports progress in two steps.
#[derive(Default)]
pub struct FakeTranscoder {
    pub jobs: Mutex<Vec<TranscodeJob>>,
}

impl Transcoder for FakeTranscoder {
    fn transcode(
        &self,
        job: &TranscodeJob,
        cancel: &AtomicBool,
        progress: &dyn Fn(f64),
    ) -> Result<TranscodeOutput> {
        if let Ok(mut jobs) = self.jobs.lock() {
            jobs.push(job.clone());
        }
        progress(0.5);
        if cancel.load(Ordering::SeqCst) {
            return Err(Error::Cancelled);
        }
        fs::write(&job.output, b"proxy bytes")?;
        progress(1.0);
        Ok(TranscodeOutput {
            width: job.width,
            height: job.height,
        })
    }
}

/// Takes `delay` before writing its output, like a real encode would.
pub struct SlowTranscoder {
    pub delay: Duration,
}

impl Transcoder for SlowTranscoder {
    fn transcode(
        &self,
        job: &TranscodeJob,
        _cancel: &AtomicBool,
        progress: &dyn Fn(f64),
    ) -> Result<TranscodeOutput> {
        std::thread::sleep(self.delay);
        fs::write(&job.output, b"slow proxy")?;
        progress(1.0);
        Ok(TranscodeOutput {
            width: job.width,
            height: job.height,
        })
    }
}

/// Blocks until released, for cancellation tests.
pub struct GatedTranscoder {
    pub started: AtomicBool,
    pub release: AtomicBool,
    pub calls: AtomicUsize,
}

impl GatedTranscoder {
    pub fn new() -> Self {
        Self {
            started: AtomicBool::new(false),
            release: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        }
    }
}

impl Transcoder for GatedTranscoder {
    fn transcode(
        &self,
        job: &TranscodeJob,
        cancel: &AtomicBool,
        _progress: &dyn Fn(f64),
    ) -> Result<TranscodeOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.started.store(true, Ordering::SeqCst);
        fs::write(&job.output, b"partial")?;
        while !self.release.load(Ordering::SeqCst) {
            if cancel.load(Ordering::SeqCst) {
                return Err(Error::Cancelled);
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        Ok(TranscodeOutput {
            width: job.width,
            height: job.height,
        })
    }
}

/// Records proxy state names per media id, collapsing repeats.
#[derive(Default)]
pub struct RecordingReporter {
    pub states: Mutex<HashMap<MediaId, Vec<String>>>,
    pub batch: Mutex<Vec<(usize, usize)>>,
}

impl RecordingReporter {
    pub fn states_for(&self, id: &MediaId) -> Vec<String> {
        self.states
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .unwrap_or_default()
    }
}

impl ProgressReporter for RecordingReporter {
    fn on_proxy_state(&self, media_id: &MediaId, state: &ProxyState) {
        let mut states = self.states.lock().unwrap();
        let seen = states.entry(media_id.clone()).or_default();
        if seen.last().map(String::as_str) != Some(state.name()) {
            seen.push(state.name().to_string());
        }
    }

    fn on_batch_complete(&self, succeeded: usize, failed: usize) {
        self.batch.lock().unwrap().push((succeeded, failed));
    }
}

#[derive(Default)]
pub struct RecordingObserver {
    pub removed: Mutex<Vec<(ProjectId, Vec<MediaId>)>>,
}

impl MediaObserver for RecordingObserver {
    fn on_media_removed(&self, project: &ProjectId, media: &[MediaId]) {
        self.removed
            .lock()
            .unwrap()
            .push((project.clone(), media.to_vec()));
    }
}

pub struct TestLibrary {
    pub dir: TempDir,
    pub library: MediaLibrary,
    pub decoder: Arc<FakeDecoder>,
    pub transcoder: Arc<FakeTranscoder>,
    pub reporter: Arc<RecordingReporter>,
}

impl TestLibrary {
    pub fn root(&self) -> &Path {
        self.library.gateway().root()
    }
}

pub fn test_config(dir: &TempDir) -> AppConfig {
    let mut config = AppConfig::default();
    config.storage.root_dir = dir.path().join("vault");
    config.storage.catalog_path = dir.path().join("vault/catalog.db");
    config.storage.chunk_size = 16 * 1024;
    config.extractor.thumbnail_size = 32;
    config
}

/// Library over a temp dir and an in-memory catalog, with `project` open.
pub async fn test_library(project: &str) -> TestLibrary {
    let dir = tempfile::tempdir().unwrap();
    let decoder = Arc::new(FakeDecoder::default());
    let transcoder = Arc::new(FakeTranscoder::default());
    let reporter = Arc::new(RecordingReporter::default());

    let library = LibraryBuilder::new(test_config(&dir))
        .with_catalog(Catalog::open_in_memory().unwrap())
        .with_decoder(decoder.clone())
        .with_transcoder(transcoder.clone())
        .with_reporter(reporter.clone())
        .build()
        .unwrap();
    library.open_project(ProjectId::from(project)).await.unwrap();

    TestLibrary {
        dir,
        library,
        decoder,
        transcoder,
        reporter,
    }
}
