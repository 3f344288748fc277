mod common;

use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use common::{FakeTranscoder, GatedTranscoder, RecordingReporter};
use media_vault_core::config::ProxyConfig;
use media_vault_core::gateway::FileGateway;
use media_vault_core::layout::StorageLayout;
use media_vault_core::proxy::{
    ProxyMeta, ProxyPipeline, ProxySource, ProxyState, TranscodeJob, TranscodeOutput, Transcoder,
};
use media_vault_core::{Error, MediaId, Result};

struct FailingTranscoder;

impl Transcoder for FailingTranscoder {
    fn transcode(
        &self,
        job: &TranscodeJob,
        _cancel: &AtomicBool,
        _progress: &dyn Fn(f64),
    ) -> Result<TranscodeOutput> {
        std::fs::write(&job.output, b"half a file")?;
        Err(Error::Other("encoder exploded".to_string()))
    }
}

fn pipeline(dir: &TempDir, transcoder: Arc<dyn Transcoder>) -> (ProxyPipeline, Arc<RecordingReporter>) {
    let gateway = FileGateway::new(dir.path(), 16 * 1024, u64::MAX / 2);
    let reporter = Arc::new(RecordingReporter::default());
    let pipeline = ProxyPipeline::new(gateway, transcoder, ProxyConfig::default(), reporter.clone());
    (pipeline, reporter)
}

fn source(id: &str, width: u32, height: u32) -> ProxySource {
    ProxySource {
        media_id: MediaId::from(id),
        input: PathBuf::from("/footage").join(id),
        width,
        height,
        duration: Some(10.0),
    }
}

fn proxy_dir(dir: &TempDir, id: &MediaId) -> PathBuf {
    dir.path().join(StorageLayout::proxy_dir(id))
}

async fn wait_until(flag: &AtomicBool) {
    while !flag.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn write_meta(root: &Path, id: &MediaId, meta: &ProxyMeta) {
    let path = root.join(StorageLayout::proxy_meta_path(id));
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, serde_json::to_vec(meta).unwrap()).unwrap();
}

#[tokio::test]
async fn test_small_sources_are_not_eligible() {
    let dir = tempfile::tempdir().unwrap();
    let transcoder = Arc::new(FakeTranscoder::default());
    let (pipeline, reporter) = pipeline(&dir, transcoder.clone());

    assert!(!pipeline.start(source("hd", 1920, 1080)).await.unwrap());
    assert!(!pipeline.start(source("portrait", 1080, 1920)).await.unwrap());
    assert_eq!(pipeline.state(&MediaId::from("hd")), ProxyState::Idle);
    assert!(transcoder.jobs.lock().unwrap().is_empty());
    assert!(reporter.states.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_portrait_source_keeps_orientation() {
    let dir = tempfile::tempdir().unwrap();
    let transcoder = Arc::new(FakeTranscoder::default());
    let (pipeline, _) = pipeline(&dir, transcoder.clone());
    let id = MediaId::from("vertical");

    assert!(pipeline.start(source("vertical", 2160, 3840)).await.unwrap());
    match pipeline.wait_settled(&id).await {
        ProxyState::Ready(info) => assert_eq!((info.width, info.height), (720, 1280)),
        other => panic!("expected a ready proxy, got {:?}", other),
    }
    let jobs = transcoder.jobs.lock().unwrap();
    assert_eq!(jobs[0].output, dir.path().join("proxies/vertical/proxy.mp4"));
}

#[tokio::test]
async fn test_cancel_returns_to_idle_and_cleans_up() {
    let dir = tempfile::tempdir().unwrap();
    let transcoder = Arc::new(GatedTranscoder::new());
    let (pipeline, reporter) = pipeline(&dir, transcoder.clone());
    let id = MediaId::from("clip");

    assert!(pipeline.start(source("clip", 3840, 2160)).await.unwrap());
    assert!(matches!(pipeline.state(&id), ProxyState::Generating { .. }));
    // A second start joins the running job.
    assert!(pipeline.start(source("clip", 3840, 2160)).await.unwrap());
    wait_until(&transcoder.started).await;
    assert!(proxy_dir(&dir, &id).join("meta.json").is_file());

    assert!(pipeline.cancel(&id).await.unwrap());
    assert_eq!(pipeline.state(&id), ProxyState::Idle);
    assert!(!pipeline.is_generating(&id));
    assert!(!proxy_dir(&dir, &id).exists());
    assert!(!pipeline.cancel(&id).await.unwrap());

    // The cancelled job finished with an error, which must not surface.
    assert_eq!(pipeline.state(&id), ProxyState::Idle);
    assert_eq!(
        reporter.states_for(&id),
        vec!["generating".to_string(), "idle".to_string()]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_starts_spawn_one_job() {
    let dir = tempfile::tempdir().unwrap();
    let transcoder = Arc::new(GatedTranscoder::new());
    let (pipeline, _) = pipeline(&dir, transcoder.clone());
    let id = MediaId::from("clip");

    let starts = (0..8).map(|_| {
        let pipeline = pipeline.clone();
        tokio::spawn(async move { pipeline.start(source("clip", 3840, 2160)).await })
    });
    for started in futures::future::join_all(starts).await {
        assert!(started.unwrap().unwrap());
    }
    wait_until(&transcoder.started).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(transcoder.calls.load(Ordering::SeqCst), 1);

    transcoder.release.store(true, Ordering::SeqCst);
    assert!(matches!(pipeline.wait_settled(&id).await, ProxyState::Ready(_)));
    assert_eq!(transcoder.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_restart_after_cancel_completes() {
    let dir = tempfile::tempdir().unwrap();
    let transcoder = Arc::new(GatedTranscoder::new());
    let (pipeline, _) = pipeline(&dir, transcoder.clone());
    let id = MediaId::from("clip");

    pipeline.start(source("clip", 3840, 2160)).await.unwrap();
    wait_until(&transcoder.started).await;
    pipeline.cancel(&id).await.unwrap();

    transcoder.release.store(true, Ordering::SeqCst);
    assert!(pipeline.start(source("clip", 3840, 2160)).await.unwrap());
    assert!(matches!(pipeline.wait_settled(&id).await, ProxyState::Ready(_)));
    assert_eq!(
        pipeline.read(&id).await.unwrap(),
        Some(Bytes::from_static(b"partial"))
    );
}

#[tokio::test]
async fn test_failed_transcode_reports_error() {
    let dir = tempfile::tempdir().unwrap();
    let (pipeline, _) = pipeline(&dir, Arc::new(FailingTranscoder));
    let id = MediaId::from("clip");

    pipeline.start(source("clip", 3840, 2160)).await.unwrap();
    match pipeline.wait_settled(&id).await {
        ProxyState::Error(message) => assert!(message.contains("encoder exploded")),
        other => panic!("expected an error, got {:?}", other),
    }
    assert!(!proxy_dir(&dir, &id).exists());
    assert!(pipeline.read(&id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_discover_restores_ready_and_drops_interrupted() {
    let dir = tempfile::tempdir().unwrap();
    let (pipeline, _) = pipeline(&dir, Arc::new(FakeTranscoder::default()));
    let ready = MediaId::from("ready");
    let interrupted = MediaId::from("interrupted");
    let unknown = MediaId::from("unknown");

    let meta = ProxyMeta::generating(1280, 720, 3840, 2160);
    write_meta(dir.path(), &ready, &meta.clone().into_ready(1280, 720));
    std::fs::write(proxy_dir(&dir, &ready).join("proxy.mp4"), b"proxy").unwrap();
    write_meta(dir.path(), &interrupted, &meta);
    std::fs::write(proxy_dir(&dir, &interrupted).join("proxy.mp4"), b"half").unwrap();
    write_meta(dir.path(), &unknown, &meta.clone().into_ready(1280, 720));

    let found = pipeline
        .discover(&[ready.clone(), interrupted.clone()])
        .await
        .unwrap();
    assert_eq!(found, vec![ready.clone()]);
    match pipeline.state(&ready) {
        ProxyState::Ready(info) => {
            assert_eq!((info.source_width, info.source_height), (3840, 2160));
            assert_eq!(info.path, PathBuf::from("proxies/ready/proxy.mp4"));
        }
        other => panic!("expected a ready proxy, got {:?}", other),
    }
    assert!(!proxy_dir(&dir, &interrupted).exists());
    // Not asked about, so left alone.
    assert!(proxy_dir(&dir, &unknown).exists());
    assert_eq!(pipeline.state(&unknown), ProxyState::Idle);
}
