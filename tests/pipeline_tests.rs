//! End-to-end pipeline tests: worker protocol, background switching, and the
//! pump-to-compositor loop, all against the mock engine and an in-memory
//! fetcher.

use bgswap::{
    run_pump, spawn_worker, BackgroundFetcher, BgSwapError, ChannelSource, Frame,
    MockResponse, MockSegmentationEngine, OutputSurface, PipelineConfig, PumpStats,
    Result, WorkerCommand, WorkerEvent, WorkerHandle,
};
use image::{Rgba, RgbaImage};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const OUT_W: u32 = 32;
const OUT_H: u32 = 24;

/// Route worker logs and spans to the test harness when RUST_LOG is set
fn init_diagnostics() {
    let _ = env_logger::builder().is_test(true).try_init();
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn test_config() -> PipelineConfig {
    PipelineConfig::builder()
        .processing_resolution(16, 12)
        .output_resolution(OUT_W, OUT_H)
        .feather_radius(0)
        .build()
        .unwrap()
}

fn png_bytes(color: Rgba<u8>) -> Vec<u8> {
    let image = image::DynamicImage::ImageRgba8(RgbaImage::from_pixel(8, 8, color));
    let mut bytes = Vec::new();
    image
        .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
        .unwrap();
    bytes
}

/// In-memory fetcher with optional per-URL latency and a call counter
struct StubFetcher {
    responses: HashMap<String, Vec<u8>>,
    delays: HashMap<String, Duration>,
    calls: AtomicUsize,
}

impl StubFetcher {
    fn new() -> Self {
        Self {
            responses: HashMap::new(),
            delays: HashMap::new(),
            calls: AtomicUsize::new(0),
        }
    }

    fn with_image(mut self, url: &str, color: Rgba<u8>) -> Self {
        self.responses.insert(url.to_string(), png_bytes(color));
        self
    }

    fn with_delay(mut self, url: &str, delay: Duration) -> Self {
        self.delays.insert(url.to_string(), delay);
        self
    }
}

#[async_trait::async_trait]
impl BackgroundFetcher for StubFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delays.get(url) {
            tokio::time::sleep(*delay).await;
        }
        self.responses
            .get(url)
            .cloned()
            .ok_or_else(|| BgSwapError::network_error(
                "background fetch failed",
                std::io::Error::new(std::io::ErrorKind::NotFound, url.to_string()),
            ))
    }
}

async fn init_and_wait_ready(handle: &mut WorkerHandle, surface: OutputSurface) -> (Vec<String>, usize) {
    handle
        .send(WorkerCommand::Init {
            surface,
            model_asset_path: String::new(),
            runtime_asset_base: None,
        })
        .await
        .unwrap();
    loop {
        match handle.next_event().await.expect("worker event stream ended") {
            WorkerEvent::Ready {
                labels,
                person_index,
            } => return (labels, person_index),
            WorkerEvent::Info { .. } => {},
            other => panic!("unexpected event before ready: {other:?}"),
        }
    }
}

fn red_frame(released: &Arc<AtomicUsize>) -> Frame {
    let counter = released.clone();
    Frame::with_release_hook(
        RgbaImage::from_pixel(OUT_W, OUT_H, Rgba([255, 0, 0, 255])),
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
        },
    )
}

#[tokio::test]
async fn test_init_reports_labels_and_person_index() {
    let fetcher = Arc::new(StubFetcher::new());
    let mut handle = spawn_worker(
        test_config(),
        Box::new(MockSegmentationEngine::new().with_labels(vec![
            "backdrop".to_string(),
            "selfie person".to_string(),
        ])),
        fetcher,
    )
    .unwrap();
    let (surface, _reader) = OutputSurface::new(OUT_W, OUT_H);

    let (labels, person_index) = init_and_wait_ready(&mut handle, surface).await;
    assert_eq!(labels.len(), 2);
    assert_eq!(person_index, 1);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_init_failure_reports_error_and_allows_retry() {
    use bgswap::ExecutionProvider;

    let fetcher = Arc::new(StubFetcher::new());
    // CPU is the only provider in the plan for the low-power preset, so a
    // CPU failure exhausts it
    let engine = MockSegmentationEngine::new().failing_on(&[ExecutionProvider::Cpu]);
    let mut handle = spawn_worker(test_config(), Box::new(engine), fetcher).unwrap();

    let (surface, _reader) = OutputSurface::new(OUT_W, OUT_H);
    handle
        .send(WorkerCommand::Init {
            surface,
            model_asset_path: String::new(),
            runtime_asset_base: None,
        })
        .await
        .unwrap();
    assert!(matches!(
        handle.next_event().await,
        Some(WorkerEvent::Error { .. })
    ));

    // The worker survives the failure and keeps answering commands
    handle
        .send(WorkerCommand::SetBackground { url: None })
        .await
        .unwrap();
    assert_eq!(handle.next_event().await, Some(WorkerEvent::BgReady));

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_accelerated_fallback_emits_info_before_ready() {
    use bgswap::ExecutionProvider;

    let config = PipelineConfig::builder()
        .processing_resolution(16, 12)
        .output_resolution(OUT_W, OUT_H)
        .feather_radius(0)
        .execution_provider(ExecutionProvider::Auto)
        .build()
        .unwrap();
    let engine = MockSegmentationEngine::new().failing_on(&[ExecutionProvider::Cuda]);
    let mut handle = spawn_worker(config, Box::new(engine), Arc::new(StubFetcher::new())).unwrap();

    let (surface, _reader) = OutputSurface::new(OUT_W, OUT_H);
    handle
        .send(WorkerCommand::Init {
            surface,
            model_asset_path: String::new(),
            runtime_asset_base: None,
        })
        .await
        .unwrap();

    let mut saw_fallback_info = false;
    loop {
        match handle.next_event().await.unwrap() {
            WorkerEvent::Info { message } => {
                if message.contains("cuda") {
                    saw_fallback_info = true;
                }
            },
            WorkerEvent::Ready { .. } => break,
            other => panic!("unexpected event: {other:?}"),
        }
    }
    assert!(saw_fallback_info);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_background_switch_and_composite() {
    init_diagnostics();
    let engine = MockSegmentationEngine::new().with_default_response(MockResponse::LeftHalfPerson);
    let fetcher = Arc::new(
        StubFetcher::new().with_image("https://backdrops.test/green.png", Rgba([0, 255, 0, 255])),
    );
    let mut handle = spawn_worker(test_config(), Box::new(engine), fetcher).unwrap();
    let (surface, reader) = OutputSurface::new(OUT_W, OUT_H);
    init_and_wait_ready(&mut handle, surface).await;

    handle
        .send(WorkerCommand::SetBackground {
            url: Some("https://backdrops.test/green.png".to_string()),
        })
        .await
        .unwrap();
    assert_eq!(handle.next_event().await, Some(WorkerEvent::BgLoading));
    assert_eq!(handle.next_event().await, Some(WorkerEvent::BgReady));

    let released = Arc::new(AtomicUsize::new(0));
    assert!(handle.submit_frame(red_frame(&released)));
    assert_eq!(handle.next_event().await, Some(WorkerEvent::Idle));

    let snapshot = reader.snapshot();
    // Left half is cut out: the green background shows through; the right
    // half keeps the red frame
    assert_eq!(snapshot.get_pixel(2, OUT_H / 2).0, [0, 255, 0, 255]);
    assert_eq!(snapshot.get_pixel(OUT_W - 3, OUT_H / 2).0, [255, 0, 0, 255]);
    assert_eq!(released.load(Ordering::SeqCst), 1);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_cached_background_switch_skips_refetch() {
    let fetcher = Arc::new(
        StubFetcher::new()
            .with_image("https://backdrops.test/a.png", Rgba([0, 255, 0, 255]))
            .with_image("https://backdrops.test/b.png", Rgba([0, 0, 255, 255])),
    );
    let mut handle = spawn_worker(
        test_config(),
        Box::new(MockSegmentationEngine::new()),
        fetcher.clone(),
    )
    .unwrap();
    let (surface, _reader) = OutputSurface::new(OUT_W, OUT_H);
    init_and_wait_ready(&mut handle, surface).await;

    for url in [
        "https://backdrops.test/a.png",
        "https://backdrops.test/b.png",
    ] {
        handle
            .send(WorkerCommand::SetBackground {
                url: Some(url.to_string()),
            })
            .await
            .unwrap();
        assert_eq!(handle.next_event().await, Some(WorkerEvent::BgLoading));
        assert_eq!(handle.next_event().await, Some(WorkerEvent::BgReady));
    }
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);

    // Switching back is a cache hit: instant BgReady, no network
    handle
        .send(WorkerCommand::SetBackground {
            url: Some("https://backdrops.test/a.png".to_string()),
        })
        .await
        .unwrap();
    assert_eq!(handle.next_event().await, Some(WorkerEvent::BgReady));
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);

    handle.shutdown().await.unwrap();
}

// Reselecting the background that is already active must still acknowledge
// with BgReady: hosts set their loading indicator before every selection
// and clear it only on the acknowledgment
#[tokio::test]
async fn test_reselecting_active_background_signals_ready() {
    let fetcher = Arc::new(
        StubFetcher::new().with_image("https://backdrops.test/a.png", Rgba([0, 255, 0, 255])),
    );
    let mut handle = spawn_worker(
        test_config(),
        Box::new(MockSegmentationEngine::new()),
        fetcher.clone(),
    )
    .unwrap();
    let (surface, _reader) = OutputSurface::new(OUT_W, OUT_H);
    init_and_wait_ready(&mut handle, surface).await;

    handle
        .send(WorkerCommand::SetBackground {
            url: Some("https://backdrops.test/a.png".to_string()),
        })
        .await
        .unwrap();
    assert_eq!(handle.next_event().await, Some(WorkerEvent::BgLoading));
    assert_eq!(handle.next_event().await, Some(WorkerEvent::BgReady));

    // Same URL again: no load phase, no refetch, immediate acknowledgment
    handle
        .send(WorkerCommand::SetBackground {
            url: Some("https://backdrops.test/a.png".to_string()),
        })
        .await
        .unwrap();
    assert_eq!(handle.next_event().await, Some(WorkerEvent::BgReady));
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);

    handle.shutdown().await.unwrap();
}

// Rapid switching: the later selection wins even though the earlier fetch
// completes afterwards
#[tokio::test(start_paused = true)]
async fn test_rapid_background_switch_latest_wins() {
    let engine = MockSegmentationEngine::new().with_default_response(MockResponse::NoMask);
    let fetcher = Arc::new(
        StubFetcher::new()
            .with_image("https://backdrops.test/slow.png", Rgba([0, 255, 0, 255]))
            .with_delay("https://backdrops.test/slow.png", Duration::from_millis(200))
            .with_image("https://backdrops.test/fast.png", Rgba([0, 0, 255, 255]))
            .with_delay("https://backdrops.test/fast.png", Duration::from_millis(10)),
    );
    let mut handle = spawn_worker(test_config(), Box::new(engine), fetcher).unwrap();
    let (surface, reader) = OutputSurface::new(OUT_W, OUT_H);
    init_and_wait_ready(&mut handle, surface).await;

    for url in [
        "https://backdrops.test/slow.png",
        "https://backdrops.test/fast.png",
    ] {
        handle
            .send(WorkerCommand::SetBackground {
                url: Some(url.to_string()),
            })
            .await
            .unwrap();
        assert_eq!(handle.next_event().await, Some(WorkerEvent::BgLoading));
    }

    // The fast request commits; the superseded slow one is cancelled, and
    // would be rejected by the token check even if it completed
    assert_eq!(handle.next_event().await, Some(WorkerEvent::BgReady));
    tokio::time::sleep(Duration::from_millis(300)).await;

    // NoMask keeps the frame unmasked over the base, so composite a fully
    // transparent frame to see the background directly
    let transparent = Frame::new(RgbaImage::from_pixel(OUT_W, OUT_H, Rgba([0, 0, 0, 0])));
    assert!(handle.submit_frame(transparent));
    assert_eq!(handle.next_event().await, Some(WorkerEvent::Idle));

    // Blue (fast) background, not green (slow)
    assert_eq!(reader.snapshot().get_pixel(2, 2).0, [0, 0, 255, 255]);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_pump_drives_worker_end_to_end() {
    init_diagnostics();
    let engine = MockSegmentationEngine::new();
    let mut handle = spawn_worker(test_config(), Box::new(engine), Arc::new(StubFetcher::new()))
        .unwrap();
    let (surface, reader) = OutputSurface::new(OUT_W, OUT_H);
    init_and_wait_ready(&mut handle, surface).await;

    let released = Arc::new(AtomicUsize::new(0));
    let (frame_tx, frame_rx) = mpsc::channel(8);
    for _ in 0..6 {
        frame_tx.try_send(red_frame(&released)).unwrap();
    }
    drop(frame_tx);

    let stats: PumpStats = run_pump(
        ChannelSource::new(frame_rx),
        |frame| handle.submit_frame(frame),
        handle.frames_done(),
        CancellationToken::new(),
    )
    .await;

    assert_eq!(stats.admitted + stats.dropped, 6);
    assert!(stats.admitted >= 1);

    // The pump can return while the last admitted frame is still in the
    // worker; wait for every admitted frame to finish before inspecting
    let mut done = handle.frames_done();
    while *done.borrow_and_update() < stats.admitted {
        done.changed().await.unwrap();
    }
    // Every frame was released, admitted or dropped
    assert_eq!(released.load(Ordering::SeqCst), 6);
    // The surface holds a presented composite, not the initial blank
    let snapshot = reader.snapshot();
    assert_eq!(snapshot.get_pixel(OUT_W / 2, OUT_H / 2)[3], 255);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_rejects_further_frames() {
    let mut handle = spawn_worker(
        test_config(),
        Box::new(MockSegmentationEngine::new()),
        Arc::new(StubFetcher::new()),
    )
    .unwrap();

    handle.send(WorkerCommand::Shutdown).await.unwrap();
    // The event stream ends when the worker task finishes
    assert_eq!(handle.next_event().await, None);
    // A stopped worker rejects frames; the pump stops on the first rejection
    assert!(!handle.submit_frame(Frame::new(RgbaImage::new(OUT_W, OUT_H))));
}
