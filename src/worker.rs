//! Processing worker and its control protocol
//!
//! The worker owns the segmentation engine, the background cache, and (after
//! `Init`) the output surface. Hosts drive it through typed commands and
//! observe it through typed events; frames flow in one at a time and every
//! processed frame is answered with `Idle` plus a bump of the completed-frame
//! counter the pump gates on.
//!
//! Background loads run as detached tasks so frame processing never blocks on
//! the network; their results re-enter the worker through an internal channel
//! and are committed under the request-token staleness check.

use crate::{
    background::{
        decode_background, BackgroundCache, BackgroundFetcher, BackgroundKey, CacheLookup,
        CommitOutcome,
    },
    compositor::FrameCompositor,
    config::PipelineConfig,
    error::{BgSwapError, Result},
    inference::{initialize_with_fallback, SegmentationEngine},
    mask::resolve_person_index,
    types::{Frame, OutputSurface},
};
use image::RgbaImage;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const COMMAND_CHANNEL_CAPACITY: usize = 32;

/// Commands a host sends to the worker
#[derive(Debug)]
pub enum WorkerCommand {
    /// Initialize the engine and take ownership of the output surface.
    /// May be sent again after an initialization failure.
    Init {
        surface: OutputSurface,
        /// Overrides the configured model asset path when non-empty
        model_asset_path: String,
        /// Overrides the configured runtime asset base
        runtime_asset_base: Option<String>,
    },
    /// Select the replacement background; `None` clears it (flat white)
    SetBackground { url: Option<String> },
    /// One video frame to composite
    Frame(Frame),
    /// Stop the worker and release everything it holds
    Shutdown,
}

/// Events the worker reports back to its host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    /// Engine initialized; frame processing may begin
    Ready {
        labels: Vec<String>,
        person_index: usize,
    },
    /// Non-fatal diagnostic
    Info { message: String },
    /// A background fetch started
    BgLoading,
    /// The background request resolved (committed, or failed with the
    /// previous background kept)
    BgReady,
    /// A command failed; the worker keeps running
    Error { message: String },
    /// Frame processing cycle finished; the pump may admit the next frame
    Idle,
}

/// Host-side handle to a spawned worker
pub struct WorkerHandle {
    commands: mpsc::Sender<WorkerCommand>,
    events: mpsc::UnboundedReceiver<WorkerEvent>,
    frames_done: watch::Receiver<u64>,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    /// Send a command, waiting for channel capacity.
    ///
    /// # Errors
    /// The worker has stopped.
    pub async fn send(&self, command: WorkerCommand) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| BgSwapError::internal("worker is no longer running"))
    }

    /// Submit a frame without waiting; returns `false` once the worker is
    /// gone. Intended as the pump's sink: a rejected frame is dropped (and
    /// released) here.
    pub fn submit_frame(&self, frame: Frame) -> bool {
        self.commands.try_send(WorkerCommand::Frame(frame)).is_ok()
    }

    /// Receive the next worker event
    pub async fn next_event(&mut self) -> Option<WorkerEvent> {
        self.events.recv().await
    }

    /// Completed-frame counter for pump gating
    #[must_use]
    pub fn frames_done(&self) -> watch::Receiver<u64> {
        self.frames_done.clone()
    }

    /// Stop the worker and wait for it to finish.
    ///
    /// # Errors
    /// The worker task panicked.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.commands.send(WorkerCommand::Shutdown).await;
        self.cancel.cancel();
        self.join
            .await
            .map_err(|e| BgSwapError::internal(format!("worker task failed: {e}")))
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle").finish_non_exhaustive()
    }
}

/// Spawn the processing worker onto the current tokio runtime.
///
/// The engine is supplied uninitialized; initialization happens on the
/// `Init` command so the host can report engine failures through the event
/// stream and retry.
///
/// # Errors
/// Invalid configuration.
pub fn spawn_worker(
    config: PipelineConfig,
    engine: Box<dyn SegmentationEngine>,
    fetcher: Arc<dyn BackgroundFetcher>,
) -> Result<WorkerHandle> {
    config.validate()?;

    let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (done_tx, done_rx) = watch::channel(0u64);
    let (bg_tx, bg_rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();

    let worker = Worker {
        cache: BackgroundCache::new(config.max_background_cache),
        config,
        engine,
        fetcher,
        compositor: None,
        person_index: 0,
        events: event_tx,
        frames_done: done_tx,
        bg_tx,
        cancel: cancel.clone(),
        bg_fetch_cancel: None,
    };
    let join = tokio::spawn(worker.run(command_rx, bg_rx));

    Ok(WorkerHandle {
        commands: command_tx,
        events: event_rx,
        frames_done: done_rx,
        cancel,
        join,
    })
}

/// A background fetch+decode that finished off-task
struct BackgroundLoaded {
    token: u64,
    key: BackgroundKey,
    result: Result<RgbaImage>,
}

struct Worker {
    config: PipelineConfig,
    engine: Box<dyn SegmentationEngine>,
    fetcher: Arc<dyn BackgroundFetcher>,
    cache: BackgroundCache,
    compositor: Option<FrameCompositor>,
    person_index: usize,
    events: mpsc::UnboundedSender<WorkerEvent>,
    frames_done: watch::Sender<u64>,
    bg_tx: mpsc::UnboundedSender<BackgroundLoaded>,
    cancel: CancellationToken,
    /// Cancels the in-flight background fetch when a newer one supersedes it
    bg_fetch_cancel: Option<CancellationToken>,
}

impl Worker {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<WorkerCommand>,
        mut backgrounds: mpsc::UnboundedReceiver<BackgroundLoaded>,
    ) {
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                Some(loaded) = backgrounds.recv() => self.handle_background_loaded(loaded),
                command = commands.recv() => {
                    match command {
                        Some(WorkerCommand::Shutdown) | None => break,
                        Some(command) => self.handle_command(command),
                    }
                },
            }
        }
        self.cancel.cancel();
        self.cache.clear();
        log::debug!("worker stopped");
    }

    fn emit(&self, event: WorkerEvent) {
        // A departed host is not an error for the worker
        let _ = self.events.send(event);
    }

    fn handle_command(&mut self, command: WorkerCommand) {
        match command {
            WorkerCommand::Init {
                surface,
                model_asset_path,
                runtime_asset_base,
            } => self.handle_init(surface, model_asset_path, runtime_asset_base),
            WorkerCommand::SetBackground { url } => self.handle_set_background(url),
            WorkerCommand::Frame(frame) => self.handle_frame(frame),
            WorkerCommand::Shutdown => {},
        }
    }

    fn handle_init(
        &mut self,
        surface: OutputSurface,
        model_asset_path: String,
        runtime_asset_base: Option<String>,
    ) {
        if !model_asset_path.is_empty() {
            self.config.model_asset_path = model_asset_path;
        }
        if runtime_asset_base.is_some() {
            self.config.runtime_asset_base = runtime_asset_base;
        }
        // The transferred surface is authoritative for output resolution;
        // background keys must match what the compositor draws at, or every
        // frame would pay a base-layer resize
        self.config.output_width = surface.width();
        self.config.output_height = surface.height();

        match initialize_with_fallback(self.engine.as_mut(), &self.config) {
            Ok((provider, attempts)) => {
                let labels = self.engine.labels().to_vec();
                self.person_index = resolve_person_index(&labels);
                self.compositor = Some(FrameCompositor::new(
                    &self.config,
                    surface,
                    self.person_index,
                ));
                for attempt in &attempts {
                    self.emit(WorkerEvent::Info {
                        message: format!(
                            "provider {} unavailable: {}",
                            attempt.provider, attempt.error
                        ),
                    });
                }
                self.emit(WorkerEvent::Info {
                    message: format!("segmentation engine ready on {provider}"),
                });
                self.emit(WorkerEvent::Ready {
                    labels,
                    person_index: self.person_index,
                });
            },
            Err(e) => {
                // Surface is dropped; the host sends a fresh one on retry
                self.emit(WorkerEvent::Error {
                    message: format!("engine initialization failed: {e}"),
                });
            },
        }
    }

    fn handle_set_background(&mut self, url: Option<String>) {
        let Some(url) = url else {
            self.cache.clear_active();
            self.emit(WorkerEvent::BgReady);
            return;
        };

        let key = BackgroundKey::new(url, self.config.output_width, self.config.output_height);
        match self.cache.lookup_activate(&key) {
            // Already on screen: still acknowledge, hosts gate their
            // loading indicator on it
            CacheLookup::ActiveNoop => self.emit(WorkerEvent::BgReady),
            CacheLookup::Hit => self.emit(WorkerEvent::BgReady),
            CacheLookup::Miss => {
                self.emit(WorkerEvent::BgLoading);
                // Abort the superseded fetch; the token check still guards
                // against it completing first
                if let Some(previous) = self.bg_fetch_cancel.take() {
                    previous.cancel();
                }
                let token = self.cache.begin_request();
                let fetcher = self.fetcher.clone();
                let bg_tx = self.bg_tx.clone();
                let cancel = self.cancel.child_token();
                self.bg_fetch_cancel = Some(cancel.clone());
                tokio::spawn(async move {
                    let result = tokio::select! {
                        () = cancel.cancelled() => return,
                        bytes = fetcher.fetch(&key.url) => {
                            bytes.and_then(|b| decode_background(&b, key.width, key.height))
                        },
                    };
                    let _ = bg_tx.send(BackgroundLoaded { token, key, result });
                });
            },
        }
    }

    fn handle_background_loaded(&mut self, loaded: BackgroundLoaded) {
        if loaded.token != self.cache.current_token() {
            // Superseded while in flight; the newer request reports instead
            log::debug!("dropping superseded background '{}'", loaded.key.url);
            return;
        }
        match loaded.result {
            Ok(bitmap) => {
                if self.cache.commit(loaded.token, loaded.key, bitmap) == CommitOutcome::Committed {
                    self.emit(WorkerEvent::BgReady);
                }
            },
            Err(e) => {
                // Keep the last good background and let the host's loading
                // indicator resolve
                self.emit(WorkerEvent::Error {
                    message: format!("background load failed for '{}': {e}", loaded.key.url),
                });
                self.emit(WorkerEvent::BgReady);
            },
        }
    }

    fn handle_frame(&mut self, frame: Frame) {
        let Some(compositor) = self.compositor.as_mut() else {
            // Not initialized yet: release the frame and keep the pump
            // cycle moving
            log::debug!("dropping frame received before initialization");
            drop(frame);
            self.finish_frame_cycle();
            return;
        };

        if let Err(e) = compositor.composite(
            frame,
            self.engine.as_mut(),
            self.cache.active_bitmap(),
        ) {
            self.emit(WorkerEvent::Error {
                message: format!("frame processing failed: {e}"),
            });
        }
        self.finish_frame_cycle();
    }

    fn finish_frame_cycle(&mut self) {
        self.frames_done.send_modify(|done| *done += 1);
        self.emit(WorkerEvent::Idle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::test_utils::MockSegmentationEngine;

    struct UnreachableFetcher;

    #[async_trait::async_trait]
    impl BackgroundFetcher for UnreachableFetcher {
        async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
            Err(BgSwapError::model(format!("no network in test: {url}")))
        }
    }

    fn test_config() -> PipelineConfig {
        PipelineConfig::builder()
            .processing_resolution(16, 12)
            .output_resolution(32, 24)
            .feather_radius(0)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_frame_before_init_is_released_and_cycle_completes() {
        let handle = spawn_worker(
            test_config(),
            Box::new(MockSegmentationEngine::new()),
            Arc::new(UnreachableFetcher),
        )
        .unwrap();
        let mut handle = handle;
        let mut done = handle.frames_done();

        let released = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = released.clone();
        let frame = Frame::with_release_hook(RgbaImage::new(32, 24), move || {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });
        assert!(handle.submit_frame(frame));

        done.changed().await.unwrap();
        assert_eq!(*done.borrow(), 1);
        assert_eq!(handle.next_event().await, Some(WorkerEvent::Idle));
        assert_eq!(released.load(std::sync::atomic::Ordering::SeqCst), 1);

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_clearing_background_reports_ready() {
        let mut handle = spawn_worker(
            test_config(),
            Box::new(MockSegmentationEngine::new()),
            Arc::new(UnreachableFetcher),
        )
        .unwrap();

        handle
            .send(WorkerCommand::SetBackground { url: None })
            .await
            .unwrap();
        assert_eq!(handle.next_event().await, Some(WorkerEvent::BgReady));

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_fetch_reports_error_then_ready() {
        let mut handle = spawn_worker(
            test_config(),
            Box::new(MockSegmentationEngine::new()),
            Arc::new(UnreachableFetcher),
        )
        .unwrap();

        handle
            .send(WorkerCommand::SetBackground {
                url: Some("https://backdrops.test/missing.png".to_string()),
            })
            .await
            .unwrap();

        assert_eq!(handle.next_event().await, Some(WorkerEvent::BgLoading));
        assert!(matches!(
            handle.next_event().await,
            Some(WorkerEvent::Error { .. })
        ));
        assert_eq!(handle.next_event().await, Some(WorkerEvent::BgReady));

        handle.shutdown().await.unwrap();
    }

    fn bare_worker() -> Worker {
        let (event_tx, _event_rx) = mpsc::unbounded_channel();
        let (done_tx, _done_rx) = watch::channel(0u64);
        let (bg_tx, _bg_rx) = mpsc::unbounded_channel();
        Worker {
            cache: BackgroundCache::new(4),
            config: test_config(),
            engine: Box::new(MockSegmentationEngine::new()),
            fetcher: Arc::new(UnreachableFetcher),
            compositor: None,
            person_index: 0,
            events: event_tx,
            frames_done: done_tx,
            bg_tx,
            cancel: CancellationToken::new(),
            bg_fetch_cancel: None,
        }
    }

    // Background keys must be derived from the resolution the compositor
    // actually draws at, which is the transferred surface's, not the
    // configured one
    #[test]
    fn test_init_adopts_surface_resolution() {
        let mut worker = bare_worker();
        assert_eq!(worker.config.output_width, 32);
        let (surface, _reader) = OutputSurface::new(16, 12);
        worker.handle_init(surface, String::new(), None);

        assert_eq!(
            (worker.config.output_width, worker.config.output_height),
            (16, 12)
        );
        let compositor = worker.compositor.as_ref().unwrap();
        assert_eq!(
            (compositor.output_width(), compositor.output_height()),
            (16, 12)
        );
    }

    #[tokio::test]
    async fn test_shutdown_stops_worker() {
        let handle = spawn_worker(
            test_config(),
            Box::new(MockSegmentationEngine::new()),
            Arc::new(UnreachableFetcher),
        )
        .unwrap();
        handle.shutdown().await.unwrap();
    }
}
