#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::uninlined_format_args)]

//! # bgswap
//!
//! Live background replacement for a photo-booth video preview, built around
//! ONNX person segmentation.
//!
//! The pipeline runs as a dedicated worker task: the host pumps video frames
//! in one at a time, the worker segments each frame, feathers the person
//! matte, composites the cutout over a selectable background image, and
//! presents the finished composite to a shared output surface the host reads
//! from. Processing rate adapts to inference speed because the pump never
//! queues frames behind a slow model.
//!
//! ## Features
//!
//! - **Single-flight frame pump**: at most one frame in the worker; extra
//!   frames are dropped on arrival, so preview latency never builds up
//! - **Background cache**: decoded backgrounds kept in a small LRU keyed by
//!   URL and resolution; switching back to a recent background is instant
//! - **Staleness control**: rapid background switches resolve to the most
//!   recent selection regardless of network completion order
//! - **Hardware acceleration**: CUDA, `CoreML`, and CPU execution providers
//!   with ordered fallback
//! - **Degraded operation**: inference failures still draw a valid preview
//!   (background plus the unmasked frame) instead of going blank
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use bgswap::{
//!     spawn_worker, HttpBackgroundFetcher, MockSegmentationEngine, OutputSurface,
//!     PipelineConfig, WorkerCommand, WorkerEvent,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = PipelineConfig::builder()
//!     .model_asset_path("models/selfie_segmenter.onnx")
//!     .build()?;
//! let (surface, reader) = OutputSurface::new(config.output_width, config.output_height);
//!
//! let mut worker = spawn_worker(
//!     config,
//!     Box::new(MockSegmentationEngine::new()),
//!     Arc::new(HttpBackgroundFetcher::new()?),
//! )?;
//!
//! worker
//!     .send(WorkerCommand::Init {
//!         surface,
//!         model_asset_path: String::new(),
//!         runtime_asset_base: None,
//!     })
//!     .await?;
//! while let Some(event) = worker.next_event().await {
//!     if matches!(event, WorkerEvent::Ready { .. }) {
//!         break;
//!     }
//! }
//!
//! worker
//!     .send(WorkerCommand::SetBackground {
//!         url: Some("https://example.com/beach.jpg".to_string()),
//!     })
//!     .await?;
//! // Pump frames with bgswap::run_pump, read composites via reader.snapshot()
//! # let _ = reader;
//! # Ok(())
//! # }
//! ```
//!
//! ### Feature Flags
//!
//! - `onnx` (default): ONNX Runtime segmentation backend with GPU support
//!
//! The mock backend is always available, so the full pipeline (pump, cache,
//! compositor, worker protocol) can run and be tested without a model file.

pub mod backends;
pub mod background;
pub mod compositor;
pub mod config;
pub mod error;
pub mod feather;
pub mod inference;
pub mod mask;
pub mod pump;
pub mod types;
pub mod worker;

pub use backends::{MockResponse, MockSegmentationEngine};
#[cfg(feature = "onnx")]
pub use backends::OnnxSegmentationEngine;
pub use background::{
    decode_background, BackgroundCache, BackgroundFetcher, BackgroundKey, CacheLookup,
    CommitOutcome, HttpBackgroundFetcher, DEFAULT_BG_CACHE_CAPACITY,
};
pub use compositor::FrameCompositor;
pub use config::{
    ExecutionProvider, MaskMode, PipelineConfig, PipelineConfigBuilder, MAX_FEATHER_RADIUS,
};
pub use error::{BgSwapError, Result};
pub use feather::feather;
pub use inference::{
    initialization_plan, initialize_with_fallback, InitAttempt, SegmentationEngine,
};
pub use mask::{extract_mask, resolve_person_index, DEFAULT_PERSON_INDEX};
pub use pump::{
    run_pump, ChannelSource, FrameSource, IntervalSource, PumpStats, DEFAULT_PUMP_INTERVAL,
};
pub use types::{Frame, Mask, MaskData, OutputSurface, SegmentationResult, SurfaceReader};
pub use worker::{spawn_worker, WorkerCommand, WorkerEvent, WorkerHandle};

/// Spawn a worker wired to the ONNX backend and the HTTP fetcher.
///
/// This is the production composition; supply your own engine and fetcher
/// through [`spawn_worker`] for tests or custom backends.
///
/// # Errors
/// Invalid configuration, or the HTTP client could not be constructed.
#[cfg(feature = "onnx")]
pub fn spawn_default_worker(config: PipelineConfig) -> Result<WorkerHandle> {
    let fetcher = std::sync::Arc::new(HttpBackgroundFetcher::new()?);
    spawn_worker(
        config,
        Box::new(OnnxSegmentationEngine::new()),
        fetcher,
    )
}
