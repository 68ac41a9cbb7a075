//! Segmentation engine abstraction
//!
//! The segmentation model is an external black box consumed through the
//! [`SegmentationEngine`] trait. Engine initialization follows an explicit
//! ordered list of execution providers, attempted in sequence with
//! structured failure capture, preferring acceleration and falling back to
//! CPU.

use crate::{
    config::{ExecutionProvider, PipelineConfig},
    error::{BgSwapError, Result},
    types::SegmentationResult,
};
use image::RgbaImage;

/// Trait for segmentation engines
pub trait SegmentationEngine: Send {
    /// Initialize the engine for the given configuration and execution
    /// provider
    ///
    /// # Errors
    /// - Model asset unreachable or invalid
    /// - Requested execution provider unsupported on this host
    fn initialize(&mut self, config: &PipelineConfig, provider: ExecutionProvider) -> Result<()>;

    /// Category labels reported by the model, in class-index order
    fn labels(&self) -> &[String];

    /// Segment one video frame at a monotonic timestamp
    ///
    /// # Errors
    /// - Engine not initialized
    /// - Inference failure
    fn segment_for_video(
        &mut self,
        frame: &RgbaImage,
        timestamp_ms: f64,
    ) -> Result<SegmentationResult>;

    /// Check if the engine is initialized
    fn is_initialized(&self) -> bool;
}

/// One failed initialization attempt, kept for diagnostics
#[derive(Debug, Clone)]
pub struct InitAttempt {
    /// Provider that was attempted
    pub provider: ExecutionProvider,
    /// Error message from the attempt
    pub error: String,
}

/// Ordered list of providers to attempt for the requested provider.
///
/// `Auto` prefers CUDA, then `CoreML`, then CPU; an explicit accelerated
/// provider still falls back to CPU rather than failing the pipeline.
#[must_use]
pub fn initialization_plan(requested: ExecutionProvider) -> Vec<ExecutionProvider> {
    match requested {
        ExecutionProvider::Auto => vec![
            ExecutionProvider::Cuda,
            ExecutionProvider::CoreMl,
            ExecutionProvider::Cpu,
        ],
        ExecutionProvider::Cuda => vec![ExecutionProvider::Cuda, ExecutionProvider::Cpu],
        ExecutionProvider::CoreMl => vec![ExecutionProvider::CoreMl, ExecutionProvider::Cpu],
        ExecutionProvider::Cpu => vec![ExecutionProvider::Cpu],
    }
}

/// Initialize an engine, walking the provider plan until one succeeds.
///
/// Returns the provider that succeeded together with the failed attempts
/// that preceded it.
///
/// # Errors
/// Returns [`BgSwapError::Model`] if every provider in the plan fails.
pub fn initialize_with_fallback(
    engine: &mut dyn SegmentationEngine,
    config: &PipelineConfig,
) -> Result<(ExecutionProvider, Vec<InitAttempt>)> {
    let mut attempts = Vec::new();
    for provider in initialization_plan(config.execution_provider) {
        match engine.initialize(config, provider) {
            Ok(()) => {
                if !attempts.is_empty() {
                    log::warn!(
                        "engine initialized with {provider} after {} failed attempt(s)",
                        attempts.len()
                    );
                }
                log::info!("segmentation engine ready on {provider}");
                return Ok((provider, attempts));
            },
            Err(e) => {
                log::debug!("engine init failed on {provider}: {e}");
                attempts.push(InitAttempt {
                    provider,
                    error: e.to_string(),
                });
            },
        }
    }

    let summary = attempts
        .iter()
        .map(|a| format!("{}: {}", a.provider, a.error))
        .collect::<Vec<_>>()
        .join("; ");
    Err(BgSwapError::model(format!(
        "all execution providers failed ({summary})"
    )))
}
