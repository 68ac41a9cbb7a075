//! Configuration types for the live compositing pipeline

use crate::error::{BgSwapError, Result};
use serde::{Deserialize, Serialize};

/// Execution provider options for the segmentation engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionProvider {
    /// Auto-detect best available provider (CUDA > `CoreML` > CPU)
    Auto,
    /// CPU execution (always available)
    Cpu,
    /// NVIDIA CUDA GPU acceleration
    Cuda,
    /// Apple Silicon GPU acceleration
    CoreMl,
}

impl Default for ExecutionProvider {
    fn default() -> Self {
        Self::Auto
    }
}

impl std::fmt::Display for ExecutionProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda => write!(f, "cuda"),
            Self::CoreMl => write!(f, "coreml"),
        }
    }
}

/// Which engine output the mask extractor should prefer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MaskMode {
    /// Binary person/background classification from the category mask
    Category,
    /// Soft alpha from the per-pixel confidence mask
    Confidence,
}

impl Default for MaskMode {
    fn default() -> Self {
        Self::Category
    }
}

/// Upper bound on the feather radius. Blur work runs synchronously between
/// suspension points, so an unbounded radius would starve the control channel.
pub const MAX_FEATHER_RADIUS: u32 = 64;

/// Configuration for the segmentation and compositing pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Execution provider for the segmentation engine
    pub execution_provider: ExecutionProvider,

    /// Mask extraction mode (category vs confidence)
    pub mask_mode: MaskMode,

    /// Width frames are downscaled to before inference
    pub processing_width: u32,

    /// Height frames are downscaled to before inference
    pub processing_height: u32,

    /// Output surface width
    pub output_width: u32,

    /// Output surface height
    pub output_height: u32,

    /// Feather (box blur) radius in pixels, typically 8-16
    pub feather_radius: u32,

    /// Maximum resident background cache entries
    pub max_background_cache: usize,

    /// Path or URL of the segmentation model asset
    pub model_asset_path: String,

    /// Base path for engine runtime assets, if the backend needs one
    pub runtime_asset_base: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::low_power()
    }
}

impl PipelineConfig {
    /// Create a new pipeline configuration builder
    #[must_use]
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder::new()
    }

    /// Preset for low-end hardware: CPU inference, binary category mask,
    /// reduced processing resolution (3:2, matches the 4x6 print aspect).
    #[must_use]
    pub fn low_power() -> Self {
        Self {
            execution_provider: ExecutionProvider::Cpu,
            mask_mode: MaskMode::Category,
            processing_width: 640,
            processing_height: 426,
            output_width: 960,
            output_height: 540,
            feather_radius: 12,
            max_background_cache: 4,
            model_asset_path: String::new(),
            runtime_asset_base: None,
        }
    }

    /// Preset for GPU-capable hardware: accelerated inference with soft
    /// confidence masks at a higher processing resolution.
    #[must_use]
    pub fn high_fidelity() -> Self {
        Self {
            execution_provider: ExecutionProvider::Auto,
            mask_mode: MaskMode::Confidence,
            processing_width: 960,
            processing_height: 640,
            output_width: 1280,
            output_height: 720,
            feather_radius: 8,
            max_background_cache: 4,
            model_asset_path: String::new(),
            runtime_asset_base: None,
        }
    }

    /// Load and validate a configuration from its JSON form, as stored in a
    /// kiosk settings file.
    ///
    /// # Errors
    /// Malformed JSON or out-of-range parameters.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| BgSwapError::invalid_config(format!("invalid config JSON: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize the configuration to JSON
    ///
    /// # Errors
    /// Serialization failure.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| BgSwapError::internal(format!("config serialization failed: {e}")))
    }

    /// Validate configuration parameters
    ///
    /// # Errors
    /// - Zero processing or output dimensions
    /// - Feather radius above [`MAX_FEATHER_RADIUS`]
    /// - Zero background cache capacity
    pub fn validate(&self) -> Result<()> {
        if self.processing_width == 0 || self.processing_height == 0 {
            return Err(BgSwapError::invalid_config(
                "processing resolution must be non-zero",
            ));
        }
        if self.output_width == 0 || self.output_height == 0 {
            return Err(BgSwapError::invalid_config(
                "output resolution must be non-zero",
            ));
        }
        if self.feather_radius > MAX_FEATHER_RADIUS {
            return Err(BgSwapError::invalid_config(format!(
                "feather radius {} exceeds maximum {}",
                self.feather_radius, MAX_FEATHER_RADIUS
            )));
        }
        if self.max_background_cache == 0 {
            return Err(BgSwapError::invalid_config(
                "background cache capacity must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Builder for [`PipelineConfig`]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: PipelineConfig::default(),
        }
    }

    #[must_use]
    pub fn execution_provider(mut self, provider: ExecutionProvider) -> Self {
        self.config.execution_provider = provider;
        self
    }

    #[must_use]
    pub fn mask_mode(mut self, mode: MaskMode) -> Self {
        self.config.mask_mode = mode;
        self
    }

    #[must_use]
    pub fn processing_resolution(mut self, width: u32, height: u32) -> Self {
        self.config.processing_width = width;
        self.config.processing_height = height;
        self
    }

    #[must_use]
    pub fn output_resolution(mut self, width: u32, height: u32) -> Self {
        self.config.output_width = width;
        self.config.output_height = height;
        self
    }

    #[must_use]
    pub fn feather_radius(mut self, radius: u32) -> Self {
        self.config.feather_radius = radius;
        self
    }

    #[must_use]
    pub fn max_background_cache(mut self, capacity: usize) -> Self {
        self.config.max_background_cache = capacity;
        self
    }

    #[must_use]
    pub fn model_asset_path<S: Into<String>>(mut self, path: S) -> Self {
        self.config.model_asset_path = path.into();
        self
    }

    #[must_use]
    pub fn runtime_asset_base<S: Into<String>>(mut self, base: S) -> Self {
        self.config.runtime_asset_base = Some(base.into());
        self
    }

    /// Build the configuration
    ///
    /// # Errors
    /// Returns [`BgSwapError::InvalidConfig`] for out-of-range parameters
    pub fn build(self) -> Result<PipelineConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for PipelineConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
