//! ONNX Runtime segmentation backend
//!
//! Wraps an ONNX person-segmentation model behind the [`SegmentationEngine`]
//! trait. Supports CPU, CUDA, and `CoreML` execution providers; requesting an
//! accelerated provider that is not available on this host is an
//! initialization error so the fallback plan can move on to the next
//! provider.

use crate::{
    config::{ExecutionProvider, MaskMode, PipelineConfig},
    error::{BgSwapError, Result},
    inference::SegmentationEngine,
    types::{MaskData, SegmentationResult},
};
use image::RgbaImage;
use ndarray::Array4;
use ort::execution_providers::{
    CUDAExecutionProvider, CoreMLExecutionProvider, ExecutionProvider as OrtExecutionProvider,
};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Value;

/// Labels assumed when the model carries no label metadata. Selfie
/// segmentation models conventionally emit background at class 0 and the
/// person at class 1.
const DEFAULT_LABELS: &[&str] = &["background", "person"];

/// ONNX Runtime backed segmentation engine
pub struct OnnxSegmentationEngine {
    session: Option<Session>,
    labels: Vec<String>,
    mask_mode: MaskMode,
    last_timestamp_ms: Option<f64>,
    initialized: bool,
}

impl OnnxSegmentationEngine {
    #[must_use]
    pub fn new() -> Self {
        Self {
            session: None,
            labels: DEFAULT_LABELS.iter().map(|s| (*s).to_string()).collect(),
            mask_mode: MaskMode::Category,
            last_timestamp_ms: None,
            initialized: false,
        }
    }

    fn build_session(config: &PipelineConfig, provider: ExecutionProvider) -> Result<Session> {
        if config.model_asset_path.is_empty() {
            return Err(BgSwapError::model("model asset path not configured"));
        }

        let mut builder = Session::builder()
            .map_err(|e| BgSwapError::inference(format!("Failed to create session builder: {e}")))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| BgSwapError::inference(format!("Failed to set optimization level: {e}")))?;

        builder = match provider {
            ExecutionProvider::Cpu => builder,
            ExecutionProvider::Cuda => {
                let cuda = CUDAExecutionProvider::default();
                if !OrtExecutionProvider::is_available(&cuda).unwrap_or(false) {
                    return Err(BgSwapError::model("CUDA execution provider not available"));
                }
                log::info!("using CUDA execution provider");
                builder
                    .with_execution_providers([cuda.build()])
                    .map_err(|e| {
                        BgSwapError::inference(format!("Failed to set CUDA provider: {e}"))
                    })?
            },
            ExecutionProvider::CoreMl => {
                let coreml = CoreMLExecutionProvider::default();
                if !OrtExecutionProvider::is_available(&coreml).unwrap_or(false) {
                    return Err(BgSwapError::model(
                        "CoreML execution provider not available",
                    ));
                }
                log::info!("using CoreML execution provider");
                builder
                    .with_execution_providers([coreml.with_subgraphs(true).build()])
                    .map_err(|e| {
                        BgSwapError::inference(format!("Failed to set CoreML provider: {e}"))
                    })?
            },
            ExecutionProvider::Auto => {
                // The fallback plan expands Auto before reaching a backend;
                // treat a direct Auto request as CPU.
                builder
            },
        };

        builder
            .commit_from_file(&config.model_asset_path)
            .map_err(|e| {
                BgSwapError::model(format!(
                    "Failed to load model '{}': {e}",
                    config.model_asset_path
                ))
            })
    }

    /// Convert a frame to a normalized NCHW float tensor
    fn frame_to_tensor(frame: &RgbaImage) -> Array4<f32> {
        let (width, height) = frame.dimensions();
        let mut tensor = Array4::<f32>::zeros((1, 3, height as usize, width as usize));
        for (x, y, pixel) in frame.enumerate_pixels() {
            for channel in 0..3 {
                tensor[[0, channel, y as usize, x as usize]] =
                    f32::from(pixel[channel]) / 255.0;
            }
        }
        tensor
    }

    /// Interpret the raw output tensor as mask data.
    ///
    /// Single-channel outputs are per-pixel person confidence; multi-channel
    /// outputs are per-class scores reduced by argmax into category labels.
    fn tensor_to_mask(&self, shape: &[usize], data: &[f32]) -> Option<MaskData> {
        if shape.len() != 4 || shape[0] != 1 {
            return None;
        }
        let (channels, height, width) = (shape[1], shape[2], shape[3]);
        let pixels = width * height;
        if data.len() != channels * pixels {
            return None;
        }

        if channels == 1 {
            let scores = data.to_vec();
            return Some(match self.mask_mode {
                MaskMode::Confidence => MaskData::Confidence {
                    width: width as u32,
                    height: height as u32,
                    scores,
                },
                // Category mode on a confidence model: hard threshold,
                // matching the binary matte the low-power variant expects
                MaskMode::Category => MaskData::Category {
                    width: width as u32,
                    height: height as u32,
                    classes: scores.iter().map(|&s| u8::from(s >= 0.5)).collect(),
                },
            });
        }

        let mut classes = Vec::with_capacity(pixels);
        for i in 0..pixels {
            let mut best = 0usize;
            let mut best_score = f32::MIN;
            for c in 0..channels {
                let score = data[c * pixels + i];
                if score > best_score {
                    best_score = score;
                    best = c;
                }
            }
            classes.push(best as u8);
        }
        Some(MaskData::Category {
            width: width as u32,
            height: height as u32,
            classes,
        })
    }
}

impl Default for OnnxSegmentationEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl SegmentationEngine for OnnxSegmentationEngine {
    fn initialize(&mut self, config: &PipelineConfig, provider: ExecutionProvider) -> Result<()> {
        let session = Self::build_session(config, provider)?;
        self.session = Some(session);
        self.mask_mode = config.mask_mode;
        self.last_timestamp_ms = None;
        self.initialized = true;
        log::debug!(
            "ONNX session ready (model '{}', provider {provider})",
            config.model_asset_path
        );
        Ok(())
    }

    fn labels(&self) -> &[String] {
        &self.labels
    }

    fn segment_for_video(
        &mut self,
        frame: &RgbaImage,
        timestamp_ms: f64,
    ) -> Result<SegmentationResult> {
        if !self.initialized {
            return Err(BgSwapError::inference("backend not initialized"));
        }
        if let Some(last) = self.last_timestamp_ms {
            if timestamp_ms < last {
                return Err(BgSwapError::inference(format!(
                    "non-monotonic video timestamp: {timestamp_ms} < {last}"
                )));
            }
        }
        self.last_timestamp_ms = Some(timestamp_ms);

        let session = self
            .session
            .as_mut()
            .ok_or_else(|| BgSwapError::internal("ONNX session not initialized"))?;

        let input = Self::frame_to_tensor(frame);
        let input_value = Value::from_array(input).map_err(|e| {
            BgSwapError::processing(format!("Failed to convert input tensor: {e}"))
        })?;

        let outputs = session
            .run(ort::inputs![input_value])
            .map_err(|e| BgSwapError::processing(format!("ONNX inference failed: {e}")))?;

        let keys: Vec<_> = outputs.keys().collect();
        let first_key = keys
            .first()
            .ok_or_else(|| BgSwapError::processing("No output tensors found"))?;
        let output = outputs
            .get(first_key)
            .ok_or_else(|| BgSwapError::processing("First output tensor not found"))?
            .try_extract_array::<f32>()
            .map_err(|e| BgSwapError::processing(format!("Failed to extract output: {e}")))?;

        let shape = output.shape().to_vec();
        let data = output.view().to_owned().into_raw_vec_and_offset().0;
        let mask = self.tensor_to_mask(&shape, &data);
        if mask.is_none() {
            log::warn!("unrecognized segmentation output shape {shape:?}");
        }

        Ok(SegmentationResult {
            mask,
            width: frame.width(),
            height: frame.height(),
        })
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }
}

impl std::fmt::Debug for OnnxSegmentationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnnxSegmentationEngine")
            .field("initialized", &self.initialized)
            .field("mask_mode", &self.mask_mode)
            .finish_non_exhaustive()
    }
}
