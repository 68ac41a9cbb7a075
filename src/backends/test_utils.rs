//! Mock segmentation engine for tests and model-less operation

use crate::{
    config::{ExecutionProvider, PipelineConfig},
    error::{BgSwapError, Result},
    inference::SegmentationEngine,
    types::{MaskData, SegmentationResult},
};
use image::RgbaImage;
use std::collections::VecDeque;

/// Scripted engine output for one frame
#[derive(Debug, Clone)]
pub enum MockResponse {
    /// Category mask classifying every pixel as the person class (index 1)
    FullPerson,
    /// Category mask: left half background, right half person
    LeftHalfPerson,
    /// Confidence mask with a uniform score
    Confidence(f32),
    /// Result with no recognized mask data
    NoMask,
    /// Inference failure
    Fail(String),
}

/// Deterministic in-memory engine. Produces masks at the incoming frame's
/// resolution and validates the video-mode timestamp contract.
pub struct MockSegmentationEngine {
    labels: Vec<String>,
    initialized: bool,
    failing_providers: Vec<ExecutionProvider>,
    scripted: VecDeque<MockResponse>,
    default_response: MockResponse,
    last_timestamp_ms: Option<f64>,
    /// Number of `segment_for_video` calls accepted
    pub calls: usize,
}

impl MockSegmentationEngine {
    #[must_use]
    pub fn new() -> Self {
        Self {
            labels: vec!["background".to_string(), "person".to_string()],
            initialized: false,
            failing_providers: Vec::new(),
            scripted: VecDeque::new(),
            default_response: MockResponse::FullPerson,
            last_timestamp_ms: None,
            calls: 0,
        }
    }

    #[must_use]
    pub fn with_labels(mut self, labels: Vec<String>) -> Self {
        self.labels = labels;
        self
    }

    /// Make initialization fail for the given providers
    #[must_use]
    pub fn failing_on(mut self, providers: &[ExecutionProvider]) -> Self {
        self.failing_providers = providers.to_vec();
        self
    }

    /// Queue scripted responses consumed in order before the default applies
    #[must_use]
    pub fn scripted(mut self, responses: Vec<MockResponse>) -> Self {
        self.scripted = responses.into();
        self
    }

    /// Response used once the script is exhausted
    #[must_use]
    pub fn with_default_response(mut self, response: MockResponse) -> Self {
        self.default_response = response;
        self
    }

    fn build_result(response: &MockResponse, width: u32, height: u32) -> Result<SegmentationResult> {
        let pixels = (width as usize) * (height as usize);
        let mask = match response {
            MockResponse::FullPerson => Some(MaskData::Category {
                width,
                height,
                classes: vec![1; pixels],
            }),
            MockResponse::LeftHalfPerson => {
                let classes: Vec<u8> = (0..height)
                    .flat_map(|_| (0..width).map(move |x| u8::from(x >= width / 2)))
                    .collect();
                Some(MaskData::Category {
                    width,
                    height,
                    classes,
                })
            },
            MockResponse::Confidence(score) => Some(MaskData::Confidence {
                width,
                height,
                scores: vec![*score; pixels],
            }),
            MockResponse::NoMask => None,
            MockResponse::Fail(message) => {
                return Err(BgSwapError::inference(message.clone()));
            },
        };
        Ok(SegmentationResult {
            mask,
            width,
            height,
        })
    }
}

impl Default for MockSegmentationEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl SegmentationEngine for MockSegmentationEngine {
    fn initialize(&mut self, _config: &PipelineConfig, provider: ExecutionProvider) -> Result<()> {
        if self.failing_providers.contains(&provider) {
            return Err(BgSwapError::model(format!(
                "mock provider {provider} unavailable"
            )));
        }
        self.initialized = true;
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
            return Err(BgSwapError::inference("engine not initialized"));
        }
        if let Some(last) = self.last_timestamp_ms {
            if timestamp_ms < last {
                return Err(BgSwapError::inference(format!(
                    "non-monotonic video timestamp: {timestamp_ms} < {last}"
                )));
            }
        }
        self.last_timestamp_ms = Some(timestamp_ms);

        let response = self
            .scripted
            .pop_front()
            .unwrap_or_else(|| self.default_response.clone());
        let result = Self::build_result(&response, frame.width(), frame.height());
        if result.is_ok() {
            self.calls += 1;
        }
        result
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }
}
