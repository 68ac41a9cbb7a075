//! Segmentation engine backends
//!
//! The ONNX Runtime backend is feature-gated; the mock backend is always
//! available so hosts and tests can exercise the pipeline without a model.

#[cfg(feature = "onnx")]
pub mod onnx;
pub mod test_utils;

#[cfg(feature = "onnx")]
pub use onnx::OnnxSegmentationEngine;
pub use test_utils::{MockResponse, MockSegmentationEngine};
