//! Inference backend implementations
//!
//! - ONNX Runtime backends (feature `onnx`, GPU acceleration)
//! - Mock backends for tests and embedders without model files

#[cfg(feature = "onnx")]
pub mod onnx;

pub mod test_utils;

#[cfg(feature = "onnx")]
pub use self::onnx::{OnnxDetectionBackend, OnnxSegmentationBackend};
