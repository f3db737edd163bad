//! Inference backend abstraction
//!
//! The pipeline treats both models as opaque inference capabilities behind
//! traits: a segmentation backend producing a foreground probability mask
//! and a detection backend producing located objects. Concrete backends are
//! injected through a [`ModelFactory`], never constructed inside pipeline
//! logic.

use crate::config::PipelineConfig;
use crate::error::{PlantCountError, Result};
use crate::types::BoundingBox;
use image::DynamicImage;
use std::sync::Arc;

/// Which model a cache entry or factory call refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelKind {
    /// Container segmentation model
    Segmentation,
    /// Plant detection model
    Detection,
}

impl std::fmt::Display for ModelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Segmentation => write!(f, "segmentation"),
            Self::Detection => write!(f, "detection"),
        }
    }
}

/// Foreground probability mask produced by segmentation inference.
///
/// Probabilities are row-major, one `f32` in [0, 1] per photo pixel.
#[derive(Debug, Clone)]
pub struct SegmentationOutput {
    /// Mask width (matches the photo)
    pub width: u32,
    /// Mask height (matches the photo)
    pub height: u32,
    /// Row-major foreground probabilities
    pub probabilities: Vec<f32>,
}

impl SegmentationOutput {
    /// Create an output, validating dimensions
    ///
    /// # Errors
    /// Returns an error when the buffer length does not match the dimensions.
    pub fn new(width: u32, height: u32, probabilities: Vec<f32>) -> Result<Self> {
        let expected = width as usize * height as usize;
        if probabilities.len() != expected {
            return Err(PlantCountError::inference(format!(
                "Segmentation output length {} does not match {}x{}",
                probabilities.len(),
                width,
                height
            )));
        }
        Ok(Self {
            width,
            height,
            probabilities,
        })
    }

    /// Foreground probability at (x, y), 0.0 outside bounds
    #[must_use]
    pub fn probability(&self, x: u32, y: u32) -> f32 {
        if x >= self.width || y >= self.height {
            return 0.0;
        }
        self.probabilities
            .get(y as usize * self.width as usize + x as usize)
            .copied()
            .unwrap_or(0.0)
    }
}

/// One raw detection in image-local pixel coordinates, before any
/// confidence filtering or tile remapping
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawDetection {
    /// Bounding box in the coordinates of the image handed to the backend
    pub bbox: BoundingBox,
    /// Detector confidence in [0, 1]
    pub confidence: f32,
}

/// Trait for segmentation inference backends
pub trait SegmentationBackend: Send + Sync {
    /// Run segmentation on a full photo
    ///
    /// # Errors
    /// - Backend inference failures
    /// - Output tensor shape mismatches
    fn segment(&self, photo: &DynamicImage) -> Result<SegmentationOutput>;
}

/// Trait for object detection inference backends
pub trait DetectionBackend: Send + Sync {
    /// Run detection on an image (a container crop or a tile)
    ///
    /// Implementations return every candidate above their internal floor;
    /// the pipeline applies the configured confidence threshold itself.
    ///
    /// # Errors
    /// - Backend inference failures
    /// - Output tensor shape mismatches
    fn detect(&self, image: &DynamicImage) -> Result<Vec<RawDetection>>;
}

/// Factory for creating inference backends
///
/// Loading a model is fatal for the worker when it fails; the coordinator
/// fails the run rather than retrying the same worker in a loop.
pub trait ModelFactory: Send + Sync {
    /// Load the segmentation model
    ///
    /// # Errors
    /// Returns `PlantCountError::Model` when the model cannot be loaded.
    fn load_segmentation(&self, config: &PipelineConfig) -> Result<Arc<dyn SegmentationBackend>>;

    /// Load the detection model
    ///
    /// # Errors
    /// Returns `PlantCountError::Model` when the model cannot be loaded.
    fn load_detection(&self, config: &PipelineConfig) -> Result<Arc<dyn DetectionBackend>>;
}

/// Default factory wiring the ONNX backends when the `onnx` feature is on
pub struct DefaultModelFactory;

impl ModelFactory for DefaultModelFactory {
    #[cfg(feature = "onnx")]
    fn load_segmentation(&self, config: &PipelineConfig) -> Result<Arc<dyn SegmentationBackend>> {
        Ok(Arc::new(crate::backends::OnnxSegmentationBackend::load(
            config,
        )?))
    }

    #[cfg(not(feature = "onnx"))]
    fn load_segmentation(&self, _config: &PipelineConfig) -> Result<Arc<dyn SegmentationBackend>> {
        Err(PlantCountError::invalid_config(
            "No inference backend compiled in. Enable the `onnx` feature or inject a ModelFactory.",
        ))
    }

    #[cfg(feature = "onnx")]
    fn load_detection(&self, config: &PipelineConfig) -> Result<Arc<dyn DetectionBackend>> {
        Ok(Arc::new(crate::backends::OnnxDetectionBackend::load(
            config,
        )?))
    }

    #[cfg(not(feature = "onnx"))]
    fn load_detection(&self, _config: &PipelineConfig) -> Result<Arc<dyn DetectionBackend>> {
        Err(PlantCountError::invalid_config(
            "No inference backend compiled in. Enable the `onnx` feature or inject a ModelFactory.",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segmentation_output_validation() {
        assert!(SegmentationOutput::new(4, 4, vec![0.0; 15]).is_err());
        let out = SegmentationOutput::new(4, 4, vec![0.5; 16]).unwrap();
        assert!((out.probability(2, 2) - 0.5).abs() < f32::EPSILON);
        assert_eq!(out.probability(4, 0), 0.0);
    }

    #[test]
    fn test_model_kind_display() {
        assert_eq!(ModelKind::Segmentation.to_string(), "segmentation");
        assert_eq!(ModelKind::Detection.to_string(), "detection");
    }
}
