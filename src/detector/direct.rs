//! Single-pass detection for bounded containers
//!
//! Crates and plug/germination trays fit the detector input without
//! tiling; one inference pass per container, no cross-tile merge.

use crate::config::PipelineConfig;
use crate::error::Result;
use crate::inference::DetectionBackend;
use crate::types::{Container, Detection, DetectorVariant};
use image::DynamicImage;

/// Detector running one inference pass over the whole container crop
pub struct DirectDetector {
    confidence_threshold: f32,
}

impl DirectDetector {
    /// Create a detector with an explicit confidence floor
    #[must_use]
    pub fn new(confidence_threshold: f32) -> Self {
        Self {
            confidence_threshold,
        }
    }

    /// Create a detector from the pipeline configuration
    #[must_use]
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(config.confidence_threshold)
    }

    /// Detect plants in the container crop
    ///
    /// # Errors
    /// - Detection backend inference failures
    pub fn detect(
        &self,
        container: &Container,
        crop: &DynamicImage,
        backend: &dyn DetectionBackend,
    ) -> Result<Vec<Detection>> {
        let detections: Vec<Detection> = backend
            .detect(crop)?
            .into_iter()
            .filter(|raw| raw.confidence >= self.confidence_threshold)
            .map(|raw| Detection {
                container_id: container.id,
                bbox: raw.bbox,
                confidence: raw.confidence,
                variant: DetectorVariant::Direct,
            })
            .collect();

        log::debug!(
            "Direct detection for container {}: {} detection(s)",
            container.id,
            detections.len()
        );
        Ok(detections)
    }
}
