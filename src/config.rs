//! Configuration types for the plant counting pipeline

use crate::breaker::BreakerConfig;
use crate::error::{PlantCountError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Execution provider options for inference backends
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

/// Configuration for one pipeline instance
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Path to the segmentation model file
    pub segmentation_model: PathBuf,
    /// Path to the detection model file
    pub detection_model: PathBuf,
    /// Execution provider for inference
    pub execution_provider: ExecutionProvider,

    /// Minimum detector confidence to accept a detection
    pub confidence_threshold: f32,
    /// Probability threshold for binarizing the segmentation mask
    pub mask_threshold: f32,
    /// Components below this pixel area are dropped as mask noise
    pub min_component_area: u64,

    /// Tile edge length in pixels for tiled detection
    pub tile_size: u32,
    /// Fractional overlap between adjacent tiles
    pub tile_overlap: f32,
    /// IoU above which overlapping detections are merged
    pub merge_iou_threshold: f32,
    /// Containers at or above this pixel area use the tiled detector
    pub tiling_area_threshold: f64,

    /// Number of horizontal estimation bands per container
    pub band_count: usize,
    /// Overlap correction factor applied when no stored parameters exist
    pub default_overlap_factor: f64,

    /// Upper bound for one detection/estimation child
    pub child_timeout: Duration,
    /// Bounded retry attempts for transient failures
    pub retry_attempts: u32,
    /// Base delay for exponential backoff between retries
    pub retry_base_delay: Duration,
    /// Optimistic-concurrency retry budget for calibration writes
    pub calibration_cas_retries: u32,

    /// Upload circuit breaker tuning
    pub breaker: BreakerConfig,
}

impl PipelineConfig {
    /// Create a new configuration builder
    #[must_use]
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder::new()
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            segmentation_model: PathBuf::from("models/container-seg.onnx"),
            detection_model: PathBuf::from("models/plant-detect.onnx"),
            execution_provider: ExecutionProvider::default(),
            confidence_threshold: 0.25,
            mask_threshold: 0.5,
            min_component_area: 2_500,
            tile_size: 640,
            tile_overlap: 0.20,
            merge_iou_threshold: 0.45,
            tiling_area_threshold: 1024.0 * 1024.0,
            band_count: 5,
            default_overlap_factor: 0.85,
            child_timeout: Duration::from_secs(120),
            retry_attempts: 3,
            retry_base_delay: Duration::from_millis(200),
            calibration_cas_retries: 4,
            breaker: BreakerConfig::default(),
        }
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
    pub fn segmentation_model<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.config.segmentation_model = path.into();
        self
    }

    #[must_use]
    pub fn detection_model<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.config.detection_model = path.into();
        self
    }

    #[must_use]
    pub fn execution_provider(mut self, provider: ExecutionProvider) -> Self {
        self.config.execution_provider = provider;
        self
    }

    #[must_use]
    pub fn confidence_threshold(mut self, threshold: f32) -> Self {
        self.config.confidence_threshold = threshold.clamp(0.0, 1.0);
        self
    }

    #[must_use]
    pub fn mask_threshold(mut self, threshold: f32) -> Self {
        self.config.mask_threshold = threshold.clamp(0.0, 1.0);
        self
    }

    #[must_use]
    pub fn min_component_area(mut self, area: u64) -> Self {
        self.config.min_component_area = area;
        self
    }

    #[must_use]
    pub fn tile_size(mut self, size: u32) -> Self {
        self.config.tile_size = size;
        self
    }

    #[must_use]
    pub fn tile_overlap(mut self, overlap: f32) -> Self {
        self.config.tile_overlap = overlap;
        self
    }

    #[must_use]
    pub fn merge_iou_threshold(mut self, threshold: f32) -> Self {
        self.config.merge_iou_threshold = threshold;
        self
    }

    #[must_use]
    pub fn tiling_area_threshold(mut self, area: f64) -> Self {
        self.config.tiling_area_threshold = area;
        self
    }

    #[must_use]
    pub fn band_count(mut self, bands: usize) -> Self {
        self.config.band_count = bands;
        self
    }

    #[must_use]
    pub fn default_overlap_factor(mut self, factor: f64) -> Self {
        self.config.default_overlap_factor = factor;
        self
    }

    #[must_use]
    pub fn child_timeout(mut self, timeout: Duration) -> Self {
        self.config.child_timeout = timeout;
        self
    }

    #[must_use]
    pub fn retry_attempts(mut self, attempts: u32) -> Self {
        self.config.retry_attempts = attempts;
        self
    }

    #[must_use]
    pub fn retry_base_delay(mut self, delay: Duration) -> Self {
        self.config.retry_base_delay = delay;
        self
    }

    #[must_use]
    pub fn calibration_cas_retries(mut self, retries: u32) -> Self {
        self.config.calibration_cas_retries = retries;
        self
    }

    #[must_use]
    pub fn breaker(mut self, breaker: BreakerConfig) -> Self {
        self.config.breaker = breaker;
        self
    }

    /// Build the pipeline configuration
    ///
    /// # Errors
    ///
    /// Returns `PlantCountError::InvalidConfig` for:
    /// - Tile size below 64 px
    /// - Tile overlap outside [0, 0.9]
    /// - Merge IoU threshold outside (0, 1)
    /// - Zero estimation bands
    /// - Overlap factor outside (0, 1]
    /// - Zero retry attempts
    pub fn build(self) -> Result<PipelineConfig> {
        let c = &self.config;
        if c.tile_size < 64 {
            return Err(PlantCountError::invalid_config(
                "tile size must be at least 64 px",
            ));
        }
        if !(0.0..=0.9).contains(&c.tile_overlap) {
            return Err(PlantCountError::invalid_config(
                "tile overlap must be within [0, 0.9]",
            ));
        }
        if c.merge_iou_threshold <= 0.0 || c.merge_iou_threshold >= 1.0 {
            return Err(PlantCountError::invalid_config(
                "merge IoU threshold must be within (0, 1)",
            ));
        }
        if c.band_count == 0 {
            return Err(PlantCountError::invalid_config(
                "band count must be non-zero",
            ));
        }
        if c.default_overlap_factor <= 0.0 || c.default_overlap_factor > 1.0 {
            return Err(PlantCountError::invalid_config(
                "overlap factor must be within (0, 1]",
            ));
        }
        if c.retry_attempts == 0 {
            return Err(PlantCountError::invalid_config(
                "retry attempts must be at least 1",
            ));
        }
        Ok(self.config)
    }
}

impl Default for PipelineConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_builds() {
        let config = PipelineConfig::builder().build().unwrap();
        assert_eq!(config.band_count, 5);
        assert_eq!(config.tile_size, 640);
        assert!((config.tile_overlap - 0.20).abs() < f32::EPSILON);
    }

    #[test]
    fn test_confidence_clamping() {
        let config = PipelineConfig::builder()
            .confidence_threshold(1.5)
            .build()
            .unwrap();
        assert!((config.confidence_threshold - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_invalid_band_count_rejected() {
        let err = PipelineConfig::builder().band_count(0).build().unwrap_err();
        assert!(err.to_string().contains("band count"));
    }

    #[test]
    fn test_invalid_overlap_rejected() {
        assert!(PipelineConfig::builder()
            .tile_overlap(0.95)
            .build()
            .is_err());
        assert!(PipelineConfig::builder()
            .default_overlap_factor(0.0)
            .build()
            .is_err());
        assert!(PipelineConfig::builder()
            .default_overlap_factor(1.2)
            .build()
            .is_err());
    }

    #[test]
    fn test_invalid_tile_size_rejected() {
        assert!(PipelineConfig::builder().tile_size(32).build().is_err());
    }

    #[test]
    fn test_zero_retries_rejected() {
        assert!(PipelineConfig::builder().retry_attempts(0).build().is_err());
    }
}
