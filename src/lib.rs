#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::uninlined_format_args)]

//! # plantcount
//!
//! Detection-and-estimation pipeline for counting plants in photos of
//! cultivation containers, including plants that are visually
//! indistinguishable or overlapping.
//!
//! A photo flows through a multi-stage workflow:
//!
//! 1. **Segmentation**: [`SegmentClassifier`] splits the photo into typed
//!    containers (bed segment, crate, germination tray, plug tray).
//! 2. **Detection**: one parallel child per container runs either tiled
//!    detection with overlap merging ([`TiledDetector`]) or a single pass
//!    ([`DirectDetector`]), chosen purely by container size.
//! 3. **Estimation**: [`DensityEstimator`] counts the residual area no
//!    detection covered, using horizontal bands whose density is learned
//!    from the same photo's detections and auto-calibrated per location.
//! 4. **Aggregation**: [`PipelineCoordinator`] joins all children,
//!    aggregates totals, runs a consistency check, and hands results to
//!    the external storage and persistence collaborators.
//!
//! Missing preconditions (no geolocation match, unconfigured location, no
//! calibration data, zero containers) degrade gracefully to a
//! `needs_attention` state with a reason code instead of failing the run.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use plantcount::{
//!     DefaultModelFactory, FixedLocationResolver, InMemoryCalibrationStore,
//!     InMemoryLocationConfigStore, InMemoryObjectStorage, InMemoryPersistenceSink,
//!     InferenceModelCache, LocationConfig, PhotoReference, PipelineConfig,
//!     PipelineCoordinator,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = PipelineConfig::builder()
//!     .segmentation_model("models/container-seg.onnx")
//!     .detection_model("models/plant-detect.onnx")
//!     .build()?;
//!
//! let cache = Arc::new(InferenceModelCache::new(
//!     config.clone(),
//!     Arc::new(DefaultModelFactory),
//! ));
//! let configs = Arc::new(InMemoryLocationConfigStore::new());
//! configs.insert(
//!     "bay-7",
//!     LocationConfig { expected_product: "basil".into(), cm2_per_px: Some(0.02) },
//! );
//!
//! let coordinator = PipelineCoordinator::builder(config)
//!     .model_cache(cache)
//!     .calibration_store(Arc::new(InMemoryCalibrationStore::new()))
//!     .location_resolver(Arc::new(FixedLocationResolver::new(Some("bay-7".into()))))
//!     .location_config_store(configs)
//!     .object_storage(Arc::new(InMemoryObjectStorage::new()))
//!     .persistence_sink(Arc::new(InMemoryPersistenceSink::new()))
//!     .build()?;
//!
//! let photo = PhotoReference::from_path(
//!     "photos/bay7-morning.jpg",
//!     Some(plantcount::GeoPoint { latitude: 52.1, longitude: 4.6 }),
//! );
//! let run_id = coordinator.submit_run(photo).await;
//! let status = coordinator.wait_for_terminal(run_id).await;
//! println!("{status:?}");
//! # Ok(())
//! # }
//! ```
//!
//! ## Feature flags
//!
//! - `onnx` (default): ONNX Runtime inference backends
//! - `telemetry`: tracing subscriber bootstrap for applications

pub mod backends;
pub mod breaker;
pub mod collaborators;
pub mod config;
pub mod coordinator;
pub mod density;
pub mod detector;
pub mod error;
pub mod inference;
pub mod model_cache;
pub mod segmenter;
#[cfg(feature = "telemetry")]
pub mod tracing_config;
pub mod types;
pub mod visualize;

// Public API exports
pub use breaker::{BreakerConfig, BreakerState, BreakerStats, UploadCircuitBreaker};
pub use collaborators::{
    FixedLocationResolver, InMemoryLocationConfigStore, InMemoryObjectStorage,
    InMemoryPersistenceSink, LocationConfig, LocationConfigStore, LocationResolver, ObjectStorage,
    PersistenceSink, RunAggregate,
};
pub use config::{ExecutionProvider, PipelineConfig, PipelineConfigBuilder};
pub use coordinator::{PipelineCoordinator, PipelineCoordinatorBuilder};
pub use density::{
    blend_average_area, CalibrationStore, DensityEstimator, DensityParameters, EstimateOutcome,
    InMemoryCalibrationStore, JsonFileCalibrationStore, ObservedDensity,
};
pub use detector::{select_detector, DirectDetector, TiledDetector};
pub use error::{PlantCountError, Result};
pub use inference::{
    DefaultModelFactory, DetectionBackend, ModelFactory, ModelKind, RawDetection,
    SegmentationBackend, SegmentationOutput,
};
pub use model_cache::{InferenceModelCache, ModelCacheStats};
pub use segmenter::SegmentClassifier;
pub use types::{
    BoundingBox, CalibrationSource, Container, ContainerKind, ContainerMask, Detection,
    DetectorVariant, Estimation, GeoPoint, PhotoReference, PhotoSource, RunState, RunStatus,
    RunTotals, WarningReason,
};
pub use visualize::{render_overlay, OverlayItem};

#[cfg(feature = "telemetry")]
pub use tracing_config::{TracingConfig, TracingFormat};
