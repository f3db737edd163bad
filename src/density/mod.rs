//! Density estimation for undetected container area
//!
//! - [`vegetation`]: hue-based filtering of plant material
//! - [`calibration`]: per-location density parameters with optimistic
//!   concurrency and the documented blend policy
//! - [`estimator`]: the band-partition, self-calibrating estimator

pub mod calibration;
pub mod estimator;
pub mod vegetation;

pub use calibration::{
    blend_average_area, record_observation, CalibrationStore, DensityParameters,
    InMemoryCalibrationStore, JsonFileCalibrationStore, ObservedDensity, PRIOR_WEIGHT_CAP,
};
pub use estimator::{DensityEstimator, EstimateOutcome};
pub use vegetation::{is_vegetation, rgb_to_hsv, undetected_vegetation};
