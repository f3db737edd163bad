//! Per-location density calibration state
//!
//! [`DensityParameters`] is the one piece of cross-run mutable shared state
//! in the pipeline. It is accessed through the [`CalibrationStore`]
//! repository trait with optimistic-concurrency updates: every record
//! carries a version, writers compare-and-swap on it, and a lost race is
//! retried against the fresh value, so two concurrent runs for the same
//! location never clobber each other's calibration.

use crate::error::{PlantCountError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Prior-weight cap for the calibration blend.
///
/// The blend is a sample-size weighted mean; capping the prior weight keeps
/// a long location history from freezing calibration against seasonal
/// drift. This constant and [`blend_average_area`] are the tunable blend
/// policy.
pub const PRIOR_WEIGHT_CAP: u64 = 50;

/// Stored per-location calibration record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DensityParameters {
    /// Location this record calibrates
    pub location_id: String,
    /// Average object pixel area observed at this location
    pub avg_object_area_px: f64,
    /// Average object area in cm², when the location scale is known
    pub avg_object_area_cm2: Option<f64>,
    /// Packing/overlap correction factor in (0, 1]
    pub overlap_factor: f64,
    /// Total detections that contributed to this record
    pub sample_count: u64,
    /// Last update timestamp
    pub last_updated: DateTime<Utc>,
    /// Whether the record was produced by auto-calibration
    pub auto_calibrated: bool,
    /// Optimistic-concurrency version, incremented on every write
    pub version: u64,
}

/// In-run observation handed to the auto-calibration update
#[derive(Debug, Clone, Copy)]
pub struct ObservedDensity {
    /// Mean detection bbox area in this run, square pixels
    pub avg_object_area_px: f64,
    /// Number of detections behind the mean
    pub sample_count: u64,
    /// Location px→cm² scale, when known
    pub cm2_per_px: Option<f64>,
}

/// Blend a newly observed average object area into the stored average.
///
/// Sample-size weighted mean with a capped prior weight:
/// `w = min(prior_samples, PRIOR_WEIGHT_CAP)`, result
/// `(prior*w + observed*k) / (w + k)`. A convex combination, so the result
/// always lies within `[min(prior, observed), max(prior, observed)]`.
#[must_use]
pub fn blend_average_area(
    prior_avg: f64,
    prior_samples: u64,
    observed_avg: f64,
    observed_samples: u64,
) -> f64 {
    let w = prior_samples.min(PRIOR_WEIGHT_CAP) as f64;
    let k = observed_samples.max(1) as f64;
    (prior_avg * w + observed_avg * k) / (w + k)
}

/// Repository interface over per-location calibration records
#[async_trait]
pub trait CalibrationStore: Send + Sync {
    /// Fetch the current record for a location
    ///
    /// # Errors
    /// Store I/O or decoding failures.
    async fn get(&self, location_id: &str) -> Result<Option<DensityParameters>>;

    /// Write `params` only if the stored version still matches
    /// `expected_version` (`None` = record must not exist yet).
    ///
    /// Returns `false` on a version conflict; the caller re-reads and
    /// retries.
    ///
    /// # Errors
    /// Store I/O or encoding failures.
    async fn compare_and_swap(
        &self,
        expected_version: Option<u64>,
        params: DensityParameters,
    ) -> Result<bool>;
}

/// Blend an observation into the store with bounded CAS retries.
///
/// # Errors
/// - Store I/O failures
/// - `CalibrationConflict` when every retry loses its race
pub async fn record_observation(
    store: &dyn CalibrationStore,
    location_id: &str,
    observed: ObservedDensity,
    default_overlap_factor: f64,
    cas_retries: u32,
) -> Result<DensityParameters> {
    for _attempt in 0..=cas_retries {
        let prior = store.get(location_id).await?;
        let (expected_version, updated) = match prior {
            Some(prior) => {
                let blended_px = blend_average_area(
                    prior.avg_object_area_px,
                    prior.sample_count,
                    observed.avg_object_area_px,
                    observed.sample_count,
                );
                let updated = DensityParameters {
                    location_id: location_id.to_string(),
                    avg_object_area_px: blended_px,
                    avg_object_area_cm2: observed
                        .cm2_per_px
                        .map(|scale| blended_px * scale)
                        .or(prior.avg_object_area_cm2),
                    overlap_factor: prior.overlap_factor,
                    sample_count: prior.sample_count + observed.sample_count,
                    last_updated: Utc::now(),
                    auto_calibrated: true,
                    version: prior.version + 1,
                };
                (Some(prior.version), updated)
            },
            None => {
                let fresh = DensityParameters {
                    location_id: location_id.to_string(),
                    avg_object_area_px: observed.avg_object_area_px,
                    avg_object_area_cm2: observed
                        .cm2_per_px
                        .map(|scale| observed.avg_object_area_px * scale),
                    overlap_factor: default_overlap_factor,
                    sample_count: observed.sample_count,
                    last_updated: Utc::now(),
                    auto_calibrated: true,
                    version: 1,
                };
                (None, fresh)
            },
        };

        if store.compare_and_swap(expected_version, updated.clone()).await? {
            log::debug!(
                "Calibration for '{}' updated to {:.1} px² (v{}, {} samples)",
                location_id,
                updated.avg_object_area_px,
                updated.version,
                updated.sample_count
            );
            return Ok(updated);
        }
        tracing::debug!(location = location_id, "Calibration CAS lost, retrying");
    }

    Err(PlantCountError::CalibrationConflict(location_id.to_string()))
}

/// In-memory calibration store (tests, single-process embedding)
#[derive(Default)]
pub struct InMemoryCalibrationStore {
    records: Mutex<HashMap<String, DensityParameters>>,
}

impl InMemoryCalibrationStore {
    /// Empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded with existing records
    #[must_use]
    pub fn with_records(records: Vec<DensityParameters>) -> Self {
        Self {
            records: Mutex::new(
                records
                    .into_iter()
                    .map(|r| (r.location_id.clone(), r))
                    .collect(),
            ),
        }
    }
}

#[async_trait]
impl CalibrationStore for InMemoryCalibrationStore {
    async fn get(&self, location_id: &str) -> Result<Option<DensityParameters>> {
        Ok(self
            .records
            .lock()
            .map_err(|_| PlantCountError::internal("calibration store lock poisoned"))?
            .get(location_id)
            .cloned())
    }

    async fn compare_and_swap(
        &self,
        expected_version: Option<u64>,
        params: DensityParameters,
    ) -> Result<bool> {
        let mut records = self
            .records
            .lock()
            .map_err(|_| PlantCountError::internal("calibration store lock poisoned"))?;
        let current_version = records.get(&params.location_id).map(|r| r.version);
        if current_version != expected_version {
            return Ok(false);
        }
        records.insert(params.location_id.clone(), params);
        Ok(true)
    }
}

/// JSON-file-backed calibration store: one `<location>.json` per location
/// under a data directory, written atomically via rename.
pub struct JsonFileCalibrationStore {
    dir: PathBuf,
    // Serializes the read-compare-write cycle within this process; the
    // version field guards cross-process writers.
    write_lock: Mutex<()>,
}

impl JsonFileCalibrationStore {
    /// Store rooted at an explicit directory
    ///
    /// # Errors
    /// Directory creation failures.
    pub fn new<P: Into<PathBuf>>(dir: P) -> Result<Self> {
        let dir = dir.into();
        if !dir.exists() {
            std::fs::create_dir_all(&dir)
                .map_err(|e| PlantCountError::file_io_error("create calibration directory", &dir, e))?;
        }
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    /// Store under the platform data directory
    /// (override with `PLANTCOUNT_CALIBRATION_DIR`)
    ///
    /// # Errors
    /// - Data directory cannot be determined
    /// - Directory creation failures
    pub fn default_location() -> Result<Self> {
        if let Ok(dir_override) = std::env::var("PLANTCOUNT_CALIBRATION_DIR") {
            return Self::new(dir_override);
        }
        let dir = dirs::data_dir()
            .ok_or_else(|| {
                PlantCountError::invalid_config(
                    "Failed to determine data directory. Set PLANTCOUNT_CALIBRATION_DIR.",
                )
            })?
            .join("plantcount")
            .join("calibration");
        Self::new(dir)
    }

    fn record_path(&self, location_id: &str) -> PathBuf {
        // Keep filenames safe regardless of location id contents.
        let safe: String = location_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{safe}.json"))
    }

    fn read_record(path: &Path) -> Result<Option<DensityParameters>> {
        if !path.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| PlantCountError::file_io_error("read calibration record", path, e))?;
        let params = serde_json::from_str(&text).map_err(|e| {
            PlantCountError::processing(format!(
                "Corrupt calibration record '{}': {e}",
                path.display()
            ))
        })?;
        Ok(Some(params))
    }
}

#[async_trait]
impl CalibrationStore for JsonFileCalibrationStore {
    async fn get(&self, location_id: &str) -> Result<Option<DensityParameters>> {
        Self::read_record(&self.record_path(location_id))
    }

    async fn compare_and_swap(
        &self,
        expected_version: Option<u64>,
        params: DensityParameters,
    ) -> Result<bool> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| PlantCountError::internal("calibration store lock poisoned"))?;

        let path = self.record_path(&params.location_id);
        let current_version = Self::read_record(&path)?.map(|r| r.version);
        if current_version != expected_version {
            return Ok(false);
        }

        let json = serde_json::to_string_pretty(&params).map_err(|e| {
            PlantCountError::internal(format!("Failed to serialize calibration record: {e}"))
        })?;
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, json)
            .map_err(|e| PlantCountError::file_io_error("write calibration record", &tmp_path, e))?;
        std::fs::rename(&tmp_path, &path)
            .map_err(|e| PlantCountError::file_io_error("publish calibration record", &path, e))?;
        Ok(true)
    }
}
