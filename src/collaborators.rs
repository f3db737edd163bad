//! External collaborator contracts
//!
//! The pipeline consumes four collaborators it does not implement:
//! geolocation resolution, location configuration, object storage, and the
//! persistence layer. Each is a trait injected into the coordinator;
//! in-memory implementations ship for tests and single-process embedding.
//!
//! The persistence layer is treated as an idempotent-append sink keyed by
//! run identifier and must tolerate the partial rollback performed when an
//! aggregation consistency check fails.

use crate::error::{PlantCountError, Result};
use crate::types::{Detection, Estimation, GeoPoint, RunTotals};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use uuid::Uuid;

/// Per-location configuration returned by the configuration store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationConfig {
    /// Product expected to grow at this location
    pub expected_product: String,
    /// Pixel-to-physical scale (cm² per px²), when surveyed
    pub cm2_per_px: Option<f64>,
}

/// Resolves a photo's spatial metadata to a location identifier
#[async_trait]
pub trait LocationResolver: Send + Sync {
    /// Resolve, returning `None` when no location matches
    ///
    /// # Errors
    /// Resolver transport failures.
    async fn resolve(&self, geo: &GeoPoint) -> Result<Option<String>>;
}

/// Per-location product/packaging configuration lookup
#[async_trait]
pub trait LocationConfigStore: Send + Sync {
    /// Look up a location's configuration, `None` when not configured
    ///
    /// # Errors
    /// Store transport failures.
    async fn lookup(&self, location_id: &str) -> Result<Option<LocationConfig>>;
}

/// Object storage for visualization artifacts
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Upload bytes under a key, returning the stored object's URL
    ///
    /// # Errors
    /// Upload transport failures.
    async fn upload(&self, bytes: Vec<u8>, key: &str) -> Result<String>;
}

/// Aggregation artifact for one completed run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunAggregate {
    /// Run identifier
    pub run_id: Uuid,
    /// Photo the run processed
    pub photo_id: Uuid,
    /// Aggregated totals
    pub totals: RunTotals,
    /// Overlay artifact URL, when the upload succeeded
    pub artifact_url: Option<String>,
    /// Aggregation timestamp
    pub created_at: DateTime<Utc>,
}

/// Batched persistence of pipeline records
#[async_trait]
pub trait PersistenceSink: Send + Sync {
    /// Append a run's detections
    ///
    /// # Errors
    /// Sink transport failures.
    async fn write_detections(&self, run_id: Uuid, detections: &[Detection]) -> Result<()>;

    /// Append a run's estimations
    ///
    /// # Errors
    /// Sink transport failures.
    async fn write_estimations(&self, run_id: Uuid, estimations: &[Estimation]) -> Result<()>;

    /// Write the aggregation artifact
    ///
    /// # Errors
    /// Sink transport failures.
    async fn write_aggregate(&self, aggregate: &RunAggregate) -> Result<()>;

    /// Remove the aggregation artifact (partial rollback); raw detections
    /// and estimations stay for forensic review
    ///
    /// # Errors
    /// Sink transport failures.
    async fn delete_aggregate(&self, run_id: Uuid) -> Result<()>;

    /// Number of persisted (detections, estimations) for a run, for the
    /// aggregation consistency check
    ///
    /// # Errors
    /// Sink transport failures.
    async fn record_counts(&self, run_id: Uuid) -> Result<(usize, usize)>;
}

/// Resolver that returns the same location for every photo
pub struct FixedLocationResolver {
    location: Option<String>,
}

impl FixedLocationResolver {
    /// Resolver answering with `location` (or always "not found" for `None`)
    #[must_use]
    pub fn new(location: Option<String>) -> Self {
        Self { location }
    }
}

#[async_trait]
impl LocationResolver for FixedLocationResolver {
    async fn resolve(&self, _geo: &GeoPoint) -> Result<Option<String>> {
        Ok(self.location.clone())
    }
}

/// In-memory location configuration store
#[derive(Default)]
pub struct InMemoryLocationConfigStore {
    configs: Mutex<HashMap<String, LocationConfig>>,
}

impl InMemoryLocationConfigStore {
    /// Empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a location's configuration
    pub fn insert(&self, location_id: &str, config: LocationConfig) {
        self.configs
            .lock()
            .expect("config store lock poisoned")
            .insert(location_id.to_string(), config);
    }
}

#[async_trait]
impl LocationConfigStore for InMemoryLocationConfigStore {
    async fn lookup(&self, location_id: &str) -> Result<Option<LocationConfig>> {
        Ok(self
            .configs
            .lock()
            .map_err(|_| PlantCountError::internal("config store lock poisoned"))?
            .get(location_id)
            .cloned())
    }
}

/// In-memory object storage with failure injection
#[derive(Default)]
pub struct InMemoryObjectStorage {
    uploads: Mutex<Vec<(String, usize)>>,
    failing: AtomicBool,
}

impl InMemoryObjectStorage {
    /// Empty storage
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle failure injection: while failing, every upload errors
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Keys and payload sizes uploaded so far
    #[must_use]
    pub fn uploads(&self) -> Vec<(String, usize)> {
        self.uploads
            .lock()
            .expect("object storage lock poisoned")
            .clone()
    }
}

#[async_trait]
impl ObjectStorage for InMemoryObjectStorage {
    async fn upload(&self, bytes: Vec<u8>, key: &str) -> Result<String> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(PlantCountError::storage("injected upload failure"));
        }
        self.uploads
            .lock()
            .map_err(|_| PlantCountError::internal("object storage lock poisoned"))?
            .push((key.to_string(), bytes.len()));
        Ok(format!("memory://{key}"))
    }
}

/// In-memory persistence sink recording everything it is handed
#[derive(Default)]
pub struct InMemoryPersistenceSink {
    detections: Mutex<HashMap<Uuid, Vec<Detection>>>,
    estimations: Mutex<HashMap<Uuid, Vec<Estimation>>>,
    aggregates: Mutex<HashMap<Uuid, RunAggregate>>,
    /// When set, `record_counts` under-reports to trip the consistency check
    corrupt_counts: AtomicBool,
}

impl InMemoryPersistenceSink {
    /// Empty sink
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `record_counts` inconsistent with what was written
    pub fn set_corrupt_counts(&self, corrupt: bool) {
        self.corrupt_counts.store(corrupt, Ordering::SeqCst);
    }

    /// Detections persisted for a run
    #[must_use]
    pub fn detections_for(&self, run_id: Uuid) -> Vec<Detection> {
        self.detections
            .lock()
            .expect("sink lock poisoned")
            .get(&run_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Estimations persisted for a run
    #[must_use]
    pub fn estimations_for(&self, run_id: Uuid) -> Vec<Estimation> {
        self.estimations
            .lock()
            .expect("sink lock poisoned")
            .get(&run_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Aggregate artifact for a run, when present
    #[must_use]
    pub fn aggregate_for(&self, run_id: Uuid) -> Option<RunAggregate> {
        self.aggregates
            .lock()
            .expect("sink lock poisoned")
            .get(&run_id)
            .cloned()
    }
}

#[async_trait]
impl PersistenceSink for InMemoryPersistenceSink {
    async fn write_detections(&self, run_id: Uuid, detections: &[Detection]) -> Result<()> {
        self.detections
            .lock()
            .map_err(|_| PlantCountError::internal("sink lock poisoned"))?
            .entry(run_id)
            .or_default()
            .extend_from_slice(detections);
        Ok(())
    }

    async fn write_estimations(&self, run_id: Uuid, estimations: &[Estimation]) -> Result<()> {
        self.estimations
            .lock()
            .map_err(|_| PlantCountError::internal("sink lock poisoned"))?
            .entry(run_id)
            .or_default()
            .extend_from_slice(estimations);
        Ok(())
    }

    async fn write_aggregate(&self, aggregate: &RunAggregate) -> Result<()> {
        self.aggregates
            .lock()
            .map_err(|_| PlantCountError::internal("sink lock poisoned"))?
            .insert(aggregate.run_id, aggregate.clone());
        Ok(())
    }

    async fn delete_aggregate(&self, run_id: Uuid) -> Result<()> {
        self.aggregates
            .lock()
            .map_err(|_| PlantCountError::internal("sink lock poisoned"))?
            .remove(&run_id);
        Ok(())
    }

    async fn record_counts(&self, run_id: Uuid) -> Result<(usize, usize)> {
        let detections = self
            .detections
            .lock()
            .map_err(|_| PlantCountError::internal("sink lock poisoned"))?
            .get(&run_id)
            .map_or(0, Vec::len);
        let estimations = self
            .estimations
            .lock()
            .map_err(|_| PlantCountError::internal("sink lock poisoned"))?
            .get(&run_id)
            .map_or(0, Vec::len);

        if self.corrupt_counts.load(Ordering::SeqCst) {
            return Ok((detections.saturating_sub(1), estimations));
        }
        Ok((detections, estimations))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BoundingBox, DetectorVariant};

    fn sample_detection() -> Detection {
        Detection {
            container_id: Uuid::new_v4(),
            bbox: BoundingBox::new(0.0, 0.0, 10.0, 10.0),
            confidence: 0.9,
            variant: DetectorVariant::Direct,
        }
    }

    #[tokio::test]
    async fn test_fixed_resolver() {
        let geo = GeoPoint {
            latitude: 52.0,
            longitude: 4.5,
        };
        let hit = FixedLocationResolver::new(Some("bay-1".into()));
        assert_eq!(hit.resolve(&geo).await.unwrap().as_deref(), Some("bay-1"));

        let miss = FixedLocationResolver::new(None);
        assert!(miss.resolve(&geo).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_config_store_lookup() {
        let store = InMemoryLocationConfigStore::new();
        assert!(store.lookup("bay-1").await.unwrap().is_none());
        store.insert(
            "bay-1",
            LocationConfig {
                expected_product: "basil".into(),
                cm2_per_px: Some(0.02),
            },
        );
        let config = store.lookup("bay-1").await.unwrap().unwrap();
        assert_eq!(config.expected_product, "basil");
    }

    #[tokio::test]
    async fn test_object_storage_failure_injection() {
        let storage = InMemoryObjectStorage::new();
        storage.upload(vec![1, 2, 3], "runs/a.png").await.unwrap();
        storage.set_failing(true);
        assert!(storage.upload(vec![4], "runs/b.png").await.is_err());
        assert_eq!(storage.uploads().len(), 1);
    }

    #[tokio::test]
    async fn test_sink_counts_and_rollback() {
        let sink = InMemoryPersistenceSink::new();
        let run_id = Uuid::new_v4();
        sink.write_detections(run_id, &[sample_detection(), sample_detection()])
            .await
            .unwrap();
        assert_eq!(sink.record_counts(run_id).await.unwrap(), (2, 0));

        let aggregate = RunAggregate {
            run_id,
            photo_id: Uuid::new_v4(),
            totals: RunTotals::default(),
            artifact_url: None,
            created_at: Utc::now(),
        };
        sink.write_aggregate(&aggregate).await.unwrap();
        assert!(sink.aggregate_for(run_id).is_some());

        // Partial rollback removes the aggregate but keeps raw records.
        sink.delete_aggregate(run_id).await.unwrap();
        assert!(sink.aggregate_for(run_id).is_none());
        assert_eq!(sink.detections_for(run_id).len(), 2);
    }
}
