//! Pipeline coordination: fan-out, join barrier, aggregation
//!
//! One [`PipelineCoordinator`] owns every run's lifecycle:
//!
//! ```text
//! segmenting -> detecting -> estimating -> aggregating
//!            -> { completed | needs_attention | failed }
//! ```
//!
//! Segmentation produces N containers; the coordinator fans out one child
//! task per container (detection strictly before estimation within a
//! child, no ordering across children), then drains the join set as a
//! barrier: aggregation runs exactly once, after every child has reported
//! success or failure. Missing preconditions (no geolocation match, no
//! location configuration, no calibration data, zero containers) stop the
//! run at `needs_attention` with a reason code instead of failing it.

use crate::breaker::UploadCircuitBreaker;
use crate::collaborators::{
    LocationConfigStore, LocationResolver, ObjectStorage, PersistenceSink, RunAggregate,
};
use crate::config::PipelineConfig;
use crate::density::{CalibrationStore, DensityEstimator, EstimateOutcome};
use crate::detector::{crop_container, run_detection};
use crate::error::{PlantCountError, Result};
use crate::model_cache::InferenceModelCache;
use crate::segmenter::SegmentClassifier;
use crate::types::{
    Container, Detection, Estimation, PhotoReference, PhotoSource, RunState, RunStatus, RunTotals,
    WarningReason,
};
use crate::visualize::{render_overlay, OverlayItem};
use chrono::Utc;
use image::DynamicImage;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use uuid::Uuid;

/// What one detection/estimation child reports back
struct ChildOutput {
    container: Container,
    detections: Vec<Detection>,
    estimations: Vec<Estimation>,
    needs_calibration: bool,
}

enum ChildReport {
    Completed(Box<ChildOutput>),
    Failed { container_id: Uuid, error: PlantCountError },
    Skipped,
}

struct RunEntry {
    status: RunStatus,
    cancel: CancellationToken,
    state_tx: watch::Sender<RunState>,
}

/// Coordinates photo runs end to end
pub struct PipelineCoordinator {
    inner: Arc<CoordinatorInner>,
}

struct CoordinatorInner {
    config: PipelineConfig,
    model_cache: Arc<InferenceModelCache>,
    calibration: Arc<dyn CalibrationStore>,
    resolver: Arc<dyn LocationResolver>,
    location_configs: Arc<dyn LocationConfigStore>,
    storage: Arc<dyn ObjectStorage>,
    persistence: Arc<dyn PersistenceSink>,
    breaker: UploadCircuitBreaker,
    runs: RwLock<HashMap<Uuid, RunEntry>>,
}

/// Builder wiring the coordinator's collaborators
pub struct PipelineCoordinatorBuilder {
    config: PipelineConfig,
    model_cache: Option<Arc<InferenceModelCache>>,
    calibration: Option<Arc<dyn CalibrationStore>>,
    resolver: Option<Arc<dyn LocationResolver>>,
    location_configs: Option<Arc<dyn LocationConfigStore>>,
    storage: Option<Arc<dyn ObjectStorage>>,
    persistence: Option<Arc<dyn PersistenceSink>>,
}

impl PipelineCoordinatorBuilder {
    #[must_use]
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            model_cache: None,
            calibration: None,
            resolver: None,
            location_configs: None,
            storage: None,
            persistence: None,
        }
    }

    #[must_use]
    pub fn model_cache(mut self, cache: Arc<InferenceModelCache>) -> Self {
        self.model_cache = Some(cache);
        self
    }

    #[must_use]
    pub fn calibration_store(mut self, store: Arc<dyn CalibrationStore>) -> Self {
        self.calibration = Some(store);
        self
    }

    #[must_use]
    pub fn location_resolver(mut self, resolver: Arc<dyn LocationResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    #[must_use]
    pub fn location_config_store(mut self, store: Arc<dyn LocationConfigStore>) -> Self {
        self.location_configs = Some(store);
        self
    }

    #[must_use]
    pub fn object_storage(mut self, storage: Arc<dyn ObjectStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    #[must_use]
    pub fn persistence_sink(mut self, sink: Arc<dyn PersistenceSink>) -> Self {
        self.persistence = Some(sink);
        self
    }

    /// Build the coordinator.
    ///
    /// # Errors
    /// Returns `PlantCountError::InvalidConfig` when a required collaborator
    /// was not provided.
    pub fn build(self) -> Result<PipelineCoordinator> {
        let model_cache = self.model_cache.ok_or_else(|| {
            PlantCountError::invalid_config("PipelineCoordinator requires a model cache")
        })?;
        let calibration = self.calibration.ok_or_else(|| {
            PlantCountError::invalid_config("PipelineCoordinator requires a calibration store")
        })?;
        let resolver = self.resolver.ok_or_else(|| {
            PlantCountError::invalid_config("PipelineCoordinator requires a location resolver")
        })?;
        let location_configs = self.location_configs.ok_or_else(|| {
            PlantCountError::invalid_config("PipelineCoordinator requires a location config store")
        })?;
        let storage = self.storage.ok_or_else(|| {
            PlantCountError::invalid_config("PipelineCoordinator requires object storage")
        })?;
        let persistence = self.persistence.ok_or_else(|| {
            PlantCountError::invalid_config("PipelineCoordinator requires a persistence sink")
        })?;

        let breaker = UploadCircuitBreaker::new(self.config.breaker.clone());
        Ok(PipelineCoordinator {
            inner: Arc::new(CoordinatorInner {
                config: self.config,
                model_cache,
                calibration,
                resolver,
                location_configs,
                storage,
                persistence,
                breaker,
                runs: RwLock::new(HashMap::new()),
            }),
        })
    }
}

impl PipelineCoordinator {
    /// Start building a coordinator
    #[must_use]
    pub fn builder(config: PipelineConfig) -> PipelineCoordinatorBuilder {
        PipelineCoordinatorBuilder::new(config)
    }

    /// Submit a photo for processing; returns immediately with the run id.
    pub async fn submit_run(&self, photo: PhotoReference) -> Uuid {
        let run_id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let (state_tx, _) = watch::channel(RunState::Segmenting);

        let entry = RunEntry {
            status: RunStatus {
                run_id,
                photo_id: photo.photo_id,
                state: RunState::Segmenting,
                totals: None,
                warnings: Vec::new(),
                failure: None,
            },
            cancel: cancel.clone(),
            state_tx,
        };
        self.inner.runs.write().await.insert(run_id, entry);

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            if let Err(error) = inner.execute_run(run_id, photo, cancel).await {
                log::error!("Run {} failed: {}", run_id, error);
                inner
                    .finish(run_id, RunState::Failed, None, Some(error.to_string()))
                    .await;
            }
        });
        run_id
    }

    /// Snapshot of a run's status
    pub async fn get_run_status(&self, run_id: Uuid) -> Option<RunStatus> {
        self.inner
            .runs
            .read()
            .await
            .get(&run_id)
            .map(|entry| entry.status.clone())
    }

    /// Request cancellation of a run. Pending children stop before they
    /// start; already-running inference completes (it is not safely
    /// interruptible mid-operation). Returns `false` for unknown runs.
    pub async fn cancel_run(&self, run_id: Uuid) -> bool {
        match self.inner.runs.read().await.get(&run_id) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            },
            None => false,
        }
    }

    /// Wait until the run reaches a terminal state, returning its status.
    /// Returns `None` for unknown runs.
    pub async fn wait_for_terminal(&self, run_id: Uuid) -> Option<RunStatus> {
        let mut state_rx = {
            let runs = self.inner.runs.read().await;
            let entry = runs.get(&run_id)?;
            if entry.status.state.is_terminal() {
                return Some(entry.status.clone());
            }
            entry.state_tx.subscribe()
        };

        loop {
            if state_rx.changed().await.is_err() {
                break;
            }
            if state_rx.borrow().is_terminal() {
                break;
            }
        }
        self.get_run_status(run_id).await
    }

    /// Snapshot of the breaker guarding uploads (observability)
    #[must_use]
    pub fn breaker(&self) -> &UploadCircuitBreaker {
        &self.inner.breaker
    }
}

impl CoordinatorInner {
    #[instrument(skip_all, fields(run = %run_id))]
    async fn execute_run(
        &self,
        run_id: Uuid,
        photo: PhotoReference,
        cancel: CancellationToken,
    ) -> Result<()> {
        let image = load_photo(&photo).await?;

        // Preconditions upstream of detection are warning states, never
        // failures: the run keeps what it has and waits for manual action.
        let Some(location_id) = self.resolve_location(&photo).await? else {
            self.warn_and_finish(run_id, WarningReason::NoGeolocationMatch)
                .await;
            return Ok(());
        };
        let Some(location_config) = self.location_configs.lookup(&location_id).await? else {
            self.warn_and_finish(run_id, WarningReason::LocationNotConfigured)
                .await;
            return Ok(());
        };
        let cm2_per_px = location_config.cm2_per_px;

        if cancel.is_cancelled() {
            return Err(PlantCountError::processing("run cancelled"));
        }

        let classifier =
            SegmentClassifier::new(Arc::clone(&self.model_cache), self.config.clone());
        let containers = classifier
            .classify(photo.photo_id, &image, cm2_per_px)
            .await?;
        if containers.is_empty() {
            self.warn_and_finish(run_id, WarningReason::NoContainersFound)
                .await;
            return Ok(());
        }

        self.set_state(run_id, RunState::Detecting).await;
        let child_count = containers.len();
        let mut children: JoinSet<ChildReport> = JoinSet::new();
        for container in containers {
            children.spawn(self.spawn_child(
                Arc::clone(&image),
                container,
                location_id.clone(),
                cm2_per_px,
                cancel.clone(),
            ));
        }

        // Join barrier: aggregation must not start until every child has
        // reported, in whatever order they finish.
        let mut outputs: Vec<ChildOutput> = Vec::with_capacity(child_count);
        let mut failures: Vec<(Uuid, PlantCountError)> = Vec::new();
        let mut skipped = 0usize;
        let mut first_report = true;
        while let Some(joined) = children.join_next().await {
            if first_report {
                self.set_state(run_id, RunState::Estimating).await;
                first_report = false;
            }
            match joined {
                Ok(ChildReport::Completed(output)) => outputs.push(*output),
                Ok(ChildReport::Failed { container_id, error }) => {
                    log::warn!(
                        "Detection child for container {} failed: {}",
                        container_id,
                        error
                    );
                    failures.push((container_id, error));
                },
                Ok(ChildReport::Skipped) => skipped += 1,
                Err(join_error) => failures.push((
                    Uuid::nil(),
                    PlantCountError::internal(format!("child task panicked: {join_error}")),
                )),
            }
        }

        if cancel.is_cancelled() {
            return Err(PlantCountError::processing("run cancelled"));
        }
        if outputs.is_empty() && !failures.is_empty() {
            let (_, first) = failures.swap_remove(0);
            return Err(PlantCountError::processing(format!(
                "all {child_count} detection children failed; first error: {first}"
            )));
        }
        debug_assert_eq!(outputs.len() + failures.len() + skipped, child_count);

        self.set_state(run_id, RunState::Aggregating).await;
        self.aggregate(run_id, photo.photo_id, &image, outputs).await
    }

    /// Build one child future: detection strictly before estimation.
    fn spawn_child(
        &self,
        photo: Arc<DynamicImage>,
        container: Container,
        location_id: String,
        cm2_per_px: Option<f64>,
        cancel: CancellationToken,
    ) -> impl Future<Output = ChildReport> + Send + 'static {
        let model_cache = Arc::clone(&self.model_cache);
        let calibration = Arc::clone(&self.calibration);
        let config = self.config.clone();
        let timeout = self.config.child_timeout;

        async move {
            // A cancelled run stops children that have not started yet;
            // running inference is left to finish.
            if cancel.is_cancelled() {
                return ChildReport::Skipped;
            }

            let container_id = container.id;
            let work = child_work(
                model_cache,
                calibration,
                config,
                photo,
                container,
                location_id,
                cm2_per_px,
            );
            match tokio::time::timeout(timeout, work).await {
                Ok(Ok(output)) => ChildReport::Completed(Box::new(output)),
                Ok(Err(error)) => ChildReport::Failed {
                    container_id,
                    error,
                },
                Err(_) => ChildReport::Failed {
                    container_id,
                    error: PlantCountError::ChildTimeout(timeout),
                },
            }
        }
    }

    async fn aggregate(
        &self,
        run_id: Uuid,
        photo_id: Uuid,
        image: &DynamicImage,
        outputs: Vec<ChildOutput>,
    ) -> Result<()> {
        let all_detections: Vec<Detection> = outputs
            .iter()
            .flat_map(|o| o.detections.iter().cloned())
            .collect();
        let all_estimations: Vec<Estimation> = outputs
            .iter()
            .flat_map(|o| o.estimations.iter().cloned())
            .collect();

        // Persist raw records first; they survive any later rollback.
        let attempts = self.config.retry_attempts;
        let base_delay = self.config.retry_base_delay;
        retry_with_backoff(attempts, base_delay, || {
            self.persistence.write_detections(run_id, &all_detections)
        })
        .await?;
        retry_with_backoff(attempts, base_delay, || {
            self.persistence.write_estimations(run_id, &all_estimations)
        })
        .await?;

        // A container without calibration parks the whole run for manual
        // resolution; everything gathered so far is already persisted.
        if outputs.iter().any(|o| o.needs_calibration) {
            self.warn_and_finish(run_id, WarningReason::NeedsCalibration)
                .await;
            return Ok(());
        }

        let totals = aggregate_totals(&outputs);

        // Overlay artifact upload, guarded by the circuit breaker.
        let overlay_items: Vec<OverlayItem<'_>> = outputs
            .iter()
            .map(|o| OverlayItem {
                container: &o.container,
                detections: &o.detections,
            })
            .collect();
        let overlay_png = render_overlay(image, &overlay_items)?;
        let artifact_key = format!("runs/{run_id}/overlay.png");
        let artifact_url = retry_with_backoff(attempts, base_delay, || {
            let bytes = overlay_png.clone();
            let key = artifact_key.clone();
            async move { self.breaker.call(|| self.storage.upload(bytes, &key)).await }
        })
        .await?;

        let aggregate = RunAggregate {
            run_id,
            photo_id,
            totals,
            artifact_url: Some(artifact_url),
            created_at: Utc::now(),
        };
        retry_with_backoff(attempts, base_delay, || {
            self.persistence.write_aggregate(&aggregate)
        })
        .await?;

        // Consistency check: persisted record counts must equal the totals
        // we are about to report. A mismatch is a logic fault: roll back
        // the aggregate (keep raw records for forensics) and fail.
        let (persisted_detections, persisted_estimations) =
            self.persistence.record_counts(run_id).await?;
        if persisted_detections != all_detections.len()
            || persisted_estimations != all_estimations.len()
        {
            log::error!(
                "Run {} aggregation mismatch: persisted {}/{} vs expected {}/{}",
                run_id,
                persisted_detections,
                persisted_estimations,
                all_detections.len(),
                all_estimations.len()
            );
            self.persistence.delete_aggregate(run_id).await?;
            return Err(PlantCountError::processing(format!(
                "aggregation consistency check failed: persisted {persisted_detections} detections / {persisted_estimations} estimations, expected {} / {}",
                all_detections.len(),
                all_estimations.len()
            )));
        }

        log::info!(
            "Run {} completed: {} detected + {:.1} estimated = {:.1} plants",
            run_id,
            totals.detected,
            totals.estimated,
            totals.total
        );
        self.finish(run_id, RunState::Completed, Some(totals), None)
            .await;
        Ok(())
    }

    async fn resolve_location(&self, photo: &PhotoReference) -> Result<Option<String>> {
        match &photo.geo {
            Some(geo) => self.resolver.resolve(geo).await,
            None => Ok(None),
        }
    }

    async fn set_state(&self, run_id: Uuid, state: RunState) {
        let mut runs = self.runs.write().await;
        if let Some(entry) = runs.get_mut(&run_id) {
            entry.status.state = state;
            entry.state_tx.send_replace(state);
        }
    }

    async fn warn_and_finish(&self, run_id: Uuid, reason: WarningReason) {
        log::warn!(
            "Run {} needs attention: {}",
            run_id,
            reason.reason_code()
        );
        let mut runs = self.runs.write().await;
        if let Some(entry) = runs.get_mut(&run_id) {
            entry.status.state = RunState::NeedsAttention;
            entry.status.warnings.push(reason);
            entry.state_tx.send_replace(RunState::NeedsAttention);
        }
    }

    async fn finish(
        &self,
        run_id: Uuid,
        state: RunState,
        totals: Option<RunTotals>,
        failure: Option<String>,
    ) {
        let mut runs = self.runs.write().await;
        if let Some(entry) = runs.get_mut(&run_id) {
            entry.status.state = state;
            entry.status.totals = totals;
            entry.status.failure = failure;
            entry.state_tx.send_replace(state);
        }
    }
}

/// The per-container child: detect, then estimate.
async fn child_work(
    model_cache: Arc<InferenceModelCache>,
    calibration: Arc<dyn CalibrationStore>,
    config: PipelineConfig,
    photo: Arc<DynamicImage>,
    container: Container,
    location_id: String,
    cm2_per_px: Option<f64>,
) -> Result<ChildOutput> {
    let backend = model_cache.get_detection().await?;
    let crop = crop_container(&photo, &container);

    // Inference is CPU-bound; keep it off the async workers.
    let (container, crop, detections) = {
        let config = config.clone();
        tokio::task::spawn_blocking(move || {
            let detections = run_detection(&container, &crop, backend.as_ref(), &config)?;
            Ok::<_, PlantCountError>((container, crop, detections))
        })
        .await
        .map_err(|e| PlantCountError::internal(format!("detection task panicked: {e}")))??
    };

    let estimator = DensityEstimator::from_config(&config);
    let outcome = estimator
        .estimate(
            &container,
            &crop,
            &detections,
            &location_id,
            cm2_per_px,
            calibration.as_ref(),
        )
        .await?;

    let (estimations, needs_calibration) = match outcome {
        EstimateOutcome::Estimations(estimations) => (estimations, false),
        EstimateOutcome::NeedsCalibration => (Vec::new(), true),
    };

    Ok(ChildOutput {
        container,
        detections,
        estimations,
        needs_calibration,
    })
}

async fn load_photo(photo: &PhotoReference) -> Result<Arc<DynamicImage>> {
    match &photo.source {
        PhotoSource::InMemory(image) => Ok(Arc::clone(image)),
        PhotoSource::Path(path) => {
            let bytes = tokio::fs::read(path)
                .await
                .map_err(|e| PlantCountError::file_io_error("read photo", path, e))?;
            let image = image::load_from_memory(&bytes)?;
            Ok(Arc::new(image))
        },
    }
}

/// Sum detections and estimations into run totals with a weighted-average
/// confidence: each detection weighs 1, each band estimation weighs its
/// estimated count.
fn aggregate_totals(outputs: &[ChildOutput]) -> RunTotals {
    let detected: u64 = outputs.iter().map(|o| o.detections.len() as u64).sum();
    let estimated: f64 = outputs
        .iter()
        .flat_map(|o| o.estimations.iter())
        .map(|e| f64::from(e.estimated_count))
        .sum();

    let detection_confidence: f64 = outputs
        .iter()
        .flat_map(|o| o.detections.iter())
        .map(|d| f64::from(d.confidence))
        .sum();
    let estimation_confidence: f64 = outputs
        .iter()
        .flat_map(|o| o.estimations.iter())
        .map(|e| f64::from(e.confidence) * f64::from(e.estimated_count))
        .sum();

    let total = detected as f64 + estimated;
    let confidence = if total > 0.0 {
        ((detection_confidence + estimation_confidence) / total) as f32
    } else {
        0.0
    };

    RunTotals {
        detected,
        estimated,
        total,
        confidence,
    }
}

/// Retry a transient-failing operation with exponential backoff.
/// Non-transient errors surface immediately.
async fn retry_with_backoff<T, F, Fut>(attempts: u32, base_delay: Duration, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = base_delay;
    for attempt in 1..=attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(error) if error.is_transient() && attempt < attempts => {
                log::warn!(
                    "Transient failure (attempt {}/{}): {}; retrying in {:?}",
                    attempt,
                    attempts,
                    error,
                    delay
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
            },
            Err(error) => return Err(error),
        }
    }
    Err(PlantCountError::internal("retry loop exhausted"))
}
