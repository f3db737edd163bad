//! Per-worker inference model cache
//!
//! Loads the segmentation and detection models exactly once per worker
//! lifetime and hands out shared read-only handles. The first-load path is
//! single-flight per model kind: concurrent callers during the initial load
//! all wait on one factory invocation instead of triggering duplicates.
//!
//! A failed load is fatal for this worker's run; the coordinator marks the
//! run failed and leaves rescheduling to an external scheduler rather than
//! retrying the same worker in a loop.

use crate::config::PipelineConfig;
use crate::error::Result;
use crate::inference::{DetectionBackend, ModelFactory, ModelKind, SegmentationBackend};
use instant::Instant;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::OnceCell;

/// Runtime statistics for the model cache
#[derive(Debug, Clone, Copy, Default)]
pub struct ModelCacheStats {
    /// Completed model loads (at most one per kind)
    pub loads: u64,
    /// Calls served from the cache without loading
    pub hits: u64,
    /// Wall time of the segmentation model load
    pub segmentation_load: Option<Duration>,
    /// Wall time of the detection model load
    pub detection_load: Option<Duration>,
}

/// Lazily-loading, shareable cache of the worker's two inference models
pub struct InferenceModelCache {
    config: PipelineConfig,
    factory: Arc<dyn ModelFactory>,
    segmentation: OnceCell<Arc<dyn SegmentationBackend>>,
    detection: OnceCell<Arc<dyn DetectionBackend>>,
    stats: Mutex<ModelCacheStats>,
}

impl InferenceModelCache {
    /// Create a cache around a model factory. Nothing is loaded yet.
    #[must_use]
    pub fn new(config: PipelineConfig, factory: Arc<dyn ModelFactory>) -> Self {
        Self {
            config,
            factory,
            segmentation: OnceCell::new(),
            detection: OnceCell::new(),
            stats: Mutex::new(ModelCacheStats::default()),
        }
    }

    /// Get the segmentation model, loading it on first use
    ///
    /// # Errors
    /// Propagates the factory's `PlantCountError::Model` load failure to
    /// every concurrent waiter; the cache stays empty so a later run on a
    /// recovered worker may try again.
    pub async fn get_segmentation(&self) -> Result<Arc<dyn SegmentationBackend>> {
        if let Some(backend) = self.segmentation.get() {
            self.stats.lock().expect("stats lock poisoned").hits += 1;
            return Ok(Arc::clone(backend));
        }

        let backend = self
            .segmentation
            .get_or_try_init(|| async {
                self.load_timed(ModelKind::Segmentation, || {
                    self.factory.load_segmentation(&self.config)
                })
            })
            .await?;
        Ok(Arc::clone(backend))
    }

    /// Get the detection model, loading it on first use
    ///
    /// # Errors
    /// Same contract as [`Self::get_segmentation`].
    pub async fn get_detection(&self) -> Result<Arc<dyn DetectionBackend>> {
        if let Some(backend) = self.detection.get() {
            self.stats.lock().expect("stats lock poisoned").hits += 1;
            return Ok(Arc::clone(backend));
        }

        let backend = self
            .detection
            .get_or_try_init(|| async {
                self.load_timed(ModelKind::Detection, || {
                    self.factory.load_detection(&self.config)
                })
            })
            .await?;
        Ok(Arc::clone(backend))
    }

    /// Eagerly load both models, typically at worker start so the first
    /// photo does not pay the load cost.
    ///
    /// # Errors
    /// First load failure of either model.
    pub async fn warm_up(&self) -> Result<()> {
        futures::future::try_join(self.get_segmentation(), self.get_detection()).await?;
        Ok(())
    }

    /// Snapshot of cache statistics
    #[must_use]
    pub fn stats(&self) -> ModelCacheStats {
        *self.stats.lock().expect("stats lock poisoned")
    }

    fn load_timed<T, F>(&self, kind: ModelKind, load: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        let model_path = match kind {
            ModelKind::Segmentation => &self.config.segmentation_model,
            ModelKind::Detection => &self.config.detection_model,
        };

        log::info!("Loading {} model from {}", kind, model_path.display());
        let start = Instant::now();
        let backend = load()?;
        let elapsed = start.elapsed();

        if let Some(fingerprint) = model_fingerprint(model_path) {
            log::debug!("{} model fingerprint: {}", kind, fingerprint);
        }
        log::info!(
            "{} model loaded in {:.0}ms",
            kind,
            elapsed.as_secs_f64() * 1000.0
        );

        let mut stats = self.stats.lock().expect("stats lock poisoned");
        stats.loads += 1;
        match kind {
            ModelKind::Segmentation => stats.segmentation_load = Some(elapsed),
            ModelKind::Detection => stats.detection_load = Some(elapsed),
        }
        Ok(backend)
    }
}

/// SHA256 fingerprint of a model file, for log correlation across workers.
/// Returns `None` when the file is absent (injected test backends).
fn model_fingerprint(path: &Path) -> Option<String> {
    let data = std::fs::read(path).ok()?;
    let mut hasher = Sha256::new();
    hasher.update(&data);
    Some(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::test_utils::{MockDetectionBackend, MockSegmentationBackend};
    use crate::error::PlantCountError;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct CountingFactory {
        seg_loads: AtomicU64,
        det_loads: AtomicU64,
        load_delay: Duration,
        fail: bool,
    }

    impl CountingFactory {
        fn new(load_delay: Duration, fail: bool) -> Self {
            Self {
                seg_loads: AtomicU64::new(0),
                det_loads: AtomicU64::new(0),
                load_delay,
                fail,
            }
        }
    }

    impl ModelFactory for CountingFactory {
        fn load_segmentation(
            &self,
            _config: &PipelineConfig,
        ) -> Result<Arc<dyn SegmentationBackend>> {
            std::thread::sleep(self.load_delay);
            self.seg_loads.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(PlantCountError::model("weights corrupted"));
            }
            Ok(Arc::new(MockSegmentationBackend::blank(8, 8)))
        }

        fn load_detection(&self, _config: &PipelineConfig) -> Result<Arc<dyn DetectionBackend>> {
            std::thread::sleep(self.load_delay);
            self.det_loads.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(PlantCountError::model("weights corrupted"));
            }
            Ok(Arc::new(MockDetectionBackend::empty()))
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_load_is_single_flight() {
        let factory = Arc::new(CountingFactory::new(Duration::from_millis(30), false));
        let cache = Arc::new(InferenceModelCache::new(
            PipelineConfig::default(),
            Arc::clone(&factory) as Arc<dyn ModelFactory>,
        ));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            handles.push(tokio::spawn(
                async move { cache.get_detection().await.is_ok() },
            ));
        }
        for handle in handles {
            assert!(handle.await.unwrap());
        }

        assert_eq!(factory.det_loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_subsequent_calls_hit_cache() {
        let factory = Arc::new(CountingFactory::new(Duration::ZERO, false));
        let cache = InferenceModelCache::new(
            PipelineConfig::default(),
            Arc::clone(&factory) as Arc<dyn ModelFactory>,
        );

        cache.get_segmentation().await.unwrap();
        cache.get_segmentation().await.unwrap();
        cache.get_segmentation().await.unwrap();

        let stats = cache.stats();
        assert_eq!(stats.loads, 1);
        assert_eq!(stats.hits, 2);
        assert!(stats.segmentation_load.is_some());
        assert_eq!(factory.seg_loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_load_failure_propagates_to_caller() {
        let factory = Arc::new(CountingFactory::new(Duration::ZERO, true));
        let cache = InferenceModelCache::new(
            PipelineConfig::default(),
            Arc::clone(&factory) as Arc<dyn ModelFactory>,
        );

        let err = match cache.get_segmentation().await {
            Ok(_) => panic!("expected load failure"),
            Err(e) => e,
        };
        assert!(matches!(err, PlantCountError::Model(_)));
    }
}
