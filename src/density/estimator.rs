//! Band-based density estimation with auto-calibration
//!
//! Counts the plants individual detection missed. The undetected,
//! vegetation-filtered area of a container is split into horizontal bands
//! (near-to-far perspective gradient: objects nearer the camera occupy
//! more pixels), each band divides its vegetation area by an effective
//! average object area, and the per-band counts sum into the container's
//! estimate. Bands prefer average areas learned from detections in the
//! same photo; stored per-location parameters are the fallback.

use crate::config::PipelineConfig;
use crate::density::calibration::{record_observation, CalibrationStore, ObservedDensity};
use crate::density::vegetation::undetected_vegetation;
use crate::error::Result;
use crate::types::{CalibrationSource, Container, Detection, Estimation};
use image::DynamicImage;

/// Confidence proxy for bands estimated from stored parameters
const STORED_PARAMS_CONFIDENCE: f32 = 0.5;
/// Confidence proxy for bands falling back to the in-run global average
const IN_RUN_FALLBACK_CONFIDENCE: f32 = 0.4;

/// Result of estimating one container
#[derive(Debug, Clone, PartialEq)]
pub enum EstimateOutcome {
    /// Per-band estimations (possibly empty when nothing was left to
    /// estimate)
    Estimations(Vec<Estimation>),
    /// No stored parameters and no local detections anywhere: estimating
    /// would fabricate a count from an undefined area. Surfaced as a
    /// warning state, not an error.
    NeedsCalibration,
}

/// Band-partition density estimator
pub struct DensityEstimator {
    band_count: usize,
    default_overlap_factor: f64,
    cas_retries: u32,
}

impl DensityEstimator {
    /// Create an estimator with explicit tuning
    #[must_use]
    pub fn new(band_count: usize, default_overlap_factor: f64, cas_retries: u32) -> Self {
        Self {
            band_count,
            default_overlap_factor,
            cas_retries,
        }
    }

    /// Create an estimator from the pipeline configuration
    #[must_use]
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(
            config.band_count,
            config.default_overlap_factor,
            config.calibration_cas_retries,
        )
    }

    /// Estimate the undetected plant count for one container.
    ///
    /// `detections` must be the container's accepted (merged) detections in
    /// container-local coordinates; detection always completes before
    /// estimation for a container.
    ///
    /// # Errors
    /// - Calibration store read failures
    pub async fn estimate(
        &self,
        container: &Container,
        crop: &DynamicImage,
        detections: &[Detection],
        location_id: &str,
        cm2_per_px: Option<f64>,
        store: &dyn CalibrationStore,
    ) -> Result<EstimateOutcome> {
        let flags = undetected_vegetation(crop, &container.mask, detections);
        let band_vegetation = self.band_vegetation_areas(&flags, container.mask.width, container.mask.height);
        let total_vegetation: u64 = band_vegetation.iter().sum();

        // Everything is either detected or non-vegetation: nothing to estimate.
        if total_vegetation == 0 {
            return Ok(EstimateOutcome::Estimations(Vec::new()));
        }

        let band_detections = self.banded_detections(detections, container.mask.height);
        let any_local = band_detections.iter().any(|band| !band.is_empty());
        let stored = store.get(location_id).await?;

        if !any_local && stored.is_none() {
            log::warn!(
                "Container {} at '{}' has no local detections and no stored calibration",
                container.id,
                location_id
            );
            return Ok(EstimateOutcome::NeedsCalibration);
        }

        let overlap_factor = stored
            .as_ref()
            .map_or(self.default_overlap_factor, |p| p.overlap_factor);
        let in_run_average = mean_bbox_area(detections);

        let mut estimations = Vec::new();
        for (band_index, (&vegetation_px, band_dets)) in
            band_vegetation.iter().zip(&band_detections).enumerate()
        {
            if vegetation_px == 0 {
                continue;
            }

            let (average_area, source, confidence) = if band_dets.is_empty() {
                match &stored {
                    Some(params) => (
                        params.avg_object_area_px,
                        CalibrationSource::FromStoredParameters,
                        STORED_PARAMS_CONFIDENCE,
                    ),
                    // any_local holds here: borrow the in-run average.
                    None => (
                        in_run_average,
                        CalibrationSource::FromDetections,
                        IN_RUN_FALLBACK_CONFIDENCE,
                    ),
                }
            } else {
                (
                    mean_bbox_area(band_dets),
                    CalibrationSource::FromDetections,
                    mean_confidence(band_dets),
                )
            };

            let effective_area = average_area * overlap_factor;
            if effective_area <= 0.0 {
                log::warn!(
                    "Skipping band {} of container {}: non-positive effective object area",
                    band_index,
                    container.id
                );
                continue;
            }

            let area_px = vegetation_px as f64;
            estimations.push(Estimation {
                container_id: container.id,
                band_index,
                estimated_count: (area_px / effective_area) as f32,
                area_px,
                area_cm2: cm2_per_px.map(|scale| area_px * scale),
                source,
                confidence,
            });
        }

        // Auto-calibration: any in-photo evidence improves the stored
        // record for later runs at this location. Best effort; a lost
        // store never invalidates this run's estimations.
        if any_local {
            let observation = ObservedDensity {
                avg_object_area_px: in_run_average,
                sample_count: detections.len() as u64,
                cm2_per_px,
            };
            if let Err(e) = record_observation(
                store,
                location_id,
                observation,
                self.default_overlap_factor,
                self.cas_retries,
            )
            .await
            {
                log::warn!("Auto-calibration write for '{}' failed: {}", location_id, e);
            }
        }

        tracing::debug!(
            container = %container.id,
            bands = estimations.len(),
            total = estimations.iter().map(|e| e.estimated_count).sum::<f32>(),
            "Density estimation complete"
        );
        Ok(EstimateOutcome::Estimations(estimations))
    }

    /// Vegetation pixel count per horizontal band
    fn band_vegetation_areas(&self, flags: &[bool], width: u32, height: u32) -> Vec<u64> {
        let mut bands = vec![0u64; self.band_count];
        for y in 0..height {
            let band = self.band_of(y as f32, height);
            let row_start = y as usize * width as usize;
            let row = &flags[row_start..row_start + width as usize];
            bands[band] += row.iter().filter(|&&f| f).count() as u64;
        }
        bands
    }

    /// Partition detections into bands by bbox center
    fn banded_detections<'a>(
        &self,
        detections: &'a [Detection],
        height: u32,
    ) -> Vec<Vec<&'a Detection>> {
        let mut bands: Vec<Vec<&Detection>> = vec![Vec::new(); self.band_count];
        for detection in detections {
            let (_, cy) = detection.bbox.center();
            bands[self.band_of(cy, height)].push(detection);
        }
        bands
    }

    /// Band index for a vertical position, clamped into range
    fn band_of(&self, y: f32, height: u32) -> usize {
        if height == 0 {
            return 0;
        }
        let band = (y / height as f32 * self.band_count as f32).floor();
        (band.max(0.0) as usize).min(self.band_count - 1)
    }
}

fn mean_bbox_area<D: std::borrow::Borrow<Detection>>(detections: &[D]) -> f64 {
    if detections.is_empty() {
        return 0.0;
    }
    detections
        .iter()
        .map(|d| f64::from(d.borrow().bbox.area()))
        .sum::<f64>()
        / detections.len() as f64
}

fn mean_confidence<D: std::borrow::Borrow<Detection>>(detections: &[D]) -> f32 {
    if detections.is_empty() {
        return 0.0;
    }
    detections
        .iter()
        .map(|d| d.borrow().confidence)
        .sum::<f32>()
        / detections.len() as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::density::calibration::{DensityParameters, InMemoryCalibrationStore};
    use crate::types::{BoundingBox, ContainerKind, ContainerMask, DetectorVariant};
    use chrono::Utc;
    use image::{Rgb, RgbImage};
    use uuid::Uuid;

    const LEAF_GREEN: Rgb<u8> = Rgb([40, 160, 60]);

    fn green_crop(width: u32, height: u32) -> DynamicImage {
        let mut img = RgbImage::new(width, height);
        for pixel in img.pixels_mut() {
            *pixel = LEAF_GREEN;
        }
        DynamicImage::ImageRgb8(img)
    }

    fn test_container(width: u32, height: u32) -> Container {
        Container {
            id: Uuid::new_v4(),
            photo_id: Uuid::new_v4(),
            kind: ContainerKind::Segment,
            bbox: BoundingBox::new(0.0, 0.0, width as f32, height as f32),
            mask: ContainerMask::filled(width, height),
            area_px: f64::from(width) * f64::from(height),
            area_cm2: None,
        }
    }

    fn detection(container: &Container, x: f32, y: f32, size: f32, confidence: f32) -> Detection {
        Detection {
            container_id: container.id,
            bbox: BoundingBox::new(x, y, size, size),
            confidence,
            variant: DetectorVariant::Tiled,
        }
    }

    fn stored_params(location: &str, avg: f64) -> DensityParameters {
        DensityParameters {
            location_id: location.to_string(),
            avg_object_area_px: avg,
            avg_object_area_cm2: None,
            overlap_factor: 0.85,
            sample_count: 30,
            last_updated: Utc::now(),
            auto_calibrated: false,
            version: 1,
        }
    }

    fn estimator() -> DensityEstimator {
        DensityEstimator::new(5, 0.85, 3)
    }

    #[tokio::test]
    async fn test_fully_detected_container_yields_empty_list() {
        let container = test_container(100, 100);
        let crop = green_crop(100, 100);
        // One detection covering the whole container: zero undetected area.
        let detections = vec![detection(&container, 0.0, 0.0, 100.0, 0.9)];
        let store = InMemoryCalibrationStore::new();

        let outcome = estimator()
            .estimate(&container, &crop, &detections, "loc", None, &store)
            .await
            .unwrap();
        assert_eq!(outcome, EstimateOutcome::Estimations(Vec::new()));
    }

    #[tokio::test]
    async fn test_no_evidence_signals_needs_calibration() {
        let container = test_container(100, 100);
        let crop = green_crop(100, 100);
        let store = InMemoryCalibrationStore::new();

        let outcome = estimator()
            .estimate(&container, &crop, &[], "loc", None, &store)
            .await
            .unwrap();
        assert_eq!(outcome, EstimateOutcome::NeedsCalibration);
    }

    #[tokio::test]
    async fn test_stored_parameters_fallback_without_detections() {
        let container = test_container(100, 100);
        let crop = green_crop(100, 100);
        let store =
            InMemoryCalibrationStore::with_records(vec![stored_params("loc", 400.0)]);

        let outcome = estimator()
            .estimate(&container, &crop, &[], "loc", Some(0.01), &store)
            .await
            .unwrap();
        let EstimateOutcome::Estimations(estimations) = outcome else {
            panic!("expected estimations");
        };
        assert_eq!(estimations.len(), 5);
        for estimation in &estimations {
            assert_eq!(estimation.source, CalibrationSource::FromStoredParameters);
            assert!((estimation.confidence - STORED_PARAMS_CONFIDENCE).abs() < f32::EPSILON);
            // 2000 veg px per band / (400 * 0.85)
            assert!((estimation.estimated_count - 2000.0 / 340.0).abs() < 0.01);
            assert!(estimation.area_cm2.is_some());
        }

        // No detections: stored record must not be auto-calibrated away.
        let after = store.get("loc").await.unwrap().unwrap();
        assert_eq!(after.version, 1);
        assert!(!after.auto_calibrated);
    }

    #[tokio::test]
    async fn test_band_average_within_observed_bounds() {
        let container = test_container(100, 500);
        let crop = green_crop(100, 500);
        // Band 0 covers rows 0..100; two detections with areas 100 and 400.
        let detections = vec![
            detection(&container, 10.0, 20.0, 10.0, 0.8),
            detection(&container, 50.0, 40.0, 20.0, 0.9),
        ];
        let store = InMemoryCalibrationStore::new();

        let outcome = estimator()
            .estimate(&container, &crop, &detections, "loc", None, &store)
            .await
            .unwrap();
        let EstimateOutcome::Estimations(estimations) = outcome else {
            panic!("expected estimations");
        };

        let band0 = estimations.iter().find(|e| e.band_index == 0).unwrap();
        // Recover the band's average object area from count = veg / (avg *
        // overlap) and check the sanity bound [min, max] of observed areas.
        let implied_average =
            band0.area_px / (f64::from(band0.estimated_count) * 0.85).max(f64::EPSILON);
        assert!(
            (100.0..=400.0).contains(&implied_average),
            "implied average {implied_average} outside observed bounds"
        );
    }

    #[tokio::test]
    async fn test_uniform_grid_uses_in_run_average_for_empty_bands() {
        // 1000x1000 container, 20 detections of 20x20 px in a 4x5 grid, no
        // stored calibration: row centers at y = 125, 375, 625, 875 leave
        // band 2 (rows 400..600) with no detections.
        let container = test_container(1000, 1000);
        let crop = green_crop(1000, 1000);
        let mut detections = Vec::new();
        for row in 0..4 {
            for col in 0..5 {
                let cx = (col as f32 + 0.5) * 200.0;
                let cy = (row as f32 + 0.5) * 250.0;
                detections.push(detection(&container, cx - 10.0, cy - 10.0, 20.0, 0.9));
            }
        }
        let store = InMemoryCalibrationStore::new();

        let outcome = estimator()
            .estimate(&container, &crop, &detections, "bay-3", None, &store)
            .await
            .unwrap();
        let EstimateOutcome::Estimations(estimations) = outcome else {
            panic!("grid with local evidence must not need calibration");
        };
        assert_eq!(estimations.len(), 5);

        let band2 = estimations.iter().find(|e| e.band_index == 2).unwrap();
        assert_eq!(band2.source, CalibrationSource::FromDetections);
        // Band 2 is all vegetation (200_000 px), average area 400 px²:
        // 200_000 / (400 * 0.85) ≈ 588.2.
        assert!((band2.estimated_count - 200_000.0 / 340.0).abs() < 0.5);

        // Bands with detections subtract the five 400 px² boxes.
        let band0 = estimations.iter().find(|e| e.band_index == 0).unwrap();
        assert_eq!(band0.source, CalibrationSource::FromDetections);
        assert!((band0.area_px - 198_000.0).abs() < f64::EPSILON);

        // Auto-calibration persisted the in-run average of 400 px².
        let stored = store.get("bay-3").await.unwrap().unwrap();
        assert!(stored.auto_calibrated);
        assert_eq!(stored.sample_count, 20);
        assert!((stored.avg_object_area_px - 400.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_auto_calibration_blends_with_existing_record() {
        let container = test_container(500, 500);
        let crop = green_crop(500, 500);
        // Single 30x30 detection: observed average 900 px².
        let detections = vec![detection(&container, 100.0, 100.0, 30.0, 0.9)];
        let store =
            InMemoryCalibrationStore::with_records(vec![stored_params("loc", 400.0)]);

        estimator()
            .estimate(&container, &crop, &detections, "loc", None, &store)
            .await
            .unwrap();

        let updated = store.get("loc").await.unwrap().unwrap();
        assert_eq!(updated.version, 2);
        assert!(updated.auto_calibrated);
        // Blend boundedness: result stays inside [400, 900].
        assert!(updated.avg_object_area_px > 400.0);
        assert!(updated.avg_object_area_px < 900.0);
    }
}
