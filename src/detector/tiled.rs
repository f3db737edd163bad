//! Tiled detection for large containers
//!
//! Large bed segments at full photo resolution overwhelm a fixed-input
//! detector, so the container is sliced into overlapping tiles, detection
//! runs per tile, tile-local boxes are remapped into container space, and
//! the overlap duplicates are merged with an IoU suppression pass.

use crate::config::PipelineConfig;
use crate::error::Result;
use crate::inference::DetectionBackend;
use crate::types::{Container, Detection, DetectorVariant};
use image::DynamicImage;

/// One tile of a container crop, in container-local pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tile {
    /// Tile left edge
    pub x: u32,
    /// Tile top edge
    pub y: u32,
    /// Tile width
    pub width: u32,
    /// Tile height
    pub height: u32,
}

/// Detector that slices, detects per tile, remaps, and merges
pub struct TiledDetector {
    tile_size: u32,
    overlap: f32,
    iou_threshold: f32,
    confidence_threshold: f32,
}

impl TiledDetector {
    /// Create a detector with explicit tuning
    #[must_use]
    pub fn new(tile_size: u32, overlap: f32, iou_threshold: f32, confidence_threshold: f32) -> Self {
        Self {
            tile_size,
            overlap,
            iou_threshold,
            confidence_threshold,
        }
    }

    /// Create a detector from the pipeline configuration
    #[must_use]
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(
            config.tile_size,
            config.tile_overlap,
            config.merge_iou_threshold,
            config.confidence_threshold,
        )
    }

    /// Detect plants across the container crop
    ///
    /// # Errors
    /// - Detection backend inference failures (any tile fails the container)
    pub fn detect(
        &self,
        container: &Container,
        crop: &DynamicImage,
        backend: &dyn DetectionBackend,
    ) -> Result<Vec<Detection>> {
        let tiles = self.tile_grid(crop.width(), crop.height());
        tracing::debug!(
            container = %container.id,
            tiles = tiles.len(),
            "Running tiled detection"
        );

        let mut detections = Vec::new();
        for tile in &tiles {
            let tile_crop = crop.crop_imm(tile.x, tile.y, tile.width, tile.height);
            for raw in backend.detect(&tile_crop)? {
                if raw.confidence < self.confidence_threshold {
                    continue;
                }
                detections.push(Detection {
                    container_id: container.id,
                    bbox: raw.bbox.translate(tile.x as f32, tile.y as f32),
                    confidence: raw.confidence,
                    variant: DetectorVariant::Tiled,
                });
            }
        }

        let merged = self.merge(detections, &tiles);
        log::debug!(
            "Tiled detection for container {}: {} detection(s) after merge",
            container.id,
            merged.len()
        );
        Ok(merged)
    }

    /// Compute the overlapping tile grid for a crop.
    ///
    /// The stride is `tile_size * (1 - overlap)`; the last row/column shifts
    /// inward so tiles never extend past the image edge and coverage has no
    /// gaps. Images smaller than one tile yield a single full-image tile.
    #[must_use]
    pub fn tile_grid(&self, width: u32, height: u32) -> Vec<Tile> {
        let xs = Self::axis_positions(width, self.tile_size, self.overlap);
        let ys = Self::axis_positions(height, self.tile_size, self.overlap);

        let mut tiles = Vec::with_capacity(xs.len() * ys.len());
        for &y in &ys {
            for &x in &xs {
                tiles.push(Tile {
                    x,
                    y,
                    width: self.tile_size.min(width),
                    height: self.tile_size.min(height),
                });
            }
        }
        tiles
    }

    fn axis_positions(extent: u32, tile: u32, overlap: f32) -> Vec<u32> {
        if extent <= tile {
            return vec![0];
        }
        let stride = ((tile as f32 * (1.0 - overlap)).floor() as u32).max(1);
        let last = extent - tile;

        let mut positions = Vec::new();
        let mut pos = 0u32;
        while pos < last {
            positions.push(pos);
            pos = pos.saturating_add(stride);
        }
        positions.push(last);
        positions
    }

    /// Merge overlap duplicates with confidence-ranked IoU suppression.
    ///
    /// Candidates sort by confidence descending; equal-confidence pairs
    /// prefer the box whose center is farther from any interior tile
    /// boundary (overlap-region artifacts hug the seams). Running the merge
    /// again over its own output changes nothing.
    #[must_use]
    pub fn merge(&self, mut detections: Vec<Detection>, tiles: &[Tile]) -> Vec<Detection> {
        if detections.is_empty() {
            return detections;
        }

        let boundaries = interior_boundaries(tiles);
        detections.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    let da = boundaries.distance(a.bbox.center());
                    let db = boundaries.distance(b.bbox.center());
                    db.partial_cmp(&da).unwrap_or(std::cmp::Ordering::Equal)
                })
        });

        let mut kept: Vec<Detection> = Vec::with_capacity(detections.len());
        for candidate in detections {
            let duplicate = kept
                .iter()
                .any(|existing| existing.bbox.iou(&candidate.bbox) > self.iou_threshold);
            if !duplicate {
                kept.push(candidate);
            }
        }
        kept
    }
}

/// Interior tile boundary lines (seams), excluding the outer image edges
struct BoundaryLines {
    xs: Vec<f32>,
    ys: Vec<f32>,
}

impl BoundaryLines {
    /// Distance from a point to the nearest seam; infinity with no seams
    fn distance(&self, (cx, cy): (f32, f32)) -> f32 {
        let dx = self
            .xs
            .iter()
            .map(|&x| (cx - x).abs())
            .fold(f32::INFINITY, f32::min);
        let dy = self
            .ys
            .iter()
            .map(|&y| (cy - y).abs())
            .fold(f32::INFINITY, f32::min);
        dx.min(dy)
    }
}

fn interior_boundaries(tiles: &[Tile]) -> BoundaryLines {
    let max_x = tiles.iter().map(|t| t.x + t.width).max().unwrap_or(0);
    let max_y = tiles.iter().map(|t| t.y + t.height).max().unwrap_or(0);

    let mut xs = Vec::new();
    let mut ys = Vec::new();
    for tile in tiles {
        for edge in [tile.x, tile.x + tile.width] {
            if edge != 0 && edge != max_x {
                xs.push(edge as f32);
            }
        }
        for edge in [tile.y, tile.y + tile.height] {
            if edge != 0 && edge != max_y {
                ys.push(edge as f32);
            }
        }
    }
    xs.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    xs.dedup();
    ys.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    ys.dedup();
    BoundaryLines { xs, ys }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::test_utils::{raw_detection, MockDetectionBackend};
    use crate::types::{BoundingBox, ContainerKind, ContainerMask};
    use uuid::Uuid;

    fn detector() -> TiledDetector {
        TiledDetector::new(640, 0.2, 0.45, 0.25)
    }

    fn detection(x: f32, y: f32, size: f32, confidence: f32) -> Detection {
        Detection {
            container_id: Uuid::nil(),
            bbox: BoundingBox::new(x, y, size, size),
            confidence,
            variant: DetectorVariant::Tiled,
        }
    }

    #[test]
    fn test_tile_grid_single_tile_for_small_image() {
        let tiles = detector().tile_grid(500, 400);
        assert_eq!(tiles.len(), 1);
        assert_eq!(tiles[0], Tile { x: 0, y: 0, width: 500, height: 400 });
    }

    #[test]
    fn test_tile_grid_covers_image_with_overlap() {
        let detector = detector();
        let (width, height) = (2000u32, 1500u32);
        let tiles = detector.tile_grid(width, height);

        // Stride 512: x positions 0, 512, 1024, 1360; y positions 0, 512, 860.
        assert_eq!(tiles.len(), 12);
        for tile in &tiles {
            assert!(tile.x + tile.width <= width);
            assert!(tile.y + tile.height <= height);
        }
        // Right and bottom edges are covered by the shifted final tiles.
        assert!(tiles.iter().any(|t| t.x + t.width == width));
        assert!(tiles.iter().any(|t| t.y + t.height == height));
        // Consecutive tiles overlap by the configured fraction.
        assert!(tiles[1].x < tiles[0].x + tiles[0].width);
    }

    #[test]
    fn test_merge_suppresses_overlap_duplicates() {
        let detector = detector();
        let tiles = detector.tile_grid(1280, 640);
        // The same plant seen by two adjacent tiles, slightly offset.
        let detections = vec![
            detection(500.0, 100.0, 40.0, 0.9),
            detection(502.0, 101.0, 40.0, 0.7),
        ];
        let merged = detector.merge(detections, &tiles);
        assert_eq!(merged.len(), 1);
        assert!((merged[0].confidence - 0.9).abs() < f32::EPSILON);
    }

    #[test]
    fn test_merge_keeps_disjoint_detections() {
        let detector = detector();
        let tiles = detector.tile_grid(1280, 640);
        let detections = vec![
            detection(100.0, 100.0, 40.0, 0.9),
            detection(600.0, 300.0, 40.0, 0.8),
            detection(1000.0, 500.0, 40.0, 0.7),
        ];
        let merged = detector.merge(detections, &tiles);
        assert_eq!(merged.len(), 3);
    }

    #[test]
    fn test_merge_is_idempotent() {
        let detector = detector();
        let tiles = detector.tile_grid(2000, 1500);
        let detections = vec![
            detection(500.0, 100.0, 40.0, 0.9),
            detection(503.0, 102.0, 40.0, 0.8),
            detection(900.0, 400.0, 35.0, 0.6),
            detection(902.0, 401.0, 35.0, 0.6),
            detection(1400.0, 900.0, 30.0, 0.5),
        ];
        let merged_once = detector.merge(detections, &tiles);
        let merged_twice = detector.merge(merged_once.clone(), &tiles);
        assert_eq!(merged_once, merged_twice);
    }

    #[test]
    fn test_equal_confidence_tie_break_prefers_seam_distance() {
        let detector = detector();
        // Two tiles with a seam at x = 512..640 overlap band; interior
        // boundaries at x = 512 and x = 640.
        let tiles = detector.tile_grid(1152, 640);
        // Same confidence; first box center hugs the seam at x = 512,
        // the second sits a little farther inside the neighboring tile.
        let near_seam = detection(501.0, 100.0, 20.0, 0.8);
        let far_from_seam = detection(506.0, 100.0, 20.0, 0.8);
        assert!(near_seam.bbox.iou(&far_from_seam.bbox) > 0.45);
        let merged = detector.merge(vec![near_seam, far_from_seam.clone()], &tiles);
        assert_eq!(merged.len(), 1);
        // Center x = 516 is farther from the 512 seam than center x = 511.
        assert_eq!(merged[0].bbox, far_from_seam.bbox);
    }

    #[test]
    fn test_detect_remaps_tile_coordinates() {
        let detector = TiledDetector::new(64, 0.0, 0.45, 0.25);
        let container = Container {
            id: Uuid::new_v4(),
            photo_id: Uuid::new_v4(),
            kind: ContainerKind::Segment,
            bbox: BoundingBox::new(0.0, 0.0, 128.0, 64.0),
            mask: ContainerMask::filled(128, 64),
            area_px: 128.0 * 64.0,
            area_cm2: None,
        };
        let crop = DynamicImage::new_rgb8(128, 64);
        // Every tile reports one detection at its local (10, 10).
        let backend = MockDetectionBackend::fixed(vec![raw_detection(10.0, 10.0, 8.0, 8.0, 0.9)]);

        let detections = detector.detect(&container, &crop, &backend).unwrap();
        assert_eq!(detections.len(), 2);
        let mut xs: Vec<f32> = detections.iter().map(|d| d.bbox.x).collect();
        xs.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(xs, vec![10.0, 74.0]);
        assert!(detections
            .iter()
            .all(|d| d.variant == DetectorVariant::Tiled));
    }

    #[test]
    fn test_detect_filters_low_confidence() {
        let detector = TiledDetector::new(64, 0.0, 0.45, 0.5);
        let container = Container {
            id: Uuid::new_v4(),
            photo_id: Uuid::new_v4(),
            kind: ContainerKind::Segment,
            bbox: BoundingBox::new(0.0, 0.0, 64.0, 64.0),
            mask: ContainerMask::filled(64, 64),
            area_px: 64.0 * 64.0,
            area_cm2: None,
        };
        let crop = DynamicImage::new_rgb8(64, 64);
        let backend = MockDetectionBackend::fixed(vec![
            raw_detection(10.0, 10.0, 8.0, 8.0, 0.4),
            raw_detection(30.0, 30.0, 8.0, 8.0, 0.8),
        ]);
        let detections = detector.detect(&container, &crop, &backend).unwrap();
        assert_eq!(detections.len(), 1);
        assert!((detections[0].confidence - 0.8).abs() < f32::EPSILON);
    }
}
