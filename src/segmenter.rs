//! Container segmentation and classification
//!
//! Turns a raw segmentation probability map into typed [`Container`]s:
//! binarize, morphological open/close to drop speckle and seal pinholes,
//! border flood-fill hole filling, connected-component extraction, then
//! geometric classification into the four container kinds.

use crate::config::PipelineConfig;
use crate::error::Result;
use crate::inference::SegmentationOutput;
use crate::model_cache::InferenceModelCache;
use crate::types::{BoundingBox, Container, ContainerKind, ContainerMask};
use image::DynamicImage;
use std::sync::Arc;
use uuid::Uuid;

/// Components with a near-square footprint at or below this bbox area are
/// plug trays; above it they are germination trays.
const PLUG_MAX_BBOX_AREA: f64 = 160_000.0;

/// Minimum fill ratio (component area / bbox area) for a rigid container;
/// anything looser is an amorphous segment.
const RIGID_MIN_EXTENT: f64 = 0.80;
/// Fill ratio above which a near-square container counts as a tray grid
const GRID_MIN_EXTENT: f64 = 0.88;
/// Aspect ratio boundary between near-square grids and elongated crates
const SQUARE_MAX_ASPECT: f64 = 1.45;
/// Aspect ratio beyond which even a well-filled region is a bed segment
const CRATE_MAX_ASPECT: f64 = 3.2;

/// Classifies photo regions into typed containers
pub struct SegmentClassifier {
    cache: Arc<InferenceModelCache>,
    config: PipelineConfig,
}

impl SegmentClassifier {
    /// Create a classifier backed by the worker's model cache
    #[must_use]
    pub fn new(cache: Arc<InferenceModelCache>, config: PipelineConfig) -> Self {
        Self { cache, config }
    }

    /// Segment a photo into classified containers.
    ///
    /// An empty result is a valid outcome (no containers in frame), not an
    /// error; the coordinator maps it to `needs_attention`.
    ///
    /// # Errors
    /// - Segmentation model load or inference failures
    pub async fn classify(
        &self,
        photo_id: Uuid,
        photo: &DynamicImage,
        cm2_per_px: Option<f64>,
    ) -> Result<Vec<Container>> {
        let backend = self.cache.get_segmentation().await?;
        let output = backend.segment(photo)?;
        let containers = self.classify_output(photo_id, &output, cm2_per_px);
        log::info!(
            "Segmented photo {} into {} container(s)",
            photo_id,
            containers.len()
        );
        Ok(containers)
    }

    /// Post-process a segmentation output into containers (pure, testable)
    #[must_use]
    pub fn classify_output(
        &self,
        photo_id: Uuid,
        output: &SegmentationOutput,
        cm2_per_px: Option<f64>,
    ) -> Vec<Container> {
        let mut grid = binarize(output, self.config.mask_threshold);
        morphological_open(&mut grid);
        morphological_close(&mut grid);
        fill_holes(&mut grid);

        let mut containers = Vec::new();
        for component in connected_components(&grid) {
            if component.area < self.config.min_component_area {
                tracing::debug!(
                    area = component.area,
                    "Dropping sub-threshold mask component"
                );
                continue;
            }

            let kind = classify_component(&component);
            let mask = component.local_mask(&grid);
            let area_px = component.area as f64;
            containers.push(Container {
                id: Uuid::new_v4(),
                photo_id,
                kind,
                bbox: BoundingBox::new(
                    component.min_x as f32,
                    component.min_y as f32,
                    component.width() as f32,
                    component.height() as f32,
                ),
                mask,
                area_px,
                area_cm2: cm2_per_px.map(|scale| area_px * scale),
            });
        }

        containers
    }
}

/// Binary pixel grid used during mask post-processing
struct Grid {
    width: usize,
    height: usize,
    data: Vec<u8>,
}

impl Grid {
    fn get(&self, x: usize, y: usize) -> u8 {
        self.data[y * self.width + x]
    }
}

fn binarize(output: &SegmentationOutput, threshold: f32) -> Grid {
    Grid {
        width: output.width as usize,
        height: output.height as usize,
        data: output
            .probabilities
            .iter()
            .map(|&p| u8::from(p >= threshold) * 255)
            .collect(),
    }
}

/// 3x3 cross-kernel erosion
fn erode(grid: &Grid) -> Vec<u8> {
    let (w, h) = (grid.width, grid.height);
    let mut out = vec![0u8; w * h];
    for y in 0..h {
        for x in 0..w {
            if grid.get(x, y) == 0 {
                continue;
            }
            let up = y == 0 || grid.get(x, y - 1) > 0;
            let down = y + 1 >= h || grid.get(x, y + 1) > 0;
            let left = x == 0 || grid.get(x - 1, y) > 0;
            let right = x + 1 >= w || grid.get(x + 1, y) > 0;
            if up && down && left && right {
                out[y * w + x] = 255;
            }
        }
    }
    out
}

/// 3x3 cross-kernel dilation
fn dilate(grid: &Grid) -> Vec<u8> {
    let (w, h) = (grid.width, grid.height);
    let mut out = vec![0u8; w * h];
    for y in 0..h {
        for x in 0..w {
            let any = grid.get(x, y) > 0
                || (y > 0 && grid.get(x, y - 1) > 0)
                || (y + 1 < h && grid.get(x, y + 1) > 0)
                || (x > 0 && grid.get(x - 1, y) > 0)
                || (x + 1 < w && grid.get(x + 1, y) > 0);
            if any {
                out[y * w + x] = 255;
            }
        }
    }
    out
}

/// Erosion then dilation: removes speckle noise
fn morphological_open(grid: &mut Grid) {
    grid.data = erode(grid);
    grid.data = dilate(grid);
}

/// Dilation then erosion: seals pinholes and hairline gaps
fn morphological_close(grid: &mut Grid) {
    grid.data = dilate(grid);
    grid.data = erode(grid);
}

/// Fill enclosed holes: background connected to the border stays background,
/// everything else becomes foreground.
fn fill_holes(grid: &mut Grid) {
    let (w, h) = (grid.width, grid.height);
    if w == 0 || h == 0 {
        return;
    }

    let mut outside = vec![false; w * h];
    let mut stack = Vec::new();
    for x in 0..w {
        for y in [0, h - 1] {
            if grid.get(x, y) == 0 && !outside[y * w + x] {
                outside[y * w + x] = true;
                stack.push((x, y));
            }
        }
    }
    for y in 0..h {
        for x in [0, w - 1] {
            if grid.get(x, y) == 0 && !outside[y * w + x] {
                outside[y * w + x] = true;
                stack.push((x, y));
            }
        }
    }

    while let Some((x, y)) = stack.pop() {
        let visit = |nx: usize, ny: usize, outside: &mut Vec<bool>, stack: &mut Vec<(usize, usize)>| {
            if grid.get(nx, ny) == 0 && !outside[ny * w + nx] {
                outside[ny * w + nx] = true;
                stack.push((nx, ny));
            }
        };
        if x > 0 {
            visit(x - 1, y, &mut outside, &mut stack);
        }
        if x + 1 < w {
            visit(x + 1, y, &mut outside, &mut stack);
        }
        if y > 0 {
            visit(x, y - 1, &mut outside, &mut stack);
        }
        if y + 1 < h {
            visit(x, y + 1, &mut outside, &mut stack);
        }
    }

    for idx in 0..w * h {
        if grid.data[idx] == 0 && !outside[idx] {
            grid.data[idx] = 255;
        }
    }
}

/// One 4-connected foreground component
struct Component {
    min_x: usize,
    min_y: usize,
    max_x: usize,
    max_y: usize,
    area: u64,
    /// Pixel indices into the source grid
    pixels: Vec<usize>,
}

impl Component {
    fn width(&self) -> usize {
        self.max_x - self.min_x + 1
    }

    fn height(&self) -> usize {
        self.max_y - self.min_y + 1
    }

    fn bbox_area(&self) -> f64 {
        (self.width() * self.height()) as f64
    }

    /// Extract the component as a bbox-local ContainerMask
    fn local_mask(&self, grid: &Grid) -> ContainerMask {
        let (w, h) = (self.width(), self.height());
        let mut data = vec![0u8; w * h];
        for &idx in &self.pixels {
            let x = idx % grid.width;
            let y = idx / grid.width;
            data[(y - self.min_y) * w + (x - self.min_x)] = 255;
        }
        ContainerMask {
            width: w as u32,
            height: h as u32,
            data,
        }
    }
}

fn connected_components(grid: &Grid) -> Vec<Component> {
    let (w, h) = (grid.width, grid.height);
    let mut visited = vec![false; w * h];
    let mut components = Vec::new();

    for start in 0..w * h {
        if visited[start] || grid.data[start] == 0 {
            continue;
        }

        let mut component = Component {
            min_x: usize::MAX,
            min_y: usize::MAX,
            max_x: 0,
            max_y: 0,
            area: 0,
            pixels: Vec::new(),
        };
        let mut stack = vec![start];
        visited[start] = true;

        while let Some(idx) = stack.pop() {
            let x = idx % w;
            let y = idx / w;
            component.min_x = component.min_x.min(x);
            component.min_y = component.min_y.min(y);
            component.max_x = component.max_x.max(x);
            component.max_y = component.max_y.max(y);
            component.area += 1;
            component.pixels.push(idx);

            let neighbors = [
                (x > 0).then(|| idx - 1),
                (x + 1 < w).then(|| idx + 1),
                (y > 0).then(|| idx - w),
                (y + 1 < h).then(|| idx + w),
            ];
            for neighbor in neighbors.into_iter().flatten() {
                if !visited[neighbor] && grid.data[neighbor] > 0 {
                    visited[neighbor] = true;
                    stack.push(neighbor);
                }
            }
        }

        components.push(component);
    }

    components
}

/// Geometric kind heuristics: fill ratio and aspect separate amorphous bed
/// segments from rigid containers; footprint separates plug trays from
/// germination trays.
fn classify_component(component: &Component) -> ContainerKind {
    let extent = component.area as f64 / component.bbox_area();
    let (long, short) = {
        let (w, h) = (component.width() as f64, component.height() as f64);
        (w.max(h), w.min(h).max(1.0))
    };
    let aspect = long / short;

    if extent < RIGID_MIN_EXTENT || aspect > CRATE_MAX_ASPECT {
        return ContainerKind::Segment;
    }
    if aspect <= SQUARE_MAX_ASPECT {
        if extent >= GRID_MIN_EXTENT {
            if component.bbox_area() <= PLUG_MAX_BBOX_AREA {
                return ContainerKind::Plug;
            }
            return ContainerKind::Tray;
        }
        return ContainerKind::Crate;
    }
    ContainerKind::Crate
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::test_utils::MockSegmentationBackend;
    use crate::inference::ModelFactory;

    struct SegOnlyFactory(u32, u32, Vec<(u32, u32, u32, u32)>);

    impl ModelFactory for SegOnlyFactory {
        fn load_segmentation(
            &self,
            _config: &PipelineConfig,
        ) -> Result<Arc<dyn crate::inference::SegmentationBackend>> {
            Ok(Arc::new(MockSegmentationBackend::with_foreground_rects(
                self.0, self.1, &self.2,
            )))
        }

        fn load_detection(
            &self,
            _config: &PipelineConfig,
        ) -> Result<Arc<dyn crate::inference::DetectionBackend>> {
            Ok(Arc::new(
                crate::backends::test_utils::MockDetectionBackend::empty(),
            ))
        }
    }

    fn classifier_with_rects(
        width: u32,
        height: u32,
        rects: Vec<(u32, u32, u32, u32)>,
        min_area: u64,
    ) -> SegmentClassifier {
        let config = PipelineConfig::builder()
            .min_component_area(min_area)
            .build()
            .unwrap();
        let cache = Arc::new(InferenceModelCache::new(
            config.clone(),
            Arc::new(SegOnlyFactory(width, height, rects)),
        ));
        SegmentClassifier::new(cache, config)
    }

    fn grid_from(width: usize, height: usize, set: &[(usize, usize)]) -> Grid {
        let mut data = vec![0u8; width * height];
        for &(x, y) in set {
            data[y * width + x] = 255;
        }
        Grid {
            width,
            height,
            data,
        }
    }

    #[tokio::test]
    async fn test_classify_empty_photo_returns_empty_list() {
        let classifier = classifier_with_rects(64, 64, vec![], 100);
        let photo = DynamicImage::new_rgb8(64, 64);
        let containers = classifier
            .classify(Uuid::new_v4(), &photo, None)
            .await
            .unwrap();
        assert!(containers.is_empty());
    }

    #[tokio::test]
    async fn test_classify_square_grid_as_plug() {
        // 100x100 solid square: extent 1.0, aspect 1.0, bbox area 10k.
        let classifier = classifier_with_rects(256, 256, vec![(10, 10, 100, 100)], 1000);
        let photo = DynamicImage::new_rgb8(256, 256);
        let containers = classifier
            .classify(Uuid::new_v4(), &photo, Some(0.01))
            .await
            .unwrap();
        assert_eq!(containers.len(), 1);
        assert_eq!(containers[0].kind, ContainerKind::Plug);
        assert!(containers[0].area_cm2.is_some());
    }

    #[tokio::test]
    async fn test_classify_elongated_rect_as_crate() {
        let classifier = classifier_with_rects(512, 256, vec![(10, 10, 300, 120)], 1000);
        let photo = DynamicImage::new_rgb8(512, 256);
        let containers = classifier
            .classify(Uuid::new_v4(), &photo, None)
            .await
            .unwrap();
        assert_eq!(containers.len(), 1);
        assert_eq!(containers[0].kind, ContainerKind::Crate);
    }

    #[tokio::test]
    async fn test_classify_large_square_as_tray() {
        // 500x500 solid square exceeds the plug footprint bound.
        let classifier = classifier_with_rects(768, 768, vec![(10, 10, 500, 500)], 1000);
        let photo = DynamicImage::new_rgb8(768, 768);
        let containers = classifier
            .classify(Uuid::new_v4(), &photo, None)
            .await
            .unwrap();
        assert_eq!(containers.len(), 1);
        assert_eq!(containers[0].kind, ContainerKind::Tray);
    }

    #[tokio::test]
    async fn test_two_disjoint_regions_yield_two_containers() {
        let classifier = classifier_with_rects(
            512,
            512,
            vec![(10, 10, 100, 100), (300, 300, 150, 80)],
            1000,
        );
        let photo = DynamicImage::new_rgb8(512, 512);
        let containers = classifier
            .classify(Uuid::new_v4(), &photo, None)
            .await
            .unwrap();
        assert_eq!(containers.len(), 2);
    }

    #[test]
    fn test_fill_holes_closes_enclosed_background() {
        // A 5x5 ring with a hole in the middle.
        let mut set = Vec::new();
        for i in 1..=5 {
            set.push((i, 1));
            set.push((i, 5));
            set.push((1, i));
            set.push((5, i));
        }
        for i in 2..=4 {
            set.push((i, 2));
            set.push((i, 4));
            set.push((2, i));
            set.push((4, i));
        }
        // Center (3,3) left unset.
        let mut grid = grid_from(8, 8, &set);
        assert_eq!(grid.get(3, 3), 0);
        fill_holes(&mut grid);
        assert_eq!(grid.get(3, 3), 255);
        // Outside background untouched.
        assert_eq!(grid.get(7, 7), 0);
    }

    #[test]
    fn test_open_removes_speckle() {
        let mut grid = grid_from(8, 8, &[(4, 4)]);
        morphological_open(&mut grid);
        assert_eq!(grid.get(4, 4), 0);
    }

    #[test]
    fn test_component_local_mask_offsets() {
        let grid = grid_from(8, 8, &[(3, 2), (4, 2), (3, 3), (4, 3)]);
        let components = connected_components(&grid);
        assert_eq!(components.len(), 1);
        let mask = components[0].local_mask(&grid);
        assert_eq!(mask.width, 2);
        assert_eq!(mask.height, 2);
        assert_eq!(mask.area_px(), 4);
        assert!(mask.contains(0, 0));
    }
}
