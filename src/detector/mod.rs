//! Plant detection over classified containers
//!
//! Two detectors share one detection backend: [`tiled::TiledDetector`] for
//! large containers and [`direct::DirectDetector`] for bounded ones.
//! Selection is a pure function of the container's kind and pixel area.

pub mod direct;
pub mod tiled;

use crate::config::PipelineConfig;
use crate::error::Result;
use crate::inference::DetectionBackend;
use crate::types::{Container, Detection, DetectorVariant};
use image::DynamicImage;

pub use direct::DirectDetector;
pub use tiled::TiledDetector;

/// Pick the detector variant for a container.
///
/// Tiling pays off only above the area threshold; crates and trays are
/// bounded and stay below it in practice, so they take the direct path.
#[must_use]
pub fn select_detector(container: &Container, config: &PipelineConfig) -> DetectorVariant {
    if container.area_px >= config.tiling_area_threshold {
        DetectorVariant::Tiled
    } else {
        DetectorVariant::Direct
    }
}

/// Crop the container's bounding box out of the photo
#[must_use]
pub fn crop_container(photo: &DynamicImage, container: &Container) -> DynamicImage {
    let x = container.bbox.x.max(0.0) as u32;
    let y = container.bbox.y.max(0.0) as u32;
    let width = (container.bbox.width as u32).min(photo.width().saturating_sub(x)).max(1);
    let height = (container.bbox.height as u32)
        .min(photo.height().saturating_sub(y))
        .max(1);
    photo.crop_imm(x, y, width, height)
}

/// Run the selected detector over one container crop
///
/// # Errors
/// - Detection backend inference failures
pub fn run_detection(
    container: &Container,
    crop: &DynamicImage,
    backend: &dyn DetectionBackend,
    config: &PipelineConfig,
) -> Result<Vec<Detection>> {
    match select_detector(container, config) {
        DetectorVariant::Tiled => TiledDetector::from_config(config).detect(container, crop, backend),
        DetectorVariant::Direct => {
            DirectDetector::from_config(config).detect(container, crop, backend)
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BoundingBox, ContainerKind, ContainerMask};
    use uuid::Uuid;

    fn container_with_area(kind: ContainerKind, width: u32, height: u32) -> Container {
        Container {
            id: Uuid::new_v4(),
            photo_id: Uuid::new_v4(),
            kind,
            bbox: BoundingBox::new(0.0, 0.0, width as f32, height as f32),
            mask: ContainerMask::filled(width, height),
            area_px: f64::from(width) * f64::from(height),
            area_cm2: None,
        }
    }

    #[test]
    fn test_large_segment_uses_tiled() {
        let config = PipelineConfig::default();
        let container = container_with_area(ContainerKind::Segment, 2048, 2048);
        assert_eq!(
            select_detector(&container, &config),
            DetectorVariant::Tiled
        );
    }

    #[test]
    fn test_small_containers_use_direct() {
        let config = PipelineConfig::default();
        for kind in [
            ContainerKind::Crate,
            ContainerKind::Tray,
            ContainerKind::Plug,
            ContainerKind::Segment,
        ] {
            let container = container_with_area(kind, 400, 400);
            assert_eq!(
                select_detector(&container, &config),
                DetectorVariant::Direct,
                "{kind} below the threshold must go direct"
            );
        }
    }

    #[test]
    fn test_crop_clamps_to_photo_bounds() {
        let photo = DynamicImage::new_rgb8(100, 100);
        let mut container = container_with_area(ContainerKind::Crate, 60, 60);
        container.bbox = BoundingBox::new(80.0, 80.0, 60.0, 60.0);
        let crop = crop_container(&photo, &container);
        assert_eq!(crop.width(), 20);
        assert_eq!(crop.height(), 20);
    }
}
