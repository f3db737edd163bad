//! Detection overlay artifact rendering
//!
//! After aggregation the coordinator uploads a reviewable overlay: the
//! source photo with container outlines and detection boxes drawn in.
//! Rendering never influences counts; it only feeds the storage artifact.

use crate::error::{PlantCountError, Result};
use crate::types::{Container, Detection, DetectorVariant};
use image::{DynamicImage, Rgba};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;
use std::io::Cursor;

/// Container outline color
const CONTAINER_COLOR: Rgba<u8> = Rgba([66, 135, 245, 255]);
/// Tiled detection box color
const TILED_COLOR: Rgba<u8> = Rgba([245, 166, 35, 255]);
/// Direct detection box color
const DIRECT_COLOR: Rgba<u8> = Rgba([126, 211, 33, 255]);

/// One container with its accepted detections (container-local coordinates)
pub struct OverlayItem<'a> {
    /// The container to outline
    pub container: &'a Container,
    /// Detections to draw inside it
    pub detections: &'a [Detection],
}

/// Render the overlay and encode it as PNG bytes
///
/// # Errors
/// - PNG encoding failures
pub fn render_overlay(photo: &DynamicImage, items: &[OverlayItem<'_>]) -> Result<Vec<u8>> {
    let mut canvas = photo.to_rgba8();

    for item in items {
        let container_rect = clamped_rect(
            item.container.bbox.x,
            item.container.bbox.y,
            item.container.bbox.width,
            item.container.bbox.height,
        );
        if let Some(rect) = container_rect {
            draw_hollow_rect_mut(&mut canvas, rect, CONTAINER_COLOR);
        }

        for detection in item.detections {
            let color = match detection.variant {
                DetectorVariant::Tiled => TILED_COLOR,
                DetectorVariant::Direct => DIRECT_COLOR,
            };
            // Detection boxes are container-local; shift into photo space.
            let rect = clamped_rect(
                item.container.bbox.x + detection.bbox.x,
                item.container.bbox.y + detection.bbox.y,
                detection.bbox.width,
                detection.bbox.height,
            );
            if let Some(rect) = rect {
                draw_hollow_rect_mut(&mut canvas, rect, color);
            }
        }
    }

    let mut bytes = Vec::new();
    DynamicImage::ImageRgba8(canvas)
        .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
        .map_err(|e| PlantCountError::processing(format!("Failed to encode overlay PNG: {e}")))?;
    Ok(bytes)
}

fn clamped_rect(x: f32, y: f32, width: f32, height: f32) -> Option<Rect> {
    let w = width.round() as u32;
    let h = height.round() as u32;
    if w == 0 || h == 0 {
        return None;
    }
    Some(Rect::at(x.round() as i32, y.round() as i32).of_size(w, h))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BoundingBox, ContainerKind, ContainerMask};
    use uuid::Uuid;

    #[test]
    fn test_overlay_encodes_png() {
        let photo = DynamicImage::new_rgb8(64, 64);
        let container = Container {
            id: Uuid::new_v4(),
            photo_id: Uuid::new_v4(),
            kind: ContainerKind::Crate,
            bbox: BoundingBox::new(8.0, 8.0, 40.0, 30.0),
            mask: ContainerMask::filled(40, 30),
            area_px: 1200.0,
            area_cm2: None,
        };
        let detections = vec![Detection {
            container_id: container.id,
            bbox: BoundingBox::new(4.0, 4.0, 10.0, 10.0),
            confidence: 0.9,
            variant: DetectorVariant::Direct,
        }];

        let bytes = render_overlay(
            &photo,
            &[OverlayItem {
                container: &container,
                detections: &detections,
            }],
        )
        .unwrap();

        // PNG magic header.
        assert_eq!(&bytes[..8], &[0x89, b'P', b'N', b'G', b'\r', b'\n', 0x1A, b'\n']);
        let decoded = image::load_from_memory(&bytes).unwrap();
        assert_eq!(decoded.width(), 64);
    }

    #[test]
    fn test_zero_size_boxes_are_skipped() {
        let photo = DynamicImage::new_rgb8(16, 16);
        let container = Container {
            id: Uuid::new_v4(),
            photo_id: Uuid::new_v4(),
            kind: ContainerKind::Plug,
            bbox: BoundingBox::new(0.0, 0.0, 0.0, 0.0),
            mask: ContainerMask::filled(1, 1),
            area_px: 0.0,
            area_cm2: None,
        };
        assert!(render_overlay(
            &photo,
            &[OverlayItem {
                container: &container,
                detections: &[],
            }],
        )
        .is_ok());
    }
}
