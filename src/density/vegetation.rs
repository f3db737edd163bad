//! Hue-based vegetation filtering
//!
//! The density estimator only counts pixels that plausibly belong to plant
//! material. Bare substrate, concrete floor, and tray plastic inside the
//! container mask would otherwise inflate area-based counts.

use crate::types::{ContainerMask, Detection};
use image::DynamicImage;

/// Hue range (degrees) treated as plant material
const VEGETATION_HUE: std::ops::RangeInclusive<f32> = 60.0..=180.0;
/// Minimum saturation; grays and washed-out highlights are excluded
const MIN_SATURATION: f32 = 0.15;
/// Minimum value; near-black shadow pixels are excluded
const MIN_VALUE: f32 = 0.10;

/// Convert an RGB pixel to HSV. Hue in degrees [0, 360), saturation and
/// value in [0, 1].
#[must_use]
pub fn rgb_to_hsv(r: u8, g: u8, b: u8) -> (f32, f32, f32) {
    let r = f32::from(r) / 255.0;
    let g = f32::from(g) / 255.0;
    let b = f32::from(b) / 255.0;

    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;

    let hue = if delta == 0.0 {
        0.0
    } else if (max - r).abs() < f32::EPSILON {
        60.0 * (((g - b) / delta).rem_euclid(6.0))
    } else if (max - g).abs() < f32::EPSILON {
        60.0 * ((b - r) / delta + 2.0)
    } else {
        60.0 * ((r - g) / delta + 4.0)
    };

    let saturation = if max == 0.0 { 0.0 } else { delta / max };
    (hue, saturation, max)
}

/// Whether a pixel reads as plant material
#[must_use]
pub fn is_vegetation(r: u8, g: u8, b: u8) -> bool {
    let (hue, saturation, value) = rgb_to_hsv(r, g, b);
    VEGETATION_HUE.contains(&hue) && saturation >= MIN_SATURATION && value >= MIN_VALUE
}

/// Per-pixel vegetation flags for the container's undetected area.
///
/// A pixel is flagged when it lies inside the container mask, outside every
/// detection bounding box, and passes the vegetation filter. `crop` and
/// `mask` are both container-bbox-local and must share dimensions.
#[must_use]
pub fn undetected_vegetation(
    crop: &DynamicImage,
    mask: &ContainerMask,
    detections: &[Detection],
) -> Vec<bool> {
    let width = mask.width.min(crop.width());
    let height = mask.height.min(crop.height());
    let rgb = crop.to_rgb8();

    // Rasterize detection boxes once instead of testing every box per pixel.
    let mut detected = vec![false; mask.width as usize * mask.height as usize];
    for detection in detections {
        let x0 = detection.bbox.x.max(0.0) as u32;
        let y0 = detection.bbox.y.max(0.0) as u32;
        let x1 = ((detection.bbox.x + detection.bbox.width).ceil() as u32).min(mask.width);
        let y1 = ((detection.bbox.y + detection.bbox.height).ceil() as u32).min(mask.height);
        for y in y0..y1 {
            for x in x0..x1 {
                detected[y as usize * mask.width as usize + x as usize] = true;
            }
        }
    }

    let mut flags = vec![false; mask.width as usize * mask.height as usize];
    for y in 0..height {
        for x in 0..width {
            let idx = y as usize * mask.width as usize + x as usize;
            if !mask.contains(x, y) || detected[idx] {
                continue;
            }
            let pixel = rgb.get_pixel(x, y);
            flags[idx] = is_vegetation(pixel.0[0], pixel.0[1], pixel.0[2]);
        }
    }
    flags
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BoundingBox, DetectorVariant};
    use image::{Rgb, RgbImage};
    use uuid::Uuid;

    const LEAF_GREEN: Rgb<u8> = Rgb([40, 160, 60]);
    const SOIL_BROWN: Rgb<u8> = Rgb([120, 85, 50]);

    #[test]
    fn test_hsv_conversion_primaries() {
        let (h, s, v) = rgb_to_hsv(255, 0, 0);
        assert!(h.abs() < 0.01);
        assert!((s - 1.0).abs() < 0.01);
        assert!((v - 1.0).abs() < 0.01);

        let (h, _, _) = rgb_to_hsv(0, 255, 0);
        assert!((h - 120.0).abs() < 0.01);

        let (h, _, _) = rgb_to_hsv(0, 0, 255);
        assert!((h - 240.0).abs() < 0.01);
    }

    #[test]
    fn test_vegetation_filter_accepts_green_rejects_soil() {
        assert!(is_vegetation(LEAF_GREEN.0[0], LEAF_GREEN.0[1], LEAF_GREEN.0[2]));
        assert!(!is_vegetation(SOIL_BROWN.0[0], SOIL_BROWN.0[1], SOIL_BROWN.0[2]));
        // Shadow and gray plastic are not vegetation.
        assert!(!is_vegetation(10, 15, 10));
        assert!(!is_vegetation(128, 128, 128));
    }

    #[test]
    fn test_undetected_vegetation_excludes_detection_boxes() {
        let mut img = RgbImage::new(20, 20);
        for pixel in img.pixels_mut() {
            *pixel = LEAF_GREEN;
        }
        let crop = DynamicImage::ImageRgb8(img);
        let mask = ContainerMask::filled(20, 20);
        let detections = vec![Detection {
            container_id: Uuid::nil(),
            bbox: BoundingBox::new(0.0, 0.0, 10.0, 20.0),
            confidence: 0.9,
            variant: DetectorVariant::Direct,
        }];

        let flags = undetected_vegetation(&crop, &mask, &detections);
        let count = flags.iter().filter(|&&f| f).count();
        // Left half covered by the detection, right half is vegetation.
        assert_eq!(count, 200);
    }

    #[test]
    fn test_undetected_vegetation_respects_mask_and_color() {
        let mut img = RgbImage::new(10, 10);
        for (x, _y, pixel) in img.enumerate_pixels_mut() {
            *pixel = if x < 5 { LEAF_GREEN } else { SOIL_BROWN };
        }
        let crop = DynamicImage::ImageRgb8(img);

        // Mask only covers the top half.
        let mut mask_data = vec![0u8; 100];
        for y in 0..5 {
            for x in 0..10 {
                mask_data[y * 10 + x] = 255;
            }
        }
        let mask = ContainerMask::new(10, 10, mask_data).unwrap();

        let flags = undetected_vegetation(&crop, &mask, &[]);
        let count = flags.iter().filter(|&&f| f).count();
        // Top half (5 rows) x green left half (5 cols) = 25 pixels.
        assert_eq!(count, 25);
    }
}
