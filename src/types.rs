//! Core geometry and data-model types for the pipeline
//!
//! Everything the detectors and the estimator exchange lives here:
//! classified containers, individual detections, band estimations, and the
//! run-status surface exposed to external collaborators. All records are
//! immutable once produced; the single piece of cross-run mutable state
//! (`DensityParameters`) lives in [`crate::density::calibration`].

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

/// Axis-aligned bounding box in pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    /// Left edge
    pub x: f32,
    /// Top edge
    pub y: f32,
    /// Width in pixels
    pub width: f32,
    /// Height in pixels
    pub height: f32,
}

impl BoundingBox {
    /// Create a new bounding box from its top-left corner and size
    #[must_use]
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Box area in square pixels
    #[must_use]
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Center point of the box
    #[must_use]
    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    /// Intersection area with another box
    #[must_use]
    pub fn intersection(&self, other: &Self) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);

        (x2 - x1).max(0.0) * (y2 - y1).max(0.0)
    }

    /// Intersection-over-union with another box
    #[must_use]
    pub fn iou(&self, other: &Self) -> f32 {
        let intersection = self.intersection(other);
        let union = self.area() + other.area() - intersection;
        if union <= 0.0 {
            0.0
        } else {
            intersection / union
        }
    }

    /// Shift the box by a pixel offset (tile-local to container coordinates)
    #[must_use]
    pub fn translate(&self, dx: f32, dy: f32) -> Self {
        Self {
            x: self.x + dx,
            y: self.y + dy,
            ..*self
        }
    }
}

/// Binary container mask, local to the container's bounding box.
///
/// `data` holds one byte per pixel in row-major order: 0 = background,
/// 255 = container interior.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerMask {
    /// Mask width in pixels
    pub width: u32,
    /// Mask height in pixels
    pub height: u32,
    /// Row-major mask bytes (0 or 255)
    pub data: Vec<u8>,
}

impl ContainerMask {
    /// Create a mask from raw bytes
    ///
    /// # Errors
    /// Returns an error when `data` length does not match `width * height`.
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> crate::error::Result<Self> {
        let expected = width as usize * height as usize;
        if data.len() != expected {
            return Err(crate::error::PlantCountError::processing(format!(
                "Mask data length {} does not match {}x{} dimensions",
                data.len(),
                width,
                height
            )));
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    /// Create a fully-set mask (every pixel inside the container)
    #[must_use]
    pub fn filled(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![255; width as usize * height as usize],
        }
    }

    /// Whether the pixel at (x, y) is inside the container
    #[must_use]
    pub fn contains(&self, x: u32, y: u32) -> bool {
        if x >= self.width || y >= self.height {
            return false;
        }
        self.data
            .get(y as usize * self.width as usize + x as usize)
            .is_some_and(|&v| v > 0)
    }

    /// Number of set pixels
    #[must_use]
    pub fn area_px(&self) -> u64 {
        self.data.iter().filter(|&&v| v > 0).count() as u64
    }
}

/// Closed classification of a photo sub-region
///
/// Detector selection is a pure function of this variant plus the
/// container's pixel area; no runtime type inspection anywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerKind {
    /// Large amorphous cultivation area (ground bed, floor segment)
    Segment,
    /// Bounded rigid rectangular crate
    Crate,
    /// Germination tray (regular rectangular grid, larger footprint)
    Tray,
    /// Plug tray (regular near-square grid, small footprint)
    Plug,
}

impl std::fmt::Display for ContainerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Segment => write!(f, "segment"),
            Self::Crate => write!(f, "crate"),
            Self::Tray => write!(f, "tray"),
            Self::Plug => write!(f, "plug"),
        }
    }
}

/// A classified region of one photo, produced by the segment classifier.
///
/// Consumed read-only by detectors and the estimator; lifetime is one
/// pipeline run.
#[derive(Debug, Clone)]
pub struct Container {
    /// Container identifier, unique within the run
    pub id: Uuid,
    /// Photo this container was segmented from
    pub photo_id: Uuid,
    /// Classified kind
    pub kind: ContainerKind,
    /// Bounding box in photo pixel coordinates
    pub bbox: BoundingBox,
    /// Binary mask local to `bbox`
    pub mask: ContainerMask,
    /// Mask area in square pixels
    pub area_px: f64,
    /// Mask area in square centimeters, when the location scale is known
    pub area_cm2: Option<f64>,
}

/// Which detector produced a detection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorVariant {
    /// Tiled detection with overlap merge
    Tiled,
    /// Single-pass detection
    Direct,
}

/// One located plant. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// Owning container
    pub container_id: Uuid,
    /// Bounding box in container-local pixel coordinates
    pub bbox: BoundingBox,
    /// Detector confidence score in [0, 1]
    pub confidence: f32,
    /// Detector variant that produced this detection
    pub variant: DetectorVariant,
}

/// Where a band's average object area came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationSource {
    /// Average computed from detections inside the band in this run
    FromDetections,
    /// Stored per-location density parameters
    FromStoredParameters,
}

/// Area-based count estimate for one band of a container's undetected area.
/// Immutable once created; one list per container per run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Estimation {
    /// Owning container
    pub container_id: Uuid,
    /// Horizontal band index, 0 at the top (far) edge
    pub band_index: usize,
    /// Estimated plant count for the band (rounded only for reporting)
    pub estimated_count: f32,
    /// Vegetation area covered by this band, square pixels
    pub area_px: f64,
    /// Vegetation area in square centimeters, when the scale is known
    pub area_cm2: Option<f64>,
    /// Calibration source for the band's average object area
    pub source: CalibrationSource,
    /// Confidence proxy in [0, 1]
    pub confidence: f32,
}

/// Spatial metadata attached to a photo
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    /// Latitude in degrees
    pub latitude: f64,
    /// Longitude in degrees
    pub longitude: f64,
}

/// Where the photo pixels come from
#[derive(Debug, Clone)]
pub enum PhotoSource {
    /// Load from a filesystem path at run start
    Path(PathBuf),
    /// Already-decoded image (web intake, tests)
    InMemory(Arc<image::DynamicImage>),
}

/// One photo submitted to the pipeline
#[derive(Debug, Clone)]
pub struct PhotoReference {
    /// Photo identifier
    pub photo_id: Uuid,
    /// Pixel source
    pub source: PhotoSource,
    /// Spatial metadata for location resolution, when present
    pub geo: Option<GeoPoint>,
}

impl PhotoReference {
    /// Photo reference backed by a filesystem path
    #[must_use]
    pub fn from_path<P: Into<PathBuf>>(path: P, geo: Option<GeoPoint>) -> Self {
        Self {
            photo_id: Uuid::new_v4(),
            source: PhotoSource::Path(path.into()),
            geo,
        }
    }

    /// Photo reference backed by a decoded image
    #[must_use]
    pub fn from_image(image: image::DynamicImage, geo: Option<GeoPoint>) -> Self {
        Self {
            photo_id: Uuid::new_v4(),
            source: PhotoSource::InMemory(Arc::new(image)),
            geo,
        }
    }
}

/// Pipeline run states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Segmenting the photo into containers
    Segmenting,
    /// Detection children fanned out and running
    Detecting,
    /// Children report detections, estimation in flight
    Estimating,
    /// All children reported; aggregating totals
    Aggregating,
    /// Terminal: aggregation succeeded and passed the consistency check
    Completed,
    /// Terminal: recoverable by external manual action, partial progress kept
    NeedsAttention,
    /// Terminal: retryable or fatal fault
    Failed,
}

impl RunState {
    /// Whether the run has reached a terminal state
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::NeedsAttention | Self::Failed
        )
    }
}

/// Why a run stopped at `needs_attention`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningReason {
    /// Segmentation found zero containers, a valid terminal state
    NoContainersFound,
    /// Photo spatial metadata did not resolve to a known location
    NoGeolocationMatch,
    /// Location resolved but has no product configuration
    LocationNotConfigured,
    /// No stored density parameters and no local detections anywhere
    NeedsCalibration,
}

impl WarningReason {
    /// Stable machine-readable reason code
    #[must_use]
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::NoContainersFound => "no_containers_found",
            Self::NoGeolocationMatch => "no_geolocation_match",
            Self::LocationNotConfigured => "location_not_configured",
            Self::NeedsCalibration => "needs_calibration",
        }
    }
}

/// Aggregated counts for a completed run
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RunTotals {
    /// Number of individually detected plants
    pub detected: u64,
    /// Sum of band estimations across containers
    pub estimated: f64,
    /// detected + estimated
    pub total: f64,
    /// Weighted-average confidence across detections and estimations
    pub confidence: f32,
}

/// Snapshot of one run's progress, exposed via the status query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStatus {
    /// Run identifier
    pub run_id: Uuid,
    /// Photo the run was created for
    pub photo_id: Uuid,
    /// Current state
    pub state: RunState,
    /// Totals, present once aggregation ran
    pub totals: Option<RunTotals>,
    /// Warning reasons accumulated along the way
    pub warnings: Vec<WarningReason>,
    /// Human-readable failure reason, present for failed runs
    pub failure: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bbox_iou_disjoint() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::new(20.0, 20.0, 10.0, 10.0);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn test_bbox_iou_identical() {
        let a = BoundingBox::new(5.0, 5.0, 10.0, 10.0);
        assert!((a.iou(&a) - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_bbox_iou_partial() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::new(5.0, 0.0, 10.0, 10.0);
        // intersection 50, union 150
        assert!((a.iou(&b) - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_bbox_translate() {
        let a = BoundingBox::new(1.0, 2.0, 3.0, 4.0);
        let b = a.translate(10.0, 20.0);
        assert_eq!(b.x, 11.0);
        assert_eq!(b.y, 22.0);
        assert_eq!(b.width, 3.0);
        assert_eq!(b.height, 4.0);
    }

    #[test]
    fn test_mask_dimension_mismatch() {
        assert!(ContainerMask::new(4, 4, vec![0; 15]).is_err());
        assert!(ContainerMask::new(4, 4, vec![0; 16]).is_ok());
    }

    #[test]
    fn test_mask_area_and_contains() {
        let mut data = vec![0u8; 16];
        data[5] = 255;
        data[6] = 255;
        let mask = ContainerMask::new(4, 4, data).unwrap();
        assert_eq!(mask.area_px(), 2);
        assert!(mask.contains(1, 1));
        assert!(mask.contains(2, 1));
        assert!(!mask.contains(0, 0));
        assert!(!mask.contains(7, 7));
    }

    #[test]
    fn test_terminal_states() {
        assert!(RunState::Completed.is_terminal());
        assert!(RunState::NeedsAttention.is_terminal());
        assert!(RunState::Failed.is_terminal());
        assert!(!RunState::Detecting.is_terminal());
    }

    #[test]
    fn test_warning_reason_codes() {
        assert_eq!(
            WarningReason::NoContainersFound.reason_code(),
            "no_containers_found"
        );
        assert_eq!(
            WarningReason::NeedsCalibration.reason_code(),
            "needs_calibration"
        );
    }

    #[test]
    fn test_run_status_serializes() {
        let status = RunStatus {
            run_id: Uuid::new_v4(),
            photo_id: Uuid::new_v4(),
            state: RunState::NeedsAttention,
            totals: None,
            warnings: vec![WarningReason::NoContainersFound],
            failure: None,
        };
        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("needs_attention"));
        assert!(json.contains("no_containers_found"));
    }
}
