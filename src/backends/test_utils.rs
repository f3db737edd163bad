//! Mock inference backends
//!
//! Deterministic, scriptable backends used by this crate's tests and by
//! embedders that need to exercise the pipeline without model files.

use crate::error::{PlantCountError, Result};
use crate::inference::{DetectionBackend, RawDetection, SegmentationBackend, SegmentationOutput};
use crate::types::BoundingBox;
use image::DynamicImage;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Segmentation backend returning a pre-scripted probability mask
pub struct MockSegmentationBackend {
    output: SegmentationOutput,
    calls: AtomicU64,
}

impl MockSegmentationBackend {
    /// All-background mask of the given size
    #[must_use]
    pub fn blank(width: u32, height: u32) -> Self {
        Self {
            output: SegmentationOutput {
                width,
                height,
                probabilities: vec![0.0; width as usize * height as usize],
            },
            calls: AtomicU64::new(0),
        }
    }

    /// Mask with probability 1.0 inside each rectangle, 0.0 elsewhere.
    /// Rectangles are (x, y, width, height) in photo pixels.
    #[must_use]
    pub fn with_foreground_rects(width: u32, height: u32, rects: &[(u32, u32, u32, u32)]) -> Self {
        let mut probabilities = vec![0.0f32; width as usize * height as usize];
        for &(rx, ry, rw, rh) in rects {
            for y in ry..(ry + rh).min(height) {
                for x in rx..(rx + rw).min(width) {
                    probabilities[y as usize * width as usize + x as usize] = 1.0;
                }
            }
        }
        Self {
            output: SegmentationOutput {
                width,
                height,
                probabilities,
            },
            calls: AtomicU64::new(0),
        }
    }

    /// Backend returning the exact given output
    #[must_use]
    pub fn from_output(output: SegmentationOutput) -> Self {
        Self {
            output,
            calls: AtomicU64::new(0),
        }
    }

    /// Number of `segment` invocations so far
    #[must_use]
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl SegmentationBackend for MockSegmentationBackend {
    fn segment(&self, _photo: &DynamicImage) -> Result<SegmentationOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.output.clone())
    }
}

type DetectFn = dyn Fn(&DynamicImage) -> Result<Vec<RawDetection>> + Send + Sync;

enum DetectBehavior {
    Fixed(Vec<RawDetection>),
    Scripted(Box<DetectFn>),
    Failing(String),
}

/// Detection backend with scriptable behavior
pub struct MockDetectionBackend {
    behavior: DetectBehavior,
    delay: Duration,
    calls: AtomicU64,
}

impl MockDetectionBackend {
    /// Backend that never detects anything
    #[must_use]
    pub fn empty() -> Self {
        Self::fixed(Vec::new())
    }

    /// Backend returning the same detections for every call
    #[must_use]
    pub fn fixed(detections: Vec<RawDetection>) -> Self {
        Self {
            behavior: DetectBehavior::Fixed(detections),
            delay: Duration::ZERO,
            calls: AtomicU64::new(0),
        }
    }

    /// Backend whose detections depend on the image handed in
    /// (tile crops see different results, like a real detector)
    #[must_use]
    pub fn scripted<F>(f: F) -> Self
    where
        F: Fn(&DynamicImage) -> Result<Vec<RawDetection>> + Send + Sync + 'static,
    {
        Self {
            behavior: DetectBehavior::Scripted(Box::new(f)),
            delay: Duration::ZERO,
            calls: AtomicU64::new(0),
        }
    }

    /// Backend that fails every call with an inference error
    #[must_use]
    pub fn failing<S: Into<String>>(message: S) -> Self {
        Self {
            behavior: DetectBehavior::Failing(message.into()),
            delay: Duration::ZERO,
            calls: AtomicU64::new(0),
        }
    }

    /// Add a fixed per-call delay (completion-order and timeout tests)
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Number of `detect` invocations so far
    #[must_use]
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl DetectionBackend for MockDetectionBackend {
    fn detect(&self, image: &DynamicImage) -> Result<Vec<RawDetection>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        match &self.behavior {
            DetectBehavior::Fixed(detections) => Ok(detections.clone()),
            DetectBehavior::Scripted(f) => f(image),
            DetectBehavior::Failing(message) => Err(PlantCountError::inference(message.clone())),
        }
    }
}

/// Convenience constructor for a raw detection
#[must_use]
pub fn raw_detection(x: f32, y: f32, width: f32, height: f32, confidence: f32) -> RawDetection {
    RawDetection {
        bbox: BoundingBox::new(x, y, width, height),
        confidence,
    }
}

/// A uniform grid of `rows x cols` detections of the given box size,
/// spread evenly over a `width x height` region
#[must_use]
pub fn detection_grid(
    width: u32,
    height: u32,
    rows: u32,
    cols: u32,
    box_size: f32,
    confidence: f32,
) -> Vec<RawDetection> {
    let mut detections = Vec::with_capacity((rows * cols) as usize);
    for row in 0..rows {
        for col in 0..cols {
            let cx = (col as f32 + 0.5) * width as f32 / cols as f32;
            let cy = (row as f32 + 0.5) * height as f32 / rows as f32;
            detections.push(raw_detection(
                cx - box_size / 2.0,
                cy - box_size / 2.0,
                box_size,
                box_size,
                confidence,
            ));
        }
    }
    detections
}
