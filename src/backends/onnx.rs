//! ONNX Runtime inference backends
//!
//! Session construction follows the provider-selection scheme used across
//! our model tooling: explicit provider when requested and available,
//! otherwise CUDA > `CoreML` > CPU auto-detection. Sessions are wrapped in a
//! mutex so a backend handle can be shared read-only across worker tasks.

use crate::config::{ExecutionProvider, PipelineConfig};
use crate::error::{PlantCountError, Result};
use crate::inference::{
    DetectionBackend, RawDetection, SegmentationBackend, SegmentationOutput,
};
use crate::types::BoundingBox;
use image::{imageops::FilterType, DynamicImage, ImageBuffer, Luma};
use ndarray::{Array4, ArrayD};
use ort::execution_providers::{
    CUDAExecutionProvider, CoreMLExecutionProvider, ExecutionProvider as OrtExecutionProvider,
};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Value;
use std::path::Path;
use std::sync::Mutex;

/// Segmentation model input edge length
const SEGMENTATION_INPUT_SIZE: u32 = 1024;
/// Detection model input edge length
const DETECTION_INPUT_SIZE: u32 = 640;

fn build_session(model_path: &Path, provider: ExecutionProvider) -> Result<Session> {
    if !model_path.exists() {
        return Err(PlantCountError::model(format!(
            "Model file not found: {}",
            model_path.display()
        )));
    }

    let mut session_builder = Session::builder()
        .map_err(|e| PlantCountError::inference(format!("Failed to create session builder: {e}")))?
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .map_err(|e| PlantCountError::inference(format!("Failed to set optimization level: {e}")))?;

    session_builder = match provider {
        ExecutionProvider::Auto => {
            let mut providers = Vec::new();
            let cuda = CUDAExecutionProvider::default();
            if OrtExecutionProvider::is_available(&cuda).unwrap_or(false) {
                log::info!("CUDA execution provider available, using GPU acceleration");
                providers.push(cuda.build());
            }
            let coreml = CoreMLExecutionProvider::default().with_subgraphs(true);
            if OrtExecutionProvider::is_available(&coreml).unwrap_or(false) {
                log::info!("CoreML execution provider available");
                providers.push(coreml.build());
            }
            if providers.is_empty() {
                log::debug!("No hardware acceleration available, using CPU");
                session_builder
            } else {
                session_builder
                    .with_execution_providers(providers)
                    .map_err(|e| {
                        PlantCountError::inference(format!(
                            "Failed to set auto execution providers: {e}"
                        ))
                    })?
            }
        },
        ExecutionProvider::Cpu => session_builder,
        ExecutionProvider::Cuda => {
            let cuda = CUDAExecutionProvider::default();
            if OrtExecutionProvider::is_available(&cuda).unwrap_or(false) {
                session_builder
                    .with_execution_providers([cuda.build()])
                    .map_err(|e| {
                        PlantCountError::inference(format!("Failed to set CUDA provider: {e}"))
                    })?
            } else {
                log::warn!("CUDA requested but not available, falling back to CPU");
                session_builder
            }
        },
        ExecutionProvider::CoreMl => {
            let coreml = CoreMLExecutionProvider::default().with_subgraphs(true);
            if OrtExecutionProvider::is_available(&coreml).unwrap_or(false) {
                session_builder
                    .with_execution_providers([coreml.build()])
                    .map_err(|e| {
                        PlantCountError::inference(format!("Failed to set CoreML provider: {e}"))
                    })?
            } else {
                log::warn!("CoreML requested but not available, falling back to CPU");
                session_builder
            }
        },
    };

    let intra_threads = std::thread::available_parallelism()
        .map(std::num::NonZero::get)
        .unwrap_or(8);

    session_builder
        .with_intra_threads(intra_threads)
        .map_err(|e| PlantCountError::inference(format!("Failed to set intra threads: {e}")))?
        .commit_from_file(model_path)
        .map_err(|e| {
            PlantCountError::model(format!(
                "Failed to load model '{}': {e}",
                model_path.display()
            ))
        })
}

/// Resize to the model input square and pack as a normalized NCHW tensor
fn to_input_tensor(image: &DynamicImage, input_size: u32) -> Array4<f32> {
    let resized = image
        .resize_exact(input_size, input_size, FilterType::Triangle)
        .to_rgb8();

    let size = input_size as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in resized.enumerate_pixels() {
        for channel in 0..3 {
            tensor[[0, channel, y as usize, x as usize]] = f32::from(pixel.0[channel]) / 255.0;
        }
    }
    tensor
}

/// Run a session on an input tensor and extract the first output as f32
fn run_session(session: &Mutex<Session>, input: Array4<f32>) -> Result<ArrayD<f32>> {
    let input_value = Value::from_array(input)
        .map_err(|e| PlantCountError::processing(format!("Failed to convert input tensor: {e}")))?;

    let mut session = session
        .lock()
        .map_err(|_| PlantCountError::internal("ONNX session lock poisoned"))?;

    let outputs = session
        .run(ort::inputs![input_value])
        .map_err(|e| PlantCountError::processing(format!("ONNX inference failed: {e}")))?;

    let keys: Vec<_> = outputs.keys().collect();
    let first_key = keys
        .first()
        .ok_or_else(|| PlantCountError::processing("No output tensors found"))?;
    let output = outputs
        .get(first_key)
        .ok_or_else(|| PlantCountError::processing("First output tensor not found"))?
        .try_extract_array::<f32>()
        .map_err(|e| PlantCountError::processing(format!("Failed to extract output tensor: {e}")))?;

    Ok(output.view().to_owned())
}

/// ONNX Runtime container segmentation backend
pub struct OnnxSegmentationBackend {
    session: Mutex<Session>,
}

impl OnnxSegmentationBackend {
    /// Load the segmentation model configured in `config`
    ///
    /// # Errors
    /// - Model file missing or invalid
    /// - Session construction failures
    pub fn load(config: &PipelineConfig) -> Result<Self> {
        let session = build_session(&config.segmentation_model, config.execution_provider)?;
        Ok(Self {
            session: Mutex::new(session),
        })
    }
}

impl SegmentationBackend for OnnxSegmentationBackend {
    fn segment(&self, photo: &DynamicImage) -> Result<SegmentationOutput> {
        let input = to_input_tensor(photo, SEGMENTATION_INPUT_SIZE);
        let output = run_session(&self.session, input)?;

        let shape = output.shape().to_vec();
        // Expected (1, 1, H, W) probability map.
        let (mask_h, mask_w) = match shape.as_slice() {
            [1, 1, h, w] => (*h, *w),
            other => {
                return Err(PlantCountError::inference(format!(
                    "Unexpected segmentation output shape {other:?}"
                )))
            },
        };

        let (raw, _offset) = output.into_raw_vec_and_offset();
        let mask: ImageBuffer<Luma<f32>, Vec<f32>> =
            ImageBuffer::from_raw(mask_w as u32, mask_h as u32, raw).ok_or_else(|| {
                PlantCountError::inference("Segmentation output buffer size mismatch")
            })?;

        // Rescale the probability map back to photo resolution.
        let resized = image::imageops::resize(
            &mask,
            photo.width(),
            photo.height(),
            FilterType::Triangle,
        );
        let probabilities = resized.into_raw();

        SegmentationOutput::new(photo.width(), photo.height(), probabilities)
    }
}

/// ONNX Runtime plant detection backend
///
/// Expects a detection head exporting decoded boxes: one row per candidate
/// as `[x1, y1, x2, y2, score, class]` in model-input pixel coordinates.
pub struct OnnxDetectionBackend {
    session: Mutex<Session>,
}

impl OnnxDetectionBackend {
    /// Load the detection model configured in `config`
    ///
    /// # Errors
    /// - Model file missing or invalid
    /// - Session construction failures
    pub fn load(config: &PipelineConfig) -> Result<Self> {
        let session = build_session(&config.detection_model, config.execution_provider)?;
        Ok(Self {
            session: Mutex::new(session),
        })
    }
}

impl DetectionBackend for OnnxDetectionBackend {
    fn detect(&self, image: &DynamicImage) -> Result<Vec<RawDetection>> {
        let input = to_input_tensor(image, DETECTION_INPUT_SIZE);
        let output = run_session(&self.session, input)?;

        let shape = output.shape().to_vec();
        let (rows, cols) = match shape.as_slice() {
            [1, rows, cols] if *cols >= 5 => (*rows, *cols),
            other => {
                return Err(PlantCountError::inference(format!(
                    "Unexpected detection output shape {other:?}"
                )))
            },
        };

        // Map model-input coordinates back to the source image.
        let scale_x = image.width() as f32 / DETECTION_INPUT_SIZE as f32;
        let scale_y = image.height() as f32 / DETECTION_INPUT_SIZE as f32;

        let (raw, _offset) = output.into_raw_vec_and_offset();
        let mut detections = Vec::new();
        for row in 0..rows {
            let base = row * cols;
            let x1 = raw.get(base).copied().unwrap_or(0.0) * scale_x;
            let y1 = raw.get(base + 1).copied().unwrap_or(0.0) * scale_y;
            let x2 = raw.get(base + 2).copied().unwrap_or(0.0) * scale_x;
            let y2 = raw.get(base + 3).copied().unwrap_or(0.0) * scale_y;
            let confidence = raw.get(base + 4).copied().unwrap_or(0.0);

            if confidence <= 0.0 || x2 <= x1 || y2 <= y1 {
                continue;
            }
            detections.push(RawDetection {
                bbox: BoundingBox::new(x1, y1, x2 - x1, y2 - y1),
                confidence,
            });
        }
        Ok(detections)
    }
}
