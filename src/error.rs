//! Error types for the plant counting pipeline

use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, PlantCountError>;

/// Comprehensive error types for the detection-and-estimation pipeline
#[derive(Error, Debug)]
pub enum PlantCountError {
    /// Input/output errors (file not found, permission denied, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Image format or processing errors
    #[error("Image processing error: {0}")]
    Image(#[from] image::ImageError),

    /// Backend inference errors
    #[error("Inference error: {0}")]
    Inference(String),

    /// Model loading or initialization errors (fatal for the worker)
    #[error("Model error: {0}")]
    Model(String),

    /// Invalid configuration or parameters
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Detection, estimation, or mask processing errors
    #[error("Processing error: {0}")]
    Processing(String),

    /// External storage collaborator errors (upload, persistence sink)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Circuit breaker rejected the call while open
    #[error("Upload circuit breaker is open: {0}")]
    CircuitOpen(String),

    /// A fanned-out child exceeded its time budget
    #[error("Child task timed out after {0:?}")]
    ChildTimeout(std::time::Duration),

    /// Calibration state conflict (optimistic concurrency exhausted)
    #[error("Calibration conflict for location '{0}': concurrent writers exhausted retries")]
    CalibrationConflict(String),

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PlantCountError {
    /// Create a new invalid configuration error
    pub fn invalid_config<S: Into<String>>(msg: S) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create a new model error
    pub fn model<S: Into<String>>(msg: S) -> Self {
        Self::Model(msg.into())
    }

    /// Create a new processing error
    pub fn processing<S: Into<String>>(msg: S) -> Self {
        Self::Processing(msg.into())
    }

    /// Create a new inference error
    pub fn inference<S: Into<String>>(msg: S) -> Self {
        Self::Inference(msg.into())
    }

    /// Create a new storage error
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a new internal error
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// Create file I/O error with operation context
    pub fn file_io_error<P: AsRef<std::path::Path>>(
        operation: &str,
        path: P,
        error: std::io::Error,
    ) -> Self {
        let path_display = path.as_ref().display();
        Self::Io(std::io::Error::new(
            error.kind(),
            format!("Failed to {} '{}': {}", operation, path_display, error),
        ))
    }

    /// Create processing error with stage context
    pub fn processing_stage_error(stage: &str, details: &str, input_info: Option<&str>) -> Self {
        let input_context = match input_info {
            Some(info) => format!(" (input: {})", info),
            None => String::new(),
        };

        Self::Processing(format!(
            "Processing failed at stage '{}'{}: {}",
            stage, input_context, details
        ))
    }

    /// Whether this failure class is worth retrying with backoff.
    ///
    /// Transient faults (storage upload, breaker shed, I/O, child timeout)
    /// are retried a bounded number of times before escalating to a failed
    /// run. Logic faults and model-load errors are never retried on the
    /// same worker.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::Storage(_) | Self::CircuitOpen(_) | Self::ChildTimeout(_)
        )
    }
}
