//! Recording errors
//!
//! Failure taxonomy for source acquisition, encoding and the capture session.

use thiserror::Error;

/// Errors that can occur during recording
#[derive(Error, Debug)]
pub enum RecordingError {
    /// A required source (the screen) was refused or could not be opened.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// An optional source (webcam, microphone, system audio) could not be opened.
    #[error("Source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("No supported encoder: {0}")]
    EncodingUnsupported(String),

    #[error("No data captured. Record for at least a second before stopping.")]
    NoDataCaptured,

    #[error("Already recording")]
    AlreadyRecording,

    #[error("Not recording")]
    NotRecording,

    #[error("No failed upload to retry")]
    NoPendingUpload,

    #[error("Capture error: {0}")]
    CaptureError(String),

    #[error("Encoding error: {0}")]
    EncodingError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

impl RecordingError {
    /// Stable machine-readable code used on the IPC channel
    pub fn code(&self) -> &'static str {
        match self {
            RecordingError::PermissionDenied(_) => "PERMISSION_DENIED",
            RecordingError::SourceUnavailable(_) => "SOURCE_UNAVAILABLE",
            RecordingError::EncodingUnsupported(_) => "ENCODING_UNSUPPORTED",
            RecordingError::NoDataCaptured => "NO_DATA_CAPTURED",
            RecordingError::AlreadyRecording => "ALREADY_RECORDING",
            RecordingError::NotRecording => "NOT_RECORDING",
            RecordingError::NoPendingUpload => "NO_PENDING_UPLOAD",
            RecordingError::CaptureError(_) => "CAPTURE_ERROR",
            RecordingError::EncodingError(_) => "ENCODING_ERROR",
            RecordingError::IoError(_) => "IO_ERROR",
            RecordingError::ConfigurationError(_) => "CONFIGURATION_ERROR",
        }
    }
}

/// Result type for recording operations
pub type RecordingResult<T> = Result<T, RecordingError>;
