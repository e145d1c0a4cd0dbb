//! Upload pipeline (client side)
//!
//! Moves a finalized artifact from the coordinator to object storage via the
//! orchestrator's init/complete protocol.

pub mod api;
pub mod pipeline;
pub mod types;

pub use api::ApiClient;
pub use pipeline::{ProgressFn, UploadOutcome, UploadPipeline, UploadSettings};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Errors from the client upload pipeline
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Artifact is empty")]
    Empty,

    #[error("Artifact is {size} bytes; the maximum upload is {max} bytes")]
    TooLarge { size: u64, max: u64 },

    #[error("Server rejected the request ({status}): {message}")]
    Api {
        status: u16,
        code: Option<String>,
        message: String,
    },

    #[error("Part {part_number} failed after {attempts} attempts: {message}")]
    PartUploadFailed {
        part_number: u32,
        attempts: u32,
        message: String,
    },

    #[error("Unexpected server response: {0}")]
    InvalidResponse(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Upload configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Anything that can publish an artifact and return its share link
#[async_trait]
pub trait ArtifactUploader: Send + Sync {
    async fn upload(
        &self,
        data: Bytes,
        duration_seconds: f64,
        title: Option<String>,
        progress: ProgressFn,
    ) -> Result<UploadOutcome, UploadError>;
}

#[async_trait]
impl ArtifactUploader for UploadPipeline {
    async fn upload(
        &self,
        data: Bytes,
        duration_seconds: f64,
        title: Option<String>,
        progress: ProgressFn,
    ) -> Result<UploadOutcome, UploadError> {
        UploadPipeline::upload(self, data, duration_seconds, title, progress).await
    }
}
