//! Object storage behind the orchestrator. Both backends speak the same
//! multipart contract: open, presigned part PUTs, assemble, abort.

mod local;
mod s3;

pub use local::LocalStorage;
pub use s3::S3Storage;

use crate::upload::types::CompletedPart;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Media type of every stored recording
pub const RECORDING_CONTENT_TYPE: &str = "video/webm";

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Invalid part sequence: {0}")]
    InvalidPartSequence(String),

    #[error("Part {part_number} was never uploaded or its ETag does not match")]
    PartMismatch { part_number: u32 },

    #[error("Unknown multipart upload {0}")]
    UnknownUpload(String),

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Storage responded with {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("Invalid storage response: {0}")]
    InvalidResponse(String),

    #[error("Storage configuration error: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Open a multipart upload and return its provider id
    async fn create_multipart(&self, key: &str) -> StorageResult<String>;

    fn presign_upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        ttl: Duration,
    ) -> StorageResult<String>;

    /// Assemble the parts into the final object
    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> StorageResult<()>;

    async fn abort_multipart(&self, key: &str, upload_id: &str) -> StorageResult<()>;

    fn presign_get(&self, key: &str, ttl: Duration) -> StorageResult<String>;

    /// Size in bytes of a stored object
    async fn head(&self, key: &str) -> StorageResult<u64>;
}

/// Parts must be numbered exactly `1..=n` in ascending order.
pub fn validate_part_sequence(parts: &[CompletedPart]) -> StorageResult<()> {
    if parts.is_empty() {
        return Err(StorageError::InvalidPartSequence("no parts".to_string()));
    }
    for (index, part) in parts.iter().enumerate() {
        let expected = index as u32 + 1;
        if part.part_number != expected {
            return Err(StorageError::InvalidPartSequence(format!(
                "expected part {expected}, got {}",
                part.part_number
            )));
        }
        if part.etag.trim().is_empty() {
            return Err(StorageError::InvalidPartSequence(format!(
                "part {expected} has an empty ETag"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parts(numbers: &[u32]) -> Vec<CompletedPart> {
        numbers
            .iter()
            .map(|n| CompletedPart {
                part_number: *n,
                etag: format!("\"etag-{n}\""),
            })
            .collect()
    }

    #[test]
    fn test_contiguous_parts_pass() {
        assert!(validate_part_sequence(&parts(&[1, 2, 3])).is_ok());
    }

    #[test]
    fn test_gaps_and_disorder_fail() {
        assert!(validate_part_sequence(&parts(&[1, 3])).is_err());
        assert!(validate_part_sequence(&parts(&[2, 1])).is_err());
        assert!(validate_part_sequence(&parts(&[0, 1])).is_err());
        assert!(validate_part_sequence(&[]).is_err());
    }
}
