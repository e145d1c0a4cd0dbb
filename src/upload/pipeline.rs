//! Client upload pipeline
//!
//! Splits a finalized artifact into fixed-size parts, uploads them in
//! ascending order to the presigned targets handed out by the orchestrator,
//! and completes the session. Parts go out one at a time; there is never more
//! than one part in flight.

use super::api::ApiClient;
use super::types::{CompleteUploadRequest, CompletedPart, InitUploadRequest};
use super::UploadError;
use crate::recorder::encoder::WEBM_MIME_TYPE;
use bytes::Bytes;
use reqwest::header::{CONTENT_TYPE, ETAG};
use reqwest::Client as HttpClient;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// 5 MiB
pub const PART_SIZE: usize = 5 * 1024 * 1024;
pub const MAX_PARTS: usize = 100;
pub const MAX_ATTEMPTS: u32 = 3;
pub const PART_TIMEOUT: Duration = Duration::from_secs(120);

/// Called with the completion percentage after each part
pub type ProgressFn = Arc<dyn Fn(f64) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct UploadSettings {
    pub part_size: usize,
    pub max_parts: usize,
    pub max_attempts: u32,
    /// Retry delay is `retry_base_delay * 2^attempt`
    pub retry_base_delay: Duration,
    /// A part PUT that has not finished by then counts as a failed attempt
    pub part_timeout: Duration,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            part_size: PART_SIZE,
            max_parts: MAX_PARTS,
            max_attempts: MAX_ATTEMPTS,
            retry_base_delay: Duration::from_secs(1),
            part_timeout: PART_TIMEOUT,
        }
    }
}

/// Result of a successful upload
#[derive(Debug, Clone)]
pub struct UploadOutcome {
    pub recording_id: Uuid,
    pub share_url: String,
    pub share_token: String,
    /// Attempts used per part, index 0 is part 1
    pub part_attempts: Vec<u32>,
}

/// Number of parts needed for `size` bytes
pub fn part_count(size: usize, part_size: usize) -> usize {
    size.div_ceil(part_size)
}

/// Byte range of the zero-based part `index`
pub fn part_range(index: usize, part_size: usize, size: usize) -> Range<usize> {
    let start = index * part_size;
    start..((index + 1) * part_size).min(size)
}

/// Wait before the attempt following the failed `attempt` (1-based)
pub fn retry_delay(base: Duration, attempt: u32) -> Duration {
    base * 2u32.pow(attempt)
}

/// Uploads artifacts through the orchestrator
pub struct UploadPipeline {
    api: ApiClient,
    /// Part PUTs carry no credentials; the presigned URL is the authorization
    parts: HttpClient,
    settings: UploadSettings,
}

impl UploadPipeline {
    pub fn new(api: ApiClient, settings: UploadSettings) -> Self {
        Self {
            api,
            parts: HttpClient::new(),
            settings,
        }
    }

    /// Upload an artifact and return its share URL
    pub async fn upload(
        &self,
        data: Bytes,
        duration_seconds: f64,
        title: Option<String>,
        progress: ProgressFn,
    ) -> Result<UploadOutcome, UploadError> {
        let size = data.len();
        if size == 0 {
            return Err(UploadError::Empty);
        }
        let count = part_count(size, self.settings.part_size);
        if count > self.settings.max_parts {
            return Err(UploadError::TooLarge {
                size: size as u64,
                max: (self.settings.max_parts * self.settings.part_size) as u64,
            });
        }

        let init = self
            .api
            .init_upload(&InitUploadRequest {
                estimated_size: size as u64,
                part_count: count as u32,
            })
            .await?;
        if init.upload_urls.len() < count {
            return Err(UploadError::InvalidResponse(format!(
                "expected {} upload URLs, got {}",
                count,
                init.upload_urls.len()
            )));
        }
        tracing::info!(
            "Upload session {} opened for recording {} ({} bytes, {} parts)",
            init.upload_id,
            init.recording_id,
            size,
            count
        );

        let mut parts = Vec::with_capacity(count);
        let mut part_attempts = Vec::with_capacity(count);
        for (index, url) in init.upload_urls.iter().take(count).enumerate() {
            let part_number = (index + 1) as u32;
            let body = data.slice(part_range(index, self.settings.part_size, size));
            let (etag, attempts) = self.put_part_with_retry(url, part_number, body).await?;
            parts.push(CompletedPart { part_number, etag });
            part_attempts.push(attempts);
            progress((index + 1) as f64 / count as f64 * 100.0);
        }

        let done = self
            .api
            .complete_upload(&CompleteUploadRequest {
                recording_id: init.recording_id,
                parts,
                duration: duration_seconds,
                title,
            })
            .await?;
        tracing::info!("Recording {} shared at {}", init.recording_id, done.share_url);

        Ok(UploadOutcome {
            recording_id: init.recording_id,
            share_url: done.share_url,
            share_token: done.share_token,
            part_attempts,
        })
    }

    async fn put_part_with_retry(
        &self,
        url: &str,
        part_number: u32,
        body: Bytes,
    ) -> Result<(String, u32), UploadError> {
        let mut attempt = 1;
        loop {
            match self.put_part(url, body.clone()).await {
                Ok(etag) => {
                    tracing::debug!("Part {} uploaded on attempt {}", part_number, attempt);
                    return Ok((etag, attempt));
                }
                Err(message) if attempt < self.settings.max_attempts => {
                    let delay = retry_delay(self.settings.retry_base_delay, attempt);
                    tracing::warn!(
                        "Part {} attempt {} failed: {}; retrying in {:?}",
                        part_number,
                        attempt,
                        message,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(message) => {
                    tracing::error!("Part {} failed after {} attempts: {}", part_number, attempt, message);
                    return Err(UploadError::PartUploadFailed {
                        part_number,
                        attempts: attempt,
                        message,
                    });
                }
            }
        }
    }

    /// One PUT. A response without an ETag counts as a failure.
    async fn put_part(&self, url: &str, body: Bytes) -> Result<String, String> {
        let res = self
            .parts
            .put(url)
            .timeout(self.settings.part_timeout)
            .header(CONTENT_TYPE, WEBM_MIME_TYPE)
            .body(body)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        let status = res.status();
        if !status.is_success() {
            return Err(format!("HTTP {status}"));
        }
        res.headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .ok_or_else(|| "response carried no ETag".to_string())
    }
}
