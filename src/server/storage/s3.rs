use super::{
    validate_part_sequence, ObjectStorage, StorageError, StorageResult, RECORDING_CONTENT_TYPE,
};
use crate::config::S3Config;
use crate::upload::types::CompletedPart;
use async_trait::async_trait;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use rusty_s3::actions::CreateMultipartUpload;
use rusty_s3::{Bucket, Credentials, S3Action, UrlStyle};
use std::time::Duration;
use tracing::{debug, warn};

/// Lifetime of URLs the server signs for its own requests
const SERVER_SIGN_TTL: Duration = Duration::from_secs(300);

/// S3-compatible storage. Requests are presigned with rusty-s3 and sent
/// with reqwest.
pub struct S3Storage {
    bucket: Bucket,
    credentials: Credentials,
    http: reqwest::Client,
}

impl S3Storage {
    pub fn new(config: &S3Config) -> StorageResult<Self> {
        let endpoint = config
            .endpoint
            .parse()
            .map_err(|e| StorageError::Config(format!("invalid S3 endpoint: {e}")))?;
        let style = if config.path_style {
            UrlStyle::Path
        } else {
            UrlStyle::VirtualHost
        };
        let bucket = Bucket::new(endpoint, style, config.bucket.clone(), config.region.clone())
            .map_err(|e| StorageError::Config(e.to_string()))?;

        Ok(Self {
            bucket,
            credentials: Credentials::new(config.access_key.clone(), config.secret_key.clone()),
            http: reqwest::Client::new(),
        })
    }

    async fn check(response: reqwest::Response) -> StorageResult<String> {
        let status = response.status();
        let body = response.text().await?;
        // CompleteMultipartUpload can fail with a 200 and an error document
        if !status.is_success() || body.contains("<Error>") {
            return Err(StorageError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(body)
    }
}

fn part_number_u16(part_number: u32) -> StorageResult<u16> {
    u16::try_from(part_number)
        .map_err(|_| StorageError::InvalidPartSequence(format!("part number {part_number} out of range")))
}

#[async_trait]
impl ObjectStorage for S3Storage {
    async fn create_multipart(&self, key: &str) -> StorageResult<String> {
        let url = self
            .bucket
            .create_multipart_upload(Some(&self.credentials), key)
            .sign(SERVER_SIGN_TTL);
        let response = self
            .http
            .post(url)
            .header(CONTENT_TYPE, RECORDING_CONTENT_TYPE)
            .send()
            .await?;
        let body = Self::check(response).await?;

        let multipart = CreateMultipartUpload::parse_response(&body)
            .map_err(|e| StorageError::InvalidResponse(e.to_string()))?;
        debug!("Opened multipart upload for {}", key);
        Ok(multipart.upload_id().to_string())
    }

    fn presign_upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        ttl: Duration,
    ) -> StorageResult<String> {
        let part_number = part_number_u16(part_number)?;
        let url = self
            .bucket
            .upload_part(Some(&self.credentials), key, part_number, upload_id)
            .sign(ttl);
        Ok(url.to_string())
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> StorageResult<()> {
        // The request body numbers ETags positionally, so gaps must be
        // caught before they are silently renumbered.
        validate_part_sequence(parts)?;

        let action = self.bucket.complete_multipart_upload(
            Some(&self.credentials),
            key,
            upload_id,
            parts.iter().map(|p| p.etag.as_str()),
        );
        let url = action.sign(SERVER_SIGN_TTL);
        let response = self.http.post(url).body(action.body()).send().await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn abort_multipart(&self, key: &str, upload_id: &str) -> StorageResult<()> {
        let url = self
            .bucket
            .abort_multipart_upload(Some(&self.credentials), key, upload_id)
            .sign(SERVER_SIGN_TTL);
        let response = self.http.delete(url).send().await?;
        if let Err(e) = Self::check(response).await {
            warn!("Abort of {} failed: {}", upload_id, e);
            return Err(e);
        }
        Ok(())
    }

    fn presign_get(&self, key: &str, ttl: Duration) -> StorageResult<String> {
        Ok(self
            .bucket
            .get_object(Some(&self.credentials), key)
            .sign(ttl)
            .to_string())
    }

    async fn head(&self, key: &str) -> StorageResult<u64> {
        let url = self
            .bucket
            .head_object(Some(&self.credentials), key)
            .sign(SERVER_SIGN_TTL);
        let response = self.http.head(url).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(StorageError::NotFound(key.to_string()));
        }
        if !response.status().is_success() {
            return Err(StorageError::Rejected {
                status: response.status().as_u16(),
                body: String::new(),
            });
        }
        response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| StorageError::InvalidResponse("missing Content-Length".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage() -> S3Storage {
        S3Storage::new(&S3Config {
            endpoint: "http://127.0.0.1:9000".to_string(),
            bucket: "recordings".to_string(),
            region: "us-east-1".to_string(),
            access_key: "minio".to_string(),
            secret_key: "minio-secret".to_string(),
            path_style: true,
        })
        .unwrap()
    }

    #[test]
    fn test_presigned_part_url_carries_part_and_upload() {
        let url = storage()
            .presign_upload_part("recordings/a/b.webm", "up-1", 3, Duration::from_secs(900))
            .unwrap();
        assert!(url.starts_with("http://127.0.0.1:9000/recordings/recordings/a/b.webm"));
        assert!(url.contains("partNumber=3"));
        assert!(url.contains("uploadId=up-1"));
        assert!(url.contains("X-Amz-Signature="));
    }

    #[tokio::test]
    async fn test_gap_is_rejected_before_any_request() {
        let parts = vec![
            CompletedPart { part_number: 1, etag: "a".into() },
            CompletedPart { part_number: 3, etag: "c".into() },
        ];
        let err = storage()
            .complete_multipart("k", "up-1", &parts)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidPartSequence(_)));
    }
}
