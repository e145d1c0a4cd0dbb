//! Orchestrator API client

use super::types::{
    ApiErrorBody, CompleteUploadRequest, CompleteUploadResponse, InitUploadRequest,
    InitUploadResponse,
};
use super::UploadError;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Client as HttpClient, Response, Url};
use serde::de::DeserializeOwned;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Client for the init/complete endpoints
#[derive(Debug, Clone)]
pub struct ApiClient {
    endpoint: Url,
    client: HttpClient,
}

impl ApiClient {
    pub fn new(endpoint: &str, token: Option<&str>) -> Result<Self, UploadError> {
        let mut endpoint =
            Url::parse(endpoint).map_err(|e| UploadError::Config(format!("Invalid API URL: {e}")))?;
        if !endpoint.path().ends_with('/') {
            let path = format!("{}/", endpoint.path());
            endpoint.set_path(&path);
        }

        let mut headers = HeaderMap::new();
        if let Some(token) = token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| UploadError::Config(format!("Invalid API token: {e}")))?;
            headers.insert(AUTHORIZATION, value);
        }
        let client = HttpClient::builder()
            .default_headers(headers)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| UploadError::Config(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self { endpoint, client })
    }

    pub async fn init_upload(&self, request: &InitUploadRequest) -> Result<InitUploadResponse, UploadError> {
        let url = self.url("api/recordings/upload/init")?;
        let res = self.client.post(url).json(request).send().await?;
        Self::parse(res).await
    }

    pub async fn complete_upload(
        &self,
        request: &CompleteUploadRequest,
    ) -> Result<CompleteUploadResponse, UploadError> {
        let url = self.url("api/recordings/upload/complete")?;
        let res = self.client.post(url).json(request).send().await?;
        Self::parse(res).await
    }

    fn url(&self, path: &str) -> Result<Url, UploadError> {
        self.endpoint
            .join(path)
            .map_err(|e| UploadError::Config(format!("Invalid API path {path}: {e}")))
    }

    async fn parse<T: DeserializeOwned>(res: Response) -> Result<T, UploadError> {
        let status = res.status();
        if status.is_success() {
            return Ok(res.json().await?);
        }
        let text = res.text().await.unwrap_or_default();
        let (message, code) = match serde_json::from_str::<ApiErrorBody>(&text) {
            Ok(body) => (body.error, body.code),
            Err(_) => (text, None),
        };
        Err(UploadError::Api {
            status: status.as_u16(),
            code,
            message,
        })
    }
}
