//! Remote batch API client.
//!
//! `BatchClient` is the seam the chunk driver works against; the HTTP
//! implementation targets the OpenAI-compatible batch surface (file upload,
//! batch create, status poll, content download, best-effort cancel).

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart;
use reqwest::{Client, StatusCode};
use serde_json::Value as JsonValue;
use thiserror::Error;
use url::Url;

use crate::store::BatchJobInfo;

/// Per-request timeouts; a batch may run for 24 hours but each call is short.
pub const UPLOAD_TIMEOUT: Duration = Duration::from_secs(300);
pub const CREATE_TIMEOUT: Duration = Duration::from_secs(30);
pub const POLL_TIMEOUT: Duration = Duration::from_secs(10);
pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(120);
pub const CANCEL_TIMEOUT: Duration = Duration::from_secs(10);

/// Remote completion window requested for every batch.
const COMPLETION_WINDOW: &str = "24h";
const ENDPOINT: &str = "/v1/chat/completions";
const ERROR_BODY_LIMIT: usize = 512;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid base url `{url}`: {source}")]
    InvalidBaseUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("remote returned HTTP {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("remote response missing `{field}`")]
    MissingField { field: &'static str },
    #[error("failed to read chunk file {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Operations the scheduler needs from any compatible batch-serving remote.
#[async_trait]
pub trait BatchClient: Send + Sync {
    /// Upload one chunk file; returns the remote file handle.
    async fn upload_file(&self, path: &Path) -> Result<String, ClientError>;

    /// Create a batch over a previously uploaded file; returns the batch handle.
    async fn create_batch(&self, upload_file_id: &str) -> Result<String, ClientError>;

    /// Fetch the current status snapshot of a batch.
    async fn get_batch(&self, batch_id: &str) -> Result<BatchJobInfo, ClientError>;

    /// Download the content of a remote file (output or error file).
    async fn get_file_content(&self, file_id: &str) -> Result<Vec<u8>, ClientError>;

    /// Best-effort cancellation; callers never block task state on the result.
    async fn cancel_batch(&self, batch_id: &str) -> Result<(), ClientError>;
}

/// `BatchClient` over HTTP with bearer authentication.
#[derive(Debug, Clone)]
pub struct HttpBatchClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl HttpBatchClient {
    pub fn new(base_url: &str, token: &str) -> Result<Self, ClientError> {
        let base_url = Url::parse(base_url).map_err(|source| ClientError::InvalidBaseUrl {
            url: base_url.to_string(),
            source,
        })?;
        Ok(Self {
            http: Client::new(),
            base_url,
            token: token.to_string(),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, ClientError> {
        self.base_url
            .join(path)
            .map_err(|source| ClientError::InvalidBaseUrl {
                url: path.to_string(),
                source,
            })
    }
}

#[async_trait]
impl BatchClient for HttpBatchClient {
    async fn upload_file(&self, path: &Path) -> Result<String, ClientError> {
        let data = tokio::fs::read(path)
            .await
            .map_err(|source| ClientError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("chunk.jsonl")
            .to_string();

        let form = multipart::Form::new()
            .text("purpose", "batch")
            .part("file", multipart::Part::bytes(data).file_name(filename));

        let response = self
            .http
            .post(self.endpoint("/v1/files")?)
            .bearer_auth(&self.token)
            .multipart(form)
            .timeout(UPLOAD_TIMEOUT)
            .send()
            .await?;
        let body = read_success_json(response).await?;
        extract_id(&body)
    }

    async fn create_batch(&self, upload_file_id: &str) -> Result<String, ClientError> {
        debug_assert!(!upload_file_id.is_empty());
        let payload = serde_json::json!({
            "input_file_id": upload_file_id,
            "endpoint": ENDPOINT,
            "completion_window": COMPLETION_WINDOW,
            "metadata": {"description": "batchline"},
        });

        let response = self
            .http
            .post(self.endpoint("/v1/batches")?)
            .bearer_auth(&self.token)
            .json(&payload)
            .timeout(CREATE_TIMEOUT)
            .send()
            .await?;
        let body = read_success_json(response).await?;
        extract_id(&body)
    }

    async fn get_batch(&self, batch_id: &str) -> Result<BatchJobInfo, ClientError> {
        debug_assert!(!batch_id.is_empty());
        let response = self
            .http
            .get(self.endpoint(&format!("/v1/batches/{batch_id}"))?)
            .bearer_auth(&self.token)
            .timeout(POLL_TIMEOUT)
            .send()
            .await?;
        let body = read_success_json(response).await?;
        let mut info: BatchJobInfo =
            serde_json::from_value(body).map_err(|_| ClientError::MissingField {
                field: "status",
            })?;
        // The remote sends empty strings where it means "no file".
        if info.output_file_id.as_deref() == Some("") {
            info.output_file_id = None;
        }
        if info.error_file_id.as_deref() == Some("") {
            info.error_file_id = None;
        }
        Ok(info)
    }

    async fn get_file_content(&self, file_id: &str) -> Result<Vec<u8>, ClientError> {
        debug_assert!(!file_id.is_empty());
        let response = self
            .http
            .get(self.endpoint(&format!("/v1/files/{file_id}/content"))?)
            .bearer_auth(&self.token)
            .timeout(DOWNLOAD_TIMEOUT)
            .send()
            .await?;
        let response = ensure_success(response).await?;
        Ok(response.bytes().await?.to_vec())
    }

    async fn cancel_batch(&self, batch_id: &str) -> Result<(), ClientError> {
        debug_assert!(!batch_id.is_empty());
        let response = self
            .http
            .post(self.endpoint(&format!("/v1/batches/{batch_id}/cancel"))?)
            .bearer_auth(&self.token)
            .timeout(CANCEL_TIMEOUT)
            .send()
            .await?;
        ensure_success(response).await?;
        Ok(())
    }
}

async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let mut body = response.text().await.unwrap_or_default();
    if body.len() > ERROR_BODY_LIMIT {
        let mut end = ERROR_BODY_LIMIT;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        body.truncate(end);
    }
    Err(ClientError::Status { status, body })
}

async fn read_success_json(response: reqwest::Response) -> Result<JsonValue, ClientError> {
    let response = ensure_success(response).await?;
    Ok(response.json::<JsonValue>().await?)
}

fn extract_id(body: &JsonValue) -> Result<String, ClientError> {
    body.get("id")
        .and_then(JsonValue::as_str)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .ok_or(ClientError::MissingField { field: "id" })
}
