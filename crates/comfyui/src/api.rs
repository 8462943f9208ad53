//! REST API client for the ComfyUI HTTP endpoints.
//!
//! Wraps the ComfyUI HTTP API (workflow submission, history retrieval,
//! artifact download, interruption, queue management) using [`reqwest`].
//! [`ComfyBackend`] is the seam the rest of the relay talks to, so the
//! HTTP client can be swapped for an in-memory fake in tests.

use async_trait::async_trait;
use bytes::Bytes;
use relay_core::output::LocationClass;
use serde::Deserialize;
use serde_json::{Map, Value};

/// Response returned by the ComfyUI `/prompt` endpoint after
/// successfully queuing a workflow.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitResponse {
    /// Server-assigned identifier for the queued prompt.
    pub prompt_id: String,
    /// Position in the execution queue.
    #[serde(default)]
    pub number: i64,
}

/// Recorded outcome of one prompt from `/history/{prompt_id}`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobHistory {
    /// Node id -> output record, in the order the backend recorded them.
    #[serde(default)]
    pub outputs: Map<String, Value>,
    #[serde(default)]
    pub status: Option<Value>,
}

/// Snapshot of `/queue`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStatus {
    pub running: usize,
    pub pending: usize,
}

impl QueueStatus {
    pub fn is_idle(&self) -> bool {
        self.running == 0 && self.pending == 0
    }
}

/// Errors from the ComfyUI REST API layer.
#[derive(Debug, thiserror::Error)]
pub enum ComfyUIApiError {
    /// The HTTP request itself failed (network, DNS, TLS, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// `/prompt` refused the workflow before queuing it.
    #[error("Workflow rejected ({status}): {body}")]
    SubmissionRejected {
        status: u16,
        /// Backend validation payload (usually JSON with `error` and `node_errors`).
        body: String,
    },

    /// ComfyUI returned a non-2xx status code.
    #[error("ComfyUI API error ({status}): {body}")]
    ApiError {
        /// HTTP status code.
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },

    /// The backend has no history record for the prompt.
    #[error("No history for prompt {0}")]
    NotFound(String),
}

/// Operations the relay needs from a generation backend.
#[async_trait]
pub trait ComfyBackend: Send + Sync {
    /// Queue a workflow. `prompt_id` is a caller-chosen id the backend
    /// adopts; the id in the response is authoritative.
    async fn submit(
        &self,
        workflow: &Value,
        client_id: &str,
        prompt_id: &str,
    ) -> Result<SubmitResponse, ComfyUIApiError>;

    async fn fetch_history(&self, prompt_id: &str) -> Result<JobHistory, ComfyUIApiError>;

    async fn fetch_artifact(
        &self,
        filename: &str,
        subfolder: &str,
        location: LocationClass,
    ) -> Result<Bytes, ComfyUIApiError>;

    /// Interrupt execution. `None` interrupts whatever is running.
    async fn interrupt(&self, prompt_id: Option<&str>) -> Result<(), ComfyUIApiError>;

    /// Remove pending prompts from the queue.
    async fn delete_queued(&self, prompt_ids: &[String]) -> Result<(), ComfyUIApiError>;

    async fn queue_status(&self) -> Result<QueueStatus, ComfyUIApiError>;
}

/// HTTP client for a single ComfyUI instance.
pub struct ComfyUIApi {
    client: reqwest::Client,
    api_url: String,
}

impl ComfyUIApi {
    /// Create a new API client for a ComfyUI instance.
    ///
    /// * `api_url` - Base HTTP URL, e.g. `http://host:8188`.
    pub fn new(api_url: String) -> Self {
        Self::with_client(reqwest::Client::new(), api_url)
    }

    /// Create an API client reusing an existing [`reqwest::Client`].
    pub fn with_client(client: reqwest::Client, api_url: String) -> Self {
        Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    // ---- private helpers ----

    /// Ensure the response has a success status code. Returns the
    /// response unchanged on success, or a [`ComfyUIApiError::ApiError`]
    /// containing the status and body text on failure.
    async fn ensure_success(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, ComfyUIApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(ComfyUIApiError::ApiError {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    /// Parse a successful JSON response body into the expected type.
    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ComfyUIApiError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }

    /// Assert the response has a success status code, discarding the body.
    async fn check_status(response: reqwest::Response) -> Result<(), ComfyUIApiError> {
        Self::ensure_success(response).await?;
        Ok(())
    }
}

#[async_trait]
impl ComfyBackend for ComfyUIApi {
    /// Sends `POST /prompt`. A 4xx answer means the backend validated the
    /// graph and refused it; that is reported as
    /// [`ComfyUIApiError::SubmissionRejected`] so callers can tell it apart
    /// from transport failures.
    async fn submit(
        &self,
        workflow: &Value,
        client_id: &str,
        prompt_id: &str,
    ) -> Result<SubmitResponse, ComfyUIApiError> {
        let body = serde_json::json!({
            "prompt": workflow,
            "client_id": client_id,
            "prompt_id": prompt_id,
        });

        let response = self
            .client
            .post(format!("{}/prompt", self.api_url))
            .json(&body)
            .send()
            .await?;

        match Self::parse_response(response).await {
            Err(ComfyUIApiError::ApiError { status, body }) if (400..500).contains(&status) => {
                Err(ComfyUIApiError::SubmissionRejected { status, body })
            }
            other => other,
        }
    }

    /// Sends `GET /history/{prompt_id}`. The body is keyed by prompt id;
    /// an empty object means the prompt is unknown or still running.
    async fn fetch_history(&self, prompt_id: &str) -> Result<JobHistory, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/history/{}", self.api_url, prompt_id))
            .send()
            .await?;

        let mut body: Map<String, Value> = Self::parse_response(response).await?;
        let record = body
            .remove(prompt_id)
            .ok_or_else(|| ComfyUIApiError::NotFound(prompt_id.to_string()))?;

        serde_json::from_value(record).map_err(|e| ComfyUIApiError::ApiError {
            status: 200,
            body: format!("Malformed history record: {e}"),
        })
    }

    /// Sends `GET /view?filename=&subfolder=&type=`.
    async fn fetch_artifact(
        &self,
        filename: &str,
        subfolder: &str,
        location: LocationClass,
    ) -> Result<Bytes, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/view", self.api_url))
            .query(&[
                ("filename", filename),
                ("subfolder", subfolder),
                ("type", location.as_str()),
            ])
            .send()
            .await?;

        let response = Self::ensure_success(response).await?;
        Ok(response.bytes().await?)
    }

    /// Sends `POST /interrupt`, targeted when a prompt id is given.
    async fn interrupt(&self, prompt_id: Option<&str>) -> Result<(), ComfyUIApiError> {
        let mut request = self.client.post(format!("{}/interrupt", self.api_url));
        if let Some(prompt_id) = prompt_id {
            request = request.json(&serde_json::json!({ "prompt_id": prompt_id }));
        }

        let response = request.send().await?;
        Self::check_status(response).await
    }

    /// Sends `POST /queue` with a `delete` list.
    async fn delete_queued(&self, prompt_ids: &[String]) -> Result<(), ComfyUIApiError> {
        let body = serde_json::json!({
            "delete": prompt_ids,
        });

        let response = self
            .client
            .post(format!("{}/queue", self.api_url))
            .json(&body)
            .send()
            .await?;

        Self::check_status(response).await
    }

    /// Sends `GET /queue` and counts running and pending entries.
    async fn queue_status(&self) -> Result<QueueStatus, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/queue", self.api_url))
            .send()
            .await?;

        let body: Value = Self::parse_response(response).await?;
        Ok(queue_status_from_json(&body))
    }
}

fn queue_status_from_json(body: &Value) -> QueueStatus {
    let count = |key: &str| body.get(key).and_then(Value::as_array).map_or(0, Vec::len);
    QueueStatus {
        running: count("queue_running"),
        pending: count("queue_pending"),
    }
}
