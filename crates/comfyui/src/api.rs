//! REST API client for the ComfyUI HTTP endpoints.
//!
//! Wraps submission, cancellation, history, queue listing, artifact
//! download, stats and image upload using [`reqwest`]. Transport failures
//! are classified into [`TransportError`] so callers can tell an offline
//! server from a rejected graph.

use std::path::Path;

use bowser_core::graph::ExecutionGraph;
use bowser_core::types::{CorrelationId, ServerId};
use serde::Deserialize;

use crate::config::ComfyUIConfig;
use crate::outputs::ArtifactRef;
use crate::stats::SystemStats;

/// HTTP client for a single ComfyUI server.
pub struct ComfyUIApi {
    client: reqwest::Client,
    api_url: String,
    client_id: String,
}

/// Acknowledgment of a queued submission.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmissionAck {
    pub server_id: ServerId,
    /// Server queue number; lower runs first.
    pub number: i64,
    /// Per-node validation errors the server reported but tolerated.
    pub node_errors: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    prompt_id: String,
    #[serde(default)]
    number: i64,
    #[serde(default)]
    node_errors: serde_json::Value,
}

/// Prompt ids currently known to the server's queue.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueListing {
    pub running: Vec<ServerId>,
    pub pending: Vec<ServerId>,
}

/// Errors from the request/response transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The server could not be reached (refused, DNS, TLS, reset).
    #[error("ComfyUI unreachable: {0}")]
    Unreachable(String),

    /// The server refused the graph (HTTP 400).
    #[error("ComfyUI rejected the prompt: {message}")]
    Rejected {
        message: String,
        /// Per-node validation errors, verbatim.
        node_errors: serde_json::Value,
    },

    #[error("ComfyUI request timed out")]
    Timeout,

    /// Any other non-2xx status.
    #[error("ComfyUI API error ({status}): {body}")]
    Status { status: u16, body: String },

    /// The response body was not what the endpoint documents.
    #[error("Unexpected ComfyUI response: {0}")]
    Decode(String),

    /// A local file could not be read for upload.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if e.is_decode() {
            Self::Decode(e.to_string())
        } else {
            Self::Unreachable(e.to_string())
        }
    }
}

impl ComfyUIApi {
    /// Build a client from session configuration.
    pub fn new(config: &ComfyUIConfig) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self::with_client(
            client,
            config.api_url.clone(),
            config.client_id.clone(),
        ))
    }

    /// Create an API client reusing an existing [`reqwest::Client`].
    pub fn with_client(client: reqwest::Client, api_url: String, client_id: String) -> Self {
        Self {
            client,
            api_url,
            client_id,
        }
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Submit a graph for execution.
    ///
    /// Sends `POST /prompt` with the session client id and the correlation
    /// id as the requested `prompt_id`.
    pub async fn submit_workflow(
        &self,
        graph: &ExecutionGraph,
        correlation_id: &CorrelationId,
    ) -> Result<SubmissionAck, TransportError> {
        let body = serde_json::json!({
            "prompt": graph.to_json(),
            "client_id": self.client_id,
            "prompt_id": correlation_id.as_str(),
        });

        let response = self
            .client
            .post(format!("{}/prompt", self.api_url))
            .json(&body)
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::BAD_REQUEST {
            let body: serde_json::Value = response.json().await.unwrap_or_default();
            return Err(rejection(&body));
        }

        let parsed: SubmitResponse = Self::parse_response(response).await?;
        Ok(SubmissionAck {
            server_id: ServerId::from(parsed.prompt_id),
            number: parsed.number,
            node_errors: parsed.node_errors,
        })
    }

    /// Remove a pending prompt from the queue (`POST /queue`).
    pub async fn cancel_execution(&self, prompt_id: &ServerId) -> Result<(), TransportError> {
        let body = serde_json::json!({ "delete": [prompt_id.as_str()] });

        let response = self
            .client
            .post(format!("{}/queue", self.api_url))
            .json(&body)
            .send()
            .await?;

        Self::check_status(response).await
    }

    /// Interrupt a running prompt (`POST /interrupt`).
    ///
    /// Servers that understand `prompt_id` only interrupt when it is the one
    /// executing; older servers interrupt whatever is running.
    pub async fn interrupt(&self, prompt_id: &ServerId) -> Result<(), TransportError> {
        let body = serde_json::json!({ "prompt_id": prompt_id.as_str() });

        let response = self
            .client
            .post(format!("{}/interrupt", self.api_url))
            .json(&body)
            .send()
            .await?;

        Self::check_status(response).await
    }

    /// `GET /history/{prompt_id}`: outputs and status of a finished prompt.
    pub async fn get_history(&self, prompt_id: &ServerId) -> Result<serde_json::Value, TransportError> {
        let response = self
            .client
            .get(format!("{}/history/{}", self.api_url, prompt_id))
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// `GET /queue`: running and pending prompt ids.
    pub async fn get_queue(&self) -> Result<QueueListing, TransportError> {
        let response = self
            .client
            .get(format!("{}/queue", self.api_url))
            .send()
            .await?;

        let body: serde_json::Value = Self::parse_response(response).await?;
        Ok(parse_queue_listing(&body))
    }

    /// `GET /view`: download an artifact's bytes.
    pub async fn view(&self, artifact: &ArtifactRef) -> Result<Vec<u8>, TransportError> {
        let response = self
            .client
            .get(format!("{}/view", self.api_url))
            .query(&[
                ("filename", artifact.filename.as_str()),
                ("subfolder", artifact.subfolder.as_str()),
                ("type", artifact.kind.as_str()),
            ])
            .send()
            .await?;

        let response = Self::ensure_success(response).await?;
        Ok(response.bytes().await?.to_vec())
    }

    /// `GET /system_stats`.
    pub async fn system_stats(&self) -> Result<SystemStats, TransportError> {
        let response = self
            .client
            .get(format!("{}/system_stats", self.api_url))
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// `POST /upload/image`: copy a local file into the server's input
    /// folder. Returns the name to reference it by.
    pub async fn upload_image(&self, path: &Path) -> Result<String, TransportError> {
        let bytes = tokio::fs::read(path).await?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload.png".to_string());

        let form = reqwest::multipart::Form::new()
            .part(
                "image",
                reqwest::multipart::Part::bytes(bytes).file_name(file_name),
            )
            .text("type", "input")
            .text("overwrite", "false");

        let response = self
            .client
            .post(format!("{}/upload/image", self.api_url))
            .multipart(form)
            .send()
            .await?;

        let body: serde_json::Value = Self::parse_response(response).await?;
        uploaded_name(&body)
    }

    // ---- private helpers ----

    /// Ensure the response has a success status code. Returns the response
    /// unchanged on success, or a [`TransportError::Status`] carrying the
    /// status and body text on failure.
    async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, TransportError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(TransportError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, TransportError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }

    async fn check_status(response: reqwest::Response) -> Result<(), TransportError> {
        Self::ensure_success(response).await?;
        Ok(())
    }
}

/// Build a rejection from a `400` body:
/// `{"error": {"type", "message", "details"}, "node_errors": {...}}`.
fn rejection(body: &serde_json::Value) -> TransportError {
    let error = body.get("error");
    let message = error
        .and_then(|e| e.get("message"))
        .and_then(|m| m.as_str())
        .or_else(|| error.and_then(|e| e.as_str()))
        .unwrap_or("prompt rejected");
    let details = error
        .and_then(|e| e.get("details"))
        .and_then(|d| d.as_str())
        .filter(|d| !d.is_empty());

    TransportError::Rejected {
        message: match details {
            Some(d) => format!("{message}: {d}"),
            None => message.to_string(),
        },
        node_errors: body.get("node_errors").cloned().unwrap_or_default(),
    }
}

/// `queue_running` / `queue_pending` entries are tuples whose second item is
/// the prompt id.
fn parse_queue_listing(body: &serde_json::Value) -> QueueListing {
    let ids = |key: &str| -> Vec<ServerId> {
        body.get(key)
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item.get(1).and_then(|id| id.as_str()))
                    .map(ServerId::from)
                    .collect()
            })
            .unwrap_or_default()
    };
    QueueListing {
        running: ids("queue_running"),
        pending: ids("queue_pending"),
    }
}

/// Upload responses are `{"name", "subfolder", "type"}`; the reference name
/// includes the subfolder when there is one.
fn uploaded_name(body: &serde_json::Value) -> Result<String, TransportError> {
    let name = body
        .get("name")
        .and_then(|n| n.as_str())
        .ok_or_else(|| TransportError::Decode("upload response has no 'name'".into()))?;
    match body.get("subfolder").and_then(|s| s.as_str()) {
        Some(sub) if !sub.is_empty() => Ok(format!("{sub}/{name}")),
        _ => Ok(name.to_string()),
    }
}
