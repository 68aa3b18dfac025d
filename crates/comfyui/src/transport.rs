//! The request/response seam between the queue and the server.
//!
//! [`Transport`] is what the queue, the materializer and the session
//! manager depend on; [`ComfyUIApi`] is the HTTP implementation.

use std::path::Path;

use async_trait::async_trait;
use bowser_core::graph::ExecutionGraph;
use bowser_core::types::{CorrelationId, ServerId};

use crate::api::{ComfyUIApi, SubmissionAck, TransportError};
use crate::outputs::{parse_history, ArtifactRef, HistoryOutcome};
use crate::stats::SystemStats;

/// What the server currently knows about a job.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteStatus {
    Pending,
    Running,
    Completed { outputs: Vec<ArtifactRef> },
    Failed { message: String },
    /// Neither queued nor in history: restarted server or evicted history.
    Unknown,
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn submit(
        &self,
        graph: &ExecutionGraph,
        correlation_id: &CorrelationId,
    ) -> Result<SubmissionAck, TransportError>;

    /// Drop `server_id` from the server's pending queue. A job that is no
    /// longer pending is not an error.
    async fn remove_pending(&self, server_id: &ServerId) -> Result<(), TransportError>;

    /// Stop `server_id` while it executes. Older servers ignore the id and
    /// stop whatever is running, so only call this for a job the server
    /// reports as running.
    async fn interrupt(&self, server_id: &ServerId) -> Result<(), TransportError>;

    async fn fetch_artifact(&self, artifact: &ArtifactRef) -> Result<Vec<u8>, TransportError>;

    async fn fetch_stats(&self) -> Result<SystemStats, TransportError>;

    async fn fetch_status(&self, server_id: &ServerId) -> Result<RemoteStatus, TransportError>;

    /// Upload a local image or video; returns the server-side name.
    async fn upload_image(&self, path: &Path) -> Result<String, TransportError>;
}

#[async_trait]
impl Transport for ComfyUIApi {
    async fn submit(
        &self,
        graph: &ExecutionGraph,
        correlation_id: &CorrelationId,
    ) -> Result<SubmissionAck, TransportError> {
        self.submit_workflow(graph, correlation_id).await
    }

    async fn remove_pending(&self, server_id: &ServerId) -> Result<(), TransportError> {
        self.cancel_execution(server_id).await
    }

    async fn interrupt(&self, server_id: &ServerId) -> Result<(), TransportError> {
        ComfyUIApi::interrupt(self, server_id).await
    }

    async fn fetch_artifact(&self, artifact: &ArtifactRef) -> Result<Vec<u8>, TransportError> {
        self.view(artifact).await
    }

    async fn fetch_stats(&self) -> Result<SystemStats, TransportError> {
        self.system_stats().await
    }

    async fn fetch_status(&self, server_id: &ServerId) -> Result<RemoteStatus, TransportError> {
        let listing = self.get_queue().await?;
        if listing.running.contains(server_id) {
            return Ok(RemoteStatus::Running);
        }
        if listing.pending.contains(server_id) {
            return Ok(RemoteStatus::Pending);
        }

        let history = self.get_history(server_id).await?;
        Ok(match parse_history(server_id.as_str(), &history) {
            Some(HistoryOutcome::Success(outputs)) => RemoteStatus::Completed { outputs },
            Some(HistoryOutcome::Error(message)) => RemoteStatus::Failed { message },
            None => RemoteStatus::Unknown,
        })
    }

    async fn upload_image(&self, path: &Path) -> Result<String, TransportError> {
        ComfyUIApi::upload_image(self, path).await
    }
}
