//! WebSocket message processing loop.
//!
//! Reads raw frames from a ComfyUI WebSocket connection, turns each
//! job-scoped control frame into exactly one [`JobEvent`] for the queue,
//! and attributes binary preview frames to the prompt that is running.

use bowser_core::types::ServerId;
use futures::{Stream, StreamExt};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;

use crate::binary::{decode_binary, BinaryFrame, PreviewFrame};
use crate::client::StreamError;
use crate::entry::{ErrorInfo, ErrorKind, JobEvent};
use crate::messages::{is_known_kind, message_type, parse_message, ComfyUIMessage};
use crate::outputs::parse_node_output;
use crate::queue::{QueueError, QueueHandle};

/// Translates the event stream of one connection into queue updates.
///
/// Create a fresh dispatcher per connection: arming state does not survive
/// a reconnect.
pub struct EventDispatcher {
    queue: QueueHandle,
    /// Prompt that binary frames without metadata belong to.
    armed: Option<ServerId>,
    /// Prompt of the most recent `execution_start`, for `progress` frames
    /// that carry no `prompt_id`.
    last_started: Option<ServerId>,
}

impl EventDispatcher {
    pub fn new(queue: QueueHandle) -> Self {
        Self {
            queue,
            armed: None,
            last_started: None,
        }
    }

    pub fn armed(&self) -> Option<&ServerId> {
        self.armed.as_ref()
    }

    /// Process frames until the stream closes, fails, or `cancel` fires.
    ///
    /// Returns `Ok(())` on cancellation or when the queue has shut down,
    /// and `Err(StreamError::Disconnected)` when the connection is lost.
    pub async fn process_messages<S>(
        &mut self,
        stream: &mut S,
        cancel: &CancellationToken,
    ) -> Result<(), StreamError>
    where
        S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    {
        loop {
            let msg_result = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                next = stream.next() => match next {
                    Some(result) => result,
                    None => return Err(StreamError::Disconnected("stream ended".into())),
                },
            };

            let handled = match msg_result {
                Ok(Message::Text(text)) => self.handle_text(text.as_str()).await,
                Ok(Message::Binary(bytes)) => self.handle_binary(&bytes).await,
                Ok(Message::Ping(_) | Message::Pong(_)) => {
                    // Handled automatically by tungstenite.
                    Ok(())
                }
                Ok(Message::Close(frame)) => {
                    tracing::info!(?frame, "ComfyUI WebSocket closed");
                    return Err(StreamError::Disconnected("closed by server".into()));
                }
                Ok(Message::Frame(_)) => Ok(()),
                Err(e) => {
                    tracing::error!(error = %e, "WebSocket receive error");
                    return Err(StreamError::Disconnected(e.to_string()));
                }
            };

            if handled.is_err() {
                tracing::info!("Job queue closed, stopping event processing");
                return Ok(());
            }
        }
    }

    /// Dispatch a single text frame.
    pub async fn handle_text(&mut self, text: &str) -> Result<(), QueueError> {
        match parse_message(text) {
            Ok(msg) => self.handle_message(msg).await,
            Err(e) => {
                match message_type(text) {
                    Some(kind) if is_known_kind(&kind) => tracing::warn!(
                        kind = %kind,
                        error = %e,
                        raw_message = %text,
                        "Malformed ComfyUI message",
                    ),
                    Some(kind) => tracing::debug!(kind = %kind, "Skipping unhandled ComfyUI message"),
                    None => tracing::warn!(
                        error = %e,
                        raw_message = %text,
                        "Failed to parse ComfyUI message",
                    ),
                }
                Ok(())
            }
        }
    }

    /// Dispatch a single binary frame.
    pub async fn handle_binary(&mut self, bytes: &[u8]) -> Result<(), QueueError> {
        let frame = match decode_binary(bytes) {
            Ok(BinaryFrame::Preview(frame)) => frame,
            Ok(BinaryFrame::Ignored(kind)) => {
                tracing::trace!(kind, "Ignoring binary frame");
                return Ok(());
            }
            Err(e) => {
                tracing::warn!(error = %e, "Skipping malformed binary frame");
                return Ok(());
            }
        };

        let Some(server_id) = self.preview_owner(&frame) else {
            tracing::debug!(bytes = bytes.len(), "Dropping preview with no running prompt");
            return Ok(());
        };
        self.queue
            .apply_event(server_id, JobEvent::Preview(std::sync::Arc::new(frame)))
            .await
    }

    fn preview_owner(&self, frame: &PreviewFrame) -> Option<ServerId> {
        match &frame.prompt_id {
            Some(prompt_id) => Some(ServerId::from(prompt_id.as_str())),
            None => self.armed.clone(),
        }
    }

    async fn handle_message(&mut self, msg: ComfyUIMessage) -> Result<(), QueueError> {
        match msg {
            ComfyUIMessage::Status(data) => {
                let remaining = data.status.exec_info.queue_remaining;
                tracing::debug!(queue_remaining = remaining, "ComfyUI queue status");
                self.queue.set_server_queue(remaining).await
            }
            ComfyUIMessage::ExecutionStart(data) => {
                let server_id = ServerId::from(data.prompt_id);
                tracing::info!(prompt_id = %server_id, "Execution started");
                self.last_started = Some(server_id.clone());
                self.arm(&server_id);
                self.queue.apply_event(server_id, JobEvent::Started).await
            }
            ComfyUIMessage::ExecutionCached(data) => {
                let server_id = ServerId::from(data.prompt_id);
                tracing::debug!(prompt_id = %server_id, nodes = data.nodes.len(), "Execution used cache");
                self.arm(&server_id);
                self.queue
                    .apply_event(server_id, JobEvent::Cached { nodes: data.nodes })
                    .await
            }
            ComfyUIMessage::Executing(data) => {
                let Some(server_id) = data.prompt_id.map(ServerId::from).or_else(|| self.armed.clone())
                else {
                    tracing::debug!(node = ?data.node, "Executing frame without prompt");
                    return Ok(());
                };
                match data.node {
                    Some(node) => {
                        tracing::debug!(prompt_id = %server_id, node = %node, "Executing node");
                        self.arm(&server_id);
                        self.queue
                            .apply_event(server_id, JobEvent::Executing { node })
                            .await
                    }
                    None => {
                        // Older servers signal completion this way; after
                        // `execution_success` it is a no-op.
                        tracing::info!(
                            prompt_id = %server_id,
                            "Execution completed (all nodes done)",
                        );
                        self.disarm(&server_id);
                        self.queue
                            .apply_event(server_id, JobEvent::Completed { outputs: Vec::new() })
                            .await
                    }
                }
            }
            ComfyUIMessage::Progress(data) => {
                let prompt = data.prompt_id.map(ServerId::from).or_else(|| self.last_started.clone());
                let Some(server_id) = prompt else {
                    tracing::debug!(value = data.value, max = data.max, "Progress without prompt");
                    return Ok(());
                };
                tracing::debug!(
                    prompt_id = %server_id,
                    value = data.value,
                    max = data.max,
                    "Generation progress",
                );
                self.arm(&server_id);
                self.queue
                    .apply_event(
                        server_id,
                        JobEvent::Progress {
                            value: data.value,
                            max: data.max,
                        },
                    )
                    .await
            }
            ComfyUIMessage::Executed(data) => {
                let server_id = ServerId::from(data.prompt_id);
                let artifacts = parse_node_output(&data.node, &data.output);
                tracing::debug!(
                    prompt_id = %server_id,
                    node = %data.node,
                    artifacts = artifacts.len(),
                    "Node executed with output",
                );
                self.queue
                    .apply_event(server_id, JobEvent::NodeOutput { artifacts })
                    .await
            }
            ComfyUIMessage::ExecutionSuccess(data) => {
                let server_id = ServerId::from(data.prompt_id);
                tracing::info!(prompt_id = %server_id, "Execution succeeded");
                self.disarm(&server_id);
                self.queue
                    .apply_event(server_id, JobEvent::Completed { outputs: Vec::new() })
                    .await
            }
            ComfyUIMessage::ExecutionError(data) => {
                let server_id = ServerId::from(data.prompt_id);
                tracing::error!(
                    prompt_id = %server_id,
                    node_id = ?data.node_id,
                    error_type = %data.exception_type,
                    error_message = %data.exception_message,
                    "Execution error",
                );
                self.disarm(&server_id);
                let info = ErrorInfo {
                    kind: ErrorKind::Execution,
                    message: data.exception_message,
                    node_id: data.node_id,
                    node_type: data.node_type,
                    exception_type: Some(data.exception_type).filter(|t| !t.is_empty()),
                    traceback: data.traceback,
                };
                self.queue.apply_event(server_id, JobEvent::Failed(info)).await
            }
            ComfyUIMessage::ExecutionInterrupted(data) => {
                let server_id = ServerId::from(data.prompt_id);
                tracing::info!(prompt_id = %server_id, node_id = ?data.node_id, "Execution interrupted");
                self.disarm(&server_id);
                self.queue.apply_event(server_id, JobEvent::Interrupted).await
            }
        }
    }

    fn arm(&mut self, server_id: &ServerId) {
        if self.armed.as_ref() != Some(server_id) {
            self.armed = Some(server_id.clone());
        }
    }

    fn disarm(&mut self, server_id: &ServerId) {
        if self.armed.as_ref() == Some(server_id) {
            self.armed = None;
        }
        if self.last_started.as_ref() == Some(server_id) {
            self.last_started = None;
        }
    }
}
