//! Event connection to a ComfyUI server.
//!
//! [`ComfyUIClient`] holds the WebSocket URL and the session's stable
//! client id. Call [`ComfyUIClient::connect`] to open a live
//! [`ComfyUIConnection`]; retries are the caller's business (see
//! [`crate::reconnect`]).

use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// The raw WebSocket stream type of a live connection.
pub type ComfyUIStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Errors on the event stream.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// The connection could not be opened or was lost.
    #[error("Event stream disconnected: {0}")]
    Disconnected(String),

    /// A frame could not be decoded. Skipped by the dispatcher.
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),
}

/// Connection settings for one ComfyUI event stream.
#[derive(Debug, Clone)]
pub struct ComfyUIClient {
    ws_url: String,
    client_id: String,
}

/// A live WebSocket connection to ComfyUI.
pub struct ComfyUIConnection {
    /// Client id sent during the handshake.
    pub client_id: String,
    pub ws_stream: ComfyUIStream,
}

impl ComfyUIClient {
    /// * `ws_url`    - WebSocket base URL, e.g. `ws://host:8188`.
    /// * `client_id` - the id also sent with every submission.
    pub fn new(ws_url: String, client_id: String) -> Self {
        Self { ws_url, client_id }
    }

    pub fn ws_url(&self) -> &str {
        &self.ws_url
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Full handshake URL: `{ws_url}/ws?clientId={client_id}`.
    pub fn endpoint(&self) -> String {
        format!("{}/ws?clientId={}", self.ws_url, self.client_id)
    }

    /// Open the event connection.
    pub async fn connect(&self) -> Result<ComfyUIConnection, StreamError> {
        let (ws_stream, _response) = connect_async(self.endpoint()).await.map_err(|e| {
            StreamError::Disconnected(format!(
                "failed to connect to ComfyUI at {}: {e}",
                self.ws_url
            ))
        })?;

        tracing::info!(
            client_id = %self.client_id,
            "Connected to ComfyUI at {}",
            self.ws_url,
        );

        Ok(ComfyUIConnection {
            client_id: self.client_id.clone(),
            ws_stream,
        })
    }
}
