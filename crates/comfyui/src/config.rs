//! Session configuration for a ComfyUI server.

use std::path::PathBuf;
use std::time::Duration;

use crate::reconnect::ReconnectConfig;

const DEFAULT_SERVER_ADDRESS: &str = "127.0.0.1:8188";

/// Errors from loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} must be {expected}, got '{value}'")]
    Invalid {
        var: &'static str,
        expected: &'static str,
        value: String,
    },
}

/// Connection and output settings for one ComfyUI session.
#[derive(Debug, Clone)]
pub struct ComfyUIConfig {
    /// HTTP base URL without a trailing slash, e.g. `http://127.0.0.1:8188`.
    pub api_url: String,
    /// WebSocket base URL, e.g. `ws://127.0.0.1:8188`.
    pub ws_url: String,
    /// Stable client id used for the event connection and every submission,
    /// so that events for our prompts are addressed to us across reconnects.
    pub client_id: String,
    /// Root directory for materialized artifacts.
    pub output_root: PathBuf,
    /// Directory holding workflow templates (`{name}.json`).
    pub workflow_root: PathBuf,
    pub request_timeout: Duration,
    /// How long a requested cancel may stay unconfirmed before the entry
    /// is cancelled locally.
    pub cancel_timeout: Duration,
    pub reconnect: ReconnectConfig,
}

impl ComfyUIConfig {
    /// Configuration for `address` with every other setting at its default.
    pub fn for_address(address: &str) -> Self {
        let (api_url, ws_url) = server_urls(address);
        Self {
            api_url,
            ws_url,
            client_id: uuid::Uuid::new_v4().to_string(),
            output_root: PathBuf::from("output"),
            workflow_root: PathBuf::from("workflows"),
            request_timeout: Duration::from_secs(30),
            cancel_timeout: Duration::from_secs(10),
            reconnect: ReconnectConfig::default(),
        }
    }

    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                      | Default          |
    /// |------------------------------|------------------|
    /// | `COMFY_SERVER_ADDRESS`       | `127.0.0.1:8188` |
    /// | `BOWSER_OUTPUT_ROOT`         | `output`         |
    /// | `BOWSER_WORKFLOW_ROOT`       | `workflows`      |
    /// | `COMFY_CLIENT_ID`            | random UUID      |
    /// | `COMFY_REQUEST_TIMEOUT_SECS` | `30`             |
    /// | `COMFY_CANCEL_TIMEOUT_SECS`  | `10`             |
    /// | `COMFY_RECONNECT_INITIAL_MS` | `1000`           |
    /// | `COMFY_RECONNECT_MAX_SECS`   | `30`             |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let address = lookup("COMFY_SERVER_ADDRESS").unwrap_or_else(|| DEFAULT_SERVER_ADDRESS.into());
        let mut config = Self::for_address(&address);

        if let Some(root) = lookup("BOWSER_OUTPUT_ROOT") {
            config.output_root = PathBuf::from(root);
        }
        if let Some(root) = lookup("BOWSER_WORKFLOW_ROOT") {
            config.workflow_root = PathBuf::from(root);
        }
        if let Some(id) = lookup("COMFY_CLIENT_ID").filter(|id| !id.trim().is_empty()) {
            config.client_id = id.trim().to_string();
        }
        if let Some(secs) = parse_u64(&lookup, "COMFY_REQUEST_TIMEOUT_SECS")? {
            config.request_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_u64(&lookup, "COMFY_CANCEL_TIMEOUT_SECS")? {
            config.cancel_timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = parse_u64(&lookup, "COMFY_RECONNECT_INITIAL_MS")? {
            config.reconnect.initial_delay = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_u64(&lookup, "COMFY_RECONNECT_MAX_SECS")? {
            config.reconnect.max_delay = Duration::from_secs(secs);
        }

        Ok(config)
    }
}

fn parse_u64(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<u64>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid {
                var,
                expected: "a non-negative integer",
                value,
            }),
    }
}

/// Derive `(http, ws)` base URLs from a server address that may or may not
/// carry a scheme.
fn server_urls(address: &str) -> (String, String) {
    let address = address.trim().trim_end_matches('/');
    if let Some(host) = address.strip_prefix("https://") {
        (format!("https://{host}"), format!("wss://{host}"))
    } else if let Some(host) = address.strip_prefix("http://") {
        (format!("http://{host}"), format!("ws://{host}"))
    } else {
        (format!("http://{address}"), format!("ws://{address}"))
    }
}
