//! Exponential-backoff reconnection for the event connection.
//!
//! The connection itself never retries; after a drop or a failed connect
//! the session loop calls [`reconnect_loop`], which keeps trying with
//! growing delays until a connection is restored or the
//! [`CancellationToken`] fires.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::client::{ComfyUIClient, ComfyUIConnection};

/// Backoff settings; the defaults give 1s, 2s, 4s ... capped at 30s.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    pub initial_delay: Duration,
    /// Cap on any single wait.
    pub max_delay: Duration,
    pub growth: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            growth: 2.0,
        }
    }
}

/// Successive waits between attempts. Never ends.
#[derive(Debug, Clone)]
pub struct Backoff {
    upcoming: Duration,
    cap: Duration,
    growth: f64,
}

impl Backoff {
    pub fn new(config: &ReconnectConfig) -> Self {
        Self {
            upcoming: config.initial_delay.min(config.max_delay),
            cap: config.max_delay,
            growth: config.growth.max(1.0),
        }
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let wait = self.upcoming;
        let grown = Duration::try_from_secs_f64(wait.as_secs_f64() * self.growth).unwrap_or(self.cap);
        self.upcoming = grown.min(self.cap);
        Some(wait)
    }
}

/// Sleep, then connect, until a connection is made or `cancel` fires.
///
/// Returns `None` only on cancellation.
pub async fn reconnect_loop(
    client: &ComfyUIClient,
    config: &ReconnectConfig,
    cancel: &CancellationToken,
) -> Option<ComfyUIConnection> {
    let mut waits = Backoff::new(config);
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let wait = waits.next().unwrap_or(config.max_delay);
        tracing::info!(
            attempt,
            wait_ms = wait.as_millis() as u64,
            url = client.ws_url(),
            "Waiting before ComfyUI reconnect",
        );

        let attempt_result = tokio::select! {
            _ = cancel.cancelled() => None,
            result = async {
                tokio::time::sleep(wait).await;
                client.connect().await
            } => Some(result),
        };

        match attempt_result {
            None => {
                tracing::info!(attempt, "Reconnect abandoned on shutdown");
                return None;
            }
            Some(Ok(conn)) => {
                tracing::info!(attempt, "Event connection restored");
                return Some(conn);
            }
            Some(Err(e)) => tracing::warn!(attempt, error = %e, "Reconnect attempt failed"),
        }
    }
}
