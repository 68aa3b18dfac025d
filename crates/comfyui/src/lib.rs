//! ComfyUI job queue and generation client.
//!
//! Provides the HTTP and WebSocket transports, typed message and binary
//! frame parsing, the job queue actor with its entry state machine, result
//! materialization, and the session manager that connects them.

pub mod api;
pub mod binary;
pub mod client;
pub mod config;
pub mod entry;
pub mod events;
pub mod manager;
pub mod materializer;
pub mod messages;
pub mod outputs;
pub mod processor;
pub mod queue;
pub mod reconnect;
pub mod stats;
pub mod transport;

pub use entry::{JobEntry, JobEvent, JobState};
pub use manager::{ComfyUIManager, SubmitError};
pub use queue::{CancelOutcome, QueueError, QueueHandle, QueueView};
