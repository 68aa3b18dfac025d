//! Change notifications published by the job queue.
//!
//! Subscribers receive these over a [`tokio::sync::broadcast`] channel and
//! read the details from the current [`crate::queue::QueueView`]; events
//! carry identifiers, not entry copies.

use bowser_core::types::EntryId;
use serde::Serialize;

use crate::entry::JobState;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum QueueEvent {
    EntryAdded { id: EntryId },

    /// State, progress, outputs or server binding of an entry changed.
    EntryUpdated { id: EntryId, state: JobState },

    /// Terminal entries removed by `clear_history`.
    EntriesRemoved { ids: Vec<EntryId> },

    /// A new preview frame is attached to the entry.
    Preview { id: EntryId },

    /// Materialization finished for a completed entry.
    Materialized {
        id: EntryId,
        written: usize,
        failed: usize,
    },

    /// Server queue depth from a `status` frame.
    ServerQueue { remaining: u32 },

    /// The event connection was established.
    Connected,

    /// The event connection was lost.
    Disconnected,
}
