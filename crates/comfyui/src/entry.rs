//! Queue entries and their lifecycle.
//!
//! ```text
//! Queued --(execution start)--> Running
//! Queued --(cancel before start)--> Cancelled
//! Running --(progress)--> Running
//! Running --(success)--> Completed
//! Running --(error)--> Failed
//! Running --(cancel confirmed)--> Cancelled
//! ```
//!
//! Completed, Failed and Cancelled are terminal. Transitions are pure:
//! [`JobEntry::apply`] returns the replacement entry, or `None` when the
//! event changes nothing. Only the queue actor calls it.

use std::path::PathBuf;
use std::sync::Arc;

use bowser_core::params::ParameterSet;
use bowser_core::types::{CorrelationId, EntryId, ServerId, Timestamp};
use serde::Serialize;

use crate::binary::PreviewFrame;
use crate::outputs::ArtifactRef;

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }
}

/// Step progress of the running node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub current: u64,
    pub total: u64,
}

impl Progress {
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.current as f64 / self.total as f64
        }
    }

    /// Whether `value / max` advances past the recorded fraction.
    fn advanced_by(&self, value: u64, max: u64) -> bool {
        if max == 0 || (value == self.current && max == self.total) {
            return false;
        }
        if self.total == 0 {
            return true;
        }
        u128::from(value.min(max)) * u128::from(self.total)
            >= u128::from(self.current) * u128::from(max)
    }
}

/// Origin of an entry's failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The server reported an execution error.
    Execution,
    /// The submission never reached the server's queue.
    Submission,
    /// The server no longer knows the job (restart or eviction).
    Lost,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
    pub node_id: Option<String>,
    pub node_type: Option<String>,
    pub exception_type: Option<String>,
    pub traceback: Vec<String>,
}

impl ErrorInfo {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            node_id: None,
            node_type: None,
            exception_type: None,
            traceback: Vec::new(),
        }
    }
}

/// What was submitted, kept for sidecar metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct JobMetadata {
    pub workflow_name: String,
    pub parameters: ParameterSet,
    pub seed: Option<u64>,
    pub original_prompt: Option<String>,
    pub graph_sha256: String,
    /// Server device at submission time, if known.
    pub device: Option<String>,
}

/// An artifact written to disk.
#[derive(Debug, Clone, PartialEq)]
pub struct MaterializedArtifact {
    pub path: PathBuf,
    pub sidecar: Option<PathBuf>,
    pub source: ArtifactRef,
    pub dimensions: Option<(u32, u32)>,
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// A job-scoped observation, from the event stream or from reconciliation.
#[derive(Debug, Clone)]
pub enum JobEvent {
    Started,
    Progress { value: u64, max: u64 },
    Executing { node: String },
    Cached { nodes: Vec<String> },
    NodeOutput { artifacts: Vec<ArtifactRef> },
    Preview(Arc<PreviewFrame>),
    Completed { outputs: Vec<ArtifactRef> },
    Failed(ErrorInfo),
    /// The server stopped the job (`execution_interrupted`).
    Interrupted,
    /// The server confirmed removal, or the cancel timeout elapsed.
    CancelConfirmed,
    /// Reconciliation found no trace of the job.
    Lost,
}

impl JobEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Progress { .. } => "progress",
            Self::Executing { .. } => "executing",
            Self::Cached { .. } => "cached",
            Self::NodeOutput { .. } => "node_output",
            Self::Preview(_) => "preview",
            Self::Completed { .. } => "completed",
            Self::Failed(_) => "failed",
            Self::Interrupted => "interrupted",
            Self::CancelConfirmed => "cancel_confirmed",
            Self::Lost => "lost",
        }
    }
}

// ---------------------------------------------------------------------------
// Entry
// ---------------------------------------------------------------------------

/// One submitted job.
#[derive(Debug, Clone)]
pub struct JobEntry {
    pub id: EntryId,
    pub correlation_id: CorrelationId,
    pub server_id: Option<ServerId>,
    pub state: JobState,
    pub progress: Progress,
    pub current_node: Option<String>,
    /// Server queue number from the submission acknowledgment.
    pub queue_position: Option<i64>,
    pub preview: Option<Arc<PreviewFrame>>,
    pub outputs: Vec<ArtifactRef>,
    pub error: Option<ErrorInfo>,
    pub cancel_requested: bool,
    /// The event connection dropped while this job was on the server, so
    /// some of its `executed` frames may never have arrived.
    pub missed_events: bool,
    pub materialized: Vec<MaterializedArtifact>,
    /// Set once materialization has been attempted for a completed entry.
    pub materialized_at: Option<Timestamp>,
    /// Non-fatal problems attached after the fact.
    pub diagnostics: Vec<String>,
    pub estimated_runtime_secs: Option<f64>,
    pub metadata: Arc<JobMetadata>,
    pub created_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub terminated_at: Option<Timestamp>,
}

impl JobEntry {
    pub fn new(
        id: EntryId,
        correlation_id: CorrelationId,
        metadata: Arc<JobMetadata>,
        estimated_runtime_secs: Option<f64>,
        now: Timestamp,
    ) -> Self {
        Self {
            id,
            correlation_id,
            server_id: None,
            state: JobState::Queued,
            progress: Progress::default(),
            current_node: None,
            queue_position: None,
            preview: None,
            outputs: Vec::new(),
            error: None,
            cancel_requested: false,
            missed_events: false,
            materialized: Vec::new(),
            materialized_at: None,
            diagnostics: Vec::new(),
            estimated_runtime_secs,
            metadata,
            created_at: now,
            started_at: None,
            terminated_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Terminal, and for completed entries, materialization has finished.
    pub fn is_settled(&self) -> bool {
        match self.state {
            JobState::Completed => self.materialized_at.is_some(),
            state => state.is_terminal(),
        }
    }

    /// Seconds between start and termination.
    pub fn generation_secs(&self) -> Option<f64> {
        let start = self.started_at?;
        let end = self.terminated_at?;
        Some((end - start).num_milliseconds() as f64 / 1000.0)
    }

    /// Apply a job event. Returns the replacement entry, or `None` when
    /// the event is a no-op (terminal entry, duplicate, stale progress).
    pub fn apply(&self, event: &JobEvent, now: Timestamp) -> Option<JobEntry> {
        if self.is_terminal() {
            return None;
        }

        let mut next = self.clone();
        match event {
            JobEvent::Started => {
                if self.state == JobState::Running {
                    return None;
                }
                next.mark_running(now);
            }
            JobEvent::Progress { value, max } => {
                let advanced = self.progress.advanced_by(*value, *max);
                if !advanced && self.state == JobState::Running {
                    return None;
                }
                if advanced {
                    next.progress = Progress {
                        current: (*value).min(*max),
                        total: *max,
                    };
                }
                next.mark_running(now);
            }
            JobEvent::Executing { node } => {
                if self.current_node.as_deref() == Some(node) && self.state == JobState::Running {
                    return None;
                }
                next.current_node = Some(node.clone());
                next.mark_running(now);
            }
            JobEvent::Cached { .. } => {
                if self.state == JobState::Running {
                    return None;
                }
                next.mark_running(now);
            }
            JobEvent::NodeOutput { artifacts } => {
                let added = merge_outputs(&mut next.outputs, artifacts);
                if !added && self.state == JobState::Running {
                    return None;
                }
                next.mark_running(now);
            }
            JobEvent::Preview(frame) => {
                next.preview = Some(Arc::clone(frame));
                next.mark_running(now);
            }
            JobEvent::Completed { outputs } => {
                merge_outputs(&mut next.outputs, outputs);
                next.progress.current = next.progress.total;
                next.terminate(JobState::Completed, now);
            }
            JobEvent::Failed(info) => {
                next.error = Some(info.clone());
                next.terminate(JobState::Failed, now);
            }
            JobEvent::Interrupted => {
                if !self.cancel_requested {
                    next.diagnostics.push("interrupted by the server".to_string());
                }
                next.terminate(JobState::Cancelled, now);
            }
            JobEvent::CancelConfirmed => {
                next.terminate(JobState::Cancelled, now);
            }
            JobEvent::Lost => {
                if self.cancel_requested {
                    next.terminate(JobState::Cancelled, now);
                } else {
                    next.error = Some(ErrorInfo::new(
                        ErrorKind::Lost,
                        "the server no longer knows this job",
                    ));
                    next.terminate(JobState::Failed, now);
                }
            }
        }
        Some(next)
    }

    /// Bind the server's acknowledgment. The server id is only set once.
    pub(crate) fn acknowledged(&self, server_id: &ServerId, number: i64) -> JobEntry {
        let mut next = self.clone();
        if next.server_id.is_none() {
            next.server_id = Some(server_id.clone());
        }
        if next.state == JobState::Queued {
            next.queue_position = Some(number);
        }
        next
    }

    /// Bind a server id learned from the event stream before the ack.
    pub(crate) fn bound_to(&self, server_id: &ServerId) -> JobEntry {
        let mut next = self.clone();
        next.server_id = Some(server_id.clone());
        next
    }

    /// The submission failed; only a queued entry is affected.
    pub(crate) fn submission_failed(&self, message: String, now: Timestamp) -> Option<JobEntry> {
        if self.state != JobState::Queued {
            return None;
        }
        let mut next = self.clone();
        next.error = Some(ErrorInfo::new(ErrorKind::Submission, message));
        next.terminate(JobState::Failed, now);
        Some(next)
    }

    pub(crate) fn with_cancel_requested(&self) -> JobEntry {
        let mut next = self.clone();
        next.cancel_requested = true;
        next
    }

    pub(crate) fn with_missed_events(&self) -> JobEntry {
        let mut next = self.clone();
        next.missed_events = true;
        next
    }

    /// Cancel without server involvement (no server job exists yet).
    pub(crate) fn cancelled_locally(&self, now: Timestamp) -> JobEntry {
        let mut next = self.with_cancel_requested();
        next.terminate(JobState::Cancelled, now);
        next
    }

    pub(crate) fn with_materialization(
        &self,
        written: Vec<MaterializedArtifact>,
        failures: Vec<String>,
        now: Timestamp,
    ) -> JobEntry {
        let mut next = self.clone();
        next.materialized.extend(written);
        next.diagnostics.extend(failures);
        next.materialized_at = Some(now);
        next
    }

    pub(crate) fn with_diagnostic(&self, message: impl Into<String>) -> JobEntry {
        let mut next = self.clone();
        next.diagnostics.push(message.into());
        next
    }

    fn mark_running(&mut self, now: Timestamp) {
        if self.state == JobState::Queued {
            self.state = JobState::Running;
            self.started_at = Some(now);
            self.queue_position = None;
        }
    }

    fn terminate(&mut self, state: JobState, now: Timestamp) {
        self.state = state;
        self.terminated_at = Some(now);
        self.current_node = None;
        self.queue_position = None;
        if self.started_at.is_none() && state == JobState::Completed {
            self.started_at = Some(now);
        }
    }
}

/// Append artifacts not already present. Returns whether any were added.
fn merge_outputs(outputs: &mut Vec<ArtifactRef>, incoming: &[ArtifactRef]) -> bool {
    let mut added = false;
    for artifact in incoming {
        if !outputs.iter().any(|o| o.same_file(artifact)) {
            outputs.push(artifact.clone());
            added = true;
        }
    }
    added
}
