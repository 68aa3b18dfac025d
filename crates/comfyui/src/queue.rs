//! The job queue actor.
//!
//! One task owns every [`JobEntry`] and processes commands from a bounded
//! channel. Network work (submission, cancellation, materialization) runs
//! in spawned tasks that report back through a weak sender, so the actor
//! stops once every [`QueueHandle`] is dropped.
//!
//! Readers never talk to the actor: each change publishes a complete
//! [`QueueView`] through a `watch` channel and a [`QueueEvent`] through a
//! broadcast channel.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use bowser_core::graph::ExecutionGraph;
use bowser_core::types::{CorrelationId, EntryId, ServerId};
use chrono::Utc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::api::{SubmissionAck, TransportError};
use crate::entry::{
    ErrorInfo, ErrorKind, JobEntry, JobEvent, JobMetadata, JobState, MaterializedArtifact,
};
use crate::events::QueueEvent;
use crate::materializer::ResultMaterializer;
use crate::transport::{RemoteStatus, Transport};

/// Broadcast channel capacity for queue events.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Command channel capacity.
const COMMAND_CHANNEL_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// A built graph ready for submission.
#[derive(Debug, Clone)]
pub struct Submission {
    /// Proposed as the server's `prompt_id`; unique within the queue.
    pub correlation_id: CorrelationId,
    pub graph: ExecutionGraph,
    pub metadata: JobMetadata,
    pub estimated_runtime_secs: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// How long a requested cancellation waits for the server before the
    /// entry is cancelled locally.
    pub cancel_timeout: Duration,
    pub command_capacity: usize,
    pub event_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            cancel_timeout: Duration::from_secs(10),
            command_capacity: COMMAND_CHANNEL_CAPACITY,
            event_capacity: EVENT_CHANNEL_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// No server job existed yet; the entry is cancelled.
    Cancelled,
    /// A server cancel is in flight.
    Requested,
    /// The entry had already terminated.
    TooLate,
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Queue entry {0} not found")]
    NotFound(EntryId),

    #[error("Correlation id {0} is already in use")]
    DuplicateCorrelation(CorrelationId),

    #[error("Job queue is closed")]
    Closed,
}

/// Outcome of a [`QueueHandle::reconcile`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Entries whose status was queried.
    pub checked: usize,
    /// Entries whose state changed.
    pub updated: usize,
    /// Status lookups that failed; those entries are left as they were.
    pub unreachable: usize,
}

/// Read-only projection of every entry, in creation order.
#[derive(Debug, Clone, Default)]
pub struct QueueView {
    entries: Arc<Vec<Arc<JobEntry>>>,
    /// Queue depth reported by the last `status` frame.
    pub server_queue_remaining: Option<u32>,
    pub connected: bool,
}

impl QueueView {
    pub fn entries(&self) -> &[Arc<JobEntry>] {
        &self.entries
    }

    pub fn get(&self, id: EntryId) -> Option<&Arc<JobEntry>> {
        self.entries
            .binary_search_by_key(&id, |e| e.id)
            .ok()
            .map(|i| &self.entries[i])
    }

    pub fn by_server_id(&self, server_id: &ServerId) -> Option<&Arc<JobEntry>> {
        self.entries
            .iter()
            .find(|e| e.server_id.as_ref() == Some(server_id))
    }

    pub fn active(&self) -> impl Iterator<Item = &Arc<JobEntry>> {
        self.entries.iter().filter(|e| !e.is_terminal())
    }

    /// Estimated seconds of work left across active entries. Running
    /// entries count only their remaining share.
    pub fn estimated_remaining_secs(&self) -> f64 {
        self.active()
            .filter_map(|e| {
                let total = e.estimated_runtime_secs?;
                Some(match e.state {
                    JobState::Running => total * (1.0 - e.progress.fraction()),
                    _ => total,
                })
            })
            .sum()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

enum Command {
    Enqueue {
        submission: Box<Submission>,
        reply: oneshot::Sender<Result<Arc<JobEntry>, QueueError>>,
    },
    SubmitAcked {
        id: EntryId,
        ack: SubmissionAck,
    },
    SubmitFailed {
        id: EntryId,
        error: TransportError,
    },
    Cancel {
        id: EntryId,
        reply: oneshot::Sender<Result<CancelOutcome, QueueError>>,
    },
    CancelFinished {
        id: EntryId,
        result: Result<RemoteStatus, String>,
    },
    CancelTimedOut {
        id: EntryId,
    },
    Apply {
        server_id: ServerId,
        event: JobEvent,
    },
    ServerQueue {
        remaining: u32,
    },
    Connection {
        connected: bool,
    },
    ClearHistory {
        reply: oneshot::Sender<usize>,
    },
    ReconcileTargets {
        reply: oneshot::Sender<Vec<ServerId>>,
    },
    RemoteStatus {
        server_id: ServerId,
        status: RemoteStatus,
        reply: oneshot::Sender<bool>,
    },
    MaterializationFinished {
        id: EntryId,
        written: Vec<MaterializedArtifact>,
        failures: Vec<String>,
    },
    Flush {
        reply: oneshot::Sender<()>,
    },
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Cloneable entry point to a running [`JobQueue`].
#[derive(Clone)]
pub struct QueueHandle {
    tx: mpsc::Sender<Command>,
    view: watch::Receiver<QueueView>,
    events: broadcast::Sender<QueueEvent>,
    transport: Arc<dyn Transport>,
}

impl QueueHandle {
    /// Create a Queued entry and submit it in the background.
    ///
    /// Returns as soon as the entry exists; the acknowledgment or the
    /// submission failure arrives later as an update. A correlation id
    /// already used by this queue is refused.
    pub async fn enqueue(&self, submission: Submission) -> Result<Arc<JobEntry>, QueueError> {
        self.request(|reply| Command::Enqueue {
            submission: Box::new(submission),
            reply,
        })
        .await?
    }

    pub async fn cancel(&self, id: EntryId) -> Result<CancelOutcome, QueueError> {
        self.request(|reply| Command::Cancel { id, reply }).await?
    }

    /// Route a job event to the entry owning `server_id`.
    pub async fn apply_event(&self, server_id: ServerId, event: JobEvent) -> Result<(), QueueError> {
        self.send(Command::Apply { server_id, event }).await
    }

    pub async fn set_server_queue(&self, remaining: u32) -> Result<(), QueueError> {
        self.send(Command::ServerQueue { remaining }).await
    }

    pub async fn set_connected(&self, connected: bool) -> Result<(), QueueError> {
        self.send(Command::Connection { connected }).await
    }

    /// Remove terminal entries. Returns how many were removed.
    pub async fn clear_history(&self) -> Result<usize, QueueError> {
        self.request(|reply| Command::ClearHistory { reply }).await
    }

    /// Wait until every command sent before this call has been processed.
    pub async fn flush(&self) -> Result<(), QueueError> {
        self.request(|reply| Command::Flush { reply }).await
    }

    /// Query the server for every active entry with a server id and apply
    /// what it reports.
    pub async fn reconcile(&self) -> Result<ReconcileReport, QueueError> {
        let targets = self
            .request(|reply| Command::ReconcileTargets { reply })
            .await?;

        let lookups = targets.into_iter().map(|server_id| {
            let transport = Arc::clone(&self.transport);
            async move {
                let status = transport.fetch_status(&server_id).await;
                (server_id, status)
            }
        });
        let results = futures::future::join_all(lookups).await;

        let mut report = ReconcileReport {
            checked: results.len(),
            ..ReconcileReport::default()
        };
        for (server_id, result) in results {
            match result {
                Ok(status) => {
                    let changed = self
                        .request(|reply| Command::RemoteStatus {
                            server_id,
                            status,
                            reply,
                        })
                        .await?;
                    if changed {
                        report.updated += 1;
                    }
                }
                Err(e) => {
                    tracing::warn!(server_id = %server_id, error = %e, "Status lookup failed");
                    report.unreachable += 1;
                }
            }
        }

        tracing::info!(
            checked = report.checked,
            updated = report.updated,
            unreachable = report.unreachable,
            "Queue reconciled",
        );
        Ok(report)
    }

    /// The latest published view.
    pub fn snapshot(&self) -> QueueView {
        self.view.borrow().clone()
    }

    /// A receiver that observes every published view.
    pub fn watch(&self) -> watch::Receiver<QueueView> {
        self.view.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    async fn send(&self, command: Command) -> Result<(), QueueError> {
        self.tx.send(command).await.map_err(|_| QueueError::Closed)
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, QueueError> {
        let (reply, rx) = oneshot::channel();
        self.send(make(reply)).await?;
        rx.await.map_err(|_| QueueError::Closed)
    }
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

/// Owner of all queue entries. Created with [`JobQueue::spawn`].
pub struct JobQueue {
    rx: mpsc::Receiver<Command>,
    tx: mpsc::WeakSender<Command>,
    transport: Arc<dyn Transport>,
    materializer: Option<Arc<ResultMaterializer>>,
    config: QueueConfig,
    entries: BTreeMap<EntryId, Arc<JobEntry>>,
    by_server: HashMap<ServerId, EntryId>,
    by_correlation: HashMap<CorrelationId, EntryId>,
    /// Server ids of entries removed by `clear_history`; never rebound.
    retired: HashSet<ServerId>,
    next_id: u64,
    server_queue_remaining: Option<u32>,
    connected: bool,
    view_tx: watch::Sender<QueueView>,
    events: broadcast::Sender<QueueEvent>,
    pending: Vec<QueueEvent>,
}

impl JobQueue {
    /// Start the actor on the current runtime.
    ///
    /// Without a materializer, completed entries are settled immediately.
    pub fn spawn(
        transport: Arc<dyn Transport>,
        materializer: Option<Arc<ResultMaterializer>>,
        config: QueueConfig,
    ) -> QueueHandle {
        let (tx, rx) = mpsc::channel(config.command_capacity.max(1));
        let (view_tx, view_rx) = watch::channel(QueueView::default());
        let (events, _) = broadcast::channel(config.event_capacity.max(1));

        let actor = Self {
            rx,
            tx: tx.downgrade(),
            transport: Arc::clone(&transport),
            materializer,
            config,
            entries: BTreeMap::new(),
            by_server: HashMap::new(),
            by_correlation: HashMap::new(),
            retired: HashSet::new(),
            next_id: 1,
            server_queue_remaining: None,
            connected: false,
            view_tx,
            events: events.clone(),
            pending: Vec::new(),
        };
        tokio::spawn(actor.run());

        QueueHandle {
            tx,
            view: view_rx,
            events,
            transport,
        }
    }

    async fn run(mut self) {
        tracing::debug!("Job queue started");
        while let Some(command) = self.rx.recv().await {
            let changed = self.handle(command);
            self.commit(changed);
        }
        tracing::debug!("Job queue stopped");
    }

    /// Process one command. Returns whether the view changed and is not
    /// yet committed.
    fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::Enqueue { submission, reply } => {
                let entry = self.enqueue(*submission);
                self.commit(entry.is_ok());
                let _ = reply.send(entry);
                false
            }
            Command::SubmitAcked { id, ack } => self.on_acked(id, ack),
            Command::SubmitFailed { id, error } => self.on_submit_failed(id, error),
            Command::Cancel { id, reply } => {
                let (outcome, changed) = self.cancel(id);
                self.commit(changed);
                let _ = reply.send(outcome);
                false
            }
            Command::CancelFinished { id, result } => self.on_cancel_finished(id, result),
            Command::CancelTimedOut { id } => self.on_cancel_timeout(id),
            Command::Apply { server_id, event } => self.apply(&server_id, &event),
            Command::ServerQueue { remaining } => {
                self.server_queue_remaining = Some(remaining);
                self.notify(QueueEvent::ServerQueue { remaining });
                true
            }
            Command::Connection { connected } => {
                if self.connected == connected {
                    return false;
                }
                self.connected = connected;
                if !connected {
                    self.mark_stream_gap();
                }
                self.notify(if connected {
                    QueueEvent::Connected
                } else {
                    QueueEvent::Disconnected
                });
                true
            }
            Command::ClearHistory { reply } => {
                let removed = self.clear_history();
                self.commit(removed > 0);
                let _ = reply.send(removed);
                false
            }
            Command::ReconcileTargets { reply } => {
                let targets = self
                    .entries
                    .values()
                    .filter(|e| !e.is_terminal())
                    .filter_map(|e| e.server_id.clone())
                    .collect();
                let _ = reply.send(targets);
                false
            }
            Command::RemoteStatus {
                server_id,
                status,
                reply,
            } => {
                let changed = match remote_event(status) {
                    Some(event) => self.apply(&server_id, &event),
                    None => false,
                };
                self.commit(changed);
                let _ = reply.send(changed);
                false
            }
            Command::MaterializationFinished {
                id,
                written,
                failures,
            } => self.on_materialized(id, written, failures),
            Command::Flush { reply } => {
                let _ = reply.send(());
                false
            }
        }
    }

    // ---- submission ----

    fn enqueue(&mut self, submission: Submission) -> Result<Arc<JobEntry>, QueueError> {
        let Submission {
            correlation_id,
            graph,
            metadata,
            estimated_runtime_secs,
        } = submission;
        if self.by_correlation.contains_key(&correlation_id)
            || self.retired.contains(&ServerId::from(correlation_id.as_str()))
        {
            return Err(QueueError::DuplicateCorrelation(correlation_id));
        }

        let id = EntryId(self.next_id);
        self.next_id += 1;
        let entry = Arc::new(JobEntry::new(
            id,
            correlation_id.clone(),
            Arc::new(metadata),
            estimated_runtime_secs,
            Utc::now(),
        ));
        self.entries.insert(id, Arc::clone(&entry));
        self.by_correlation.insert(correlation_id.clone(), id);

        tracing::info!(
            entry_id = %id,
            correlation_id = %correlation_id,
            workflow = %entry.metadata.workflow_name,
            "Entry queued",
        );
        self.notify(QueueEvent::EntryAdded { id });

        let transport = Arc::clone(&self.transport);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let command = match transport.submit(&graph, &correlation_id).await {
                Ok(ack) => Command::SubmitAcked { id, ack },
                Err(error) => Command::SubmitFailed { id, error },
            };
            report(&tx, command).await;
        });

        Ok(entry)
    }

    fn on_acked(&mut self, id: EntryId, ack: SubmissionAck) -> bool {
        let Some(entry) = self.entries.get(&id).cloned() else {
            tracing::debug!(entry_id = %id, "Acknowledgment for a removed entry");
            return false;
        };

        let owner = self.by_server.get(&ack.server_id).copied();
        if self.retired.contains(&ack.server_id) || owner.is_some_and(|o| o != id) {
            tracing::warn!(
                entry_id = %id,
                server_id = %ack.server_id,
                "Server id already belongs to another entry",
            );
            self.replace(entry.with_diagnostic(format!(
                "server id {} is already in use; events for it are ignored",
                ack.server_id
            )));
            return true;
        }
        if let Some(existing) = entry.server_id.as_ref().filter(|s| **s != ack.server_id) {
            tracing::warn!(
                entry_id = %id,
                bound = %existing,
                acknowledged = %ack.server_id,
                "Acknowledged server id differs from the bound one",
            );
            return false;
        }

        tracing::info!(
            entry_id = %id,
            server_id = %ack.server_id,
            number = ack.number,
            "Submission acknowledged",
        );
        self.by_server.insert(ack.server_id.clone(), id);
        let next = entry.acknowledged(&ack.server_id, ack.number);

        if entry.state == JobState::Cancelled {
            // Cancelled before the ack arrived; the server job must not run.
            self.spawn_server_cancel(id, ack.server_id.clone(), false);
        }

        self.replace(next);
        true
    }

    fn on_submit_failed(&mut self, id: EntryId, error: TransportError) -> bool {
        let Some(entry) = self.entries.get(&id).cloned() else {
            return false;
        };
        tracing::error!(entry_id = %id, error = %error, "Submission failed");

        let Some(mut next) = entry.submission_failed(error.to_string(), Utc::now()) else {
            return false;
        };
        if let TransportError::Rejected { node_errors, .. } = &error {
            if node_errors.as_object().is_some_and(|o| !o.is_empty()) {
                next = next.with_diagnostic(format!("node errors: {node_errors}"));
            }
        }
        self.replace(next);
        true
    }

    // ---- cancellation ----

    fn cancel(&mut self, id: EntryId) -> (Result<CancelOutcome, QueueError>, bool) {
        let Some(entry) = self.entries.get(&id).cloned() else {
            return (Err(QueueError::NotFound(id)), false);
        };
        if entry.is_terminal() {
            return (Ok(CancelOutcome::TooLate), false);
        }

        let Some(server_id) = entry.server_id.clone() else {
            tracing::info!(entry_id = %id, "Cancelled before acknowledgment");
            self.replace(entry.cancelled_locally(Utc::now()));
            return (Ok(CancelOutcome::Cancelled), true);
        };
        if entry.cancel_requested {
            return (Ok(CancelOutcome::Requested), false);
        }

        tracing::info!(entry_id = %id, server_id = %server_id, "Cancel requested");
        self.replace(entry.with_cancel_requested());
        self.spawn_server_cancel(id, server_id, true);

        let tx = self.tx.clone();
        let timeout = self.config.cancel_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            report(&tx, Command::CancelTimedOut { id }).await;
        });

        (Ok(CancelOutcome::Requested), true)
    }

    /// Cancel `server_id` on the server. With `report_back`, the status
    /// the server reported afterwards arrives as [`Command::CancelFinished`].
    fn spawn_server_cancel(&self, id: EntryId, server_id: ServerId, report_back: bool) {
        let transport = Arc::clone(&self.transport);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = cancel_on_server(transport.as_ref(), &server_id)
                .await
                .map_err(|e| e.to_string());
            match &result {
                Ok(status) => {
                    tracing::debug!(entry_id = %id, server_id = %server_id, ?status, "Server cancel sent");
                }
                Err(e) => {
                    tracing::warn!(entry_id = %id, server_id = %server_id, error = %e, "Server cancel failed");
                }
            }
            if report_back {
                report(&tx, Command::CancelFinished { id, result }).await;
            }
        });
    }

    fn on_cancel_finished(&mut self, id: EntryId, result: Result<RemoteStatus, String>) -> bool {
        let Some(entry) = self.entries.get(&id).cloned() else {
            return false;
        };
        if entry.is_terminal() {
            return false;
        }
        match result {
            // Gone from the server: the removal took.
            Ok(RemoteStatus::Pending | RemoteStatus::Unknown) if entry.state == JobState::Queued => {
                self.transition(&entry, &JobEvent::CancelConfirmed)
            }
            // Interrupt sent, or the job is between frames; wait for
            // `execution_interrupted` or the timeout.
            Ok(RemoteStatus::Pending | RemoteStatus::Unknown) => false,
            Ok(RemoteStatus::Running) => self.transition(&entry, &JobEvent::Started),
            Ok(finished) => {
                tracing::info!(entry_id = %id, "Cancel arrived after the server finished the job");
                let entry = Arc::new(entry.with_diagnostic(
                    "cancel arrived too late: the job had already finished on the server",
                ));
                match remote_event(finished) {
                    Some(event) => self.transition(&entry, &event),
                    None => false,
                }
            }
            Err(message) => {
                self.replace(entry.with_diagnostic(format!("cancel request failed: {message}")));
                true
            }
        }
    }

    /// Flag every bound, unfinished entry: frames sent while the event
    /// connection was down are lost.
    fn mark_stream_gap(&mut self) {
        let affected: Vec<Arc<JobEntry>> = self
            .entries
            .values()
            .filter(|e| !e.is_terminal() && e.server_id.is_some() && !e.missed_events)
            .cloned()
            .collect();
        for entry in affected {
            self.replace_quiet(entry.with_missed_events());
        }
    }

    fn on_cancel_timeout(&mut self, id: EntryId) -> bool {
        let Some(entry) = self.entries.get(&id).cloned() else {
            return false;
        };
        if entry.is_terminal() || !entry.cancel_requested {
            return false;
        }
        tracing::warn!(
            entry_id = %id,
            timeout_secs = self.config.cancel_timeout.as_secs_f64(),
            "Cancel not confirmed in time, cancelling locally",
        );
        let entry = Arc::new(entry.with_diagnostic(format!(
            "cancellation not confirmed by the server within {:.1}s",
            self.config.cancel_timeout.as_secs_f64()
        )));
        self.transition(&entry, &JobEvent::CancelConfirmed)
    }

    // ---- events ----

    fn apply(&mut self, server_id: &ServerId, event: &JobEvent) -> bool {
        let Some(entry) = self.resolve(server_id) else {
            tracing::debug!(
                server_id = %server_id,
                event = event.name(),
                "Event for unknown server id ignored",
            );
            return false;
        };
        self.transition(&entry, event)
    }

    /// The entry owning `server_id`, binding an unacknowledged entry whose
    /// correlation id the server adopted.
    fn resolve(&mut self, server_id: &ServerId) -> Option<Arc<JobEntry>> {
        if let Some(id) = self.by_server.get(server_id) {
            return self.entries.get(id).cloned();
        }
        if self.retired.contains(server_id) {
            return None;
        }

        let id = *self
            .by_correlation
            .get(&CorrelationId::from(server_id.as_str()))?;
        let entry = self.entries.get(&id)?;
        if entry.server_id.is_some() || !server_id.matches(&entry.correlation_id) {
            return None;
        }

        tracing::debug!(entry_id = %id, server_id = %server_id, "Bound server id from event stream");
        let bound = Arc::new(entry.bound_to(server_id));
        self.by_server.insert(server_id.clone(), id);
        self.entries.insert(id, Arc::clone(&bound));
        Some(bound)
    }

    /// Apply `event` to `entry`, publishing and starting follow-up work.
    fn transition(&mut self, entry: &Arc<JobEntry>, event: &JobEvent) -> bool {
        let Some(next) = entry.apply(event, Utc::now()) else {
            return false;
        };
        let id = next.id;

        if next.state != entry.state {
            tracing::info!(
                entry_id = %id,
                server_id = ?next.server_id.as_ref().map(|s| s.as_str()),
                from = ?entry.state,
                to = ?next.state,
                event = event.name(),
                "Entry state changed",
            );
        }

        let completed = next.state == JobState::Completed && entry.state != JobState::Completed;
        let next = self.replace_quiet(next);
        match event {
            JobEvent::Preview(_) if next.state == entry.state => {
                self.notify(QueueEvent::Preview { id });
            }
            _ => self.notify(QueueEvent::EntryUpdated {
                id,
                state: next.state,
            }),
        }

        if completed {
            self.start_materialization(next);
        }
        true
    }

    fn start_materialization(&mut self, entry: Arc<JobEntry>) {
        let Some(materializer) = self.materializer.clone() else {
            self.replace(entry.with_materialization(Vec::new(), Vec::new(), Utc::now()));
            return;
        };

        let tx = self.tx.clone();
        tokio::spawn(async move {
            let outcome = materializer.materialize(&entry).await;
            let failures = outcome.failures.iter().map(ToString::to_string).collect();
            report(
                &tx,
                Command::MaterializationFinished {
                    id: entry.id,
                    written: outcome.written,
                    failures,
                },
            )
            .await;
        });
    }

    fn on_materialized(
        &mut self,
        id: EntryId,
        written: Vec<MaterializedArtifact>,
        failures: Vec<String>,
    ) -> bool {
        let Some(entry) = self.entries.get(&id).cloned() else {
            tracing::debug!(entry_id = %id, "Materialization finished for a removed entry");
            return false;
        };
        let (written_count, failed_count) = (written.len(), failures.len());
        tracing::info!(
            entry_id = %id,
            written = written_count,
            failed = failed_count,
            "Materialization finished",
        );

        let next = entry.with_materialization(written, failures, Utc::now());
        self.entries.insert(id, Arc::new(next));
        self.notify(QueueEvent::Materialized {
            id,
            written: written_count,
            failed: failed_count,
        });
        true
    }

    // ---- history ----

    fn clear_history(&mut self) -> usize {
        let removed: Vec<Arc<JobEntry>> = self
            .entries
            .values()
            .filter(|e| e.is_terminal())
            .cloned()
            .collect();
        if removed.is_empty() {
            return 0;
        }

        for entry in &removed {
            self.entries.remove(&entry.id);
            self.by_correlation.remove(&entry.correlation_id);
            if let Some(server_id) = &entry.server_id {
                self.by_server.remove(server_id);
                self.retired.insert(server_id.clone());
            }
        }

        let ids: Vec<EntryId> = removed.iter().map(|e| e.id).collect();
        tracing::info!(count = ids.len(), "History cleared");
        self.notify(QueueEvent::EntriesRemoved { ids });
        removed.len()
    }

    // ---- publication ----

    /// Store `next` and announce the update.
    fn replace(&mut self, next: JobEntry) {
        let next = self.replace_quiet(next);
        self.notify(QueueEvent::EntryUpdated {
            id: next.id,
            state: next.state,
        });
    }

    fn replace_quiet(&mut self, next: JobEntry) -> Arc<JobEntry> {
        let next = Arc::new(next);
        self.entries.insert(next.id, Arc::clone(&next));
        next
    }

    /// Queue a notification; sent by [`Self::commit`] after the view that
    /// reflects it is published.
    fn notify(&mut self, event: QueueEvent) {
        self.pending.push(event);
    }

    fn commit(&mut self, changed: bool) {
        if changed {
            self.view_tx.send_replace(QueueView {
                entries: Arc::new(self.entries.values().cloned().collect()),
                server_queue_remaining: self.server_queue_remaining,
                connected: self.connected,
            });
        }
        for event in self.pending.drain(..) {
            // No subscribers is fine.
            let _ = self.events.send(event);
        }
    }
}

/// Remove the job if it is still pending, then interrupt it only if the
/// server says it is the one executing. Returns the status seen after the
/// removal.
async fn cancel_on_server(
    transport: &dyn Transport,
    server_id: &ServerId,
) -> Result<RemoteStatus, TransportError> {
    transport.remove_pending(server_id).await?;
    let status = transport.fetch_status(server_id).await?;
    if status == RemoteStatus::Running {
        transport.interrupt(server_id).await?;
    }
    Ok(status)
}

/// Send a result back to the actor if it still runs.
async fn report(tx: &mpsc::WeakSender<Command>, command: Command) {
    if let Some(tx) = tx.upgrade() {
        let _ = tx.send(command).await;
    }
}

/// The event a reconciliation status implies. `Pending` changes nothing.
fn remote_event(status: RemoteStatus) -> Option<JobEvent> {
    match status {
        RemoteStatus::Pending => None,
        RemoteStatus::Running => Some(JobEvent::Started),
        RemoteStatus::Completed { outputs } => Some(JobEvent::Completed { outputs }),
        RemoteStatus::Failed { message } => {
            Some(JobEvent::Failed(ErrorInfo::new(ErrorKind::Execution, message)))
        }
        RemoteStatus::Unknown => Some(JobEvent::Lost),
    }
}
