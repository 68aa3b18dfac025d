//! Integration tests for the job queue actor.
//!
//! Drive the queue through a scripted transport and check the published
//! view and notifications.

mod common;

use std::time::Duration;

use assert_matches::assert_matches;

use bowser_comfyui::entry::{ErrorInfo, ErrorKind, JobEvent, JobState};
use bowser_comfyui::events::QueueEvent;
use bowser_comfyui::queue::{CancelOutcome, JobQueue, QueueConfig, QueueError, ReconcileReport};
use bowser_comfyui::transport::RemoteStatus;
use bowser_core::types::{EntryId, ServerId};

use common::{enqueue_acked, output, submission, wait_for, FakeTransport};

fn rank(state: JobState) -> u8 {
    match state {
        JobState::Queued => 0,
        JobState::Running => 1,
        _ => 2,
    }
}

fn config(cancel_timeout: Duration) -> QueueConfig {
    QueueConfig {
        cancel_timeout,
        ..QueueConfig::default()
    }
}

// ---------------------------------------------------------------------------
// Test: submit and acknowledge
// ---------------------------------------------------------------------------

#[tokio::test]
async fn enqueue_creates_queued_entry_then_binds_ack() {
    let transport = FakeTransport::new();
    transport.set_submit_delay(Duration::from_millis(50));
    let queue = JobQueue::spawn(transport.clone(), None, QueueConfig::default());

    let entry = queue.enqueue(submission(1)).await.unwrap();
    assert_eq!(entry.state, JobState::Queued);
    assert!(entry.server_id.is_none());

    // The entry is visible as soon as enqueue returns.
    let snapshot = queue.snapshot();
    assert_eq!(snapshot.get(entry.id).map(|e| e.state), Some(JobState::Queued));

    let mut view = queue.watch();
    let view = wait_for(&mut view, |v| {
        v.get(entry.id).is_some_and(|e| e.server_id.is_some())
    })
    .await;
    let acked = view.get(entry.id).unwrap();
    assert_eq!(
        acked.server_id,
        Some(ServerId::from(entry.correlation_id.as_str()))
    );
    assert_eq!(acked.queue_position, Some(1));
    assert_eq!(acked.state, JobState::Queued);
    assert_eq!(transport.submitted(), vec![entry.correlation_id.clone()]);
}

#[tokio::test]
async fn entries_are_listed_in_creation_order() {
    let transport = FakeTransport::new();
    let queue = JobQueue::spawn(transport, None, QueueConfig::default());

    let mut ids = Vec::new();
    for seed in 0..5 {
        ids.push(queue.enqueue(submission(seed)).await.unwrap().id);
    }
    let listed: Vec<EntryId> = queue.snapshot().entries().iter().map(|e| e.id).collect();
    assert_eq!(listed, ids);
}

#[tokio::test]
async fn reused_correlation_id_is_refused() {
    let transport = FakeTransport::new();
    let queue = JobQueue::spawn(transport.clone(), None, QueueConfig::default());

    let first = queue.enqueue(submission(1)).await.unwrap();
    let mut again = submission(2);
    again.correlation_id = first.correlation_id.clone();

    assert_matches!(
        queue.enqueue(again).await,
        Err(QueueError::DuplicateCorrelation(id)) if id == first.correlation_id
    );
    queue.flush().await.unwrap();
    assert_eq!(queue.snapshot().len(), 1);
    assert_eq!(transport.submitted(), vec![first.correlation_id.clone()]);
}

// ---------------------------------------------------------------------------
// Test: submission failure
// ---------------------------------------------------------------------------

#[tokio::test]
async fn submission_failure_fails_the_entry() {
    let transport = FakeTransport::new();
    transport.fail_submissions("connection refused");
    let queue = JobQueue::spawn(transport.clone(), None, QueueConfig::default());

    let entry = queue.enqueue(submission(1)).await.unwrap();
    let mut view = queue.watch();
    let view = wait_for(&mut view, |v| {
        v.get(entry.id).is_some_and(|e| e.state == JobState::Failed)
    })
    .await;

    let failed = view.get(entry.id).unwrap();
    let error = failed.error.as_ref().unwrap();
    assert_eq!(error.kind, ErrorKind::Submission);
    assert!(error.message.contains("connection refused"));
    assert!(failed.server_id.is_none());
    // No automatic resubmission.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(transport.submitted().len(), 1);
}

// ---------------------------------------------------------------------------
// Test: progress to completion
// ---------------------------------------------------------------------------

#[tokio::test]
async fn progress_runs_entry_to_completion() {
    let queue = JobQueue::spawn(FakeTransport::new(), None, QueueConfig::default());
    let (id, server_id) = enqueue_acked(&queue, 1).await;

    queue.apply_event(server_id.clone(), JobEvent::Started).await.unwrap();
    queue
        .apply_event(server_id.clone(), JobEvent::Progress { value: 10, max: 20 })
        .await
        .unwrap();
    queue
        .apply_event(server_id.clone(), JobEvent::Progress { value: 5, max: 20 })
        .await
        .unwrap();
    queue.flush().await.unwrap();

    let running = queue.snapshot().get(id).cloned().unwrap();
    assert_eq!(running.state, JobState::Running);
    assert_eq!((running.progress.current, running.progress.total), (10, 20));
    assert!(running.started_at.is_some());

    queue
        .apply_event(
            server_id.clone(),
            JobEvent::NodeOutput {
                artifacts: vec![output("ComfyUI_00001_.png")],
            },
        )
        .await
        .unwrap();
    queue
        .apply_event(server_id, JobEvent::Completed { outputs: vec![] })
        .await
        .unwrap();
    queue.flush().await.unwrap();

    let done = queue.snapshot().get(id).cloned().unwrap();
    assert_eq!(done.state, JobState::Completed);
    assert_eq!((done.progress.current, done.progress.total), (20, 20));
    assert_eq!(done.outputs.len(), 1);
    // Without a materializer the entry settles immediately.
    assert!(done.is_settled());
}

#[tokio::test]
async fn terminal_entries_ignore_later_events() {
    let queue = JobQueue::spawn(FakeTransport::new(), None, QueueConfig::default());
    let (id, server_id) = enqueue_acked(&queue, 1).await;
    queue
        .apply_event(server_id.clone(), JobEvent::Completed { outputs: vec![] })
        .await
        .unwrap();
    queue.flush().await.unwrap();
    let before = queue.snapshot().get(id).cloned().unwrap();

    let mut events = queue.subscribe();
    queue
        .apply_event(
            server_id.clone(),
            JobEvent::Failed(ErrorInfo::new(ErrorKind::Execution, "late")),
        )
        .await
        .unwrap();
    queue.apply_event(server_id, JobEvent::Interrupted).await.unwrap();
    queue.flush().await.unwrap();

    let after = queue.snapshot().get(id).cloned().unwrap();
    assert_eq!(after.state, JobState::Completed);
    assert!(after.error.is_none());
    assert_eq!(after.terminated_at, before.terminated_at);
    assert!(events.try_recv().is_err());
}

// ---------------------------------------------------------------------------
// Test: server id routing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unknown_server_id_is_a_no_op() {
    let queue = JobQueue::spawn(FakeTransport::new(), None, QueueConfig::default());
    let (id, _) = enqueue_acked(&queue, 1).await;
    let mut events = queue.subscribe();

    queue
        .apply_event(ServerId::from("not-ours"), JobEvent::Started)
        .await
        .unwrap();
    queue.flush().await.unwrap();

    assert_eq!(queue.snapshot().get(id).unwrap().state, JobState::Queued);
    assert!(queue.snapshot().by_server_id(&ServerId::from("not-ours")).is_none());
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn events_before_the_ack_bind_by_correlation_id() {
    let transport = FakeTransport::new();
    transport.set_submit_delay(Duration::from_millis(100));
    let queue = JobQueue::spawn(transport, None, QueueConfig::default());

    let entry = queue.enqueue(submission(1)).await.unwrap();
    let server_id = ServerId::from(entry.correlation_id.as_str());
    queue.apply_event(server_id.clone(), JobEvent::Started).await.unwrap();
    queue.flush().await.unwrap();

    let running = queue.snapshot().get(entry.id).cloned().unwrap();
    assert_eq!(running.state, JobState::Running);
    assert_eq!(running.server_id.as_ref(), Some(&server_id));

    // The late ack keeps the binding and leaves the state alone.
    tokio::time::sleep(Duration::from_millis(200)).await;
    queue.flush().await.unwrap();
    let acked = queue.snapshot().get(entry.id).cloned().unwrap();
    assert_eq!(acked.state, JobState::Running);
    assert_eq!(acked.server_id.as_ref(), Some(&server_id));
    assert!(acked.queue_position.is_none());
}

// ---------------------------------------------------------------------------
// Test: cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancel_before_ack_cancels_locally_and_server_side() {
    let transport = FakeTransport::new();
    transport.set_submit_delay(Duration::from_millis(50));
    let queue = JobQueue::spawn(transport.clone(), None, QueueConfig::default());

    let entry = queue.enqueue(submission(1)).await.unwrap();
    assert_eq!(queue.cancel(entry.id).await.unwrap(), CancelOutcome::Cancelled);
    assert_eq!(queue.snapshot().get(entry.id).unwrap().state, JobState::Cancelled);

    let server_id = ServerId::from(entry.correlation_id.as_str());
    tokio::time::timeout(Duration::from_secs(2), async {
        while !transport.removed().contains(&server_id) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("late ack should trigger a server cancel");

    queue.flush().await.unwrap();
    let cancelled = queue.snapshot().get(entry.id).cloned().unwrap();
    assert_eq!(cancelled.state, JobState::Cancelled);
    assert_eq!(cancelled.server_id, Some(server_id));
}

#[tokio::test]
async fn cancel_of_queued_job_is_confirmed_by_removal() {
    let transport = FakeTransport::new();
    let queue = JobQueue::spawn(transport.clone(), None, config(Duration::from_secs(10)));
    let (id, server_id) = enqueue_acked(&queue, 1).await;

    assert_eq!(queue.cancel(id).await.unwrap(), CancelOutcome::Requested);
    assert!(queue.snapshot().get(id).unwrap().cancel_requested);

    let mut view = queue.watch();
    wait_for(&mut view, |v| {
        v.get(id).is_some_and(|e| e.state == JobState::Cancelled)
    })
    .await;
    assert_eq!(transport.removed(), vec![server_id]);
    assert!(transport.interrupted().is_empty());
}

#[tokio::test]
async fn cancel_of_pending_job_never_interrupts() {
    let transport = FakeTransport::new();
    let queue = JobQueue::spawn(transport.clone(), None, config(Duration::from_secs(10)));
    let (id, server_id) = enqueue_acked(&queue, 1).await;
    transport.set_status(&server_id, RemoteStatus::Pending);

    assert_eq!(queue.cancel(id).await.unwrap(), CancelOutcome::Requested);
    let mut view = queue.watch();
    let view = wait_for(&mut view, |v| v.get(id).is_some_and(|e| e.is_terminal())).await;

    assert_eq!(view.get(id).unwrap().state, JobState::Cancelled);
    assert_eq!(transport.removed(), vec![server_id]);
    assert!(transport.interrupted().is_empty());
}

#[tokio::test]
async fn cancel_of_job_already_finished_on_server_keeps_its_outputs() {
    let transport = FakeTransport::new();
    let queue = JobQueue::spawn(transport.clone(), None, config(Duration::from_secs(10)));
    let (id, server_id) = enqueue_acked(&queue, 1).await;
    // The start and finish frames never reached us.
    transport.set_status(
        &server_id,
        RemoteStatus::Completed {
            outputs: vec![output("done.png")],
        },
    );

    assert_eq!(queue.cancel(id).await.unwrap(), CancelOutcome::Requested);
    let mut view = queue.watch();
    let view = wait_for(&mut view, |v| v.get(id).is_some_and(|e| e.is_settled())).await;

    let done = view.get(id).unwrap();
    assert_eq!(done.state, JobState::Completed);
    assert_eq!(done.outputs.len(), 1);
    assert_eq!(done.outputs[0].filename, "done.png");
    assert!(done.diagnostics.iter().any(|d| d.contains("too late")));
    assert!(transport.interrupted().is_empty());
    assert_eq!(queue.cancel(id).await.unwrap(), CancelOutcome::TooLate);
}

#[tokio::test]
async fn cancel_of_job_that_just_started_interrupts_it() {
    let transport = FakeTransport::new();
    let queue = JobQueue::spawn(transport.clone(), None, config(Duration::from_secs(10)));
    let (id, server_id) = enqueue_acked(&queue, 1).await;
    transport.set_status(&server_id, RemoteStatus::Running);

    assert_eq!(queue.cancel(id).await.unwrap(), CancelOutcome::Requested);
    let mut view = queue.watch();
    wait_for(&mut view, |v| {
        v.get(id).is_some_and(|e| e.state == JobState::Running)
    })
    .await;
    assert_eq!(transport.interrupted(), vec![server_id.clone()]);

    queue.apply_event(server_id, JobEvent::Interrupted).await.unwrap();
    queue.flush().await.unwrap();
    let cancelled = queue.snapshot().get(id).cloned().unwrap();
    assert_eq!(cancelled.state, JobState::Cancelled);
    assert!(cancelled.diagnostics.is_empty());
}

#[tokio::test]
async fn running_cancel_completes_on_interrupt() {
    let transport = FakeTransport::new();
    let queue = JobQueue::spawn(transport.clone(), None, config(Duration::from_secs(10)));
    let (id, server_id) = enqueue_acked(&queue, 1).await;
    queue.apply_event(server_id.clone(), JobEvent::Started).await.unwrap();
    transport.set_status(&server_id, RemoteStatus::Running);

    assert_eq!(queue.cancel(id).await.unwrap(), CancelOutcome::Requested);
    // A second request while one is in flight changes nothing.
    assert_eq!(queue.cancel(id).await.unwrap(), CancelOutcome::Requested);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(queue.snapshot().get(id).unwrap().state, JobState::Running);
    assert_eq!(transport.interrupted(), vec![server_id.clone()]);

    queue.apply_event(server_id, JobEvent::Interrupted).await.unwrap();
    queue.flush().await.unwrap();
    let cancelled = queue.snapshot().get(id).cloned().unwrap();
    assert_eq!(cancelled.state, JobState::Cancelled);
    assert!(cancelled.diagnostics.is_empty());
}

#[tokio::test]
async fn late_cancel_loses_to_completion() {
    let transport = FakeTransport::new();
    transport.set_cancel_delay(Duration::from_millis(50));
    let queue = JobQueue::spawn(transport, None, config(Duration::from_millis(100)));
    let (id, server_id) = enqueue_acked(&queue, 1).await;
    queue.apply_event(server_id.clone(), JobEvent::Started).await.unwrap();

    assert_eq!(queue.cancel(id).await.unwrap(), CancelOutcome::Requested);
    queue
        .apply_event(server_id, JobEvent::Completed { outputs: vec![output("a.png")] })
        .await
        .unwrap();

    // Past the cancel timeout, the completion still stands.
    tokio::time::sleep(Duration::from_millis(250)).await;
    let done = queue.snapshot().get(id).cloned().unwrap();
    assert_eq!(done.state, JobState::Completed);
    assert_eq!(done.outputs.len(), 1);
    assert_eq!(queue.cancel(id).await.unwrap(), CancelOutcome::TooLate);
}

#[tokio::test]
async fn unconfirmed_cancel_times_out_to_cancelled() {
    let transport = FakeTransport::new();
    transport.fail_cancels();
    let queue = JobQueue::spawn(transport, None, config(Duration::from_millis(50)));
    let (id, server_id) = enqueue_acked(&queue, 1).await;
    queue.apply_event(server_id, JobEvent::Started).await.unwrap();

    assert_eq!(queue.cancel(id).await.unwrap(), CancelOutcome::Requested);
    let mut view = queue.watch();
    let view = wait_for(&mut view, |v| {
        v.get(id).is_some_and(|e| e.state == JobState::Cancelled)
    })
    .await;

    let cancelled = view.get(id).unwrap();
    assert!(cancelled.diagnostics.iter().any(|d| d.contains("cancel request failed")));
    assert!(cancelled.diagnostics.iter().any(|d| d.contains("not confirmed")));
}

#[tokio::test]
async fn cancel_of_unknown_entry_is_not_found() {
    let queue = JobQueue::spawn(FakeTransport::new(), None, QueueConfig::default());
    assert_matches!(queue.cancel(EntryId(99)).await, Err(QueueError::NotFound(EntryId(99))));
}

// ---------------------------------------------------------------------------
// Test: disconnect and reconcile
// ---------------------------------------------------------------------------

#[tokio::test]
async fn reconcile_applies_remote_status() {
    let transport = FakeTransport::new();
    let queue = JobQueue::spawn(transport.clone(), None, QueueConfig::default());
    let (finished, finished_sid) = enqueue_acked(&queue, 1).await;
    let (lost, lost_sid) = enqueue_acked(&queue, 2).await;
    let (waiting, waiting_sid) = enqueue_acked(&queue, 3).await;
    let (cancelling, cancelling_sid) = enqueue_acked(&queue, 4).await;

    queue.apply_event(finished_sid.clone(), JobEvent::Started).await.unwrap();
    queue.apply_event(cancelling_sid.clone(), JobEvent::Started).await.unwrap();
    queue.set_connected(false).await.unwrap();
    queue.flush().await.unwrap();

    // While offline the server finished one job and forgot two.
    transport.set_status(
        &finished_sid,
        RemoteStatus::Completed {
            outputs: vec![output("ComfyUI_00007_.png")],
        },
    );
    transport.set_status(&waiting_sid, RemoteStatus::Pending);
    transport.set_status(&lost_sid, RemoteStatus::Unknown);
    transport.set_status(&cancelling_sid, RemoteStatus::Unknown);
    transport.fail_cancels();
    queue.cancel(cancelling).await.unwrap();

    queue.set_connected(true).await.unwrap();
    let report = queue.reconcile().await.unwrap();
    assert_eq!(
        report,
        ReconcileReport {
            checked: 4,
            updated: 3,
            unreachable: 0,
        }
    );

    let view = queue.snapshot();
    assert!(view.connected);
    let done = view.get(finished).unwrap();
    assert_eq!(done.state, JobState::Completed);
    assert_eq!(done.outputs[0].filename, "ComfyUI_00007_.png");

    let lost_entry = view.get(lost).unwrap();
    assert_eq!(lost_entry.state, JobState::Failed);
    assert_eq!(lost_entry.error.as_ref().map(|e| e.kind), Some(ErrorKind::Lost));

    assert_eq!(view.get(waiting).unwrap().state, JobState::Queued);
    assert_eq!(view.get(cancelling).unwrap().state, JobState::Cancelled);
}

#[tokio::test]
async fn disconnect_flags_bound_unfinished_entries() {
    let queue = JobQueue::spawn(FakeTransport::new(), None, QueueConfig::default());
    let (running, running_sid) = enqueue_acked(&queue, 1).await;
    let (done, done_sid) = enqueue_acked(&queue, 2).await;
    queue.set_connected(true).await.unwrap();
    queue.apply_event(running_sid, JobEvent::Started).await.unwrap();
    queue
        .apply_event(done_sid, JobEvent::Completed { outputs: vec![output("a.png")] })
        .await
        .unwrap();
    queue.flush().await.unwrap();
    assert!(!queue.snapshot().get(running).unwrap().missed_events);

    queue.set_connected(false).await.unwrap();
    queue.flush().await.unwrap();

    let view = queue.snapshot();
    assert!(!view.connected);
    let flagged = view.get(running).unwrap();
    assert!(flagged.missed_events);
    assert_eq!(flagged.state, JobState::Running);
    assert!(!view.get(done).unwrap().missed_events);
}

// ---------------------------------------------------------------------------
// Test: history and notifications
// ---------------------------------------------------------------------------

#[tokio::test]
async fn clear_history_keeps_active_entries_and_retires_ids() {
    let queue = JobQueue::spawn(FakeTransport::new(), None, QueueConfig::default());
    let (done, done_sid) = enqueue_acked(&queue, 1).await;
    let (active, _) = enqueue_acked(&queue, 2).await;
    queue
        .apply_event(done_sid.clone(), JobEvent::Completed { outputs: vec![] })
        .await
        .unwrap();
    queue.flush().await.unwrap();

    let mut events = queue.subscribe();
    assert_eq!(queue.clear_history().await.unwrap(), 1);
    assert_matches!(events.recv().await, Ok(QueueEvent::EntriesRemoved { ids }) if ids == vec![done]);

    let view = queue.snapshot();
    assert!(view.get(done).is_none());
    assert!(view.get(active).is_some());

    // A late event for the removed job resurrects nothing.
    queue.apply_event(done_sid, JobEvent::Started).await.unwrap();
    queue.flush().await.unwrap();
    assert_eq!(queue.snapshot().len(), 1);
    assert_eq!(queue.clear_history().await.unwrap(), 0);
}

#[tokio::test]
async fn notifications_follow_the_published_view() {
    let queue = JobQueue::spawn(FakeTransport::new(), None, QueueConfig::default());
    let mut events = queue.subscribe();
    let (id, server_id) = enqueue_acked(&queue, 1).await;

    queue.apply_event(server_id.clone(), JobEvent::Started).await.unwrap();
    for value in 1..=20 {
        queue
            .apply_event(server_id.clone(), JobEvent::Progress { value, max: 20 })
            .await
            .unwrap();
    }
    queue
        .apply_event(server_id, JobEvent::Completed { outputs: vec![] })
        .await
        .unwrap();

    let mut saw_completed = false;
    while !saw_completed {
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("event in time")
            .expect("channel open");
        match event {
            QueueEvent::EntryAdded { id: added } => {
                assert!(queue.snapshot().get(added).is_some());
            }
            QueueEvent::EntryUpdated { id: updated, state } => {
                assert_eq!(updated, id);
                let current = queue.snapshot().get(id).unwrap().state;
                // The view is never behind a notification.
                assert!(rank(current) >= rank(state), "{current:?} behind {state:?}");
                saw_completed = state == JobState::Completed;
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}

#[tokio::test]
async fn snapshots_stay_consistent_under_concurrent_updates() {
    let queue = JobQueue::spawn(FakeTransport::new(), None, QueueConfig::default());
    let mut jobs = Vec::new();
    for seed in 0..4 {
        jobs.push(enqueue_acked(&queue, seed).await);
    }

    let writers: Vec<_> = jobs
        .iter()
        .map(|(_, server_id)| {
            let queue = queue.clone();
            let server_id = server_id.clone();
            tokio::spawn(async move {
                for value in 1..=50 {
                    queue
                        .apply_event(server_id.clone(), JobEvent::Progress { value, max: 50 })
                        .await
                        .unwrap();
                    tokio::task::yield_now().await;
                }
                queue
                    .apply_event(server_id, JobEvent::Completed { outputs: vec![] })
                    .await
                    .unwrap();
            })
        })
        .collect();

    let reader = {
        let queue = queue.clone();
        tokio::spawn(async move {
            for _ in 0..200 {
                let view = queue.snapshot();
                assert_eq!(view.len(), 4);
                let ids: Vec<EntryId> = view.entries().iter().map(|e| e.id).collect();
                assert!(ids.windows(2).all(|w| w[0] < w[1]));
                for entry in view.entries() {
                    assert!(entry.progress.current <= entry.progress.total);
                    if entry.state == JobState::Completed {
                        assert_eq!(entry.progress.current, entry.progress.total);
                        assert!(entry.terminated_at.is_some());
                    }
                }
                tokio::task::yield_now().await;
            }
        })
    };

    for writer in writers {
        writer.await.unwrap();
    }
    reader.await.unwrap();
    queue.flush().await.unwrap();
    assert!(queue
        .snapshot()
        .entries()
        .iter()
        .all(|e| e.state == JobState::Completed));
}
