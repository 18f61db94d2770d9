//! Integration tests for the submission side of the pipeline.
//!
//! Tests cover:
//! - All-or-nothing writes under injected faults
//! - Conflict retry with fresh transactions
//! - Jobs exist only for authorised requests
//! - Exactly one winner among concurrent approvals
//! - Approver modifications reaching the provider

mod common;

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use common::*;
use vmgov_core::error::ErrorCode;
use vmgov_core::governance::{ApproveRequest, EventStatus, EventType, TicketStatus, AUTO_APPROVAL_ACTOR};
use vmgov_core::jobs::{JobDispatcher, JobState};
use vmgov_core::provider::VmOperation;
use vmgov_core::store::memory::{Failpoint, FaultKind};
use vmgov_core::store::{InMemoryStore, Store};

fn setup() -> Arc<InMemoryStore> {
    Arc::new(InMemoryStore::new())
}

async fn assert_empty(store: &InMemoryStore) {
    assert_eq!(store.event_count().await, 0);
    assert_eq!(store.ticket_count().await, 0);
    assert_eq!(store.job_count().await, 0);
}

// ============================================================================
// Atomicity
// ============================================================================

#[tokio::test]
async fn test_failed_job_insert_leaves_nothing_behind() {
    let store = setup();
    let enqueuer = enqueuer(store.clone(), fixed_retry(3, Duration::from_millis(1)));
    store.inject_fault(Failpoint::InsertJob, FaultKind::Error, 1);

    let err = enqueuer
        .submit(auto_approved("vm-1", json!({"cpu": 2})))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::DatabaseQueryFailed);
    assert_empty(&store).await;
}

#[tokio::test]
async fn test_failed_ticket_insert_leaves_nothing_behind() {
    let store = setup();
    let enqueuer = enqueuer(store.clone(), fixed_retry(3, Duration::from_millis(1)));
    store.inject_fault(Failpoint::InsertTicket, FaultKind::Error, 1);

    assert!(enqueuer.submit(needs_approval("vm-1", json!({}))).await.is_err());
    assert_empty(&store).await;

    // The fault was one-shot; the same request now goes through.
    let submission = enqueuer.submit(needs_approval("vm-1", json!({}))).await.unwrap();
    assert!(store.get_event(submission.event_id).await.unwrap().is_some());
    assert_eq!(store.event_count().await, 1);
}

#[tokio::test]
async fn test_failed_approval_commit_keeps_ticket_pending() {
    let store = setup();
    let enqueuer = enqueuer(store.clone(), fixed_retry(3, Duration::from_millis(1)));
    let submission = enqueuer.submit(needs_approval("vm-1", json!({}))).await.unwrap();

    store.inject_fault(Failpoint::Commit, FaultKind::Error, 1);
    let err = enqueuer
        .approve_and_enqueue(ApproveRequest::new(submission.ticket_id, "bob"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::DatabaseQueryFailed);

    let ticket = store.get_ticket(submission.ticket_id).await.unwrap().unwrap();
    assert_eq!(ticket.status, TicketStatus::PendingApproval);
    assert!(ticket.decided_by.is_none());
    let event = store.get_event(submission.event_id).await.unwrap().unwrap();
    assert_eq!(event.status, EventStatus::Pending);
    assert!(store.job_for_event(submission.event_id).await.unwrap().is_none());

    // Nothing half-applied blocks a retry.
    enqueuer
        .approve_and_enqueue(ApproveRequest::new(submission.ticket_id, "bob"))
        .await
        .unwrap();
    assert_eq!(store.job_count().await, 1);
}

#[tokio::test]
async fn test_rejected_input_writes_nothing() {
    let store = setup();
    let enqueuer = enqueuer(store.clone(), fixed_retry(3, Duration::from_millis(1)));

    let err = enqueuer
        .submit(auto_approved("vm-1", json!({"cpu": "lots"})))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::PolicyInputInvalid);

    let err = enqueuer
        .submit(auto_approved("vm-1", json!(["not", "an", "object"])))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::PolicyInputInvalid);

    assert_empty(&store).await;
}

// ============================================================================
// Conflict retry
// ============================================================================

#[tokio::test]
async fn test_conflicting_commit_is_retried() {
    let store = setup();
    let enqueuer = enqueuer(store.clone(), fixed_retry(3, Duration::from_millis(1)));
    store.inject_fault(Failpoint::Commit, FaultKind::Conflict, 2);

    let submission = enqueuer
        .submit(auto_approved("vm-1", json!({"cpu": 2})))
        .await
        .unwrap();

    assert_eq!(store.event_count().await, 1);
    assert_eq!(store.ticket_count().await, 1);
    assert_eq!(store.job_count().await, 1);
    let job = store.job_for_event(submission.event_id).await.unwrap().unwrap();
    assert_eq!(Some(job.id), submission.job_id);
}

#[tokio::test]
async fn test_conflict_retry_is_bounded() {
    let store = setup();
    let enqueuer = enqueuer(store.clone(), fixed_retry(3, Duration::from_millis(1)));
    store.inject_fault(Failpoint::Commit, FaultKind::Conflict, 50);

    let err = enqueuer
        .submit(auto_approved("vm-1", json!({})))
        .await
        .unwrap_err();
    assert!(err.is_conflict());
    assert_empty(&store).await;
}

// ============================================================================
// Authorisation
// ============================================================================

#[tokio::test]
async fn test_no_job_before_approval() {
    let store = setup();
    let enqueuer = enqueuer(store.clone(), fixed_retry(3, Duration::from_millis(1)));

    let pending = enqueuer.submit(needs_approval("vm-1", json!({}))).await.unwrap();
    assert!(!pending.auto_approved);
    assert!(pending.job_id.is_none());
    assert!(store.job_for_event(pending.event_id).await.unwrap().is_none());

    let auto = enqueuer
        .submit(auto_approved("vm-2", json!({"cpu": 1})))
        .await
        .unwrap();
    assert!(auto.auto_approved);
    let ticket = store.ticket_for_event(auto.event_id).await.unwrap().unwrap();
    assert_eq!(ticket.status, TicketStatus::Approved);
    assert_eq!(ticket.decided_by.as_deref(), Some(AUTO_APPROVAL_ACTOR));

    let summary = store.summary().await.unwrap();
    assert_eq!(summary.jobs_in("available"), 1);
    assert_eq!(summary.events_in("pending"), 1);
    assert_eq!(summary.events_in("processing"), 1);

    let pending_tickets = store.list_pending_tickets(10).await.unwrap();
    assert_eq!(pending_tickets.len(), 1);
    assert_eq!(pending_tickets[0].id, pending.ticket_id);
}

#[tokio::test]
async fn test_rejected_ticket_cannot_be_approved() {
    let store = setup();
    let enqueuer = enqueuer(store.clone(), fixed_retry(3, Duration::from_millis(1)));
    let submission = enqueuer.submit(needs_approval("vm-1", json!({}))).await.unwrap();

    enqueuer
        .reject(submission.ticket_id, "bob", Some("not this week".to_string()))
        .await
        .unwrap();
    let err = enqueuer
        .approve_and_enqueue(ApproveRequest::new(submission.ticket_id, "carol"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidTicketState);

    let event = store.get_event(submission.event_id).await.unwrap().unwrap();
    assert_eq!(event.status, EventStatus::Cancelled);
    let ticket = store.get_ticket(submission.ticket_id).await.unwrap().unwrap();
    assert_eq!(ticket.status, TicketStatus::Rejected);
    assert_eq!(ticket.decision_reason.as_deref(), Some("not this week"));
    assert_eq!(store.job_count().await, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_approvals_have_one_winner() {
    let store = setup();
    let enqueuer = Arc::new(enqueuer(store.clone(), fixed_retry(3, Duration::from_millis(1))));
    let submission = enqueuer.submit(needs_approval("vm-1", json!({}))).await.unwrap();

    let handles: Vec<_> = ["bob", "carol", "dave", "erin"]
        .into_iter()
        .map(|approver| {
            let enqueuer = enqueuer.clone();
            let ticket_id = submission.ticket_id;
            tokio::spawn(async move {
                enqueuer
                    .approve_and_enqueue(ApproveRequest::new(ticket_id, approver))
                    .await
            })
        })
        .collect();

    let mut winners = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => winners += 1,
            Err(e) => assert_eq!(e.code(), ErrorCode::InvalidTicketState),
        }
    }

    assert_eq!(winners, 1);
    assert_eq!(store.job_count().await, 1);
    let ticket = store.get_ticket(submission.ticket_id).await.unwrap().unwrap();
    assert_eq!(ticket.status, TicketStatus::Approved);
}

// ============================================================================
// Effective spec
// ============================================================================

#[tokio::test]
async fn test_approver_changes_reach_provider_and_payload_is_untouched() {
    let store = setup();
    let retry = fixed_retry(3, Duration::from_millis(1));
    let enqueuer = enqueuer(store.clone(), retry.clone());
    let original = json!({"cpu": 16, "memory_mb": 4096, "image": "ubuntu-22.04"});

    let mut request = needs_approval("vm-1", original.clone());
    request.operation = VmOperation::Create;
    let submission = enqueuer.submit(request).await.unwrap();
    assert!(!submission.auto_approved);

    enqueuer
        .approve_and_enqueue(
            ApproveRequest::new(submission.ticket_id, "bob")
                .with_modified_spec(json!({"cpu": 8, "memory_mb": null, "disk_gb": 40}))
                .with_comment("halved cpu"),
        )
        .await
        .unwrap();

    let provider = RecordingProvider::always(Behavior::Succeed);
    let dispatcher = JobDispatcher::new(store.clone(), provider.clone(), dispatcher_config("w1", 4, 2), retry);
    dispatcher.tick().await.unwrap();
    assert!(
        wait_until(Duration::from_secs(5), || {
            dispatcher.stats().succeeded == 1 && dispatcher.active_jobs() == 0
        })
        .await
    );

    let call = &provider.calls()[0];
    assert_eq!(call.operation, VmOperation::Create);
    assert_eq!(
        call.spec,
        json!({"cpu": 8, "memory_mb": 4096, "image": "ubuntu-22.04", "disk_gb": 40})
    );

    let event = store.get_event(submission.event_id).await.unwrap().unwrap();
    assert_eq!(event.status, EventStatus::Completed);
    let stored: Value = serde_json::from_slice(event.payload()).unwrap();
    assert_eq!(stored, original);

    let outcomes = store.outcome_events(submission.event_id).await.unwrap();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].event_type, EventType::Completed(VmOperation::Create));
    assert_eq!(outcomes[0].parent_event_id, Some(submission.event_id));
}

#[tokio::test]
async fn test_cancel_job_before_it_runs() {
    let store = setup();
    let retry = fixed_retry(3, Duration::from_millis(1));
    let enqueuer = enqueuer(store.clone(), retry.clone());
    let submission = enqueuer
        .submit(auto_approved("vm-1", json!({})))
        .await
        .unwrap();

    let result = enqueuer.cancel_job(submission.event_id, "alice").await.unwrap();
    assert_eq!(result, vmgov_core::governance::JobCancellation::Discarded);

    let job = store.job_for_event(submission.event_id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Discarded);
    let event = store.get_event(submission.event_id).await.unwrap().unwrap();
    assert_eq!(event.status, EventStatus::Cancelled);

    // Nothing left for a dispatcher to pick up.
    let provider = RecordingProvider::always(Behavior::Succeed);
    let dispatcher = JobDispatcher::new(store.clone(), provider.clone(), dispatcher_config("w1", 4, 2), retry);
    assert_eq!(dispatcher.tick().await.unwrap(), 0);
    assert_eq!(provider.call_count(), 0);

    let err = enqueuer.cancel_job(submission.event_id, "alice").await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidStateTransition);
}
