//! Transactional enqueuer.
//!
//! Writes the event, its ticket and (once authorised) its job in a single
//! commit. Policy evaluation and input checks happen before a transaction is
//! opened; inside one there is only reading, state-machine moves and writes.
//!
//! Conflicting commits are retried a bounded number of times with the
//! transaction rebuilt from scratch, so a retried submission gets fresh IDs
//! and never half of a previous attempt.

use chrono::Utc;
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, instrument};

use crate::config::EnqueuerConfig;
use crate::error::{GovernanceError, Result};
use crate::governance::event::{Event, EventId, EventStatus};
use crate::governance::policy::{ApprovalDecision, ApprovalPolicy, PolicyInput, Requester, TargetContext};
use crate::governance::ticket::{ApprovalTicket, TicketId};
use crate::jobs::job::{Job, JobId, JobPriority, JobState, RetryPolicy};
use crate::provider::VmOperation;
use crate::store::{retry_on_conflict, ConflictRetry, Store};

// ═══════════════════════════════════════════════════════════════════════════════
// Requests and results
// ═══════════════════════════════════════════════════════════════════════════════

/// A change request as a caller submits it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub requester: Requester,
    pub operation: VmOperation,
    pub aggregate_type: String,
    pub aggregate_id: String,
    /// Requested parameters, a JSON object
    pub spec: Value,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub priority: Option<JobPriority>,
}

/// A validated submission, ready to be written.
#[derive(Debug, Clone)]
pub struct SubmissionDraft {
    pub operation: VmOperation,
    pub aggregate_type: String,
    pub aggregate_id: String,
    /// Serialised spec; stored verbatim as the event payload
    pub payload: Vec<u8>,
    pub created_by: String,
    pub reason: Option<String>,
    pub priority: JobPriority,
}

/// IDs created by a submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submission {
    pub event_id: EventId,
    pub ticket_id: TicketId,
    /// Present when the request was auto-approved
    pub job_id: Option<JobId>,
    pub auto_approved: bool,
}

/// A human approval.
#[derive(Debug, Clone, Default)]
pub struct ApproveRequest {
    pub ticket_id: TicketId,
    pub approver: String,
    /// Field overrides applied on top of the submitted spec
    pub modified_spec: Option<Value>,
    pub comment: Option<String>,
    pub priority: Option<JobPriority>,
}

impl ApproveRequest {
    pub fn new(ticket_id: TicketId, approver: impl Into<String>) -> Self {
        Self {
            ticket_id,
            approver: approver.into(),
            ..Default::default()
        }
    }

    pub fn with_modified_spec(mut self, spec: Value) -> Self {
        self.modified_spec = Some(spec);
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketDecision {
    Reject,
    Cancel,
}

/// Result of a job cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobCancellation {
    /// The job had not started; it is discarded and the event cancelled
    Discarded,
    /// The job is running; its in-flight call finishes first
    Requested,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Enqueuer
// ═══════════════════════════════════════════════════════════════════════════════

pub struct TransactionalEnqueuer {
    store: Arc<dyn Store>,
    policy: Arc<dyn ApprovalPolicy>,
    config: EnqueuerConfig,
    retry: RetryPolicy,
}

impl TransactionalEnqueuer {
    pub fn new(
        store: Arc<dyn Store>,
        policy: Arc<dyn ApprovalPolicy>,
        config: EnqueuerConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            policy,
            config,
            retry,
        }
    }

    fn conflict_retry(&self) -> ConflictRetry {
        ConflictRetry {
            max_retries: self.config.conflict_retries,
            backoff: self.config.conflict_backoff,
        }
    }

    /// Evaluate the approval policy, then write the submission.
    #[instrument(skip(self, request), fields(operation = %request.operation, aggregate_id = %request.aggregate_id))]
    pub async fn submit(&self, request: SubmitRequest) -> Result<Submission> {
        let input = PolicyInput {
            requester: &request.requester,
            operation: request.operation,
            target: TargetContext {
                aggregate_type: &request.aggregate_type,
                aggregate_id: &request.aggregate_id,
                spec: &request.spec,
            },
        };
        let decision = self.policy.evaluate(&input)?;
        if let ApprovalDecision::RequireApproval { reasons } = &decision {
            info!(reasons = ?reasons, "Submission requires approval");
        }

        let draft = SubmissionDraft {
            operation: request.operation,
            payload: serde_json::to_vec(&request.spec)?,
            aggregate_type: request.aggregate_type,
            aggregate_id: request.aggregate_id,
            created_by: request.requester.user_id,
            reason: request.reason,
            priority: request.priority.unwrap_or(self.config.default_priority),
        };
        self.enqueue_submission(&draft, decision.requires_approval()).await
    }

    /// Insert the event and ticket, plus the job when no approval is needed,
    /// in one transaction.
    pub async fn enqueue_submission(&self, draft: &SubmissionDraft, requires_approval: bool) -> Result<Submission> {
        let submission = retry_on_conflict(self.conflict_retry(), "submit", move || {
            self.insert_submission(draft, requires_approval)
        })
        .await?;

        let outcome = if submission.auto_approved {
            "auto_approved"
        } else {
            "pending_approval"
        };
        counter!("vmgov_submissions_total", "outcome" => outcome).increment(1);
        info!(
            event_id = %submission.event_id,
            ticket_id = %submission.ticket_id,
            job_id = ?submission.job_id,
            aggregate_id = %draft.aggregate_id,
            operation = %draft.operation,
            outcome = outcome,
            "Submission recorded"
        );
        Ok(submission)
    }

    async fn insert_submission(&self, draft: &SubmissionDraft, requires_approval: bool) -> Result<Submission> {
        let now = Utc::now();
        let status = if requires_approval {
            EventStatus::Pending
        } else {
            EventStatus::Processing
        };
        let event = Event::request(
            draft.operation,
            &draft.aggregate_type,
            &draft.aggregate_id,
            draft.payload.clone(),
            &draft.created_by,
            status,
            now,
        );

        let ticket = if requires_approval {
            ApprovalTicket::pending(event.id, &draft.created_by, draft.reason.clone(), now)
        } else {
            ApprovalTicket::auto_approved(event.id, &draft.created_by, draft.reason.clone(), now)
        };

        let job = (!requires_approval).then(|| {
            Job::new(
                event.id,
                &draft.aggregate_id,
                draft.priority,
                self.retry.max_attempts,
                now,
            )
        });

        let mut tx = self.store.begin().await?;
        tx.insert_event(&event).await?;
        tx.insert_ticket(&ticket).await?;
        if let Some(job) = &job {
            tx.insert_job(job).await?;
        }
        tx.commit().await?;

        Ok(Submission {
            event_id: event.id,
            ticket_id: ticket.id,
            job_id: job.map(|j| j.id),
            auto_approved: !requires_approval,
        })
    }

    /// Approve a pending ticket and enqueue its job in the same commit.
    /// A second approval of the same ticket fails with `InvalidTicketState`.
    #[instrument(skip(self, request), fields(ticket_id = %request.ticket_id, approver = %request.approver))]
    pub async fn approve_and_enqueue(&self, request: ApproveRequest) -> Result<JobId> {
        match &request.modified_spec {
            None | Some(Value::Null) | Some(Value::Object(_)) => {}
            Some(_) => {
                return Err(GovernanceError::validation(
                    "modified spec must be a JSON object",
                ))
            }
        }
        if request.approver.trim().is_empty() {
            return Err(GovernanceError::validation("approver must not be empty"));
        }

        let request = &request;
        let job_id = retry_on_conflict(self.conflict_retry(), "approve", move || {
            self.approve_once(request)
        })
        .await?;

        counter!("vmgov_approvals_total", "decision" => "approved").increment(1);
        info!(ticket_id = %request.ticket_id, job_id = %job_id, "Ticket approved, job enqueued");
        Ok(job_id)
    }

    async fn approve_once(&self, request: &ApproveRequest) -> Result<JobId> {
        let now = Utc::now();
        let mut tx = self.store.begin().await?;

        let mut ticket = tx
            .ticket_for_update(request.ticket_id)
            .await?
            .ok_or_else(|| GovernanceError::not_found("ticket", request.ticket_id.to_string()))?;
        ticket.approve(
            &request.approver,
            request.modified_spec.clone(),
            request.comment.clone(),
            now,
        )?;

        let mut event = tx
            .event_for_update(ticket.event_id)
            .await?
            .ok_or_else(|| GovernanceError::not_found("event", ticket.event_id.to_string()))?;
        event.transition_to(EventStatus::Processing, now)?;

        let job = Job::new(
            event.id,
            &event.aggregate_id,
            request.priority.unwrap_or(self.config.default_priority),
            self.retry.max_attempts,
            now,
        );

        tx.update_ticket(&ticket).await?;
        tx.update_event(&event).await?;
        tx.insert_job(&job).await?;
        tx.commit().await?;

        Ok(job.id)
    }

    /// Close a pending ticket without a job. The event becomes `cancelled`.
    #[instrument(skip(self, reason))]
    pub async fn reject_or_cancel(
        &self,
        ticket_id: TicketId,
        actor: &str,
        decision: TicketDecision,
        reason: Option<String>,
    ) -> Result<()> {
        let reason = &reason;
        retry_on_conflict(self.conflict_retry(), "reject_or_cancel", move || {
            self.close_ticket(ticket_id, actor, decision, reason)
        })
        .await?;

        let label = match decision {
            TicketDecision::Reject => "rejected",
            TicketDecision::Cancel => "cancelled",
        };
        counter!("vmgov_approvals_total", "decision" => label).increment(1);
        info!(ticket_id = %ticket_id, actor = actor, decision = label, "Ticket closed");
        Ok(())
    }

    async fn close_ticket(
        &self,
        ticket_id: TicketId,
        actor: &str,
        decision: TicketDecision,
        reason: &Option<String>,
    ) -> Result<()> {
        let now = Utc::now();
        let mut tx = self.store.begin().await?;

        let mut ticket = tx
            .ticket_for_update(ticket_id)
            .await?
            .ok_or_else(|| GovernanceError::not_found("ticket", ticket_id.to_string()))?;
        match decision {
            TicketDecision::Reject => ticket.reject(actor, reason.clone(), now)?,
            TicketDecision::Cancel => ticket.cancel(actor, reason.clone(), now)?,
        }

        let mut event = tx
            .event_for_update(ticket.event_id)
            .await?
            .ok_or_else(|| GovernanceError::not_found("event", ticket.event_id.to_string()))?;
        event.transition_to(EventStatus::Cancelled, now)?;

        tx.update_ticket(&ticket).await?;
        tx.update_event(&event).await?;
        tx.commit().await
    }

    pub async fn reject(&self, ticket_id: TicketId, actor: &str, reason: Option<String>) -> Result<()> {
        self.reject_or_cancel(ticket_id, actor, TicketDecision::Reject, reason)
            .await
    }

    pub async fn cancel(&self, ticket_id: TicketId, actor: &str, reason: Option<String>) -> Result<()> {
        self.reject_or_cancel(ticket_id, actor, TicketDecision::Cancel, reason)
            .await
    }

    /// Best-effort cancellation of an approved request's job.
    ///
    /// A job that has not started is discarded and its event cancelled. A
    /// running job is flagged; its provider call is not interrupted.
    #[instrument(skip(self))]
    pub async fn cancel_job(&self, event_id: EventId, actor: &str) -> Result<JobCancellation> {
        let result = retry_on_conflict(self.conflict_retry(), "cancel_job", move || {
            self.cancel_job_once(event_id, actor)
        })
        .await?;

        info!(event_id = %event_id, actor = actor, result = ?result, "Job cancellation handled");
        Ok(result)
    }

    async fn cancel_job_once(&self, event_id: EventId, actor: &str) -> Result<JobCancellation> {
        let now = Utc::now();
        let mut tx = self.store.begin().await?;

        let mut job = tx
            .job_for_event_for_update(event_id)
            .await?
            .ok_or_else(|| GovernanceError::not_found("job for event", event_id.to_string()))?;

        let result = match job.state {
            JobState::Available | JobState::Retryable => {
                let mut event = tx
                    .event_for_update(event_id)
                    .await?
                    .ok_or_else(|| GovernanceError::not_found("event", event_id.to_string()))?;
                job.discard(format!("cancelled by {}", actor), now)?;
                event.transition_to(EventStatus::Cancelled, now)?;
                tx.update_event(&event).await?;
                JobCancellation::Discarded
            }
            JobState::Running => {
                job.cancel_requested = true;
                job.updated_at = now;
                JobCancellation::Requested
            }
            JobState::Completed | JobState::Discarded => {
                return Err(GovernanceError::invalid_state_transition(
                    "job",
                    job.state,
                    "cancelled",
                )
                .with_context("job_id", job.id.to_string()));
            }
        };

        tx.update_job(&job).await?;
        tx.commit().await?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::governance::policy::RuleBasedApprovalPolicy;
    use crate::governance::ticket::TicketStatus;
    use crate::store::InMemoryStore;
    use serde_json::json;

    fn enqueuer(store: &Arc<InMemoryStore>) -> TransactionalEnqueuer {
        TransactionalEnqueuer::new(
            store.clone(),
            Arc::new(RuleBasedApprovalPolicy::always_require_approval()),
            EnqueuerConfig::default(),
            RetryPolicy::with_attempts(3),
        )
    }

    fn draft() -> SubmissionDraft {
        SubmissionDraft {
            operation: VmOperation::Create,
            aggregate_type: "vm".to_string(),
            aggregate_id: "vm-1".to_string(),
            payload: serde_json::to_vec(&json!({"cpu": 2, "memory_mb": 4096})).unwrap(),
            created_by: "alice".to_string(),
            reason: Some("capacity".to_string()),
            priority: JobPriority::Normal,
        }
    }

    #[tokio::test]
    async fn test_pending_submission_has_no_job() {
        let store = Arc::new(InMemoryStore::new());
        let enqueuer = enqueuer(&store);

        let submission = enqueuer.enqueue_submission(&draft(), true).await.unwrap();
        assert!(submission.job_id.is_none());
        assert!(!submission.auto_approved);

        let event = store.get_event(submission.event_id).await.unwrap().unwrap();
        assert_eq!(event.status, EventStatus::Pending);
        let ticket = store.get_ticket(submission.ticket_id).await.unwrap().unwrap();
        assert_eq!(ticket.status, TicketStatus::PendingApproval);
        assert!(store.job_for_event(submission.event_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_auto_approved_submission_enqueues_job() {
        let store = Arc::new(InMemoryStore::new());
        let enqueuer = enqueuer(&store);

        let submission = enqueuer.enqueue_submission(&draft(), false).await.unwrap();
        let job_id = submission.job_id.unwrap();

        let event = store.get_event(submission.event_id).await.unwrap().unwrap();
        assert_eq!(event.status, EventStatus::Processing);
        let job = store.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.event_id, submission.event_id);
        assert_eq!(job.aggregate_id, "vm-1");
        assert_eq!(job.max_attempts, 3);
    }

    #[tokio::test]
    async fn test_approve_stores_modified_spec() {
        let store = Arc::new(InMemoryStore::new());
        let enqueuer = enqueuer(&store);
        let submission = enqueuer.enqueue_submission(&draft(), true).await.unwrap();

        let job_id = enqueuer
            .approve_and_enqueue(
                ApproveRequest::new(submission.ticket_id, "bob").with_modified_spec(json!({"cpu": 4})),
            )
            .await
            .unwrap();

        let ticket = store.get_ticket(submission.ticket_id).await.unwrap().unwrap();
        assert_eq!(ticket.status, TicketStatus::Approved);
        assert_eq!(ticket.modified_spec, Some(json!({"cpu": 4})));
        assert_eq!(store.get_job(job_id).await.unwrap().unwrap().state, JobState::Available);
    }

    #[tokio::test]
    async fn test_non_object_modified_spec_rejected_before_tx() {
        let store = Arc::new(InMemoryStore::new());
        let enqueuer = enqueuer(&store);
        let submission = enqueuer.enqueue_submission(&draft(), true).await.unwrap();

        let err = enqueuer
            .approve_and_enqueue(ApproveRequest::new(submission.ticket_id, "bob").with_modified_spec(json!([1])))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ValidationError);
        assert_eq!(store.job_count().await, 0);
    }

    #[tokio::test]
    async fn test_reject_closes_without_job() {
        let store = Arc::new(InMemoryStore::new());
        let enqueuer = enqueuer(&store);
        let submission = enqueuer.enqueue_submission(&draft(), true).await.unwrap();

        enqueuer
            .reject(submission.ticket_id, "bob", Some("too big".to_string()))
            .await
            .unwrap();

        let event = store.get_event(submission.event_id).await.unwrap().unwrap();
        assert_eq!(event.status, EventStatus::Cancelled);

        let err = enqueuer
            .approve_and_enqueue(ApproveRequest::new(submission.ticket_id, "carol"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidTicketState);
        assert_eq!(store.job_count().await, 0);
    }

    #[tokio::test]
    async fn test_cancel_job_before_start() {
        let store = Arc::new(InMemoryStore::new());
        let enqueuer = enqueuer(&store);
        let submission = enqueuer.enqueue_submission(&draft(), false).await.unwrap();

        let result = enqueuer.cancel_job(submission.event_id, "alice").await.unwrap();
        assert_eq!(result, JobCancellation::Discarded);

        let event = store.get_event(submission.event_id).await.unwrap().unwrap();
        assert_eq!(event.status, EventStatus::Cancelled);

        let err = enqueuer.cancel_job(submission.event_id, "alice").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidStateTransition);
    }

    #[tokio::test]
    async fn test_submit_runs_policy() {
        let store = Arc::new(InMemoryStore::new());
        let enqueuer = TransactionalEnqueuer::new(
            store.clone(),
            Arc::new(RuleBasedApprovalPolicy::new(&Default::default())),
            EnqueuerConfig::default(),
            RetryPolicy::default(),
        );

        let submission = enqueuer
            .submit(SubmitRequest {
                requester: Requester::new("ops").with_role("admin"),
                operation: VmOperation::Delete,
                aggregate_type: "vm".to_string(),
                aggregate_id: "vm-9".to_string(),
                spec: json!({}),
                reason: None,
                priority: Some(JobPriority::High),
            })
            .await
            .unwrap();
        assert!(submission.auto_approved);
        let job = store.get_job(submission.job_id.unwrap()).await.unwrap().unwrap();
        assert_eq!(job.priority, JobPriority::High);

        let err = enqueuer
            .submit(SubmitRequest {
                requester: Requester::new(""),
                operation: VmOperation::Create,
                aggregate_type: "vm".to_string(),
                aggregate_id: "vm-9".to_string(),
                spec: json!({}),
                reason: None,
                priority: None,
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::PolicyInputInvalid);
        assert_eq!(store.event_count().await, 1);
    }
}
