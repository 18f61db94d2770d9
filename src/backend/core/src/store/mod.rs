//! Durable store boundary.
//!
//! Every write that touches more than one entity goes through a [`StoreTx`].
//! A transaction that is dropped without [`StoreTx::commit`] is rolled back.
//!
//! Two backends:
//! - [`memory::InMemoryStore`]: serialisable, in-process, with fault injection
//! - [`postgres::PgStore`]: PostgreSQL via `sqlx`

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::error::Result;
use crate::governance::event::{Event, EventId, EventStatus};
use crate::governance::ticket::{ApprovalTicket, TicketId};
use crate::jobs::job::{Job, JobId, Lease};

pub use memory::InMemoryStore;
pub use postgres::PgStore;

// ═══════════════════════════════════════════════════════════════════════════════
// Requests and results
// ═══════════════════════════════════════════════════════════════════════════════

/// Parameters for one lease round.
#[derive(Debug, Clone)]
pub struct LeaseRequest {
    pub owner: String,
    pub limit: usize,
    pub ttl: Duration,
    pub now: DateTime<Utc>,
}

/// A job as it was when this worker leased it.
#[derive(Debug, Clone, PartialEq)]
pub struct LeasedJob {
    pub job: Job,
    pub lease: Lease,
}

/// Filter for [`Store::list_events`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventFilter {
    pub status: Option<EventStatus>,
    pub aggregate_id: Option<String>,
    pub include_archived: bool,
    pub limit: usize,
}

impl Default for EventFilter {
    fn default() -> Self {
        Self {
            status: None,
            aggregate_id: None,
            include_archived: false,
            limit: 100,
        }
    }
}

/// Row counts per status, per entity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineSummary {
    pub events: BTreeMap<String, u64>,
    pub tickets: BTreeMap<String, u64>,
    pub jobs: BTreeMap<String, u64>,
}

impl PipelineSummary {
    pub fn jobs_in(&self, state: &str) -> u64 {
        self.jobs.get(state).copied().unwrap_or(0)
    }

    pub fn events_in(&self, status: &str) -> u64 {
        self.events.get(status).copied().unwrap_or(0)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Traits
// ═══════════════════════════════════════════════════════════════════════════════

/// One open transaction. Reads marked `for_update` lock the row until the
/// transaction ends.
#[async_trait]
pub trait StoreTx: Send {
    async fn insert_event(&mut self, event: &Event) -> Result<()>;
    async fn insert_ticket(&mut self, ticket: &ApprovalTicket) -> Result<()>;
    async fn insert_job(&mut self, job: &Job) -> Result<()>;

    async fn event_for_update(&mut self, id: EventId) -> Result<Option<Event>>;
    async fn ticket_for_update(&mut self, id: TicketId) -> Result<Option<ApprovalTicket>>;
    async fn job_for_update(&mut self, id: JobId) -> Result<Option<Job>>;
    async fn job_for_event_for_update(&mut self, event_id: EventId) -> Result<Option<Job>>;

    /// Persists status, `updated_at` and `archived_at`. The payload is never written.
    async fn update_event(&mut self, event: &Event) -> Result<()>;
    async fn update_ticket(&mut self, ticket: &ApprovalTicket) -> Result<()>;
    async fn update_job(&mut self, job: &Job) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;
    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// The durable store shared by the enqueuer and every dispatcher.
#[async_trait]
pub trait Store: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn StoreTx>>;

    /// Atomically claim up to `limit` available jobs, highest priority first,
    /// never two for one aggregate and never one whose aggregate already has
    /// a running job.
    async fn lease_jobs(&self, request: &LeaseRequest) -> Result<Vec<LeasedJob>>;

    /// Running jobs whose lease ran out.
    async fn expired_leases(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<JobId>>;

    /// Retryable jobs whose backoff has elapsed.
    async fn due_retries(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<JobId>>;

    /// Soft-archive terminal events last touched before `before`.
    async fn archive_terminal_events(&self, before: DateTime<Utc>, now: DateTime<Utc>) -> Result<u64>;

    // ─────────────────────────────────────────────────────────────────────────
    // Read-only queries
    // ─────────────────────────────────────────────────────────────────────────

    async fn get_event(&self, id: EventId) -> Result<Option<Event>>;
    async fn get_ticket(&self, id: TicketId) -> Result<Option<ApprovalTicket>>;
    async fn get_job(&self, id: JobId) -> Result<Option<Job>>;
    async fn ticket_for_event(&self, event_id: EventId) -> Result<Option<ApprovalTicket>>;
    async fn job_for_event(&self, event_id: EventId) -> Result<Option<Job>>;
    /// Newest first.
    async fn list_events(&self, filter: &EventFilter) -> Result<Vec<Event>>;
    /// Outcome events appended for a request, oldest first.
    async fn outcome_events(&self, request_id: EventId) -> Result<Vec<Event>>;
    /// Oldest first.
    async fn list_pending_tickets(&self, limit: usize) -> Result<Vec<ApprovalTicket>>;
    async fn summary(&self) -> Result<PipelineSummary>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// Conflict retry
// ═══════════════════════════════════════════════════════════════════════════════

/// Bounded retry for transactions that lose a race.
#[derive(Debug, Clone, Copy)]
pub struct ConflictRetry {
    /// Extra attempts after the first
    pub max_retries: u32,
    /// Delay before the first retry, doubled after each
    pub backoff: Duration,
}

impl Default for ConflictRetry {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Duration::from_millis(25),
        }
    }
}

/// Run `op` again while it fails with `TransactionConflict`, up to the policy's
/// bound. Any other error, or the last conflict, is returned as is.
pub async fn retry_on_conflict<T, F, Fut>(policy: ConflictRetry, operation: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut retries = 0;
    loop {
        match op().await {
            Err(error) if error.is_conflict() && retries < policy.max_retries => {
                retries += 1;
                let delay = policy.backoff.saturating_mul(1 << (retries - 1).min(16));
                warn!(
                    operation = operation,
                    retry = retries,
                    delay_ms = delay.as_millis() as u64,
                    "Transaction conflict, retrying"
                );
                metrics::counter!("vmgov_transaction_conflicts_total", "operation" => operation.to_string())
                    .increment(1);
                tokio::time::sleep(delay).await;
            }
            other => return other,
        }
    }
}
