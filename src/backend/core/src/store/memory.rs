//! In-process transactional store.
//!
//! A transaction holds the store's lock from `begin` to `commit`/drop, so
//! transactions are serialisable. Writes are staged on the transaction and
//! only applied on commit; dropping the transaction discards them.
//!
//! Tests can arm failpoints to make a chosen write or the commit fail.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex as SyncMutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;

use super::{EventFilter, LeaseRequest, LeasedJob, PipelineSummary, Store, StoreTx};
use crate::error::{ErrorCode, GovernanceError, Result};
use crate::governance::event::{Event, EventId};
use crate::governance::ticket::{ApprovalTicket, TicketId, TicketStatus};
use crate::jobs::job::{Job, JobId, JobState};

// ═══════════════════════════════════════════════════════════════════════════════
// Fault injection
// ═══════════════════════════════════════════════════════════════════════════════

/// Points inside a transaction where a fault can be injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Failpoint {
    InsertEvent,
    InsertTicket,
    InsertJob,
    UpdateEvent,
    UpdateTicket,
    UpdateJob,
    Commit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// A plain database error
    Error,
    /// A serialization failure the caller may retry
    Conflict,
}

#[derive(Debug, Default)]
struct Faults {
    armed: HashMap<Failpoint, (FaultKind, u32)>,
}

impl Faults {
    fn trip(&mut self, point: Failpoint) -> Result<()> {
        let Some((kind, remaining)) = self.armed.get_mut(&point) else {
            return Ok(());
        };
        let kind = *kind;
        *remaining -= 1;
        if *remaining == 0 {
            self.armed.remove(&point);
        }

        trace!(?point, ?kind, "Injected store fault");
        Err(match kind {
            FaultKind::Error => GovernanceError::with_internal(
                ErrorCode::DatabaseQueryFailed,
                "A database error occurred",
                format!("injected fault at {:?}", point),
            ),
            FaultKind::Conflict => {
                GovernanceError::transaction_conflict(format!("injected conflict at {:?}", point))
            }
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// State
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Default)]
struct State {
    events: HashMap<EventId, Event>,
    tickets: HashMap<TicketId, ApprovalTicket>,
    jobs: HashMap<JobId, Job>,
    ticket_by_event: HashMap<EventId, TicketId>,
    job_by_event: HashMap<EventId, JobId>,
}

/// Writes staged by an open transaction.
#[derive(Debug, Default)]
struct Staged {
    events: HashMap<EventId, Event>,
    tickets: HashMap<TicketId, ApprovalTicket>,
    jobs: HashMap<JobId, Job>,
    ticket_by_event: HashMap<EventId, TicketId>,
    job_by_event: HashMap<EventId, JobId>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Store
// ═══════════════════════════════════════════════════════════════════════════════

/// Serialisable in-process [`Store`].
#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<State>>,
    faults: Arc<SyncMutex<Faults>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `times` hits of `point` fail with `kind`.
    pub fn inject_fault(&self, point: Failpoint, kind: FaultKind, times: u32) {
        if times == 0 {
            return;
        }
        self.faults.lock().armed.insert(point, (kind, times));
    }

    pub fn clear_faults(&self) {
        self.faults.lock().armed.clear();
    }

    pub async fn event_count(&self) -> usize {
        self.state.lock().await.events.len()
    }

    pub async fn ticket_count(&self) -> usize {
        self.state.lock().await.tickets.len()
    }

    pub async fn job_count(&self) -> usize {
        self.state.lock().await.jobs.len()
    }

    pub async fn all_jobs(&self) -> Vec<Job> {
        self.state.lock().await.jobs.values().cloned().collect()
    }
}

pub struct MemoryTx {
    state: OwnedMutexGuard<State>,
    staged: Staged,
    faults: Arc<SyncMutex<Faults>>,
}

impl MemoryTx {
    fn trip(&self, point: Failpoint) -> Result<()> {
        self.faults.lock().trip(point)
    }

    fn event(&self, id: EventId) -> Option<&Event> {
        self.staged.events.get(&id).or_else(|| self.state.events.get(&id))
    }

    fn ticket(&self, id: TicketId) -> Option<&ApprovalTicket> {
        self.staged.tickets.get(&id).or_else(|| self.state.tickets.get(&id))
    }

    fn job(&self, id: JobId) -> Option<&Job> {
        self.staged.jobs.get(&id).or_else(|| self.state.jobs.get(&id))
    }

    fn job_id_for_event(&self, event_id: EventId) -> Option<JobId> {
        self.staged
            .job_by_event
            .get(&event_id)
            .or_else(|| self.state.job_by_event.get(&event_id))
            .copied()
    }

    fn ticket_id_for_event(&self, event_id: EventId) -> Option<TicketId> {
        self.staged
            .ticket_by_event
            .get(&event_id)
            .or_else(|| self.state.ticket_by_event.get(&event_id))
            .copied()
    }
}

fn duplicate(entity: &str, id: impl std::fmt::Display) -> GovernanceError {
    GovernanceError::new(
        ErrorCode::DuplicateRecord,
        format!("{} {} already exists", entity, id),
    )
}

fn missing_parent(entity: &str, event_id: EventId) -> GovernanceError {
    GovernanceError::with_internal(
        ErrorCode::DatabaseQueryFailed,
        "A database error occurred",
        format!("{} references unknown event {}", entity, event_id),
    )
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn insert_event(&mut self, event: &Event) -> Result<()> {
        self.trip(Failpoint::InsertEvent)?;
        if self.event(event.id).is_some() {
            return Err(duplicate("event", event.id));
        }
        if let Some(parent) = event.parent_event_id {
            if self.event(parent).is_none() {
                return Err(missing_parent("event", parent));
            }
        }
        self.staged.events.insert(event.id, event.clone());
        Ok(())
    }

    async fn insert_ticket(&mut self, ticket: &ApprovalTicket) -> Result<()> {
        self.trip(Failpoint::InsertTicket)?;
        if self.event(ticket.event_id).is_none() {
            return Err(missing_parent("ticket", ticket.event_id));
        }
        if self.ticket(ticket.id).is_some() || self.ticket_id_for_event(ticket.event_id).is_some() {
            return Err(duplicate("ticket for event", ticket.event_id));
        }
        self.staged.ticket_by_event.insert(ticket.event_id, ticket.id);
        self.staged.tickets.insert(ticket.id, ticket.clone());
        Ok(())
    }

    async fn insert_job(&mut self, job: &Job) -> Result<()> {
        self.trip(Failpoint::InsertJob)?;
        if self.event(job.event_id).is_none() {
            return Err(missing_parent("job", job.event_id));
        }
        if self.job(job.id).is_some() || self.job_id_for_event(job.event_id).is_some() {
            return Err(duplicate("job for event", job.event_id));
        }
        self.staged.job_by_event.insert(job.event_id, job.id);
        self.staged.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn event_for_update(&mut self, id: EventId) -> Result<Option<Event>> {
        Ok(self.event(id).cloned())
    }

    async fn ticket_for_update(&mut self, id: TicketId) -> Result<Option<ApprovalTicket>> {
        Ok(self.ticket(id).cloned())
    }

    async fn job_for_update(&mut self, id: JobId) -> Result<Option<Job>> {
        Ok(self.job(id).cloned())
    }

    async fn job_for_event_for_update(&mut self, event_id: EventId) -> Result<Option<Job>> {
        Ok(self.job_id_for_event(event_id).and_then(|id| self.job(id).cloned()))
    }

    async fn update_event(&mut self, event: &Event) -> Result<()> {
        self.trip(Failpoint::UpdateEvent)?;
        let mut current = self
            .event(event.id)
            .cloned()
            .ok_or_else(|| GovernanceError::not_found("event", event.id.to_string()))?;
        current.status = event.status;
        current.updated_at = event.updated_at;
        current.archived_at = event.archived_at;
        self.staged.events.insert(current.id, current);
        Ok(())
    }

    async fn update_ticket(&mut self, ticket: &ApprovalTicket) -> Result<()> {
        self.trip(Failpoint::UpdateTicket)?;
        if self.ticket(ticket.id).is_none() {
            return Err(GovernanceError::not_found("ticket", ticket.id.to_string()));
        }
        self.staged.tickets.insert(ticket.id, ticket.clone());
        Ok(())
    }

    async fn update_job(&mut self, job: &Job) -> Result<()> {
        self.trip(Failpoint::UpdateJob)?;
        if self.job(job.id).is_none() {
            return Err(GovernanceError::not_found("job", job.id.to_string()));
        }
        self.staged.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        self.trip(Failpoint::Commit)?;
        let staged = std::mem::take(&mut self.staged);
        let state = &mut *self.state;
        state.events.extend(staged.events);
        state.tickets.extend(staged.tickets);
        state.jobs.extend(staged.jobs);
        state.ticket_by_event.extend(staged.ticket_by_event);
        state.job_by_event.extend(staged.job_by_event);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>> {
        let state = self.state.clone().lock_owned().await;
        Ok(Box::new(MemoryTx {
            state,
            staged: Staged::default(),
            faults: self.faults.clone(),
        }))
    }

    async fn lease_jobs(&self, request: &LeaseRequest) -> Result<Vec<LeasedJob>> {
        if request.limit == 0 {
            return Ok(Vec::new());
        }
        let mut state = self.state.lock().await;

        let mut busy: HashSet<String> = state
            .jobs
            .values()
            .filter(|job| job.state == JobState::Running)
            .map(|job| job.aggregate_id.clone())
            .collect();

        let mut candidates: Vec<&Job> = state
            .jobs
            .values()
            .filter(|job| {
                job.state == JobState::Available
                    && job.available_at <= request.now
                    && !job.cancel_requested
            })
            .collect();
        candidates.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.available_at.cmp(&b.available_at))
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });

        let mut picked = Vec::new();
        for job in candidates {
            if picked.len() == request.limit {
                break;
            }
            if busy.insert(job.aggregate_id.clone()) {
                picked.push(job.id);
            }
        }

        // Claim on copies; the batch is applied only if every claim succeeds.
        let mut leased = Vec::with_capacity(picked.len());
        for id in picked {
            if let Some(job) = state.jobs.get(&id) {
                let mut job = job.clone();
                let lease = job.claim(&request.owner, request.ttl, request.now)?;
                leased.push(LeasedJob { job, lease });
            }
        }
        for entry in &leased {
            state.jobs.insert(entry.job.id, entry.job.clone());
        }
        Ok(leased)
    }

    async fn expired_leases(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<JobId>> {
        let state = self.state.lock().await;
        let mut expired: Vec<&Job> = state
            .jobs
            .values()
            .filter(|job| job.lease_expired(now))
            .collect();
        expired.sort_by_key(|job| job.lease.as_ref().map(|l| l.expires_at));
        Ok(expired.into_iter().take(limit).map(|job| job.id).collect())
    }

    async fn due_retries(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<JobId>> {
        let state = self.state.lock().await;
        let mut due: Vec<&Job> = state
            .jobs
            .values()
            .filter(|job| job.state == JobState::Retryable && job.available_at <= now)
            .collect();
        due.sort_by_key(|job| job.available_at);
        Ok(due.into_iter().take(limit).map(|job| job.id).collect())
    }

    async fn archive_terminal_events(&self, before: DateTime<Utc>, now: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.lock().await;
        let mut archived = 0;
        for event in state.events.values_mut() {
            if event.status.is_terminal() && event.updated_at < before && event.archive(now)? {
                archived += 1;
            }
        }
        Ok(archived)
    }

    async fn get_event(&self, id: EventId) -> Result<Option<Event>> {
        Ok(self.state.lock().await.events.get(&id).cloned())
    }

    async fn get_ticket(&self, id: TicketId) -> Result<Option<ApprovalTicket>> {
        Ok(self.state.lock().await.tickets.get(&id).cloned())
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>> {
        Ok(self.state.lock().await.jobs.get(&id).cloned())
    }

    async fn ticket_for_event(&self, event_id: EventId) -> Result<Option<ApprovalTicket>> {
        let state = self.state.lock().await;
        Ok(state
            .ticket_by_event
            .get(&event_id)
            .and_then(|id| state.tickets.get(id))
            .cloned())
    }

    async fn job_for_event(&self, event_id: EventId) -> Result<Option<Job>> {
        let state = self.state.lock().await;
        Ok(state
            .job_by_event
            .get(&event_id)
            .and_then(|id| state.jobs.get(id))
            .cloned())
    }

    async fn list_events(&self, filter: &EventFilter) -> Result<Vec<Event>> {
        let state = self.state.lock().await;
        let mut events: Vec<Event> = state
            .events
            .values()
            .filter(|e| filter.include_archived || e.archived_at.is_none())
            .filter(|e| filter.status.map_or(true, |s| e.status == s))
            .filter(|e| {
                filter
                    .aggregate_id
                    .as_deref()
                    .map_or(true, |id| e.aggregate_id == id)
            })
            .cloned()
            .collect();
        events.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        events.truncate(filter.limit);
        Ok(events)
    }

    async fn outcome_events(&self, request_id: EventId) -> Result<Vec<Event>> {
        let state = self.state.lock().await;
        let mut events: Vec<Event> = state
            .events
            .values()
            .filter(|e| e.parent_event_id == Some(request_id))
            .cloned()
            .collect();
        events.sort_by_key(|e| e.created_at);
        Ok(events)
    }

    async fn list_pending_tickets(&self, limit: usize) -> Result<Vec<ApprovalTicket>> {
        let state = self.state.lock().await;
        let mut tickets: Vec<ApprovalTicket> = state
            .tickets
            .values()
            .filter(|t| t.status == TicketStatus::PendingApproval)
            .cloned()
            .collect();
        tickets.sort_by_key(|t| t.created_at);
        tickets.truncate(limit);
        Ok(tickets)
    }

    async fn summary(&self) -> Result<PipelineSummary> {
        let state = self.state.lock().await;
        let mut summary = PipelineSummary::default();
        for event in state.events.values() {
            *summary.events.entry(event.status.to_string()).or_default() += 1;
        }
        for ticket in state.tickets.values() {
            *summary.tickets.entry(ticket.status.to_string()).or_default() += 1;
        }
        for job in state.jobs.values() {
            *summary.jobs.entry(job.state.to_string()).or_default() += 1;
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::governance::event::EventStatus;
    use crate::jobs::job::JobPriority;
    use crate::provider::VmOperation;
    use std::time::Duration;

    fn event(aggregate: &str) -> Event {
        Event::request(
            VmOperation::Restart,
            "vm",
            aggregate,
            b"{}".to_vec(),
            "alice",
            EventStatus::Processing,
            Utc::now(),
        )
    }

    async fn seed(store: &InMemoryStore, aggregate: &str, priority: JobPriority) -> Job {
        let event = event(aggregate);
        let job = Job::new(event.id, aggregate, priority, 3, Utc::now());
        let mut tx = store.begin().await.unwrap();
        tx.insert_event(&event).await.unwrap();
        tx.insert_job(&job).await.unwrap();
        tx.commit().await.unwrap();
        job
    }

    fn lease(limit: usize) -> LeaseRequest {
        LeaseRequest {
            owner: "worker-a".to_string(),
            limit,
            ttl: Duration::from_secs(30),
            now: Utc::now() + chrono::Duration::seconds(1),
        }
    }

    #[tokio::test]
    async fn test_dropped_tx_discards_writes() {
        let store = InMemoryStore::new();
        {
            let mut tx = store.begin().await.unwrap();
            tx.insert_event(&event("vm-1")).await.unwrap();
        }
        assert_eq!(store.event_count().await, 0);
    }

    #[test]
    fn test_job_requires_event() {
        let store = InMemoryStore::new();
        let job = Job::new(EventId::new(), "vm-1", JobPriority::Normal, 3, Utc::now());
        tokio_test::block_on(async {
            let mut tx = tokio_test::assert_ok!(store.begin().await);
            tokio_test::assert_err!(tx.insert_job(&job).await);
        });
    }

    #[tokio::test]
    async fn test_one_job_per_event() {
        let store = InMemoryStore::new();
        let job = seed(&store, "vm-1", JobPriority::Normal).await;
        let second = Job::new(job.event_id, "vm-1", JobPriority::Normal, 3, Utc::now());

        let mut tx = store.begin().await.unwrap();
        let err = tx.insert_job(&second).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::DuplicateRecord);
    }

    #[tokio::test]
    async fn test_update_event_keeps_payload() {
        let store = InMemoryStore::new();
        let original = event("vm-1");
        let mut tx = store.begin().await.unwrap();
        tx.insert_event(&original).await.unwrap();
        tx.commit().await.unwrap();

        let mut changed = original.clone();
        changed.payload = b"{\"cpu\":64}".to_vec();
        changed.status = EventStatus::Completed;
        let mut tx = store.begin().await.unwrap();
        tx.update_event(&changed).await.unwrap();
        tx.commit().await.unwrap();

        let stored = store.get_event(original.id).await.unwrap().unwrap();
        assert_eq!(stored.status, EventStatus::Completed);
        assert_eq!(stored.payload(), original.payload());
    }

    #[tokio::test]
    async fn test_fault_on_commit_discards_all() {
        let store = InMemoryStore::new();
        store.inject_fault(Failpoint::Commit, FaultKind::Conflict, 1);

        let mut tx = store.begin().await.unwrap();
        tx.insert_event(&event("vm-1")).await.unwrap();
        let err = tx.commit().await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.event_count().await, 0);

        // disarmed after one hit
        let mut tx = store.begin().await.unwrap();
        tx.insert_event(&event("vm-1")).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(store.event_count().await, 1);
    }

    #[tokio::test]
    async fn test_lease_orders_by_priority_and_serializes_aggregates() {
        let store = InMemoryStore::new();
        let low = seed(&store, "vm-1", JobPriority::Low).await;
        let high = seed(&store, "vm-2", JobPriority::High).await;
        let same_aggregate = seed(&store, "vm-2", JobPriority::Critical).await;

        let leased = store.lease_jobs(&lease(10)).await.unwrap();
        let ids: Vec<JobId> = leased.iter().map(|l| l.job.id).collect();

        // one per aggregate, critical beats high on vm-2
        assert_eq!(ids, vec![same_aggregate.id, low.id]);
        assert!(leased.iter().all(|l| l.job.attempt == 1));

        // vm-2 is busy until its running job resolves
        assert!(store.lease_jobs(&lease(10)).await.unwrap().is_empty());
        assert_eq!(
            store.get_job(high.id).await.unwrap().unwrap().state,
            JobState::Available
        );
    }

    #[tokio::test]
    async fn test_lease_skips_cancel_requested() {
        let store = InMemoryStore::new();
        let mut flagged = seed(&store, "vm-1", JobPriority::Critical).await;
        let other = seed(&store, "vm-2", JobPriority::Low).await;

        flagged.cancel_requested = true;
        let mut tx = store.begin().await.unwrap();
        tx.update_job(&flagged).await.unwrap();
        tx.commit().await.unwrap();

        let leased = store.lease_jobs(&lease(10)).await.unwrap();
        assert_eq!(leased.len(), 1);
        assert_eq!(leased[0].job.id, other.id);
        assert_eq!(
            store.get_job(flagged.id).await.unwrap().unwrap().state,
            JobState::Available
        );
    }

    #[tokio::test]
    async fn test_failed_lease_batch_leaves_jobs_untouched() {
        let store = InMemoryStore::new();
        let first = seed(&store, "vm-1", JobPriority::Normal).await;
        let second = seed(&store, "vm-2", JobPriority::Normal).await;

        let mut request = lease(10);
        request.ttl = Duration::MAX;
        let err = store.lease_jobs(&request).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidConfiguration);

        for id in [first.id, second.id] {
            let job = store.get_job(id).await.unwrap().unwrap();
            assert_eq!(job.state, JobState::Available);
            assert_eq!(job.attempt, 0);
            assert!(job.lease.is_none());
        }
        assert_eq!(store.lease_jobs(&lease(10)).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_expired_leases() {
        let store = InMemoryStore::new();
        seed(&store, "vm-1", JobPriority::Normal).await;
        let request = lease(1);
        let leased = store.lease_jobs(&request).await.unwrap();

        assert!(store.expired_leases(request.now, 10).await.unwrap().is_empty());
        let later = request.now + chrono::Duration::seconds(31);
        assert_eq!(
            store.expired_leases(later, 10).await.unwrap(),
            vec![leased[0].job.id]
        );
    }

    #[tokio::test]
    async fn test_summary_counts() {
        let store = InMemoryStore::new();
        seed(&store, "vm-1", JobPriority::Normal).await;
        seed(&store, "vm-2", JobPriority::Normal).await;
        store.lease_jobs(&lease(1)).await.unwrap();

        let summary = store.summary().await.unwrap();
        assert_eq!(summary.jobs_in("running"), 1);
        assert_eq!(summary.jobs_in("available"), 1);
        assert_eq!(summary.events_in("processing"), 2);
    }
}
