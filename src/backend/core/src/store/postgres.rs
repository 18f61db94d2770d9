//! PostgreSQL store.
//!
//! Leasing takes candidate rows with `FOR UPDATE SKIP LOCKED`, then a
//! transaction-scoped advisory lock per aggregate, and re-checks for a running
//! job on that aggregate under the lock before claiming. Two dispatchers can
//! therefore never start jobs for the same aggregate at the same time.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use std::collections::{BTreeMap, HashMap, HashSet};
use uuid::Uuid;

use super::{EventFilter, LeaseRequest, LeasedJob, PipelineSummary, Store, StoreTx};
use crate::config::DatabaseConfig;
use crate::error::{GovernanceError, Result};
use crate::governance::event::{Event, EventId, EventStatus};
use crate::governance::ticket::{ApprovalTicket, TicketId};
use crate::jobs::job::{Job, JobId, JobPriority, Lease};

/// Candidate rows fetched per leased slot; covers aggregates skipped under contention.
const CANDIDATE_OVERSAMPLE: usize = 4;

const EVENT_COLUMNS: &str = "id, event_type, aggregate_type, aggregate_id, payload, status, \
     created_by, created_at, updated_at, archived_at, parent_event_id";

const TICKET_COLUMNS: &str = "id, event_id, status, modified_spec, request_reason, created_by, \
     created_at, updated_at, decided_by, decided_at, decision_reason";

const JOB_COLUMNS: &str = "id, event_id, aggregate_id, priority, state, attempt, max_attempts, \
     available_at, lease_owner, lease_token, lease_expires_at, last_error, cancel_requested, \
     created_at, updated_at, finished_at";

/// Advisory lock key for an aggregate.
pub fn aggregate_lock_key(aggregate_id: &str) -> i64 {
    let mut hasher = Sha256::new();
    hasher.update(b"vmgov:aggregate:");
    hasher.update(aggregate_id.as_bytes());
    let digest = hasher.finalize();

    let mut key = [0u8; 8];
    key.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(key)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Store
// ═══════════════════════════════════════════════════════════════════════════════

/// Database connection pool and the [`Store`] implementation over it.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Create a new connection pool.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    /// Run migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn ids_where(&self, sql: &str, now: DateTime<Utc>, limit: usize) -> Result<Vec<JobId>> {
        let ids: Vec<Uuid> = sqlx::query_scalar(sql)
            .bind(now)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        Ok(ids.into_iter().map(JobId::from).collect())
    }

    async fn counts(&self, sql: &str) -> Result<BTreeMap<String, u64>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(sql).fetch_all(&self.pool).await?;
        Ok(rows
            .into_iter()
            .map(|(status, count)| (status, count.max(0) as u64))
            .collect())
    }
}

pub struct PgTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreTx for PgTx {
    async fn insert_event(&mut self, event: &Event) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO governance_events
                (id, event_type, aggregate_type, aggregate_id, payload, status,
                 created_by, created_at, updated_at, archived_at, parent_event_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(event.id.0)
        .bind(event.event_type.to_string())
        .bind(&event.aggregate_type)
        .bind(&event.aggregate_id)
        .bind(event.payload())
        .bind(event.status.as_str())
        .bind(&event.created_by)
        .bind(event.created_at)
        .bind(event.updated_at)
        .bind(event.archived_at)
        .bind(event.parent_event_id.map(|id| id.0))
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn insert_ticket(&mut self, ticket: &ApprovalTicket) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO approval_tickets
                (id, event_id, status, modified_spec, request_reason, created_by,
                 created_at, updated_at, decided_by, decided_at, decision_reason)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(ticket.id.0)
        .bind(ticket.event_id.0)
        .bind(ticket.status.as_str())
        .bind(&ticket.modified_spec)
        .bind(&ticket.request_reason)
        .bind(&ticket.created_by)
        .bind(ticket.created_at)
        .bind(ticket.updated_at)
        .bind(&ticket.decided_by)
        .bind(ticket.decided_at)
        .bind(&ticket.decision_reason)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn insert_job(&mut self, job: &Job) -> Result<()> {
        let lease = job.lease.as_ref();
        sqlx::query(
            r#"
            INSERT INTO governance_jobs
                (id, event_id, aggregate_id, priority, state, attempt, max_attempts,
                 available_at, lease_owner, lease_token, lease_expires_at, last_error,
                 cancel_requested, created_at, updated_at, finished_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(job.id.0)
        .bind(job.event_id.0)
        .bind(&job.aggregate_id)
        .bind(job.priority.score())
        .bind(job.state.as_str())
        .bind(job.attempt as i32)
        .bind(job.max_attempts as i32)
        .bind(job.available_at)
        .bind(lease.map(|l| l.owner.clone()))
        .bind(lease.map(|l| l.token))
        .bind(lease.map(|l| l.expires_at))
        .bind(&job.last_error)
        .bind(job.cancel_requested)
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.finished_at)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn event_for_update(&mut self, id: EventId) -> Result<Option<Event>> {
        let sql = format!("SELECT {} FROM governance_events WHERE id = $1 FOR UPDATE", EVENT_COLUMNS);
        sqlx::query_as::<_, EventRow>(&sql)
            .bind(id.0)
            .fetch_optional(&mut *self.tx)
            .await?
            .map(Event::try_from)
            .transpose()
    }

    async fn ticket_for_update(&mut self, id: TicketId) -> Result<Option<ApprovalTicket>> {
        let sql = format!("SELECT {} FROM approval_tickets WHERE id = $1 FOR UPDATE", TICKET_COLUMNS);
        sqlx::query_as::<_, TicketRow>(&sql)
            .bind(id.0)
            .fetch_optional(&mut *self.tx)
            .await?
            .map(ApprovalTicket::try_from)
            .transpose()
    }

    async fn job_for_update(&mut self, id: JobId) -> Result<Option<Job>> {
        let sql = format!("SELECT {} FROM governance_jobs WHERE id = $1 FOR UPDATE", JOB_COLUMNS);
        sqlx::query_as::<_, JobRow>(&sql)
            .bind(id.0)
            .fetch_optional(&mut *self.tx)
            .await?
            .map(Job::try_from)
            .transpose()
    }

    async fn job_for_event_for_update(&mut self, event_id: EventId) -> Result<Option<Job>> {
        let sql = format!(
            "SELECT {} FROM governance_jobs WHERE event_id = $1 FOR UPDATE",
            JOB_COLUMNS
        );
        sqlx::query_as::<_, JobRow>(&sql)
            .bind(event_id.0)
            .fetch_optional(&mut *self.tx)
            .await?
            .map(Job::try_from)
            .transpose()
    }

    async fn update_event(&mut self, event: &Event) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE governance_events
            SET status = $2, updated_at = $3, archived_at = $4
            WHERE id = $1
            "#,
        )
        .bind(event.id.0)
        .bind(event.status.as_str())
        .bind(event.updated_at)
        .bind(event.archived_at)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(GovernanceError::not_found("event", event.id.to_string()));
        }
        Ok(())
    }

    async fn update_ticket(&mut self, ticket: &ApprovalTicket) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE approval_tickets
            SET status = $2, modified_spec = $3, updated_at = $4,
                decided_by = $5, decided_at = $6, decision_reason = $7
            WHERE id = $1
            "#,
        )
        .bind(ticket.id.0)
        .bind(ticket.status.as_str())
        .bind(&ticket.modified_spec)
        .bind(ticket.updated_at)
        .bind(&ticket.decided_by)
        .bind(ticket.decided_at)
        .bind(&ticket.decision_reason)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(GovernanceError::not_found("ticket", ticket.id.to_string()));
        }
        Ok(())
    }

    async fn update_job(&mut self, job: &Job) -> Result<()> {
        let lease = job.lease.as_ref();
        let result = sqlx::query(
            r#"
            UPDATE governance_jobs
            SET priority = $2, state = $3, attempt = $4, available_at = $5,
                lease_owner = $6, lease_token = $7, lease_expires_at = $8,
                last_error = $9, cancel_requested = $10, updated_at = $11, finished_at = $12
            WHERE id = $1
            "#,
        )
        .bind(job.id.0)
        .bind(job.priority.score())
        .bind(job.state.as_str())
        .bind(job.attempt as i32)
        .bind(job.available_at)
        .bind(lease.map(|l| l.owner.clone()))
        .bind(lease.map(|l| l.token))
        .bind(lease.map(|l| l.expires_at))
        .bind(&job.last_error)
        .bind(job.cancel_requested)
        .bind(job.updated_at)
        .bind(job.finished_at)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(GovernanceError::not_found("job", job.id.to_string()));
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

#[async_trait]
impl Store for PgStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgTx { tx }))
    }

    async fn lease_jobs(&self, request: &LeaseRequest) -> Result<Vec<LeasedJob>> {
        if request.limit == 0 {
            return Ok(Vec::new());
        }
        let mut tx = self.pool.begin().await?;

        let candidates: Vec<(Uuid, String)> = sqlx::query_as(
            r#"
            SELECT j.id, j.aggregate_id
            FROM governance_jobs j
            WHERE j.state = 'available'
              AND j.available_at <= $1
              AND NOT j.cancel_requested
              AND NOT EXISTS (
                  SELECT 1 FROM governance_jobs r
                  WHERE r.aggregate_id = j.aggregate_id AND r.state = 'running'
              )
            ORDER BY j.priority DESC, j.available_at ASC, j.created_at ASC
            LIMIT $2
            FOR UPDATE OF j SKIP LOCKED
            "#,
        )
        .bind(request.now)
        .bind((request.limit * CANDIDATE_OVERSAMPLE) as i64)
        .fetch_all(&mut *tx)
        .await?;

        let mut seen = HashSet::new();
        let mut picked = Vec::with_capacity(request.limit);
        for (id, aggregate_id) in candidates {
            if picked.len() == request.limit {
                break;
            }
            if !seen.insert(aggregate_id.clone()) {
                continue;
            }

            let locked: bool = sqlx::query_scalar("SELECT pg_try_advisory_xact_lock($1)")
                .bind(aggregate_lock_key(&aggregate_id))
                .fetch_one(&mut *tx)
                .await?;
            if !locked {
                continue;
            }

            // A fresh statement sees running jobs committed after the candidate scan.
            let busy: bool = sqlx::query_scalar(
                "SELECT EXISTS (SELECT 1 FROM governance_jobs WHERE aggregate_id = $1 AND state = 'running')",
            )
            .bind(&aggregate_id)
            .fetch_one(&mut *tx)
            .await?;
            if !busy {
                picked.push(id);
            }
        }

        if picked.is_empty() {
            tx.rollback().await?;
            return Ok(Vec::new());
        }

        let tokens: Vec<Uuid> = picked.iter().map(|_| Uuid::new_v4()).collect();
        let expires_at = request.now
            + chrono::Duration::from_std(request.ttl)
                .map_err(|e| GovernanceError::configuration(format!("lease ttl out of range: {}", e)))?;

        let sql = format!(
            r#"
            UPDATE governance_jobs AS j
            SET state = 'running',
                attempt = j.attempt + 1,
                lease_owner = $3,
                lease_token = c.token,
                lease_expires_at = $4,
                updated_at = $5
            FROM UNNEST($1::uuid[], $2::uuid[]) AS c(id, token)
            WHERE j.id = c.id AND j.state = 'available' AND NOT j.cancel_requested
            RETURNING {}
            "#,
            JOB_COLUMNS
                .split(", ")
                .map(|c| format!("j.{}", c.trim()))
                .collect::<Vec<_>>()
                .join(", ")
        );
        let rows: Vec<JobRow> = sqlx::query_as(&sql)
            .bind(&picked)
            .bind(&tokens)
            .bind(&request.owner)
            .bind(expires_at)
            .bind(request.now)
            .fetch_all(&mut *tx)
            .await?;

        tx.commit().await?;

        let order: HashMap<Uuid, usize> = picked.iter().enumerate().map(|(i, id)| (*id, i)).collect();
        let mut leased = rows
            .into_iter()
            .map(Job::try_from)
            .map(|job| {
                let job = job?;
                let lease = job.lease.clone().ok_or_else(|| {
                    GovernanceError::internal(format!("leased job {} has no lease", job.id))
                })?;
                Ok(LeasedJob { job, lease })
            })
            .collect::<Result<Vec<_>>>()?;
        leased.sort_by_key(|l| order.get(&l.job.id.0).copied().unwrap_or(usize::MAX));
        Ok(leased)
    }

    async fn expired_leases(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<JobId>> {
        self.ids_where(
            r#"
            SELECT id FROM governance_jobs
            WHERE state = 'running' AND lease_expires_at <= $1
            ORDER BY lease_expires_at
            LIMIT $2
            "#,
            now,
            limit,
        )
        .await
    }

    async fn due_retries(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<JobId>> {
        self.ids_where(
            r#"
            SELECT id FROM governance_jobs
            WHERE state = 'retryable' AND available_at <= $1
            ORDER BY available_at
            LIMIT $2
            "#,
            now,
            limit,
        )
        .await
    }

    async fn archive_terminal_events(&self, before: DateTime<Utc>, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE governance_events
            SET archived_at = $2
            WHERE archived_at IS NULL
              AND status IN ('completed', 'failed', 'cancelled')
              AND updated_at < $1
            "#,
        )
        .bind(before)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn get_event(&self, id: EventId) -> Result<Option<Event>> {
        let sql = format!("SELECT {} FROM governance_events WHERE id = $1", EVENT_COLUMNS);
        sqlx::query_as::<_, EventRow>(&sql)
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?
            .map(Event::try_from)
            .transpose()
    }

    async fn get_ticket(&self, id: TicketId) -> Result<Option<ApprovalTicket>> {
        let sql = format!("SELECT {} FROM approval_tickets WHERE id = $1", TICKET_COLUMNS);
        sqlx::query_as::<_, TicketRow>(&sql)
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?
            .map(ApprovalTicket::try_from)
            .transpose()
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>> {
        let sql = format!("SELECT {} FROM governance_jobs WHERE id = $1", JOB_COLUMNS);
        sqlx::query_as::<_, JobRow>(&sql)
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?
            .map(Job::try_from)
            .transpose()
    }

    async fn ticket_for_event(&self, event_id: EventId) -> Result<Option<ApprovalTicket>> {
        let sql = format!("SELECT {} FROM approval_tickets WHERE event_id = $1", TICKET_COLUMNS);
        sqlx::query_as::<_, TicketRow>(&sql)
            .bind(event_id.0)
            .fetch_optional(&self.pool)
            .await?
            .map(ApprovalTicket::try_from)
            .transpose()
    }

    async fn job_for_event(&self, event_id: EventId) -> Result<Option<Job>> {
        let sql = format!("SELECT {} FROM governance_jobs WHERE event_id = $1", JOB_COLUMNS);
        sqlx::query_as::<_, JobRow>(&sql)
            .bind(event_id.0)
            .fetch_optional(&self.pool)
            .await?
            .map(Job::try_from)
            .transpose()
    }

    async fn list_events(&self, filter: &EventFilter) -> Result<Vec<Event>> {
        let sql = format!(
            r#"
            SELECT {} FROM governance_events
            WHERE ($1::text IS NULL OR status = $1)
              AND ($2::text IS NULL OR aggregate_id = $2)
              AND ($3 OR archived_at IS NULL)
            ORDER BY created_at DESC
            LIMIT $4
            "#,
            EVENT_COLUMNS
        );
        sqlx::query_as::<_, EventRow>(&sql)
            .bind(filter.status.map(|s| s.as_str()))
            .bind(filter.aggregate_id.as_deref())
            .bind(filter.include_archived)
            .bind(filter.limit as i64)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(Event::try_from)
            .collect()
    }

    async fn outcome_events(&self, request_id: EventId) -> Result<Vec<Event>> {
        let sql = format!(
            "SELECT {} FROM governance_events WHERE parent_event_id = $1 ORDER BY created_at",
            EVENT_COLUMNS
        );
        sqlx::query_as::<_, EventRow>(&sql)
            .bind(request_id.0)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(Event::try_from)
            .collect()
    }

    async fn list_pending_tickets(&self, limit: usize) -> Result<Vec<ApprovalTicket>> {
        let sql = format!(
            "SELECT {} FROM approval_tickets WHERE status = 'pending_approval' ORDER BY created_at LIMIT $1",
            TICKET_COLUMNS
        );
        sqlx::query_as::<_, TicketRow>(&sql)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(ApprovalTicket::try_from)
            .collect()
    }

    async fn summary(&self) -> Result<PipelineSummary> {
        Ok(PipelineSummary {
            events: self
                .counts("SELECT status, COUNT(*) FROM governance_events GROUP BY status")
                .await?,
            tickets: self
                .counts("SELECT status, COUNT(*) FROM approval_tickets GROUP BY status")
                .await?,
            jobs: self
                .counts("SELECT state, COUNT(*) FROM governance_jobs GROUP BY state")
                .await?,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Row Types (for sqlx queries)
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, sqlx::FromRow)]
pub struct EventRow {
    pub id: Uuid,
    pub event_type: String,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub payload: Vec<u8>,
    pub status: String,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub archived_at: Option<DateTime<Utc>>,
    pub parent_event_id: Option<Uuid>,
}

#[derive(Debug, sqlx::FromRow)]
pub struct TicketRow {
    pub id: Uuid,
    pub event_id: Uuid,
    pub status: String,
    pub modified_spec: Option<serde_json::Value>,
    pub request_reason: Option<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub decided_by: Option<String>,
    pub decided_at: Option<DateTime<Utc>>,
    pub decision_reason: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
pub struct JobRow {
    pub id: Uuid,
    pub event_id: Uuid,
    pub aggregate_id: String,
    pub priority: i16,
    pub state: String,
    pub attempt: i32,
    pub max_attempts: i32,
    pub available_at: DateTime<Utc>,
    pub lease_owner: Option<String>,
    pub lease_token: Option<Uuid>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TryFrom<EventRow> for Event {
    type Error = GovernanceError;

    fn try_from(row: EventRow) -> Result<Self> {
        Ok(Self {
            id: EventId(row.id),
            event_type: row.event_type.parse()?,
            aggregate_type: row.aggregate_type,
            aggregate_id: row.aggregate_id,
            payload: row.payload,
            status: row.status.parse::<EventStatus>()?,
            created_by: row.created_by,
            created_at: row.created_at,
            updated_at: row.updated_at,
            archived_at: row.archived_at,
            parent_event_id: row.parent_event_id.map(EventId),
        })
    }
}

impl TryFrom<TicketRow> for ApprovalTicket {
    type Error = GovernanceError;

    fn try_from(row: TicketRow) -> Result<Self> {
        Ok(Self {
            id: TicketId(row.id),
            event_id: EventId(row.event_id),
            status: row.status.parse()?,
            modified_spec: row.modified_spec,
            request_reason: row.request_reason,
            created_by: row.created_by,
            created_at: row.created_at,
            updated_at: row.updated_at,
            decided_by: row.decided_by,
            decided_at: row.decided_at,
            decision_reason: row.decision_reason,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = GovernanceError;

    fn try_from(row: JobRow) -> Result<Self> {
        let lease = match (row.lease_token, row.lease_owner, row.lease_expires_at) {
            (Some(token), Some(owner), Some(expires_at)) => Some(Lease {
                token,
                owner,
                expires_at,
            }),
            _ => None,
        };

        Ok(Self {
            id: JobId(row.id),
            event_id: EventId(row.event_id),
            aggregate_id: row.aggregate_id,
            priority: JobPriority::from_score(row.priority),
            state: row.state.parse()?,
            attempt: row.attempt.max(0) as u32,
            max_attempts: row.max_attempts.max(1) as u32,
            available_at: row.available_at,
            lease,
            last_error: row.last_error,
            cancel_requested: row.cancel_requested,
            created_at: row.created_at,
            updated_at: row.updated_at,
            finished_at: row.finished_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::job::JobState;

    #[test]
    fn test_lock_key_is_stable_and_distinct() {
        assert_eq!(aggregate_lock_key("vm-1"), aggregate_lock_key("vm-1"));
        assert_ne!(aggregate_lock_key("vm-1"), aggregate_lock_key("vm-2"));
    }

    #[test]
    fn test_job_row_conversion() {
        let now = Utc::now();
        let token = Uuid::new_v4();
        let row = JobRow {
            id: Uuid::new_v4(),
            event_id: Uuid::new_v4(),
            aggregate_id: "vm-9".into(),
            priority: 2,
            state: "running".into(),
            attempt: 2,
            max_attempts: 5,
            available_at: now,
            lease_owner: Some("worker-a".into()),
            lease_token: Some(token),
            lease_expires_at: Some(now),
            last_error: None,
            cancel_requested: false,
            created_at: now,
            updated_at: now,
            finished_at: None,
        };

        let job = Job::try_from(row).unwrap();
        assert_eq!(job.state, JobState::Running);
        assert_eq!(job.priority, JobPriority::High);
        assert!(job.is_leased_by(token));
    }

    #[test]
    fn test_event_row_rejects_unknown_status() {
        let now = Utc::now();
        let row = EventRow {
            id: Uuid::new_v4(),
            event_type: "vm_create_requested".into(),
            aggregate_type: "vm".into(),
            aggregate_id: "vm-1".into(),
            payload: b"{}".to_vec(),
            status: "exploded".into(),
            created_by: "alice".into(),
            created_at: now,
            updated_at: now,
            archived_at: None,
            parent_event_id: None,
        };
        assert!(Event::try_from(row).is_err());
    }
}
