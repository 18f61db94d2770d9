//! Durable job records.
//!
//! A job is the leasable unit of execution for one approved event:
//!
//! - **Job**: the row itself. It carries the event ID only (claim check),
//!   plus the aggregate ID so the dispatcher can serialize per target
//! - **JobState**: `available → running → completed`, with
//!   `running → retryable → available` for backoff and `discarded` as the
//!   terminal failure state
//! - **RetryPolicy**: attempt budget and backoff strategy

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{GovernanceError, Result};
use crate::governance::event::EventId;

// ═══════════════════════════════════════════════════════════════════════════════
// Job Identification
// ═══════════════════════════════════════════════════════════════════════════════

/// Unique identifier for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Create a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for JobId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl FromStr for JobId {
    type Err = GovernanceError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| GovernanceError::validation(format!("invalid job id: {}", s)))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job State
// ═══════════════════════════════════════════════════════════════════════════════

/// State of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting to be leased
    Available,
    /// Leased by a worker
    Running,
    /// Provider call succeeded
    Completed,
    /// Given up on (permanent failure, exhausted attempts or cancelled)
    Discarded,
    /// Waiting for its backoff to elapse
    Retryable,
}

impl JobState {
    pub const ALL: [JobState; 5] = [
        Self::Available,
        Self::Running,
        Self::Completed,
        Self::Discarded,
        Self::Retryable,
    ];

    /// Check if the job is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Discarded)
    }

    /// Whether `self → next` is a legal move.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Available, Running)
                | (Available, Discarded)
                | (Running, Completed)
                | (Running, Retryable)
                | (Running, Discarded)
                | (Running, Available)
                | (Retryable, Available)
                | (Retryable, Discarded)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Discarded => "discarded",
            Self::Retryable => "retryable",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = GovernanceError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "available" => Ok(Self::Available),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "discarded" => Ok(Self::Discarded),
            "retryable" => Ok(Self::Retryable),
            other => Err(GovernanceError::validation(format!(
                "unknown job state: {}",
                other
            ))),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Priority
// ═══════════════════════════════════════════════════════════════════════════════

/// Priority level for jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    /// Lowest priority - leased when nothing else is waiting
    Low = 0,
    /// Normal priority - default for most jobs
    Normal = 1,
    /// High priority - leased before normal jobs
    High = 2,
    /// Critical priority - leased first
    Critical = 3,
}

impl Default for JobPriority {
    fn default() -> Self {
        Self::Normal
    }
}

impl JobPriority {
    /// Numeric value stored in the `priority` column; higher leases first.
    pub fn score(&self) -> i16 {
        *self as i16
    }

    pub fn from_score(score: i16) -> Self {
        match score {
            i16::MIN..=0 => Self::Low,
            1 => Self::Normal,
            2 => Self::High,
            _ => Self::Critical,
        }
    }
}

impl FromStr for JobPriority {
    type Err = GovernanceError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(GovernanceError::validation(format!(
                "unknown priority: {}",
                other
            ))),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Backoff Strategy
// ═══════════════════════════════════════════════════════════════════════════════

/// Strategy for calculating retry delays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed {
        delay_ms: u64,
    },
    /// Linear increase in delay (initial + increment * retry)
    Linear {
        initial_delay_ms: u64,
        increment_ms: u64,
    },
    /// Exponential increase in delay (initial * multiplier^retry)
    Exponential {
        initial_delay_ms: u64,
        max_delay_ms: u64,
        multiplier: f64,
    },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Exponential {
            initial_delay_ms: 5_000,
            max_delay_ms: 900_000, // 15 minutes max
            multiplier: 2.0,
        }
    }
}

impl BackoffStrategy {
    /// Calculate the delay for a given retry number (0-indexed).
    pub fn delay_for_attempt(&self, retry: u32) -> Duration {
        let ms = match self {
            Self::Fixed { delay_ms } => *delay_ms,
            Self::Linear {
                initial_delay_ms,
                increment_ms,
            } => initial_delay_ms.saturating_add(increment_ms.saturating_mul(retry as u64)),
            Self::Exponential {
                initial_delay_ms,
                max_delay_ms,
                multiplier,
            } => {
                let delay = (*initial_delay_ms as f64) * multiplier.powi(retry as i32);
                delay.min(*max_delay_ms as f64) as u64
            }
        };

        Duration::from_millis(ms)
    }

    /// Create a fixed backoff strategy.
    pub fn fixed(delay: Duration) -> Self {
        Self::Fixed {
            delay_ms: delay.as_millis() as u64,
        }
    }

    /// Create an exponential backoff strategy.
    pub fn exponential(initial: Duration, max: Duration, multiplier: f64) -> Self {
        Self::Exponential {
            initial_delay_ms: initial.as_millis() as u64,
            max_delay_ms: max.as_millis() as u64,
            multiplier,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Retry Policy
// ═══════════════════════════════════════════════════════════════════════════════

/// Attempt budget and backoff for provider calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total provider invocations allowed per job
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Backoff strategy for calculating delays
    #[serde(default)]
    pub backoff: BackoffStrategy,
}

fn default_max_attempts() -> u32 {
    5
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: BackoffStrategy::default(),
        }
    }
}

impl RetryPolicy {
    /// Create a policy with a specific attempt budget.
    pub fn with_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    /// Delay to wait after attempt `attempt` (1-indexed) failed transiently.
    ///
    /// After attempt `n` the delay is `initial * multiplier^(n-1)`, capped.
    pub fn next_retry_delay(&self, attempt: u32) -> Duration {
        self.backoff.delay_for_attempt(attempt.saturating_sub(1))
    }

    /// Whether each retry within the attempt budget waits longer than the last.
    pub fn delays_increase(&self) -> bool {
        (1..self.max_attempts.saturating_sub(1))
            .all(|n| self.next_retry_delay(n + 1) > self.next_retry_delay(n))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Lease
// ═══════════════════════════════════════════════════════════════════════════════

/// Time-bounded exclusive claim on a running job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub token: Uuid,
    pub owner: String,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job
// ═══════════════════════════════════════════════════════════════════════════════

/// A durable, leasable unit of work tied to exactly one event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub event_id: EventId,
    /// Copied from the event so leasing can serialize per target
    pub aggregate_id: String,
    pub priority: JobPriority,
    pub state: JobState,
    /// Executions started so far
    pub attempt: u32,
    pub max_attempts: u32,
    /// Earliest time the job may be leased (or promoted, when retryable)
    pub available_at: DateTime<Utc>,
    pub lease: Option<Lease>,
    pub last_error: Option<String>,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    /// A fresh job, leasable immediately.
    pub fn new(
        event_id: EventId,
        aggregate_id: impl Into<String>,
        priority: JobPriority,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: JobId::new(),
            event_id,
            aggregate_id: aggregate_id.into(),
            priority,
            state: JobState::Available,
            attempt: 0,
            max_attempts: max_attempts.max(1),
            available_at: now,
            lease: None,
            last_error: None,
            cancel_requested: false,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    fn transition(&mut self, next: JobState, now: DateTime<Utc>) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(GovernanceError::invalid_state_transition(
                "job", self.state, next,
            ));
        }
        self.state = next;
        self.updated_at = now;
        if next.is_terminal() {
            self.finished_at = Some(now);
        }
        Ok(())
    }

    /// `available → running`; counts the attempt and stamps a new lease.
    pub fn claim(&mut self, owner: &str, ttl: Duration, now: DateTime<Utc>) -> Result<Lease> {
        if self.cancel_requested {
            return Err(GovernanceError::invalid_state_transition(
                "job",
                "cancel requested",
                JobState::Running,
            ));
        }
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| GovernanceError::configuration(format!("lease ttl out of range: {}", e)))?;
        self.transition(JobState::Running, now)?;
        let lease = Lease {
            token: Uuid::new_v4(),
            owner: owner.to_string(),
            expires_at: now + ttl,
        };
        self.attempt += 1;
        self.lease = Some(lease.clone());
        Ok(lease)
    }

    /// Whether `token` is the live lease on this job.
    pub fn is_leased_by(&self, token: Uuid) -> bool {
        self.state == JobState::Running
            && self.lease.as_ref().map(|l| l.token == token).unwrap_or(false)
    }

    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Running
            && self.lease.as_ref().map(|l| l.is_expired(now)).unwrap_or(true)
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// `running → completed`.
    pub fn complete(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.transition(JobState::Completed, now)?;
        self.lease = None;
        self.last_error = None;
        Ok(())
    }

    /// `running → retryable`, becoming leasable again after `delay`.
    pub fn schedule_retry(
        &mut self,
        error: impl Into<String>,
        delay: Duration,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.transition(JobState::Retryable, now)?;
        self.lease = None;
        self.last_error = Some(error.into());
        self.available_at = now + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
        Ok(())
    }

    /// Move to `discarded`.
    pub fn discard(&mut self, error: impl Into<String>, now: DateTime<Utc>) -> Result<()> {
        self.transition(JobState::Discarded, now)?;
        self.lease = None;
        self.last_error = Some(error.into());
        Ok(())
    }

    /// `running → available` after the lease lapsed; the attempt stays counted.
    pub fn reclaim(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.transition(JobState::Available, now)?;
        self.lease = None;
        self.available_at = now;
        self.last_error = Some("lease expired".to_string());
        Ok(())
    }

    /// `running → available` for an interrupted execution; the attempt is refunded.
    pub fn release(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.transition(JobState::Available, now)?;
        self.lease = None;
        self.available_at = now;
        self.attempt = self.attempt.saturating_sub(1);
        Ok(())
    }

    /// `retryable → available` once the backoff elapsed.
    pub fn promote(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.state == JobState::Retryable && self.available_at > now {
            return Err(GovernanceError::invalid_state_transition(
                "job",
                "retryable (backoff pending)",
                JobState::Available,
            ));
        }
        self.transition(JobState::Available, now)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
