//! Outcome reconciliation.
//!
//! Everything a worker learns from the provider is written back here, in its
//! own transaction, after the call returned. The job row is locked and the
//! caller's lease token re-checked first; a worker whose lease was reclaimed
//! gets `LeaseExpired` and changes nothing.

use chrono::{DateTime, Utc};
use metrics::counter;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{GovernanceError, Result};
use crate::governance::event::{Event, EventStatus};
use crate::jobs::job::{Job, JobId, JobState, RetryPolicy};
use crate::provider::{ProviderResult, ResultStatus};
use crate::store::{retry_on_conflict, ConflictRetry, LeasedJob, Store, StoreTx};

/// What happened to one execution attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Succeeded {
        observed_state: Option<serde_json::Value>,
    },
    TransientFailure {
        error: String,
    },
    PermanentFailure {
        error: String,
    },
    /// The call never ran or was cut short, by shutdown or because the lease
    /// would lapse first; the attempt does not count.
    Interrupted,
}

impl From<ProviderResult> for ExecutionOutcome {
    fn from(result: ProviderResult) -> Self {
        let error = || {
            result
                .error
                .clone()
                .unwrap_or_else(|| "provider returned no error detail".to_string())
        };
        match result.status {
            ResultStatus::Success => Self::Succeeded {
                observed_state: result.observed_state.clone(),
            },
            ResultStatus::TransientFailure => Self::TransientFailure { error: error() },
            ResultStatus::PermanentFailure => Self::PermanentFailure { error: error() },
        }
    }
}

/// Where a job ended up after an outcome was recorded.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Completed,
    RetryScheduled { attempt: u32, delay: Duration },
    /// The job is terminal; the event moved to `event_status`.
    Discarded { event_status: EventStatus },
    Released,
}

/// Result of reclaiming one expired lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reclaim {
    /// Back to `available`
    Requeued,
    /// No attempts left, or cancellation was requested
    Discarded,
    /// The lease was renewed or resolved in the meantime
    Skipped,
}

pub struct OutcomeReconciler {
    store: Arc<dyn Store>,
    retry: RetryPolicy,
    conflict: ConflictRetry,
    worker_id: String,
}

impl OutcomeReconciler {
    pub fn new(
        store: Arc<dyn Store>,
        retry: RetryPolicy,
        conflict: ConflictRetry,
        worker_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            retry,
            conflict,
            worker_id: worker_id.into(),
        }
    }

    /// Persist the outcome of an attempt made under `leased.lease`.
    pub async fn record(&self, leased: &LeasedJob, outcome: &ExecutionOutcome) -> Result<Resolution> {
        retry_on_conflict(self.conflict, "record_outcome", move || {
            self.record_once(leased, outcome)
        })
        .await
    }

    async fn record_once(&self, leased: &LeasedJob, outcome: &ExecutionOutcome) -> Result<Resolution> {
        let now = Utc::now();
        let mut tx = self.store.begin().await?;

        let mut job = tx
            .job_for_update(leased.job.id)
            .await?
            .ok_or_else(|| GovernanceError::not_found("job", leased.job.id.to_string()))?;

        if !job.is_leased_by(leased.lease.token) {
            tx.rollback().await?;
            warn!(
                job_id = %job.id,
                state = %job.state,
                worker_id = %self.worker_id,
                "Outcome reported under a stale lease"
            );
            return Err(GovernanceError::lease_expired(job.id));
        }

        let mut event = tx
            .event_for_update(job.event_id)
            .await?
            .ok_or_else(|| GovernanceError::not_found("event", job.event_id.to_string()))?;
        let status_before = event.status;

        let resolution = match outcome {
            ExecutionOutcome::Succeeded { observed_state } => {
                job.complete(now)?;
                event.transition_to(EventStatus::Completed, now)?;
                let payload = serde_json::to_vec(&json!({ "observed_state": observed_state }))?;
                let record = Event::outcome(&event, true, payload, &self.worker_id, now);
                tx.insert_event(&record).await?;
                Resolution::Completed
            }
            ExecutionOutcome::TransientFailure { error } => {
                if job.cancel_requested {
                    job.discard(format!("cancelled after transient failure: {}", error), now)?;
                    event.transition_to(EventStatus::Cancelled, now)?;
                    Resolution::Discarded {
                        event_status: EventStatus::Cancelled,
                    }
                } else if job.attempts_exhausted() {
                    let message = format!("attempts exhausted: {}", error);
                    self.fail(&mut *tx, &mut job, &mut event, &message, now).await?;
                    Resolution::Discarded {
                        event_status: EventStatus::Failed,
                    }
                } else {
                    let delay = self.retry.next_retry_delay(job.attempt);
                    job.schedule_retry(error.clone(), delay, now)?;
                    Resolution::RetryScheduled {
                        attempt: job.attempt,
                        delay,
                    }
                }
            }
            ExecutionOutcome::PermanentFailure { error } => {
                self.fail(&mut *tx, &mut job, &mut event, error, now).await?;
                Resolution::Discarded {
                    event_status: EventStatus::Failed,
                }
            }
            ExecutionOutcome::Interrupted if job.cancel_requested => {
                job.discard("cancelled before the provider call ran", now)?;
                event.transition_to(EventStatus::Cancelled, now)?;
                Resolution::Discarded {
                    event_status: EventStatus::Cancelled,
                }
            }
            ExecutionOutcome::Interrupted => {
                job.release(now)?;
                Resolution::Released
            }
        };

        tx.update_job(&job).await?;
        if event.status != status_before {
            tx.update_event(&event).await?;
        }
        tx.commit().await?;

        self.observe(&job, &resolution);
        Ok(resolution)
    }

    fn observe(&self, job: &Job, resolution: &Resolution) {
        match resolution {
            Resolution::Completed => {
                counter!("vmgov_jobs_completed_total").increment(1);
                info!(
                    job_id = %job.id,
                    event_id = %job.event_id,
                    aggregate_id = %job.aggregate_id,
                    attempt = job.attempt,
                    "Job completed"
                );
            }
            Resolution::RetryScheduled { attempt, delay } => {
                counter!("vmgov_jobs_retried_total").increment(1);
                warn!(
                    job_id = %job.id,
                    event_id = %job.event_id,
                    attempt = attempt,
                    max_attempts = job.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = job.last_error.as_deref().unwrap_or_default(),
                    "Job failed transiently, retry scheduled"
                );
            }
            Resolution::Discarded { event_status } => {
                counter!("vmgov_jobs_discarded_total", "event_status" => event_status.as_str())
                    .increment(1);
                warn!(
                    job_id = %job.id,
                    event_id = %job.event_id,
                    attempt = job.attempt,
                    event_status = %event_status,
                    error = job.last_error.as_deref().unwrap_or_default(),
                    "Job discarded"
                );
            }
            Resolution::Released => {
                counter!("vmgov_jobs_released_total").increment(1);
                info!(job_id = %job.id, attempt = job.attempt, "Job released");
            }
        }
    }

    /// Discard the job, fail the event and append the failure record.
    async fn fail(
        &self,
        tx: &mut dyn StoreTx,
        job: &mut Job,
        event: &mut Event,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        job.discard(error, now)?;
        event.transition_to(EventStatus::Failed, now)?;
        let payload = serde_json::to_vec(&json!({ "error": error, "attempt": job.attempt }))?;
        let record = Event::outcome(event, false, payload, &self.worker_id, now);
        tx.insert_event(&record).await
    }

    /// Return a job whose lease ran out to the queue, or give up on it when
    /// its attempts are spent.
    pub async fn reclaim(&self, job_id: JobId) -> Result<Reclaim> {
        retry_on_conflict(self.conflict, "reclaim_lease", move || self.reclaim_once(job_id)).await
    }

    async fn reclaim_once(&self, job_id: JobId) -> Result<Reclaim> {
        let now = Utc::now();
        let mut tx = self.store.begin().await?;

        let mut job = match tx.job_for_update(job_id).await? {
            Some(job) if job.lease_expired(now) => job,
            _ => return Ok(Reclaim::Skipped),
        };
        let previous_owner = job.lease.as_ref().map(|l| l.owner.clone()).unwrap_or_default();

        let result = if job.attempts_exhausted() || job.cancel_requested {
            let mut event = tx
                .event_for_update(job.event_id)
                .await?
                .ok_or_else(|| GovernanceError::not_found("event", job.event_id.to_string()))?;
            if job.cancel_requested {
                job.discard("lease expired after cancellation was requested", now)?;
                event.transition_to(EventStatus::Cancelled, now)?;
            } else {
                self.fail(&mut *tx, &mut job, &mut event, "lease expired on final attempt", now)
                    .await?;
            }
            tx.update_event(&event).await?;
            Reclaim::Discarded
        } else {
            job.reclaim(now)?;
            Reclaim::Requeued
        };

        tx.update_job(&job).await?;
        tx.commit().await?;

        counter!("vmgov_jobs_reclaimed_total").increment(1);
        warn!(
            job_id = %job.id,
            event_id = %job.event_id,
            previous_owner = %previous_owner,
            attempt = job.attempt,
            outcome = ?result,
            "Expired lease reclaimed"
        );
        Ok(result)
    }

    /// Make a retryable job leasable again once its backoff elapsed.
    pub async fn promote(&self, job_id: JobId) -> Result<bool> {
        retry_on_conflict(self.conflict, "promote_retry", move || self.promote_once(job_id)).await
    }

    async fn promote_once(&self, job_id: JobId) -> Result<bool> {
        let now = Utc::now();
        let mut tx = self.store.begin().await?;

        let mut job = match tx.job_for_update(job_id).await? {
            Some(job) if job.state == JobState::Retryable && job.available_at <= now => job,
            _ => return Ok(false),
        };
        job.promote(now)?;
        tx.update_job(&job).await?;
        tx.commit().await?;

        tracing::debug!(job_id = %job.id, attempt = job.attempt, "Retry promoted");
        Ok(true)
    }
}
