//! Job dispatcher.
//!
//! One dispatcher per worker process. Each tick it
//!
//! 1. reclaims expired leases and promotes due retries,
//! 2. leases as many available jobs as it has free general slots,
//! 3. runs every leased job in its own task holding one slot.
//!
//! A job task resolves the effective spec, waits for a provider slot, calls
//! the provider under a deadline and hands the outcome to the
//! [`OutcomeReconciler`]. The provider call always ends before the lease
//! does; a job without enough lease left for a full call is released. No database transaction is open while the provider
//! runs. A panic inside a job is caught at the task boundary and reported as
//! a transient failure of that job only.

use chrono::Utc;
use dashmap::DashMap;
use futures::FutureExt;
use metrics::{counter, histogram};
use serde::Serialize;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use crate::config::DispatcherConfig;
use crate::error::{ErrorCode, GovernanceError, Result};
use crate::governance::spec::get_effective_spec;
use crate::jobs::job::{JobId, RetryPolicy};
use crate::jobs::reconcile::{ExecutionOutcome, OutcomeReconciler, Reclaim, Resolution};
use crate::jobs::worker_pool::{SlotPermit, WorkerPool, WorkerPoolConfig, WorkerPoolStats};
use crate::provider::{Provider, ResultStatus, Target};
use crate::store::{ConflictRetry, LeaseRequest, LeasedJob, Store};

// ═══════════════════════════════════════════════════════════════════════════════
// Statistics
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Default)]
struct Counters {
    leased: AtomicU64,
    succeeded: AtomicU64,
    retried: AtomicU64,
    discarded: AtomicU64,
    released: AtomicU64,
    panicked: AtomicU64,
    stale_reports: AtomicU64,
    reclaimed: AtomicU64,
}

/// Counters for one dispatcher since it was created.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatcherStats {
    pub leased: u64,
    pub succeeded: u64,
    pub retried: u64,
    pub discarded: u64,
    pub released: u64,
    /// Executions that panicked (also counted under retried/discarded)
    pub panicked: u64,
    /// Outcomes rejected because the lease had been reclaimed
    pub stale_reports: u64,
    pub reclaimed: u64,
}

impl DispatcherStats {
    /// Jobs whose outcome has been written, in any direction.
    pub fn resolved(&self) -> u64 {
        self.succeeded + self.retried + self.discarded + self.released
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Dispatcher
// ═══════════════════════════════════════════════════════════════════════════════

struct Inner {
    store: Arc<dyn Store>,
    provider: Arc<dyn Provider>,
    config: DispatcherConfig,
    worker_id: String,
    general_pool: WorkerPool,
    provider_pool: WorkerPool,
    reconciler: OutcomeReconciler,
    /// Job ID → aggregate ID for jobs this worker is executing
    inflight: DashMap<JobId, String>,
    counters: Counters,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

/// Leases jobs and executes them through a [`Provider`].
#[derive(Clone)]
pub struct JobDispatcher {
    inner: Arc<Inner>,
}

impl JobDispatcher {
    pub fn new(
        store: Arc<dyn Store>,
        provider: Arc<dyn Provider>,
        config: DispatcherConfig,
        retry: RetryPolicy,
    ) -> Self {
        let worker_id = config
            .worker_id
            .clone()
            .unwrap_or_else(|| format!("worker-{}", Uuid::new_v4()));

        let general_pool = WorkerPool::new(WorkerPoolConfig::general(config.concurrency));
        // A job waiting for a provider slot is still leased; give up before the lease can lapse.
        let provider_pool = WorkerPool::new(
            WorkerPoolConfig::provider(config.provider_concurrency)
                .with_acquire_timeout(config.lease_ttl.saturating_sub(config.provider_timeout)),
        );
        let reconciler = OutcomeReconciler::new(store.clone(), retry, ConflictRetry::default(), &worker_id);

        Self {
            inner: Arc::new(Inner {
                store,
                provider,
                config,
                worker_id,
                general_pool,
                provider_pool,
                reconciler,
                inflight: DashMap::new(),
                counters: Counters::default(),
                shutdown: CancellationToken::new(),
                tracker: TaskTracker::new(),
            }),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.inner.worker_id
    }

    /// Jobs currently executing on this worker.
    pub fn active_jobs(&self) -> usize {
        self.inner.inflight.len()
    }

    /// Whether this worker is executing a job for `aggregate_id`.
    pub fn is_running_aggregate(&self, aggregate_id: &str) -> bool {
        self.inner.inflight.iter().any(|entry| entry.value() == aggregate_id)
    }

    pub fn general_pool_stats(&self) -> WorkerPoolStats {
        self.inner.general_pool.stats()
    }

    pub fn provider_pool_stats(&self) -> WorkerPoolStats {
        self.inner.provider_pool.stats()
    }

    /// Slots held across both pools.
    pub fn occupied_slots(&self) -> usize {
        self.inner.general_pool.active_workers() + self.inner.provider_pool.active_workers()
    }

    pub fn stats(&self) -> DispatcherStats {
        let c = &self.inner.counters;
        DispatcherStats {
            leased: c.leased.load(Ordering::Relaxed),
            succeeded: c.succeeded.load(Ordering::Relaxed),
            retried: c.retried.load(Ordering::Relaxed),
            discarded: c.discarded.load(Ordering::Relaxed),
            released: c.released.load(Ordering::Relaxed),
            panicked: c.panicked.load(Ordering::Relaxed),
            stale_reports: c.stale_reports.load(Ordering::Relaxed),
            reclaimed: c.reclaimed.load(Ordering::Relaxed),
        }
    }

    /// Start the lease loop in the background.
    pub fn start(&self) -> DispatcherHandle {
        let dispatcher = self.clone();
        let join = tokio::spawn(
            async move { dispatcher.run().await }
                .instrument(tracing::info_span!("dispatcher", worker_id = %self.inner.worker_id)),
        );

        DispatcherHandle {
            dispatcher: self.clone(),
            join,
        }
    }

    async fn run(&self) {
        let inner = &self.inner;
        info!(
            worker_id = %inner.worker_id,
            concurrency = inner.config.concurrency,
            provider_concurrency = inner.config.provider_concurrency,
            "Job dispatcher started"
        );

        loop {
            if inner.shutdown.is_cancelled() {
                break;
            }

            let leased = match self.tick().await {
                Ok(n) => n,
                Err(e) => {
                    e.log();
                    0
                }
            };

            if leased == 0 {
                tokio::select! {
                    _ = inner.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(inner.config.poll_interval) => {}
                }
            }
        }

        info!(worker_id = %inner.worker_id, "Job dispatcher stopped leasing");
    }

    /// One round of maintenance and leasing. Returns how many jobs were
    /// leased and spawned.
    pub async fn tick(&self) -> Result<usize> {
        self.maintain().await?;

        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return Ok(0);
        }
        let free = inner.general_pool.available_slots();
        if free == 0 {
            return Ok(0);
        }

        let leased = inner
            .store
            .lease_jobs(&LeaseRequest {
                owner: inner.worker_id.clone(),
                limit: free,
                ttl: inner.config.lease_ttl,
                now: Utc::now(),
            })
            .await?;

        let count = leased.len();
        for job in leased {
            inner.counters.leased.fetch_add(1, Ordering::Relaxed);
            counter!("vmgov_jobs_leased_total").increment(1);

            match inner.general_pool.try_acquire() {
                Some(permit) => self.spawn_job(job, permit),
                None => {
                    // Only this loop takes general slots, so this means the pool was closed.
                    warn!(job_id = %job.job.id, "No free slot for leased job, releasing");
                    self.report(&job, ExecutionOutcome::Interrupted).await;
                }
            }
        }

        if count > 0 {
            debug!(worker_id = %inner.worker_id, leased = count, "Leased jobs");
        }
        Ok(count)
    }

    async fn maintain(&self) -> Result<()> {
        let inner = &self.inner;
        let now = Utc::now();
        let batch = inner.config.maintenance_batch;

        for job_id in inner.store.expired_leases(now, batch).await? {
            match inner.reconciler.reclaim(job_id).await {
                Ok(Reclaim::Skipped) => {}
                Ok(_) => {
                    inner.counters.reclaimed.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => e.log(),
            }
        }

        for job_id in inner.store.due_retries(now, batch).await? {
            if let Err(e) = inner.reconciler.promote(job_id).await {
                e.log();
            }
        }
        Ok(())
    }

    fn spawn_job(&self, leased: LeasedJob, permit: SlotPermit) {
        let inner = &self.inner;
        inner
            .inflight
            .insert(leased.job.id, leased.job.aggregate_id.clone());

        let span = tracing::info_span!(
            "job",
            job_id = %leased.job.id,
            event_id = %leased.job.event_id,
            aggregate_id = %leased.job.aggregate_id,
            attempt = leased.job.attempt,
        );
        let dispatcher = self.clone();
        let inflight = InflightEntry {
            inner: inner.clone(),
            job_id: leased.job.id,
        };

        inner.tracker.spawn(
            async move {
                let _inflight = inflight;
                let outcome = match AssertUnwindSafe(dispatcher.execute(&leased)).catch_unwind().await {
                    Ok(outcome) => outcome,
                    Err(panic) => {
                        dispatcher.inner.counters.panicked.fetch_add(1, Ordering::Relaxed);
                        counter!("vmgov_job_panics_total").increment(1);
                        let message = panic_message(panic.as_ref());
                        error!(panic = %message, "Job execution panicked");
                        ExecutionOutcome::TransientFailure {
                            error: format!("execution panicked: {}", message),
                        }
                    }
                };

                let succeeded = matches!(outcome, ExecutionOutcome::Succeeded { .. });
                dispatcher.report(&leased, outcome).await;

                if succeeded {
                    permit.mark_success();
                } else {
                    permit.mark_failure();
                }
            }
            .instrument(span),
        );
    }

    /// Everything between lease and report. Never returns an error: every
    /// failure is an outcome.
    async fn execute(&self, leased: &LeasedJob) -> ExecutionOutcome {
        let inner = &self.inner;
        let job = &leased.job;

        let event = match inner.store.get_event(job.event_id).await {
            Ok(Some(event)) => event,
            Ok(None) => {
                return ExecutionOutcome::PermanentFailure {
                    error: format!("event {} not found", job.event_id),
                }
            }
            Err(e) => {
                return ExecutionOutcome::TransientFailure {
                    error: e.to_string(),
                }
            }
        };
        let modified_spec = match inner.store.ticket_for_event(job.event_id).await {
            Ok(ticket) => ticket.and_then(|t| t.modified_spec),
            Err(e) => {
                return ExecutionOutcome::TransientFailure {
                    error: e.to_string(),
                }
            }
        };

        let spec = match get_effective_spec(event.payload(), modified_spec.as_ref()) {
            Ok(spec) => spec,
            Err(e) => {
                return ExecutionOutcome::PermanentFailure {
                    error: e.to_string(),
                }
            }
        };
        let operation = event.operation();
        let target = Target {
            aggregate_type: event.aggregate_type.clone(),
            aggregate_id: event.aggregate_id.clone(),
            request_id: event.id,
        };

        let provider_timeout = inner.config.provider_timeout;
        let Some(slot_budget) = lease_remaining(leased).checked_sub(provider_timeout) else {
            warn!(
                lease_expires_at = %leased.lease.expires_at,
                "Lease too short for a provider call, releasing job"
            );
            return ExecutionOutcome::Interrupted;
        };

        let slot = tokio::select! {
            biased;
            _ = inner.shutdown.cancelled() => return ExecutionOutcome::Interrupted,
            acquired = tokio::time::timeout(slot_budget, inner.provider_pool.acquire()) => match acquired {
                Ok(Ok(slot)) => slot,
                Ok(Err(e)) => {
                    warn!(error = %e, "No provider slot, releasing job");
                    return ExecutionOutcome::Interrupted;
                }
                Err(_) => {
                    warn!(
                        waited_ms = slot_budget.as_millis() as u64,
                        "Lease would lapse before a provider slot freed, releasing job"
                    );
                    return ExecutionOutcome::Interrupted;
                }
            },
        };

        let call_timeout = provider_timeout.min(lease_remaining(leased));
        let started = Instant::now();
        let call = tokio::time::timeout(
            call_timeout,
            inner.provider.execute(operation, &spec, &target),
        );

        let result = tokio::select! {
            biased;
            _ = inner.shutdown.cancelled() => {
                info!(provider = inner.provider.name(), "Provider call interrupted by shutdown");
                return ExecutionOutcome::Interrupted;
            }
            result = call => result,
        };

        let elapsed = started.elapsed();
        let (outcome, status) = match result {
            Ok(result) => {
                let status = match result.status {
                    ResultStatus::Success => "success",
                    ResultStatus::TransientFailure => "transient_failure",
                    ResultStatus::PermanentFailure => "permanent_failure",
                };
                (ExecutionOutcome::from(result), status)
            }
            Err(_) => (
                ExecutionOutcome::TransientFailure {
                    error: format!("provider call timed out after {:?}", call_timeout),
                },
                "timeout",
            ),
        };

        histogram!(
            "vmgov_provider_call_duration_seconds",
            "operation" => operation.as_str(),
            "status" => status
        )
        .record(elapsed.as_secs_f64());
        debug!(
            provider = inner.provider.name(),
            operation = %operation,
            status = status,
            duration_ms = elapsed.as_millis() as u64,
            "Provider call finished"
        );

        match outcome {
            ExecutionOutcome::Succeeded { .. } => slot.mark_success(),
            _ => slot.mark_failure(),
        }
        outcome
    }

    async fn report(&self, leased: &LeasedJob, outcome: ExecutionOutcome) {
        let counters = &self.inner.counters;
        match self.inner.reconciler.record(leased, &outcome).await {
            Ok(Resolution::Completed) => {
                counters.succeeded.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Resolution::RetryScheduled { .. }) => {
                counters.retried.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Resolution::Discarded { .. }) => {
                counters.discarded.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Resolution::Released) => {
                counters.released.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) if e.code() == ErrorCode::LeaseExpired => {
                counters.stale_reports.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                // The lease will lapse and the job will be reclaimed.
                e.log();
            }
        }
    }
}

/// Drops the job from the in-flight map when its task ends, panics included.
struct InflightEntry {
    inner: Arc<Inner>,
    job_id: JobId,
}

impl Drop for InflightEntry {
    fn drop(&mut self) {
        self.inner.inflight.remove(&self.job_id);
    }
}

/// Time left on the lease, zero once it lapsed.
fn lease_remaining(leased: &LeasedJob) -> Duration {
    (leased.lease.expires_at - Utc::now())
        .to_std()
        .unwrap_or(Duration::ZERO)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Handle
// ═══════════════════════════════════════════════════════════════════════════════

/// Handle for controlling a running dispatcher.
pub struct DispatcherHandle {
    dispatcher: JobDispatcher,
    join: JoinHandle<()>,
}

impl DispatcherHandle {
    pub fn dispatcher(&self) -> &JobDispatcher {
        &self.dispatcher
    }

    /// Stop leasing, interrupt in-flight provider calls and wait for their
    /// jobs to be released, up to the configured shutdown timeout.
    pub async fn shutdown(self) -> Result<DispatcherStats> {
        let inner = &self.dispatcher.inner;
        info!(
            worker_id = %inner.worker_id,
            in_flight = inner.inflight.len(),
            "Dispatcher shutting down"
        );

        inner.shutdown.cancel();
        self.join.await.map_err(|e| {
            GovernanceError::internal(format!("dispatcher loop failed: {}", e)).with_source(e)
        })?;

        inner.tracker.close();
        let drained = tokio::time::timeout(inner.config.shutdown_timeout, inner.tracker.wait()).await;
        inner.general_pool.close();
        inner.provider_pool.close();

        let stats = self.dispatcher.stats();
        match drained {
            Ok(()) => {
                info!(worker_id = %inner.worker_id, stats = ?stats, "Dispatcher stopped");
                Ok(stats)
            }
            Err(_) => Err(GovernanceError::new(
                ErrorCode::ShuttingDown,
                format!(
                    "{} job(s) still running after {:?}; their leases will expire",
                    inner.inflight.len(),
                    inner.config.shutdown_timeout
                ),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::governance::event::{Event, EventStatus};
    use crate::governance::spec::ResolvedSpec;
    use crate::governance::ticket::ApprovalTicket;
    use crate::jobs::job::{Job, JobPriority, JobState};
    use crate::provider::{ProviderResult, VmOperation};
    use crate::store::InMemoryStore;
    use async_trait::async_trait;
    use std::time::Duration;

    struct Succeeds;

    #[async_trait]
    impl Provider for Succeeds {
        fn name(&self) -> &str {
            "succeeds"
        }

        async fn execute(&self, _: VmOperation, spec: &ResolvedSpec, _: &Target) -> ProviderResult {
            ProviderResult::success(Some(spec.to_value()))
        }
    }

    struct Panics;

    #[async_trait]
    impl Provider for Panics {
        fn name(&self) -> &str {
            "panics"
        }

        async fn execute(&self, _: VmOperation, _: &ResolvedSpec, _: &Target) -> ProviderResult {
            panic!("provider exploded")
        }
    }

    struct Hangs;

    #[async_trait]
    impl Provider for Hangs {
        fn name(&self) -> &str {
            "hangs"
        }

        async fn execute(&self, _: VmOperation, _: &ResolvedSpec, _: &Target) -> ProviderResult {
            futures::future::pending().await
        }
    }

    fn config() -> DispatcherConfig {
        DispatcherConfig {
            worker_id: Some("worker-test".to_string()),
            concurrency: 4,
            provider_concurrency: 2,
            poll_interval: Duration::from_millis(5),
            lease_ttl: Duration::from_secs(30),
            provider_timeout: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(5),
            maintenance_batch: 10,
        }
    }

    async fn seed(store: &InMemoryStore, aggregate: &str) -> Job {
        let now = Utc::now();
        let event = Event::request(
            VmOperation::PowerOn,
            "vm",
            aggregate,
            br#"{"cpu":2}"#.to_vec(),
            "alice",
            EventStatus::Processing,
            now,
        );
        let ticket = ApprovalTicket::auto_approved(event.id, "alice", None, now);
        let job = Job::new(event.id, aggregate, JobPriority::Normal, 2, now);

        let mut tx = store.begin().await.unwrap();
        tx.insert_event(&event).await.unwrap();
        tx.insert_ticket(&ticket).await.unwrap();
        tx.insert_job(&job).await.unwrap();
        tx.commit().await.unwrap();
        job
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_tick_executes_job() {
        let store = Arc::new(InMemoryStore::new());
        let job = seed(&store, "vm-1").await;
        let dispatcher = JobDispatcher::new(store.clone(), Arc::new(Succeeds), config(), RetryPolicy::default());

        assert_eq!(dispatcher.tick().await.unwrap(), 1);
        wait_until(|| dispatcher.stats().succeeded == 1).await;

        wait_until(|| dispatcher.occupied_slots() == 0 && dispatcher.active_jobs() == 0).await;

        let job = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Completed);
    }

    #[tokio::test]
    async fn test_panic_is_contained() {
        let store = Arc::new(InMemoryStore::new());
        let job = seed(&store, "vm-1").await;
        let dispatcher = JobDispatcher::new(store.clone(), Arc::new(Panics), config(), RetryPolicy::default());

        dispatcher.tick().await.unwrap();
        wait_until(|| dispatcher.stats().resolved() == 1).await;

        let stats = dispatcher.stats();
        assert_eq!(stats.panicked, 1);
        assert_eq!(stats.retried, 1);
        let job = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Retryable);
        assert!(job.last_error.unwrap().contains("provider exploded"));
        wait_until(|| dispatcher.occupied_slots() == 0).await;
    }

    #[tokio::test]
    async fn test_shutdown_releases_inflight_jobs() {
        let store = Arc::new(InMemoryStore::new());
        let job = seed(&store, "vm-1").await;
        let dispatcher = JobDispatcher::new(store.clone(), Arc::new(Hangs), config(), RetryPolicy::default());

        let handle = dispatcher.start();
        wait_until(|| dispatcher.active_jobs() == 1).await;
        assert!(dispatcher.is_running_aggregate("vm-1"));

        let stats = handle.shutdown().await.unwrap();
        assert!(stats.released >= 1);

        let job = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Available);
        assert_eq!(job.attempt, 0);
        assert_eq!(dispatcher.occupied_slots(), 0);
    }

    #[test]
    fn test_panic_message() {
        let boxed: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(boxed.as_ref()), "static");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(boxed.as_ref()), "owned");
        let boxed: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic payload");
    }
}
