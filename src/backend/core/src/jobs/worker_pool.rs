//! Bounded execution slots.
//!
//! A `WorkerPool` is a counting semaphore with bookkeeping. Holding a
//! [`SlotPermit`] is the only way to occupy a slot, and the slot is returned
//! when the permit drops, whether the holder finished, failed, was cancelled
//! or unwound from a panic.
//!
//! The dispatcher runs two pools: a general one sized to the number of jobs
//! it may hold leases for, and a smaller provider pool that gates calls to the
//! cluster API.

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::gauge;
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{ErrorCode, GovernanceError, Result};

/// Configuration for a worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of slots
    pub max_slots: usize,
    /// How long `acquire` waits for a free slot
    pub acquire_timeout: Duration,
    /// Name for logs and metrics
    pub name: String,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            max_slots: 32,
            acquire_timeout: Duration::from_secs(30),
            name: "default".to_string(),
        }
    }
}

impl WorkerPoolConfig {
    /// The pool that bounds leased, in-flight jobs.
    pub fn general(max_slots: usize) -> Self {
        Self {
            max_slots,
            name: "general".to_string(),
            ..Default::default()
        }
    }

    /// The pool that bounds concurrent provider calls.
    pub fn provider(max_slots: usize) -> Self {
        Self {
            max_slots,
            name: "provider".to_string(),
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }
}

/// How a slot was given back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Release {
    Succeeded,
    Failed,
    /// Dropped without a verdict (cancelled or unwinding)
    Abandoned,
}

/// An occupied slot. Dropping it frees the slot.
pub struct SlotPermit {
    _permit: OwnedSemaphorePermit,
    shared: Arc<Shared>,
    acquired_at: Instant,
    released: bool,
}

impl SlotPermit {
    /// Release the slot, counting the work as successful.
    pub fn mark_success(mut self) {
        self.release(Release::Succeeded);
    }

    /// Release the slot, counting the work as failed.
    pub fn mark_failure(mut self) {
        self.release(Release::Failed);
    }

    fn release(&mut self, how: Release) {
        if self.released {
            return;
        }
        self.released = true;
        self.shared.record_release(how, self.acquired_at.elapsed());
    }
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        self.release(Release::Abandoned);
    }
}

struct Shared {
    name: String,
    in_use: AtomicUsize,
    peak_in_use: AtomicUsize,
    acquired: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    abandoned: AtomicU64,
    acquire_timeouts: AtomicU64,
    total_wait_us: AtomicU64,
    total_held_us: AtomicU64,
}

impl Shared {
    fn new(name: String) -> Self {
        Self {
            name,
            in_use: AtomicUsize::new(0),
            peak_in_use: AtomicUsize::new(0),
            acquired: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            abandoned: AtomicU64::new(0),
            acquire_timeouts: AtomicU64::new(0),
            total_wait_us: AtomicU64::new(0),
            total_held_us: AtomicU64::new(0),
        }
    }

    fn record_acquire(&self, waited: Duration) {
        self.acquired.fetch_add(1, Ordering::Relaxed);
        self.total_wait_us
            .fetch_add(waited.as_micros() as u64, Ordering::Relaxed);
        let in_use = self.in_use.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak_in_use.fetch_max(in_use, Ordering::Relaxed);
        gauge!("vmgov_worker_pool_in_use", "pool" => self.name.clone()).set(in_use as f64);
    }

    fn record_release(&self, how: Release, held: Duration) {
        match how {
            Release::Succeeded => self.succeeded.fetch_add(1, Ordering::Relaxed),
            Release::Failed => self.failed.fetch_add(1, Ordering::Relaxed),
            Release::Abandoned => self.abandoned.fetch_add(1, Ordering::Relaxed),
        };
        self.total_held_us
            .fetch_add(held.as_micros() as u64, Ordering::Relaxed);
        let in_use = self.in_use.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
        gauge!("vmgov_worker_pool_in_use", "pool" => self.name.clone()).set(in_use as f64);
    }
}

/// A fixed number of execution slots.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    semaphore: Arc<Semaphore>,
    shared: Arc<Shared>,
    created_at: Instant,
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_slots));
        gauge!("vmgov_worker_pool_slots", "pool" => config.name.clone()).set(config.max_slots as f64);

        tracing::info!(
            pool_name = %config.name,
            max_slots = config.max_slots,
            "Worker pool created"
        );

        Self {
            shared: Arc::new(Shared::new(config.name.clone())),
            config,
            semaphore,
            created_at: Instant::now(),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn max_slots(&self) -> usize {
        self.config.max_slots
    }

    pub fn available_slots(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Slots currently held.
    pub fn active_workers(&self) -> usize {
        self.config
            .max_slots
            .saturating_sub(self.semaphore.available_permits())
    }

    pub fn is_at_capacity(&self) -> bool {
        self.semaphore.available_permits() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }

    /// Wait for a slot, up to the configured acquire timeout.
    pub async fn acquire(&self) -> Result<SlotPermit> {
        let start = Instant::now();

        let permit = tokio::time::timeout(
            self.config.acquire_timeout,
            self.semaphore.clone().acquire_owned(),
        )
        .await
        .map_err(|_| {
            self.shared.acquire_timeouts.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                pool_name = %self.config.name,
                timeout_ms = self.config.acquire_timeout.as_millis() as u64,
                "Worker slot acquire timed out"
            );
            GovernanceError::new(
                ErrorCode::PoolExhausted,
                format!(
                    "Worker pool '{}' had no free slot within {:?}",
                    self.config.name, self.config.acquire_timeout
                ),
            )
        })?
        .map_err(|_| self.closed_error())?;

        let waited = start.elapsed();
        self.shared.record_acquire(waited);

        tracing::trace!(
            pool_name = %self.config.name,
            wait_time_ms = waited.as_millis() as u64,
            available = self.semaphore.available_permits(),
            "Worker slot acquired"
        );

        Ok(self.permit(permit))
    }

    /// Take a slot if one is free right now.
    pub fn try_acquire(&self) -> Option<SlotPermit> {
        let permit = self.semaphore.clone().try_acquire_owned().ok()?;
        self.shared.record_acquire(Duration::ZERO);
        Some(self.permit(permit))
    }

    /// Take up to `n` free slots without waiting.
    pub fn try_acquire_many(&self, n: usize) -> Vec<SlotPermit> {
        std::iter::from_fn(|| self.try_acquire()).take(n).collect()
    }

    /// Run `f` in a slot, counting the outcome.
    pub async fn run<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let permit = self.acquire().await?;
        let result = f().await;

        match &result {
            Ok(_) => permit.mark_success(),
            Err(_) => permit.mark_failure(),
        }

        result
    }

    /// Refuse new acquisitions. Held permits stay valid until dropped.
    pub fn close(&self) {
        self.semaphore.close();
        tracing::info!(pool_name = %self.config.name, "Worker pool closed");
    }

    fn permit(&self, permit: OwnedSemaphorePermit) -> SlotPermit {
        SlotPermit {
            _permit: permit,
            shared: self.shared.clone(),
            acquired_at: Instant::now(),
            released: false,
        }
    }

    fn closed_error(&self) -> GovernanceError {
        GovernanceError::new(
            ErrorCode::ShuttingDown,
            format!("Worker pool '{}' is shutting down", self.config.name),
        )
    }

    pub fn stats(&self) -> WorkerPoolStats {
        let s = &self.shared;
        let acquired = s.acquired.load(Ordering::Relaxed);
        let succeeded = s.succeeded.load(Ordering::Relaxed);
        let failed = s.failed.load(Ordering::Relaxed);
        let abandoned = s.abandoned.load(Ordering::Relaxed);
        let released = succeeded + failed + abandoned;

        WorkerPoolStats {
            name: self.config.name.clone(),
            max_slots: self.config.max_slots,
            available_slots: self.semaphore.available_permits(),
            active_workers: self.active_workers(),
            acquired,
            succeeded,
            failed,
            abandoned,
            acquire_timeouts: s.acquire_timeouts.load(Ordering::Relaxed),
            peak_in_use: s.peak_in_use.load(Ordering::Relaxed),
            avg_wait_us: if acquired > 0 {
                s.total_wait_us.load(Ordering::Relaxed) / acquired
            } else {
                0
            },
            avg_held_us: if released > 0 {
                s.total_held_us.load(Ordering::Relaxed) / released
            } else {
                0
            },
            uptime_secs: self.created_at.elapsed().as_secs(),
        }
    }

    /// Healthy while acquire timeouts stay under 10% and failures under 50%.
    pub fn is_healthy(&self) -> bool {
        let stats = self.stats();

        let timeout_rate = if stats.acquired + stats.acquire_timeouts > 0 {
            stats.acquire_timeouts as f64 / (stats.acquired + stats.acquire_timeouts) as f64
        } else {
            0.0
        };

        let failure_rate = if stats.succeeded + stats.failed > 0 {
            stats.failed as f64 / (stats.succeeded + stats.failed) as f64
        } else {
            0.0
        };

        timeout_rate < 0.1 && failure_rate < 0.5
    }
}

/// Snapshot of a pool's counters.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerPoolStats {
    pub name: String,
    pub max_slots: usize,
    pub available_slots: usize,
    pub active_workers: usize,
    pub acquired: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Slots released without a verdict (cancellation, panics)
    pub abandoned: u64,
    pub acquire_timeouts: u64,
    pub peak_in_use: usize,
    pub avg_wait_us: u64,
    pub avg_held_us: u64,
    pub uptime_secs: u64,
}

impl WorkerPoolStats {
    /// Success rate as a percentage of slots released with a verdict.
    pub fn success_rate(&self) -> f64 {
        let total = self.succeeded + self.failed;
        if total == 0 {
            100.0
        } else {
            (self.succeeded as f64 / total as f64) * 100.0
        }
    }

    /// Percentage of slots in use.
    pub fn utilization(&self) -> f64 {
        if self.max_slots == 0 {
            return 0.0;
        }
        (self.active_workers as f64 / self.max_slots as f64) * 100.0
    }

    /// Permits acquired but not yet released.
    pub fn outstanding(&self) -> u64 {
        self.acquired
            .saturating_sub(self.succeeded + self.failed + self.abandoned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(slots: usize) -> WorkerPool {
        WorkerPool::new(WorkerPoolConfig::general(slots))
    }

    #[test]
    fn test_pool_creation() {
        let pool = pool(4);
        assert_eq!(pool.name(), "general");
        assert_eq!(pool.max_slots(), 4);
        assert_eq!(pool.available_slots(), 4);
        assert_eq!(pool.active_workers(), 0);
        assert!(!pool.is_at_capacity());
    }

    #[tokio::test]
    async fn test_acquire_release() {
        let pool = pool(2);

        let first = pool.acquire().await.unwrap();
        let second = pool.acquire().await.unwrap();
        assert!(pool.is_at_capacity());

        first.mark_success();
        assert_eq!(pool.available_slots(), 1);

        second.mark_failure();
        assert_eq!(pool.available_slots(), 2);

        let stats = pool.stats();
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_drop_counts_abandoned() {
        let pool = pool(1);
        drop(pool.acquire().await.unwrap());

        let stats = pool.stats();
        assert_eq!(stats.abandoned, 1);
        assert_eq!(stats.active_workers, 0);
    }

    #[test]
    fn test_try_acquire_many() {
        let pool = pool(3);
        let permits = pool.try_acquire_many(5);
        assert_eq!(permits.len(), 3);
        assert!(pool.try_acquire().is_none());

        drop(permits);
        assert_eq!(pool.available_slots(), 3);
    }

    #[tokio::test]
    async fn test_acquire_timeout() {
        let pool = WorkerPool::new(
            WorkerPoolConfig::provider(1).with_acquire_timeout(Duration::from_millis(20)),
        );
        let _held = pool.acquire().await.unwrap();

        let err = pool.acquire().await.err().unwrap();
        assert_eq!(err.code(), ErrorCode::PoolExhausted);
        assert_eq!(pool.stats().acquire_timeouts, 1);
    }

    #[tokio::test]
    async fn test_closed_pool_refuses() {
        let pool = pool(2);
        let held = pool.acquire().await.unwrap();
        pool.close();

        let err = pool.acquire().await.err().unwrap();
        assert_eq!(err.code(), ErrorCode::ShuttingDown);
        assert!(pool.try_acquire().is_none());

        held.mark_success();
        assert_eq!(pool.active_workers(), 0);
    }

    #[tokio::test]
    async fn test_run_counts_outcome() {
        let pool = pool(2);
        let value = pool.run(|| async { Ok::<_, GovernanceError>(7) }).await.unwrap();
        assert_eq!(value, 7);

        let result: Result<()> = pool
            .run(|| async { Err(GovernanceError::internal("boom")) })
            .await;
        assert!(result.is_err());

        let stats = pool.stats();
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.success_rate(), 50.0);
    }

    #[test]
    fn test_stats_calculations() {
        let stats = WorkerPoolStats {
            name: "test".to_string(),
            max_slots: 10,
            available_slots: 3,
            active_workers: 7,
            acquired: 107,
            succeeded: 80,
            failed: 20,
            abandoned: 0,
            acquire_timeouts: 5,
            peak_in_use: 10,
            avg_wait_us: 1000,
            avg_held_us: 5000,
            uptime_secs: 60,
        };

        assert_eq!(stats.success_rate(), 80.0);
        assert_eq!(stats.utilization(), 70.0);
        assert_eq!(stats.outstanding(), 7);
    }
}
