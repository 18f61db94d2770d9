//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use vmgov_core::config::{DispatcherConfig, EnqueuerConfig};
use vmgov_core::error::Result;
use vmgov_core::governance::{
    ApprovalPolicyConfig, ApprovalTicket, Event, EventId, Requester, ResolvedSpec, RuleBasedApprovalPolicy,
    SubmitRequest, TicketId, TransactionalEnqueuer,
};
use vmgov_core::jobs::{BackoffStrategy, Job, JobId, RetryPolicy};
use vmgov_core::provider::{Provider, ProviderResult, Target, VmOperation};
use vmgov_core::store::{
    EventFilter, InMemoryStore, LeaseRequest, LeasedJob, PipelineSummary, Store, StoreTx,
};

// ============================================================================
// Configuration
// ============================================================================

/// Dispatcher settings tuned for tests: short polls, generous deadlines.
pub fn dispatcher_config(worker_id: &str, concurrency: usize, provider_concurrency: usize) -> DispatcherConfig {
    DispatcherConfig {
        worker_id: Some(worker_id.to_string()),
        concurrency,
        provider_concurrency,
        poll_interval: Duration::from_millis(5),
        lease_ttl: Duration::from_secs(30),
        provider_timeout: Duration::from_secs(10),
        shutdown_timeout: Duration::from_secs(5),
        maintenance_batch: 500,
    }
}

pub fn fixed_retry(max_attempts: u32, delay: Duration) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        backoff: BackoffStrategy::fixed(delay),
    }
}

pub fn enqueuer(store: Arc<dyn Store>, retry: RetryPolicy) -> TransactionalEnqueuer {
    TransactionalEnqueuer::new(
        store,
        Arc::new(RuleBasedApprovalPolicy::new(&ApprovalPolicyConfig::default())),
        EnqueuerConfig {
            conflict_backoff: Duration::from_millis(1),
            ..Default::default()
        },
        retry,
    )
}

pub fn admin() -> Requester {
    Requester::new("ops-bot").with_role("admin")
}

pub fn auto_approved(aggregate_id: &str, spec: Value) -> SubmitRequest {
    SubmitRequest {
        requester: admin(),
        operation: VmOperation::Reconfigure,
        aggregate_type: "vm".to_string(),
        aggregate_id: aggregate_id.to_string(),
        spec,
        reason: None,
        priority: None,
    }
}

pub fn needs_approval(aggregate_id: &str, spec: Value) -> SubmitRequest {
    SubmitRequest {
        requester: Requester::new("alice"),
        operation: VmOperation::Delete,
        aggregate_type: "vm".to_string(),
        aggregate_id: aggregate_id.to_string(),
        spec,
        reason: Some("decommission".to_string()),
        priority: None,
    }
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_until<F: FnMut() -> bool>(timeout: Duration, mut condition: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

/// Wait until no job is available, running or waiting for a retry.
pub async fn wait_for_drain(store: &dyn Store, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if let Ok(summary) = store.summary().await {
            let open = summary.jobs_in("available") + summary.jobs_in("running") + summary.jobs_in("retryable");
            if open == 0 {
                return true;
            }
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ============================================================================
// Recording provider
// ============================================================================

/// What the provider does for one call.
#[derive(Debug, Clone)]
pub enum Behavior {
    Succeed,
    Transient,
    Permanent,
    Panic,
    Hang,
}

/// One provider invocation as seen by the provider.
#[derive(Debug, Clone)]
pub struct Call {
    pub request_id: EventId,
    pub aggregate_id: String,
    pub operation: VmOperation,
    pub spec: Value,
    /// 1-based call number for this request
    pub attempt: u32,
    pub started: Instant,
}

type Script = dyn Fn(&Call) -> Behavior + Send + Sync;

/// Provider driven by a script that records every call and notices when two
/// calls for one aggregate overlap.
pub struct RecordingProvider {
    script: Box<Script>,
    delay: Duration,
    calls: Mutex<Vec<Call>>,
    running: Mutex<HashMap<String, usize>>,
    overlaps: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl RecordingProvider {
    pub fn new(delay: Duration, script: impl Fn(&Call) -> Behavior + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            script: Box::new(script),
            delay,
            calls: Mutex::new(Vec::new()),
            running: Mutex::new(HashMap::new()),
            overlaps: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        })
    }

    pub fn always(behavior: Behavior) -> Arc<Self> {
        Self::new(Duration::ZERO, move |_| behavior.clone())
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn calls_for(&self, request_id: EventId) -> Vec<Call> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.request_id == request_id)
            .cloned()
            .collect()
    }

    /// Times a call started while another call for the same aggregate was running.
    pub fn overlaps(&self) -> usize {
        self.overlaps.load(Ordering::SeqCst)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn enter(&self, call: Call) -> RunningGuard<'_> {
        {
            let mut running = self.running.lock();
            let count = running.entry(call.aggregate_id.clone()).or_insert(0);
            if *count > 0 {
                self.overlaps.fetch_add(1, Ordering::SeqCst);
            }
            *count += 1;
        }
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

        let aggregate_id = call.aggregate_id.clone();
        self.calls.lock().push(call);
        RunningGuard {
            provider: self,
            aggregate_id,
        }
    }
}

/// Closes a call's running window, including on panic or cancellation.
struct RunningGuard<'a> {
    provider: &'a RecordingProvider,
    aggregate_id: String,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        if let Some(count) = self.provider.running.lock().get_mut(&self.aggregate_id) {
            *count -= 1;
        }
        self.provider.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Provider for RecordingProvider {
    fn name(&self) -> &str {
        "recording"
    }

    async fn execute(&self, operation: VmOperation, spec: &ResolvedSpec, target: &Target) -> ProviderResult {
        let attempt = {
            let calls = self.calls.lock();
            calls.iter().filter(|c| c.request_id == target.request_id).count() as u32 + 1
        };
        let call = Call {
            request_id: target.request_id,
            aggregate_id: target.aggregate_id.clone(),
            operation,
            spec: spec.to_value(),
            attempt,
            started: Instant::now(),
        };
        let behavior = (self.script)(&call);
        let _guard = self.enter(call);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        match behavior {
            Behavior::Succeed => ProviderResult::success(Some(json!({ "power_state": "on" }))),
            Behavior::Transient => ProviderResult::transient("cluster API busy"),
            Behavior::Permanent => ProviderResult::permanent("spec rejected by cluster"),
            Behavior::Panic => panic!("provider bug for attempt {}", attempt),
            Behavior::Hang => std::future::pending().await,
        }
    }
}

// ============================================================================
// Scripted store
// ============================================================================

/// In-memory store with switchable misbehaviour: slow event reads and a
/// panicking `begin`.
pub struct ScriptedStore {
    inner: Arc<InMemoryStore>,
    slow_event_reads: AtomicUsize,
    event_read_delay: Mutex<Duration>,
    panic_on_begin: AtomicBool,
}

impl ScriptedStore {
    pub fn new(inner: Arc<InMemoryStore>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            slow_event_reads: AtomicUsize::new(0),
            event_read_delay: Mutex::new(Duration::ZERO),
            panic_on_begin: AtomicBool::new(false),
        })
    }

    /// Delay the next `count` calls to `get_event` by `delay` each.
    pub fn slow_event_reads(&self, count: usize, delay: Duration) {
        *self.event_read_delay.lock() = delay;
        self.slow_event_reads.store(count, Ordering::SeqCst);
    }

    pub fn panic_on_begin(&self, enabled: bool) {
        self.panic_on_begin.store(enabled, Ordering::SeqCst);
    }
}

#[async_trait]
impl Store for ScriptedStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>> {
        if self.panic_on_begin.load(Ordering::SeqCst) {
            panic!("store unavailable");
        }
        self.inner.begin().await
    }

    async fn lease_jobs(&self, request: &LeaseRequest) -> Result<Vec<LeasedJob>> {
        self.inner.lease_jobs(request).await
    }

    async fn expired_leases(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<JobId>> {
        self.inner.expired_leases(now, limit).await
    }

    async fn due_retries(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<JobId>> {
        self.inner.due_retries(now, limit).await
    }

    async fn archive_terminal_events(&self, before: DateTime<Utc>, now: DateTime<Utc>) -> Result<u64> {
        self.inner.archive_terminal_events(before, now).await
    }

    async fn get_event(&self, id: EventId) -> Result<Option<Event>> {
        let slow = self
            .slow_event_reads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if slow {
            let delay = *self.event_read_delay.lock();
            tokio::time::sleep(delay).await;
        }
        self.inner.get_event(id).await
    }

    async fn get_ticket(&self, id: TicketId) -> Result<Option<ApprovalTicket>> {
        self.inner.get_ticket(id).await
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>> {
        self.inner.get_job(id).await
    }

    async fn ticket_for_event(&self, event_id: EventId) -> Result<Option<ApprovalTicket>> {
        self.inner.ticket_for_event(event_id).await
    }

    async fn job_for_event(&self, event_id: EventId) -> Result<Option<Job>> {
        self.inner.job_for_event(event_id).await
    }

    async fn list_events(&self, filter: &EventFilter) -> Result<Vec<Event>> {
        self.inner.list_events(filter).await
    }

    async fn outcome_events(&self, request_id: EventId) -> Result<Vec<Event>> {
        self.inner.outcome_events(request_id).await
    }

    async fn list_pending_tickets(&self, limit: usize) -> Result<Vec<ApprovalTicket>> {
        self.inner.list_pending_tickets(limit).await
    }

    async fn summary(&self) -> Result<PipelineSummary> {
        self.inner.summary().await
    }
}
