//! Metric names, descriptions and the Prometheus exporter.
//!
//! Recording goes through the `metrics` facade at the call site; without an
//! installed recorder every call is a no-op, which is what tests rely on.

use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use std::net::SocketAddr;

/// Buckets for provider call latency, in seconds.
const PROVIDER_CALL_BUCKETS: &[f64] = &[
    0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0,
];

/// Serve `/metrics` on `addr` (e.g. `0.0.0.0:9090`).
pub fn install_prometheus(addr: &str) -> anyhow::Result<()> {
    let addr: SocketAddr = addr.parse()?;
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .set_buckets_for_metric(
            Matcher::Full("vmgov_provider_call_duration_seconds".to_string()),
            PROVIDER_CALL_BUCKETS,
        )?
        .install()?;

    tracing::info!(addr = %addr, "Prometheus exporter listening");
    Ok(())
}

/// Register descriptions for every metric the pipeline emits.
pub fn describe_metrics() {
    // Submission side
    describe_counter!(
        "vmgov_submissions_total",
        "Requests recorded, labelled by outcome (auto_approved, pending_approval)"
    );
    describe_counter!(
        "vmgov_approvals_total",
        "Ticket decisions, labelled by decision"
    );
    describe_counter!(
        "vmgov_transaction_conflicts_total",
        "Transactions retried after a serialization or lock conflict"
    );
    describe_counter!("vmgov_errors_total", "Errors created, labelled by code and category");

    // Execution side
    describe_counter!("vmgov_jobs_leased_total", "Jobs leased by this worker");
    describe_counter!("vmgov_jobs_completed_total", "Jobs whose provider call succeeded");
    describe_counter!("vmgov_jobs_retried_total", "Transient failures scheduled for retry");
    describe_counter!(
        "vmgov_jobs_discarded_total",
        "Jobs given up on, labelled by resulting event status"
    );
    describe_counter!("vmgov_jobs_released_total", "Jobs handed back on shutdown");
    describe_counter!("vmgov_jobs_reclaimed_total", "Expired leases reclaimed");
    describe_counter!("vmgov_job_panics_total", "Job executions that panicked");
    describe_counter!("vmgov_events_archived_total", "Terminal events soft-archived");

    describe_histogram!(
        "vmgov_provider_call_duration_seconds",
        Unit::Seconds,
        "Provider call latency, labelled by operation and status"
    );

    describe_gauge!("vmgov_worker_pool_slots", "Configured slots per pool");
    describe_gauge!("vmgov_worker_pool_in_use", "Occupied slots per pool");
}
