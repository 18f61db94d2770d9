//! Configuration management.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{GovernanceError, Result};
use crate::governance::policy::ApprovalPolicyConfig;
use crate::jobs::job::{JobPriority, RetryPolicy};

const ENV_PREFIX: &str = "VMGOV";

/// Main application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Job dispatcher configuration
    #[serde(default)]
    pub dispatcher: DispatcherConfig,

    /// Retry policy applied to newly enqueued jobs
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Transactional enqueuer configuration
    #[serde(default)]
    pub enqueuer: EnqueuerConfig,

    /// Auto-approval rules
    #[serde(default)]
    pub approval: ApprovalPolicyConfig,

    /// Cluster API provider configuration
    #[serde(default)]
    pub provider: ProviderConfig,

    /// Event retention configuration
    #[serde(default)]
    pub retention: RetentionConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    #[serde(default = "default_database_url")]
    pub url: String,

    /// Maximum number of connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// How long to wait for a pooled connection
    #[serde(default = "default_acquire_timeout", with = "humantime_serde")]
    pub acquire_timeout: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            acquire_timeout: default_acquire_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Lease owner name; a random one is generated when absent
    #[serde(default)]
    pub worker_id: Option<String>,

    /// Size of the general execution pool
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Size of the provider-facing sub-pool
    #[serde(default = "default_provider_concurrency")]
    pub provider_concurrency: usize,

    /// Idle delay between lease attempts
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// How long a lease is valid before the job may be reclaimed
    #[serde(default = "default_lease_ttl", with = "humantime_serde")]
    pub lease_ttl: Duration,

    /// Deadline for a single provider call
    #[serde(default = "default_provider_timeout", with = "humantime_serde")]
    pub provider_timeout: Duration,

    /// How long shutdown waits for in-flight jobs to release their leases
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,

    /// Max rows touched per reclaim / promotion sweep
    #[serde(default = "default_maintenance_batch")]
    pub maintenance_batch: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            worker_id: None,
            concurrency: default_concurrency(),
            provider_concurrency: default_provider_concurrency(),
            poll_interval: default_poll_interval(),
            lease_ttl: default_lease_ttl(),
            provider_timeout: default_provider_timeout(),
            shutdown_timeout: default_shutdown_timeout(),
            maintenance_batch: default_maintenance_batch(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueuerConfig {
    /// Extra attempts after a transaction conflict
    #[serde(default = "default_conflict_retries")]
    pub conflict_retries: u32,

    /// Base delay between conflict retries (doubled each time)
    #[serde(default = "default_conflict_backoff", with = "humantime_serde")]
    pub conflict_backoff: Duration,

    /// Priority given to jobs that don't ask for one
    #[serde(default)]
    pub default_priority: JobPriority,
}

impl Default for EnqueuerConfig {
    fn default() -> Self {
        Self {
            conflict_retries: default_conflict_retries(),
            conflict_backoff: default_conflict_backoff(),
            default_priority: JobPriority::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Cluster API base URL
    #[serde(default = "default_provider_url")]
    pub base_url: String,

    /// Bearer token sent to the cluster API
    #[serde(default, skip_serializing)]
    pub auth_token: Option<String>,

    /// Per-request HTTP timeout
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Delay between polls of an asynchronous operation
    #[serde(default = "default_status_poll_interval", with = "humantime_serde")]
    pub status_poll_interval: Duration,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: default_provider_url(),
            auth_token: None,
            request_timeout: default_request_timeout(),
            status_poll_interval: default_status_poll_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Run the retention sweeper
    #[serde(default = "default_retention_enabled")]
    pub enabled: bool,

    /// Terminal events older than this are archived
    #[serde(default = "default_archive_after", with = "humantime_serde")]
    pub archive_after: Duration,

    /// Sweep period
    #[serde(default = "default_sweep_interval", with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            enabled: default_retention_enabled(),
            archive_after: default_archive_after(),
            sweep_interval: default_sweep_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// OpenTelemetry OTLP endpoint
    #[serde(default)]
    pub otlp_endpoint: Option<String>,

    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default = "default_json_logging")]
    pub json_logging: bool,

    /// Prometheus scrape address, e.g. `0.0.0.0:9090`
    #[serde(default)]
    pub metrics_addr: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            otlp_endpoint: None,
            log_level: default_log_level(),
            json_logging: default_json_logging(),
            metrics_addr: None,
        }
    }
}

// Default value functions
fn default_database_url() -> String { "postgres://localhost:5432/vmgov".to_string() }
fn default_max_connections() -> u32 { 20 }
fn default_min_connections() -> u32 { 2 }
fn default_acquire_timeout() -> Duration { Duration::from_secs(5) }
fn default_concurrency() -> usize { 32 }
fn default_provider_concurrency() -> usize { 8 }
fn default_poll_interval() -> Duration { Duration::from_millis(500) }
fn default_lease_ttl() -> Duration { Duration::from_secs(300) }
fn default_provider_timeout() -> Duration { Duration::from_secs(120) }
fn default_shutdown_timeout() -> Duration { Duration::from_secs(30) }
fn default_maintenance_batch() -> usize { 100 }
fn default_conflict_retries() -> u32 { 3 }
fn default_conflict_backoff() -> Duration { Duration::from_millis(25) }
fn default_provider_url() -> String { "http://localhost:8081".to_string() }
fn default_request_timeout() -> Duration { Duration::from_secs(30) }
fn default_status_poll_interval() -> Duration { Duration::from_secs(2) }
fn default_retention_enabled() -> bool { true }
fn default_archive_after() -> Duration { Duration::from_secs(30 * 24 * 3600) }
fn default_sweep_interval() -> Duration { Duration::from_secs(3600) }
fn default_log_level() -> String { "info".to_string() }
fn default_json_logging() -> bool { true }

impl Config {
    /// Load configuration from the environment.
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(environment())
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from a specific file path, with the environment layered on top.
    pub fn from_file(path: &str) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(environment())
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject settings the dispatcher cannot run safely with.
    pub fn validate(&self) -> Result<()> {
        let d = &self.dispatcher;

        if d.concurrency == 0 || d.provider_concurrency == 0 {
            return Err(GovernanceError::configuration(
                "dispatcher concurrency and provider_concurrency must be at least 1",
            ));
        }
        if d.provider_concurrency > d.concurrency {
            return Err(GovernanceError::configuration(format!(
                "dispatcher.provider_concurrency ({}) must not exceed dispatcher.concurrency ({})",
                d.provider_concurrency, d.concurrency
            )));
        }
        if d.lease_ttl <= d.provider_timeout {
            return Err(GovernanceError::configuration(format!(
                "dispatcher.lease_ttl ({:?}) must be longer than dispatcher.provider_timeout ({:?})",
                d.lease_ttl, d.provider_timeout
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(GovernanceError::configuration(
                "retry.max_attempts must be at least 1",
            ));
        }
        if !self.retry.delays_increase() {
            return Err(GovernanceError::configuration(format!(
                "retry.backoff must give a longer delay for every retry within {} attempts",
                self.retry.max_attempts
            )));
        }
        if self.database.min_connections > self.database.max_connections {
            return Err(GovernanceError::configuration(
                "database.min_connections must not exceed database.max_connections",
            ));
        }

        Ok(())
    }
}

fn environment() -> config::Environment {
    config::Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
}
