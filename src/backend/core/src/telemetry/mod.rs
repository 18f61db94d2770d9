//! Telemetry: structured logging, optional OTLP trace export and metrics.
//!
//! ```rust,no_run
//! use vmgov_core::config::ObservabilityConfig;
//! use vmgov_core::telemetry;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let handle = telemetry::init("vmgov-worker", &ObservabilityConfig::default())?;
//! // ...
//! handle.shutdown();
//! # Ok(())
//! # }
//! ```

pub mod metrics;

use opentelemetry_otlp::WithExportConfig;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::ObservabilityConfig;

/// Install the global subscriber and, when configured, the Prometheus
/// recorder. Must be called once, from inside a Tokio runtime when an OTLP
/// endpoint or metrics address is set.
pub fn init(service_name: &str, config: &ObservabilityConfig) -> anyhow::Result<TelemetryHandle> {
    // RUST_LOG wins over the configured level.
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&config.log_level))?;

    let otel_layer = match &config.otlp_endpoint {
        Some(endpoint) => {
            let tracer = opentelemetry_otlp::new_pipeline()
                .tracing()
                .with_exporter(
                    opentelemetry_otlp::new_exporter()
                        .tonic()
                        .with_endpoint(endpoint),
                )
                .with_trace_config(opentelemetry_sdk::trace::config().with_resource(
                    opentelemetry_sdk::Resource::new(vec![
                        opentelemetry::KeyValue::new("service.name", service_name.to_string()),
                        opentelemetry::KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                    ]),
                ))
                .install_batch(opentelemetry_sdk::runtime::Tokio)?;
            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };

    let fmt_layer = if config.json_logging {
        fmt::layer().json().with_target(true).boxed()
    } else {
        fmt::layer().pretty().with_target(true).boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(otel_layer)
        .with(fmt_layer)
        .try_init()?;

    if let Some(addr) = &config.metrics_addr {
        metrics::install_prometheus(addr)?;
    }
    metrics::describe_metrics();

    tracing::info!(
        service_name = %service_name,
        otlp = config.otlp_endpoint.is_some(),
        metrics_addr = ?config.metrics_addr,
        "Telemetry initialized"
    );

    Ok(TelemetryHandle {
        otlp: config.otlp_endpoint.is_some(),
    })
}

/// Keeps track of what needs flushing at exit.
#[must_use]
pub struct TelemetryHandle {
    otlp: bool,
}

impl TelemetryHandle {
    /// Flush pending spans.
    pub fn shutdown(self) {
        if self.otlp {
            opentelemetry::global::shutdown_tracer_provider();
        }
        tracing::info!("Telemetry shutdown complete");
    }
}
