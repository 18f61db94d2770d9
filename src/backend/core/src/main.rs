//! vmgov worker - leases approved jobs and drives them through the cluster API.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use vmgov_core::{
    config::Config,
    jobs::{JobDispatcher, RetentionSweeper},
    provider::HttpProvider,
    store::{PgStore, Store},
    telemetry,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // VMGOV_CONFIG names a file; the environment is layered on top either way
    let config = match std::env::var("VMGOV_CONFIG") {
        Ok(path) => Config::from_file(&path)?,
        Err(_) => Config::load()?,
    };

    let telemetry = telemetry::init("vmgov-worker", &config.observability)?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting vmgov worker");

    let store = PgStore::connect(&config.database).await?;
    store.migrate().await?;
    let store: Arc<dyn Store> = Arc::new(store);
    tracing::info!("Connected to database");

    let provider = Arc::new(HttpProvider::new(&config.provider)?);
    tracing::info!(base_url = %provider.base_url(), "Cluster API provider ready");

    let dispatcher = JobDispatcher::new(
        store.clone(),
        provider,
        config.dispatcher.clone(),
        config.retry.clone(),
    );
    let handle = dispatcher.start();

    let maintenance = CancellationToken::new();
    let sweeper = RetentionSweeper::new(store, config.retention.clone()).spawn(maintenance.clone());

    shutdown_signal().await;

    maintenance.cancel();
    let stats = handle.shutdown().await?;
    if let Err(e) = sweeper.await {
        tracing::warn!(error = %e, "Retention sweeper task failed");
    }

    tracing::info!(
        leased = stats.leased,
        succeeded = stats.succeeded,
        retried = stats.retried,
        discarded = stats.discarded,
        released = stats.released,
        "Worker shutdown complete"
    );
    telemetry.shutdown();

    Ok(())
}

/// Wait for shutdown signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
