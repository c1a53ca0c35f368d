// Main entry point for API server

use std::sync::Arc;

use anyhow::{Context, Result};
use mediamonitor_core::{
    kernel::jobs::{JobManager, SqliteJobStore},
    server::{build_app, AppState},
    Config,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,mediamonitor_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting MediaMonitor API");

    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;
    tracing::info!(
        vendor_root = %config.vendor_root.display(),
        max_concurrency = config.max_concurrency,
        "Configuration loaded"
    );

    if !config.vendor_root.is_dir() {
        tracing::warn!(
            vendor_root = %config.vendor_root.display(),
            "Toolchain root does not exist, jobs will fail until it is installed"
        );
    }

    // Connect to database (schema is created on connect)
    tracing::info!("Connecting to database...");
    let store = SqliteJobStore::connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    tracing::info!("Database connected");

    let jobs = JobManager::new(Arc::new(store), config.pipeline(), config.max_concurrency);

    let recovered = jobs
        .recover_interrupted()
        .await
        .context("Failed to recover unfinished jobs")?;
    if recovered > 0 {
        tracing::info!(count = recovered, "Recovered unfinished jobs");
    }

    let app = build_app(AppState::new(jobs));

    // Start server
    let addr = format!("0.0.0.0:{}", config.port);
    tracing::info!("Starting server on {}", addr);
    tracing::info!("Health check: http://localhost:{}/health", config.port);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
