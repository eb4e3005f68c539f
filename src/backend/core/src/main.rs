//! Reindex Server - Main entry point

use clap::Parser;
use std::sync::Arc;

use reindex_core::{
    api::{self, AppState},
    audit::AuditLog,
    config::Config,
    jobs::{EngineBuilder, NoopRunner, RetryScheduler},
    observability::{self, metrics},
};

const SERVICE_NAME: &str = "reindex-server";

#[derive(Debug, Parser)]
#[command(name = SERVICE_NAME, version, about = "Retryable reindex job server")]
struct Args {
    /// Configuration file (TOML, YAML or JSON); environment overrides it
    #[arg(short, long, env = "REINDEX_CONFIG")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let config = match args.config.as_deref() {
        Some(path) => Config::from_file(path)?,
        None => Config::load()?,
    };

    observability::init(SERVICE_NAME, &config.observability)?;
    let metrics_registry = metrics::init_metrics(SERVICE_NAME)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        max_attempts = config.retry.max_attempts,
        execution_timeout_secs = config.execution.timeout.as_secs(),
        "Starting Reindex Server"
    );

    let audit = match config.audit.path.as_ref() {
        Some(path) => {
            tracing::info!(path = %path.display(), "Audit trail mirrored to file");
            AuditLog::with_file(path, config.audit.max_in_memory)?
        }
        None => AuditLog::in_memory(config.audit.max_in_memory),
    };

    let engine = EngineBuilder::from_config(Arc::new(NoopRunner), &config)
        .with_audit(Arc::new(audit))
        .build();

    let scheduler = config
        .scheduler
        .enabled
        .then(|| RetryScheduler::from_config(engine.clone(), &config.scheduler).start());

    let app = api::build_router(AppState::new(engine).with_metrics(metrics_registry));

    let addr = format!("{}:{}", config.server.host, config.server.port);
    tracing::info!(address = %addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(scheduler) = scheduler {
        scheduler.shutdown().await;
    }

    observability::shutdown();
    tracing::info!("Server shutdown complete");

    Ok(())
}

/// Wait for shutdown signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
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
