//! # Fiscal Daemon
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  1. Load EngineConfig (file → environment → validate)                  │
//! │  2. Open SQLite and run migrations                                     │
//! │  3. Load certificates, wire the engine (fails fast on a bad cert)      │
//! │  4. Spawn the reconciliation scheduler                                 │
//! │  5. Serve HTTP until Ctrl+C / SIGTERM, then stop the scheduler         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Usage: `fiscal-daemon [config.toml]` (or `FISCAL_CONFIG`).

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use fiscal_daemon::{router, AppState};
use fiscal_db::{Database, DbConfig};
use fiscal_engine::{DiagnosticsProbe, EngineConfig, InvoiceProcessor, ReconciliationScheduler};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("FISCAL_CONFIG").map(PathBuf::from));
    let config = EngineConfig::load(config_path).context("loading configuration")?;
    info!(
        environment = %config.service.environment,
        taxpayers = config.credentials.len(),
        "Configuration loaded"
    );
    if config.credentials.is_empty() {
        warn!("No taxpayer credentials configured; every authorization will fail");
    }

    let db_path = config.database.resolved_path();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let db = Database::new(
        DbConfig::new(&db_path)
            .max_connections(config.database.max_connections)
            .busy_timeout(config.database.busy_timeout()),
    )
    .await
    .context("opening database")?;

    let processor = Arc::new(
        InvoiceProcessor::from_config(&config, db.clone()).context("wiring the engine")?,
    );
    let diagnostics = Arc::new(DiagnosticsProbe::new(processor.client().clone(), db.clone()));

    let (scheduler, scheduler_handle) =
        ReconciliationScheduler::new(processor.clone(), config.scheduler.clone());
    let scheduler_task = tokio::spawn(scheduler.run());

    let app = router(AppState {
        processor,
        diagnostics,
        scheduler: scheduler_handle.clone(),
    })
    .layer(TraceLayer::new_for_http());

    let addr = format!("{}:{}", config.http.bind, config.http.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    info!(%addr, "Fiscal daemon listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving HTTP")?;

    if let Err(e) = scheduler_handle.shutdown().await {
        warn!(error = %e, "Scheduler already stopped");
    }
    scheduler_task.await.context("joining the scheduler")?;
    db.close().await;

    info!("Fiscal daemon stopped");
    Ok(())
}

/// Resolves on Ctrl+C or, on unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
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
                error!(error = %e, "Failed to listen for SIGTERM");
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

    info!("Shutdown signal received");
}
