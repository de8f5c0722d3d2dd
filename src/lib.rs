//! logwarden -- buffered log ingestion with lease-guarded error spike detection.
//!
//! This crate provides the write buffer and flush scheduler for incoming
//! logs, the statistical detector that turns error spikes into incidents,
//! the lease lock that keeps detection to one instance at a time, and the
//! HTTP API in front of them.

pub mod api;
pub mod config;
pub mod detect;
pub mod ingest;
pub mod lease;
pub mod scheduler;
pub mod storage;

#[cfg(test)]
mod testing;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::detect::{AnomalyDetector, DetectorSettings, IncidentMaterializer};
use crate::ingest::{Flusher, IngestBuffer};
use crate::lease::LeaseLock;
use crate::storage::SqliteStore;

/// Open the configured database.
pub fn open_store(config: &Config) -> Result<SqliteStore> {
    let db_path = &config.storage.db_path;
    tracing::info!(db_path = %db_path.display(), "Initializing database");
    let pool = storage::open_pool(db_path)
        .with_context(|| format!("failed to open database {}", db_path.display()))?;
    Ok(SqliteStore::new(pool))
}

/// Wire a detector to the SQLite store, using the store's lock table for the lease.
pub fn build_detector(config: &Config, store: &SqliteStore) -> Result<AnomalyDetector> {
    let settings = DetectorSettings::from_config(&config.detection)?;
    let materializer = IncidentMaterializer::new(Arc::new(store.clone()), Arc::new(store.clone()));
    Ok(AnomalyDetector::new(
        Arc::new(LeaseLock::new(store.clone())),
        Arc::new(store.clone()),
        materializer,
        settings,
    ))
}

/// Start the logwarden daemon: API server, flush scheduler and detector.
///
/// Runs until SIGINT/SIGTERM, then stops accepting requests, flushes what is
/// still buffered and returns.
pub async fn serve(config: Config) -> Result<()> {
    // 1. Initialize Storage
    let store = open_store(&config)?;

    let addr: std::net::SocketAddr = config
        .server
        .bind
        .parse()
        .with_context(|| format!("invalid bind address {}", config.server.bind))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    tracing::info!(%addr, "logwarden listening");

    let shutdown = CancellationToken::new();
    let signals = tokio::spawn(shutdown_signal(shutdown.clone()));
    let result = run(&config, store, listener, shutdown).await;
    signals.abort();
    result
}

/// Run the service on `listener` until `shutdown` is cancelled.
///
/// Shutdown order: stop intake and let in-flight requests finish, stop the
/// detector, then stop the flush loop, whose final flush therefore sees
/// every record that was acknowledged.
pub async fn run(
    config: &Config,
    store: SqliteStore,
    listener: tokio::net::TcpListener,
    shutdown: CancellationToken,
) -> Result<()> {
    // Ingest buffer and its flusher
    let (buffer, handoff) = IngestBuffer::new(config.ingest.batch_size);
    let buffer = Arc::new(buffer);
    let flusher = Arc::new(Flusher::new(
        buffer.clone(),
        Arc::new(store.clone()),
        config.ingest.on_flush_failure,
        config.ingest.max_buffered,
    ));

    // Cancelled only once the HTTP server has drained.
    let flush_shutdown = CancellationToken::new();

    // Background jobs
    let flush_task = tokio::spawn(scheduler::run_flush_loop(
        flusher,
        handoff,
        config.ingest.flush_interval(),
        flush_shutdown.clone(),
    ));

    let detect_task = if config.detection.enabled {
        let detector = Arc::new(build_detector(config, &store)?);
        Some(tokio::spawn(scheduler::run_detection_loop(
            detector,
            config.detection.interval(),
            shutdown.clone(),
        )))
    } else {
        tracing::warn!("Anomaly detection disabled by configuration");
        None
    };

    // API Server
    let state = api::state::AppState {
        buffer,
        incidents: Arc::new(store.clone()),
        logs: Arc::new(store),
    };
    let app = api::router(state);

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await;

    // The server may also stop on its own error; the jobs must still wind down.
    shutdown.cancel();
    if let Some(task) = detect_task {
        if let Err(e) = task.await {
            tracing::error!("Detection scheduler task failed: {}", e);
        }
    }
    flush_shutdown.cancel();
    if let Err(e) = flush_task.await {
        tracing::error!("Flush scheduler task failed: {}", e);
    }

    served?;
    tracing::info!("logwarden stopped");
    Ok(())
}

async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
        _ = token.cancelled() => {},
    }

    tracing::info!("Shutdown signal received, draining");
    token.cancel();
}
