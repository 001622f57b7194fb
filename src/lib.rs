//! SafeOps anomaly service -- per-pipeline anomaly scoring for CI/CD runs.
//!
//! This crate provides run-history storage, the isolation and reconstruction
//! estimators, the per-pipeline model cache, and the HTTP API around them.

pub mod api;
pub mod config;
pub mod detect;
pub mod storage;

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::config::Config;
use crate::detect::DecisionEngine;
use crate::storage::{SqliteStore, Store};

/// Open the store (with bounded retry) and build the decision engine on it.
pub async fn open_engine(config: &Config) -> Result<DecisionEngine> {
    let pool = storage::open_pool_with_retry(&config.storage).await?;
    let store: Arc<dyn Store> = Arc::new(SqliteStore::new(pool));
    Ok(DecisionEngine::new(store, config.detector.clone()))
}

/// Start the anomaly service: store, decision engine and API server.
pub async fn serve(config: Config) -> Result<()> {
    // 1. Initialize Storage and the engine
    tracing::info!(db_path = %config.storage.db_path.display(), "Initializing database");
    let engine = open_engine(&config).await?;
    tracing::info!(
        min_history = config.detector.min_history,
        reconstruction = config.detector.reconstruction_enabled,
        cache_ttl_secs = config.detector.cache_ttl_secs,
        max_cached = config.detector.max_cached_pipelines,
        "Decision engine ready"
    );

    // 2. Start API Server
    let addr: std::net::SocketAddr = config
        .server
        .bind
        .parse()
        .with_context(|| format!("invalid bind address '{}'", config.server.bind))?;
    let app = api::router(api::state::AppState::new(engine));

    tracing::info!(%addr, "safeops-anomaly listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("safeops-anomaly stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
