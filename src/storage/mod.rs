//! SQLite storage layer: run history, anomaly reports, schema.

pub mod reports;
pub mod runs;
pub mod schema;

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use tracing::{info, warn};

use crate::config::StorageConfig;
use crate::detect::{AnomalyReport, FeatureVector, RunRecord};

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// Append-only history of pipeline runs.
pub trait RunHistory: Send + Sync {
    /// Store a run; returns its row id.
    fn append_run(&self, record: &RunRecord) -> Result<i64>;

    /// Feature rows for `pipeline_id`, most recent first, at most `limit`.
    /// With `before`, only rows inserted before that row id are returned.
    /// An unknown pipeline yields an empty list.
    fn fetch_recent(&self, pipeline_id: &str, limit: usize, before: Option<i64>) -> Result<Vec<FeatureVector>>;

    fn count_runs(&self, pipeline_id: Option<&str>) -> Result<u64>;
}

/// Append-only log of scoring verdicts.
pub trait ReportSink: Send + Sync {
    fn append_report(&self, report: &AnomalyReport) -> Result<()>;

    /// Most recent reports first, optionally scoped to one pipeline.
    fn list_recent(&self, pipeline_id: Option<&str>, limit: usize) -> Result<Vec<AnomalyReport>>;

    /// Reports whose verdict was anomalous.
    fn count_flagged(&self, pipeline_id: Option<&str>) -> Result<u64>;
}

/// Everything the decision engine needs from persistence.
pub trait Store: RunHistory + ReportSink {
    /// Cheap reachability check.
    fn ping(&self) -> Result<()>;
}

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &Path) -> Result<Pool> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create database directory {}", parent.display()))?;
    }

    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::builder()
        .connection_timeout(Duration::from_secs(5))
        .build(manager)?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

/// Open the pool, retrying with a fixed backoff. Exhausting the attempts is
/// a fatal startup error.
pub async fn open_pool_with_retry(config: &StorageConfig) -> Result<Pool> {
    let attempts = config.connect_retries.max(1);
    for attempt in 1..=attempts {
        let path = config.db_path.clone();
        let opened = tokio::task::spawn_blocking(move || open_pool(&path)).await?;
        match opened {
            Ok(pool) => {
                info!(db = %config.db_path.display(), attempt, "store ready");
                return Ok(pool);
            }
            Err(e) if attempt < attempts => {
                warn!(attempt, attempts, error = %e, "store unavailable, retrying");
                tokio::time::sleep(config.retry_backoff()).await;
            }
            Err(e) => {
                return Err(e.context(format!(
                    "store unavailable after {} attempts: {}",
                    attempts,
                    config.db_path.display()
                )));
            }
        }
    }
    bail!("store unavailable: no connection attempts made")
}

/// SQLite-backed implementation of the store traits.
#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool,
}

impl SqliteStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }
}

impl Store for SqliteStore {
    fn ping(&self) -> Result<()> {
        let conn = self.pool.get().context("no store connection")?;
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }
}
