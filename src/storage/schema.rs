//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

/// Current schema version recorded in `schema_version`.
pub const SCHEMA_VERSION: i64 = 1;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS pipeline_runs (
            id INTEGER PRIMARY KEY,
            pipeline_id TEXT NOT NULL,
            run_id TEXT,
            job_id TEXT,
            source TEXT,
            status TEXT,
            duration_sec REAL,
            error_count INTEGER,
            secrets_count INTEGER,
            urls_count INTEGER,
            bypass_count INTEGER,
            steps_count INTEGER,
            severity_score REAL,
            meta_json TEXT,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS anomaly_reports (
            id TEXT PRIMARY KEY,
            pipeline_id TEXT NOT NULL,
            run_id TEXT,
            job_id TEXT,
            mode TEXT NOT NULL,
            model TEXT NOT NULL,
            score REAL NOT NULL,
            is_anomaly INTEGER NOT NULL,
            details_json TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_runs_pipeline ON pipeline_runs(pipeline_id, id);
        CREATE INDEX IF NOT EXISTS idx_reports_pipeline ON anomaly_reports(pipeline_id, created_at);
        CREATE INDEX IF NOT EXISTS idx_reports_created ON anomaly_reports(created_at);",
    )?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
        [SCHEMA_VERSION],
    )?;

    Ok(())
}
