//! Run-history queries.

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use rusqlite::params;

use crate::detect::{FeatureVector, RunRecord};
use crate::storage::{RunHistory, SqliteStore};

impl RunHistory for SqliteStore {
    fn append_run(&self, record: &RunRecord) -> Result<i64> {
        let conn = self.pool().get()?;
        let created_at = record
            .timestamp
            .unwrap_or_else(Utc::now)
            .to_rfc3339_opts(SecondsFormat::Micros, true);
        let meta_json = record
            .meta
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        conn.execute(
            "INSERT INTO pipeline_runs (
                pipeline_id, run_id, job_id, source, status,
                duration_sec, error_count, secrets_count, urls_count,
                bypass_count, steps_count, severity_score, meta_json, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                record.pipeline_id,
                record.run_id,
                record.job_id,
                record.source,
                record.status,
                record.duration_sec,
                record.error_count,
                record.secrets_count,
                record.urls_count,
                record.bypass_count,
                record.steps_count,
                record.severity_score,
                meta_json,
                created_at
            ],
        )
        .context("Failed to insert pipeline run")?;

        Ok(conn.last_insert_rowid())
    }

    fn fetch_recent(&self, pipeline_id: &str, limit: usize, before: Option<i64>) -> Result<Vec<FeatureVector>> {
        let conn = self.pool().get()?;
        // NULL columns read back as 0 so every row is a full feature vector.
        let mut stmt = conn.prepare(
            "SELECT COALESCE(duration_sec, 0), COALESCE(error_count, 0),
                    COALESCE(secrets_count, 0), COALESCE(urls_count, 0),
                    COALESCE(bypass_count, 0), COALESCE(steps_count, 0),
                    COALESCE(severity_score, 0)
             FROM pipeline_runs
             WHERE pipeline_id = ?1
             AND (?2 IS NULL OR id < ?2)
             ORDER BY id DESC
             LIMIT ?3",
        )?;

        let rows = stmt.query_map(params![pipeline_id, before, limit], |row| {
            Ok([
                row.get::<_, f64>(0)?,
                row.get::<_, f64>(1)?,
                row.get::<_, f64>(2)?,
                row.get::<_, f64>(3)?,
                row.get::<_, f64>(4)?,
                row.get::<_, f64>(5)?,
                row.get::<_, f64>(6)?,
            ])
        })?;

        let mut history = Vec::new();
        for r in rows {
            history.push(r?);
        }
        Ok(history)
    }

    fn count_runs(&self, pipeline_id: Option<&str>) -> Result<u64> {
        let conn = self.pool().get()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM pipeline_runs WHERE (?1 IS NULL OR pipeline_id = ?1)",
            params![pipeline_id],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }
}
