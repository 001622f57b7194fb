//! Anomaly-report persistence.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::params;
use uuid::Uuid;

use crate::detect::{AnomalyReport, ScoringMode};
use crate::storage::{ReportSink, SqliteStore};

struct ReportRow {
    id: String,
    pipeline_id: String,
    run_id: Option<String>,
    job_id: Option<String>,
    mode: String,
    model: String,
    score: f64,
    is_anomaly: bool,
    details_json: String,
    created_at: String,
}

impl ReportRow {
    fn into_report(self) -> Result<AnomalyReport> {
        let mode = ScoringMode::parse(&self.mode)
            .ok_or_else(|| anyhow!("unknown scoring mode '{}' in report {}", self.mode, self.id))?;
        Ok(AnomalyReport {
            id: Uuid::parse_str(&self.id).with_context(|| format!("bad report id '{}'", self.id))?,
            created_at: DateTime::parse_from_rfc3339(&self.created_at)
                .with_context(|| format!("bad timestamp in report {}", self.id))?
                .with_timezone(&Utc),
            pipeline_id: self.pipeline_id,
            run_id: self.run_id,
            job_id: self.job_id,
            mode,
            model: self.model,
            score: self.score,
            is_anomaly: self.is_anomaly,
            details: serde_json::from_str(&self.details_json)?,
        })
    }
}

impl ReportSink for SqliteStore {
    fn append_report(&self, report: &AnomalyReport) -> Result<()> {
        let conn = self.pool().get()?;
        let details_json = serde_json::to_string(&report.details)?;

        conn.execute(
            "INSERT INTO anomaly_reports (
                id, pipeline_id, run_id, job_id, mode, model,
                score, is_anomaly, details_json, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                report.id.to_string(),
                report.pipeline_id,
                report.run_id,
                report.job_id,
                report.mode.as_str(),
                report.model,
                report.score,
                report.is_anomaly,
                details_json,
                report.created_at.to_rfc3339_opts(SecondsFormat::Micros, true)
            ],
        )
        .context("Failed to save anomaly report")?;

        Ok(())
    }

    fn list_recent(&self, pipeline_id: Option<&str>, limit: usize) -> Result<Vec<AnomalyReport>> {
        let conn = self.pool().get()?;
        let mut stmt = conn.prepare(
            "SELECT id, pipeline_id, run_id, job_id, mode, model, score, is_anomaly, details_json, created_at
             FROM anomaly_reports
             WHERE (?1 IS NULL OR pipeline_id = ?1)
             ORDER BY created_at DESC, rowid DESC
             LIMIT ?2",
        )?;

        let rows = stmt.query_map(params![pipeline_id, limit], |row| {
            Ok(ReportRow {
                id: row.get(0)?,
                pipeline_id: row.get(1)?,
                run_id: row.get(2)?,
                job_id: row.get(3)?,
                mode: row.get(4)?,
                model: row.get(5)?,
                score: row.get(6)?,
                is_anomaly: row.get(7)?,
                details_json: row.get(8)?,
                created_at: row.get(9)?,
            })
        })?;

        let mut reports = Vec::new();
        for r in rows {
            reports.push(r?.into_report()?);
        }
        Ok(reports)
    }

    fn count_flagged(&self, pipeline_id: Option<&str>) -> Result<u64> {
        let conn = self.pool().get()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM anomaly_reports
             WHERE is_anomaly = 1 AND (?1 IS NULL OR pipeline_id = ?1)",
            params![pipeline_id],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }
}
