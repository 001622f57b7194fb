//! API route definitions.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::api::error::ApiError;
use crate::api::state::AppState;
use crate::detect::engine::{HealthStatus, PipelineStats, TrainOutcome};
use crate::detect::{AnomalyReport, RunRecord};

const DEFAULT_REPORT_LIMIT: usize = 20;
const MAX_REPORT_LIMIT: usize = 200;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/anomaly", post(score_run))
        .route("/reports", get(list_reports))
        .route("/stats", get(stats))
        .route("/reset-cache", post(reset_cache))
        .route("/train", post(train))
}

async fn health(State(state): State<AppState>) -> Json<HealthStatus> {
    Json(state.engine.health().await)
}

async fn score_run(
    State(state): State<AppState>,
    body: Result<Json<RunRecord>, JsonRejection>,
) -> Result<Json<AnomalyReport>, ApiError> {
    let Json(mut record) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    record.pipeline_id = required_pipeline(Some(record.pipeline_id))?;
    let report = state.engine.evaluate(record).await?;
    Ok(Json(report))
}

#[derive(Debug, Deserialize)]
struct ReportsQuery {
    #[serde(default, alias = "pipelineId")]
    pipeline_id: Option<String>,
    #[serde(default)]
    limit: Option<i64>,
}

async fn list_reports(
    State(state): State<AppState>,
    Query(query): Query<ReportsQuery>,
) -> Result<Json<Value>, ApiError> {
    let limit = match query.limit {
        None => DEFAULT_REPORT_LIMIT,
        Some(n) if (1..=MAX_REPORT_LIMIT as i64).contains(&n) => n as usize,
        Some(n) => {
            return Err(ApiError::BadRequest(format!(
                "limit must be between 1 and {}, got {}",
                MAX_REPORT_LIMIT, n
            )))
        }
    };
    let pipeline_id = optional_pipeline(query.pipeline_id);
    let reports = state.engine.list_reports(pipeline_id, limit).await?;
    Ok(Json(json!({
        "count": reports.len(),
        "reports": reports,
    })))
}

#[derive(Debug, Deserialize)]
struct ScopeQuery {
    #[serde(default, alias = "pipelineId")]
    pipeline_id: Option<String>,
}

async fn stats(
    State(state): State<AppState>,
    Query(query): Query<ScopeQuery>,
) -> Result<Json<PipelineStats>, ApiError> {
    let stats = state.engine.stats(optional_pipeline(query.pipeline_id)).await?;
    Ok(Json(stats))
}

async fn reset_cache(State(state): State<AppState>) -> Json<Value> {
    let dropped = state.engine.reset_cache().await;
    Json(json!({ "status": "ok", "dropped": dropped }))
}

#[derive(Debug, Deserialize)]
struct TrainQuery {
    #[serde(default, rename = "pipelineId", alias = "pipeline_id")]
    pipeline_id: Option<String>,
}

async fn train(
    State(state): State<AppState>,
    Query(query): Query<TrainQuery>,
) -> Result<Json<TrainOutcome>, ApiError> {
    let pipeline_id = required_pipeline(query.pipeline_id)?;
    let outcome = state.engine.train(&pipeline_id).await?;
    Ok(Json(outcome))
}

fn required_pipeline(raw: Option<String>) -> Result<String, ApiError> {
    optional_pipeline(raw).ok_or_else(|| ApiError::BadRequest("pipeline id is required".to_string()))
}

/// Blank scope parameters mean "all pipelines".
fn optional_pipeline(raw: Option<String>) -> Option<String> {
    raw.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}
