//! Anomaly reports: the persisted verdict for one scored run.

use std::fmt;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::detect::autoencoder::ReconstructionOutcome;
use crate::detect::fallback::FallbackOutcome;
use crate::detect::features::{FeatureVector, RunRecord};
use crate::detect::isolation::IsolationOutcome;

/// Which path produced a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScoringMode {
    #[serde(rename = "fallback")]
    Fallback,
    #[serde(rename = "isolation-only")]
    IsolationOnly,
    #[serde(rename = "isolation+reconstruction")]
    IsolationReconstruction,
}

impl ScoringMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScoringMode::Fallback => "fallback",
            ScoringMode::IsolationOnly => "isolation-only",
            ScoringMode::IsolationReconstruction => "isolation+reconstruction",
        }
    }

    /// Short label of the model(s) behind the verdict.
    pub fn model_label(&self) -> &'static str {
        match self {
            ScoringMode::Fallback => "rules",
            ScoringMode::IsolationOnly => "iforest",
            ScoringMode::IsolationReconstruction => "iforest+autoencoder",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "fallback" => Some(ScoringMode::Fallback),
            "isolation-only" => Some(ScoringMode::IsolationOnly),
            "isolation+reconstruction" => Some(ScoringMode::IsolationReconstruction),
            _ => None,
        }
    }
}

impl fmt::Display for ScoringMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CombinationWeights {
    pub isolation: f64,
    pub reconstruction: f64,
    pub threshold: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheDetails {
    pub reused: bool,
    pub model_age_secs: f64,
    pub training_rows: usize,
}

/// Audit payload stored with every report. Not used for re-scoring.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreDetails {
    pub mode: ScoringMode,
    pub history_size: usize,
    pub min_history: usize,
    pub features: RunFeatures,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback: Option<FallbackOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub isolation: Option<IsolationOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconstruction: Option<ReconstructionOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weights: Option<CombinationWeights>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheDetails>,
}

/// The candidate's feature values, keyed by name.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunFeatures {
    pub duration_sec: f64,
    pub error_count: f64,
    pub secrets_count: f64,
    pub urls_count: f64,
    pub bypass_count: f64,
    pub steps_count: f64,
    pub severity_score: f64,
}

impl From<&FeatureVector> for RunFeatures {
    fn from(v: &FeatureVector) -> Self {
        Self {
            duration_sec: v[0],
            error_count: v[1],
            secrets_count: v[2],
            urls_count: v[3],
            bypass_count: v[4],
            steps_count: v[5],
            severity_score: v[6],
        }
    }
}

/// A persisted verdict, also the response body of a scoring request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyReport {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub pipeline_id: String,
    pub run_id: Option<String>,
    pub job_id: Option<String>,
    pub mode: ScoringMode,
    pub model: String,
    pub score: f64,
    pub is_anomaly: bool,
    pub details: serde_json::Value,
}

impl AnomalyReport {
    pub fn new(record: &RunRecord, score: f64, is_anomaly: bool, details: &ScoreDetails) -> serde_json::Result<Self> {
        Ok(Self {
            id: Uuid::new_v4(),
            // Stored with microsecond precision.
            created_at: Utc::now().trunc_subsecs(6),
            pipeline_id: record.pipeline_id.clone(),
            run_id: record.run_id.clone(),
            job_id: record.job_id.clone(),
            mode: details.mode,
            model: details.mode.model_label().to_string(),
            score,
            is_anomaly,
            details: serde_json::to_value(details)?,
        })
    }
}
