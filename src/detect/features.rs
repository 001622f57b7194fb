//! Run records and their fixed-order feature vectors.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Number of features per run.
pub const FEATURE_COUNT: usize = 7;

/// Column order shared by vectorization, training and scoring.
pub const FEATURE_NAMES: [&str; FEATURE_COUNT] = [
    "duration_sec",
    "error_count",
    "secrets_count",
    "urls_count",
    "bypass_count",
    "steps_count",
    "severity_score",
];

/// Bumped whenever `FEATURE_NAMES` changes; cached models trained against
/// another version are never reused.
pub const FEATURE_SCHEMA_VERSION: u32 = 1;

pub const IDX_DURATION: usize = 0;
pub const IDX_ERRORS: usize = 1;
pub const IDX_SECRETS: usize = 2;
pub const IDX_URLS: usize = 3;
pub const IDX_BYPASS: usize = 4;
pub const IDX_STEPS: usize = 5;
pub const IDX_SEVERITY: usize = 6;

pub type FeatureVector = [f64; FEATURE_COUNT];

/// One CI/CD pipeline execution as submitted by the log parser.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    #[serde(alias = "pipeline", alias = "pipelineId")]
    pub pipeline_id: String,
    #[serde(default, alias = "runId")]
    pub run_id: Option<String>,
    #[serde(default, alias = "jobId")]
    pub job_id: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_sec: Option<f64>,
    #[serde(default)]
    pub error_count: Option<i64>,
    #[serde(default)]
    pub secrets_count: Option<i64>,
    #[serde(default)]
    pub urls_count: Option<i64>,
    #[serde(default)]
    pub bypass_count: Option<i64>,
    #[serde(default)]
    pub steps_count: Option<i64>,
    #[serde(default)]
    pub severity_score: Option<f64>,
    #[serde(default)]
    pub meta: Option<serde_json::Value>,
}

impl RunRecord {
    pub fn new(pipeline_id: impl Into<String>) -> Self {
        Self {
            pipeline_id: pipeline_id.into(),
            ..Self::default()
        }
    }

    /// Map the record onto the fixed feature order. Missing values become 0;
    /// out-of-range values (negative counts) pass through untouched.
    pub fn to_vector(&self) -> FeatureVector {
        [
            self.duration_sec.unwrap_or(0.0),
            self.error_count.unwrap_or(0) as f64,
            self.secrets_count.unwrap_or(0) as f64,
            self.urls_count.unwrap_or(0) as f64,
            self.bypass_count.unwrap_or(0) as f64,
            self.steps_count.unwrap_or(0) as f64,
            self.severity_score.unwrap_or(0.0),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_fields_default_to_zero() {
        let record = RunRecord::new("build");
        assert_eq!(record.to_vector(), [0.0; FEATURE_COUNT]);
    }

    #[test]
    fn test_vector_order() {
        let record = RunRecord {
            duration_sec: Some(12.5),
            error_count: Some(1),
            secrets_count: Some(2),
            urls_count: Some(3),
            bypass_count: Some(4),
            steps_count: Some(5),
            severity_score: Some(60.0),
            ..RunRecord::new("build")
        };
        let v = record.to_vector();
        assert_eq!(v, [12.5, 1.0, 2.0, 3.0, 4.0, 5.0, 60.0]);
        assert_eq!(v[IDX_SEVERITY], 60.0);
        assert_eq!(FEATURE_NAMES[IDX_BYPASS], "bypass_count");
    }

    #[test]
    fn test_negative_counts_pass_through() {
        let record = RunRecord {
            error_count: Some(-2),
            ..RunRecord::new("build")
        };
        assert_eq!(record.to_vector()[IDX_ERRORS], -2.0);
    }

    #[test]
    fn test_deserialize_nulls_and_aliases() {
        let record: RunRecord = serde_json::from_str(
            r#"{"pipeline": "deploy", "duration_sec": null, "secrets_count": 1, "meta": {"branch": "main"}}"#,
        )
        .unwrap();
        assert_eq!(record.pipeline_id, "deploy");
        assert_eq!(record.duration_sec, None);
        let v = record.to_vector();
        assert_eq!(v.len(), FEATURE_COUNT);
        assert_eq!(v[IDX_DURATION], 0.0);
        assert_eq!(v[IDX_SECRETS], 1.0);
    }
}
