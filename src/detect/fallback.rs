//! Deterministic rule used while a pipeline has too little history to train.

use serde::Serialize;

use crate::detect::features::{FeatureVector, IDX_BYPASS, IDX_DURATION, IDX_ERRORS, IDX_SECRETS, IDX_SEVERITY};

pub const MAX_ERRORS: f64 = 3.0;
pub const MAX_SEVERITY: f64 = 80.0;
pub const MAX_DURATION_SEC: f64 = 600.0;

/// Outcome of the fallback rule. The score is binary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FallbackOutcome {
    pub score: f64,
    pub is_anomaly: bool,
    /// Names of the conditions that fired, for the report details.
    pub triggered: Vec<&'static str>,
}

pub fn evaluate(features: &FeatureVector) -> FallbackOutcome {
    let checks = [
        ("secrets_found", features[IDX_SECRETS] > 0.0),
        ("bypass_attempt", features[IDX_BYPASS] > 0.0),
        ("error_count", features[IDX_ERRORS] >= MAX_ERRORS),
        ("severity_score", features[IDX_SEVERITY] >= MAX_SEVERITY),
        ("duration_sec", features[IDX_DURATION] >= MAX_DURATION_SEC),
    ];
    let triggered: Vec<&'static str> = checks
        .iter()
        .filter(|(_, fired)| *fired)
        .map(|(name, _)| *name)
        .collect();
    let is_anomaly = !triggered.is_empty();

    FallbackOutcome {
        score: if is_anomaly { 1.0 } else { 0.0 },
        is_anomaly,
        triggered,
    }
}
