//! Per-pipeline feature standardization.

use serde::Serialize;

use crate::detect::features::{FeatureVector, FEATURE_COUNT};
use crate::detect::stats;
use crate::detect::DetectError;

/// Zero-mean, unit-variance scaler fit on a pipeline's history.
///
/// Constant columns keep a scale of 1 so they standardize to 0 instead of
/// dividing by zero.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StandardScaler {
    means: FeatureVector,
    scales: FeatureVector,
}

impl StandardScaler {
    pub fn fit(rows: &[FeatureVector]) -> Result<Self, DetectError> {
        if rows.is_empty() {
            return Err(DetectError::EmptyTrainingSet);
        }

        let mut means = [0.0; FEATURE_COUNT];
        let mut scales = [1.0; FEATURE_COUNT];
        for col in 0..FEATURE_COUNT {
            let column: Vec<f64> = rows.iter().map(|r| r[col]).collect();
            means[col] = stats::mean(&column);
            let std = stats::std_dev(&column);
            if std > f64::EPSILON * means[col].abs().max(1.0) {
                scales[col] = std;
            }
        }
        Ok(Self { means, scales })
    }

    pub fn transform(&self, row: &FeatureVector) -> FeatureVector {
        let mut out = [0.0; FEATURE_COUNT];
        for col in 0..FEATURE_COUNT {
            out[col] = (row[col] - self.means[col]) / self.scales[col];
        }
        out
    }

    pub fn transform_all(&self, rows: &[FeatureVector]) -> Vec<FeatureVector> {
        rows.iter().map(|r| self.transform(r)).collect()
    }

    pub fn means(&self) -> &FeatureVector {
        &self.means
    }
}
