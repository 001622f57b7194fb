//! Per-pipeline anomaly scoring: features, estimators, model cache and the
//! decision engine that ties them together.

pub mod autoencoder;
pub mod cache;
pub mod engine;
pub mod fallback;
pub mod features;
pub mod isolation;
pub mod report;
pub mod scaler;
pub mod stats;
pub mod training;

pub use self::cache::ModelCache;
pub use self::engine::DecisionEngine;
pub use self::features::{FeatureVector, RunRecord};
pub use self::report::{AnomalyReport, ScoringMode};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DetectError {
    #[error("cannot train on an empty history")]
    EmptyTrainingSet,

    #[error("feature matrix shape error: {0}")]
    Shape(String),

    #[error("training for pipeline '{pipeline}' exceeded {secs}s")]
    TrainingTimeout { pipeline: String, secs: u64 },

    #[error("training pool is shut down")]
    PoolClosed,

    #[error("training worker failed: {0}")]
    Worker(String),
}
