//! Model training and the bounded pool it runs on.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::config::DetectorConfig;
use crate::detect::autoencoder::{AutoencoderParams, ReconstructionModel};
use crate::detect::features::FeatureVector;
use crate::detect::isolation::{IsolationModel, IsolationParams};
use crate::detect::DetectError;

/// The estimators trained together for one pipeline.
#[derive(Debug)]
pub struct TrainedModels {
    pub isolation: IsolationModel,
    /// Absent when the reconstruction backend is disabled.
    pub reconstruction: Option<ReconstructionModel>,
    pub training_rows: usize,
}

/// Knows how to fit both estimators from a history.
#[derive(Debug, Clone)]
pub struct Trainer {
    isolation: IsolationParams,
    reconstruction: Option<AutoencoderParams>,
}

impl Trainer {
    pub fn new(isolation: IsolationParams, reconstruction: Option<AutoencoderParams>) -> Self {
        Self {
            isolation,
            reconstruction,
        }
    }

    pub fn from_config(config: &DetectorConfig) -> Self {
        let reconstruction = config.reconstruction_enabled.then(|| AutoencoderParams {
            epochs: config.ae_epochs,
            batch_size: config.ae_batch_size,
            ..AutoencoderParams::default()
        });
        Self::new(IsolationParams::with_contamination(config.contamination), reconstruction)
    }

    pub fn reconstruction_enabled(&self) -> bool {
        self.reconstruction.is_some()
    }

    /// Fit both estimators. CPU-bound; call from a blocking context.
    pub fn train(&self, history: &[FeatureVector]) -> Result<TrainedModels, DetectError> {
        let started = Instant::now();
        let isolation = IsolationModel::train(history, &self.isolation)?;
        let reconstruction = match &self.reconstruction {
            Some(params) => Some(ReconstructionModel::train(history, params)?),
            None => None,
        };
        debug!(
            rows = history.len(),
            reconstruction = reconstruction.is_some(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "trained models"
        );
        Ok(TrainedModels {
            isolation,
            reconstruction,
            training_rows: history.len(),
        })
    }
}

/// Runs trainings on the blocking thread pool, at most `workers` at a time,
/// so model fitting never occupies the async request workers.
#[derive(Debug, Clone)]
pub struct TrainingPool {
    permits: Arc<Semaphore>,
    timeout: Option<Duration>,
}

impl TrainingPool {
    pub fn new(workers: usize, timeout: Option<Duration>) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(workers.max(1))),
            timeout,
        }
    }

    /// Train on the pool. A training that outlives the timeout is reported as
    /// failed; the job itself still runs to completion and its result is
    /// dropped.
    pub async fn train(
        &self,
        pipeline_id: &str,
        trainer: Arc<Trainer>,
        history: Vec<FeatureVector>,
    ) -> Result<TrainedModels, DetectError> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| DetectError::PoolClosed)?;

        let rows = history.len();
        let job = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            trainer.train(&history)
        });

        let joined = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, job).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!(pipeline = %pipeline_id, rows, secs = limit.as_secs(), "training timed out");
                    return Err(DetectError::TrainingTimeout {
                        pipeline: pipeline_id.to_string(),
                        secs: limit.as_secs(),
                    });
                }
            },
            None => job.await,
        };

        let models = joined.map_err(|e| DetectError::Worker(e.to_string()))??;
        info!(pipeline = %pipeline_id, rows, "training finished");
        Ok(models)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn history(n: usize) -> Vec<FeatureVector> {
        (0..n)
            .map(|i| [30.0 + (i % 4) as f64, 0.0, 0.0, 1.0, 0.0, 5.0, 10.0])
            .collect()
    }

    #[test]
    fn test_trainer_respects_disabled_backend() {
        let config = DetectorConfig {
            reconstruction_enabled: false,
            ..DetectorConfig::default()
        };
        let trainer = Trainer::from_config(&config);
        assert!(!trainer.reconstruction_enabled());

        let models = trainer.train(&history(20)).unwrap();
        assert!(models.reconstruction.is_none());
        assert_eq!(models.training_rows, 20);
    }

    #[tokio::test]
    async fn test_pool_trains_both_estimators() {
        let trainer = Arc::new(Trainer::from_config(&DetectorConfig::default()));
        let pool = TrainingPool::new(1, Some(Duration::from_secs(60)));
        let models = pool.train("build", trainer, history(24)).await.unwrap();
        assert!(models.reconstruction.is_some());
    }

    #[tokio::test]
    async fn test_pool_surfaces_training_errors() {
        let trainer = Arc::new(Trainer::from_config(&DetectorConfig::default()));
        let pool = TrainingPool::new(1, None);
        let err = pool.train("build", trainer, Vec::new()).await.unwrap_err();
        assert!(matches!(err, DetectError::EmptyTrainingSet));
    }

    #[tokio::test]
    async fn test_pool_times_out_slow_training() {
        let trainer = Arc::new(Trainer::from_config(&DetectorConfig::default()));
        let pool = TrainingPool::new(1, Some(Duration::from_millis(1)));
        let rows: Vec<FeatureVector> = (0..2000)
            .map(|i| {
                let t = i as f64;
                [t % 97.0, (i % 5) as f64, 0.0, (i % 11) as f64, 0.0, (i % 13) as f64, t % 41.0]
            })
            .collect();

        let err = pool.train("build", trainer, rows).await.unwrap_err();
        match err {
            DetectError::TrainingTimeout { pipeline, secs } => {
                assert_eq!(pipeline, "build");
                assert_eq!(secs, 0);
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }
}
