//! Decision engine: persists the run, picks fallback or ensemble scoring,
//! combines the estimator outputs and records the verdict.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::DetectorConfig;
use crate::detect::cache::ModelCache;
use crate::detect::fallback;
use crate::detect::features::{FeatureVector, RunRecord};
use crate::detect::report::{
    AnomalyReport, CacheDetails, CombinationWeights, RunFeatures, ScoreDetails, ScoringMode,
};
use crate::storage::Store;

pub const ISOLATION_WEIGHT: f64 = 0.6;
pub const RECONSTRUCTION_WEIGHT: f64 = 0.4;
/// Combined score above which a run is flagged even if neither estimator
/// flagged it alone.
pub const COMBINED_THRESHOLD: f64 = 0.7;

/// Weighted ensemble score and verdict.
///
/// With no reconstruction outcome the isolation score stands in for the
/// combined score.
pub fn combine(
    iso_score: f64,
    iso_flag: bool,
    reconstruction: Option<(f64, bool)>,
) -> (f64, bool) {
    match reconstruction {
        Some((recon_score, recon_flag)) => {
            let combined =
                (ISOLATION_WEIGHT * iso_score + RECONSTRUCTION_WEIGHT * recon_score).clamp(0.0, 1.0);
            (combined, iso_flag || recon_flag || combined > COMBINED_THRESHOLD)
        }
        None => {
            let combined = iso_score.clamp(0.0, 1.0);
            (combined, iso_flag || combined > COMBINED_THRESHOLD)
        }
    }
}

/// Result of an explicit train/check request.
#[derive(Debug, Clone, Serialize)]
pub struct TrainOutcome {
    pub pipeline_id: String,
    pub history_size: usize,
    pub min_history: usize,
    pub sufficient: bool,
    pub trained: bool,
    pub reused: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
    pub pipeline_id: Option<String>,
    pub runs: u64,
    pub anomalies: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CachedPipeline {
    pub pipeline_id: String,
    pub model_age_secs: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
    pub store_reachable: bool,
    pub cache_size: usize,
    /// Resident pipelines, oldest model first.
    pub cached_pipelines: Vec<CachedPipeline>,
    pub reconstruction_enabled: bool,
    pub version: &'static str,
}

pub struct DecisionEngine {
    store: Arc<dyn Store>,
    cache: ModelCache,
    config: DetectorConfig,
}

impl DecisionEngine {
    pub fn new(store: Arc<dyn Store>, config: DetectorConfig) -> Self {
        Self {
            store,
            cache: ModelCache::from_config(&config),
            config,
        }
    }

    pub fn cache(&self) -> &ModelCache {
        &self.cache
    }

    /// Score one run. The run is stored before scoring and stays stored
    /// even when scoring or report persistence fails.
    pub async fn evaluate(&self, record: RunRecord) -> Result<AnomalyReport> {
        let candidate = record.to_vector();

        let stored = record.clone();
        let row_id = self
            .blocking(move |store| store.append_run(&stored))
            .await
            .context("failed to persist run")?;

        let history = self.history(&record.pipeline_id, Some(row_id)).await?;

        let (score, is_anomaly, details) = if history.len() < self.config.min_history {
            self.score_fallback(&candidate, history.len())
        } else {
            self.score_ensemble(&record.pipeline_id, candidate, history).await?
        };

        let report = AnomalyReport::new(&record, score, is_anomaly, &details)?;
        let saved = report.clone();
        self.blocking(move |store| store.append_report(&saved))
            .await
            .context("failed to persist report")?;

        info!(
            pipeline = %report.pipeline_id,
            run = ?report.run_id,
            mode = %report.mode,
            score = report.score,
            anomaly = report.is_anomaly,
            "run scored"
        );
        Ok(report)
    }

    fn score_fallback(&self, candidate: &FeatureVector, history_size: usize) -> (f64, bool, ScoreDetails) {
        let outcome = fallback::evaluate(candidate);
        let details = ScoreDetails {
            mode: ScoringMode::Fallback,
            history_size,
            min_history: self.config.min_history,
            features: RunFeatures::from(candidate),
            fallback: Some(outcome.clone()),
            isolation: None,
            reconstruction: None,
            weights: None,
            cache: None,
        };
        (outcome.score, outcome.is_anomaly, details)
    }

    async fn score_ensemble(
        &self,
        pipeline_id: &str,
        candidate: FeatureVector,
        history: Vec<FeatureVector>,
    ) -> Result<(f64, bool, ScoreDetails)> {
        let history_size = history.len();
        let reference: Vec<FeatureVector> = history
            .iter()
            .take(self.config.threshold_sample)
            .copied()
            .collect();

        let lookup = self.cache.get_or_train(pipeline_id, history).await?;
        let models = lookup.models.clone();

        let (isolation, reconstruction) = tokio::task::spawn_blocking(move || {
            let isolation = models.isolation.evaluate(&candidate);
            let reconstruction = models
                .reconstruction
                .as_ref()
                .map(|model| model.evaluate(&candidate, &reference))
                .transpose()?;
            Ok::<_, crate::detect::DetectError>((isolation, reconstruction))
        })
        .await??;

        let (score, is_anomaly) = combine(
            isolation.score,
            isolation.predicted_anomaly,
            reconstruction.as_ref().map(|r| (r.score, r.predicted_anomaly)),
        );

        let (mode, weights) = match reconstruction {
            Some(_) => (
                ScoringMode::IsolationReconstruction,
                Some(CombinationWeights {
                    isolation: ISOLATION_WEIGHT,
                    reconstruction: RECONSTRUCTION_WEIGHT,
                    threshold: COMBINED_THRESHOLD,
                }),
            ),
            None => (ScoringMode::IsolationOnly, None),
        };

        let details = ScoreDetails {
            mode,
            history_size,
            min_history: self.config.min_history,
            features: RunFeatures::from(&candidate),
            fallback: None,
            isolation: Some(isolation),
            reconstruction,
            weights,
            cache: Some(CacheDetails {
                reused: lookup.reused,
                model_age_secs: lookup.age.as_secs_f64(),
                training_rows: lookup.models.training_rows,
            }),
        };
        Ok((score, is_anomaly, details))
    }

    /// Make sure the pipeline has fresh models if its history allows it.
    pub async fn train(&self, pipeline_id: &str) -> Result<TrainOutcome> {
        let history = self.history(pipeline_id, None).await?;
        let history_size = history.len();
        let sufficient = history_size >= self.config.min_history;

        let (trained, reused) = if sufficient {
            let lookup = self.cache.get_or_train(pipeline_id, history).await?;
            (!lookup.reused, lookup.reused)
        } else {
            info!(pipeline = %pipeline_id, history_size, "not enough history to train");
            (false, false)
        };

        Ok(TrainOutcome {
            pipeline_id: pipeline_id.to_string(),
            history_size,
            min_history: self.config.min_history,
            sufficient,
            trained,
            reused,
        })
    }

    pub async fn list_reports(&self, pipeline_id: Option<String>, limit: usize) -> Result<Vec<AnomalyReport>> {
        self.blocking(move |store| store.list_recent(pipeline_id.as_deref(), limit))
            .await
            .context("failed to list reports")
    }

    pub async fn stats(&self, pipeline_id: Option<String>) -> Result<PipelineStats> {
        let scope = pipeline_id.clone();
        let (runs, anomalies) = self
            .blocking(move |store| {
                let runs = store.count_runs(scope.as_deref())?;
                let anomalies = store.count_flagged(scope.as_deref())?;
                Ok((runs, anomalies))
            })
            .await
            .context("failed to count runs")?;
        Ok(PipelineStats {
            pipeline_id,
            runs,
            anomalies,
        })
    }

    pub async fn reset_cache(&self) -> usize {
        self.cache.reset().await
    }

    /// Never fails: an unreachable store is reported as degraded.
    pub async fn health(&self) -> HealthStatus {
        let store_reachable = match self.blocking(|store| store.ping()).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "store unreachable");
                false
            }
        };
        let cached_pipelines: Vec<CachedPipeline> = self
            .cache
            .snapshot()
            .await
            .into_iter()
            .map(|(pipeline_id, age)| CachedPipeline {
                pipeline_id,
                model_age_secs: age.as_secs_f64(),
            })
            .collect();
        HealthStatus {
            status: if store_reachable { "ok" } else { "degraded" },
            store_reachable,
            cache_size: cached_pipelines.len(),
            cached_pipelines,
            reconstruction_enabled: self.cache.reconstruction_enabled(),
            version: env!("CARGO_PKG_VERSION"),
        }
    }

    async fn history(&self, pipeline_id: &str, before: Option<i64>) -> Result<Vec<FeatureVector>> {
        let id = pipeline_id.to_string();
        let limit = self.config.history_limit;
        self.blocking(move |store| store.fetch_recent(&id, limit, before))
            .await
            .context("failed to fetch history")
    }

    /// Run a store operation on the blocking pool.
    async fn blocking<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn Store) -> Result<T> + Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || op(store.as_ref())).await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{open_pool, ReportSink, RunHistory, SqliteStore};

    /// Keeps run history working but refuses reports and pings.
    struct BrokenReports {
        inner: SqliteStore,
    }

    impl RunHistory for BrokenReports {
        fn append_run(&self, record: &RunRecord) -> Result<i64> {
            self.inner.append_run(record)
        }

        fn fetch_recent(&self, pipeline_id: &str, limit: usize, before: Option<i64>) -> Result<Vec<FeatureVector>> {
            self.inner.fetch_recent(pipeline_id, limit, before)
        }

        fn count_runs(&self, pipeline_id: Option<&str>) -> Result<u64> {
            self.inner.count_runs(pipeline_id)
        }
    }

    impl ReportSink for BrokenReports {
        fn append_report(&self, _report: &AnomalyReport) -> Result<()> {
            anyhow::bail!("report table is read-only")
        }

        fn list_recent(&self, pipeline_id: Option<&str>, limit: usize) -> Result<Vec<AnomalyReport>> {
            self.inner.list_recent(pipeline_id, limit)
        }

        fn count_flagged(&self, pipeline_id: Option<&str>) -> Result<u64> {
            self.inner.count_flagged(pipeline_id)
        }
    }

    impl Store for BrokenReports {
        fn ping(&self) -> Result<()> {
            anyhow::bail!("connection refused")
        }
    }

    fn engine(config: DetectorConfig) -> (tempfile::TempDir, DecisionEngine) {
        let dir = tempfile::TempDir::new().unwrap();
        let pool = open_pool(&dir.path().join("engine.db")).unwrap();
        let store: Arc<dyn Store> = Arc::new(SqliteStore::new(pool));
        (dir, DecisionEngine::new(store, config))
    }

    fn steady_run(pipeline: &str, i: usize) -> RunRecord {
        RunRecord {
            duration_sec: Some(100.0 + (i % 7) as f64 * 3.0),
            error_count: Some((i % 2) as i64),
            secrets_count: Some(0),
            urls_count: Some(2 + (i % 3) as i64),
            bypass_count: Some(0),
            steps_count: Some(10 + (i % 4) as i64),
            severity_score: Some(10.0 + (i % 5) as f64),
            ..RunRecord::new(pipeline)
        }
    }

    #[test]
    fn test_combine_bounds_and_threshold() {
        let (score, flag) = combine(0.0, false, Some((0.0, false)));
        assert_eq!(score, 0.0);
        assert!(!flag);

        let (score, flag) = combine(1.0, false, Some((1.0, false)));
        assert_eq!(score, 1.0);
        assert!(flag);

        let (score, flag) = combine(0.5, false, Some((0.5, false)));
        assert!((score - 0.5).abs() < 1e-12);
        assert!(!flag);

        let (score, flag) = combine(0.9, false, Some((0.8, false)));
        assert!(score > COMBINED_THRESHOLD);
        assert!(flag);

        let (_, flag) = combine(0.0, false, Some((0.1, true)));
        assert!(flag);
    }

    #[test]
    fn test_combine_isolation_only() {
        assert_eq!(combine(0.3, false, None), (0.3, false));
        assert_eq!(combine(0.2, true, None), (0.2, true));
        assert_eq!(combine(0.9, false, None), (0.9, true));
        assert_eq!(combine(1.5, false, None), (1.0, true));
    }

    #[tokio::test]
    async fn test_fallback_leaves_cache_empty() {
        let (_dir, engine) = engine(DetectorConfig::default());
        let report = engine
            .evaluate(RunRecord {
                secrets_count: Some(2),
                ..RunRecord::new("fresh")
            })
            .await
            .unwrap();

        assert_eq!(report.mode, ScoringMode::Fallback);
        assert_eq!(report.score, 1.0);
        assert!(report.is_anomaly);
        assert_eq!(report.details["history_size"], 0);
        assert!(engine.cache().is_empty().await);
    }

    #[tokio::test]
    async fn test_history_excludes_current_run() {
        let (_dir, engine) = engine(DetectorConfig::default());
        for i in 0..10 {
            engine.evaluate(steady_run("p", i)).await.unwrap();
        }
        // The eleventh run sees exactly ten prior rows and uses the ensemble.
        let report = engine.evaluate(steady_run("p", 10)).await.unwrap();
        assert_eq!(report.details["history_size"], 10);
        assert_eq!(report.mode, ScoringMode::IsolationReconstruction);
        assert_eq!(report.model, "iforest+autoencoder");
        assert!((0.0..=1.0).contains(&report.score));
    }

    #[tokio::test]
    async fn test_isolation_only_when_reconstruction_disabled() {
        let config = DetectorConfig {
            reconstruction_enabled: false,
            ..DetectorConfig::default()
        };
        let (_dir, engine) = engine(config);
        for i in 0..12 {
            engine.evaluate(steady_run("p", i)).await.unwrap();
        }
        let report = engine.evaluate(steady_run("p", 12)).await.unwrap();
        assert_eq!(report.mode, ScoringMode::IsolationOnly);
        assert_eq!(report.model, "iforest");
        assert!(report.details.get("reconstruction").is_none());
    }

    #[tokio::test]
    async fn test_train_reports_sufficiency() {
        let (_dir, engine) = engine(DetectorConfig::default());
        let outcome = engine.train("p").await.unwrap();
        assert!(!outcome.sufficient);
        assert!(!outcome.trained);

        for i in 0..10 {
            engine.evaluate(steady_run("p", i)).await.unwrap();
        }
        let outcome = engine.train("p").await.unwrap();
        assert!(outcome.sufficient);
        assert!(outcome.trained);

        let again = engine.train("p").await.unwrap();
        assert!(again.reused);
        assert!(!again.trained);
    }

    #[tokio::test]
    async fn test_stats_and_health() {
        let (_dir, engine) = engine(DetectorConfig::default());
        engine
            .evaluate(RunRecord {
                bypass_count: Some(1),
                ..RunRecord::new("a")
            })
            .await
            .unwrap();
        engine.evaluate(RunRecord::new("b")).await.unwrap();

        let all = engine.stats(None).await.unwrap();
        assert_eq!((all.runs, all.anomalies), (2, 1));
        let b = engine.stats(Some("b".to_string())).await.unwrap();
        assert_eq!((b.runs, b.anomalies), (1, 0));

        let health = engine.health().await;
        assert_eq!(health.status, "ok");
        assert!(health.store_reachable);
        assert!(health.reconstruction_enabled);
    }

    #[tokio::test]
    async fn test_run_stays_stored_when_report_fails() {
        let dir = tempfile::TempDir::new().unwrap();
        let inner = SqliteStore::new(open_pool(&dir.path().join("engine.db")).unwrap());
        let store: Arc<dyn Store> = Arc::new(BrokenReports { inner: inner.clone() });
        let engine = DecisionEngine::new(store, DetectorConfig::default());

        let err = engine.evaluate(RunRecord::new("p")).await.unwrap_err();
        assert!(err.to_string().contains("failed to persist report"));
        assert_eq!(inner.count_runs(Some("p")).unwrap(), 1);
        assert_eq!(inner.count_flagged(None).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_health_degraded_when_store_unreachable() {
        let dir = tempfile::TempDir::new().unwrap();
        let inner = SqliteStore::new(open_pool(&dir.path().join("engine.db")).unwrap());
        let engine = DecisionEngine::new(Arc::new(BrokenReports { inner }), DetectorConfig::default());

        let health = engine.health().await;
        assert_eq!(health.status, "degraded");
        assert!(!health.store_reachable);
        assert_eq!(health.cache_size, 0);
    }

    #[tokio::test]
    async fn test_health_lists_cached_pipelines() {
        let (_dir, engine) = engine(DetectorConfig::default());
        for i in 0..10 {
            engine.evaluate(steady_run("p", i)).await.unwrap();
        }
        engine.train("p").await.unwrap();

        let health = engine.health().await;
        assert_eq!(health.cache_size, 1);
        assert_eq!(health.cached_pipelines[0].pipeline_id, "p");
        assert!(health.cached_pipelines[0].model_age_secs >= 0.0);
    }
}
