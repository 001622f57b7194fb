#![allow(dead_code)]

use safeops_anomaly::config::Config;
use safeops_anomaly::detect::{DecisionEngine, RunRecord};

pub async fn engine(dir: &tempfile::TempDir, reconstruction: bool) -> DecisionEngine {
    let mut config = Config::default();
    config.storage.db_path = dir.path().join("anomaly.db");
    config.detector.reconstruction_enabled = reconstruction;
    safeops_anomaly::open_engine(&config).await.unwrap()
}

/// A run that varies a little around a stable baseline.
pub fn baseline_run(pipeline: &str, i: usize) -> RunRecord {
    RunRecord {
        run_id: Some(format!("run-{}", i)),
        duration_sec: Some(120.0 + (i % 7) as f64 * 4.0 - 12.0),
        error_count: Some((i % 2) as i64),
        secrets_count: Some(0),
        urls_count: Some(3 + (i % 3) as i64),
        bypass_count: Some(0),
        steps_count: Some(12 + (i % 4) as i64),
        severity_score: Some(15.0 + (i % 5) as f64 * 2.0),
        ..RunRecord::new(pipeline)
    }
}

pub async fn seed(engine: &DecisionEngine, pipeline: &str, n: usize) {
    for i in 0..n {
        engine.evaluate(baseline_run(pipeline, i)).await.unwrap();
    }
}
