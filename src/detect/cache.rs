//! Per-pipeline cache of trained models.
//!
//! Entries expire after a TTL and the number of resident pipelines is capped;
//! when over the cap, the entries trained longest ago are evicted first.
//! `get_or_train` holds a per-pipeline lock across check, train and install,
//! so concurrent requests for one pipeline train at most once while other
//! pipelines proceed independently.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::config::DetectorConfig;
use crate::detect::features::{FeatureVector, FEATURE_SCHEMA_VERSION};
use crate::detect::training::{TrainedModels, Trainer, TrainingPool};
use crate::detect::DetectError;

/// A trained model set and when it was trained. Replaced whole, never edited.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub models: Arc<TrainedModels>,
    pub trained_at: Instant,
    pub feature_version: u32,
}

/// What `get_or_train` hands back.
#[derive(Debug, Clone)]
pub struct CacheLookup {
    pub models: Arc<TrainedModels>,
    pub reused: bool,
    /// Age of the returned models at lookup time.
    pub age: Duration,
}

pub struct ModelCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    train_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    trainer: Arc<Trainer>,
    pool: TrainingPool,
    ttl: Duration,
    max_entries: usize,
}

impl ModelCache {
    pub fn new(trainer: Trainer, pool: TrainingPool, ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            train_locks: Mutex::new(HashMap::new()),
            trainer: Arc::new(trainer),
            pool,
            ttl,
            max_entries: max_entries.max(1),
        }
    }

    pub fn from_config(config: &DetectorConfig) -> Self {
        Self::new(
            Trainer::from_config(config),
            TrainingPool::new(config.training_workers, config.training_timeout()),
            config.cache_ttl(),
            config.max_cached_pipelines,
        )
    }

    pub fn reconstruction_enabled(&self) -> bool {
        self.trainer.reconstruction_enabled()
    }

    /// Return the pipeline's models if fresh, otherwise train from `history`
    /// and install the result.
    pub async fn get_or_train(
        &self,
        pipeline_id: &str,
        history: Vec<FeatureVector>,
    ) -> Result<CacheLookup, DetectError> {
        let lock = self.pipeline_lock(pipeline_id).await;
        let _guard = lock.lock().await;

        self.garbage_collect().await;
        if let Some(hit) = self.lookup_fresh(pipeline_id, Instant::now()).await {
            debug!(pipeline = %pipeline_id, age_secs = hit.age.as_secs(), "reusing cached models");
            return Ok(hit);
        }

        info!(pipeline = %pipeline_id, rows = history.len(), "training models");
        let models = Arc::new(
            self.pool
                .train(pipeline_id, self.trainer.clone(), history)
                .await?,
        );
        self.install(pipeline_id, models.clone(), Instant::now()).await;
        self.garbage_collect().await;

        Ok(CacheLookup {
            models,
            reused: false,
            age: Duration::ZERO,
        })
    }

    /// The entry for `pipeline_id` if it is no older than the TTL at `now`
    /// and was trained against the current feature order.
    pub async fn lookup_fresh(&self, pipeline_id: &str, now: Instant) -> Option<CacheLookup> {
        let entries = self.entries.read().await;
        let entry = entries.get(pipeline_id)?;
        if !self.is_fresh(entry, now) {
            return None;
        }
        Some(CacheLookup {
            models: entry.models.clone(),
            reused: true,
            age: now.saturating_duration_since(entry.trained_at),
        })
    }

    pub async fn install(&self, pipeline_id: &str, models: Arc<TrainedModels>, trained_at: Instant) {
        let entry = CacheEntry {
            models,
            trained_at,
            feature_version: FEATURE_SCHEMA_VERSION,
        };
        self.entries
            .write()
            .await
            .insert(pipeline_id.to_string(), entry);
    }

    pub async fn garbage_collect(&self) -> usize {
        self.garbage_collect_at(Instant::now()).await
    }

    /// Drop expired entries, then evict the oldest-trained entries until the
    /// resident count is within bounds. Returns how many entries were removed.
    pub async fn garbage_collect_at(&self, now: Instant) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();

        entries.retain(|_, entry| self.is_fresh(entry, now));
        let expired = before - entries.len();

        let mut evicted = 0;
        if entries.len() > self.max_entries {
            let mut by_age: Vec<(String, Instant)> = entries
                .iter()
                .map(|(id, entry)| (id.clone(), entry.trained_at))
                .collect();
            by_age.sort_by_key(|(_, trained_at)| *trained_at);

            let excess = entries.len() - self.max_entries;
            for (id, _) in by_age.into_iter().take(excess) {
                entries.remove(&id);
                evicted += 1;
            }
        }

        if expired + evicted > 0 {
            debug!(expired, evicted, resident = entries.len(), "model cache collected");
        }

        // Lock handles are only worth keeping for resident or busy pipelines.
        let mut locks = self.train_locks.lock().await;
        locks.retain(|id, lock| entries.contains_key(id) || Arc::strong_count(lock) > 1);

        expired + evicted
    }

    /// Remove every entry. Returns how many were dropped.
    pub async fn reset(&self) -> usize {
        let mut entries = self.entries.write().await;
        let dropped = entries.len();
        entries.clear();
        info!(dropped, "model cache reset");
        dropped
    }

    /// Number of resident pipelines, after dropping expired entries.
    pub async fn len(&self) -> usize {
        self.garbage_collect().await;
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Resident pipelines with the age of their models, oldest first.
    pub async fn snapshot(&self) -> Vec<(String, Duration)> {
        self.garbage_collect().await;
        let now = Instant::now();
        let entries = self.entries.read().await;
        let mut out: Vec<(String, Duration)> = entries
            .iter()
            .map(|(id, entry)| (id.clone(), now.saturating_duration_since(entry.trained_at)))
            .collect();
        out.sort_by(|a, b| b.1.cmp(&a.1));
        out
    }

    fn is_fresh(&self, entry: &CacheEntry, now: Instant) -> bool {
        entry.feature_version == FEATURE_SCHEMA_VERSION
            && now.saturating_duration_since(entry.trained_at) <= self.ttl
    }

    async fn pipeline_lock(&self, pipeline_id: &str) -> Arc<Mutex<()>> {
        self.train_locks
            .lock()
            .await
            .entry(pipeline_id.to_string())
            .or_default()
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::isolation::IsolationParams;

    fn history(n: usize) -> Vec<FeatureVector> {
        (0..n)
            .map(|i| [40.0 + (i % 6) as f64, (i % 2) as f64, 0.0, 2.0, 0.0, 6.0, 15.0])
            .collect()
    }

    fn cache(ttl: Duration, max_entries: usize) -> ModelCache {
        let trainer = Trainer::new(
            IsolationParams {
                n_trees: 25,
                ..IsolationParams::default()
            },
            None,
        );
        ModelCache::new(trainer, TrainingPool::new(2, None), ttl, max_entries)
    }

    async fn some_models(cache: &ModelCache) -> Arc<TrainedModels> {
        Arc::new(cache.trainer.train(&history(12)).unwrap())
    }

    #[tokio::test]
    async fn test_fresh_entry_is_reused() {
        let cache = cache(Duration::from_secs(300), 10);

        let first = cache.get_or_train("build", history(12)).await.unwrap();
        assert!(!first.reused);

        let second = cache.get_or_train("build", history(12)).await.unwrap();
        assert!(second.reused);
        assert!(Arc::ptr_eq(&first.models, &second.models));
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_expired_entry_is_never_returned() {
        let ttl = Duration::from_secs(300);
        let cache = cache(ttl, 10);
        let trained_at = Instant::now();
        cache.install("build", some_models(&cache).await, trained_at).await;

        assert!(cache.lookup_fresh("build", trained_at + ttl).await.is_some());
        let later = trained_at + ttl + Duration::from_secs(1);
        assert!(cache.lookup_fresh("build", later).await.is_none());

        assert_eq!(cache.garbage_collect_at(later).await, 1);
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_len_drops_expired_entries() {
        let cache = cache(Duration::from_millis(50), 10);
        cache.get_or_train("build", history(12)).await.unwrap();
        assert_eq!(cache.len().await, 1);

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(cache.len().await, 0);
        assert!(cache.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_stale_entry_is_retrained() {
        let cache = cache(Duration::ZERO, 10);
        let first = cache.get_or_train("build", history(12)).await.unwrap();
        let second = cache.get_or_train("build", history(12)).await.unwrap();
        assert!(!first.reused);
        assert!(!second.reused);
        assert!(!Arc::ptr_eq(&first.models, &second.models));
    }

    #[tokio::test]
    async fn test_capacity_evicts_oldest_trained_first() {
        let cache = cache(Duration::from_secs(300), 3);
        let models = some_models(&cache).await;
        let base = Instant::now();
        for i in 0..5u64 {
            cache
                .install(&format!("p{}", i), models.clone(), base + Duration::from_secs(i))
                .await;
        }

        let removed = cache.garbage_collect_at(base + Duration::from_secs(5)).await;
        assert_eq!(removed, 2);
        assert_eq!(cache.len().await, 3);

        let now = base + Duration::from_secs(5);
        assert!(cache.lookup_fresh("p0", now).await.is_none());
        assert!(cache.lookup_fresh("p1", now).await.is_none());
        for id in ["p2", "p3", "p4"] {
            assert!(cache.lookup_fresh(id, now).await.is_some(), "{} evicted", id);
        }
    }

    #[tokio::test]
    async fn test_ttl_eviction_runs_before_capacity() {
        let ttl = Duration::from_secs(10);
        let cache = cache(ttl, 2);
        let models = some_models(&cache).await;
        let base = Instant::now();
        cache.install("old", models.clone(), base).await;
        cache.install("a", models.clone(), base + Duration::from_secs(20)).await;
        cache.install("b", models.clone(), base + Duration::from_secs(21)).await;

        // "old" expires; the other two fit without capacity eviction.
        let removed = cache.garbage_collect_at(base + Duration::from_secs(25)).await;
        assert_eq!(removed, 1);
        assert_eq!(cache.len().await, 2);
    }

    #[tokio::test]
    async fn test_size_bound_holds_after_training() {
        let cache = cache(Duration::from_secs(300), 2);
        for id in ["a", "b", "c", "d"] {
            cache.get_or_train(id, history(12)).await.unwrap();
            assert!(cache.len().await <= 2);
        }
        let resident: Vec<String> = cache.snapshot().await.into_iter().map(|(id, _)| id).collect();
        assert!(resident.contains(&"d".to_string()));
    }

    #[tokio::test]
    async fn test_reset_forces_retrain() {
        let cache = cache(Duration::from_secs(300), 10);
        cache.get_or_train("build", history(12)).await.unwrap();
        assert_eq!(cache.reset().await, 1);
        assert!(cache.is_empty().await);

        let after = cache.get_or_train("build", history(12)).await.unwrap();
        assert!(!after.reused);
    }

    #[tokio::test]
    async fn test_other_feature_version_is_stale() {
        let cache = cache(Duration::from_secs(300), 10);
        let now = Instant::now();
        cache.entries.write().await.insert(
            "build".to_string(),
            CacheEntry {
                models: some_models(&cache).await,
                trained_at: now,
                feature_version: FEATURE_SCHEMA_VERSION + 1,
            },
        );
        assert!(cache.lookup_fresh("build", now).await.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_requests_train_once() {
        let cache = Arc::new(cache(Duration::from_secs(300), 10));
        let handles: Vec<_> = (0..6)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.get_or_train("build", history(12)).await })
            })
            .collect();

        let mut trained = 0;
        for handle in handles {
            if !handle.await.unwrap().unwrap().reused {
                trained += 1;
            }
        }
        assert_eq!(trained, 1);
    }
}
