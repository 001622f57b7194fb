//! Service configuration.
//!
//! A single `Config` value is built once at process start and handed to the
//! storage layer, the decision engine and the HTTP server. Values come from an
//! optional TOML file, then environment-style overrides, then validation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Environment variable naming a TOML config file.
pub const CONFIG_PATH_ENV: &str = "SAFEOPS_CONFIG";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for the anomaly service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
}

impl Config {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Resolve the configuration for this process:
    /// 1. The explicit `path` (from `--config`), if given.
    /// 2. The path in `SAFEOPS_CONFIG`, if set and readable.
    /// 3. Compiled-in defaults.
    ///
    /// Environment overrides are applied on top and the result is validated.
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::load(p)?,
            None => Self::load_or_default(),
        };
        config.apply_overrides_from(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_PATH_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "SAFEOPS_CONFIG set but file could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    /// Apply environment-style overrides. `lookup` maps a variable name to its
    /// value; production passes `std::env::var`.
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("SAFEOPS_BIND") {
            self.server.bind = v;
        }
        if let Some(v) = lookup("SAFEOPS_DB_PATH") {
            self.storage.db_path = PathBuf::from(v);
        }

        let d = &mut self.detector;
        override_parsed(&lookup, "ANOMALY_CONTAMINATION", &mut d.contamination)?;
        override_parsed(&lookup, "ANOMALY_MIN_HISTORY", &mut d.min_history)?;
        override_parsed(&lookup, "AE_EPOCHS", &mut d.ae_epochs)?;
        override_parsed(&lookup, "AE_BATCH_SIZE", &mut d.ae_batch_size)?;
        override_parsed(&lookup, "MODEL_CACHE_TTL_SEC", &mut d.cache_ttl_secs)?;
        override_parsed(&lookup, "MODEL_CACHE_MAX_PIPELINES", &mut d.max_cached_pipelines)?;

        if let Some(v) = lookup("ENABLE_AUTOENCODER") {
            d.reconstruction_enabled = parse_flag(&v)
                .with_context(|| format!("ENABLE_AUTOENCODER: invalid flag '{}'", v))?;
        }
        Ok(())
    }

    /// Reject values the detector cannot run with.
    pub fn validate(&self) -> Result<()> {
        let d = &self.detector;
        if !(d.contamination > 0.0 && d.contamination <= 0.5) {
            bail!("contamination must be in (0, 0.5], got {}", d.contamination);
        }
        if d.min_history == 0 {
            bail!("min_history must be at least 1");
        }
        if d.history_limit < d.min_history {
            bail!(
                "history_limit ({}) must not be below min_history ({})",
                d.history_limit,
                d.min_history
            );
        }
        if d.ae_batch_size == 0 {
            bail!("ae_batch_size must be at least 1");
        }
        if d.max_cached_pipelines == 0 {
            bail!("max_cached_pipelines must be at least 1");
        }
        if d.training_workers == 0 {
            bail!("training_workers must be at least 1");
        }
        Ok(())
    }
}

fn override_parsed<F, T>(lookup: &F, key: &str, slot: &mut T) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(raw) = lookup(key) {
        *slot = raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("{}: invalid value '{}': {}", key, raw, e))?;
    }
    Ok(())
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address and port for the HTTP listener.
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8003".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// Run-history and report store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database file.
    pub db_path: PathBuf,
    /// Attempts to open the store at startup before giving up.
    pub connect_retries: u32,
    /// Fixed delay between startup attempts (milliseconds).
    pub retry_backoff_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/safeops_anomaly.db"),
            connect_retries: 5,
            retry_backoff_ms: 2000,
        }
    }
}

impl StorageConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

// ---------------------------------------------------------------------------
// Detector
// ---------------------------------------------------------------------------

/// Scoring, training and model-cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Expected share of anomalous runs in a pipeline's history.
    pub contamination: f64,
    /// Below this many historical runs the fallback rule decides.
    pub min_history: usize,
    /// Most recent runs fetched per scoring request.
    pub history_limit: usize,
    /// Whether the reconstruction (autoencoder) estimator is trained.
    pub reconstruction_enabled: bool,
    pub ae_epochs: usize,
    pub ae_batch_size: usize,
    /// Historical points used to derive the reconstruction threshold.
    pub threshold_sample: usize,
    /// Seconds before a trained model is considered stale.
    pub cache_ttl_secs: u64,
    /// Maximum number of pipelines with a resident trained model.
    pub max_cached_pipelines: usize,
    /// Concurrent trainings allowed on the blocking pool.
    pub training_workers: usize,
    /// Upper bound on a single training; 0 disables the limit.
    pub training_timeout_secs: u64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            contamination: 0.05,
            min_history: 10,
            history_limit: 500,
            reconstruction_enabled: true,
            ae_epochs: 10,
            ae_batch_size: 16,
            threshold_sample: 200,
            cache_ttl_secs: 300,
            max_cached_pipelines: 50,
            training_workers: 2,
            training_timeout_secs: 120,
        }
    }
}

impl DetectorConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn training_timeout(&self) -> Option<Duration> {
        (self.training_timeout_secs > 0).then(|| Duration::from_secs(self.training_timeout_secs))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.server.bind, "0.0.0.0:8003");
        assert_eq!(cfg.storage.connect_retries, 5);
        assert_eq!(cfg.detector.contamination, 0.05);
        assert_eq!(cfg.detector.min_history, 10);
        assert_eq!(cfg.detector.history_limit, 500);
        assert_eq!(cfg.detector.ae_epochs, 10);
        assert_eq!(cfg.detector.ae_batch_size, 16);
        assert_eq!(cfg.detector.threshold_sample, 200);
        assert_eq!(cfg.detector.cache_ttl(), Duration::from_secs(300));
        assert_eq!(cfg.detector.max_cached_pipelines, 50);
        assert!(cfg.detector.reconstruction_enabled);
        cfg.validate().unwrap();
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let cfg: Config = toml::from_str(
            r#"
[detector]
min_history = 25
reconstruction_enabled = false
"#,
        )
        .unwrap();

        assert_eq!(cfg.detector.min_history, 25);
        assert!(!cfg.detector.reconstruction_enabled);
        assert_eq!(cfg.detector.cache_ttl_secs, 300);
        assert_eq!(cfg.server.bind, "0.0.0.0:8003");
    }

    #[test]
    fn test_env_overrides() {
        let mut cfg = Config::default();
        cfg.apply_overrides_from(lookup_from(&[
            ("ANOMALY_CONTAMINATION", "0.1"),
            ("ANOMALY_MIN_HISTORY", "20"),
            ("MODEL_CACHE_TTL_SEC", "60"),
            ("MODEL_CACHE_MAX_PIPELINES", "5"),
            ("ENABLE_AUTOENCODER", "false"),
            ("SAFEOPS_DB_PATH", "/tmp/x.db"),
        ]))
        .unwrap();

        assert_eq!(cfg.detector.contamination, 0.1);
        assert_eq!(cfg.detector.min_history, 20);
        assert_eq!(cfg.detector.cache_ttl_secs, 60);
        assert_eq!(cfg.detector.max_cached_pipelines, 5);
        assert!(!cfg.detector.reconstruction_enabled);
        assert_eq!(cfg.storage.db_path, PathBuf::from("/tmp/x.db"));
    }

    #[test]
    fn test_invalid_override_errors() {
        let mut cfg = Config::default();
        let result = cfg.apply_overrides_from(lookup_from(&[("AE_EPOCHS", "ten")]));
        assert!(result.is_err());

        let result = cfg.apply_overrides_from(lookup_from(&[("ENABLE_AUTOENCODER", "maybe")]));
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut cfg = Config::default();
        cfg.detector.contamination = 0.0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.detector.max_cached_pipelines = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.detector.history_limit = 5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("anomaly.toml");
        std::fs::write(
            &path,
            r#"
[server]
bind = "127.0.0.1:9999"
"#,
        )
        .unwrap();

        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.server.bind, "127.0.0.1:9999");
    }

    #[test]
    fn test_zero_timeout_disables_limit() {
        let mut cfg = DetectorConfig::default();
        assert_eq!(cfg.training_timeout(), Some(Duration::from_secs(120)));
        cfg.training_timeout_secs = 0;
        assert_eq!(cfg.training_timeout(), None);
    }
}
