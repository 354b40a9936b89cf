//! Engine configuration.
//!
//! Every tunable of the tiered memory engine lives in [`EngineConfig`]:
//! sensible defaults, chained `with_*` setters, and `MNEMONIC_*` environment
//! overrides via [`EngineConfig::from_env`].

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

/// Default location of the durable cold store.
pub const DEFAULT_COLD_STORE_PATH: &str = "~/.mnemonic/cold.db";
/// Default location of the warm index snapshot.
pub const DEFAULT_WARM_SNAPSHOT_PATH: &str = "~/.mnemonic/warm.json";
/// Default embedding dimension (matches [`crate::embedding::HashEmbedder`]).
pub const DEFAULT_EMBEDDING_DIM: usize = 128;
/// Longest accepted retention, demotion or eviction window.
pub const MAX_WINDOW_DAYS: i64 = 100 * 365;

/// Configuration for [`crate::MemoryEngine`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Path of the SQLite cold store. `:memory:` opens an in-memory database.
    pub cold_store_path: String,
    /// Path of the warm index snapshot. `None` disables warm persistence.
    pub warm_snapshot_path: Option<String>,
    /// Dimension every stored vector must have
    pub embedding_dim: usize,
    /// Minimum cosine similarity for a warm match
    pub similarity_threshold: f32,
    /// Best warm similarity below this falls through to the cold store
    pub warm_confidence_floor: f32,
    /// Maximum number of warm vector entries
    pub warm_tier_limit: usize,
    /// Characters kept in a vector entry's content preview
    pub preview_chars: usize,
    /// TTL applied to hot cache writes
    pub hot_ttl_secs: u64,
    /// Accesses needed for Cold -> Warm (twice this for Warm -> Hot)
    pub promotion_threshold: u64,
    /// Idle days before Warm -> Cold
    pub demotion_days: i64,
    /// Idle seconds before Hot -> Warm
    pub hot_idle_secs: i64,
    /// Age in days after which unimportant cold records are purged
    pub retention_days: i64,
    /// Records with importance below this are eligible for purging
    pub cleanup_importance_floor: f64,
    /// Process memory ratio that triggers emergency warm eviction
    pub memory_pressure_threshold: f64,
    /// Age of warm entries discarded under memory pressure
    pub pressure_eviction_age_days: i64,
    /// Tier sweep period
    pub sweep_interval: Duration,
    /// Memory pressure sampling period
    pub pressure_interval: Duration,
    /// Periodic warm snapshot period
    pub snapshot_interval: Duration,
    /// Cold store cleanup + vacuum period
    pub cleanup_interval: Duration,
    /// Dirty warm inserts that schedule a snapshot
    pub snapshot_batch_size: usize,
    /// Capacity of the snapshot work queue
    pub snapshot_queue_capacity: usize,
    /// Whether [`crate::MemoryEngineBuilder::build`] spawns the periodic jobs
    pub background_jobs: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cold_store_path: DEFAULT_COLD_STORE_PATH.to_string(),
            warm_snapshot_path: Some(DEFAULT_WARM_SNAPSHOT_PATH.to_string()),
            embedding_dim: DEFAULT_EMBEDDING_DIM,
            similarity_threshold: 0.5,
            warm_confidence_floor: 0.75,
            warm_tier_limit: 10_000,
            preview_chars: 200,
            hot_ttl_secs: 3600,
            promotion_threshold: 5,
            demotion_days: 7,
            hot_idle_secs: 3600,
            retention_days: 30,
            cleanup_importance_floor: 0.3,
            memory_pressure_threshold: 0.85,
            pressure_eviction_age_days: 7,
            sweep_interval: Duration::from_secs(5 * 60),
            pressure_interval: Duration::from_secs(5 * 60),
            snapshot_interval: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(60 * 60),
            snapshot_batch_size: 100,
            snapshot_queue_capacity: 16,
            background_jobs: true,
        }
    }
}

impl EngineConfig {
    /// Configuration backed entirely by memory: in-memory SQLite, no snapshot
    /// file, no background jobs. Intended for tests and ephemeral agents.
    pub fn ephemeral() -> Self {
        Self {
            cold_store_path: ":memory:".to_string(),
            warm_snapshot_path: None,
            background_jobs: false,
            ..Self::default()
        }
    }

    /// Create configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("MNEMONIC_COLD_PATH") {
            config.cold_store_path = path;
        }
        if let Ok(path) = std::env::var("MNEMONIC_WARM_PATH") {
            config.warm_snapshot_path = match path.trim() {
                "" | "none" => None,
                p => Some(p.to_string()),
            };
        }

        config.embedding_dim = env_parse("MNEMONIC_EMBED_DIM").unwrap_or(config.embedding_dim);
        config.similarity_threshold =
            env_parse("MNEMONIC_SIMILARITY_THRESHOLD").unwrap_or(config.similarity_threshold);
        config.warm_confidence_floor =
            env_parse("MNEMONIC_WARM_CONFIDENCE").unwrap_or(config.warm_confidence_floor);
        config.warm_tier_limit = env_parse("MNEMONIC_WARM_LIMIT").unwrap_or(config.warm_tier_limit);
        config.hot_ttl_secs = env_parse("MNEMONIC_HOT_TTL").unwrap_or(config.hot_ttl_secs);
        config.promotion_threshold =
            env_parse("MNEMONIC_PROMOTION_THRESHOLD").unwrap_or(config.promotion_threshold);
        config.demotion_days = env_parse("MNEMONIC_DEMOTION_DAYS").unwrap_or(config.demotion_days);
        config.retention_days =
            env_parse("MNEMONIC_RETENTION_DAYS").unwrap_or(config.retention_days);
        config.memory_pressure_threshold = env_parse("MNEMONIC_PRESSURE_THRESHOLD")
            .unwrap_or(config.memory_pressure_threshold);

        if let Some(secs) = env_parse::<u64>("MNEMONIC_SWEEP_SECS") {
            config.sweep_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("MNEMONIC_PRESSURE_SECS") {
            config.pressure_interval = Duration::from_secs(secs);
        }

        config
    }

    pub fn with_cold_store_path(mut self, path: impl Into<String>) -> Self {
        self.cold_store_path = path.into();
        self
    }

    pub fn with_warm_snapshot_path(mut self, path: impl Into<String>) -> Self {
        self.warm_snapshot_path = Some(path.into());
        self
    }

    pub fn without_warm_snapshot(mut self) -> Self {
        self.warm_snapshot_path = None;
        self
    }

    pub fn with_embedding_dim(mut self, dim: usize) -> Self {
        self.embedding_dim = dim;
        self
    }

    pub fn with_similarity_threshold(mut self, threshold: f32) -> Self {
        self.similarity_threshold = threshold;
        self
    }

    pub fn with_warm_confidence_floor(mut self, floor: f32) -> Self {
        self.warm_confidence_floor = floor;
        self
    }

    pub fn with_warm_tier_limit(mut self, limit: usize) -> Self {
        self.warm_tier_limit = limit;
        self
    }

    pub fn with_hot_ttl_secs(mut self, secs: u64) -> Self {
        self.hot_ttl_secs = secs;
        self
    }

    pub fn with_promotion_threshold(mut self, threshold: u64) -> Self {
        self.promotion_threshold = threshold;
        self
    }

    pub fn with_demotion_days(mut self, days: i64) -> Self {
        self.demotion_days = days;
        self
    }

    pub fn with_retention_days(mut self, days: i64) -> Self {
        self.retention_days = days;
        self
    }

    pub fn with_memory_pressure_threshold(mut self, threshold: f64) -> Self {
        self.memory_pressure_threshold = threshold;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_pressure_interval(mut self, interval: Duration) -> Self {
        self.pressure_interval = interval;
        self
    }

    pub fn with_snapshot_batch_size(mut self, size: usize) -> Self {
        self.snapshot_batch_size = size;
        self
    }

    pub fn with_background_jobs(mut self, enabled: bool) -> Self {
        self.background_jobs = enabled;
        self
    }

    /// Check the configuration, returning the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.cold_store_path.trim().is_empty() {
            return Err(Error::config("cold_store_path must not be empty"));
        }
        if let Some(path) = &self.warm_snapshot_path {
            if path.trim().is_empty() {
                return Err(Error::config("warm_snapshot_path must not be empty when set"));
            }
        }
        if self.embedding_dim == 0 {
            return Err(Error::config("embedding_dim must be positive"));
        }
        for (name, value) in [
            ("similarity_threshold", self.similarity_threshold as f64),
            ("warm_confidence_floor", self.warm_confidence_floor as f64),
            ("cleanup_importance_floor", self.cleanup_importance_floor),
            ("memory_pressure_threshold", self.memory_pressure_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::config(format!(
                    "{} must be within [0, 1], got {}",
                    name, value
                )));
            }
        }
        for (name, days) in [
            ("demotion_days", self.demotion_days),
            ("retention_days", self.retention_days),
            ("pressure_eviction_age_days", self.pressure_eviction_age_days),
        ] {
            if !(1..=MAX_WINDOW_DAYS).contains(&days) {
                return Err(Error::config(format!(
                    "{} must be within [1, {}], got {}",
                    name, MAX_WINDOW_DAYS, days
                )));
            }
        }
        if !(1..=MAX_WINDOW_DAYS * 86_400).contains(&self.hot_idle_secs) {
            return Err(Error::config(format!(
                "hot_idle_secs must be within [1, {}], got {}",
                MAX_WINDOW_DAYS * 86_400,
                self.hot_idle_secs
            )));
        }
        if self.warm_tier_limit == 0 {
            return Err(Error::config("warm_tier_limit must be positive"));
        }
        if self.promotion_threshold == 0 {
            return Err(Error::config("promotion_threshold must be positive"));
        }
        if self.snapshot_batch_size == 0 || self.snapshot_queue_capacity == 0 {
            return Err(Error::config("snapshot batch size and queue capacity must be positive"));
        }
        if [
            self.sweep_interval,
            self.pressure_interval,
            self.snapshot_interval,
            self.cleanup_interval,
        ]
        .iter()
        .any(Duration::is_zero)
        {
            return Err(Error::config("background job intervals must be non-zero"));
        }
        Ok(())
    }

    /// Cold store path with `~` and environment variables expanded.
    pub fn resolved_cold_store_path(&self) -> Result<PathBuf> {
        expand_path(&self.cold_store_path)
    }

    /// Warm snapshot path with `~` and environment variables expanded.
    pub fn resolved_warm_snapshot_path(&self) -> Result<Option<PathBuf>> {
        self.warm_snapshot_path
            .as_deref()
            .map(expand_path)
            .transpose()
    }

    /// Whether the cold store should live in memory only.
    pub fn is_in_memory(&self) -> bool {
        self.cold_store_path == ":memory:"
    }
}

fn expand_path(raw: &str) -> Result<PathBuf> {
    shellexpand::full(raw)
        .map(|expanded| PathBuf::from(expanded.as_ref()))
        .map_err(|e| Error::config(format!("cannot expand path {}: {}", raw, e)))
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}
