//! Memory pressure detection and emergency warm-tier eviction.
//!
//! Pressure eviction is a hard cap, separate from tier demotion: it discards
//! warm vectors outright. The cold copy of every record is untouched.

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::warm::WarmIndex;

/// Source of the process memory usage ratio.
pub trait MemorySampler: Send + Sync {
    /// Used memory as a fraction of the total, in [0, 1].
    fn sample(&self) -> Result<f64>;
}

/// Reads resident set size and total RAM from procfs.
#[derive(Debug, Clone)]
pub struct ProcMemorySampler {
    status_path: PathBuf,
    meminfo_path: PathBuf,
}

impl Default for ProcMemorySampler {
    fn default() -> Self {
        Self {
            status_path: PathBuf::from("/proc/self/status"),
            meminfo_path: PathBuf::from("/proc/meminfo"),
        }
    }
}

impl ProcMemorySampler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read from alternate files with the same layout.
    pub fn with_paths(status_path: impl Into<PathBuf>, meminfo_path: impl Into<PathBuf>) -> Self {
        Self {
            status_path: status_path.into(),
            meminfo_path: meminfo_path.into(),
        }
    }
}

impl MemorySampler for ProcMemorySampler {
    fn sample(&self) -> Result<f64> {
        let status = std::fs::read_to_string(&self.status_path)?;
        let meminfo = std::fs::read_to_string(&self.meminfo_path)?;

        let rss = parse_kb_field(&status, "VmRSS")
            .ok_or_else(|| Error::Internal("VmRSS missing from process status".to_string()))?;
        let total = parse_kb_field(&meminfo, "MemTotal")
            .filter(|t| *t > 0)
            .ok_or_else(|| Error::Internal("MemTotal missing from meminfo".to_string()))?;

        Ok((rss as f64 / total as f64).clamp(0.0, 1.0))
    }
}

/// Value in kB of a `Key:   1234 kB` line.
fn parse_kb_field(text: &str, key: &str) -> Option<u64> {
    text.lines().find_map(|line| {
        let rest = line.strip_prefix(key)?.strip_prefix(':')?;
        rest.split_whitespace().next()?.parse().ok()
    })
}

/// Outcome of one pressure check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PressureReport {
    /// Sampled ratio, `None` when sampling failed
    pub ratio: Option<f64>,
    pub triggered: bool,
    pub evicted: usize,
    pub compressed: usize,
}

/// Samples memory usage and evicts old warm vectors over the threshold.
#[derive(Clone)]
pub struct PressureMonitor {
    sampler: Arc<dyn MemorySampler>,
    threshold: f64,
    eviction_age: Duration,
}

impl PressureMonitor {
    pub fn new(sampler: Arc<dyn MemorySampler>, threshold: f64, eviction_age: Duration) -> Self {
        Self {
            sampler,
            threshold,
            eviction_age,
        }
    }

    pub fn from_config(config: &EngineConfig, sampler: Arc<dyn MemorySampler>) -> Self {
        Self::new(
            sampler,
            config.memory_pressure_threshold,
            Duration::days(config.pressure_eviction_age_days),
        )
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Sample the current ratio. Failures are logged and yield `None`.
    pub fn sample(&self) -> Option<f64> {
        match self.sampler.sample() {
            Ok(ratio) => Some(ratio),
            Err(e) => {
                warn!(error = %e, "Memory pressure sampling unavailable");
                None
            }
        }
    }

    /// Sample once; when over the threshold, evict old warm entries then
    /// collapse duplicates.
    pub async fn check(&self, warm: &RwLock<WarmIndex>) -> PressureReport {
        let Some(ratio) = self.sample() else {
            return PressureReport::default();
        };

        if ratio <= self.threshold {
            debug!(ratio, threshold = self.threshold, "Memory pressure normal");
            return PressureReport {
                ratio: Some(ratio),
                ..PressureReport::default()
            };
        }

        let mut index = warm.write().await;
        let evicted = index.evict_older_than(self.eviction_age, Utc::now());
        let compressed = index.compress_duplicates();
        drop(index);

        info!(
            ratio,
            threshold = self.threshold,
            evicted,
            compressed,
            "Memory pressure eviction"
        );
        PressureReport {
            ratio: Some(ratio),
            triggered: true,
            evicted,
            compressed,
        }
    }
}

impl std::fmt::Debug for PressureMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PressureMonitor")
            .field("threshold", &self.threshold)
            .field("eviction_age", &self.eviction_age)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::memory::MemoryId;
    use std::sync::Mutex;

    /// Sampler returning a settable ratio.
    #[derive(Debug)]
    pub(crate) struct FixedSampler(pub Mutex<Option<f64>>);

    impl FixedSampler {
        pub(crate) fn new(ratio: f64) -> Self {
            Self(Mutex::new(Some(ratio)))
        }

        pub(crate) fn set(&self, ratio: Option<f64>) {
            *self.0.lock().unwrap() = ratio;
        }
    }

    impl MemorySampler for FixedSampler {
        fn sample(&self) -> Result<f64> {
            self.0
                .lock()
                .unwrap()
                .ok_or_else(|| Error::Internal("no sample".to_string()))
        }
    }

    fn aged_index() -> WarmIndex {
        let mut index = WarmIndex::new(2, 100);
        let now = Utc::now();
        for i in 0..3 {
            index
                .insert_at(
                    &MemoryId::from_content(&format!("old{}", i)),
                    vec![1.0, i as f32],
                    "old",
                    now - Duration::days(10),
                )
                .unwrap();
        }
        index
            .insert(&MemoryId::from_content("new"), vec![0.0, 1.0], "new")
            .unwrap();
        index
    }

    #[test]
    fn test_parse_kb_field() {
        let status = "Name:\tcargo\nVmRSS:\t   20480 kB\nThreads:\t4\n";
        assert_eq!(parse_kb_field(status, "VmRSS"), Some(20480));
        assert_eq!(parse_kb_field(status, "VmSwap"), None);
        assert_eq!(parse_kb_field("MemTotal:  8000 kB", "MemTotal"), Some(8000));
    }

    #[test]
    fn test_proc_sampler_reads_files() {
        let dir = tempfile::tempdir().unwrap();
        let status = dir.path().join("status");
        let meminfo = dir.path().join("meminfo");
        std::fs::write(&status, "VmRSS:\t 900 kB\n").unwrap();
        std::fs::write(&meminfo, "MemTotal: 1000 kB\nMemFree: 10 kB\n").unwrap();

        let ratio = ProcMemorySampler::with_paths(&status, &meminfo)
            .sample()
            .unwrap();
        assert!((ratio - 0.9).abs() < 1e-9);

        let missing = ProcMemorySampler::with_paths(dir.path().join("nope"), &meminfo);
        assert!(missing.sample().is_err());
    }

    #[tokio::test]
    async fn test_over_threshold_evicts_exactly_old_entries() {
        let warm = RwLock::new(aged_index());
        let sampler = Arc::new(FixedSampler::new(0.95));
        let monitor = PressureMonitor::new(sampler, 0.85, Duration::days(7));

        let before = warm.read().await.len();
        let report = monitor.check(&warm).await;
        let after = warm.read().await.len();

        assert!(report.triggered);
        assert_eq!(report.evicted, 3);
        assert_eq!(before - after, report.evicted);
    }

    #[tokio::test]
    async fn test_under_threshold_is_noop() {
        let warm = RwLock::new(aged_index());
        let sampler = Arc::new(FixedSampler::new(0.5));
        let monitor = PressureMonitor::new(sampler.clone(), 0.85, Duration::days(7));

        let report = monitor.check(&warm).await;
        assert!(!report.triggered);
        assert_eq!(report.ratio, Some(0.5));
        assert_eq!(warm.read().await.len(), 4);

        sampler.set(None);
        let report = monitor.check(&warm).await;
        assert_eq!(report, PressureReport::default());
    }
}
