//! Per-tier counters.
//!
//! Counters are monotonic and live for the lifetime of the process.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::memory::Tier;

/// Hit/miss/store/eviction counters for one tier.
#[derive(Debug, Default)]
pub struct TierMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    stores: AtomicU64,
    evictions: AtomicU64,
}

impl TierMetrics {
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_store(&self) {
        self.stores.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_evictions(&self, count: u64) {
        if count > 0 {
            self.evictions.fetch_add(count, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> TierMetricsSnapshot {
        TierMetricsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            stores: self.stores.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`TierMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierMetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub stores: u64,
    pub evictions: u64,
}

/// Counters for the whole engine.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    pub hot: TierMetrics,
    pub warm: TierMetrics,
    pub cold: TierMetrics,
    promotions: AtomicU64,
    demotions: AtomicU64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tier(&self, tier: Tier) -> &TierMetrics {
        match tier {
            Tier::Hot => &self.hot,
            Tier::Warm => &self.warm,
            Tier::Cold => &self.cold,
        }
    }

    pub fn record_promotion(&self) {
        self.promotions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_demotion(&self) {
        self.demotions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            tiers: TiersSnapshot {
                hot: self.hot.snapshot(),
                warm: self.warm.snapshot(),
                cold: self.cold.snapshot(),
            },
            promotions: self.promotions.load(Ordering::Relaxed),
            demotions: self.demotions.load(Ordering::Relaxed),
        }
    }
}

/// Per-tier snapshots, keyed the way they are reported.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TiersSnapshot {
    pub hot: TierMetricsSnapshot,
    pub warm: TierMetricsSnapshot,
    pub cold: TierMetricsSnapshot,
}

/// Point-in-time copy of [`EngineMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub tiers: TiersSnapshot,
    pub promotions: u64,
    pub demotions: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_counters_accumulate() {
        let metrics = EngineMetrics::new();
        metrics.hot.record_hit();
        metrics.hot.record_hit();
        metrics.tier(Tier::Warm).record_miss();
        metrics.cold.record_store();
        metrics.warm.record_evictions(3);
        metrics.warm.record_evictions(0);
        metrics.record_promotion();
        metrics.record_demotion();
        metrics.record_demotion();

        let snap = metrics.snapshot();
        assert_eq!(snap.tiers.hot.hits, 2);
        assert_eq!(snap.tiers.warm.misses, 1);
        assert_eq!(snap.tiers.cold.stores, 1);
        assert_eq!(snap.tiers.warm.evictions, 3);
        assert_eq!(snap.promotions, 1);
        assert_eq!(snap.demotions, 2);
    }

    #[test]
    fn test_snapshot_serializes_by_tier_name() {
        let metrics = EngineMetrics::new();
        metrics.hot.record_hit();
        let value = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(value["tiers"]["hot"]["hits"], 1);
        assert_eq!(value["tiers"]["cold"]["evictions"], 0);
    }
}
