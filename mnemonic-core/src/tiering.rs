//! Access tracking and tier promotion/demotion policy.
//!
//! [`TierManager`] keeps an [`AccessPattern`] per record id. Patterns are
//! ephemeral: losing them on a crash only costs promotion history, and they
//! are re-seeded from the cold store the next time a record is touched.
//!
//! Transitions are cyclical (Cold -> Warm -> Hot -> Warm -> Cold ...):
//!
//! - Cold -> Warm once `access_count >= promotion_threshold`
//! - Warm -> Hot once `access_count >= 2 * promotion_threshold`
//! - Hot -> Warm after `hot_idle` without access
//! - Warm -> Cold after `demotion_days` without access

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::config::EngineConfig;
use crate::memory::{MemoryId, MemoryRecord, Tier};

/// Thresholds driving tier transitions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TierPolicy {
    pub promotion_threshold: u64,
    pub demotion_after: Duration,
    pub hot_idle: Duration,
}

impl Default for TierPolicy {
    fn default() -> Self {
        Self {
            promotion_threshold: 5,
            demotion_after: Duration::days(7),
            hot_idle: Duration::hours(1),
        }
    }
}

impl TierPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            promotion_threshold: config.promotion_threshold,
            demotion_after: Duration::days(config.demotion_days),
            hot_idle: Duration::seconds(config.hot_idle_secs),
        }
    }
}

/// Per-record access history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessPattern {
    pub access_count: u64,
    pub last_access: DateTime<Utc>,
    pub current_tier: Tier,
    /// Accesses not yet written back to the cold store
    #[serde(skip)]
    pub unsynced: bool,
}

impl AccessPattern {
    pub fn new(tier: Tier) -> Self {
        Self {
            access_count: 0,
            last_access: Utc::now(),
            current_tier: tier,
            unsynced: false,
        }
    }

    /// Seed from the last committed state of a record.
    pub fn from_record(record: &MemoryRecord) -> Self {
        Self {
            access_count: record.access_count,
            last_access: record.accessed_at,
            current_tier: record.tier,
            unsynced: false,
        }
    }
}

/// Direction of a tier change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransitionKind {
    Promotion,
    Demotion,
}

/// A planned tier change for one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierTransition {
    pub id: MemoryId,
    pub from: Tier,
    pub to: Tier,
    pub kind: TransitionKind,
}

/// Tracks access patterns and decides tier moves.
#[derive(Debug, Default)]
pub struct TierManager {
    policy: TierPolicy,
    patterns: HashMap<MemoryId, AccessPattern>,
}

impl TierManager {
    pub fn new(policy: TierPolicy) -> Self {
        Self {
            policy,
            patterns: HashMap::new(),
        }
    }

    pub fn policy(&self) -> &TierPolicy {
        &self.policy
    }

    /// Start tracking `id` unless it is already tracked. Returns whether it was added.
    pub fn track(&mut self, id: MemoryId, pattern: AccessPattern) -> bool {
        if self.patterns.contains_key(&id) {
            return false;
        }
        self.patterns.insert(id, pattern);
        true
    }

    /// Track a record using its committed access state.
    pub fn track_record(&mut self, record: &MemoryRecord) -> bool {
        self.track(record.id.clone(), AccessPattern::from_record(record))
    }

    pub fn untrack(&mut self, id: &MemoryId) -> Option<AccessPattern> {
        self.patterns.remove(id)
    }

    pub fn is_tracked(&self, id: &MemoryId) -> bool {
        self.patterns.contains_key(id)
    }

    pub fn pattern(&self, id: &MemoryId) -> Option<&AccessPattern> {
        self.patterns.get(id)
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Current advisory tier of a tracked id.
    pub fn tier_of(&self, id: &MemoryId) -> Option<Tier> {
        self.patterns.get(id).map(|p| p.current_tier)
    }

    /// Count tracked ids per tier.
    pub fn distribution(&self) -> HashMap<Tier, u64> {
        let mut counts: HashMap<Tier, u64> = Tier::ALL.iter().map(|t| (*t, 0)).collect();
        for pattern in self.patterns.values() {
            *counts.entry(pattern.current_tier).or_insert(0) += 1;
        }
        counts
    }

    /// Register one access now.
    pub fn record_access(&mut self, id: &MemoryId) -> &AccessPattern {
        self.record_access_at(id, Utc::now())
    }

    /// Register one access at `now`. Untracked ids start as Cold.
    pub fn record_access_at(&mut self, id: &MemoryId, now: DateTime<Utc>) -> &AccessPattern {
        let pattern = self
            .patterns
            .entry(id.clone())
            .or_insert_with(|| AccessPattern::new(Tier::Cold));
        pattern.access_count += 1;
        pattern.last_access = now;
        pattern.unsynced = true;
        pattern
    }

    /// Tier `id` qualifies for by access count, if higher than its current one.
    pub fn should_promote(&self, id: &MemoryId) -> Option<Tier> {
        let pattern = self.patterns.get(id)?;
        let threshold = self.policy.promotion_threshold;
        match pattern.current_tier {
            Tier::Cold if pattern.access_count >= threshold => Some(Tier::Warm),
            Tier::Warm if pattern.access_count >= threshold.saturating_mul(2) => Some(Tier::Hot),
            _ => None,
        }
    }

    /// Tier `id` should drop to because it went idle, evaluated now.
    pub fn should_demote(&self, id: &MemoryId) -> Option<Tier> {
        self.should_demote_at(id, Utc::now())
    }

    /// Tier `id` should drop to because it went idle, evaluated at `now`.
    pub fn should_demote_at(&self, id: &MemoryId, now: DateTime<Utc>) -> Option<Tier> {
        let pattern = self.patterns.get(id)?;
        let idle = now - pattern.last_access;
        match pattern.current_tier {
            Tier::Hot if idle > self.policy.hot_idle => Some(Tier::Warm),
            Tier::Warm if idle > self.policy.demotion_after => Some(Tier::Cold),
            _ => None,
        }
    }

    /// Decide at most one transition per tracked id. Idleness wins over
    /// access count, so a stale record is never promoted.
    pub fn plan_sweep(&self, now: DateTime<Utc>) -> Vec<TierTransition> {
        let mut transitions: Vec<TierTransition> = self
            .patterns
            .iter()
            .filter_map(|(id, pattern)| {
                let from = pattern.current_tier;
                if let Some(to) = self.should_demote_at(id, now) {
                    return Some(TierTransition {
                        id: id.clone(),
                        from,
                        to,
                        kind: TransitionKind::Demotion,
                    });
                }
                self.should_promote(id).map(|to| TierTransition {
                    id: id.clone(),
                    from,
                    to,
                    kind: TransitionKind::Promotion,
                })
            })
            .collect();
        transitions.sort_by(|a, b| a.id.cmp(&b.id));
        transitions
    }

    /// Commit a transition to the tracked state.
    pub fn apply(&mut self, transition: &TierTransition) -> bool {
        match self.patterns.get_mut(&transition.id) {
            Some(pattern) if pattern.current_tier == transition.from => {
                pattern.current_tier = transition.to;
                true
            }
            _ => false,
        }
    }

    /// Access statistics awaiting write-back; clears their pending flag.
    pub fn take_unsynced(&mut self) -> Vec<(MemoryId, u64, DateTime<Utc>)> {
        self.patterns
            .iter_mut()
            .filter(|(_, p)| p.unsynced)
            .map(|(id, p)| {
                p.unsynced = false;
                (id.clone(), p.access_count, p.last_access)
            })
            .collect()
    }

    /// Forget cold, synced patterns idle longer than the demotion window.
    /// They are re-seeded from the cold store on their next access.
    pub fn prune_idle(&mut self, now: DateTime<Utc>) -> usize {
        let horizon = self.policy.demotion_after;
        let before = self.patterns.len();
        self.patterns.retain(|_, p| {
            p.current_tier != Tier::Cold || p.unsynced || now - p.last_access <= horizon
        });
        before - self.patterns.len()
    }
}
