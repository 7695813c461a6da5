//! Router Metrics
//!
//! Counters for selection outcomes: how often the first preference was
//! served, how often selection fell to a later tier, exhausted the fleet or
//! ended on the local fallback, and which peers and models were chosen.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;

// ============================================================================
// Counter
// ============================================================================

/// A simple atomic counter
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Router Stats
// ============================================================================

/// Centralized selection counters for the router
#[derive(Debug)]
pub struct RouterStats {
    /// Successful fleet selections
    pub selections: Counter,
    /// Selections served by the first preference
    pub first_tier_hits: Counter,
    /// Selections served by a later preference
    pub later_tier_hits: Counter,
    /// Selections that exhausted every tier
    pub exhaustions: Counter,
    /// Selections that could not run (empty preference list)
    pub system_errors: Counter,
    /// Results replaced by the local fallback
    pub fallbacks: Counter,

    /// Selections per model
    per_model: DashMap<String, u64>,
    /// Selections per peer
    per_peer: DashMap<String, u64>,

    /// When stats collection started
    started_at: Instant,
}

impl Default for RouterStats {
    fn default() -> Self {
        Self::new()
    }
}

impl RouterStats {
    /// Create new stats collector
    #[must_use]
    pub fn new() -> Self {
        Self {
            selections: Counter::new(),
            first_tier_hits: Counter::new(),
            later_tier_hits: Counter::new(),
            exhaustions: Counter::new(),
            system_errors: Counter::new(),
            fallbacks: Counter::new(),
            per_model: DashMap::new(),
            per_peer: DashMap::new(),
            started_at: Instant::now(),
        }
    }

    /// Record a fleet selection served at `tier` (0 = first preference)
    pub fn record_selection(&self, peer_id: &str, model_id: &str, tier: usize) {
        self.selections.inc();
        if tier == 0 {
            self.first_tier_hits.inc();
        } else {
            self.later_tier_hits.inc();
        }
        *self.per_model.entry(model_id.to_string()).or_insert(0) += 1;
        *self.per_peer.entry(peer_id.to_string()).or_insert(0) += 1;
    }

    /// Time since stats collection started
    #[must_use]
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Point-in-time copy of every counter
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            selections: self.selections.get(),
            first_tier_hits: self.first_tier_hits.get(),
            later_tier_hits: self.later_tier_hits.get(),
            exhaustions: self.exhaustions.get(),
            system_errors: self.system_errors.get(),
            fallbacks: self.fallbacks.get(),
            per_model: self
                .per_model
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
            per_peer: self
                .per_peer
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
            uptime_secs: self.uptime().as_secs(),
        }
    }
}

/// Serializable view of [`RouterStats`]
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Successful fleet selections
    pub selections: u64,
    /// Selections served by the first preference
    pub first_tier_hits: u64,
    /// Selections served by a later preference
    pub later_tier_hits: u64,
    /// Selections that exhausted every tier
    pub exhaustions: u64,
    /// Selections that could not run
    pub system_errors: u64,
    /// Results replaced by the local fallback
    pub fallbacks: u64,
    /// Selections per model
    pub per_model: BTreeMap<String, u64>,
    /// Selections per peer
    pub per_peer: BTreeMap<String, u64>,
    /// Seconds since stats collection started
    pub uptime_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_selection_tiers() {
        let stats = RouterStats::new();
        stats.record_selection("nodeA", "codellama:13b", 0);
        stats.record_selection("nodeB", "llama3.1:8b", 1);
        stats.record_selection("nodeB", "llama3.1:8b", 2);
        stats.exhaustions.inc();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.selections, 3);
        assert_eq!(snapshot.first_tier_hits, 1);
        assert_eq!(snapshot.later_tier_hits, 2);
        assert_eq!(snapshot.exhaustions, 1);
        assert_eq!(snapshot.per_model["llama3.1:8b"], 2);
        assert_eq!(snapshot.per_peer["nodeA"], 1);
    }

    #[test]
    fn test_snapshot_serializes() {
        let stats = RouterStats::new();
        stats.fallbacks.inc();
        let json = serde_json::to_value(stats.snapshot()).unwrap();
        assert_eq!(json["fallbacks"], 1);
    }
}
