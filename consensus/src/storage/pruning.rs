/// Pruning logic for storage management
///
/// Implements configurable retention policies for the cycle chain. The
/// chain head is never pruned.

use crate::storage::{CycleStore, Result};
use serde::Deserialize;
use tracing::debug;

/// Pruning configuration
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct PruningConfig {
    /// Retention policy
    pub policy: RetentionPolicy,

    /// Upper bound on deletions per pass, so a boundary never stalls on a
    /// large backlog
    pub max_per_pass: usize,
}

impl Default for PruningConfig {
    fn default() -> Self {
        Self {
            policy: RetentionPolicy::KeepRecent(100),
            max_per_pass: 64,
        }
    }
}

/// Retention policy determines how many cycles to keep
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionPolicy {
    /// Keep every cycle (never prune)
    KeepAll,

    /// Keep the last N cycles
    KeepRecent(u64),

    /// Keep cycles from a specific counter on
    KeepAfterCounter(u64),
}

/// Pruner manages storage pruning based on configuration
pub struct Pruner {
    config: PruningConfig,
}

impl Pruner {
    /// Create a new pruner with the given configuration
    pub fn new(config: PruningConfig) -> Self {
        Self { config }
    }

    /// Keep the last N cycles means: at head H, keep cycles (H-N+1)..=H
    pub fn should_prune(&self, counter: u64, head: u64) -> bool {
        if counter >= head {
            return false;
        }
        match self.config.policy {
            RetentionPolicy::KeepAll => false,
            RetentionPolicy::KeepRecent(n) => {
                if n == 0 || head < n {
                    false
                } else {
                    counter <= head - n
                }
            }
            RetentionPolicy::KeepAfterCounter(min) => counter < min,
        }
    }

    /// Delete cycles outside the retention window
    pub fn prune(&self, store: &dyn CycleStore, head: u64) -> Result<PruneStats> {
        let mut stats = PruneStats::default();

        if matches!(self.config.policy, RetentionPolicy::KeepAll) {
            return Ok(stats);
        }

        let doomed: Vec<u64> = store
            .counters()?
            .into_iter()
            .filter(|&counter| self.should_prune(counter, head))
            .take(self.config.max_per_pass)
            .collect();

        for counter in doomed {
            store.delete_cycle(counter)?;
            stats.cycles_pruned += 1;
        }

        if stats.cycles_pruned > 0 {
            debug!(head, pruned = stats.cycles_pruned, "pruned old cycles");
        }
        Ok(stats)
    }
}

/// Statistics from pruning operation
#[derive(Default, Debug, Clone)]
pub struct PruneStats {
    pub cycles_pruned: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cycle::CycleRecord;
    use crate::storage::{MemoryStore, StoredCycle};

    fn fill(store: &MemoryStore, count: u64) {
        for counter in 0..count {
            let mut record = CycleRecord::genesis("net", 0, 60, vec![]);
            record.counter = counter;
            store.add_cycle(&StoredCycle::provisional(record)).unwrap();
        }
    }

    #[test]
    fn test_pruning_config_default() {
        let config = PruningConfig::default();
        assert_eq!(config.policy, RetentionPolicy::KeepRecent(100));
    }

    #[test]
    fn test_pruning_config_from_json() {
        let config: PruningConfig = serde_json::from_str(r#"{"policy": {"keep_recent": 5}}"#).unwrap();
        assert_eq!(config.policy, RetentionPolicy::KeepRecent(5));

        let config: PruningConfig = serde_json::from_str(r#"{"policy": "keep_all"}"#).unwrap();
        assert_eq!(config.policy, RetentionPolicy::KeepAll);
    }

    #[test]
    fn test_should_prune_keep_all() {
        let pruner = Pruner::new(PruningConfig {
            policy: RetentionPolicy::KeepAll,
            ..PruningConfig::default()
        });

        assert!(!pruner.should_prune(0, 1000));
        assert!(!pruner.should_prune(500, 1000));
    }

    #[test]
    fn test_should_prune_keep_recent() {
        let pruner = Pruner::new(PruningConfig {
            policy: RetentionPolicy::KeepRecent(100),
            ..PruningConfig::default()
        });

        // At head 150, keep the last 100 cycles (51-150), prune 0-50
        assert!(pruner.should_prune(40, 150));
        assert!(pruner.should_prune(50, 150));
        assert!(!pruner.should_prune(51, 150));
        assert!(!pruner.should_prune(150, 150));
    }

    #[test]
    fn test_should_prune_keep_after_counter() {
        let pruner = Pruner::new(PruningConfig {
            policy: RetentionPolicy::KeepAfterCounter(100),
            ..PruningConfig::default()
        });

        assert!(pruner.should_prune(99, 200));
        assert!(!pruner.should_prune(100, 200));
        // Head survives any policy
        assert!(!pruner.should_prune(50, 50));
    }

    #[test]
    fn test_prune_old_cycles() {
        let store = MemoryStore::new();
        fill(&store, 20);
        let pruner = Pruner::new(PruningConfig {
            policy: RetentionPolicy::KeepRecent(10),
            ..PruningConfig::default()
        });

        let stats = pruner.prune(&store, 19).unwrap();
        assert_eq!(stats.cycles_pruned, 10);
        assert_eq!(store.counters().unwrap(), (10..20).collect::<Vec<_>>());
    }

    #[test]
    fn test_prune_bounded_per_pass() {
        let store = MemoryStore::new();
        fill(&store, 30);
        let pruner = Pruner::new(PruningConfig {
            policy: RetentionPolicy::KeepRecent(5),
            max_per_pass: 10,
        });

        assert_eq!(pruner.prune(&store, 29).unwrap().cycles_pruned, 10);
        assert_eq!(pruner.prune(&store, 29).unwrap().cycles_pruned, 10);
        assert_eq!(pruner.prune(&store, 29).unwrap().cycles_pruned, 5);
        assert_eq!(store.counters().unwrap().len(), 5);
    }
}
