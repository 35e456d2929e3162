/// Node configuration
///
/// Every knob has a default so a partial JSON file is enough; `validate`
/// rejects combinations the protocol cannot run with.

use crate::network::gossip::GossipConfig;
use crate::storage::pruning::PruningConfig;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Number of certificates retained per marker
pub const BEST_CERTS_WANTED: usize = 3;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CycleConfig {
    /// Identifier written into every record
    pub network_id: String,

    /// Cycle length in seconds; each quarter is a fourth of it
    pub cycle_duration_secs: u64,

    /// Node count the network aims for, copied into records
    pub desired_nodes: u64,

    /// Peers that must agree with our best cert in Q4
    pub desired_cert_matches: usize,

    /// Pause between Q4 comparison rounds
    pub compare_retry_delay_ms: u64,

    /// Consecutive failed fetches of the previous record tolerated before
    /// the node removes itself
    pub max_fetch_failures: u32,

    /// Matching answers needed to accept a fetched record
    pub fetch_redundancy: usize,

    /// Backoff between fetch attempts
    pub fetch_retry_delay_ms: u64,

    /// Attempts to persist a committed record before the node leaves
    pub max_persist_attempts: u32,

    pub persist_retry_delay_ms: u64,

    /// Join requests admitted per cycle
    pub max_joins_per_cycle: usize,

    /// Rotate out active nodes older than this many cycles (0 disables)
    pub max_node_age_cycles: u64,

    /// This node bootstrapped the network and may certify while not active
    pub first_node: bool,

    /// Seed for peer sampling; random when absent
    pub rng_seed: Option<u64>,

    pub gossip: GossipConfig,

    pub pruning: PruningConfig,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            network_id: "cycle-net".to_string(),
            cycle_duration_secs: 60,
            desired_nodes: 16,
            desired_cert_matches: 3,
            compare_retry_delay_ms: 100,
            max_fetch_failures: 5,
            fetch_redundancy: 3,
            fetch_retry_delay_ms: 1_000,
            max_persist_attempts: 3,
            persist_retry_delay_ms: 500,
            max_joins_per_cycle: 4,
            max_node_age_cycles: 0,
            first_node: false,
            rng_seed: None,
            gossip: GossipConfig::default(),
            pruning: PruningConfig::default(),
        }
    }
}

impl CycleConfig {
    /// Load and validate a JSON config file
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: CycleConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cycle_duration_secs < 4 {
            return Err(ConfigError::Invalid(format!(
                "cycle_duration_secs must be at least 4, got {}",
                self.cycle_duration_secs
            )));
        }
        if self.network_id.is_empty() {
            return Err(ConfigError::Invalid("network_id must not be empty".into()));
        }
        if self.desired_cert_matches == 0 {
            return Err(ConfigError::Invalid("desired_cert_matches must be > 0".into()));
        }
        if self.max_persist_attempts == 0 {
            return Err(ConfigError::Invalid("max_persist_attempts must be > 0".into()));
        }
        if self.fetch_redundancy == 0 {
            return Err(ConfigError::Invalid("fetch_redundancy must be > 0".into()));
        }
        if self.gossip.gossip_recipients == 0 {
            return Err(ConfigError::Invalid("gossip_recipients must be > 0".into()));
        }
        Ok(())
    }

    pub fn cycle_duration(&self) -> Duration {
        Duration::from_secs(self.cycle_duration_secs)
    }

    pub fn quarter_duration_ms(&self) -> u64 {
        self.cycle_duration_secs * 1000 / 4
    }
}
