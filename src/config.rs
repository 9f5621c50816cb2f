//! Configuration file support for a weft node.
//!
//! Loads an optional `weft.toml`; CLI flags override config file values and
//! defaults are used when no file exists. The `[continuity]` section is the
//! typed tuning struct consumed by the peer registry, merge scheduler, and
//! worker — no dynamic config objects anywhere.

use std::net::SocketAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    /// Semantically invalid configuration.
    #[error("invalid configuration: {0}")]
    Syntax(String),
}

/// A merge threshold: an absolute count, or symbolic against the witness
/// set size (`3f + 1 = |witnesses|`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Threshold {
    Count(u64),
    Symbolic(SymbolicThreshold),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SymbolicThreshold {
    #[serde(rename = "2f")]
    TwoF,
    #[serde(rename = "f")]
    F,
    #[serde(rename = "1")]
    One,
}

impl Threshold {
    /// Resolve against the current fault bound `f`.
    pub fn resolve(&self, f: u64) -> u64 {
        match self {
            Threshold::Count(n) => *n,
            Threshold::Symbolic(SymbolicThreshold::TwoF) => 2 * f,
            Threshold::Symbolic(SymbolicThreshold::F) => f,
            Threshold::Symbolic(SymbolicThreshold::One) => 1,
        }
    }
}

/// Consensus, gossip, and reputation tuning.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ContinuityConfig {
    /// Upper bound on failure backoff (ms).
    pub max_failure_ms: u64,
    /// Backoff unit per consecutive failure (ms).
    pub min_failure_ms: u64,
    /// Grace period before failure time starts costing reputation (ms).
    pub max_failure_grace_ms: u64,
    /// Upper bound on idle backoff (ms).
    pub max_idle_ms: u64,
    /// Idle backoff unit (ms).
    pub min_idle_ms: u64,
    /// Idle time that costs the full reputation range (ms).
    pub max_idle_grace_ms: u64,
    /// Peers gossiped with per worker cycle.
    pub gossip_fanout: usize,
    /// Target capacity for positive-reputation peers.
    pub peer_capacity: usize,
    /// Additional slots for untrusted (reputation 0) peers.
    pub untrusted_capacity: usize,
    /// Witness parents a merge tries to reach.
    pub witness_target_threshold: Threshold,
    /// Witness parents a merge requires.
    pub witness_minimum_threshold: Threshold,
    /// Non-witness parents a merge requires.
    pub peer_minimum_threshold: Threshold,
    /// Probability that pending operations are folded into a merge cycle.
    pub operation_ready_chance: f64,
    /// Per-pull timeout (ms).
    pub pull_timeout_ms: u64,
    /// Wall bound for one worker cycle (ms).
    pub cycle_wall_bound_ms: u64,
    /// Bound on the pending-operation queue.
    pub operation_queue_capacity: usize,
}

impl Default for ContinuityConfig {
    fn default() -> Self {
        ContinuityConfig {
            max_failure_ms: 3_600_000,
            min_failure_ms: 10_000,
            max_failure_grace_ms: 86_400_000,
            max_idle_ms: 600_000,
            min_idle_ms: 5_000,
            max_idle_grace_ms: 1_800_000,
            gossip_fanout: 1,
            peer_capacity: crate::constants::PEER_CAPACITY,
            untrusted_capacity: crate::constants::UNTRUSTED_PEER_CAPACITY,
            witness_target_threshold: Threshold::Symbolic(SymbolicThreshold::TwoF),
            witness_minimum_threshold: Threshold::Symbolic(SymbolicThreshold::F),
            peer_minimum_threshold: Threshold::Count(0),
            operation_ready_chance: 1.0,
            pull_timeout_ms: crate::constants::PULL_TIMEOUT_MS,
            cycle_wall_bound_ms: 120_000,
            operation_queue_capacity: crate::constants::OPERATION_QUEUE_CAPACITY,
        }
    }
}

impl ContinuityConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.operation_ready_chance) {
            return Err(ConfigError::Syntax(
                "operation_ready_chance must be within [0, 1]".into(),
            ));
        }
        if self.gossip_fanout == 0 {
            return Err(ConfigError::Syntax("gossip_fanout must be positive".into()));
        }
        if self.min_failure_ms == 0 || self.max_failure_grace_ms == 0 || self.max_idle_grace_ms == 0
        {
            return Err(ConfigError::Syntax(
                "failure and idle grace periods must be positive".into(),
            ));
        }
        if self.operation_queue_capacity == 0 {
            return Err(ConfigError::Syntax(
                "operation_queue_capacity must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Node-level settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSettings {
    /// Gossip HTTP listen address.
    pub listen_addr: SocketAddr,
    /// Data directory for the key file and the sled database.
    pub data_dir: String,
    /// Path to the serialized genesis bundle shared by all participants.
    pub genesis_path: String,
    /// Address other peers should use to reach this node.
    pub advertised_addr: String,
}

impl Default for NodeSettings {
    fn default() -> Self {
        NodeSettings {
            listen_addr: "127.0.0.1:9760".parse().expect("valid default address"),
            data_dir: "./weft-data".into(),
            genesis_path: "./genesis.json".into(),
            advertised_addr: "http://127.0.0.1:9760".into(),
        }
    }
}

/// Top-level configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WeftConfig {
    pub node: NodeSettings,
    pub continuity: ContinuityConfig,
}

impl WeftConfig {
    /// Load `weft.toml` from the given path, falling back to defaults when
    /// the file does not exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            toml::from_str(&contents)?
        } else {
            WeftConfig::default()
        };
        config.continuity.validate()?;
        Ok(config)
    }
}
