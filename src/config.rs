//! ShardRep Configuration
//!
//! This module provides configuration structures for the shardrep
//! write-replication coordinator and its in-process simulated cluster.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

use crate::cluster::ShardRoutingState;
use crate::replication::{ReplicationConfig, WriteConsistencyLevel};

/// Main shardrep configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardRepConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Replication behaviour
    #[serde(default)]
    pub replication: ReplicationSection,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Simulated cluster topology and workload
    #[serde(default)]
    pub simulation: SimulationConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier; this node holds the primary copies
    pub id: String,
}

/// Replication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationSection {
    /// Level that requests without an explicit level resolve to
    #[serde(default = "default_consistency")]
    pub default_consistency: WriteConsistencyLevel,

    /// Check write consistency before executing on the primary
    #[serde(default = "default_true")]
    pub check_write_consistency: bool,

    /// Fan writes out to replicas (disable for shadow replicas)
    #[serde(default = "default_true")]
    pub execute_on_replicas: bool,

    /// Per-replica request timeout in milliseconds
    #[serde(default = "default_replica_timeout_ms")]
    pub replica_timeout_ms: u64,

    /// Timeout for shard failure requests in milliseconds
    #[serde(default = "default_shard_failed_timeout_ms")]
    pub shard_failed_timeout_ms: u64,

    /// Operation name used in logs and failure messages
    #[serde(default = "default_op_type")]
    pub op_type: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,
}

/// Simulated cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Index name
    #[serde(default = "default_index")]
    pub index: String,

    /// Number of shards in the index
    #[serde(default = "default_shards")]
    pub shards: u32,

    /// Number of writes to run per shard
    #[serde(default = "default_writes")]
    pub writes: usize,

    /// Maximum writes in flight at once
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Base replica latency in milliseconds
    #[serde(default)]
    pub latency_ms: u64,

    /// Random extra replica latency in milliseconds
    #[serde(default)]
    pub jitter_ms: u64,

    /// Node the primary is relocating to, if any
    #[serde(default)]
    pub primary_relocating_to: Option<String>,

    /// Replica copies of every shard
    #[serde(default = "default_replicas")]
    pub replicas: Vec<ReplicaSpec>,
}

/// One replica copy in the simulated topology
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaSpec {
    /// Node holding the copy (absent for unassigned copies)
    #[serde(default)]
    pub node: Option<String>,

    /// Routing state of the copy
    #[serde(default = "default_replica_state")]
    pub state: ShardRoutingState,

    /// Target node when the copy is relocating
    #[serde(default)]
    pub relocating_to: Option<String>,

    /// Fault injected on the node holding the copy
    #[serde(default)]
    pub fault: FaultKind,
}

/// Faults a simulated replica node can exhibit
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// Behave normally
    #[default]
    None,
    /// Answer every write with "shard not started"
    NotStarted,
    /// Answer every write with a corruption error
    Corrupt,
    /// Never answer, so the primary times out
    Unresponsive,
}

impl std::fmt::Display for FaultKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FaultKind::None => write!(f, "none"),
            FaultKind::NotStarted => write!(f, "not_started"),
            FaultKind::Corrupt => write!(f, "corrupt"),
            FaultKind::Unresponsive => write!(f, "unresponsive"),
        }
    }
}

// Default value functions
fn default_consistency() -> WriteConsistencyLevel {
    WriteConsistencyLevel::Quorum
}

fn default_true() -> bool {
    true
}

fn default_replica_timeout_ms() -> u64 {
    5000
}

fn default_shard_failed_timeout_ms() -> u64 {
    5000
}

fn default_op_type() -> String {
    "index".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_index() -> String {
    "docs".to_string()
}

fn default_shards() -> u32 {
    1
}

fn default_writes() -> usize {
    100
}

fn default_concurrency() -> usize {
    8
}

fn default_replica_state() -> ShardRoutingState {
    ShardRoutingState::Started
}

fn default_replicas() -> Vec<ReplicaSpec> {
    vec![
        ReplicaSpec::started("node-2"),
        ReplicaSpec::started("node-3"),
    ]
}

impl Default for ReplicationSection {
    fn default() -> Self {
        Self {
            default_consistency: default_consistency(),
            check_write_consistency: true,
            execute_on_replicas: true,
            replica_timeout_ms: default_replica_timeout_ms(),
            shard_failed_timeout_ms: default_shard_failed_timeout_ms(),
            op_type: default_op_type(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            index: default_index(),
            shards: default_shards(),
            writes: default_writes(),
            concurrency: default_concurrency(),
            latency_ms: 0,
            jitter_ms: 0,
            primary_relocating_to: None,
            replicas: default_replicas(),
        }
    }
}

impl ReplicaSpec {
    /// A healthy started copy on `node`
    pub fn started(node: impl Into<String>) -> Self {
        Self {
            node: Some(node.into()),
            state: ShardRoutingState::Started,
            relocating_to: None,
            fault: FaultKind::None,
        }
    }
}

impl ShardRepConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ShardRepConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: ShardRepConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.id.is_empty() {
            return Err(crate::Error::Config("node.id cannot be empty".into()));
        }

        if self.replication.replica_timeout_ms == 0 {
            return Err(crate::Error::Config(
                "replication.replica_timeout_ms must be greater than 0".into(),
            ));
        }

        if self.replication.op_type.is_empty() {
            return Err(crate::Error::Config("replication.op_type cannot be empty".into()));
        }

        if !["trace", "debug", "info", "warn", "error"].contains(&self.logging.level.as_str()) {
            return Err(crate::Error::Config(format!(
                "logging.level '{}' is not one of trace, debug, info, warn, error",
                self.logging.level
            )));
        }

        if !["pretty", "compact"].contains(&self.logging.format.as_str()) {
            return Err(crate::Error::Config(format!(
                "logging.format '{}' is not one of pretty, compact",
                self.logging.format
            )));
        }

        let sim = &self.simulation;
        if sim.index.is_empty() {
            return Err(crate::Error::Config("simulation.index cannot be empty".into()));
        }
        if sim.shards == 0 {
            return Err(crate::Error::Config("simulation.shards must be at least 1".into()));
        }
        if sim.concurrency == 0 {
            return Err(crate::Error::Config(
                "simulation.concurrency must be at least 1".into(),
            ));
        }

        let mut nodes = HashSet::new();
        nodes.insert(self.node.id.as_str());
        if let Some(target) = &sim.primary_relocating_to {
            if !nodes.insert(target.as_str()) {
                return Err(crate::Error::Config(format!(
                    "node '{}' holds more than one copy",
                    target
                )));
            }
        }

        for (i, replica) in sim.replicas.iter().enumerate() {
            match (replica.state, &replica.node) {
                (ShardRoutingState::Unassigned, Some(node)) => {
                    return Err(crate::Error::Config(format!(
                        "simulation.replicas[{}] is unassigned but names node '{}'",
                        i, node
                    )));
                }
                (ShardRoutingState::Unassigned, None) => continue,
                (_, None) => {
                    return Err(crate::Error::Config(format!(
                        "simulation.replicas[{}] needs a node",
                        i
                    )));
                }
                (_, Some(node)) => {
                    if !nodes.insert(node.as_str()) {
                        return Err(crate::Error::Config(format!(
                            "node '{}' holds more than one copy",
                            node
                        )));
                    }
                }
            }

            match (replica.state, &replica.relocating_to) {
                (ShardRoutingState::Relocating, None) => {
                    return Err(crate::Error::Config(format!(
                        "simulation.replicas[{}] is relocating without relocating_to",
                        i
                    )));
                }
                (ShardRoutingState::Relocating, Some(target)) => {
                    if !nodes.insert(target.as_str()) {
                        return Err(crate::Error::Config(format!(
                            "node '{}' holds more than one copy",
                            target
                        )));
                    }
                }
                (_, Some(_)) => {
                    return Err(crate::Error::Config(format!(
                        "simulation.replicas[{}] sets relocating_to but is not relocating",
                        i
                    )));
                }
                (_, None) => {}
            }
        }

        Ok(())
    }

    /// Settings for the replication coordinator
    pub fn replication_config(&self) -> ReplicationConfig {
        ReplicationConfig {
            op_type: self.replication.op_type.clone(),
            check_write_consistency: self.replication.check_write_consistency,
            execute_on_replicas: self.replication.execute_on_replicas,
            default_consistency: self.replication.default_consistency,
        }
    }

    /// Get replica timeout as Duration
    pub fn replica_timeout(&self) -> Duration {
        Duration::from_millis(self.replication.replica_timeout_ms)
    }

    /// Get shard failure timeout as Duration
    pub fn shard_failed_timeout(&self) -> Duration {
        Duration::from_millis(self.replication.shard_failed_timeout_ms)
    }

    /// Number of copies per shard, primary included
    pub fn copies_per_shard(&self) -> usize {
        1 + self.simulation.replicas.len()
    }
}
