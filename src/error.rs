//! ShardRep Error Types

use thiserror::Error;

use crate::cluster::ShardId;
use crate::replication::WriteConsistencyLevel;

/// Result type alias for ShardRep operations
pub type Result<T> = std::result::Result<T, Error>;

/// ShardRep error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Write consistency
    #[error(
        "{shard} Not enough active copies to meet write consistency of [{level}] (have {active}, needed {required})"
    )]
    UnavailableShards {
        shard: ShardId,
        level: WriteConsistencyLevel,
        active: usize,
        required: usize,
    },

    // Primary errors
    #[error("{shard} {reason}")]
    RetryOnPrimary { shard: ShardId, reason: String },

    #[error("{0} shard copy is not the primary")]
    NotPrimary(ShardId),

    #[error("{shard} no longer the primary: {reason}")]
    NoLongerPrimary { shard: ShardId, reason: String },

    #[error("{shard} shard failure was not applied: {reason}")]
    ShardFailureIgnored { shard: ShardId, reason: String },

    #[error("{shard} shard copy has been failed: {reason}")]
    ShardFailed { shard: ShardId, reason: String },

    #[error("Write rejected by storage engine: {0}")]
    Engine(String),

    // Replica errors
    #[error("{0} shard copy is not started")]
    ShardNotStarted(ShardId),

    #[error("{0} shard copy not found on node")]
    ShardNotFound(ShardId),

    #[error("{shard} shard copy is corrupted: {reason}")]
    CorruptShard { shard: ShardId, reason: String },

    #[error("{shard} operation term {request_term} is older than current term {current_term}")]
    StalePrimaryTerm {
        shard: ShardId,
        request_term: u64,
        current_term: u64,
    },

    #[error("Replica request to {node} timed out after {timeout_ms} ms")]
    ReplicaTimeout { node: String, timeout_ms: u64 },

    // Transport / cluster service
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if the caller may retry the whole operation
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::UnavailableShards { .. }
                | Error::RetryOnPrimary { .. }
                | Error::Transport(_)
        )
    }

    /// Check if a replica failure must fail the replica copy cluster-wide.
    ///
    /// Copies that are simply not there (yet) are transient; anything that
    /// means the copy may now diverge from the primary is fatal for that copy.
    pub fn is_shard_fatal_replica_failure(&self) -> bool {
        !matches!(
            self,
            Error::ShardNotStarted(_) | Error::ShardNotFound(_) | Error::ShuttingDown
        )
    }

    /// Short, stable name of the error kind used in failure records
    pub fn kind_name(&self) -> &'static str {
        match self {
            Error::Config(_) | Error::ConfigParse(_) => "config",
            Error::Serialization(_) => "serialization",
            Error::UnavailableShards { .. } => "unavailable_shards",
            Error::RetryOnPrimary { .. } => "retry_on_primary",
            Error::NotPrimary(_) => "not_primary",
            Error::NoLongerPrimary { .. } => "no_longer_primary",
            Error::ShardFailureIgnored { .. } => "shard_failure_ignored",
            Error::ShardFailed { .. } => "shard_failed",
            Error::Engine(_) => "engine",
            Error::ShardNotStarted(_) => "shard_not_started",
            Error::ShardNotFound(_) => "shard_not_found",
            Error::CorruptShard { .. } => "corrupt_shard",
            Error::StalePrimaryTerm { .. } => "stale_primary_term",
            Error::ReplicaTimeout { .. } => "replica_timeout",
            Error::Transport(_) => "transport",
            Error::NodeNotFound(_) => "node_not_found",
            Error::Io(_) => "io",
            Error::Internal(_) => "internal",
            Error::ShuttingDown => "shutting_down",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unavailable_shards_message() {
        let err = Error::UnavailableShards {
            shard: ShardId::new("test", 0),
            level: WriteConsistencyLevel::Quorum,
            active: 1,
            required: 2,
        };
        assert_eq!(
            err.to_string(),
            "[test][0] Not enough active copies to meet write consistency of [QUORUM] (have 1, needed 2)"
        );
        assert!(err.is_retryable());
    }

    #[test]
    fn test_shard_prefix_is_not_rebracketed() {
        let shard = ShardId::new("test", 0);
        assert_eq!(
            Error::ShardNotStarted(shard.clone()).to_string(),
            "[test][0] shard copy is not started"
        );
        let err = Error::RetryOnPrimary {
            shard,
            reason: "primary was demoted".to_string(),
        };
        assert!(err.to_string().starts_with("[test][0] primary"));
    }

    #[test]
    fn test_replica_failure_classification() {
        let shard = ShardId::new("test", 0);
        assert!(!Error::ShardNotStarted(shard.clone()).is_shard_fatal_replica_failure());
        assert!(!Error::ShardNotFound(shard.clone()).is_shard_fatal_replica_failure());
        assert!(Error::CorruptShard {
            shard,
            reason: "checksum mismatch".into(),
        }
        .is_shard_fatal_replica_failure());
        assert!(Error::ReplicaTimeout {
            node: "node-2".into(),
            timeout_ms: 10,
        }
        .is_shard_fatal_replica_failure());
    }
}
