//! Shard Info
//!
//! Per-operation outcome summary: how many copies took part, how many
//! succeeded, and why the others failed.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cluster::{ShardId, ShardRouting};
use crate::error::Error;

/// How a replica failure was classified
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaFailureKind {
    /// The copy was not ready; nothing to escalate
    Transient,
    /// The copy may have diverged and must be failed cluster-wide
    ShardFatal,
}

/// A single failed copy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardFailure {
    pub shard_id: ShardId,
    pub node_id: Option<String>,
    pub allocation_id: String,
    pub reason: String,
    /// Short error kind, see [`Error::kind_name`]
    pub cause: String,
    pub kind: ReplicaFailureKind,
    pub primary: bool,
    pub failed_at: DateTime<Utc>,
}

impl ShardFailure {
    pub fn for_replica(replica: &ShardRouting, error: &Error, kind: ReplicaFailureKind) -> Self {
        Self {
            shard_id: replica.shard_id.clone(),
            node_id: replica.current_node_id.clone(),
            allocation_id: replica.allocation_id_str().to_string(),
            reason: error.to_string(),
            cause: error.kind_name().to_string(),
            kind,
            primary: false,
            failed_at: Utc::now(),
        }
    }
}

/// Final outcome of one replication operation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardInfo {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub failures: Vec<ShardFailure>,
}

impl ShardInfo {
    pub fn new(total: usize, successful: usize, failures: Vec<ShardFailure>) -> Self {
        Self {
            total,
            successful,
            failed: failures.len(),
            failures,
        }
    }

    /// Whether every participant succeeded
    pub fn all_successful(&self) -> bool {
        self.failed == 0 && self.successful == self.total
    }
}

impl std::fmt::Display for ShardInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ShardInfo{{total={}, successful={}, failed={}}}",
            self.total, self.successful, self.failed
        )
    }
}

/// Concurrent accumulator feeding [`ShardInfo`]
#[derive(Debug)]
pub(crate) struct ShardInfoAggregator {
    total: usize,
    successful: AtomicUsize,
    failures: Mutex<Vec<ShardFailure>>,
}

impl ShardInfoAggregator {
    pub(crate) fn new(total: usize) -> Self {
        Self {
            total,
            successful: AtomicUsize::new(0),
            failures: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn record_success(&self) {
        self.successful.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn record_failure(&self, failure: ShardFailure) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(failure);
    }

    pub(crate) fn finish(&self) -> ShardInfo {
        let failures = std::mem::take(&mut *self.failures.lock().unwrap_or_else(|e| e.into_inner()));
        ShardInfo::new(self.total, self.successful.load(Ordering::Acquire), failures)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate() {
        let shard = ShardId::new("test", 0);
        let replica = ShardRouting::started(shard.clone(), "node-2", false);
        let aggregator = ShardInfoAggregator::new(3);

        aggregator.record_success();
        aggregator.record_success();
        aggregator.record_failure(ShardFailure::for_replica(
            &replica,
            &Error::ShardNotStarted(shard),
            ReplicaFailureKind::Transient,
        ));

        let info = aggregator.finish();
        assert_eq!(info.total, 3);
        assert_eq!(info.successful, 2);
        assert_eq!(info.failed, 1);
        assert_eq!(info.successful + info.failed, info.total);
        assert!(!info.all_successful());
        assert_eq!(info.failures[0].node_id.as_deref(), Some("node-2"));
        assert_eq!(info.failures[0].cause, "shard_not_started");
    }

    #[test]
    fn test_serializes_as_json() {
        let info = ShardInfo::new(1, 1, Vec::new());
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["total"], 1);
        assert_eq!(json["failed"], 0);
        assert_eq!(info.to_string(), "ShardInfo{total=1, successful=1, failed=0}");
    }
}
