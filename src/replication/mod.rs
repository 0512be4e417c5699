//! Replication Module
//!
//! Coordinates a write on a shard's primary and fans it out to the replica
//! copies. The capabilities the coordinator drives are the [`Primary`] and
//! [`Replicas`] traits; [`ReplicationOperation`] is the coordinator itself.

pub mod consistency;
pub mod shard_info;
mod listener;
mod request;
mod operation;
mod shard;
pub mod transport;

use serde::{Deserialize, Serialize};

use crate::cluster::ShardRouting;
use crate::error::{Error, Result};

pub use consistency::{check_write_consistency, WriteConsistencyLevel};
pub use shard_info::{ReplicaFailureKind, ShardFailure, ShardInfo};
pub use listener::ActionListener;
pub use request::{PrimaryResult, ReplicationRequest, WriteOp, WriteRequest, WriteResult};
pub use operation::{replica_targets, ReplicationOperation};
pub use shard::{EngineResult, MemoryEngine, ReplicaShard, ShardEngine, ShardPrimary};
pub use transport::{ReplicaCommand, TransportReplicas};

/// Configuration for replication operations
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// Operation name used in log and failure messages
    pub op_type: String,
    /// Run the consistency check before touching the primary
    pub check_write_consistency: bool,
    /// Fan out to replicas (false for shadow replicas sharing storage)
    pub execute_on_replicas: bool,
    /// Level that `Default` requests resolve to
    pub default_consistency: WriteConsistencyLevel,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            op_type: "write".to_string(),
            check_write_consistency: true,
            execute_on_replicas: true,
            default_consistency: WriteConsistencyLevel::Quorum,
        }
    }
}

/// A replica's acknowledgement of a write
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaResponse {
    pub allocation_id: String,
    pub local_checkpoint: i64,
}

/// Outcome of asking the cluster to fail a replica copy
#[derive(Debug)]
pub enum FailShardOutcome {
    /// The copy was failed cluster-wide
    Failed,
    /// The failure request was a no-op
    Ignored(Error),
    /// We are no longer the primary for this shard
    PrimaryDemoted(Error),
}

/// The local primary copy of a shard
#[async_trait::async_trait]
pub trait Primary: Send + Sync + 'static {
    type Request: ReplicationRequest;
    type ReplicaRequest: ReplicationRequest;
    type Result: PrimaryResult<Self::ReplicaRequest>;

    /// Routing entry of this primary copy
    fn routing_entry(&self) -> ShardRouting;

    /// Execute the request locally. Called once per operation.
    async fn perform(&self, request: Self::Request) -> Result<Self::Result>;

    /// Current primary term
    fn primary_term(&self) -> u64;

    /// Fail this copy; it must stop acting as primary
    fn fail_shard(&self, message: &str, cause: &Error);

    fn local_checkpoint(&self) -> i64;

    /// Record the local checkpoint reported for a copy
    fn update_local_checkpoint_for_shard(&self, allocation_id: &str, checkpoint: i64);
}

/// Proxy to the replica copies of a shard
#[async_trait::async_trait]
pub trait Replicas<R: ReplicationRequest>: Send + Sync + 'static {
    /// Execute `request` on one replica copy
    async fn perform_on(&self, replica: &ShardRouting, request: R) -> Result<ReplicaResponse>;

    /// Ask the cluster to fail `replica` on behalf of `primary`
    async fn fail_shard(
        &self,
        replica: &ShardRouting,
        primary: &ShardRouting,
        primary_term: u64,
        message: &str,
        cause: &Error,
    ) -> FailShardOutcome;

    /// Decide whether a replica failure must fail the copy
    fn classify_failure(&self, cause: &Error) -> ReplicaFailureKind {
        if cause.is_shard_fatal_replica_failure() {
            ReplicaFailureKind::ShardFatal
        } else {
            ReplicaFailureKind::Transient
        }
    }
}
