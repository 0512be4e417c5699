//! Replication Requests
//!
//! The request contract the coordinator relies on, plus the concrete
//! document write request used by the bundled collaborators.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cluster::ShardId;
use super::consistency::WriteConsistencyLevel;
use super::shard_info::ShardInfo;

/// A write addressed to a single shard
pub trait ReplicationRequest: Clone + Send + Sync + std::fmt::Debug + 'static {
    fn shard_id(&self) -> &ShardId;

    fn consistency_level(&self) -> WriteConsistencyLevel;

    /// Term of the primary that executed the request (0 until stamped)
    fn primary_term(&self) -> u64;

    fn set_primary_term(&mut self, term: u64);

    /// Caller-side bound on each replica call; the transport uses the
    /// smaller of this and its own timeout
    fn timeout(&self) -> Option<Duration> {
        None
    }
}

/// Result of executing a request on the primary
pub trait PrimaryResult<R: ReplicationRequest>: Send + 'static {
    /// Request to forward to replicas
    fn replica_request(&self) -> &R;

    fn replica_request_mut(&mut self) -> &mut R;

    /// Attach the replication outcome. Called exactly once.
    fn set_shard_info(&mut self, shard_info: ShardInfo);
}

/// Index or delete a document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WriteOp {
    Index {
        doc_id: String,
        source: serde_json::Value,
    },
    Delete {
        doc_id: String,
    },
}

impl WriteOp {
    pub fn doc_id(&self) -> &str {
        match self {
            WriteOp::Index { doc_id, .. } | WriteOp::Delete { doc_id } => doc_id,
        }
    }
}

/// Concrete document write request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteRequest {
    pub shard_id: ShardId,
    #[serde(default)]
    pub consistency: WriteConsistencyLevel,
    #[serde(default)]
    pub primary_term: u64,
    /// Sequence number assigned by the primary, replayed on replicas
    #[serde(default)]
    pub seq_no: Option<i64>,
    pub op: WriteOp,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl WriteRequest {
    pub fn new(shard_id: ShardId, op: WriteOp) -> Self {
        Self {
            shard_id,
            consistency: WriteConsistencyLevel::Default,
            primary_term: 0,
            seq_no: None,
            op,
            timeout_ms: None,
        }
    }

    /// Index `source` under `doc_id`
    pub fn index(shard_id: ShardId, doc_id: impl Into<String>, source: serde_json::Value) -> Self {
        Self::new(
            shard_id,
            WriteOp::Index {
                doc_id: doc_id.into(),
                source,
            },
        )
    }

    pub fn delete(shard_id: ShardId, doc_id: impl Into<String>) -> Self {
        Self::new(
            shard_id,
            WriteOp::Delete {
                doc_id: doc_id.into(),
            },
        )
    }

    pub fn with_consistency(mut self, level: WriteConsistencyLevel) -> Self {
        self.consistency = level;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }
}

impl ReplicationRequest for WriteRequest {
    fn shard_id(&self) -> &ShardId {
        &self.shard_id
    }

    fn consistency_level(&self) -> WriteConsistencyLevel {
        self.consistency
    }

    fn primary_term(&self) -> u64 {
        self.primary_term
    }

    fn set_primary_term(&mut self, term: u64) {
        self.primary_term = term;
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// Outcome of a [`WriteRequest`] on the primary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteResult {
    pub seq_no: i64,
    /// Whether the write created a new document
    pub created: bool,
    pub replica_request: WriteRequest,
    pub shard_info: Option<ShardInfo>,
}

impl PrimaryResult<WriteRequest> for WriteResult {
    fn replica_request(&self) -> &WriteRequest {
        &self.replica_request
    }

    fn replica_request_mut(&mut self) -> &mut WriteRequest {
        &mut self.replica_request
    }

    fn set_shard_info(&mut self, shard_info: ShardInfo) {
        assert!(
            self.shard_info.is_none(),
            "shard info attached twice to result for {}",
            self.replica_request.shard_id
        );
        self.shard_info = Some(shard_info);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_builders() {
        let shard = ShardId::new("test", 1);
        let req = WriteRequest::index(shard.clone(), "doc-1", json!({"field": 1}))
            .with_consistency(WriteConsistencyLevel::All)
            .with_timeout(Duration::from_millis(250));

        assert_eq!(req.shard_id(), &shard);
        assert_eq!(req.consistency_level(), WriteConsistencyLevel::All);
        assert_eq!(req.primary_term(), 0);
        assert_eq!(req.timeout(), Some(Duration::from_millis(250)));
        assert_eq!(req.op.doc_id(), "doc-1");
    }

    #[test]
    #[should_panic(expected = "shard info attached twice")]
    fn test_shard_info_attached_once() {
        let shard = ShardId::new("test", 0);
        let mut result = WriteResult {
            seq_no: 0,
            created: true,
            replica_request: WriteRequest::delete(shard, "doc"),
            shard_info: None,
        };
        result.set_shard_info(ShardInfo::default());
        result.set_shard_info(ShardInfo::default());
    }
}
