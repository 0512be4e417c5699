//! ShardRep - Write Replication Coordinator for Sharded Data Stores
//!
//! Coordinates a single write against one shard of a replicated index: it
//! checks that enough copies are active, executes the write on the primary
//! copy, fans it out concurrently to every replica copy (relocation targets
//! included), fails replicas that could diverge, and reports one aggregate
//! outcome.
//!
//! # Architecture
//!
//! The coordinator ([`replication::ReplicationOperation`]) works against three
//! seams: a [`replication::Primary`] that executes locally, a
//! [`replication::Replicas`] proxy that reaches the other copies, and a
//! [`cluster::ClusterStateSupplier`] that hands out immutable topology
//! snapshots. The crate ships a production implementation of each, plus an
//! in-process [`simulation`] that wires them into a running cluster.
//!
//! # Features
//!
//! - Write consistency levels (ONE, QUORUM, ALL) checked before execution
//! - Replication to relocation targets
//! - Transient vs shard-fatal replica failure handling
//! - Primary demotion detection and retry signalling
//! - Per-operation shard info with failure records

pub mod config;
pub mod error;
pub mod cluster;
pub mod replication;
pub mod simulation;

pub use config::ShardRepConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::ShardRepConfig;
    pub use crate::error::{Error, Result};
    pub use crate::cluster::{ClusterService, ClusterState, ClusterStateSupplier, ShardId, ShardRouting};
    pub use crate::replication::{
        ActionListener, Primary, Replicas, ReplicationConfig, ReplicationOperation, ShardInfo,
        WriteConsistencyLevel, WriteRequest, WriteResult,
    };
    pub use crate::simulation::SimulatedCluster;
}
