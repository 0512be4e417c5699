//! Cluster Topology Module
//!
//! Shard routing entries, immutable cluster state snapshots, and the service
//! that owns the current snapshot.

mod routing;
mod state;
mod service;

pub use routing::{AllocationId, IndexShardRoutingTable, ShardId, ShardRouting, ShardRoutingState};
pub use state::{ClusterState, ClusterStateBuilder, ClusterStateSupplier};
pub use service::{ClusterService, ShardFailedResponse};
