//! Cluster State
//!
//! Immutable topology snapshot: which copies exist for every shard, which
//! node we are, and the current primary term per shard.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::routing::{IndexShardRoutingTable, ShardId, ShardRouting};

/// Immutable view of the cluster topology
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterState {
    version: u64,
    local_node_id: String,
    routing_table: HashMap<ShardId, IndexShardRoutingTable>,
    primary_terms: HashMap<ShardId, u64>,
}

impl ClusterState {
    /// Start building a state for `local_node_id`
    pub fn builder(local_node_id: impl Into<String>) -> ClusterStateBuilder {
        ClusterStateBuilder {
            state: ClusterState {
                version: 1,
                local_node_id: local_node_id.into(),
                ..Default::default()
            },
        }
    }

    /// Start building a new version of this state
    pub fn to_builder(&self) -> ClusterStateBuilder {
        let mut state = self.clone();
        state.version += 1;
        ClusterStateBuilder { state }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn local_node_id(&self) -> &str {
        &self.local_node_id
    }

    /// Routing entries of a shard, `None` if the index is unknown
    pub fn shard_routing_table(&self, shard_id: &ShardId) -> Option<&IndexShardRoutingTable> {
        self.routing_table.get(shard_id)
    }

    pub fn has_shard(&self, shard_id: &ShardId) -> bool {
        self.routing_table.contains_key(shard_id)
    }

    /// Primary term of a shard (0 if unknown)
    pub fn primary_term(&self, shard_id: &ShardId) -> u64 {
        self.primary_terms.get(shard_id).copied().unwrap_or(0)
    }

    /// All shard ids, sorted
    pub fn shard_ids(&self) -> Vec<ShardId> {
        let mut ids: Vec<ShardId> = self.routing_table.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Multi-line description for debug logs
    pub fn pretty_print(&self) -> String {
        let mut out = format!(
            "version: {}, local node: {}\n",
            self.version, self.local_node_id
        );
        for shard_id in self.shard_ids() {
            out.push_str(&format!(
                "{} term {}\n",
                shard_id,
                self.primary_term(&shard_id)
            ));
            if let Some(table) = self.routing_table.get(&shard_id) {
                for copy in table {
                    out.push_str(&format!("  {}\n", copy));
                }
            }
        }
        out
    }
}

/// Builder for [`ClusterState`]
pub struct ClusterStateBuilder {
    state: ClusterState,
}

impl ClusterStateBuilder {
    pub fn local_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.state.local_node_id = node_id.into();
        self
    }

    pub fn version(mut self, version: u64) -> Self {
        self.state.version = version;
        self
    }

    /// Replace the routing entries of a shard
    pub fn shard(mut self, shard_id: ShardId, copies: Vec<ShardRouting>) -> Self {
        self.state
            .primary_terms
            .entry(shard_id.clone())
            .or_insert(1);
        self.state
            .routing_table
            .insert(shard_id, IndexShardRoutingTable::new(copies));
        self
    }

    pub fn primary_term(mut self, shard_id: ShardId, term: u64) -> Self {
        self.state.primary_terms.insert(shard_id, term);
        self
    }

    /// Drop every shard of an index
    pub fn remove_index(mut self, index: &str) -> Self {
        self.state.routing_table.retain(|id, _| id.index != index);
        self.state.primary_terms.retain(|id, _| id.index != index);
        self
    }

    pub(crate) fn routing_table_mut(&mut self, shard_id: &ShardId) -> Option<&mut IndexShardRoutingTable> {
        self.state.routing_table.get_mut(shard_id)
    }

    pub(crate) fn bump_primary_term(&mut self, shard_id: &ShardId) -> u64 {
        let term = self.state.primary_terms.entry(shard_id.clone()).or_insert(0);
        *term += 1;
        *term
    }

    pub fn build(self) -> ClusterState {
        self.state
    }
}

/// Source of topology snapshots.
///
/// Must be cheap and safe to call repeatedly.
pub trait ClusterStateSupplier: Send + Sync {
    fn state(&self) -> Arc<ClusterState>;
}

impl<F> ClusterStateSupplier for F
where
    F: Fn() -> Arc<ClusterState> + Send + Sync,
{
    fn state(&self) -> Arc<ClusterState> {
        self()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_and_lookup() {
        let shard = ShardId::new("test", 0);
        let state = ClusterState::builder("node-1")
            .shard(
                shard.clone(),
                vec![
                    ShardRouting::started(shard.clone(), "node-1", true),
                    ShardRouting::started(shard.clone(), "node-2", false),
                ],
            )
            .primary_term(shard.clone(), 3)
            .build();

        assert_eq!(state.local_node_id(), "node-1");
        assert_eq!(state.primary_term(&shard), 3);
        assert_eq!(state.shard_routing_table(&shard).unwrap().size(), 2);
        assert!(state.shard_routing_table(&ShardId::new("other", 0)).is_none());
    }

    #[test]
    fn test_to_builder_bumps_version() {
        let shard = ShardId::new("test", 0);
        let state = ClusterState::builder("node-1")
            .shard(shard.clone(), vec![ShardRouting::started(shard, "node-1", true)])
            .build();
        let next = state.to_builder().remove_index("test").build();

        assert_eq!(next.version(), state.version() + 1);
        assert!(next.shard_ids().is_empty());
        assert_eq!(state.shard_ids().len(), 1);
    }

    #[test]
    fn test_closure_supplier() {
        let state = Arc::new(ClusterState::builder("node-1").build());
        let captured = state.clone();
        let supplier = move || captured.clone();
        assert_eq!(supplier.state().local_node_id(), "node-1");
    }
}
