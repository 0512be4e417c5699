//! Cluster Service
//!
//! Holds the current topology snapshot and applies the few mutations the
//! replication path needs: topology updates and failing shard copies.

use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use super::routing::{ShardRouting, ShardRoutingState};
use super::state::{ClusterState, ClusterStateSupplier};

/// Master-side answer to a shard failure request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShardFailedResponse {
    /// The copy was removed from the routing table
    Acknowledged,
    /// The requester is no longer the authoritative primary
    NoLongerPrimary(String),
    /// Nothing to do, the copy is already gone
    Ignored(String),
}

/// Owner of the current cluster state
pub struct ClusterService {
    state: RwLock<Arc<ClusterState>>,
}

impl ClusterService {
    /// Create a service seeded with `initial`
    pub fn new(initial: ClusterState) -> Self {
        Self {
            state: RwLock::new(Arc::new(initial)),
        }
    }

    /// Replace the state through a builder closure
    pub fn update<F>(&self, f: F) -> Arc<ClusterState>
    where
        F: FnOnce(&ClusterState) -> ClusterState,
    {
        let mut guard = self.state.write().unwrap_or_else(|e| e.into_inner());
        let next = Arc::new(f(&guard));
        tracing::debug!(
            "cluster state updated: version {} -> {}",
            guard.version(),
            next.version()
        );
        *guard = next.clone();
        next
    }

    /// Handle a request to fail `replica`, sent by `primary`.
    pub fn shard_failed(
        &self,
        replica: &ShardRouting,
        primary: &ShardRouting,
        primary_term: u64,
        message: &str,
    ) -> ShardFailedResponse {
        let mut guard = self.state.write().unwrap_or_else(|e| e.into_inner());
        let shard_id = &replica.shard_id;

        let Some(table) = guard.shard_routing_table(shard_id) else {
            return ShardFailedResponse::Ignored(format!("{} no longer exists", shard_id));
        };

        // A primary running on its relocation target carries the source's relocation id
        let primary_id = primary.allocation_id.as_ref().map(|a| a.id.as_str());
        let primary_is_known = table
            .primary_shard()
            .and_then(|p| p.allocation_id.as_ref())
            .map(|current| {
                primary_id == Some(current.id.as_str())
                    || (primary_id.is_some() && primary_id == current.relocation_id.as_deref())
            })
            .unwrap_or(false);

        let current_term = guard.primary_term(shard_id);
        if primary_term < current_term || !primary_is_known {
            tracing::warn!(
                "{} rejecting shard failure from stale primary {} (term {}, current {})",
                shard_id,
                primary,
                primary_term,
                current_term
            );
            let reason = if primary_term < current_term {
                format!(
                    "primary term [{}] did not match current primary term [{}]",
                    primary_term, current_term
                )
            } else {
                format!("{} is not the current primary", primary)
            };
            return ShardFailedResponse::NoLongerPrimary(reason);
        }

        let mut builder = guard.to_builder();
        let Some(table) = builder.routing_table_mut(shard_id) else {
            return ShardFailedResponse::Ignored(format!("{} no longer exists", shard_id));
        };

        let target_id = replica.allocation_id.as_ref().map(|a| a.id.clone());
        let mut removed = false;
        for copy in table.shards_mut().iter_mut() {
            if copy.primary {
                continue;
            }
            let copy_id = copy.allocation_id.as_ref().map(|a| a.id.clone());
            // A relocation target is tracked on its source's relocation id
            let source_of_target = copy
                .allocation_id
                .as_ref()
                .and_then(|a| a.relocation_id.clone());
            if copy_id.is_some() && copy_id == target_id {
                *copy = ShardRouting::unassigned(copy.shard_id.clone(), false);
                removed = true;
                break;
            }
            if copy.state == ShardRoutingState::Relocating && source_of_target.is_some() && source_of_target == target_id {
                // Cancel the relocation; the source keeps serving
                copy.state = ShardRoutingState::Started;
                copy.relocating_node_id = None;
                if let Some(aid) = copy.allocation_id.as_mut() {
                    aid.relocation_id = None;
                }
                removed = true;
                break;
            }
        }

        if !removed {
            return ShardFailedResponse::Ignored(format!(
                "{} is not part of the routing table anymore",
                replica
            ));
        }

        tracing::warn!("{} failing replica {}: {}", shard_id, replica, message);
        *guard = Arc::new(builder.build());
        ShardFailedResponse::Acknowledged
    }

    /// Promote the given node's copy to primary, bumping the primary term.
    ///
    /// Returns the new term, or `None` if no copy lives on that node.
    pub fn promote(&self, shard_id: &super::ShardId, node_id: &str) -> Option<u64> {
        let mut guard = self.state.write().unwrap_or_else(|e| e.into_inner());
        let mut builder = guard.to_builder();
        let table = builder.routing_table_mut(shard_id)?;
        if !table
            .iter()
            .any(|c| c.current_node_id.as_deref() == Some(node_id) && c.active())
        {
            return None;
        }
        for copy in table.shards_mut().iter_mut() {
            copy.primary = copy.current_node_id.as_deref() == Some(node_id);
        }
        let term = builder.bump_primary_term(shard_id);
        *guard = Arc::new(builder.build());
        tracing::info!("{} promoted copy on {} to primary, term {}", shard_id, node_id, term);
        Some(term)
    }
}

impl ClusterStateSupplier for ClusterService {
    fn state(&self) -> Arc<ClusterState> {
        self.state.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}
