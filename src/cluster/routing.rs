//! Shard Routing
//!
//! Describes the physical copies of a shard: where they live, whether they
//! are the primary, and where they are in their allocation lifecycle.

use serde::{Deserialize, Serialize};

/// Identity of a shard: index name plus shard number
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardId {
    /// Index name
    pub index: String,
    /// Shard number within the index
    pub id: u32,
}

impl ShardId {
    /// Create a new shard id
    pub fn new(index: impl Into<String>, id: u32) -> Self {
        Self {
            index: index.into(),
            id,
        }
    }
}

impl std::fmt::Display for ShardId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}][{}]", self.index, self.id)
    }
}

/// Lifecycle state of a shard copy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardRoutingState {
    /// Not allocated to any node
    Unassigned,
    /// Allocated and recovering
    Initializing,
    /// Allocated and serving
    Started,
    /// Serving, and being moved to another node
    Relocating,
}

impl std::fmt::Display for ShardRoutingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShardRoutingState::Unassigned => write!(f, "UNASSIGNED"),
            ShardRoutingState::Initializing => write!(f, "INITIALIZING"),
            ShardRoutingState::Started => write!(f, "STARTED"),
            ShardRoutingState::Relocating => write!(f, "RELOCATING"),
        }
    }
}

/// Stable identity of a shard copy, surviving relocation.
///
/// While relocating, the source carries the target's id in `relocation_id`
/// and the target carries the source's id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AllocationId {
    pub id: String,
    pub relocation_id: Option<String>,
}

impl AllocationId {
    /// Allocate a fresh id
    pub fn new_initializing() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            relocation_id: None,
        }
    }

    /// Start a relocation: keep our id and reserve one for the target
    pub fn new_relocation(&self) -> Self {
        Self {
            id: self.id.clone(),
            relocation_id: Some(uuid::Uuid::new_v4().to_string()),
        }
    }

    /// The id the relocation target will use, with the roles swapped
    pub fn new_target_relocation(&self) -> Option<Self> {
        self.relocation_id.as_ref().map(|target| Self {
            id: target.clone(),
            relocation_id: Some(self.id.clone()),
        })
    }
}

/// One physical copy of a shard
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShardRouting {
    pub shard_id: ShardId,
    pub primary: bool,
    pub state: ShardRoutingState,
    /// Node currently holding the copy (none when unassigned)
    pub current_node_id: Option<String>,
    /// Node the copy is moving to (only when relocating)
    pub relocating_node_id: Option<String>,
    /// Allocation identity (none when unassigned)
    pub allocation_id: Option<AllocationId>,
}

impl ShardRouting {
    /// An unassigned copy
    pub fn unassigned(shard_id: ShardId, primary: bool) -> Self {
        Self {
            shard_id,
            primary,
            state: ShardRoutingState::Unassigned,
            current_node_id: None,
            relocating_node_id: None,
            allocation_id: None,
        }
    }

    /// An initializing copy on `node_id`
    pub fn initializing(shard_id: ShardId, node_id: impl Into<String>, primary: bool) -> Self {
        Self {
            shard_id,
            primary,
            state: ShardRoutingState::Initializing,
            current_node_id: Some(node_id.into()),
            relocating_node_id: None,
            allocation_id: Some(AllocationId::new_initializing()),
        }
    }

    /// A started copy on `node_id`
    pub fn started(shard_id: ShardId, node_id: impl Into<String>, primary: bool) -> Self {
        Self {
            state: ShardRoutingState::Started,
            ..Self::initializing(shard_id, node_id, primary)
        }
    }

    /// A copy on `node_id` relocating to `target_node_id`
    pub fn relocating(
        shard_id: ShardId,
        node_id: impl Into<String>,
        target_node_id: impl Into<String>,
        primary: bool,
    ) -> Self {
        let started = Self::started(shard_id, node_id, primary);
        Self {
            state: ShardRoutingState::Relocating,
            relocating_node_id: Some(target_node_id.into()),
            allocation_id: started.allocation_id.as_ref().map(AllocationId::new_relocation),
            ..started
        }
    }

    /// Build the copy that a relocation will produce on the target node.
    ///
    /// Returns `None` unless this copy is relocating.
    pub fn build_target_relocating_shard(&self) -> Option<ShardRouting> {
        if !self.is_relocating() {
            return None;
        }
        Some(ShardRouting {
            shard_id: self.shard_id.clone(),
            primary: self.primary,
            state: ShardRoutingState::Initializing,
            current_node_id: self.relocating_node_id.clone(),
            relocating_node_id: self.current_node_id.clone(),
            allocation_id: self
                .allocation_id
                .as_ref()
                .and_then(AllocationId::new_target_relocation),
        })
    }

    pub fn unassigned_state(&self) -> bool {
        self.state == ShardRoutingState::Unassigned
    }

    pub fn is_relocating(&self) -> bool {
        self.state == ShardRoutingState::Relocating
    }

    /// Started or relocating
    pub fn active(&self) -> bool {
        matches!(
            self.state,
            ShardRoutingState::Started | ShardRoutingState::Relocating
        )
    }

    /// Assigned to a node in any state
    pub fn assigned_to_node(&self) -> bool {
        self.current_node_id.is_some()
    }

    /// Allocation id string, or empty when unassigned
    pub fn allocation_id_str(&self) -> &str {
        self.allocation_id
            .as_ref()
            .map(|a| a.id.as_str())
            .unwrap_or("")
    }
}

impl std::fmt::Display for ShardRouting {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}, node[{}], ",
            self.shard_id,
            self.current_node_id.as_deref().unwrap_or("none"),
        )?;
        if let Some(target) = &self.relocating_node_id {
            write!(f, "relocating [{}], ", target)?;
        }
        write!(
            f,
            "[{}], s[{}]",
            if self.primary { "P" } else { "R" },
            self.state
        )?;
        if let Some(allocation_id) = &self.allocation_id {
            write!(f, ", a[id={}]", allocation_id.id)?;
        }
        Ok(())
    }
}

/// The ordered copies of a single shard
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexShardRoutingTable {
    shards: Vec<ShardRouting>,
}

impl IndexShardRoutingTable {
    pub fn new(shards: Vec<ShardRouting>) -> Self {
        Self { shards }
    }

    /// The primary copy, if the table has one
    pub fn primary_shard(&self) -> Option<&ShardRouting> {
        self.shards.iter().find(|s| s.primary)
    }

    /// Non-primary copies
    pub fn replica_shards(&self) -> impl Iterator<Item = &ShardRouting> {
        self.shards.iter().filter(|s| !s.primary)
    }

    /// Copies that are started or relocating
    pub fn active_shards(&self) -> Vec<&ShardRouting> {
        self.shards.iter().filter(|s| s.active()).collect()
    }

    pub fn shards_with_state(&self, state: ShardRoutingState) -> Vec<&ShardRouting> {
        self.shards.iter().filter(|s| s.state == state).collect()
    }

    pub fn shards(&self) -> &[ShardRouting] {
        &self.shards
    }

    pub fn size(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ShardRouting> {
        self.shards.iter()
    }

    pub(crate) fn shards_mut(&mut self) -> &mut Vec<ShardRouting> {
        &mut self.shards
    }
}

impl<'a> IntoIterator for &'a IndexShardRoutingTable {
    type Item = &'a ShardRouting;
    type IntoIter = std::slice::Iter<'a, ShardRouting>;

    fn into_iter(self) -> Self::IntoIter {
        self.shards.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_relocating_shard() {
        let source = ShardRouting::relocating(ShardId::new("test", 0), "node-1", "node-2", false);
        let target = source.build_target_relocating_shard().unwrap();

        assert_eq!(target.current_node_id.as_deref(), Some("node-2"));
        assert_eq!(target.relocating_node_id.as_deref(), Some("node-1"));
        assert_eq!(target.state, ShardRoutingState::Initializing);

        let source_aid = source.allocation_id.unwrap();
        let target_aid = target.allocation_id.unwrap();
        assert_eq!(Some(target_aid.id.clone()), source_aid.relocation_id);
        assert_eq!(target_aid.relocation_id, Some(source_aid.id));
    }

    #[test]
    fn test_relocation_predicate_and_constructor() {
        let shard = ShardId::new("test", 0);
        let source = ShardRouting::relocating(shard.clone(), "node-1", "node-2", true);
        assert!(source.is_relocating());
        assert!(source.active());
        assert!(!ShardRouting::started(shard, "node-1", true).is_relocating());
    }

    #[test]
    fn test_only_relocating_copies_have_targets() {
        let shard = ShardId::new("test", 0);
        assert!(ShardRouting::started(shard.clone(), "node-1", true)
            .build_target_relocating_shard()
            .is_none());
        assert!(ShardRouting::unassigned(shard, false)
            .build_target_relocating_shard()
            .is_none());
    }

    #[test]
    fn test_routing_table_views() {
        let shard = ShardId::new("test", 0);
        let table = IndexShardRoutingTable::new(vec![
            ShardRouting::started(shard.clone(), "node-1", true),
            ShardRouting::relocating(shard.clone(), "node-2", "node-4", false),
            ShardRouting::initializing(shard.clone(), "node-3", false),
            ShardRouting::unassigned(shard, false),
        ]);

        assert_eq!(table.size(), 4);
        assert_eq!(table.active_shards().len(), 2);
        assert_eq!(table.shards_with_state(ShardRoutingState::Unassigned).len(), 1);
        assert_eq!(table.replica_shards().count(), 3);
        assert_eq!(
            table.primary_shard().and_then(|p| p.current_node_id.as_deref()),
            Some("node-1")
        );
    }
}
