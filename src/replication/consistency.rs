//! Write Consistency
//!
//! Decides, before the primary is touched, whether enough copies of a shard
//! are assigned to attempt a write at the requested level.

use serde::{Deserialize, Serialize};

use crate::cluster::{IndexShardRoutingTable, ShardId, ShardRoutingState};
use crate::error::{Error, Result};

/// Minimum number of available copies required before writing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteConsistencyLevel {
    /// Resolved to the configured default before checking
    Default,
    /// The primary alone is enough
    One,
    /// A majority of all known copies
    Quorum,
    /// Every known copy must be assigned
    All,
}

impl WriteConsistencyLevel {
    /// Replace `Default` with `default`
    pub fn resolve(self, default: WriteConsistencyLevel) -> WriteConsistencyLevel {
        match self {
            WriteConsistencyLevel::Default => match default {
                WriteConsistencyLevel::Default => WriteConsistencyLevel::Quorum,
                other => other,
            },
            other => other,
        }
    }
}

impl Default for WriteConsistencyLevel {
    fn default() -> Self {
        WriteConsistencyLevel::Default
    }
}

impl std::fmt::Display for WriteConsistencyLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WriteConsistencyLevel::Default => write!(f, "DEFAULT"),
            WriteConsistencyLevel::One => write!(f, "ONE"),
            WriteConsistencyLevel::Quorum => write!(f, "QUORUM"),
            WriteConsistencyLevel::All => write!(f, "ALL"),
        }
    }
}

impl std::str::FromStr for WriteConsistencyLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "default" => Ok(WriteConsistencyLevel::Default),
            "one" => Ok(WriteConsistencyLevel::One),
            "quorum" => Ok(WriteConsistencyLevel::Quorum),
            "all" => Ok(WriteConsistencyLevel::All),
            other => Err(Error::Config(format!(
                "unknown write consistency level [{}]",
                other
            ))),
        }
    }
}

/// Copy counts the policy is evaluated against
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyCounts {
    /// Non-primary copies that are started or relocating
    pub assigned_replicas: usize,
    /// Copies with no node
    pub unassigned: usize,
    /// Every known copy, the primary included
    pub total: usize,
}

impl CopyCounts {
    /// Count the copies of a shard; an unknown shard has no copies
    pub fn of(table: Option<&IndexShardRoutingTable>) -> Self {
        let Some(table) = table else {
            return Self::default();
        };
        Self {
            assigned_replicas: table.replica_shards().filter(|c| c.active()).count(),
            unassigned: table.shards_with_state(ShardRoutingState::Unassigned).len(),
            total: table.size(),
        }
    }

    /// The primary plus every assigned replica
    pub fn available(&self) -> usize {
        1 + self.assigned_replicas
    }
}

/// Check `level` against the copies of `shard_id`.
///
/// `level` must already be resolved; `Default` is treated as `Quorum`.
pub fn check_write_consistency(
    shard_id: &ShardId,
    level: WriteConsistencyLevel,
    table: Option<&IndexShardRoutingTable>,
) -> Result<()> {
    let counts = CopyCounts::of(table);
    let level = level.resolve(WriteConsistencyLevel::Quorum);

    let passes = match level {
        WriteConsistencyLevel::One => true,
        WriteConsistencyLevel::Quorum | WriteConsistencyLevel::Default => {
            // with one replica or less the primary is a quorum on its own
            counts.total <= 2 || counts.available() >= required_copies(level, &counts)
        }
        WriteConsistencyLevel::All => counts.unassigned == 0,
    };

    if passes {
        return Ok(());
    }

    let required = required_copies(level, &counts);
    tracing::trace!(
        "{} not enough active copies to meet write consistency of [{}] (have {}, needed {})",
        shard_id,
        level,
        counts.available(),
        required
    );
    Err(Error::UnavailableShards {
        shard: shard_id.clone(),
        level,
        active: counts.available(),
        required,
    })
}

fn required_copies(level: WriteConsistencyLevel, counts: &CopyCounts) -> usize {
    match level {
        WriteConsistencyLevel::Quorum | WriteConsistencyLevel::Default if counts.total > 2 => {
            counts.total / 2 + 1
        }
        WriteConsistencyLevel::All => counts.total,
        _ => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ShardRouting;

    fn table(assigned: usize, unassigned: usize) -> (ShardId, IndexShardRoutingTable) {
        let shard = ShardId::new("test", 0);
        let mut copies = vec![ShardRouting::started(shard.clone(), "node-0", true)];
        for i in 0..assigned {
            if i % 2 == 0 {
                copies.push(ShardRouting::started(shard.clone(), format!("node-{}", i + 1), false));
            } else {
                copies.push(ShardRouting::relocating(
                    shard.clone(),
                    format!("node-{}", i + 1),
                    format!("target-{}", i + 1),
                    false,
                ));
            }
        }
        for _ in 0..unassigned {
            copies.push(ShardRouting::unassigned(shard.clone(), false));
        }
        (shard, IndexShardRoutingTable::new(copies))
    }

    #[test]
    fn test_one_always_passes() {
        for assigned in 0..3 {
            for unassigned in 0..3 {
                let (shard, t) = table(assigned, unassigned);
                assert!(check_write_consistency(&shard, WriteConsistencyLevel::One, Some(&t)).is_ok());
            }
        }
    }

    #[test]
    fn test_quorum_matrix() {
        for assigned in 0..3 {
            for unassigned in 0..3 {
                let (shard, t) = table(assigned, unassigned);
                let total = 1 + assigned + unassigned;
                let expected = total <= 2 || assigned + 1 >= total / 2 + 1;
                for level in [WriteConsistencyLevel::Quorum, WriteConsistencyLevel::Default] {
                    let result = check_write_consistency(&shard, level, Some(&t));
                    assert_eq!(
                        result.is_ok(),
                        expected,
                        "level {} assigned {} unassigned {}",
                        level,
                        assigned,
                        unassigned
                    );
                }
            }
        }
    }

    #[test]
    fn test_quorum_failure_reports_counts() {
        let (shard, t) = table(0, 2);
        match check_write_consistency(&shard, WriteConsistencyLevel::Quorum, Some(&t)) {
            Err(Error::UnavailableShards { active, required, level, .. }) => {
                assert_eq!(active, 1);
                assert_eq!(required, 2);
                assert_eq!(level, WriteConsistencyLevel::Quorum);
            }
            other => panic!("expected unavailable shards, got {:?}", other),
        }
    }

    #[test]
    fn test_all_requires_no_unassigned() {
        for assigned in 0..3 {
            for unassigned in 0..3 {
                let (shard, t) = table(assigned, unassigned);
                let result = check_write_consistency(&shard, WriteConsistencyLevel::All, Some(&t));
                assert_eq!(result.is_ok(), unassigned == 0);
            }
        }
    }

    #[test]
    fn test_unknown_shard_is_primary_only() {
        let shard = ShardId::new("gone", 0);
        for level in [
            WriteConsistencyLevel::One,
            WriteConsistencyLevel::Quorum,
            WriteConsistencyLevel::All,
        ] {
            assert!(check_write_consistency(&shard, level, None).is_ok());
        }
    }

    #[test]
    fn test_resolve_and_parse() {
        assert_eq!(
            WriteConsistencyLevel::Default.resolve(WriteConsistencyLevel::All),
            WriteConsistencyLevel::All
        );
        assert_eq!(
            WriteConsistencyLevel::Default.resolve(WriteConsistencyLevel::Default),
            WriteConsistencyLevel::Quorum
        );
        assert_eq!(
            WriteConsistencyLevel::One.resolve(WriteConsistencyLevel::All),
            WriteConsistencyLevel::One
        );
        assert_eq!("ALL".parse::<WriteConsistencyLevel>().unwrap(), WriteConsistencyLevel::All);
        assert!("most".parse::<WriteConsistencyLevel>().is_err());
    }
}
