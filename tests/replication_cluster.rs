//! Replication Cluster Tests
//!
//! End-to-end scenarios against the in-process simulated cluster:
//! - Healthy fan-out, including relocation targets
//! - Shard-fatal replica failures remove the copy from the routing table
//! - Transient replica failures are reported but keep the copy
//! - A demoted primary fails itself and asks for a retry
//! - Consistency rejections leave the primary untouched

use std::io::Write;

use serde_json::json;
use shardrep::cluster::{ClusterStateSupplier, ShardId, ShardRoutingState};
use shardrep::config::ShardRepConfig;
use shardrep::replication::{
    Primary, ReplicaFailureKind, ShardEngine, WriteConsistencyLevel, WriteRequest,
};
use shardrep::simulation::SimulatedCluster;
use shardrep::Error;

fn cluster(toml: &str) -> SimulatedCluster {
    let config = ShardRepConfig::from_str(&format!(
        "[node]\nid = \"node-1\"\n\n[replication]\nreplica_timeout_ms = 100\nshard_failed_timeout_ms = 500\n\n{}",
        toml
    ))
    .unwrap();
    SimulatedCluster::start(config).unwrap()
}

fn shard() -> ShardId {
    ShardId::new("docs", 0)
}

fn index(doc: &str) -> WriteRequest {
    WriteRequest::index(shard(), doc, json!({ "doc": doc }))
}

// =============================================================================
// Healthy cluster
// =============================================================================

/// Every copy, relocation target included, receives every write.
#[tokio::test]
async fn test_writes_reach_relocation_targets() {
    let cluster = cluster(
        r#"
[[simulation.replicas]]
node = "node-2"
state = "relocating"
relocating_to = "node-4"

[[simulation.replicas]]
node = "node-3"
"#,
    );

    for i in 0..5 {
        let result = cluster.write(index(&format!("doc-{}", i))).await.unwrap();
        let info = result.shard_info.unwrap();
        assert_eq!((info.total, info.successful, info.failed), (4, 4, 0));
        assert_eq!(result.seq_no, i);
    }

    for node in ["node-2", "node-3", "node-4"] {
        let copy = cluster.replica_copy(node, &shard()).unwrap();
        assert_eq!(copy.engine().doc_count(), 5, "{} is missing writes", node);
        assert_eq!(copy.engine().local_checkpoint(), 4);
    }

    let primary = cluster.primary(&shard()).unwrap();
    assert_eq!(primary.global_checkpoint(), Some(4));
    assert_eq!(primary.known_checkpoints().len(), 4);
    cluster.shutdown();
}

/// Replicas stamp the primary term they saw.
#[tokio::test]
async fn test_replica_request_carries_primary_term() {
    let cluster = cluster("");
    let result = cluster.write(index("a")).await.unwrap();
    assert_eq!(result.replica_request.primary_term, 1);
    assert_eq!(result.replica_request.seq_no, Some(0));
    cluster.shutdown();
}

// =============================================================================
// Replica failures
// =============================================================================

/// A corrupted replica is failed and dropped from later writes.
#[tokio::test]
async fn test_corrupt_replica_is_failed() {
    let cluster = cluster(
        r#"
[[simulation.replicas]]
node = "node-2"

[[simulation.replicas]]
node = "node-3"
fault = "corrupt"
"#,
    );
    let version = cluster.cluster().state().version();

    let first = cluster.write(index("a")).await.unwrap().shard_info.unwrap();
    assert_eq!((first.total, first.successful, first.failed), (3, 2, 1));
    let failure = &first.failures[0];
    assert_eq!(failure.node_id.as_deref(), Some("node-3"));
    assert_eq!(failure.kind, ReplicaFailureKind::ShardFatal);
    assert_eq!(failure.cause, "corrupt_shard");
    assert!(!failure.primary);

    let state = cluster.cluster().state();
    assert!(state.version() > version);
    let table = state.shard_routing_table(&shard()).unwrap();
    assert!(table.iter().all(|c| c.current_node_id.as_deref() != Some("node-3")));
    assert_eq!(table.shards_with_state(ShardRoutingState::Unassigned).len(), 1);

    let second = cluster.write(index("b")).await.unwrap().shard_info.unwrap();
    assert_eq!((second.total, second.successful, second.failed), (2, 2, 0));
    cluster.shutdown();
}

/// An unanswered replica times out and is failed.
#[tokio::test]
async fn test_unresponsive_replica_times_out() {
    let cluster = cluster(
        r#"
[[simulation.replicas]]
node = "node-2"
fault = "unresponsive"
"#,
    );

    let info = cluster.write(index("a")).await.unwrap().shard_info.unwrap();
    assert_eq!((info.total, info.successful, info.failed), (2, 1, 1));
    assert_eq!(info.failures[0].cause, "replica_timeout");

    let state = cluster.cluster().state();
    let table = state.shard_routing_table(&shard()).unwrap();
    assert_eq!(table.shards_with_state(ShardRoutingState::Unassigned).len(), 1);
    cluster.shutdown();
}

/// A copy that is not started yet is reported but stays in the table.
#[tokio::test]
async fn test_not_started_replica_is_transient() {
    let cluster = cluster(
        r#"
[[simulation.replicas]]
node = "node-2"
state = "initializing"
fault = "not_started"

[[simulation.replicas]]
node = "node-3"
"#,
    );
    let version = cluster.cluster().state().version();

    for doc in ["a", "b"] {
        let info = cluster.write(index(doc)).await.unwrap().shard_info.unwrap();
        assert_eq!((info.total, info.successful, info.failed), (3, 2, 1));
        assert_eq!(info.failures[0].kind, ReplicaFailureKind::Transient);
        assert_eq!(info.failures[0].cause, "shard_not_started");
    }

    assert_eq!(cluster.cluster().state().version(), version);
    cluster.shutdown();
}

// =============================================================================
// Primary demotion
// =============================================================================

/// Failing a replica after another copy was promoted demotes this primary.
#[tokio::test]
async fn test_demoted_primary_requests_retry() {
    let cluster = cluster(
        r#"
[[simulation.replicas]]
node = "node-2"

[[simulation.replicas]]
node = "node-3"
fault = "corrupt"
"#,
    );

    let term = cluster.cluster().promote(&shard(), "node-2").unwrap();
    assert_eq!(term, 2);

    let err = cluster.write(index("a")).await.unwrap_err();
    assert!(matches!(err, Error::RetryOnPrimary { .. }), "unexpected {:?}", err);
    assert!(err.is_retryable());

    let primary = cluster.primary(&shard()).unwrap();
    assert!(primary.is_failed());
    assert_eq!(primary.primary_term(), 1);

    let err = cluster.write(index("b")).await.unwrap_err();
    assert!(matches!(err, Error::ShardFailed { .. }));
    cluster.shutdown();
}

// =============================================================================
// Consistency and shadow replicas
// =============================================================================

/// ALL with an unassigned copy is rejected before the primary runs.
#[tokio::test]
async fn test_all_consistency_rejects_before_primary() {
    let cluster = cluster(
        r#"
[[simulation.replicas]]
node = "node-2"

[[simulation.replicas]]
state = "unassigned"
"#,
    );

    let err = cluster
        .write(index("a").with_consistency(WriteConsistencyLevel::All))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::UnavailableShards {
            level: WriteConsistencyLevel::All,
            ..
        }
    ));
    assert_eq!(cluster.primary(&shard()).unwrap().engine().doc_count(), 0);

    // QUORUM of 3 needs 2: primary plus node-2
    let info = cluster.write(index("b")).await.unwrap().shard_info.unwrap();
    assert_eq!((info.total, info.successful), (2, 2));
    cluster.shutdown();
}

/// With replication disabled only the primary executes.
#[tokio::test]
async fn test_shadow_replicas_skip_fan_out() {
    let config = ShardRepConfig::from_str(
        "[node]\nid = \"node-1\"\n\n[replication]\nexecute_on_replicas = false\n",
    )
    .unwrap();
    let cluster = SimulatedCluster::start(config).unwrap();
    let info = cluster.write(index("a")).await.unwrap().shard_info.unwrap();
    assert_eq!((info.total, info.successful, info.failed), (1, 1, 0));
    assert_eq!(cluster.replica_copy("node-2", &shard()).unwrap().engine().doc_count(), 0);
    cluster.shutdown();
}

// =============================================================================
// Full run
// =============================================================================

/// A configured run from a file produces a serializable report.
#[tokio::test]
async fn test_simulation_run_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
[node]
id = "node-1"

[replication]
replica_timeout_ms = 200

[simulation]
shards = 2
writes = 25
concurrency = 4
jitter_ms = 2

[[simulation.replicas]]
node = "node-2"

[[simulation.replicas]]
node = "node-3"
fault = "corrupt"
"#
    )
    .unwrap();

    let config = ShardRepConfig::from_file(file.path()).unwrap();
    let cluster = SimulatedCluster::start(config).unwrap();
    let report = cluster.run().await.unwrap();
    cluster.shutdown();

    assert_eq!(report.writes, 50);
    assert_eq!(report.shards.len(), 2);
    for shard in &report.shards {
        assert_eq!(shard.acknowledged, 25);
        assert!(shard.primary_failure.is_none());
        assert!(shard
            .failures
            .iter()
            .all(|f| f.node_id.as_deref() == Some("node-3")));
        assert!(!shard.failures.is_empty());

        let primary = &shard.copies[0];
        let healthy = shard.copies.iter().find(|c| c.node == "node-2").unwrap();
        assert_eq!(healthy.doc_count, primary.doc_count);
    }

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["shards"][0]["shard_id"]["index"], "docs");
}
