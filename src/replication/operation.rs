//! Replication Operation
//!
//! Drives one write through a shard: consistency check, execution on the
//! primary, fan-out to every replica copy, and a single completion.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::cluster::{ClusterState, ClusterStateSupplier, ShardId, ShardRouting};
use crate::error::{Error, Result};

use super::consistency::check_write_consistency;
use super::listener::ActionListener;
use super::shard_info::{ReplicaFailureKind, ShardFailure, ShardInfoAggregator};
use super::{FailShardOutcome, Primary, PrimaryResult, ReplicaResponse, Replicas, ReplicationConfig, ReplicationRequest};

/// Copies that must receive a write for `shard_id`, seen from the local node.
///
/// Every assigned copy on another node is included, and so is the target of
/// any relocation not heading to the local node. An unknown shard yields an
/// empty set.
pub fn replica_targets(state: &ClusterState, shard_id: &ShardId) -> HashSet<ShardRouting> {
    let mut targets = HashSet::new();
    let Some(table) = state.shard_routing_table(shard_id) else {
        return targets;
    };
    let local_node_id = state.local_node_id();

    for copy in table {
        if copy.unassigned_state() {
            continue;
        }
        if copy.current_node_id.as_deref() != Some(local_node_id) {
            targets.insert(copy.clone());
        }
        if copy.is_relocating() && copy.relocating_node_id.as_deref() != Some(local_node_id) {
            if let Some(target) = copy.build_target_relocating_shard() {
                targets.insert(target);
            }
        }
    }

    targets
}

/// A single replication attempt.
///
/// `execute` consumes the operation, so it runs at most once.
pub struct ReplicationOperation<P, R>
where
    P: Primary,
    R: Replicas<P::ReplicaRequest>,
{
    request: P::Request,
    primary: Arc<P>,
    replicas: Arc<R>,
    cluster_state: Arc<dyn ClusterStateSupplier>,
    listener: ActionListener<P::Result>,
    config: ReplicationConfig,
}

impl<P, R> ReplicationOperation<P, R>
where
    P: Primary,
    R: Replicas<P::ReplicaRequest>,
{
    /// Create a new operation
    pub fn new(
        request: P::Request,
        primary: Arc<P>,
        replicas: Arc<R>,
        cluster_state: Arc<dyn ClusterStateSupplier>,
        listener: ActionListener<P::Result>,
        config: ReplicationConfig,
    ) -> Self {
        Self {
            request,
            primary,
            replicas,
            cluster_state,
            listener,
            config,
        }
    }

    /// Check the request's consistency level against the current topology
    pub fn check_write_consistency(&self) -> Result<()> {
        let state = self.cluster_state.state();
        self.check_write_consistency_in(&state)
    }

    fn check_write_consistency_in(&self, state: &ClusterState) -> Result<()> {
        let shard_id = self.request.shard_id();
        let level = self
            .request
            .consistency_level()
            .resolve(self.config.default_consistency);
        check_write_consistency(shard_id, level, state.shard_routing_table(shard_id))
    }

    /// Run the operation.
    ///
    /// Returns once the primary has executed and replica requests are in
    /// flight; the outcome is delivered to the listener exactly once.
    pub async fn execute(self) {
        let state = self.cluster_state.state();

        if self.config.check_write_consistency {
            if let Err(e) = self.check_write_consistency_in(&state) {
                tracing::debug!(
                    "{} op [{}] not attempted: {}",
                    self.request.shard_id(),
                    self.config.op_type,
                    e
                );
                self.listener.on_failure(e);
                return;
            }
        }

        let Self {
            request,
            primary,
            replicas,
            listener,
            config,
            ..
        } = self;

        let primary_routing = primary.routing_entry();
        let shard_id = primary_routing.shard_id.clone();

        let mut result = match primary.perform(request).await {
            Ok(result) => result,
            Err(e) => {
                tracing::debug!("{} op [{}] failed on primary: {}", shard_id, config.op_type, e);
                listener.on_failure(e);
                return;
            }
        };

        let primary_term = primary.primary_term();
        result.replica_request_mut().set_primary_term(primary_term);
        let replica_request = result.replica_request().clone();
        tracing::trace!(
            "{} op [{}] completed on primary, term {}",
            shard_id,
            config.op_type,
            primary_term
        );

        let targets = if config.execute_on_replicas {
            replica_targets(&state, &shard_id)
        } else {
            HashSet::new()
        };

        let operation = Arc::new(OperationState {
            shard_id,
            op_type: config.op_type,
            primary_routing,
            primary_term,
            primary,
            replicas,
            pending: AtomicUsize::new(1 + targets.len()),
            finished: AtomicBool::new(false),
            demoted: AtomicBool::new(false),
            dispatched: Mutex::new(HashSet::new()),
            aggregator: ShardInfoAggregator::new(1 + targets.len()),
            result: Mutex::new(Some(result)),
            listener,
        });

        operation.aggregator.record_success();
        operation.primary.update_local_checkpoint_for_shard(
            operation.primary_routing.allocation_id_str(),
            operation.primary.local_checkpoint(),
        );

        for replica in targets {
            operation.register_dispatch(&replica);
            let op = operation.clone();
            let request = replica_request.clone();
            tokio::spawn(async move {
                op.perform_on_replica(replica, request).await;
            });
        }

        operation.dec_pending_and_finish_if_needed();
    }
}

/// Per-attempt bookkeeping shared by the replica tasks
struct OperationState<P, R>
where
    P: Primary,
{
    shard_id: ShardId,
    op_type: String,
    primary_routing: ShardRouting,
    primary_term: u64,
    primary: Arc<P>,
    replicas: Arc<R>,
    /// Outcomes still to be accounted
    pending: AtomicUsize,
    finished: AtomicBool,
    demoted: AtomicBool,
    dispatched: Mutex<HashSet<ShardRouting>>,
    aggregator: ShardInfoAggregator,
    result: Mutex<Option<P::Result>>,
    listener: ActionListener<P::Result>,
}

impl<P, R> OperationState<P, R>
where
    P: Primary,
    R: Replicas<P::ReplicaRequest>,
{
    fn register_dispatch(&self, replica: &ShardRouting) {
        let inserted = self
            .dispatched
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(replica.clone());
        assert!(inserted, "{} replica {} dispatched twice", self.shard_id, replica);
    }

    async fn perform_on_replica(self: Arc<Self>, replica: ShardRouting, request: P::ReplicaRequest) {
        tracing::trace!(
            "{} sending op [{}] to replica {}",
            self.shard_id,
            self.op_type,
            replica
        );

        match self.replicas.perform_on(&replica, request).await {
            Ok(response) => self.on_replica_response(&replica, response),
            Err(e) => self.on_replica_failure(&replica, e).await,
        }
    }

    fn on_replica_response(&self, replica: &ShardRouting, response: ReplicaResponse) {
        tracing::trace!("{} op [{}] completed on replica {}", self.shard_id, self.op_type, replica);
        self.aggregator.record_success();
        self.primary
            .update_local_checkpoint_for_shard(&response.allocation_id, response.local_checkpoint);
        self.dec_pending_and_finish_if_needed();
    }

    async fn on_replica_failure(&self, replica: &ShardRouting, error: Error) {
        let kind = self.replicas.classify_failure(&error);

        if kind == ReplicaFailureKind::Transient {
            tracing::trace!(
                "{} op [{}] skipped on replica {}: {}",
                self.shard_id,
                self.op_type,
                replica,
                error
            );
            self.account_failure(replica, &error, kind);
            return;
        }

        let message = format!("failed to perform {} on replica {}", self.op_type, replica);
        tracing::warn!("{} {}: {}", self.shard_id, message, error);

        let outcome = self
            .replicas
            .fail_shard(replica, &self.primary_routing, self.primary_term, &message, &error)
            .await;

        match outcome {
            FailShardOutcome::Failed => self.account_failure(replica, &error, kind),
            FailShardOutcome::Ignored(reason) => {
                tracing::debug!(
                    "{} failing replica {} was ignored: {}",
                    self.shard_id,
                    replica,
                    reason
                );
                self.account_failure(replica, &error, kind);
            }
            FailShardOutcome::PrimaryDemoted(reason) => self.on_primary_demoted(reason),
        }
    }

    fn account_failure(&self, replica: &ShardRouting, error: &Error, kind: ReplicaFailureKind) {
        self.aggregator
            .record_failure(ShardFailure::for_replica(replica, error, kind));
        self.dec_pending_and_finish_if_needed();
    }

    fn on_primary_demoted(&self, reason: Error) {
        // Several replicas may report the demotion; the first one fails us
        if self.demoted.swap(true, Ordering::AcqRel) {
            return;
        }
        let message = format!(
            "primary shard [{}] was demoted while failing replica shard",
            self.primary_routing
        );
        tracing::error!("{} {}: {}", self.shard_id, message, reason);
        self.primary.fail_shard(&message, &reason);
        self.finish_as_failed(Error::RetryOnPrimary {
            shard: self.shard_id.clone(),
            reason: format!("{}: {}", message, reason),
        });
    }

    fn dec_pending_and_finish_if_needed(&self) {
        let previous = self.pending.fetch_sub(1, Ordering::AcqRel);
        assert!(previous > 0, "{} pending outcome count underflow", self.shard_id);
        if previous == 1 {
            self.finish();
        }
    }

    fn finish(&self) {
        if self
            .finished
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let shard_info = self.aggregator.finish();
        let Some(mut result) = self.result.lock().unwrap_or_else(|e| e.into_inner()).take() else {
            tracing::error!("{} op [{}] finished without a primary result", self.shard_id, self.op_type);
            return;
        };
        tracing::debug!("{} op [{}] finished: {}", self.shard_id, self.op_type, shard_info);
        result.set_shard_info(shard_info);
        self.listener.on_response(result);
    }

    fn finish_as_failed(&self, error: Error) {
        if self
            .finished
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.listener.on_failure(error);
        }
    }
}
