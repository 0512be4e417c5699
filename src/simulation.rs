//! In-Process Cluster Simulation
//!
//! Runs every shard copy of the configured topology inside this process.
//! Primaries live on the local node; each replica node is a tokio task that
//! serves replica writes from a channel and can be told to misbehave. A
//! router task connects [`TransportReplicas`] to the nodes and to the
//! [`ClusterService`].

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use rand::Rng;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::cluster::{
    ClusterService, ClusterState, ClusterStateSupplier, ShardId, ShardRouting, ShardRoutingState,
};
use crate::config::{FaultKind, ReplicaSpec, ShardRepConfig};
use crate::error::{Error, Result};
use crate::replication::{
    check_write_consistency, ActionListener, MemoryEngine, Primary, ReplicaCommand,
    ReplicaResponse, ReplicaShard, ReplicationConfig, ReplicationOperation, ShardEngine,
    ShardFailure, ShardInfo, ShardPrimary, TransportReplicas, WriteConsistencyLevel, WriteRequest,
    WriteResult,
};

/// Capacity of the command and node channels
const CHANNEL_CAPACITY: usize = 1024;

/// A write forwarded to a replica node
struct NodeRequest {
    replica: ShardRouting,
    request: WriteRequest,
    reply: oneshot::Sender<Result<ReplicaResponse>>,
}

/// A replica copy hosted on a simulated node
struct Placement {
    node: String,
    routing: ShardRouting,
    fault: FaultKind,
}

/// Replica latency model
#[derive(Debug, Clone, Copy)]
struct Latency {
    base_ms: u64,
    jitter_ms: u64,
}

impl Latency {
    fn sample(&self) -> Duration {
        let jitter = if self.jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=self.jitter_ms)
        } else {
            0
        };
        Duration::from_millis(self.base_ms + jitter)
    }
}

/// Build the routing entry of a configured replica
fn replica_routing(shard_id: &ShardId, spec: &ReplicaSpec) -> ShardRouting {
    let node = spec.node.clone().unwrap_or_default();
    match spec.state {
        ShardRoutingState::Unassigned => ShardRouting::unassigned(shard_id.clone(), false),
        ShardRoutingState::Initializing => ShardRouting::initializing(shard_id.clone(), node, false),
        ShardRoutingState::Started => ShardRouting::started(shard_id.clone(), node, false),
        ShardRoutingState::Relocating => ShardRouting::relocating(
            shard_id.clone(),
            node,
            spec.relocating_to.clone().unwrap_or_default(),
            false,
        ),
    }
}

/// Lay out the configured topology: the cluster state plus where every
/// non-primary copy lives.
fn layout(config: &ShardRepConfig) -> (ClusterState, Vec<Placement>) {
    let sim = &config.simulation;
    let mut builder = ClusterState::builder(config.node.id.clone());
    let mut placements = Vec::new();

    for id in 0..sim.shards {
        let shard_id = ShardId::new(sim.index.clone(), id);
        let primary = match &sim.primary_relocating_to {
            Some(target) => ShardRouting::relocating(shard_id.clone(), config.node.id.clone(), target.clone(), true),
            None => ShardRouting::started(shard_id.clone(), config.node.id.clone(), true),
        };
        if let Some(target) = primary.build_target_relocating_shard() {
            placements.push(Placement {
                node: target.current_node_id.clone().unwrap_or_default(),
                routing: target,
                fault: FaultKind::None,
            });
        }

        let mut copies = vec![primary];
        for spec in &sim.replicas {
            let routing = replica_routing(&shard_id, spec);
            if let Some(node) = &routing.current_node_id {
                placements.push(Placement {
                    node: node.clone(),
                    routing: routing.clone(),
                    fault: spec.fault,
                });
            }
            if let Some(target) = routing.build_target_relocating_shard() {
                placements.push(Placement {
                    node: target.current_node_id.clone().unwrap_or_default(),
                    routing: target,
                    fault: FaultKind::None,
                });
            }
            copies.push(routing);
        }
        builder = builder.shard(shard_id, copies);
    }

    (builder.build(), placements)
}

/// Cluster state for the configured topology
pub fn build_cluster_state(config: &ShardRepConfig) -> ClusterState {
    layout(config).0
}

/// Run the write consistency check for every shard at `level`
pub fn consistency_per_shard(
    state: &ClusterState,
    level: WriteConsistencyLevel,
    default: WriteConsistencyLevel,
) -> Vec<(ShardId, Result<()>)> {
    let mut shard_ids = state.shard_ids();
    shard_ids.sort();
    shard_ids
        .into_iter()
        .map(|shard_id| {
            let outcome = check_write_consistency(
                &shard_id,
                level.resolve(default),
                state.shard_routing_table(&shard_id),
            );
            (shard_id, outcome)
        })
        .collect()
}

/// Per-copy view at the end of a run
#[derive(Debug, Clone, Serialize)]
pub struct CopyReport {
    pub node: String,
    pub allocation_id: String,
    pub primary: bool,
    pub state: Option<ShardRoutingState>,
    pub doc_count: usize,
    pub local_checkpoint: i64,
}

/// Per-shard outcome of a run
#[derive(Debug, Clone, Serialize)]
pub struct ShardReport {
    pub shard_id: ShardId,
    pub acknowledged: usize,
    pub rejected: usize,
    /// Rejections by error kind
    pub rejections: BTreeMap<String, usize>,
    /// Shard info of the last acknowledged write
    pub last_shard_info: Option<ShardInfo>,
    pub failures: Vec<ShardFailure>,
    pub global_checkpoint: Option<i64>,
    /// Why the primary was failed, if it was
    pub primary_failure: Option<String>,
    pub copies: Vec<CopyReport>,
}

/// Outcome of [`SimulatedCluster::run`]
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub writes: usize,
    pub cluster_state_version: u64,
    pub shards: Vec<ShardReport>,
}

#[derive(Default)]
struct ShardTally {
    acknowledged: usize,
    rejected: usize,
    rejections: BTreeMap<String, usize>,
    last_shard_info: Option<ShardInfo>,
    failures: Vec<ShardFailure>,
}

/// An in-process cluster built from a [`ShardRepConfig`]
pub struct SimulatedCluster {
    config: ShardRepConfig,
    replication: ReplicationConfig,
    cluster: Arc<ClusterService>,
    primaries: HashMap<ShardId, Arc<ShardPrimary<MemoryEngine>>>,
    copies: HashMap<(String, ShardId), Arc<ReplicaShard<MemoryEngine>>>,
    replicas: Arc<TransportReplicas<WriteRequest>>,
    tasks: Vec<JoinHandle<()>>,
}

impl SimulatedCluster {
    /// Lay out the topology and spawn the node and router tasks
    pub fn start(config: ShardRepConfig) -> Result<Self> {
        config.validate()?;
        let (state, placements) = layout(&config);
        let latency = Latency {
            base_ms: config.simulation.latency_ms,
            jitter_ms: config.simulation.jitter_ms,
        };

        let mut primaries = HashMap::new();
        for shard_id in state.shard_ids() {
            let routing = state
                .shard_routing_table(&shard_id)
                .and_then(|t| t.primary_shard())
                .cloned()
                .ok_or_else(|| Error::Internal(format!("{} laid out without a primary", shard_id)))?;
            let term = state.primary_term(&shard_id);
            let engine = Arc::new(MemoryEngine::new(shard_id.clone()));
            primaries.insert(shard_id, Arc::new(ShardPrimary::new(routing, term, engine)));
        }

        let mut copies = HashMap::new();
        let mut by_node: HashMap<String, (FaultKind, HashMap<ShardId, Arc<ReplicaShard<MemoryEngine>>>)> =
            HashMap::new();
        for placement in placements {
            let shard_id = placement.routing.shard_id.clone();
            let engine = Arc::new(MemoryEngine::new(shard_id.clone()));
            if placement.fault == FaultKind::Corrupt {
                engine.corrupt();
            }
            let started = placement.fault != FaultKind::NotStarted;
            let copy = Arc::new(ReplicaShard::new(
                placement.routing,
                state.primary_term(&shard_id),
                engine,
                started,
            ));
            copies.insert((placement.node.clone(), shard_id.clone()), copy.clone());
            by_node
                .entry(placement.node)
                .or_insert_with(|| (placement.fault, HashMap::new()))
                .1
                .insert(shard_id, copy);
        }

        let mut tasks = Vec::new();
        let mut nodes = HashMap::new();
        for (node, (fault, hosted)) in by_node {
            let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
            tracing::debug!("starting simulated node {} with {} copies, fault {}", node, hosted.len(), fault);
            tasks.push(tokio::spawn(run_node(node.clone(), hosted, fault, latency, rx)));
            nodes.insert(node, tx);
        }

        let cluster = Arc::new(ClusterService::new(state));
        let (command_tx, command_rx) = mpsc::channel(CHANNEL_CAPACITY);
        tasks.push(tokio::spawn(route_commands(command_rx, nodes, cluster.clone())));

        let replicas = Arc::new(TransportReplicas::new(
            command_tx,
            config.replica_timeout(),
            config.shard_failed_timeout(),
        ));

        tracing::info!(
            "simulated cluster started: {} shards, {} copies per shard",
            primaries.len(),
            config.copies_per_shard()
        );

        Ok(Self {
            replication: config.replication_config(),
            config,
            cluster,
            primaries,
            copies,
            replicas,
            tasks,
        })
    }

    pub fn cluster(&self) -> &Arc<ClusterService> {
        &self.cluster
    }

    pub fn primary(&self, shard_id: &ShardId) -> Option<&Arc<ShardPrimary<MemoryEngine>>> {
        self.primaries.get(shard_id)
    }

    /// Replica copy of `shard_id` hosted on `node`
    pub fn replica_copy(&self, node: &str, shard_id: &ShardId) -> Option<&Arc<ReplicaShard<MemoryEngine>>> {
        self.copies.get(&(node.to_string(), shard_id.clone()))
    }

    /// Shard ids in order
    pub fn shard_ids(&self) -> Vec<ShardId> {
        let mut ids: Vec<ShardId> = self.primaries.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Replicate one write and wait for its completion
    pub async fn write(&self, request: WriteRequest) -> Result<WriteResult> {
        let primary = self
            .primaries
            .get(&request.shard_id)
            .cloned()
            .ok_or_else(|| Error::ShardNotFound(request.shard_id.clone()))?;
        let supplier: Arc<dyn ClusterStateSupplier> = self.cluster.clone();
        let (listener, rx) = ActionListener::channel();

        ReplicationOperation::new(
            request,
            primary,
            self.replicas.clone(),
            supplier,
            listener,
            self.replication.clone(),
        )
        .execute()
        .await;

        rx.await
            .map_err(|_| Error::Internal("replication finished without resolving".into()))?
    }

    /// Run the configured workload against every shard
    pub async fn run(&self) -> Result<SimulationReport> {
        let started_at = Utc::now();
        let clock = Instant::now();
        let shard_ids = self.shard_ids();
        let writes = self.config.simulation.writes;

        let requests: Vec<WriteRequest> = (0..writes)
            .flat_map(|i| shard_ids.iter().map(move |shard_id| workload_request(shard_id, i)))
            .collect();
        let total = requests.len();

        let outcomes: Vec<(ShardId, Result<WriteResult>)> = stream::iter(requests)
            .map(|request| async move {
                let shard_id = request.shard_id.clone();
                (shard_id, self.write(request).await)
            })
            .buffer_unordered(self.config.simulation.concurrency)
            .collect()
            .await;

        let mut tallies: HashMap<ShardId, ShardTally> = HashMap::new();
        for (shard_id, outcome) in outcomes {
            let tally = tallies.entry(shard_id).or_default();
            match outcome {
                Ok(result) => {
                    tally.acknowledged += 1;
                    if let Some(info) = result.shard_info {
                        tally.failures.extend(info.failures.iter().cloned());
                        tally.last_shard_info = Some(info);
                    }
                }
                Err(e) => {
                    tracing::debug!("write rejected: {}", e);
                    tally.rejected += 1;
                    *tally.rejections.entry(e.kind_name().to_string()).or_default() += 1;
                }
            }
        }

        let shards = shard_ids
            .iter()
            .map(|shard_id| self.shard_report(shard_id, tallies.remove(shard_id).unwrap_or_default()))
            .collect();

        let report = SimulationReport {
            started_at,
            elapsed_ms: clock.elapsed().as_millis() as u64,
            writes: total,
            cluster_state_version: self.cluster.state().version(),
            shards,
        };
        tracing::info!("simulation finished: {} writes in {} ms", report.writes, report.elapsed_ms);
        Ok(report)
    }

    fn shard_report(&self, shard_id: &ShardId, tally: ShardTally) -> ShardReport {
        let state = self.cluster.state();
        let routing = state.shard_routing_table(shard_id);
        let state_of = |allocation_id: &str| {
            routing.and_then(|t| {
                t.iter()
                    .find(|r| {
                        r.allocation_id_str() == allocation_id
                            || r.build_target_relocating_shard()
                                .map(|target| target.allocation_id_str() == allocation_id)
                                .unwrap_or(false)
                    })
                    .map(|r| r.state)
            })
        };

        let mut copies = Vec::new();
        let primary = self.primaries.get(shard_id);
        if let Some(primary) = primary {
            let entry = primary.routing_entry();
            copies.push(CopyReport {
                node: entry.current_node_id.clone().unwrap_or_default(),
                allocation_id: entry.allocation_id_str().to_string(),
                primary: true,
                state: state_of(entry.allocation_id_str()),
                doc_count: primary.engine().doc_count(),
                local_checkpoint: primary.local_checkpoint(),
            });
        }
        let mut hosted: Vec<(&(String, ShardId), &Arc<ReplicaShard<MemoryEngine>>)> = self
            .copies
            .iter()
            .filter(|((_, id), _)| id == shard_id)
            .collect();
        hosted.sort_by(|a, b| a.0 .0.cmp(&b.0 .0));
        for ((node, _), copy) in hosted {
            copies.push(CopyReport {
                node: node.clone(),
                allocation_id: copy.routing().allocation_id_str().to_string(),
                primary: false,
                state: state_of(copy.routing().allocation_id_str()),
                doc_count: copy.engine().doc_count(),
                local_checkpoint: copy.engine().local_checkpoint(),
            });
        }

        ShardReport {
            shard_id: shard_id.clone(),
            acknowledged: tally.acknowledged,
            rejected: tally.rejected,
            rejections: tally.rejections,
            last_shard_info: tally.last_shard_info,
            failures: tally.failures,
            global_checkpoint: primary.and_then(|p| p.global_checkpoint()),
            primary_failure: primary.and_then(|p| p.failure()),
            copies,
        }
    }

    /// Stop the node and router tasks
    pub fn shutdown(self) {
        for task in &self.tasks {
            task.abort();
        }
        tracing::info!("simulated cluster stopped");
    }
}

/// The `i`-th write of the workload: index a document, with every fifth
/// write deleting an earlier one.
fn workload_request(shard_id: &ShardId, i: usize) -> WriteRequest {
    if i % 5 == 4 {
        WriteRequest::delete(shard_id.clone(), format!("doc-{}", i - 4))
    } else {
        WriteRequest::index(
            shard_id.clone(),
            format!("doc-{}", i),
            serde_json::json!({ "n": i, "at": Utc::now().to_rfc3339() }),
        )
    }
}

/// Serve replica writes for every copy hosted on `node`
async fn run_node(
    node: String,
    hosted: HashMap<ShardId, Arc<ReplicaShard<MemoryEngine>>>,
    fault: FaultKind,
    latency: Latency,
    mut rx: mpsc::Receiver<NodeRequest>,
) {
    let mut swallowed = 0usize;
    while let Some(NodeRequest { replica, request, reply }) = rx.recv().await {
        if fault == FaultKind::Unresponsive {
            tracing::trace!("node {} swallowing write for {}", node, replica);
            swallowed += 1;
            hold_until_abandoned(reply);
            continue;
        }

        let copy = hosted.get(&replica.shard_id).cloned();
        let delay = latency.sample();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let result = match copy {
                Some(copy) if copy.routing().allocation_id_str() == replica.allocation_id_str() => {
                    copy.apply(&request).await
                }
                _ => Err(Error::ShardNotFound(replica.shard_id.clone())),
            };
            let _ = reply.send(result);
        });
    }
    tracing::debug!("node {} stopped, {} writes left unanswered", node, swallowed);
}

/// Keep a reply open without answering, so the caller times out, and release
/// it once the caller stops waiting
fn hold_until_abandoned<T: Send + 'static>(mut reply: oneshot::Sender<T>) -> JoinHandle<()> {
    tokio::spawn(async move { reply.closed().await })
}

/// Deliver transport commands to nodes and to the cluster service
async fn route_commands(
    mut rx: mpsc::Receiver<ReplicaCommand<WriteRequest>>,
    nodes: HashMap<String, mpsc::Sender<NodeRequest>>,
    cluster: Arc<ClusterService>,
) {
    while let Some(command) = rx.recv().await {
        match command {
            ReplicaCommand::Perform { replica, request, reply } => {
                let node = replica.current_node_id.clone().unwrap_or_default();
                let Some(tx) = nodes.get(&node) else {
                    let _ = reply.send(Err(Error::NodeNotFound(node)));
                    continue;
                };
                if let Err(e) = tx.send(NodeRequest { replica, request, reply }).await {
                    let _ = e.0.reply.send(Err(Error::Transport(format!("node {} is down", node))));
                }
            }
            ReplicaCommand::ShardFailed {
                replica,
                primary,
                primary_term,
                message,
                reason,
                reply,
            } => {
                let message = format!("{}: {}", message, reason);
                let response = cluster.shard_failed(&replica, &primary, primary_term, &message);
                let _ = reply.send(response);
            }
        }
    }
}
