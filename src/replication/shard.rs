//! Shard Copies
//!
//! The storage-engine seam, an in-memory engine, and the primary and replica
//! wrappers that execute [`WriteRequest`]s against an engine.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::cluster::{ShardId, ShardRouting};
use crate::error::{Error, Result};

use super::request::{WriteOp, WriteRequest, WriteResult};
use super::{Primary, ReplicaResponse};

/// Outcome of applying one operation to an engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineResult {
    pub seq_no: i64,
    pub created: bool,
}

/// Durable storage for a shard copy
#[async_trait::async_trait]
pub trait ShardEngine: Send + Sync + 'static {
    /// Apply `op`. A primary passes `None` and gets a fresh sequence number;
    /// replicas replay the primary's.
    async fn apply(&self, op: &WriteOp, seq_no: Option<i64>) -> Result<EngineResult>;

    /// Highest sequence number below which every operation is processed
    fn local_checkpoint(&self) -> i64;
}

#[derive(Debug, Clone)]
struct Document {
    seq_no: i64,
    /// `None` marks a delete tombstone
    source: Option<serde_json::Value>,
}

#[derive(Debug)]
struct EngineState {
    docs: HashMap<String, Document>,
    max_seq_no: i64,
    checkpoint: i64,
    /// Processed sequence numbers above the checkpoint
    pending: BTreeSet<i64>,
}

/// In-memory engine keyed by document id
#[derive(Debug)]
pub struct MemoryEngine {
    shard_id: ShardId,
    state: Mutex<EngineState>,
    corrupted: AtomicBool,
}

impl MemoryEngine {
    pub fn new(shard_id: ShardId) -> Self {
        Self {
            shard_id,
            state: Mutex::new(EngineState {
                docs: HashMap::new(),
                max_seq_no: -1,
                checkpoint: -1,
                pending: BTreeSet::new(),
            }),
            corrupted: AtomicBool::new(false),
        }
    }

    /// Make every further write fail as corrupted
    pub fn corrupt(&self) {
        self.corrupted.store(true, Ordering::SeqCst);
    }

    pub fn get(&self, doc_id: &str) -> Option<serde_json::Value> {
        self.lock().docs.get(doc_id).and_then(|d| d.source.clone())
    }

    pub fn doc_count(&self) -> usize {
        self.lock().docs.values().filter(|d| d.source.is_some()).count()
    }

    pub fn max_seq_no(&self) -> i64 {
        self.lock().max_seq_no
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait::async_trait]
impl ShardEngine for MemoryEngine {
    async fn apply(&self, op: &WriteOp, seq_no: Option<i64>) -> Result<EngineResult> {
        if self.corrupted.load(Ordering::SeqCst) {
            return Err(Error::CorruptShard {
                shard: self.shard_id.clone(),
                reason: "store checksum mismatch".into(),
            });
        }

        let mut state = self.lock();
        let seq_no = seq_no.unwrap_or(state.max_seq_no + 1);
        state.max_seq_no = state.max_seq_no.max(seq_no);

        // Replays can arrive out of order; the newest seq_no wins
        let newer_exists = state
            .docs
            .get(op.doc_id())
            .map(|d| d.seq_no > seq_no)
            .unwrap_or(false);

        let created = match op {
            _ if newer_exists => false,
            WriteOp::Index { doc_id, source } => state
                .docs
                .insert(
                    doc_id.clone(),
                    Document {
                        seq_no,
                        source: Some(source.clone()),
                    },
                )
                .map_or(true, |previous| previous.source.is_none()),
            WriteOp::Delete { doc_id } => {
                state.docs.insert(doc_id.clone(), Document { seq_no, source: None });
                false
            }
        };

        if seq_no > state.checkpoint {
            state.pending.insert(seq_no);
        }
        loop {
            let next = state.checkpoint + 1;
            if !state.pending.remove(&next) {
                break;
            }
            state.checkpoint = next;
        }

        Ok(EngineResult { seq_no, created })
    }

    fn local_checkpoint(&self) -> i64 {
        self.lock().checkpoint
    }
}

/// The primary copy of a shard backed by an engine
pub struct ShardPrimary<E: ShardEngine> {
    routing: ShardRouting,
    term: AtomicU64,
    engine: Arc<E>,
    /// Local checkpoint per allocation id
    checkpoints: Mutex<HashMap<String, i64>>,
    failure: Mutex<Option<String>>,
}

impl<E: ShardEngine> ShardPrimary<E> {
    pub fn new(routing: ShardRouting, term: u64, engine: Arc<E>) -> Self {
        Self {
            routing,
            term: AtomicU64::new(term),
            engine,
            checkpoints: Mutex::new(HashMap::new()),
            failure: Mutex::new(None),
        }
    }

    pub fn engine(&self) -> &Arc<E> {
        &self.engine
    }

    /// Reason the copy was failed, if it was
    pub fn failure(&self) -> Option<String> {
        self.failure.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_failed(&self) -> bool {
        self.failure().is_some()
    }

    pub fn known_checkpoints(&self) -> HashMap<String, i64> {
        self.checkpoints.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Lowest checkpoint over every copy heard from
    pub fn global_checkpoint(&self) -> Option<i64> {
        self.checkpoints
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .copied()
            .min()
    }
}

#[async_trait::async_trait]
impl<E: ShardEngine> Primary for ShardPrimary<E> {
    type Request = WriteRequest;
    type ReplicaRequest = WriteRequest;
    type Result = WriteResult;

    fn routing_entry(&self) -> ShardRouting {
        self.routing.clone()
    }

    async fn perform(&self, mut request: WriteRequest) -> Result<WriteResult> {
        if let Some(reason) = self.failure() {
            return Err(Error::ShardFailed {
                shard: self.routing.shard_id.clone(),
                reason,
            });
        }
        if !self.routing.primary {
            return Err(Error::NotPrimary(self.routing.shard_id.clone()));
        }

        let applied = self.engine.apply(&request.op, None).await?;
        request.seq_no = Some(applied.seq_no);
        tracing::trace!(
            "{} applied [{}] on primary with seq_no {}",
            self.routing.shard_id,
            request.op.doc_id(),
            applied.seq_no
        );

        Ok(WriteResult {
            seq_no: applied.seq_no,
            created: applied.created,
            replica_request: request,
            shard_info: None,
        })
    }

    fn primary_term(&self) -> u64 {
        self.term.load(Ordering::Acquire)
    }

    fn fail_shard(&self, message: &str, cause: &Error) {
        tracing::error!("{} failing primary {}: {} ({})", self.routing.shard_id, self.routing, message, cause);
        let mut failure = self.failure.lock().unwrap_or_else(|e| e.into_inner());
        if failure.is_none() {
            *failure = Some(format!("{}: {}", message, cause));
        }
    }

    fn local_checkpoint(&self) -> i64 {
        self.engine.local_checkpoint()
    }

    fn update_local_checkpoint_for_shard(&self, allocation_id: &str, checkpoint: i64) {
        let mut checkpoints = self.checkpoints.lock().unwrap_or_else(|e| e.into_inner());
        let entry = checkpoints.entry(allocation_id.to_string()).or_insert(checkpoint);
        *entry = (*entry).max(checkpoint);
    }
}

/// A replica copy of a shard backed by an engine
pub struct ReplicaShard<E: ShardEngine> {
    routing: ShardRouting,
    engine: Arc<E>,
    /// Highest primary term seen
    operation_term: AtomicU64,
    started: AtomicBool,
}

impl<E: ShardEngine> ReplicaShard<E> {
    pub fn new(routing: ShardRouting, term: u64, engine: Arc<E>, started: bool) -> Self {
        Self {
            routing,
            engine,
            operation_term: AtomicU64::new(term),
            started: AtomicBool::new(started),
        }
    }

    pub fn routing(&self) -> &ShardRouting {
        &self.routing
    }

    pub fn engine(&self) -> &Arc<E> {
        &self.engine
    }

    pub fn mark_started(&self) {
        self.started.store(true, Ordering::SeqCst);
    }

    /// Replay a write executed by the primary
    pub async fn apply(&self, request: &WriteRequest) -> Result<ReplicaResponse> {
        let shard_id = &self.routing.shard_id;
        if !self.started.load(Ordering::SeqCst) {
            return Err(Error::ShardNotStarted(shard_id.clone()));
        }

        let current_term = self.operation_term.fetch_max(request.primary_term, Ordering::AcqRel);
        if request.primary_term < current_term {
            return Err(Error::StalePrimaryTerm {
                shard: shard_id.clone(),
                request_term: request.primary_term,
                current_term,
            });
        }

        let seq_no = request.seq_no.ok_or_else(|| {
            Error::Internal(format!("{} replica request without seq_no", shard_id))
        })?;
        self.engine.apply(&request.op, Some(seq_no)).await?;

        Ok(ReplicaResponse {
            allocation_id: self.routing.allocation_id_str().to_string(),
            local_checkpoint: self.engine.local_checkpoint(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn shard() -> ShardId {
        ShardId::new("test", 0)
    }

    #[tokio::test]
    async fn test_engine_checkpoint_tracks_gaps() {
        let engine = MemoryEngine::new(shard());
        let op = |id: &str| WriteOp::Index {
            doc_id: id.to_string(),
            source: json!({"id": id}),
        };

        engine.apply(&op("a"), Some(0)).await.unwrap();
        engine.apply(&op("c"), Some(2)).await.unwrap();
        assert_eq!(engine.local_checkpoint(), 0);
        assert_eq!(engine.max_seq_no(), 2);

        engine.apply(&op("b"), Some(1)).await.unwrap();
        assert_eq!(engine.local_checkpoint(), 2);
        assert_eq!(engine.doc_count(), 3);
    }

    #[tokio::test]
    async fn test_engine_keeps_newest_version() {
        let engine = MemoryEngine::new(shard());
        engine
            .apply(&WriteOp::Index { doc_id: "a".into(), source: json!({"v": 2}) }, Some(5))
            .await
            .unwrap();
        engine
            .apply(&WriteOp::Index { doc_id: "a".into(), source: json!({"v": 1}) }, Some(3))
            .await
            .unwrap();
        assert_eq!(engine.get("a"), Some(json!({"v": 2})));
    }

    #[tokio::test]
    async fn test_engine_delete_survives_late_index() {
        let engine = MemoryEngine::new(shard());
        engine
            .apply(&WriteOp::Delete { doc_id: "a".into() }, Some(4))
            .await
            .unwrap();
        let late = engine
            .apply(&WriteOp::Index { doc_id: "a".into(), source: json!({"v": 1}) }, Some(2))
            .await
            .unwrap();
        assert!(!late.created);
        assert_eq!(engine.get("a"), None);
        assert_eq!(engine.doc_count(), 0);

        let recreated = engine
            .apply(&WriteOp::Index { doc_id: "a".into(), source: json!({"v": 3}) }, Some(7))
            .await
            .unwrap();
        assert!(recreated.created);
        assert_eq!(engine.doc_count(), 1);
    }

    #[tokio::test]
    async fn test_primary_assigns_seq_no_and_fails() {
        let routing = ShardRouting::started(shard(), "node-1", true);
        let primary = ShardPrimary::new(routing, 4, Arc::new(MemoryEngine::new(shard())));

        let result = primary
            .perform(WriteRequest::index(shard(), "doc", json!({"x": 1})))
            .await
            .unwrap();
        assert_eq!(result.seq_no, 0);
        assert!(result.created);
        assert_eq!(result.replica_request.seq_no, Some(0));
        assert_eq!(primary.local_checkpoint(), 0);

        primary.fail_shard("demoted", &Error::Internal("test".into()));
        assert!(primary.is_failed());
        let err = primary
            .perform(WriteRequest::delete(shard(), "doc"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ShardFailed { .. }));
    }

    #[tokio::test]
    async fn test_primary_checkpoints() {
        let routing = ShardRouting::started(shard(), "node-1", true);
        let primary = ShardPrimary::new(routing, 1, Arc::new(MemoryEngine::new(shard())));
        primary.update_local_checkpoint_for_shard("a", 5);
        primary.update_local_checkpoint_for_shard("b", 3);
        primary.update_local_checkpoint_for_shard("a", 4);
        assert_eq!(primary.known_checkpoints()["a"], 5);
        assert_eq!(primary.global_checkpoint(), Some(3));
    }

    #[tokio::test]
    async fn test_replica_rejects_stale_term_and_unstarted() {
        let routing = ShardRouting::started(shard(), "node-2", false);
        let replica = ReplicaShard::new(routing, 2, Arc::new(MemoryEngine::new(shard())), false);

        let mut request = WriteRequest::index(shard(), "doc", json!({}));
        request.seq_no = Some(0);
        request.primary_term = 2;
        assert!(matches!(
            replica.apply(&request).await,
            Err(Error::ShardNotStarted(_))
        ));

        replica.mark_started();
        let response = replica.apply(&request).await.unwrap();
        assert_eq!(response.local_checkpoint, 0);

        request.primary_term = 1;
        request.seq_no = Some(1);
        assert!(matches!(
            replica.apply(&request).await,
            Err(Error::StalePrimaryTerm { current_term: 2, .. })
        ));
    }
}
