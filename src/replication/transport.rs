//! Replica Transport
//!
//! A [`Replicas`] implementation that hands commands to a transport task
//! over a channel and waits for the reply with a timeout. The receiving side
//! owns delivery to replica nodes and to the cluster service.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

use crate::cluster::{ShardFailedResponse, ShardRouting};
use crate::error::{Error, Result};

use super::{FailShardOutcome, ReplicaResponse, Replicas, ReplicationRequest};

/// Commands sent to the transport task
#[derive(Debug)]
pub enum ReplicaCommand<R> {
    /// Execute a write on a replica copy
    Perform {
        replica: ShardRouting,
        request: R,
        reply: oneshot::Sender<Result<ReplicaResponse>>,
    },

    /// Ask the cluster service to fail a replica copy
    ShardFailed {
        replica: ShardRouting,
        primary: ShardRouting,
        primary_term: u64,
        message: String,
        reason: String,
        reply: oneshot::Sender<ShardFailedResponse>,
    },
}

/// Channel-backed replica proxy
pub struct TransportReplicas<R> {
    sender: mpsc::Sender<ReplicaCommand<R>>,
    /// Per-replica request timeout
    replica_timeout: Duration,
    /// Timeout for shard failure requests
    shard_failed_timeout: Duration,
}

impl<R> TransportReplicas<R> {
    pub fn new(
        sender: mpsc::Sender<ReplicaCommand<R>>,
        replica_timeout: Duration,
        shard_failed_timeout: Duration,
    ) -> Self {
        Self {
            sender,
            replica_timeout,
            shard_failed_timeout,
        }
    }
}

#[async_trait::async_trait]
impl<R: ReplicationRequest> Replicas<R> for TransportReplicas<R> {
    async fn perform_on(&self, replica: &ShardRouting, request: R) -> Result<ReplicaResponse> {
        let node = replica
            .current_node_id
            .clone()
            .ok_or_else(|| Error::NodeNotFound(format!("{} is unassigned", replica)))?;

        let limit = request
            .timeout()
            .map_or(self.replica_timeout, |t| t.min(self.replica_timeout));

        let (reply, rx) = oneshot::channel();
        self.sender
            .send(ReplicaCommand::Perform {
                replica: replica.clone(),
                request,
                reply,
            })
            .await
            .map_err(|_| Error::Transport("replica transport is closed".into()))?;

        match timeout(limit, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Transport(format!(
                "connection to {} dropped the request",
                node
            ))),
            Err(_) => Err(Error::ReplicaTimeout {
                node,
                timeout_ms: limit.as_millis() as u64,
            }),
        }
    }

    async fn fail_shard(
        &self,
        replica: &ShardRouting,
        primary: &ShardRouting,
        primary_term: u64,
        message: &str,
        cause: &Error,
    ) -> FailShardOutcome {
        let shard = replica.shard_id.clone();
        let (reply, rx) = oneshot::channel();
        let sent = self
            .sender
            .send(ReplicaCommand::ShardFailed {
                replica: replica.clone(),
                primary: primary.clone(),
                primary_term,
                message: message.to_string(),
                reason: cause.to_string(),
                reply,
            })
            .await;
        if sent.is_err() {
            return FailShardOutcome::Ignored(Error::Transport(
                "cluster service channel is closed".into(),
            ));
        }

        match timeout(self.shard_failed_timeout, rx).await {
            Ok(Ok(ShardFailedResponse::Acknowledged)) => FailShardOutcome::Failed,
            Ok(Ok(ShardFailedResponse::NoLongerPrimary(reason))) => {
                FailShardOutcome::PrimaryDemoted(Error::NoLongerPrimary { shard, reason })
            }
            Ok(Ok(ShardFailedResponse::Ignored(reason))) => {
                FailShardOutcome::Ignored(Error::ShardFailureIgnored { shard, reason })
            }
            Ok(Err(_)) => FailShardOutcome::Ignored(Error::Transport(
                "cluster service dropped the shard failure".into(),
            )),
            Err(_) => FailShardOutcome::Ignored(Error::ShardFailureIgnored {
                shard,
                reason: format!(
                    "no answer within {} ms",
                    self.shard_failed_timeout.as_millis()
                ),
            }),
        }
    }
}
