//! Cluster awareness: node identity, task dispatch, remote routing.
//!
//! The routing caches are cluster-wide; sessions are not. When a route
//! points at another node, work is shipped there as a [`ClusterTask`]
//! through the [`ClusterRpc`] seam. Synchronous dispatch is bounded by
//! [`CLUSTER_TASK_TIMEOUT`] so a hung peer degrades into an error instead
//! of a stuck routing path; session close is fire-and-forget after a short
//! grace period.

pub mod remote;

use async_trait::async_trait;
use jid::Jid;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::session::SessionStatus;
use crate::stanza::Packet;

/// Upper bound on synchronous cluster calls.
pub const CLUSTER_TASK_TIMEOUT: Duration = Duration::from_secs(15);

/// Grace period for remote session close before falling back to
/// fire-and-forget.
pub const CLUSTER_CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Identity of one cluster node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(Uuid);

impl NodeId {
    /// Generate a fresh node id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing id.
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Errors from cluster dispatch.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// The node did not answer within the task timeout.
    #[error("cluster task to node {0} timed out")]
    Timeout(NodeId),
    /// The node is not part of the cluster (anymore).
    #[error("cluster node {0} unreachable")]
    NodeUnreachable(NodeId),
    /// The remote node reported a failure.
    #[error("cluster task failed: {0}")]
    TaskFailed(String),
}

/// Operations executed against a session hosted on another node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RemoteSessionOperation {
    /// Read the session's lifecycle state.
    GetStatus,
    /// Read the post-bind initialization flag.
    IsInitialized,
    /// Read the cached broadcast presence, serialized.
    GetPresence,
    /// Challenge the session in a resource conflict.
    IncrementConflictCount,
    /// Deliver a stanza, serialized.
    DeliverPacket {
        /// Serialized stanza
        xml: String,
    },
    /// Deliver raw negotiation text.
    DeliverRawText {
        /// Pre-serialized XML
        text: String,
    },
    /// Terminate the session.
    Close,
}

/// Replies to [`RemoteSessionOperation`]s.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RemoteReply {
    /// Lifecycle state
    Status(SessionStatus),
    /// Boolean answer
    Flag(bool),
    /// Serialized presence, absent when none was broadcast
    Presence(Option<String>),
    /// Conflict count after the challenge
    ConflictCount(u32),
    /// Operation completed without a value
    Ack,
}

/// A unit of work addressed to another cluster node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClusterTask {
    /// Operate on one session.
    Session {
        /// Address of the target session
        jid: String,
        /// What to do with it
        operation: RemoteSessionOperation,
    },
    /// Route a stanza on the target node.
    RoutePacket {
        /// Recipient address
        recipient: String,
        /// Serialized stanza
        xml: String,
    },
    /// Deliver a stanza to every local client session of the target node.
    BroadcastPacket {
        /// Serialized stanza
        xml: String,
    },
}

/// Transport seam for cluster task dispatch.
#[async_trait]
pub trait ClusterRpc: Send + Sync {
    /// Execute a task on `node` and wait for its reply. Implementations do
    /// not need to enforce a timeout; [`dispatch_sync`] does.
    async fn execute(&self, node: NodeId, task: ClusterTask) -> Result<RemoteReply, ClusterError>;

    /// Ship a task without waiting for an outcome.
    fn execute_no_wait(&self, node: NodeId, task: ClusterTask);
}

/// Execute a cluster task with the standard bounded wait.
pub async fn dispatch_sync(
    rpc: &dyn ClusterRpc,
    node: NodeId,
    task: ClusterTask,
) -> Result<RemoteReply, ClusterError> {
    tokio::time::timeout(CLUSTER_TASK_TIMEOUT, rpc.execute(node, task))
        .await
        .map_err(|_| ClusterError::Timeout(node))?
}

/// Routes stanzas to sessions hosted on other nodes.
#[async_trait]
pub trait RemotePacketRouter: Send + Sync {
    /// Hand a stanza to `node` for delivery to `recipient`. Returns whether
    /// the node accepted it.
    async fn route_packet(&self, node: NodeId, recipient: &Jid, packet: &Packet) -> bool;

    /// Deliver a stanza to every client session on every other node.
    async fn broadcast_packet(&self, packet: &Packet);
}

/// Stand-alone operation: no other nodes, nothing to route remotely.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCluster;

#[async_trait]
impl RemotePacketRouter for NoCluster {
    async fn route_packet(&self, _node: NodeId, _recipient: &Jid, _packet: &Packet) -> bool {
        false
    }

    async fn broadcast_packet(&self, _packet: &Packet) {}
}
