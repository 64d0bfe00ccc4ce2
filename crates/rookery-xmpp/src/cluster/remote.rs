//! Surrogates for sessions hosted on other cluster nodes.
//!
//! A surrogate holds the session's immutable identity (node, JID) locally
//! and fetches volatile state over the cluster on demand. Results that can
//! only ever change in one direction, like the initialization flag, are
//! cached after the first positive answer.

use jid::FullJid;
use minidom::Element;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::cluster::{
    dispatch_sync, ClusterError, ClusterRpc, ClusterTask, NodeId, RemoteReply,
    RemoteSessionOperation, CLUSTER_CLOSE_TIMEOUT,
};
use crate::session::SessionStatus;
use crate::stanza::Packet;

/// A client session living on another node.
pub struct RemoteClientSession {
    node: NodeId,
    jid: FullJid,
    rpc: Arc<dyn ClusterRpc>,
    initialized: AtomicBool,
}

impl RemoteClientSession {
    /// Create a surrogate for the session bound to `jid` on `node`.
    pub fn new(node: NodeId, jid: FullJid, rpc: Arc<dyn ClusterRpc>) -> Self {
        Self {
            node,
            jid,
            rpc,
            initialized: AtomicBool::new(false),
        }
    }

    /// The hosting node.
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// The session's full JID.
    pub fn full_jid(&self) -> &FullJid {
        &self.jid
    }

    fn session_task(&self, operation: RemoteSessionOperation) -> ClusterTask {
        ClusterTask::Session {
            jid: self.jid.to_string(),
            operation,
        }
    }

    /// Lifecycle state of the remote session.
    pub async fn status(&self) -> Result<SessionStatus, ClusterError> {
        match dispatch_sync(
            self.rpc.as_ref(),
            self.node,
            self.session_task(RemoteSessionOperation::GetStatus),
        )
        .await?
        {
            RemoteReply::Status(status) => Ok(status),
            other => Err(ClusterError::TaskFailed(format!(
                "unexpected reply to GetStatus: {:?}",
                other
            ))),
        }
    }

    /// Whether the remote session finished initialization. Once true the
    /// answer is cached; initialization never reverts.
    pub async fn is_initialized(&self) -> Result<bool, ClusterError> {
        if self.initialized.load(Ordering::Relaxed) {
            return Ok(true);
        }
        let reply = dispatch_sync(
            self.rpc.as_ref(),
            self.node,
            self.session_task(RemoteSessionOperation::IsInitialized),
        )
        .await?;
        match reply {
            RemoteReply::Flag(flag) => {
                if flag {
                    self.initialized.store(true, Ordering::Relaxed);
                }
                Ok(flag)
            }
            other => Err(ClusterError::TaskFailed(format!(
                "unexpected reply to IsInitialized: {:?}",
                other
            ))),
        }
    }

    /// The remote session's cached broadcast presence.
    pub async fn presence(&self) -> Result<Option<Packet>, ClusterError> {
        let reply = dispatch_sync(
            self.rpc.as_ref(),
            self.node,
            self.session_task(RemoteSessionOperation::GetPresence),
        )
        .await?;
        match reply {
            RemoteReply::Presence(None) => Ok(None),
            RemoteReply::Presence(Some(xml)) => {
                let element: Element = xml
                    .parse()
                    .map_err(|e| ClusterError::TaskFailed(format!("bad presence payload: {}", e)))?;
                let packet = Packet::from_element(element)
                    .map_err(|e| ClusterError::TaskFailed(e.to_string()))?;
                Ok(Some(packet))
            }
            other => Err(ClusterError::TaskFailed(format!(
                "unexpected reply to GetPresence: {:?}",
                other
            ))),
        }
    }

    /// Challenge the remote session in a resource conflict.
    pub async fn increment_conflict_count(&self) -> Result<u32, ClusterError> {
        let reply = dispatch_sync(
            self.rpc.as_ref(),
            self.node,
            self.session_task(RemoteSessionOperation::IncrementConflictCount),
        )
        .await?;
        match reply {
            RemoteReply::ConflictCount(count) => Ok(count),
            other => Err(ClusterError::TaskFailed(format!(
                "unexpected reply to IncrementConflictCount: {:?}",
                other
            ))),
        }
    }

    /// Deliver a stanza through the hosting node.
    pub async fn deliver(&self, packet: &Packet) -> Result<(), ClusterError> {
        debug!(node = %self.node, jid = %self.jid, "delivering via remote session");
        dispatch_sync(
            self.rpc.as_ref(),
            self.node,
            self.session_task(RemoteSessionOperation::DeliverPacket {
                xml: packet.to_string(),
            }),
        )
        .await
        .map(|_| ())
    }

    /// Close the remote session. Waits briefly for the node to confirm,
    /// then degrades to fire-and-forget so a slow node cannot stall local
    /// cleanup.
    pub async fn close(&self) {
        let task = self.session_task(RemoteSessionOperation::Close);
        let bounded = tokio::time::timeout(
            CLUSTER_CLOSE_TIMEOUT,
            self.rpc.execute(self.node, task.clone()),
        );
        match bounded.await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                warn!(node = %self.node, jid = %self.jid, error = %e, "remote close failed");
            }
            Err(_) => {
                debug!(node = %self.node, jid = %self.jid, "remote close slow, firing and forgetting");
                self.rpc.execute_no_wait(self.node, task);
            }
        }
    }
}

impl std::fmt::Debug for RemoteClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteClientSession")
            .field("node", &self.node)
            .field("jid", &self.jid)
            .finish()
    }
}
