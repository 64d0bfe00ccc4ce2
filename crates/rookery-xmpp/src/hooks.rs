//! Collaborator seams for subsystems that live outside this crate.
//!
//! Privacy lists, offline handling and directed-presence bookkeeping are
//! owned by other layers of the server. Routing only needs narrow answers
//! from them, expressed by the traits here. Every trait ships a permissive
//! no-op implementation so the core is usable (and testable) stand-alone.

use async_trait::async_trait;
use jid::{BareJid, Jid};
use thiserror::Error;

use crate::stanza::Packet;

/// Raised by an interceptor to stop a stanza from being processed.
#[derive(Debug, Error)]
#[error("packet rejected{}", .reason.as_deref().map(|r| format!(": {r}")).unwrap_or_default())]
pub struct PacketRejected {
    /// Optional explanation delivered back to the sender.
    pub reason: Option<String>,
}

impl PacketRejected {
    /// Reject without an explanation.
    pub fn silent() -> Self {
        Self { reason: None }
    }

    /// Reject with an explanation for the sender.
    pub fn with_reason(reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
        }
    }
}

/// Inspects stanzas as they enter or leave a session.
///
/// Interceptors run twice per stanza: before processing (`processed =
/// false`), where they may reject it, and after (`processed = true`) for
/// auditing.
#[async_trait]
pub trait PacketInterceptor: Send + Sync {
    /// Inspect one stanza. `incoming` is true when the session's peer sent
    /// it, false when the server is about to deliver it to the peer.
    async fn intercept(
        &self,
        packet: &Packet,
        session_address: &Jid,
        incoming: bool,
        processed: bool,
    ) -> Result<(), PacketRejected>;
}

/// Answers whether a recipient's active privacy list blocks a stanza.
#[async_trait]
pub trait PrivacyListProvider: Send + Sync {
    /// Whether `owner`'s active list blocks this packet.
    async fn should_block(&self, owner: &BareJid, packet: &Packet) -> bool;
}

/// Privacy provider that blocks nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPrivacyLists;

#[async_trait]
impl PrivacyListProvider for NoPrivacyLists {
    async fn should_block(&self, _owner: &BareJid, _packet: &Packet) -> bool {
        false
    }
}

/// Tracks directed presence, which exempts otherwise-unavailable sessions
/// from the available-routes-only rule.
pub trait PresenceDirectory: Send + Sync {
    /// Whether `owner` has sent directed presence to `sender`.
    fn has_direct_presence(&self, owner: &Jid, sender: &BareJid) -> bool;
}

/// Presence directory that records nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDirectedPresence;

impl PresenceDirectory for NoDirectedPresence {
    fn has_direct_presence(&self, _owner: &Jid, _sender: &BareJid) -> bool {
        false
    }
}

/// Invoked when no route accepted a stanza.
///
/// A handler that stores the stanza (offline messages) returns `true`; the
/// routing table then stays silent. Returning `false` makes the routing
/// table bounce the stanza back to its sender.
#[async_trait]
pub trait RoutingFailureHandler: Send + Sync {
    /// Handle a stanza that could not be routed to `recipient`.
    async fn routing_failed(&self, recipient: &Jid, packet: &Packet) -> bool;
}

/// Failure handler that stores nothing, forcing a bounce.
#[derive(Debug, Clone, Copy, Default)]
pub struct BounceAll;

#[async_trait]
impl RoutingFailureHandler for BounceAll {
    async fn routing_failed(&self, _recipient: &Jid, _packet: &Packet) -> bool {
        false
    }
}
