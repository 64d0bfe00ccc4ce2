//! Session lifecycle shared by every connection type.
//!
//! A session wraps one negotiated stream. The state machine is deliberately
//! small and strictly monotonic: `Connected` (stream open, not yet
//! authenticated) advances to `Authenticated`, and any state may advance to
//! `Closed`. No transition ever goes backwards; code observing
//! `Authenticated` may rely on it until the session closes.

pub mod client;
pub mod component;
pub mod factory;
pub mod manager;
pub mod multiplexer;
pub mod server;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::connection::Connection;
use crate::error::{StreamErrorCondition, XmppError};
use crate::stanza::Packet;

/// Identifier assigned to a stream when the server accepts it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamId(String);

impl StreamId {
    /// Generate a fresh stream id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Wrap an existing id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    /// Stream accepted, peer not yet authenticated.
    Connected,
    /// Peer authenticated (SASL, dialback or component handshake).
    Authenticated,
    /// Session terminated. Terminal.
    Closed,
}

impl SessionStatus {
    fn rank(&self) -> u8 {
        match self {
            Self::Connected => 0,
            Self::Authenticated => 1,
            Self::Closed => 2,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connected => write!(f, "connected"),
            Self::Authenticated => write!(f, "authenticated"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Outcome of asking a session to process an inbound-delivery stanza.
#[derive(Debug)]
pub enum ProcessOutcome {
    /// The stanza was accepted and delivered to the peer.
    Processed,
    /// The stanza was refused. When a bounce is attached the caller must
    /// route it back to the sender; otherwise the stanza is dropped
    /// silently.
    Rejected(Option<Packet>),
}

/// State common to every session type.
pub struct SessionCommon {
    stream_id: StreamId,
    server_name: String,
    connection: Arc<dyn Connection>,
    status: Mutex<SessionStatus>,
    created_at: DateTime<Utc>,
    last_active_ms: AtomicI64,
    client_packets: AtomicU64,
    server_packets: AtomicU64,
}

impl SessionCommon {
    /// Create session state for a freshly accepted stream.
    pub fn new(
        stream_id: StreamId,
        server_name: impl Into<String>,
        connection: Arc<dyn Connection>,
    ) -> Self {
        let now = Utc::now();
        Self {
            stream_id,
            server_name: server_name.into(),
            connection,
            status: Mutex::new(SessionStatus::Connected),
            created_at: now,
            last_active_ms: AtomicI64::new(now.timestamp_millis()),
            client_packets: AtomicU64::new(0),
            server_packets: AtomicU64::new(0),
        }
    }

    /// The stream id.
    pub fn stream_id(&self) -> &StreamId {
        &self.stream_id
    }

    /// The local domain this session is attached to.
    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// The transport behind the session.
    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    /// Current lifecycle state.
    pub fn status(&self) -> SessionStatus {
        *self.status.lock().expect("status lock poisoned")
    }

    /// Advance the lifecycle state. Transitions never go backwards and
    /// `Closed` is terminal; a violating transition is rejected.
    pub fn set_status(&self, next: SessionStatus) -> Result<(), XmppError> {
        let mut status = self.status.lock().expect("status lock poisoned");
        if next.rank() < status.rank() {
            return Err(XmppError::invalid_state(format!(
                "session status cannot move from {} to {}",
                *status, next
            )));
        }
        *status = next;
        Ok(())
    }

    /// Whether the session has been closed.
    pub fn is_closed(&self) -> bool {
        self.status() == SessionStatus::Closed
    }

    /// When the stream was accepted.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// When the session last saw traffic.
    pub fn last_active(&self) -> DateTime<Utc> {
        let ms = self.last_active_ms.load(Ordering::Relaxed);
        Utc.timestamp_millis_opt(ms).single().unwrap_or(self.created_at)
    }

    /// Refresh the activity timestamp.
    pub fn touch(&self) {
        self.last_active_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    /// Stanzas received from the peer.
    pub fn client_packet_count(&self) -> u64 {
        self.client_packets.load(Ordering::Relaxed)
    }

    /// Stanzas delivered to the peer.
    pub fn server_packet_count(&self) -> u64 {
        self.server_packets.load(Ordering::Relaxed)
    }

    /// Record one stanza received from the peer.
    pub fn record_incoming(&self) {
        self.client_packets.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    /// Deliver a stanza to the peer, recording it.
    pub async fn deliver(&self, packet: Packet) -> Result<(), XmppError> {
        if self.is_closed() {
            return Err(XmppError::ConnectionClosed);
        }
        self.connection.deliver(packet).await?;
        self.server_packets.fetch_add(1, Ordering::Relaxed);
        self.touch();
        Ok(())
    }

    /// Deliver pre-serialized XML to the peer.
    pub async fn deliver_raw(&self, text: &str) -> Result<(), XmppError> {
        if self.is_closed() {
            return Err(XmppError::ConnectionClosed);
        }
        self.connection.deliver_raw(text).await
    }

    /// Close the session and its connection.
    pub async fn close(&self) {
        let _ = self.set_status(SessionStatus::Closed);
        self.connection.close().await;
    }

    /// Close the session with a fatal stream error.
    pub async fn close_with_error(&self, condition: StreamErrorCondition) {
        let _ = self.set_status(SessionStatus::Closed);
        self.connection.close_with_error(condition).await;
    }
}

impl fmt::Debug for SessionCommon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCommon")
            .field("stream_id", &self.stream_id)
            .field("server_name", &self.server_name)
            .field("status", &self.status())
            .field("client_packets", &self.client_packet_count())
            .field("server_packets", &self.server_packet_count())
            .finish()
    }
}

/// Accessors shared by every session type.
pub trait Session: Send + Sync {
    /// The shared session state.
    fn common(&self) -> &SessionCommon;

    /// The address this session answers for. For client sessions the full
    /// JID, for server sessions the remote domain, for components the
    /// primary subdomain.
    fn address(&self) -> jid::Jid;

    /// Current lifecycle state.
    fn status(&self) -> SessionStatus {
        self.common().status()
    }

    /// The stream id.
    fn stream_id(&self) -> &StreamId {
        self.common().stream_id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::MockConnection;
    use crate::stanza::ns;
    use minidom::Element;

    fn common() -> (Arc<MockConnection>, SessionCommon) {
        let conn = Arc::new(MockConnection::new());
        let session = SessionCommon::new(StreamId::generate(), "rookery.im", conn.clone());
        (conn, session)
    }

    fn packet() -> Packet {
        Packet::from_element(
            Element::builder("message", ns::CLIENT)
                .attr("to", "a@rookery.im")
                .build(),
        )
        .unwrap()
    }

    #[test]
    fn test_status_is_monotonic() {
        let (_, session) = common();
        assert_eq!(session.status(), SessionStatus::Connected);

        session.set_status(SessionStatus::Authenticated).unwrap();
        assert_eq!(session.status(), SessionStatus::Authenticated);

        // Backwards transition refused, state unchanged.
        assert!(session.set_status(SessionStatus::Connected).is_err());
        assert_eq!(session.status(), SessionStatus::Authenticated);

        session.set_status(SessionStatus::Closed).unwrap();
        assert!(session.set_status(SessionStatus::Authenticated).is_err());
        assert_eq!(session.status(), SessionStatus::Closed);
    }

    #[test]
    fn test_same_status_is_idempotent() {
        let (_, session) = common();
        session.set_status(SessionStatus::Connected).unwrap();
        session.set_status(SessionStatus::Authenticated).unwrap();
        session.set_status(SessionStatus::Authenticated).unwrap();
    }

    #[tokio::test]
    async fn test_deliver_counts_packets() {
        let (conn, session) = common();
        assert_eq!(session.server_packet_count(), 0);

        session.deliver(packet()).await.unwrap();
        session.deliver(packet()).await.unwrap();
        assert_eq!(session.server_packet_count(), 2);
        assert_eq!(conn.delivered().len(), 2);

        session.record_incoming();
        assert_eq!(session.client_packet_count(), 1);
    }

    #[tokio::test]
    async fn test_closed_session_refuses_delivery() {
        let (conn, session) = common();
        session.close().await;

        assert!(session.is_closed());
        assert!(conn.is_closed());
        assert!(matches!(
            session.deliver(packet()).await,
            Err(XmppError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_close_with_error_reaches_connection() {
        let (conn, session) = common();
        session.close_with_error(StreamErrorCondition::Conflict).await;
        assert_eq!(conn.stream_error(), Some(StreamErrorCondition::Conflict));
        assert!(session.is_closed());
    }
}
