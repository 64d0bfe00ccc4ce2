//! The connection capability seam.
//!
//! The session core never touches sockets. Everything it needs from the
//! transport layer is expressed by the [`Connection`] trait: stanza and raw
//! text delivery, close, and the security attributes negotiated below the
//! session (TLS, compression, peer certificates).

use async_trait::async_trait;
use std::fmt;
use std::net::IpAddr;

use crate::error::{StreamErrorCondition, XmppError};
use crate::stanza::Packet;

/// Transport-level operations available to a session.
#[async_trait]
pub trait Connection: fmt::Debug + Send + Sync {
    /// Deliver a stanza to the peer.
    async fn deliver(&self, packet: Packet) -> Result<(), XmppError>;

    /// Deliver pre-serialized XML to the peer. Used for negotiation
    /// artifacts that are not stanzas (stream features, dialback elements,
    /// stream errors).
    async fn deliver_raw(&self, text: &str) -> Result<(), XmppError>;

    /// Close the stream gracefully.
    async fn close(&self);

    /// Emit a fatal stream error, then close.
    async fn close_with_error(&self, condition: StreamErrorCondition);

    /// Whether the connection has been closed.
    fn is_closed(&self) -> bool;

    /// Whether the stream is encrypted.
    fn is_secure(&self) -> bool;

    /// Whether stream compression is active.
    fn is_compressed(&self) -> bool;

    /// Peer network address, when the transport knows one.
    fn peer_address(&self) -> Option<IpAddr>;

    /// Identities asserted by the certificates available on this
    /// connection: the validated peer certificate once TLS is up, or the
    /// identity certificates the transport could negotiate TLS with. Empty
    /// when no usable certificate exists.
    fn certificate_identities(&self) -> Vec<String>;
}

/// In-memory connection recording everything a session sends, for tests and
/// downstream harnesses.
#[cfg(any(test, feature = "test-utils"))]
pub use mock::MockConnection;

#[cfg(any(test, feature = "test-utils"))]
mod mock {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    /// A [`Connection`] that records traffic instead of writing to a socket.
    #[derive(Debug, Default)]
    pub struct MockConnection {
        delivered: Mutex<Vec<Packet>>,
        raw: Mutex<Vec<String>>,
        closed: AtomicBool,
        stream_error: Mutex<Option<StreamErrorCondition>>,
        secure: bool,
        compressed: bool,
        peer_address: Option<IpAddr>,
        identities: Vec<String>,
    }

    impl MockConnection {
        /// A plaintext connection with no peer address.
        pub fn new() -> Self {
            Self::default()
        }

        /// A TLS connection asserting the given certificate identities.
        pub fn secure(identities: Vec<String>) -> Self {
            Self {
                secure: true,
                identities,
                ..Self::default()
            }
        }

        /// Attach a peer address.
        pub fn with_peer_address(mut self, addr: IpAddr) -> Self {
            self.peer_address = Some(addr);
            self
        }

        /// Stanzas delivered so far.
        pub fn delivered(&self) -> Vec<Packet> {
            self.delivered.lock().unwrap().clone()
        }

        /// Raw text delivered so far.
        pub fn raw_delivered(&self) -> Vec<String> {
            self.raw.lock().unwrap().clone()
        }

        /// The stream error the connection was closed with, if any.
        pub fn stream_error(&self) -> Option<StreamErrorCondition> {
            *self.stream_error.lock().unwrap()
        }
    }

    #[async_trait]
    impl Connection for MockConnection {
        async fn deliver(&self, packet: Packet) -> Result<(), XmppError> {
            if self.is_closed() {
                return Err(XmppError::ConnectionClosed);
            }
            self.delivered.lock().unwrap().push(packet);
            Ok(())
        }

        async fn deliver_raw(&self, text: &str) -> Result<(), XmppError> {
            if self.is_closed() {
                return Err(XmppError::ConnectionClosed);
            }
            self.raw.lock().unwrap().push(text.to_string());
            Ok(())
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }

        async fn close_with_error(&self, condition: StreamErrorCondition) {
            *self.stream_error.lock().unwrap() = Some(condition);
            self.closed.store(true, Ordering::SeqCst);
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }

        fn is_secure(&self) -> bool {
            self.secure
        }

        fn is_compressed(&self) -> bool {
            self.compressed
        }

        fn peer_address(&self) -> Option<IpAddr> {
            self.peer_address
        }

        fn certificate_identities(&self) -> Vec<String> {
            self.identities.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stanza::ns;
    use minidom::Element;

    fn packet() -> Packet {
        Packet::from_element(
            Element::builder("message", ns::CLIENT)
                .attr("to", "a@rookery.im")
                .build(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_mock_records_traffic() {
        let conn = MockConnection::new();
        conn.deliver(packet()).await.unwrap();
        conn.deliver_raw("<features/>").await.unwrap();

        assert_eq!(conn.delivered().len(), 1);
        assert_eq!(conn.raw_delivered(), vec!["<features/>".to_string()]);
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn test_mock_rejects_after_close() {
        let conn = MockConnection::new();
        conn.close_with_error(StreamErrorCondition::Conflict).await;

        assert!(conn.is_closed());
        assert_eq!(conn.stream_error(), Some(StreamErrorCondition::Conflict));
        assert!(conn.deliver(packet()).await.is_err());
    }

    #[test]
    fn test_mock_security_attributes() {
        let conn = MockConnection::secure(vec!["remote.example".to_string()]);
        assert!(conn.is_secure());
        assert_eq!(conn.certificate_identities(), vec!["remote.example".to_string()]);
        assert!(MockConnection::new().certificate_identities().is_empty());
    }
}
