//! Queued delivery while a federation session is being established.
//!
//! The first packet for a remote domain arrives before any stream to that
//! domain exists. Instead of blocking the routing path, packets are queued
//! per [`DomainPair`] while one background task dials and authenticates
//! the pair. On success the listener registers the new route and the queue
//! drains in arrival order; on failure every queued packet is handed back
//! for bouncing.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::dialback::DomainPair;
use crate::federation::DomainAuthenticator;
use crate::session::server::OutgoingServerSession;
use crate::stanza::Packet;

/// Observes the outcome of a queued establishment attempt.
#[async_trait]
pub trait OutgoingSessionListener: Send + Sync {
    /// A session for `pair` is up; register its route before the queue
    /// drains.
    async fn session_established(&self, pair: &DomainPair, session: Arc<OutgoingServerSession>);

    /// Establishment failed; `packet` was queued and must be bounced.
    async fn session_failed(&self, pair: &DomainPair, packet: Packet);
}

struct PendingQueue {
    tx: mpsc::UnboundedSender<Packet>,
}

/// Per-pair packet queues with one establishment task each.
pub struct OutgoingSessionPromise {
    authenticator: Arc<dyn DomainAuthenticator>,
    listener: Arc<dyn OutgoingSessionListener>,
    pending: DashMap<DomainPair, PendingQueue>,
}

impl OutgoingSessionPromise {
    /// Create a promise front for the given authenticator and listener.
    pub fn new(
        authenticator: Arc<dyn DomainAuthenticator>,
        listener: Arc<dyn OutgoingSessionListener>,
    ) -> Arc<Self> {
        Arc::new(Self {
            authenticator,
            listener,
            pending: DashMap::new(),
        })
    }

    /// Whether an establishment attempt for `pair` is in flight.
    pub fn is_pending(&self, pair: &DomainPair) -> bool {
        self.pending.contains_key(pair)
    }

    /// Queue a packet for `pair`, starting the establishment task if this
    /// is the first packet.
    pub fn queue(self: &Arc<Self>, pair: DomainPair, packet: Packet) {
        use dashmap::mapref::entry::Entry;
        let mut packet = packet;
        loop {
            match self.pending.entry(pair.clone()) {
                Entry::Occupied(slot) => {
                    // A send only fails in the narrow window where the task
                    // is tearing down. The send error hands the packet back;
                    // evict the dead queue and retry on a fresh one.
                    match slot.get().tx.send(packet) {
                        Ok(()) => return,
                        Err(mpsc::error::SendError(returned)) => {
                            packet = returned;
                            slot.remove();
                            debug!(pair = %pair, "requeueing packet after establishment race");
                        }
                    }
                }
                Entry::Vacant(slot) => {
                    let (tx, rx) = mpsc::unbounded_channel();
                    // The receiver is still in scope, this send cannot fail.
                    let _ = tx.send(packet);
                    slot.insert(PendingQueue { tx });
                    let promise = Arc::clone(self);
                    tokio::spawn(async move {
                        promise.establish(pair, rx).await;
                    });
                    return;
                }
            }
        }
    }

    async fn establish(&self, pair: DomainPair, mut rx: mpsc::UnboundedReceiver<Packet>) {
        let outcome = self.authenticator.authenticate_domain(&pair).await;

        // Closing the queue before draining makes late packets take the
        // normal routing path against the now-settled route state.
        self.pending.remove(&pair);
        rx.close();

        match outcome {
            Ok(session) => {
                self.listener.session_established(&pair, session.clone()).await;
                let mut delivered = 0usize;
                while let Some(packet) = rx.recv().await {
                    if let Err(e) = session.deliver(packet).await {
                        warn!(pair = %pair, error = %e, "queued packet lost on fresh session");
                    } else {
                        delivered += 1;
                    }
                }
                debug!(pair = %pair, delivered, "outgoing session established, queue drained");
            }
            Err(e) => {
                warn!(pair = %pair, error = %e, "outgoing session establishment failed");
                while let Some(packet) = rx.recv().await {
                    self.listener.session_failed(&pair, packet).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::MockConnection;
    use crate::federation::FederationError;
    use crate::session::server::AuthenticationMethod;
    use crate::session::{SessionCommon, StreamId};
    use crate::stanza::ns;
    use minidom::Element;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    fn packet(body: &str) -> Packet {
        Packet::from_element(
            Element::builder("message", ns::SERVER)
                .attr("from", "alice@rookery.im")
                .attr("to", "bob@remote.example")
                .append(Element::builder("body", ns::SERVER).append(body).build())
                .build(),
        )
        .unwrap()
    }

    struct CountingAuthenticator {
        conn: Arc<MockConnection>,
        attempts: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl DomainAuthenticator for CountingAuthenticator {
        async fn authenticate_domain(
            &self,
            pair: &DomainPair,
        ) -> Result<Arc<OutgoingServerSession>, FederationError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            // Let queued packets accumulate before settling.
            tokio::time::sleep(Duration::from_millis(20)).await;
            if self.fail {
                return Err(FederationError::ConnectionFailed("no route".into()));
            }
            let common =
                SessionCommon::new(StreamId::generate(), pair.local(), self.conn.clone());
            let session = Arc::new(OutgoingServerSession::new(common));
            session
                .add_authenticated_pair(pair.clone(), AuthenticationMethod::Dialback)
                .map_err(|e| FederationError::ConnectionFailed(e.to_string()))?;
            Ok(session)
        }
    }

    #[derive(Default)]
    struct RecordingListener {
        established: Mutex<Vec<DomainPair>>,
        failed: Mutex<Vec<Packet>>,
    }

    #[async_trait]
    impl OutgoingSessionListener for RecordingListener {
        async fn session_established(
            &self,
            pair: &DomainPair,
            _session: Arc<OutgoingServerSession>,
        ) {
            self.established.lock().unwrap().push(pair.clone());
        }

        async fn session_failed(&self, pair: &DomainPair, packet: Packet) {
            let _ = pair;
            self.failed.lock().unwrap().push(packet);
        }
    }

    #[tokio::test]
    async fn test_queue_drains_in_order_after_establishment() {
        let conn = Arc::new(MockConnection::new());
        let auth = Arc::new(CountingAuthenticator {
            conn: conn.clone(),
            attempts: AtomicUsize::new(0),
            fail: false,
        });
        let listener = Arc::new(RecordingListener::default());
        let promise = OutgoingSessionPromise::new(auth.clone(), listener.clone());

        let pair = DomainPair::new("rookery.im", "remote.example");
        promise.queue(pair.clone(), packet("first"));
        promise.queue(pair.clone(), packet("second"));
        promise.queue(pair.clone(), packet("third"));
        assert!(promise.is_pending(&pair));

        tokio::time::sleep(Duration::from_millis(100)).await;

        // One dial for three packets.
        assert_eq!(auth.attempts.load(Ordering::SeqCst), 1);
        assert!(!promise.is_pending(&pair));
        assert_eq!(listener.established.lock().unwrap().as_slice(), &[pair]);

        let delivered = conn.delivered();
        assert_eq!(delivered.len(), 3);
        let bodies: Vec<String> = delivered
            .iter()
            .map(|p| p.element().get_child("body", ns::SERVER).unwrap().text())
            .collect();
        assert_eq!(bodies, vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_queue_survives_establishment_teardown_race() {
        let conn = Arc::new(MockConnection::new());
        let auth = Arc::new(CountingAuthenticator {
            conn: conn.clone(),
            attempts: AtomicUsize::new(0),
            fail: false,
        });
        let listener = Arc::new(RecordingListener::default());
        let promise = OutgoingSessionPromise::new(auth.clone(), listener.clone());

        // A queue whose establishment task already tore down: the receiver
        // side is gone but the entry lingers.
        let pair = DomainPair::new("rookery.im", "remote.example");
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        promise.pending.insert(pair.clone(), PendingQueue { tx });

        promise.queue(pair.clone(), packet("survivor"));

        tokio::time::sleep(Duration::from_millis(100)).await;

        // The packet started a fresh attempt instead of vanishing.
        assert_eq!(auth.attempts.load(Ordering::SeqCst), 1);
        let delivered = conn.delivered();
        assert_eq!(delivered.len(), 1);
        assert_eq!(
            delivered[0]
                .element()
                .get_child("body", ns::SERVER)
                .unwrap()
                .text(),
            "survivor"
        );
    }

    #[tokio::test]
    async fn test_failed_establishment_hands_packets_back() {
        let conn = Arc::new(MockConnection::new());
        let auth = Arc::new(CountingAuthenticator {
            conn,
            attempts: AtomicUsize::new(0),
            fail: true,
        });
        let listener = Arc::new(RecordingListener::default());
        let promise = OutgoingSessionPromise::new(auth, listener.clone());

        let pair = DomainPair::new("rookery.im", "dead.example");
        promise.queue(pair.clone(), packet("one"));
        promise.queue(pair.clone(), packet("two"));

        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(!promise.is_pending(&pair));
        assert!(listener.established.lock().unwrap().is_empty());
        assert_eq!(listener.failed.lock().unwrap().len(), 2);
    }
}
