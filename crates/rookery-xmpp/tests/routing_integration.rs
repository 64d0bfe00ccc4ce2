//! Routing and Federation Integration Tests
//!
//! End-to-end routing scenarios across the routing table, the session
//! layer and outbound federation, using a scripted connector in place of
//! real sockets.
//!
//! Run with: `cargo test -p rookery-xmpp --test routing_integration`

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rookery_xmpp::cluster::NodeId;
use rookery_xmpp::config::{FederationConfig, RoutingConfig};
use rookery_xmpp::connection::MockConnection;
use rookery_xmpp::federation::{
    FederationError, FederationManager, FederationStrategy, NegotiatedOutgoing, S2sConnector,
};
use rookery_xmpp::session::server::{AuthenticationMethod, OutgoingServerSession};
use rookery_xmpp::session::{SessionCommon, StreamId};
use rookery_xmpp::stanza::ns;
use rookery_xmpp::{DomainPair, LocalRoutingTable, RoutingOutcome, RoutingTable};

use common::{chat, client_session, init_test, own_presence};

/// Connector that negotiates every dial on the first strategy and records
/// the connections it made.
struct InstantConnector {
    dials: AtomicUsize,
    connections: Mutex<Vec<Arc<MockConnection>>>,
}

impl InstantConnector {
    fn new() -> Self {
        Self {
            dials: AtomicUsize::new(0),
            connections: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl S2sConnector for InstantConnector {
    async fn connect(
        &self,
        pair: &DomainPair,
        _port: u16,
        _strategy: FederationStrategy,
    ) -> Result<NegotiatedOutgoing, FederationError> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        let conn = Arc::new(MockConnection::new());
        self.connections.lock().unwrap().push(conn.clone());
        let common = SessionCommon::new(StreamId::generate(), pair.local(), conn);
        Ok(NegotiatedOutgoing {
            session: Arc::new(OutgoingServerSession::new(common)),
            method: AuthenticationMethod::SaslExternal,
        })
    }

    async fn extend(
        &self,
        _session: &OutgoingServerSession,
        _pair: &DomainPair,
    ) -> Result<AuthenticationMethod, FederationError> {
        Ok(AuthenticationMethod::Dialback)
    }
}

fn federated_table(
    federation: FederationConfig,
) -> (Arc<RoutingTable>, Arc<InstantConnector>) {
    let local = Arc::new(LocalRoutingTable::new());
    let table = Arc::new(RoutingTable::new(
        NodeId::generate(),
        "rookery.im",
        local.clone(),
        RoutingConfig::default(),
    ));
    let connector = Arc::new(InstantConnector::new());
    let manager = Arc::new(FederationManager::new(
        federation,
        connector.clone(),
        local,
    ));
    table.attach_federation(manager);
    (table, connector)
}

#[tokio::test]
async fn test_resource_selection_prefers_priority_then_show() {
    init_test();
    let local = Arc::new(LocalRoutingTable::new());
    let table = Arc::new(RoutingTable::new(
        NodeId::generate(),
        "rookery.im",
        local,
        RoutingConfig::default(),
    ));

    let (phone, phone_session) = client_session("alice@rookery.im/phone");
    phone_session.set_presence(own_presence(1, Some("away")));
    table.add_client_route(phone_session).unwrap();

    let (desktop, desktop_session) = client_session("alice@rookery.im/desktop");
    desktop_session.set_presence(own_presence(5, None));
    table.add_client_route(desktop_session).unwrap();

    let outcome = table
        .route_packet(chat("bob@remote.example/home", "alice@rookery.im", "hello"))
        .await;

    assert_eq!(outcome, RoutingOutcome::Delivered(1));
    assert!(phone.delivered().is_empty());
    assert_eq!(desktop.delivered().len(), 1);
}

#[tokio::test]
async fn test_first_stanza_to_remote_domain_queues_then_drains() {
    init_test();
    let (table, connector) = federated_table(FederationConfig::default());
    bound_sender(&table);

    let outcome = table
        .route_packet(chat("alice@rookery.im/phone", "bob@remote.example", "one"))
        .await;
    assert_eq!(outcome, RoutingOutcome::Queued);

    // The establishment task settles and drains the queue.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(connector.dials.load(Ordering::SeqCst), 1);
    let connections = connector.connections.lock().unwrap().clone();
    assert_eq!(connections.len(), 1);
    assert_eq!(connections[0].delivered().len(), 1);

    // The route is registered now; later stanzas skip the queue.
    let outcome = table
        .route_packet(chat("alice@rookery.im/phone", "bob@remote.example", "two"))
        .await;
    assert_eq!(outcome, RoutingOutcome::Delivered(1));
    assert_eq!(connections[0].delivered().len(), 2);
    assert_eq!(connector.dials.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_blacklisted_domain_bounces_without_dialing() {
    init_test();
    let config = FederationConfig::default().with_blacklist(["spam.example"]);
    let (table, connector) = federated_table(config);
    let sender = bound_sender(&table);

    let outcome = table
        .route_packet(chat("alice@rookery.im/phone", "bob@spam.example", "hi"))
        .await;
    assert_eq!(outcome, RoutingOutcome::Queued);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(connector.dials.load(Ordering::SeqCst), 0);

    // The queued stanza came back as remote-server-not-found.
    let bounced = sender.delivered();
    assert_eq!(bounced.len(), 1);
    assert!(bounced[0].is_error());
    let err = bounced[0].element().get_child("error", ns::CLIENT).unwrap();
    assert!(err.get_child("remote-server-not-found", ns::STANZAS).is_some());
}

#[tokio::test]
async fn test_concurrent_remote_stanzas_share_one_connection() {
    init_test();
    let (table, connector) = federated_table(FederationConfig::default());
    bound_sender(&table);

    for i in 0..5 {
        let body = format!("msg-{}", i);
        table
            .route_packet(chat("alice@rookery.im/phone", "bob@remote.example", &body))
            .await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(connector.dials.load(Ordering::SeqCst), 1);
    let connections = connector.connections.lock().unwrap().clone();
    assert_eq!(connections[0].delivered().len(), 5);
}

/// Bind a local sender so bounces have somewhere to land.
fn bound_sender(table: &RoutingTable) -> Arc<MockConnection> {
    let (conn, session) = client_session("alice@rookery.im/phone");
    session.set_presence(own_presence(0, None));
    table.add_client_route(session).unwrap();
    conn
}
