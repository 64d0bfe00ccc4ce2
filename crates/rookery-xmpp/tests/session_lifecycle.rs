//! Session Lifecycle Integration Tests
//!
//! These tests drive a session through its whole life against the public
//! API: stream acceptance, binding, routing, detach/resume, and the
//! component handshake.
//!
//! Run with: `cargo test -p rookery-xmpp --test session_lifecycle`

mod common;

use std::sync::Arc;

use rookery_xmpp::cluster::NodeId;
use rookery_xmpp::config::{RoutingConfig, SessionConfig};
use rookery_xmpp::connection::{Connection, MockConnection};
use rookery_xmpp::hooks::NoPrivacyLists;
use rookery_xmpp::session::component::handshake_digest;
use rookery_xmpp::session::factory::{NewSession, StreamHeader};
use rookery_xmpp::session::manager::SessionManager;
use rookery_xmpp::session::{Session, SessionCommon, SessionStatus, StreamId};
use rookery_xmpp::stanza::ns;
use rookery_xmpp::{LocalRoutingTable, RoutingOutcome, RoutingTable, SessionFactory};

use common::{chat, client_session, init_test, own_presence};

fn routing_table() -> (Arc<RoutingTable>, Arc<LocalRoutingTable>) {
    let local = Arc::new(LocalRoutingTable::new());
    let table = Arc::new(RoutingTable::new(
        NodeId::generate(),
        "rookery.im",
        local.clone(),
        RoutingConfig::default(),
    ));
    (table, local)
}

#[tokio::test]
async fn test_accepted_client_stream_becomes_routable() {
    init_test();
    let factory = SessionFactory::new("rookery.im", Arc::new(NoPrivacyLists));
    let conn = Arc::new(MockConnection::new());

    let header = StreamHeader {
        namespace: ns::CLIENT.to_string(),
        to: Some("rookery.im".to_string()),
        from: None,
        version: Some("1.0".to_string()),
    };
    let (new_session, _) = factory.accept(header, conn.clone()).await.unwrap();
    let session = match new_session {
        NewSession::Client(s) => s,
        other => panic!("expected client session, got {:?}", other),
    };

    // Authentication and binding happen above this crate; simulate them.
    session
        .common()
        .set_status(SessionStatus::Authenticated)
        .unwrap();
    let manager = SessionManager::new(SessionConfig::default());
    manager
        .bind_client(session.clone(), "alice@rookery.im/phone".parse().unwrap())
        .await
        .unwrap();
    session.set_initialized(true);
    session.set_presence(own_presence(0, None));

    let (table, _) = routing_table();
    table.add_client_route(session).unwrap();

    let outcome = table
        .route_packet(chat("bob@rookery.im/desk", "alice@rookery.im", "hi"))
        .await;
    assert_eq!(outcome, RoutingOutcome::Delivered(1));
    assert_eq!(conn.delivered().len(), 1);
}

#[tokio::test]
async fn test_detach_resume_preserves_reachability() {
    init_test();
    let manager = SessionManager::new(SessionConfig::default());
    let (table, _) = routing_table();

    let (_, session) = client_session("alice@rookery.im/phone");
    session.set_presence(own_presence(3, None));
    manager
        .bind_client(session.clone(), session.full_jid().unwrap())
        .await
        .unwrap();
    table.add_client_route(session.clone()).unwrap();

    // Connection drops: the session detaches, the route goes away.
    let handle = session.stream_id().clone();
    let full = session.full_jid().unwrap();
    manager.detach_client(&session);
    table.remove_client_route(&full);

    let outcome = table
        .route_packet(chat("bob@rookery.im/desk", "alice@rookery.im", "still there?"))
        .await;
    assert_eq!(outcome, RoutingOutcome::Bounced);

    // The client reconnects within the window and resumes.
    let conn = Arc::new(MockConnection::new());
    let common = SessionCommon::new(StreamId::generate(), "rookery.im", conn.clone());
    let resumed = manager
        .resume_client(&handle, common, Arc::new(NoPrivacyLists))
        .await
        .unwrap();
    assert_eq!(resumed.priority(), 3);
    table.add_client_route(resumed).unwrap();

    let outcome = table
        .route_packet(chat("bob@rookery.im/desk", "alice@rookery.im", "welcome back"))
        .await;
    assert_eq!(outcome, RoutingOutcome::Delivered(1));
    assert_eq!(conn.delivered().len(), 1);
}

#[tokio::test]
async fn test_component_handshake_and_routing() {
    init_test();
    let factory = SessionFactory::new("rookery.im", Arc::new(NoPrivacyLists));
    let conn = Arc::new(MockConnection::new());

    let header = StreamHeader {
        namespace: ns::COMPONENT_ACCEPT.to_string(),
        to: Some("muc.rookery.im".to_string()),
        from: None,
        version: None,
    };
    let (new_session, _) = factory.accept(header, conn.clone()).await.unwrap();
    let component = match new_session {
        NewSession::Component(c) => c,
        other => panic!("expected component session, got {:?}", other),
    };

    let secret = "component-secret";
    let digest = handshake_digest(component.stream_id().as_str(), secret);
    component.handshake(&digest, secret).await.unwrap();
    assert_eq!(component.status(), SessionStatus::Authenticated);
    assert!(conn.raw_delivered().iter().any(|r| r.contains("<handshake/>")));

    let manager = SessionManager::new(SessionConfig::default());
    manager.register_component(component.clone()).await.unwrap();

    let (table, local) = routing_table();
    local.add_component("muc.rookery.im", component);
    table.add_component_route("muc.rookery.im", table.node_id());

    let outcome = table
        .route_packet(chat("alice@rookery.im/phone", "room@muc.rookery.im", "hello"))
        .await;
    assert_eq!(outcome, RoutingOutcome::Delivered(1));
    assert_eq!(conn.delivered().len(), 1);
}

#[tokio::test]
async fn test_wrong_handshake_digest_closes_stream() {
    init_test();
    let factory = SessionFactory::new("rookery.im", Arc::new(NoPrivacyLists));
    let conn = Arc::new(MockConnection::new());

    let header = StreamHeader {
        namespace: ns::COMPONENT_ACCEPT.to_string(),
        to: Some("muc.rookery.im".to_string()),
        from: None,
        version: None,
    };
    let (new_session, _) = factory.accept(header, conn.clone()).await.unwrap();
    let component = match new_session {
        NewSession::Component(c) => c,
        other => panic!("expected component session, got {:?}", other),
    };

    assert!(component.handshake("bogus", "component-secret").await.is_err());
    assert!(conn.is_closed());
}

#[tokio::test]
async fn test_resource_conflict_kicks_older_session_end_to_end() {
    init_test();
    let manager = SessionManager::new(SessionConfig::default());
    let (table, _) = routing_table();

    let (old_conn, old) = client_session("alice@rookery.im/phone");
    old.set_presence(own_presence(0, None));
    manager
        .bind_client(old.clone(), old.full_jid().unwrap())
        .await
        .unwrap();
    table.add_client_route(old.clone()).unwrap();

    let (new_conn, new) = client_session("alice@rookery.im/phone");
    new.set_presence(own_presence(0, None));
    manager
        .bind_client(new.clone(), new.full_jid().unwrap())
        .await
        .unwrap();
    assert!(old_conn.is_closed());

    // Routing follows the replacement, not the kicked session.
    table.add_client_route(new).unwrap();
    let outcome = table
        .route_packet(chat("bob@rookery.im/desk", "alice@rookery.im/phone", "hi"))
        .await;
    assert_eq!(outcome, RoutingOutcome::Delivered(1));
    assert_eq!(new_conn.delivered().len(), 1);
    assert!(old_conn.delivered().is_empty());
}
