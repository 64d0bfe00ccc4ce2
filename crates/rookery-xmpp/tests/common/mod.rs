//! Shared helpers for the integration suites.

#![allow(dead_code)]

use std::sync::Arc;

use minidom::Element;
use rookery_xmpp::connection::MockConnection;
use rookery_xmpp::hooks::NoPrivacyLists;
use rookery_xmpp::session::client::ClientSession;
use rookery_xmpp::session::{SessionCommon, SessionStatus, StreamId};
use rookery_xmpp::stanza::{ns, Packet};

/// Initialize test logging once.
pub fn init_test() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("debug")
            .with_test_writer()
            .try_init();
    });
}

/// An authenticated, initialized client session bound to `jid`.
pub fn client_session(jid: &str) -> (Arc<MockConnection>, Arc<ClientSession>) {
    let conn = Arc::new(MockConnection::new());
    let common = SessionCommon::new(StreamId::generate(), "rookery.im", conn.clone());
    common
        .set_status(SessionStatus::Authenticated)
        .expect("fresh session");
    let session = Arc::new(ClientSession::new(common, Arc::new(NoPrivacyLists)));
    session.set_full_jid(jid.parse().expect("test jid"));
    session.set_initialized(true);
    (conn, session)
}

/// An available-presence stanza with the given priority and show.
pub fn own_presence(priority: i8, show: Option<&str>) -> Packet {
    let mut builder = Element::builder("presence", ns::CLIENT).append(
        Element::builder("priority", ns::CLIENT)
            .append(priority.to_string().as_str())
            .build(),
    );
    if let Some(s) = show {
        builder = builder.append(Element::builder("show", ns::CLIENT).append(s).build());
    }
    Packet::from_element(builder.build()).expect("presence stanza")
}

/// A chat message between the given addresses.
pub fn chat(from: &str, to: &str, body: &str) -> Packet {
    Packet::from_element(
        Element::builder("message", ns::CLIENT)
            .attr("from", from)
            .attr("to", to)
            .attr("type", "chat")
            .append(Element::builder("body", ns::CLIENT).append(body).build())
            .build(),
    )
    .expect("message stanza")
}
