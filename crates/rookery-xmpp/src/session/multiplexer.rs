//! Connection multiplexer sessions (XEP-0225).
//!
//! A connection manager tunnels many client streams over one connection.
//! This crate only tracks the manager session itself and which client
//! streams it currently fronts; wrapping and unwrapping of `<route/>`
//! envelopes stays in the transport layer.

use dashmap::DashMap;
use jid::{FullJid, Jid};
use std::fmt;
use tracing::debug;

use crate::error::XmppError;
use crate::session::{Session, SessionCommon, SessionStatus};
use crate::stanza::Packet;

/// A session for one connection-manager connection.
pub struct ConnectionMultiplexerSession {
    common: SessionCommon,
    manager_domain: String,
    client_streams: DashMap<String, Option<FullJid>>,
}

impl ConnectionMultiplexerSession {
    /// Wrap an accepted connection-manager stream.
    pub fn new(common: SessionCommon, manager_domain: impl Into<String>) -> Self {
        Self {
            common,
            manager_domain: manager_domain.into().to_lowercase(),
            client_streams: DashMap::new(),
        }
    }

    /// The connection manager's domain.
    pub fn manager_domain(&self) -> &str {
        &self.manager_domain
    }

    /// Record a client stream opened through this manager.
    pub fn open_client_stream(&self, stream_id: impl Into<String>) {
        let id = stream_id.into();
        debug!(manager = %self.manager_domain, stream = %id, "multiplexed stream opened");
        self.client_streams.insert(id, None);
    }

    /// Attach the bound JID to a multiplexed stream.
    pub fn bind_client_stream(&self, stream_id: &str, jid: FullJid) -> Result<(), XmppError> {
        match self.client_streams.get_mut(stream_id) {
            Some(mut entry) => {
                *entry = Some(jid);
                Ok(())
            }
            None => Err(XmppError::SessionNotFound),
        }
    }

    /// Drop a client stream. Returns the bound JID, if one was attached.
    pub fn close_client_stream(&self, stream_id: &str) -> Option<FullJid> {
        self.client_streams.remove(stream_id).and_then(|(_, jid)| jid)
    }

    /// Number of client streams currently fronted.
    pub fn client_stream_count(&self) -> usize {
        self.client_streams.len()
    }

    /// Deliver a stanza to the manager for one of its client streams.
    pub async fn deliver(&self, packet: Packet) -> Result<(), XmppError> {
        if self.status() != SessionStatus::Authenticated {
            return Err(XmppError::invalid_state("connection manager not authenticated"));
        }
        self.common.deliver(packet).await
    }
}

impl Session for ConnectionMultiplexerSession {
    fn common(&self) -> &SessionCommon {
        &self.common
    }

    fn address(&self) -> Jid {
        self.manager_domain
            .parse()
            .unwrap_or_else(|_| {
                self.common
                    .server_name()
                    .parse()
                    .expect("server name is a valid JID")
            })
    }
}

impl fmt::Debug for ConnectionMultiplexerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionMultiplexerSession")
            .field("common", &self.common)
            .field("manager_domain", &self.manager_domain)
            .field("client_streams", &self.client_stream_count())
            .finish()
    }
}
