//! Routes owned by this node.
//!
//! The local routing table maps addressable entities to the live sessions
//! behind them. It is the node-local complement of the cluster-wide caches
//! in [`crate::routing::RoutingTable`]: every entry here refers to a
//! session on this node, and cache entries pointing at this node must have
//! a counterpart here.

use dashmap::DashMap;
use jid::FullJid;
use std::sync::Arc;

use crate::dialback::DomainPair;
use crate::session::client::ClientSession;
use crate::session::component::ComponentSession;
use crate::session::server::OutgoingServerSession;

/// Key for one local route.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RouteKey {
    /// A bound client resource.
    Client(FullJid),
    /// A component subdomain.
    Component(String),
    /// An outgoing federation pair.
    Server(DomainPair),
}

/// A session reachable on this node.
#[derive(Debug, Clone)]
pub enum LocalRoute {
    /// Client session
    Client(Arc<ClientSession>),
    /// Component session
    Component(Arc<ComponentSession>),
    /// Outgoing server session
    Server(Arc<OutgoingServerSession>),
}

/// All sessions addressable on this node.
#[derive(Debug, Default)]
pub struct LocalRoutingTable {
    routes: DashMap<RouteKey, LocalRoute>,
}

impl LocalRoutingTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client route. Returns the route it replaced, if any.
    pub fn add_client(&self, jid: FullJid, session: Arc<ClientSession>) -> Option<LocalRoute> {
        self.routes
            .insert(RouteKey::Client(jid), LocalRoute::Client(session))
    }

    /// Register a component route for one subdomain.
    pub fn add_component(
        &self,
        subdomain: impl AsRef<str>,
        session: Arc<ComponentSession>,
    ) -> Option<LocalRoute> {
        self.routes.insert(
            RouteKey::Component(subdomain.as_ref().to_lowercase()),
            LocalRoute::Component(session),
        )
    }

    /// Register an outgoing server route for one domain pair.
    pub fn add_server(
        &self,
        pair: DomainPair,
        session: Arc<OutgoingServerSession>,
    ) -> Option<LocalRoute> {
        self.routes
            .insert(RouteKey::Server(pair), LocalRoute::Server(session))
    }

    /// The client session bound to `jid`, if local.
    pub fn client(&self, jid: &FullJid) -> Option<Arc<ClientSession>> {
        match self.routes.get(&RouteKey::Client(jid.clone())) {
            Some(route) => match route.value() {
                LocalRoute::Client(session) => Some(session.clone()),
                _ => None,
            },
            None => None,
        }
    }

    /// The component session serving `subdomain`, if local.
    pub fn component(&self, subdomain: &str) -> Option<Arc<ComponentSession>> {
        match self.routes.get(&RouteKey::Component(subdomain.to_lowercase())) {
            Some(route) => match route.value() {
                LocalRoute::Component(session) => Some(session.clone()),
                _ => None,
            },
            None => None,
        }
    }

    /// The outgoing server session for `pair`, if local.
    pub fn server(&self, pair: &DomainPair) -> Option<Arc<OutgoingServerSession>> {
        match self.routes.get(&RouteKey::Server(pair.clone())) {
            Some(route) => match route.value() {
                LocalRoute::Server(session) => Some(session.clone()),
                _ => None,
            },
            None => None,
        }
    }

    /// Remove a route. Returns it when it existed.
    pub fn remove(&self, key: &RouteKey) -> Option<LocalRoute> {
        self.routes.remove(key).map(|(_, route)| route)
    }

    /// Every local client session.
    pub fn client_routes(&self) -> Vec<Arc<ClientSession>> {
        self.routes
            .iter()
            .filter_map(|entry| match entry.value() {
                LocalRoute::Client(session) => Some(session.clone()),
                _ => None,
            })
            .collect()
    }

    /// Every local outgoing server session with its pair.
    pub fn server_routes(&self) -> Vec<(DomainPair, Arc<OutgoingServerSession>)> {
        self.routes
            .iter()
            .filter_map(|entry| match (entry.key(), entry.value()) {
                (RouteKey::Server(pair), LocalRoute::Server(session)) => {
                    Some((pair.clone(), session.clone()))
                }
                _ => None,
            })
            .collect()
    }

    /// Total number of routes.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
