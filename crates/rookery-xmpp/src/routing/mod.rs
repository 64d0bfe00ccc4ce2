//! Stanza routing across local sessions, components and federation.
//!
//! The routing table keeps two layers of state. The cluster-wide caches
//! (`users`, `anonymous_users`, `user_sessions`, `servers`, `components`)
//! record which node owns which route; the [`LocalRoutingTable`] holds the
//! live sessions behind the routes owned by this node. Every cache entry
//! pointing at this node must have a local counterpart, and a cache entry
//! whose owner fails to deliver is evicted as stale.
//!
//! Delivery failures funnel through one path: the
//! [`RoutingFailureHandler`] gets the first chance to store the stanza
//! (offline messages), and only when it declines does the table bounce an
//! error back to the sender. Errors are never bounced in response to
//! errors.

pub mod local;
pub mod promise;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use jid::{BareJid, FullJid, Jid};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, OnceLock, Weak};
use tracing::{debug, info, instrument, warn};

use crate::cluster::remote::RemoteClientSession;
use crate::cluster::{ClusterRpc, NodeId, RemotePacketRouter};
use crate::config::RoutingConfig;
use crate::dialback::DomainPair;
use crate::error::{StanzaErrorCondition, XmppError};
use crate::federation::DomainAuthenticator;
use crate::hooks::{PresenceDirectory, RoutingFailureHandler};
use crate::session::client::ClientSession;
use crate::session::component::ComponentIqTracker;
use crate::session::server::OutgoingServerSession;
use crate::session::{ProcessOutcome, Session};
use crate::stanza::{MessageType, Packet, PacketKind};

use local::{LocalRoutingTable, RouteKey};
use promise::{OutgoingSessionListener, OutgoingSessionPromise};

/// Cluster-wide record of one client route.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRoute {
    /// Node hosting the session
    pub node: NodeId,
    /// Whether the session authenticated anonymously
    pub anonymous: bool,
    /// Whether the session broadcast available presence
    pub available: bool,
    /// Whether post-bind initialization finished
    pub initialized: bool,
    /// Broadcast presence priority
    pub priority: i8,
    /// Show ordering weight, lower preferred
    pub show_weight: u8,
    /// Last activity, milliseconds since the epoch
    pub last_active_ms: i64,
    /// Whether the client enabled message carbons
    pub carbons_enabled: bool,
}

impl ClientRoute {
    /// Snapshot a local session into a cache record.
    pub fn from_session(node: NodeId, session: &ClientSession) -> Self {
        Self {
            node,
            anonymous: session.is_anonymous(),
            available: session.is_available(),
            initialized: session.is_initialized(),
            priority: session.priority(),
            show_weight: session.show().routing_weight(),
            last_active_ms: session.common().last_active().timestamp_millis(),
            carbons_enabled: session.carbons_enabled(),
        }
    }
}

/// What became of a routed stanza.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingOutcome {
    /// Delivered to this many sessions.
    Delivered(usize),
    /// Held for an outgoing stream that is being established.
    Queued,
    /// The failure handler stored it (offline messages).
    Stored,
    /// An error was routed back to the sender.
    Bounced,
    /// Intentionally discarded.
    Dropped,
    /// Addressed to the server itself; the caller owns it.
    ServerAddressed,
}

// Bounces re-enter the routing path once; anything deeper is discarded.
const MAX_ROUTE_DEPTH: u8 = 2;

/// The routing table.
pub struct RoutingTable {
    node_id: NodeId,
    server_name: String,
    local_domains: HashSet<String>,
    local: Arc<LocalRoutingTable>,
    config: RoutingConfig,
    /// Full JID string to route record, non-anonymous sessions.
    users: DashMap<String, ClientRoute>,
    /// Full JID string to route record, anonymous sessions.
    anonymous_users: DashMap<String, ClientRoute>,
    /// Bare JID string to the full JID strings bound under it.
    user_sessions: DashMap<String, HashSet<String>>,
    /// Outgoing federation pairs to their owning node.
    servers: DashMap<DomainPair, NodeId>,
    /// Component subdomains to the nodes serving them.
    components: DashMap<String, HashSet<NodeId>>,
    remote: Arc<dyn RemotePacketRouter>,
    presence: Arc<dyn PresenceDirectory>,
    failure: Arc<dyn RoutingFailureHandler>,
    promise: OnceLock<Arc<OutgoingSessionPromise>>,
    rpc: OnceLock<Arc<dyn ClusterRpc>>,
    /// Pending IQ requests issued by local component connections.
    component_iqs: ComponentIqTracker,
}

impl RoutingTable {
    /// Create a routing table for `server_name` on `node_id`.
    pub fn new(
        node_id: NodeId,
        server_name: impl Into<String>,
        local: Arc<LocalRoutingTable>,
        config: RoutingConfig,
    ) -> Self {
        let server_name = server_name.into().to_lowercase();
        let mut local_domains = HashSet::new();
        local_domains.insert(server_name.clone());
        Self {
            node_id,
            server_name,
            local_domains,
            local,
            config,
            users: DashMap::new(),
            anonymous_users: DashMap::new(),
            user_sessions: DashMap::new(),
            servers: DashMap::new(),
            components: DashMap::new(),
            remote: Arc::new(crate::cluster::NoCluster),
            presence: Arc::new(crate::hooks::NoDirectedPresence),
            failure: Arc::new(crate::hooks::BounceAll),
            promise: OnceLock::new(),
            rpc: OnceLock::new(),
            component_iqs: ComponentIqTracker::new(),
        }
    }

    /// Serve an additional local domain.
    pub fn with_local_domain(mut self, domain: impl AsRef<str>) -> Self {
        self.local_domains.insert(domain.as_ref().to_lowercase());
        self
    }

    /// Set the cluster router used for routes owned by other nodes.
    pub fn with_remote_router(mut self, remote: Arc<dyn RemotePacketRouter>) -> Self {
        self.remote = remote;
        self
    }

    /// Set the directed-presence directory.
    pub fn with_presence_directory(mut self, presence: Arc<dyn PresenceDirectory>) -> Self {
        self.presence = presence;
        self
    }

    /// Set the handler consulted before bouncing undeliverable stanzas.
    pub fn with_failure_handler(mut self, failure: Arc<dyn RoutingFailureHandler>) -> Self {
        self.failure = failure;
        self
    }

    /// Wire up federation. Stanzas for remote domains without an
    /// established stream are queued while `authenticator` brings one up.
    /// Without this, remote routing fails outright.
    pub fn attach_federation(self: &Arc<Self>, authenticator: Arc<dyn DomainAuthenticator>) {
        let listener = Arc::new(PromiseListener(Arc::downgrade(self)));
        let promise = OutgoingSessionPromise::new(authenticator, listener);
        // A second attach keeps the first promise; queues must not split.
        let _ = self.promise.set(promise);
    }

    /// Use direct cluster RPC for sessions owned by other nodes. Routed
    /// client deliveries then go through per-session surrogates instead of
    /// the packet router. A second attach keeps the first transport.
    pub fn attach_cluster_rpc(&self, rpc: Arc<dyn ClusterRpc>) {
        let _ = self.rpc.set(rpc);
    }

    /// Surrogate handle for a client session hosted on another node.
    /// Needs an attached cluster RPC transport; `None` for local or
    /// unknown routes.
    pub fn remote_client(&self, full: &FullJid) -> Option<RemoteClientSession> {
        let record = self.client_route(full)?;
        if record.node == self.node_id {
            return None;
        }
        let rpc = self.rpc.get()?.clone();
        Some(RemoteClientSession::new(record.node, full.clone(), rpc))
    }

    /// This node's id.
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Whether `domain` is served by this server.
    pub fn is_local_domain(&self, domain: &str) -> bool {
        self.local_domains.contains(&domain.to_lowercase())
    }

    // ---- client routes ----

    /// Register a bound client session on this node.
    pub fn add_client_route(&self, session: Arc<ClientSession>) -> Result<(), XmppError> {
        let full = session
            .full_jid()
            .ok_or_else(|| XmppError::invalid_state("cannot route a session without a resource"))?;
        let record = ClientRoute::from_session(self.node_id, &session);
        let key = full.to_string();
        let bare = full.to_bare().to_string();

        self.local.add_client(full.clone(), session);
        if record.anonymous {
            self.anonymous_users.insert(key.clone(), record);
        } else {
            self.users.insert(key.clone(), record);
        }
        self.user_sessions.entry(bare).or_default().insert(key);
        debug!(jid = %full, "added client route");
        Ok(())
    }

    /// Refresh a local session's cache record after a presence change.
    pub fn update_client_presence(&self, session: &ClientSession) {
        let Some(full) = session.full_jid() else {
            return;
        };
        let record = ClientRoute::from_session(self.node_id, session);
        let key = full.to_string();
        if record.anonymous {
            self.anonymous_users.insert(key, record);
        } else {
            self.users.insert(key, record);
        }
    }

    /// Register a client route owned by another node, as replicated by
    /// cluster synchronization.
    pub fn register_remote_client(&self, full: &FullJid, record: ClientRoute) {
        let key = full.to_string();
        let bare = full.to_bare().to_string();
        if record.anonymous {
            self.anonymous_users.insert(key.clone(), record);
        } else {
            self.users.insert(key.clone(), record);
        }
        self.user_sessions.entry(bare).or_default().insert(key);
    }

    /// Drop a client route. The bare-JID index entry goes first so no
    /// reader resolves an indexed resource to a missing record.
    pub fn remove_client_route(&self, full: &FullJid) {
        let key = full.to_string();
        let bare = full.to_bare().to_string();

        if let Some(mut entry) = self.user_sessions.get_mut(&bare) {
            entry.value_mut().remove(&key);
        }
        self.user_sessions.remove_if(&bare, |_, set| set.is_empty());
        self.users.remove(&key);
        self.anonymous_users.remove(&key);
        self.local.remove(&RouteKey::Client(full.clone()));
        debug!(jid = %full, "removed client route");
    }

    /// The cache record for a full JID, anonymous or not.
    pub fn client_route(&self, full: &FullJid) -> Option<ClientRoute> {
        let key = full.to_string();
        self.users
            .get(&key)
            .map(|r| r.value().clone())
            .or_else(|| self.anonymous_users.get(&key).map(|r| r.value().clone()))
    }

    /// Whether a full JID belongs to an anonymous session.
    pub fn is_anonymous_route(&self, full: &FullJid) -> bool {
        self.anonymous_users.contains_key(&full.to_string())
    }

    /// Every route bound under a bare JID. Records for sessions on this
    /// node are refreshed from the live session.
    pub fn routes_for(&self, bare: &BareJid) -> Vec<(FullJid, ClientRoute)> {
        let keys: Vec<String> = self
            .user_sessions
            .get(&bare.to_string())
            .map(|entry| entry.value().iter().cloned().collect())
            .unwrap_or_default();
        keys.into_iter()
            .filter_map(|key| {
                let full: FullJid = key.parse().ok()?;
                let mut record = self.client_route(&full)?;
                if record.node == self.node_id {
                    let session = self.local.client(&full)?;
                    record = ClientRoute::from_session(self.node_id, &session);
                }
                Some((full, record))
            })
            .collect()
    }

    // ---- server and component routes ----

    /// Register an outgoing federation stream on this node.
    pub fn add_server_route(&self, pair: DomainPair, session: Arc<OutgoingServerSession>) {
        self.local.add_server(pair.clone(), session);
        self.servers.insert(pair, self.node_id);
    }

    /// Register a federation pair owned by another node.
    pub fn register_remote_server(&self, pair: DomainPair, node: NodeId) {
        self.servers.insert(pair, node);
    }

    /// The node owning the stream for a federation pair.
    pub fn server_route_node(&self, pair: &DomainPair) -> Option<NodeId> {
        self.servers.get(pair).map(|n| *n.value())
    }

    /// Drop a federation pair's route.
    pub fn remove_server_route(&self, pair: &DomainPair) {
        self.servers.remove(pair);
        self.local.remove(&RouteKey::Server(pair.clone()));
    }

    /// Register a component subdomain served by `node`.
    pub fn add_component_route(&self, subdomain: impl AsRef<str>, node: NodeId) {
        self.components
            .entry(subdomain.as_ref().to_lowercase())
            .or_default()
            .insert(node);
    }

    /// Drop one node's replica of a component route. Returns `true` when
    /// the subdomain has no serving nodes left.
    pub fn remove_component_route(&self, subdomain: &str, node: NodeId) -> bool {
        let subdomain = subdomain.to_lowercase();
        let emptied = match self.components.get_mut(&subdomain) {
            Some(mut entry) => {
                entry.value_mut().remove(&node);
                entry.value().is_empty()
            }
            None => true,
        };
        if emptied {
            self.components.remove(&subdomain);
        }
        if node == self.node_id {
            self.local.remove(&RouteKey::Component(subdomain));
        }
        emptied
    }

    /// Whether any node serves this component subdomain.
    pub fn has_component_route(&self, subdomain: &str) -> bool {
        self.components.contains_key(&subdomain.to_lowercase())
    }

    // ---- routing ----

    /// Route one stanza to wherever its `to` address leads.
    #[instrument(name = "route_packet", skip(self, packet), fields(kind = ?packet.kind()))]
    pub async fn route_packet(&self, packet: Packet) -> RoutingOutcome {
        self.route_inner(packet, 0).await
    }

    fn route_inner(&self, packet: Packet, depth: u8) -> BoxFuture<'_, RoutingOutcome> {
        async move {
            if depth >= MAX_ROUTE_DEPTH {
                warn!("routing depth exceeded, dropping stanza");
                return RoutingOutcome::Dropped;
            }
            if depth == 0 {
                self.track_component_iq(&packet);
            }
            let Some(to) = packet.to() else {
                // Address-less stanzas belong to the sending session's own
                // stream, not to routing.
                return RoutingOutcome::ServerAddressed;
            };
            let domain = to.domain().to_string().to_lowercase();

            if self.is_local_domain(&domain) {
                match to.clone().try_into_full() {
                    Ok(full) => self.route_to_full(&full, packet, depth).await,
                    Err(bare) => {
                        if bare.node().is_none() {
                            RoutingOutcome::ServerAddressed
                        } else {
                            self.route_to_bare(&bare, packet, depth).await
                        }
                    }
                }
            } else if self.local.component(&domain).is_some() || self.has_component_route(&domain) {
                self.route_to_component(&domain, &to, packet, depth).await
            } else {
                self.route_to_remote(&to, packet, depth).await
            }
        }
        .boxed()
    }

    /// Whether this stanza is withheld from sessions that never broadcast
    /// available presence. Server-originated stanzas and IQ responses go
    /// through regardless.
    fn restricted_to_available(&self, packet: &Packet) -> bool {
        // Error stanzas are bounces on their way back to the sender;
        // withholding them would strand them (and the double-bounce guard
        // then drops them on the floor).
        if packet.is_error() {
            return false;
        }
        match packet.from() {
            None => return false,
            Some(from) => {
                if from.node().is_none() && self.is_local_domain(&from.domain().to_string()) {
                    return false;
                }
            }
        }
        if let Some(iq_type) = packet.iq_type() {
            if !iq_type.is_request() {
                return false;
            }
        }
        true
    }

    async fn route_to_full(&self, full: &FullJid, packet: Packet, depth: u8) -> RoutingOutcome {
        let Some(record) = self.client_route(full) else {
            return self.routing_failed(&Jid::from(full.clone()), packet, depth).await;
        };

        if record.node != self.node_id {
            let to = Jid::from(full.clone());
            if self.deliver_remote(record.node, full, &packet).await {
                return RoutingOutcome::Delivered(1);
            }
            // The owning node disowned the route; the cache is stale.
            warn!(jid = %full, node = %record.node, "evicting stale remote client route");
            self.remove_client_route(full);
            return self.routing_failed(&to, packet, depth).await;
        }

        let Some(session) = self.local.client(full) else {
            warn!(jid = %full, "cache points here but no local session, evicting");
            self.remove_client_route(full);
            return self.routing_failed(&Jid::from(full.clone()), packet, depth).await;
        };

        if !session.is_available() && self.restricted_to_available(&packet) {
            let exempt = packet
                .from()
                .map(|from| {
                    self.presence
                        .has_direct_presence(&Jid::from(full.clone()), &from.to_bare())
                })
                .unwrap_or(false);
            if !exempt {
                return self.routing_failed(&Jid::from(full.clone()), packet, depth).await;
            }
        }

        match session.process(packet.clone()).await {
            Ok(ProcessOutcome::Processed) => RoutingOutcome::Delivered(1),
            Ok(ProcessOutcome::Rejected(Some(bounce))) => {
                self.route_inner(bounce, depth + 1).await;
                RoutingOutcome::Bounced
            }
            Ok(ProcessOutcome::Rejected(None)) => RoutingOutcome::Dropped,
            Err(e) => {
                warn!(jid = %full, error = %e, "local delivery failed");
                self.routing_failed(&Jid::from(full.clone()), packet, depth).await
            }
        }
    }

    async fn route_to_bare(&self, bare: &BareJid, packet: Packet, depth: u8) -> RoutingOutcome {
        // Only messages address a user's bare JID. IQ and presence need a
        // full JID (or the server itself) and bounce before any resource
        // selection happens.
        if packet.kind() != PacketKind::Message {
            return self.routing_failed(&Jid::from(bare.clone()), packet, depth).await;
        }
        match packet.message_type() {
            // A message error with no precise recipient has nowhere
            // sane to go; dropping it is the loop-safe answer.
            MessageType::Error => return RoutingOutcome::Dropped,
            // Groupchat traffic must come through a room, never a
            // user's bare JID.
            MessageType::Groupchat => {
                return self.routing_failed(&Jid::from(bare.clone()), packet, depth).await;
            }
            MessageType::Headline => {
                return self.route_headline(bare, packet, depth).await;
            }
            _ => {}
        }

        let sender_bare = packet.from().map(|from| from.to_bare());
        let candidates: Vec<(FullJid, ClientRoute)> = self
            .routes_for(bare)
            .into_iter()
            .filter(|(full, r)| {
                if !r.initialized || r.priority < 0 {
                    return false;
                }
                if r.available {
                    return true;
                }
                // An unavailable resource the sender shared directed
                // presence with stays reachable.
                sender_bare
                    .as_ref()
                    .map(|sender| {
                        self.presence
                            .has_direct_presence(&Jid::from(full.clone()), sender)
                    })
                    .unwrap_or(false)
            })
            .collect();

        if candidates.is_empty() {
            return self.routing_failed(&Jid::from(bare.clone()), packet, depth).await;
        }

        let targets: Vec<&(FullJid, ClientRoute)> = if self.config.route_really_all_resources {
            candidates.iter().collect()
        } else if self.config.route_all_resources {
            let top = candidates.iter().map(|(_, r)| r.priority).max().unwrap_or(0);
            candidates.iter().filter(|(_, r)| r.priority == top).collect()
        } else {
            // Highest priority, then the most desirable show value, then
            // the most recently active.
            candidates
                .iter()
                .min_by_key(|(_, r)| (-(r.priority as i16), r.show_weight, -r.last_active_ms))
                .into_iter()
                .collect()
        };

        let mut delivered = 0usize;
        for (full, record) in &targets {
            if self.deliver_to_route(full, record, packet.clone(), depth).await {
                delivered += 1;
            }
        }

        if delivered == 0 {
            return self.routing_failed(&Jid::from(bare.clone()), packet, depth).await;
        }

        if packet.is_carbon_eligible() {
            self.fan_out_carbons(bare, &candidates, &targets, &packet, depth).await;
        }

        RoutingOutcome::Delivered(delivered)
    }

    /// Headline messages go to every available non-negative resource.
    async fn route_headline(&self, bare: &BareJid, packet: Packet, depth: u8) -> RoutingOutcome {
        let targets: Vec<(FullJid, ClientRoute)> = self
            .routes_for(bare)
            .into_iter()
            .filter(|(_, r)| r.initialized && r.available && r.priority >= 0)
            .collect();
        if targets.is_empty() {
            return self.routing_failed(&Jid::from(bare.clone()), packet, depth).await;
        }
        let mut delivered = 0usize;
        for (full, record) in &targets {
            if self.deliver_to_route(full, record, packet.clone(), depth).await {
                delivered += 1;
            }
        }
        if delivered == 0 {
            self.routing_failed(&Jid::from(bare.clone()), packet, depth).await
        } else {
            RoutingOutcome::Delivered(delivered)
        }
    }

    /// Carbon-copy a delivered message to the recipient's other resources
    /// that enabled carbons (XEP-0280).
    async fn fan_out_carbons(
        &self,
        bare: &BareJid,
        candidates: &[(FullJid, ClientRoute)],
        targets: &[&(FullJid, ClientRoute)],
        packet: &Packet,
        depth: u8,
    ) {
        for (full, record) in candidates {
            if !record.carbons_enabled {
                continue;
            }
            if targets.iter().any(|(t, _)| t == full) {
                continue;
            }
            let copy = packet.carbon_copy(bare, full);
            if !self.deliver_to_route(full, record, copy, depth).await {
                debug!(jid = %full, "carbon copy not delivered");
            }
        }
    }

    /// Deliver to one resolved client route, local or remote. Returns
    /// whether the stanza was consumed (delivered, bounced or dropped by
    /// the session); a `false` means the route did not take it at all.
    async fn deliver_to_route(
        &self,
        full: &FullJid,
        record: &ClientRoute,
        packet: Packet,
        depth: u8,
    ) -> bool {
        if record.node == self.node_id {
            let Some(session) = self.local.client(full) else {
                self.remove_client_route(full);
                return false;
            };
            match session.process(packet).await {
                Ok(ProcessOutcome::Processed) => true,
                Ok(ProcessOutcome::Rejected(Some(bounce))) => {
                    self.route_inner(bounce, depth + 1).await;
                    true
                }
                Ok(ProcessOutcome::Rejected(None)) => true,
                Err(_) => false,
            }
        } else if self.deliver_remote(record.node, full, &packet).await {
            true
        } else {
            warn!(jid = %full, node = %record.node, "evicting stale remote client route");
            self.remove_client_route(full);
            false
        }
    }

    /// Deliver to a client session owned by another node. A direct RPC
    /// surrogate is preferred when a transport is attached; otherwise the
    /// packet router carries it.
    async fn deliver_remote(&self, node: NodeId, full: &FullJid, packet: &Packet) -> bool {
        if let Some(rpc) = self.rpc.get() {
            let surrogate = RemoteClientSession::new(node, full.clone(), rpc.clone());
            return match surrogate.deliver(packet).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(jid = %full, node = %node, error = %e, "remote surrogate delivery failed");
                    false
                }
            };
        }
        self.remote
            .route_packet(node, &Jid::from(full.clone()), packet)
            .await
    }

    /// Remember which component connection issued an IQ request, so the
    /// reply can be steered back to exactly that session.
    fn track_component_iq(&self, packet: &Packet) {
        let Some(iq_type) = packet.iq_type() else {
            return;
        };
        if !iq_type.is_request() {
            return;
        }
        let (Some(from), Some(id)) = (packet.from(), packet.id()) else {
            return;
        };
        let from_domain = from.domain().to_string().to_lowercase();
        if let Some(session) = self.local.component(&from_domain) {
            self.component_iqs.track(id, session.primary_subdomain());
        }
    }

    async fn route_to_component(
        &self,
        domain: &str,
        to: &Jid,
        packet: Packet,
        depth: u8,
    ) -> RoutingOutcome {
        // A reply to an IQ a component issued returns to the exact session
        // that asked, not to whichever replica serves the domain now.
        if matches!(packet.iq_type(), Some(t) if !t.is_request()) {
            if let Some(issuer) = packet.id().and_then(|id| self.component_iqs.claim(id)) {
                if let Some(session) = self.local.component(&issuer) {
                    match session.deliver(packet.clone()).await {
                        Ok(()) => return RoutingOutcome::Delivered(1),
                        Err(e) => {
                            warn!(subdomain = %issuer, error = %e, "issuing component unreachable for reply");
                        }
                    }
                }
            }
        }
        if let Some(session) = self.local.component(domain) {
            match session.deliver(packet.clone()).await {
                Ok(()) => return RoutingOutcome::Delivered(1),
                Err(e) => {
                    warn!(domain = %domain, error = %e, "local component delivery failed");
                    // Fall through to other nodes' replicas, if any.
                }
            }
        }
        let nodes: Vec<NodeId> = self
            .components
            .get(&domain.to_lowercase())
            .map(|entry| entry.value().iter().copied().collect())
            .unwrap_or_default();
        for node in nodes {
            if node == self.node_id {
                continue;
            }
            if self.remote.route_packet(node, to, &packet).await {
                return RoutingOutcome::Delivered(1);
            }
        }
        self.routing_failed(to, packet, depth).await
    }

    async fn route_to_remote(&self, to: &Jid, packet: Packet, depth: u8) -> RoutingOutcome {
        let sender = packet.from();

        // Anonymous users stay inside this server unless configured
        // otherwise.
        if !self.config.allow_anonymous_outbound {
            let anonymous = sender
                .as_ref()
                .and_then(|from| from.clone().try_into_full().ok())
                .map(|full| self.is_anonymous_route(&full))
                .unwrap_or(false);
            if anonymous {
                debug!(to = %to, "anonymous sender blocked from remote domain");
                return self.routing_failed(to, packet, depth).await;
            }
        }

        let local_domain = sender
            .as_ref()
            .map(|from| from.domain().to_string().to_lowercase())
            .filter(|d| self.is_local_domain(d) || self.has_component_route(d))
            .unwrap_or_else(|| self.server_name.clone());
        let pair = DomainPair::new(local_domain, to.domain().to_string());

        if let Some(node) = self.server_route_node(&pair) {
            if node == self.node_id {
                if let Some(session) = self.local.server(&pair) {
                    match session.deliver(packet.clone()).await {
                        Ok(()) => return RoutingOutcome::Delivered(1),
                        Err(e) => {
                            warn!(pair = %pair, error = %e, "outgoing stream rejected stanza, evicting route");
                        }
                    }
                }
                self.remove_server_route(&pair);
            } else if self.remote.route_packet(node, to, &packet).await {
                return RoutingOutcome::Delivered(1);
            } else {
                warn!(pair = %pair, node = %node, "evicting stale server route");
                self.remove_server_route(&pair);
            }
        }

        match self.promise.get() {
            Some(promise) => {
                info!(pair = %pair, "queueing stanza while outgoing stream is established");
                promise.queue(pair, packet);
                RoutingOutcome::Queued
            }
            None => self.routing_failed(to, packet, depth).await,
        }
    }

    /// Deliver to every client session, cluster-wide unless `only_local`.
    pub async fn broadcast(&self, packet: &Packet, only_local: bool) -> usize {
        let mut delivered = 0usize;
        for session in self.local.client_routes() {
            if session.common().is_closed() {
                continue;
            }
            if session.common().deliver(packet.clone()).await.is_ok() {
                delivered += 1;
            }
        }
        if !only_local {
            self.remote.broadcast_packet(packet).await;
        }
        delivered
    }

    /// Last resort for an undeliverable stanza: offer it to the failure
    /// handler, then bounce it. Local recipients bounce
    /// `service-unavailable`, remote ones `remote-server-not-found`.
    async fn routing_failed(&self, to: &Jid, packet: Packet, depth: u8) -> RoutingOutcome {
        if self.failure.routing_failed(to, &packet).await {
            return RoutingOutcome::Stored;
        }
        let domain = to.domain().to_string().to_lowercase();
        let condition = if self.is_local_domain(&domain) || self.has_component_route(&domain) {
            StanzaErrorCondition::ServiceUnavailable
        } else {
            StanzaErrorCondition::RemoteServerNotFound
        };
        match packet.error_reply(condition) {
            Some(bounce) => {
                self.route_inner(bounce, depth + 1).await;
                RoutingOutcome::Bounced
            }
            None => RoutingOutcome::Dropped,
        }
    }
}

impl std::fmt::Debug for RoutingTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingTable")
            .field("node_id", &self.node_id)
            .field("server_name", &self.server_name)
            .field("users", &self.users.len())
            .field("anonymous_users", &self.anonymous_users.len())
            .field("servers", &self.servers.len())
            .field("components", &self.components.len())
            .finish()
    }
}

/// Feeds promise outcomes back into the routing table without keeping it
/// alive.
struct PromiseListener(Weak<RoutingTable>);

#[async_trait]
impl OutgoingSessionListener for PromiseListener {
    async fn session_established(&self, pair: &DomainPair, session: Arc<OutgoingServerSession>) {
        if let Some(table) = self.0.upgrade() {
            table.add_server_route(pair.clone(), session);
        }
    }

    async fn session_failed(&self, _pair: &DomainPair, packet: Packet) {
        let Some(table) = self.0.upgrade() else {
            return;
        };
        if let Some(to) = packet.to() {
            table.routing_failed(&to, packet, 0).await;
        }
    }
}
