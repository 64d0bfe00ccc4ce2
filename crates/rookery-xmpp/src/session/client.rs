//! Client sessions and the detached-session registry.
//!
//! A client session is addressable once a resource is bound. Its cached
//! presence drives the bare-JID routing decisions: availability, priority
//! and show value all come from the last broadcast presence.

use dashmap::DashMap;
use jid::{BareJid, FullJid, Jid};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::debug;

use crate::error::{StanzaErrorCondition, XmppError};
use crate::hooks::{PacketInterceptor, PrivacyListProvider};
use crate::session::{ProcessOutcome, Session, SessionCommon, SessionStatus, StreamId};
use crate::stanza::{IqType, Packet, PacketKind, PresenceShow};

/// A session for one connected client resource.
pub struct ClientSession {
    common: SessionCommon,
    address: RwLock<Option<FullJid>>,
    presence: RwLock<Option<Packet>>,
    anonymous: AtomicBool,
    initialized: AtomicBool,
    carbons_enabled: AtomicBool,
    conflict_count: AtomicU32,
    privacy: Arc<dyn PrivacyListProvider>,
    interceptors: Vec<Arc<dyn PacketInterceptor>>,
}

impl ClientSession {
    /// Create a session for a freshly negotiated client stream.
    pub fn new(common: SessionCommon, privacy: Arc<dyn PrivacyListProvider>) -> Self {
        Self {
            common,
            address: RwLock::new(None),
            presence: RwLock::new(None),
            anonymous: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
            carbons_enabled: AtomicBool::new(false),
            conflict_count: AtomicU32::new(0),
            privacy,
            interceptors: Vec::new(),
        }
    }

    /// Install the interceptor chain consulted around every delivery.
    pub fn with_interceptors(mut self, interceptors: Vec<Arc<dyn PacketInterceptor>>) -> Self {
        self.interceptors = interceptors;
        self
    }

    /// The bound full JID, once a resource is bound.
    pub fn full_jid(&self) -> Option<FullJid> {
        self.address.read().expect("address lock poisoned").clone()
    }

    /// The bare form of the bound JID.
    pub fn bare_jid(&self) -> Option<BareJid> {
        self.full_jid().map(|j| j.to_bare())
    }

    /// Record the bound resource.
    pub fn set_full_jid(&self, jid: FullJid) {
        *self.address.write().expect("address lock poisoned") = Some(jid);
    }

    /// Whether this session authenticated anonymously.
    pub fn is_anonymous(&self) -> bool {
        self.anonymous.load(Ordering::Relaxed)
    }

    /// Mark the session as anonymous.
    pub fn set_anonymous(&self, anonymous: bool) {
        self.anonymous.store(anonymous, Ordering::Relaxed);
    }

    /// Whether the session finished post-bind initialization.
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Relaxed)
    }

    /// Mark post-bind initialization complete.
    pub fn set_initialized(&self, initialized: bool) {
        self.initialized.store(initialized, Ordering::Relaxed);
    }

    /// Whether the client enabled message carbons.
    pub fn carbons_enabled(&self) -> bool {
        self.carbons_enabled.load(Ordering::Relaxed)
    }

    /// Record the client's carbons preference.
    pub fn set_carbons_enabled(&self, enabled: bool) {
        self.carbons_enabled.store(enabled, Ordering::Relaxed);
    }

    /// How often this session has survived a resource-conflict challenge.
    pub fn conflict_count(&self) -> u32 {
        self.conflict_count.load(Ordering::Relaxed)
    }

    /// Record one conflict challenge, returning the new count.
    pub fn increment_conflict_count(&self) -> u32 {
        self.conflict_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// The last broadcast presence, if any.
    pub fn presence(&self) -> Option<Packet> {
        self.presence.read().expect("presence lock poisoned").clone()
    }

    /// Record a broadcast presence update.
    pub fn set_presence(&self, presence: Packet) {
        debug_assert_eq!(presence.kind(), PacketKind::Presence);
        self.common.touch();
        *self.presence.write().expect("presence lock poisoned") = Some(presence);
    }

    /// Whether the session announced availability.
    pub fn is_available(&self) -> bool {
        self.presence()
            .map(|p| p.is_available_presence())
            .unwrap_or(false)
    }

    /// Broadcast presence priority. Sessions without presence count as 0.
    pub fn priority(&self) -> i8 {
        self.presence().map(|p| p.priority()).unwrap_or(0)
    }

    /// Broadcast presence show value.
    pub fn show(&self) -> PresenceShow {
        self.presence().map(|p| p.show()).unwrap_or_default()
    }

    /// Deliver a stanza to this client, honoring the recipient's privacy
    /// list.
    ///
    /// Blocked IQ requests and messages are answered with
    /// `service-unavailable`; blocked presence and IQ responses are dropped
    /// without a trace, so the blocked sender cannot probe the list.
    pub async fn process(&self, mut packet: Packet) -> Result<ProcessOutcome, XmppError> {
        if let Some(owner) = self.bare_jid() {
            if self.privacy.should_block(&owner, &packet).await {
                debug!(
                    owner = %owner,
                    kind = ?packet.kind(),
                    "privacy list blocked delivery"
                );
                let bounce = match packet.kind() {
                    PacketKind::Message => {
                        packet.error_reply(StanzaErrorCondition::ServiceUnavailable)
                    }
                    PacketKind::Iq if matches!(packet.iq_type(), Some(t) if t.is_request()) => {
                        packet.error_reply(StanzaErrorCondition::ServiceUnavailable)
                    }
                    _ => None,
                };
                return Ok(ProcessOutcome::Rejected(bounce));
            }
        }
        let address = self.address();
        for interceptor in &self.interceptors {
            if let Err(rejected) = interceptor.intercept(&packet, &address, false, false).await {
                debug!(address = %address, %rejected, "interceptor rejected delivery");
                let bounce = match (&rejected.reason, packet.kind()) {
                    (Some(_), PacketKind::Message) => {
                        packet.error_reply(StanzaErrorCondition::NotAcceptable)
                    }
                    (Some(_), PacketKind::Iq)
                        if matches!(packet.iq_type(), Some(t) if t.is_request()) =>
                    {
                        packet.error_reply(StanzaErrorCondition::NotAcceptable)
                    }
                    _ => None,
                };
                return Ok(ProcessOutcome::Rejected(bounce));
            }
        }
        packet.strip_carbon_private();
        self.common.deliver(packet.clone()).await?;
        for interceptor in &self.interceptors {
            // The post-delivery pass is for auditing only.
            let _ = interceptor.intercept(&packet, &address, false, true).await;
        }
        Ok(ProcessOutcome::Processed)
    }

    /// Snapshot the session state for a later resumption.
    pub fn detach(&self) -> DetachedClientState {
        DetachedClientState {
            stream_id: self.common.stream_id().clone(),
            full_jid: self.full_jid(),
            presence: self.presence(),
            anonymous: self.is_anonymous(),
            carbons_enabled: self.carbons_enabled(),
            conflict_count: self.conflict_count(),
            detached_at: chrono::Utc::now(),
        }
    }

    /// Rebuild a session from a detached snapshot on a new stream.
    pub fn resume(
        state: DetachedClientState,
        common: SessionCommon,
        privacy: Arc<dyn PrivacyListProvider>,
    ) -> Result<Self, XmppError> {
        common.set_status(SessionStatus::Authenticated)?;
        let session = Self::new(common, privacy);
        if let Some(jid) = state.full_jid {
            session.set_full_jid(jid);
        }
        if let Some(presence) = state.presence {
            session.set_presence(presence);
        }
        session.set_anonymous(state.anonymous);
        session.set_carbons_enabled(state.carbons_enabled);
        session.conflict_count.store(state.conflict_count, Ordering::Relaxed);
        session.set_initialized(true);
        Ok(session)
    }
}

impl Session for ClientSession {
    fn common(&self) -> &SessionCommon {
        &self.common
    }

    fn address(&self) -> Jid {
        match self.full_jid() {
            Some(full) => Jid::from(full),
            // Pre-bind sessions answer under the server's own domain.
            None => Jid::from_parts(None, &jid::DomainPart::new(self.common.server_name())
                .expect("server name is a valid domain"), None),
        }
    }
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("common", &self.common)
            .field("full_jid", &self.full_jid())
            .field("anonymous", &self.is_anonymous())
            .field("available", &self.is_available())
            .finish()
    }
}

/// Snapshot of a client session awaiting resumption.
#[derive(Debug, Clone)]
pub struct DetachedClientState {
    /// Stream id of the detached stream, used as the resumption handle
    pub stream_id: StreamId,
    /// Bound full JID, if any
    pub full_jid: Option<FullJid>,
    /// Last broadcast presence
    pub presence: Option<Packet>,
    /// Anonymous flag
    pub anonymous: bool,
    /// Carbons preference
    pub carbons_enabled: bool,
    /// Conflict challenges survived
    pub conflict_count: u32,
    /// When the session detached
    pub detached_at: chrono::DateTime<chrono::Utc>,
}

/// Holds detached client sessions for the resumption window.
pub struct DetachedSessionRegistry {
    sessions: DashMap<String, DetachedClientState>,
    window: Duration,
}

impl DetachedSessionRegistry {
    /// Create a registry with the given resumption window.
    pub fn new(window: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            window,
        }
    }

    /// Store a detached session, keyed by its stream id.
    pub fn store(&self, state: DetachedClientState) {
        self.sessions.insert(state.stream_id.as_str().to_string(), state);
    }

    /// Take a detached session for resumption. Expired entries are treated
    /// as absent.
    pub fn take(&self, stream_id: &StreamId) -> Option<DetachedClientState> {
        let (_, state) = self.sessions.remove(stream_id.as_str())?;
        if self.is_expired(&state) {
            return None;
        }
        Some(state)
    }

    /// Remove and return every expired entry so the caller can run each
    /// through the normal close path.
    pub fn sweep(&self) -> Vec<DetachedClientState> {
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| self.is_expired(entry.value()))
            .map(|entry| entry.key().clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|key| self.sessions.remove(&key).map(|(_, state)| state))
            .collect()
    }

    /// Number of sessions currently held.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn is_expired(&self, state: &DetachedClientState) -> bool {
        let age = chrono::Utc::now().signed_duration_since(state.detached_at);
        age.to_std().map(|age| age > self.window).unwrap_or(false)
    }
}
