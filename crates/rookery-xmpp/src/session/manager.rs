//! Bookkeeping for live sessions.
//!
//! The session manager tracks who is connected: client sessions by bound
//! full JID (applying the resource-conflict policy), incoming server
//! sessions indexed by validated domain, and component sessions by
//! subdomain. It also owns the detached-session registry and its sweeper.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use jid::FullJid;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::dialback::{DialbackRequest, DialbackResult, KeyVerifier};
use crate::error::{StreamErrorCondition, XmppError};
use crate::hooks::PrivacyListProvider;
use crate::session::client::{ClientSession, DetachedSessionRegistry};
use crate::session::component::ComponentSession;
use crate::session::server::IncomingServerSession;
use crate::session::{Session, SessionCommon, StreamId};

/// Tracks every live session on this node.
pub struct SessionManager {
    config: SessionConfig,
    clients: DashMap<String, Arc<ClientSession>>,
    incoming_servers: DashMap<String, Arc<IncomingServerSession>>,
    incoming_by_domain: DashMap<String, HashSet<String>>,
    components: DashMap<String, Arc<ComponentSession>>,
    detached: DetachedSessionRegistry,
}

impl SessionManager {
    /// Create a manager with the given policy.
    pub fn new(config: SessionConfig) -> Self {
        let detached = DetachedSessionRegistry::new(config.detach_window);
        Self {
            config,
            clients: DashMap::new(),
            incoming_servers: DashMap::new(),
            incoming_by_domain: DashMap::new(),
            components: DashMap::new(),
            detached,
        }
    }

    // ---- client sessions ----

    /// Bind a client session to a full JID, applying the conflict policy
    /// when the resource is already taken.
    ///
    /// With `conflict_limit = 0` the older session is kicked at once; with
    /// `-1` the new binding is rejected; with `n > 0` the older session is
    /// challenged and kicked only once it has been challenged more than
    /// `n` times.
    pub async fn bind_client(
        &self,
        session: Arc<ClientSession>,
        jid: FullJid,
    ) -> Result<(), XmppError> {
        session.set_full_jid(jid.clone());
        let key = jid.to_string();

        let evicted = match self.clients.entry(key) {
            Entry::Vacant(slot) => {
                slot.insert(session);
                None
            }
            Entry::Occupied(mut slot) => {
                let limit = self.config.conflict_limit;
                let kick = if limit < 0 {
                    false
                } else if limit == 0 {
                    true
                } else {
                    slot.get().increment_conflict_count() as i32 > limit
                };
                if !kick {
                    return Err(XmppError::ResourceConflict(format!(
                        "resource already bound: {}",
                        jid
                    )));
                }
                Some(slot.insert(session))
            }
        };

        if let Some(old) = evicted {
            info!(jid = %jid, "kicking older session after resource conflict");
            old.common().close_with_error(StreamErrorCondition::Conflict).await;
        }
        Ok(())
    }

    /// Remove a client binding. When `stream_id` is given, only the session
    /// with that stream is removed; a replacement bound in the meantime
    /// stays.
    pub fn unbind_client(&self, jid: &FullJid, stream_id: Option<&StreamId>) {
        let key = jid.to_string();
        if let Some(expected) = stream_id {
            self.clients
                .remove_if(&key, |_, session| session.stream_id() == expected);
        } else {
            self.clients.remove(&key);
        }
    }

    /// Look up a client session by full JID.
    pub fn client(&self, jid: &FullJid) -> Option<Arc<ClientSession>> {
        self.clients.get(&jid.to_string()).map(|s| s.clone())
    }

    /// Number of bound client sessions.
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Detach a client session for later resumption, dropping its binding.
    pub fn detach_client(&self, session: &Arc<ClientSession>) {
        let state = session.detach();
        debug!(stream = %state.stream_id, "client session detached");
        if let Some(jid) = &state.full_jid {
            self.unbind_client(jid, Some(session.stream_id()));
        }
        self.detached.store(state);
    }

    /// Resume a detached session on a new stream. Fails when the handle is
    /// unknown or the resumption window has passed.
    pub async fn resume_client(
        &self,
        stream_id: &StreamId,
        common: SessionCommon,
        privacy: Arc<dyn PrivacyListProvider>,
    ) -> Result<Arc<ClientSession>, XmppError> {
        let state = self
            .detached
            .take(stream_id)
            .ok_or(XmppError::SessionNotFound)?;
        let session = Arc::new(ClientSession::resume(state, common, privacy)?);
        if let Some(jid) = session.full_jid() {
            self.bind_client(session.clone(), jid).await?;
        }
        Ok(session)
    }

    /// Detached sessions currently awaiting resumption.
    pub fn detached_count(&self) -> usize {
        self.detached.len()
    }

    /// Spawn the periodic sweep of expired detached sessions. Cancel the
    /// returned token to stop it.
    pub fn start_detached_sweeper(self: &Arc<Self>, every: Duration) -> CancellationToken {
        let token = CancellationToken::new();
        let child = token.child_token();
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = interval.tick() => {
                        for state in manager.detached.sweep() {
                            info!(
                                stream = %state.stream_id,
                                jid = ?state.full_jid,
                                "detached session expired"
                            );
                        }
                    }
                }
            }
        });
        token
    }

    // ---- incoming server sessions ----

    /// Track an accepted incoming server session.
    pub fn register_incoming_server(&self, session: Arc<IncomingServerSession>) {
        self.incoming_servers
            .insert(session.stream_id().as_str().to_string(), session);
    }

    /// Verify a dialback request on an existing incoming stream and, on
    /// success, index the newly validated domain.
    ///
    /// Enforces the per-domain session cap before touching the wire.
    pub async fn validate_incoming_domain(
        &self,
        session: &Arc<IncomingServerSession>,
        request: &DialbackRequest,
        verifier: &dyn KeyVerifier,
    ) -> Result<DialbackResult, XmppError> {
        let domain = request.from.to_lowercase();
        if let Some(cap) = self.config.max_incoming_per_domain {
            let current = self
                .incoming_by_domain
                .get(&domain)
                .map(|set| set.len())
                .unwrap_or(0);
            if current >= cap && !session.is_validated(&domain) {
                warn!(domain = %domain, cap, "incoming server session cap reached");
                return Err(XmppError::Stream(StreamErrorCondition::ResourceConstraint));
            }
        }

        let result = session.validate_subsequent_domain(request, verifier).await?;
        if result == DialbackResult::Valid {
            self.incoming_by_domain
                .entry(domain)
                .or_default()
                .insert(session.stream_id().as_str().to_string());
        }
        Ok(result)
    }

    /// Incoming sessions that have validated `domain`. Used to piggyback
    /// reverse authentication on an existing stream.
    pub fn incoming_sessions_for_domain(&self, domain: &str) -> Vec<Arc<IncomingServerSession>> {
        let domain = domain.to_lowercase();
        let Some(ids) = self.incoming_by_domain.get(&domain) else {
            return Vec::new();
        };
        ids.iter()
            .filter_map(|id| self.incoming_servers.get(id.as_str()).map(|s| s.clone()))
            .filter(|s| !s.common().is_closed())
            .collect()
    }

    /// Drop an incoming server session and all its domain index entries.
    pub fn unregister_incoming_server(&self, stream_id: &StreamId) {
        if let Some((id, _session)) = self.incoming_servers.remove(stream_id.as_str()) {
            self.incoming_by_domain.retain(|_, ids| {
                ids.remove(&id);
                !ids.is_empty()
            });
        }
    }

    // ---- component sessions ----

    /// Register a component session for its primary subdomain.
    ///
    /// A second session for an already-served subdomain is refused: the new
    /// stream is closed with a `conflict` stream error.
    pub async fn register_component(
        &self,
        session: Arc<ComponentSession>,
    ) -> Result<(), XmppError> {
        let key = session.primary_subdomain().to_string();
        let conflict = match self.components.entry(key.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(session);
                None
            }
            Entry::Occupied(mut slot) => {
                if slot.get().common().is_closed() {
                    slot.insert(session);
                    None
                } else {
                    Some(session)
                }
            }
        };

        if let Some(rejected) = conflict {
            warn!(subdomain = %key, "component subdomain already in use");
            rejected
                .common()
                .close_with_error(StreamErrorCondition::Conflict)
                .await;
            return Err(XmppError::ResourceConflict(format!(
                "component subdomain already in use: {}",
                key
            )));
        }
        Ok(())
    }

    /// The component session serving `subdomain`, if any.
    pub fn component(&self, subdomain: &str) -> Option<Arc<ComponentSession>> {
        self.components
            .get(&subdomain.to_lowercase())
            .map(|s| s.clone())
    }

    /// Drop a component registration, but only for the given stream.
    pub fn unregister_component(&self, subdomain: &str, stream_id: &StreamId) {
        self.components
            .remove_if(&subdomain.to_lowercase(), |_, session| {
                session.stream_id() == stream_id
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::MockConnection;
    use crate::dialback::{DialbackKey, LocalKeyVerifier};
    use crate::hooks::NoPrivacyLists;
    use crate::session::SessionStatus;

    fn client_session() -> (Arc<MockConnection>, Arc<ClientSession>) {
        let conn = Arc::new(MockConnection::new());
        let common = SessionCommon::new(StreamId::generate(), "rookery.im", conn.clone());
        (conn, Arc::new(ClientSession::new(common, Arc::new(NoPrivacyLists))))
    }

    fn jid() -> FullJid {
        "alice@rookery.im/phone".parse().unwrap()
    }

    #[tokio::test]
    async fn test_conflict_default_kicks_older_session() {
        let manager = SessionManager::new(SessionConfig::default());
        let (old_conn, old) = client_session();
        let (_, new) = client_session();

        manager.bind_client(old, jid()).await.unwrap();
        manager.bind_client(new.clone(), jid()).await.unwrap();

        assert_eq!(old_conn.stream_error(), Some(StreamErrorCondition::Conflict));
        assert_eq!(manager.client_count(), 1);
        assert!(Arc::ptr_eq(&manager.client(&jid()).unwrap(), &new));
    }

    #[tokio::test]
    async fn test_conflict_negative_limit_rejects_new_binding() {
        let manager = SessionManager::new(SessionConfig::default().with_conflict_limit(-1));
        let (old_conn, old) = client_session();
        let (_, new) = client_session();

        manager.bind_client(old.clone(), jid()).await.unwrap();
        let err = manager.bind_client(new, jid()).await;

        assert!(matches!(err, Err(XmppError::ResourceConflict(_))));
        assert!(old_conn.stream_error().is_none());
        assert!(Arc::ptr_eq(&manager.client(&jid()).unwrap(), &old));
    }

    #[tokio::test]
    async fn test_conflict_positive_limit_kicks_after_n_challenges() {
        let manager = SessionManager::new(SessionConfig::default().with_conflict_limit(2));
        let (old_conn, old) = client_session();
        manager.bind_client(old, jid()).await.unwrap();

        // First two challenges are refused.
        for _ in 0..2 {
            let (_, challenger) = client_session();
            assert!(manager.bind_client(challenger, jid()).await.is_err());
        }
        assert!(old_conn.stream_error().is_none());

        // The third one exceeds the limit and wins.
        let (_, winner) = client_session();
        manager.bind_client(winner.clone(), jid()).await.unwrap();
        assert_eq!(old_conn.stream_error(), Some(StreamErrorCondition::Conflict));
        assert!(Arc::ptr_eq(&manager.client(&jid()).unwrap(), &winner));
    }

    #[tokio::test]
    async fn test_unbind_respects_stream_guard() {
        let manager = SessionManager::new(SessionConfig::default());
        let (_, session) = client_session();
        let other_stream = StreamId::generate();

        manager.bind_client(session.clone(), jid()).await.unwrap();
        manager.unbind_client(&jid(), Some(&other_stream));
        assert_eq!(manager.client_count(), 1);

        manager.unbind_client(&jid(), Some(session.stream_id()));
        assert_eq!(manager.client_count(), 0);
    }

    #[tokio::test]
    async fn test_detach_and_resume_through_manager() {
        let manager = SessionManager::new(SessionConfig::default());
        let (_, session) = client_session();
        session.common().set_status(SessionStatus::Authenticated).unwrap();
        manager.bind_client(session.clone(), jid()).await.unwrap();

        let handle = session.stream_id().clone();
        manager.detach_client(&session);
        assert_eq!(manager.client_count(), 0);
        assert_eq!(manager.detached_count(), 1);

        let conn = Arc::new(MockConnection::new());
        let common = SessionCommon::new(StreamId::generate(), "rookery.im", conn);
        let resumed = manager
            .resume_client(&handle, common, Arc::new(NoPrivacyLists))
            .await
            .unwrap();

        assert_eq!(manager.detached_count(), 0);
        assert_eq!(manager.client_count(), 1);
        assert_eq!(resumed.full_jid().unwrap(), jid());

        // The handle is single-use.
        let conn = Arc::new(MockConnection::new());
        let common = SessionCommon::new(StreamId::generate(), "rookery.im", conn);
        assert!(manager
            .resume_client(&handle, common, Arc::new(NoPrivacyLists))
            .await
            .is_err());
    }

    fn incoming_session() -> Arc<IncomingServerSession> {
        let conn = Arc::new(MockConnection::new());
        let common = SessionCommon::new(StreamId::generate(), "rookery.im", conn);
        Arc::new(IncomingServerSession::new(common, "rookery.im"))
    }

    #[tokio::test]
    async fn test_incoming_domain_index() {
        let manager = SessionManager::new(SessionConfig::default());
        let session = incoming_session();
        manager.register_incoming_server(session.clone());

        let key_gen = DialbackKey::random();
        let key = key_gen.generate(session.stream_id().as_str(), "rookery.im", "remote.example");
        let verifier = LocalKeyVerifier::new(key_gen);
        let request = DialbackRequest::new("remote.example", "rookery.im", key);

        let result = manager
            .validate_incoming_domain(&session, &request, &verifier)
            .await
            .unwrap();
        assert_eq!(result, DialbackResult::Valid);

        let found = manager.incoming_sessions_for_domain("Remote.Example");
        assert_eq!(found.len(), 1);
        assert!(Arc::ptr_eq(&found[0], &session));

        manager.unregister_incoming_server(session.stream_id());
        assert!(manager.incoming_sessions_for_domain("remote.example").is_empty());
    }

    #[tokio::test]
    async fn test_incoming_session_cap() {
        let manager =
            SessionManager::new(SessionConfig::default().with_max_incoming_per_domain(1));
        let key_gen = DialbackKey::random();

        let first = incoming_session();
        manager.register_incoming_server(first.clone());
        let key = key_gen.generate(first.stream_id().as_str(), "rookery.im", "remote.example");
        let verifier = LocalKeyVerifier::new(key_gen.clone());
        let request = DialbackRequest::new("remote.example", "rookery.im", key);
        manager
            .validate_incoming_domain(&first, &request, &verifier)
            .await
            .unwrap();

        let second = incoming_session();
        manager.register_incoming_server(second.clone());
        let key = key_gen.generate(second.stream_id().as_str(), "rookery.im", "remote.example");
        let request = DialbackRequest::new("remote.example", "rookery.im", key);
        let err = manager
            .validate_incoming_domain(&second, &request, &verifier)
            .await;
        assert!(matches!(
            err,
            Err(XmppError::Stream(StreamErrorCondition::ResourceConstraint))
        ));
    }

    fn component_session(subdomain: &str) -> (Arc<MockConnection>, Arc<ComponentSession>) {
        let conn = Arc::new(MockConnection::new());
        let common = SessionCommon::new(StreamId::generate(), "rookery.im", conn.clone());
        (conn, Arc::new(ComponentSession::new(common, subdomain)))
    }

    #[tokio::test]
    async fn test_component_subdomain_conflict() {
        let manager = SessionManager::new(SessionConfig::default());
        let (_, first) = component_session("muc.rookery.im");
        let (second_conn, second) = component_session("muc.rookery.im");

        manager.register_component(first.clone()).await.unwrap();
        let err = manager.register_component(second).await;

        assert!(matches!(err, Err(XmppError::ResourceConflict(_))));
        assert_eq!(second_conn.stream_error(), Some(StreamErrorCondition::Conflict));
        assert!(Arc::ptr_eq(&manager.component("muc.rookery.im").unwrap(), &first));
    }

    #[tokio::test]
    async fn test_closed_component_can_be_replaced() {
        let manager = SessionManager::new(SessionConfig::default());
        let (_, first) = component_session("muc.rookery.im");
        manager.register_component(first.clone()).await.unwrap();
        first.common().close().await;

        let (_, second) = component_session("muc.rookery.im");
        manager.register_component(second.clone()).await.unwrap();
        assert!(Arc::ptr_eq(&manager.component("muc.rookery.im").unwrap(), &second));
    }

    #[tokio::test]
    async fn test_sweeper_start_and_stop() {
        let manager = Arc::new(SessionManager::new(SessionConfig::default()));
        let token = manager.start_detached_sweeper(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(30)).await;
        token.cancel();
    }
}
