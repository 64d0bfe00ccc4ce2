//! Outbound federation: establishing authenticated server-to-server streams.
//!
//! A stanza for a remote domain needs an outgoing stream authenticated for
//! its exact [`DomainPair`]. The manager first reuses what exists: a stream
//! already authenticated for the pair, or a stream to the same remote host
//! that can be extended with one more pair through dialback. Only then does
//! it dial, walking the strategy ladder from the strongest the configuration
//! allows down to plaintext dialback.
//!
//! Establishment for one pair is single-flight. Concurrent callers for the
//! same pair share one attempt through a per-pair async mutex with a
//! double-check after acquisition.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::config::FederationConfig;
use crate::dialback::DomainPair;
use crate::routing::local::LocalRoutingTable;
use crate::session::manager::SessionManager;
use crate::session::server::{AuthenticationMethod, OutgoingServerSession};
use crate::session::Session;

/// Errors from establishing an outgoing federation stream.
#[derive(Debug, Error)]
pub enum FederationError {
    /// The remote domain is on the federation blacklist.
    #[error("federation with {0} is blacklisted")]
    Blacklisted(String),
    /// No transport could be established.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    /// A stream came up but the peer rejected authentication.
    #[error("authentication rejected: {0}")]
    AuthenticationRejected(String),
    /// Every permitted strategy was tried and failed.
    #[error("could not establish an authenticated stream for {pair}")]
    Exhausted {
        /// The pair that could not be established
        pair: DomainPair,
    },
}

/// One way of bringing up and authenticating an outgoing stream, strongest
/// first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FederationStrategy {
    /// TLS from the first byte, SASL EXTERNAL against the peer certificate.
    DirectTlsSaslExternal,
    /// STARTTLS upgrade, then SASL EXTERNAL.
    StartTlsSaslExternal,
    /// STARTTLS upgrade, then server dialback.
    StartTlsDialback,
    /// Dialback over an unencrypted stream.
    PlaintextDialback,
}

impl FederationStrategy {
    /// Whether the strategy ends on an encrypted stream.
    pub fn is_encrypted(&self) -> bool {
        !matches!(self, Self::PlaintextDialback)
    }
}

/// A freshly negotiated outgoing stream, not yet registered anywhere.
pub struct NegotiatedOutgoing {
    /// The authenticated-capable session over the new stream
    pub session: Arc<OutgoingServerSession>,
    /// How the peer accepted us
    pub method: AuthenticationMethod,
}

/// Transport seam: dials remote servers and runs stream negotiation.
#[async_trait]
pub trait S2sConnector: Send + Sync {
    /// Dial `pair.remote()` on `port` and negotiate a stream using
    /// `strategy`. The returned session is connected but carries no
    /// authenticated pairs yet.
    async fn connect(
        &self,
        pair: &DomainPair,
        port: u16,
        strategy: FederationStrategy,
    ) -> Result<NegotiatedOutgoing, FederationError>;

    /// Authenticate one more pair over an already-established stream to the
    /// same remote server, using dialback piggybacked on that stream.
    async fn extend(
        &self,
        session: &OutgoingServerSession,
        pair: &DomainPair,
    ) -> Result<AuthenticationMethod, FederationError>;
}

/// Produces an authenticated outgoing session for a domain pair.
#[async_trait]
pub trait DomainAuthenticator: Send + Sync {
    /// Return a session authenticated for `pair`, reusing or establishing
    /// one as needed.
    async fn authenticate_domain(
        &self,
        pair: &DomainPair,
    ) -> Result<Arc<OutgoingServerSession>, FederationError>;
}

/// Establishes and reuses outgoing federation streams.
pub struct FederationManager {
    config: FederationConfig,
    connector: Arc<dyn S2sConnector>,
    local_routes: Arc<LocalRoutingTable>,
    sessions: Option<Arc<SessionManager>>,
    establishing: DashMap<DomainPair, Arc<Mutex<()>>>,
}

impl FederationManager {
    /// Create a manager registering established streams in `local_routes`.
    pub fn new(
        config: FederationConfig,
        connector: Arc<dyn S2sConnector>,
        local_routes: Arc<LocalRoutingTable>,
    ) -> Self {
        Self {
            config,
            connector,
            local_routes,
            sessions: None,
            establishing: DashMap::new(),
        }
    }

    /// Consult the session manager's incoming-session index when searching
    /// for reusable streams.
    pub fn with_session_manager(mut self, sessions: Arc<SessionManager>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    /// The federation configuration in effect.
    pub fn config(&self) -> &FederationConfig {
        &self.config
    }

    fn established(&self, pair: &DomainPair) -> Option<Arc<OutgoingServerSession>> {
        self.local_routes
            .server(pair)
            .filter(|s| s.is_authenticated_for(pair) && !s.common().is_closed())
    }

    fn strategies(&self) -> Vec<FederationStrategy> {
        let mut ladder = Vec::new();
        if self.config.sasl_external_enabled {
            ladder.push(FederationStrategy::DirectTlsSaslExternal);
            ladder.push(FederationStrategy::StartTlsSaslExternal);
        }
        if self.config.dialback_enabled {
            ladder.push(FederationStrategy::StartTlsDialback);
            if !self.config.require_tls {
                ladder.push(FederationStrategy::PlaintextDialback);
            }
        }
        ladder
    }

    /// Authenticate `pair` over an existing stream. Only dialback streams
    /// take extra pairs; a SASL EXTERNAL stream proves exactly one identity.
    async fn extend_onto(
        &self,
        existing: &DomainPair,
        session: Arc<OutgoingServerSession>,
        pair: &DomainPair,
    ) -> Option<Arc<OutgoingServerSession>> {
        if session.common().is_closed() {
            return None;
        }
        if session.authentication_method() != Some(AuthenticationMethod::Dialback) {
            debug!(pair = %pair, reused = %existing, "stream not dialback-authenticated, skipping");
            return None;
        }
        match self.connector.extend(&session, pair).await {
            Ok(method) => {
                if session.add_authenticated_pair(pair.clone(), method).is_err() {
                    return None;
                }
                self.local_routes.add_server(pair.clone(), session.clone());
                info!(pair = %pair, reused = %existing, "extended existing outgoing stream");
                Some(session)
            }
            Err(e) => {
                debug!(pair = %pair, reused = %existing, error = %e, "stream extension refused");
                None
            }
        }
    }

    /// Extend an existing stream with one more pair, dialback permitting.
    async fn try_reuse(&self, pair: &DomainPair) -> Option<Arc<OutgoingServerSession>> {
        if !self.config.dialback_enabled {
            return None;
        }
        // Streams already carrying stanzas to the wanted remote domain.
        for (existing, session) in self.local_routes.server_routes() {
            if existing.remote() != pair.remote() {
                continue;
            }
            if let Some(session) = self.extend_onto(&existing, session, pair).await {
                return Some(session);
            }
        }
        // The peer may already be connected inbound under another name. An
        // incoming session that validated the wanted remote domain alongside
        // a sibling domain ties both names to one peer, so an outgoing
        // dialback stream to the sibling can take this pair as well.
        let sessions = self.sessions.as_ref()?;
        for incoming in sessions.incoming_sessions_for_domain(pair.remote()) {
            for sibling in incoming.validated_domains() {
                if sibling == pair.remote() {
                    continue;
                }
                for (existing, session) in self.local_routes.server_routes() {
                    if existing.remote() != sibling.as_str() {
                        continue;
                    }
                    if let Some(session) = self.extend_onto(&existing, session, pair).await {
                        return Some(session);
                    }
                }
            }
        }
        None
    }

    async fn dial(&self, pair: &DomainPair) -> Result<Arc<OutgoingServerSession>, FederationError> {
        let ladder = self.strategies();
        if ladder.is_empty() {
            return Err(FederationError::ConnectionFailed(
                "no federation strategy permitted by configuration".into(),
            ));
        }
        for strategy in ladder {
            match self
                .connector
                .connect(pair, self.config.remote_port, strategy)
                .await
            {
                Ok(negotiated) => {
                    negotiated
                        .session
                        .add_authenticated_pair(pair.clone(), negotiated.method.clone())
                        .map_err(|e| FederationError::AuthenticationRejected(e.to_string()))?;
                    self.local_routes
                        .add_server(pair.clone(), negotiated.session.clone());
                    info!(pair = %pair, strategy = ?strategy, "outgoing stream established");
                    return Ok(negotiated.session);
                }
                Err(e) => {
                    debug!(pair = %pair, strategy = ?strategy, error = %e, "strategy failed");
                }
            }
        }
        warn!(pair = %pair, "every permitted federation strategy failed");
        Err(FederationError::Exhausted { pair: pair.clone() })
    }
}

#[async_trait]
impl DomainAuthenticator for FederationManager {
    #[instrument(name = "authenticate_domain", skip(self), fields(pair = %pair))]
    async fn authenticate_domain(
        &self,
        pair: &DomainPair,
    ) -> Result<Arc<OutgoingServerSession>, FederationError> {
        let remote = pair.remote();
        if remote.is_empty() || remote.contains(char::is_whitespace) {
            return Err(FederationError::ConnectionFailed(format!(
                "not a routable domain: {:?}",
                remote
            )));
        }
        if self.config.is_blacklisted(remote) {
            return Err(FederationError::Blacklisted(remote.to_string()));
        }

        if let Some(session) = self.established(pair) {
            return Ok(session);
        }

        let gate = self
            .establishing
            .entry(pair.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = gate.lock().await;

        // A concurrent caller may have finished while we waited.
        if let Some(session) = self.established(pair) {
            return Ok(session);
        }

        if let Some(session) = self.try_reuse(pair).await {
            return Ok(session);
        }

        let result = self.dial(pair).await;
        drop(_guard);
        self.establishing.remove(pair);
        result
    }
}
