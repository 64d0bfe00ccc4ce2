//! Server-to-server sessions.
//!
//! Federation streams are asymmetric. An incoming session accepts stanzas
//! from the remote server for every originating domain it has validated; an
//! outgoing session carries stanzas for the [`DomainPair`]s it has
//! authenticated. One TCP connection never does both directions.

use jid::Jid;
use std::collections::HashSet;
use std::fmt;
use std::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::dialback::{
    build_db_result_response, DialbackRequest, DialbackResult, DomainPair, KeyVerifier,
};
use crate::error::XmppError;
use crate::session::{Session, SessionCommon, SessionStatus};
use crate::stanza::Packet;

/// How a federation stream proved the peer's identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthenticationMethod {
    /// Server dialback (XEP-0220)
    Dialback,
    /// SASL EXTERNAL over a verified certificate
    SaslExternal,
    /// Some other mechanism negotiated by the transport
    Other(String),
}

impl fmt::Display for AuthenticationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dialback => write!(f, "dialback"),
            Self::SaslExternal => write!(f, "sasl-external"),
            Self::Other(name) => write!(f, "{}", name),
        }
    }
}

/// An inbound federation stream.
///
/// The remote server may validate additional originating domains over the
/// same stream at any time; the session stays useful as long as at least
/// one domain remains validated.
pub struct IncomingServerSession {
    common: SessionCommon,
    /// The local domain this stream addressed in its stream header.
    local_domain: String,
    validated_domains: RwLock<HashSet<String>>,
}

impl IncomingServerSession {
    /// Wrap an accepted server-to-server stream.
    pub fn new(common: SessionCommon, local_domain: impl Into<String>) -> Self {
        Self {
            common,
            local_domain: local_domain.into(),
            validated_domains: RwLock::new(HashSet::new()),
        }
    }

    /// The local domain the stream addressed.
    pub fn local_domain(&self) -> &str {
        &self.local_domain
    }

    /// Domains this session may send stanzas for.
    pub fn validated_domains(&self) -> Vec<String> {
        let domains = self.validated_domains.read().expect("domains lock poisoned");
        let mut list: Vec<String> = domains.iter().cloned().collect();
        list.sort();
        list
    }

    /// Whether `domain` has been validated on this stream.
    pub fn is_validated(&self, domain: &str) -> bool {
        self.validated_domains
            .read()
            .expect("domains lock poisoned")
            .contains(&domain.to_lowercase())
    }

    /// Record a validated originating domain. The first validation also
    /// advances the session to `Authenticated`.
    pub fn add_validated_domain(&self, domain: impl AsRef<str>) -> Result<(), XmppError> {
        let domain = domain.as_ref().to_lowercase();
        self.validated_domains
            .write()
            .expect("domains lock poisoned")
            .insert(domain.clone());
        self.common.set_status(SessionStatus::Authenticated)?;
        info!(domain = %domain, stream = %self.common.stream_id(), "validated originating domain");
        Ok(())
    }

    /// Drop a validated domain. Returns `true` when no validated domains
    /// remain, in which case the caller should close the session.
    pub fn remove_validated_domain(&self, domain: &str) -> bool {
        let mut domains = self.validated_domains.write().expect("domains lock poisoned");
        domains.remove(&domain.to_lowercase());
        domains.is_empty()
    }

    /// Handle a `db:result` arriving on an already-established stream: the
    /// remote server wants to validate one more originating domain without
    /// opening a new connection.
    ///
    /// The typed answer goes back over this stream either way; only a valid
    /// key extends the validated set.
    pub async fn validate_subsequent_domain(
        &self,
        request: &DialbackRequest,
        verifier: &dyn KeyVerifier,
    ) -> Result<DialbackResult, XmppError> {
        let result = verifier
            .verify_key(
                &request.key,
                self.common.stream_id().as_str(),
                &request.to,
                &request.from,
            )
            .await
            .map_err(|e| XmppError::auth_failed(e.to_string()))?;

        match result {
            DialbackResult::Valid => {
                self.add_validated_domain(&request.from)?;
                self.common
                    .deliver_raw(&build_db_result_response(&request.to, &request.from, result))
                    .await?;
            }
            DialbackResult::Invalid => {
                warn!(
                    domain = %request.from,
                    stream = %self.common.stream_id(),
                    "subsequent dialback validation failed, closing stream"
                );
                // The typed answer still goes out, then the stream ends; a
                // peer presenting bad keys gets no further chances here.
                self.common
                    .deliver_raw(&build_db_result_response(&request.to, &request.from, result))
                    .await?;
                self.common.close().await;
            }
        }
        Ok(result)
    }

    /// Accept one stanza from the remote server. The sender's domain must
    /// be validated on this stream.
    pub fn accept_from(&self, packet: &Packet) -> Result<(), XmppError> {
        let from_domain = packet
            .from()
            .map(|j| j.domain().to_string())
            .ok_or_else(|| XmppError::malformed("server stanza without a from address"))?;
        if !self.is_validated(&from_domain) {
            return Err(XmppError::auth_failed(format!(
                "domain {} not validated on this stream",
                from_domain
            )));
        }
        self.common.record_incoming();
        Ok(())
    }
}

impl Session for IncomingServerSession {
    fn common(&self) -> &SessionCommon {
        &self.common
    }

    fn address(&self) -> Jid {
        // Best effort: the first validated domain, else the local domain.
        let domains = self.validated_domains.read().expect("domains lock poisoned");
        let name = domains
            .iter()
            .next()
            .cloned()
            .unwrap_or_else(|| self.local_domain.clone());
        drop(domains);
        name.parse()
            .unwrap_or_else(|_| self.local_domain.parse().expect("local domain is a valid JID"))
    }
}

impl fmt::Debug for IncomingServerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IncomingServerSession")
            .field("common", &self.common)
            .field("local_domain", &self.local_domain)
            .field("validated_domains", &self.validated_domains())
            .finish()
    }
}

/// An outbound federation stream.
pub struct OutgoingServerSession {
    common: SessionCommon,
    authenticated_pairs: RwLock<HashSet<DomainPair>>,
    method: Mutex<Option<AuthenticationMethod>>,
}

impl OutgoingServerSession {
    /// Wrap a dialed server-to-server stream.
    pub fn new(common: SessionCommon) -> Self {
        Self {
            common,
            authenticated_pairs: RwLock::new(HashSet::new()),
            method: Mutex::new(None),
        }
    }

    /// Record a successfully authenticated pair. The first one advances the
    /// session to `Authenticated` and pins the method used.
    pub fn add_authenticated_pair(
        &self,
        pair: DomainPair,
        method: AuthenticationMethod,
    ) -> Result<(), XmppError> {
        debug!(pair = %pair, method = %method, "authenticated outgoing domain pair");
        self.authenticated_pairs
            .write()
            .expect("pairs lock poisoned")
            .insert(pair);
        let mut slot = self.method.lock().expect("method lock poisoned");
        if slot.is_none() {
            *slot = Some(method);
        }
        drop(slot);
        self.common.set_status(SessionStatus::Authenticated)
    }

    /// Whether this stream may carry stanzas for `pair`.
    pub fn is_authenticated_for(&self, pair: &DomainPair) -> bool {
        self.authenticated_pairs
            .read()
            .expect("pairs lock poisoned")
            .contains(pair)
    }

    /// Every pair authenticated on this stream.
    pub fn authenticated_pairs(&self) -> Vec<DomainPair> {
        self.authenticated_pairs
            .read()
            .expect("pairs lock poisoned")
            .iter()
            .cloned()
            .collect()
    }

    /// How the stream was authenticated, once it has been.
    pub fn authentication_method(&self) -> Option<AuthenticationMethod> {
        self.method.lock().expect("method lock poisoned").clone()
    }

    /// Send a stanza to the remote server.
    pub async fn deliver(&self, packet: Packet) -> Result<(), XmppError> {
        if self.status() != SessionStatus::Authenticated {
            return Err(XmppError::invalid_state(
                "outgoing server session not authenticated",
            ));
        }
        self.common.deliver(packet).await
    }
}

impl Session for OutgoingServerSession {
    fn common(&self) -> &SessionCommon {
        &self.common
    }

    fn address(&self) -> Jid {
        let pairs = self.authenticated_pairs.read().expect("pairs lock poisoned");
        let name = pairs
            .iter()
            .next()
            .map(|p| p.remote().to_string())
            .unwrap_or_else(|| self.common.server_name().to_string());
        drop(pairs);
        name.parse()
            .unwrap_or_else(|_| {
                self.common
                    .server_name()
                    .parse()
                    .expect("server name is a valid JID")
            })
    }
}

impl fmt::Debug for OutgoingServerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutgoingServerSession")
            .field("common", &self.common)
            .field("pairs", &self.authenticated_pairs())
            .field("method", &self.authentication_method())
            .finish()
    }
}
