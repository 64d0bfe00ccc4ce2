//! External component sessions (XEP-0114).
//!
//! Components authenticate with a SHA-1 handshake over the stream id and a
//! shared secret, then serve one or more subdomains of the server. IQ
//! requests a component sends out are tracked so the matching replies can
//! be steered back to the exact connection that asked.

use dashmap::DashMap;
use jid::Jid;
use sha1::{Digest, Sha1};
use std::collections::HashSet;
use std::fmt;
use std::sync::RwLock;
use tracing::{info, warn};

use crate::error::{StreamErrorCondition, XmppError};
use crate::session::{Session, SessionCommon, SessionStatus};
use crate::stanza::Packet;

/// Compute the XEP-0114 handshake digest: lowercase hex SHA-1 of the
/// stream id concatenated with the shared secret.
pub fn handshake_digest(stream_id: &str, secret: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(stream_id.as_bytes());
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}

/// A session for one external component connection.
pub struct ComponentSession {
    common: SessionCommon,
    primary_subdomain: String,
    subdomains: RwLock<HashSet<String>>,
}

impl ComponentSession {
    /// Wrap an accepted component stream for `primary_subdomain`.
    pub fn new(common: SessionCommon, primary_subdomain: impl Into<String>) -> Self {
        let primary = primary_subdomain.into().to_lowercase();
        let mut subdomains = HashSet::new();
        subdomains.insert(primary.clone());
        Self {
            common,
            primary_subdomain: primary,
            subdomains: RwLock::new(subdomains),
        }
    }

    /// The subdomain the component connected for.
    pub fn primary_subdomain(&self) -> &str {
        &self.primary_subdomain
    }

    /// All subdomains this session serves.
    pub fn subdomains(&self) -> Vec<String> {
        let set = self.subdomains.read().expect("subdomains lock poisoned");
        let mut list: Vec<String> = set.iter().cloned().collect();
        list.sort();
        list
    }

    /// Register an additional subdomain on this session.
    pub fn add_subdomain(&self, subdomain: impl AsRef<str>) {
        self.subdomains
            .write()
            .expect("subdomains lock poisoned")
            .insert(subdomain.as_ref().to_lowercase());
    }

    /// Whether this session serves `domain`.
    pub fn serves(&self, domain: &str) -> bool {
        self.subdomains
            .read()
            .expect("subdomains lock poisoned")
            .contains(&domain.to_lowercase())
    }

    /// Check the component's handshake. A valid digest authenticates the
    /// session and acknowledges with an empty `<handshake/>`; an invalid
    /// one closes the stream with `not-authorized`.
    pub async fn handshake(&self, digest: &str, secret: &str) -> Result<(), XmppError> {
        let expected = handshake_digest(self.common.stream_id().as_str(), secret);
        if digest.eq_ignore_ascii_case(&expected) {
            self.common.set_status(SessionStatus::Authenticated)?;
            self.common.deliver_raw("<handshake/>").await?;
            info!(
                subdomain = %self.primary_subdomain,
                stream = %self.common.stream_id(),
                "component handshake accepted"
            );
            Ok(())
        } else {
            warn!(
                subdomain = %self.primary_subdomain,
                stream = %self.common.stream_id(),
                "component handshake rejected"
            );
            self.common
                .close_with_error(StreamErrorCondition::NotAuthorized)
                .await;
            Err(XmppError::auth_failed("component handshake digest mismatch"))
        }
    }

    /// Deliver a stanza to the component.
    pub async fn deliver(&self, packet: Packet) -> Result<(), XmppError> {
        if self.status() != SessionStatus::Authenticated {
            return Err(XmppError::invalid_state("component not authenticated"));
        }
        self.common.deliver(packet).await
    }
}

impl Session for ComponentSession {
    fn common(&self) -> &SessionCommon {
        &self.common
    }

    fn address(&self) -> Jid {
        self.primary_subdomain
            .parse()
            .unwrap_or_else(|_| {
                self.common
                    .server_name()
                    .parse()
                    .expect("server name is a valid JID")
            })
    }
}

impl fmt::Debug for ComponentSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentSession")
            .field("common", &self.common)
            .field("subdomains", &self.subdomains())
            .finish()
    }
}

/// Correlates IQ requests issued by components with their replies.
///
/// Entries are claimed (removed) on first use so a reply is routed to the
/// issuing connection exactly once.
#[derive(Debug, Default)]
pub struct ComponentIqTracker {
    pending: DashMap<String, String>,
}

impl ComponentIqTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that the component serving `subdomain` issued an IQ with this
    /// id.
    pub fn track(&self, iq_id: impl Into<String>, subdomain: impl Into<String>) {
        self.pending.insert(iq_id.into(), subdomain.into().to_lowercase());
    }

    /// Claim the reply to an IQ, returning the subdomain that issued it.
    pub fn claim(&self, iq_id: &str) -> Option<String> {
        self.pending.remove(iq_id).map(|(_, subdomain)| subdomain)
    }

    /// Number of outstanding requests.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::MockConnection;
    use crate::session::StreamId;
    use std::sync::Arc;

    fn session() -> (Arc<MockConnection>, ComponentSession) {
        let conn = Arc::new(MockConnection::new());
        let common = SessionCommon::new(StreamId::new("c-stream-1"), "rookery.im", conn.clone());
        (conn, ComponentSession::new(common, "muc.rookery.im"))
    }

    #[test]
    fn test_handshake_digest_shape() {
        let digest = handshake_digest("stream-id", "secret");
        assert_eq!(digest.len(), 40);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
        // Deterministic for the same inputs, different otherwise.
        assert_eq!(digest, handshake_digest("stream-id", "secret"));
        assert_ne!(digest, handshake_digest("stream-id", "other"));
        assert_ne!(digest, handshake_digest("other", "secret"));
    }

    #[tokio::test]
    async fn test_valid_handshake_authenticates() {
        let (conn, session) = session();
        let digest = handshake_digest("c-stream-1", "s3cret");

        session.handshake(&digest, "s3cret").await.unwrap();
        assert_eq!(session.status(), SessionStatus::Authenticated);
        assert_eq!(conn.raw_delivered(), vec!["<handshake/>".to_string()]);
    }

    #[tokio::test]
    async fn test_invalid_handshake_closes_not_authorized() {
        let (conn, session) = session();
        let err = session.handshake("deadbeef", "s3cret").await;

        assert!(err.is_err());
        assert_eq!(conn.stream_error(), Some(StreamErrorCondition::NotAuthorized));
        assert_eq!(session.status(), SessionStatus::Closed);
    }

    #[test]
    fn test_subdomains_fold_case() {
        let (_, session) = session();
        session.add_subdomain("Upload.Rookery.IM");
        assert!(session.serves("upload.rookery.im"));
        assert!(session.serves("MUC.rookery.im"));
        assert!(!session.serves("pubsub.rookery.im"));
        assert_eq!(session.subdomains().len(), 2);
    }

    #[test]
    fn test_iq_tracker_claims_once() {
        let tracker = ComponentIqTracker::new();
        tracker.track("iq-42", "muc.rookery.im");
        assert_eq!(tracker.pending_count(), 1);

        assert_eq!(tracker.claim("iq-42"), Some("muc.rookery.im".to_string()));
        assert_eq!(tracker.claim("iq-42"), None);
        assert_eq!(tracker.pending_count(), 0);
    }
}
