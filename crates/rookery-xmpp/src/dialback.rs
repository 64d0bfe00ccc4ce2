//! Server Dialback (XEP-0220) primitives.
//!
//! Dialback authenticates server-to-server streams with a challenge the
//! remote server must echo back over a connection to the authoritative
//! server for its domain:
//!
//! 1. Originating Server sends `db:result` with a dialback key
//! 2. Receiving Server connects to the Authoritative Server and sends `db:verify`
//! 3. Authoritative Server answers valid/invalid
//! 4. Receiving Server reports the outcome back in a typed `db:result`
//!
//! Keys are HMAC-SHA256 over `stream_id || receiving_domain ||
//! originating_domain`, hex-encoded (XEP-0220 Section 2.4).

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use thiserror::Error;

pub use crate::stanza::ns::{DIALBACK as NS_DIALBACK, DIALBACK_FEATURES as NS_DIALBACK_FEATURES};

type HmacSha256 = Hmac<Sha256>;

/// A directed federation pair: packets from `local` addressed to `remote`.
///
/// Federation is authenticated per direction and per domain pair, so the
/// pair (not the remote domain alone) keys outgoing routes and caches.
/// Domains are case-folded on construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DomainPair {
    local: String,
    remote: String,
}

impl DomainPair {
    /// Create a pair, folding both domains to lowercase.
    pub fn new(local: impl AsRef<str>, remote: impl AsRef<str>) -> Self {
        Self {
            local: local.as_ref().to_lowercase(),
            remote: remote.as_ref().to_lowercase(),
        }
    }

    /// The local (sending) domain.
    pub fn local(&self) -> &str {
        &self.local
    }

    /// The remote (receiving) domain.
    pub fn remote(&self) -> &str {
        &self.remote
    }
}

impl fmt::Display for DomainPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.local, self.remote)
    }
}

/// State of a dialback negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DialbackState {
    /// Dialback not yet initiated.
    #[default]
    None,
    /// `db:result` sent, waiting for the typed response.
    Pending,
    /// Verification succeeded.
    Verified,
    /// Verification failed.
    Failed,
}

impl fmt::Display for DialbackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Pending => write!(f, "pending"),
            Self::Verified => write!(f, "verified"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Outcome carried in the `type` attribute of dialback responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialbackResult {
    /// Verification successful.
    Valid,
    /// Verification failed.
    Invalid,
}

impl DialbackResult {
    /// The XEP-0220 type attribute value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Valid => "valid",
            Self::Invalid => "invalid",
        }
    }

    /// Parse from the XEP-0220 type attribute value.
    pub fn from_attr(s: &str) -> Option<Self> {
        match s {
            "valid" => Some(Self::Valid),
            "invalid" => Some(Self::Invalid),
            _ => None,
        }
    }
}

/// Errors raised while verifying dialback requests.
#[derive(Debug, Error)]
pub enum DialbackError {
    /// The authoritative server could not be reached.
    #[error("authoritative server for {0} unreachable")]
    AuthoritativeUnreachable(String),
    /// The request was missing a required attribute.
    #[error("malformed dialback element: {0}")]
    Malformed(String),
}

/// Dialback key generator.
///
/// The secret must stay stable for the server's lifetime so keys issued on
/// one stream can be verified on another.
#[derive(Clone)]
pub struct DialbackKey {
    secret: Vec<u8>,
}

impl DialbackKey {
    /// Create a generator with the given secret.
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
        }
    }

    /// Create a generator with a random secret.
    #[cfg(any(test, feature = "test-utils"))]
    pub fn random() -> Self {
        use rand::RngCore;
        let mut secret = [0u8; 32];
        rand::rng().fill_bytes(&mut secret);
        Self::new(secret)
    }

    /// Generate the hex-encoded key for one stream and domain pair.
    pub fn generate(
        &self,
        stream_id: &str,
        receiving_domain: &str,
        originating_domain: &str,
    ) -> String {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("HMAC accepts any key length");
        mac.update(stream_id.as_bytes());
        mac.update(receiving_domain.as_bytes());
        mac.update(originating_domain.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Verify a key in constant time.
    pub fn verify(
        &self,
        key: &str,
        stream_id: &str,
        receiving_domain: &str,
        originating_domain: &str,
    ) -> bool {
        let expected = self.generate(stream_id, receiving_domain, originating_domain);
        constant_time_eq(key.as_bytes(), expected.as_bytes())
    }
}

impl fmt::Debug for DialbackKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DialbackKey").field("secret", &"[redacted]").finish()
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

/// Checks a dialback key against the authoritative server for a domain.
///
/// The bundled [`LocalKeyVerifier`] recomputes the HMAC locally, which
/// covers the case where this server issued the key. Deployments wire a
/// verifier that performs the `db:verify` callback over a real connection.
#[async_trait]
pub trait KeyVerifier: Send + Sync {
    /// Verify `key` for the stream `stream_id` between the given domains.
    async fn verify_key(
        &self,
        key: &str,
        stream_id: &str,
        receiving_domain: &str,
        originating_domain: &str,
    ) -> Result<DialbackResult, DialbackError>;
}

/// Verifies keys against a local [`DialbackKey`] secret.
#[derive(Debug, Clone)]
pub struct LocalKeyVerifier {
    key: DialbackKey,
}

impl LocalKeyVerifier {
    /// Wrap a key generator.
    pub fn new(key: DialbackKey) -> Self {
        Self { key }
    }
}

#[async_trait]
impl KeyVerifier for LocalKeyVerifier {
    async fn verify_key(
        &self,
        key: &str,
        stream_id: &str,
        receiving_domain: &str,
        originating_domain: &str,
    ) -> Result<DialbackResult, DialbackError> {
        if self.key.verify(key, stream_id, receiving_domain, originating_domain) {
            Ok(DialbackResult::Valid)
        } else {
            Ok(DialbackResult::Invalid)
        }
    }
}

/// A parsed `db:result` request.
#[derive(Debug, Clone)]
pub struct DialbackRequest {
    /// Originating domain (`from` attribute)
    pub from: String,
    /// Receiving domain (`to` attribute)
    pub to: String,
    /// The dialback key
    pub key: String,
}

impl DialbackRequest {
    /// Create a request.
    pub fn new(from: impl Into<String>, to: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            key: key.into(),
        }
    }
}

/// A parsed `db:verify` request.
#[derive(Debug, Clone)]
pub struct DialbackVerify {
    /// Originating domain (`from` attribute)
    pub from: String,
    /// Receiving domain (`to` attribute)
    pub to: String,
    /// Stream ID being verified
    pub id: String,
    /// The dialback key to check
    pub key: String,
}

/// Build a `db:result` for initiating dialback.
pub fn build_db_result(from: &str, to: &str, key: &str) -> String {
    format!(
        "<db:result xmlns:db='{}' from='{}' to='{}'>{}</db:result>",
        NS_DIALBACK, from, to, key
    )
}

/// Build the typed `db:result` response sent after verification.
pub fn build_db_result_response(from: &str, to: &str, result: DialbackResult) -> String {
    format!(
        "<db:result xmlns:db='{}' from='{}' to='{}' type='{}'/>",
        NS_DIALBACK,
        from,
        to,
        result.as_str()
    )
}

/// Build a `db:verify` for the authoritative server.
pub fn build_db_verify(from: &str, to: &str, id: &str, key: &str) -> String {
    format!(
        "<db:verify xmlns:db='{}' from='{}' to='{}' id='{}'>{}</db:verify>",
        NS_DIALBACK, from, to, id, key
    )
}

/// Build the typed `db:verify` response.
pub fn build_db_verify_response(from: &str, to: &str, id: &str, result: DialbackResult) -> String {
    format!(
        "<db:verify xmlns:db='{}' from='{}' to='{}' id='{}' type='{}'/>",
        NS_DIALBACK,
        from,
        to,
        id,
        result.as_str()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_pair_folds_case() {
        let a = DomainPair::new("Rookery.IM", "Remote.Example");
        let b = DomainPair::new("rookery.im", "remote.example");
        assert_eq!(a, b);

        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};
        let hash = |p: &DomainPair| {
            let mut h = DefaultHasher::new();
            p.hash(&mut h);
            h.finish()
        };
        assert_eq!(hash(&a), hash(&b));
    }

    #[test]
    fn test_domain_pair_is_directional() {
        let forward = DomainPair::new("rookery.im", "remote.example");
        let reverse = DomainPair::new("remote.example", "rookery.im");
        assert_ne!(forward, reverse);
        assert_eq!(forward.local(), "rookery.im");
        assert_eq!(forward.remote(), "remote.example");
    }

    #[test]
    fn test_key_generation_is_deterministic() {
        let key_gen = DialbackKey::new(b"test-secret-key");

        let key1 = key_gen.generate("stream-1", "receiving.example", "originating.example");
        let key2 = key_gen.generate("stream-1", "receiving.example", "originating.example");
        assert_eq!(key1, key2);

        let key3 = key_gen.generate("stream-2", "receiving.example", "originating.example");
        assert_ne!(key1, key3);

        let key4 = key_gen.generate("stream-1", "other.example", "originating.example");
        assert_ne!(key1, key4);
    }

    #[test]
    fn test_key_verification() {
        let key_gen = DialbackKey::new(b"verification-secret");
        let key = key_gen.generate("stream-123", "rookery.im", "remote.example");

        assert!(key_gen.verify(&key, "stream-123", "rookery.im", "remote.example"));
        assert!(!key_gen.verify(&key, "wrong-stream", "rookery.im", "remote.example"));
        assert!(!key_gen.verify(&key, "stream-123", "wrong.domain", "remote.example"));
        assert!(!key_gen.verify(&key, "stream-123", "rookery.im", "wrong.domain"));

        let mut tampered = key.clone();
        if let Some(last) = tampered.pop() {
            tampered.push(if last == 'a' { 'b' } else { 'a' });
        }
        assert!(!key_gen.verify(&tampered, "stream-123", "rookery.im", "remote.example"));
    }

    #[test]
    fn test_key_is_hex_sha256() {
        let key = DialbackKey::new(b"hex").generate("s", "to.example", "from.example");
        assert_eq!(key.len(), 64);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn test_local_verifier() {
        let key_gen = DialbackKey::random();
        let key = key_gen.generate("sid", "rookery.im", "remote.example");
        let verifier = LocalKeyVerifier::new(key_gen);

        let ok = verifier
            .verify_key(&key, "sid", "rookery.im", "remote.example")
            .await
            .unwrap();
        assert_eq!(ok, DialbackResult::Valid);

        let bad = verifier
            .verify_key("feedface", "sid", "rookery.im", "remote.example")
            .await
            .unwrap();
        assert_eq!(bad, DialbackResult::Invalid);
    }

    #[test]
    fn test_wire_builders() {
        let xml = build_db_result("origin.example", "recv.example", "abc123");
        assert!(xml.contains("db:result"));
        assert!(xml.contains("from='origin.example'"));
        assert!(xml.contains("abc123"));

        let xml = build_db_result_response("recv.example", "origin.example", DialbackResult::Valid);
        assert!(xml.contains("type='valid'"));

        let xml = build_db_verify("recv.example", "origin.example", "stream-9", "key456");
        assert!(xml.contains("db:verify"));
        assert!(xml.contains("id='stream-9'"));
        assert!(xml.contains("key456"));

        let xml =
            build_db_verify_response("origin.example", "recv.example", "stream-9", DialbackResult::Invalid);
        assert!(xml.contains("type='invalid'"));
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"hello", b"hello"));
        assert!(!constant_time_eq(b"hello", b"world"));
        assert!(!constant_time_eq(b"hello", b"hell"));
        assert!(constant_time_eq(b"", b""));
    }
}
