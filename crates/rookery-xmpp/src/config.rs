//! Configuration for connections, sessions, routing and federation.
//!
//! All configuration is plain owned state passed to the component that needs
//! it. There are no process-global settings.

use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

use crate::error::XmppError;

/// Default server-to-server port.
pub const DEFAULT_S2S_PORT: u16 = 5269;

/// Default resumption window for detached client sessions.
pub const DEFAULT_DETACH_WINDOW: Duration = Duration::from_secs(300);

/// How a connection type treats TLS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsPolicy {
    /// TLS negotiation is rejected.
    Disabled,
    /// TLS is offered but not required.
    Optional,
    /// Stanzas are not accepted until the stream is encrypted.
    Required,
}

impl fmt::Display for TlsPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disabled => write!(f, "disabled"),
            Self::Optional => write!(f, "optional"),
            Self::Required => write!(f, "required"),
        }
    }
}

/// How a connection type treats stream compression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionPolicy {
    /// Compression is never offered.
    Disabled,
    /// Compression is offered once the stream may carry it.
    Optional,
}

/// An XMPP stream version as carried in the stream header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct StreamVersion {
    /// Major version
    pub major: u8,
    /// Minor version
    pub minor: u8,
}

impl StreamVersion {
    /// The highest version this implementation speaks.
    pub const SUPPORTED: StreamVersion = StreamVersion { major: 1, minor: 0 };

    /// Pre-RFC-3920 legacy streams announce no version at all.
    pub const LEGACY: StreamVersion = StreamVersion { major: 0, minor: 0 };

    /// Parse a `version` attribute value.
    pub fn parse(s: &str) -> Result<Self, XmppError> {
        let (major, minor) = s
            .split_once('.')
            .ok_or_else(|| XmppError::malformed(format!("bad stream version: {}", s)))?;
        let major = major
            .parse()
            .map_err(|_| XmppError::malformed(format!("bad stream version: {}", s)))?;
        let minor = minor
            .parse()
            .map_err(|_| XmppError::malformed(format!("bad stream version: {}", s)))?;
        Ok(Self { major, minor })
    }

    /// Negotiate the session version: the lower of the peer's announced
    /// version and ours. A missing version attribute means a legacy 0.0
    /// stream.
    pub fn negotiate(peer: Option<StreamVersion>) -> StreamVersion {
        match peer {
            Some(v) => v.min(Self::SUPPORTED),
            None => Self::LEGACY,
        }
    }

    /// Legacy streams skip feature negotiation entirely.
    pub fn is_legacy(&self) -> bool {
        *self == Self::LEGACY
    }
}

impl fmt::Display for StreamVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// A single allow/deny pattern: an exact address or a trailing-wildcard
/// prefix such as `192.168.1.*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpPattern {
    /// Matches one address exactly.
    Exact(IpAddr),
    /// Matches any address whose text form starts with the prefix.
    Wildcard(String),
}

impl IpPattern {
    /// Parse a pattern from its configuration form.
    pub fn parse(s: &str) -> Result<Self, XmppError> {
        let s = s.trim();
        if let Some(prefix) = s.strip_suffix('*') {
            if prefix.is_empty() {
                return Err(XmppError::config("IP pattern must not be a bare wildcard"));
            }
            return Ok(Self::Wildcard(prefix.to_string()));
        }
        s.parse::<IpAddr>()
            .map(Self::Exact)
            .map_err(|_| XmppError::config(format!("bad IP pattern: {}", s)))
    }

    /// Whether the pattern matches the given address.
    pub fn matches(&self, addr: IpAddr) -> bool {
        match self {
            Self::Exact(a) => *a == addr,
            Self::Wildcard(prefix) => addr.to_string().starts_with(prefix.as_str()),
        }
    }
}

/// Source-address filtering for inbound connections.
///
/// Deny entries always win. An empty allow list admits everything not
/// denied; a non-empty allow list admits only what it matches.
#[derive(Debug, Clone, Default)]
pub struct IpAccessPolicy {
    allow: Vec<IpPattern>,
    deny: Vec<IpPattern>,
}

impl IpAccessPolicy {
    /// Build a policy from pattern strings.
    pub fn new(allow: &[&str], deny: &[&str]) -> Result<Self, XmppError> {
        Ok(Self {
            allow: allow.iter().map(|s| IpPattern::parse(s)).collect::<Result<_, _>>()?,
            deny: deny.iter().map(|s| IpPattern::parse(s)).collect::<Result<_, _>>()?,
        })
    }

    /// Whether a connection from this address may proceed.
    pub fn permits(&self, addr: IpAddr) -> bool {
        if self.deny.iter().any(|p| p.matches(addr)) {
            return false;
        }
        self.allow.is_empty() || self.allow.iter().any(|p| p.matches(addr))
    }
}

/// Per-connection-type configuration applied by the session factory.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// TLS policy for the connection type
    pub tls_policy: TlsPolicy,
    /// Compression policy for the connection type
    pub compression_policy: CompressionPolicy,
    /// Source-address filtering
    pub ip_policy: IpAccessPolicy,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            tls_policy: TlsPolicy::Optional,
            compression_policy: CompressionPolicy::Disabled,
            ip_policy: IpAccessPolicy::default(),
        }
    }
}

impl ConnectionConfig {
    /// Set the TLS policy.
    pub fn with_tls_policy(mut self, policy: TlsPolicy) -> Self {
        self.tls_policy = policy;
        self
    }

    /// Set the compression policy.
    pub fn with_compression_policy(mut self, policy: CompressionPolicy) -> Self {
        self.compression_policy = policy;
        self
    }

    /// Set the IP access policy.
    pub fn with_ip_policy(mut self, policy: IpAccessPolicy) -> Self {
        self.ip_policy = policy;
        self
    }
}

/// Resource-conflict handling when a full JID binds twice.
///
/// `0` kicks the older session immediately, `-1` always rejects the new
/// binding, `n > 0` kicks once the older session has been challenged more
/// than `n` times.
pub type ConflictLimit = i32;

/// Session-manager configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Resource-conflict policy
    pub conflict_limit: ConflictLimit,
    /// How long a detached session stays resumable
    pub detach_window: Duration,
    /// Cap on concurrent incoming server sessions per remote domain
    /// (`None` means unlimited)
    pub max_incoming_per_domain: Option<usize>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            conflict_limit: 0,
            detach_window: DEFAULT_DETACH_WINDOW,
            max_incoming_per_domain: None,
        }
    }
}

impl SessionConfig {
    /// Set the conflict limit.
    pub fn with_conflict_limit(mut self, limit: ConflictLimit) -> Self {
        self.conflict_limit = limit;
        self
    }

    /// Set the detached-session resumption window.
    pub fn with_detach_window(mut self, window: Duration) -> Self {
        self.detach_window = window;
        self
    }

    /// Cap incoming server sessions per remote domain.
    pub fn with_max_incoming_per_domain(mut self, max: usize) -> Self {
        self.max_incoming_per_domain = Some(max);
        self
    }
}

/// Routing-table behavior switches.
#[derive(Debug, Clone, Default)]
pub struct RoutingConfig {
    /// Deliver bare-JID messages to every highest-priority resource
    pub route_all_resources: bool,
    /// Deliver bare-JID messages to every non-negative-priority resource
    pub route_really_all_resources: bool,
    /// Let anonymous users send to remote domains
    pub allow_anonymous_outbound: bool,
}

impl RoutingConfig {
    /// Route bare-JID messages to all highest-priority resources.
    pub fn with_route_all_resources(mut self, enabled: bool) -> Self {
        self.route_all_resources = enabled;
        self
    }

    /// Route bare-JID messages to every non-negative resource.
    pub fn with_route_really_all_resources(mut self, enabled: bool) -> Self {
        self.route_really_all_resources = enabled;
        self
    }

    /// Permit anonymous users to reach remote domains.
    pub fn with_allow_anonymous_outbound(mut self, enabled: bool) -> Self {
        self.allow_anonymous_outbound = enabled;
        self
    }
}

/// Server-to-server federation policy.
#[derive(Debug, Clone)]
pub struct FederationConfig {
    /// Remote domains federation must never be attempted with (lowercase)
    blacklist: Vec<String>,
    /// Port used when dialing remote servers
    pub remote_port: u16,
    /// Refuse to federate over unencrypted streams
    pub require_tls: bool,
    /// Offer/accept server dialback
    pub dialback_enabled: bool,
    /// Offer/attempt SASL EXTERNAL when certificates allow it
    pub sasl_external_enabled: bool,
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            blacklist: Vec::new(),
            remote_port: DEFAULT_S2S_PORT,
            require_tls: false,
            dialback_enabled: true,
            sasl_external_enabled: true,
        }
    }
}

impl FederationConfig {
    /// Add domains to the federation blacklist.
    pub fn with_blacklist<I, S>(mut self, domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.blacklist
            .extend(domains.into_iter().map(|d| d.as_ref().to_lowercase()));
        self
    }

    /// Require TLS on every federation stream.
    pub fn with_require_tls(mut self, required: bool) -> Self {
        self.require_tls = required;
        self
    }

    /// Whether federation with this domain is forbidden outright.
    pub fn is_blacklisted(&self, domain: &str) -> bool {
        let domain = domain.to_lowercase();
        self.blacklist.iter().any(|d| *d == domain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_parse_and_negotiate() {
        assert_eq!(
            StreamVersion::parse("1.0").unwrap(),
            StreamVersion { major: 1, minor: 0 }
        );
        assert!(StreamVersion::parse("banana").is_err());

        // Peer newer than us: settle on ours.
        let peer = StreamVersion { major: 2, minor: 1 };
        assert_eq!(StreamVersion::negotiate(Some(peer)), StreamVersion::SUPPORTED);

        // Peer older than us: settle on theirs.
        let peer = StreamVersion { major: 0, minor: 9 };
        assert_eq!(StreamVersion::negotiate(Some(peer)), peer);

        // No version attribute: legacy stream.
        assert_eq!(StreamVersion::negotiate(None), StreamVersion::LEGACY);
        assert!(StreamVersion::negotiate(None).is_legacy());
    }

    #[test]
    fn test_ip_pattern() {
        let exact = IpPattern::parse("192.168.1.10").unwrap();
        assert!(exact.matches("192.168.1.10".parse().unwrap()));
        assert!(!exact.matches("192.168.1.11".parse().unwrap()));

        let wild = IpPattern::parse("10.0.*").unwrap();
        assert!(wild.matches("10.0.3.7".parse().unwrap()));
        assert!(!wild.matches("10.1.0.1".parse().unwrap()));

        assert!(IpPattern::parse("*").is_err());
        assert!(IpPattern::parse("not-an-ip").is_err());
    }

    #[test]
    fn test_deny_wins_over_allow() {
        let policy = IpAccessPolicy::new(&["10.0.*"], &["10.0.0.5"]).unwrap();
        assert!(policy.permits("10.0.0.4".parse().unwrap()));
        assert!(!policy.permits("10.0.0.5".parse().unwrap()));
        assert!(!policy.permits("192.168.0.1".parse().unwrap()));
    }

    #[test]
    fn test_empty_allow_admits_all_but_denied() {
        let policy = IpAccessPolicy::new(&[], &["172.16.*"]).unwrap();
        assert!(policy.permits("8.8.8.8".parse().unwrap()));
        assert!(!policy.permits("172.16.4.2".parse().unwrap()));
    }

    #[test]
    fn test_federation_blacklist_is_case_insensitive() {
        let config = FederationConfig::default().with_blacklist(["Spam.Example"]);
        assert!(config.is_blacklisted("spam.example"));
        assert!(config.is_blacklisted("SPAM.EXAMPLE"));
        assert!(!config.is_blacklisted("ham.example"));
    }
}
