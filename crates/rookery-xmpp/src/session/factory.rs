//! Accepting streams and turning them into sessions.
//!
//! The factory owns the first decisions made about a new stream: whether
//! the source address may connect at all, which session type the stream
//! namespace asks for, whether the addressed domain is served here, which
//! stream version to settle on, and what features to advertise.

use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use crate::config::{CompressionPolicy, ConnectionConfig, StreamVersion, TlsPolicy};
use crate::connection::Connection;
use crate::error::{StreamErrorCondition, XmppError};
use crate::hooks::PrivacyListProvider;
use crate::session::client::ClientSession;
use crate::session::component::ComponentSession;
use crate::session::multiplexer::ConnectionMultiplexerSession;
use crate::session::server::IncomingServerSession;
use crate::session::{SessionCommon, StreamId};
use crate::stanza::ns;

/// The session type a stream header asks for, keyed by its namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// `jabber:client`
    Client,
    /// `jabber:server`
    Server,
    /// `jabber:component:accept`
    Component,
    /// `urn:xmpp:cm:1`
    Multiplexer,
}

impl StreamKind {
    fn from_namespace(namespace: &str) -> Option<Self> {
        match namespace {
            ns::CLIENT => Some(Self::Client),
            ns::SERVER => Some(Self::Server),
            ns::COMPONENT_ACCEPT => Some(Self::Component),
            ns::CONNECTION_MANAGER => Some(Self::Multiplexer),
            _ => None,
        }
    }
}

/// The attributes of an opening `<stream:stream>` header.
#[derive(Debug, Clone)]
pub struct StreamHeader {
    /// Content namespace of the stream
    pub namespace: String,
    /// Addressed domain (`to` attribute)
    pub to: Option<String>,
    /// Announcing domain (`from` attribute)
    pub from: Option<String>,
    /// Version attribute, verbatim
    pub version: Option<String>,
}

/// A freshly created session, typed by stream kind.
#[derive(Debug)]
pub enum NewSession {
    /// Client stream
    Client(Arc<ClientSession>),
    /// Inbound server-to-server stream
    IncomingServer(Arc<IncomingServerSession>),
    /// Component stream, serving the subdomain it addressed
    Component(Arc<ComponentSession>),
    /// Connection-manager stream
    Multiplexer(Arc<ConnectionMultiplexerSession>),
}

impl NewSession {
    /// The negotiated stream id.
    pub fn stream_id(&self) -> &StreamId {
        use crate::session::Session;
        match self {
            Self::Client(s) => s.stream_id(),
            Self::IncomingServer(s) => s.stream_id(),
            Self::Component(s) => s.stream_id(),
            Self::Multiplexer(s) => s.stream_id(),
        }
    }
}

/// Builds sessions from accepted stream headers.
pub struct SessionFactory {
    server_name: String,
    local_domains: HashSet<String>,
    client_config: ConnectionConfig,
    server_config: ConnectionConfig,
    component_config: ConnectionConfig,
    privacy: Arc<dyn PrivacyListProvider>,
}

impl SessionFactory {
    /// Create a factory for the given primary domain.
    pub fn new(
        server_name: impl Into<String>,
        privacy: Arc<dyn PrivacyListProvider>,
    ) -> Self {
        let server_name = server_name.into().to_lowercase();
        let mut local_domains = HashSet::new();
        local_domains.insert(server_name.clone());
        Self {
            server_name,
            local_domains,
            client_config: ConnectionConfig::default(),
            server_config: ConnectionConfig::default(),
            component_config: ConnectionConfig::default(),
            privacy,
        }
    }

    /// Serve an additional local domain.
    pub fn add_local_domain(&mut self, domain: impl AsRef<str>) {
        self.local_domains.insert(domain.as_ref().to_lowercase());
    }

    /// Configure client connections.
    pub fn with_client_config(mut self, config: ConnectionConfig) -> Self {
        self.client_config = config;
        self
    }

    /// Configure server-to-server connections.
    pub fn with_server_config(mut self, config: ConnectionConfig) -> Self {
        self.server_config = config;
        self
    }

    /// Configure component connections.
    pub fn with_component_config(mut self, config: ConnectionConfig) -> Self {
        self.component_config = config;
        self
    }

    /// Whether `domain` is served locally.
    pub fn is_local_domain(&self, domain: &str) -> bool {
        self.local_domains.contains(&domain.to_lowercase())
    }

    fn config_for(&self, kind: StreamKind) -> &ConnectionConfig {
        match kind {
            StreamKind::Client | StreamKind::Multiplexer => &self.client_config,
            StreamKind::Server => &self.server_config,
            StreamKind::Component => &self.component_config,
        }
    }

    /// Validate a stream header and create the matching session.
    ///
    /// On a policy or addressing violation the stream is closed with the
    /// appropriate stream error before the error is returned.
    #[instrument(name = "accept_stream", skip(self, header, connection), fields(ns = %header.namespace))]
    pub async fn accept(
        &self,
        header: StreamHeader,
        connection: Arc<dyn Connection>,
    ) -> Result<(NewSession, StreamVersion), XmppError> {
        let kind = match StreamKind::from_namespace(&header.namespace) {
            Some(kind) => kind,
            None => {
                connection
                    .close_with_error(StreamErrorCondition::InvalidNamespace)
                    .await;
                return Err(XmppError::Stream(StreamErrorCondition::InvalidNamespace));
            }
        };
        let config = self.config_for(kind);

        if let Some(addr) = connection.peer_address() {
            if !config.ip_policy.permits(addr) {
                warn!(peer = %addr, kind = ?kind, "connection refused by IP policy");
                connection
                    .close_with_error(StreamErrorCondition::PolicyViolation)
                    .await;
                return Err(XmppError::Stream(StreamErrorCondition::PolicyViolation));
            }
        }

        // Components address the subdomain they want to serve; everyone
        // else must address a domain hosted here.
        let to = header.to.as_deref().map(str::to_lowercase);
        if kind != StreamKind::Component {
            match to.as_deref() {
                Some(domain) if self.is_local_domain(domain) => {}
                _ => {
                    connection
                        .close_with_error(StreamErrorCondition::HostUnknown)
                        .await;
                    return Err(XmppError::Stream(StreamErrorCondition::HostUnknown));
                }
            }
        }

        let peer_version = match header.version.as_deref() {
            Some(v) => Some(StreamVersion::parse(v)?),
            None => None,
        };
        let version = StreamVersion::negotiate(peer_version);

        // A mandatory-TLS stream is doomed when no identity certificate is
        // available to negotiate with; fail it now rather than at the
        // STARTTLS round trip.
        if config.tls_policy == TlsPolicy::Required
            && !connection.is_secure()
            && connection.certificate_identities().is_empty()
        {
            connection
                .close_with_error(StreamErrorCondition::PolicyViolation)
                .await;
            return Err(XmppError::Stream(StreamErrorCondition::PolicyViolation));
        }

        let stream_id = StreamId::generate();
        debug!(stream = %stream_id, kind = ?kind, version = %version, "stream accepted");
        let common = SessionCommon::new(stream_id, self.server_name.clone(), connection);

        let session = match kind {
            StreamKind::Client => {
                NewSession::Client(Arc::new(ClientSession::new(common, self.privacy.clone())))
            }
            StreamKind::Server => {
                let local = to.unwrap_or_else(|| self.server_name.clone());
                NewSession::IncomingServer(Arc::new(IncomingServerSession::new(common, local)))
            }
            StreamKind::Component => {
                let subdomain = to.ok_or_else(|| {
                    XmppError::malformed("component stream without a 'to' subdomain")
                })?;
                NewSession::Component(Arc::new(ComponentSession::new(common, subdomain)))
            }
            StreamKind::Multiplexer => {
                let domain = header
                    .from
                    .map(|f| f.to_lowercase())
                    .unwrap_or_else(|| self.server_name.clone());
                NewSession::Multiplexer(Arc::new(ConnectionMultiplexerSession::new(common, domain)))
            }
        };

        Ok((session, version))
    }
}

/// Inputs for assembling a `<stream:features/>` advertisement.
#[derive(Debug, Clone)]
pub struct FeatureContext {
    /// Stream kind being negotiated
    pub kind: StreamKind,
    /// Whether TLS is already active
    pub secure: bool,
    /// Whether compression is already active
    pub compressed: bool,
    /// Whether the peer has authenticated
    pub authenticated: bool,
    /// Whether the peer presented a verified certificate
    pub peer_certificate_verified: bool,
    /// SASL mechanisms the authentication layer offers
    pub sasl_mechanisms: Vec<String>,
}

/// Assemble the stream features to advertise, in RFC order: STARTTLS,
/// SASL, dialback, compression, then bind/session/stream-management for
/// authenticated clients.
pub fn stream_features(
    ctx: &FeatureContext,
    tls_policy: TlsPolicy,
    compression_policy: CompressionPolicy,
) -> String {
    let mut features = String::from("<stream:features>");

    if !ctx.secure && tls_policy != TlsPolicy::Disabled {
        features.push_str(&format!("<starttls xmlns='{}'", ns::TLS));
        if tls_policy == TlsPolicy::Required {
            features.push_str("><required/></starttls>");
        } else {
            features.push_str("/>");
        }
    }

    if !ctx.authenticated {
        let mechanisms: Vec<&str> = ctx
            .sasl_mechanisms
            .iter()
            .map(String::as_str)
            // EXTERNAL is only honest when a certificate actually verified.
            .filter(|m| *m != "EXTERNAL" || ctx.peer_certificate_verified)
            .collect();
        if !mechanisms.is_empty() {
            features.push_str(&format!("<mechanisms xmlns='{}'>", ns::SASL));
            for mechanism in mechanisms {
                features.push_str(&format!("<mechanism>{}</mechanism>", mechanism));
            }
            features.push_str("</mechanisms>");
        }
        if ctx.kind == StreamKind::Server {
            features.push_str(&format!(
                "<dialback xmlns='{}'><errors/></dialback>",
                ns::DIALBACK_FEATURES
            ));
        }
    }

    if compression_policy == CompressionPolicy::Optional && !ctx.compressed {
        features.push_str(&format!(
            "<compression xmlns='{}'><method>zlib</method></compression>",
            ns::COMPRESS
        ));
    }

    if ctx.authenticated && ctx.kind == StreamKind::Client {
        features.push_str(&format!("<bind xmlns='{}'/>", ns::BIND));
        features.push_str(&format!("<session xmlns='{}'/>", ns::SESSION));
        features.push_str(&format!("<sm xmlns='{}'/>", ns::SM_2));
        features.push_str(&format!("<sm xmlns='{}'/>", ns::SM_3));
    }

    features.push_str("</stream:features>");
    features
}
