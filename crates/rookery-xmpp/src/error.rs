//! Error types for the session and routing core.

use thiserror::Error;

/// Top-level errors surfaced by the session/routing core.
#[derive(Debug, Error)]
pub enum XmppError {
    /// IO error reported by the connection layer
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Stanza could not be interpreted (wrong element name, bad namespace)
    #[error("Malformed stanza: {0}")]
    MalformedStanza(String),

    /// JID could not be parsed
    #[error("Malformed JID: {0}")]
    JidMalformed(#[from] jid::Error),

    /// Authentication failed
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    /// Session not found or expired
    #[error("Session not found or expired")]
    SessionNotFound,

    /// Session is in the wrong state for the requested operation
    #[error("Invalid session state: {0}")]
    InvalidState(String),

    /// The connection backing a session has been closed
    #[error("Connection closed")]
    ConnectionClosed,

    /// Resource conflict (duplicate resource binding)
    #[error("Resource conflict: {0}")]
    ResourceConflict(String),

    /// Fatal stream-level error
    #[error("Stream error: {0}")]
    Stream(StreamErrorCondition),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// No route exists for the addressed entity
    #[error("No route to {0}")]
    NoRoute(jid::Jid),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// Stanza error (reported back to the sender as an error stanza)
    #[error("Stanza error: {condition}")]
    Stanza {
        /// Error condition
        condition: StanzaErrorCondition,
        /// Error type
        error_type: StanzaErrorType,
        /// Optional text description
        text: Option<String>,
    },
}

impl XmppError {
    /// Create a malformed-stanza error.
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedStanza(msg.into())
    }

    /// Create an authentication error.
    pub fn auth_failed(msg: impl Into<String>) -> Self {
        Self::AuthFailed(msg.into())
    }

    /// Create an invalid-state error.
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a stanza error for 'not-authorized'.
    pub fn not_authorized(text: Option<String>) -> Self {
        Self::Stanza {
            condition: StanzaErrorCondition::NotAuthorized,
            error_type: StanzaErrorType::Auth,
            text,
        }
    }

    /// Create a stanza error for 'bad-request'.
    pub fn bad_request(text: Option<String>) -> Self {
        Self::Stanza {
            condition: StanzaErrorCondition::BadRequest,
            error_type: StanzaErrorType::Modify,
            text,
        }
    }

    /// Create a stanza error for 'service-unavailable'.
    pub fn service_unavailable(text: Option<String>) -> Self {
        Self::Stanza {
            condition: StanzaErrorCondition::ServiceUnavailable,
            error_type: StanzaErrorType::Cancel,
            text,
        }
    }

    /// Create a stanza error for 'remote-server-not-found'.
    pub fn remote_server_not_found(text: Option<String>) -> Self {
        Self::Stanza {
            condition: StanzaErrorCondition::RemoteServerNotFound,
            error_type: StanzaErrorType::Cancel,
            text,
        }
    }

    /// Create a stanza error for 'forbidden'.
    pub fn forbidden(text: Option<String>) -> Self {
        Self::Stanza {
            condition: StanzaErrorCondition::Forbidden,
            error_type: StanzaErrorType::Auth,
            text,
        }
    }

    /// Create a stanza error for 'internal-server-error'.
    pub fn internal_server_error(text: Option<String>) -> Self {
        Self::Stanza {
            condition: StanzaErrorCondition::InternalServerError,
            error_type: StanzaErrorType::Wait,
            text,
        }
    }
}

/// XMPP stream error conditions (RFC 6120 Section 4.9.3).
///
/// Stream errors are fatal. After emitting one the stream must be closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamErrorCondition {
    /// Bad format (malformed XML)
    BadFormat,
    /// Bad namespace prefix
    BadNamespacePrefix,
    /// Conflict (e.g. another stream took over the resource or subdomain)
    Conflict,
    /// Connection timeout
    ConnectionTimeout,
    /// Host gone
    HostGone,
    /// Host unknown (the 'to' domain is not served here)
    HostUnknown,
    /// Improper addressing
    ImproperAddressing,
    /// Internal server error
    InternalServerError,
    /// Invalid from
    InvalidFrom,
    /// Invalid namespace
    InvalidNamespace,
    /// Invalid XML
    InvalidXml,
    /// Not authorized
    NotAuthorized,
    /// Not well-formed
    NotWellFormed,
    /// Policy violation (e.g. TLS required but not negotiated)
    PolicyViolation,
    /// Remote connection failed
    RemoteConnectionFailed,
    /// Stream reset
    Reset,
    /// Resource constraint
    ResourceConstraint,
    /// Restricted XML
    RestrictedXml,
    /// See other host
    SeeOtherHost,
    /// System shutdown
    SystemShutdown,
    /// Undefined condition
    UndefinedCondition,
    /// Unsupported encoding
    UnsupportedEncoding,
    /// Unsupported feature
    UnsupportedFeature,
    /// Unsupported stanza type
    UnsupportedStanzaType,
    /// Unsupported version
    UnsupportedVersion,
}

impl StreamErrorCondition {
    /// Element name for this condition.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadFormat => "bad-format",
            Self::BadNamespacePrefix => "bad-namespace-prefix",
            Self::Conflict => "conflict",
            Self::ConnectionTimeout => "connection-timeout",
            Self::HostGone => "host-gone",
            Self::HostUnknown => "host-unknown",
            Self::ImproperAddressing => "improper-addressing",
            Self::InternalServerError => "internal-server-error",
            Self::InvalidFrom => "invalid-from",
            Self::InvalidNamespace => "invalid-namespace",
            Self::InvalidXml => "invalid-xml",
            Self::NotAuthorized => "not-authorized",
            Self::NotWellFormed => "not-well-formed",
            Self::PolicyViolation => "policy-violation",
            Self::RemoteConnectionFailed => "remote-connection-failed",
            Self::Reset => "reset",
            Self::ResourceConstraint => "resource-constraint",
            Self::RestrictedXml => "restricted-xml",
            Self::SeeOtherHost => "see-other-host",
            Self::SystemShutdown => "system-shutdown",
            Self::UndefinedCondition => "undefined-condition",
            Self::UnsupportedEncoding => "unsupported-encoding",
            Self::UnsupportedFeature => "unsupported-feature",
            Self::UnsupportedStanzaType => "unsupported-stanza-type",
            Self::UnsupportedVersion => "unsupported-version",
        }
    }

    /// Serialize as a `<stream:error/>` followed by the stream close tag.
    pub fn to_wire(&self, text: Option<&str>) -> String {
        let mut error = format!(
            "<stream:error><{} xmlns='urn:ietf:params:xml:ns:xmpp-streams'/>",
            self.as_str()
        );
        if let Some(t) = text {
            error.push_str(&format!(
                "<text xmlns='urn:ietf:params:xml:ns:xmpp-streams' xml:lang='en'>{}</text>",
                t
            ));
        }
        error.push_str("</stream:error></stream:stream>");
        error
    }
}

impl std::fmt::Display for StreamErrorCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// XMPP stanza error conditions (RFC 6120 Section 8.3.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaErrorCondition {
    /// Bad request (malformed XML, etc.)
    BadRequest,
    /// Conflict (e.g., resource already bound)
    Conflict,
    /// Feature not implemented
    FeatureNotImplemented,
    /// Forbidden (permission denied)
    Forbidden,
    /// Gone (entity no longer available)
    Gone,
    /// Internal server error
    InternalServerError,
    /// Item not found
    ItemNotFound,
    /// JID malformed
    JidMalformed,
    /// Not acceptable
    NotAcceptable,
    /// Not allowed
    NotAllowed,
    /// Not authorized
    NotAuthorized,
    /// Policy violation
    PolicyViolation,
    /// Recipient unavailable
    RecipientUnavailable,
    /// Redirect
    Redirect,
    /// Registration required
    RegistrationRequired,
    /// Remote server not found
    RemoteServerNotFound,
    /// Remote server timeout
    RemoteServerTimeout,
    /// Resource constraint
    ResourceConstraint,
    /// Service unavailable
    ServiceUnavailable,
    /// Subscription required
    SubscriptionRequired,
    /// Undefined condition
    UndefinedCondition,
    /// Unexpected request
    UnexpectedRequest,
}

impl StanzaErrorCondition {
    /// Element name for this condition.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadRequest => "bad-request",
            Self::Conflict => "conflict",
            Self::FeatureNotImplemented => "feature-not-implemented",
            Self::Forbidden => "forbidden",
            Self::Gone => "gone",
            Self::InternalServerError => "internal-server-error",
            Self::ItemNotFound => "item-not-found",
            Self::JidMalformed => "jid-malformed",
            Self::NotAcceptable => "not-acceptable",
            Self::NotAllowed => "not-allowed",
            Self::NotAuthorized => "not-authorized",
            Self::PolicyViolation => "policy-violation",
            Self::RecipientUnavailable => "recipient-unavailable",
            Self::Redirect => "redirect",
            Self::RegistrationRequired => "registration-required",
            Self::RemoteServerNotFound => "remote-server-not-found",
            Self::RemoteServerTimeout => "remote-server-timeout",
            Self::ResourceConstraint => "resource-constraint",
            Self::ServiceUnavailable => "service-unavailable",
            Self::SubscriptionRequired => "subscription-required",
            Self::UndefinedCondition => "undefined-condition",
            Self::UnexpectedRequest => "unexpected-request",
        }
    }

    /// Default error type for this condition (RFC 6120 Appendix A).
    pub fn default_type(&self) -> StanzaErrorType {
        match self {
            Self::BadRequest | Self::JidMalformed | Self::NotAcceptable => StanzaErrorType::Modify,
            Self::Forbidden
            | Self::NotAuthorized
            | Self::RegistrationRequired
            | Self::SubscriptionRequired => StanzaErrorType::Auth,
            Self::InternalServerError
            | Self::RecipientUnavailable
            | Self::RemoteServerTimeout
            | Self::ResourceConstraint
            | Self::UnexpectedRequest => StanzaErrorType::Wait,
            _ => StanzaErrorType::Cancel,
        }
    }
}

impl std::fmt::Display for StanzaErrorCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// XMPP stanza error types (RFC 6120 Section 8.3.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaErrorType {
    /// Retry after providing credentials
    Auth,
    /// Do not retry (unrecoverable error)
    Cancel,
    /// Retry after changing the data sent
    Modify,
    /// Retry after waiting (temporary error)
    Wait,
}

impl StanzaErrorType {
    /// The type attribute value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Cancel => "cancel",
            Self::Modify => "modify",
            Self::Wait => "wait",
        }
    }
}

impl std::fmt::Display for StanzaErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
