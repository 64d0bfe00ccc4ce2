//! Stanza handling on top of already-parsed XML elements.
//!
//! The transport layer hands this crate fully parsed `minidom::Element`s.
//! [`Packet`] wraps such an element with the accessors routing needs: kind
//! and type detection, address handling, presence priority/show extraction,
//! error-bounce construction and carbon-copy wrapping (XEP-0280).

use jid::{BareJid, FullJid, Jid};
use minidom::Element;
use std::fmt;

use crate::error::{StanzaErrorCondition, XmppError};

/// XML namespaces used across the crate.
pub mod ns {
    /// Client streams
    pub const CLIENT: &str = "jabber:client";
    /// Server-to-server streams
    pub const SERVER: &str = "jabber:server";
    /// External components (XEP-0114)
    pub const COMPONENT_ACCEPT: &str = "jabber:component:accept";
    /// Connection multiplexers (XEP-0225)
    pub const CONNECTION_MANAGER: &str = "urn:xmpp:cm:1";
    /// Stream framing
    pub const STREAM: &str = "http://etherx.jabber.org/streams";
    /// Stanza error conditions
    pub const STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";
    /// Stream error conditions
    pub const STREAMS: &str = "urn:ietf:params:xml:ns:xmpp-streams";
    /// STARTTLS negotiation
    pub const TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";
    /// SASL negotiation
    pub const SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
    /// Resource binding
    pub const BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";
    /// Legacy session establishment
    pub const SESSION: &str = "urn:ietf:params:xml:ns:xmpp-session";
    /// Stream compression (XEP-0138)
    pub const COMPRESS: &str = "http://jabber.org/features/compress";
    /// Server dialback
    pub const DIALBACK: &str = "jabber:server:dialback";
    /// Dialback stream feature
    pub const DIALBACK_FEATURES: &str = "urn:xmpp:features:dialback";
    /// Message carbons (XEP-0280)
    pub const CARBONS: &str = "urn:xmpp:carbons:2";
    /// Stanza forwarding (XEP-0297)
    pub const FORWARD: &str = "urn:xmpp:forward:0";
    /// Message processing hints (XEP-0334)
    pub const HINTS: &str = "urn:xmpp:hints";
    /// Stream management (XEP-0198)
    pub const SM_2: &str = "urn:xmpp:sm:2";
    /// Stream management, revision 3
    pub const SM_3: &str = "urn:xmpp:sm:3";
}

/// The three stanza kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    /// `<message/>`
    Message,
    /// `<presence/>`
    Presence,
    /// `<iq/>`
    Iq,
}

impl PacketKind {
    /// Element name for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Presence => "presence",
            Self::Iq => "iq",
        }
    }
}

/// Message types (RFC 6121 Section 5.2.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// Default type when the attribute is absent or unrecognized
    Normal,
    /// One-to-one chat
    Chat,
    /// Multi-user chat
    Groupchat,
    /// Broadcast-style notification
    Headline,
    /// Error report
    Error,
}

impl MessageType {
    fn from_attr(attr: Option<&str>) -> Self {
        match attr {
            Some("chat") => Self::Chat,
            Some("groupchat") => Self::Groupchat,
            Some("headline") => Self::Headline,
            Some("error") => Self::Error,
            _ => Self::Normal,
        }
    }
}

/// Presence types (RFC 6121 Section 4.7.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceType {
    /// No type attribute: the entity is available
    Available,
    /// The entity is no longer available
    Unavailable,
    /// Subscription request
    Subscribe,
    /// Subscription approval
    Subscribed,
    /// Subscription cancellation
    Unsubscribe,
    /// Subscription removal approval
    Unsubscribed,
    /// Presence probe
    Probe,
    /// Error report
    Error,
}

impl PresenceType {
    fn from_attr(attr: Option<&str>) -> Self {
        match attr {
            Some("unavailable") => Self::Unavailable,
            Some("subscribe") => Self::Subscribe,
            Some("subscribed") => Self::Subscribed,
            Some("unsubscribe") => Self::Unsubscribe,
            Some("unsubscribed") => Self::Unsubscribed,
            Some("probe") => Self::Probe,
            Some("error") => Self::Error,
            _ => Self::Available,
        }
    }
}

/// IQ types (RFC 6120 Section 8.2.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IqType {
    /// Information request
    Get,
    /// State change request
    Set,
    /// Successful response
    Result,
    /// Error response
    Error,
}

impl IqType {
    fn from_attr(attr: Option<&str>) -> Option<Self> {
        match attr {
            Some("get") => Some(Self::Get),
            Some("set") => Some(Self::Set),
            Some("result") => Some(Self::Result),
            Some("error") => Some(Self::Error),
            _ => None,
        }
    }

    /// Whether this IQ is a request (get/set) as opposed to a response.
    pub fn is_request(&self) -> bool {
        matches!(self, Self::Get | Self::Set)
    }
}

/// Presence `<show/>` values, ordered by routing desirability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum PresenceShow {
    /// Actively interested in chatting
    Chat,
    /// No show element: plainly available
    Online,
    /// Temporarily away
    Away,
    /// Extended away
    Xa,
    /// Do not disturb
    Dnd,
}

impl Default for PresenceShow {
    fn default() -> Self {
        Self::Online
    }
}

impl PresenceShow {
    /// Ordering weight used when selecting among equal-priority resources.
    /// Lower is preferred: chat < online < away < xa < dnd.
    pub fn routing_weight(&self) -> u8 {
        match self {
            Self::Chat => 1,
            Self::Online => 2,
            Self::Away => 3,
            Self::Xa => 4,
            Self::Dnd => 5,
        }
    }

    fn from_text(text: &str) -> Self {
        match text {
            "chat" => Self::Chat,
            "away" => Self::Away,
            "xa" => Self::Xa,
            "dnd" => Self::Dnd,
            _ => Self::Online,
        }
    }
}

/// A routable stanza: a validated `<message/>`, `<presence/>` or `<iq/>`.
#[derive(Debug, Clone)]
pub struct Packet {
    element: Element,
}

impl Packet {
    /// Wrap a parsed element, validating that it is one of the three stanza
    /// kinds.
    pub fn from_element(element: Element) -> Result<Self, XmppError> {
        match element.name() {
            "message" | "presence" | "iq" => Ok(Self { element }),
            other => Err(XmppError::malformed(format!(
                "not a stanza element: <{}/>",
                other
            ))),
        }
    }

    /// Stanza kind.
    pub fn kind(&self) -> PacketKind {
        match self.element.name() {
            "message" => PacketKind::Message,
            "presence" => PacketKind::Presence,
            _ => PacketKind::Iq,
        }
    }

    /// Destination address, if present and well formed.
    pub fn to(&self) -> Option<Jid> {
        self.element.attr("to").and_then(|s| Jid::new(s).ok())
    }

    /// Sender address, if present and well formed.
    pub fn from(&self) -> Option<Jid> {
        self.element.attr("from").and_then(|s| Jid::new(s).ok())
    }

    /// Replace the destination address.
    pub fn set_to(&mut self, to: Option<&Jid>) {
        self.element.set_attr("to", to.map(|j| j.to_string()));
    }

    /// Replace the sender address.
    pub fn set_from(&mut self, from: Option<&Jid>) {
        self.element.set_attr("from", from.map(|j| j.to_string()));
    }

    /// Stanza id attribute.
    pub fn id(&self) -> Option<&str> {
        self.element.attr("id")
    }

    /// Raw type attribute.
    pub fn type_attr(&self) -> Option<&str> {
        self.element.attr("type")
    }

    /// Message type, defaulting to `normal`. Meaningless for non-messages.
    pub fn message_type(&self) -> MessageType {
        MessageType::from_attr(self.type_attr())
    }

    /// Presence type, defaulting to available. Meaningless for non-presence.
    pub fn presence_type(&self) -> PresenceType {
        PresenceType::from_attr(self.type_attr())
    }

    /// IQ type, if this is an IQ with a valid type attribute.
    pub fn iq_type(&self) -> Option<IqType> {
        if self.kind() == PacketKind::Iq {
            IqType::from_attr(self.type_attr())
        } else {
            None
        }
    }

    /// Whether the stanza carries `type='error'`.
    pub fn is_error(&self) -> bool {
        self.type_attr() == Some("error")
    }

    /// Presence priority. Missing or unparseable priority counts as 0,
    /// values are clamped to the RFC 6121 range [-128, 127] by `i8`.
    pub fn priority(&self) -> i8 {
        let ns = self.element.ns();
        self.element
            .get_child("priority", ns.as_str())
            .and_then(|p| p.text().trim().parse::<i8>().ok())
            .unwrap_or(0)
    }

    /// Presence `<show/>` value.
    pub fn show(&self) -> PresenceShow {
        let ns = self.element.ns();
        self.element
            .get_child("show", ns.as_str())
            .map(|s| PresenceShow::from_text(s.text().trim()))
            .unwrap_or_default()
    }

    /// Whether this presence announces availability.
    pub fn is_available_presence(&self) -> bool {
        self.kind() == PacketKind::Presence && self.presence_type() == PresenceType::Available
    }

    /// Build an error bounce addressed back at the sender.
    ///
    /// Returns `None` when the stanza is itself an error (or an IQ result),
    /// in which case the caller must drop it rather than reflect it. This is
    /// the guard against error loops between servers.
    pub fn error_reply(&self, condition: StanzaErrorCondition) -> Option<Packet> {
        if self.is_error() {
            return None;
        }
        if self.iq_type() == Some(IqType::Result) {
            return None;
        }
        let from = self.from()?;

        let mut reply = self.element.clone();
        reply.set_attr("to", from.to_string());
        reply.set_attr("from", self.to().map(|j| j.to_string()));
        reply.set_attr("type", "error");

        let error = Element::builder("error", reply.ns())
            .attr("type", condition.default_type().as_str())
            .append(Element::builder(condition.as_str(), ns::STANZAS).build())
            .build();
        reply.append_child(error);

        Some(Packet { element: reply })
    }

    /// Whether a message may be carbon-copied to other resources.
    ///
    /// Only chat messages and normal messages with a body qualify, and the
    /// sender can opt out with `<private/>` or `<no-copy/>` hints.
    pub fn is_carbon_eligible(&self) -> bool {
        if self.kind() != PacketKind::Message {
            return false;
        }
        let has_body = {
            let ns = self.element.ns();
            self.element.get_child("body", ns.as_str()).is_some()
        };
        let type_ok = match self.message_type() {
            MessageType::Chat => true,
            MessageType::Normal => has_body,
            _ => false,
        };
        type_ok
            && self.element.get_child("private", ns::CARBONS).is_none()
            && self.element.get_child("no-copy", ns::HINTS).is_none()
    }

    /// Remove a carbons `<private/>` marker before final delivery.
    pub fn strip_carbon_private(&mut self) {
        let _ = self.element.remove_child("private", ns::CARBONS);
    }

    /// Wrap this message in a carbons `<received/>` envelope addressed to
    /// another resource of the recipient (XEP-0280 Section 10).
    pub fn carbon_copy(&self, owner: &BareJid, carbon_to: &FullJid) -> Packet {
        let forwarded = Element::builder("forwarded", ns::FORWARD)
            .append(self.element.clone())
            .build();
        let received = Element::builder("received", ns::CARBONS)
            .append(forwarded)
            .build();
        let mut builder = Element::builder("message", self.element.ns())
            .attr("from", owner.to_string())
            .attr("to", carbon_to.to_string());
        // The envelope keeps the original message's type.
        if let Some(msg_type) = self.type_attr() {
            builder = builder.attr("type", msg_type);
        }
        let element = builder.append(received).build();
        Packet { element }
    }

    /// Borrow the underlying element.
    pub fn element(&self) -> &Element {
        &self.element
    }

    /// Consume the wrapper, returning the element.
    pub fn into_element(self) -> Element {
        self.element
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from(&self.element))
    }
}

impl TryFrom<Element> for Packet {
    type Error = XmppError;

    fn try_from(element: Element) -> Result<Self, XmppError> {
        Self::from_element(element)
    }
}
