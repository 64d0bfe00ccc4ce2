pub mod cluster;
pub mod config;
pub mod connection;
pub mod dialback;
pub mod error;
pub mod federation;
pub mod hooks;
pub mod routing;
pub mod session;
pub mod stanza;

pub use cluster::{ClusterError, ClusterRpc, NodeId, RemotePacketRouter};
pub use config::{
    CompressionPolicy, ConnectionConfig, FederationConfig, IpAccessPolicy, RoutingConfig,
    SessionConfig, StreamVersion, TlsPolicy,
};
pub use connection::Connection;
pub use dialback::{DialbackKey, DialbackResult, DomainPair, KeyVerifier, LocalKeyVerifier};
pub use error::{StanzaErrorCondition, StreamErrorCondition, XmppError};
pub use federation::{DomainAuthenticator, FederationError, FederationManager, S2sConnector};
pub use hooks::{PacketInterceptor, PresenceDirectory, PrivacyListProvider, RoutingFailureHandler};
pub use routing::local::LocalRoutingTable;
pub use routing::{ClientRoute, RoutingOutcome, RoutingTable};
pub use session::client::ClientSession;
pub use session::factory::SessionFactory;
pub use session::manager::SessionManager;
pub use session::{Session, SessionStatus, StreamId};
pub use stanza::{Packet, PacketKind, PresenceShow};
