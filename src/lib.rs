//! OVN: Overlay Virtual Network
//!
//! Per-peer path management and packet dispatch for a peer-to-peer
//! virtual-network node. For every remote participant the node maintains
//! candidate network paths ranked by quality, keeps them alive across NAT
//! timeouts, learns new paths from authenticated traffic, caches network
//! membership certificates, and defers CPU-heavy packet decoding to a
//! worker through a bounded queue.

pub mod cert;
pub mod config;
pub mod deferred;
pub mod dispatch;
pub mod identity;
pub mod inet;
pub mod node;
pub mod packet;
pub mod path;
pub mod peer;
pub mod runtime;
pub mod topology;
pub mod transport;

// Re-export identity types
pub use identity::{Identity, IdentityError, PeerAddress, PeerIdentity, SessionKey};

// Re-export address types
pub use inet::{Family, InetAddress, InetError, IpScope};

// Re-export packet types
pub use packet::{IncomingPacket, Packet, PacketError, Verb};

// Re-export path types
pub use path::{Path, PathError, PEER_ACTIVITY_TIMEOUT};

// Re-export deferred queue types
pub use deferred::{DeferredQueue, ProcessOutcome, MAX_DEFERRED};

// Re-export certificate types
pub use cert::{controller_for, CertError, MembershipCert};

// Re-export peer types
pub use peer::{CertCache, Peer, PeerError, RemoteVersion, MAX_PATHS};

// Re-export runtime collaborator traits
pub use runtime::{
    AntiRecursion, CertificateVerify, Clock, ClusterHook, Network, NodeServices, PacketCodec,
    Runtime, Topology, VerbHandler, WireTransport,
};

// Re-export dispatch types
pub use dispatch::{Dispatcher, LoggingVerbHandler};

// Re-export topology types
pub use topology::TopologyStore;

// Re-export transport types
pub use transport::{TransportError, TransportState, UdpTransport};

// Re-export node types
pub use node::{LocalServices, Node, NodeError, NodeState};

// Re-export config types
pub use config::{Config, ConfigError, IdentityConfig, NodeConfig, UdpConfig};
