//! Runtime Environment
//!
//! The collaborator seams consumed by the core: wall clock, wire
//! transport, topology lookup, node services, certificate verification,
//! and the optional cluster hint layer. `Runtime` bundles them so peer
//! and dispatch code can take one parameter the way every operation in
//! this crate does.

use crate::cert::MembershipCert;
use crate::identity::{Identity, PeerAddress, PeerIdentity};
use crate::inet::InetAddress;
use crate::packet::IncomingPacket;
use crate::peer::Peer;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Monotonic millisecond clock.
pub trait Clock: Send + Sync {
    fn now(&self) -> u64;
}

/// The UDP send primitive.
///
/// Implementations must be thread-safe; sends may happen under peer locks
/// for tiny control packets.
pub trait WireTransport: Send + Sync {
    /// Send a datagram from a local endpoint to a remote one. A `ttl`
    /// overrides the socket default for NAT traversal probes. Returns
    /// whether the transport accepted the datagram.
    fn send(&self, local: &InetAddress, remote: &InetAddress, data: &[u8], ttl: Option<u8>)
        -> bool;
}

/// Lookup of peer records and world metadata.
///
/// The topology is the sole owner of peer records; everyone else holds
/// reference-counted views.
pub trait Topology: Send + Sync {
    /// Look up a peer by address.
    fn peer(&self, address: PeerAddress) -> Option<Arc<Peer>>;

    /// Identifier of the world definition this node trusts.
    fn world_id(&self) -> u64;

    /// Timestamp of that world definition.
    fn world_timestamp(&self) -> u64;

    /// Schedule an identity lookup for an unknown address.
    fn request_whois(&self, address: PeerAddress);
}

/// A network this node has joined, as seen by the peer layer.
pub trait Network: Send + Sync {
    /// The network id.
    fn id(&self) -> u64;

    /// Ask the network to announce our multicast group subscriptions to a
    /// peer. Called outside any peer lock.
    fn announce_multicast_groups_to(&self, peer: &Arc<Peer>);
}

/// Node-level services the peer layer consumes.
pub trait NodeServices: Send + Sync {
    /// Our directly reachable endpoints, for PUSH_DIRECT_PATHS.
    fn direct_paths(&self) -> Vec<InetAddress>;

    /// Whether this node is currently a member of a network.
    fn belongs_to_network(&self, network_id: u64) -> bool;

    /// All joined networks.
    fn all_networks(&self) -> Vec<Arc<dyn Network>>;
}

/// Records outgoing wire traffic so an embedder can recognize its own
/// packets re-entering through a tap device.
pub trait AntiRecursion: Send + Sync {
    fn log_outgoing(&self, data: &[u8]);
}

/// Cryptographic verification of membership certificates.
pub trait CertificateVerify: Send + Sync {
    fn verify(&self, cert: &MembershipCert, signer: &PeerIdentity) -> bool;
}

/// Optional cluster hint layer.
///
/// The core keeps learned paths either way; the cluster only steers peers
/// toward better endpoints. Both methods may be no-ops.
pub trait ClusterHook: Send + Sync {
    /// A better endpoint for the peer than the one it is using, if the
    /// cluster knows one.
    fn find_better_endpoint(
        &self,
        peer: PeerAddress,
        observed_remote: &InetAddress,
    ) -> Option<InetAddress>;

    /// Announce that this cluster member has a live direct path to a peer.
    fn broadcast_have_peer(&self, identity: &PeerIdentity);
}

/// The deferred decode entry point: authenticate and dispatch one packet.
///
/// Decode failures are the codec's to log; the queue never retries.
pub trait PacketCodec: Send + Sync {
    fn try_decode(&self, pkt: IncomingPacket, deferred_allowed: bool) -> bool;
}

/// High-level verb handling after a packet authenticates.
pub trait VerbHandler: Send + Sync {
    fn on_decoded(&self, pkt: &IncomingPacket);
}

// ============================================================================
// Runtime
// ============================================================================

/// Bundle of collaborators handed to every core operation.
pub struct Runtime {
    /// This node's identity.
    pub identity: Identity,
    pub clock: Arc<dyn Clock>,
    pub transport: Arc<dyn WireTransport>,
    pub topology: Arc<dyn Topology>,
    pub services: Arc<dyn NodeServices>,
    pub anti_recursion: Arc<dyn AntiRecursion>,
    pub cert_verify: Arc<dyn CertificateVerify>,
    /// Present only when clustering is configured.
    pub cluster: Option<Arc<dyn ClusterHook>>,
}

// ============================================================================
// Standard implementations
// ============================================================================

/// Millisecond clock anchored at process start; monotonic even when the
/// wall clock steps.
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

/// Signature-checking certificate verifier.
pub struct SchnorrCertVerify;

impl CertificateVerify for SchnorrCertVerify {
    fn verify(&self, cert: &MembershipCert, signer: &PeerIdentity) -> bool {
        cert.verify(signer)
    }
}

/// Fingerprints of recent outgoing packets, held in a small ring.
///
/// A fingerprint is the trailing bytes of the datagram, which cover the
/// MAC and thus change per packet.
pub struct PacketHistory {
    ring: Mutex<Vec<[u8; 16]>>,
    next: AtomicU64,
}

const PACKET_HISTORY_SIZE: usize = 16;

impl PacketHistory {
    pub fn new() -> Self {
        Self {
            ring: Mutex::new(vec![[0u8; 16]; PACKET_HISTORY_SIZE]),
            next: AtomicU64::new(0),
        }
    }

    /// Check whether a frame's tail matches recently sent traffic.
    pub fn is_recent_outgoing(&self, data: &[u8]) -> bool {
        let fp = Self::fingerprint(data);
        self.ring
            .lock()
            .expect("packet history lock poisoned")
            .iter()
            .any(|entry| *entry == fp)
    }

    fn fingerprint(data: &[u8]) -> [u8; 16] {
        let mut fp = [0u8; 16];
        let tail = &data[data.len().saturating_sub(16)..];
        fp[16 - tail.len()..].copy_from_slice(tail);
        fp
    }
}

impl Default for PacketHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl AntiRecursion for PacketHistory {
    fn log_outgoing(&self, data: &[u8]) {
        let slot = self.next.fetch_add(1, Ordering::Relaxed) as usize % PACKET_HISTORY_SIZE;
        let fp = Self::fingerprint(data);
        self.ring.lock().expect("packet history lock poisoned")[slot] = fp;
    }
}

// ============================================================================
// Test fixtures
// ============================================================================
