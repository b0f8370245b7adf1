//! Network Path
//!
//! A `Path` is one bidirectional endpoint pair to a peer: the local and
//! remote IP/UDP addresses plus liveness timestamps. Paths are compared by
//! a composite quality key where activity dominates, then address
//! preference rank, then recency of traffic.

use crate::inet::{Family, InetAddress, IpScope};
use crate::runtime::Runtime;
use thiserror::Error;

/// A path is active when traffic was received on it within this window
/// (milliseconds).
pub const PEER_ACTIVITY_TIMEOUT: u64 = 60_000;

/// Flag: the cluster layer has steered the peer to a better endpoint; this
/// path remains usable but should not be advertised.
pub const PATH_FLAG_CLUSTER_SUBOPTIMAL: u16 = 0x0001;

/// Serialization version emitted and accepted.
const PATH_SERIALIZATION_VERSION: u8 = 0;

/// Errors related to path serialization.
#[derive(Debug, Error)]
pub enum PathError {
    #[error("invalid serialized path version: {0}")]
    InvalidVersion(u8),

    #[error("truncated serialized path")]
    Truncated,

    #[error("bad endpoint address: {0}")]
    BadAddress(#[from] crate::inet::InetError),
}

/// One candidate network path to a peer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Path {
    last_send: u64,
    last_received: u64,
    remote: InetAddress,
    local: InetAddress,
    flags: u16,
    // Memoized from `remote`; refreshed whenever the remote changes.
    ip_scope: IpScope,
}

impl Path {
    /// Create a path for an endpoint pair.
    pub fn new(local: InetAddress, remote: InetAddress) -> Self {
        Self {
            last_send: 0,
            last_received: 0,
            ip_scope: remote.ip_scope(),
            remote,
            local,
            flags: 0,
        }
    }

    /// Local side of the endpoint pair.
    pub fn local(&self) -> &InetAddress {
        &self.local
    }

    /// Remote side of the endpoint pair.
    pub fn remote(&self) -> &InetAddress {
        &self.remote
    }

    /// Time of the last send over this path.
    pub fn last_send(&self) -> u64 {
        self.last_send
    }

    /// Time of the last receive from this path.
    pub fn last_received(&self) -> u64 {
        self.last_received
    }

    /// Memoized scope of the remote address.
    pub fn ip_scope(&self) -> IpScope {
        self.ip_scope
    }

    /// Record a send at `now`.
    pub fn record_send(&mut self, now: u64) {
        self.last_send = now;
    }

    /// Record a receive at `now`.
    pub fn record_receive(&mut self, now: u64) {
        self.last_received = now;
    }

    /// Whether this path has seen traffic recently enough to be used.
    pub fn active(&self, now: u64) -> bool {
        now.saturating_sub(self.last_received) < PEER_ACTIVITY_TIMEOUT
    }

    /// Whether this path needs no NAT keepalives.
    ///
    /// IPv6 endpoints and non-global IPv4 space (LAN, CGNAT, squatted
    /// blocks) are assumed NAT-free.
    pub fn reliable(&self) -> bool {
        if self.remote.family() == Some(Family::V4) {
            self.ip_scope != IpScope::Global && self.ip_scope != IpScope::PseudoPrivate
        } else {
            true
        }
    }

    /// Preference rank, higher is better.
    ///
    /// Twice the scope discriminant plus one for IPv6, so scope dominates
    /// and IPv6 outranks IPv4 at equal scope.
    pub fn preference_rank(&self) -> u32 {
        let v6 = match self.remote.family() {
            Some(Family::V6) => 1,
            _ => 0,
        };
        (self.ip_scope as u32) * 2 + v6
    }

    /// Composite quality key: activity at bit 63, preference rank in bits
    /// 62..51, last receive time in the low 51 bits. A single unsigned
    /// comparison orders paths best-first.
    pub fn quality(&self, now: u64) -> u64 {
        ((self.active(now) as u64) << 63)
            | (((self.preference_rank() & 0xfff) as u64) << 51)
            | (self.last_received & 0x7_ffff_ffff_ffff)
    }

    /// Whether the cluster layer marked this path suboptimal.
    pub fn is_cluster_suboptimal(&self) -> bool {
        (self.flags & PATH_FLAG_CLUSTER_SUBOPTIMAL) != 0
    }

    /// Set or clear the cluster-suboptimal flag.
    pub fn set_cluster_suboptimal(&mut self, suboptimal: bool) {
        if suboptimal {
            self.flags |= PATH_FLAG_CLUSTER_SUBOPTIMAL;
        } else {
            self.flags &= !PATH_FLAG_CLUSTER_SUBOPTIMAL;
        }
    }

    /// Whether this slot holds a real endpoint pair.
    pub fn is_some(&self) -> bool {
        !self.remote.is_nil()
    }

    /// Send data over this path; records the send time when the transport
    /// reports success.
    pub fn send(&mut self, rt: &Runtime, data: &[u8], now: u64) -> bool {
        if rt.transport.send(&self.local, &self.remote, data, None) {
            self.record_send(now);
            true
        } else {
            false
        }
    }

    /// Append the serialized form to a buffer.
    pub fn encode_to(&self, out: &mut Vec<u8>) {
        out.push(PATH_SERIALIZATION_VERSION);
        out.extend_from_slice(&self.last_send.to_be_bytes());
        out.extend_from_slice(&self.last_received.to_be_bytes());
        self.remote.encode_to(out);
        self.local.encode_to(out);
        out.extend_from_slice(&self.flags.to_be_bytes());
    }

    /// Decode from the wire, returning the path and bytes consumed.
    pub fn decode_from(data: &[u8]) -> Result<(Self, usize), PathError> {
        let version = *data.first().ok_or(PathError::Truncated)?;
        if version != PATH_SERIALIZATION_VERSION {
            return Err(PathError::InvalidVersion(version));
        }
        let mut at = 1;

        let read_u64 = |data: &[u8], at: usize| -> Result<u64, PathError> {
            let s = data.get(at..at + 8).ok_or(PathError::Truncated)?;
            let mut b = [0u8; 8];
            b.copy_from_slice(s);
            Ok(u64::from_be_bytes(b))
        };

        let last_send = read_u64(data, at)?;
        at += 8;
        let last_received = read_u64(data, at)?;
        at += 8;
        let (remote, n) = InetAddress::decode_from(&data[at..])?;
        at += n;
        let (local, n) = InetAddress::decode_from(&data[at..])?;
        at += n;
        let s = data.get(at..at + 2).ok_or(PathError::Truncated)?;
        let flags = u16::from_be_bytes([s[0], s[1]]);
        at += 2;

        Ok((
            Self {
                last_send,
                last_received,
                ip_scope: remote.ip_scope(),
                remote,
                local,
                flags,
            },
            at,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> InetAddress {
        s.parse().unwrap()
    }

    fn path(local: &str, remote: &str) -> Path {
        Path::new(addr(local), addr(remote))
    }

    #[test]
    fn test_activity_window() {
        let mut p = path("10.0.0.1:9993", "203.0.113.7:41000");
        assert!(!p.active(1000));

        p.record_receive(1000);
        assert!(p.active(1000));
        assert!(p.active(1000 + PEER_ACTIVITY_TIMEOUT - 1));
        assert!(!p.active(1000 + PEER_ACTIVITY_TIMEOUT));
    }

    #[test]
    fn test_reliability() {
        // Global v4 sits behind NAT; LAN and CGNAT v4 do not; v6 never does.
        assert!(!path("10.0.0.1:1", "203.0.113.7:1").reliable());
        assert!(path("10.0.0.1:1", "192.168.1.10:1").reliable());
        assert!(path("10.0.0.1:1", "100.64.3.4:1").reliable());
        assert!(!path("10.0.0.1:1", "28.1.2.3:1").reliable());
        assert!(path("[fd00::1]:1", "[2001:db8::7]:1").reliable());
    }

    #[test]
    fn test_preference_rank() {
        let private_v4 = path("10.0.0.1:1", "192.168.1.10:1");
        let global_v4 = path("10.0.0.1:1", "203.0.113.7:1");
        let global_v6 = path("[fd00::1]:1", "[2001:db8::7]:1");

        assert_eq!(private_v4.preference_rank(), (IpScope::Private as u32) * 2);
        assert_eq!(global_v4.preference_rank(), (IpScope::Global as u32) * 2);
        assert_eq!(global_v6.preference_rank(), (IpScope::Global as u32) * 2 + 1);

        // Scope dominates family; family breaks ties within a scope.
        assert!(private_v4.preference_rank() > global_v6.preference_rank());
        assert!(global_v6.preference_rank() > global_v4.preference_rank());
    }

    #[test]
    fn test_quality_ordering() {
        let now = 100_000;

        let mut active_global = path("10.0.0.1:1", "203.0.113.7:1");
        active_global.record_receive(now - 1000);

        let mut active_private = path("10.0.0.1:1", "192.168.1.10:1");
        active_private.record_receive(now - 30_000);

        let mut stale_private = path("10.0.0.1:1", "192.168.9.9:1");
        stale_private.record_receive(now - PEER_ACTIVITY_TIMEOUT - 1);

        // Activity dominates rank; among active paths rank dominates recency.
        assert!(active_private.quality(now) > active_global.quality(now));
        assert!(active_global.quality(now) > stale_private.quality(now));
    }

    #[test]
    fn test_serialization_round_trip() {
        let mut p = path("10.0.0.1:9993", "[2001:db8::7]:41000");
        p.record_send(123);
        p.record_receive(456);
        p.set_cluster_suboptimal(true);

        let mut buf = Vec::new();
        p.encode_to(&mut buf);
        let (q, consumed) = Path::decode_from(&buf).unwrap();
        assert_eq!(consumed, buf.len());
        assert_eq!(p, q);
        assert_eq!(q.ip_scope(), q.remote().ip_scope());
    }

    #[test]
    fn test_deserialization_rejects_bad_version() {
        let mut buf = Vec::new();
        path("10.0.0.1:1", "203.0.113.7:1").encode_to(&mut buf);
        buf[0] = 1;
        assert!(matches!(
            Path::decode_from(&buf),
            Err(PathError::InvalidVersion(1))
        ));
    }

    #[test]
    fn test_cluster_suboptimal_flag() {
        let mut p = path("10.0.0.1:1", "203.0.113.7:1");
        assert!(!p.is_cluster_suboptimal());
        p.set_cluster_suboptimal(true);
        assert!(p.is_cluster_suboptimal());
        p.set_cluster_suboptimal(false);
        assert!(!p.is_cluster_suboptimal());
    }

    #[test]
    fn test_default_slot_is_empty() {
        let p = Path::default();
        assert!(!p.is_some());
        assert_eq!(p.ip_scope(), IpScope::None);
    }
}
