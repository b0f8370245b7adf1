//! IP Endpoint Addressing
//!
//! `InetAddress` is the address type carried by every path: an IPv4 or
//! IPv6 address plus UDP port, with a classification (`IpScope`) that
//! drives path preference and NAT assumptions. The nil variant exists so
//! unused path slots can hold a well-defined empty value.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;
use thiserror::Error;

/// Errors related to endpoint addresses.
#[derive(Debug, Error)]
pub enum InetError {
    #[error("invalid address literal: {0}")]
    InvalidLiteral(String),

    #[error("truncated serialized address")]
    Truncated,

    #[error("unknown address type byte: {0}")]
    UnknownType(u8),
}

/// Address family of a non-nil endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Family {
    V4,
    V6,
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Family::V4 => "v4",
            Family::V6 => "v6",
        };
        write!(f, "{}", s)
    }
}

/// Classification of an IP address.
///
/// Variant order is preference order: a higher discriminant is a more
/// desirable path target. Paths rank as `2 * scope + v6`, so scope
/// dominates family and IPv6 outranks IPv4 within a scope.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum IpScope {
    /// Not an IP address (nil endpoint).
    #[default]
    None = 0,
    /// Multicast group address.
    Multicast = 1,
    /// Loopback.
    Loopback = 2,
    /// Nominally public blocks that are squatted as private space.
    PseudoPrivate = 3,
    /// Publicly routable.
    Global = 4,
    /// Link-local (never usable for a path; needs a device qualifier).
    LinkLocal = 5,
    /// Carrier-grade NAT space (RFC 6598).
    Shared = 6,
    /// RFC 1918 / ULA private space.
    Private = 7,
}

/// An IP/UDP endpoint: one side of a path.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum InetAddress {
    /// Empty slot.
    #[default]
    Nil,
    /// IPv4 endpoint.
    V4(Ipv4Addr, u16),
    /// IPv6 endpoint.
    V6(Ipv6Addr, u16),
}

impl InetAddress {
    /// Build from std socket address.
    pub fn from_socket_addr(sa: SocketAddr) -> Self {
        match sa.ip() {
            IpAddr::V4(ip) => InetAddress::V4(ip, sa.port()),
            IpAddr::V6(ip) => InetAddress::V6(ip, sa.port()),
        }
    }

    /// Convert to std socket address, if non-nil.
    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        match self {
            InetAddress::Nil => None,
            InetAddress::V4(ip, port) => Some(SocketAddr::new(IpAddr::V4(*ip), *port)),
            InetAddress::V6(ip, port) => Some(SocketAddr::new(IpAddr::V6(*ip), *port)),
        }
    }

    /// Check for the nil variant.
    pub fn is_nil(&self) -> bool {
        matches!(self, InetAddress::Nil)
    }

    /// Address family, if non-nil.
    pub fn family(&self) -> Option<Family> {
        match self {
            InetAddress::Nil => None,
            InetAddress::V4(..) => Some(Family::V4),
            InetAddress::V6(..) => Some(Family::V6),
        }
    }

    /// UDP port (0 for nil).
    pub fn port(&self) -> u16 {
        match self {
            InetAddress::Nil => 0,
            InetAddress::V4(_, port) | InetAddress::V6(_, port) => *port,
        }
    }

    /// Raw address bytes: 4 for v4, 16 for v6, empty for nil.
    pub fn raw_ip_bytes(&self) -> Vec<u8> {
        match self {
            InetAddress::Nil => Vec::new(),
            InetAddress::V4(ip, _) => ip.octets().to_vec(),
            InetAddress::V6(ip, _) => ip.octets().to_vec(),
        }
    }

    /// Classify this address.
    pub fn ip_scope(&self) -> IpScope {
        match self {
            InetAddress::Nil => IpScope::None,
            InetAddress::V4(ip, _) => scope_v4(ip),
            InetAddress::V6(ip, _) => scope_v6(ip),
        }
    }

    /// Check whether this address may back a path.
    ///
    /// Link-local addresses are excluded: they require a device qualifier
    /// we cannot carry in PUSH_DIRECT_PATHS, and several OSes assign them
    /// ephemerally. Private, pseudo-private, shared and global space is
    /// accepted.
    pub fn valid_for_path(&self) -> bool {
        if self.family().is_none() {
            return false;
        }
        matches!(
            self.ip_scope(),
            IpScope::Private | IpScope::PseudoPrivate | IpScope::Shared | IpScope::Global
        )
    }

    /// Append the wire encoding to a buffer.
    ///
    /// Format: type byte (0 = nil, 4 = v4, 6 = v6), raw address bytes,
    /// big-endian port.
    pub fn encode_to(&self, out: &mut Vec<u8>) {
        match self {
            InetAddress::Nil => out.push(0),
            InetAddress::V4(ip, port) => {
                out.push(4);
                out.extend_from_slice(&ip.octets());
                out.extend_from_slice(&port.to_be_bytes());
            }
            InetAddress::V6(ip, port) => {
                out.push(6);
                out.extend_from_slice(&ip.octets());
                out.extend_from_slice(&port.to_be_bytes());
            }
        }
    }

    /// Decode from the wire, returning the address and bytes consumed.
    pub fn decode_from(data: &[u8]) -> Result<(Self, usize), InetError> {
        let ty = *data.first().ok_or(InetError::Truncated)?;
        match ty {
            0 => Ok((InetAddress::Nil, 1)),
            4 => {
                if data.len() < 7 {
                    return Err(InetError::Truncated);
                }
                let mut ip = [0u8; 4];
                ip.copy_from_slice(&data[1..5]);
                let port = u16::from_be_bytes([data[5], data[6]]);
                Ok((InetAddress::V4(Ipv4Addr::from(ip), port), 7))
            }
            6 => {
                if data.len() < 19 {
                    return Err(InetError::Truncated);
                }
                let mut ip = [0u8; 16];
                ip.copy_from_slice(&data[1..17]);
                let port = u16::from_be_bytes([data[17], data[18]]);
                Ok((InetAddress::V6(Ipv6Addr::from(ip), port), 19))
            }
            other => Err(InetError::UnknownType(other)),
        }
    }
}

fn scope_v4(ip: &Ipv4Addr) -> IpScope {
    let o = ip.octets();
    if ip.is_loopback() {
        IpScope::Loopback
    } else if ip.is_multicast() {
        IpScope::Multicast
    } else if ip.is_private() {
        IpScope::Private
    } else if ip.is_link_local() {
        IpScope::LinkLocal
    } else if o[0] == 100 && (o[1] & 0xc0) == 64 {
        // 100.64.0.0/10 carrier-grade NAT
        IpScope::Shared
    } else if o[0] == 28 || o[0] == 29 {
        // 28.0.0.0/7: allocated but widely squatted as private space
        IpScope::PseudoPrivate
    } else if ip.is_unspecified() {
        IpScope::None
    } else {
        IpScope::Global
    }
}

fn scope_v6(ip: &Ipv6Addr) -> IpScope {
    let seg = ip.segments();
    if ip.is_loopback() {
        IpScope::Loopback
    } else if ip.is_multicast() {
        IpScope::Multicast
    } else if (seg[0] & 0xffc0) == 0xfe80 {
        IpScope::LinkLocal
    } else if (seg[0] & 0xfe00) == 0xfc00 {
        // fc00::/7 unique local
        IpScope::Private
    } else if ip.is_unspecified() {
        IpScope::None
    } else {
        IpScope::Global
    }
}

impl From<SocketAddr> for InetAddress {
    fn from(sa: SocketAddr) -> Self {
        Self::from_socket_addr(sa)
    }
}

impl FromStr for InetAddress {
    type Err = InetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<SocketAddr>()
            .map(Self::from_socket_addr)
            .map_err(|_| InetError::InvalidLiteral(s.to_string()))
    }
}

impl fmt::Display for InetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InetAddress::Nil => write!(f, "(nil)"),
            InetAddress::V4(ip, port) => write!(f, "{}:{}", ip, port),
            InetAddress::V6(ip, port) => write!(f, "[{}]:{}", ip, port),
        }
    }
}

impl fmt::Debug for InetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InetAddress({})", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> InetAddress {
        s.parse().unwrap()
    }

    #[test]
    fn test_scope_v4() {
        assert_eq!(addr("10.1.2.3:1").ip_scope(), IpScope::Private);
        assert_eq!(addr("192.168.0.1:1").ip_scope(), IpScope::Private);
        assert_eq!(addr("172.16.9.9:1").ip_scope(), IpScope::Private);
        assert_eq!(addr("127.0.0.1:1").ip_scope(), IpScope::Loopback);
        assert_eq!(addr("100.64.1.1:1").ip_scope(), IpScope::Shared);
        assert_eq!(addr("169.254.1.1:1").ip_scope(), IpScope::LinkLocal);
        assert_eq!(addr("28.10.0.1:1").ip_scope(), IpScope::PseudoPrivate);
        assert_eq!(addr("203.0.113.7:41000").ip_scope(), IpScope::Global);
        assert_eq!(addr("8.8.8.8:53").ip_scope(), IpScope::Global);
    }

    #[test]
    fn test_scope_v6() {
        assert_eq!(addr("[::1]:1").ip_scope(), IpScope::Loopback);
        assert_eq!(addr("[fe80::1]:1").ip_scope(), IpScope::LinkLocal);
        assert_eq!(addr("[fd00::1]:1").ip_scope(), IpScope::Private);
        assert_eq!(addr("[2001:db8::1]:1").ip_scope(), IpScope::Global);
    }

    #[test]
    fn test_valid_for_path() {
        assert!(addr("10.1.2.3:9993").valid_for_path());
        assert!(addr("203.0.113.7:41000").valid_for_path());
        assert!(addr("100.64.1.1:9993").valid_for_path());
        assert!(addr("[2001:db8::1]:9993").valid_for_path());
        assert!(!addr("[fe80::1]:9993").valid_for_path());
        assert!(!addr("127.0.0.1:9993").valid_for_path());
        assert!(!InetAddress::Nil.valid_for_path());
    }

    #[test]
    fn test_encode_decode_v4() {
        let a = addr("203.0.113.7:41000");
        let mut buf = Vec::new();
        a.encode_to(&mut buf);
        assert_eq!(buf.len(), 7);
        assert_eq!(buf[0], 4);

        let (b, consumed) = InetAddress::decode_from(&buf).unwrap();
        assert_eq!(consumed, 7);
        assert_eq!(a, b);
    }

    #[test]
    fn test_encode_decode_v6_and_nil() {
        let a = addr("[2001:db8::1]:9993");
        let mut buf = Vec::new();
        a.encode_to(&mut buf);
        InetAddress::Nil.encode_to(&mut buf);
        assert_eq!(buf.len(), 20);

        let (b, consumed) = InetAddress::decode_from(&buf).unwrap();
        assert_eq!(consumed, 19);
        assert_eq!(a, b);
        let (c, consumed) = InetAddress::decode_from(&buf[19..]).unwrap();
        assert_eq!(consumed, 1);
        assert!(c.is_nil());
    }

    #[test]
    fn test_decode_errors() {
        assert!(matches!(
            InetAddress::decode_from(&[]),
            Err(InetError::Truncated)
        ));
        assert!(matches!(
            InetAddress::decode_from(&[4, 1, 2]),
            Err(InetError::Truncated)
        ));
        assert!(matches!(
            InetAddress::decode_from(&[9]),
            Err(InetError::UnknownType(9))
        ));
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", addr("10.0.0.1:9993")), "10.0.0.1:9993");
        assert_eq!(format!("{}", addr("[fd00::1]:80")), "[fd00::1]:80");
        assert_eq!(format!("{}", InetAddress::Nil), "(nil)");
    }

    #[test]
    fn test_scope_ordering_is_preference_order() {
        // Private space outranks global, which outranks pseudo-private.
        assert!(IpScope::Private > IpScope::Shared);
        assert!(IpScope::Shared > IpScope::Global);
        assert!(IpScope::Global > IpScope::PseudoPrivate);
    }
}
