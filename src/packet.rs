//! Packet Framing and Armor
//!
//! Wire format of a protocol packet:
//!
//! ```text
//! [0..8)   packet id (also the AEAD nonce seed)
//! [8..13)  destination address
//! [13..18) source address
//! [18]     flags: bit 7 = payload encrypted, bits 0-2 = hops
//! [19]     verb
//! [20..36) MAC (Poly1305 tag)
//! [36..)   payload
//! ```
//!
//! Hops are excluded from the MAC so relays can increment them in flight.
//! HELLO travels with a cleartext payload (MAC only); everything else is
//! encrypted with the per-peer session key.

use crate::identity::{PeerAddress, SessionKey, ADDRESS_LENGTH};
use crate::inet::InetAddress;
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use std::fmt;
use thiserror::Error;

/// Protocol version spoken by this implementation.
pub const PROTO_VERSION: u8 = 5;

/// Largest packet we will emit, including the header.
pub const PROTO_MAX_PACKET_LENGTH: usize = 1444;

/// First protocol version that understands PUSH_DIRECT_PATHS.
pub const PROTO_MIN_PUSH_DIRECT_PATHS: u8 = 5;

pub const IDX_PACKET_ID: usize = 0;
pub const IDX_DEST: usize = 8;
pub const IDX_SOURCE: usize = 13;
pub const IDX_FLAGS: usize = 18;
pub const IDX_VERB: usize = 19;
pub const IDX_MAC: usize = 20;

/// Total header length; the payload starts here.
pub const HEADER_LENGTH: usize = 36;
pub const IDX_PAYLOAD: usize = HEADER_LENGTH;

/// Flag bit: payload is encrypted.
const FLAG_ENCRYPTED: u8 = 0x80;
/// Low bits of the flags byte carry the hop count.
const HOPS_MASK: u8 = 0x07;

const MAC_LENGTH: usize = 16;

/// Errors related to packet framing and armoring.
#[derive(Debug, Error)]
pub enum PacketError {
    #[error("packet too short: {0} bytes")]
    TooShort(usize),

    #[error("read past end of packet")]
    Truncated,

    #[error("message authentication failed")]
    MacFailed,

    #[error("cipher failure")]
    CipherFailed,
}

// ============================================================================
// Verb
// ============================================================================

/// One-byte opcode identifying a packet's semantic type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Verb {
    Nop = 0x00,
    Hello = 0x01,
    Error = 0x02,
    Ok = 0x03,
    Whois = 0x04,
    Rendezvous = 0x05,
    Frame = 0x06,
    ExtFrame = 0x07,
    Echo = 0x08,
    MulticastLike = 0x09,
    NetworkMembershipCertificate = 0x0a,
    NetworkConfigRequest = 0x0b,
    NetworkConfigRefresh = 0x0c,
    MulticastGather = 0x0d,
    MulticastFrame = 0x0e,
    PushDirectPaths = 0x10,
}

impl Verb {
    /// Try to convert from a byte.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x00 => Some(Verb::Nop),
            0x01 => Some(Verb::Hello),
            0x02 => Some(Verb::Error),
            0x03 => Some(Verb::Ok),
            0x04 => Some(Verb::Whois),
            0x05 => Some(Verb::Rendezvous),
            0x06 => Some(Verb::Frame),
            0x07 => Some(Verb::ExtFrame),
            0x08 => Some(Verb::Echo),
            0x09 => Some(Verb::MulticastLike),
            0x0a => Some(Verb::NetworkMembershipCertificate),
            0x0b => Some(Verb::NetworkConfigRequest),
            0x0c => Some(Verb::NetworkConfigRefresh),
            0x0d => Some(Verb::MulticastGather),
            0x0e => Some(Verb::MulticastFrame),
            0x10 => Some(Verb::PushDirectPaths),
            _ => None,
        }
    }

    /// Convert to a byte.
    pub fn to_byte(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Verb::Nop => "NOP",
            Verb::Hello => "HELLO",
            Verb::Error => "ERROR",
            Verb::Ok => "OK",
            Verb::Whois => "WHOIS",
            Verb::Rendezvous => "RENDEZVOUS",
            Verb::Frame => "FRAME",
            Verb::ExtFrame => "EXT_FRAME",
            Verb::Echo => "ECHO",
            Verb::MulticastLike => "MULTICAST_LIKE",
            Verb::NetworkMembershipCertificate => "NETWORK_MEMBERSHIP_CERTIFICATE",
            Verb::NetworkConfigRequest => "NETWORK_CONFIG_REQUEST",
            Verb::NetworkConfigRefresh => "NETWORK_CONFIG_REFRESH",
            Verb::MulticastGather => "MULTICAST_GATHER",
            Verb::MulticastFrame => "MULTICAST_FRAME",
            Verb::PushDirectPaths => "PUSH_DIRECT_PATHS",
        };
        write!(f, "{}", name)
    }
}

// ============================================================================
// Packet
// ============================================================================

/// A protocol packet under construction or freshly received.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    buf: Vec<u8>,
}

impl Packet {
    /// Create an outbound packet with a random id.
    pub fn new(dest: PeerAddress, source: PeerAddress, verb: Verb) -> Self {
        let mut id_bytes = [0u8; 8];
        rand::Rng::fill_bytes(&mut rand::rng(), &mut id_bytes);
        Self::with_packet_id(u64::from_be_bytes(id_bytes), dest, source, verb)
    }

    /// Create an outbound packet with an explicit id.
    pub fn with_packet_id(packet_id: u64, dest: PeerAddress, source: PeerAddress, verb: Verb) -> Self {
        let mut buf = vec![0u8; HEADER_LENGTH];
        buf[IDX_PACKET_ID..IDX_PACKET_ID + 8].copy_from_slice(&packet_id.to_be_bytes());
        buf[IDX_DEST..IDX_DEST + ADDRESS_LENGTH].copy_from_slice(dest.as_bytes());
        buf[IDX_SOURCE..IDX_SOURCE + ADDRESS_LENGTH].copy_from_slice(source.as_bytes());
        buf[IDX_VERB] = verb.to_byte();
        Self { buf }
    }

    /// Wrap received bytes; fails when shorter than a header.
    pub fn from_bytes(buf: Vec<u8>) -> Result<Self, PacketError> {
        if buf.len() < HEADER_LENGTH {
            return Err(PacketError::TooShort(buf.len()));
        }
        Ok(Self { buf })
    }

    pub fn packet_id(&self) -> u64 {
        let mut b = [0u8; 8];
        b.copy_from_slice(&self.buf[IDX_PACKET_ID..IDX_PACKET_ID + 8]);
        u64::from_be_bytes(b)
    }

    pub fn destination(&self) -> PeerAddress {
        let mut b = [0u8; ADDRESS_LENGTH];
        b.copy_from_slice(&self.buf[IDX_DEST..IDX_DEST + ADDRESS_LENGTH]);
        PeerAddress::from_bytes(b)
    }

    pub fn source(&self) -> PeerAddress {
        let mut b = [0u8; ADDRESS_LENGTH];
        b.copy_from_slice(&self.buf[IDX_SOURCE..IDX_SOURCE + ADDRESS_LENGTH]);
        PeerAddress::from_bytes(b)
    }

    /// The verb, if the byte names a known one.
    pub fn verb(&self) -> Option<Verb> {
        Verb::from_byte(self.buf[IDX_VERB])
    }

    pub fn raw_verb(&self) -> u8 {
        self.buf[IDX_VERB]
    }

    pub fn hops(&self) -> u8 {
        self.buf[IDX_FLAGS] & HOPS_MASK
    }

    /// Increment the hop count; saturates at the field width.
    pub fn increment_hops(&mut self) {
        let flags = self.buf[IDX_FLAGS];
        let hops = (flags & HOPS_MASK).saturating_add(1).min(HOPS_MASK);
        self.buf[IDX_FLAGS] = (flags & !HOPS_MASK) | hops;
    }

    pub fn is_encrypted(&self) -> bool {
        (self.buf[IDX_FLAGS] & FLAG_ENCRYPTED) != 0
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Payload bytes after the header.
    pub fn payload(&self) -> &[u8] {
        &self.buf[IDX_PAYLOAD..]
    }

    // === Append helpers (outbound construction) ===

    pub fn append_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn append_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn append_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn append_bytes(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }

    /// Reserve `n` zero bytes and return their offset, for length or count
    /// fields finalized later via `set_u16_at`.
    pub fn add_size(&mut self, n: usize) -> usize {
        let at = self.buf.len();
        self.buf.resize(at + n, 0);
        at
    }

    pub fn set_u16_at(&mut self, at: usize, v: u16) {
        self.buf[at..at + 2].copy_from_slice(&v.to_be_bytes());
    }

    // === Read helpers (inbound parsing) ===

    pub fn u8_at(&self, at: usize) -> Result<u8, PacketError> {
        self.buf.get(at).copied().ok_or(PacketError::Truncated)
    }

    pub fn u16_at(&self, at: usize) -> Result<u16, PacketError> {
        let s = self.buf.get(at..at + 2).ok_or(PacketError::Truncated)?;
        Ok(u16::from_be_bytes([s[0], s[1]]))
    }

    pub fn u64_at(&self, at: usize) -> Result<u64, PacketError> {
        let s = self.buf.get(at..at + 8).ok_or(PacketError::Truncated)?;
        let mut b = [0u8; 8];
        b.copy_from_slice(s);
        Ok(u64::from_be_bytes(b))
    }

    pub fn bytes_at(&self, at: usize, len: usize) -> Result<&[u8], PacketError> {
        self.buf.get(at..at + len).ok_or(PacketError::Truncated)
    }

    // === Armor ===

    /// Authenticate (and optionally encrypt) this packet with a session key.
    ///
    /// With `encrypt` the payload is replaced by ciphertext; without it the
    /// payload stays cleartext and is authenticated as associated data.
    pub fn armor(&mut self, key: &SessionKey, encrypt: bool) -> Result<(), PacketError> {
        if encrypt {
            self.buf[IDX_FLAGS] |= FLAG_ENCRYPTED;
        } else {
            self.buf[IDX_FLAGS] &= !FLAG_ENCRYPTED;
        }

        let cipher = ChaCha20Poly1305::new_from_slice(key.as_bytes())
            .map_err(|_| PacketError::CipherFailed)?;
        let nonce = self.nonce();

        let mac: [u8; MAC_LENGTH] = if encrypt {
            let aad = self.masked_header();
            let ct = cipher
                .encrypt(
                    &nonce,
                    Payload {
                        msg: &self.buf[IDX_PAYLOAD..],
                        aad: &aad,
                    },
                )
                .map_err(|_| PacketError::CipherFailed)?;
            let split = ct.len() - MAC_LENGTH;
            self.buf.truncate(IDX_PAYLOAD);
            self.buf.extend_from_slice(&ct[..split]);
            let mut mac = [0u8; MAC_LENGTH];
            mac.copy_from_slice(&ct[split..]);
            mac
        } else {
            let mut aad = self.masked_header();
            aad.extend_from_slice(&self.buf[IDX_PAYLOAD..]);
            let tag = cipher
                .encrypt(&nonce, Payload { msg: &[], aad: &aad })
                .map_err(|_| PacketError::CipherFailed)?;
            let mut mac = [0u8; MAC_LENGTH];
            mac.copy_from_slice(&tag);
            mac
        };

        self.buf[IDX_MAC..IDX_MAC + MAC_LENGTH].copy_from_slice(&mac);
        Ok(())
    }

    /// Verify the MAC and decrypt the payload in place.
    ///
    /// On success the payload is cleartext and the encrypted flag cleared.
    /// Failure leaves the packet unusable for further processing.
    pub fn dearmor(&mut self, key: &SessionKey) -> Result<(), PacketError> {
        let cipher = ChaCha20Poly1305::new_from_slice(key.as_bytes())
            .map_err(|_| PacketError::CipherFailed)?;
        let nonce = self.nonce();
        let mac = &self.buf[IDX_MAC..IDX_MAC + MAC_LENGTH];

        if self.is_encrypted() {
            let mut ct = Vec::with_capacity(self.buf.len() - IDX_PAYLOAD + MAC_LENGTH);
            ct.extend_from_slice(&self.buf[IDX_PAYLOAD..]);
            ct.extend_from_slice(mac);
            let aad = self.masked_header();
            let pt = cipher
                .decrypt(&nonce, Payload { msg: &ct, aad: &aad })
                .map_err(|_| PacketError::MacFailed)?;
            self.buf.truncate(IDX_PAYLOAD);
            self.buf.extend_from_slice(&pt);
            self.buf[IDX_FLAGS] &= !FLAG_ENCRYPTED;
            Ok(())
        } else {
            let mut aad = self.masked_header();
            aad.extend_from_slice(&self.buf[IDX_PAYLOAD..]);
            cipher
                .decrypt(&nonce, Payload { msg: mac, aad: &aad })
                .map(|_| ())
                .map_err(|_| PacketError::MacFailed)
        }
    }

    /// Nonce for this packet: the packet id padded to 12 bytes.
    fn nonce(&self) -> Nonce {
        let mut bytes = [0u8; 12];
        bytes[..8].copy_from_slice(&self.buf[IDX_PACKET_ID..IDX_PACKET_ID + 8]);
        *Nonce::from_slice(&bytes)
    }

    /// Header bytes covered by the MAC, with hops zeroed so relays can
    /// mutate them without invalidating authentication.
    fn masked_header(&self) -> Vec<u8> {
        let mut h = self.buf[..IDX_MAC].to_vec();
        h[IDX_FLAGS] &= !HOPS_MASK;
        h
    }
}

// ============================================================================
// IncomingPacket
// ============================================================================

/// A received datagram with its endpoint pair and receipt time, as handed
/// to the deferred queue and the decode path.
#[derive(Clone, Debug)]
pub struct IncomingPacket {
    pub packet: Packet,
    /// Local endpoint the datagram arrived on.
    pub local: InetAddress,
    /// Remote endpoint it came from.
    pub remote: InetAddress,
    /// Receipt timestamp (milliseconds).
    pub received_at: u64,
}

impl IncomingPacket {
    pub fn new(
        packet: Packet,
        local: InetAddress,
        remote: InetAddress,
        received_at: u64,
    ) -> Self {
        Self {
            packet,
            local,
            remote,
            received_at,
        }
    }
}
