//! Node Identity
//!
//! Every node is identified by a secp256k1 keypair and a 40-bit address
//! derived from the public key hash. `Identity` is the local node (holds
//! the secret key and can sign); `PeerIdentity` is a remote node's public
//! half. Key agreement between the two produces the symmetric session key
//! used to armor packets for that peer.

use hkdf::Hkdf;
use secp256k1::ecdh::shared_secret_point;
use secp256k1::{Keypair, PublicKey, Secp256k1, SecretKey, XOnlyPublicKey};
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Length of a node address in bytes (40 bits).
pub const ADDRESS_LENGTH: usize = 5;

/// Length of a serialized public identity: address + compressed pubkey.
pub const IDENTITY_LENGTH: usize = ADDRESS_LENGTH + 33;

/// Length of a derived session key.
pub const SESSION_KEY_LENGTH: usize = 32;

/// Address prefix reserved for future use; identities hashing to it are
/// regenerated.
const RESERVED_ADDRESS_PREFIX: u8 = 0xff;

/// Errors related to identities and addresses.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("invalid secret key: {0}")]
    InvalidSecretKey(#[from] secp256k1::Error),

    #[error("invalid secret key hex")]
    InvalidSecretHex,

    #[error("truncated serialized identity")]
    Truncated,

    #[error("address does not match public key")]
    AddressMismatch,

    #[error("address uses reserved prefix")]
    ReservedAddress,

    #[error("key agreement failed")]
    AgreementFailed,
}

// ============================================================================
// PeerAddress
// ============================================================================

/// 40-bit node address derived from the public key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerAddress([u8; ADDRESS_LENGTH]);

impl PeerAddress {
    /// Build from raw bytes.
    pub fn from_bytes(bytes: [u8; ADDRESS_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Build from the low 40 bits of a u64.
    pub fn from_u64(v: u64) -> Self {
        let b = v.to_be_bytes();
        Self([b[3], b[4], b[5], b[6], b[7]])
    }

    /// Derive from a compressed public key.
    pub fn from_pubkey(pubkey: &PublicKey) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(pubkey.serialize());
        let hash = hasher.finalize();
        let mut bytes = [0u8; ADDRESS_LENGTH];
        bytes.copy_from_slice(&hash[..ADDRESS_LENGTH]);
        Self(bytes)
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; ADDRESS_LENGTH] {
        &self.0
    }

    /// Value as u64 (low 40 bits).
    pub fn as_u64(&self) -> u64 {
        let b = &self.0;
        ((b[0] as u64) << 32)
            | ((b[1] as u64) << 24)
            | ((b[2] as u64) << 16)
            | ((b[3] as u64) << 8)
            | (b[4] as u64)
    }

    /// Check for the reserved prefix or the all-zero address, neither of
    /// which identifies a real node.
    pub fn is_reserved(&self) -> bool {
        self.0[0] == RESERVED_ADDRESS_PREFIX || self.as_u64() == 0
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:010x}", self.as_u64())
    }
}

impl fmt::Debug for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerAddress({})", self)
    }
}

// ============================================================================
// SessionKey
// ============================================================================

/// Symmetric key shared with one peer, derived once by key agreement.
///
/// Zeroed on drop; the zeroing survives dead-store elimination.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; SESSION_KEY_LENGTH]);

impl SessionKey {
    /// Wrap raw key material.
    pub fn from_bytes(bytes: [u8; SESSION_KEY_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; SESSION_KEY_LENGTH] {
        &self.0
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print key material.
        write!(f, "SessionKey(..)")
    }
}

// ============================================================================
// PeerIdentity
// ============================================================================

/// The public half of a remote node's identity.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PeerIdentity {
    pubkey: PublicKey,
    address: PeerAddress,
}

impl PeerIdentity {
    /// Build from a public key; the address is derived.
    pub fn from_pubkey(pubkey: PublicKey) -> Result<Self, IdentityError> {
        let address = PeerAddress::from_pubkey(&pubkey);
        if address.is_reserved() {
            return Err(IdentityError::ReservedAddress);
        }
        Ok(Self { pubkey, address })
    }

    /// The node address.
    pub fn address(&self) -> PeerAddress {
        self.address
    }

    /// The full public key.
    pub fn pubkey(&self) -> PublicKey {
        self.pubkey
    }

    /// The x-only public key (for Schnorr verification).
    pub fn xonly_pubkey(&self) -> XOnlyPublicKey {
        self.pubkey.x_only_public_key().0
    }

    /// Serialize: address followed by the compressed public key.
    pub fn encode_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.address.as_bytes());
        out.extend_from_slice(&self.pubkey.serialize());
    }

    /// Decode from the wire, returning the identity and bytes consumed.
    ///
    /// The embedded address must match the one derived from the key, so a
    /// forged identity cannot claim another node's address.
    pub fn decode_from(data: &[u8]) -> Result<(Self, usize), IdentityError> {
        if data.len() < IDENTITY_LENGTH {
            return Err(IdentityError::Truncated);
        }
        let mut addr_bytes = [0u8; ADDRESS_LENGTH];
        addr_bytes.copy_from_slice(&data[..ADDRESS_LENGTH]);
        let pubkey = PublicKey::from_slice(&data[ADDRESS_LENGTH..IDENTITY_LENGTH])?;
        let identity = Self::from_pubkey(pubkey)?;
        if identity.address != PeerAddress::from_bytes(addr_bytes) {
            return Err(IdentityError::AddressMismatch);
        }
        Ok((identity, IDENTITY_LENGTH))
    }
}

impl fmt::Debug for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerIdentity({})", self.address)
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address)
    }
}

// ============================================================================
// Identity
// ============================================================================

/// The local node's identity: keypair plus derived address.
pub struct Identity {
    keypair: Keypair,
    public: PeerIdentity,
}

impl Identity {
    /// Create a new random identity.
    ///
    /// Regenerates until the derived address avoids the reserved prefix.
    pub fn generate() -> Self {
        loop {
            let mut secret_bytes = [0u8; 32];
            rand::Rng::fill_bytes(&mut rand::rng(), &mut secret_bytes);
            let Ok(secret_key) = SecretKey::from_slice(&secret_bytes) else {
                continue;
            };
            secret_bytes.zeroize();
            if let Ok(identity) = Self::from_secret_key(secret_key) {
                return identity;
            }
        }
    }

    /// Create from an existing secret key.
    pub fn from_secret_key(secret_key: SecretKey) -> Result<Self, IdentityError> {
        let secp = Secp256k1::new();
        let keypair = Keypair::from_secret_key(&secp, &secret_key);
        let public = PeerIdentity::from_pubkey(keypair.public_key())?;
        Ok(Self { keypair, public })
    }

    /// Create from a hex-encoded secret key.
    pub fn from_secret_hex(s: &str) -> Result<Self, IdentityError> {
        if s.len() != 64 || !s.is_ascii() {
            return Err(IdentityError::InvalidSecretHex);
        }
        let mut bytes = [0u8; 32];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
                .map_err(|_| IdentityError::InvalidSecretHex)?;
        }
        let secret_key = SecretKey::from_slice(&bytes)?;
        bytes.zeroize();
        Self::from_secret_key(secret_key)
    }

    /// The node address.
    pub fn address(&self) -> PeerAddress {
        self.public.address()
    }

    /// The public half of this identity.
    pub fn public(&self) -> &PeerIdentity {
        &self.public
    }

    /// Sign a digest with this identity's key.
    pub fn sign(&self, digest: &[u8; 32]) -> secp256k1::schnorr::Signature {
        let secp = Secp256k1::new();
        secp.sign_schnorr(digest, &self.keypair)
    }

    /// Derive the symmetric session key shared with a peer.
    ///
    /// ECDH over the static keys, hashing only the x-coordinate so both
    /// sides derive the same secret, then HKDF-SHA256 expansion.
    pub fn agree(&self, other: &PeerIdentity) -> Result<SessionKey, IdentityError> {
        let point = shared_secret_point(&other.pubkey(), &self.keypair.secret_key());
        let mut hasher = Sha256::new();
        hasher.update(&point[..32]);
        let ikm = hasher.finalize();

        let hk = Hkdf::<Sha256>::new(None, &ikm);
        let mut okm = [0u8; SESSION_KEY_LENGTH];
        hk.expand(b"ovn/1 session key", &mut okm)
            .map_err(|_| IdentityError::AgreementFailed)?;
        Ok(SessionKey::from_bytes(okm))
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({})", self.address())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_round_trip_u64() {
        let a = PeerAddress::from_u64(0x12_3456_789a);
        assert_eq!(a.as_u64(), 0x12_3456_789a);
        assert_eq!(format!("{}", a), "123456789a");
    }

    #[test]
    fn test_address_reserved() {
        assert!(PeerAddress::from_bytes([0xff, 1, 2, 3, 4]).is_reserved());
        assert!(PeerAddress::from_u64(0).is_reserved());
        assert!(!PeerAddress::from_u64(1).is_reserved());
    }

    #[test]
    fn test_generate_has_valid_address() {
        let identity = Identity::generate();
        assert!(!identity.address().is_reserved());
    }

    #[test]
    fn test_identity_serialization_round_trip() {
        let identity = Identity::generate();
        let mut buf = Vec::new();
        identity.public().encode_to(&mut buf);
        assert_eq!(buf.len(), IDENTITY_LENGTH);

        let (decoded, consumed) = PeerIdentity::decode_from(&buf).unwrap();
        assert_eq!(consumed, IDENTITY_LENGTH);
        assert_eq!(decoded.address(), identity.address());
        assert_eq!(decoded.pubkey(), identity.public().pubkey());
    }

    #[test]
    fn test_identity_decode_rejects_forged_address() {
        let identity = Identity::generate();
        let mut buf = Vec::new();
        identity.public().encode_to(&mut buf);
        buf[0] ^= 0x01; // tamper with the claimed address
        assert!(matches!(
            PeerIdentity::decode_from(&buf),
            Err(IdentityError::AddressMismatch)
        ));
    }

    #[test]
    fn test_agreement_is_symmetric() {
        let a = Identity::generate();
        let b = Identity::generate();

        let key_ab = a.agree(b.public()).unwrap();
        let key_ba = b.agree(a.public()).unwrap();
        assert_eq!(key_ab.as_bytes(), key_ba.as_bytes());

        let c = Identity::generate();
        let key_ac = a.agree(c.public()).unwrap();
        assert_ne!(key_ab.as_bytes(), key_ac.as_bytes());
    }

    #[test]
    fn test_from_secret_hex_rejects_bad_input() {
        assert!(Identity::from_secret_hex("zz").is_err());
        // All-zero bytes are not a valid secp256k1 secret key.
        assert!(Identity::from_secret_hex(&"00".repeat(32)).is_err());
    }

    #[test]
    fn test_sign_verifies_with_xonly_key() {
        let identity = Identity::generate();
        let digest = [7u8; 32];
        let sig = identity.sign(&digest);
        let secp = Secp256k1::new();
        assert!(secp
            .verify_schnorr(&sig, &digest, &identity.public().xonly_pubkey())
            .is_ok());
    }
}
