//! Network Membership Certificates
//!
//! A membership certificate is a signed token from a network's controller
//! attesting that a node may participate in that network. The controller
//! for a network is not configured anywhere: its address is the top 40
//! bits of the network id, so any node can check who is allowed to sign.

use crate::identity::{Identity, PeerAddress, PeerIdentity, ADDRESS_LENGTH};
use secp256k1::schnorr::Signature;
use secp256k1::Secp256k1;
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;

/// Default agreement window carried in newly issued certificates
/// (milliseconds). Two certs for the same network "agree" when their
/// timestamps differ by no more than this.
pub const DEFAULT_TIMESTAMP_MAX_DELTA: u64 = 120_000;

/// Serialized length: nwid + ts + delta + two addresses + signature.
const CERT_LENGTH: usize = 8 + 8 + 8 + 2 * ADDRESS_LENGTH + 64;

/// Errors related to membership certificates.
#[derive(Debug, Error)]
pub enum CertError {
    #[error("truncated serialized certificate")]
    Truncated,

    #[error("malformed signature: {0}")]
    MalformedSignature(#[from] secp256k1::Error),
}

/// A signed network membership certificate.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct MembershipCert {
    network_id: u64,
    timestamp: u64,
    timestamp_max_delta: u64,
    issued_to: PeerAddress,
    signed_by: PeerAddress,
    signature: Signature,
}

/// The address authorized to sign certificates for a network: the top 40
/// bits of the network id.
pub fn controller_for(network_id: u64) -> PeerAddress {
    PeerAddress::from_u64(network_id >> 24)
}

impl MembershipCert {
    /// Issue and sign a certificate with the given identity.
    ///
    /// The signer should be the controller of `network_id`; receivers will
    /// reject certificates signed by anyone else.
    pub fn sign(
        signer: &Identity,
        network_id: u64,
        timestamp: u64,
        issued_to: PeerAddress,
    ) -> Self {
        let signed_by = signer.address();
        let digest = signing_digest(
            network_id,
            timestamp,
            DEFAULT_TIMESTAMP_MAX_DELTA,
            issued_to,
            signed_by,
        );
        Self {
            network_id,
            timestamp,
            timestamp_max_delta: DEFAULT_TIMESTAMP_MAX_DELTA,
            issued_to,
            signed_by,
            signature: signer.sign(&digest),
        }
    }

    pub fn network_id(&self) -> u64 {
        self.network_id
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn issued_to(&self) -> PeerAddress {
        self.issued_to
    }

    pub fn signed_by(&self) -> PeerAddress {
        self.signed_by
    }

    /// Verify the signature against a claimed signer identity.
    ///
    /// The caller must separately check that the signer is the controller
    /// for this certificate's network.
    pub fn verify(&self, signer: &PeerIdentity) -> bool {
        if signer.address() != self.signed_by {
            return false;
        }
        let digest = signing_digest(
            self.network_id,
            self.timestamp,
            self.timestamp_max_delta,
            self.issued_to,
            self.signed_by,
        );
        let secp = Secp256k1::new();
        secp.verify_schnorr(&self.signature, &digest, &signer.xonly_pubkey())
            .is_ok()
    }

    /// Whether another certificate agrees with this one: same network and
    /// timestamps within this certificate's agreement window.
    pub fn agrees_with(&self, other: &MembershipCert) -> bool {
        self.network_id == other.network_id
            && self.timestamp.abs_diff(other.timestamp) <= self.timestamp_max_delta
    }

    /// Append the wire encoding to a buffer.
    pub fn encode_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.network_id.to_be_bytes());
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        out.extend_from_slice(&self.timestamp_max_delta.to_be_bytes());
        out.extend_from_slice(self.issued_to.as_bytes());
        out.extend_from_slice(self.signed_by.as_bytes());
        out.extend_from_slice(self.signature.as_ref());
    }

    /// Decode from the wire, returning the certificate and bytes consumed.
    pub fn decode_from(data: &[u8]) -> Result<(Self, usize), CertError> {
        if data.len() < CERT_LENGTH {
            return Err(CertError::Truncated);
        }
        let mut at = 0;
        let mut read_u64 = |data: &[u8]| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&data[at..at + 8]);
            at += 8;
            u64::from_be_bytes(b)
        };
        let network_id = read_u64(data);
        let timestamp = read_u64(data);
        let timestamp_max_delta = read_u64(data);

        let mut addr = [0u8; ADDRESS_LENGTH];
        addr.copy_from_slice(&data[at..at + ADDRESS_LENGTH]);
        let issued_to = PeerAddress::from_bytes(addr);
        at += ADDRESS_LENGTH;
        addr.copy_from_slice(&data[at..at + ADDRESS_LENGTH]);
        let signed_by = PeerAddress::from_bytes(addr);
        at += ADDRESS_LENGTH;

        let signature = Signature::from_slice(&data[at..at + 64])?;
        at += 64;

        Ok((
            Self {
                network_id,
                timestamp,
                timestamp_max_delta,
                issued_to,
                signed_by,
                signature,
            },
            at,
        ))
    }
}

fn signing_digest(
    network_id: u64,
    timestamp: u64,
    timestamp_max_delta: u64,
    issued_to: PeerAddress,
    signed_by: PeerAddress,
) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"ovn/1 membership cert");
    hasher.update(network_id.to_be_bytes());
    hasher.update(timestamp.to_be_bytes());
    hasher.update(timestamp_max_delta.to_be_bytes());
    hasher.update(issued_to.as_bytes());
    hasher.update(signed_by.as_bytes());
    hasher.finalize().into()
}

impl fmt::Debug for MembershipCert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MembershipCert(nwid={:016x}, ts={}, issued_to={}, signed_by={})",
            self.network_id, self.timestamp, self.issued_to, self.signed_by
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // A network id whose controller is the given identity.
    fn network_of(controller: &Identity, n: u32) -> u64 {
        (controller.address().as_u64() << 24) | (n as u64)
    }

    #[test]
    fn test_controller_derivation() {
        let controller = Identity::generate();
        let nwid = network_of(&controller, 7);
        assert_eq!(controller_for(nwid), controller.address());
    }

    #[test]
    fn test_sign_and_verify() {
        let controller = Identity::generate();
        let member = Identity::generate();
        let nwid = network_of(&controller, 1);

        let cert = MembershipCert::sign(&controller, nwid, 5000, member.address());
        assert!(cert.verify(controller.public()));
        assert_eq!(cert.issued_to(), member.address());
        assert_eq!(cert.signed_by(), controller.address());
    }

    #[test]
    fn test_verify_rejects_wrong_signer() {
        let controller = Identity::generate();
        let imposter = Identity::generate();
        let member = Identity::generate();
        let nwid = network_of(&controller, 1);

        let cert = MembershipCert::sign(&controller, nwid, 5000, member.address());
        assert!(!cert.verify(imposter.public()));
    }

    #[test]
    fn test_agreement_window() {
        let controller = Identity::generate();
        let member = Identity::generate();
        let nwid = network_of(&controller, 1);

        let a = MembershipCert::sign(&controller, nwid, 100_000, member.address());
        let close = MembershipCert::sign(&controller, nwid, 100_000 + DEFAULT_TIMESTAMP_MAX_DELTA, member.address());
        let far = MembershipCert::sign(
            &controller,
            nwid,
            100_000 + DEFAULT_TIMESTAMP_MAX_DELTA + 1,
            member.address(),
        );
        let other_net = MembershipCert::sign(&controller, nwid + 1, 100_000, member.address());

        assert!(a.agrees_with(&close));
        assert!(!a.agrees_with(&far));
        assert!(!a.agrees_with(&other_net));
    }

    #[test]
    fn test_serialization_round_trip() {
        let controller = Identity::generate();
        let member = Identity::generate();
        let nwid = network_of(&controller, 1);

        let cert = MembershipCert::sign(&controller, nwid, 5000, member.address());
        let mut buf = Vec::new();
        cert.encode_to(&mut buf);
        assert_eq!(buf.len(), CERT_LENGTH);

        let (decoded, consumed) = MembershipCert::decode_from(&buf).unwrap();
        assert_eq!(consumed, CERT_LENGTH);
        assert_eq!(decoded, cert);
        assert!(decoded.verify(controller.public()));
    }

    #[test]
    fn test_decode_truncated() {
        assert!(matches!(
            MembershipCert::decode_from(&[0u8; CERT_LENGTH - 1]),
            Err(CertError::Truncated)
        ));
    }
}
