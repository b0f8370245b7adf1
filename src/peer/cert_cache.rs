//! Per-Peer Certificate Cache
//!
//! Tracks two things for one peer: our view of the peer's network
//! membership certificates (`network id -> (timestamp, cert)`), and when
//! we last pushed our own certificate to the peer per network. Both maps
//! are pruned by `clean`.

use super::NETWORK_AUTOCONF_DELAY;
use crate::cert::MembershipCert;
use std::collections::HashMap;

/// Certificates older than this are expired by `clean` once the node has
/// left the network (milliseconds).
pub const PEER_NETWORK_COM_EXPIRATION: u64 = 3 * NETWORK_AUTOCONF_DELAY;

/// A cached membership certificate with its validation time.
#[derive(Clone, Debug)]
pub struct CachedCom {
    /// When the cert was last validated.
    pub timestamp: u64,
    pub cert: MembershipCert,
}

/// Membership certificate bookkeeping for one peer.
#[derive(Default)]
pub struct CertCache {
    coms: HashMap<u64, CachedCom>,
    last_pushed: HashMap<u64, u64>,
}

impl CertCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The cached cert for a network, if any.
    pub fn com(&self, network_id: u64) -> Option<&CachedCom> {
        self.coms.get(&network_id)
    }

    /// Mutable access, for touching the timestamp on re-validation.
    pub fn com_mut(&mut self, network_id: u64) -> Option<&mut CachedCom> {
        self.coms.get_mut(&network_id)
    }

    /// Store or replace the cert for a network.
    pub fn set_com(&mut self, network_id: u64, now: u64, cert: MembershipCert) {
        self.coms.insert(
            network_id,
            CachedCom {
                timestamp: now,
                cert,
            },
        );
    }

    /// Whether we owe the peer a fresh push of our own certificate.
    ///
    /// Reads the last push time (default 0) and answers whether half the
    /// autoconf delay has passed. With `update_last_pushed` the stamp is
    /// set to `now` in the same step; the read and the update must not be
    /// split across locks.
    pub fn needs_push(&mut self, network_id: u64, now: u64, update_last_pushed: bool) -> bool {
        let last = self.last_pushed.entry(network_id).or_insert(0);
        let prev = *last;
        if update_last_pushed {
            *last = now;
        }
        now.saturating_sub(prev) >= NETWORK_AUTOCONF_DELAY / 2
    }

    /// Prune both maps.
    ///
    /// A cached cert goes away only when the node is no longer a member of
    /// its network and the cert has aged past expiration. Push stamps go
    /// away after twice the autoconf delay.
    pub fn clean(&mut self, now: u64, still_member: impl Fn(u64) -> bool) {
        self.coms.retain(|network_id, entry| {
            still_member(*network_id)
                || now.saturating_sub(entry.timestamp) < PEER_NETWORK_COM_EXPIRATION
        });
        self.last_pushed
            .retain(|_, stamp| now.saturating_sub(*stamp) <= 2 * NETWORK_AUTOCONF_DELAY);
    }

    /// Number of cached certificates.
    pub fn com_count(&self) -> usize {
        self.coms.len()
    }

    /// Number of tracked push stamps.
    pub fn push_stamp_count(&self) -> usize {
        self.last_pushed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;

    fn cert_for(nwid: u64) -> MembershipCert {
        let controller = Identity::generate();
        let member = Identity::generate();
        MembershipCert::sign(&controller, nwid, 1000, member.address())
    }

    #[test]
    fn test_set_and_touch() {
        let mut cache = CertCache::new();
        let cert = cert_for(42);

        cache.set_com(42, 1000, cert);
        assert_eq!(cache.com(42).unwrap().timestamp, 1000);

        cache.com_mut(42).unwrap().timestamp = 2000;
        assert_eq!(cache.com(42).unwrap().timestamp, 2000);
        assert_eq!(cache.com(42).unwrap().cert, cert);
    }

    #[test]
    fn test_needs_push_interval() {
        let mut cache = CertCache::new();
        let half = NETWORK_AUTOCONF_DELAY / 2;

        // Never pushed: due immediately.
        assert!(cache.needs_push(1, half, false));

        // Update the stamp; an immediate re-ask at the same time is not due.
        assert!(cache.needs_push(1, half, true));
        assert!(!cache.needs_push(1, half, true));

        // Due again exactly half a delay later.
        assert!(!cache.needs_push(1, half * 2 - 1, false));
        assert!(cache.needs_push(1, half * 2, false));
    }

    #[test]
    fn test_clean_keeps_member_networks() {
        let mut cache = CertCache::new();
        cache.set_com(1, 0, cert_for(1));
        cache.set_com(2, 0, cert_for(2));

        let far = PEER_NETWORK_COM_EXPIRATION + 1;
        cache.clean(far, |nwid| nwid == 1);

        assert!(cache.com(1).is_some());
        assert!(cache.com(2).is_none());
    }

    #[test]
    fn test_clean_keeps_fresh_certs_of_left_networks() {
        let mut cache = CertCache::new();
        cache.set_com(1, 1000, cert_for(1));

        cache.clean(1000 + PEER_NETWORK_COM_EXPIRATION - 1, |_| false);
        assert!(cache.com(1).is_some());

        cache.clean(1000 + PEER_NETWORK_COM_EXPIRATION, |_| false);
        assert!(cache.com(1).is_none());
    }

    #[test]
    fn test_clean_expires_push_stamps() {
        let mut cache = CertCache::new();
        cache.needs_push(7, 1000, true);
        assert_eq!(cache.push_stamp_count(), 1);

        cache.clean(1000 + 2 * NETWORK_AUTOCONF_DELAY, |_| true);
        assert_eq!(cache.push_stamp_count(), 1);

        cache.clean(1001 + 2 * NETWORK_AUTOCONF_DELAY, |_| true);
        assert_eq!(cache.push_stamp_count(), 0);
    }
}
