//! Peer Record and Path Management
//!
//! A `Peer` is everything this node knows about one remote participant:
//! its verified identity, the symmetric session key agreed at
//! construction, a small array of candidate network paths ranked by
//! quality, liveness timestamps, and cached network membership
//! certificates.
//!
//! All mutable state sits behind one lock per peer. The identity and the
//! session key are immutable and read lock-free. Tiny control sends
//! (HELLO, NAT keepalive) may happen under the lock so their send
//! timestamps stay atomic with path state; bulk traffic must not.

mod cert_cache;

pub use cert_cache::{CachedCom, CertCache, PEER_NETWORK_COM_EXPIRATION};

use crate::cert::{controller_for, MembershipCert};
use crate::identity::{Identity, IdentityError, PeerIdentity, SessionKey};
use crate::inet::{Family, InetAddress, IpScope};
use crate::packet::{
    Packet, Verb, PROTO_MAX_PACKET_LENGTH, PROTO_MIN_PUSH_DIRECT_PATHS, PROTO_VERSION,
};
use crate::path::Path;
use crate::runtime::Runtime;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tracing::debug;

/// Maximum candidate paths kept per peer.
pub const MAX_PATHS: usize = 8;

/// Paths are lazily re-sorted no more often than this (milliseconds).
pub const PATH_SORT_INTERVAL: u64 = 5_000;

/// Send a HELLO over a path quiet for this long (milliseconds).
pub const PEER_DIRECT_PING_DELAY: u64 = 120_000;

/// Send a NAT keepalive over an unreliable path idle this long
/// (milliseconds).
pub const NAT_KEEPALIVE_DELAY: u64 = 20_000;

/// Minimum spacing between path-confirmation HELLOs (milliseconds).
pub const MIN_PATH_CONFIRMATION_INTERVAL: u64 = 60_000;

/// Minimum spacing between unsolicited PUSH_DIRECT_PATHS (milliseconds).
pub const DIRECT_PATH_PUSH_INTERVAL: u64 = 120_000;

/// Network autoconfiguration refresh interval (milliseconds); certificate
/// push timing derives from it.
pub const NETWORK_AUTOCONF_DELAY: u64 = 60_000;

/// Lifetime of a multicast group subscription (milliseconds); announce
/// timing derives from it.
pub const MULTICAST_LIKE_EXPIRE: u64 = 60_000;

/// Window for counting inbound PUSH_DIRECT_PATHS bursts (milliseconds).
pub const PUSH_DIRECT_PATHS_CUTOFF_TIME: u64 = 60_000;

/// Inbound pushes tolerated per window before the gate closes.
pub const PUSH_DIRECT_PATHS_CUTOFF_LIMIT: u32 = 5;

/// Implementation version advertised in HELLO.
pub const VERSION_MAJOR: u8 = 0;
pub const VERSION_MINOR: u8 = 1;
pub const VERSION_REVISION: u16 = 0;

/// Errors related to peer construction.
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("key agreement with peer failed: {0}")]
    KeyAgreement(#[from] IdentityError),
}

/// Version quartet reported by the remote implementation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RemoteVersion {
    pub proto: u8,
    pub major: u8,
    pub minor: u8,
    pub revision: u16,
}

struct PeerInner {
    last_used: u64,
    last_receive: u64,
    last_unicast_frame: u64,
    last_multicast_frame: u64,
    last_announced_to: u64,
    last_path_confirmation_sent: u64,
    last_direct_path_push_sent: u64,
    last_direct_path_push_receive: u64,
    last_path_sort: u64,
    version: RemoteVersion,
    latency: u32,
    direct_path_push_cutoff_count: u32,
    num_paths: usize,
    paths: [Path; MAX_PATHS],
    certs: CertCache,
}

/// Everything known about one remote node.
pub struct Peer {
    identity: PeerIdentity,
    key: SessionKey,
    nat_keepalive_salt: AtomicU32,
    inner: Mutex<PeerInner>,
}

impl Peer {
    /// Create a peer record, deriving the session key by key agreement.
    ///
    /// Agreement failure is fatal for this peer only.
    pub fn new(local: &Identity, identity: PeerIdentity) -> Result<Self, PeerError> {
        let key = local.agree(&identity)?;
        Ok(Self {
            identity,
            key,
            nat_keepalive_salt: AtomicU32::new(0),
            inner: Mutex::new(PeerInner {
                last_used: 0,
                last_receive: 0,
                last_unicast_frame: 0,
                last_multicast_frame: 0,
                last_announced_to: 0,
                last_path_confirmation_sent: 0,
                last_direct_path_push_sent: 0,
                last_direct_path_push_receive: 0,
                last_path_sort: 0,
                version: RemoteVersion::default(),
                latency: 0,
                direct_path_push_cutoff_count: 0,
                num_paths: 0,
                paths: [Path::default(); MAX_PATHS],
                certs: CertCache::new(),
            }),
        })
    }

    /// The peer's verified identity. Immutable; no lock needed.
    pub fn identity(&self) -> &PeerIdentity {
        &self.identity
    }

    /// The session key shared with this peer. Immutable; no lock needed.
    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    // ========================================================================
    // Receive flow
    // ========================================================================

    /// Update state for an authenticated packet from this peer.
    ///
    /// The caller has already verified the packet MAC with the session
    /// key. Direct packets (`hops == 0`) confirm a known path or, for
    /// `OK`, adopt the source endpoint as a new path: an `OK` proves a
    /// round trip since we sent the matching HELLO. Any other verb from an
    /// unknown endpoint triggers a rate-limited HELLO so a later `OK` can
    /// complete the confirmation.
    #[allow(clippy::too_many_arguments)]
    pub fn received(
        self: &Arc<Self>,
        rt: &Runtime,
        local: InetAddress,
        remote: InetAddress,
        hops: u8,
        _packet_id: u64,
        verb: Verb,
        _in_re_verb: Verb,
        _in_re_packet_id: u64,
    ) {
        let now = rt.clock.now();

        // Cluster redirect: pure policy, consulted before any state
        // change. Redirect-ish verbs are exempt so two cluster members
        // never bounce a peer between each other.
        let mut suboptimal = false;
        if hops == 0 {
            if let Some(cluster) = &rt.cluster {
                if !matches!(
                    verb,
                    Verb::Ok | Verb::Error | Verb::Rendezvous | Verb::PushDirectPaths
                ) {
                    if let Some(better) =
                        cluster.find_better_endpoint(self.identity.address(), &remote)
                    {
                        let proto = self.lock().version.proto;
                        self.send_redirect(rt, &local, &remote, &better, proto);
                        suboptimal = true;
                    }
                }
            }
        }

        let mut announce = false;
        let mut have_new_path = false;
        {
            let mut inner = self.lock();

            inner.last_receive = now;
            match verb {
                Verb::Frame | Verb::ExtFrame => inner.last_unicast_frame = now,
                Verb::MulticastFrame => inner.last_multicast_frame = now,
                _ => {}
            }

            if now.saturating_sub(inner.last_announced_to) >= (MULTICAST_LIKE_EXPIRE / 2) - 1000 {
                inner.last_announced_to = now;
                announce = true;
            }

            if hops == 0 {
                let mut confirmed = false;
                for i in 0..inner.num_paths {
                    if inner.paths[i].remote() == &remote && inner.paths[i].local() == &local {
                        inner.paths[i].record_receive(now);
                        if rt.cluster.is_some() {
                            inner.paths[i].set_cluster_suboptimal(suboptimal);
                        }
                        confirmed = true;
                        break;
                    }
                }

                if !confirmed {
                    if verb == Verb::Ok {
                        let slot = if inner.num_paths < MAX_PATHS {
                            let slot = inner.num_paths;
                            inner.num_paths += 1;
                            slot
                        } else {
                            // Evict the least recently heard-from path;
                            // ties go to the later slot.
                            let mut slot = 0;
                            let mut lr_min = u64::MAX;
                            for i in 0..MAX_PATHS {
                                if inner.paths[i].last_received() <= lr_min {
                                    lr_min = inner.paths[i].last_received();
                                    slot = i;
                                }
                            }
                            slot
                        };

                        let mut path = Path::new(local, remote);
                        path.record_receive(now);
                        if rt.cluster.is_some() {
                            path.set_cluster_suboptimal(suboptimal);
                        }
                        inner.paths[slot] = path;
                        sort_paths(&mut inner, now);
                        have_new_path = true;
                    } else if inner.last_path_confirmation_sent == 0
                        || now.saturating_sub(inner.last_path_confirmation_sent)
                            >= MIN_PATH_CONFIRMATION_INTERVAL
                    {
                        // A zero stamp means we have never probed this peer.
                        inner.last_path_confirmation_sent = now;
                        debug!(
                            peer = %self.identity.address(),
                            %verb,
                            %remote,
                            "unknown path, sending HELLO to confirm"
                        );
                        self.send_hello(rt, &local, &remote, now, None);
                    }
                }
            }
        }

        // Callbacks that may re-enter this peer run outside the lock.
        if have_new_path {
            if let Some(cluster) = &rt.cluster {
                cluster.broadcast_have_peer(&self.identity);
            }
        }
        if announce {
            for network in rt.services.all_networks() {
                network.announce_multicast_groups_to(self);
            }
        }
    }

    // ========================================================================
    // Outbound control traffic
    // ========================================================================

    /// Send a HELLO toward an endpoint pair.
    ///
    /// HELLO travels cleartext (MAC only) so nodes without our session
    /// key can still answer. No lock is taken; everything read here is
    /// immutable.
    pub fn send_hello(
        &self,
        rt: &Runtime,
        local: &InetAddress,
        at_address: &InetAddress,
        now: u64,
        ttl: Option<u8>,
    ) -> bool {
        let mut outp = Packet::new(self.identity.address(), rt.identity.address(), Verb::Hello);
        outp.append_u8(PROTO_VERSION);
        outp.append_u8(VERSION_MAJOR);
        outp.append_u8(VERSION_MINOR);
        outp.append_u16(VERSION_REVISION);
        outp.append_u64(now);

        let mut encoded_identity = Vec::new();
        rt.identity.public().encode_to(&mut encoded_identity);
        outp.append_bytes(&encoded_identity);

        let mut encoded_dest = Vec::new();
        at_address.encode_to(&mut encoded_dest);
        outp.append_bytes(&encoded_dest);

        outp.append_u64(rt.topology.world_id());
        outp.append_u64(rt.topology.world_timestamp());

        if outp.armor(&self.key, false).is_err() {
            return false;
        }
        rt.anti_recursion.log_outgoing(outp.as_bytes());
        rt.transport.send(local, at_address, outp.as_bytes(), ttl)
    }

    /// Steer the peer toward a better endpoint the cluster knows about.
    ///
    /// Newer peers get a single-entry PUSH_DIRECT_PATHS; older ones a
    /// legacy RENDEZVOUS. The RENDEZVOUS v6 address length is 16, not the
    /// 18 used by PUSH_DIRECT_PATHS; the historical framing is kept
    /// bit-exact.
    fn send_redirect(
        &self,
        rt: &Runtime,
        local: &InetAddress,
        remote: &InetAddress,
        better: &InetAddress,
        remote_proto: u8,
    ) {
        let mut outp = if remote_proto >= PROTO_MIN_PUSH_DIRECT_PATHS {
            let mut outp = Packet::new(
                self.identity.address(),
                rt.identity.address(),
                Verb::PushDirectPaths,
            );
            outp.append_u16(1); // count
            outp.append_u8(0); // flags
            outp.append_u16(0); // no extensions
            match better.family() {
                Some(Family::V4) => {
                    outp.append_u8(4);
                    outp.append_u8(6);
                }
                _ => {
                    outp.append_u8(6);
                    outp.append_u8(18);
                }
            }
            outp.append_bytes(&better.raw_ip_bytes());
            outp.append_u16(better.port());
            outp
        } else {
            let mut outp = Packet::new(
                self.identity.address(),
                rt.identity.address(),
                Verb::Rendezvous,
            );
            outp.append_u8(0); // flags
            outp.append_bytes(rt.identity.address().as_bytes());
            outp.append_u16(better.port());
            match better.family() {
                Some(Family::V4) => outp.append_u8(4),
                _ => outp.append_u8(16),
            }
            outp.append_bytes(&better.raw_ip_bytes());
            outp
        };

        if outp.armor(&self.key, true).is_err() {
            return;
        }
        rt.anti_recursion.log_outgoing(outp.as_bytes());
        rt.transport.send(local, remote, outp.as_bytes(), None);
    }

    /// Keep the best path alive: HELLO after prolonged receive silence,
    /// or a garbage NAT keepalive on unreliable paths after send silence.
    ///
    /// The keepalive payload varies between calls so downstream NATs see
    /// fresh traffic; receivers discard it because it fails MAC. Returns
    /// whether any usable path existed.
    pub fn do_ping_and_keepalive(&self, rt: &Runtime, now: u64, family: Option<Family>) -> bool {
        let mut inner = self.lock();
        let best = match family {
            Some(family) => best_path_index_for_family(&mut inner, now, family),
            None => best_path_index(&mut inner, now),
        };
        let Some(i) = best else {
            return false;
        };

        if now.saturating_sub(inner.paths[i].last_received()) >= PEER_DIRECT_PING_DELAY {
            let local = *inner.paths[i].local();
            let remote = *inner.paths[i].remote();
            self.send_hello(rt, &local, &remote, now, None);
            inner.paths[i].record_send(now);
        } else if now.saturating_sub(inner.paths[i].last_send()) >= NAT_KEEPALIVE_DELAY
            && !inner.paths[i].reliable()
        {
            let mix = (now.wrapping_mul(0x9e37_79b1) >> 1) as u32;
            let salt = self
                .nat_keepalive_salt
                .fetch_add(mix, Ordering::Relaxed)
                .wrapping_add(mix);
            rt.transport.send(
                inner.paths[i].local(),
                inner.paths[i].remote(),
                &salt.to_be_bytes(),
                None,
            );
            inner.paths[i].record_send(now);
        }
        true
    }

    /// Advertise our direct endpoints to this peer.
    ///
    /// Disabled when a cluster layer owns redirection. Rate-limited to
    /// `DIRECT_PATH_PUSH_INTERVAL` unless forced. Endpoints are packed
    /// into as many packets as needed, each capped at the protocol MTU
    /// with a count prefix finalized once the packet is full.
    pub fn push_direct_paths(&self, rt: &Runtime, now: u64, force: bool) {
        if rt.cluster.is_some() {
            return;
        }

        let mut inner = self.lock();
        if !force
            && now.saturating_sub(inner.last_direct_path_push_sent) < DIRECT_PATH_PUSH_INTERVAL
        {
            return;
        }
        inner.last_direct_path_push_sent = now;

        let endpoints: Vec<InetAddress> = rt
            .services
            .direct_paths()
            .into_iter()
            .filter(|a| a.family().is_some())
            .collect();
        if endpoints.is_empty() {
            return;
        }

        let Some(via) = best_path_index(&mut inner, now) else {
            return;
        };

        debug!(
            peer = %self.identity.address(),
            count = endpoints.len(),
            "pushing direct paths"
        );

        let mut remaining = endpoints.as_slice();
        while !remaining.is_empty() {
            let mut outp = Packet::new(
                self.identity.address(),
                rt.identity.address(),
                Verb::PushDirectPaths,
            );
            let count_at = outp.add_size(2);
            let mut count: u16 = 0;

            while let Some(&endpoint) = remaining.first() {
                if outp.len() + 24 >= PROTO_MAX_PACKET_LENGTH {
                    break;
                }
                outp.append_u8(0); // flags
                outp.append_u16(0); // no extensions
                match endpoint.family() {
                    Some(Family::V4) => {
                        outp.append_u8(4);
                        outp.append_u8(6);
                    }
                    _ => {
                        outp.append_u8(6);
                        outp.append_u8(18);
                    }
                }
                outp.append_bytes(&endpoint.raw_ip_bytes());
                outp.append_u16(endpoint.port());
                count += 1;
                remaining = &remaining[1..];
            }

            if count > 0 {
                outp.set_u16_at(count_at, count);
                if outp.armor(&self.key, true).is_ok() {
                    rt.anti_recursion.log_outgoing(outp.as_bytes());
                    inner.paths[via].send(rt, outp.as_bytes(), now);
                }
            }
        }
    }

    // ========================================================================
    // Path selection
    // ========================================================================

    /// The current best path, if any is active.
    ///
    /// Lazily re-sorts at most every `PATH_SORT_INTERVAL`, with a second
    /// sort attempt when the head just expired.
    pub fn get_best_path(&self, now: u64) -> Option<Path> {
        let mut inner = self.lock();
        best_path_index(&mut inner, now).map(|i| inner.paths[i])
    }

    /// The best active path of a given address family, if any.
    pub fn get_best_path_for_family(&self, now: u64, family: Family) -> Option<Path> {
        let mut inner = self.lock();
        best_path_index_for_family(&mut inner, now, family).map(|i| inner.paths[i])
    }

    /// Send bulk data via the best path.
    ///
    /// The lock is dropped around the transport call and re-taken to
    /// record the send.
    pub fn send_via_best_path(&self, rt: &Runtime, data: &[u8], now: u64) -> bool {
        let endpoints = {
            let mut inner = self.lock();
            best_path_index(&mut inner, now)
                .map(|i| (*inner.paths[i].local(), *inner.paths[i].remote()))
        };
        let Some((local, remote)) = endpoints else {
            return false;
        };
        if !rt.transport.send(&local, &remote, data, None) {
            return false;
        }
        let mut inner = self.lock();
        for i in 0..inner.num_paths {
            if inner.paths[i].remote() == &remote && inner.paths[i].local() == &local {
                inner.paths[i].record_send(now);
                break;
            }
        }
        true
    }

    /// Whether any direct path is currently active.
    pub fn has_active_direct_path(&self, now: u64) -> bool {
        let inner = self.lock();
        (0..inner.num_paths).any(|i| inner.paths[i].active(now))
    }

    /// Snapshot of the current path set.
    pub fn paths(&self) -> Vec<Path> {
        let inner = self.lock();
        inner.paths[..inner.num_paths].to_vec()
    }

    /// Most recently heard-from active v4 and v6 remote endpoints.
    pub fn best_active_addresses(&self, now: u64) -> (Option<InetAddress>, Option<InetAddress>) {
        let inner = self.lock();
        let mut best_v4: Option<(u64, InetAddress)> = None;
        let mut best_v6: Option<(u64, InetAddress)> = None;
        for i in 0..inner.num_paths {
            let path = &inner.paths[i];
            if !path.active(now) || path.last_received() == 0 {
                continue;
            }
            let entry = (path.last_received(), *path.remote());
            match path.remote().family() {
                Some(Family::V4) => {
                    if best_v4.map_or(true, |(lr, _)| entry.0 >= lr) {
                        best_v4 = Some(entry);
                    }
                }
                Some(Family::V6) => {
                    if best_v6.map_or(true, |(lr, _)| entry.0 >= lr) {
                        best_v6 = Some(entry);
                    }
                }
                None => {}
            }
        }
        (best_v4.map(|(_, a)| a), best_v6.map(|(_, a)| a))
    }

    /// Probe and drop every path in a given scope.
    ///
    /// Supports "local IP changed" events: each matching path gets a
    /// farewell HELLO (it may still work and re-confirm) and is removed.
    /// Returns whether anything was dropped.
    pub fn reset_within_scope(&self, rt: &Runtime, scope: IpScope, now: u64) -> bool {
        let mut inner = self.lock();
        let inner = &mut *inner;
        let np = inner.num_paths;
        let mut x = 0;
        let mut y = 0;
        while x < np {
            if inner.paths[x].ip_scope() == scope {
                let local = *inner.paths[x].local();
                let remote = *inner.paths[x].remote();
                self.send_hello(rt, &local, &remote, now, None);
            } else {
                inner.paths[y] = inner.paths[x];
                y += 1;
            }
            x += 1;
        }
        inner.num_paths = y;
        sort_paths(inner, now);
        y < np
    }

    // ========================================================================
    // Membership certificates
    // ========================================================================

    /// Validate a presented membership certificate and cache it.
    ///
    /// Rejections: wrong issuee, signer not the network's controller,
    /// signature failure, or unknown signer (which also schedules a whois
    /// so a retry can succeed). Idempotent on identical input; each
    /// successful call refreshes the cache timestamp.
    pub fn validate_and_set_network_membership_certificate(
        &self,
        rt: &Runtime,
        network_id: u64,
        cert: &MembershipCert,
    ) -> bool {
        if cert.issued_to() != self.identity.address() {
            debug!(
                peer = %self.identity.address(),
                nwid = format_args!("{:016x}", network_id),
                "rejected membership cert: issued to someone else"
            );
            return false;
        }

        {
            let mut inner = self.lock();
            if let Some(entry) = inner.certs.com_mut(network_id) {
                if entry.cert == *cert {
                    entry.timestamp = rt.clock.now();
                    return true;
                }
            }
        }

        if cert.signed_by() != controller_for(network_id) {
            debug!(
                peer = %self.identity.address(),
                nwid = format_args!("{:016x}", network_id),
                signer = %cert.signed_by(),
                "rejected membership cert: signer is not the network controller"
            );
            return false;
        }

        if cert.signed_by() == rt.identity.address() {
            if !rt.cert_verify.verify(cert, rt.identity.public()) {
                debug!(
                    peer = %self.identity.address(),
                    nwid = format_args!("{:016x}", network_id),
                    "rejected membership cert: self-signed signature check failed"
                );
                return false;
            }
        } else {
            let Some(signer) = rt.topology.peer(cert.signed_by()) else {
                // Can happen when packets beat the network config; ask who
                // the signer is and reject for now.
                rt.topology.request_whois(cert.signed_by());
                return false;
            };
            if !rt.cert_verify.verify(cert, signer.identity()) {
                debug!(
                    peer = %self.identity.address(),
                    nwid = format_args!("{:016x}", network_id),
                    signer = %cert.signed_by(),
                    "rejected membership cert: signature check failed"
                );
                return false;
            }
        }

        let now = rt.clock.now();
        self.lock().certs.set_com(network_id, now, *cert);
        true
    }

    /// Whether our cached view of the peer's cert agrees with a presented
    /// one.
    pub fn membership_certs_agree(&self, network_id: u64, cert: &MembershipCert) -> bool {
        self.lock()
            .certs
            .com(network_id)
            .map(|entry| entry.cert.agrees_with(cert))
            .unwrap_or(false)
    }

    /// Whether we owe this peer a fresh push of our own certificate for a
    /// network; optionally stamps the push time in the same locked step.
    pub fn needs_our_network_membership_certificate(
        &self,
        network_id: u64,
        now: u64,
        update_last_pushed: bool,
    ) -> bool {
        self.lock()
            .certs
            .needs_push(network_id, now, update_last_pushed)
    }

    // ========================================================================
    // Housekeeping
    // ========================================================================

    /// Drop inactive paths (order-preserving) and expire stale
    /// certificate state.
    pub fn clean(&self, rt: &Runtime, now: u64) {
        let mut inner = self.lock();
        let inner = &mut *inner;

        let np = inner.num_paths;
        let mut x = 0;
        let mut y = 0;
        while x < np {
            if inner.paths[x].active(now) {
                inner.paths[y] = inner.paths[x];
                y += 1;
            }
            x += 1;
        }
        inner.num_paths = y;

        inner
            .certs
            .clean(now, |network_id| rt.services.belongs_to_network(network_id));
    }

    /// Gate for inbound PUSH_DIRECT_PATHS floods.
    ///
    /// Counts pushes arriving within the cutoff window; returns whether
    /// this one should still be honored.
    pub fn rate_gate_inbound_direct_path_push(&self, now: u64) -> bool {
        let mut inner = self.lock();
        if now.saturating_sub(inner.last_direct_path_push_receive) <= PUSH_DIRECT_PATHS_CUTOFF_TIME
        {
            inner.direct_path_push_cutoff_count += 1;
        } else {
            inner.direct_path_push_cutoff_count = 0;
        }
        inner.last_direct_path_push_receive = now;
        inner.direct_path_push_cutoff_count < PUSH_DIRECT_PATHS_CUTOFF_LIMIT
    }

    // ========================================================================
    // Bookkeeping accessors
    // ========================================================================

    /// Record that the peer was used for outbound traffic.
    pub fn mark_used(&self, now: u64) {
        self.lock().last_used = now;
    }

    pub fn last_used(&self) -> u64 {
        self.lock().last_used
    }

    pub fn last_receive(&self) -> u64 {
        self.lock().last_receive
    }

    pub fn last_unicast_frame(&self) -> u64 {
        self.lock().last_unicast_frame
    }

    pub fn last_multicast_frame(&self) -> u64 {
        self.lock().last_multicast_frame
    }

    /// Fold a latency measurement into the estimate (halving EWMA,
    /// clamped to 65535 ms).
    pub fn record_latency(&self, measurement_ms: u32) {
        let mut inner = self.lock();
        let sample = measurement_ms.min(65_535);
        inner.latency = if inner.latency > 0 && inner.latency < 10_000 {
            (inner.latency + sample) / 2
        } else {
            sample
        };
    }

    pub fn latency(&self) -> u32 {
        self.lock().latency
    }

    pub fn set_remote_version(&self, version: RemoteVersion) {
        self.lock().version = version;
    }

    pub fn remote_version(&self) -> RemoteVersion {
        self.lock().version
    }

    /// Inbound pushes seen within the current cutoff window, for
    /// diagnostics.
    pub fn direct_path_push_cutoff_count(&self) -> u32 {
        self.lock().direct_path_push_cutoff_count
    }

    pub fn path_count(&self) -> usize {
        self.lock().num_paths
    }

    fn lock(&self) -> MutexGuard<'_, PeerInner> {
        self.inner.lock().expect("peer lock poisoned")
    }
}

// Assumes the peer lock is held.
fn sort_paths(inner: &mut PeerInner, now: u64) {
    inner.last_path_sort = now;
    let n = inner.num_paths;
    inner.paths[..n].sort_by(|a, b| b.quality(now).cmp(&a.quality(now)));
}

// Assumes the peer lock is held.
fn best_path_index(inner: &mut PeerInner, now: u64) -> Option<usize> {
    if now.saturating_sub(inner.last_path_sort) >= PATH_SORT_INTERVAL {
        sort_paths(inner, now);
    }
    if inner.num_paths == 0 {
        return None;
    }
    if inner.paths[0].active(now) {
        return Some(0);
    }
    // The head may have just expired; one more sort can surface a live one.
    sort_paths(inner, now);
    if inner.paths[0].active(now) {
        Some(0)
    } else {
        None
    }
}

// Assumes the peer lock is held.
fn best_path_index_for_family(inner: &mut PeerInner, now: u64, family: Family) -> Option<usize> {
    if now.saturating_sub(inner.last_path_sort) >= PATH_SORT_INTERVAL {
        sort_paths(inner, now);
    }
    for _ in 0..2 {
        for i in 0..inner.num_paths {
            if inner.paths[i].active(now) && inner.paths[i].remote().family() == Some(family) {
                return Some(i);
            }
        }
        sort_paths(inner, now);
    }
    None
}
