//! Peer Topology
//!
//! `TopologyStore` is the sole owner of peer records; everything else in
//! the node holds reference-counted views handed out by lookup. It also
//! queues whois requests for addresses the node cannot resolve yet, for
//! the housekeeping pass to act on.

use crate::identity::PeerAddress;
use crate::peer::Peer;
use crate::runtime::Topology;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Owner of all peer records plus world metadata.
pub struct TopologyStore {
    world_id: u64,
    world_timestamp: u64,
    peers: Mutex<HashMap<u64, Arc<Peer>>>,
    whois_queue: Mutex<Vec<PeerAddress>>,
}

impl TopologyStore {
    pub fn new(world_id: u64, world_timestamp: u64) -> Self {
        Self {
            world_id,
            world_timestamp,
            peers: Mutex::new(HashMap::new()),
            whois_queue: Mutex::new(Vec::new()),
        }
    }

    /// Add a peer record, or return the existing one for that address.
    ///
    /// First registration wins so every holder of a view sees the same
    /// record.
    pub fn add_peer(&self, peer: Arc<Peer>) -> Arc<Peer> {
        let mut peers = self.lock_peers();
        peers
            .entry(peer.identity().address().as_u64())
            .or_insert(peer)
            .clone()
    }

    /// Drop a peer record. Outstanding views keep it alive until released.
    pub fn remove_peer(&self, address: PeerAddress) -> Option<Arc<Peer>> {
        self.lock_peers().remove(&address.as_u64())
    }

    /// Visit every peer with the map lock released, so callbacks may take
    /// peer locks or call back into the topology.
    pub fn each_peer(&self, mut f: impl FnMut(&Arc<Peer>)) {
        let snapshot: Vec<Arc<Peer>> = self.lock_peers().values().cloned().collect();
        for peer in &snapshot {
            f(peer);
        }
    }

    pub fn peer_count(&self) -> usize {
        self.lock_peers().len()
    }

    /// Drain the queued whois requests.
    pub fn take_whois_requests(&self) -> Vec<PeerAddress> {
        std::mem::take(&mut self.whois_queue.lock().expect("whois queue lock poisoned"))
    }

    fn lock_peers(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Arc<Peer>>> {
        self.peers.lock().expect("topology lock poisoned")
    }
}

impl Topology for TopologyStore {
    fn peer(&self, address: PeerAddress) -> Option<Arc<Peer>> {
        self.lock_peers().get(&address.as_u64()).cloned()
    }

    fn world_id(&self) -> u64 {
        self.world_id
    }

    fn world_timestamp(&self) -> u64 {
        self.world_timestamp
    }

    fn request_whois(&self, address: PeerAddress) {
        let mut queue = self.whois_queue.lock().expect("whois queue lock poisoned");
        if !queue.contains(&address) {
            queue.push(address);
        }
    }
}
