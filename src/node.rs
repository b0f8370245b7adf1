//! Node Entity
//!
//! Top-level structure tying the subsystems together: identity, runtime
//! collaborators, the UDP transport, the deferred decode queue with its
//! worker thread, and a housekeeping thread that drives per-peer pings,
//! direct-path pushes and cleanup.

use crate::config::{Config, ConfigError};
use crate::deferred::{DeferredQueue, ProcessOutcome};
use crate::dispatch::{Dispatcher, LoggingVerbHandler};
use crate::identity::IdentityError;
use crate::inet::InetAddress;
use crate::peer::Peer;
use crate::runtime::{
    Network, NodeServices, PacketHistory, Runtime, SchnorrCertVerify, SystemClock, VerbHandler,
};
use crate::topology::TopologyStore;
use crate::transport::{TransportError, UdpTransport};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Errors related to node lifecycle.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("node already started")]
    AlreadyStarted,

    #[error("node not started")]
    NotStarted,

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Node operational state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeState {
    /// Created but not started.
    Created,
    /// Fully operational.
    Running,
    /// Stopped.
    Stopped,
}

impl NodeState {
    pub fn is_operational(&self) -> bool {
        matches!(self, NodeState::Running)
    }

    pub fn can_start(&self) -> bool {
        matches!(self, NodeState::Created | NodeState::Stopped)
    }
}

/// Joined networks and advertised endpoints, shared with the peer layer.
pub struct LocalServices {
    direct: Mutex<Vec<InetAddress>>,
    networks: Mutex<HashMap<u64, Arc<dyn Network>>>,
}

impl LocalServices {
    pub fn new() -> Self {
        Self {
            direct: Mutex::new(Vec::new()),
            networks: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the advertised direct endpoints.
    pub fn set_direct_paths(&self, endpoints: Vec<InetAddress>) {
        *self.direct.lock().expect("services lock poisoned") = endpoints;
    }

    /// Register a joined network.
    pub fn join_network(&self, network: Arc<dyn Network>) {
        self.networks
            .lock()
            .expect("services lock poisoned")
            .insert(network.id(), network);
    }

    /// Deregister a network.
    pub fn leave_network(&self, network_id: u64) {
        self.networks
            .lock()
            .expect("services lock poisoned")
            .remove(&network_id);
    }
}

impl Default for LocalServices {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeServices for LocalServices {
    fn direct_paths(&self) -> Vec<InetAddress> {
        self.direct.lock().expect("services lock poisoned").clone()
    }

    fn belongs_to_network(&self, network_id: u64) -> bool {
        self.networks
            .lock()
            .expect("services lock poisoned")
            .contains_key(&network_id)
    }

    fn all_networks(&self) -> Vec<Arc<dyn Network>> {
        self.networks
            .lock()
            .expect("services lock poisoned")
            .values()
            .cloned()
            .collect()
    }
}

/// A running node instance.
pub struct Node {
    config: Config,
    state: NodeState,
    runtime: Arc<Runtime>,
    topology: Arc<TopologyStore>,
    services: Arc<LocalServices>,
    transport: Arc<UdpTransport>,
    queue: Arc<DeferredQueue>,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    housekeeping: Option<JoinHandle<()>>,
}

impl Node {
    /// Build a node from configuration with the default verb handler.
    pub fn new(config: Config) -> Result<Self, NodeError> {
        Self::with_verb_handler(config, Arc::new(LoggingVerbHandler))
    }

    /// Build a node with a custom verb handler.
    pub fn with_verb_handler(
        config: Config,
        verb_handler: Arc<dyn VerbHandler>,
    ) -> Result<Self, NodeError> {
        let identity = config.create_identity()?;
        info!(address = %identity.address(), "node identity ready");

        let topology = Arc::new(TopologyStore::new(
            config.node.world_id(),
            config.node.world_timestamp(),
        ));
        let services = Arc::new(LocalServices::new());
        let transport = Arc::new(UdpTransport::new(config.udp.clone()));

        let runtime = Arc::new(Runtime {
            identity,
            clock: Arc::new(SystemClock::new()),
            transport: transport.clone(),
            topology: topology.clone(),
            services: services.clone(),
            anti_recursion: Arc::new(PacketHistory::new()),
            cert_verify: Arc::new(SchnorrCertVerify),
            cluster: None,
        });

        let dispatcher = Arc::new(Dispatcher::new(runtime.clone(), verb_handler));
        let queue = Arc::new(DeferredQueue::new(dispatcher));

        Ok(Self {
            config,
            state: NodeState::Created,
            runtime,
            topology,
            services,
            transport,
            queue,
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
            housekeeping: None,
        })
    }

    /// Bind the transport and start the worker and housekeeping threads.
    pub fn start(&mut self) -> Result<(), NodeError> {
        if !self.state.can_start() {
            return Err(NodeError::AlreadyStarted);
        }

        self.transport
            .start(self.queue.clone(), self.runtime.clock.clone())?;

        let mut direct = self.transport.local_addrs();
        direct.extend(self.config.announce_addresses());
        self.services.set_direct_paths(direct);

        self.running.store(true, Ordering::SeqCst);

        self.worker = Some({
            let queue = self.queue.clone();
            std::thread::spawn(move || {
                while queue.process() != ProcessOutcome::Shutdown {}
            })
        });

        self.housekeeping = Some({
            let runtime = self.runtime.clone();
            let topology = self.topology.clone();
            let running = self.running.clone();
            let interval = Duration::from_millis(self.config.node.housekeeping_interval_ms());
            std::thread::spawn(move || {
                while running.load(Ordering::SeqCst) {
                    housekeeping_pass(&runtime, &topology);
                    std::thread::sleep(interval);
                }
            })
        });

        self.state = NodeState::Running;
        info!("node running");
        Ok(())
    }

    /// Stop threads and the transport.
    pub fn stop(&mut self) -> Result<(), NodeError> {
        if !self.state.is_operational() {
            return Err(NodeError::NotStarted);
        }

        self.running.store(false, Ordering::SeqCst);
        self.queue.shutdown();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        if let Some(housekeeping) = self.housekeeping.take() {
            let _ = housekeeping.join();
        }
        self.transport.stop()?;

        self.state = NodeState::Stopped;
        info!("node stopped");
        Ok(())
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    /// The runtime shared with every subsystem.
    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    /// The peer topology.
    pub fn topology(&self) -> &Arc<TopologyStore> {
        &self.topology
    }

    /// Joined-network and endpoint registry.
    pub fn services(&self) -> &Arc<LocalServices> {
        &self.services
    }

    /// Register a peer record (or return the existing one).
    pub fn add_peer(&self, peer: Arc<Peer>) -> Arc<Peer> {
        self.topology.add_peer(peer)
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        if self.state.is_operational() {
            let _ = self.stop();
        }
    }
}

/// One tick of periodic maintenance over every peer.
fn housekeeping_pass(runtime: &Arc<Runtime>, topology: &Arc<TopologyStore>) {
    let now = runtime.clock.now();
    topology.each_peer(|peer| {
        peer.do_ping_and_keepalive(runtime, now, None);
        peer.push_direct_paths(runtime, now, false);
        peer.clean(runtime, now);
    });

    for address in topology.take_whois_requests() {
        // Resolution goes through a root/relay lookup once an embedder
        // wires one up; surface the request either way.
        debug!(%address, "whois wanted for unknown peer");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UdpConfig;
    use crate::identity::Identity;

    fn test_config() -> Config {
        Config {
            udp: UdpConfig {
                port: Some(0),
                bind_v4: Some(true),
                bind_v6: Some(false),
                recv_buffer: None,
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_lifecycle() {
        let mut node = Node::new(test_config()).unwrap();
        assert_eq!(node.state(), NodeState::Created);
        assert!(matches!(node.stop(), Err(NodeError::NotStarted)));

        node.start().unwrap();
        assert!(node.state().is_operational());
        assert!(matches!(node.start(), Err(NodeError::AlreadyStarted)));

        // Bound sockets are advertised as direct paths.
        assert!(!node.runtime().services.direct_paths().is_empty());

        node.stop().unwrap();
        assert_eq!(node.state(), NodeState::Stopped);
    }

    #[test]
    fn test_add_peer_and_lookup_via_runtime() {
        let node = Node::new(test_config()).unwrap();
        let remote = Identity::generate();
        let peer = Arc::new(Peer::new(&node.runtime().identity, *remote.public()).unwrap());
        let address = peer.identity().address();

        node.add_peer(peer);
        assert!(node.runtime().topology.peer(address).is_some());
    }

    #[test]
    fn test_announce_endpoints_merge_into_direct_paths() {
        let mut config = test_config();
        config.node.announce = vec!["198.51.100.1:7717".into()];
        let mut node = Node::new(config).unwrap();
        node.start().unwrap();

        let direct = node.runtime().services.direct_paths();
        assert!(direct.contains(&"198.51.100.1:7717".parse().unwrap()));
        node.stop().unwrap();
    }

    #[test]
    fn test_local_services_network_registry() {
        struct StubNetwork(u64);
        impl Network for StubNetwork {
            fn id(&self) -> u64 {
                self.0
            }
            fn announce_multicast_groups_to(&self, _peer: &Arc<Peer>) {}
        }

        let services = LocalServices::new();
        assert!(!services.belongs_to_network(5));

        services.join_network(Arc::new(StubNetwork(5)));
        assert!(services.belongs_to_network(5));
        assert_eq!(services.all_networks().len(), 1);

        services.leave_network(5);
        assert!(!services.belongs_to_network(5));
    }
}
