//! UDP Wire Transport
//!
//! One wildcard socket per address family, each with a reader thread that
//! frames received datagrams and offers them to the deferred queue.
//! Datagrams too short to be packets (NAT keepalive garbage) are dropped
//! at this layer; a full queue drops the packet with a debug log and the
//! sender's retry logic takes over.

use crate::config::UdpConfig;
use crate::deferred::DeferredQueue;
use crate::inet::InetAddress;
use crate::packet::{IncomingPacket, Packet};
use crate::runtime::{Clock, WireTransport};
use std::io::ErrorKind;
use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// How often reader threads wake to check for shutdown.
const READ_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Errors related to transport lifecycle.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport already started")]
    AlreadyStarted,

    #[error("transport not started")]
    NotStarted,

    #[error("no socket could be bound")]
    NothingBound,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Transport lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportState {
    /// Configured but not started.
    Configured,
    /// Sockets bound, readers running.
    Up,
    /// Stopped after running.
    Down,
}

impl TransportState {
    pub fn is_operational(&self) -> bool {
        matches!(self, TransportState::Up)
    }

    pub fn can_start(&self) -> bool {
        matches!(self, TransportState::Configured | TransportState::Down)
    }
}

struct TransportInner {
    state: TransportState,
    sockets: Vec<Arc<UdpSocket>>,
    readers: Vec<JoinHandle<()>>,
    local_addrs: Vec<InetAddress>,
}

/// UDP sockets plus reader threads feeding the deferred queue.
pub struct UdpTransport {
    config: UdpConfig,
    running: Arc<AtomicBool>,
    inner: Mutex<TransportInner>,
}

impl UdpTransport {
    pub fn new(config: UdpConfig) -> Self {
        Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
            inner: Mutex::new(TransportInner {
                state: TransportState::Configured,
                sockets: Vec::new(),
                readers: Vec::new(),
                local_addrs: Vec::new(),
            }),
        }
    }

    /// Bind sockets and start reader threads delivering into a queue.
    pub fn start(
        &self,
        queue: Arc<DeferredQueue>,
        clock: Arc<dyn Clock>,
    ) -> Result<(), TransportError> {
        let mut inner = self.lock();
        if !inner.state.can_start() {
            return Err(TransportError::AlreadyStarted);
        }

        let mut bind_targets = Vec::new();
        if self.config.bind_v4() {
            bind_targets.push(format!("0.0.0.0:{}", self.config.port()));
        }
        if self.config.bind_v6() {
            bind_targets.push(format!("[::]:{}", self.config.port()));
        }

        for target in bind_targets {
            match UdpSocket::bind(&target) {
                Ok(socket) => {
                    socket.set_read_timeout(Some(READ_POLL_INTERVAL))?;
                    let local = socket
                        .local_addr()
                        .map(InetAddress::from_socket_addr)
                        .unwrap_or(InetAddress::Nil);
                    info!(%local, "udp socket bound");
                    inner.local_addrs.push(local);
                    inner.sockets.push(Arc::new(socket));
                }
                Err(e) => {
                    // Dual-stack hosts may refuse the second wildcard bind
                    // on the same port; one socket is enough to operate.
                    warn!(target = %target, "udp bind failed: {}", e);
                }
            }
        }
        if inner.sockets.is_empty() {
            return Err(TransportError::NothingBound);
        }

        self.running.store(true, Ordering::SeqCst);
        let buffer_size = self.config.recv_buffer();
        let inner = &mut *inner;
        for socket in &inner.sockets {
            let socket = socket.clone();
            let queue = queue.clone();
            let clock = clock.clone();
            let running = self.running.clone();
            let local = socket
                .local_addr()
                .map(InetAddress::from_socket_addr)
                .unwrap_or(InetAddress::Nil);

            inner.readers.push(std::thread::spawn(move || {
                read_loop(socket, local, queue, clock, running, buffer_size);
            }));
        }

        inner.state = TransportState::Up;
        Ok(())
    }

    /// Stop the readers and close the sockets.
    pub fn stop(&self) -> Result<(), TransportError> {
        let mut inner = self.lock();
        if !inner.state.is_operational() {
            return Err(TransportError::NotStarted);
        }
        self.running.store(false, Ordering::SeqCst);
        for reader in inner.readers.drain(..) {
            let _ = reader.join();
        }
        inner.sockets.clear();
        inner.local_addrs.clear();
        inner.state = TransportState::Down;
        Ok(())
    }

    pub fn state(&self) -> TransportState {
        self.lock().state
    }

    /// Addresses of the bound sockets.
    pub fn local_addrs(&self) -> Vec<InetAddress> {
        self.lock().local_addrs.clone()
    }

    fn socket_for(&self, local: &InetAddress, remote: &InetAddress) -> Option<Arc<UdpSocket>> {
        let inner = self.lock();
        // Prefer a socket bound exactly to the requested local endpoint,
        // else any socket of the remote's family.
        let by_local = inner
            .sockets
            .iter()
            .zip(&inner.local_addrs)
            .find(|(_, bound)| *bound == local)
            .map(|(socket, _)| socket.clone());
        by_local.or_else(|| {
            inner
                .sockets
                .iter()
                .zip(&inner.local_addrs)
                .find(|(_, bound)| bound.family() == remote.family())
                .map(|(socket, _)| socket.clone())
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TransportInner> {
        self.inner.lock().expect("transport lock poisoned")
    }
}

impl WireTransport for UdpTransport {
    fn send(
        &self,
        local: &InetAddress,
        remote: &InetAddress,
        data: &[u8],
        ttl: Option<u8>,
    ) -> bool {
        let Some(target) = remote.to_socket_addr() else {
            return false;
        };
        let Some(socket) = self.socket_for(local, remote) else {
            trace!(%remote, "no socket for remote family");
            return false;
        };

        let original_ttl = match ttl {
            Some(ttl) => {
                let original = socket.ttl().ok();
                if socket.set_ttl(ttl as u32).is_err() {
                    trace!(%remote, "ttl override unsupported on this socket");
                }
                original
            }
            None => None,
        };

        let sent = match socket.send_to(data, target) {
            Ok(n) => n == data.len(),
            Err(e) => {
                debug!(%remote, "udp send failed: {}", e);
                false
            }
        };

        if let Some(original) = original_ttl {
            let _ = socket.set_ttl(original);
        }
        sent
    }
}

fn read_loop(
    socket: Arc<UdpSocket>,
    local: InetAddress,
    queue: Arc<DeferredQueue>,
    clock: Arc<dyn Clock>,
    running: Arc<AtomicBool>,
    buffer_size: usize,
) {
    let mut buf = vec![0u8; buffer_size];
    while running.load(Ordering::SeqCst) {
        match socket.recv_from(&mut buf) {
            Ok((len, from)) => {
                let remote = InetAddress::from_socket_addr(from);
                let packet = match Packet::from_bytes(buf[..len].to_vec()) {
                    Ok(packet) => packet,
                    Err(_) => {
                        // NAT keepalives and stray datagrams land here.
                        trace!(%remote, len, "dropping undersized datagram");
                        continue;
                    }
                };
                let incoming =
                    Box::new(IncomingPacket::new(packet, local, remote, clock.now()));
                if queue.enqueue(incoming).is_err() {
                    debug!(%remote, "deferred queue full, dropping packet");
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {}
            Err(e) => {
                if running.load(Ordering::SeqCst) {
                    warn!(%local, "udp receive failed: {}", e);
                }
            }
        }
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        if self.state().is_operational() {
            let _ = self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::PeerAddress;
    use crate::packet::Verb;
    use crate::runtime::PacketCodec;
    use crate::runtime::SystemClock;
    use std::sync::atomic::AtomicUsize;

    struct CountingCodec {
        seen: AtomicUsize,
    }

    impl PacketCodec for CountingCodec {
        fn try_decode(&self, _pkt: IncomingPacket, _deferred_allowed: bool) -> bool {
            self.seen.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    fn loopback_config() -> UdpConfig {
        UdpConfig {
            port: Some(0),
            bind_v4: Some(true),
            bind_v6: Some(false),
            recv_buffer: None,
        }
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        for _ in 0..100 {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        false
    }

    #[test]
    fn test_lifecycle() {
        let codec = Arc::new(CountingCodec {
            seen: AtomicUsize::new(0),
        });
        let queue = Arc::new(DeferredQueue::new(codec));
        let transport = UdpTransport::new(loopback_config());

        assert_eq!(transport.state(), TransportState::Configured);
        transport
            .start(queue.clone(), Arc::new(SystemClock::new()))
            .unwrap();
        assert!(transport.state().is_operational());
        assert!(!transport.local_addrs().is_empty());

        // A second start is refused while running.
        assert!(matches!(
            transport.start(queue, Arc::new(SystemClock::new())),
            Err(TransportError::AlreadyStarted)
        ));

        transport.stop().unwrap();
        assert_eq!(transport.state(), TransportState::Down);
        assert!(matches!(transport.stop(), Err(TransportError::NotStarted)));
    }

    #[test]
    fn test_datagram_reaches_queue() {
        let codec = Arc::new(CountingCodec {
            seen: AtomicUsize::new(0),
        });
        let queue = Arc::new(DeferredQueue::new(codec.clone()));
        let receiver = UdpTransport::new(loopback_config());
        receiver
            .start(queue.clone(), Arc::new(SystemClock::new()))
            .unwrap();

        // The wildcard-bound port is reachable via loopback.
        let port = receiver.local_addrs()[0].port();
        let target: InetAddress = format!("127.0.0.1:{}", port).parse().unwrap();

        let sender = UdpTransport::new(loopback_config());
        sender
            .start(
                Arc::new(DeferredQueue::new(Arc::new(CountingCodec {
                    seen: AtomicUsize::new(0),
                }))),
                Arc::new(SystemClock::new()),
            )
            .unwrap();

        // Worker draining the receiver's queue into the counting codec.
        let worker = {
            let queue = queue.clone();
            std::thread::spawn(move || {
                while queue.process() != crate::deferred::ProcessOutcome::Shutdown {}
            })
        };

        let packet = Packet::with_packet_id(
            7,
            PeerAddress::from_u64(1),
            PeerAddress::from_u64(2),
            Verb::Frame,
        );
        assert!(sender.send(&InetAddress::Nil, &target, packet.as_bytes(), None));

        // A too-short datagram is accepted by the socket but filtered
        // before the queue.
        assert!(sender.send(&InetAddress::Nil, &target, &[1, 2, 3, 4], None));

        assert!(wait_for(|| codec.seen.load(Ordering::SeqCst) >= 1));
        // Give the garbage datagram a moment; it must never be decoded.
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(codec.seen.load(Ordering::SeqCst), 1);

        sender.stop().unwrap();
        receiver.stop().unwrap();
        queue.shutdown();
        worker.join().unwrap();
    }
}
