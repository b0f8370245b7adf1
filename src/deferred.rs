//! Deferred Packet Queue
//!
//! A bounded single-producer/single-consumer ring that moves CPU-heavy
//! packet decoding off the I/O path. Producers enqueue received packets
//! and get immediate back-pressure when the ring is full; a worker blocks
//! in `process` until a packet or shutdown arrives. Within one worker,
//! packets decode in enqueue order.

use crate::packet::IncomingPacket;
use crate::runtime::PacketCodec;
use std::sync::{Arc, Condvar, Mutex};

/// Capacity of the deferred ring.
pub const MAX_DEFERRED: usize = 32;

/// Result of one `process` call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// A packet was handed to the codec.
    Progress,
    /// The queue is shutting down; the worker should exit.
    Shutdown,
}

struct QueueState {
    slots: Vec<Option<Box<IncomingPacket>>>,
    read: u64,
    write: u64,
    die: bool,
}

/// Bounded ring of packets awaiting decode.
pub struct DeferredQueue {
    codec: Arc<dyn PacketCodec>,
    state: Mutex<QueueState>,
    ready: Condvar,
}

impl DeferredQueue {
    /// Create a queue with the default capacity.
    pub fn new(codec: Arc<dyn PacketCodec>) -> Self {
        Self::with_capacity(codec, MAX_DEFERRED)
    }

    /// Create a queue with an explicit capacity.
    pub fn with_capacity(codec: Arc<dyn PacketCodec>, capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            codec,
            state: Mutex::new(QueueState {
                slots,
                read: 0,
                write: 0,
                die: false,
            }),
            ready: Condvar::new(),
        }
    }

    /// Offer a packet to the queue.
    ///
    /// When the slot at the write cursor is still occupied the queue is
    /// full: the packet is handed back unchanged and the caller must drop
    /// it or re-poll. The same applies once shutdown has begun.
    pub fn enqueue(&self, pkt: Box<IncomingPacket>) -> Result<(), Box<IncomingPacket>> {
        let mut state = self.lock_state();
        if state.die {
            return Err(pkt);
        }
        let capacity = state.slots.len() as u64;
        let slot = (state.write % capacity) as usize;
        if state.slots[slot].is_some() {
            return Err(pkt);
        }
        state.slots[slot] = Some(pkt);
        state.write += 1;
        drop(state);
        self.ready.notify_one();
        Ok(())
    }

    /// Block until a packet is available or shutdown is requested, then
    /// decode one packet through the codec.
    ///
    /// On shutdown the wakeup is re-posted so any other worker also
    /// unblocks. Decode failures are the codec's to log; the queue never
    /// retries.
    pub fn process(&self) -> ProcessOutcome {
        let mut state = self.lock_state();
        loop {
            if state.die {
                drop(state);
                self.ready.notify_one();
                return ProcessOutcome::Shutdown;
            }
            if state.read != state.write {
                break;
            }
            state = self
                .ready
                .wait(state)
                .expect("deferred queue lock poisoned");
        }

        let capacity = state.slots.len() as u64;
        let slot = (state.read % capacity) as usize;
        let pkt = state.slots[slot]
            .take()
            .expect("slot occupied between read and write cursors");
        state.read += 1;
        drop(state);

        self.codec.try_decode(*pkt, true);
        ProcessOutcome::Progress
    }

    /// Begin shutdown: wake every blocked worker. Packets still queued are
    /// dropped with the queue.
    pub fn shutdown(&self) {
        self.lock_state().die = true;
        self.ready.notify_all();
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().expect("deferred queue lock poisoned")
    }
}

impl Drop for DeferredQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::PeerAddress;
    use crate::packet::{Packet, Verb};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingCodec {
        decoded: Mutex<Vec<u64>>,
        calls: AtomicUsize,
    }

    impl CountingCodec {
        fn new() -> Self {
            Self {
                decoded: Mutex::new(Vec::new()),
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl PacketCodec for CountingCodec {
        fn try_decode(&self, pkt: IncomingPacket, deferred_allowed: bool) -> bool {
            assert!(deferred_allowed);
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.decoded.lock().unwrap().push(pkt.packet.packet_id());
            true
        }
    }

    fn incoming(id: u64) -> Box<IncomingPacket> {
        let packet = Packet::with_packet_id(
            id,
            PeerAddress::from_u64(1),
            PeerAddress::from_u64(2),
            Verb::Frame,
        );
        Box::new(IncomingPacket::new(
            packet,
            "10.0.0.1:9993".parse().unwrap(),
            "203.0.113.7:41000".parse().unwrap(),
            id,
        ))
    }

    #[test]
    fn test_back_pressure_at_capacity() {
        let codec = Arc::new(CountingCodec::new());
        let queue = DeferredQueue::with_capacity(codec.clone(), 4);

        for id in 0..4 {
            assert!(queue.enqueue(incoming(id)).is_ok());
        }
        // Fifth offer is refused and handed back.
        let refused = queue.enqueue(incoming(4)).unwrap_err();
        assert_eq!(refused.packet.packet_id(), 4);

        // Draining one slot makes room for one more.
        assert_eq!(queue.process(), ProcessOutcome::Progress);
        assert!(queue.enqueue(incoming(5)).is_ok());
    }

    #[test]
    fn test_decodes_in_enqueue_order() {
        let codec = Arc::new(CountingCodec::new());
        let queue = DeferredQueue::with_capacity(codec.clone(), 8);

        for id in [7, 3, 9] {
            queue.enqueue(incoming(id)).unwrap();
        }
        for _ in 0..3 {
            assert_eq!(queue.process(), ProcessOutcome::Progress);
        }
        assert_eq!(*codec.decoded.lock().unwrap(), vec![7, 3, 9]);
    }

    #[test]
    fn test_accepted_packets_all_decode() {
        let codec = Arc::new(CountingCodec::new());
        let queue = DeferredQueue::new(codec.clone());

        let mut accepted = 0;
        for id in 0..100 {
            if queue.enqueue(incoming(id)).is_ok() {
                accepted += 1;
            } else {
                break;
            }
        }
        assert_eq!(accepted, MAX_DEFERRED);
        for _ in 0..accepted {
            assert_eq!(queue.process(), ProcessOutcome::Progress);
        }
        assert_eq!(codec.calls.load(Ordering::SeqCst), accepted);
    }

    #[test]
    fn test_shutdown_unblocks_worker() {
        let codec = Arc::new(CountingCodec::new());
        let queue = Arc::new(DeferredQueue::new(codec.clone()));

        let worker = {
            let queue = queue.clone();
            std::thread::spawn(move || {
                let mut outcomes = Vec::new();
                loop {
                    let outcome = queue.process();
                    outcomes.push(outcome);
                    if outcome == ProcessOutcome::Shutdown {
                        return outcomes;
                    }
                }
            })
        };

        queue.enqueue(incoming(1)).unwrap();
        // Let the worker drain the packet before requesting shutdown.
        while codec.calls.load(Ordering::SeqCst) == 0 {
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        queue.shutdown();

        let outcomes = worker.join().unwrap();
        assert_eq!(outcomes.last().copied(), Some(ProcessOutcome::Shutdown));
        assert!(outcomes.contains(&ProcessOutcome::Progress));
    }

    #[test]
    fn test_enqueue_after_shutdown_is_refused() {
        let codec = Arc::new(CountingCodec::new());
        let queue = DeferredQueue::new(codec);
        queue.shutdown();
        assert!(queue.enqueue(incoming(1)).is_err());
    }

    #[test]
    fn test_shutdown_cascades_across_workers() {
        let codec = Arc::new(CountingCodec::new());
        let queue = Arc::new(DeferredQueue::new(codec));

        let workers: Vec<_> = (0..3)
            .map(|_| {
                let queue = queue.clone();
                std::thread::spawn(move || {
                    while queue.process() != ProcessOutcome::Shutdown {}
                })
            })
            .collect();

        std::thread::sleep(std::time::Duration::from_millis(50));
        queue.shutdown();
        for worker in workers {
            worker.join().unwrap();
        }
    }
}
