//! Packet Dispatch
//!
//! The worker-side decode flow executed for each packet drained from the
//! deferred queue: resolve the source peer, authenticate with its session
//! key, feed the peer's path/liveness state machine, then hand the
//! cleartext packet to the verb handler. Packets that fail any step are
//! dropped here with a debug log; this layer never retries.

use crate::packet::{IncomingPacket, Verb, IDX_PAYLOAD};
use crate::runtime::{PacketCodec, Runtime, VerbHandler};
use std::sync::Arc;
use tracing::debug;

/// Authenticates queued packets and routes them through their peer.
pub struct Dispatcher {
    rt: Arc<Runtime>,
    verb_handler: Arc<dyn VerbHandler>,
}

impl Dispatcher {
    pub fn new(rt: Arc<Runtime>, verb_handler: Arc<dyn VerbHandler>) -> Self {
        Self { rt, verb_handler }
    }
}

impl PacketCodec for Dispatcher {
    fn try_decode(&self, mut pkt: IncomingPacket, deferred_allowed: bool) -> bool {
        let _ = deferred_allowed;

        let source = pkt.packet.source();
        if source == self.rt.identity.address() {
            debug!(%source, "dropping packet claiming our own source address");
            return false;
        }

        let Some(verb) = pkt.packet.verb() else {
            debug!(source = %source, verb = pkt.packet.raw_verb(), "dropping packet with unknown verb");
            return false;
        };

        let Some(peer) = self.rt.topology.peer(source) else {
            self.rt.topology.request_whois(source);
            debug!(%source, "packet from unknown peer, whois requested");
            return false;
        };

        if pkt.packet.dearmor(peer.key()).is_err() {
            debug!(%source, remote = %pkt.remote, "packet failed authentication");
            return false;
        }

        // OK and ERROR payloads lead with the verb and id they answer.
        let (in_re_verb, in_re_packet_id) = match verb {
            Verb::Ok | Verb::Error => (
                pkt.packet
                    .u8_at(IDX_PAYLOAD)
                    .ok()
                    .and_then(Verb::from_byte)
                    .unwrap_or(Verb::Nop),
                pkt.packet.u64_at(IDX_PAYLOAD + 1).unwrap_or(0),
            ),
            _ => (Verb::Nop, 0),
        };

        peer.received(
            &self.rt,
            pkt.local,
            pkt.remote,
            pkt.packet.hops(),
            pkt.packet.packet_id(),
            verb,
            in_re_verb,
            in_re_packet_id,
        );

        self.verb_handler.on_decoded(&pkt);
        true
    }
}

/// Verb handler that only logs; a stand-in until an embedder wires up
/// frame and control handling.
pub struct LoggingVerbHandler;

impl VerbHandler for LoggingVerbHandler {
    fn on_decoded(&self, pkt: &IncomingPacket) {
        debug!(
            source = %pkt.packet.source(),
            verb = %pkt.packet.verb().unwrap_or(Verb::Nop),
            len = pkt.packet.len(),
            "decoded packet"
        );
    }
}
