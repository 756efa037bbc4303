use super::packet::{Packet, PortKind};
use super::stage::{Outbox, Stage, StageCounters};

/// Duplicates each input packet to `arity` outputs without copying payloads.
///
/// Every duplicate is an independent handle: a consumer that finishes early releases only
/// its own copy, and the payload is freed once all of them are gone.
pub struct Fork {
    kind: PortKind,
    arity: usize,
    counters: StageCounters,
}

impl Fork {
    pub fn new(kind: PortKind, arity: usize) -> Self {
        assert!(arity > 0, "fork needs at least one output");
        Self {
            kind,
            arity,
            counters: StageCounters::default(),
        }
    }

    pub fn arity(&self) -> usize {
        self.arity
    }
}

impl Stage for Fork {
    fn kind(&self) -> &'static str {
        "fork"
    }

    fn inputs(&self) -> Vec<PortKind> {
        vec![self.kind]
    }

    fn outputs(&self) -> Vec<PortKind> {
        vec![self.kind; self.arity]
    }

    fn receive(&mut self, _port: usize, packet: Packet, out: &mut Outbox) {
        self.counters.received += 1;
        if packet.kind() != self.kind {
            log::warn!("fork: unexpected {} packet", packet.kind());
            self.counters.dropped += 1;
            return;
        }
        for port in 0..self.arity - 1 {
            out.push(port, packet.share());
        }
        out.push(self.arity - 1, packet);
        self.counters.emitted += self.arity as u64;
    }

    fn counters(&self) -> StageCounters {
        self.counters
    }
}
