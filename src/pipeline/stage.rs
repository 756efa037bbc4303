use std::fmt;
use std::time::Instant;

use super::graph::Emitter;
use super::packet::{Packet, PortKind};

/// Index of a stage inside one graph.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StageId(pub(crate) usize);

impl StageId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Runtime handle given to a stage once the graph is built.
#[derive(Clone)]
pub struct StageContext {
    pub id: StageId,
    pub name: String,
    /// Pushes packets out of this stage's output ports from any thread.
    pub emitter: Emitter,
}

/// A processing unit in the graph.
///
/// `receive` runs inside a short critical section owned by the router: it must not block,
/// and it hands results back through the `Outbox` instead of calling other stages. Each
/// stage consumes the packets it receives; a packet it does not forward is released when
/// it is dropped.
pub trait Stage: Send {
    /// Short label for logs and topology dumps ("throttle", "join", ...).
    fn kind(&self) -> &'static str;

    fn inputs(&self) -> Vec<PortKind>;

    fn outputs(&self) -> Vec<PortKind>;

    fn receive(&mut self, port: usize, packet: Packet, out: &mut Outbox);

    /// Periodic maintenance (timeouts). Called from the maintenance tick.
    fn poll(&mut self, _now: Instant, _out: &mut Outbox) {}

    /// Called once after the graph is assembled.
    fn attach(&mut self, _ctx: StageContext) {}

    /// Frames currently held by this stage.
    fn queue_depth(&self) -> usize {
        0
    }

    fn counters(&self) -> StageCounters;

    /// Release everything held. Called exactly once when the graph stops.
    fn teardown(&mut self) {}
}

/// Packets produced by one `receive`/`poll` call, tagged with their output port.
#[derive(Debug, Default)]
pub struct Outbox {
    items: Vec<(usize, Packet)>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, port: usize, packet: Packet) {
        self.items.push((port, packet));
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = (usize, Packet)> + '_ {
        self.items.drain(..)
    }

    pub fn into_packets(self) -> Vec<(usize, Packet)> {
        self.items
    }
}

/// Per-stage diagnostics. Every drop in the pipeline is counted somewhere.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StageCounters {
    pub received: u64,
    pub emitted: u64,
    /// Frames discarded by policy (capacity, coalescing, format refusal, stale input).
    pub dropped: u64,
    /// Join inputs that arrived after their index was emitted.
    pub late: u64,
    /// Frames replaced by a newer one before they were used.
    pub superseded: u64,
    /// Join indices completed by timeout, or throttle tickets reclaimed after a stall.
    pub timed_out: u64,
}

impl fmt::Display for StageCounters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "in={} out={} dropped={} late={} superseded={} timed_out={}",
            self.received, self.emitted, self.dropped, self.late, self.superseded, self.timed_out
        )
    }
}
