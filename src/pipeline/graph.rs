//! Graph assembly and packet routing.
//!
//! A graph is assembled once from a list of stages and an explicit connection table.
//! `GraphBuilder::build` validates the table before anything runs:
//! - every port referenced exists and both ends carry the same `PortKind`
//! - every input port has exactly one producer (a connection or an exposed inlet)
//! - every output port feeds exactly one connection (fan-out only through fork stages)
//!
//! Delivery is push based. Every stage has an inbox. A producer appends to the consumer's
//! inbox, and whichever thread then takes the consumer's stage lock drains the inbox in
//! order. A stage's outputs are appended to the next inboxes while its own lock is still
//! held, so delivery order on every edge equals production order even when several
//! threads drive the same stage. No thread holds two stage locks at once (inbox locks are
//! leaves), so the signal path from the sink back to the throttle cannot deadlock against
//! the data path.

use anyhow::{anyhow, Result};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Instant;

use super::packet::{Packet, PortKind};
use super::stage::{Outbox, Stage, StageContext, StageCounters, StageId};
use crate::frame::CaptureFrame;

/// One end of a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PortRef {
    pub stage: StageId,
    pub port: usize,
}

/// Directed edge: producer output port -> consumer input port.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Connection {
    pub from: PortRef,
    pub to: PortRef,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

/// Malformed topology, reported by `GraphBuilder::build` before the pipeline starts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TopologyError {
    DuplicateStageName(String),
    UnknownStage(usize),
    NoSuchPort {
        stage: String,
        direction: Direction,
        port: usize,
    },
    KindMismatch {
        from: String,
        to: String,
        produced: PortKind,
        expected: PortKind,
    },
    InputWiredTwice {
        stage: String,
        port: usize,
    },
    OutputWiredTwice {
        stage: String,
        port: usize,
    },
    InputUnwired {
        stage: String,
        port: usize,
    },
    OutputUnwired {
        stage: String,
        port: usize,
    },
}

impl fmt::Display for TopologyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopologyError::DuplicateStageName(name) => {
                write!(f, "stage name '{}' used twice", name)
            }
            TopologyError::UnknownStage(id) => write!(f, "unknown stage id {}", id),
            TopologyError::NoSuchPort {
                stage,
                direction,
                port,
            } => write!(f, "stage '{}' has no {:?} port {}", stage, direction, port),
            TopologyError::KindMismatch {
                from,
                to,
                produced,
                expected,
            } => write!(
                f,
                "'{}' produces {} but '{}' expects {}",
                from, produced, to, expected
            ),
            TopologyError::InputWiredTwice { stage, port } => {
                write!(f, "input {} of '{}' has more than one producer", port, stage)
            }
            TopologyError::OutputWiredTwice { stage, port } => write!(
                f,
                "output {} of '{}' is connected twice (use a fork stage)",
                port, stage
            ),
            TopologyError::InputUnwired { stage, port } => {
                write!(f, "input {} of '{}' is not connected", port, stage)
            }
            TopologyError::OutputUnwired { stage, port } => {
                write!(f, "output {} of '{}' is not connected", port, stage)
            }
        }
    }
}

impl std::error::Error for TopologyError {}

// ----------------------------------------------------------------------------
// GraphBuilder
// ----------------------------------------------------------------------------

struct PendingStage {
    name: String,
    stage: Box<dyn Stage>,
}

/// Collects stages and connections, then validates them into a `Graph`.
#[derive(Default)]
pub struct GraphBuilder {
    stages: Vec<PendingStage>,
    connections: Vec<Connection>,
    exposed: Vec<PortRef>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_stage(&mut self, name: impl Into<String>, stage: impl Stage + 'static) -> StageId {
        let id = StageId(self.stages.len());
        self.stages.push(PendingStage {
            name: name.into(),
            stage: Box::new(stage),
        });
        id
    }

    /// Wire `from`'s output `out_port` to `to`'s input `in_port`.
    pub fn connect(
        &mut self,
        from: StageId,
        out_port: usize,
        to: StageId,
        in_port: usize,
    ) -> &mut Self {
        self.connections.push(Connection {
            from: PortRef {
                stage: from,
                port: out_port,
            },
            to: PortRef {
                stage: to,
                port: in_port,
            },
        });
        self
    }

    /// Declare an input port fed from outside the graph (through a `FrameInlet`).
    pub fn expose_input(&mut self, stage: StageId, port: usize) -> &mut Self {
        self.exposed.push(PortRef { stage, port });
        self
    }

    pub fn build(self) -> Result<Graph> {
        let routes = self.validate().map_err(anyhow::Error::new)?;

        let names: Vec<String> = self.stages.iter().map(|s| s.name.clone()).collect();
        let cells = self
            .stages
            .into_iter()
            .map(|pending| StageCell {
                name: pending.name,
                kind: pending.stage.kind(),
                stage: Mutex::new(pending.stage),
                inbox: Mutex::new(VecDeque::new()),
            })
            .collect();
        let router = Arc::new(Router {
            stages: cells,
            routes,
            running: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            undelivered: AtomicU64::new(0),
        });

        for (index, cell) in router.stages.iter().enumerate() {
            let id = StageId(index);
            let ctx = StageContext {
                id,
                name: names[index].clone(),
                emitter: Emitter {
                    router: Arc::downgrade(&router),
                    stage: id,
                },
            };
            router.lock(cell).attach(ctx);
        }

        log::debug!(
            "graph assembled: {} stages, {} connections",
            router.stages.len(),
            self.connections.len()
        );
        Ok(Graph {
            router,
            connections: self.connections,
            exposed: self.exposed,
        })
    }

    /// Returns the routing table (destination per stage output port) if the topology is sound.
    fn validate(&self) -> std::result::Result<Vec<Vec<Option<PortRef>>>, TopologyError> {
        let mut seen_names = HashSet::new();
        for pending in &self.stages {
            if !seen_names.insert(pending.name.as_str()) {
                return Err(TopologyError::DuplicateStageName(pending.name.clone()));
            }
        }

        let inputs: Vec<Vec<PortKind>> = self.stages.iter().map(|s| s.stage.inputs()).collect();
        let outputs: Vec<Vec<PortKind>> = self.stages.iter().map(|s| s.stage.outputs()).collect();
        let name = |id: StageId| self.stages[id.0].name.clone();
        let check_stage = |id: StageId| {
            if id.0 < self.stages.len() {
                Ok(())
            } else {
                Err(TopologyError::UnknownStage(id.0))
            }
        };

        let mut routes: Vec<Vec<Option<PortRef>>> =
            outputs.iter().map(|ports| vec![None; ports.len()]).collect();
        let mut fed: Vec<Vec<bool>> = inputs.iter().map(|ports| vec![false; ports.len()]).collect();

        for exposed in &self.exposed {
            check_stage(exposed.stage)?;
            let slot = fed[exposed.stage.0]
                .get_mut(exposed.port)
                .ok_or_else(|| TopologyError::NoSuchPort {
                    stage: name(exposed.stage),
                    direction: Direction::Input,
                    port: exposed.port,
                })?;
            if *slot {
                return Err(TopologyError::InputWiredTwice {
                    stage: name(exposed.stage),
                    port: exposed.port,
                });
            }
            *slot = true;
        }

        for conn in &self.connections {
            check_stage(conn.from.stage)?;
            check_stage(conn.to.stage)?;
            let produced = *outputs[conn.from.stage.0].get(conn.from.port).ok_or_else(|| {
                TopologyError::NoSuchPort {
                    stage: name(conn.from.stage),
                    direction: Direction::Output,
                    port: conn.from.port,
                }
            })?;
            let expected = *inputs[conn.to.stage.0].get(conn.to.port).ok_or_else(|| {
                TopologyError::NoSuchPort {
                    stage: name(conn.to.stage),
                    direction: Direction::Input,
                    port: conn.to.port,
                }
            })?;
            if produced != expected {
                return Err(TopologyError::KindMismatch {
                    from: name(conn.from.stage),
                    to: name(conn.to.stage),
                    produced,
                    expected,
                });
            }
            let route = &mut routes[conn.from.stage.0][conn.from.port];
            if route.is_some() {
                return Err(TopologyError::OutputWiredTwice {
                    stage: name(conn.from.stage),
                    port: conn.from.port,
                });
            }
            *route = Some(conn.to);
            let slot = &mut fed[conn.to.stage.0][conn.to.port];
            if *slot {
                return Err(TopologyError::InputWiredTwice {
                    stage: name(conn.to.stage),
                    port: conn.to.port,
                });
            }
            *slot = true;
        }

        for (index, ports) in fed.iter().enumerate() {
            if let Some(port) = ports.iter().position(|wired| !wired) {
                return Err(TopologyError::InputUnwired {
                    stage: name(StageId(index)),
                    port,
                });
            }
        }
        for (index, ports) in routes.iter().enumerate() {
            if let Some(port) = ports.iter().position(Option::is_none) {
                return Err(TopologyError::OutputUnwired {
                    stage: name(StageId(index)),
                    port,
                });
            }
        }
        Ok(routes)
    }
}

// ----------------------------------------------------------------------------
// Router
// ----------------------------------------------------------------------------

struct StageCell {
    name: String,
    kind: &'static str,
    stage: Mutex<Box<dyn Stage>>,
    inbox: Mutex<VecDeque<(usize, Packet)>>,
}

pub(crate) struct Router {
    stages: Vec<StageCell>,
    routes: Vec<Vec<Option<PortRef>>>,
    running: AtomicBool,
    stopped: AtomicBool,
    undelivered: AtomicU64,
}

impl Router {
    fn lock<'a>(&self, cell: &'a StageCell) -> MutexGuard<'a, Box<dyn Stage>> {
        cell.stage.lock().unwrap_or_else(|poisoned| {
            log::error!("stage '{}' lock poisoned; continuing", cell.name);
            poisoned.into_inner()
        })
    }

    fn inbox<'a>(&self, cell: &'a StageCell) -> MutexGuard<'a, VecDeque<(usize, Packet)>> {
        cell.inbox.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn route(&self, from: StageId, port: usize) -> Option<PortRef> {
        self.routes.get(from.0).and_then(|ports| ports.get(port)).copied().flatten()
    }

    /// Push a packet out of `from`'s output `port` from outside its `receive`.
    fn dispatch(&self, from: StageId, port: usize, packet: Packet) -> bool {
        match self.route(from, port) {
            Some(dest) => self.deliver(dest, packet),
            None => {
                self.undelivered.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Post into `dest` and drain every stage that receives packets as a result.
    fn deliver(&self, dest: PortRef, packet: Packet) -> bool {
        if !self.running.load(Ordering::SeqCst) {
            self.undelivered.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        self.inbox(&self.stages[dest.stage.0])
            .push_back((dest.port, packet));
        self.drain(VecDeque::from([dest.stage]));
        true
    }

    fn drain(&self, mut ready: VecDeque<StageId>) {
        while let Some(id) = ready.pop_front() {
            let cell = &self.stages[id.0];
            let mut stage = self.lock(cell);
            loop {
                let next = self.inbox(cell).pop_front();
                let Some((port, packet)) = next else {
                    break;
                };
                // Checked under the stage lock: teardown clears `running` before it locks.
                if !self.running.load(Ordering::SeqCst) {
                    self.undelivered.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                let mut out = Outbox::new();
                stage.receive(port, packet, &mut out);
                self.forward(id, out, &mut ready);
            }
        }
    }

    /// Append `from`'s outputs to the destination inboxes. Callers hold `from`'s lock.
    fn forward(&self, from: StageId, mut out: Outbox, ready: &mut VecDeque<StageId>) {
        for (port, packet) in out.drain() {
            match self.route(from, port) {
                Some(next) => {
                    self.inbox(&self.stages[next.stage.0])
                        .push_back((next.port, packet));
                    if !ready.contains(&next.stage) {
                        ready.push_back(next.stage);
                    }
                }
                None => {
                    log::warn!(
                        "stage '{}' emitted on unwired port {}",
                        self.stages[from.0].name,
                        port
                    );
                    self.undelivered.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    pub(crate) fn tick(&self, now: Instant) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        for (index, cell) in self.stages.iter().enumerate() {
            let mut ready = VecDeque::new();
            {
                let mut stage = self.lock(cell);
                let mut out = Outbox::new();
                stage.poll(now, &mut out);
                self.forward(StageId(index), out, &mut ready);
            }
            self.drain(ready);
        }
    }
}

// ----------------------------------------------------------------------------
// Handles
// ----------------------------------------------------------------------------

/// Emits packets from one stage's output ports. Holds only a weak reference to the graph,
/// so outstanding handles never keep a stopped pipeline alive.
#[derive(Clone)]
pub struct Emitter {
    router: Weak<Router>,
    stage: StageId,
}

impl Emitter {
    /// Returns false when the graph is gone or stopped; the packet is then released.
    pub fn emit(&self, port: usize, packet: Packet) -> bool {
        match self.router.upgrade() {
            Some(router) => router.dispatch(self.stage, port, packet),
            None => false,
        }
    }
}

impl fmt::Debug for Emitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Emitter").field("stage", &self.stage).finish()
    }
}

/// Entry point for an external producer (the capture source).
#[derive(Clone)]
pub struct FrameInlet {
    router: Weak<Router>,
    target: PortRef,
}

impl FrameInlet {
    /// Hand a capture frame to the graph. Never blocks on downstream stages; returns false
    /// if the graph is not running (the frame is released).
    pub fn push(&self, frame: CaptureFrame) -> bool {
        match self.router.upgrade() {
            Some(router) => router.deliver(self.target, Packet::Capture(frame)),
            None => false,
        }
    }
}

impl fmt::Debug for FrameInlet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameInlet").field("target", &self.target).finish()
    }
}

// ----------------------------------------------------------------------------
// Graph
// ----------------------------------------------------------------------------

/// Point-in-time view of one stage.
#[derive(Clone, Debug)]
pub struct StageSnapshot {
    pub id: StageId,
    pub name: String,
    pub kind: &'static str,
    pub queue_depth: usize,
    pub counters: StageCounters,
}

/// A validated, owned pipeline graph. Dropping it stops it.
pub struct Graph {
    router: Arc<Router>,
    connections: Vec<Connection>,
    exposed: Vec<PortRef>,
}

impl Graph {
    pub fn stage_id(&self, name: &str) -> Option<StageId> {
        self.router
            .stages
            .iter()
            .position(|cell| cell.name == name)
            .map(StageId)
    }

    /// Inlet for an input port declared with `GraphBuilder::expose_input`.
    pub fn inlet(&self, stage: StageId, port: usize) -> Result<FrameInlet> {
        let target = PortRef { stage, port };
        if !self.exposed.contains(&target) {
            return Err(anyhow!(
                "input {} of stage {} is not exposed",
                port,
                stage.index()
            ));
        }
        Ok(FrameInlet {
            router: Arc::downgrade(&self.router),
            target,
        })
    }

    pub fn start(&self) -> Result<()> {
        if self.router.stopped.load(Ordering::SeqCst) {
            return Err(anyhow!("graph was stopped; assemble a new one"));
        }
        self.router.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.router.running.load(Ordering::SeqCst)
    }

    /// Run periodic maintenance on every stage.
    pub fn tick(&self, now: Instant) {
        self.router.tick(now);
    }

    pub(crate) fn router(&self) -> Weak<Router> {
        Arc::downgrade(&self.router)
    }

    /// Packets discarded because the graph was not running.
    pub fn undelivered(&self) -> u64 {
        self.router.undelivered.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> Vec<StageSnapshot> {
        self.router
            .stages
            .iter()
            .enumerate()
            .map(|(index, cell)| {
                let stage = self.router.lock(cell);
                let queued = self.router.inbox(cell).len();
                StageSnapshot {
                    id: StageId(index),
                    name: cell.name.clone(),
                    kind: cell.kind,
                    queue_depth: stage.queue_depth() + queued,
                    counters: stage.counters(),
                }
            })
            .collect()
    }

    /// Stop routing and tear down every stage exactly once. Idempotent.
    pub fn stop(&self) {
        self.router.running.store(false, Ordering::SeqCst);
        if self.router.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        for cell in &self.router.stages {
            let mut stage = self.router.lock(cell);
            stage.teardown();
            let stranded = self.router.inbox(cell).drain(..).count() as u64;
            self.router
                .undelivered
                .fetch_add(stranded, Ordering::Relaxed);
            log::debug!("stage {} torn down", cell.name);
        }
    }

    /// Human-readable connection table.
    pub fn describe(&self) -> String {
        let stages = &self.router.stages;
        let mut lines = Vec::with_capacity(self.connections.len() + self.exposed.len());
        for exposed in &self.exposed {
            lines.push(format!(
                "<external> -> {}.{}",
                stages[exposed.stage.0].name, exposed.port
            ));
        }
        for conn in &self.connections {
            lines.push(format!(
                "{}.{} -> {}.{}",
                stages[conn.from.stage.0].name,
                conn.from.port,
                stages[conn.to.stage.0].name,
                conn.to.port
            ));
        }
        lines.join("\n")
    }
}

impl Drop for Graph {
    fn drop(&mut self) {
        self.stop();
    }
}
