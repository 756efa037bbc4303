//! Fan-in stage combining per-branch results that share a capture index.
//!
//! Each input port contributes exactly one slot of the emitted `ResultFrame`. An index is
//! emitted once every slot is resolved; ports marked not applicable are resolved up front.
//! Emission order is strictly increasing by index:
//! - an input for an index at or below the last emitted one is a late drop
//! - when a newer index completes first, older incomplete indices are superseded
//! - an index still incomplete after `timeout` gets `NotApplicable` for its missing slots

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use super::packet::{Packet, PortKind};
use super::stage::{Outbox, Stage, StageCounters};
use crate::frame::{CaptureFrame, FrameStatus, ResultFrame, ResultSlot};

struct PendingJoin {
    input: CaptureFrame,
    slots: Vec<Option<ResultSlot>>,
    first_seen: Instant,
}

impl PendingJoin {
    fn is_complete(&self) -> bool {
        self.slots.iter().all(Option::is_some)
    }
}

pub struct Join {
    not_applicable: Vec<bool>,
    timeout: Option<Duration>,
    pending: BTreeMap<u64, PendingJoin>,
    last_emitted: Option<u64>,
    counters: StageCounters,
}

impl Join {
    pub fn new(arity: usize) -> Self {
        assert!(arity > 0, "join needs at least one input");
        Self {
            not_applicable: vec![false; arity],
            timeout: None,
            pending: BTreeMap::new(),
            last_emitted: None,
            counters: StageCounters::default(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Treat `port` as satisfied for every index; anything arriving on it is ignored.
    pub fn mark_not_applicable(mut self, port: usize) -> Self {
        self.not_applicable[port] = true;
        self
    }

    pub fn arity(&self) -> usize {
        self.not_applicable.len()
    }

    pub fn last_emitted(&self) -> Option<u64> {
        self.last_emitted
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn accept(&mut self, port: usize, frame: ResultFrame, now: Instant) {
        let index = frame.index();
        if self.last_emitted.is_some_and(|last| index <= last) {
            log::debug!("join: late input for frame {} on port {}", index, port);
            self.counters.late += 1;
            return;
        }
        if self.not_applicable[port] {
            self.counters.dropped += 1;
            return;
        }

        let not_applicable = &self.not_applicable;
        let entry = self.pending.entry(index).or_insert_with(|| PendingJoin {
            input: frame.input().share(),
            slots: not_applicable
                .iter()
                .map(|&na| na.then_some(ResultSlot::NotApplicable))
                .collect(),
            first_seen: now,
        });

        let slot = if frame.status() == FrameStatus::Dropped {
            ResultSlot::Skipped
        } else {
            frame.slots().first().cloned().unwrap_or(ResultSlot::Empty)
        };
        if entry.slots[port].is_some() {
            log::debug!("join: duplicate input for frame {} on port {}", index, port);
            self.counters.late += 1;
            return;
        }
        entry.slots[port] = Some(slot);
    }

    fn expire(&mut self, now: Instant) {
        let Some(timeout) = self.timeout else {
            return;
        };
        for (index, entry) in self.pending.iter_mut() {
            if entry.is_complete() || now.saturating_duration_since(entry.first_seen) < timeout {
                continue;
            }
            log::debug!("join: frame {} timed out waiting for inputs", index);
            for slot in entry.slots.iter_mut().filter(|slot| slot.is_none()) {
                *slot = Some(ResultSlot::NotApplicable);
            }
            self.counters.timed_out += 1;
        }
    }

    fn flush(&mut self, out: &mut Outbox) {
        let Some(newest_complete) = self
            .pending
            .iter()
            .rev()
            .find(|(_, entry)| entry.is_complete())
            .map(|(&index, _)| index)
        else {
            return;
        };

        while let Some(entry) = self.pending.first_entry() {
            if *entry.key() > newest_complete {
                break;
            }
            let (index, entry) = entry.remove_entry();
            if !entry.is_complete() {
                log::debug!("join: frame {} superseded by {}", index, newest_complete);
                self.counters.superseded += 1;
                continue;
            }
            let slots = entry.slots.into_iter().flatten().collect();
            out.push(0, Packet::Result(ResultFrame::complete(entry.input, slots)));
            self.last_emitted = Some(index);
            self.counters.emitted += 1;
        }
    }
}

impl Stage for Join {
    fn kind(&self) -> &'static str {
        "join"
    }

    fn inputs(&self) -> Vec<PortKind> {
        vec![PortKind::Result; self.arity()]
    }

    fn outputs(&self) -> Vec<PortKind> {
        vec![PortKind::Result]
    }

    fn receive(&mut self, port: usize, packet: Packet, out: &mut Outbox) {
        self.counters.received += 1;
        let now = Instant::now();
        match packet {
            Packet::Result(frame) if port < self.arity() => self.accept(port, frame, now),
            other => {
                log::warn!("join: unexpected {} packet on port {}", other.kind(), port);
                self.counters.dropped += 1;
                return;
            }
        }
        self.expire(now);
        self.flush(out);
    }

    fn poll(&mut self, now: Instant, out: &mut Outbox) {
        self.expire(now);
        self.flush(out);
    }

    fn queue_depth(&self) -> usize {
        self.pending.len()
    }

    fn counters(&self) -> StageCounters {
        self.counters
    }

    fn teardown(&mut self) {
        self.pending.clear();
    }
}
