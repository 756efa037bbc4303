//! Backpressure point between the capture source and the rest of the pipeline.
//!
//! At most `capacity` capture frames are in flight. A frame that arrives while the
//! pipeline is full is never queued behind the others: depending on `OverflowPolicy` it
//! either replaces the single pending frame or is discarded. The camera callback is never
//! blocked.
//!
//! In-flight frames are tracked as tickets keyed by capture index. A `Consumed(i)` signal
//! from the sink retires every ticket with index <= i, since the sink never regresses and
//! anything older than `i` has already left the pipeline (delivered, superseded or
//! dropped on the way).

use serde::Deserialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use super::packet::{Packet, PortKind, Signal};
use super::stage::{Outbox, Stage, StageCounters};
use crate::frame::CaptureFrame;

pub const CAPTURE_PORT: usize = 0;
pub const SIGNAL_PORT: usize = 1;

/// What to do with a frame that arrives while the throttle is full.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Keep the newest frame as pending and admit it on the next consume signal.
    #[default]
    KeepNewest,
    /// Discard it.
    Discard,
}

impl std::str::FromStr for OverflowPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "keep_newest" => Ok(OverflowPolicy::KeepNewest),
            "discard" => Ok(OverflowPolicy::Discard),
            other => Err(anyhow::anyhow!(
                "overflow policy must be keep_newest or discard, got '{}'",
                other
            )),
        }
    }
}

#[derive(Debug)]
struct Ticket {
    index: u64,
    admitted_at: Instant,
}

pub struct Throttle {
    capacity: usize,
    policy: OverflowPolicy,
    stall_timeout: Option<Duration>,
    in_flight: VecDeque<Ticket>,
    pending: Option<CaptureFrame>,
    peak_in_flight: usize,
    counters: StageCounters,
}

impl Throttle {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        assert!(capacity > 0, "throttle capacity must be at least one");
        Self {
            capacity,
            policy,
            stall_timeout: None,
            in_flight: VecDeque::with_capacity(capacity),
            pending: None,
            peak_in_flight: 0,
            counters: StageCounters::default(),
        }
    }

    /// Reclaim tickets older than `timeout`; their frames were lost downstream.
    pub fn with_stall_timeout(mut self, timeout: Duration) -> Self {
        self.stall_timeout = Some(timeout);
        self
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Highest in-flight count ever observed.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight
    }

    pub fn pending_index(&self) -> Option<u64> {
        self.pending.as_ref().map(CaptureFrame::index)
    }

    fn on_capture(&mut self, frame: CaptureFrame, now: Instant, out: &mut Outbox) {
        self.reclaim_stalled(now);
        if self.in_flight.len() < self.capacity {
            self.admit(frame, now, out);
            return;
        }
        match self.policy {
            OverflowPolicy::KeepNewest => {
                if let Some(displaced) = self.pending.replace(frame) {
                    log::trace!("throttle: frame {} displaced by newer", displaced.index());
                    self.counters.dropped += 1;
                }
            }
            OverflowPolicy::Discard => {
                log::trace!("throttle: frame {} discarded", frame.index());
                self.counters.dropped += 1;
            }
        }
    }

    fn on_consumed(&mut self, index: u64, now: Instant, out: &mut Outbox) {
        self.in_flight.retain(|ticket| ticket.index > index);
        self.admit_pending(now, out);
    }

    fn admit_pending(&mut self, now: Instant, out: &mut Outbox) {
        if self.in_flight.len() >= self.capacity {
            return;
        }
        if let Some(frame) = self.pending.take() {
            self.admit(frame, now, out);
        }
    }

    fn admit(&mut self, frame: CaptureFrame, now: Instant, out: &mut Outbox) {
        self.in_flight.push_back(Ticket {
            index: frame.index(),
            admitted_at: now,
        });
        self.peak_in_flight = self.peak_in_flight.max(self.in_flight.len());
        self.counters.emitted += 1;
        out.push(0, Packet::Capture(frame));
    }

    fn reclaim_stalled(&mut self, now: Instant) {
        let Some(timeout) = self.stall_timeout else {
            return;
        };
        while let Some(oldest) = self.in_flight.front() {
            if now.saturating_duration_since(oldest.admitted_at) < timeout {
                break;
            }
            log::warn!(
                "throttle: frame {} not consumed within {:?}; reclaiming its slot",
                oldest.index,
                timeout
            );
            self.in_flight.pop_front();
            self.counters.timed_out += 1;
        }
    }
}

impl Stage for Throttle {
    fn kind(&self) -> &'static str {
        "throttle"
    }

    fn inputs(&self) -> Vec<PortKind> {
        vec![PortKind::Capture, PortKind::Signal]
    }

    fn outputs(&self) -> Vec<PortKind> {
        vec![PortKind::Capture]
    }

    fn receive(&mut self, port: usize, packet: Packet, out: &mut Outbox) {
        let now = Instant::now();
        match (port, packet) {
            (CAPTURE_PORT, Packet::Capture(frame)) => {
                self.counters.received += 1;
                self.on_capture(frame, now, out);
            }
            (SIGNAL_PORT, Packet::Signal(Signal::Consumed(index))) => {
                self.on_consumed(index, now, out);
            }
            (port, packet) => {
                log::warn!("throttle: unexpected {} packet on port {}", packet.kind(), port);
                self.counters.dropped += 1;
            }
        }
    }

    fn poll(&mut self, now: Instant, out: &mut Outbox) {
        self.reclaim_stalled(now);
        self.admit_pending(now, out);
    }

    fn queue_depth(&self) -> usize {
        self.in_flight.len() + usize::from(self.pending.is_some())
    }

    fn counters(&self) -> StageCounters {
        self.counters
    }

    fn teardown(&mut self) {
        self.pending = None;
        self.in_flight.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::tests::make_frame;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn push(throttle: &mut Throttle, index: u64) -> Vec<u64> {
        let mut out = Outbox::new();
        throttle.receive(CAPTURE_PORT, Packet::Capture(make_frame(index)), &mut out);
        out.into_packets().iter().map(|(_, p)| p.index()).collect()
    }

    fn consume(throttle: &mut Throttle, index: u64) -> Vec<u64> {
        let mut out = Outbox::new();
        throttle.receive(
            SIGNAL_PORT,
            Packet::Signal(Signal::Consumed(index)),
            &mut out,
        );
        out.into_packets().iter().map(|(_, p)| p.index()).collect()
    }

    #[test]
    fn keep_newest_admits_latest_pending_on_consume() {
        let mut throttle = Throttle::new(1, OverflowPolicy::KeepNewest);
        assert_eq!(push(&mut throttle, 1), vec![1]);
        assert!(push(&mut throttle, 2).is_empty());
        assert!(push(&mut throttle, 3).is_empty());
        assert_eq!(throttle.pending_index(), Some(3));

        assert_eq!(consume(&mut throttle, 1), vec![3]);
        assert_eq!(throttle.in_flight(), 1);
        assert_eq!(throttle.counters().dropped, 1);
    }

    #[test]
    fn discard_policy_keeps_nothing_pending() {
        let mut throttle = Throttle::new(1, OverflowPolicy::Discard);
        assert_eq!(push(&mut throttle, 1), vec![1]);
        assert!(push(&mut throttle, 2).is_empty());
        assert_eq!(throttle.pending_index(), None);
        assert!(consume(&mut throttle, 1).is_empty());
        assert_eq!(push(&mut throttle, 3), vec![3]);
    }

    #[test]
    fn consume_retires_older_tickets() {
        let mut throttle = Throttle::new(3, OverflowPolicy::KeepNewest);
        for index in 1..=3 {
            push(&mut throttle, index);
        }
        assert_eq!(throttle.in_flight(), 3);
        // Frame 2 reached the sink; frame 1 was lost along the way.
        consume(&mut throttle, 2);
        assert_eq!(throttle.in_flight(), 1);
    }

    #[test]
    fn stalled_tickets_are_reclaimed() {
        let mut throttle =
            Throttle::new(1, OverflowPolicy::KeepNewest).with_stall_timeout(Duration::from_millis(50));
        push(&mut throttle, 1);
        push(&mut throttle, 2);

        let mut out = Outbox::new();
        throttle.poll(Instant::now() + Duration::from_secs(1), &mut out);
        let admitted: Vec<u64> = out.into_packets().iter().map(|(_, p)| p.index()).collect();
        assert_eq!(admitted, vec![2]);
        assert_eq!(throttle.counters().timed_out, 1);
    }

    #[test]
    fn never_exceeds_capacity_under_random_signals() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for capacity in 1..=4 {
            for policy in [OverflowPolicy::KeepNewest, OverflowPolicy::Discard] {
                let mut throttle = Throttle::new(capacity, policy);
                let mut admitted: VecDeque<u64> = VecDeque::new();
                let mut next = 1u64;
                for _ in 0..2_000 {
                    if rng.gen_bool(0.6) {
                        admitted.extend(push(&mut throttle, next));
                        next += 1;
                    } else if let Some(&oldest) = admitted.front() {
                        // Consume some admitted frame; older ones count as lost.
                        let skip = rng.gen_range(0..admitted.len());
                        let index = admitted.get(skip).copied().unwrap_or(oldest);
                        admitted.retain(|&i| i > index);
                        admitted.extend(consume(&mut throttle, index));
                    }
                    assert!(throttle.in_flight() <= capacity);
                    assert_eq!(throttle.in_flight(), admitted.len());
                }
                assert!(throttle.peak_in_flight() <= capacity);
            }
        }
    }

    #[test]
    fn teardown_releases_pending() {
        let releases = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let mut throttle = Throttle::new(1, OverflowPolicy::KeepNewest);
        let mut out = Outbox::new();
        throttle.receive(
            CAPTURE_PORT,
            Packet::Capture(crate::frame::tests::make_counted_frame(1, releases.clone())),
            &mut out,
        );
        throttle.receive(
            CAPTURE_PORT,
            Packet::Capture(crate::frame::tests::make_counted_frame(2, releases.clone())),
            &mut out,
        );
        drop(out);
        assert_eq!(releases.load(std::sync::atomic::Ordering::SeqCst), 1);
        throttle.teardown();
        assert_eq!(releases.load(std::sync::atomic::Ordering::SeqCst), 2);
        assert_eq!(throttle.queue_depth(), 0);
    }
}
