//! Single-input transforms between frame kinds.

use super::packet::{Packet, PortKind};
use super::stage::{Outbox, Stage, StageCounters};
use crate::frame::{FeedbackFrame, PixelFormat, ResultFrame};

// ----------------------------------------------------------------------------
// FormatGate
// ----------------------------------------------------------------------------

/// Pipeline entry. Locks the pixel format and size of the first frame and refuses frames
/// that differ: the pipeline does not reconfigure mid-stream.
#[derive(Default)]
pub struct FormatGate {
    locked: Option<(PixelFormat, u32, u32)>,
    counters: StageCounters,
}

impl FormatGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn locked_format(&self) -> Option<(PixelFormat, u32, u32)> {
        self.locked
    }
}

impl Stage for FormatGate {
    fn kind(&self) -> &'static str {
        "format_gate"
    }

    fn inputs(&self) -> Vec<PortKind> {
        vec![PortKind::Capture]
    }

    fn outputs(&self) -> Vec<PortKind> {
        vec![PortKind::Capture]
    }

    fn receive(&mut self, _port: usize, packet: Packet, out: &mut Outbox) {
        self.counters.received += 1;
        let Packet::Capture(frame) = packet else {
            self.counters.dropped += 1;
            return;
        };
        let pixels = frame.pixels();
        let format = (pixels.format(), pixels.width(), pixels.height());
        match self.locked {
            None => {
                log::info!(
                    "pipeline input locked to {:?} {}x{}",
                    format.0,
                    format.1,
                    format.2
                );
                self.locked = Some(format);
            }
            Some(locked) if locked != format => {
                if self.counters.dropped == 0 {
                    log::warn!(
                        "refusing frame {}: {:?} {}x{} differs from locked {:?} {}x{}",
                        frame.index(),
                        format.0,
                        format.1,
                        format.2,
                        locked.0,
                        locked.1,
                        locked.2
                    );
                }
                self.counters.dropped += 1;
                return;
            }
            Some(_) => {}
        }
        self.counters.emitted += 1;
        out.push(0, Packet::Capture(frame));
    }

    fn counters(&self) -> StageCounters {
        self.counters
    }
}

// ----------------------------------------------------------------------------
// CaptureToResult
// ----------------------------------------------------------------------------

/// Pass-through branch: wraps a capture frame as a result frame with no tracker output.
#[derive(Default)]
pub struct CaptureToResult {
    counters: StageCounters,
}

impl CaptureToResult {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Stage for CaptureToResult {
    fn kind(&self) -> &'static str {
        "capture_to_result"
    }

    fn inputs(&self) -> Vec<PortKind> {
        vec![PortKind::Capture]
    }

    fn outputs(&self) -> Vec<PortKind> {
        vec![PortKind::Result]
    }

    fn receive(&mut self, _port: usize, packet: Packet, out: &mut Outbox) {
        self.counters.received += 1;
        match packet {
            Packet::Capture(frame) => {
                self.counters.emitted += 1;
                out.push(0, Packet::Result(ResultFrame::pending(frame, Vec::new())));
            }
            _ => self.counters.dropped += 1,
        }
    }

    fn counters(&self) -> StageCounters {
        self.counters
    }
}

// ----------------------------------------------------------------------------
// FeedbackAdapter
// ----------------------------------------------------------------------------

pub const FEEDBACK_CAPTURE_PORT: usize = 0;
pub const FEEDBACK_SIDE_PORT: usize = 1;

/// Pairs each capture frame with the newest completed result seen on the side input.
///
/// The side slot only moves forward by index, and holds a shared handle: the result it
/// references stays alive until a newer one replaces it or the graph stops.
#[derive(Default)]
pub struct FeedbackAdapter {
    latest: Option<ResultFrame>,
    counters: StageCounters,
}

impl FeedbackAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn latest_index(&self) -> Option<u64> {
        self.latest.as_ref().map(ResultFrame::index)
    }
}

impl Stage for FeedbackAdapter {
    fn kind(&self) -> &'static str {
        "feedback_adapter"
    }

    fn inputs(&self) -> Vec<PortKind> {
        vec![PortKind::Capture, PortKind::Result]
    }

    fn outputs(&self) -> Vec<PortKind> {
        vec![PortKind::Feedback]
    }

    fn receive(&mut self, port: usize, packet: Packet, out: &mut Outbox) {
        self.counters.received += 1;
        match (port, packet) {
            (FEEDBACK_CAPTURE_PORT, Packet::Capture(frame)) => {
                let previous = self.latest.as_ref().map(ResultFrame::share);
                self.counters.emitted += 1;
                out.push(0, Packet::Feedback(FeedbackFrame::new(frame, previous)));
            }
            (FEEDBACK_SIDE_PORT, Packet::Result(result)) => {
                if self.latest_index().is_some_and(|last| result.index() <= last) {
                    self.counters.dropped += 1;
                } else if self.latest.replace(result).is_some() {
                    self.counters.superseded += 1;
                }
            }
            (port, packet) => {
                log::warn!(
                    "feedback adapter: unexpected {} packet on port {}",
                    packet.kind(),
                    port
                );
                self.counters.dropped += 1;
            }
        }
    }

    fn queue_depth(&self) -> usize {
        usize::from(self.latest.is_some())
    }

    fn counters(&self) -> StageCounters {
        self.counters
    }

    fn teardown(&mut self) {
        self.latest = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::CameraParameters;
    use crate::frame::tests::make_frame;
    use crate::frame::{CaptureFrame, PixelBuffer};
    use std::time::Duration;

    #[test]
    fn gate_refuses_format_change() {
        let mut gate = FormatGate::new();
        let mut out = Outbox::new();
        gate.receive(0, Packet::Capture(make_frame(1)), &mut out);

        let resized = CaptureFrame::new(
            2,
            PixelBuffer::new(vec![0; 64], PixelFormat::Gray, 8, 8),
            CameraParameters::default(),
            Duration::ZERO,
        );
        gate.receive(0, Packet::Capture(resized), &mut out);
        gate.receive(0, Packet::Capture(make_frame(3)), &mut out);

        let indices: Vec<u64> = out.into_packets().iter().map(|(_, p)| p.index()).collect();
        assert_eq!(indices, vec![1, 3]);
        assert_eq!(gate.locked_format(), Some((PixelFormat::Gray, 4, 4)));
        assert_eq!(gate.counters().dropped, 1);
    }

    #[test]
    fn feedback_carries_latest_result() {
        let mut adapter = FeedbackAdapter::new();
        let mut out = Outbox::new();
        adapter.receive(0, Packet::Capture(make_frame(1)), &mut out);
        adapter.receive(
            FEEDBACK_SIDE_PORT,
            Packet::Result(ResultFrame::complete(make_frame(1), vec![])),
            &mut out,
        );
        adapter.receive(
            FEEDBACK_SIDE_PORT,
            Packet::Result(ResultFrame::complete(make_frame(0), vec![])),
            &mut out,
        );
        adapter.receive(0, Packet::Capture(make_frame(2)), &mut out);

        let previous: Vec<Option<u64>> = out
            .into_packets()
            .into_iter()
            .map(|(_, packet)| match packet {
                Packet::Feedback(frame) => frame.previous().map(ResultFrame::index),
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(previous, vec![None, Some(1)]);
        assert_eq!(adapter.counters().dropped, 1);

        adapter.teardown();
        assert_eq!(adapter.latest_index(), None);
    }

    #[test]
    fn pass_through_has_no_slots() {
        let mut stage = CaptureToResult::new();
        let mut out = Outbox::new();
        stage.receive(0, Packet::Capture(make_frame(4)), &mut out);
        match out.into_packets().pop() {
            Some((0, Packet::Result(frame))) => {
                assert_eq!(frame.index(), 4);
                assert!(frame.slots().is_empty());
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
