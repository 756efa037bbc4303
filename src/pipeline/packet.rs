use std::fmt;

use crate::frame::{CaptureFrame, FeedbackFrame, FrameStatus, ResultFrame};

/// What a port carries. Connections are only valid between ports of the same kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PortKind {
    Capture,
    Feedback,
    Result,
    Signal,
}

impl fmt::Display for PortKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PortKind::Capture => "capture",
            PortKind::Feedback => "feedback",
            PortKind::Result => "result",
            PortKind::Signal => "signal",
        };
        f.write_str(label)
    }
}

/// Control messages flowing against the data direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Signal {
    /// The sink handed the frame with this index to its reader.
    Consumed(u64),
}

/// Unit of delivery between stages.
#[derive(Debug)]
pub enum Packet {
    Capture(CaptureFrame),
    Feedback(FeedbackFrame),
    Result(ResultFrame),
    Signal(Signal),
}

impl Packet {
    pub fn kind(&self) -> PortKind {
        match self {
            Packet::Capture(_) => PortKind::Capture,
            Packet::Feedback(_) => PortKind::Feedback,
            Packet::Result(_) => PortKind::Result,
            Packet::Signal(_) => PortKind::Signal,
        }
    }

    /// Capture index this packet refers to.
    pub fn index(&self) -> u64 {
        match self {
            Packet::Capture(frame) => frame.index(),
            Packet::Feedback(frame) => frame.index(),
            Packet::Result(frame) => frame.index(),
            Packet::Signal(Signal::Consumed(index)) => *index,
        }
    }

    /// Second handle to the same payload. Only forks duplicate packets.
    pub(crate) fn share(&self) -> Packet {
        match self {
            Packet::Capture(frame) => Packet::Capture(frame.share()),
            Packet::Feedback(frame) => Packet::Feedback(frame.share()),
            Packet::Result(frame) => {
                debug_assert!(
                    frame.status() != FrameStatus::Dropped,
                    "forking dropped result frame {}",
                    frame.index()
                );
                Packet::Result(frame.share())
            }
            Packet::Signal(signal) => Packet::Signal(*signal),
        }
    }
}
