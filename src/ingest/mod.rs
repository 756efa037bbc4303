//! Capture sources feeding the pipeline.
//!
//! A source pushes `CaptureFrame`s into the graph through a `FrameInlet` from its own
//! thread. It never blocks on the pipeline: the inlet returns as soon as the entry stage
//! has taken (or refused) the frame.
//!
//! Only `stub://` devices are built in. They produce synthetic frames with the same buffer
//! accounting a hardware camera has, so the rest of the pipeline can be exercised without
//! one.

use anyhow::Result;

use crate::pipeline::FrameInlet;

mod synthetic;

pub use synthetic::SyntheticCamera;

/// Counters kept by a capture source.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub frames_captured: u64,
    /// Samples skipped because every buffer was still held downstream.
    pub frames_dropped: u64,
    /// Frames the graph refused because it was not running.
    pub frames_refused: u64,
    /// Buffers currently alive somewhere in the pipeline.
    pub outstanding: usize,
}

pub trait CaptureSource: Send {
    fn name(&self) -> &str;

    /// Acquire the device. Called once before `start`.
    fn open(&mut self) -> Result<()>;

    /// Number of pixel buffers the source may have alive at once.
    fn set_buffer_capacity(&mut self, capacity: usize);

    fn buffer_capacity(&self) -> usize;

    /// Begin delivering frames into `inlet`. Capture indices keep increasing across
    /// stop/start cycles.
    fn start(&mut self, inlet: FrameInlet) -> Result<()>;

    /// Stop delivering frames and wait for the capture thread. Idempotent.
    fn stop(&mut self);

    fn is_streaming(&self) -> bool;

    fn stats(&self) -> CaptureStats;
}
