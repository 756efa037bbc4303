//! Frame model.
//!
//! - `PixelBuffer`: camera-owned pixel memory. Shared through `Arc`, released exactly once.
//! - `CaptureFrame`: one camera sample. Not `Clone`; every hand-off moves it.
//! - `FeedbackFrame`: a capture frame paired with the newest completed result (tracker input).
//! - `ResultFrame`: a capture frame plus one result slot per join input.
//!
//! Frames are moved from stage to stage. The only way to obtain a second handle to the
//! same payload is a fork stage (`share()` is crate-private), so a stage can never read a
//! frame it has already handed off:
//!
//! ```compile_fail
//! use ar_pipeline::{CameraParameters, CaptureFrame, PixelBuffer, PixelFormat};
//! use std::time::Duration;
//!
//! fn hand_off(_frame: CaptureFrame) {}
//!
//! let pixels = PixelBuffer::new(vec![0; 4], PixelFormat::Gray, 2, 2);
//! let frame = CaptureFrame::new(1, pixels, CameraParameters::default(), Duration::ZERO);
//! hand_off(frame);
//! let _ = frame.index();
//! ```
//!
//! ```compile_fail
//! use ar_pipeline::{CameraParameters, CaptureFrame, PixelBuffer, PixelFormat};
//! use std::time::Duration;
//!
//! let pixels = PixelBuffer::new(vec![0; 4], PixelFormat::Gray, 2, 2);
//! let frame = CaptureFrame::new(1, pixels, CameraParameters::default(), Duration::ZERO);
//! let _copy = frame.clone();
//! ```

use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use zeroize::Zeroize;

use crate::camera::CameraParameters;
use crate::track::TrackerResult;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    Gray,
    Rgb888,
    Rgba8888,
    Bgr888,
    Bgra8888,
    YuvNv21,
    YuvNv12,
    YuvI420,
    YuvYv12,
}

impl PixelFormat {
    /// Bytes needed for a `width` x `height` image in this format.
    pub fn buffer_len(self, width: u32, height: u32) -> usize {
        let pixels = width as usize * height as usize;
        match self {
            PixelFormat::Gray => pixels,
            PixelFormat::Rgb888 | PixelFormat::Bgr888 => pixels * 3,
            PixelFormat::Rgba8888 | PixelFormat::Bgra8888 => pixels * 4,
            PixelFormat::YuvNv21
            | PixelFormat::YuvNv12
            | PixelFormat::YuvI420
            | PixelFormat::YuvYv12 => pixels + pixels / 2,
        }
    }
}

// ----------------------------------------------------------------------------
// PixelBuffer
// ----------------------------------------------------------------------------

type ReleaseHook = Box<dyn FnOnce() + Send + Sync>;

/// Pixel memory owned by the capture source.
///
/// Dropping the last reference zeroes the bytes and runs the release hook, which is how
/// the capture source learns that one of its buffers is free again.
pub struct PixelBuffer {
    data: Vec<u8>,
    format: PixelFormat,
    width: u32,
    height: u32,
    on_release: Option<ReleaseHook>,
}

impl PixelBuffer {
    pub fn new(data: Vec<u8>, format: PixelFormat, width: u32, height: u32) -> Self {
        Self {
            data,
            format,
            width,
            height,
            on_release: None,
        }
    }

    /// Runs `hook` exactly once, when the buffer is released.
    pub fn with_release_hook(mut self, hook: impl FnOnce() + Send + Sync + 'static) -> Self {
        self.on_release = Some(Box::new(hook));
        self
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Read-only view of the pixels. The borrow cannot outlive the frame holding the buffer.
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl fmt::Debug for PixelBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PixelBuffer")
            .field("format", &self.format)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("len", &self.data.len())
            .finish()
    }
}

impl Drop for PixelBuffer {
    fn drop(&mut self) {
        self.data.zeroize();
        if let Some(hook) = self.on_release.take() {
            hook();
        }
    }
}

// ----------------------------------------------------------------------------
// CaptureFrame
// ----------------------------------------------------------------------------

/// One camera sample.
///
/// Explicitly NOT `Clone`. Stages take ownership on receipt; forks call the crate-private
/// `share()` which bumps the pixel buffer's reference count.
#[derive(Debug)]
pub struct CaptureFrame {
    index: u64,
    pixels: Arc<PixelBuffer>,
    camera: CameraParameters,
    timestamp: Duration,
}

impl CaptureFrame {
    pub fn new(
        index: u64,
        pixels: PixelBuffer,
        camera: CameraParameters,
        timestamp: Duration,
    ) -> Self {
        Self {
            index,
            pixels: Arc::new(pixels),
            camera,
            timestamp,
        }
    }

    /// Monotonic sequence index assigned by the capture source.
    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn pixels(&self) -> &PixelBuffer {
        &self.pixels
    }

    pub fn camera(&self) -> &CameraParameters {
        &self.camera
    }

    /// Capture time relative to the start of the capture session.
    pub fn timestamp(&self) -> Duration {
        self.timestamp
    }

    /// Number of live handles to this frame's pixel buffer.
    pub fn holders(&self) -> usize {
        Arc::strong_count(&self.pixels)
    }

    pub(crate) fn share(&self) -> Self {
        Self {
            index: self.index,
            pixels: Arc::clone(&self.pixels),
            camera: self.camera.clone(),
            timestamp: self.timestamp,
        }
    }
}

// ----------------------------------------------------------------------------
// FeedbackFrame
// ----------------------------------------------------------------------------

/// Tracker input: the current capture frame plus the newest result the pipeline produced.
#[derive(Debug)]
pub struct FeedbackFrame {
    input: CaptureFrame,
    previous: Option<ResultFrame>,
}

impl FeedbackFrame {
    pub fn new(input: CaptureFrame, previous: Option<ResultFrame>) -> Self {
        Self { input, previous }
    }

    pub fn index(&self) -> u64 {
        self.input.index()
    }

    pub fn input(&self) -> &CaptureFrame {
        &self.input
    }

    pub fn previous(&self) -> Option<&ResultFrame> {
        self.previous.as_ref()
    }

    /// Releases the previous result and returns the capture frame.
    pub fn into_input(self) -> CaptureFrame {
        self.input
    }

    pub(crate) fn share(&self) -> Self {
        Self {
            input: self.input.share(),
            previous: self.previous.as_ref().map(ResultFrame::share),
        }
    }
}

// ----------------------------------------------------------------------------
// ResultFrame
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameStatus {
    /// Produced by a branch, not yet combined.
    Pending,
    /// Emitted by the join with every slot resolved.
    Complete,
    /// Abandoned by a branch (e.g. coalesced away by a busy tracker).
    Dropped,
}

/// One join input's contribution to a result frame.
#[derive(Clone, Debug, PartialEq)]
pub enum ResultSlot {
    /// The branch processed the frame and had nothing to report.
    Empty,
    Tracked(TrackerResult),
    /// The branch never processed this index.
    Skipped,
    /// The branch does not apply to this frame (no targets, or it timed out).
    NotApplicable,
}

impl ResultSlot {
    pub fn result(&self) -> Option<&TrackerResult> {
        match self {
            ResultSlot::Tracked(result) => Some(result),
            _ => None,
        }
    }
}

/// Capture frame plus result slots. Cheap to share; the render loop reads these.
#[derive(Debug)]
pub struct ResultFrame {
    inner: Arc<ResultInner>,
}

#[derive(Debug)]
struct ResultInner {
    input: CaptureFrame,
    slots: Vec<ResultSlot>,
    status: FrameStatus,
}

impl ResultFrame {
    pub fn pending(input: CaptureFrame, slots: Vec<ResultSlot>) -> Self {
        Self::with_status(input, slots, FrameStatus::Pending)
    }

    /// A branch's notice that it will not produce a result for `input`.
    pub fn dropped(input: CaptureFrame) -> Self {
        Self::with_status(input, vec![ResultSlot::Skipped], FrameStatus::Dropped)
    }

    pub(crate) fn complete(input: CaptureFrame, slots: Vec<ResultSlot>) -> Self {
        Self::with_status(input, slots, FrameStatus::Complete)
    }

    fn with_status(input: CaptureFrame, slots: Vec<ResultSlot>, status: FrameStatus) -> Self {
        Self {
            inner: Arc::new(ResultInner {
                input,
                slots,
                status,
            }),
        }
    }

    pub fn index(&self) -> u64 {
        self.inner.input.index()
    }

    pub fn input(&self) -> &CaptureFrame {
        &self.inner.input
    }

    pub fn slots(&self) -> &[ResultSlot] {
        &self.inner.slots
    }

    /// Tracker results carried by this frame, in slot order.
    pub fn results(&self) -> impl Iterator<Item = &TrackerResult> {
        self.inner.slots.iter().filter_map(ResultSlot::result)
    }

    pub fn status(&self) -> FrameStatus {
        self.inner.status
    }

    pub(crate) fn share(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
