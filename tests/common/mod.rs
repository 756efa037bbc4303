#![allow(dead_code)]

use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use ar_pipeline::config::SessionConfig;
use ar_pipeline::ingest::{CaptureSource, CaptureStats};
use ar_pipeline::pipeline::FrameInlet;
use ar_pipeline::track::{ImageTarget, TrackerBackend, TrackerResult};
use ar_pipeline::{CameraParameters, CaptureFrame, FeedbackFrame, PixelBuffer, PixelFormat};

/// Capture source driven by the test: frames are pushed by hand through `push`.
#[derive(Clone, Default)]
pub struct ManualSource {
    inlet: Arc<Mutex<Option<FrameInlet>>>,
    pub fail_open: bool,
    pub opened: Arc<AtomicBool>,
    capacity: usize,
}

impl ManualSource {
    pub fn failing() -> Self {
        Self {
            fail_open: true,
            ..Self::default()
        }
    }

    /// Returns whether the graph took the frame.
    pub fn push(&self, frame: CaptureFrame) -> bool {
        let inlet = self.inlet.lock().unwrap().clone();
        match inlet {
            Some(inlet) => inlet.push(frame),
            None => false,
        }
    }
}

impl CaptureSource for ManualSource {
    fn name(&self) -> &str {
        "manual"
    }

    fn open(&mut self) -> Result<()> {
        if self.fail_open {
            return Err(anyhow!("camera unavailable"));
        }
        self.opened.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn set_buffer_capacity(&mut self, capacity: usize) {
        self.capacity = capacity;
    }

    fn buffer_capacity(&self) -> usize {
        self.capacity
    }

    fn start(&mut self, inlet: FrameInlet) -> Result<()> {
        *self.inlet.lock().unwrap() = Some(inlet);
        Ok(())
    }

    fn stop(&mut self) {
        self.inlet.lock().unwrap().take();
    }

    fn is_streaming(&self) -> bool {
        self.inlet.lock().unwrap().is_some()
    }

    fn stats(&self) -> CaptureStats {
        CaptureStats::default()
    }
}

/// Tracker that records every index it is fed and takes `delay` per call.
pub struct RecordingTracker {
    pub seen: Arc<Mutex<Vec<u64>>>,
    pub busy: Arc<AtomicBool>,
    pub stopped: Arc<AtomicBool>,
    pub fail_start: bool,
    delay: Duration,
}

impl RecordingTracker {
    pub fn new(delay: Duration) -> Self {
        Self {
            seen: Arc::new(Mutex::new(Vec::new())),
            busy: Arc::new(AtomicBool::new(false)),
            stopped: Arc::new(AtomicBool::new(false)),
            fail_start: false,
            delay,
        }
    }
}

impl TrackerBackend for RecordingTracker {
    fn name(&self) -> &str {
        "recorder"
    }

    fn load_target(&mut self, _target: ImageTarget) -> Result<u32> {
        Ok(1)
    }

    fn unload_target(&mut self, _name: &str) -> Result<()> {
        Ok(())
    }

    fn target_count(&self) -> usize {
        1
    }

    fn start(&mut self) -> Result<()> {
        if self.fail_start {
            return Err(anyhow!("tracker license rejected"));
        }
        Ok(())
    }

    fn stop(&mut self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn track(&mut self, frame: &FeedbackFrame) -> Result<Option<TrackerResult>> {
        self.busy.store(true, Ordering::SeqCst);
        self.seen.lock().unwrap().push(frame.index());
        std::thread::sleep(self.delay);
        self.busy.store(false, Ordering::SeqCst);
        Ok(Some(TrackerResult {
            tracker: "recorder".into(),
            targets: Vec::new(),
        }))
    }
}

/// 4x4 gray frame whose buffer release bumps `releases`.
pub fn counted_frame(index: u64, releases: &Arc<AtomicUsize>) -> CaptureFrame {
    let releases = releases.clone();
    let pixels = PixelBuffer::new(vec![index as u8; 16], PixelFormat::Gray, 4, 4)
        .with_release_hook(move || {
            releases.fetch_add(1, Ordering::SeqCst);
        });
    CaptureFrame::new(
        index,
        pixels,
        CameraParameters::default(),
        Duration::from_millis(index * 33),
    )
}

/// Session settings for hand-driven tests: C=1, keep newest, long timeouts.
pub fn test_config() -> SessionConfig {
    let mut cfg = SessionConfig::default();
    cfg.trackers.clear();
    cfg.pipeline.tick = Duration::from_millis(10);
    cfg.pipeline.join_timeout = Duration::from_secs(5);
    cfg.pipeline.stall_timeout = Duration::from_secs(10);
    cfg
}

pub fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    done()
}
