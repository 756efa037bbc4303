//! Synthetic camera for `stub://` devices.
//!
//! Produces frames at the configured rate on a capture thread. Every pixel buffer carries
//! a release hook that returns it to a fixed-size pool; when the pool is empty the sample
//! is skipped and counted, the way a camera HAL drops frames when the app holds all of
//! its buffers.

use anyhow::{anyhow, Result};
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::{CaptureSource, CaptureStats};
use crate::camera::{CameraDeviceType, CameraParameters};
use crate::config::CameraSettings;
use crate::frame::{CaptureFrame, PixelBuffer, PixelFormat};
use crate::pipeline::FrameInlet;

const STUB_SCHEME: &str = "stub://";

#[derive(Default)]
struct Shared {
    next_index: AtomicU64,
    outstanding: AtomicUsize,
    captured: AtomicU64,
    dropped: AtomicU64,
    refused: AtomicU64,
}

pub struct SyntheticCamera {
    device: String,
    width: u32,
    height: u32,
    format: PixelFormat,
    interval: Duration,
    camera: CameraParameters,
    capacity: usize,
    opened_at: Option<Instant>,
    shared: Arc<Shared>,
    shutdown: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl SyntheticCamera {
    pub fn new(settings: &CameraSettings) -> Self {
        let device_type = if settings.device.ends_with("front") {
            CameraDeviceType::Front
        } else {
            settings.device_type
        };
        Self {
            device: settings.device.clone(),
            width: settings.width,
            height: settings.height,
            format: settings.format,
            interval: Duration::from_secs_f64(1.0 / f64::from(settings.fps.max(1))),
            camera: CameraParameters::from_size(
                settings.width,
                settings.height,
                device_type,
                settings.orientation,
            ),
            capacity: settings.buffer_capacity,
            opened_at: None,
            shared: Arc::new(Shared::default()),
            shutdown: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    pub fn camera(&self) -> &CameraParameters {
        &self.camera
    }
}

impl CaptureSource for SyntheticCamera {
    fn name(&self) -> &str {
        &self.device
    }

    fn open(&mut self) -> Result<()> {
        if !self.device.starts_with(STUB_SCHEME) {
            return Err(anyhow!(
                "camera device '{}' not available (only {} devices are built in)",
                self.device,
                STUB_SCHEME
            ));
        }
        if self.width == 0 || self.height == 0 {
            return Err(anyhow!("camera size must be non-zero"));
        }
        self.opened_at = Some(Instant::now());
        log::info!(
            "camera {} opened: {}x{} {:?}, {} buffers",
            self.device,
            self.width,
            self.height,
            self.format,
            self.capacity
        );
        Ok(())
    }

    fn set_buffer_capacity(&mut self, capacity: usize) {
        if self.worker.is_some() {
            log::warn!("camera {}: buffer capacity change ignored while streaming", self.device);
            return;
        }
        self.capacity = capacity.max(1);
    }

    fn buffer_capacity(&self) -> usize {
        self.capacity
    }

    fn start(&mut self, inlet: FrameInlet) -> Result<()> {
        let opened_at = self
            .opened_at
            .ok_or_else(|| anyhow!("camera {} started before open", self.device))?;
        if self.worker.is_some() {
            return Ok(());
        }
        self.shutdown.store(false, Ordering::SeqCst);

        let worker = CaptureWorker {
            format: self.format,
            width: self.width,
            height: self.height,
            interval: self.interval,
            camera: self.camera.clone(),
            capacity: self.capacity,
            opened_at,
            shared: self.shared.clone(),
            shutdown: self.shutdown.clone(),
            inlet,
        };
        let handle = std::thread::Builder::new()
            .name("capture".into())
            .spawn(move || worker.run())?;
        self.worker = Some(handle);
        log::debug!("camera {} streaming", self.device);
        Ok(())
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.worker.take() {
            handle.thread().unpark();
            if handle.join().is_err() {
                log::error!("camera {}: capture thread panicked", self.device);
            }
            log::debug!("camera {} stopped", self.device);
        }
    }

    fn is_streaming(&self) -> bool {
        self.worker.is_some()
    }

    fn stats(&self) -> CaptureStats {
        CaptureStats {
            frames_captured: self.shared.captured.load(Ordering::Relaxed),
            frames_dropped: self.shared.dropped.load(Ordering::Relaxed),
            frames_refused: self.shared.refused.load(Ordering::Relaxed),
            outstanding: self.shared.outstanding.load(Ordering::SeqCst),
        }
    }
}

impl Drop for SyntheticCamera {
    fn drop(&mut self) {
        self.stop();
    }
}

// ----------------------------------------------------------------------------
// Capture thread
// ----------------------------------------------------------------------------

struct CaptureWorker {
    format: PixelFormat,
    width: u32,
    height: u32,
    interval: Duration,
    camera: CameraParameters,
    capacity: usize,
    opened_at: Instant,
    shared: Arc<Shared>,
    shutdown: Arc<AtomicBool>,
    inlet: FrameInlet,
}

impl CaptureWorker {
    fn run(self) {
        let mut rng = rand::thread_rng();
        let mut next = Instant::now();
        while !self.shutdown.load(Ordering::SeqCst) {
            let now = Instant::now();
            if now < next {
                std::thread::park_timeout(next - now);
                continue;
            }
            next += self.interval;
            if next < now {
                next = now + self.interval;
            }
            self.sample(&mut rng);
        }
    }

    fn sample(&self, rng: &mut impl Rng) {
        if !self.reserve_buffer() {
            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            log::trace!("capture: all {} buffers in use, sample skipped", self.capacity);
            return;
        }

        let index = self.shared.next_index.fetch_add(1, Ordering::SeqCst) + 1;
        let shared = self.shared.clone();
        let pixels = PixelBuffer::new(
            self.render(index, rng),
            self.format,
            self.width,
            self.height,
        )
        .with_release_hook(move || {
            shared.outstanding.fetch_sub(1, Ordering::SeqCst);
        });
        let frame = CaptureFrame::new(
            index,
            pixels,
            self.camera.clone(),
            self.opened_at.elapsed(),
        );
        self.shared.captured.fetch_add(1, Ordering::Relaxed);
        if !self.inlet.push(frame) {
            self.shared.refused.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn reserve_buffer(&self) -> bool {
        self.shared
            .outstanding
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |held| {
                (held < self.capacity).then_some(held + 1)
            })
            .is_ok()
    }

    /// Horizontal gradient drifting with the index, plus a little sensor noise.
    fn render(&self, index: u64, rng: &mut impl Rng) -> Vec<u8> {
        let len = self.format.buffer_len(self.width, self.height);
        let row = self.width.max(1) as usize;
        let drift = (index % 256) as usize;
        let mut data: Vec<u8> = (0..len).map(|i| ((i % row + drift) % 256) as u8).collect();
        for _ in 0..(len / 1024).max(1) {
            let at = rng.gen_range(0..len);
            data[at] = rng.gen();
        }
        data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{GraphBuilder, Outbox, Packet, PortKind, Stage, StageCounters};
    use std::sync::Mutex;

    fn settings(device: &str) -> CameraSettings {
        CameraSettings {
            device: device.to_string(),
            width: 8,
            height: 4,
            fps: 500,
            buffer_capacity: 3,
            format: PixelFormat::YuvNv21,
            ..CameraSettings::default()
        }
    }

    /// Holds on to every frame it receives.
    struct Hoard(Arc<Mutex<Vec<CaptureFrame>>>);

    impl Stage for Hoard {
        fn kind(&self) -> &'static str {
            "hoard"
        }
        fn inputs(&self) -> Vec<PortKind> {
            vec![PortKind::Capture]
        }
        fn outputs(&self) -> Vec<PortKind> {
            vec![]
        }
        fn receive(&mut self, _port: usize, packet: Packet, _out: &mut Outbox) {
            if let Packet::Capture(frame) = packet {
                self.0.lock().unwrap().push(frame);
            }
        }
        fn counters(&self) -> StageCounters {
            StageCounters::default()
        }
    }

    fn wait_for(mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn non_stub_device_fails_to_open() {
        let mut camera = SyntheticCamera::new(&settings("/dev/video0"));
        assert!(camera.open().is_err());
    }

    #[test]
    fn exhausted_pool_drops_samples_and_indices_stay_monotonic() {
        let held = Arc::new(Mutex::new(Vec::new()));
        let mut builder = GraphBuilder::new();
        let hoard = builder.add_stage("hoard", Hoard(held.clone()));
        builder.expose_input(hoard, 0);
        let graph = builder.build().unwrap();
        graph.start().unwrap();

        let mut camera = SyntheticCamera::new(&settings("stub://back"));
        camera.open().unwrap();
        camera.start(graph.inlet(hoard, 0).unwrap()).unwrap();
        wait_for(|| camera.stats().frames_dropped > 0);
        camera.stop();

        let stats = camera.stats();
        assert_eq!(stats.frames_captured, 3);
        assert_eq!(stats.outstanding, 3);
        assert!(stats.frames_dropped > 0);
        {
            let frames = held.lock().unwrap();
            let indices: Vec<u64> = frames.iter().map(CaptureFrame::index).collect();
            assert_eq!(indices, vec![1, 2, 3]);
            assert_eq!(frames[0].pixels().len(), PixelFormat::YuvNv21.buffer_len(8, 4));
        }

        held.lock().unwrap().clear();
        assert_eq!(camera.stats().outstanding, 0);

        camera.start(graph.inlet(hoard, 0).unwrap()).unwrap();
        wait_for(|| !held.lock().unwrap().is_empty());
        camera.stop();
        let first_after_resume = held.lock().unwrap()[0].index();
        assert_eq!(first_after_resume, 4);
    }

    #[test]
    fn refused_frames_return_their_buffers() {
        let mut builder = GraphBuilder::new();
        let hoard = builder.add_stage("hoard", Hoard(Arc::new(Mutex::new(Vec::new()))));
        builder.expose_input(hoard, 0);
        let graph = builder.build().unwrap();

        let mut camera = SyntheticCamera::new(&settings("stub://back"));
        camera.open().unwrap();
        camera.start(graph.inlet(hoard, 0).unwrap()).unwrap();
        wait_for(|| camera.stats().frames_refused >= 5);
        camera.stop();

        let stats = camera.stats();
        assert!(stats.frames_refused >= 5);
        assert_eq!(stats.outstanding, 0);
        assert_eq!(stats.frames_dropped, 0);
    }

    #[test]
    fn start_before_open_is_an_error() {
        let graph = {
            let mut builder = GraphBuilder::new();
            let hoard = builder.add_stage("hoard", Hoard(Arc::new(Mutex::new(Vec::new()))));
            builder.expose_input(hoard, 0);
            builder.build().unwrap()
        };
        let inlet = graph.inlet(graph.stage_id("hoard").unwrap(), 0).unwrap();
        let mut camera = SyntheticCamera::new(&settings("stub://back"));
        assert!(camera.start(inlet).is_err());
    }
}
