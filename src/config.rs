use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::camera::CameraDeviceType;
use crate::frame::PixelFormat;
use crate::pipeline::OverflowPolicy;
use crate::track::backends::stub::DEFAULT_SIMULTANEOUS;

const DEFAULT_CAMERA_DEVICE: &str = "stub://back";
const DEFAULT_CAMERA_WIDTH: u32 = 1280;
const DEFAULT_CAMERA_HEIGHT: u32 = 720;
const DEFAULT_CAMERA_FPS: u32 = 30;
const DEFAULT_CAMERA_ORIENTATION: i32 = 90;
/// Frames the pipeline may hold (5) plus those the render side may hold (7).
const DEFAULT_BUFFER_CAPACITY: usize = 12;
const DEFAULT_THROTTLE_CAPACITY: usize = 1;
const DEFAULT_STALL_TIMEOUT_MS: u64 = 1000;
const DEFAULT_JOIN_TIMEOUT_MS: u64 = 500;
const DEFAULT_TICK_MS: u64 = 100;
const DEFAULT_TRACKER_NAME: &str = "image";
const DEFAULT_TRACKER_BACKEND: &str = "stub";
const DEFAULT_TARGETS: [&str; 3] = ["almondblossoms", "irises", "starrynight"];
const DEFAULT_RENDER_FPS: u32 = 60;
const DEFAULT_NEAR: f32 = 0.01;
const DEFAULT_FAR: f32 = 100.0;

#[derive(Debug, Deserialize, Default)]
struct SessionConfigFile {
    camera: Option<CameraConfigFile>,
    pipeline: Option<PipelineConfigFile>,
    trackers: Option<Vec<TrackerConfigFile>>,
    render: Option<RenderConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    device: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    fps: Option<u32>,
    buffer_capacity: Option<usize>,
    format: Option<PixelFormat>,
    device_type: Option<CameraDeviceType>,
    orientation: Option<i32>,
}

#[derive(Debug, Deserialize, Default)]
struct PipelineConfigFile {
    throttle_capacity: Option<usize>,
    overflow_policy: Option<OverflowPolicy>,
    stall_timeout_ms: Option<u64>,
    join_timeout_ms: Option<u64>,
    tick_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TrackerConfigFile {
    name: String,
    backend: Option<String>,
    simultaneous: Option<usize>,
    delay_ms: Option<u64>,
    targets: Option<Vec<TargetConfigFile>>,
}

#[derive(Debug, Deserialize)]
struct TargetConfigFile {
    name: String,
    path: Option<PathBuf>,
    scale: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct RenderConfigFile {
    fps: Option<u32>,
    near: Option<f32>,
    far: Option<f32>,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub camera: CameraSettings,
    pub pipeline: PipelineSettings,
    pub trackers: Vec<TrackerSettings>,
    pub render: RenderSettings,
}

#[derive(Debug, Clone)]
pub struct CameraSettings {
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub buffer_capacity: usize,
    pub format: PixelFormat,
    pub device_type: CameraDeviceType,
    /// Sensor rotation relative to the device's natural orientation, in degrees.
    pub orientation: i32,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            device: DEFAULT_CAMERA_DEVICE.to_string(),
            width: DEFAULT_CAMERA_WIDTH,
            height: DEFAULT_CAMERA_HEIGHT,
            fps: DEFAULT_CAMERA_FPS,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            format: PixelFormat::YuvNv21,
            device_type: CameraDeviceType::Back,
            orientation: DEFAULT_CAMERA_ORIENTATION,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub throttle_capacity: usize,
    pub overflow_policy: OverflowPolicy,
    pub stall_timeout: Duration,
    pub join_timeout: Duration,
    pub tick: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            throttle_capacity: DEFAULT_THROTTLE_CAPACITY,
            overflow_policy: OverflowPolicy::KeepNewest,
            stall_timeout: Duration::from_millis(DEFAULT_STALL_TIMEOUT_MS),
            join_timeout: Duration::from_millis(DEFAULT_JOIN_TIMEOUT_MS),
            tick: Duration::from_millis(DEFAULT_TICK_MS),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrackerSettings {
    pub name: String,
    pub backend: String,
    pub simultaneous: usize,
    /// Artificial per-frame latency of the stub backend.
    pub delay: Duration,
    pub targets: Vec<TargetSettings>,
}

impl TrackerSettings {
    pub fn stub(name: &str) -> Self {
        Self {
            name: name.to_string(),
            backend: DEFAULT_TRACKER_BACKEND.to_string(),
            simultaneous: DEFAULT_SIMULTANEOUS,
            delay: Duration::ZERO,
            targets: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TargetSettings {
    pub name: String,
    /// Asset file; when absent the target is derived from its name.
    pub path: Option<PathBuf>,
    pub scale: f32,
}

impl TargetSettings {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            path: None,
            scale: 1.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RenderSettings {
    pub fps: u32,
    pub near: f32,
    pub far: f32,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            fps: DEFAULT_RENDER_FPS,
            near: DEFAULT_NEAR,
            far: DEFAULT_FAR,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        let mut tracker = TrackerSettings::stub(DEFAULT_TRACKER_NAME);
        tracker.targets = DEFAULT_TARGETS
            .iter()
            .map(|name| TargetSettings::named(name))
            .collect();
        Self {
            camera: CameraSettings::default(),
            pipeline: PipelineSettings::default(),
            trackers: vec![tracker],
            render: RenderSettings::default(),
        }
    }
}

impl SessionConfig {
    /// Defaults, overlaid by the file named in `AR_PIPELINE_CONFIG` (if set), then by
    /// `AR_PIPELINE_*` environment variables.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("AR_PIPELINE_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        Self::finish(file_cfg.unwrap_or_default())
    }

    /// Like `load`, with an explicit config file instead of `AR_PIPELINE_CONFIG`.
    pub fn load_from(path: &Path) -> Result<Self> {
        Self::finish(read_config_file(path)?)
    }

    fn finish(file: SessionConfigFile) -> Result<Self> {
        let mut cfg = Self::from_file(file);
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: SessionConfigFile) -> Self {
        let defaults = Self::default();

        let camera_file = file.camera.unwrap_or_default();
        let camera = CameraSettings {
            device: camera_file.device.unwrap_or(defaults.camera.device),
            width: camera_file.width.unwrap_or(defaults.camera.width),
            height: camera_file.height.unwrap_or(defaults.camera.height),
            fps: camera_file.fps.unwrap_or(defaults.camera.fps),
            buffer_capacity: camera_file
                .buffer_capacity
                .unwrap_or(defaults.camera.buffer_capacity),
            format: camera_file.format.unwrap_or(defaults.camera.format),
            device_type: camera_file.device_type.unwrap_or(defaults.camera.device_type),
            orientation: camera_file.orientation.unwrap_or(defaults.camera.orientation),
        };

        let pipeline_file = file.pipeline.unwrap_or_default();
        let pipeline = PipelineSettings {
            throttle_capacity: pipeline_file
                .throttle_capacity
                .unwrap_or(defaults.pipeline.throttle_capacity),
            overflow_policy: pipeline_file
                .overflow_policy
                .unwrap_or(defaults.pipeline.overflow_policy),
            stall_timeout: pipeline_file
                .stall_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.pipeline.stall_timeout),
            join_timeout: pipeline_file
                .join_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.pipeline.join_timeout),
            tick: pipeline_file
                .tick_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.pipeline.tick),
        };

        let trackers = match file.trackers {
            Some(trackers) => trackers
                .into_iter()
                .map(|tracker| TrackerSettings {
                    name: tracker.name,
                    backend: tracker
                        .backend
                        .unwrap_or_else(|| DEFAULT_TRACKER_BACKEND.to_string()),
                    simultaneous: tracker.simultaneous.unwrap_or(DEFAULT_SIMULTANEOUS),
                    delay: Duration::from_millis(tracker.delay_ms.unwrap_or(0)),
                    targets: tracker
                        .targets
                        .unwrap_or_default()
                        .into_iter()
                        .map(|target| TargetSettings {
                            name: target.name,
                            path: target.path,
                            scale: target.scale.unwrap_or(1.0),
                        })
                        .collect(),
                })
                .collect(),
            None => defaults.trackers,
        };

        let render_file = file.render.unwrap_or_default();
        let render = RenderSettings {
            fps: render_file.fps.unwrap_or(defaults.render.fps),
            near: render_file.near.unwrap_or(defaults.render.near),
            far: render_file.far.unwrap_or(defaults.render.far),
        };

        Self {
            camera,
            pipeline,
            trackers,
            render,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(device) = std::env::var("AR_PIPELINE_CAMERA_DEVICE") {
            if !device.trim().is_empty() {
                self.camera.device = device.trim().to_string();
            }
        }
        if let Some(fps) = env_number::<u32>("AR_PIPELINE_CAMERA_FPS")? {
            self.camera.fps = fps;
        }
        if let Some(capacity) = env_number::<usize>("AR_PIPELINE_BUFFER_CAPACITY")? {
            self.camera.buffer_capacity = capacity;
        }
        if let Some(capacity) = env_number::<usize>("AR_PIPELINE_THROTTLE_CAPACITY")? {
            self.pipeline.throttle_capacity = capacity;
        }
        if let Ok(policy) = std::env::var("AR_PIPELINE_OVERFLOW_POLICY") {
            if !policy.trim().is_empty() {
                self.pipeline.overflow_policy = policy.parse()?;
            }
        }
        if let Some(ms) = env_number::<u64>("AR_PIPELINE_JOIN_TIMEOUT_MS")? {
            self.pipeline.join_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_number::<u64>("AR_PIPELINE_TRACKER_DELAY_MS")? {
            for tracker in &mut self.trackers {
                tracker.delay = Duration::from_millis(ms);
            }
        }
        if let Ok(targets) = std::env::var("AR_PIPELINE_TARGETS") {
            let parsed = split_csv(&targets);
            if !parsed.is_empty() {
                let tracker = self
                    .trackers
                    .first_mut()
                    .ok_or_else(|| anyhow!("AR_PIPELINE_TARGETS set but no tracker configured"))?;
                tracker.targets = parsed.iter().map(|name| TargetSettings::named(name)).collect();
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        let camera = &self.camera;
        if camera.width == 0 || camera.height == 0 {
            return Err(anyhow!("camera width and height must be greater than zero"));
        }
        if camera.fps == 0 {
            return Err(anyhow!("camera fps must be greater than zero"));
        }
        if camera.buffer_capacity == 0 {
            return Err(anyhow!("camera buffer_capacity must be greater than zero"));
        }
        if camera.orientation.rem_euclid(90) != 0 {
            return Err(anyhow!(
                "camera orientation must be a multiple of 90 degrees, got {}",
                camera.orientation
            ));
        }

        let pipeline = &self.pipeline;
        if pipeline.throttle_capacity == 0 {
            return Err(anyhow!("pipeline throttle_capacity must be at least one"));
        }
        if pipeline.tick.is_zero() {
            return Err(anyhow!("pipeline tick must be greater than zero"));
        }
        if pipeline.join_timeout.is_zero() || pipeline.stall_timeout.is_zero() {
            return Err(anyhow!("pipeline timeouts must be greater than zero"));
        }
        // In flight, pending, sink slot, feedback slot, one held by the renderer.
        let needed = pipeline.throttle_capacity + 4;
        if camera.buffer_capacity < needed {
            log::warn!(
                "camera buffer_capacity {} is below {}; the camera will skip samples",
                camera.buffer_capacity,
                needed
            );
        }

        let mut names = HashSet::new();
        for tracker in &self.trackers {
            crate::validate_name(&tracker.name)?;
            if !names.insert(tracker.name.as_str()) {
                return Err(anyhow!("tracker name '{}' used twice", tracker.name));
            }
            if tracker.simultaneous == 0 {
                return Err(anyhow!(
                    "tracker '{}': simultaneous must be at least one",
                    tracker.name
                ));
            }
            let mut targets = HashSet::new();
            for target in &tracker.targets {
                crate::validate_name(&target.name)?;
                if !targets.insert(target.name.as_str()) {
                    return Err(anyhow!(
                        "tracker '{}': target '{}' listed twice",
                        tracker.name,
                        target.name
                    ));
                }
                if !(target.scale.is_finite() && target.scale > 0.0) {
                    return Err(anyhow!(
                        "tracker '{}': target '{}' scale must be positive",
                        tracker.name,
                        target.name
                    ));
                }
            }
        }

        let render = &self.render;
        if render.fps == 0 {
            return Err(anyhow!("render fps must be greater than zero"));
        }
        if !(render.near > 0.0 && render.far > render.near) {
            return Err(anyhow!("render clip planes must satisfy 0 < near < far"));
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<SessionConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn env_number<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| anyhow!("{} must be a non-negative integer", key)),
        _ => Ok(None),
    }
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}
