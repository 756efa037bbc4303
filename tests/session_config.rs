use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::{Builder, NamedTempFile};

use ar_pipeline::camera::CameraDeviceType;
use ar_pipeline::config::SessionConfig;
use ar_pipeline::pipeline::OverflowPolicy;
use ar_pipeline::PixelFormat;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "AR_PIPELINE_CONFIG",
        "AR_PIPELINE_CAMERA_DEVICE",
        "AR_PIPELINE_CAMERA_FPS",
        "AR_PIPELINE_BUFFER_CAPACITY",
        "AR_PIPELINE_THROTTLE_CAPACITY",
        "AR_PIPELINE_OVERFLOW_POLICY",
        "AR_PIPELINE_JOIN_TIMEOUT_MS",
        "AR_PIPELINE_TRACKER_DELAY_MS",
        "AR_PIPELINE_TARGETS",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn defaults_match_the_sample_session() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = SessionConfig::load().expect("load defaults");
    assert_eq!(cfg.camera.device, "stub://back");
    assert_eq!((cfg.camera.width, cfg.camera.height), (1280, 720));
    assert_eq!(cfg.camera.buffer_capacity, 12);
    assert_eq!(cfg.camera.format, PixelFormat::YuvNv21);
    assert_eq!(cfg.pipeline.throttle_capacity, 1);
    assert_eq!(cfg.pipeline.overflow_policy, OverflowPolicy::KeepNewest);
    assert_eq!(cfg.trackers.len(), 1);
    let targets: Vec<&str> = cfg.trackers[0].targets.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(targets, vec!["almondblossoms", "irises", "starrynight"]);
    assert_eq!(
        cfg.trackers[0].simultaneous,
        ar_pipeline::track::backends::stub::DEFAULT_SIMULTANEOUS
    );
    assert_eq!(cfg.render.fps, 60);
}

#[test]
fn loads_json_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "camera": {
            "device": "stub://front",
            "width": 640,
            "height": 480,
            "fps": 15,
            "buffer_capacity": 8,
            "format": "rgb888",
            "device_type": "front",
            "orientation": 270
        },
        "pipeline": {
            "throttle_capacity": 2,
            "overflow_policy": "discard",
            "join_timeout_ms": 250
        },
        "trackers": [
            { "name": "cover", "simultaneous": 2, "targets": [{ "name": "album", "scale": 0.5 }] },
            { "name": "face" }
        ],
        "render": { "fps": 30, "near": 0.1, "far": 50.0 }
    }"#;
    file.write_all(json.as_bytes()).expect("write config");

    std::env::set_var("AR_PIPELINE_CONFIG", file.path());
    std::env::set_var("AR_PIPELINE_THROTTLE_CAPACITY", "3");
    std::env::set_var("AR_PIPELINE_TRACKER_DELAY_MS", "40");

    let cfg = SessionConfig::load().expect("load config");
    assert_eq!(cfg.camera.device, "stub://front");
    assert_eq!(cfg.camera.fps, 15);
    assert_eq!(cfg.camera.format, PixelFormat::Rgb888);
    assert_eq!(cfg.camera.device_type, CameraDeviceType::Front);
    assert_eq!(cfg.camera.orientation, 270);
    assert_eq!(cfg.pipeline.throttle_capacity, 3);
    assert_eq!(cfg.pipeline.overflow_policy, OverflowPolicy::Discard);
    assert_eq!(cfg.pipeline.join_timeout, Duration::from_millis(250));
    assert_eq!(cfg.pipeline.tick, Duration::from_millis(100));
    assert_eq!(cfg.trackers.len(), 2);
    assert_eq!(cfg.trackers[0].targets[0].scale, 0.5);
    assert_eq!(cfg.trackers[1].backend, "stub");
    assert!(cfg.trackers[1].targets.is_empty());
    assert!(cfg
        .trackers
        .iter()
        .all(|tracker| tracker.delay == Duration::from_millis(40)));
    assert_eq!(cfg.render.far, 50.0);

    clear_env();
}

#[test]
fn loads_toml_by_extension() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = Builder::new().suffix(".toml").tempfile().expect("temp config");
    let toml = r#"
[camera]
fps = 24
format = "yuv_i420"

[pipeline]
overflow_policy = "keep_newest"
tick_ms = 20

[[trackers]]
name = "image"
delay_ms = 90

[[trackers.targets]]
name = "irises"
"#;
    file.write_all(toml.as_bytes()).expect("write config");

    let cfg = SessionConfig::load_from(file.path()).expect("load toml");
    assert_eq!(cfg.camera.fps, 24);
    assert_eq!(cfg.camera.format, PixelFormat::YuvI420);
    assert_eq!(cfg.pipeline.tick, Duration::from_millis(20));
    assert_eq!(cfg.trackers[0].delay, Duration::from_millis(90));
    assert_eq!(cfg.trackers[0].targets[0].name, "irises");
    assert_eq!(cfg.trackers[0].targets[0].scale, 1.0);
}

#[test]
fn env_target_list_replaces_first_tracker_targets() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("AR_PIPELINE_TARGETS", "irises, starrynight,");
    let cfg = SessionConfig::load().expect("load config");
    let targets: Vec<&str> = cfg.trackers[0].targets.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(targets, vec!["irises", "starrynight"]);

    clear_env();
}

#[test]
fn rejects_invalid_values() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("AR_PIPELINE_THROTTLE_CAPACITY", "0");
    assert!(SessionConfig::load().is_err());
    clear_env();

    std::env::set_var("AR_PIPELINE_CAMERA_FPS", "fast");
    assert!(SessionConfig::load().is_err());
    clear_env();

    std::env::set_var("AR_PIPELINE_OVERFLOW_POLICY", "block");
    assert!(SessionConfig::load().is_err());
    clear_env();

    std::env::set_var("AR_PIPELINE_TARGETS", "starry night");
    assert!(SessionConfig::load().is_err());
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    file.write_all(br#"{ "trackers": [{ "name": "image" }, { "name": "image" }] }"#)
        .expect("write config");
    assert!(SessionConfig::load_from(file.path()).is_err());

    let mut file = NamedTempFile::new().expect("temp config");
    file.write_all(br#"{ "render": { "near": 10.0, "far": 1.0 } }"#)
        .expect("write config");
    assert!(SessionConfig::load_from(file.path()).is_err());

    let mut file = NamedTempFile::new().expect("temp config");
    file.write_all(br#"{ "camera": { "orientation": 45 } }"#)
        .expect("write config");
    assert!(SessionConfig::load_from(file.path()).is_err());
}
