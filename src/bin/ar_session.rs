//! ar_session - run the AR frame pipeline against the built-in camera
//!
//! Starts a session from configuration, then drives a headless render loop at the
//! configured display rate until Ctrl-C (or `--seconds` elapse), logging pipeline health
//! every few seconds.

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ar_pipeline::render::RenderState;
use ar_pipeline::session::{describe_topology, SessionSnapshot};
use ar_pipeline::{ArSession, SessionConfig};

const HEALTH_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(author, version, about = "Run the AR frame pipeline with a headless render loop")]
struct Args {
    /// Config file (JSON, or TOML with a .toml extension).
    #[arg(long, env = "AR_PIPELINE_CONFIG")]
    config: Option<PathBuf>,

    /// Stop after this many seconds instead of waiting for Ctrl-C.
    #[arg(long)]
    seconds: Option<u64>,

    /// Print the pipeline connection table and exit.
    #[arg(long)]
    dump_topology: bool,

    /// Override the render loop rate.
    #[arg(long)]
    display_fps: Option<u32>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => SessionConfig::load_from(path)?,
        None => SessionConfig::load()?,
    };
    if let Some(fps) = args.display_fps {
        if fps == 0 {
            return Err(anyhow!("--display-fps must be greater than zero"));
        }
        config.render.fps = fps;
    }

    if args.dump_topology {
        println!("{}", describe_topology(&config)?);
        return Ok(());
    }

    let mut session = ArSession::from_config(&config)?;

    let running = Arc::new(AtomicBool::new(true));
    let running_handler = running.clone();
    ctrlc::set_handler(move || {
        running_handler.store(false, Ordering::SeqCst);
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    let mut render = RenderState::new(session.reader(), &config.render);
    let frame_period = Duration::from_secs_f64(1.0 / f64::from(config.render.fps));
    let deadline = args.seconds.map(|s| Instant::now() + Duration::from_secs(s));
    let mut last_health_log = Instant::now();
    let mut tracked_frames = 0u64;

    log::info!("render loop at {} fps; Ctrl-C to stop", config.render.fps);
    while running.load(Ordering::SeqCst) {
        let tick = Instant::now();
        if deadline.is_some_and(|deadline| tick >= deadline) {
            break;
        }

        if let Some(update) = render.poll() {
            if update.new_background && !update.targets.is_empty() {
                tracked_frames += 1;
                for target in &update.targets {
                    log::trace!(
                        "frame {}: {} #{} at {:?}",
                        update.index,
                        target.target,
                        target.runtime_id,
                        target.pose.position
                    );
                }
            }
        }

        if last_health_log.elapsed() >= HEALTH_INTERVAL {
            log_health(&session.snapshot());
            let stats = render.stats();
            log::info!(
                "render updates={} backgrounds={} empty={} tracked_frames={}",
                stats.updates,
                stats.backgrounds,
                stats.empty_polls,
                tracked_frames
            );
            last_health_log = Instant::now();
        }

        if let Some(rest) = frame_period.checked_sub(tick.elapsed()) {
            std::thread::sleep(rest);
        }
    }

    log::info!("shutdown requested, stopping session...");
    session.stop();
    log_health(&session.snapshot());
    Ok(())
}

fn log_health(snapshot: &SessionSnapshot) {
    let capture = &snapshot.capture;
    log::info!(
        "camera frames={} skipped={} refused={} outstanding={} undelivered={}",
        capture.frames_captured,
        capture.frames_dropped,
        capture.frames_refused,
        capture.outstanding,
        snapshot.undelivered
    );
    for stage in &snapshot.stages {
        log::info!(
            "  {:<16} {:<18} depth={} {}",
            stage.name,
            stage.kind,
            stage.queue_depth,
            stage.counters
        );
    }
}
