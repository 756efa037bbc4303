//! AR session: camera, trackers and the frame pipeline wired together.
//!
//! Topology (one tracker branch per backend):
//!
//! ```text
//! camera -> gate -> throttle -> input_fork -+-> pass_through ------------------> join.0
//!                      ^                    '-> feedback -> tracker_fork -> tracker.* -> join.1..
//!                      |                          ^
//!                      |                          '--- output_fork.0 <- join
//!                      '------ Consumed ------ buffer <- output_fork.1
//! ```
//!
//! With no trackers the feedback branch is left out entirely.

use anyhow::{anyhow, Context, Result};

use crate::config::{PipelineSettings, SessionConfig};
use crate::ingest::{CaptureSource, CaptureStats, SyntheticCamera};
use crate::pipeline::{
    BufferSink, CaptureToResult, FeedbackAdapter, Fork, FormatGate, FrameInlet, Graph,
    GraphBuilder, Join, MaintenanceHandle, PortKind, SinkReader, StageId, StageSnapshot,
    Throttle, TrackerStage, FEEDBACK_CAPTURE_PORT, FEEDBACK_SIDE_PORT, SIGNAL_PORT,
};
use crate::track::{build_tracker, TrackerBackend};

pub const ENTRY_STAGE: &str = "gate";
pub const BUFFER_STAGE: &str = "buffer";

/// A validated pipeline graph plus the handles a session needs on it.
pub struct Topology {
    pub graph: Graph,
    pub reader: SinkReader,
    pub entry: StageId,
}

/// Assemble the session pipeline around already-started tracker backends.
pub fn build_topology(
    settings: &PipelineSettings,
    trackers: Vec<Box<dyn TrackerBackend>>,
) -> Result<Topology> {
    let mut builder = GraphBuilder::new();

    let entry = builder.add_stage(ENTRY_STAGE, FormatGate::new());
    let throttle = builder.add_stage(
        "throttle",
        Throttle::new(settings.throttle_capacity, settings.overflow_policy)
            .with_stall_timeout(settings.stall_timeout),
    );
    let sink = BufferSink::new();
    let reader = sink.reader();
    let buffer = builder.add_stage(BUFFER_STAGE, sink);
    let pass_through = builder.add_stage("pass_through", CaptureToResult::new());

    builder
        .expose_input(entry, 0)
        .connect(entry, 0, throttle, 0)
        .connect(buffer, 0, throttle, SIGNAL_PORT);

    if trackers.is_empty() {
        let join = builder.add_stage("join", Join::new(1).with_timeout(settings.join_timeout));
        builder
            .connect(throttle, 0, pass_through, 0)
            .connect(pass_through, 0, join, 0)
            .connect(join, 0, buffer, 0);
    } else {
        let mut join = Join::new(trackers.len() + 1).with_timeout(settings.join_timeout);
        for (offset, tracker) in trackers.iter().enumerate() {
            if tracker.target_count() == 0 {
                log::info!("tracker {} has no targets; its branch is not applicable", tracker.name());
                join = join.mark_not_applicable(offset + 1);
            }
        }
        let join = builder.add_stage("join", join);
        let input_fork = builder.add_stage("input_fork", Fork::new(PortKind::Capture, 2));
        let feedback = builder.add_stage("feedback", FeedbackAdapter::new());
        let tracker_fork =
            builder.add_stage("tracker_fork", Fork::new(PortKind::Feedback, trackers.len()));
        let output_fork = builder.add_stage("output_fork", Fork::new(PortKind::Result, 2));

        builder
            .connect(throttle, 0, input_fork, 0)
            .connect(input_fork, 0, pass_through, 0)
            .connect(input_fork, 1, feedback, FEEDBACK_CAPTURE_PORT)
            .connect(pass_through, 0, join, 0)
            .connect(feedback, 0, tracker_fork, 0)
            .connect(join, 0, output_fork, 0)
            .connect(output_fork, 0, feedback, FEEDBACK_SIDE_PORT)
            .connect(output_fork, 1, buffer, 0);

        for (offset, backend) in trackers.into_iter().enumerate() {
            let name = format!("tracker.{}", backend.name());
            let stage = builder.add_stage(name, TrackerStage::new(backend));
            builder
                .connect(tracker_fork, offset, stage, 0)
                .connect(stage, 0, join, offset + 1);
        }
    }

    let graph = builder.build()?;
    Ok(Topology {
        graph,
        reader,
        entry,
    })
}

/// Connection table for the session `config` describes. Trackers are built and loaded
/// but never started, and no camera is opened.
pub fn describe_topology(config: &SessionConfig) -> Result<String> {
    let trackers = config
        .trackers
        .iter()
        .map(build_tracker)
        .collect::<Result<Vec<_>>>()?;
    let topology = build_topology(&config.pipeline, trackers)?;
    Ok(topology.graph.describe())
}

/// Point-in-time diagnostics for the whole session.
#[derive(Clone, Debug)]
pub struct SessionSnapshot {
    pub stages: Vec<StageSnapshot>,
    pub capture: CaptureStats,
    pub undelivered: u64,
}

pub struct ArSession {
    source: Box<dyn CaptureSource>,
    graph: Graph,
    inlet: FrameInlet,
    reader: SinkReader,
    maintenance: Option<MaintenanceHandle>,
    paused: bool,
    stopped: bool,
}

impl ArSession {
    /// Session with the built-in camera and the trackers described by `config`.
    pub fn from_config(config: &SessionConfig) -> Result<Self> {
        let source = Box::new(SyntheticCamera::new(&config.camera));
        let trackers = config
            .trackers
            .iter()
            .map(build_tracker)
            .collect::<Result<Vec<_>>>()?;
        Self::start(config, source, trackers)
    }

    /// Open the camera, start every tracker, then start the pipeline. Any failure before
    /// the first frame refuses the start and releases what was acquired.
    pub fn start(
        config: &SessionConfig,
        mut source: Box<dyn CaptureSource>,
        mut trackers: Vec<Box<dyn TrackerBackend>>,
    ) -> Result<Self> {
        source
            .open()
            .with_context(|| format!("open camera {}", source.name()))?;

        for started in 0..trackers.len() {
            if let Err(err) = trackers[started].start() {
                let name = trackers[started].name().to_string();
                for tracker in trackers.iter_mut().take(started) {
                    tracker.stop();
                }
                return Err(err.context(format!("start tracker {}", name)));
            }
        }

        source.set_buffer_capacity(config.camera.buffer_capacity);
        let Topology {
            graph,
            reader,
            entry,
        } = build_topology(&config.pipeline, trackers)?;
        let inlet = graph.inlet(entry, 0)?;
        graph.start()?;
        let maintenance = MaintenanceHandle::spawn(&graph, config.pipeline.tick)?;

        let mut session = Self {
            source,
            graph,
            inlet,
            reader,
            maintenance: Some(maintenance),
            paused: false,
            stopped: false,
        };
        if let Err(err) = session.source.start(session.inlet.clone()) {
            session.stop();
            return Err(err.context("start camera"));
        }
        log::info!(
            "session started: camera {}, {} stages",
            session.source.name(),
            session.graph.snapshot().len()
        );
        Ok(session)
    }

    /// Handle for the render loop.
    pub fn reader(&self) -> SinkReader {
        self.reader.clone()
    }

    /// Stop the camera. Frames already in the pipeline still complete.
    pub fn pause(&mut self) {
        if self.paused || self.stopped {
            return;
        }
        self.source.stop();
        self.paused = true;
        log::info!("session paused");
    }

    pub fn resume(&mut self) -> Result<()> {
        if self.stopped {
            return Err(anyhow!("session was stopped"));
        }
        if !self.paused {
            return Ok(());
        }
        self.source.start(self.inlet.clone())?;
        self.paused = false;
        log::info!("session resumed");
        Ok(())
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            stages: self.graph.snapshot(),
            capture: self.source.stats(),
            undelivered: self.graph.undelivered(),
        }
    }

    pub fn describe(&self) -> String {
        self.graph.describe()
    }

    /// Camera first, then routing, then tracker workers and held frames. Idempotent.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.source.stop();
        if let Some(maintenance) = self.maintenance.take() {
            match maintenance.stop() {
                Ok(ticks) => log::debug!("maintenance stopped after {} ticks", ticks),
                Err(err) => log::error!("{}", err),
            }
        }
        self.graph.stop();
        let stats = self.source.stats();
        log::info!(
            "session stopped: {} frames captured, {} skipped, {} buffers outstanding",
            stats.frames_captured,
            stats.frames_dropped,
            stats.outstanding
        );
    }
}

impl Drop for ArSession {
    fn drop(&mut self) {
        self.stop();
    }
}
