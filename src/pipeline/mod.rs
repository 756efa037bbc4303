//! Frame pipeline: a validated graph of stages connected by typed ports.
//!
//! Data flows from the capture inlet through the throttle, splits into a pass-through
//! branch and one branch per tracker, is merged back by index in the join, and ends in a
//! single-slot buffer sink read by the renderer. Consumption signals flow from the sink
//! back to the throttle.

mod adapter;
mod fork;
mod graph;
mod join;
mod maintenance;
mod packet;
mod sink;
mod stage;
mod throttle;
mod tracker;

pub use adapter::{
    CaptureToResult, FeedbackAdapter, FormatGate, FEEDBACK_CAPTURE_PORT, FEEDBACK_SIDE_PORT,
};
pub use fork::Fork;
pub use graph::{
    Connection, Direction, Emitter, FrameInlet, Graph, GraphBuilder, PortRef, StageSnapshot,
    TopologyError,
};
pub use join::Join;
pub use maintenance::MaintenanceHandle;
pub use packet::{Packet, PortKind, Signal};
pub use sink::{BufferSink, SinkReader};
pub use stage::{Outbox, Stage, StageContext, StageCounters, StageId};
pub use throttle::{OverflowPolicy, Throttle, CAPTURE_PORT, SIGNAL_PORT};
pub use tracker::TrackerStage;
