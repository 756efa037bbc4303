use anyhow::Result;

use super::result::TrackerResult;
use super::target::ImageTarget;
use crate::frame::FeedbackFrame;

/// Tracker backend trait.
///
/// Target registration happens during setup only. Once the pipeline runs, `track` is
/// called from the tracker stage's worker thread, one frame at a time, and may take
/// longer than a camera frame period; the stage coalesces input while it is busy.
pub trait TrackerBackend: Send {
    /// Backend identifier, used as the tracker name in results.
    fn name(&self) -> &str;

    /// Register a target. Returns the runtime id assigned to it.
    fn load_target(&mut self, target: ImageTarget) -> Result<u32>;

    fn unload_target(&mut self, name: &str) -> Result<()>;

    /// Number of loaded targets. A tracker with none is not applicable to any frame.
    fn target_count(&self) -> usize;

    /// Called once before the pipeline starts. A failure refuses the session start.
    fn start(&mut self) -> Result<()> {
        Ok(())
    }

    fn stop(&mut self) {}

    /// Process one frame. `Ok(None)` means the frame was processed with nothing to report.
    fn track(&mut self, frame: &FeedbackFrame) -> Result<Option<TrackerResult>>;
}
