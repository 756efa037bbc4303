use anyhow::{anyhow, Result};
use std::time::Duration;

use crate::camera::{Matrix44, IDENTITY};
use crate::frame::FeedbackFrame;
use crate::track::backend::TrackerBackend;
use crate::track::result::{TargetInstance, TargetStatus, TrackerResult};
use crate::track::target::ImageTarget;

/// Default number of targets tracked at once.
pub const DEFAULT_SIMULTANEOUS: usize = 6;

/// Stub tracker for testing and demos.
///
/// Reports every loaded target (up to the simultaneous limit) on a slow orbit in front of
/// the camera. A target seen in the previous result is `Tracked`; otherwise it is newly
/// `Detected`. An optional delay simulates a tracker slower than the camera.
pub struct StubTracker {
    name: String,
    targets: Vec<LoadedTarget>,
    simultaneous: usize,
    delay: Duration,
    next_runtime_id: u32,
    running: bool,
}

struct LoadedTarget {
    target: ImageTarget,
    runtime_id: u32,
}

impl StubTracker {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            targets: Vec::new(),
            simultaneous: DEFAULT_SIMULTANEOUS,
            delay: Duration::ZERO,
            next_runtime_id: 1,
            running: false,
        }
    }

    pub fn with_simultaneous(mut self, simultaneous: usize) -> Self {
        self.simultaneous = simultaneous.max(1);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn was_seen(&self, frame: &FeedbackFrame, runtime_id: u32) -> bool {
        frame.previous().is_some_and(|previous| {
            previous
                .results()
                .filter(|result| result.tracker == self.name)
                .flat_map(|result| result.targets.iter())
                .any(|instance| {
                    instance.runtime_id == runtime_id && instance.status != TargetStatus::Unknown
                })
        })
    }
}

impl TrackerBackend for StubTracker {
    fn name(&self) -> &str {
        &self.name
    }

    fn load_target(&mut self, target: ImageTarget) -> Result<u32> {
        if self.targets.iter().any(|t| t.target.name() == target.name()) {
            return Err(anyhow!("target '{}' already loaded", target.name()));
        }
        let runtime_id = self.next_runtime_id;
        self.next_runtime_id += 1;
        self.targets.push(LoadedTarget { target, runtime_id });
        Ok(runtime_id)
    }

    fn unload_target(&mut self, name: &str) -> Result<()> {
        let before = self.targets.len();
        self.targets.retain(|t| t.target.name() != name);
        if self.targets.len() == before {
            return Err(anyhow!("target '{}' is not loaded", name));
        }
        Ok(())
    }

    fn target_count(&self) -> usize {
        self.targets.len()
    }

    fn start(&mut self) -> Result<()> {
        self.running = true;
        log::info!(
            "StubTracker {}: started with {} target(s)",
            self.name,
            self.targets.len()
        );
        Ok(())
    }

    fn stop(&mut self) {
        self.running = false;
    }

    fn track(&mut self, frame: &FeedbackFrame) -> Result<Option<TrackerResult>> {
        if !self.running {
            return Err(anyhow!("tracker '{}' is not started", self.name));
        }
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        if self.targets.is_empty() {
            return Ok(None);
        }

        let phase = frame.input().timestamp().as_secs_f32();
        let targets = self
            .targets
            .iter()
            .take(self.simultaneous)
            .enumerate()
            .map(|(slot, loaded)| {
                let status = if self.was_seen(frame, loaded.runtime_id) {
                    TargetStatus::Tracked
                } else {
                    TargetStatus::Detected
                };
                TargetInstance {
                    target: loaded.target.name().to_string(),
                    runtime_id: loaded.runtime_id,
                    status,
                    scale: loaded.target.scale(),
                    pose: orbit_pose(phase, slot, loaded.target.scale()),
                }
            })
            .collect();

        Ok(Some(TrackerResult {
            tracker: self.name.clone(),
            targets,
        }))
    }
}

fn orbit_pose(phase: f32, slot: usize, scale: f32) -> Matrix44 {
    let mut pose = IDENTITY;
    let angle = phase * 0.5 + slot as f32;
    pose[3] = 0.1 * angle.cos();
    pose[7] = 0.1 * angle.sin();
    pose[11] = -(1.0 + scale * slot as f32);
    pose
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::tests::make_frame;
    use crate::frame::{ResultFrame, ResultSlot};

    fn started(targets: &[&str]) -> StubTracker {
        let mut tracker = StubTracker::new("image").with_simultaneous(2);
        for name in targets {
            tracker
                .load_target(ImageTarget::from_bytes(name, name.as_bytes(), 1.0).unwrap())
                .unwrap();
        }
        tracker.start().unwrap();
        tracker
    }

    #[test]
    fn no_targets_means_no_result() {
        let mut tracker = started(&[]);
        let frame = FeedbackFrame::new(make_frame(1), None);
        assert!(tracker.track(&frame).unwrap().is_none());
    }

    #[test]
    fn respects_simultaneous_limit() {
        let mut tracker = started(&["a", "b", "c"]);
        let frame = FeedbackFrame::new(make_frame(1), None);
        let result = tracker.track(&frame).unwrap().unwrap();
        assert_eq!(result.targets.len(), 2);
        assert!(result
            .targets
            .iter()
            .all(|t| t.status == TargetStatus::Detected));
    }

    #[test]
    fn previously_seen_targets_are_tracked() {
        let mut tracker = started(&["irises"]);
        let first = tracker
            .track(&FeedbackFrame::new(make_frame(1), None))
            .unwrap()
            .unwrap();
        let previous = ResultFrame::pending(make_frame(1), vec![ResultSlot::Tracked(first)]);

        let second = tracker
            .track(&FeedbackFrame::new(make_frame(2), Some(previous)))
            .unwrap()
            .unwrap();
        assert_eq!(second.tracked().count(), 1);
    }

    #[test]
    fn duplicate_and_missing_targets_are_errors() {
        let mut tracker = started(&["irises"]);
        assert!(tracker
            .load_target(ImageTarget::from_bytes("irises", b"x", 1.0).unwrap())
            .is_err());
        assert!(tracker.unload_target("starrynight").is_err());
        tracker.unload_target("irises").unwrap();
        assert_eq!(tracker.target_count(), 0);
    }

    #[test]
    fn refuses_to_track_before_start() {
        let mut tracker = StubTracker::new("image");
        assert!(tracker
            .track(&FeedbackFrame::new(make_frame(1), None))
            .is_err());
    }
}
