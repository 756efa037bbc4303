//! Render-side consumer of the pipeline.
//!
//! The render loop polls the buffer sink once per display tick. It refreshes the camera
//! background only when the capture index changes and places one scene node per tracked
//! target. Projections come from the camera parameters carried by the frame being drawn.
//! Tracker poses are right-handed (OpenGL); scene nodes are left-handed, so the
//! position's z and the rotation's z/w are negated on the way in.

use crate::camera::Matrix44;
use crate::config::RenderSettings;
use crate::frame::ResultFrame;
use crate::pipeline::SinkReader;

/// Placement of a tracked target in the left-handed scene.
#[derive(Clone, Debug, PartialEq)]
pub struct ScenePose {
    pub position: [f32; 3],
    /// Unit quaternion (x, y, z, w).
    pub rotation: [f32; 4],
}

impl ScenePose {
    /// Convert a row-major, right-handed camera-space pose.
    pub fn from_pose(pose: &Matrix44) -> Self {
        let position = [pose[3], pose[7], -pose[11]];
        let [x, y, z, w] = rotation_quaternion(pose);
        Self {
            position,
            rotation: [x, y, -z, -w],
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PlacedTarget {
    pub tracker: String,
    pub target: String,
    pub runtime_id: u32,
    pub pose: ScenePose,
    /// Uniform node scale: the target's physical width.
    pub scale: f32,
}

/// What to draw for one display tick.
#[derive(Debug)]
pub struct RenderUpdate {
    pub index: u64,
    /// The capture index changed since the last update: upload a new background image.
    pub new_background: bool,
    pub projection: Matrix44,
    pub image_projection: Matrix44,
    pub targets: Vec<PlacedTarget>,
    /// Kept so the background pixels stay alive while they are drawn.
    pub frame: ResultFrame,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RenderStats {
    pub updates: u64,
    pub backgrounds: u64,
    pub empty_polls: u64,
}

pub struct RenderState {
    reader: SinkReader,
    near: f32,
    far: f32,
    viewport_aspect: f32,
    screen_rotation: i32,
    last_index: Option<u64>,
    stats: RenderStats,
}

impl RenderState {
    pub fn new(reader: SinkReader, settings: &RenderSettings) -> Self {
        Self {
            reader,
            near: settings.near,
            far: settings.far,
            viewport_aspect: 16.0 / 9.0,
            screen_rotation: 0,
            last_index: None,
            stats: RenderStats::default(),
        }
    }

    pub fn set_viewport(&mut self, aspect: f32, screen_rotation: i32) {
        self.viewport_aspect = aspect;
        self.screen_rotation = screen_rotation;
    }

    /// One display tick. `None` until the pipeline has produced its first frame.
    pub fn poll(&mut self) -> Option<RenderUpdate> {
        let Some(frame) = self.reader.peek() else {
            self.stats.empty_polls += 1;
            return None;
        };
        Some(self.update(frame))
    }

    pub fn stats(&self) -> RenderStats {
        self.stats
    }

    fn update(&mut self, frame: ResultFrame) -> RenderUpdate {
        let index = frame.index();
        let new_background = self.last_index != Some(index);
        self.last_index = Some(index);

        let targets = frame
            .results()
            .flat_map(|result| {
                result.tracked().map(move |instance| PlacedTarget {
                    tracker: result.tracker.clone(),
                    target: instance.target.clone(),
                    runtime_id: instance.runtime_id,
                    pose: ScenePose::from_pose(&instance.pose),
                    scale: instance.scale,
                })
            })
            .collect();

        self.stats.updates += 1;
        if new_background {
            self.stats.backgrounds += 1;
        }
        let camera = frame.input().camera();
        RenderUpdate {
            index,
            new_background,
            projection: camera.projection(
                self.near,
                self.far,
                self.viewport_aspect,
                self.screen_rotation,
                false,
            ),
            image_projection: camera.image_projection(
                self.viewport_aspect,
                self.screen_rotation,
                false,
            ),
            targets,
            frame,
        }
    }
}

/// Quaternion (x, y, z, w) of the upper-left 3x3 of a row-major matrix.
fn rotation_quaternion(m: &Matrix44) -> [f32; 4] {
    let (m00, m01, m02) = (m[0], m[1], m[2]);
    let (m10, m11, m12) = (m[4], m[5], m[6]);
    let (m20, m21, m22) = (m[8], m[9], m[10]);
    let trace = m00 + m11 + m22;
    let q = if trace > 0.0 {
        let s = (trace + 1.0).sqrt() * 2.0;
        [(m21 - m12) / s, (m02 - m20) / s, (m10 - m01) / s, 0.25 * s]
    } else if m00 > m11 && m00 > m22 {
        let s = (1.0 + m00 - m11 - m22).sqrt() * 2.0;
        [0.25 * s, (m01 + m10) / s, (m02 + m20) / s, (m21 - m12) / s]
    } else if m11 > m22 {
        let s = (1.0 + m11 - m00 - m22).sqrt() * 2.0;
        [(m01 + m10) / s, 0.25 * s, (m12 + m21) / s, (m02 - m20) / s]
    } else {
        let s = (1.0 + m22 - m00 - m11).sqrt() * 2.0;
        [(m02 + m20) / s, (m12 + m21) / s, 0.25 * s, (m10 - m01) / s]
    };
    let norm = q.iter().map(|c| c * c).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        q.map(|c| c / norm)
    } else {
        [0.0, 0.0, 0.0, 1.0]
    }
}
