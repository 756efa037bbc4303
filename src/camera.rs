//! Camera intrinsics and the projection helpers the render side needs.
//!
//! Matrices are 4x4, row-major, OpenGL clip conventions (camera looks down -Z).

use serde::Deserialize;

/// Row-major 4x4 matrix.
pub type Matrix44 = [f32; 16];

pub const IDENTITY: Matrix44 = [
    1.0, 0.0, 0.0, 0.0, //
    0.0, 1.0, 0.0, 0.0, //
    0.0, 0.0, 1.0, 0.0, //
    0.0, 0.0, 0.0, 1.0,
];

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraDeviceType {
    #[default]
    Back,
    Front,
}

/// Intrinsics of the physical camera that produced a frame.
#[derive(Clone, Debug, PartialEq)]
pub struct CameraParameters {
    /// Image size in pixels (width, height).
    pub size: (u32, u32),
    /// Focal length in pixels (fx, fy).
    pub focal_length: (f32, f32),
    /// Principal point in pixels (cx, cy).
    pub principal_point: (f32, f32),
    pub device: CameraDeviceType,
    /// Clockwise rotation of the sensor relative to the device's natural orientation.
    pub orientation: i32,
}

impl Default for CameraParameters {
    fn default() -> Self {
        Self::from_size(1280, 720, CameraDeviceType::Back, 90)
    }
}

impl CameraParameters {
    /// Nominal intrinsics for a sensor of the given size (roughly 60 degree horizontal FOV,
    /// centred principal point).
    pub fn from_size(width: u32, height: u32, device: CameraDeviceType, orientation: i32) -> Self {
        let focal = width as f32 * 0.866;
        Self {
            size: (width, height),
            focal_length: (focal, focal),
            principal_point: (width as f32 / 2.0, height as f32 / 2.0),
            device,
            orientation: orientation.rem_euclid(360),
        }
    }

    /// Whether the image should be mirrored horizontally when displayed.
    pub fn image_horizontal_flip(&self, manual_flip: bool) -> bool {
        (self.device == CameraDeviceType::Front) != manual_flip
    }

    /// Rotation (0/90/180/270) to apply to the image for a screen rotated by `screen_rotation`.
    pub fn image_orientation(&self, screen_rotation: i32) -> i32 {
        let rotation = match self.device {
            CameraDeviceType::Back => self.orientation - screen_rotation,
            CameraDeviceType::Front => self.orientation + screen_rotation,
        };
        snap_quarter(rotation)
    }

    /// Perspective projection matching the camera for a viewport of `viewport_aspect`
    /// (width / height). The image is scaled to fill the viewport.
    pub fn projection(
        &self,
        near: f32,
        far: f32,
        viewport_aspect: f32,
        screen_rotation: i32,
        manual_flip: bool,
    ) -> Matrix44 {
        let orientation = self.image_orientation(screen_rotation);
        let (w, h, fx, fy, cx, cy) = self.oriented(orientation);

        let mut m = [0.0f32; 16];
        m[0] = 2.0 * fx / w;
        m[2] = 1.0 - 2.0 * cx / w;
        m[5] = 2.0 * fy / h;
        m[6] = 2.0 * cy / h - 1.0;
        m[10] = -(far + near) / (far - near);
        m[11] = -2.0 * far * near / (far - near);
        m[14] = -1.0;

        let (sx, sy) = fill_scale(w / h, viewport_aspect);
        scale_rows(&mut m, sx, sy);
        rotate_rows(&mut m, orientation);
        if self.image_horizontal_flip(manual_flip) {
            for col in 0..4 {
                m[col] = -m[col];
            }
        }
        m
    }

    /// 2D transform placing the camera image as a full-screen background quad.
    pub fn image_projection(
        &self,
        viewport_aspect: f32,
        screen_rotation: i32,
        manual_flip: bool,
    ) -> Matrix44 {
        let orientation = self.image_orientation(screen_rotation);
        let (w, h, ..) = self.oriented(orientation);
        let mut m = IDENTITY;
        let (sx, sy) = fill_scale(w / h, viewport_aspect);
        scale_rows(&mut m, sx, sy);
        rotate_rows(&mut m, orientation);
        if self.image_horizontal_flip(manual_flip) {
            for col in 0..4 {
                m[col] = -m[col];
            }
        }
        m
    }

    fn oriented(&self, orientation: i32) -> (f32, f32, f32, f32, f32, f32) {
        let (w, h) = (self.size.0 as f32, self.size.1 as f32);
        let (fx, fy) = self.focal_length;
        let (cx, cy) = self.principal_point;
        if orientation == 90 || orientation == 270 {
            (h, w, fy, fx, cy, cx)
        } else {
            (w, h, fx, fy, cx, cy)
        }
    }
}

fn snap_quarter(rotation: i32) -> i32 {
    let r = rotation.rem_euclid(360);
    ((r + 45) / 90 % 4) * 90
}

fn fill_scale(image_aspect: f32, viewport_aspect: f32) -> (f32, f32) {
    if viewport_aspect > image_aspect {
        (1.0, viewport_aspect / image_aspect)
    } else {
        (image_aspect / viewport_aspect, 1.0)
    }
}

fn scale_rows(m: &mut Matrix44, sx: f32, sy: f32) {
    for col in 0..4 {
        m[col] *= sx;
        m[4 + col] *= sy;
    }
}

/// Left-multiplies by a rotation about Z of `degrees` (multiples of 90).
fn rotate_rows(m: &mut Matrix44, degrees: i32) {
    let (c, s) = match degrees {
        90 => (0.0, 1.0),
        180 => (-1.0, 0.0),
        270 => (0.0, -1.0),
        _ => return,
    };
    for col in 0..4 {
        let x = m[col];
        let y = m[4 + col];
        m[col] = c * x - s * y;
        m[4 + col] = s * x + c * y;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply(m: &Matrix44, p: [f32; 4]) -> [f32; 4] {
        let mut out = [0.0; 4];
        for row in 0..4 {
            out[row] = (0..4).map(|col| m[row * 4 + col] * p[col]).sum();
        }
        out
    }

    #[test]
    fn near_and_far_planes_map_to_clip_bounds() {
        let params = CameraParameters::from_size(640, 480, CameraDeviceType::Back, 0);
        let m = params.projection(0.01, 100.0, 640.0 / 480.0, 0, false);

        let near = apply(&m, [0.0, 0.0, -0.01, 1.0]);
        let far = apply(&m, [0.0, 0.0, -100.0, 1.0]);
        assert!((near[2] / near[3] + 1.0).abs() < 1e-3);
        assert!((far[2] / far[3] - 1.0).abs() < 1e-3);
        assert_eq!(m[14], -1.0);
    }

    #[test]
    fn centred_principal_point_has_no_skew_offset() {
        let params = CameraParameters::from_size(640, 480, CameraDeviceType::Back, 0);
        let m = params.projection(0.1, 10.0, 640.0 / 480.0, 0, false);
        assert!(m[2].abs() < 1e-6);
        assert!(m[6].abs() < 1e-6);
    }

    #[test]
    fn orientation_accounts_for_screen_rotation() {
        let back = CameraParameters::from_size(1280, 720, CameraDeviceType::Back, 90);
        assert_eq!(back.image_orientation(0), 90);
        assert_eq!(back.image_orientation(90), 0);
        assert_eq!(back.image_orientation(180), 270);

        let front = CameraParameters::from_size(1280, 720, CameraDeviceType::Front, 270);
        assert_eq!(front.image_orientation(90), 0);
        assert!(front.image_horizontal_flip(false));
        assert!(!front.image_horizontal_flip(true));
    }

    #[test]
    fn background_fills_wider_viewport() {
        let params = CameraParameters::from_size(640, 480, CameraDeviceType::Back, 0);
        let m = params.image_projection(2.0, 0, false);
        assert_eq!(m[0], 1.0);
        assert!((m[5] - 2.0 / (640.0 / 480.0)).abs() < 1e-5);
    }
}
