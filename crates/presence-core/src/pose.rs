//! Head pose and motion estimation from six facial landmarks.
//!
//! Landmarks are matched against a fixed millimeter-scale face model and
//! solved with PnP under an approximate pinhole camera. The rotation is
//! reported as yaw/pitch/roll folded into (-90, 90]; a head turned past 90°
//! reports the same angle as its mirror. Direction classification relies on
//! that folding.

use crate::pnp::{self, CameraIntrinsics, Mat3, PnpError, Vec3};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Canonical 3-D face model, head-centered, millimeters.
///
/// Order: nose tip, chin, left eye outer corner, right eye outer corner,
/// left mouth corner, right mouth corner.
pub const FACE_MODEL_POINTS: [Vec3; 6] = [
    [0.0, 0.0, 0.0],
    [0.0, -63.6, -12.5],
    [-43.3, 32.7, -26.0],
    [43.3, 32.7, -26.0],
    [-28.9, -28.9, -24.1],
    [28.9, -28.9, -24.1],
];

/// Yaw/pitch beyond this many degrees counts as looking away from center.
pub const DIRECTION_THRESHOLD_DEG: f32 = 15.0;

const GIMBAL_LOCK_EPSILON: f64 = 1e-6;

#[derive(Error, Debug)]
pub enum PoseError {
    #[error("no face landmarks in frame")]
    NotDetected,
    #[error("pose solve failed: {0}")]
    SolveFailed(#[from] PnpError),
    #[error("frame buffer has {actual} bytes, expected {expected} for {width}x{height}")]
    InvalidFrame {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },
}

impl PoseError {
    /// Whether the caller should simply retry the capture.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PoseError::NotDetected | PoseError::SolveFailed(_))
    }
}

/// Six 2-D landmark points in frame pixel coordinates, in
/// [`FACE_MODEL_POINTS`] order.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaceLandmarks {
    pub points: [(f32, f32); 6],
}

/// A grayscale frame (one luminance byte per pixel).
#[derive(Debug, Clone)]
pub struct LumaFrame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl LumaFrame {
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Result<Self, PoseError> {
        let expected = width as usize * height as usize;
        if data.len() != expected {
            return Err(PoseError::InvalidFrame {
                width,
                height,
                expected,
                actual: data.len(),
            });
        }
        Ok(Self { data, width, height })
    }
}

/// Coarse gaze direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HeadDirection {
    Center,
    Left,
    Right,
    Up,
    Down,
}

impl HeadDirection {
    /// Yaw is checked before pitch, so a head turned both sideways and
    /// up/down reports Left/Right.
    pub fn classify(yaw: f32, pitch: f32) -> Self {
        if yaw > DIRECTION_THRESHOLD_DEG {
            HeadDirection::Right
        } else if yaw < -DIRECTION_THRESHOLD_DEG {
            HeadDirection::Left
        } else if pitch > DIRECTION_THRESHOLD_DEG {
            HeadDirection::Down
        } else if pitch < -DIRECTION_THRESHOLD_DEG {
            HeadDirection::Up
        } else {
            HeadDirection::Center
        }
    }
}

/// Head orientation in degrees, each in (-90, 90].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HeadAngles {
    pub yaw: f32,
    pub pitch: f32,
    pub roll: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PoseResult {
    pub yaw: f32,
    pub pitch: f32,
    pub roll: f32,
    /// Mean absolute luminance change against the previous frame.
    pub motion: f32,
    pub direction: HeadDirection,
}

/// Wrap an angle in degrees into (-180, 180].
pub fn wrap_degrees(angle: f64) -> f64 {
    let wrapped = (angle + 180.0).rem_euclid(360.0) - 180.0;
    if wrapped <= -180.0 { wrapped + 360.0 } else { wrapped }
}

/// Reflect an angle in (-180, 180] into [-90, 90].
pub fn fold_degrees(angle: f64) -> f64 {
    if angle > 90.0 {
        180.0 - angle
    } else if angle < -90.0 {
        -180.0 - angle
    } else {
        angle
    }
}

/// Decompose a rotation matrix into (x, y, z) Euler angles in radians,
/// with R = Rz(z)·Ry(y)·Rx(x). Near gimbal lock z is forced to zero.
pub fn euler_from_rotation(r: &Mat3) -> (f64, f64, f64) {
    let sy = (r[0][0] * r[0][0] + r[1][0] * r[1][0]).sqrt();
    if sy >= GIMBAL_LOCK_EPSILON {
        (
            r[2][1].atan2(r[2][2]),
            (-r[2][0]).atan2(sy),
            r[1][0].atan2(r[0][0]),
        )
    } else {
        ((-r[1][2]).atan2(r[1][1]), (-r[2][0]).atan2(sy), 0.0)
    }
}

/// Convert a solved head rotation into reported yaw/pitch/roll.
///
/// Pitch is negated (camera frame vs head frame), then every angle is
/// wrapped and folded.
pub fn head_angles(rotation: &Mat3) -> HeadAngles {
    let (x, y, z) = euler_from_rotation(rotation);
    let pitch = -x.to_degrees();
    let yaw = y.to_degrees();
    let roll = z.to_degrees();

    HeadAngles {
        yaw: fold_degrees(wrap_degrees(yaw)) as f32,
        pitch: fold_degrees(wrap_degrees(pitch)) as f32,
        roll: fold_degrees(wrap_degrees(roll)) as f32,
    }
}

/// Solve head orientation from landmarks in a `width`×`height` frame.
pub fn solve_head_angles(
    landmarks: &FaceLandmarks,
    width: u32,
    height: u32,
) -> Result<HeadAngles, PoseError> {
    let camera = CameraIntrinsics::approximate(width, height);
    let image: Vec<(f64, f64)> = landmarks
        .points
        .iter()
        .map(|&(x, y)| (x as f64, y as f64))
        .collect();

    // A face looking into the camera: model +y up and +z toward the viewer.
    let facing_camera = pnp::rotation_x(std::f64::consts::PI);
    let solution = pnp::solve_pnp(&FACE_MODEL_POINTS, &image, &camera, facing_camera)?;
    Ok(head_angles(&solution.rotation))
}

/// Per-stream pose estimator.
///
/// Holds the previous frame's luminance for motion scoring, so one
/// estimator must serve exactly one capture stream.
#[derive(Debug, Default)]
pub struct PoseEstimator {
    previous: Option<LumaFrame>,
}

impl PoseEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget the previous frame; the next motion score will be 0.
    pub fn reset(&mut self) {
        self.previous = None;
    }

    /// Score motion against the previous frame and keep `frame` as the new
    /// reference. Returns 0 for the first frame or after a size change.
    pub fn update_motion(&mut self, frame: &LumaFrame) -> f32 {
        let score = match &self.previous {
            Some(prev)
                if prev.width == frame.width
                    && prev.height == frame.height
                    && prev.data.len() == frame.data.len()
                    && !frame.data.is_empty() =>
            {
                let total: u64 = prev
                    .data
                    .iter()
                    .zip(&frame.data)
                    .map(|(&a, &b)| a.abs_diff(b) as u64)
                    .sum();
                total as f32 / frame.data.len() as f32
            }
            _ => 0.0,
        };
        self.previous = Some(frame.clone());
        score
    }

    /// Estimate pose and motion for one frame of this stream.
    ///
    /// Motion is updated even when `landmarks` is `None`, matching a camera
    /// that keeps streaming while nobody is in view.
    pub fn estimate(
        &mut self,
        frame: &LumaFrame,
        landmarks: Option<&FaceLandmarks>,
    ) -> Result<PoseResult, PoseError> {
        let motion = self.update_motion(frame);
        let landmarks = landmarks.ok_or(PoseError::NotDetected)?;
        let angles = solve_head_angles(landmarks, frame.width, frame.height)?;
        let direction = HeadDirection::classify(angles.yaw, angles.pitch);

        tracing::debug!(
            yaw = angles.yaw,
            pitch = angles.pitch,
            roll = angles.roll,
            motion,
            ?direction,
            "pose estimated"
        );

        Ok(PoseResult {
            yaw: angles.yaw,
            pitch: angles.pitch,
            roll: angles.roll,
            motion,
            direction,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pnp::{mat_mul, mat_vec, rotation_x, rotation_y, rotation_z};
    use std::f64::consts::PI;

    const W: u32 = 640;
    const H: u32 = 480;

    fn landmarks_for(rotation: &Mat3, translation: Vec3) -> FaceLandmarks {
        let camera = CameraIntrinsics::approximate(W, H);
        let mut points = [(0.0f32, 0.0f32); 6];
        for (out, p) in points.iter_mut().zip(FACE_MODEL_POINTS.iter()) {
            let q = mat_vec(rotation, p);
            let (u, v) = camera
                .project([q[0] + translation[0], q[1] + translation[1], q[2] + translation[2]])
                .unwrap();
            *out = (u as f32, v as f32);
        }
        FaceLandmarks { points }
    }

    fn blank(value: u8) -> LumaFrame {
        LumaFrame::new(vec![value; (W * H) as usize], W, H).unwrap()
    }

    #[test]
    fn test_wrap_then_fold_170() {
        assert_eq!(wrap_degrees(170.0), 170.0);
        assert_eq!(fold_degrees(wrap_degrees(170.0)), 10.0);
    }

    #[test]
    fn test_wrap_range() {
        assert_eq!(wrap_degrees(180.0), 180.0);
        assert_eq!(wrap_degrees(-180.0), 180.0);
        assert_eq!(wrap_degrees(190.0), -170.0);
        assert_eq!(wrap_degrees(-190.0), 170.0);
        assert_eq!(wrap_degrees(540.0), 180.0);
        assert_eq!(wrap_degrees(45.0), 45.0);
    }

    #[test]
    fn test_fold_reflects_outside_ninety() {
        assert_eq!(fold_degrees(180.0), 0.0);
        assert_eq!(fold_degrees(-170.0), -10.0);
        assert_eq!(fold_degrees(90.0), 90.0);
        assert_eq!(fold_degrees(-90.0), -90.0);
        assert_eq!(fold_degrees(-45.0), -45.0);
    }

    #[test]
    fn test_classify_yaw_before_pitch() {
        assert_eq!(HeadDirection::classify(20.0, 0.0), HeadDirection::Right);
        assert_eq!(HeadDirection::classify(20.0, 40.0), HeadDirection::Right);
        assert_eq!(HeadDirection::classify(-20.0, -40.0), HeadDirection::Left);
        assert_eq!(HeadDirection::classify(0.0, 20.0), HeadDirection::Down);
        assert_eq!(HeadDirection::classify(0.0, -20.0), HeadDirection::Up);
        assert_eq!(HeadDirection::classify(15.0, -15.0), HeadDirection::Center);
    }

    #[test]
    fn test_euler_regular_case() {
        let r = mat_mul(&rotation_z(0.2), &mat_mul(&rotation_y(-0.3), &rotation_x(0.4)));
        let (x, y, z) = euler_from_rotation(&r);
        assert!((x - 0.4).abs() < 1e-9);
        assert!((y + 0.3).abs() < 1e-9);
        assert!((z - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_euler_gimbal_lock_forces_zero_roll() {
        let r = mat_mul(&rotation_y(PI / 2.0), &rotation_x(0.3));
        let (x, y, z) = euler_from_rotation(&r);
        assert_eq!(z, 0.0);
        assert!((y - PI / 2.0).abs() < 1e-9);
        assert!((x - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_frontal_face_is_center() {
        let lm = landmarks_for(&rotation_x(PI), [0.0, 0.0, 600.0]);
        let angles = solve_head_angles(&lm, W, H).unwrap();
        assert!(angles.yaw.abs() < 0.5, "yaw {}", angles.yaw);
        assert!(angles.pitch.abs() < 0.5, "pitch {}", angles.pitch);
        assert!(angles.roll.abs() < 0.5, "roll {}", angles.roll);
        assert_eq!(HeadDirection::classify(angles.yaw, angles.pitch), HeadDirection::Center);
    }

    #[test]
    fn test_turned_face_reports_yaw() {
        let yaw = 25.0f64.to_radians();
        let lm = landmarks_for(&mat_mul(&rotation_y(yaw), &rotation_x(PI)), [10.0, -5.0, 550.0]);
        let mut estimator = PoseEstimator::new();
        let pose = estimator.estimate(&blank(100), Some(&lm)).unwrap();
        assert!((pose.yaw - 25.0).abs() < 0.5, "yaw {}", pose.yaw);
        assert_eq!(pose.direction, HeadDirection::Right);
        assert_eq!(pose.motion, 0.0);
    }

    #[test]
    fn test_tilted_face_reports_pitch() {
        let tilt = 20.0f64.to_radians();
        let lm = landmarks_for(&rotation_x(PI + tilt), [0.0, 0.0, 600.0]);
        let angles = solve_head_angles(&lm, W, H).unwrap();
        assert!((angles.pitch - 20.0).abs() < 0.5, "pitch {}", angles.pitch);
        assert!(angles.yaw.abs() < 0.5);
        assert_eq!(HeadDirection::classify(angles.yaw, angles.pitch), HeadDirection::Down);
    }

    #[test]
    fn test_degenerate_landmarks_fail_without_panicking() {
        let lm = FaceLandmarks { points: [(320.0, 240.0); 6] };
        let err = solve_head_angles(&lm, W, H).unwrap_err();
        assert!(err.is_retryable());

        let mut lm = landmarks_for(&rotation_x(PI), [0.0, 0.0, 600.0]);
        lm.points[3].1 = f32::INFINITY;
        assert!(matches!(
            solve_head_angles(&lm, W, H),
            Err(PoseError::SolveFailed(_))
        ));
    }

    #[test]
    fn test_motion_is_mean_absolute_difference() {
        let mut estimator = PoseEstimator::new();
        assert_eq!(estimator.update_motion(&blank(10)), 0.0);
        assert!((estimator.update_motion(&blank(14)) - 4.0).abs() < 1e-6);
        assert!((estimator.update_motion(&blank(4)) - 10.0).abs() < 1e-6);
    }

    #[test]
    fn test_motion_resets_on_size_change() {
        let mut estimator = PoseEstimator::new();
        estimator.update_motion(&blank(10));
        let small = LumaFrame::new(vec![200; 4], 2, 2).unwrap();
        assert_eq!(estimator.update_motion(&small), 0.0);
    }

    #[test]
    fn test_motion_tracked_without_face() {
        let mut estimator = PoseEstimator::new();
        assert!(matches!(
            estimator.estimate(&blank(50), None),
            Err(PoseError::NotDetected)
        ));
        let lm = landmarks_for(&rotation_x(PI), [0.0, 0.0, 600.0]);
        let pose = estimator.estimate(&blank(58), Some(&lm)).unwrap();
        assert!((pose.motion - 8.0).abs() < 1e-6);
    }

    #[test]
    fn test_reset_clears_previous_frame() {
        let mut estimator = PoseEstimator::new();
        estimator.update_motion(&blank(10));
        estimator.reset();
        assert_eq!(estimator.update_motion(&blank(90)), 0.0);
    }

    #[test]
    fn test_invalid_frame_size() {
        assert!(matches!(
            LumaFrame::new(vec![0; 5], 2, 2),
            Err(PoseError::InvalidFrame { expected: 4, actual: 5, .. })
        ));
    }
}
