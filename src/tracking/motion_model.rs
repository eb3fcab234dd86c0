//! Constant-velocity motion model for pose prediction.

use crate::geometry::SE3;

/// Constant velocity motion model on world→camera poses.
///
/// The velocity is the relative motion `T_c(k) c(k-1)` observed between the
/// last two tracked frames and is re-applied to predict the next one.
#[derive(Debug, Clone, Default)]
pub struct MotionModel {
    /// T_cw of the last tracked frame.
    prev_pose_cw: Option<SE3>,
    /// T_curr_prev.
    velocity: Option<SE3>,
}

impl MotionModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update the model with the pose of a newly tracked frame.
    pub fn update(&mut self, pose_cw: &SE3) {
        if let Some(ref prev) = self.prev_pose_cw {
            self.velocity = Some(pose_cw.compose(&prev.inverse()));
        }
        self.prev_pose_cw = Some(pose_cw.clone());
    }

    /// Predict T_cw of the next frame. Without a velocity yet, the last pose
    /// is returned unchanged.
    pub fn predict(&self) -> Option<SE3> {
        let prev = self.prev_pose_cw.as_ref()?;
        Some(match self.velocity {
            Some(ref v) => v.compose(prev),
            None => prev.clone(),
        })
    }

    pub fn has_velocity(&self) -> bool {
        self.velocity.is_some()
    }

    /// Forget the velocity (e.g. after relocalization), keeping the last pose.
    pub fn clear_velocity(&mut self) {
        self.velocity = None;
    }

    /// Replace the last pose without touching the velocity (e.g. after a map
    /// correction moved the reference keyframe).
    pub fn set_last_pose(&mut self, pose_cw: &SE3) {
        self.prev_pose_cw = Some(pose_cw.clone());
    }

    pub fn reset(&mut self) {
        self.prev_pose_cw = None;
        self.velocity = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{UnitQuaternion, Vector3};

    fn pose(x: f64, yaw: f64) -> SE3 {
        SE3 {
            rotation: UnitQuaternion::from_euler_angles(0.0, yaw, 0.0),
            translation: Vector3::new(x, 0.0, 0.0),
        }
    }

    #[test]
    fn test_predicts_constant_motion() {
        let mut model = MotionModel::new();
        assert!(model.predict().is_none());

        let p0 = pose(0.0, 0.0);
        let step = pose(-0.1, 0.02);
        let p1 = step.compose(&p0);
        let p2 = step.compose(&p1);

        model.update(&p0);
        assert_relative_eq!(model.predict().unwrap().translation, p0.translation);
        model.update(&p1);
        let predicted = model.predict().unwrap();
        assert_relative_eq!(predicted.translation, p2.translation, epsilon = 1e-12);
        assert!(predicted.rotation_angle_to(&p2) < 1e-12);
    }

    #[test]
    fn test_clear_velocity_keeps_pose() {
        let mut model = MotionModel::new();
        model.update(&pose(0.0, 0.0));
        model.update(&pose(0.5, 0.0));
        model.clear_velocity();
        assert!(!model.has_velocity());
        assert_relative_eq!(model.predict().unwrap().translation.x, 0.5);
        model.reset();
        assert!(model.predict().is_none());
    }
}
