//! SE3: 6-DOF rigid body transformation (rotation + translation).
//!
//! Poses in this crate follow the `T_target_source` naming: `T_cw` maps world
//! points into the camera frame, `T_wc` maps camera points into the world.

use nalgebra::{Matrix3, Matrix4, Rotation3, UnitQuaternion, Vector3, Vector6};

/// Rigid body transformation. Transforms points as `p' = R * p + t`.
#[derive(Debug, Clone, PartialEq)]
pub struct SE3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
}

impl SE3 {
    /// Identity transformation.
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    /// Construct from a rotation matrix and translation.
    pub fn from_rt(rotation: &Matrix3<f64>, translation: &Vector3<f64>) -> Self {
        let rot3 = Rotation3::from_matrix(rotation);
        Self {
            rotation: UnitQuaternion::from_rotation_matrix(&rot3),
            translation: *translation,
        }
    }

    /// Construct from quaternion (w, x, y, z) and translation.
    pub fn from_quaternion(qw: f64, qx: f64, qy: f64, qz: f64, translation: Vector3<f64>) -> Self {
        let rotation = UnitQuaternion::from_quaternion(nalgebra::Quaternion::new(qw, qx, qy, qz));
        Self {
            rotation,
            translation,
        }
    }

    /// Inverse transformation: `[R^T | -R^T t]`.
    pub fn inverse(&self) -> Self {
        let rot_inv = self.rotation.inverse();
        Self {
            rotation: rot_inv,
            translation: -(rot_inv * self.translation),
        }
    }

    /// Compose two transforms: `self ∘ other`.
    pub fn compose(&self, other: &SE3) -> Self {
        Self {
            rotation: self.rotation * other.rotation,
            translation: self.rotation * other.translation + self.translation,
        }
    }

    /// Transform a point: `p' = R * p + t`.
    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * p + self.translation
    }

    /// Rotation as a 3x3 matrix.
    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.rotation.to_rotation_matrix().into_inner()
    }

    /// Homogeneous 4x4 matrix `[R | t; 0 0 0 1]`.
    pub fn to_matrix(&self) -> Matrix4<f64> {
        let mut m = Matrix4::identity();
        m.fixed_view_mut::<3, 3>(0, 0).copy_from(&self.rotation_matrix());
        m.fixed_view_mut::<3, 1>(0, 3).copy_from(&self.translation);
        m
    }

    /// For a `T_cw` pose: the camera center in world coordinates, `-R^T t`.
    pub fn camera_center(&self) -> Vector3<f64> {
        -(self.rotation.inverse() * self.translation)
    }

    /// Left-multiplicative update used by the optimizers:
    /// `exp([ω, v]) ∘ self`, with `ω` the rotation part.
    pub fn retract_left(&self, delta: &Vector6<f64>) -> Self {
        let omega = Vector3::new(delta[0], delta[1], delta[2]);
        let upsilon = Vector3::new(delta[3], delta[4], delta[5]);
        let update = SE3 {
            rotation: UnitQuaternion::from_scaled_axis(omega),
            translation: upsilon,
        };
        update.compose(self)
    }

    /// Logarithm as `[rotation vector, translation]`. Not the true SE3 log
    /// (translation is not left-Jacobian corrected), which is sufficient for
    /// the small residuals of relative-pose edges.
    pub fn log(&self) -> Vector6<f64> {
        let r = self.rotation.scaled_axis();
        Vector6::new(r.x, r.y, r.z, self.translation.x, self.translation.y, self.translation.z)
    }

    /// Angular distance between two rotations in radians.
    pub fn rotation_angle_to(&self, other: &SE3) -> f64 {
        self.rotation.angle_to(&other.rotation)
    }
}

impl Default for SE3 {
    fn default() -> Self {
        Self::identity()
    }
}
