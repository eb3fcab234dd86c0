//! Sim3: 7-DOF similarity transformation (rotation + translation + scale).
//!
//! A monocular map is only defined up to scale, so loop closure has to correct
//! scale drift along with rotation and translation. Loop corrections are
//! expressed as Sim3 and converted back to SE3 keyframe poses once the scale
//! has been folded into the translation.

use nalgebra::{Matrix3, Rotation3, UnitQuaternion, Vector3};

use super::SE3;

/// Similarity transformation. Transforms points as `p' = s * R * p + t`.
#[derive(Debug, Clone, PartialEq)]
pub struct Sim3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
    pub scale: f64,
}

impl Sim3 {
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
            scale: 1.0,
        }
    }

    /// Construct from a rotation matrix, translation and scale.
    pub fn from_rts(rotation: Matrix3<f64>, translation: Vector3<f64>, scale: f64) -> Self {
        let rot3 = Rotation3::from_matrix(&rotation);
        Self {
            rotation: UnitQuaternion::from_rotation_matrix(&rot3),
            translation,
            scale,
        }
    }

    /// Lift an SE3 pose to a Sim3 with unit scale.
    pub fn from_se3(se3: &SE3) -> Self {
        Self {
            rotation: se3.rotation,
            translation: se3.translation,
            scale: 1.0,
        }
    }

    /// Project a Sim3 `S_cw = [sR | t]` to the rigid pose `T_cw = [R | t / s]`.
    ///
    /// Both transforms place the camera center at the same world point, which
    /// is what keyframe pose correction needs.
    pub fn to_se3_normalized(&self) -> SE3 {
        SE3 {
            rotation: self.rotation,
            translation: self.translation / self.scale,
        }
    }

    /// Inverse: `[(1/s)R^T | -(1/s)R^T t]`.
    pub fn inverse(&self) -> Self {
        let rot_inv = self.rotation.inverse();
        let scale_inv = 1.0 / self.scale;
        Self {
            rotation: rot_inv,
            translation: -(rot_inv * self.translation) * scale_inv,
            scale: scale_inv,
        }
    }

    /// Compose two transforms: `self ∘ other`.
    pub fn compose(&self, other: &Sim3) -> Self {
        Self {
            rotation: self.rotation * other.rotation,
            translation: self.scale * (self.rotation * other.translation) + self.translation,
            scale: self.scale * other.scale,
        }
    }

    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.scale * (self.rotation * p) + self.translation
    }

    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.rotation.to_rotation_matrix().into_inner()
    }

    /// Tangent vector `[rotation vector, translation, ln(scale)]`.
    pub fn log(&self) -> [f64; 7] {
        let r = self.rotation.scaled_axis();
        [
            r.x,
            r.y,
            r.z,
            self.translation.x,
            self.translation.y,
            self.translation.z,
            self.scale.ln(),
        ]
    }

    /// Inverse of [`Sim3::log`].
    pub fn exp(tangent: &[f64; 7]) -> Self {
        Self {
            rotation: UnitQuaternion::from_scaled_axis(Vector3::new(tangent[0], tangent[1], tangent[2])),
            translation: Vector3::new(tangent[3], tangent[4], tangent[5]),
            scale: tangent[6].exp(),
        }
    }
}

impl Default for Sim3 {
    fn default() -> Self {
        Self::identity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample() -> Sim3 {
        Sim3 {
            rotation: UnitQuaternion::from_axis_angle(&Vector3::z_axis(), std::f64::consts::FRAC_PI_2),
            translation: Vector3::new(1.0, 2.0, 3.0),
            scale: 2.0,
        }
    }

    #[test]
    fn test_inverse_roundtrip_point() {
        let s = sample();
        let p = Vector3::new(0.3, -0.7, 1.1);
        let back = s.inverse().transform_point(&s.transform_point(&p));
        assert_relative_eq!(back, p, epsilon = 1e-10);
    }

    #[test]
    fn test_compose_scales_multiply() {
        let s1 = Sim3 {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::new(1.0, 0.0, 0.0),
            scale: 2.0,
        };
        let s2 = Sim3 {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::new(0.0, 1.0, 0.0),
            scale: 3.0,
        };
        let c = s1.compose(&s2);
        assert_relative_eq!(c.scale, 6.0, epsilon = 1e-12);
        assert_relative_eq!(c.translation, Vector3::new(1.0, 2.0, 0.0), epsilon = 1e-12);
    }

    #[test]
    fn test_normalized_se3_keeps_camera_center() {
        let s_cw = sample();
        let t_cw = s_cw.to_se3_normalized();
        // Camera center of a Sim3 pose is the point mapped to the origin.
        let center_sim = s_cw.inverse().transform_point(&Vector3::zeros());
        assert_relative_eq!(t_cw.camera_center(), center_sim, epsilon = 1e-10);
    }

    #[test]
    fn test_log_exp_roundtrip() {
        let s = sample();
        let r = Sim3::exp(&s.log());
        assert_relative_eq!(r.scale, s.scale, epsilon = 1e-10);
        assert_relative_eq!(r.translation, s.translation, epsilon = 1e-10);
        assert_relative_eq!(r.rotation.angle_to(&s.rotation), 0.0, epsilon = 1e-10);
    }
}
