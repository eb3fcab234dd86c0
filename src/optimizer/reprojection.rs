//! Monocular reprojection error shared by every optimizer.
//!
//! The error is `observed - π(T_cw · X)`, weighted by the inverse variance of
//! the pyramid level the observation was detected at. Jacobians follow the
//! left-perturbation convention of [`SE3::retract_left`]: pose columns are
//! `[rot_x, rot_y, rot_z, trans_x, trans_y, trans_z]`.

use nalgebra::{Matrix2x3, Matrix2x6, Matrix3, Vector2, Vector3};

use crate::geometry::triangulation::CHI2_2DOF;
use crate::geometry::{CameraModel, SE3};

/// χ² threshold (95%, 2 DOF) separating inliers from outliers.
pub const CHI2_MONO: f64 = CHI2_2DOF;

/// Depth below which a point is treated as behind the camera.
pub const MIN_DEPTH: f64 = 1e-6;

/// Huber threshold matching [`CHI2_MONO`].
pub fn huber_delta() -> f64 {
    CHI2_MONO.sqrt()
}

/// `observed - π(p_cam)`, or `None` when the point is not in front of the camera.
#[inline]
pub fn reprojection_error(camera: &CameraModel, p_cam: &Vector3<f64>, observed: &Vector2<f64>) -> Option<Vector2<f64>> {
    if p_cam.z <= MIN_DEPTH {
        return None;
    }
    camera.project(p_cam).map(|uv| observed - uv)
}

/// Information-weighted squared error.
#[inline]
pub fn chi2(error: &Vector2<f64>, inv_sigma2: f64) -> f64 {
    error.norm_squared() * inv_sigma2
}

/// Derivative of the error w.r.t. a left perturbation of `T_cw`.
pub fn jacobian_pose(camera: &CameraModel, p_cam: &Vector3<f64>) -> Matrix2x6<f64> {
    let (x, y, z) = (p_cam.x, p_cam.y, p_cam.z);
    if z.abs() < MIN_DEPTH {
        return Matrix2x6::zeros();
    }
    let invz = 1.0 / z;
    let invz2 = invz * invz;
    let (fx, fy) = (camera.fx, camera.fy);

    Matrix2x6::new(
        x * y * invz2 * fx,
        -(1.0 + x * x * invz2) * fx,
        y * invz * fx,
        -invz * fx,
        0.0,
        x * invz2 * fx,
        (1.0 + y * y * invz2) * fy,
        -x * y * invz2 * fy,
        -x * invz * fy,
        0.0,
        -invz * fy,
        y * invz2 * fy,
    )
}

/// Derivative of the error w.r.t. the world position of the point.
pub fn jacobian_point(camera: &CameraModel, p_cam: &Vector3<f64>, r_cw: &Matrix3<f64>) -> Matrix2x3<f64> {
    let (x, y, z) = (p_cam.x, p_cam.y, p_cam.z);
    if z.abs() < MIN_DEPTH {
        return Matrix2x3::zeros();
    }
    let invz = 1.0 / z;
    let tmp = Matrix2x3::new(
        camera.fx,
        0.0,
        -x * invz * camera.fx,
        0.0,
        camera.fy,
        -y * invz * camera.fy,
    );
    -invz * tmp * r_cw
}

/// IRLS weight of the Huber kernel for an error of magnitude `err`
/// (square root of the χ²).
#[inline]
pub fn huber_weight(err: f64, delta: f64) -> f64 {
    if err <= delta {
        1.0
    } else {
        delta / err
    }
}

/// Huber cost `ρ(s)` of a χ² value `s`.
#[inline]
pub fn huber_cost(chi2: f64, delta: f64) -> f64 {
    let delta2 = delta * delta;
    if chi2 <= delta2 {
        chi2
    } else {
        2.0 * delta * chi2.sqrt() - delta2
    }
}

/// Convenience: error of a world point seen from `pose_cw`.
pub fn world_error(camera: &CameraModel, pose_cw: &SE3, point: &Vector3<f64>, observed: &Vector2<f64>) -> Option<Vector2<f64>> {
    reprojection_error(camera, &pose_cw.transform_point(point), observed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{UnitQuaternion, Vector6};

    fn camera() -> CameraModel {
        CameraModel::pinhole(500.0, 480.0, 320.0, 240.0, 640, 480)
    }

    fn pose() -> SE3 {
        SE3 {
            rotation: UnitQuaternion::from_euler_angles(0.05, -0.1, 0.2),
            translation: Vector3::new(0.1, -0.2, 0.3),
        }
    }

    #[test]
    fn test_pose_jacobian_matches_numeric() {
        let cam = camera();
        let pose = pose();
        let point = Vector3::new(0.4, -0.3, 3.0);
        let obs = Vector2::new(300.0, 200.0);
        let analytic = jacobian_pose(&cam, &pose.transform_point(&point));

        let h = 1e-6;
        for k in 0..6 {
            let mut d = Vector6::zeros();
            d[k] = h;
            let ep = world_error(&cam, &pose.retract_left(&d), &point, &obs).unwrap();
            d[k] = -h;
            let em = world_error(&cam, &pose.retract_left(&d), &point, &obs).unwrap();
            let numeric = (ep - em) / (2.0 * h);
            assert_relative_eq!(analytic.column(k).into_owned(), numeric, epsilon = 1e-3);
        }
    }

    #[test]
    fn test_point_jacobian_matches_numeric() {
        let cam = camera();
        let pose = pose();
        let point = Vector3::new(-0.2, 0.5, 2.5);
        let obs = Vector2::new(330.0, 250.0);
        let analytic = jacobian_point(&cam, &pose.transform_point(&point), &pose.rotation_matrix());

        let h = 1e-6;
        for k in 0..3 {
            let mut dp = Vector3::zeros();
            dp[k] = h;
            let ep = world_error(&cam, &pose, &(point + dp), &obs).unwrap();
            let em = world_error(&cam, &pose, &(point - dp), &obs).unwrap();
            let numeric = (ep - em) / (2.0 * h);
            assert_relative_eq!(analytic.column(k).into_owned(), numeric, epsilon = 1e-3);
        }
    }

    #[test]
    fn test_huber() {
        let delta = huber_delta();
        assert_eq!(huber_weight(1.0, delta), 1.0);
        assert_relative_eq!(huber_weight(2.0 * delta, delta), 0.5);
        assert_relative_eq!(huber_cost(4.0, delta), 4.0);
        // Continuous at the threshold.
        assert_relative_eq!(huber_cost(CHI2_MONO, delta), CHI2_MONO, epsilon = 1e-12);
        assert!(huber_cost(100.0, delta) < 100.0);
    }

    #[test]
    fn test_behind_camera_has_no_error() {
        let cam = camera();
        assert!(reprojection_error(&cam, &Vector3::new(0.0, 0.0, -1.0), &Vector2::zeros()).is_none());
    }
}
