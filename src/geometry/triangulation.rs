//! Two-view point triangulation and the geometric checks applied to it.
//!
//! All poses here are world-to-camera (`T_cw`); image coordinates are
//! normalized (`K⁻¹·[u v 1]ᵀ`) unless the function takes a [`CameraModel`].

use nalgebra::{Matrix3, Matrix4, SMatrix, Vector2, Vector3};

use super::camera::CameraModel;
use super::so3::skew;
use super::SE3;

/// χ² at 95% with 1 DOF, used for point-to-epipolar-line distance.
pub const CHI2_1DOF: f64 = 3.84;

/// χ² at 95% with 2 DOF, used for reprojection error.
pub const CHI2_2DOF: f64 = 5.991;

/// 3x4 projection matrix `[R | t]` of a `T_cw` pose.
pub fn projection_matrix(pose_cw: &SE3) -> SMatrix<f64, 3, 4> {
    let r = pose_cw.rotation_matrix();
    let t = pose_cw.translation;
    SMatrix::<f64, 3, 4>::from_columns(&[
        r.column(0).into(),
        r.column(1).into(),
        r.column(2).into(),
        t,
    ])
}

/// Linear (DLT) triangulation from two normalized observations.
///
/// Returns `None` when the homogeneous solution lies at infinity.
pub fn triangulate_dlt(
    xn1: &Vector3<f64>,
    xn2: &Vector3<f64>,
    pose1_cw: &SE3,
    pose2_cw: &SE3,
) -> Option<Vector3<f64>> {
    let p1 = projection_matrix(pose1_cw);
    let p2 = projection_matrix(pose2_cw);

    let mut a = Matrix4::<f64>::zeros();
    for j in 0..4 {
        a[(0, j)] = xn1.x * p1[(2, j)] - p1[(0, j)];
        a[(1, j)] = xn1.y * p1[(2, j)] - p1[(1, j)];
        a[(2, j)] = xn2.x * p2[(2, j)] - p2[(0, j)];
        a[(3, j)] = xn2.y * p2[(2, j)] - p2[(1, j)];
    }

    let svd = a.svd(false, true);
    let v_t = svd.v_t?;
    let (min_idx, _) = svd
        .singular_values
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(b.1))?;
    let x = v_t.row(min_idx);

    if x[3].abs() < 1e-12 {
        return None;
    }
    let p = Vector3::new(x[0] / x[3], x[1] / x[3], x[2] / x[3]);
    if p.iter().all(|v| v.is_finite()) {
        Some(p)
    } else {
        None
    }
}

/// Cosine of the parallax angle subtended at `p_world` by two camera centers.
pub fn parallax_cos(p_world: &Vector3<f64>, center1: &Vector3<f64>, center2: &Vector3<f64>) -> f64 {
    let r1 = p_world - center1;
    let r2 = p_world - center2;
    let denom = r1.norm() * r2.norm();
    if denom < 1e-12 {
        return 1.0;
    }
    r1.dot(&r2) / denom
}

/// Cosine of the angle between two bearing rays expressed in the same frame.
pub fn ray_parallax_cos(ray1: &Vector3<f64>, ray2: &Vector3<f64>) -> f64 {
    let denom = ray1.norm() * ray2.norm();
    if denom < 1e-12 {
        return 1.0;
    }
    ray1.dot(ray2) / denom
}

/// Squared pixel reprojection error, or `None` if the point is behind the camera.
pub fn reprojection_error_sq(
    p_world: &Vector3<f64>,
    pose_cw: &SE3,
    observed: &Vector2<f64>,
    camera: &CameraModel,
) -> Option<f64> {
    let p_cam = pose_cw.transform_point(p_world);
    let uv = camera.project(&p_cam)?;
    Some((uv - observed).norm_squared())
}

/// Fundamental matrix `F12` with `x1ᵀ F12 x2 = 0` for pixels of camera 1 and 2.
pub fn fundamental_between(pose1_cw: &SE3, pose2_cw: &SE3, camera: &CameraModel) -> Matrix3<f64> {
    // T_12 = T_1w * T_w2
    let t12 = pose1_cw.compose(&pose2_cw.inverse());
    let e12 = skew(&t12.translation) * t12.rotation_matrix();
    let k = camera.k_matrix();
    let k_inv = k.try_inverse().unwrap_or_else(Matrix3::identity);
    k_inv.transpose() * e12 * k_inv
}

/// Squared distance of `p2` (pixel in image 2) to the epipolar line of `p1`.
pub fn epipolar_distance_sq(f12: &Matrix3<f64>, p1: &Vector2<f64>, p2: &Vector2<f64>) -> Option<f64> {
    let x1 = Vector3::new(p1.x, p1.y, 1.0);
    let x2 = Vector3::new(p2.x, p2.y, 1.0);
    // Epipolar line in image 2: l2 = F12ᵀ x1
    let l2 = f12.transpose() * x1;
    let den = l2.x * l2.x + l2.y * l2.y;
    if den < 1e-12 {
        return None;
    }
    let num = l2.dot(&x2);
    Some(num * num / den)
}
