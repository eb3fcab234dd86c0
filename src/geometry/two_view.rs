//! Two-view reconstruction for monocular map initialization.
//!
//! Estimates the essential matrix between a reference and a current view with
//! the normalized eight-point algorithm inside RANSAC, decomposes it into the
//! four candidate motions and keeps the one that triangulates most points in
//! front of both cameras with enough parallax.
//!
//! Convention: `x2ᵀ E21 x1 = 0` for normalized coordinates, with
//! `X2 = R21 X1 + t21`. The first camera is the world origin, so the returned
//! pose is directly `T_cw` of the second view. Translation has unit norm.

use nalgebra::{DMatrix, Matrix3, SymmetricEigen, Vector2, Vector3};
use rand::Rng;
use tracing::debug;

use super::camera::CameraModel;
use super::so3::skew;
use super::triangulation::{parallax_cos, triangulate_dlt, CHI2_1DOF, CHI2_2DOF};
use super::SE3;

/// Tuning for [`reconstruct_two_view`].
#[derive(Debug, Clone)]
pub struct TwoViewParams {
    pub ransac_iterations: usize,
    /// Pixel standard deviation of keypoint measurements.
    pub sigma: f64,
    pub min_parallax_deg: f64,
    pub min_triangulated: usize,
}

impl Default for TwoViewParams {
    fn default() -> Self {
        Self {
            ransac_iterations: 200,
            sigma: 1.0,
            min_parallax_deg: 1.0,
            min_triangulated: 50,
        }
    }
}

/// A successful two-view reconstruction.
#[derive(Debug, Clone)]
pub struct TwoViewReconstruction {
    /// `T_cw` of the second view (first view is identity).
    pub pose2_cw: SE3,
    /// Triangulated world point per input correspondence, `None` when rejected.
    pub points: Vec<Option<Vector3<f64>>>,
    pub num_triangulated: usize,
    /// Median parallax of the triangulated points, in degrees.
    pub median_parallax_deg: f64,
}

/// Why a reconstruction attempt did not produce a map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TwoViewFailure {
    TooFewCorrespondences,
    NoModel,
    TooFewTriangulated,
    LowParallax,
    Ambiguous,
}

/// Reconstruct relative motion and structure from pixel correspondences.
///
/// `pixels1[i]` and `pixels2[i]` are undistorted pixel coordinates of the same
/// point in the reference and current image.
pub fn reconstruct_two_view<R: Rng + ?Sized>(
    pixels1: &[Vector2<f64>],
    pixels2: &[Vector2<f64>],
    camera: &CameraModel,
    params: &TwoViewParams,
    rng: &mut R,
) -> Result<TwoViewReconstruction, TwoViewFailure> {
    let n = pixels1.len();
    if n < 8 || n != pixels2.len() {
        return Err(TwoViewFailure::TooFewCorrespondences);
    }

    let n1: Vec<Vector3<f64>> = pixels1.iter().map(|p| camera.unproject(p)).collect();
    let n2: Vec<Vector3<f64>> = pixels2.iter().map(|p| camera.unproject(p)).collect();

    let (e21, inliers) = find_essential(&n1, &n2, pixels1, pixels2, camera, params, rng)
        .ok_or(TwoViewFailure::NoModel)?;

    reconstruct_from_essential(&e21, &n1, &n2, pixels1, pixels2, &inliers, camera, params)
}

/// RANSAC over the eight-point essential matrix. Returns the best model and its inlier mask.
fn find_essential<R: Rng + ?Sized>(
    n1: &[Vector3<f64>],
    n2: &[Vector3<f64>],
    pixels1: &[Vector2<f64>],
    pixels2: &[Vector2<f64>],
    camera: &CameraModel,
    params: &TwoViewParams,
    rng: &mut R,
) -> Option<(Matrix3<f64>, Vec<bool>)> {
    let n = n1.len();
    let (t1, m1) = hartley_normalize(n1);
    let (t2, m2) = hartley_normalize(n2);

    let mut best: Option<(Matrix3<f64>, Vec<bool>, f64)> = None;
    let mut sample = Vec::with_capacity(8);

    for _ in 0..params.ransac_iterations.max(1) {
        sample.clear();
        while sample.len() < 8 {
            let idx = rng.gen_range(0..n);
            if !sample.contains(&idx) {
                sample.push(idx);
            }
        }

        let a: Vec<Vector3<f64>> = sample.iter().map(|&i| m1[i]).collect();
        let b: Vec<Vector3<f64>> = sample.iter().map(|&i| m2[i]).collect();
        let Some(e_norm) = eight_point(&a, &b) else {
            continue;
        };
        let e21 = enforce_essential(&(t2.transpose() * e_norm * t1));

        let (mask, score) = score_essential(&e21, pixels1, pixels2, camera, params.sigma);
        if best.as_ref().map_or(true, |(_, _, s)| score > *s) {
            best = Some((e21, mask, score));
        }
    }

    let (e21, mask, _) = best?;

    // Refit on all inliers.
    let a: Vec<Vector3<f64>> = (0..n).filter(|&i| mask[i]).map(|i| m1[i]).collect();
    let b: Vec<Vector3<f64>> = (0..n).filter(|&i| mask[i]).map(|i| m2[i]).collect();
    if a.len() >= 8 {
        if let Some(e_norm) = eight_point(&a, &b) {
            let refined = enforce_essential(&(t2.transpose() * e_norm * t1));
            let (refined_mask, _) = score_essential(&refined, pixels1, pixels2, camera, params.sigma);
            let count = |m: &[bool]| m.iter().filter(|&&x| x).count();
            if count(&refined_mask) >= count(&mask) {
                return Some((refined, refined_mask));
            }
        }
    }
    Some((e21, mask))
}

/// Similarity that moves the centroid to the origin and the mean distance to √2.
fn hartley_normalize(points: &[Vector3<f64>]) -> (Matrix3<f64>, Vec<Vector3<f64>>) {
    let n = points.len().max(1) as f64;
    let mean_x = points.iter().map(|p| p.x).sum::<f64>() / n;
    let mean_y = points.iter().map(|p| p.y).sum::<f64>() / n;
    let mean_dist = points
        .iter()
        .map(|p| ((p.x - mean_x).powi(2) + (p.y - mean_y).powi(2)).sqrt())
        .sum::<f64>()
        / n;
    let s = if mean_dist > 1e-12 { std::f64::consts::SQRT_2 / mean_dist } else { 1.0 };
    let t = Matrix3::new(
        s, 0.0, -s * mean_x,
        0.0, s, -s * mean_y,
        0.0, 0.0, 1.0,
    );
    let normalized = points.iter().map(|p| t * Vector3::new(p.x, p.y, 1.0)).collect();
    (t, normalized)
}

/// Linear eight-point solve of `x2ᵀ E x1 = 0` (at least eight pairs).
fn eight_point(x1: &[Vector3<f64>], x2: &[Vector3<f64>]) -> Option<Matrix3<f64>> {
    let n = x1.len();
    let mut a = DMatrix::<f64>::zeros(n, 9);
    for i in 0..n {
        let (u1, v1) = (x1[i].x, x1[i].y);
        let (u2, v2) = (x2[i].x, x2[i].y);
        let row = [u2 * u1, u2 * v1, u2, v2 * u1, v2 * v1, v2, u1, v1, 1.0];
        for (j, v) in row.iter().enumerate() {
            a[(i, j)] = *v;
        }
    }
    let ata = a.transpose() * &a;
    let eig = SymmetricEigen::new(ata);
    let (min_idx, _) = eig
        .eigenvalues
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(b.1))?;
    let e = eig.eigenvectors.column(min_idx);
    let m = Matrix3::new(e[0], e[1], e[2], e[3], e[4], e[5], e[6], e[7], e[8]);
    if m.iter().all(|v| v.is_finite()) {
        Some(m)
    } else {
        None
    }
}

/// Project onto the essential manifold: singular values `(1, 1, 0)`.
fn enforce_essential(e: &Matrix3<f64>) -> Matrix3<f64> {
    let svd = e.svd(true, true);
    match (svd.u, svd.v_t) {
        (Some(u), Some(v_t)) => u * Matrix3::from_diagonal(&Vector3::new(1.0, 1.0, 0.0)) * v_t,
        _ => *e,
    }
}

/// Symmetric point-to-epipolar-line test in pixels, scored the way
/// inlier-weighted RANSAC does (larger is better).
fn score_essential(
    e21: &Matrix3<f64>,
    pixels1: &[Vector2<f64>],
    pixels2: &[Vector2<f64>],
    camera: &CameraModel,
    sigma: f64,
) -> (Vec<bool>, f64) {
    let k_inv = camera.k_matrix().try_inverse().unwrap_or_else(Matrix3::identity);
    let f21 = k_inv.transpose() * e21 * k_inv;
    let inv_sigma2 = 1.0 / (sigma * sigma);

    let mut mask = vec![false; pixels1.len()];
    let mut score = 0.0;
    for (i, (p1, p2)) in pixels1.iter().zip(pixels2).enumerate() {
        let x1 = Vector3::new(p1.x, p1.y, 1.0);
        let x2 = Vector3::new(p2.x, p2.y, 1.0);

        // Line in image 2 and distance of x2.
        let l2 = f21 * x1;
        let num2 = l2.dot(&x2);
        let den2 = l2.x * l2.x + l2.y * l2.y;
        // Line in image 1 and distance of x1.
        let l1 = f21.transpose() * x2;
        let num1 = l1.dot(&x1);
        let den1 = l1.x * l1.x + l1.y * l1.y;
        if den1 < 1e-12 || den2 < 1e-12 {
            continue;
        }

        let chi2 = num2 * num2 / den2 * inv_sigma2;
        let chi1 = num1 * num1 / den1 * inv_sigma2;
        if chi1 > CHI2_1DOF || chi2 > CHI2_1DOF {
            continue;
        }
        score += (CHI2_2DOF - chi1) + (CHI2_2DOF - chi2);
        mask[i] = true;
    }
    (mask, score)
}

/// Outcome of triangulating the inliers under one candidate motion.
struct MotionCheck {
    points: Vec<Option<Vector3<f64>>>,
    num_good: usize,
    parallax_deg: Vec<f64>,
}

#[allow(clippy::too_many_arguments)]
fn reconstruct_from_essential(
    e21: &Matrix3<f64>,
    n1: &[Vector3<f64>],
    n2: &[Vector3<f64>],
    pixels1: &[Vector2<f64>],
    pixels2: &[Vector2<f64>],
    inliers: &[bool],
    camera: &CameraModel,
    params: &TwoViewParams,
) -> Result<TwoViewReconstruction, TwoViewFailure> {
    let candidates = decompose_essential(e21).ok_or(TwoViewFailure::NoModel)?;
    let th2 = 4.0 * params.sigma * params.sigma;

    let checks: Vec<(SE3, MotionCheck)> = candidates
        .into_iter()
        .map(|pose| {
            let check = check_motion(&pose, n1, n2, pixels1, pixels2, inliers, camera, th2);
            (pose, check)
        })
        .collect();

    let max_good = checks.iter().map(|(_, c)| c.num_good).max().unwrap_or(0);
    let num_inliers = inliers.iter().filter(|&&x| x).count();
    debug!(
        "[Init] essential inliers={} good per motion={:?}",
        num_inliers,
        checks.iter().map(|(_, c)| c.num_good).collect::<Vec<_>>()
    );

    let min_good = params.min_triangulated.max((0.9 * num_inliers as f64) as usize / 2);
    if max_good < params.min_triangulated || max_good < min_good {
        return Err(TwoViewFailure::TooFewTriangulated);
    }

    let similar = checks
        .iter()
        .filter(|(_, c)| c.num_good as f64 > 0.7 * max_good as f64)
        .count();
    if similar > 1 {
        return Err(TwoViewFailure::Ambiguous);
    }

    let (pose2_cw, best) = checks
        .into_iter()
        .max_by_key(|(_, c)| c.num_good)
        .ok_or(TwoViewFailure::NoModel)?;

    let mut parallax = best.parallax_deg;
    parallax.sort_by(|a, b| a.total_cmp(b));
    let median_parallax_deg = parallax.get(parallax.len() / 2).copied().unwrap_or(0.0);
    if median_parallax_deg < params.min_parallax_deg {
        return Err(TwoViewFailure::LowParallax);
    }

    let num_triangulated = best.points.iter().filter(|p| p.is_some()).count();
    Ok(TwoViewReconstruction {
        pose2_cw,
        points: best.points,
        num_triangulated,
        median_parallax_deg,
    })
}

/// Four `(R, t)` candidates of an essential matrix as `T_cw` of the second view.
fn decompose_essential(e21: &Matrix3<f64>) -> Option<[SE3; 4]> {
    let svd = e21.svd(true, true);
    let u = svd.u?;
    let v_t = svd.v_t?;

    let mut t: Vector3<f64> = u.column(2).into_owned();
    let norm = t.norm();
    if norm < 1e-12 {
        return None;
    }
    t /= norm;

    let w = Matrix3::new(
        0.0, -1.0, 0.0,
        1.0, 0.0, 0.0,
        0.0, 0.0, 1.0,
    );
    let mut r1 = u * w * v_t;
    if r1.determinant() < 0.0 {
        r1 = -r1;
    }
    let mut r2 = u * w.transpose() * v_t;
    if r2.determinant() < 0.0 {
        r2 = -r2;
    }

    Some([
        SE3::from_rt(&r1, &t),
        SE3::from_rt(&r1, &(-t)),
        SE3::from_rt(&r2, &t),
        SE3::from_rt(&r2, &(-t)),
    ])
}

#[allow(clippy::too_many_arguments)]
fn check_motion(
    pose2_cw: &SE3,
    n1: &[Vector3<f64>],
    n2: &[Vector3<f64>],
    pixels1: &[Vector2<f64>],
    pixels2: &[Vector2<f64>],
    inliers: &[bool],
    camera: &CameraModel,
    th2: f64,
) -> MotionCheck {
    let pose1_cw = SE3::identity();
    let center1 = Vector3::zeros();
    let center2 = pose2_cw.camera_center();

    let mut points = vec![None; n1.len()];
    let mut num_good = 0;
    let mut parallax_deg = Vec::new();

    for i in 0..n1.len() {
        if !inliers[i] {
            continue;
        }
        let Some(p) = triangulate_dlt(&n1[i], &n2[i], &pose1_cw, pose2_cw) else {
            continue;
        };
        let cos_par = parallax_cos(&p, &center1, &center2);

        let p2 = pose2_cw.transform_point(&p);
        if p.z <= 0.0 && cos_par < 0.99998 {
            continue;
        }
        if p2.z <= 0.0 && cos_par < 0.99998 {
            continue;
        }

        let Some(uv1) = camera.project(&p) else {
            continue;
        };
        if (uv1 - pixels1[i]).norm_squared() > th2 {
            continue;
        }
        let Some(uv2) = camera.project(&p2) else {
            continue;
        };
        if (uv2 - pixels2[i]).norm_squared() > th2 {
            continue;
        }

        num_good += 1;
        parallax_deg.push(cos_par.clamp(-1.0, 1.0).acos().to_degrees());
        if cos_par < 0.99998 {
            points[i] = Some(p);
        }
    }

    MotionCheck {
        points,
        num_good,
        parallax_deg,
    }
}

/// Essential matrix `E21 = [t21]× R21` of a known relative motion.
pub fn essential_from_pose(pose21: &SE3) -> Matrix3<f64> {
    skew(&pose21.translation) * pose21.rotation_matrix()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn camera() -> CameraModel {
        CameraModel::pinhole(500.0, 500.0, 320.0, 240.0, 640, 480)
    }

    fn scene(pose2_cw: &SE3, n: usize) -> (Vec<Vector2<f64>>, Vec<Vector2<f64>>, Vec<Vector3<f64>>) {
        let cam = camera();
        let mut rng = StdRng::seed_from_u64(7);
        let mut p1 = Vec::new();
        let mut p2 = Vec::new();
        let mut pts = Vec::new();
        while pts.len() < n {
            let p = Vector3::new(
                rng.gen_range(-1.5..1.5),
                rng.gen_range(-1.0..1.0),
                rng.gen_range(2.0..5.0),
            );
            let (Some(a), Some(b)) = (cam.project(&p), cam.project(&pose2_cw.transform_point(&p))) else {
                continue;
            };
            if !cam.is_in_image(&a) || !cam.is_in_image(&b) {
                continue;
            }
            p1.push(a);
            p2.push(b);
            pts.push(p);
        }
        (p1, p2, pts)
    }

    #[test]
    fn test_essential_from_pose_satisfies_constraint() {
        let pose = SE3 {
            rotation: UnitQuaternion::from_euler_angles(0.02, 0.1, -0.03),
            translation: Vector3::new(-0.5, 0.1, 0.05),
        };
        let e = essential_from_pose(&pose);
        let x = Vector3::new(0.3, -0.2, 2.0);
        let x2 = pose.transform_point(&x);
        let r = (x2 / x2.z).dot(&(e * (x / x.z)));
        assert!(r.abs() < 1e-12);
    }

    #[test]
    fn test_reconstruct_recovers_motion_up_to_scale() {
        let t_wc2 = SE3 {
            rotation: UnitQuaternion::from_euler_angles(0.0, -0.03, 0.0),
            translation: Vector3::new(0.4, 0.0, 0.0),
        };
        let pose2_cw = t_wc2.inverse();
        let (p1, p2, pts) = scene(&pose2_cw, 150);
        let params = TwoViewParams::default();
        let mut rng = StdRng::seed_from_u64(1);
        let rec = reconstruct_two_view(&p1, &p2, &camera(), &params, &mut rng).unwrap();

        assert_relative_eq!(rec.pose2_cw.rotation_angle_to(&pose2_cw), 0.0, epsilon = 1e-6);
        let dir = rec.pose2_cw.translation.normalize();
        assert_relative_eq!(dir, pose2_cw.translation.normalize(), epsilon = 1e-6);

        // Structure is recovered up to the baseline scale.
        let scale = pose2_cw.translation.norm();
        let mut checked = 0;
        for (i, p) in rec.points.iter().enumerate() {
            if let Some(p) = p {
                assert_relative_eq!(p * scale, pts[i], epsilon = 1e-5);
                checked += 1;
            }
        }
        assert!(checked >= params.min_triangulated);
    }

    #[test]
    fn test_pure_rotation_has_low_parallax() {
        let pose2_cw = SE3 {
            rotation: UnitQuaternion::from_euler_angles(0.0, 0.05, 0.0),
            translation: Vector3::new(1e-6, 0.0, 0.0),
        };
        let (p1, p2, _) = scene(&pose2_cw, 120);
        let mut rng = StdRng::seed_from_u64(3);
        let result = reconstruct_two_view(&p1, &p2, &camera(), &TwoViewParams::default(), &mut rng);
        assert!(result.is_err());
    }

    #[test]
    fn test_too_few_correspondences() {
        let p = vec![Vector2::new(1.0, 2.0); 5];
        let mut rng = StdRng::seed_from_u64(0);
        let r = reconstruct_two_view(&p, &p, &camera(), &TwoViewParams::default(), &mut rng);
        assert_eq!(r.unwrap_err(), TwoViewFailure::TooFewCorrespondences);
    }
}
