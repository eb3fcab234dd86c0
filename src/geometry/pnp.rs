//! PnP (Perspective-n-Point) with RANSAC over a linear DLT solver.
//!
//! Used by relocalization to recover a camera pose from 3D map points and
//! their 2D observations when no motion prior is available.

use nalgebra::{DMatrix, Matrix3, SymmetricEigen, Vector2, Vector3};
use rand::Rng;

use super::camera::CameraModel;
use super::so3::project_to_rotation;
use super::SE3;

/// Minimal sample for the linear solver.
pub const PNP_MIN_SAMPLE: usize = 6;

/// RANSAC settings.
#[derive(Debug, Clone)]
pub struct PnPParams {
    pub max_iterations: usize,
    /// Inlier threshold on squared pixel error.
    pub max_error_sq: f64,
    pub min_inliers: usize,
}

impl Default for PnPParams {
    fn default() -> Self {
        Self {
            max_iterations: 300,
            max_error_sq: 5.991,
            min_inliers: 10,
        }
    }
}

/// Result of PnP solving.
#[derive(Debug, Clone)]
pub struct PnPResult {
    /// Estimated camera pose (`T_cw`).
    pub pose: SE3,
    /// Inlier mask per correspondence.
    pub inlier_mask: Vec<bool>,
    /// Reprojection error per correspondence (in pixels).
    pub reproj_errors: Vec<f64>,
    pub num_inliers: usize,
}

/// Solve PnP with RANSAC given 3D-2D correspondences (undistorted pixels).
pub fn solve_pnp_ransac<R: Rng + ?Sized>(
    points3d: &[Vector3<f64>],
    points2d: &[Vector2<f64>],
    camera: &CameraModel,
    params: &PnPParams,
    rng: &mut R,
) -> Option<PnPResult> {
    let n = points3d.len();
    if n < PNP_MIN_SAMPLE || n != points2d.len() {
        return None;
    }
    let bearings: Vec<Vector3<f64>> = points2d.iter().map(|p| camera.unproject(p)).collect();

    let mut best: Option<PnPResult> = None;
    let mut sample = Vec::with_capacity(PNP_MIN_SAMPLE);

    for _ in 0..params.max_iterations {
        sample.clear();
        while sample.len() < PNP_MIN_SAMPLE {
            let idx = rng.gen_range(0..n);
            if !sample.contains(&idx) {
                sample.push(idx);
            }
        }

        let pts: Vec<Vector3<f64>> = sample.iter().map(|&i| points3d[i]).collect();
        let obs: Vec<Vector3<f64>> = sample.iter().map(|&i| bearings[i]).collect();
        let Some(pose) = solve_pnp_dlt(&pts, &obs) else {
            continue;
        };

        let candidate = evaluate(pose, points3d, points2d, camera, params.max_error_sq);
        if best.as_ref().map_or(true, |b| candidate.num_inliers > b.num_inliers) {
            let all_inliers = candidate.num_inliers == n;
            best = Some(candidate);
            if all_inliers {
                break;
            }
        }
    }

    let mut best = best?;
    if best.num_inliers < params.min_inliers {
        return None;
    }

    // Refit on the consensus set.
    let pts: Vec<Vector3<f64>> = (0..n).filter(|&i| best.inlier_mask[i]).map(|i| points3d[i]).collect();
    let obs: Vec<Vector3<f64>> = (0..n).filter(|&i| best.inlier_mask[i]).map(|i| bearings[i]).collect();
    if let Some(pose) = solve_pnp_dlt(&pts, &obs) {
        let refined = evaluate(pose, points3d, points2d, camera, params.max_error_sq);
        if refined.num_inliers >= best.num_inliers {
            best = refined;
        }
    }
    Some(best)
}

fn evaluate(
    pose: SE3,
    points3d: &[Vector3<f64>],
    points2d: &[Vector2<f64>],
    camera: &CameraModel,
    max_error_sq: f64,
) -> PnPResult {
    let mut reproj_errors = Vec::with_capacity(points3d.len());
    let mut inlier_mask = Vec::with_capacity(points3d.len());
    for (p3, p2) in points3d.iter().zip(points2d) {
        match camera.project(&pose.transform_point(p3)) {
            Some(uv) => {
                let err_sq = (uv - p2).norm_squared();
                reproj_errors.push(err_sq.sqrt());
                inlier_mask.push(err_sq < max_error_sq);
            }
            None => {
                reproj_errors.push(f64::INFINITY);
                inlier_mask.push(false);
            }
        }
    }
    let num_inliers = inlier_mask.iter().filter(|&&x| x).count();
    PnPResult {
        pose,
        inlier_mask,
        reproj_errors,
        num_inliers,
    }
}

/// Linear pose from at least six correspondences of world points and
/// normalized bearings (`z = 1`).
pub fn solve_pnp_dlt(points: &[Vector3<f64>], bearings: &[Vector3<f64>]) -> Option<SE3> {
    let n = points.len();
    if n < PNP_MIN_SAMPLE {
        return None;
    }

    // Condition world points: centroid at origin, mean distance √3.
    let centroid = points.iter().fold(Vector3::zeros(), |acc, p| acc + p) / n as f64;
    let mean_dist = points.iter().map(|p| (p - centroid).norm()).sum::<f64>() / n as f64;
    if mean_dist < 1e-12 {
        return None;
    }
    let s = 3f64.sqrt() / mean_dist;

    let mut a = DMatrix::<f64>::zeros(2 * n, 12);
    for (i, (p, x)) in points.iter().zip(bearings).enumerate() {
        let q = (p - centroid) * s;
        let hom = [q.x, q.y, q.z, 1.0];
        for j in 0..4 {
            a[(2 * i, j)] = hom[j];
            a[(2 * i, 8 + j)] = -x.x * hom[j];
            a[(2 * i + 1, 4 + j)] = hom[j];
            a[(2 * i + 1, 8 + j)] = -x.y * hom[j];
        }
    }

    let eig = SymmetricEigen::new(a.transpose() * &a);
    let (min_idx, _) = eig
        .eigenvalues
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(b.1))?;
    let v = eig.eigenvectors.column(min_idx);

    let mut m = Matrix3::new(v[0], v[1], v[2], v[4], v[5], v[6], v[8], v[9], v[10]);
    let mut t = Vector3::new(v[3], v[7], v[11]);
    if m.determinant() < 0.0 {
        m = -m;
        t = -t;
    }

    let r = project_to_rotation(&m)?;
    let svd = m.svd(false, false);
    let scale = svd.singular_values.sum() / 3.0;
    if scale < 1e-12 {
        return None;
    }
    let t_norm = t / scale;

    // Undo the conditioning: X' = s (X - c).
    let translation = t_norm / s - r * centroid;
    let pose = SE3::from_rt(&r, &translation);

    // Majority of points must be in front of the camera.
    let in_front = points.iter().filter(|p| pose.transform_point(p).z > 0.0).count();
    if in_front * 2 < n {
        return None;
    }
    Some(pose)
}
