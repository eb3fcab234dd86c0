//! Sim3 solver using Horn's method with RANSAC.
//!
//! Computes the similarity `S12` between the camera frames of two keyframes
//! from map points matched between them. With a monocular camera the scale
//! of the two sides may have drifted apart, so the scale is estimated.
//! Hypotheses are scored by reprojection in both images.

use nalgebra::{Matrix3, Rotation3, UnitQuaternion, Vector3};
use rand::Rng;

use crate::geometry::triangulation::CHI2_2DOF;
use crate::geometry::{CameraModel, Sim3};
use crate::optimizer::Sim3Correspondence;

/// Configuration for Sim3 RANSAC solver.
#[derive(Debug, Clone)]
pub struct Sim3SolverConfig {
    /// Maximum number of RANSAC iterations.
    pub max_iterations: usize,
    /// Minimum number of inliers required.
    pub min_inliers: usize,
    /// Probability of drawing at least one all-inlier sample.
    pub probability: f64,
    /// χ² (2 DOF) bound on the reprojection error, scaled by the level sigma².
    pub chi2_threshold: f64,
}

impl Default for Sim3SolverConfig {
    fn default() -> Self {
        Self {
            max_iterations: 300,
            min_inliers: 20,
            probability: 0.99,
            chi2_threshold: CHI2_2DOF,
        }
    }
}

/// Result from Sim3 RANSAC solver.
#[derive(Debug, Clone)]
pub struct Sim3Result {
    /// Maps camera-2 coordinates into camera 1.
    pub s12: Sim3,
    /// Inlier flag per correspondence.
    pub inliers: Vec<bool>,
    pub num_inliers: usize,
}

/// Estimate `S12` from correspondences with RANSAC over minimal three-point
/// samples, refitting on all inliers of the best hypothesis.
///
/// Returns `None` when fewer than `min_inliers` correspondences agree.
pub fn compute_sim3_ransac<R: Rng>(
    correspondences: &[Sim3Correspondence],
    camera: &CameraModel,
    config: &Sim3SolverConfig,
    rng: &mut R,
) -> Option<Sim3Result> {
    let n = correspondences.len();
    if n < 3 || n < config.min_inliers {
        return None;
    }

    let mut best: Option<Sim3Result> = None;
    let mut max_iter = config.max_iterations;
    let mut iteration = 0;

    while iteration < max_iter {
        iteration += 1;
        let sample = sample_three_indices(rng, n);
        let p1: Vec<Vector3<f64>> = sample.iter().map(|&i| correspondences[i].p1_cam).collect();
        let p2: Vec<Vector3<f64>> = sample.iter().map(|&i| correspondences[i].p2_cam).collect();

        let Some(s12) = compute_sim3_horn(&p2, &p1) else {
            continue;
        };
        let inliers = check_inliers(correspondences, &s12, camera, config.chi2_threshold);
        let num_inliers = inliers.iter().filter(|&&i| i).count();

        if num_inliers > best.as_ref().map_or(0, |b| b.num_inliers) {
            best = Some(Sim3Result {
                s12,
                inliers,
                num_inliers,
            });
            if num_inliers >= config.min_inliers {
                let ratio = num_inliers as f64 / n as f64;
                let needed = compute_adaptive_iterations(ratio, config.probability, 3);
                max_iter = max_iter.min(iteration.saturating_add(needed));
            }
        }
    }

    let mut result = best.filter(|b| b.num_inliers >= config.min_inliers)?;

    let (p1, p2): (Vec<Vector3<f64>>, Vec<Vector3<f64>>) = correspondences
        .iter()
        .zip(&result.inliers)
        .filter(|(_, &inlier)| inlier)
        .map(|(c, _)| (c.p1_cam, c.p2_cam))
        .unzip();
    if let Some(refined) = compute_sim3_horn(&p2, &p1) {
        let inliers = check_inliers(correspondences, &refined, camera, config.chi2_threshold);
        let num_inliers = inliers.iter().filter(|&&i| i).count();
        if num_inliers >= result.num_inliers {
            result = Sim3Result {
                s12: refined,
                inliers,
                num_inliers,
            };
        }
    }

    Some(result)
}

/// Closed-form similarity `S` with `to ≈ S · from` (Horn / Umeyama).
///
/// The rotation comes from the SVD of the cross-covariance of the centred
/// point sets; the scale is the least-squares scale given that rotation.
pub fn compute_sim3_horn(from: &[Vector3<f64>], to: &[Vector3<f64>]) -> Option<Sim3> {
    let n = from.len();
    if n < 3 || n != to.len() {
        return None;
    }

    let centroid_from = compute_centroid(from);
    let centroid_to = compute_centroid(to);
    let centered_from: Vec<Vector3<f64>> = from.iter().map(|p| p - centroid_from).collect();
    let centered_to: Vec<Vector3<f64>> = to.iter().map(|p| p - centroid_to).collect();

    let mut h = Matrix3::zeros();
    for (a, b) in centered_from.iter().zip(&centered_to) {
        h += a * b.transpose();
    }

    let svd = h.svd(true, true);
    let u = svd.u?;
    let v_t = svd.v_t?;
    let mut rotation_mat = v_t.transpose() * u.transpose();
    if rotation_mat.determinant() < 0.0 {
        let mut v = v_t.transpose();
        for i in 0..3 {
            v[(i, 2)] = -v[(i, 2)];
        }
        rotation_mat = v * u.transpose();
    }
    let rotation = UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(rotation_mat));

    let denom: f64 = centered_from.iter().map(|p| p.norm_squared()).sum();
    if denom < 1e-12 {
        return None;
    }
    let numer: f64 = centered_from
        .iter()
        .zip(&centered_to)
        .map(|(a, b)| b.dot(&(rotation * a)))
        .sum();
    let scale = numer / denom;
    if !scale.is_finite() || scale <= 0.0 {
        return None;
    }

    let translation = centroid_to - scale * (rotation * centroid_from);
    Some(Sim3 {
        rotation,
        translation,
        scale,
    })
}

/// A correspondence is an inlier when both of its points reproject within
/// the χ² bound of the matched keypoint in the other image.
fn check_inliers(correspondences: &[Sim3Correspondence], s12: &Sim3, camera: &CameraModel, chi2: f64) -> Vec<bool> {
    let s21 = s12.inverse();
    correspondences
        .iter()
        .map(|c| {
            let in1 = camera
                .project(&s12.transform_point(&c.p2_cam))
                .map_or(false, |uv| (uv - c.uv1).norm_squared() * c.inv_sigma2_1 < chi2);
            let in2 = camera
                .project(&s21.transform_point(&c.p1_cam))
                .map_or(false, |uv| (uv - c.uv2).norm_squared() * c.inv_sigma2_2 < chi2);
            in1 && in2
        })
        .collect()
}

fn compute_centroid(points: &[Vector3<f64>]) -> Vector3<f64> {
    if points.is_empty() {
        return Vector3::zeros();
    }
    let sum: Vector3<f64> = points.iter().sum();
    sum / points.len() as f64
}

fn sample_three_indices<R: Rng>(rng: &mut R, n: usize) -> [usize; 3] {
    let mut indices = [0usize; 3];
    indices[0] = rng.gen_range(0..n);
    loop {
        indices[1] = rng.gen_range(0..n);
        if indices[1] != indices[0] {
            break;
        }
    }
    loop {
        indices[2] = rng.gen_range(0..n);
        if indices[2] != indices[0] && indices[2] != indices[1] {
            break;
        }
    }
    indices
}

/// k = log(1 - p) / log(1 - wⁿ)
fn compute_adaptive_iterations(inlier_ratio: f64, probability: f64, sample_size: usize) -> usize {
    if inlier_ratio <= 0.0 {
        return usize::MAX;
    }
    if inlier_ratio >= 1.0 {
        return 1;
    }
    let log_denom = (1.0 - inlier_ratio.powi(sample_size as i32)).ln();
    if log_denom.abs() < 1e-10 {
        return usize::MAX;
    }
    let k = (1.0 - probability).ln() / log_denom;
    (k.ceil() as usize).max(1)
}
