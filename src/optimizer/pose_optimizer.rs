//! Pose-only optimization for tracking.
//!
//! Refines the current frame's `T_cw` against fixed map points. Runs several
//! rounds of robust Gauss-Newton; after each round every observation is
//! reclassified as inlier or outlier by its χ², and outliers are left out of
//! the next round (they may come back once the pose improves).

use nalgebra::{Matrix6, Vector2, Vector3, Vector6};
use tracing::debug;

use crate::geometry::{CameraModel, SE3};

use super::reprojection::{chi2, huber_delta, huber_weight, jacobian_pose, reprojection_error, CHI2_MONO};

/// Minimum observations for a pose to be constrained at all.
const MIN_OBSERVATIONS: usize = 3;

/// Stop early when fewer inliers than this survive a round.
const MIN_INLIERS_TO_CONTINUE: usize = 10;

/// Configuration for pose-only optimization.
#[derive(Debug, Clone)]
pub struct PoseOptimizationConfig {
    /// Outlier reclassification rounds.
    pub rounds: usize,
    /// Gauss-Newton iterations per round.
    pub iterations: usize,
    pub chi2_threshold: f64,
    pub huber_delta: f64,
}

impl Default for PoseOptimizationConfig {
    fn default() -> Self {
        Self {
            rounds: 4,
            iterations: 10,
            chi2_threshold: CHI2_MONO,
            huber_delta: huber_delta(),
        }
    }
}

/// A 3D-2D correspondence for pose optimization.
#[derive(Debug, Clone)]
pub struct PoseObservation {
    /// Map point position in world frame (fixed).
    pub point_world: Vector3<f64>,
    /// Observed undistorted pixel.
    pub uv: Vector2<f64>,
    /// Inverse variance of the detection level.
    pub inv_sigma2: f64,
}

/// Result of pose-only optimization.
#[derive(Debug, Clone)]
pub struct PoseOptimizationResult {
    pub pose_cw: SE3,
    /// `true` for observations classified as outliers in the last round.
    pub outliers: Vec<bool>,
    pub num_inliers: usize,
}

/// Optimize `initial_pose_cw` against `observations`.
///
/// Returns `None` when there are too few observations to constrain a pose or
/// when the normal equations are singular on the first iteration.
pub fn optimize_pose(
    initial_pose_cw: &SE3,
    observations: &[PoseObservation],
    camera: &CameraModel,
    config: &PoseOptimizationConfig,
) -> Option<PoseOptimizationResult> {
    if observations.len() < MIN_OBSERVATIONS {
        return None;
    }

    let mut pose = initial_pose_cw.clone();
    let mut outliers = vec![false; observations.len()];
    let mut solved_once = false;

    for round in 0..config.rounds {
        for _ in 0..config.iterations {
            let mut h = Matrix6::<f64>::zeros();
            let mut b = Vector6::<f64>::zeros();
            let mut active = 0usize;

            for (obs, _) in observations.iter().zip(&outliers).filter(|(_, &o)| !o) {
                let p_cam = pose.transform_point(&obs.point_world);
                let Some(err) = reprojection_error(camera, &p_cam, &obs.uv) else {
                    continue;
                };
                let w = huber_weight(chi2(&err, obs.inv_sigma2).sqrt(), config.huber_delta) * obs.inv_sigma2;
                let j = jacobian_pose(camera, &p_cam);
                h += w * j.transpose() * j;
                b += w * j.transpose() * err;
                active += 1;
            }

            if active < MIN_OBSERVATIONS {
                break;
            }

            let Some(delta) = h.cholesky().map(|c| c.solve(&(-b))) else {
                if !solved_once {
                    return None;
                }
                break;
            };
            if !delta.iter().all(|v| v.is_finite()) {
                break;
            }
            solved_once = true;
            pose = pose.retract_left(&delta);
            if delta.norm() < 1e-10 {
                break;
            }
        }

        let mut num_inliers = 0;
        for (obs, outlier) in observations.iter().zip(outliers.iter_mut()) {
            let p_cam = pose.transform_point(&obs.point_world);
            *outlier = match reprojection_error(camera, &p_cam, &obs.uv) {
                Some(err) => chi2(&err, obs.inv_sigma2) > config.chi2_threshold,
                None => true,
            };
            if !*outlier {
                num_inliers += 1;
            }
        }

        if num_inliers < MIN_INLIERS_TO_CONTINUE {
            debug!("[PoseOpt] round {}: only {} inliers, stopping", round, num_inliers);
            break;
        }
    }

    let num_inliers = outliers.iter().filter(|&&o| !o).count();
    debug!("[PoseOpt] inliers: {}/{}", num_inliers, observations.len());

    Some(PoseOptimizationResult {
        pose_cw: pose,
        outliers,
        num_inliers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn camera() -> CameraModel {
        CameraModel::pinhole(500.0, 500.0, 320.0, 240.0, 640, 480)
    }

    fn scene(pose: &SE3, n: usize, rng: &mut StdRng) -> Vec<PoseObservation> {
        let cam = camera();
        let mut obs = Vec::new();
        while obs.len() < n {
            let p = Vector3::new(rng.gen_range(-2.0..2.0), rng.gen_range(-1.5..1.5), rng.gen_range(3.0..8.0));
            if let Some(uv) = cam.project(&pose.transform_point(&p)) {
                if cam.is_in_image(&uv) {
                    obs.push(PoseObservation {
                        point_world: p,
                        uv,
                        inv_sigma2: 1.0,
                    });
                }
            }
        }
        obs
    }

    #[test]
    fn test_converges_from_perturbed_pose() {
        let mut rng = StdRng::seed_from_u64(7);
        let truth = SE3 {
            rotation: UnitQuaternion::from_euler_angles(0.02, -0.05, 0.01),
            translation: Vector3::new(0.1, 0.05, -0.2),
        };
        let obs = scene(&truth, 80, &mut rng);
        let start = truth.retract_left(&Vector6::new(0.02, -0.01, 0.015, 0.05, -0.04, 0.03));

        let result = optimize_pose(&start, &obs, &camera(), &PoseOptimizationConfig::default()).unwrap();
        assert_eq!(result.num_inliers, 80);
        assert_relative_eq!(result.pose_cw.translation, truth.translation, epsilon = 1e-6);
        assert!(result.pose_cw.rotation_angle_to(&truth) < 1e-6);
    }

    #[test]
    fn test_flags_gross_outliers() {
        let mut rng = StdRng::seed_from_u64(11);
        let truth = SE3::identity();
        let mut obs = scene(&truth, 60, &mut rng);
        for o in obs.iter_mut().take(6) {
            o.uv += Vector2::new(40.0, -35.0);
        }

        let result = optimize_pose(&truth, &obs, &camera(), &PoseOptimizationConfig::default()).unwrap();
        assert_eq!(result.num_inliers, 54);
        assert!(result.outliers[..6].iter().all(|&o| o));
        assert!(result.outliers[6..].iter().all(|&o| !o));
        assert!(result.pose_cw.translation.norm() < 1e-3);
    }

    #[test]
    fn test_too_few_observations() {
        let obs = vec![
            PoseObservation {
                point_world: Vector3::new(0.0, 0.0, 5.0),
                uv: Vector2::new(320.0, 240.0),
                inv_sigma2: 1.0,
            };
            2
        ];
        assert!(optimize_pose(&SE3::identity(), &obs, &camera(), &PoseOptimizationConfig::default()).is_none());
    }
}
