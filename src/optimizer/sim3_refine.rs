//! Refinement of the similarity between two keyframes from matched map points.
//!
//! Each correspondence contributes two reprojection errors: the point of the
//! second keyframe mapped by `S12` into the first camera, and the point of the
//! first keyframe mapped by `S21 = S12⁻¹` into the second camera. Solved with
//! Levenberg-Marquardt in two passes: the correspondences whose χ² exceeds the
//! threshold after the first pass are left out of the second.

use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt};
use nalgebra::{DMatrix, DVector, Dyn, Owned, Vector2, Vector3};
use tracing::debug;

use crate::geometry::{CameraModel, Sim3};

use super::reprojection::reprojection_error;

/// Residual charged to a point that lands behind a camera, in pixels.
const BEHIND_CAMERA_RESIDUAL: f64 = 100.0;

#[derive(Debug, Clone)]
pub struct Sim3RefineConfig {
    /// χ² (2 DOF, per direction) above which a correspondence is an outlier.
    pub chi2_threshold: f64,
    /// LM evaluation budget, as a multiple of the parameter count.
    pub patience: usize,
}

impl Default for Sim3RefineConfig {
    fn default() -> Self {
        Self {
            chi2_threshold: 10.0,
            patience: 20,
        }
    }
}

/// A map point matched between keyframe 1 and keyframe 2.
#[derive(Debug, Clone)]
pub struct Sim3Correspondence {
    /// Point of keyframe 1, in camera 1 coordinates.
    pub p1_cam: Vector3<f64>,
    /// Point of keyframe 2, in camera 2 coordinates.
    pub p2_cam: Vector3<f64>,
    /// Keypoint of the point in keyframe 1.
    pub uv1: Vector2<f64>,
    /// Keypoint of the point in keyframe 2.
    pub uv2: Vector2<f64>,
    pub inv_sigma2_1: f64,
    pub inv_sigma2_2: f64,
}

#[derive(Debug, Clone)]
pub struct Sim3RefineResult {
    pub s12: Sim3,
    pub inliers: Vec<bool>,
    pub num_inliers: usize,
}

struct Sim3Lsq<'a> {
    camera: &'a CameraModel,
    correspondences: Vec<&'a Sim3Correspondence>,
    params: DVector<f64>,
}

fn sim3_from_params(params: &DVector<f64>) -> Sim3 {
    let mut tangent = [0.0; 7];
    tangent.copy_from_slice(params.as_slice());
    Sim3::exp(&tangent)
}

/// The two weighted errors of a correspondence under `s12`.
fn errors(camera: &CameraModel, s12: &Sim3, s21: &Sim3, c: &Sim3Correspondence) -> [Option<Vector2<f64>>; 2] {
    [
        reprojection_error(camera, &s12.transform_point(&c.p2_cam), &c.uv1).map(|e| e * c.inv_sigma2_1.sqrt()),
        reprojection_error(camera, &s21.transform_point(&c.p1_cam), &c.uv2).map(|e| e * c.inv_sigma2_2.sqrt()),
    ]
}

impl Sim3Lsq<'_> {
    fn residuals_at(&self, params: &DVector<f64>) -> DVector<f64> {
        let s12 = sim3_from_params(params);
        let s21 = s12.inverse();
        let mut r = DVector::zeros(4 * self.correspondences.len());
        for (k, c) in self.correspondences.iter().enumerate() {
            for (side, e) in errors(self.camera, &s12, &s21, c).into_iter().enumerate() {
                let e = e.unwrap_or_else(|| Vector2::repeat(BEHIND_CAMERA_RESIDUAL));
                r[4 * k + 2 * side] = e.x;
                r[4 * k + 2 * side + 1] = e.y;
            }
        }
        r
    }
}

impl LeastSquaresProblem<f64, Dyn, Dyn> for Sim3Lsq<'_> {
    type JacobianStorage = Owned<f64, Dyn, Dyn>;
    type ParameterStorage = Owned<f64, Dyn>;
    type ResidualStorage = Owned<f64, Dyn>;

    fn set_params(&mut self, params: &DVector<f64>) {
        self.params.copy_from(params);
    }

    fn params(&self) -> DVector<f64> {
        self.params.clone()
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        Some(self.residuals_at(&self.params))
    }

    fn jacobian(&self) -> Option<DMatrix<f64>> {
        const EPS: f64 = 1e-7;
        let mut jac = DMatrix::zeros(4 * self.correspondences.len(), 7);
        for p in 0..7 {
            let mut plus = self.params.clone();
            let mut minus = self.params.clone();
            plus[p] += EPS;
            minus[p] -= EPS;
            let column = (self.residuals_at(&plus) - self.residuals_at(&minus)) / (2.0 * EPS);
            jac.set_column(p, &column);
        }
        Some(jac)
    }
}

fn run_lm(
    camera: &CameraModel,
    correspondences: &[Sim3Correspondence],
    active: &[bool],
    start: &Sim3,
    patience: usize,
) -> Sim3 {
    let selected: Vec<&Sim3Correspondence> = correspondences
        .iter()
        .zip(active)
        .filter(|(_, &a)| a)
        .map(|(c, _)| c)
        .collect();
    let problem = Sim3Lsq {
        camera,
        correspondences: selected,
        params: DVector::from_row_slice(&start.log()),
    };
    let (problem, report) = LevenbergMarquardt::new().with_patience(patience).minimize(problem);
    debug!("[Sim3Refine] {:?} after {} evaluations", report.termination, report.number_of_evaluations);
    let refined = sim3_from_params(&problem.params);
    if refined.scale.is_finite() && refined.translation.iter().all(|v| v.is_finite()) {
        refined
    } else {
        start.clone()
    }
}

fn classify(camera: &CameraModel, s12: &Sim3, correspondences: &[Sim3Correspondence], threshold: f64) -> Vec<bool> {
    let s21 = s12.inverse();
    correspondences
        .iter()
        .map(|c| {
            errors(camera, s12, &s21, c)
                .iter()
                .all(|e| e.map_or(false, |e| e.norm_squared() <= threshold))
        })
        .collect()
}

/// Refine `initial_s12` (maps camera 2 coordinates into camera 1).
///
/// Returns `None` when fewer than three correspondences are given.
pub fn refine_sim3(
    initial_s12: &Sim3,
    correspondences: &[Sim3Correspondence],
    camera: &CameraModel,
    config: &Sim3RefineConfig,
) -> Option<Sim3RefineResult> {
    if correspondences.len() < 3 {
        return None;
    }

    let all = vec![true; correspondences.len()];
    let first = run_lm(camera, correspondences, &all, initial_s12, config.patience);
    let inliers = classify(camera, &first, correspondences, config.chi2_threshold);
    let num_first = inliers.iter().filter(|&&i| i).count();

    let s12 = if num_first >= 3 && num_first < correspondences.len() {
        run_lm(camera, correspondences, &inliers, &first, config.patience)
    } else {
        first
    };
    let inliers = classify(camera, &s12, correspondences, config.chi2_threshold);
    let num_inliers = inliers.iter().filter(|&&i| i).count();

    debug!("[Sim3Refine] inliers: {}/{}, scale {:.4}", num_inliers, correspondences.len(), s12.scale);

    Some(Sim3RefineResult {
        s12,
        inliers,
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

    fn correspondences(s12: &Sim3, n: usize, seed: u64) -> Vec<Sim3Correspondence> {
        let cam = camera();
        let mut rng = StdRng::seed_from_u64(seed);
        let s21 = s12.inverse();
        let mut out = Vec::new();
        while out.len() < n {
            let p1 = Vector3::new(rng.gen_range(-1.0..1.0), rng.gen_range(-0.8..0.8), rng.gen_range(3.0..6.0));
            let p2 = s21.transform_point(&p1);
            let (Some(uv1), Some(uv2)) = (cam.project(&p1), cam.project(&p2)) else {
                continue;
            };
            out.push(Sim3Correspondence {
                p1_cam: p1,
                p2_cam: p2,
                uv1,
                uv2,
                inv_sigma2_1: 1.0,
                inv_sigma2_2: 1.0,
            });
        }
        out
    }

    fn truth() -> Sim3 {
        Sim3 {
            rotation: UnitQuaternion::from_euler_angles(0.02, 0.05, -0.01),
            translation: Vector3::new(0.2, -0.1, 0.05),
            scale: 1.3,
        }
    }

    #[test]
    fn test_recovers_scale_from_perturbed_start() {
        let truth = truth();
        let corr = correspondences(&truth, 40, 1);
        let start = Sim3 {
            rotation: truth.rotation * UnitQuaternion::from_euler_angles(0.01, -0.01, 0.0),
            translation: truth.translation + Vector3::new(0.03, 0.02, -0.02),
            scale: 1.2,
        };
        let result = refine_sim3(&start, &corr, &camera(), &Sim3RefineConfig::default()).unwrap();
        assert_eq!(result.num_inliers, 40);
        assert_relative_eq!(result.s12.scale, truth.scale, epsilon = 1e-4);
        assert_relative_eq!(result.s12.translation, truth.translation, epsilon = 1e-4);
    }

    #[test]
    fn test_rejects_corrupted_correspondences() {
        let truth = truth();
        let mut corr = correspondences(&truth, 40, 2);
        corr[0].uv1 += Vector2::new(60.0, 0.0);
        corr[1].uv2 += Vector2::new(0.0, -50.0);
        let result = refine_sim3(&truth, &corr, &camera(), &Sim3RefineConfig::default()).unwrap();
        assert!(!result.inliers[0]);
        assert!(!result.inliers[1]);
        assert_eq!(result.num_inliers, 38);
        assert_relative_eq!(result.s12.scale, truth.scale, epsilon = 1e-3);
    }

    #[test]
    fn test_needs_three_correspondences() {
        let corr = correspondences(&truth(), 2, 3);
        assert!(refine_sim3(&truth(), &corr, &camera(), &Sim3RefineConfig::default()).is_none());
    }
}
