//! Bundle adjustment over keyframe poses and map point positions.
//!
//! Minimizes the robust reprojection error
//!
//! ```text
//! E = Σ_ij ρ(‖u_ij − π(T_i, X_j)‖²_Σ)
//! ```
//!
//! with Levenberg-Marquardt on the Schur complement: point blocks are 3x3 and
//! eliminated per point, leaving a dense `6K x 6K` system over the `K`
//! optimized poses.
//!
//! The map is never locked while solving. A BA run is split into three phases:
//! [`collect_local_ba_data`] (read lock), [`solve_ba`] (no lock, abortable) and
//! [`apply_ba_results`] + [`cull_ba_outliers`] (write lock). Entities removed
//! in the meantime are skipped on apply.

use std::collections::{HashMap, HashSet};

use nalgebra::{DMatrix, DVector, Matrix3, Matrix6x3, Vector2, Vector3, Vector6};
use tracing::debug;

use crate::atlas::map::{KeyFrameId, Map, MapPointId};
use crate::geometry::{CameraModel, SE3};

use super::reprojection::{
    chi2, huber_cost, huber_delta, huber_weight, jacobian_point, jacobian_pose, reprojection_error, CHI2_MONO,
};
use super::OptimizationError;

/// χ² charged to an observation whose point falls behind the camera.
const BEHIND_CAMERA_CHI2: f64 = 1e4;

const LAMBDA_INIT: f64 = 1e-3;
const LAMBDA_UP: f64 = 10.0;
const LAMBDA_DOWN: f64 = 0.1;
const MIN_LAMBDA: f64 = 1e-10;
const MAX_LAMBDA: f64 = 1e10;

/// Configuration for bundle adjustment.
#[derive(Debug, Clone)]
pub struct LocalBAConfig {
    pub max_iterations: usize,
    /// Covisible keyframes optimized together with the current one.
    pub max_covisible_keyframes: usize,
    pub huber_delta: f64,
    /// Observations above this χ² are removed after BA.
    pub chi2_threshold: f64,
    /// Relative cost decrease below which the solver stops.
    pub cost_tolerance: f64,
}

impl Default for LocalBAConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            max_covisible_keyframes: 20,
            huber_delta: huber_delta(),
            chi2_threshold: CHI2_MONO,
            cost_tolerance: 1e-6,
        }
    }
}

/// One keyframe observation of a map point.
#[derive(Debug, Clone)]
pub struct BAObservation {
    pub kf_id: KeyFrameId,
    pub mp_id: MapPointId,
    pub feature_idx: usize,
    pub observed_uv: Vector2<f64>,
    pub inv_sigma2: f64,
}

/// Snapshot of everything a BA run needs, extracted under a read lock.
#[derive(Debug, Clone, Default)]
pub struct BAProblemData {
    /// Keyframes whose poses are optimized.
    pub optimized_kf_ids: Vec<KeyFrameId>,
    /// Keyframes that observe optimized points but keep their poses.
    pub fixed_kf_ids: Vec<KeyFrameId>,
    /// `T_cw` of every optimized and fixed keyframe.
    pub poses_cw: HashMap<KeyFrameId, SE3>,
    pub mp_ids: Vec<MapPointId>,
    pub mp_positions: HashMap<MapPointId, Vector3<f64>>,
    pub observations: Vec<BAObservation>,
}

/// Optimized values produced by [`solve_ba`].
#[derive(Debug, Clone)]
pub struct BAResultData {
    pub optimized_poses_cw: HashMap<KeyFrameId, SE3>,
    pub optimized_points: HashMap<MapPointId, Vector3<f64>>,
    pub iterations: usize,
    pub initial_cost: f64,
    pub final_cost: f64,
}

/// PHASE 1: COLLECT for local BA around `current_kf_id`.
///
/// Optimizes the current keyframe and its best covisibles. Every other
/// keyframe observing their points is fixed, and so is the first keyframe of
/// the map to anchor the gauge.
pub fn collect_local_ba_data(map: &Map, current_kf_id: KeyFrameId, config: &LocalBAConfig) -> Option<BAProblemData> {
    let current = map.get_keyframe(current_kf_id).filter(|kf| !kf.is_bad)?;

    let mut local_kf_ids = vec![current_kf_id];
    for neighbor in current.get_best_covisibles(config.max_covisible_keyframes) {
        if map.get_keyframe(neighbor).map_or(false, |kf| !kf.is_bad) {
            local_kf_ids.push(neighbor);
        }
    }

    let mut mp_ids: Vec<MapPointId> = map.get_map_points_from_keyframes(&local_kf_ids).into_iter().collect();
    mp_ids.sort_unstable();
    if mp_ids.is_empty() {
        return None;
    }

    let initial = map.initial_keyframe_id();
    let local_set: HashSet<KeyFrameId> = local_kf_ids.iter().copied().collect();
    let mut fixed: HashSet<KeyFrameId> = HashSet::new();
    for mp_id in &mp_ids {
        if let Some(mp) = map.get_map_point(*mp_id) {
            for kf_id in mp.observations.keys() {
                if !local_set.contains(kf_id) && map.get_keyframe(*kf_id).map_or(false, |kf| !kf.is_bad) {
                    fixed.insert(*kf_id);
                }
            }
        }
    }
    let optimized_kf_ids: Vec<KeyFrameId> = local_kf_ids
        .iter()
        .copied()
        .filter(|id| Some(*id) != initial)
        .collect();
    if optimized_kf_ids.is_empty() {
        return None;
    }
    if let Some(id) = initial.filter(|id| local_set.contains(id)) {
        fixed.insert(id);
    }
    let mut fixed_kf_ids: Vec<KeyFrameId> = fixed.into_iter().collect();
    fixed_kf_ids.sort_unstable();

    build_problem(map, optimized_kf_ids, fixed_kf_ids, mp_ids)
}

/// Gather poses, positions and observations for the given variable sets.
pub(crate) fn build_problem(
    map: &Map,
    optimized_kf_ids: Vec<KeyFrameId>,
    fixed_kf_ids: Vec<KeyFrameId>,
    mp_ids: Vec<MapPointId>,
) -> Option<BAProblemData> {
    let pyramid = map.pyramid();
    let mut poses_cw = HashMap::new();
    for kf_id in optimized_kf_ids.iter().chain(&fixed_kf_ids) {
        if let Some(kf) = map.get_keyframe(*kf_id) {
            poses_cw.insert(*kf_id, kf.pose_cw());
        }
    }

    let mut mp_positions = HashMap::new();
    let mut observations = Vec::new();
    for &mp_id in &mp_ids {
        let Some(mp) = map.get_map_point(mp_id) else {
            continue;
        };
        mp_positions.insert(mp_id, mp.position);
        let mut obs: Vec<(KeyFrameId, usize)> = mp.observations.iter().map(|(&k, &i)| (k, i)).collect();
        obs.sort_unstable();
        for (kf_id, feature_idx) in obs {
            if !poses_cw.contains_key(&kf_id) {
                continue;
            }
            let Some(kp) = map.get_keyframe(kf_id).and_then(|kf| kf.keypoints.get(feature_idx)) else {
                continue;
            };
            observations.push(BAObservation {
                kf_id,
                mp_id,
                feature_idx,
                observed_uv: kp.pt(),
                inv_sigma2: pyramid.inv_sigma2(kp.octave),
            });
        }
    }

    if observations.is_empty() {
        return None;
    }

    Some(BAProblemData {
        optimized_kf_ids,
        fixed_kf_ids,
        poses_cw,
        mp_ids,
        mp_positions,
        observations,
    })
}

/// Observation with solver indices. Poses `0..K` are optimized.
struct IndexedObservation {
    pose: usize,
    point: usize,
    uv: Vector2<f64>,
    inv_sigma2: f64,
}

/// Normal equations of one LM iteration, before damping.
struct NormalEquations {
    h_pp: DMatrix<f64>,
    b_p: DVector<f64>,
    h_ll: Vec<Matrix3<f64>>,
    b_l: Vec<Vector3<f64>>,
    /// Pose-point coupling blocks, keyed by (pose, point).
    h_pl: HashMap<(usize, usize), Matrix6x3<f64>>,
    /// Optimized poses observing each point.
    point_poses: Vec<Vec<usize>>,
}

fn total_cost(
    obs: &[IndexedObservation],
    poses: &[SE3],
    points: &[Vector3<f64>],
    camera: &CameraModel,
    delta: f64,
) -> f64 {
    obs.iter()
        .map(|o| {
            let p_cam = poses[o.pose].transform_point(&points[o.point]);
            match reprojection_error(camera, &p_cam, &o.uv) {
                Some(e) => huber_cost(chi2(&e, o.inv_sigma2), delta),
                None => huber_cost(BEHIND_CAMERA_CHI2, delta),
            }
        })
        .sum()
}

fn build_normal_equations(
    obs: &[IndexedObservation],
    poses: &[SE3],
    points: &[Vector3<f64>],
    num_optimized: usize,
    camera: &CameraModel,
    delta: f64,
) -> NormalEquations {
    let mut eq = NormalEquations {
        h_pp: DMatrix::zeros(6 * num_optimized, 6 * num_optimized),
        b_p: DVector::zeros(6 * num_optimized),
        h_ll: vec![Matrix3::zeros(); points.len()],
        b_l: vec![Vector3::zeros(); points.len()],
        h_pl: HashMap::new(),
        point_poses: vec![Vec::new(); points.len()],
    };

    for o in obs {
        let pose = &poses[o.pose];
        let p_cam = pose.transform_point(&points[o.point]);
        let Some(err) = reprojection_error(camera, &p_cam, &o.uv) else {
            continue;
        };
        let w = huber_weight(chi2(&err, o.inv_sigma2).sqrt(), delta) * o.inv_sigma2;

        let j_l = jacobian_point(camera, &p_cam, &pose.rotation_matrix());
        eq.h_ll[o.point] += w * j_l.transpose() * j_l;
        eq.b_l[o.point] += w * j_l.transpose() * err;

        if o.pose < num_optimized {
            let j_p = jacobian_pose(camera, &p_cam);
            let base = 6 * o.pose;
            let block = w * j_p.transpose() * j_p;
            let mut h = eq.h_pp.fixed_view_mut::<6, 6>(base, base);
            h += block;
            let mut b = eq.b_p.fixed_rows_mut::<6>(base);
            b += w * j_p.transpose() * err;
            *eq.h_pl.entry((o.pose, o.point)).or_insert_with(Matrix6x3::zeros) += w * j_p.transpose() * j_l;
            eq.point_poses[o.point].push(o.pose);
        }
    }
    eq
}

/// Solve the damped system by eliminating points. Returns `(δ poses, δ points)`.
fn solve_damped(eq: &NormalEquations, lambda: f64, num_optimized: usize) -> Option<(DVector<f64>, Vec<Vector3<f64>>)> {
    let n = 6 * num_optimized;
    let mut s = eq.h_pp.clone();
    for i in 0..n {
        s[(i, i)] += lambda * s[(i, i)].max(1e-6);
    }
    let mut rhs = -eq.b_p.clone();

    let mut h_ll_inv = Vec::with_capacity(eq.h_ll.len());
    for h in &eq.h_ll {
        let mut damped = *h;
        for i in 0..3 {
            damped[(i, i)] += lambda * damped[(i, i)].max(1e-6);
        }
        h_ll_inv.push(damped.try_inverse());
    }

    for (j, poses) in eq.point_poses.iter().enumerate() {
        let Some(inv) = h_ll_inv[j] else {
            continue;
        };
        for &a in poses {
            let w_a = eq.h_pl[&(a, j)] * inv;
            let mut r = rhs.fixed_rows_mut::<6>(6 * a);
            r += w_a * eq.b_l[j];
            for &b in poses {
                let mut block = s.fixed_view_mut::<6, 6>(6 * a, 6 * b);
                block -= w_a * eq.h_pl[&(b, j)].transpose();
            }
        }
    }

    let delta_p = if n == 0 {
        DVector::zeros(0)
    } else {
        match s.clone().cholesky() {
            Some(c) => c.solve(&rhs),
            None => s.lu().solve(&rhs)?,
        }
    };
    if !delta_p.iter().all(|v| v.is_finite()) {
        return None;
    }

    let mut delta_l = Vec::with_capacity(eq.h_ll.len());
    for (j, poses) in eq.point_poses.iter().enumerate() {
        let Some(inv) = h_ll_inv[j] else {
            delta_l.push(Vector3::zeros());
            continue;
        };
        let mut r = -eq.b_l[j];
        for &a in poses {
            let dp: Vector6<f64> = delta_p.fixed_rows::<6>(6 * a).into_owned();
            r -= eq.h_pl[&(a, j)].transpose() * dp;
        }
        delta_l.push(inv * r);
    }
    Some((delta_p, delta_l))
}

/// PHASE 2: SOLVE without any lock on the map.
///
/// `should_stop` is polled before every iteration. An aborted run still
/// returns the improvement reached so far.
pub fn solve_ba(
    problem: &BAProblemData,
    camera: &CameraModel,
    config: &LocalBAConfig,
    should_stop: &dyn Fn() -> bool,
) -> Result<BAResultData, OptimizationError> {
    let num_optimized = problem.optimized_kf_ids.len();
    let pose_ids: Vec<KeyFrameId> = problem
        .optimized_kf_ids
        .iter()
        .chain(&problem.fixed_kf_ids)
        .copied()
        .collect();
    let pose_index: HashMap<KeyFrameId, usize> = pose_ids.iter().enumerate().map(|(i, &id)| (id, i)).collect();
    let point_index: HashMap<MapPointId, usize> = problem.mp_ids.iter().enumerate().map(|(i, &id)| (id, i)).collect();

    let mut poses: Vec<SE3> = Vec::with_capacity(pose_ids.len());
    for id in &pose_ids {
        poses.push(problem.poses_cw.get(id).cloned().ok_or(OptimizationError::Empty)?);
    }
    let mut points: Vec<Vector3<f64>> = Vec::with_capacity(problem.mp_ids.len());
    for id in &problem.mp_ids {
        points.push(*problem.mp_positions.get(id).ok_or(OptimizationError::Empty)?);
    }

    let obs: Vec<IndexedObservation> = problem
        .observations
        .iter()
        .filter_map(|o| {
            Some(IndexedObservation {
                pose: *pose_index.get(&o.kf_id)?,
                point: *point_index.get(&o.mp_id)?,
                uv: o.observed_uv,
                inv_sigma2: o.inv_sigma2,
            })
        })
        .collect();
    if obs.is_empty() || points.is_empty() {
        return Err(OptimizationError::Empty);
    }

    let delta = config.huber_delta;
    let initial_cost = total_cost(&obs, &poses, &points, camera, delta);
    if !initial_cost.is_finite() {
        return Err(OptimizationError::NonFinite);
    }

    let mut cost = initial_cost;
    let mut lambda = LAMBDA_INIT;
    let mut iterations = 0;
    let mut accepted = 0;
    let mut solve_failures = 0;

    for iter in 0..config.max_iterations {
        if should_stop() {
            debug!("[LocalBA] aborted after {} iterations", iterations);
            if iterations == 0 {
                return Err(OptimizationError::Aborted);
            }
            break;
        }
        iterations = iter + 1;

        let eq = build_normal_equations(&obs, &poses, &points, num_optimized, camera, delta);
        let Some((delta_p, delta_l)) = solve_damped(&eq, lambda, num_optimized) else {
            solve_failures += 1;
            lambda = (lambda * LAMBDA_UP).min(MAX_LAMBDA);
            continue;
        };

        let trial_poses: Vec<SE3> = poses
            .iter()
            .enumerate()
            .map(|(i, p)| {
                if i < num_optimized {
                    let d: Vector6<f64> = delta_p.fixed_rows::<6>(6 * i).into_owned();
                    p.retract_left(&d)
                } else {
                    p.clone()
                }
            })
            .collect();
        let trial_points: Vec<Vector3<f64>> = points.iter().zip(&delta_l).map(|(p, d)| p + d).collect();
        let trial_cost = total_cost(&obs, &trial_poses, &trial_points, camera, delta);

        if trial_cost.is_finite() && trial_cost < cost {
            let relative = (cost - trial_cost) / cost.max(f64::MIN_POSITIVE);
            poses = trial_poses;
            points = trial_points;
            cost = trial_cost;
            accepted += 1;
            lambda = (lambda * LAMBDA_DOWN).max(MIN_LAMBDA);
            if relative < config.cost_tolerance {
                break;
            }
        } else {
            lambda = (lambda * LAMBDA_UP).min(MAX_LAMBDA);
        }
    }

    if accepted == 0 {
        if solve_failures > 0 && solve_failures == iterations {
            return Err(OptimizationError::Singular);
        }
        // Nothing left to improve on an already consistent problem.
        if initial_cost > 1e-9 * obs.len() as f64 {
            return Err(OptimizationError::NotConverged {
                initial: initial_cost,
                final_cost: cost,
            });
        }
    }

    debug!(
        "[LocalBA] {} iterations, cost {:.4} -> {:.4} ({} poses, {} points)",
        iterations,
        initial_cost,
        cost,
        num_optimized,
        points.len()
    );

    Ok(BAResultData {
        optimized_poses_cw: pose_ids.iter().take(num_optimized).copied().zip(poses).collect(),
        optimized_points: problem.mp_ids.iter().copied().zip(points).collect(),
        iterations,
        initial_cost,
        final_cost: cost,
    })
}

/// PHASE 3: APPLY optimized values. Call under the write lock.
///
/// Returns the number of keyframes and map points updated.
pub fn apply_ba_results(map: &mut Map, results: &BAResultData) -> usize {
    let mut updated = 0;
    for (kf_id, pose_cw) in &results.optimized_poses_cw {
        if let Some(kf) = map.get_keyframe_mut(*kf_id) {
            if !kf.is_bad {
                kf.set_pose_cw(pose_cw);
                updated += 1;
            }
        }
    }
    for (mp_id, pos) in &results.optimized_points {
        if let Some(mp) = map.get_map_point_mut(*mp_id) {
            if !mp.is_bad {
                mp.position = *pos;
                updated += 1;
            }
        }
    }
    let mut touched: Vec<MapPointId> = results.optimized_points.keys().copied().collect();
    touched.sort_unstable();
    for mp_id in touched {
        map.update_map_point_normal_and_depth(mp_id);
    }
    updated
}

/// Disassociate the observations of `problem` that are still in the map but
/// now exceed `chi2_threshold` or lie behind the camera. Map points left with
/// fewer than two observers are removed.
///
/// Returns the number of removed observations.
pub fn cull_ba_outliers(map: &mut Map, problem: &BAProblemData, camera: &CameraModel, chi2_threshold: f64) -> usize {
    let mut outliers = Vec::new();
    for o in &problem.observations {
        let (Some(kf), Some(mp)) = (map.get_keyframe(o.kf_id), map.get_map_point(o.mp_id)) else {
            continue;
        };
        if kf.get_map_point(o.feature_idx) != Some(o.mp_id) {
            continue;
        }
        let p_cam = kf.pose_cw().transform_point(&mp.position);
        let is_outlier = match reprojection_error(camera, &p_cam, &o.observed_uv) {
            Some(e) => chi2(&e, o.inv_sigma2) > chi2_threshold,
            None => true,
        };
        if is_outlier {
            outliers.push((o.kf_id, o.feature_idx, o.mp_id));
        }
    }

    let mut touched = HashSet::new();
    for &(kf_id, feature_idx, mp_id) in &outliers {
        map.disassociate(kf_id, feature_idx);
        touched.insert(mp_id);
    }
    let mut touched: Vec<MapPointId> = touched.into_iter().collect();
    touched.sort_unstable();
    for mp_id in touched {
        match map.get_map_point(mp_id).map(|mp| mp.num_observations()) {
            Some(n) if n < 2 => map.remove_map_point_full(mp_id),
            Some(_) => map.update_map_point_normal_and_depth(mp_id),
            None => {}
        }
    }
    outliers.len()
}
