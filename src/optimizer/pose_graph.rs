//! Pose Graph Optimization for Loop Closing.
//!
//! Optimizes the Essential Graph (spanning tree + loop edges + strong
//! covisibility) with SE3 relative-pose constraints. Scale is not a variable:
//! the Sim3 loop correction has already been folded into the keyframe poses
//! around the loop before this runs.
//!
//! This module uses the three-phase pattern:
//! 1. COLLECT: Extract poses and edges from the map
//! 2. SOLVE: Run LM optimization without locks
//! 3. APPLY: Write back optimized poses and move map points along

use std::collections::{HashMap, HashSet};

use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt, TerminationReason};
use nalgebra::{DMatrix, DVector, Dyn, Owned, UnitQuaternion, Vector3, Vector6};
use tracing::debug;

use crate::atlas::map::{KeyFrameId, Map};
use crate::geometry::SE3;

use super::OptimizationError;

/// Configuration for pose graph optimization.
#[derive(Debug, Clone)]
pub struct PoseGraphConfig {
    /// Budget of LM evaluations, as a multiple of the parameter count.
    pub max_iterations: usize,

    /// Minimum covisibility weight to include as edge.
    pub min_covisibility_weight: usize,

    /// Information of the edge between the loop keyframe pair.
    pub loop_information: f64,
}

impl Default for PoseGraphConfig {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            min_covisibility_weight: 100,
            loop_information: 100.0,
        }
    }
}

/// A pose graph edge (constraint between two keyframes).
#[derive(Debug, Clone)]
pub struct PoseGraphEdge {
    pub kf_id_i: KeyFrameId,
    pub kf_id_j: KeyFrameId,

    /// Relative pose `T_wc_i⁻¹ · T_wc_j`.
    pub measurement: SE3,

    /// Information weight (inverse covariance).
    pub information: f64,

    pub edge_type: EdgeType,
}

/// Type of pose graph edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeType {
    SpanningTree,
    /// Loop edge, either recorded earlier or created by the current closure.
    LoopClosure,
    Covisibility,
}

/// Data extracted for pose graph optimization.
#[derive(Debug, Clone)]
pub struct PoseGraphProblemData {
    /// Keyframe IDs in optimization order.
    pub kf_ids: Vec<KeyFrameId>,

    /// `T_wc` of every keyframe at collect time.
    pub initial_poses: HashMap<KeyFrameId, SE3>,

    pub edges: Vec<PoseGraphEdge>,

    /// ID of fixed keyframe (anchor).
    pub fixed_kf_id: KeyFrameId,
}

/// Result of pose graph optimization.
#[derive(Debug, Clone)]
pub struct PoseGraphResult {
    /// Optimized `T_wc` poses.
    pub optimized_poses: HashMap<KeyFrameId, SE3>,

    /// Residual evaluations used by the solver.
    pub evaluations: usize,

    pub initial_error: f64,
    pub final_error: f64,
}

/// Relative pose `pose_i⁻¹ · pose_j` of two `T_wc` poses.
fn relative_pose(pose_i: &SE3, pose_j: &SE3) -> SE3 {
    pose_i.inverse().compose(pose_j)
}

/// PHASE 1: Collect pose graph data from the map.
///
/// Call after the loop correction has written corrected poses for the
/// keyframes around the current one. `non_corrected` holds their `T_wc`
/// from before the correction: old edges are measured with those, so they
/// keep describing the odometry. `loop_connections` are the links the loop
/// fusion created between the two sides; they are measured with the
/// corrected poses and carry the loop constraint.
pub fn collect_pose_graph_data(
    map: &Map,
    loop_kf_id: KeyFrameId,
    current_kf_id: KeyFrameId,
    non_corrected: &HashMap<KeyFrameId, SE3>,
    loop_connections: &HashMap<KeyFrameId, Vec<KeyFrameId>>,
    config: &PoseGraphConfig,
) -> Option<PoseGraphProblemData> {
    let fixed_kf_id = map.initial_keyframe_id()?;
    let mut kf_ids: Vec<KeyFrameId> = map.keyframes().filter(|kf| !kf.is_bad).map(|kf| kf.id).collect();
    kf_ids.sort_unstable();
    if kf_ids.len() < 2 {
        return None;
    }

    let initial_poses: HashMap<KeyFrameId, SE3> = kf_ids
        .iter()
        .filter_map(|id| map.get_keyframe(*id).map(|kf| (*id, kf.pose.clone())))
        .collect();
    let odometry_pose = |id: KeyFrameId| non_corrected.get(&id).or_else(|| initial_poses.get(&id));
    // Both ends corrected together: their corrected poses agree with each
    // other at the corrected scale.
    let odometry = |i: KeyFrameId, j: KeyFrameId| -> Option<SE3> {
        if non_corrected.contains_key(&i) && non_corrected.contains_key(&j) {
            Some(relative_pose(initial_poses.get(&i)?, initial_poses.get(&j)?))
        } else {
            Some(relative_pose(odometry_pose(i)?, odometry_pose(j)?))
        }
    };

    let mut edges = Vec::new();
    let mut inserted: HashSet<(KeyFrameId, KeyFrameId)> = HashSet::new();
    let mut push_edge = |i: KeyFrameId, j: KeyFrameId, measurement: SE3, information: f64, edge_type: EdgeType| {
        let key = if i < j { (i, j) } else { (j, i) };
        if i != j && inserted.insert(key) {
            edges.push(PoseGraphEdge {
                kf_id_i: i,
                kf_id_j: j,
                measurement,
                information,
                edge_type,
            });
        }
    };

    // The new loop links come first so that they are not shadowed by older
    // edges between the same pair.
    let mut sources: Vec<&KeyFrameId> = loop_connections.keys().collect();
    sources.sort_unstable();
    for &i in sources {
        let Some(pose_i) = initial_poses.get(&i) else {
            continue;
        };
        for &j in &loop_connections[&i] {
            let Some(pose_j) = initial_poses.get(&j) else {
                continue;
            };
            let is_main = (i == current_kf_id && j == loop_kf_id) || (i == loop_kf_id && j == current_kf_id);
            let information = if is_main { config.loop_information } else { 1.0 };
            push_edge(i, j, relative_pose(pose_i, pose_j), information, EdgeType::LoopClosure);
        }
    }
    if let (Some(pose_c), Some(pose_l)) = (initial_poses.get(&current_kf_id), initial_poses.get(&loop_kf_id)) {
        push_edge(
            current_kf_id,
            loop_kf_id,
            relative_pose(pose_c, pose_l),
            config.loop_information,
            EdgeType::LoopClosure,
        );
    }

    for &kf_id in &kf_ids {
        let Some(kf) = map.get_keyframe(kf_id) else {
            continue;
        };

        if let Some(parent_id) = kf.parent_id {
            if let Some(measurement) = odometry(parent_id, kf_id) {
                push_edge(parent_id, kf_id, measurement, 1.0, EdgeType::SpanningTree);
            }
        }

        let mut loops: Vec<KeyFrameId> = kf.loop_edges.iter().copied().filter(|id| *id < kf_id).collect();
        loops.sort_unstable();
        for other in loops {
            if let Some(measurement) = odometry(other, kf_id) {
                push_edge(other, kf_id, measurement, 1.0, EdgeType::LoopClosure);
            }
        }

        for other in kf.get_covisibles_above_weight(config.min_covisibility_weight) {
            if other >= kf_id || Some(other) == kf.parent_id || kf.children_ids.contains(&other) {
                continue;
            }
            if let Some(measurement) = odometry(other, kf_id) {
                let weight = kf.get_covisibility_weight(other);
                push_edge(other, kf_id, measurement, weight as f64 / 100.0, EdgeType::Covisibility);
            }
        }
    }

    debug!("[PoseGraph] {} keyframes, {} edges", kf_ids.len(), edges.len());

    Some(PoseGraphProblemData {
        kf_ids,
        initial_poses,
        edges,
        fixed_kf_id,
    })
}

/// Edge with parameter block indices; `None` is the fixed pose.
struct IndexedEdge {
    i: Option<usize>,
    j: Option<usize>,
    measurement_inv: SE3,
    sqrt_information: f64,
}

/// Absolute `T_wc` poses as `[rotation vector, translation]` blocks.
struct PoseGraphLsq<'a> {
    edges: Vec<IndexedEdge>,
    fixed_pose: SE3,
    params: DVector<f64>,
    should_stop: &'a dyn Fn() -> bool,
}

fn pose_from_block(params: &DVector<f64>, block: usize) -> SE3 {
    let o = 6 * block;
    SE3 {
        rotation: UnitQuaternion::from_scaled_axis(Vector3::new(params[o], params[o + 1], params[o + 2])),
        translation: Vector3::new(params[o + 3], params[o + 4], params[o + 5]),
    }
}

impl PoseGraphLsq<'_> {
    fn pose(&self, params: &DVector<f64>, block: Option<usize>) -> SE3 {
        match block {
            Some(b) => pose_from_block(params, b),
            None => self.fixed_pose.clone(),
        }
    }

    fn edge_error(&self, edge: &IndexedEdge, pose_i: &SE3, pose_j: &SE3) -> Vector6<f64> {
        edge.measurement_inv.compose(&relative_pose(pose_i, pose_j)).log() * edge.sqrt_information
    }

    fn error_at(&self, params: &DVector<f64>) -> f64 {
        self.edges
            .iter()
            .map(|e| {
                self.edge_error(e, &self.pose(params, e.i), &self.pose(params, e.j))
                    .norm_squared()
            })
            .sum()
    }
}

impl LeastSquaresProblem<f64, Dyn, Dyn> for PoseGraphLsq<'_> {
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
        if (self.should_stop)() {
            return None;
        }
        let mut r = DVector::zeros(6 * self.edges.len());
        for (k, edge) in self.edges.iter().enumerate() {
            let e = self.edge_error(edge, &self.pose(&self.params, edge.i), &self.pose(&self.params, edge.j));
            r.fixed_rows_mut::<6>(6 * k).copy_from(&e);
        }
        Some(r)
    }

    /// Central differences, only over the two blocks each edge touches.
    fn jacobian(&self) -> Option<DMatrix<f64>> {
        const EPS: f64 = 1e-6;
        let mut jac = DMatrix::zeros(6 * self.edges.len(), self.params.len());
        for (k, edge) in self.edges.iter().enumerate() {
            for (block, is_i) in [(edge.i, true), (edge.j, false)] {
                let Some(b) = block else {
                    continue;
                };
                for p in 0..6 {
                    let mut plus = self.params.clone();
                    let mut minus = self.params.clone();
                    plus[6 * b + p] += EPS;
                    minus[6 * b + p] -= EPS;
                    let (ep, em) = if is_i {
                        let pose_j = self.pose(&self.params, edge.j);
                        (
                            self.edge_error(edge, &pose_from_block(&plus, b), &pose_j),
                            self.edge_error(edge, &pose_from_block(&minus, b), &pose_j),
                        )
                    } else {
                        let pose_i = self.pose(&self.params, edge.i);
                        (
                            self.edge_error(edge, &pose_i, &pose_from_block(&plus, b)),
                            self.edge_error(edge, &pose_i, &pose_from_block(&minus, b)),
                        )
                    };
                    let column = (ep - em) / (2.0 * EPS);
                    let mut target = jac.fixed_view_mut::<6, 1>(6 * k, 6 * b + p);
                    target += column;
                }
            }
        }
        Some(jac)
    }
}

/// PHASE 2: Solve pose graph optimization.
pub fn solve_pose_graph(
    problem: &PoseGraphProblemData,
    config: &PoseGraphConfig,
    should_stop: &dyn Fn() -> bool,
) -> Result<PoseGraphResult, OptimizationError> {
    let optimized_ids: Vec<KeyFrameId> = problem
        .kf_ids
        .iter()
        .copied()
        .filter(|id| *id != problem.fixed_kf_id)
        .collect();
    if optimized_ids.is_empty() || problem.edges.is_empty() {
        return Err(OptimizationError::Empty);
    }
    let block_of: HashMap<KeyFrameId, usize> = optimized_ids.iter().enumerate().map(|(b, &id)| (id, b)).collect();
    let fixed_pose = problem
        .initial_poses
        .get(&problem.fixed_kf_id)
        .cloned()
        .ok_or(OptimizationError::Empty)?;

    let mut params = DVector::zeros(6 * optimized_ids.len());
    for (b, id) in optimized_ids.iter().enumerate() {
        let pose = problem.initial_poses.get(id).ok_or(OptimizationError::Empty)?;
        let r = pose.rotation.scaled_axis();
        params
            .fixed_rows_mut::<6>(6 * b)
            .copy_from(&Vector6::new(r.x, r.y, r.z, pose.translation.x, pose.translation.y, pose.translation.z));
    }

    let edges: Vec<IndexedEdge> = problem
        .edges
        .iter()
        .filter(|e| problem.initial_poses.contains_key(&e.kf_id_i) && problem.initial_poses.contains_key(&e.kf_id_j))
        .map(|e| IndexedEdge {
            i: block_of.get(&e.kf_id_i).copied(),
            j: block_of.get(&e.kf_id_j).copied(),
            measurement_inv: e.measurement.inverse(),
            sqrt_information: e.information.sqrt(),
        })
        .collect();

    let lsq = PoseGraphLsq {
        edges,
        fixed_pose,
        params,
        should_stop,
    };
    let initial_error = lsq.error_at(&lsq.params);

    let (lsq, report) = LevenbergMarquardt::new()
        .with_patience(config.max_iterations.max(1))
        .minimize(lsq);

    if matches!(report.termination, TerminationReason::User(_)) {
        return Err(OptimizationError::Aborted);
    }
    let final_error = lsq.error_at(&lsq.params);
    if !final_error.is_finite() {
        return Err(OptimizationError::NonFinite);
    }
    if final_error > initial_error {
        return Err(OptimizationError::NotConverged {
            initial: initial_error,
            final_cost: final_error,
        });
    }
    if !report.termination.was_successful() {
        debug!("[PoseGraph] solver stopped early: {:?}", report.termination);
    }

    let mut optimized_poses: HashMap<KeyFrameId, SE3> =
        optimized_ids.iter().enumerate().map(|(b, &id)| (id, pose_from_block(&lsq.params, b))).collect();
    optimized_poses.insert(problem.fixed_kf_id, lsq.fixed_pose.clone());

    Ok(PoseGraphResult {
        optimized_poses,
        evaluations: report.number_of_evaluations,
        initial_error,
        final_error,
    })
}

/// PHASE 3: Apply optimized poses to the map.
///
/// Every map point is moved rigidly with its reference keyframe (the one
/// that created it, or its oldest observer in the graph).
pub fn apply_pose_graph_results(map: &mut Map, problem: &PoseGraphProblemData, results: &PoseGraphResult) -> usize {
    let corrections: HashMap<KeyFrameId, SE3> = results
        .optimized_poses
        .iter()
        .filter_map(|(id, new_pose)| {
            let old = problem.initial_poses.get(id)?;
            Some((*id, new_pose.compose(&old.inverse())))
        })
        .collect();

    let mut mp_ids: Vec<_> = map.map_point_ids().copied().collect();
    mp_ids.sort_unstable();
    for mp_id in mp_ids {
        let Some(mp) = map.get_map_point(mp_id) else {
            continue;
        };
        if mp.is_bad {
            continue;
        }
        let reference = if corrections.contains_key(&mp.first_kf_id) {
            Some(mp.first_kf_id)
        } else {
            mp.observations.keys().filter(|id| corrections.contains_key(id)).min().copied()
        };
        let Some(correction) = reference.and_then(|id| corrections.get(&id)) else {
            continue;
        };
        let corrected = correction.transform_point(&mp.position);
        if let Some(mp) = map.get_map_point_mut(mp_id) {
            mp.position = corrected;
        }
    }

    let mut updated = 0;
    for (kf_id, pose) in &results.optimized_poses {
        if let Some(kf) = map.get_keyframe_mut(*kf_id) {
            if !kf.is_bad {
                kf.pose = pose.clone();
                updated += 1;
            }
        }
    }

    let mut mp_ids: Vec<_> = map.map_point_ids().copied().collect();
    mp_ids.sort_unstable();
    for mp_id in mp_ids {
        map.update_map_point_normal_and_depth(mp_id);
    }
    updated
}
