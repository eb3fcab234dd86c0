//! Loop correction: Sim3 propagation, map point fusion and pose graph
//! optimization.
//!
//! Local Mapping must be paused before [`correct_loop`] is called. The
//! correction runs in three phases:
//! 1. Under the write lock: correct the current keyframe and its covisible
//!    neighbours with the loop Sim3, move their map points along, fuse the
//!    loop map points and record the new loop connections
//! 2. Pose graph: collect (read lock), solve (no lock), apply (write lock)
//! 3. Mark the map as changed so tracking drops stale references

use std::collections::{HashMap, HashSet};

use tracing::{debug, info, warn};

use crate::atlas::map::{KeyFrameId, Map, MapPointId};
use crate::config::LoopClosingSettings;
use crate::features::TH_LOW;
use crate::geometry::{CameraModel, Sim3, SE3};
use crate::local_mapping::fuse_into_keyframe;
use crate::optimizer::{apply_pose_graph_results, collect_pose_graph_data, solve_pose_graph, PoseGraphConfig};
use crate::system::shared_state::SharedState;

use super::verifier::VerifiedLoop;

/// Configuration for loop correction.
#[derive(Debug, Clone)]
pub struct CorrectorConfig {
    /// Search radius of the loop fusion, in pixels at level 0.
    pub fuse_radius: f64,
    pub pose_graph: PoseGraphConfig,
}

impl CorrectorConfig {
    pub fn from_settings(settings: &LoopClosingSettings) -> Self {
        Self {
            pose_graph: PoseGraphConfig {
                max_iterations: settings.pose_graph_iterations,
                min_covisibility_weight: settings.min_covisibility_weight,
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

impl Default for CorrectorConfig {
    fn default() -> Self {
        Self {
            fuse_radius: 4.0,
            pose_graph: PoseGraphConfig::default(),
        }
    }
}

/// What a loop correction changed.
#[derive(Debug, Clone, Default)]
pub struct LoopCorrection {
    pub corrected_keyframes: usize,
    pub corrected_map_points: usize,
    pub fused_map_points: usize,
    pub loop_connections: usize,
    /// Pose graph error before and after, if it ran.
    pub pose_graph_error: Option<(f64, f64)>,
}

/// Data the pose graph needs from the Sim3 correction.
struct SimilarityCorrection {
    /// `T_wc` of the corrected keyframes before correction.
    non_corrected: HashMap<KeyFrameId, SE3>,
    loop_connections: HashMap<KeyFrameId, Vec<KeyFrameId>>,
}

/// Correct the map for a verified loop.
pub fn correct_loop(
    shared: &SharedState,
    verified: &VerifiedLoop,
    camera: &CameraModel,
    config: &CorrectorConfig,
) -> LoopCorrection {
    let mut report = LoopCorrection::default();

    let correction = {
        let mut atlas = shared.atlas.write();
        apply_similarity_correction(&mut atlas.map, verified, camera, config, &mut report)
    };
    let Some(correction) = correction else {
        return report;
    };

    // PHASE 1: COLLECT
    let problem = {
        let atlas = shared.atlas.read();
        collect_pose_graph_data(
            &atlas.map,
            verified.loop_kf_id,
            verified.current_kf_id,
            &correction.non_corrected,
            &correction.loop_connections,
            &config.pose_graph,
        )
    };

    // PHASE 2: SOLVE
    if let Some(problem) = problem {
        match solve_pose_graph(&problem, &config.pose_graph, &|| shared.is_shutdown_requested()) {
            Ok(result) => {
                // PHASE 3: APPLY
                let mut atlas = shared.atlas.write();
                apply_pose_graph_results(&mut atlas.map, &problem, &result);
                report.pose_graph_error = Some((result.initial_error, result.final_error));
                info!(
                    "[PoseGraph] {} keyframes, {} edges, error {:.4} -> {:.4}",
                    problem.kf_ids.len(),
                    problem.edges.len(),
                    result.initial_error,
                    result.final_error
                );
            }
            Err(e) => warn!("[PoseGraph] keeping Sim3-corrected poses: {}", e),
        }
    }

    shared.atlas.write().map.inform_big_change();
    report
}

fn apply_similarity_correction(
    map: &mut Map,
    verified: &VerifiedLoop,
    camera: &CameraModel,
    config: &CorrectorConfig,
    report: &mut LoopCorrection,
) -> Option<SimilarityCorrection> {
    let current_id = verified.current_kf_id;
    map.update_connections(current_id);
    let current = map.get_keyframe(current_id).filter(|kf| !kf.is_bad)?;
    if map.get_keyframe(verified.loop_kf_id).map_or(true, |kf| kf.is_bad) {
        return None;
    }

    let twc_current = current.pose.clone();
    let mut connected: Vec<KeyFrameId> = current.get_covisibles().copied().collect();
    connected.push(current_id);
    connected.sort_unstable();

    // Corrected and original S_iw of every connected keyframe.
    let mut corrected: HashMap<KeyFrameId, Sim3> = HashMap::new();
    let mut original: HashMap<KeyFrameId, Sim3> = HashMap::new();
    for &kf_id in &connected {
        let Some(kf) = map.get_keyframe(kf_id).filter(|kf| !kf.is_bad) else {
            continue;
        };
        let tiw = kf.pose_cw();
        let siw = if kf_id == current_id {
            verified.scw.clone()
        } else {
            Sim3::from_se3(&tiw.compose(&twc_current)).compose(&verified.scw)
        };
        corrected.insert(kf_id, siw);
        original.insert(kf_id, Sim3::from_se3(&tiw));
    }

    // Map points follow the keyframe that first reaches them.
    let mut moved: HashSet<MapPointId> = HashSet::new();
    for &kf_id in &connected {
        let (Some(siw_corrected), Some(siw_original)) = (corrected.get(&kf_id), original.get(&kf_id)) else {
            continue;
        };
        let swi_corrected = siw_corrected.inverse();
        let mp_ids: Vec<MapPointId> = map
            .get_keyframe(kf_id)
            .map(|kf| kf.get_map_point_indices().map(|(_, mp)| mp).collect())
            .unwrap_or_default();
        for mp_id in mp_ids {
            if !moved.insert(mp_id) {
                continue;
            }
            if let Some(mp) = map.get_map_point_mut(mp_id).filter(|mp| !mp.is_bad) {
                mp.position = swi_corrected.transform_point(&siw_original.transform_point(&mp.position));
            }
        }
    }
    for (kf_id, siw) in &corrected {
        if let Some(kf) = map.get_keyframe_mut(*kf_id) {
            kf.set_pose_cw(&siw.to_se3_normalized());
        }
    }
    for &mp_id in &moved {
        map.update_map_point_normal_and_depth(mp_id);
    }
    report.corrected_keyframes = corrected.len();
    report.corrected_map_points = moved.len();

    // Covisibility before fusion; associations update it as they happen.
    let previous_neighbors: HashMap<KeyFrameId, HashSet<KeyFrameId>> = connected
        .iter()
        .filter_map(|id| map.get_keyframe(*id).map(|kf| (*id, kf.get_covisibles().copied().collect())))
        .collect();

    // Loop fusion: the loop side replaces the current side.
    for (feature_idx, loop_mp) in verified.current_matches.iter().enumerate() {
        let Some(loop_mp) = loop_mp.and_then(|id| map.resolve_map_point(id)) else {
            continue;
        };
        let existing = map.get_keyframe(current_id).and_then(|kf| kf.get_map_point(feature_idx));
        match existing {
            Some(existing) if existing != loop_mp => {
                map.merge_map_points(loop_mp, existing);
                report.fused_map_points += 1;
            }
            Some(_) => {}
            None => {
                if map.associate(current_id, feature_idx, loop_mp) {
                    map.compute_distinctive_descriptor(loop_mp);
                }
            }
        }
    }
    for &kf_id in &connected {
        let result = fuse_into_keyframe(
            map,
            kf_id,
            &verified.loop_map_points,
            camera,
            config.fuse_radius,
            TH_LOW,
        );
        report.fused_map_points += result.num_fused;
    }

    let connected_set: HashSet<KeyFrameId> = connected.iter().copied().collect();
    let mut loop_connections: HashMap<KeyFrameId, Vec<KeyFrameId>> = HashMap::new();
    for &kf_id in &connected {
        map.update_connections(kf_id);
        let Some(kf) = map.get_keyframe(kf_id) else {
            continue;
        };
        let previous = previous_neighbors.get(&kf_id);
        let mut links: Vec<KeyFrameId> = kf
            .get_covisibles()
            .copied()
            .filter(|id| !connected_set.contains(id))
            .filter(|id| previous.map_or(true, |p| !p.contains(id)))
            .collect();
        if links.is_empty() {
            continue;
        }
        links.sort_unstable();
        report.loop_connections += links.len();
        loop_connections.insert(kf_id, links);
    }

    map.add_loop_edge(current_id, verified.loop_kf_id);

    debug!(
        "[LoopClosing] Sim3 correction: {} keyframes, {} points, {} fused, {} loop links",
        report.corrected_keyframes, report.corrected_map_points, report.fused_map_points, report.loop_connections
    );

    let non_corrected = original
        .iter()
        .map(|(id, siw)| (*id, siw.to_se3_normalized().inverse()))
        .collect();
    Some(SimilarityCorrection {
        non_corrected,
        loop_connections,
    })
}
