//! Full bundle adjustment over every keyframe and map point.
//!
//! Used once the two-view initialization has built its map: the first
//! keyframe anchors the gauge and everything else is refined. Shares the
//! Schur-complement solver of [`super::local_ba`].

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::atlas::map::{KeyFrameId, Map, MapPointId};
use crate::atlas::Atlas;
use crate::geometry::CameraModel;

use super::local_ba::{apply_ba_results, build_problem, solve_ba, BAProblemData, BAResultData, LocalBAConfig};
use super::OptimizationError;

/// Configuration for global BA.
#[derive(Debug, Clone)]
pub struct GlobalBAConfig {
    pub max_iterations: usize,
    pub huber_delta: f64,
}

impl Default for GlobalBAConfig {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            huber_delta: super::reprojection::huber_delta(),
        }
    }
}

/// PHASE 1: COLLECT every non-bad keyframe and map point.
pub fn collect_global_ba_data(map: &Map) -> Option<BAProblemData> {
    let anchor = map.initial_keyframe_id()?;
    let mut optimized: Vec<KeyFrameId> = map
        .keyframes()
        .filter(|kf| !kf.is_bad && kf.id != anchor)
        .map(|kf| kf.id)
        .collect();
    optimized.sort_unstable();
    if optimized.is_empty() {
        return None;
    }

    let mut mp_ids: Vec<MapPointId> = map.map_points().filter(|mp| !mp.is_bad).map(|mp| mp.id).collect();
    mp_ids.sort_unstable();

    build_problem(map, optimized, vec![anchor], mp_ids)
}

/// Run global BA through the three phases on the shared atlas.
///
/// On failure the map is left untouched and the failure is logged.
pub fn run_global_ba(
    atlas: &RwLock<Atlas>,
    camera: &CameraModel,
    config: &GlobalBAConfig,
    should_stop: &dyn Fn() -> bool,
) -> Result<BAResultData, OptimizationError> {
    let problem = {
        let guard = atlas.read();
        collect_global_ba_data(&guard.map).ok_or(OptimizationError::Empty)?
    };

    let solver_config = LocalBAConfig {
        max_iterations: config.max_iterations,
        huber_delta: config.huber_delta,
        ..Default::default()
    };
    let result = match solve_ba(&problem, camera, &solver_config, should_stop) {
        Ok(r) => r,
        Err(e) => {
            warn!("[GlobalBA] keeping previous estimates: {}", e);
            return Err(e);
        }
    };

    {
        let mut guard = atlas.write();
        apply_ba_results(&mut guard.map, &result);
    }

    info!(
        "[GlobalBA] {} keyframes, {} points, {} iterations, cost {:.4} -> {:.4}",
        problem.optimized_kf_ids.len() + 1,
        problem.mp_ids.len(),
        result.iterations,
        result.initial_cost,
        result.final_cost
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::local_ba::tests::{build_scene, camera};
    use nalgebra::{Vector3, Vector6};

    #[test]
    fn test_collect_anchors_first_keyframe() {
        let (map, _, _) = build_scene(3, 10, 1);
        let problem = collect_global_ba_data(&map).unwrap();
        assert_eq!(problem.fixed_kf_ids, vec![map.initial_keyframe_id().unwrap()]);
        assert_eq!(problem.optimized_kf_ids.len(), 2);
        assert_eq!(problem.mp_ids.len(), 10);
    }

    #[test]
    fn test_empty_map_has_no_problem() {
        assert!(collect_global_ba_data(&Map::default()).is_none());
    }

    #[test]
    fn test_run_reduces_cost() {
        let (mut map, _, _) = build_scene(3, 40, 9);
        for mp_id in map.map_point_ids().copied().collect::<Vec<_>>() {
            map.get_map_point_mut(mp_id).unwrap().position += Vector3::new(0.01, -0.01, 0.02);
        }
        let last = map.last_keyframe_id().unwrap();
        let kf = map.get_keyframe_mut(last).unwrap();
        let perturbed = kf.pose_cw().retract_left(&Vector6::new(0.0, 0.002, 0.0, 0.01, 0.0, 0.0));
        kf.set_pose_cw(&perturbed);

        let mut atlas = Atlas::default();
        atlas.map = map;
        let atlas = RwLock::new(atlas);
        let result = run_global_ba(&atlas, &camera(), &GlobalBAConfig::default(), &|| false).unwrap();
        assert!(result.final_cost < result.initial_cost);
    }
}
