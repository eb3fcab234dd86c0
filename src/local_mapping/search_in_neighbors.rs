//! SearchInNeighbors - Map point fusion between covisible keyframes.
//!
//! Fuses duplicate map points between the current keyframe and its neighbors by:
//! 1. Collecting neighbor keyframes (best covisibles and their best covisibles)
//! 2. Fusing current KF's map points into neighbors
//! 3. Fusing neighbors' map points into current KF
//! 4. Updating affected points' descriptors and normals

use std::collections::HashSet;

use tracing::debug;

use crate::atlas::map::{KeyFrameId, Map, MapPointId};
use crate::features::{hamming, TH_LOW};
use crate::geometry::triangulation::CHI2_2DOF;
use crate::geometry::CameraModel;

/// Configuration for SearchInNeighbors.
#[derive(Debug, Clone)]
pub struct SearchInNeighborsConfig {
    /// Number of best covisible keyframes to collect.
    pub nn_covisibles: usize,
    /// Best covisibles taken from each first-ring neighbor.
    pub nn_second_ring: usize,
    /// Search radius multiplier based on scale (radius = factor * scale).
    pub radius_factor: f64,
    /// Descriptor distance threshold for matching.
    pub desc_threshold: u32,
}

impl Default for SearchInNeighborsConfig {
    fn default() -> Self {
        Self {
            nn_covisibles: 20,
            nn_second_ring: 5,
            radius_factor: 3.0,
            desc_threshold: TH_LOW,
        }
    }
}

/// Result of a fusion pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FuseResult {
    /// Duplicate map points merged.
    pub num_fused: usize,
    /// New observations added to existing map points.
    pub num_observations_added: usize,
}

impl std::ops::AddAssign for FuseResult {
    fn add_assign(&mut self, other: Self) {
        self.num_fused += other.num_fused;
        self.num_observations_added += other.num_observations_added;
    }
}

/// Project `mp_ids` into keyframe `kf_id` and, for each, either add an
/// observation on the best matching free feature or merge it with the map
/// point already observed there (the one with more observations survives).
pub fn fuse_into_keyframe(
    map: &mut Map,
    kf_id: KeyFrameId,
    mp_ids: &[MapPointId],
    camera: &CameraModel,
    radius_factor: f64,
    desc_threshold: u32,
) -> FuseResult {
    let mut result = FuseResult::default();
    for &candidate in mp_ids {
        let Some(mp_id) = map.resolve_map_point(candidate) else {
            continue;
        };

        let best = {
            let (Some(kf), Some(mp)) = (map.get_keyframe(kf_id), map.get_map_point(mp_id)) else {
                continue;
            };
            if kf.is_bad || mp.is_bad || mp.observations.contains_key(&kf_id) {
                continue;
            }
            let pyramid = map.pyramid();
            let pose_cw = kf.pose_cw();
            let Some(projected) = mp.project_into(&pose_cw, camera, pyramid, 0.0) else {
                continue;
            };
            let level = projected.predicted_level;
            let radius = radius_factor * pyramid.scale(level);

            let mut best = (u32::MAX, None::<usize>);
            for idx in kf.get_features_in_area(projected.uv.x, projected.uv.y, radius, None) {
                let kp = &kf.keypoints[idx];
                if kp.octave + 1 < level || kp.octave > level {
                    continue;
                }
                let err2 = (projected.uv - kp.pt()).norm_squared();
                if err2 * pyramid.inv_sigma2(kp.octave) > CHI2_2DOF {
                    continue;
                }
                let dist = hamming(&mp.descriptor, &kf.descriptors[idx]);
                if dist < best.0 {
                    best = (dist, Some(idx));
                }
            }
            match best {
                (dist, Some(idx)) if dist <= desc_threshold => idx,
                _ => continue,
            }
        };

        let existing = map.get_keyframe(kf_id).and_then(|kf| kf.get_map_point(best));
        match existing.and_then(|id| map.get_map_point(id)).map(|mp| (mp.id, mp.num_observations())) {
            Some((existing_id, existing_obs)) => {
                let candidate_obs = map.get_map_point(mp_id).map_or(0, |mp| mp.num_observations());
                if existing_obs > candidate_obs {
                    map.merge_map_points(existing_id, mp_id);
                } else {
                    map.merge_map_points(mp_id, existing_id);
                }
                result.num_fused += 1;
            }
            None => {
                if map.associate(kf_id, best, mp_id) {
                    result.num_observations_added += 1;
                }
            }
        }
    }
    result
}

/// First-ring and second-ring covisible keyframes of `current_kf_id`.
fn collect_neighbors(map: &Map, current_kf_id: KeyFrameId, config: &SearchInNeighborsConfig) -> Vec<KeyFrameId> {
    let Some(kf) = map.get_keyframe(current_kf_id) else {
        return Vec::new();
    };
    let mut seen: HashSet<KeyFrameId> = HashSet::from([current_kf_id]);
    let mut neighbors = Vec::new();
    for id in kf.get_best_covisibles(config.nn_covisibles) {
        let Some(first) = map.get_keyframe(id).filter(|k| !k.is_bad) else {
            continue;
        };
        if seen.insert(id) {
            neighbors.push(id);
        }
        for second in first.get_best_covisibles(config.nn_second_ring) {
            if map.get_keyframe(second).map_or(false, |k| !k.is_bad) && seen.insert(second) {
                neighbors.push(second);
            }
        }
    }
    neighbors
}

/// Perform map point fusion between current keyframe and its neighbors.
pub fn search_in_neighbors(
    map: &mut Map,
    current_kf_id: KeyFrameId,
    camera: &CameraModel,
    config: &SearchInNeighborsConfig,
) -> FuseResult {
    let mut result = FuseResult::default();
    let neighbor_ids = collect_neighbors(map, current_kf_id, config);
    if neighbor_ids.is_empty() {
        return result;
    }

    let current_mp_ids: Vec<MapPointId> = match map.get_keyframe(current_kf_id) {
        Some(kf) => kf.get_map_point_indices().map(|(_, id)| id).collect(),
        None => return result,
    };
    for &neighbor in &neighbor_ids {
        result += fuse_into_keyframe(map, neighbor, &current_mp_ids, camera, config.radius_factor, config.desc_threshold);
    }

    let current_set: HashSet<MapPointId> = map
        .get_keyframe(current_kf_id)
        .map(|kf| kf.get_map_point_indices().map(|(_, id)| id).collect())
        .unwrap_or_default();
    let mut neighbor_mps: Vec<MapPointId> = neighbor_ids
        .iter()
        .filter_map(|&id| map.get_keyframe(id))
        .flat_map(|kf| kf.get_map_point_indices().map(|(_, id)| id))
        .filter(|id| !current_set.contains(id))
        .collect::<HashSet<_>>()
        .into_iter()
        .collect();
    neighbor_mps.sort_unstable();
    result += fuse_into_keyframe(map, current_kf_id, &neighbor_mps, camera, config.radius_factor, config.desc_threshold);

    let updated: Vec<MapPointId> = map
        .get_keyframe(current_kf_id)
        .map(|kf| kf.get_map_point_indices().map(|(_, id)| id).collect())
        .unwrap_or_default();
    for mp_id in updated {
        map.compute_distinctive_descriptor(mp_id);
        map.update_map_point_normal_and_depth(mp_id);
    }
    map.update_connections(current_kf_id);

    if result.num_fused > 0 || result.num_observations_added > 0 {
        debug!(
            "[SearchInNeighbors] kf {}: fused {} points, added {} observations",
            current_kf_id, result.num_fused, result.num_observations_added
        );
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::SE3;
    use crate::tracking::matching::tests::{camera, landmarks, observe};
    use nalgebra::{UnitQuaternion, Vector3};

    fn pose(x: f64) -> SE3 {
        SE3 {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::new(-x, 0.0, 0.0),
        }
    }

    /// Three keyframes over the same landmarks. Keyframes 0 and 1 share
    /// every point; keyframe 2 created its own duplicates of the first
    /// `dup` landmarks and shares the rest with keyframe 1.
    fn duplicated_scene(n: usize, dup: usize) -> (Map, Vec<KeyFrameId>) {
        let lms = landmarks(n, 40);
        let mut map = Map::default();
        let mut kfs = Vec::new();
        let mut obs = Vec::new();
        for (i, x) in [0.0, 0.2, 0.4].into_iter().enumerate() {
            let (fs, ids) = observe(&pose(x), &lms);
            kfs.push(map.create_keyframe(i as u64, i as f64, pose(x).inverse(), fs, (640, 480)));
            obs.push(ids);
        }
        let shared: Vec<MapPointId> = lms.iter().map(|(p, d)| map.create_map_point(*p, *d, kfs[0])).collect();
        for k in 0..2 {
            for (idx, &lm) in obs[k].iter().enumerate() {
                map.associate(kfs[k], idx, shared[lm]);
            }
        }
        for (idx, &lm) in obs[2].iter().enumerate() {
            let id = if lm < dup { map.create_map_point(lms[lm].0, lms[lm].1, kfs[2]) } else { shared[lm] };
            map.associate(kfs[2], idx, id);
        }
        for &kf in &kfs {
            map.update_connections(kf);
        }
        for id in map.map_point_ids().copied().collect::<Vec<_>>() {
            map.update_map_point_normal_and_depth(id);
        }
        (map, kfs)
    }

    #[test]
    fn test_duplicates_are_merged() {
        let (mut map, kfs) = duplicated_scene(60, 10);
        assert_eq!(map.num_map_points(), 70);
        let result = search_in_neighbors(&mut map, kfs[2], &camera(), &SearchInNeighborsConfig::default());
        assert_eq!(result.num_fused, 10);
        assert_eq!(map.num_map_points(), 60);
        // Every surviving point is observed by all three keyframes.
        assert!(map.map_points().all(|mp| mp.num_observations() == 3));
    }

    #[test]
    fn test_missing_observations_are_added() {
        let (mut map, kfs) = duplicated_scene(60, 0);
        // Drop a few observations from keyframe 2.
        for idx in 0..5 {
            map.disassociate(kfs[2], idx);
        }
        let all: Vec<MapPointId> = map.map_point_ids().copied().collect();
        let result = fuse_into_keyframe(&mut map, kfs[2], &all, &camera(), 3.0, TH_LOW);
        assert_eq!(result.num_observations_added, 5);
        assert_eq!(result.num_fused, 0);
        assert_eq!(map.get_keyframe(kfs[2]).unwrap().num_map_points(), 60);
    }
}
