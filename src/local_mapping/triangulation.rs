//! Multi-frame triangulation with geometric validation.
//!
//! New map points are created between the current keyframe and its best
//! covisible neighbors:
//! 1. For each neighbor with enough baseline, find epipolar-constrained
//!    matches among features without a map point
//! 2. Triangulate with DLT
//! 3. Validate with parallax, depth, reprojection error and scale
//!    consistency checks

use nalgebra::{Matrix3, Vector2, Vector3};
use tracing::debug;

use crate::atlas::map::{KeyFrame, KeyFrameId, Map, MapPointId};
use crate::features::matcher::RotationHistogram;
use crate::features::{hamming, ScalePyramid, TH_LOW};
use crate::geometry::triangulation::{
    epipolar_distance_sq, fundamental_between, ray_parallax_cos, reprojection_error_sq, triangulate_dlt, CHI2_1DOF,
    CHI2_2DOF,
};
use crate::geometry::CameraModel;
use crate::vocabulary::FeatureVector;

/// Configuration for multi-frame triangulation.
#[derive(Debug, Clone)]
pub struct TriangulationConfig {
    /// Number of neighbor keyframes to consider.
    pub num_neighbors: usize,
    /// Maximum descriptor distance for matching.
    pub max_descriptor_dist: u32,
    /// Minimum baseline as fraction of the neighbor's median scene depth.
    pub min_baseline_ratio: f64,
    /// Rays closer to parallel than this are not triangulated.
    pub max_parallax_cos: f64,
    /// Tolerance on the distance ratio versus the octave ratio.
    pub scale_ratio_factor: f64,
}

impl Default for TriangulationConfig {
    fn default() -> Self {
        Self {
            num_neighbors: 20,
            max_descriptor_dist: TH_LOW,
            min_baseline_ratio: 0.01,
            max_parallax_cos: 0.9998,
            scale_ratio_factor: 1.5,
        }
    }
}

/// Result of multi-frame triangulation.
#[derive(Debug, Clone, Default)]
pub struct TriangulationResult {
    pub num_pairs_checked: usize,
    pub num_matches_found: usize,
    pub new_points: Vec<MapPointId>,
}

/// Median depth of the keyframe's map points in its camera frame.
pub fn median_scene_depth(map: &Map, kf: &KeyFrame) -> Option<f64> {
    let pose_cw = kf.pose_cw();
    let mut depths: Vec<f64> = kf
        .get_map_point_indices()
        .filter_map(|(_, id)| map.get_map_point(id))
        .filter(|mp| !mp.is_bad)
        .map(|mp| pose_cw.transform_point(&mp.position).z)
        .collect();
    if depths.is_empty() {
        return None;
    }
    depths.sort_by(|a, b| a.total_cmp(b));
    Some(depths[(depths.len() - 1) / 2])
}

/// All features in one group, for keyframes without a feature vector.
fn single_group(n: usize) -> FeatureVector {
    [(0u32, (0..n).collect())].into_iter().collect()
}

/// Match features of `kf1` and `kf2` that have no map point yet and satisfy
/// the epipolar constraint `F12`. Features near the epipole in `kf2` are
/// skipped, since their rays are almost parallel.
pub fn search_for_triangulation(
    kf1: &KeyFrame,
    kf2: &KeyFrame,
    f12: &Matrix3<f64>,
    camera: &CameraModel,
    pyramid: &ScalePyramid,
    max_distance: u32,
) -> Vec<(usize, usize)> {
    let epipole = camera.project(&kf2.pose_cw().transform_point(&kf1.camera_center()));

    let fallback1;
    let fallback2;
    let (fv1, fv2) = match (kf1.feature_vector(), kf2.feature_vector()) {
        (Some(a), Some(b)) => (a, b),
        _ => {
            fallback1 = single_group(kf1.num_features());
            fallback2 = single_group(kf2.num_features());
            (&fallback1, &fallback2)
        }
    };

    let mut matched2: Vec<Option<usize>> = vec![None; kf2.num_features()];
    let mut matches: Vec<Option<usize>> = vec![None; kf1.num_features()];
    let mut hist = RotationHistogram::new();

    for (node, idxs1) in fv1 {
        let Some(idxs2) = fv2.get(node) else { continue };
        for &i1 in idxs1 {
            if kf1.get_map_point(i1).is_some() {
                continue;
            }
            let kp1 = &kf1.keypoints[i1];
            let mut best = (max_distance + 1, None);
            for &i2 in idxs2 {
                if matched2[i2].is_some() || kf2.get_map_point(i2).is_some() {
                    continue;
                }
                let dist = hamming(&kf1.descriptors[i1], &kf2.descriptors[i2]);
                if dist > max_distance || dist >= best.0 {
                    continue;
                }
                let kp2 = &kf2.keypoints[i2];
                if let Some(ep) = epipole {
                    if (ep - kp2.pt()).norm_squared() < 100.0 * pyramid.scale(kp2.octave) {
                        continue;
                    }
                }
                let within_line = epipolar_distance_sq(f12, &kp1.pt(), &kp2.pt())
                    .map_or(false, |d| d < CHI2_1DOF * pyramid.sigma2(kp2.octave));
                if within_line {
                    best = (dist, Some(i2));
                }
            }
            if let (_, Some(i2)) = best {
                matched2[i2] = Some(i1);
                matches[i1] = Some(i2);
                hist.add(kp1.angle, kf2.keypoints[i2].angle, i1);
            }
        }
    }

    for i1 in hist.inconsistent() {
        matches[i1] = None;
    }
    matches
        .into_iter()
        .enumerate()
        .filter_map(|(i1, m)| m.map(|i2| (i1, i2)))
        .collect()
}

/// Triangulate a matched pair and run every geometric check.
fn triangulate_pair(
    kf1: &KeyFrame,
    kf2: &KeyFrame,
    i1: usize,
    i2: usize,
    camera: &CameraModel,
    pyramid: &ScalePyramid,
    config: &TriangulationConfig,
) -> Option<Vector3<f64>> {
    let (pose1, pose2) = (kf1.pose_cw(), kf2.pose_cw());
    let (kp1, kp2) = (&kf1.keypoints[i1], &kf2.keypoints[i2]);
    let (uv1, uv2): (Vector2<f64>, Vector2<f64>) = (kp1.pt(), kp2.pt());
    let xn1 = camera.unproject(&uv1);
    let xn2 = camera.unproject(&uv2);

    let ray1 = kf1.pose.rotation * xn1;
    let ray2 = kf2.pose.rotation * xn2;
    let cos_parallax = ray_parallax_cos(&ray1, &ray2);
    if cos_parallax <= 0.0 || cos_parallax >= config.max_parallax_cos {
        return None;
    }

    let p = triangulate_dlt(&xn1, &xn2, &pose1, &pose2)?;
    if pose1.transform_point(&p).z <= 0.0 || pose2.transform_point(&p).z <= 0.0 {
        return None;
    }

    let err1 = reprojection_error_sq(&p, &pose1, &uv1, camera)?;
    let err2 = reprojection_error_sq(&p, &pose2, &uv2, camera)?;
    if err1 > CHI2_2DOF * pyramid.sigma2(kp1.octave) || err2 > CHI2_2DOF * pyramid.sigma2(kp2.octave) {
        return None;
    }

    // Scale consistency
    let dist1 = (p - kf1.camera_center()).norm();
    let dist2 = (p - kf2.camera_center()).norm();
    if dist1 == 0.0 || dist2 == 0.0 {
        return None;
    }
    let ratio_dist = dist2 / dist1;
    let ratio_octave = pyramid.scale(kp1.octave) / pyramid.scale(kp2.octave);
    let factor = config.scale_ratio_factor * pyramid.scale(1);
    if ratio_dist * factor < ratio_octave || ratio_dist > ratio_octave * factor {
        return None;
    }
    Some(p)
}

/// Triangulate new map points between the current keyframe and its neighbors.
pub fn triangulate_from_neighbors(
    map: &mut Map,
    current_kf_id: KeyFrameId,
    camera: &CameraModel,
    config: &TriangulationConfig,
) -> TriangulationResult {
    let mut result = TriangulationResult::default();
    let pyramid = map.pyramid().clone();
    let neighbor_ids = match map.get_keyframe(current_kf_id) {
        Some(kf) => kf.get_best_covisibles(config.num_neighbors),
        None => return result,
    };

    for neighbor_id in neighbor_ids {
        let candidates: Vec<(usize, usize, Vector3<f64>)> = {
            let (Some(kf1), Some(kf2)) = (map.get_keyframe(current_kf_id), map.get_keyframe(neighbor_id)) else {
                continue;
            };
            if kf2.is_bad {
                continue;
            }
            result.num_pairs_checked += 1;

            let baseline = (kf2.camera_center() - kf1.camera_center()).norm();
            let Some(depth) = median_scene_depth(map, kf2) else { continue };
            if baseline / depth < config.min_baseline_ratio {
                continue;
            }

            let f12 = fundamental_between(&kf1.pose_cw(), &kf2.pose_cw(), camera);
            let matches = search_for_triangulation(kf1, kf2, &f12, camera, &pyramid, config.max_descriptor_dist);
            result.num_matches_found += matches.len();
            matches
                .into_iter()
                .filter_map(|(i1, i2)| triangulate_pair(kf1, kf2, i1, i2, camera, &pyramid, config).map(|p| (i1, i2, p)))
                .collect()
        };

        for (i1, i2, p) in candidates {
            let Some(descriptor) = map.get_keyframe(current_kf_id).map(|kf| kf.descriptors[i1]) else {
                continue;
            };
            let mp_id = map.create_map_point(p, descriptor, current_kf_id);
            map.associate(current_kf_id, i1, mp_id);
            map.associate(neighbor_id, i2, mp_id);
            map.compute_distinctive_descriptor(mp_id);
            map.update_map_point_normal_and_depth(mp_id);
            result.new_points.push(mp_id);
        }
    }

    if !result.new_points.is_empty() {
        debug!(
            "[Triangulation] kf {}: {} new points (pairs={}, matches={})",
            current_kf_id,
            result.new_points.len(),
            result.num_pairs_checked,
            result.num_matches_found
        );
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::Descriptor;
    use crate::geometry::SE3;
    use crate::tracking::matching::tests::{camera, landmarks, observe};
    use nalgebra::UnitQuaternion;

    fn pose(x: f64) -> SE3 {
        SE3 {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::new(-x, 0.0, 0.0),
        }
    }

    /// Two keyframes sharing `shared` already-mapped landmarks (so the
    /// covisibility edge and scene depth exist) plus `fresh` unmapped ones.
    fn scene(shared: usize, fresh: usize) -> (Map, KeyFrameId, Vec<(Vector3<f64>, Descriptor)>) {
        let lms = landmarks(shared + fresh, 12);
        let mut map = Map::default();
        let mut kfs = Vec::new();
        for (i, x) in [0.0, 0.3].into_iter().enumerate() {
            let (fs, ids) = observe(&pose(x), &lms);
            let kf = map.create_keyframe(i as u64, i as f64, pose(x).inverse(), fs, (640, 480));
            kfs.push((kf, ids));
        }
        let mut mps = vec![None; shared];
        for (kf, ids) in &kfs {
            for (idx, &lm) in ids.iter().enumerate() {
                if lm >= shared {
                    continue;
                }
                let mp = *mps[lm].get_or_insert_with(|| map.create_map_point(lms[lm].0, lms[lm].1, *kf));
                map.associate(*kf, idx, mp);
            }
        }
        map.update_connections(kfs[0].0);
        map.update_connections(kfs[1].0);
        (map, kfs[1].0, lms)
    }

    #[test]
    fn test_creates_points_at_true_positions() {
        let (mut map, current, lms) = scene(30, 80);
        let before = map.num_map_points();
        let result = triangulate_from_neighbors(&mut map, current, &camera(), &TriangulationConfig::default());
        assert!(result.new_points.len() >= 75, "{} new points", result.new_points.len());
        assert_eq!(map.num_map_points(), before + result.new_points.len());

        for id in &result.new_points {
            let mp = map.get_map_point(*id).unwrap();
            assert_eq!(mp.num_observations(), 2);
            let truth = lms.iter().find(|(_, d)| *d == mp.descriptor).unwrap().0;
            assert!((mp.position - truth).norm() < 1e-6);
        }
    }

    #[test]
    fn test_no_baseline_no_points() {
        let (mut map, current, _) = scene(30, 50);
        let kf = map.get_keyframe_mut(current).unwrap();
        kf.pose = pose(0.0).inverse();
        let result = triangulate_from_neighbors(&mut map, current, &camera(), &TriangulationConfig::default());
        assert!(result.new_points.is_empty());
    }

    #[test]
    fn test_median_scene_depth() {
        let (map, current, _) = scene(30, 0);
        let depth = median_scene_depth(&map, map.get_keyframe(current).unwrap()).unwrap();
        assert!(depth > 4.0 && depth < 8.0);
    }
}
