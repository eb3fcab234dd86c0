//! Geometric verification of loop candidates.
//!
//! For each consistent candidate:
//! 1. Match map points of the current and candidate keyframes through the
//!    vocabulary (at least `min_bow_matches`)
//! 2. Estimate `S12` with Sim3 RANSAC
//! 3. Find more matches by projecting each side through `S12`, then refine
//!    `S12` on all of them
//! 4. Project the map points of the candidate and its covisible keyframes
//!    into the current keyframe with the corrected pose
//!
//! The first candidate reaching `min_loop_matches` is accepted.

use std::collections::HashSet;

use rand::Rng;
use tracing::debug;

use crate::atlas::map::{KeyFrame, KeyFrameId, Map, MapPointId};
use crate::config::LoopClosingSettings;
use crate::features::matcher::match_by_feature_vector;
use crate::features::{hamming, match_symmetric, Descriptor, MatchParams, TH_HIGH, TH_LOW};
use crate::geometry::{CameraModel, Sim3, SE3};
use crate::optimizer::{refine_sim3, Sim3Correspondence, Sim3RefineConfig};

use super::sim3_solver::{compute_sim3_ransac, Sim3SolverConfig};

#[derive(Debug, Clone)]
pub struct LoopVerifierConfig {
    pub min_bow_matches: usize,
    pub bow_ratio: f32,
    /// Inliers the refined Sim3 must keep.
    pub min_sim3_inliers: usize,
    /// Matches between the current keyframe and the loop neighbourhood
    /// needed to accept the loop.
    pub min_loop_matches: usize,
    /// Search radius of the guided Sim3 matching, in pixels at level 0.
    pub sim3_search_radius: f64,
    /// Search radius of the loop neighbourhood projection, in pixels at level 0.
    pub projection_radius: f64,
    pub ransac: Sim3SolverConfig,
    pub refine: Sim3RefineConfig,
}

impl LoopVerifierConfig {
    pub fn from_settings(settings: &LoopClosingSettings) -> Self {
        Self {
            min_sim3_inliers: settings.min_sim3_inliers,
            min_loop_matches: settings.min_loop_matches,
            ransac: Sim3SolverConfig {
                min_inliers: settings.min_sim3_inliers,
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

impl Default for LoopVerifierConfig {
    fn default() -> Self {
        Self {
            min_bow_matches: 20,
            bow_ratio: 0.75,
            min_sim3_inliers: 20,
            min_loop_matches: 40,
            sim3_search_radius: 7.5,
            projection_radius: 10.0,
            ransac: Sim3SolverConfig::default(),
            refine: Sim3RefineConfig::default(),
        }
    }
}

/// A verified loop closure ready for correction.
#[derive(Debug, Clone)]
pub struct VerifiedLoop {
    pub current_kf_id: KeyFrameId,
    pub loop_kf_id: KeyFrameId,

    /// Maps loop keyframe camera coordinates into the current camera.
    pub s12: Sim3,

    /// Corrected world → current camera similarity.
    pub scw: Sim3,

    /// Loop-side map point matched to each feature of the current keyframe.
    pub current_matches: Vec<Option<MapPointId>>,

    /// Map points of the loop keyframe and its covisible keyframes.
    pub loop_map_points: Vec<MapPointId>,
}

impl VerifiedLoop {
    pub fn num_matches(&self) -> usize {
        self.current_matches.iter().flatten().count()
    }
}

/// Verify candidates in order and return the first accepted loop.
pub fn verify_loop_candidates<R: Rng>(
    map: &Map,
    current_kf_id: KeyFrameId,
    candidates: &[KeyFrameId],
    camera: &CameraModel,
    config: &LoopVerifierConfig,
    rng: &mut R,
) -> Option<VerifiedLoop> {
    let current = map.get_keyframe(current_kf_id).filter(|kf| !kf.is_bad)?;

    for &candidate_id in candidates {
        let Some(candidate) = map.get_keyframe(candidate_id).filter(|kf| !kf.is_bad) else {
            continue;
        };
        if let Some(verified) = verify_candidate(map, current, candidate, camera, config, rng) {
            return Some(verified);
        }
    }
    None
}

fn verify_candidate<R: Rng>(
    map: &Map,
    current: &KeyFrame,
    candidate: &KeyFrame,
    camera: &CameraModel,
    config: &LoopVerifierConfig,
    rng: &mut R,
) -> Option<VerifiedLoop> {
    let params = MatchParams {
        max_distance: TH_LOW,
        ratio: config.bow_ratio,
    };
    let bow_matches = search_by_bow_keyframes(map, current, candidate, &params);
    if bow_matches.len() < config.min_bow_matches {
        debug!(
            "[LoopClosing] {} -> {}: {} BoW matches",
            current.id,
            candidate.id,
            bow_matches.len()
        );
        return None;
    }

    let (bow_matches, correspondences) = build_correspondences(map, current, candidate, &bow_matches);
    let ransac = compute_sim3_ransac(&correspondences, camera, &config.ransac, rng)?;

    let mut pairs: Vec<(usize, usize)> = bow_matches
        .iter()
        .zip(&ransac.inliers)
        .filter(|(_, &inlier)| inlier)
        .map(|(pair, _)| *pair)
        .collect();
    let extra = search_by_sim3(map, current, candidate, &ransac.s12, &pairs, camera, config.sim3_search_radius);
    pairs.extend(extra);

    let (pairs, correspondences) = build_correspondences(map, current, candidate, &pairs);
    let refined = refine_sim3(&ransac.s12, &correspondences, camera, &config.refine)?;
    if refined.num_inliers < config.min_sim3_inliers {
        debug!(
            "[LoopClosing] {} -> {}: {} Sim3 inliers after refinement",
            current.id, candidate.id, refined.num_inliers
        );
        return None;
    }

    let mut current_matches: Vec<Option<MapPointId>> = vec![None; current.num_features()];
    for ((i1, i2), inlier) in pairs.iter().zip(&refined.inliers) {
        if *inlier {
            current_matches[*i1] = candidate.get_map_point(*i2);
        }
    }

    let scw = refined.s12.compose(&Sim3::from_se3(&candidate.pose_cw()));

    let mut loop_kfs = vec![candidate.id];
    loop_kfs.extend(candidate.get_covisibles().copied());
    let mut loop_map_points: Vec<MapPointId> = map.get_map_points_from_keyframes(&loop_kfs).into_iter().collect();
    loop_map_points.sort_unstable();

    let added = search_by_projection_sim3(
        map,
        current,
        &scw,
        &loop_map_points,
        &mut current_matches,
        camera,
        config.projection_radius,
    );

    let verified = VerifiedLoop {
        current_kf_id: current.id,
        loop_kf_id: candidate.id,
        s12: refined.s12,
        scw,
        current_matches,
        loop_map_points,
    };
    let total = verified.num_matches();
    if total < config.min_loop_matches {
        debug!(
            "[LoopClosing] {} -> {}: {} loop matches ({} from projection)",
            current.id, candidate.id, total, added
        );
        return None;
    }
    Some(verified)
}

/// Match the map points of two keyframes. Returns `(kf1 feature, kf2 feature)`
/// pairs where both features carry a map point.
pub fn search_by_bow_keyframes(map: &Map, kf1: &KeyFrame, kf2: &KeyFrame, params: &MatchParams) -> Vec<(usize, usize)> {
    let has_point = |kf: &KeyFrame, i: usize| {
        kf.get_map_point(i)
            .and_then(|id| map.get_map_point(id))
            .map_or(false, |mp| !mp.is_bad)
    };

    match (kf1.feature_vector(), kf2.feature_vector()) {
        (Some(fv1), Some(fv2)) => {
            let angles1: Vec<f32> = kf1.keypoints.iter().map(|kp| kp.angle).collect();
            let angles2: Vec<f32> = kf2.keypoints.iter().map(|kp| kp.angle).collect();
            match_by_feature_vector(
                &kf1.descriptors,
                fv1,
                |i| has_point(kf1, i),
                &kf2.descriptors,
                fv2,
                |i| has_point(kf2, i),
                params,
                Some((angles1.as_slice(), angles2.as_slice())),
            )
            .into_iter()
            .map(|m| (m.query_idx, m.train_idx))
            .collect()
        }
        _ => {
            let (idx1, desc1): (Vec<usize>, Vec<_>) = (0..kf1.num_features())
                .filter(|&i| has_point(kf1, i))
                .map(|i| (i, kf1.descriptors[i]))
                .unzip();
            let (idx2, desc2): (Vec<usize>, Vec<_>) = (0..kf2.num_features())
                .filter(|&i| has_point(kf2, i))
                .map(|i| (i, kf2.descriptors[i]))
                .unzip();
            match_symmetric(&desc1, &desc2, params)
                .into_iter()
                .map(|m| (idx1[m.query_idx], idx2[m.train_idx]))
                .collect()
        }
    }
}

/// Correspondences of the matched pairs, together with the pairs they were
/// built from (pairs whose map point vanished are dropped).
fn build_correspondences(
    map: &Map,
    kf1: &KeyFrame,
    kf2: &KeyFrame,
    pairs: &[(usize, usize)],
) -> (Vec<(usize, usize)>, Vec<Sim3Correspondence>) {
    let pyramid = map.pyramid();
    let (pose1, pose2) = (kf1.pose_cw(), kf2.pose_cw());
    pairs
        .iter()
        .filter_map(|&(i1, i2)| {
            let mp1 = map.get_map_point(kf1.get_map_point(i1)?)?;
            let mp2 = map.get_map_point(kf2.get_map_point(i2)?)?;
            let (kp1, kp2) = (&kf1.keypoints[i1], &kf2.keypoints[i2]);
            let correspondence = Sim3Correspondence {
                p1_cam: pose1.transform_point(&mp1.position),
                p2_cam: pose2.transform_point(&mp2.position),
                uv1: kp1.pt(),
                uv2: kp2.pt(),
                inv_sigma2_1: pyramid.inv_sigma2(kp1.octave),
                inv_sigma2_2: pyramid.inv_sigma2(kp2.octave),
            };
            Some(((i1, i2), correspondence))
        })
        .unzip()
}

/// Best unmatched feature of `target` around `uv` for `desc`.
fn best_in_area(
    target: &KeyFrame,
    uv: (f64, f64),
    radius: f64,
    desc: &Descriptor,
    taken: &HashSet<usize>,
    levels: Option<(u8, u8)>,
    max_distance: u32,
) -> Option<usize> {
    target
        .get_features_in_area(uv.0, uv.1, radius, levels)
        .into_iter()
        .filter(|i| !taken.contains(i))
        .map(|i| (i, hamming(desc, &target.descriptors[i])))
        .filter(|&(_, d)| d <= max_distance)
        .min_by_key(|&(_, d)| d)
        .map(|(i, _)| i)
}

/// Guided matching through `s12` in both directions; only pairs found from
/// both sides are returned. `matched` pairs are left out of the search.
fn search_by_sim3(
    map: &Map,
    kf1: &KeyFrame,
    kf2: &KeyFrame,
    s12: &Sim3,
    matched: &[(usize, usize)],
    camera: &CameraModel,
    radius: f64,
) -> Vec<(usize, usize)> {
    let pyramid = map.pyramid();
    let taken1: HashSet<usize> = matched.iter().map(|m| m.0).collect();
    let taken2: HashSet<usize> = matched.iter().map(|m| m.1).collect();
    let s21 = s12.inverse();
    let (pose1, pose2) = (kf1.pose_cw(), kf2.pose_cw());

    let project_side = |from: &KeyFrame,
                        from_pose: &SE3,
                        to: &KeyFrame,
                        s: &Sim3,
                        taken_from: &HashSet<usize>,
                        taken_to: &HashSet<usize>|
     -> Vec<(usize, usize)> {
        let mut out = Vec::new();
        for (i, mp_id) in from.get_map_point_indices() {
            if taken_from.contains(&i) {
                continue;
            }
            let Some(mp) = map.get_map_point(mp_id).filter(|mp| !mp.is_bad) else {
                continue;
            };
            if mp.observations.contains_key(&to.id) {
                continue;
            }
            let p = s.transform_point(&from_pose.transform_point(&mp.position));
            let Some(uv) = camera.project(&p) else {
                continue;
            };
            if !camera.is_in_image(&uv) {
                continue;
            }
            let r = radius * pyramid.scale(from.keypoints[i].octave);
            if let Some(j) = best_in_area(to, (uv.x, uv.y), r, &mp.descriptor, taken_to, None, TH_HIGH) {
                out.push((i, j));
            }
        }
        out
    };

    let forward = project_side(kf2, &pose2, kf1, s12, &taken2, &taken1);
    let backward: HashSet<(usize, usize)> = project_side(kf1, &pose1, kf2, &s21, &taken1, &taken2)
        .into_iter()
        .collect();

    forward
        .into_iter()
        .filter(|&(i2, i1)| backward.contains(&(i1, i2)))
        .map(|(i2, i1)| (i1, i2))
        .collect()
}

/// Project loop map points into `kf` with `scw` and fill unmatched features.
/// Returns the number of new matches.
fn search_by_projection_sim3(
    map: &Map,
    kf: &KeyFrame,
    scw: &Sim3,
    mp_ids: &[MapPointId],
    matches: &mut [Option<MapPointId>],
    camera: &CameraModel,
    radius: f64,
) -> usize {
    let pyramid = map.pyramid();
    let pose = scw.to_se3_normalized();
    let already: HashSet<MapPointId> = matches.iter().flatten().copied().collect();
    let mut taken: HashSet<usize> = matches
        .iter()
        .enumerate()
        .filter(|(_, m)| m.is_some())
        .map(|(i, _)| i)
        .collect();

    let mut added = 0;
    for &mp_id in mp_ids {
        if already.contains(&mp_id) {
            continue;
        }
        let Some(mp) = map.get_map_point(mp_id).filter(|mp| !mp.is_bad) else {
            continue;
        };
        let Some(proj) = mp.project_into(&pose, camera, pyramid, 0.0) else {
            continue;
        };
        let level = proj.predicted_level;
        let r = radius * pyramid.scale(level);
        let levels = Some((level.saturating_sub(1), level));
        if let Some(i) = best_in_area(kf, (proj.uv.x, proj.uv.y), r, &mp.descriptor, &taken, levels, TH_LOW) {
            matches[i] = Some(mp_id);
            taken.insert(i);
            added += 1;
        }
    }
    added
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::tracking::matching::tests::{camera, landmarks, observe};
    use approx::assert_relative_eq;
    use nalgebra::{UnitQuaternion, Vector3};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    pub(crate) fn pose_cw_at(x: f64) -> SE3 {
        SE3 {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::new(-x, 0.0, 0.0),
        }
    }

    /// Add keyframes at `pose_cws` observing `lms`, with map points placed
    /// through `world` (true world → map frame).
    pub(crate) fn add_place(
        map: &mut Map,
        pose_cws: &[SE3],
        lms: &[(Vector3<f64>, Descriptor)],
        world: &Sim3,
    ) -> Vec<KeyFrameId> {
        let world_inv = world.inverse();
        let mut kfs = Vec::new();
        let mut features = Vec::new();
        for pose_cw in pose_cws {
            let (fs, ids) = observe(pose_cw, lms);
            // Pose in the map frame: T'_cw = s · T_cw · W⁻¹.
            let scaled = Sim3 {
                rotation: UnitQuaternion::identity(),
                translation: Vector3::zeros(),
                scale: world.scale,
            };
            let pose_map = scaled
                .compose(&Sim3::from_se3(pose_cw))
                .compose(&world_inv)
                .to_se3_normalized();
            let id = map.create_keyframe(map.num_keyframes() as u64, 0.0, pose_map.inverse(), fs, (640, 480));
            kfs.push(id);
            features.push(ids);
        }
        for (lm_idx, (p, d)) in lms.iter().enumerate() {
            let observers: Vec<(KeyFrameId, usize)> = kfs
                .iter()
                .zip(&features)
                .filter_map(|(kf, ids)| ids.iter().position(|&i| i == lm_idx).map(|f| (*kf, f)))
                .collect();
            if observers.len() < 2 {
                continue;
            }
            let mp = map.create_map_point(world.transform_point(p), *d, observers[0].0);
            for (kf, f) in observers {
                map.associate(kf, f, mp);
            }
            map.update_map_point_normal_and_depth(mp);
        }
        for &kf in &kfs {
            map.update_connections(kf);
        }
        kfs
    }

    pub(crate) fn drift() -> Sim3 {
        Sim3 {
            rotation: UnitQuaternion::from_euler_angles(0.0, 0.05, 0.01),
            translation: Vector3::new(0.4, -0.1, 0.2),
            scale: 1.25,
        }
    }

    #[test]
    fn test_verifies_revisited_place_with_scale_drift() {
        let lms = landmarks(150, 21);
        let mut map = Map::default();
        let places = [pose_cw_at(0.0), pose_cw_at(0.3)];
        let loop_kfs = add_place(&mut map, &places, &lms, &Sim3::identity());
        let current_kfs = add_place(&mut map, &places, &lms, &drift());

        let mut rng = StdRng::seed_from_u64(3);
        let verified = verify_loop_candidates(
            &map,
            current_kfs[1],
            &[loop_kfs[1]],
            &camera(),
            &LoopVerifierConfig::default(),
            &mut rng,
        )
        .unwrap();

        assert_eq!(verified.loop_kf_id, loop_kfs[1]);
        assert!(verified.num_matches() >= 40);
        assert_relative_eq!(verified.s12.scale, drift().scale, epsilon = 1e-3);
        // scw maps loop-frame points onto the drifted camera of the current keyframe.
        let current = map.get_keyframe(current_kfs[1]).unwrap();
        for (i, mp_id) in verified.current_matches.iter().enumerate() {
            let Some(mp_id) = mp_id else { continue };
            let p = verified.scw.transform_point(&map.get_map_point(*mp_id).unwrap().position);
            let uv = camera().project(&p).unwrap();
            assert!((uv - current.keypoints[i].pt()).norm() < 1.0);
        }
    }

    #[test]
    fn test_rejects_unrelated_place() {
        let mut map = Map::default();
        let places = [pose_cw_at(0.0), pose_cw_at(0.3)];
        let loop_kfs = add_place(&mut map, &places, &landmarks(150, 1), &Sim3::identity());
        let current_kfs = add_place(&mut map, &places, &landmarks(150, 2), &drift());

        let mut rng = StdRng::seed_from_u64(3);
        let verified = verify_loop_candidates(
            &map,
            current_kfs[1],
            &[loop_kfs[0], loop_kfs[1]],
            &camera(),
            &LoopVerifierConfig::default(),
            &mut rng,
        );
        assert!(verified.is_none());
    }
}
