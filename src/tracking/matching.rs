//! Guided descriptor searches used by the tracker.
//!
//! All searches write their result into the current [`Frame`]'s map point
//! associations or return explicit index pairs; none of them touch the map.

use std::collections::HashSet;

use nalgebra::Vector2;

use crate::atlas::map::{KeyFrame, Map, MapPointId};
use crate::features::matcher::{match_by_feature_vector, RotationHistogram};
use crate::features::{hamming, match_symmetric, MatchParams, TH_HIGH, TH_LOW};
use crate::geometry::CameraModel;
use crate::tracking::frame::Frame;

/// Match the reference frame of the initializer against a later frame.
///
/// Each level-matched keypoint of `f1` is searched in a `window` around
/// `prev_matched[i]` (its position in the last attempt, or its own position).
/// Conflicts keep the better match; a rotation-consistency check follows.
/// `prev_matched` is updated with the new positions. Returns, per feature of
/// `f1`, the matched feature of `f2`, and the number of matches.
pub fn search_for_initialization(
    f1: &Frame,
    f2: &Frame,
    prev_matched: &mut [Vector2<f64>],
    window: f64,
    nn_ratio: f32,
) -> (Vec<Option<usize>>, usize) {
    let mut matches12: Vec<Option<usize>> = vec![None; f1.num_features()];
    let mut matched21: Vec<Option<(usize, u32)>> = vec![None; f2.num_features()];
    let mut n_matches = 0usize;

    for (i1, kp1) in f1.keypoints.iter().enumerate() {
        let center = prev_matched[i1];
        let candidates = f2.features_in_area(center.x, center.y, window, Some((kp1.octave, kp1.octave)));
        let d1 = &f1.descriptors[i1];

        let mut best = u32::MAX;
        let mut second = u32::MAX;
        let mut best_idx = None;
        for i2 in candidates {
            let dist = hamming(d1, &f2.descriptors[i2]);
            if let Some((_, existing)) = matched21[i2] {
                if existing <= dist {
                    continue;
                }
            }
            if dist < best {
                second = best;
                best = dist;
                best_idx = Some(i2);
            } else if dist < second {
                second = dist;
            }
        }

        let Some(i2) = best_idx else { continue };
        if best > TH_LOW || (second != u32::MAX && best as f32 >= nn_ratio * second as f32) {
            continue;
        }
        if let Some((prev_i1, _)) = matched21[i2] {
            matches12[prev_i1] = None;
            n_matches -= 1;
        }
        matches12[i1] = Some(i2);
        matched21[i2] = Some((i1, best));
        n_matches += 1;
    }

    let mut hist = RotationHistogram::new();
    for (i1, m) in matches12.iter().enumerate() {
        if let Some(i2) = m {
            hist.add(f1.keypoints[i1].angle, f2.keypoints[*i2].angle, i1);
        }
    }
    for i1 in hist.inconsistent() {
        if matches12[i1].take().is_some() {
            n_matches -= 1;
        }
    }

    for (i1, m) in matches12.iter().enumerate() {
        if let Some(i2) = m {
            prev_matched[i1] = f2.keypoints[*i2].pt();
        }
    }
    (matches12, n_matches)
}

/// Project the map points tracked in `last` into `current` (whose pose must be
/// set) and match them within `th` pixels scaled by the keypoint's octave.
/// Returns the number of new associations.
pub fn search_by_projection_last_frame(
    current: &mut Frame,
    last: &Frame,
    map: &Map,
    camera: &CameraModel,
    th: f64,
    check_orientation: bool,
) -> usize {
    let Some(pose_cw) = current.pose_cw.clone() else {
        return 0;
    };
    let pyramid = map.pyramid();
    let mut hist = RotationHistogram::new();
    let mut n_matches = 0usize;

    for (i, mp_id) in last.map_points.iter().enumerate() {
        if last.outliers[i] {
            continue;
        }
        let Some(mp_id) = mp_id.and_then(|id| map.resolve_map_point(id)) else {
            continue;
        };
        let Some(mp) = map.get_map_point(mp_id) else { continue };
        if mp.is_bad {
            continue;
        }
        let Some(uv) = camera.project(&pose_cw.transform_point(&mp.position)) else {
            continue;
        };
        if !camera.is_in_image(&uv) {
            continue;
        }

        let octave = last.keypoints[i].octave;
        let radius = th * pyramid.scale(octave);
        let levels = (octave.saturating_sub(1), octave.saturating_add(1));
        let mut best = u32::MAX;
        let mut best_idx = None;
        for c in current.features_in_area(uv.x, uv.y, radius, Some(levels)) {
            if current.map_points[c].is_some() {
                continue;
            }
            let dist = hamming(&mp.descriptor, &current.descriptors[c]);
            if dist < best {
                best = dist;
                best_idx = Some(c);
            }
        }
        if let Some(c) = best_idx {
            if best <= TH_HIGH {
                current.map_points[c] = Some(mp_id);
                n_matches += 1;
                if check_orientation {
                    hist.add(last.keypoints[i].angle, current.keypoints[c].angle, c);
                }
            }
        }
    }

    if check_orientation {
        for c in hist.inconsistent() {
            if current.map_points[c].take().is_some() {
                n_matches -= 1;
            }
        }
    }
    n_matches
}

/// Project the map points of a KeyFrame not in `already_found` into `frame`
/// (pose set) and match them within `th` pixels scaled by the predicted
/// octave, accepting distances up to `max_distance`. Used by relocalization
/// to recover more points once a first pose is known.
pub fn search_by_projection_keyframe(
    frame: &mut Frame,
    kf: &KeyFrame,
    map: &Map,
    camera: &CameraModel,
    already_found: &HashSet<MapPointId>,
    th: f64,
    max_distance: u32,
) -> usize {
    let Some(pose_cw) = frame.pose_cw.clone() else {
        return 0;
    };
    let pyramid = map.pyramid();
    let mut hist = RotationHistogram::new();
    let mut n_matches = 0usize;

    for (kf_idx, mp_id) in kf.get_map_point_indices() {
        if already_found.contains(&mp_id) {
            continue;
        }
        let Some(mp) = map.get_map_point(mp_id) else { continue };
        if mp.is_bad {
            continue;
        }
        let Some(projected) = mp.project_into(&pose_cw, camera, pyramid, 0.0) else {
            continue;
        };
        let level = projected.predicted_level;
        let radius = th * pyramid.scale(level);
        let levels = (level.saturating_sub(1), level.saturating_add(1));

        let mut best = u32::MAX;
        let mut best_idx = None;
        for c in frame.features_in_area(projected.uv.x, projected.uv.y, radius, Some(levels)) {
            if frame.map_points[c].is_some() {
                continue;
            }
            let dist = hamming(&mp.descriptor, &frame.descriptors[c]);
            if dist < best {
                best = dist;
                best_idx = Some(c);
            }
        }
        if let Some(c) = best_idx {
            if best <= max_distance {
                frame.map_points[c] = Some(mp_id);
                n_matches += 1;
                hist.add(kf.keypoints[kf_idx].angle, frame.keypoints[c].angle, c);
            }
        }
    }

    for c in hist.inconsistent() {
        if frame.map_points[c].take().is_some() {
            n_matches -= 1;
        }
    }
    n_matches
}

/// Match a frame against the map points of a KeyFrame.
///
/// Uses the shared vocabulary nodes when both sides have a feature vector,
/// otherwise falls back to brute-force symmetric matching. Returns
/// `(frame feature index, map point)` pairs.
pub fn search_by_bow_keyframe(kf: &KeyFrame, frame: &Frame, map: &Map, params: &MatchParams) -> Vec<(usize, MapPointId)> {
    let usable = |i: usize| -> Option<MapPointId> {
        let id = kf.get_map_point(i)?;
        map.get_map_point(id).filter(|mp| !mp.is_bad).map(|mp| mp.id)
    };

    match (kf.feature_vector(), frame.feature_vector()) {
        (Some(fv_kf), Some(fv_frame)) => {
            let kf_angles: Vec<f32> = kf.keypoints.iter().map(|kp| kp.angle).collect();
            let frame_angles = frame.keypoint_angles();
            match_by_feature_vector(
                &kf.descriptors,
                fv_kf,
                |i| usable(i).is_some(),
                &frame.descriptors,
                fv_frame,
                |_| true,
                params,
                Some((kf_angles.as_slice(), frame_angles.as_slice())),
            )
            .into_iter()
            .filter_map(|m| usable(m.query_idx).map(|mp| (m.train_idx, mp)))
            .collect()
        }
        _ => {
            let (indices, descriptors): (Vec<usize>, Vec<_>) = (0..kf.num_features())
                .filter(|&i| usable(i).is_some())
                .map(|i| (i, kf.descriptors[i]))
                .unzip();
            match_symmetric(&descriptors, &frame.descriptors, params)
                .into_iter()
                .filter_map(|m| usable(indices[m.query_idx]).map(|mp| (m.train_idx, mp)))
                .collect()
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::features::{Descriptor, FeatureSet, KeyPoint};
    use crate::geometry::SE3;
    use nalgebra::{UnitQuaternion, Vector3};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    pub(crate) fn camera() -> CameraModel {
        CameraModel::pinhole(500.0, 500.0, 320.0, 240.0, 640, 480)
    }

    pub(crate) fn random_descriptor(rng: &mut StdRng) -> Descriptor {
        let mut bytes = [0u8; 32];
        rng.fill(&mut bytes);
        Descriptor(bytes)
    }

    /// Landmarks in front of the origin camera, with one descriptor each.
    pub(crate) fn landmarks(n: usize, seed: u64) -> Vec<(Vector3<f64>, Descriptor)> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|_| {
                let p = Vector3::new(rng.gen_range(-2.0..2.0), rng.gen_range(-1.5..1.5), rng.gen_range(4.0..8.0));
                (p, random_descriptor(&mut rng))
            })
            .collect()
    }

    /// Features of the landmarks seen from `pose_cw`, in landmark order
    /// (invisible landmarks skipped). Also returns the landmark index per feature.
    pub(crate) fn observe(pose_cw: &SE3, lms: &[(Vector3<f64>, Descriptor)]) -> (FeatureSet, Vec<usize>) {
        let cam = camera();
        let mut kps = Vec::new();
        let mut descs = Vec::new();
        let mut ids = Vec::new();
        for (i, (p, d)) in lms.iter().enumerate() {
            if let Some(uv) = cam.project(&pose_cw.transform_point(p)) {
                if cam.is_in_image(&uv) {
                    kps.push(KeyPoint::new(uv.x, uv.y));
                    descs.push(*d);
                    ids.push(i);
                }
            }
        }
        (FeatureSet::new(kps, descs), ids)
    }

    fn shifted(dx: f64) -> SE3 {
        SE3 {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::new(-dx, 0.0, 0.0),
        }
    }

    #[test]
    fn test_search_for_initialization_finds_shifted_features() {
        let lms = landmarks(100, 1);
        let (fs1, ids1) = observe(&SE3::identity(), &lms);
        let (fs2, ids2) = observe(&shifted(0.05), &lms);
        let f1 = Frame::new(0, 0.0, fs1, &camera());
        let f2 = Frame::new(1, 0.1, fs2, &camera());
        let mut prev: Vec<Vector2<f64>> = f1.keypoints.iter().map(|kp| kp.pt()).collect();

        let (matches, n) = search_for_initialization(&f1, &f2, &mut prev, 100.0, 0.9);
        assert!(n > 80);
        for (i1, m) in matches.iter().enumerate() {
            if let Some(i2) = m {
                assert_eq!(ids1[i1], ids2[*i2]);
                assert_eq!(prev[i1], f2.keypoints[*i2].pt());
            }
        }
    }

    #[test]
    fn test_projection_from_last_frame() {
        let lms = landmarks(80, 2);
        let mut map = Map::default();
        let (fs1, ids1) = observe(&SE3::identity(), &lms);
        let kf = map.create_keyframe(0, 0.0, SE3::identity(), fs1.clone(), (640, 480));
        let mut last = Frame::new(0, 0.0, fs1, &camera());
        for (i, &lm) in ids1.iter().enumerate() {
            let id = map.create_map_point(lms[lm].0, lms[lm].1, kf);
            last.map_points[i] = Some(id);
        }

        let pose2 = shifted(0.04);
        let (fs2, ids2) = observe(&pose2, &lms);
        let mut current = Frame::new(1, 0.1, fs2, &camera());
        current.pose_cw = Some(pose2);
        let n = search_by_projection_last_frame(&mut current, &last, &map, &camera(), 7.0, true);
        assert!(n > 60);
        for (i, mp) in current.map_points.iter().enumerate() {
            if let Some(mp) = mp {
                assert_eq!(map.get_map_point(*mp).unwrap().position, lms[ids2[i]].0);
            }
        }
    }

    #[test]
    fn test_bow_search_brute_force_fallback() {
        let lms = landmarks(60, 3);
        let mut map = Map::default();
        let (fs1, ids1) = observe(&SE3::identity(), &lms);
        let kf_id = map.create_keyframe(0, 0.0, SE3::identity(), fs1, (640, 480));
        // Only the first half of the KeyFrame's features carry map points.
        for (i, &lm) in ids1.iter().enumerate().take(ids1.len() / 2) {
            let mp = map.create_map_point(lms[lm].0, lms[lm].1, kf_id);
            map.associate(kf_id, i, mp);
        }

        let (fs2, ids2) = observe(&shifted(0.1), &lms);
        let frame = Frame::new(1, 0.1, fs2, &camera());
        let kf = map.get_keyframe(kf_id).unwrap();
        let pairs = search_by_bow_keyframe(kf, &frame, &map, &MatchParams { max_distance: TH_LOW, ratio: 0.75 });
        assert!(!pairs.is_empty());
        assert!(pairs.len() <= ids1.len() / 2);
        for (fi, mp) in pairs {
            assert_eq!(map.get_map_point(mp).unwrap().position, lms[ids2[fi]].0);
        }
    }
}
