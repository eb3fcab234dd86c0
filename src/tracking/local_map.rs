//! Track Local Map: projection-based search for map point correspondences.
//!
//! Given the current pose estimate, the local map is built from the
//! KeyFrames that share points with the frame plus their neighbourhood, and
//! its points are projected into the frame and matched.

use std::collections::{HashMap, HashSet};

use crate::atlas::map::{KeyFrameId, Map, MapPointId};
use crate::features::{hamming, TH_HIGH};
use crate::geometry::CameraModel;
use crate::tracking::frame::Frame;

/// Upper bound on the number of local KeyFrames.
const MAX_LOCAL_KEYFRAMES: usize = 80;

/// Best covisibles added per KeyFrame of the first ring.
const NEIGHBORS_PER_KEYFRAME: usize = 10;

/// Radius multiplier for points seen almost head-on.
const FRONTAL_VIEW_COS: f64 = 0.998;

/// KeyFrames and map points the frame is tracked against.
#[derive(Debug, Clone, Default)]
pub struct LocalMap {
    pub keyframes: Vec<KeyFrameId>,
    pub map_points: Vec<MapPointId>,
    /// The local KeyFrame sharing most points with the frame.
    pub reference_kf: Option<KeyFrameId>,
}

/// Outcome of [`search_local_points`].
#[derive(Debug, Clone, Default)]
pub struct LocalSearchOutcome {
    pub new_matches: usize,
    /// Points that projected inside the frame, to bump their visible counter.
    pub visible: Vec<MapPointId>,
}

/// Collect the local map of `frame`: KeyFrames observing its matched points,
/// their best covisibles, spanning-tree parents and children, and every map
/// point they observe. `fallback_kf` seeds the set when the frame has no
/// matches yet.
pub fn build_local_map(map: &Map, frame: &Frame, fallback_kf: Option<KeyFrameId>) -> LocalMap {
    let mut counts: HashMap<KeyFrameId, usize> = HashMap::new();
    for (idx, mp_id) in frame.map_points.iter().enumerate() {
        if frame.outliers[idx] {
            continue;
        }
        let Some(mp) = mp_id.and_then(|id| map.get_map_point(id)) else {
            continue;
        };
        if mp.is_bad {
            continue;
        }
        for kf_id in mp.observations.keys() {
            *counts.entry(*kf_id).or_insert(0) += 1;
        }
    }

    let mut first_ring: Vec<(KeyFrameId, usize)> = counts
        .into_iter()
        .filter(|(id, _)| map.get_keyframe(*id).map_or(false, |kf| !kf.is_bad))
        .collect();
    first_ring.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    if first_ring.is_empty() {
        if let Some(kf) = fallback_kf.filter(|id| map.get_keyframe(*id).is_some()) {
            first_ring.push((kf, 0));
        }
    }
    let reference_kf = first_ring.first().map(|(id, _)| *id);

    let mut keyframes: Vec<KeyFrameId> = first_ring.iter().map(|(id, _)| *id).collect();
    let mut included: HashSet<KeyFrameId> = keyframes.iter().copied().collect();
    let mut push = |id: KeyFrameId, keyframes: &mut Vec<KeyFrameId>| {
        if keyframes.len() < MAX_LOCAL_KEYFRAMES && map.get_keyframe(id).map_or(false, |kf| !kf.is_bad) && included.insert(id) {
            keyframes.push(id);
        }
    };

    for (kf_id, _) in &first_ring {
        if keyframes.len() >= MAX_LOCAL_KEYFRAMES {
            break;
        }
        let Some(kf) = map.get_keyframe(*kf_id) else { continue };
        for neighbor in kf.get_best_covisibles(NEIGHBORS_PER_KEYFRAME) {
            push(neighbor, &mut keyframes);
        }
        let mut children: Vec<KeyFrameId> = kf.children_ids.iter().copied().collect();
        children.sort_unstable();
        for child in children {
            push(child, &mut keyframes);
        }
        if let Some(parent) = kf.parent_id {
            push(parent, &mut keyframes);
        }
    }

    let mut map_points: Vec<MapPointId> = map.get_map_points_from_keyframes(&keyframes).into_iter().collect();
    map_points.sort_unstable();

    LocalMap {
        keyframes,
        map_points,
        reference_kf,
    }
}

/// Project the local map points not yet matched into `frame` (pose set) and
/// match them. `th` scales the search radius (larger right after a
/// relocalization); `nn_ratio` applies between candidates of the same level.
pub fn search_local_points(frame: &mut Frame, map: &Map, local: &LocalMap, camera: &CameraModel, th: f64, nn_ratio: f32) -> LocalSearchOutcome {
    let mut outcome = LocalSearchOutcome::default();
    let Some(pose_cw) = frame.pose_cw.clone() else {
        return outcome;
    };
    let pyramid = map.pyramid();

    let already: HashSet<MapPointId> = frame
        .map_points
        .iter()
        .zip(&frame.outliers)
        .filter_map(|(mp, &outlier)| mp.filter(|_| !outlier))
        .collect();
    outcome.visible.extend(already.iter().copied());

    for &mp_id in &local.map_points {
        if already.contains(&mp_id) {
            continue;
        }
        let Some(mp) = map.get_map_point(mp_id) else { continue };
        if mp.is_bad {
            continue;
        }
        let Some(projected) = mp.project_into(&pose_cw, camera, pyramid, 0.0) else {
            continue;
        };
        outcome.visible.push(mp_id);

        let level = projected.predicted_level;
        let view_factor = if projected.view_cos > FRONTAL_VIEW_COS { 2.5 } else { 4.0 };
        let radius = th * view_factor * pyramid.scale(level);
        let candidates = frame.features_in_area(projected.uv.x, projected.uv.y, radius, Some((level.saturating_sub(1), level)));

        let mut best = (u32::MAX, None::<usize>, 0u8);
        let mut second = (u32::MAX, 0u8);
        for c in candidates {
            if frame.map_points[c].is_some() && !frame.outliers[c] {
                continue;
            }
            let dist = hamming(&mp.descriptor, &frame.descriptors[c]);
            let octave = frame.keypoints[c].octave;
            if dist < best.0 {
                second = (best.0, best.2);
                best = (dist, Some(c), octave);
            } else if dist < second.0 {
                second = (dist, octave);
            }
        }

        let Some(c) = best.1 else { continue };
        if best.0 > TH_HIGH {
            continue;
        }
        if best.2 == second.1 && second.0 != u32::MAX && best.0 as f32 > nn_ratio * second.0 as f32 {
            continue;
        }
        frame.map_points[c] = Some(mp_id);
        frame.outliers[c] = false;
        outcome.new_matches += 1;
    }
    outcome
}
