//! Relocalization against the KeyFrame database.
//!
//! For every KeyFrame that shares enough words with the lost frame, BoW
//! matches give 3D-2D correspondences for a PnP RANSAC. Promising poses are
//! refined by the pose optimizer and grown with projection searches until
//! enough inliers support them.

use std::collections::HashSet;

use rand::Rng;
use tracing::{debug, info};

use crate::atlas::map::{KeyFrameId, MapPointId};
use crate::atlas::Atlas;
use crate::features::{MatchParams, TH_LOW};
use crate::geometry::{solve_pnp_ransac, CameraModel, PnPParams};
use crate::optimizer::PoseOptimizationConfig;
use crate::tracking::frame::Frame;
use crate::tracking::matching::{search_by_bow_keyframe, search_by_projection_keyframe};
use crate::tracking::pose_estimation::optimize_frame_pose;

#[derive(Debug, Clone)]
pub struct RelocalizationConfig {
    /// BoW matches a candidate needs before PnP is tried.
    pub min_bow_matches: usize,
    pub bow_ratio: f32,
    pub pnp: PnPParams,
    /// Inliers after the first optimization below which a candidate is dropped.
    pub min_optimized_inliers: usize,
    /// Inliers needed to accept the pose.
    pub min_inliers: usize,
    pub pose: PoseOptimizationConfig,
}

impl Default for RelocalizationConfig {
    fn default() -> Self {
        Self {
            min_bow_matches: 15,
            bow_ratio: 0.75,
            pnp: PnPParams::default(),
            min_optimized_inliers: 10,
            min_inliers: 50,
            pose: PoseOptimizationConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Relocalization {
    pub keyframe_id: KeyFrameId,
    pub num_inliers: usize,
}

/// Try to recover the pose of `frame` from the place-recognition database.
///
/// `frame` must already carry its BoW vectors. On success its pose and
/// inlier associations are set; on failure both are cleared.
pub fn relocalize<R: Rng + ?Sized>(
    frame: &mut Frame,
    atlas: &Atlas,
    camera: &CameraModel,
    config: &RelocalizationConfig,
    rng: &mut R,
) -> Option<Relocalization> {
    let map = &atlas.map;
    let bow = frame.bow_vector()?;
    let mut candidates = atlas.keyframe_db.detect_relocalization_candidates(map, bow);
    if candidates.is_empty() {
        debug!("[Reloc] frame {}: no candidates", frame.id);
        return None;
    }
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));

    let bow_params = MatchParams {
        max_distance: TH_LOW,
        ratio: config.bow_ratio,
    };

    for candidate in &candidates {
        let Some(kf) = map.get_keyframe(candidate.keyframe_id) else {
            continue;
        };
        if kf.is_bad {
            continue;
        }
        let matches = search_by_bow_keyframe(kf, frame, map, &bow_params);
        if matches.len() < config.min_bow_matches {
            continue;
        }

        let mut points3d = Vec::with_capacity(matches.len());
        let mut points2d = Vec::with_capacity(matches.len());
        for &(idx, mp_id) in &matches {
            if let Some(mp) = map.get_map_point(mp_id) {
                points3d.push(mp.position);
                points2d.push(frame.keypoint_uv(idx));
            }
        }
        let Some(pnp) = solve_pnp_ransac(&points3d, &points2d, camera, &config.pnp, rng) else {
            continue;
        };

        frame.clear_map_points();
        for (&(idx, mp_id), &inlier) in matches.iter().zip(&pnp.inlier_mask) {
            if inlier {
                frame.map_points[idx] = Some(mp_id);
            }
        }
        frame.pose_cw = Some(pnp.pose);

        let mut n_good = optimize_frame_pose(frame, map, camera, &config.pose);
        if n_good < config.min_optimized_inliers {
            frame.clear_map_points();
            frame.pose_cw = None;
            continue;
        }
        frame.discard_outliers();

        // Too few inliers: grow the match set by projection and retry.
        if n_good < config.min_inliers {
            let found: HashSet<MapPointId> = frame.map_points.iter().flatten().copied().collect();
            let added = search_by_projection_keyframe(frame, kf, map, camera, &found, 10.0, 100);
            if n_good + added >= config.min_inliers {
                n_good = optimize_frame_pose(frame, map, camera, &config.pose);
                if n_good > 30 && n_good < config.min_inliers {
                    let found: HashSet<MapPointId> = frame
                        .map_points
                        .iter()
                        .zip(&frame.outliers)
                        .filter(|(_, &o)| !o)
                        .filter_map(|(mp, _)| *mp)
                        .collect();
                    let added = search_by_projection_keyframe(frame, kf, map, camera, &found, 3.0, 64);
                    if n_good + added >= config.min_inliers {
                        n_good = optimize_frame_pose(frame, map, camera, &config.pose);
                    }
                }
                frame.discard_outliers();
            }
        }

        if n_good >= config.min_inliers {
            info!(
                "[Reloc] frame {} relocalized against keyframe {} with {} inliers",
                frame.id, kf.id, n_good
            );
            frame.reference_kf = Some(kf.id);
            return Some(Relocalization {
                keyframe_id: kf.id,
                num_inliers: n_good,
            });
        }
        frame.clear_map_points();
        frame.pose_cw = None;
    }

    debug!("[Reloc] frame {}: {} candidates, none accepted", frame.id, candidates.len());
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::Descriptor;
    use crate::geometry::SE3;
    use crate::tracking::matching::tests::{camera, landmarks, observe};
    use crate::vocabulary::OrbVocabulary;
    use nalgebra::{UnitQuaternion, Vector3};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn pose(x: f64, yaw: f64) -> SE3 {
        SE3 {
            rotation: UnitQuaternion::from_euler_angles(0.0, yaw, 0.0),
            translation: Vector3::new(-x, 0.0, 0.0),
        }
    }

    /// An atlas with one registered KeyFrame at the origin observing `lms`.
    fn atlas_with_keyframe(lms: &[(Vector3<f64>, Descriptor)], vocab: &OrbVocabulary) -> (Atlas, KeyFrameId) {
        let mut atlas = Atlas::default();
        let (fs, ids) = observe(&SE3::identity(), lms);
        let (bow, fv) = vocab.transform(&fs.descriptors, vocab.default_levels_up());
        let kf = atlas.map.create_keyframe(0, 0.0, SE3::identity(), fs, (640, 480));
        atlas.map.get_keyframe_mut(kf).unwrap().set_bow(bow, fv);
        for (idx, &lm) in ids.iter().enumerate() {
            let (p, d) = lms[lm];
            let mp = atlas.map.create_map_point(p, d, kf);
            atlas.map.associate(kf, idx, mp);
            atlas.map.update_map_point_normal_and_depth(mp);
        }
        atlas.register_keyframe(kf);
        (atlas, kf)
    }

    #[test]
    fn test_relocalizes_against_known_keyframe() {
        let lms = landmarks(150, 31);
        let descs: Vec<Descriptor> = lms.iter().map(|(_, d)| *d).collect();
        let vocab = OrbVocabulary::train(&descs, 4, 3, 7).unwrap();
        let (atlas, kf) = atlas_with_keyframe(&lms, &vocab);

        let truth = pose(0.3, 0.05);
        let (fs, _) = observe(&truth, &lms);
        let mut frame = Frame::new(10, 1.0, fs, &camera());
        frame.compute_bow(&vocab);

        let mut rng = StdRng::seed_from_u64(5);
        let result = relocalize(&mut frame, &atlas, &camera(), &RelocalizationConfig::default(), &mut rng).unwrap();
        assert_eq!(result.keyframe_id, kf);
        assert!(result.num_inliers >= 50);
        assert_eq!(frame.reference_kf, Some(kf));
        let estimated = frame.pose_cw.clone().unwrap();
        assert!((estimated.camera_center() - truth.camera_center()).norm() < 1e-3);
    }

    #[test]
    fn test_unknown_place_fails_and_clears_frame() {
        let descs: Vec<Descriptor> = landmarks(150, 31).iter().map(|(_, d)| *d).collect();
        let vocab = OrbVocabulary::train(&descs, 4, 3, 7).unwrap();
        let (atlas, _) = atlas_with_keyframe(&landmarks(150, 31), &vocab);

        let (fs, _) = observe(&SE3::identity(), &landmarks(150, 99));
        let mut frame = Frame::new(10, 1.0, fs, &camera());
        frame.compute_bow(&vocab);
        let mut rng = StdRng::seed_from_u64(5);
        assert!(relocalize(&mut frame, &atlas, &camera(), &RelocalizationConfig::default(), &mut rng).is_none());
        assert!(frame.pose_cw.is_none());
        assert_eq!(frame.num_tracked(), 0);
    }

    #[test]
    fn test_frame_without_bow_is_rejected() {
        let mut frame = Frame::new(0, 0.0, Default::default(), &camera());
        let mut rng = StdRng::seed_from_u64(1);
        assert!(relocalize(&mut frame, &Atlas::default(), &camera(), &RelocalizationConfig::default(), &mut rng).is_none());
    }
}
