//! Monocular map initialization from two views.
//!
//! The first frame with enough features becomes the reference. Later frames
//! are matched against it; once the two-view reconstruction succeeds, the
//! initial map is built from both frames, refined by a global BA and scaled
//! so that the median scene depth seen from the first KeyFrame is one.

use nalgebra::Vector2;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::debug;

use crate::atlas::map::{KeyFrameId, Map};
use crate::config::TrackingSettings;
use crate::geometry::{reconstruct_two_view, CameraModel, TwoViewFailure, TwoViewParams, TwoViewReconstruction, SE3};
use crate::tracking::frame::Frame;
use crate::tracking::matching::search_for_initialization;

/// Search window around the reference keypoint, in pixels.
const INIT_SEARCH_WINDOW: f64 = 100.0;

#[derive(Debug, Clone)]
pub struct InitializerConfig {
    pub min_features: usize,
    pub min_matches: usize,
    pub nn_ratio: f32,
    pub two_view: TwoViewParams,
}

impl InitializerConfig {
    pub fn from_settings(settings: &TrackingSettings) -> Self {
        Self {
            min_features: settings.init_min_features,
            min_matches: settings.init_min_matches,
            nn_ratio: settings.nn_ratio,
            two_view: TwoViewParams {
                ransac_iterations: settings.init_ransac_iterations,
                sigma: 1.0,
                min_parallax_deg: settings.init_min_parallax_deg,
                min_triangulated: settings.init_min_triangulated,
            },
        }
    }
}

impl Default for InitializerConfig {
    fn default() -> Self {
        Self::from_settings(&TrackingSettings::default())
    }
}

/// Two views that reconstructed successfully.
#[derive(Debug, Clone)]
pub struct TwoViewInit {
    pub reference: Frame,
    /// `(reference feature, current feature)` per triangulated point.
    pub matches: Vec<(usize, usize)>,
    pub reconstruction: TwoViewReconstruction,
}

/// What a frame did to the initializer.
#[derive(Debug, Clone)]
pub enum InitAttempt {
    /// Too few features to be used.
    TooFewFeatures(usize),
    /// The frame became the new reference.
    ReferenceSet,
    /// Too few matches to the reference; the frame replaced it.
    TooFewMatches(usize),
    /// Matched, but the geometry was not good enough yet.
    Rejected(TwoViewFailure),
    Reconstructed(Box<TwoViewInit>),
}

/// Reference-frame bookkeeping for two-view initialization.
pub struct Initializer {
    config: InitializerConfig,
    reference: Option<Frame>,
    /// Last matched position of every reference keypoint.
    prev_matched: Vec<Vector2<f64>>,
    rng: StdRng,
}

impl Initializer {
    pub fn new(config: InitializerConfig, seed: u64) -> Self {
        Self {
            config,
            reference: None,
            prev_matched: Vec::new(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn has_reference(&self) -> bool {
        self.reference.is_some()
    }

    pub fn reset(&mut self) {
        self.reference = None;
        self.prev_matched.clear();
    }

    fn set_reference(&mut self, frame: &Frame) {
        self.prev_matched = frame.keypoints.iter().map(|kp| kp.pt()).collect();
        self.reference = Some(frame.clone());
    }

    /// Feed a frame to the initializer.
    pub fn process(&mut self, frame: &Frame, camera: &CameraModel) -> InitAttempt {
        if frame.num_features() <= self.config.min_features {
            return InitAttempt::TooFewFeatures(frame.num_features());
        }
        let Some(reference) = self.reference.as_ref() else {
            self.set_reference(frame);
            return InitAttempt::ReferenceSet;
        };

        let (matches12, n_matches) = search_for_initialization(
            reference,
            frame,
            &mut self.prev_matched,
            INIT_SEARCH_WINDOW,
            self.config.nn_ratio,
        );
        if n_matches < self.config.min_matches {
            debug!("[Init] {} matches to the reference, replacing it", n_matches);
            self.set_reference(frame);
            return InitAttempt::TooFewMatches(n_matches);
        }

        let pairs: Vec<(usize, usize)> = matches12
            .iter()
            .enumerate()
            .filter_map(|(i1, m)| m.map(|i2| (i1, i2)))
            .collect();
        let pixels1: Vec<Vector2<f64>> = pairs.iter().map(|&(i1, _)| reference.keypoints[i1].pt()).collect();
        let pixels2: Vec<Vector2<f64>> = pairs.iter().map(|&(_, i2)| frame.keypoints[i2].pt()).collect();

        match reconstruct_two_view(&pixels1, &pixels2, camera, &self.config.two_view, &mut self.rng) {
            Ok(reconstruction) => {
                let matches = pairs
                    .iter()
                    .zip(&reconstruction.points)
                    .filter(|(_, p)| p.is_some())
                    .map(|(&m, _)| m)
                    .collect();
                let init = TwoViewInit {
                    reference: reference.clone(),
                    matches,
                    reconstruction,
                };
                self.reset();
                InitAttempt::Reconstructed(Box::new(init))
            }
            Err(failure) => {
                debug!("[Init] {} matches, reconstruction failed: {:?}", n_matches, failure);
                InitAttempt::Rejected(failure)
            }
        }
    }
}

/// Insert the two initial KeyFrames and their triangulated points.
///
/// The reference KeyFrame sits at the world origin. Returns the two
/// KeyFrame ids (reference, current).
pub fn create_initial_map(map: &mut Map, init: &TwoViewInit, current: &Frame, camera: &CameraModel) -> (KeyFrameId, KeyFrameId) {
    let image_size = (camera.width, camera.height);
    let reference = &init.reference;
    let kf1 = map.create_keyframe(
        reference.id,
        reference.timestamp,
        SE3::identity(),
        reference.undistorted_features(),
        image_size,
    );
    let kf2 = map.create_keyframe(
        current.id,
        current.timestamp,
        init.reconstruction.pose2_cw.inverse(),
        current.undistorted_features(),
        image_size,
    );

    let points = init.reconstruction.points.iter().flatten();
    for (&(i1, i2), position) in init.matches.iter().zip(points) {
        let mp = map.create_map_point(*position, reference.descriptors[i1], kf1);
        map.associate(kf1, i1, mp);
        map.associate(kf2, i2, mp);
        map.compute_distinctive_descriptor(mp);
        map.update_map_point_normal_and_depth(mp);
    }
    map.update_connections(kf1);
    map.update_connections(kf2);
    (kf1, kf2)
}

/// Why a freshly built initial map was discarded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InitMapRejection {
    NonPositiveMedianDepth(f64),
    TooFewTracked(usize),
}

/// Scale the initial map so the median depth seen from `kf1` is one.
///
/// Rejects maps whose second KeyFrame tracks fewer than `min_tracked`
/// points. Returns the applied scale factor.
pub fn normalize_initial_map(map: &mut Map, kf1: KeyFrameId, kf2: KeyFrameId, min_tracked: usize) -> Result<f64, InitMapRejection> {
    let tracked = map.tracked_map_points(kf2, 1);
    if tracked < min_tracked {
        return Err(InitMapRejection::TooFewTracked(tracked));
    }
    let Some(kf) = map.get_keyframe(kf1) else {
        return Err(InitMapRejection::TooFewTracked(0));
    };
    let pose1_cw = kf.pose_cw();
    let mut depths: Vec<f64> = kf
        .get_map_point_indices()
        .filter_map(|(_, id)| map.get_map_point(id))
        .map(|mp| pose1_cw.transform_point(&mp.position).z)
        .collect();
    depths.sort_by(|a, b| a.total_cmp(b));
    let median = depths.get((depths.len().saturating_sub(1)) / 2).copied().unwrap_or(0.0);
    if !(median > 0.0) {
        return Err(InitMapRejection::NonPositiveMedianDepth(median));
    }

    let scale = 1.0 / median;
    for kf_id in [kf1, kf2] {
        if let Some(kf) = map.get_keyframe_mut(kf_id) {
            let mut pose_cw = kf.pose_cw();
            pose_cw.translation *= scale;
            kf.set_pose_cw(&pose_cw);
        }
    }
    let mp_ids: Vec<_> = map.map_point_ids().copied().collect();
    for id in mp_ids {
        if let Some(mp) = map.get_map_point_mut(id) {
            mp.position *= scale;
        }
        map.update_map_point_normal_and_depth(id);
    }
    Ok(scale)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracking::matching::tests::{camera, landmarks, observe};
    use approx::assert_relative_eq;
    use nalgebra::{UnitQuaternion, Vector3};

    fn pose(x: f64) -> SE3 {
        SE3 {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::new(-x, 0.0, 0.0),
        }
    }

    fn config() -> InitializerConfig {
        InitializerConfig {
            min_features: 50,
            min_matches: 50,
            ..Default::default()
        }
    }

    fn frame(id: u64, x: f64, lms: &[(Vector3<f64>, crate::features::Descriptor)]) -> Frame {
        let (fs, _) = observe(&pose(x), lms);
        Frame::new(id, id as f64 * 0.1, fs, &camera())
    }

    #[test]
    fn test_reference_then_low_parallax_then_success() {
        let lms = landmarks(150, 21);
        let mut init = Initializer::new(config(), 1);
        assert!(matches!(init.process(&frame(0, 0.0, &lms), &camera()), InitAttempt::ReferenceSet));
        // A tiny baseline leaves the parallax too low; the reference is kept.
        assert!(matches!(
            init.process(&frame(1, 0.005, &lms), &camera()),
            InitAttempt::Rejected(_)
        ));
        assert!(init.has_reference());

        let current = frame(2, 0.4, &lms);
        let InitAttempt::Reconstructed(result) = init.process(&current, &camera()) else {
            panic!("expected a reconstruction");
        };
        assert!(!init.has_reference());
        assert!(result.matches.len() >= 50);

        let mut map = Map::default();
        let (kf1, kf2) = create_initial_map(&mut map, &result, &current, &camera());
        assert_eq!(map.num_keyframes(), 2);
        assert_eq!(map.num_map_points(), result.matches.len());
        assert_eq!(map.get_keyframe(kf2).unwrap().parent_id, Some(kf1));

        let scale = normalize_initial_map(&mut map, kf1, kf2, 50).unwrap();
        assert!(scale > 0.0);
        let mut depths: Vec<f64> = map.map_points().map(|mp| mp.position.z).collect();
        depths.sort_by(|a, b| a.total_cmp(b));
        assert_relative_eq!(depths[(depths.len() - 1) / 2], 1.0, epsilon = 1e-9);
        // Direction of travel is preserved.
        let center = map.get_keyframe(kf2).unwrap().camera_center();
        assert!(center.x > 0.0);
        assert!(center.y.abs() < 0.05 * center.x);
    }

    #[test]
    fn test_too_few_features() {
        let lms = landmarks(20, 3);
        let mut init = Initializer::new(config(), 1);
        assert!(matches!(init.process(&frame(0, 0.0, &lms), &camera()), InitAttempt::TooFewFeatures(20)));
        assert!(!init.has_reference());
    }

    #[test]
    fn test_unrelated_frame_replaces_reference() {
        let mut init = Initializer::new(config(), 1);
        init.process(&frame(0, 0.0, &landmarks(100, 4)), &camera());
        let attempt = init.process(&frame(1, 0.0, &landmarks(100, 5)), &camera());
        assert!(matches!(attempt, InitAttempt::TooFewMatches(_)));
        assert!(init.has_reference());
    }
}
