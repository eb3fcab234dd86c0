//! SLAM System - Main entry point and thread orchestration.
//!
//! The `SlamSystem` is the top-level struct that users interact with.
//! It owns the shared state, runs Tracking in the caller's thread and spawns
//! the Local Mapping and Loop Closing threads.

use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver};
use tracing::{info, warn};

use crate::atlas::map::KeyFrameId;
use crate::config::{ConfigLoadError, Settings};
use crate::error::SlamError;
use crate::features::{preprocess, FeatureSet, ImageInput, OrbExtractor, ScalePyramid};
use crate::geometry::{CameraModel, SE3};
use crate::local_mapping::LocalMapper;
use crate::loop_closing::{LoopCloser, LoopCloserConfig};
use crate::tracking::{StampedPose, Tracker, TrackingResult, TrackingState};
use crate::vocabulary::OrbVocabulary;

use super::messages::NewKeyFrameMsg;
use super::shared_state::SharedState;

/// Capacity of the keyframe channel between Tracking and Local Mapping.
/// Tracking never blocks on it; a frame that finds it full is not made a keyframe.
const KEYFRAME_CHANNEL_CAPACITY: usize = 5;

/// Capacity of the channel between Local Mapping and Loop Closing. Local
/// Mapping never blocks on it; keyframes that do not fit skip loop detection.
const LOOP_CHANNEL_CAPACITY: usize = 16;

/// Main SLAM system orchestrating Tracking, Local Mapping and Loop Closing.
pub struct SlamSystem {
    /// Shared state (Atlas, flags) accessible by all threads.
    shared: Arc<SharedState>,

    /// The tracker runs in the caller's thread.
    tracker: Tracker,
    extractor: OrbExtractor,

    local_mapping_handle: Option<JoinHandle<()>>,
    loop_closing_handle: Option<JoinHandle<()>>,
}

impl SlamSystem {
    /// Load the vocabulary and the settings, then start the system.
    pub fn new<P: AsRef<Path>, Q: AsRef<Path>>(vocabulary_path: P, settings_path: Q) -> Result<Self, SlamError> {
        let settings = Settings::load(settings_path)?;
        let vocabulary = OrbVocabulary::load_from_text(vocabulary_path).map_err(ConfigLoadError::from)?;
        info!(
            "[System] vocabulary loaded: {} words, k={}, L={}",
            vocabulary.num_words(),
            vocabulary.params().0,
            vocabulary.params().1
        );
        Self::with_vocabulary(Arc::new(vocabulary), settings)
    }

    /// Start the system with an in-memory vocabulary and settings.
    pub fn with_vocabulary(vocabulary: Arc<OrbVocabulary>, settings: Settings) -> Result<Self, SlamError> {
        settings.validate()?;
        let camera = settings.camera_model();
        let extractor = OrbExtractor::new(settings.orb_params());
        let shared = SharedState::new(ScalePyramid::new(settings.orb.scale_factor, settings.orb.n_levels));

        // Create bounded channels for keyframe communication
        let (kf_sender, kf_receiver) = bounded::<NewKeyFrameMsg>(KEYFRAME_CHANNEL_CAPACITY);
        let (lc_sender, lc_receiver) = if settings.loop_closing.enabled {
            let (tx, rx) = bounded::<KeyFrameId>(LOOP_CHANNEL_CAPACITY);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let local_mapping_handle = Self::spawn_local_mapping(
            Arc::clone(&shared),
            kf_receiver,
            LocalMapper::new(camera, settings.local_mapping.clone(), Arc::clone(&vocabulary), lc_sender),
        );
        let loop_closing_handle = lc_receiver.map(|rx| {
            let config = LoopCloserConfig::from_settings(&settings.loop_closing);
            Self::spawn_loop_closing(Arc::clone(&shared), rx, camera, config)
        });

        let tracker = Tracker::new(settings, vocabulary, Arc::clone(&shared), kf_sender);
        info!(
            "[System] started (loop closing {})",
            if loop_closing_handle.is_some() { "on" } else { "off" }
        );

        Ok(Self {
            shared,
            tracker,
            extractor,
            local_mapping_handle: Some(local_mapping_handle),
            loop_closing_handle,
        })
    }

    /// Spawn the Local Mapping thread.
    fn spawn_local_mapping(
        shared: Arc<SharedState>,
        kf_receiver: Receiver<NewKeyFrameMsg>,
        mut local_mapper: LocalMapper,
    ) -> JoinHandle<()> {
        thread::spawn(move || {
            local_mapper.run(kf_receiver, shared);
        })
    }

    /// Spawn the Loop Closing thread.
    fn spawn_loop_closing(
        shared: Arc<SharedState>,
        kf_receiver: Receiver<KeyFrameId>,
        camera: CameraModel,
        config: LoopCloserConfig,
    ) -> JoinHandle<()> {
        thread::spawn(move || {
            let mut loop_closer = LoopCloser::new(shared, camera, config);
            loop_closer.run(kf_receiver);
        })
    }

    /// Track one image. Returns `T_cw` while tracking is `Ok`.
    ///
    /// An invalid image is rejected before it reaches the tracker, leaving
    /// the tracking state untouched.
    pub fn track(&mut self, image: &ImageInput, timestamp: f64) -> Result<Option<SE3>, SlamError> {
        Ok(self.track_detailed(image, timestamp)?.pose)
    }

    /// Track one image and return the full result with metrics.
    pub fn track_detailed(&mut self, image: &ImageInput, timestamp: f64) -> Result<TrackingResult, SlamError> {
        if self.tracker.state() == TrackingState::Shutdown {
            return Ok(self.tracker.process_frame(FeatureSet::default(), timestamp));
        }
        let gray = preprocess(image).map_err(|e| {
            warn!("[System] frame at {:.6} dropped: {}", timestamp, e);
            e
        })?;

        let t = Instant::now();
        let features = self.extractor.extract(&gray);
        let extract_ms = t.elapsed().as_secs_f64() * 1000.0;

        let mut result = self.tracker.process_frame(features, timestamp);
        result.timing.extract_ms = extract_ms;
        result.timing.total_ms += extract_ms;
        Ok(result)
    }

    /// Track already extracted features (e.g. pre-computed correspondences).
    ///
    /// A set whose keypoint and descriptor counts differ is dropped with a
    /// warning, leaving the tracking state untouched.
    pub fn track_features(&mut self, features: FeatureSet, timestamp: f64) -> Option<SE3> {
        self.tracker.process_frame(features, timestamp).pose
    }

    pub fn track_features_detailed(&mut self, features: FeatureSet, timestamp: f64) -> TrackingResult {
        self.tracker.process_frame(features, timestamp)
    }

    pub fn state(&self) -> TrackingState {
        self.tracker.state()
    }

    /// Get a reference to the shared state.
    pub fn shared_state(&self) -> &Arc<SharedState> {
        &self.shared
    }

    /// Pose (`T_cw`) of every tracked frame, reflecting the latest map corrections.
    pub fn trajectory(&self) -> Vec<StampedPose> {
        let atlas = self.shared.atlas.read();
        self.tracker.trajectory(&atlas.map)
    }

    /// Pose (`T_cw`) of every keyframe still in the map, in creation order.
    pub fn keyframe_trajectory(&self) -> Vec<StampedPose> {
        let atlas = self.shared.atlas.read();
        atlas
            .map
            .keyframes_temporal_order()
            .into_iter()
            .filter(|kf| !kf.is_bad)
            .map(|kf| StampedPose {
                frame_id: kf.frame_id,
                timestamp: kf.timestamp,
                pose: kf.pose_cw(),
            })
            .collect()
    }

    pub fn num_keyframes(&self) -> usize {
        self.shared.atlas.read().map.num_keyframes()
    }

    pub fn num_map_points(&self) -> usize {
        self.shared.atlas.read().map.num_map_points()
    }

    /// Block until Local Mapping and Loop Closing have processed every
    /// keyframe sent so far. Returns false on timeout.
    pub fn wait_until_mapping_idle(&self, timeout: Duration) -> bool {
        let start = Instant::now();
        while !self.shared.is_mapping_idle() {
            if start.elapsed() > timeout {
                return false;
            }
            thread::sleep(Duration::from_millis(2));
        }
        true
    }

    /// Shutdown the system gracefully.
    ///
    /// Signals the background threads to finish and waits for them. Later
    /// frames are not tracked. Calling it again does nothing.
    pub fn shutdown(&mut self) {
        if self.local_mapping_handle.is_none() && self.loop_closing_handle.is_none() {
            return;
        }
        self.tracker.shutdown();
        self.shared.request_shutdown();

        // Both threads poll the shutdown flag between receives.
        for handle in [self.local_mapping_handle.take(), self.loop_closing_handle.take()]
            .into_iter()
            .flatten()
        {
            if handle.join().is_err() {
                warn!("[System] a background thread panicked");
            }
        }
        info!("[System] shut down");
    }
}

impl Drop for SlamSystem {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::{straight_line, SyntheticScene};
    use nalgebra::Vector3;

    fn scene() -> SyntheticScene {
        SyntheticScene::corridor(CameraModel::pinhole(500.0, 500.0, 320.0, 240.0, 640, 480), 400, 0.5, 3)
    }

    fn system(scene: &SyntheticScene, loop_closing: bool) -> SlamSystem {
        let mut settings = scene.settings();
        settings.loop_closing.enabled = loop_closing;
        system_with(scene, settings)
    }

    fn system_with(scene: &SyntheticScene, settings: Settings) -> SlamSystem {
        let vocabulary = Arc::new(scene.train_vocabulary(5, 3, 1).unwrap());
        SlamSystem::with_vocabulary(vocabulary, settings).unwrap()
    }

    fn bgr(img: &image::GrayImage) -> ImageInput {
        let data = img.as_raw().iter().flat_map(|&v| [v, v, v]).collect();
        ImageInput::bgr(img.width() as usize, img.height() as usize, data)
    }

    #[test]
    fn test_invalid_image_is_rejected_without_state_change() {
        let scene = scene();
        let mut slam = system(&scene, false);
        let bad = ImageInput::new(vec![0; 10], vec![2, 2, 2]);
        let err = slam.track(&bad, 0.0).unwrap_err();
        assert!(matches!(err, SlamError::InvalidImageFormat { .. }));
        assert_eq!(slam.state(), TrackingState::NotInitialized);
    }

    #[test]
    fn test_rendered_image_is_tracked_without_pose_before_init() {
        let scene = scene();
        let mut slam = system(&scene, false);
        let img = scene.render(&SE3::identity());
        let result = slam.track_detailed(&ImageInput::from_gray_image(&img), 0.0).unwrap();
        assert!(result.pose.is_none());
        assert!(result.metrics.n_features > 0);
        assert_eq!(slam.state(), TrackingState::NotInitialized);
    }

    #[test]
    fn test_rendered_gray_and_bgr_images_reach_ok() {
        let scene = scene();
        let mut slam = system(&scene, false);
        let poses = straight_line(Vector3::zeros(), Vector3::new(0.5, 0.0, 0.0), 30, 30.0);

        let mut first_ok = None;
        for (i, p) in poses.iter().enumerate() {
            let img = scene.render(&p.pose);
            let input = if i % 2 == 0 { ImageInput::from_gray_image(&img) } else { bgr(&img) };
            let pose = slam.track(&input, p.timestamp).unwrap();
            if pose.is_some() && first_ok.is_none() {
                first_ok = Some(i);
            }
            assert!(slam.wait_until_mapping_idle(Duration::from_secs(10)));
        }
        let first_ok = first_ok.expect("image path never initialized");
        assert!(first_ok <= 10, "initialized at frame {}", first_ok);
        assert_eq!(slam.state(), TrackingState::Ok);
        assert!(slam.trajectory().len() >= poses.len() - first_ok);
    }

    #[test]
    fn test_inconsistent_features_are_dropped_without_state_change() {
        let scene = scene();
        let mut slam = system(&scene, false);
        let poses = straight_line(Vector3::zeros(), Vector3::new(0.2, 0.0, 0.0), 8, 30.0);
        for p in &poses {
            slam.track_features(scene.observe(&p.pose), p.timestamp);
            assert!(slam.wait_until_mapping_idle(Duration::from_secs(10)));
        }
        assert_eq!(slam.state(), TrackingState::Ok);
        let tracked = slam.trajectory().len();

        let mut features = scene.observe(&poses[7].pose);
        let n = features.descriptors.len();
        features.descriptors.truncate(n / 2);
        assert!(slam.track_features(features, 1.0).is_none());
        assert_eq!(slam.state(), TrackingState::Ok);
        assert_eq!(slam.trajectory().len(), tracked);
    }

    #[test]
    fn test_tracking_does_not_wait_for_paused_local_mapping() {
        let scene = scene();
        let mut settings = scene.settings();
        settings.loop_closing.enabled = false;
        settings.tracking.kf_min_tracked_ratio = 0.99;
        settings.tracking.kf_max_frames = Some(1);
        let mut slam = system_with(&scene, settings);
        let poses = straight_line(Vector3::zeros(), Vector3::new(0.5, 0.0, 0.0), 30, 30.0);

        for p in &poses[..6] {
            slam.track_features(scene.observe(&p.pose), p.timestamp);
            assert!(slam.wait_until_mapping_idle(Duration::from_secs(10)));
        }
        assert_eq!(slam.state(), TrackingState::Ok);

        let shared = Arc::clone(slam.shared_state());
        shared.request_pause_local_mapping();
        let start = Instant::now();
        while !shared.is_local_mapping_paused() {
            assert!(start.elapsed() < Duration::from_secs(5), "local mapping never paused");
            thread::sleep(Duration::from_millis(2));
        }
        // Lifts the pause in case tracking gets stuck behind it.
        let (done_tx, done_rx) = bounded::<()>(1);
        let releaser = {
            let shared = Arc::clone(&shared);
            thread::spawn(move || {
                let _ = done_rx.recv_timeout(Duration::from_secs(10));
                shared.release_local_mapping();
            })
        };

        let keyframes = slam.num_keyframes();
        let mut worst = Duration::ZERO;
        for p in &poses[6..] {
            let t = Instant::now();
            let result = slam.track_features_detailed(scene.observe(&p.pose), p.timestamp);
            worst = worst.max(t.elapsed());
            assert!(!result.metrics.keyframe_inserted);
        }
        assert!(worst < Duration::from_secs(2), "track() took {:?}", worst);
        assert_eq!(slam.num_keyframes(), keyframes);

        done_tx.send(()).unwrap();
        releaser.join().unwrap();
        assert!(!shared.should_pause_local_mapping());
    }

    #[test]
    fn test_relocalizes_after_getting_lost() {
        let scene = scene();
        let unrelated = SyntheticScene::corridor(scene.camera, 400, 0.5, 99);
        let mut slam = system(&scene, false);
        let poses = straight_line(Vector3::zeros(), Vector3::new(0.5, 0.0, 0.0), 30, 30.0);

        for p in &poses[..20] {
            slam.track_features(scene.observe(&p.pose), p.timestamp);
            assert!(slam.wait_until_mapping_idle(Duration::from_secs(10)));
        }
        assert_eq!(slam.state(), TrackingState::Ok);

        let mut t = poses[19].timestamp;
        let lost_frames = [
            unrelated.observe(&poses[20].pose),
            FeatureSet::default(),
            unrelated.observe(&poses[21].pose),
        ];
        for features in lost_frames {
            t += 0.1;
            let result = slam.track_features_detailed(features, t);
            assert_eq!(result.state, TrackingState::Lost);
            assert!(result.pose.is_none());
        }

        // Back in the mapped part of the scene.
        t += 0.1;
        let result = slam.track_features_detailed(scene.observe(&poses[15].pose), t);
        assert_eq!(result.state, TrackingState::Ok);
        assert!(result.metrics.relocalized);
        assert!(result.pose.is_some());
    }

    #[test]
    fn test_features_track_and_map_then_shutdown_twice() {
        let scene = scene();
        let mut slam = system(&scene, true);
        let poses = straight_line(Vector3::zeros(), Vector3::new(0.5, 0.0, 0.0), 20, 30.0);

        let mut tracked = 0;
        for p in &poses {
            if slam.track_features(scene.observe(&p.pose), p.timestamp).is_some() {
                tracked += 1;
            }
            assert!(slam.wait_until_mapping_idle(Duration::from_secs(10)));
        }
        assert!(tracked >= 15, "tracked {} frames", tracked);
        assert_eq!(slam.state(), TrackingState::Ok);
        assert!(slam.num_keyframes() >= 2);
        assert!(slam.num_map_points() > 50);
        assert_eq!(slam.keyframe_trajectory().len(), slam.num_keyframes());
        // The initialization reference frame gets its pose after the fact.
        assert!(slam.trajectory().len() >= tracked);

        slam.shutdown();
        slam.shutdown();
        assert_eq!(slam.state(), TrackingState::Shutdown);
        assert!(slam.track_features(scene.observe(&poses[0].pose), 1.0).is_none());
        let img = ImageInput::from_gray_image(&scene.render(&poses[0].pose));
        assert_eq!(slam.track(&img, 1.1).unwrap(), None);
    }

    #[test]
    fn test_straight_meter_end_to_end() {
        use crate::evaluation::{align_trajectory, path_length_scale};

        let camera = CameraModel::pinhole(500.0, 500.0, 320.0, 240.0, 640, 480);
        let scene = SyntheticScene::corridor(camera, 800, 1.0, 42);
        let ground_truth = straight_line(Vector3::zeros(), Vector3::new(1.0, 0.0, 0.0), 50, 30.0);
        let mut slam = system(&scene, true);

        let mut states = Vec::new();
        for gt in &ground_truth {
            let result = slam.track_features_detailed(scene.observe(&gt.pose), gt.timestamp);
            states.push(result.state);
            assert!(slam.wait_until_mapping_idle(Duration::from_secs(10)));
        }

        assert_eq!(states[0], TrackingState::NotInitialized);
        let first_ok = states.iter().position(|s| *s == TrackingState::Ok).unwrap();
        assert!(first_ok <= 3, "initialized at frame {}", first_ok);
        assert!(states[first_ok..].iter().all(|s| *s == TrackingState::Ok));

        let estimate = slam.trajectory();
        let reference: Vec<_> = estimate
            .iter()
            .map(|e| ground_truth[e.frame_id as usize].clone())
            .collect();
        let scale = path_length_scale(&estimate[..10], &reference[..10]).unwrap();
        let aligned = align_trajectory(&estimate, scale, Vector3::zeros());
        let last = aligned.last().unwrap();
        assert_eq!(last.frame_id, 49);
        let travelled = last.pose.camera_center().norm();
        assert!((travelled - 1.0).abs() < 0.05, "travelled {:.4} m", travelled);
    }

    #[test]
    fn test_missing_files_are_config_errors() {
        let dir = tempfile::tempdir().unwrap();
        let err = SlamSystem::new(dir.path().join("voc.txt"), dir.path().join("settings.yaml")).err();
        assert!(matches!(err, Some(SlamError::ConfigLoad(_))));
    }

    #[test]
    fn test_loads_vocabulary_and_settings_from_files() {
        let scene = scene();
        let dir = tempfile::tempdir().unwrap();
        let voc_path = dir.path().join("voc.txt");
        let settings_path = dir.path().join("settings.yaml");
        scene.train_vocabulary(4, 2, 2).unwrap().save_text(&voc_path).unwrap();
        scene.settings().save_yaml(&settings_path).unwrap();

        let slam = SlamSystem::new(&voc_path, &settings_path).unwrap();
        assert_eq!(slam.state(), TrackingState::NotInitialized);
        assert_eq!(slam.num_keyframes(), 0);
    }
}
