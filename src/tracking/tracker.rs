//! Main tracker: orchestrates frame processing and pose estimation.
//!
//! This implementation follows the classic monocular design:
//! - Uses shared `Atlas` via RwLock for thread-safe access
//! - Initializes the map from two views
//! - Predicts the pose with a constant-velocity motion model and matches the
//!   last frame's map points by projection, falling back to BoW matching
//!   against the reference keyframe
//! - Refines the pose against the local map
//! - Relocalizes against the keyframe database when lost
//! - Sends new keyframes to Local Mapping via channel

use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::{Sender, TrySendError};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info, warn};

use crate::atlas::map::{KeyFrameId, Map, MapPointId};
use crate::config::Settings;
use crate::features::{FeatureSet, MatchParams, TH_LOW};
use crate::geometry::{CameraModel, SE3};
use crate::optimizer::{run_global_ba, GlobalBAConfig, PoseOptimizationConfig};
use crate::system::messages::NewKeyFrameMsg;
use crate::system::shared_state::SharedState;
use crate::tracking::frame::Frame;
use crate::tracking::initializer::{create_initial_map, normalize_initial_map, InitAttempt, Initializer, InitializerConfig, TwoViewInit};
use crate::tracking::keyframe_decision::{KeyFrameContext, KeyFrameDecision};
use crate::tracking::local_map::{build_local_map, search_local_points};
use crate::tracking::matching::{search_by_bow_keyframe, search_by_projection_last_frame};
use crate::tracking::motion_model::MotionModel;
use crate::tracking::pose_estimation::optimize_frame_pose;
use crate::tracking::relocalization::{relocalize, RelocalizationConfig};
use crate::tracking::result::{StampedPose, TimingStats, TrackingMetrics, TrackingResult};
use crate::tracking::TrackingState;
use crate::vocabulary::OrbVocabulary;

/// Matches below which the motion-model search is retried with a wider window.
const MIN_MOTION_MATCHES: usize = 20;
/// BoW matches needed to track against the reference keyframe.
const MIN_BOW_MATCHES: usize = 15;
/// Inlier matches a first pose estimate needs before the local map is tracked.
const MIN_INITIAL_INLIERS: usize = 10;

/// Pose of a tracked frame, relative to its reference keyframe.
#[derive(Debug, Clone)]
struct TrajectoryEntry {
    frame_id: u64,
    timestamp: f64,
    reference_kf: KeyFrameId,
    /// T_c,ref
    pose_c_ref: SE3,
}

/// Main tracking structure.
pub struct Tracker {
    camera: CameraModel,
    settings: Settings,
    vocabulary: Arc<OrbVocabulary>,

    /// Shared state (Atlas, flags) - thread-safe access.
    shared: Arc<SharedState>,

    /// Channel to send keyframes to Local Mapping.
    kf_sender: Sender<NewKeyFrameMsg>,

    /// Tracking state machine (NotInitialized, Ok, Lost, Shutdown).
    state: TrackingState,

    initializer: Initializer,
    motion_model: MotionModel,

    /// Keyframe creation decision logic.
    kf_decision: KeyFrameDecision,

    /// Last successfully tracked frame and its pose relative to its reference.
    last_frame: Option<(Frame, SE3)>,

    /// Reference keyframe used for tracking.
    reference_kf: Option<KeyFrameId>,

    /// Frame id of the last relocalization.
    last_reloc_frame: Option<u64>,

    /// Running frame counter.
    frame_count: u64,
    last_timestamp: Option<f64>,

    trajectory: Vec<TrajectoryEntry>,

    pose_config: PoseOptimizationConfig,
    reloc_config: RelocalizationConfig,
    rng: StdRng,
}

impl Tracker {
    pub fn new(
        settings: Settings,
        vocabulary: Arc<OrbVocabulary>,
        shared: Arc<SharedState>,
        kf_sender: Sender<NewKeyFrameMsg>,
    ) -> Self {
        let tracking = &settings.tracking;
        let pose_config = PoseOptimizationConfig {
            rounds: tracking.pose_optimization_rounds,
            iterations: tracking.pose_iterations,
            ..Default::default()
        };
        let reloc_config = RelocalizationConfig {
            min_inliers: tracking.min_inliers_after_reloc,
            pose: pose_config.clone(),
            ..Default::default()
        };
        let kf_decision = KeyFrameDecision::new(
            tracking.kf_min_frames,
            settings.kf_max_frames(),
            tracking.kf_min_tracked_ratio,
            tracking.kf_min_tracked,
        );
        Self {
            camera: settings.camera_model(),
            initializer: Initializer::new(InitializerConfig::from_settings(tracking), 0),
            vocabulary,
            shared,
            kf_sender,
            state: TrackingState::NotInitialized,
            motion_model: MotionModel::new(),
            kf_decision,
            last_frame: None,
            reference_kf: None,
            last_reloc_frame: None,
            frame_count: 0,
            last_timestamp: None,
            trajectory: Vec::new(),
            pose_config,
            reloc_config,
            rng: StdRng::seed_from_u64(1),
            settings,
        }
    }

    pub fn state(&self) -> TrackingState {
        self.state
    }

    pub fn reference_kf(&self) -> Option<KeyFrameId> {
        self.reference_kf
    }

    /// Stop tracking; every later frame returns a `Shutdown` result.
    pub fn shutdown(&mut self) {
        if self.state != TrackingState::Shutdown {
            info!("[Tracking] {} -> {}", self.state, TrackingState::Shutdown);
        }
        self.state = TrackingState::Shutdown;
    }

    /// Process the features of one frame and return a detailed `TrackingResult`.
    pub fn process_frame(&mut self, features: FeatureSet, timestamp: f64) -> TrackingResult {
        let frame_id = self.frame_count;
        if self.state == TrackingState::Shutdown {
            return TrackingResult::shutdown(frame_id);
        }
        if !features.is_consistent() {
            warn!(
                "[Tracking] frame at {:.6} dropped: {} keypoints but {} descriptors",
                timestamp,
                features.keypoints.len(),
                features.descriptors.len()
            );
            return TrackingResult::dropped(frame_id, self.state, self.reference_kf);
        }
        self.frame_count += 1;

        if let Some(last) = self.last_timestamp {
            if timestamp < last {
                warn!("[Tracking] frame {}: timestamp {:.6} is older than {:.6}", frame_id, timestamp, last);
            }
        }
        self.last_timestamp = Some(timestamp);

        let t_start = Instant::now();
        let mut timing = TimingStats::zero();
        let mut metrics = TrackingMetrics {
            frame_id,
            n_features: features.len(),
            ..Default::default()
        };
        let mut frame = Frame::new(frame_id, timestamp, features, &self.camera);
        let previous_state = self.state;

        match self.state {
            TrackingState::NotInitialized => {
                let t = Instant::now();
                self.initialize(&mut frame, &mut metrics);
                timing.initialize_ms = t.elapsed().as_secs_f64() * 1000.0;
            }
            TrackingState::Ok => {
                let t = Instant::now();
                let tracked = self.track_initial_pose(&mut frame);
                timing.track_ms = t.elapsed().as_secs_f64() * 1000.0;
                let t = Instant::now();
                let ok = tracked && self.track_local_map(&mut frame, &mut metrics);
                timing.local_map_ms = t.elapsed().as_secs_f64() * 1000.0;
                if ok {
                    self.on_tracked(&mut frame, &mut metrics);
                } else {
                    self.state = TrackingState::Lost;
                    self.motion_model.reset();
                }
            }
            TrackingState::Lost => {
                let t = Instant::now();
                let relocalized = self.relocalize(&mut frame);
                timing.relocal_ms = t.elapsed().as_secs_f64() * 1000.0;
                let t = Instant::now();
                if relocalized && self.track_local_map(&mut frame, &mut metrics) {
                    metrics.relocalized = true;
                    self.state = TrackingState::Ok;
                    self.on_tracked(&mut frame, &mut metrics);
                }
                timing.local_map_ms = t.elapsed().as_secs_f64() * 1000.0;
            }
            TrackingState::Shutdown => {}
        }

        if self.state != previous_state {
            info!("[Tracking] frame {}: {} -> {}", frame_id, previous_state, self.state);
        }

        timing.total_ms = t_start.elapsed().as_secs_f64() * 1000.0;
        debug!(
            "[Tracking] frame {}: {} features, {} matches, {} inliers, {:.1} ms",
            frame_id, metrics.n_features, metrics.n_map_point_matches, metrics.n_inliers, timing.total_ms
        );

        let pose = if self.state == TrackingState::Ok { frame.pose_cw.clone() } else { None };
        TrackingResult {
            state: self.state,
            pose,
            reference_kf: self.reference_kf,
            metrics,
            timing,
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Initialization
    // ─────────────────────────────────────────────────────────────────────────

    fn initialize(&mut self, frame: &mut Frame, metrics: &mut TrackingMetrics) {
        match self.initializer.process(frame, &self.camera) {
            InitAttempt::Reconstructed(init) => {
                if let Some(n) = self.create_initial_map(&init, frame) {
                    metrics.n_map_point_matches = n;
                    metrics.n_inliers = n;
                    metrics.inlier_ratio = 1.0;
                    metrics.keyframe_inserted = true;
                    self.state = TrackingState::Ok;
                }
            }
            InitAttempt::ReferenceSet => debug!("[Init] frame {} is the new reference", frame.id),
            InitAttempt::TooFewFeatures(n) => debug!("[Init] frame {}: only {} features", frame.id, n),
            InitAttempt::TooFewMatches(n) => debug!("[Init] frame {}: {} matches", frame.id, n),
            InitAttempt::Rejected(reason) => debug!("[Init] frame {}: {:?}", frame.id, reason),
        }
    }

    /// Build, refine and scale the initial map. Returns the number of map
    /// points tracked by the current frame.
    fn create_initial_map(&mut self, init: &TwoViewInit, frame: &mut Frame) -> Option<usize> {
        let (kf1, kf2) = {
            let mut atlas = self.shared.atlas.write();
            create_initial_map(&mut atlas.map, init, frame, &self.camera)
        };

        let ba_config = GlobalBAConfig::default();
        if let Err(e) = run_global_ba(&self.shared.atlas, &self.camera, &ba_config, &|| false) {
            debug!("[Init] global BA skipped: {}", e);
        }

        let mut atlas = self.shared.atlas.write();
        let min_tracked = self.settings.tracking.init_min_triangulated;
        let scale = match normalize_initial_map(&mut atlas.map, kf1, kf2, min_tracked) {
            Ok(scale) => scale,
            Err(reason) => {
                warn!("[Init] discarding initial map: {:?}", reason);
                atlas.clear();
                return None;
            }
        };

        let kf = atlas.map.get_keyframe(kf2)?;
        let pose_cw = kf.pose_cw();
        frame.clear_map_points();
        for (idx, mp_id) in kf.get_map_point_indices() {
            frame.map_points[idx] = Some(mp_id);
        }
        frame.pose_cw = Some(pose_cw.clone());
        frame.reference_kf = Some(kf2);
        let n_points = atlas.map.num_map_points();
        drop(atlas);

        info!(
            "[Init] map initialized from frames {} and {}: {} points, scale {:.3}",
            init.reference.id, frame.id, n_points, scale
        );

        self.reference_kf = Some(kf2);
        self.kf_decision.record_insertion(frame.id);
        self.motion_model.reset();
        self.motion_model.set_last_pose(&pose_cw);
        self.last_frame = Some((frame.clone(), SE3::identity()));
        self.trajectory.push(TrajectoryEntry {
            frame_id: init.reference.id,
            timestamp: init.reference.timestamp,
            reference_kf: kf1,
            pose_c_ref: SE3::identity(),
        });
        self.trajectory.push(TrajectoryEntry {
            frame_id: frame.id,
            timestamp: frame.timestamp,
            reference_kf: kf2,
            pose_c_ref: SE3::identity(),
        });

        for keyframe_id in [kf1, kf2] {
            self.send_keyframe(NewKeyFrameMsg {
                keyframe_id,
                matched_map_points: Vec::new(),
            });
        }
        Some(frame.num_tracked())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Tracking
    // ─────────────────────────────────────────────────────────────────────────

    /// Refresh the last frame's pose from its (possibly optimized) reference
    /// keyframe so the motion prior follows map corrections.
    fn refresh_last_frame(&mut self, map: &Map) {
        let Some((last, pose_c_ref)) = self.last_frame.as_mut() else {
            return;
        };
        let Some(reference) = last.reference_kf.and_then(|id| map.keyframe_pose_cw_resolved(id)) else {
            return;
        };
        let pose_cw = pose_c_ref.compose(&reference);
        last.pose_cw = Some(pose_cw.clone());
        self.motion_model.set_last_pose(&pose_cw);
    }

    /// First pose estimate: motion model, then the reference keyframe.
    fn track_initial_pose(&mut self, frame: &mut Frame) -> bool {
        let shared = Arc::clone(&self.shared);
        let atlas = shared.atlas.read();
        let map = &atlas.map;
        self.refresh_last_frame(map);

        if self.motion_model.has_velocity() && self.track_with_motion_model(frame, map) {
            return true;
        }
        self.track_reference_keyframe(frame, map)
    }

    fn track_with_motion_model(&self, frame: &mut Frame, map: &Map) -> bool {
        let (Some(predicted), Some((last, _))) = (self.motion_model.predict(), self.last_frame.as_ref()) else {
            return false;
        };
        frame.pose_cw = Some(predicted);
        frame.clear_map_points();

        let th = self.settings.tracking.search_radius_px;
        let mut n = search_by_projection_last_frame(frame, last, map, &self.camera, th, true);
        if n < MIN_MOTION_MATCHES {
            frame.clear_map_points();
            n = search_by_projection_last_frame(frame, last, map, &self.camera, 2.0 * th, true);
        }
        if n < MIN_MOTION_MATCHES {
            debug!("[Tracking] frame {}: motion model found {} matches", frame.id, n);
            return false;
        }

        let inliers = optimize_frame_pose(frame, map, &self.camera, &self.pose_config);
        frame.discard_outliers();
        inliers >= MIN_INITIAL_INLIERS
    }

    fn track_reference_keyframe(&self, frame: &mut Frame, map: &Map) -> bool {
        let Some(kf) = self.reference_kf.and_then(|id| map.get_keyframe(id)) else {
            return false;
        };
        frame.compute_bow(&self.vocabulary);
        let params = MatchParams {
            max_distance: TH_LOW,
            ratio: 0.7,
        };
        let matches = search_by_bow_keyframe(kf, frame, map, &params);
        if matches.len() < MIN_BOW_MATCHES {
            debug!("[Tracking] frame {}: {} BoW matches to keyframe {}", frame.id, matches.len(), kf.id);
            return false;
        }

        frame.clear_map_points();
        for (idx, mp_id) in matches {
            frame.map_points[idx] = Some(mp_id);
        }
        frame.pose_cw = self
            .last_frame
            .as_ref()
            .and_then(|(last, _)| last.pose_cw.clone())
            .or_else(|| Some(kf.pose_cw()));

        let inliers = optimize_frame_pose(frame, map, &self.camera, &self.pose_config);
        frame.discard_outliers();
        inliers >= MIN_INITIAL_INLIERS
    }

    fn recently_relocalized(&self, frame_id: u64) -> bool {
        self.last_reloc_frame
            .map_or(false, |reloc| frame_id < reloc + self.settings.kf_max_frames() as u64)
    }

    /// Match the local map into the frame and optimize the pose again.
    /// Updates the visible/found counters of the map points involved.
    fn track_local_map(&mut self, frame: &mut Frame, metrics: &mut TrackingMetrics) -> bool {
        let shared = Arc::clone(&self.shared);
        let (outcome, inliers) = {
            let atlas = shared.atlas.read();
            let map = &atlas.map;
            let local = build_local_map(map, frame, self.reference_kf);
            if let Some(reference) = local.reference_kf {
                self.reference_kf = Some(reference);
                frame.reference_kf = Some(reference);
            }

            let th = if self.last_reloc_frame.map_or(false, |r| frame.id < r + 2) { 5.0 } else { 1.0 };
            let outcome = search_local_points(frame, map, &local, &self.camera, th, self.settings.tracking.nn_ratio);
            metrics.n_map_point_matches = frame.map_points.iter().flatten().count();
            let inliers = optimize_frame_pose(frame, map, &self.camera, &self.pose_config);
            (outcome, inliers)
        };

        let found: Vec<MapPointId> = frame
            .map_points
            .iter()
            .zip(&frame.outliers)
            .filter(|(_, &outlier)| !outlier)
            .filter_map(|(mp, _)| *mp)
            .collect();
        {
            let mut atlas = shared.atlas.write();
            for id in &outcome.visible {
                if let Some(mp) = atlas.map.get_map_point_mut(*id) {
                    mp.increase_visible(1);
                }
            }
            for id in &found {
                if let Some(mp) = atlas.map.get_map_point_mut(*id) {
                    mp.increase_found(1);
                }
            }
        }
        frame.discard_outliers();

        metrics.n_inliers = inliers;
        metrics.inlier_ratio = if metrics.n_map_point_matches > 0 {
            inliers as f64 / metrics.n_map_point_matches as f64
        } else {
            0.0
        };

        let required = if self.recently_relocalized(frame.id) {
            self.settings.tracking.min_inliers_after_reloc
        } else {
            self.settings.tracking.min_inliers
        };
        if inliers < required {
            debug!("[Tracking] frame {}: {} inliers, {} required", frame.id, inliers, required);
            return false;
        }
        true
    }

    fn relocalize(&mut self, frame: &mut Frame) -> bool {
        frame.compute_bow(&self.vocabulary);
        let shared = Arc::clone(&self.shared);
        let atlas = shared.atlas.read();
        match relocalize(frame, &atlas, &self.camera, &self.reloc_config, &mut self.rng) {
            Some(result) => {
                self.reference_kf = Some(result.keyframe_id);
                self.last_reloc_frame = Some(frame.id);
                true
            }
            None => false,
        }
    }

    /// Bookkeeping after a frame was tracked: motion model, trajectory,
    /// keyframe decision.
    fn on_tracked(&mut self, frame: &mut Frame, metrics: &mut TrackingMetrics) {
        let Some(pose_cw) = frame.pose_cw.clone() else {
            return;
        };
        self.motion_model.update(&pose_cw);

        if frame.reference_kf.is_none() {
            frame.reference_kf = self.reference_kf;
        }
        let pose_c_ref = {
            let atlas = self.shared.atlas.read();
            frame
                .reference_kf
                .and_then(|id| atlas.map.get_keyframe(id))
                .map(|kf| pose_cw.compose(&kf.pose))
        };

        if self.needs_new_keyframe(frame) && self.create_keyframe(frame) {
            metrics.keyframe_inserted = true;
        }

        let (Some(reference_kf), Some(pose_c_ref)) = (frame.reference_kf, pose_c_ref) else {
            return;
        };
        let pose_c_ref = if metrics.keyframe_inserted { SE3::identity() } else { pose_c_ref };
        let reference_kf = if metrics.keyframe_inserted { self.reference_kf.unwrap_or(reference_kf) } else { reference_kf };
        frame.reference_kf = Some(reference_kf);
        self.trajectory.push(TrajectoryEntry {
            frame_id: frame.id,
            timestamp: frame.timestamp,
            reference_kf,
            pose_c_ref: pose_c_ref.clone(),
        });
        self.last_frame = Some((frame.clone(), pose_c_ref));
    }

    fn needs_new_keyframe(&self, frame: &Frame) -> bool {
        let atlas = self.shared.atlas.read();
        let map = &atlas.map;
        let max_frames = self.settings.kf_max_frames();
        if self.recently_relocalized(frame.id) && map.num_keyframes() > max_frames {
            return false;
        }
        let min_obs = if map.num_keyframes() <= 2 { 2 } else { 3 };
        let reference_tracked = self.reference_kf.map_or(0, |kf| map.tracked_map_points(kf, min_obs));
        let ctx = KeyFrameContext {
            frame_id: frame.id,
            tracked: frame.num_tracked(),
            reference_tracked,
            mapper_idle: self.shared.keyframes_in_mapping() == 0,
            flow_control: self.local_mapping_saturated(),
        };
        self.kf_decision.should_insert(&ctx)
    }

    /// Local Mapping cannot take another keyframe right now: it is paused for
    /// loop correction, or its queue reached the flow-control length.
    fn local_mapping_saturated(&self) -> bool {
        let limit = self.settings.local_mapping.queue_flow_control.max(1);
        self.shared.should_pause_local_mapping()
            || self.shared.is_local_mapping_paused()
            || self.shared.should_stop_keyframe_creation()
            || self.kf_sender.is_full()
            || self.kf_sender.len() >= limit
    }

    /// Insert the frame as a KeyFrame and hand it to Local Mapping. Returns
    /// false if no keyframe was created.
    fn create_keyframe(&mut self, frame: &Frame) -> bool {
        let Some(pose_cw) = frame.pose_cw.as_ref() else {
            return false;
        };
        if self.kf_sender.is_full() {
            return false;
        }
        let keyframe_id = {
            let mut atlas = self.shared.atlas.write();
            let id = atlas.map.create_keyframe(
                frame.id,
                frame.timestamp,
                pose_cw.inverse(),
                frame.undistorted_features(),
                (self.camera.width, self.camera.height),
            );
            if let (Some(bow), Some(fv), Some(kf)) =
                (frame.bow_vector(), frame.feature_vector(), atlas.map.get_keyframe_mut(id))
            {
                kf.set_bow(bow.clone(), fv.clone());
            }
            id
        };

        let matched_map_points: Vec<Option<MapPointId>> = frame
            .map_points
            .iter()
            .zip(&frame.outliers)
            .map(|(mp, &outlier)| if outlier { None } else { *mp })
            .collect();

        debug!(
            "[Tracking] frame {} -> keyframe {} ({} tracked points)",
            frame.id,
            keyframe_id,
            matched_map_points.iter().flatten().count()
        );
        if !self.send_keyframe(NewKeyFrameMsg {
            keyframe_id,
            matched_map_points,
        }) {
            self.shared.atlas.write().map.remove_keyframe_full(keyframe_id);
            return false;
        }
        self.reference_kf = Some(keyframe_id);
        self.kf_decision.record_insertion(frame.id);
        true
    }

    /// Queue a keyframe for Local Mapping without blocking.
    fn send_keyframe(&self, msg: NewKeyFrameMsg) -> bool {
        let keyframe_id = msg.keyframe_id;
        self.shared.keyframe_sent_to_mapping();
        match self.kf_sender.try_send(msg) {
            Ok(()) => {
                // Signal Local Mapping that a new keyframe is coming (abort current BA)
                self.shared.request_abort_ba();
                true
            }
            Err(TrySendError::Full(_)) => {
                debug!("[Tracking] local mapping queue full, keyframe {} dropped", keyframe_id);
                self.shared.keyframe_mapped();
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                warn!("[Tracking] local mapping is gone, keyframe {} not processed", keyframe_id);
                self.shared.keyframe_mapped();
                false
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Trajectory
    // ─────────────────────────────────────────────────────────────────────────

    /// Pose of every tracked frame, reflecting the current keyframe estimates.
    pub fn trajectory(&self, map: &Map) -> Vec<StampedPose> {
        self.trajectory
            .iter()
            .filter_map(|entry| {
                let reference = map.keyframe_pose_cw_resolved(entry.reference_kf)?;
                Some(StampedPose {
                    frame_id: entry.frame_id,
                    timestamp: entry.timestamp,
                    pose: entry.pose_c_ref.compose(&reference),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracking::matching::tests::{camera, landmarks, observe};
    use crossbeam_channel::{bounded, unbounded, Receiver};
    use nalgebra::{UnitQuaternion, Vector3};

    fn pose(x: f64) -> SE3 {
        SE3 {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::new(-x, 0.0, 0.0),
        }
    }

    fn settings() -> Settings {
        let mut settings = Settings::default();
        settings.tracking.init_min_matches = 50;
        settings.tracking.init_min_features = 50;
        settings
    }

    fn tracker_with(settings: Settings, tx: Sender<NewKeyFrameMsg>) -> (Tracker, Arc<SharedState>) {
        let lms = landmarks(200, 8);
        let descs: Vec<_> = lms.iter().map(|(_, d)| *d).collect();
        let vocab = Arc::new(OrbVocabulary::train(&descs, 4, 3, 1).unwrap());
        let shared = Arc::new(SharedState::default());
        let tracker = Tracker::new(settings, vocab, Arc::clone(&shared), tx);
        (tracker, shared)
    }

    fn tracker() -> (Tracker, Receiver<NewKeyFrameMsg>, Arc<SharedState>) {
        let (tx, rx) = unbounded();
        let (tracker, shared) = tracker_with(settings(), tx);
        (tracker, rx, shared)
    }

    #[test]
    fn test_no_pose_before_initialization() {
        let (mut tracker, rx, _) = tracker();
        let lms = landmarks(200, 8);
        let (fs, _) = observe(&pose(0.0), &lms);
        let result = tracker.process_frame(fs, 0.0);
        assert_eq!(result.state, TrackingState::NotInitialized);
        assert!(result.pose.is_none());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_initializes_then_tracks() {
        let (mut tracker, rx, shared) = tracker();
        let lms = landmarks(200, 8);
        for (i, x) in [0.0, 0.4, 0.42, 0.44].into_iter().enumerate() {
            let (fs, _) = observe(&pose(x), &lms);
            let result = tracker.process_frame(fs, i as f64 * 0.1);
            if i == 0 {
                assert!(result.pose.is_none());
            } else {
                assert_eq!(result.state, TrackingState::Ok, "frame {}", i);
                assert!(result.pose.is_some());
            }
        }
        // The two initial keyframes were handed to local mapping.
        assert_eq!(rx.try_iter().count(), 2);
        assert_eq!(shared.atlas.read().map.num_keyframes(), 2);

        let trajectory = tracker.trajectory(&shared.atlas.read().map);
        assert_eq!(trajectory.len(), 4);
        // Scale is arbitrary; the direction of motion is not.
        let c1 = trajectory[1].pose.camera_center();
        let c3 = trajectory[3].pose.camera_center();
        assert!(c3.x > c1.x);
        assert!(((c3.x - c1.x) / c1.x - 0.1).abs() < 0.01);
    }

    #[test]
    fn test_lost_on_unrelated_scene_and_shutdown() {
        let (mut tracker, _rx, _) = tracker();
        let lms = landmarks(200, 8);
        for (i, x) in [0.0, 0.4].into_iter().enumerate() {
            let (fs, _) = observe(&pose(x), &lms);
            tracker.process_frame(fs, i as f64);
        }
        assert_eq!(tracker.state(), TrackingState::Ok);

        let (fs, _) = observe(&pose(0.4), &landmarks(200, 77));
        let result = tracker.process_frame(fs, 2.0);
        assert_eq!(result.state, TrackingState::Lost);
        assert!(result.pose.is_none());

        tracker.shutdown();
        tracker.shutdown();
        let (fs, _) = observe(&pose(0.4), &lms);
        let result = tracker.process_frame(fs, 3.0);
        assert_eq!(result.state, TrackingState::Shutdown);
        assert!(result.pose.is_none());
    }

    #[test]
    fn test_full_keyframe_queue_skips_keyframes_without_blocking() {
        let mut settings = settings();
        settings.tracking.kf_min_tracked_ratio = 0.99;
        settings.tracking.kf_max_frames = Some(1);
        // Room for the two initial keyframes only, and nobody consuming.
        let (tx, rx) = bounded(2);
        let (mut tracker, shared) = tracker_with(settings, tx);
        let lms = landmarks(200, 8);

        for (i, x) in [0.0, 0.4, 0.41, 0.42, 0.43, 0.44].into_iter().enumerate() {
            let (fs, _) = observe(&pose(x), &lms);
            let result = tracker.process_frame(fs, i as f64 * 0.1);
            if i >= 2 {
                assert_eq!(result.state, TrackingState::Ok, "frame {}", i);
                assert!(!result.metrics.keyframe_inserted, "frame {}", i);
            }
        }
        assert_eq!(rx.len(), 2);
        assert_eq!(shared.atlas.read().map.num_keyframes(), 2);

        // Once the queue drains, keyframes flow again.
        for _ in rx.try_iter() {
            shared.keyframe_mapped();
        }
        let (fs, _) = observe(&pose(0.45), &lms);
        let result = tracker.process_frame(fs, 0.6);
        assert!(result.metrics.keyframe_inserted);
        assert_eq!(rx.len(), 1);
        assert_eq!(shared.atlas.read().map.num_keyframes(), 3);
    }

    #[test]
    fn test_paused_local_mapping_gets_no_keyframes() {
        let mut settings = settings();
        settings.tracking.kf_max_frames = Some(1);
        let (mut tracker, rx, shared) = {
            let (tx, rx) = unbounded();
            let (tracker, shared) = tracker_with(settings, tx);
            (tracker, rx, shared)
        };
        let lms = landmarks(200, 8);
        for (i, x) in [0.0, 0.4].into_iter().enumerate() {
            let (fs, _) = observe(&pose(x), &lms);
            tracker.process_frame(fs, i as f64 * 0.1);
        }
        for _ in rx.try_iter() {
            shared.keyframe_mapped();
        }

        shared.request_pause_local_mapping();
        let (fs, _) = observe(&pose(0.41), &lms);
        let result = tracker.process_frame(fs, 0.2);
        assert_eq!(result.state, TrackingState::Ok);
        assert!(!result.metrics.keyframe_inserted);
        assert!(rx.is_empty());
    }

    #[test]
    fn test_inconsistent_feature_set_is_dropped() {
        let (mut tracker, _rx, _) = tracker();
        let lms = landmarks(200, 8);
        for (i, x) in [0.0, 0.4].into_iter().enumerate() {
            let (fs, _) = observe(&pose(x), &lms);
            tracker.process_frame(fs, i as f64 * 0.1);
        }
        assert_eq!(tracker.state(), TrackingState::Ok);

        let (mut fs, _) = observe(&pose(0.41), &lms);
        let n = fs.descriptors.len();
        fs.descriptors.truncate(n / 2);
        let result = tracker.process_frame(fs, 0.2);
        assert_eq!(result.state, TrackingState::Ok);
        assert!(result.pose.is_none());
        assert_eq!(tracker.state(), TrackingState::Ok);

        let (fs, _) = observe(&pose(0.42), &lms);
        let result = tracker.process_frame(fs, 0.3);
        assert_eq!(result.state, TrackingState::Ok);
        assert!(result.pose.is_some());
    }
}
