//! LoopCloser - the Loop Closing thread.
//!
//! Receives keyframes from Local Mapping and for each one:
//! 1. Detects consistent loop candidates using BoW
//! 2. Verifies them with Sim3 RANSAC and refinement
//! 3. Pauses Local Mapping and corrects the map

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info, warn};

use crate::atlas::map::KeyFrameId;
use crate::config::LoopClosingSettings;
use crate::geometry::CameraModel;
use crate::system::shared_state::SharedState;

use super::corrector::{correct_loop, CorrectorConfig};
use super::detector::{LoopDetector, LoopDetectorConfig};
use super::verifier::{verify_loop_candidates, LoopVerifierConfig};

/// Timeout for receiving keyframes from the channel.
const RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// How long to wait for Local Mapping to acknowledge a pause.
const PAUSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration for the LoopCloser.
#[derive(Debug, Clone, Default)]
pub struct LoopCloserConfig {
    pub detector: LoopDetectorConfig,
    pub verifier: LoopVerifierConfig,
    pub corrector: CorrectorConfig,
}

impl LoopCloserConfig {
    pub fn from_settings(settings: &LoopClosingSettings) -> Self {
        Self {
            detector: LoopDetectorConfig::from_settings(settings),
            verifier: LoopVerifierConfig::from_settings(settings),
            corrector: CorrectorConfig::from_settings(settings),
        }
    }
}

/// Statistics for the loop closer.
#[derive(Debug, Default, Clone)]
pub struct LoopCloserStats {
    pub keyframes_processed: usize,
    /// Keyframes that produced consistent candidates.
    pub candidates_detected: usize,
    pub loops_corrected: usize,
}

/// The LoopCloser thread handler.
pub struct LoopCloser {
    shared: Arc<SharedState>,
    camera: CameraModel,
    config: LoopCloserConfig,
    detector: LoopDetector,
    rng: StdRng,
    stats: LoopCloserStats,
}

impl LoopCloser {
    pub fn new(shared: Arc<SharedState>, camera: CameraModel, config: LoopCloserConfig) -> Self {
        let detector = LoopDetector::new(config.detector.clone());
        Self {
            shared,
            camera,
            config,
            detector,
            rng: StdRng::seed_from_u64(0),
            stats: LoopCloserStats::default(),
        }
    }

    /// Run the main loop closing thread.
    ///
    /// Blocks and processes keyframes until the channel is closed or
    /// shutdown is requested.
    pub fn run(&mut self, kf_receiver: Receiver<KeyFrameId>) {
        info!("[LoopClosing] started");

        loop {
            if self.shared.is_shutdown_requested() {
                break;
            }
            match kf_receiver.recv_timeout(RECV_TIMEOUT) {
                Ok(kf_id) => {
                    self.process_keyframe(kf_id);
                    self.shared.keyframe_loop_checked();
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        while kf_receiver.try_recv().is_ok() {
            self.shared.keyframe_loop_checked();
        }
        info!(
            "[LoopClosing] stopped: processed={}, detected={}, corrected={}",
            self.stats.keyframes_processed, self.stats.candidates_detected, self.stats.loops_corrected
        );
    }

    /// Look for a loop ending at `kf_id` and close it. Returns true when the
    /// map was corrected.
    pub fn process_keyframe(&mut self, kf_id: KeyFrameId) -> bool {
        self.stats.keyframes_processed += 1;

        let candidates = {
            let atlas = self.shared.atlas.read();
            self.detector.detect(&atlas, kf_id)
        };
        if candidates.is_empty() {
            return false;
        }
        self.stats.candidates_detected += 1;
        debug!("[LoopClosing] kf={}: {} consistent candidates", kf_id, candidates.len());

        self.try_close(kf_id, &candidates)
    }

    /// Verify `candidates` for `kf_id` and correct the map with the first
    /// accepted one.
    pub(crate) fn try_close(&mut self, kf_id: KeyFrameId, candidates: &[KeyFrameId]) -> bool {
        let verified = {
            let atlas = self.shared.atlas.read();
            verify_loop_candidates(&atlas.map, kf_id, candidates, &self.camera, &self.config.verifier, &mut self.rng)
        };
        let Some(verified) = verified else {
            debug!("[LoopClosing] kf={}: candidates failed verification", kf_id);
            return false;
        };
        info!(
            "[LoopClosing] loop detected: {} -> {} ({} matches, scale {:.3})",
            verified.current_kf_id,
            verified.loop_kf_id,
            verified.num_matches(),
            verified.s12.scale
        );

        self.shared.request_pause_local_mapping();
        if !self.wait_for_local_mapping_pause() {
            self.shared.release_local_mapping();
            return false;
        }

        let report = correct_loop(&self.shared, &verified, &self.camera, &self.config.corrector);
        self.shared.release_local_mapping();

        self.detector.loop_closed(kf_id);
        self.stats.loops_corrected += 1;
        info!(
            "[LoopClosing] loop closed: {} -> {} ({} keyframes corrected, {} points fused)",
            verified.current_kf_id, verified.loop_kf_id, report.corrected_keyframes, report.fused_map_points
        );
        true
    }

    fn wait_for_local_mapping_pause(&self) -> bool {
        let start = Instant::now();
        while !self.shared.is_local_mapping_paused() {
            if self.shared.is_shutdown_requested() {
                return false;
            }
            if start.elapsed() > PAUSE_TIMEOUT {
                warn!("[LoopClosing] timeout waiting for Local Mapping to pause");
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }
        true
    }

    pub fn stats(&self) -> &LoopCloserStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::ScalePyramid;
    use crate::geometry::Sim3;
    use crate::loop_closing::verifier::tests::{add_place, drift, pose_cw_at};
    use crate::tracking::matching::tests::{camera, landmarks};

    #[test]
    fn test_try_close_corrects_verified_loop() {
        let lms = landmarks(150, 21);
        let shared = SharedState::new(ScalePyramid::default());
        let places = [pose_cw_at(0.0), pose_cw_at(0.3)];
        let (loop_kfs, current_kfs) = {
            let mut atlas = shared.atlas.write();
            let loop_kfs = add_place(&mut atlas.map, &places, &lms, &Sim3::identity());
            let current_kfs = add_place(&mut atlas.map, &places, &lms, &drift());
            (loop_kfs, current_kfs)
        };
        // No Local Mapping thread here; acknowledge the pause up front.
        shared.set_local_mapping_paused(true);

        let mut closer = LoopCloser::new(Arc::clone(&shared), camera(), LoopCloserConfig::default());
        assert!(closer.try_close(current_kfs[1], &[loop_kfs[1]]));

        assert_eq!(closer.stats().loops_corrected, 1);
        assert!(!shared.should_pause_local_mapping());
        let atlas = shared.atlas.read();
        assert!(atlas.map.big_change_index() > 0);
        let current = atlas.map.get_keyframe(current_kfs[1]).unwrap();
        assert!(current.loop_edges.contains(&loop_kfs[1]));
    }

    #[test]
    fn test_run_drains_queue_on_disconnect() {
        let shared = SharedState::new(ScalePyramid::default());
        let (tx, rx) = crossbeam_channel::bounded(4);
        for id in 0..3 {
            shared.keyframe_sent_to_loop_closing();
            tx.send(KeyFrameId(id)).unwrap();
        }
        drop(tx);

        let mut closer = LoopCloser::new(Arc::clone(&shared), camera(), LoopCloserConfig::default());
        closer.run(rx);

        assert_eq!(closer.stats().keyframes_processed, 3);
        assert_eq!(closer.stats().loops_corrected, 0);
        assert!(shared.is_mapping_idle());
    }
}
