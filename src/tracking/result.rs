//! Tracking results and diagnostics structures.
//!
//! These types describe what happened during processing of a single frame:
//! - high level tracking state
//! - the world→camera pose, when tracking succeeded
//! - correspondence counts
//! - timing information for profiling

use crate::atlas::map::KeyFrameId;
use crate::geometry::SE3;
use crate::tracking::TrackingState;

/// Summary of tracking for a single frame.
#[derive(Debug, Clone)]
pub struct TrackingResult {
    pub state: TrackingState,
    /// T_cw; `Some` only when `state` is `Ok`.
    pub pose: Option<SE3>,
    pub reference_kf: Option<KeyFrameId>,
    pub metrics: TrackingMetrics,
    pub timing: TimingStats,
}

/// Scalar metrics useful for debugging tracking quality.
#[derive(Debug, Clone, Default)]
pub struct TrackingMetrics {
    pub frame_id: u64,
    pub n_features: usize,
    /// Map point matches before the final pose optimization.
    pub n_map_point_matches: usize,
    pub n_inliers: usize,
    pub inlier_ratio: f64,
    pub keyframe_inserted: bool,
    pub relocalized: bool,
}

/// Timing breakdown for a frame, in milliseconds.
#[derive(Debug, Clone, Default)]
pub struct TimingStats {
    pub total_ms: f64,
    pub extract_ms: f64,
    pub initialize_ms: f64,
    pub track_ms: f64,
    pub local_map_ms: f64,
    pub relocal_ms: f64,
}

impl TimingStats {
    pub fn zero() -> Self {
        Self::default()
    }
}

impl TrackingResult {
    /// Result for a frame that was not processed (after shutdown).
    pub fn shutdown(frame_id: u64) -> Self {
        Self {
            state: TrackingState::Shutdown,
            pose: None,
            reference_kf: None,
            metrics: TrackingMetrics {
                frame_id,
                ..Default::default()
            },
            timing: TimingStats::zero(),
        }
    }

    /// Result for a frame dropped before tracking; `state` is unchanged.
    pub fn dropped(frame_id: u64, state: TrackingState, reference_kf: Option<KeyFrameId>) -> Self {
        Self {
            state,
            reference_kf,
            ..Self::shutdown(frame_id)
        }
    }
}

/// A frame pose with its time stamp.
#[derive(Debug, Clone, PartialEq)]
pub struct StampedPose {
    pub frame_id: u64,
    pub timestamp: f64,
    /// T_cw
    pub pose: SE3,
}
