//! Tracking: turns the features of each frame into a camera pose.
//!
//! - Two-view map initialization
//! - Motion-model and reference-keyframe pose prediction
//! - Pose refinement against the local map
//! - Relocalization when lost
//! - New KeyFrame decision

pub mod frame;
pub mod initializer;
pub mod keyframe_decision;
pub mod local_map;
pub mod matching;
pub mod motion_model;
pub mod pose_estimation;
pub mod relocalization;
pub mod result;
pub mod state;
pub mod tracker;

pub use frame::Frame;
pub use result::{StampedPose, TimingStats, TrackingMetrics, TrackingResult};
pub use state::TrackingState;
pub use tracker::Tracker;
