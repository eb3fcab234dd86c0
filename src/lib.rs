//! Monocular visual SLAM: ORB tracking, local mapping and loop closing over
//! a shared map.
//!
//! [`SlamSystem`] is the entry point: it tracks frames in the caller's
//! thread and runs Local Mapping and Loop Closing in background threads.

pub mod atlas;
pub mod config;
pub mod error;
pub mod evaluation;
pub mod features;
pub mod geometry;
pub mod io;
pub mod local_mapping;
pub mod loop_closing;
pub mod optimizer;
pub mod synthetic;
pub mod system;
pub mod tracking;
pub mod vocabulary;

pub use config::Settings;
pub use error::SlamError;
pub use features::{FeatureSet, ImageInput};
pub use geometry::SE3;
pub use system::SlamSystem;
pub use tracking::{StampedPose, TrackingResult, TrackingState};
