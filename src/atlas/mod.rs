//! Atlas module - the shared map store.
//!
//! - [`map::KeyFrame`] - KeyFrames with covisibility and spanning tree
//! - [`map::MapPoint`] - 3D landmarks with observation tracking
//! - [`map::Map`] - Container with association, culling and fusion operations
//! - [`keyframe_db::KeyFrameDatabase`] - BoW inverted file for place recognition
//! - [`atlas::Atlas`] - Map plus database, guarded by the system's `RwLock`

pub mod atlas;
pub mod keyframe_db;
pub mod map;

pub use atlas::Atlas;
pub use keyframe_db::{Candidate, KeyFrameDatabase};
pub use map::{KeyFrame, KeyFrameId, Map, MapPoint, MapPointId};
