//! Inter-thread message types.
//!
//! These types are sent between threads via channels to coordinate
//! SLAM processing.

use crate::atlas::map::{KeyFrameId, MapPointId};

/// Message sent from Tracking to Local Mapping when a new keyframe is created.
///
/// Tracking inserts the KeyFrame into the map itself so it can use it as its
/// reference right away; Local Mapping completes the insertion:
/// 1. Compute the BoW vectors if Tracking did not
/// 2. Associate the map points matched during tracking
/// 3. Update the covisibility graph and register the KeyFrame for place recognition
#[derive(Debug, Clone)]
pub struct NewKeyFrameMsg {
    /// The ID of the KeyFrame already stored in the map.
    pub keyframe_id: KeyFrameId,

    /// Map point associations from tracking.
    /// `matched_map_points[i] = Some(mp_id)` if feature i was matched
    /// to an existing map point during tracking. Empty for the KeyFrames of
    /// the initial map, whose associations already exist.
    pub matched_map_points: Vec<Option<MapPointId>>,
}
