//! Local Mapping thread.
//!
//! Completes the keyframes sent by Tracking, triangulates new map points
//! against covisible keyframes, fuses duplicates, runs local bundle
//! adjustment and culls redundant map points and keyframes.

mod local_mapper;
pub mod search_in_neighbors;
pub mod triangulation;

pub use local_mapper::{cull_recent_map_points, cull_redundant_keyframes, LocalMapper};
pub use search_in_neighbors::{fuse_into_keyframe, search_in_neighbors, FuseResult, SearchInNeighborsConfig};
pub use triangulation::{triangulate_from_neighbors, TriangulationConfig, TriangulationResult};
