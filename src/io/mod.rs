//! File formats.

pub mod trajectory;

pub use trajectory::{read_trajectory, write_trajectory, TrajectoryRecord};
