//! Nonlinear least-squares optimizers.
//!
//! - Pose-only optimization (tracking)
//! - Local and global bundle adjustment (keyframe poses + map point positions)
//! - Essential-graph pose graph optimization (loop closing)
//! - Sim3 refinement between two keyframes (loop verification)
//!
//! Long-running optimizations follow a collect / solve / apply split so that
//! the map lock is never held while solving.

pub mod global_ba;
pub mod local_ba;
pub mod pose_graph;
pub mod pose_optimizer;
pub mod reprojection;
pub mod sim3_refine;

use thiserror::Error;

pub use global_ba::{collect_global_ba_data, run_global_ba, GlobalBAConfig};
pub use local_ba::{
    apply_ba_results, collect_local_ba_data, cull_ba_outliers, solve_ba, BAObservation, BAProblemData, BAResultData,
    LocalBAConfig,
};
pub use pose_graph::{
    apply_pose_graph_results, collect_pose_graph_data, solve_pose_graph, EdgeType, PoseGraphConfig, PoseGraphEdge,
    PoseGraphProblemData, PoseGraphResult,
};
pub use pose_optimizer::{optimize_pose, PoseObservation, PoseOptimizationConfig, PoseOptimizationResult};
pub use sim3_refine::{refine_sim3, Sim3Correspondence, Sim3RefineConfig, Sim3RefineResult};

/// Why an optimization produced no usable estimate. Callers keep their
/// previous estimates and log the failure.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OptimizationError {
    #[error("nothing to optimize")]
    Empty,
    #[error("linear system is singular")]
    Singular,
    #[error("cost did not decrease ({initial:.4} -> {final_cost:.4})")]
    NotConverged { initial: f64, final_cost: f64 },
    #[error("cost is not finite")]
    NonFinite,
    #[error("aborted")]
    Aborted,
}
