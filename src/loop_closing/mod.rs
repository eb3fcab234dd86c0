//! Loop Closing.
//!
//! Detects when the camera returns to an already mapped place and removes
//! the drift accumulated in between.
//!
//! # Architecture
//!
//! 1. **Detection** (`detector.rs`): BoW candidates with covisibility-group consistency
//! 2. **Verification** (`verifier.rs`, `sim3_solver.rs`): Sim3 RANSAC, refinement and
//!    projection matching
//! 3. **Correction** (`corrector.rs`): Sim3 propagation, map point fusion and pose graph
//! 4. **Thread** (`loop_closer.rs`): Main loop closing thread receiving keyframes
//!
//! # Threading Model
//!
//! The LoopCloser runs in its own thread, receiving keyframes from Local Mapping
//! via a channel. Local Mapping is paused while the map is corrected; the pose
//! graph is collected under the read lock, solved without a lock and applied
//! under the write lock.

pub mod corrector;
pub mod detector;
pub mod loop_closer;
pub mod sim3_solver;
pub mod verifier;

pub use corrector::{correct_loop, CorrectorConfig, LoopCorrection};
pub use detector::{LoopDetector, LoopDetectorConfig};
pub use loop_closer::{LoopCloser, LoopCloserConfig, LoopCloserStats};
pub use sim3_solver::{compute_sim3_horn, compute_sim3_ransac, Sim3Result, Sim3SolverConfig};
pub use verifier::{verify_loop_candidates, LoopVerifierConfig, VerifiedLoop};
