//! Errors surfaced to callers of [`crate::SlamSystem`].
//!
//! Only construction and input validation fail with an error. Tracking loss
//! is a state, and optimizer non-convergence is logged and absorbed by the
//! unit that hit it.

use thiserror::Error;

use crate::config::ConfigLoadError;

#[derive(Error, Debug)]
pub enum SlamError {
    /// The input image has an unsupported shape or an inconsistent buffer.
    /// The frame is dropped and the tracking state is left untouched.
    #[error("invalid image format: {reason}")]
    InvalidImageFormat { reason: String },

    /// The vocabulary or settings could not be loaded. Fatal at construction.
    #[error("failed to load configuration: {0}")]
    ConfigLoad(#[from] ConfigLoadError),
}
