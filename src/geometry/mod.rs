//! Geometry utilities: rigid and similarity transforms, the camera model,
//! triangulation, two-view reconstruction and PnP.

pub mod camera;
pub mod pnp;
pub mod se3;
pub mod sim3;
pub mod so3;
pub mod triangulation;
pub mod two_view;

pub use camera::CameraModel;
pub use pnp::{solve_pnp_ransac, PnPParams, PnPResult};
pub use se3::SE3;
pub use sim3::Sim3;
pub use two_view::{reconstruct_two_view, TwoViewFailure, TwoViewParams, TwoViewReconstruction};
