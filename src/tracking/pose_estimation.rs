//! Pose estimation helpers for the tracking thread.
//!
//! Bridges a [`Frame`]'s map point associations and the pose-only optimizer:
//! the frame's current associations become 3D-2D observations, and the
//! optimizer's outlier classification is written back to the frame.

use crate::atlas::map::Map;
use crate::geometry::CameraModel;
use crate::optimizer::{optimize_pose, PoseObservation, PoseOptimizationConfig};
use crate::tracking::frame::Frame;

/// Refine `frame.pose_cw` against its associated map points.
///
/// Outlier flags are rewritten for every association. Returns the number of
/// inliers, or 0 when the frame has no pose or too few associations (in which
/// case the pose is left untouched).
pub fn optimize_frame_pose(frame: &mut Frame, map: &Map, camera: &CameraModel, config: &PoseOptimizationConfig) -> usize {
    let Some(initial) = frame.pose_cw.clone() else {
        return 0;
    };
    let pyramid = map.pyramid();

    let mut feature_indices = Vec::new();
    let mut observations = Vec::new();
    for (idx, mp_id) in frame.map_points.iter().enumerate() {
        let Some(mp) = mp_id.and_then(|id| map.get_map_point(id)) else {
            continue;
        };
        if mp.is_bad {
            continue;
        }
        let kp = &frame.keypoints[idx];
        feature_indices.push(idx);
        observations.push(PoseObservation {
            point_world: mp.position,
            uv: kp.pt(),
            inv_sigma2: pyramid.inv_sigma2(kp.octave),
        });
    }

    let Some(result) = optimize_pose(&initial, &observations, camera, config) else {
        return 0;
    };

    frame.outliers.iter_mut().for_each(|o| *o = false);
    for (k, &idx) in feature_indices.iter().enumerate() {
        frame.outliers[idx] = result.outliers[k];
    }
    // Associations to points that vanished from the map count as outliers.
    for (idx, mp_id) in frame.map_points.iter().enumerate() {
        if let Some(id) = mp_id {
            if map.get_map_point(*id).map_or(true, |mp| mp.is_bad) {
                frame.outliers[idx] = true;
            }
        }
    }
    frame.pose_cw = Some(result.pose_cw);
    result.num_inliers
}
