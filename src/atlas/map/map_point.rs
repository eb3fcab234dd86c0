//! MapPoint - A 3D landmark observed by KeyFrames.
//!
//! MapPoints are the fundamental 3D structure elements in the map.
//! Each MapPoint tracks which KeyFrames observe it, maintains quality
//! metrics for culling decisions, and stores viewing geometry constraints.

use std::collections::HashMap;

use nalgebra::{Vector2, Vector3};

use crate::features::{Descriptor, ScalePyramid};
use crate::geometry::{CameraModel, SE3};

use super::types::{KeyFrameId, MapPointId};

/// Minimum cosine between the viewing ray and the mean viewing direction for
/// a point to be considered visible (60°).
pub const VIEW_COS_LIMIT: f64 = 0.5;

/// A 3D map point (landmark) observed by one or more KeyFrames.
#[derive(Clone)]
pub struct MapPoint {
    /// Unique identifier for this MapPoint.
    pub id: MapPointId,

    /// 3D position in world frame.
    pub position: Vector3<f64>,

    /// Representative descriptor: the observation with the least median
    /// distance to all other observations.
    pub descriptor: Descriptor,

    /// KeyFrames observing this point, mapped to feature index in that KeyFrame.
    pub observations: HashMap<KeyFrameId, usize>,

    /// Mean viewing direction (unit vector, world frame).
    pub normal: Vector3<f64>,

    /// Minimum distance at which this point can be reliably observed.
    pub min_distance: f64,

    /// Maximum distance at which this point can be reliably observed.
    pub max_distance: f64,

    /// Number of times this point was visible in a frame (in frustum).
    pub visible_count: u32,

    /// Number of times this point was successfully matched/found.
    pub found_count: u32,

    /// KeyFrame that created this MapPoint (reference for the depth range).
    pub first_kf_id: KeyFrameId,

    /// Whether this point is marked as bad (should be removed).
    pub is_bad: bool,
}

/// Where a map point lands in a camera, as computed by [`MapPoint::project_into`].
#[derive(Debug, Clone, Copy)]
pub struct ProjectedPoint {
    pub uv: Vector2<f64>,
    /// Distance from the camera center.
    pub distance: f64,
    /// Cosine between the viewing ray and the point's mean normal.
    pub view_cos: f64,
    /// Pyramid level the point is expected to be detected at.
    pub predicted_level: u8,
}

impl MapPoint {
    pub fn new(id: MapPointId, position: Vector3<f64>, descriptor: Descriptor, first_kf_id: KeyFrameId) -> Self {
        Self {
            id,
            position,
            descriptor,
            observations: HashMap::new(),
            normal: Vector3::zeros(),
            min_distance: 0.0,
            max_distance: f64::INFINITY,
            visible_count: 1,
            found_count: 1,
            first_kf_id,
            is_bad: false,
        }
    }

    pub fn add_observation(&mut self, kf_id: KeyFrameId, feature_idx: usize) {
        self.observations.insert(kf_id, feature_idx);
    }

    /// Returns true if the observation existed and was removed.
    pub fn erase_observation(&mut self, kf_id: KeyFrameId) -> bool {
        self.observations.remove(&kf_id).is_some()
    }

    pub fn num_observations(&self) -> usize {
        self.observations.len()
    }

    /// Compute the found ratio: found_count / visible_count.
    ///
    /// Returns 1.0 if visible_count is 0.
    pub fn found_ratio(&self) -> f64 {
        if self.visible_count == 0 {
            1.0
        } else {
            self.found_count as f64 / self.visible_count as f64
        }
    }

    pub fn increase_visible(&mut self, n: u32) {
        self.visible_count += n;
    }

    pub fn increase_found(&mut self, n: u32) {
        self.found_count += n;
    }

    /// Check if this MapPoint should be culled based on quality metrics.
    ///
    /// A point is bad if it has fewer than `min_observations` observers or
    /// its found ratio is below `min_found_ratio`.
    pub fn should_cull(&self, min_found_ratio: f64, min_observations: usize) -> bool {
        self.is_bad || self.num_observations() < min_observations || self.found_ratio() < min_found_ratio
    }

    pub fn set_bad(&mut self) {
        self.is_bad = true;
    }

    /// Update the mean normal vector and the scale-invariance distance range.
    ///
    /// # Arguments
    /// * `observer_centers` - Camera centers of all observing KeyFrames
    /// * `reference` - Camera center and octave of the observation in the first KeyFrame
    /// * `pyramid` - ORB scale pyramid
    pub fn update_normal_and_depth(
        &mut self,
        observer_centers: impl Iterator<Item = Vector3<f64>>,
        reference: (Vector3<f64>, u8),
        pyramid: &ScalePyramid,
    ) {
        let mut normal_sum = Vector3::zeros();
        let mut n = 0usize;
        for center in observer_centers {
            let dir = self.position - center;
            let dist = dir.norm();
            if dist > 1e-10 {
                normal_sum += dir / dist;
                n += 1;
            }
        }
        if n == 0 {
            return;
        }
        let norm = normal_sum.norm();
        if norm > 1e-10 {
            self.normal = normal_sum / norm;
        }

        let (ref_center, ref_level) = reference;
        let dist = (self.position - ref_center).norm();
        let top_scale = pyramid.scale_factors[pyramid.n_levels - 1];
        self.max_distance = dist * pyramid.scale(ref_level);
        self.min_distance = self.max_distance / top_scale;
    }

    /// Lower bound of the accepted viewing distance (with slack).
    pub fn min_invariance_distance(&self) -> f64 {
        0.8 * self.min_distance
    }

    /// Upper bound of the accepted viewing distance (with slack).
    pub fn max_invariance_distance(&self) -> f64 {
        1.2 * self.max_distance
    }

    /// Check if a viewing distance is within the valid range.
    pub fn is_in_distance_range(&self, distance: f64) -> bool {
        distance >= self.min_invariance_distance() && distance <= self.max_invariance_distance()
    }

    /// Project into a camera at `pose_cw`, rejecting points behind the camera,
    /// outside the image (grown by `margin` pixels), outside the distance range
    /// or seen at more than 60° from the mean viewing direction.
    pub fn project_into(
        &self,
        pose_cw: &SE3,
        camera: &CameraModel,
        pyramid: &ScalePyramid,
        margin: f64,
    ) -> Option<ProjectedPoint> {
        let p_cam = pose_cw.transform_point(&self.position);
        let uv = camera.project(&p_cam)?;
        if uv.x < -margin
            || uv.y < -margin
            || uv.x >= camera.width as f64 + margin
            || uv.y >= camera.height as f64 + margin
        {
            return None;
        }

        let ray = self.position - pose_cw.camera_center();
        let distance = ray.norm();
        if !self.is_in_distance_range(distance) {
            return None;
        }
        let view_cos = if self.normal.norm_squared() > 0.0 {
            ray.dot(&self.normal) / distance
        } else {
            1.0
        };
        if view_cos < VIEW_COS_LIMIT {
            return None;
        }

        Some(ProjectedPoint {
            uv,
            distance,
            view_cos,
            predicted_level: pyramid.predict_scale(distance, self.max_distance),
        })
    }
}

impl std::fmt::Debug for MapPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapPoint")
            .field("id", &self.id)
            .field("position", &self.position)
            .field("observations", &self.observations.len())
            .field("visible_count", &self.visible_count)
            .field("found_count", &self.found_count)
            .field("is_bad", &self.is_bad)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn create_test_mappoint() -> MapPoint {
        MapPoint::new(
            MapPointId::new(1),
            Vector3::new(0.0, 0.0, 4.0),
            Descriptor::default(),
            KeyFrameId::new(0),
        )
    }

    #[test]
    fn test_add_remove_observation() {
        let mut mp = create_test_mappoint();

        mp.add_observation(KeyFrameId::new(1), 5);
        mp.add_observation(KeyFrameId::new(2), 10);

        assert_eq!(mp.num_observations(), 2);
        assert_eq!(mp.observations.get(&KeyFrameId::new(1)), Some(&5));

        assert!(mp.erase_observation(KeyFrameId::new(1)));
        assert_eq!(mp.num_observations(), 1);
        assert!(!mp.erase_observation(KeyFrameId::new(1)));
    }

    #[test]
    fn test_found_ratio() {
        let mut mp = create_test_mappoint();
        assert_eq!(mp.found_ratio(), 1.0);

        mp.visible_count = 3;
        mp.found_count = 2;
        assert_relative_eq!(mp.found_ratio(), 2.0 / 3.0);
    }

    #[test]
    fn test_should_cull() {
        let mut mp = create_test_mappoint();

        mp.add_observation(KeyFrameId::new(1), 0);
        mp.add_observation(KeyFrameId::new(2), 0);
        assert!(mp.should_cull(0.25, 3));

        mp.add_observation(KeyFrameId::new(3), 0);
        assert!(!mp.should_cull(0.25, 3));

        mp.visible_count = 100;
        mp.found_count = 10;
        assert!(mp.should_cull(0.25, 3));

        mp.found_count = 30;
        assert!(!mp.should_cull(0.25, 3));

        mp.set_bad();
        assert!(mp.should_cull(0.0, 0));
    }

    #[test]
    fn test_normal_and_depth_range() {
        let mut mp = create_test_mappoint();
        let pyramid = ScalePyramid::new(1.2, 8);
        let centers = vec![Vector3::new(-0.1, 0.0, 0.0), Vector3::new(0.1, 0.0, 0.0)];
        mp.update_normal_and_depth(centers.into_iter(), (Vector3::zeros(), 0), &pyramid);

        assert_relative_eq!(mp.normal, Vector3::new(0.0, 0.0, 1.0), epsilon = 1e-9);
        assert_relative_eq!(mp.max_distance, 4.0, epsilon = 1e-12);
        assert_relative_eq!(mp.min_distance, 4.0 / 1.2f64.powi(7), epsilon = 1e-12);
        assert!(mp.is_in_distance_range(4.0));
        assert!(!mp.is_in_distance_range(10.0));
    }

    #[test]
    fn test_project_into() {
        let mut mp = create_test_mappoint();
        let pyramid = ScalePyramid::default();
        let camera = CameraModel::pinhole(500.0, 500.0, 320.0, 240.0, 640, 480);
        mp.update_normal_and_depth(std::iter::once(Vector3::zeros()), (Vector3::zeros(), 0), &pyramid);

        let proj = mp.project_into(&SE3::identity(), &camera, &pyramid, 0.0).unwrap();
        assert_relative_eq!(proj.uv.x, 320.0);
        assert_relative_eq!(proj.distance, 4.0);
        assert_eq!(proj.predicted_level, 0);

        // Looking from behind the point.
        let behind = SE3::from_rt(&nalgebra::Matrix3::identity(), &Vector3::new(0.0, 0.0, -8.0));
        assert!(mp.project_into(&behind, &camera, &pyramid, 0.0).is_none());
    }
}
