//! KeyFrame - A selected frame with map structure relationships.
//!
//! KeyFrames are the core nodes of the SLAM graph. They contain:
//! - Undistorted keypoints and their descriptors, indexed by a feature grid
//! - Pose estimate (SE3 transform)
//! - Graph relationships (covisibility, spanning tree, loop edges)
//!
//! The covisibility graph connects KeyFrames that share MapPoint observations,
//! while the spanning tree provides a minimal connected structure used by
//! loop correction and trajectory reconstruction.

use std::collections::{HashMap, HashSet};

use nalgebra::Vector3;

use crate::features::{Descriptor, FeatureGrid, FeatureSet, KeyPoint};
use crate::geometry::SE3;
use crate::vocabulary::{BowVector, FeatureVector};

use super::types::{KeyFrameId, MapPointId};

/// A KeyFrame in the SLAM map.
#[derive(Clone)]
pub struct KeyFrame {
    /// Unique identifier for this KeyFrame.
    pub id: KeyFrameId,

    /// Id of the tracked frame this KeyFrame was promoted from.
    pub frame_id: u64,

    /// Timestamp in seconds.
    pub timestamp: f64,

    /// Pose: transform from camera to world (T_wc).
    /// To transform a point from camera to world: p_world = pose.transform_point(p_cam)
    pub pose: SE3,

    // ─────────────────────────────────────────────────────────────────────────
    // Visual Features
    // ─────────────────────────────────────────────────────────────────────────
    /// Undistorted keypoints.
    pub keypoints: Vec<KeyPoint>,

    /// ORB descriptors for each keypoint.
    pub descriptors: Vec<Descriptor>,

    grid: FeatureGrid,

    /// Bag-of-Words representation used for place recognition.
    pub bow_vector: Option<BowVector>,

    /// Feature indices grouped by vocabulary node, for guided matching.
    pub feature_vector: Option<FeatureVector>,

    // ─────────────────────────────────────────────────────────────────────────
    // Map Associations
    // ─────────────────────────────────────────────────────────────────────────
    /// Feature index → MapPoint association.
    pub map_point_ids: Vec<Option<MapPointId>>,

    // ─────────────────────────────────────────────────────────────────────────
    // Covisibility Graph
    // ─────────────────────────────────────────────────────────────────────────
    /// Covisibility weights: connected KeyFrame → number of shared MapPoints.
    covisibility_weights: HashMap<KeyFrameId, usize>,

    /// Covisible KeyFrames sorted by weight (best first, ties by id).
    /// Rebuilt on every weight change so readers never need `&mut`.
    ordered_covisibles: Vec<(KeyFrameId, usize)>,

    // ─────────────────────────────────────────────────────────────────────────
    // Spanning Tree
    // ─────────────────────────────────────────────────────────────────────────
    /// Parent KeyFrame in the spanning tree. None for the root.
    pub parent_id: Option<KeyFrameId>,

    /// Children KeyFrames in the spanning tree.
    pub children_ids: HashSet<KeyFrameId>,

    /// KeyFrames this one was loop-closed with.
    pub loop_edges: HashSet<KeyFrameId>,

    // ─────────────────────────────────────────────────────────────────────────
    // Status
    // ─────────────────────────────────────────────────────────────────────────
    /// Protected from culling while loop closing works on it.
    pub not_erase: bool,

    /// Whether this KeyFrame is marked as bad (to be removed).
    pub is_bad: bool,
}

impl KeyFrame {
    /// Create a new KeyFrame.
    ///
    /// # Arguments
    /// * `id` - Unique identifier
    /// * `frame_id` - Id of the originating frame
    /// * `timestamp` - Timestamp in seconds
    /// * `pose` - Camera-to-world transform (T_wc)
    /// * `features` - Undistorted keypoints and descriptors
    /// * `image_size` - Image width and height, for the feature grid
    pub fn new(
        id: KeyFrameId,
        frame_id: u64,
        timestamp: f64,
        pose: SE3,
        features: FeatureSet,
        image_size: (u32, u32),
    ) -> Self {
        let FeatureSet {
            keypoints,
            descriptors,
        } = features;
        let grid = FeatureGrid::new(&keypoints, image_size.0 as f64, image_size.1 as f64);
        let num_features = keypoints.len();

        Self {
            id,
            frame_id,
            timestamp,
            pose,
            keypoints,
            descriptors,
            grid,
            bow_vector: None,
            feature_vector: None,
            map_point_ids: vec![None; num_features],
            covisibility_weights: HashMap::new(),
            ordered_covisibles: Vec::new(),
            parent_id: None,
            children_ids: HashSet::new(),
            loop_edges: HashSet::new(),
            not_erase: false,
            is_bad: false,
        }
    }

    /// Get the camera position in world frame.
    pub fn camera_center(&self) -> Vector3<f64> {
        self.pose.translation
    }

    /// World-to-camera transform (T_cw).
    pub fn pose_cw(&self) -> SE3 {
        self.pose.inverse()
    }

    /// Set the pose from a world-to-camera transform.
    pub fn set_pose_cw(&mut self, pose_cw: &SE3) {
        self.pose = pose_cw.inverse();
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Bag-of-Words accessors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn set_bow(&mut self, bow: BowVector, fv: FeatureVector) {
        self.bow_vector = Some(bow);
        self.feature_vector = Some(fv);
    }

    pub fn bow_vector(&self) -> Option<&BowVector> {
        self.bow_vector.as_ref()
    }

    pub fn feature_vector(&self) -> Option<&FeatureVector> {
        self.feature_vector.as_ref()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Map Point Associations
    // ─────────────────────────────────────────────────────────────────────────

    /// Get the MapPoint ID for a given feature index.
    pub fn get_map_point(&self, feature_idx: usize) -> Option<MapPointId> {
        self.map_point_ids.get(feature_idx).copied().flatten()
    }

    /// Associate a feature with a MapPoint.
    ///
    /// Returns the previous MapPoint ID if there was one.
    pub fn set_map_point(&mut self, feature_idx: usize, mp_id: MapPointId) -> Option<MapPointId> {
        let slot = self.map_point_ids.get_mut(feature_idx)?;
        slot.replace(mp_id)
    }

    /// Remove the association for a feature.
    pub fn erase_map_point(&mut self, feature_idx: usize) -> Option<MapPointId> {
        self.map_point_ids.get_mut(feature_idx)?.take()
    }

    /// Get all associated MapPoint IDs with their feature indices.
    pub fn get_map_point_indices(&self) -> impl Iterator<Item = (usize, MapPointId)> + '_ {
        self.map_point_ids
            .iter()
            .enumerate()
            .filter_map(|(idx, mp)| mp.map(|id| (idx, id)))
    }

    /// Count the number of associated MapPoints.
    pub fn num_map_points(&self) -> usize {
        self.map_point_ids.iter().filter(|mp| mp.is_some()).count()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Covisibility Graph
    // ─────────────────────────────────────────────────────────────────────────

    /// Add or update a covisibility connection. A weight of zero removes it.
    pub fn add_covisibility(&mut self, kf_id: KeyFrameId, weight: usize) {
        if kf_id == self.id {
            return;
        }
        if weight == 0 {
            self.erase_covisibility(kf_id);
            return;
        }
        self.covisibility_weights.insert(kf_id, weight);
        self.reorder_covisibles();
    }

    /// Remove a covisibility connection.
    pub fn erase_covisibility(&mut self, kf_id: KeyFrameId) {
        if self.covisibility_weights.remove(&kf_id).is_some() {
            self.reorder_covisibles();
        }
    }

    /// Get the covisibility weight with another KeyFrame.
    pub fn get_covisibility_weight(&self, kf_id: KeyFrameId) -> usize {
        self.covisibility_weights.get(&kf_id).copied().unwrap_or(0)
    }

    /// Get all covisible KeyFrames (unordered).
    pub fn get_covisibles(&self) -> impl Iterator<Item = &KeyFrameId> {
        self.covisibility_weights.keys()
    }

    pub fn covisibility_weights(&self) -> &HashMap<KeyFrameId, usize> {
        &self.covisibility_weights
    }

    /// All covisible KeyFrames with their weights, best first.
    pub fn ordered_covisibles(&self) -> &[(KeyFrameId, usize)] {
        &self.ordered_covisibles
    }

    /// Get the N best covisible KeyFrames (most shared points first).
    pub fn get_best_covisibles(&self, n: usize) -> Vec<KeyFrameId> {
        self.ordered_covisibles.iter().take(n).map(|(id, _)| *id).collect()
    }

    /// Get covisible KeyFrames with at least `min_weight` shared points.
    pub fn get_covisibles_above_weight(&self, min_weight: usize) -> Vec<KeyFrameId> {
        self.ordered_covisibles
            .iter()
            .take_while(|(_, w)| *w >= min_weight)
            .map(|(id, _)| *id)
            .collect()
    }

    fn reorder_covisibles(&mut self) {
        self.ordered_covisibles = self.covisibility_weights.iter().map(|(id, w)| (*id, *w)).collect();
        self.ordered_covisibles.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Spanning Tree
    // ─────────────────────────────────────────────────────────────────────────

    pub fn set_parent(&mut self, parent_id: KeyFrameId) {
        self.parent_id = Some(parent_id);
    }

    pub fn add_child(&mut self, child_id: KeyFrameId) {
        self.children_ids.insert(child_id);
    }

    pub fn erase_child(&mut self, child_id: KeyFrameId) {
        self.children_ids.remove(&child_id);
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    pub fn add_loop_edge(&mut self, kf_id: KeyFrameId) {
        self.not_erase = true;
        self.loop_edges.insert(kf_id);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Status
    // ─────────────────────────────────────────────────────────────────────────

    pub fn set_bad(&mut self) {
        self.is_bad = true;
    }

    pub fn num_features(&self) -> usize {
        self.keypoints.len()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Spatial Queries
    // ─────────────────────────────────────────────────────────────────────────

    /// Indices of keypoints within `radius` of `(u, v)`, optionally limited to
    /// an inclusive octave range.
    pub fn get_features_in_area(&self, u: f64, v: f64, radius: f64, levels: Option<(u8, u8)>) -> Vec<usize> {
        self.grid.features_in_area(&self.keypoints, u, v, radius, levels)
    }
}

impl std::fmt::Debug for KeyFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyFrame")
            .field("id", &self.id)
            .field("frame_id", &self.frame_id)
            .field("timestamp", &self.timestamp)
            .field("num_features", &self.num_features())
            .field("num_map_points", &self.num_map_points())
            .field("covisibles", &self.covisibility_weights.len())
            .field("parent", &self.parent_id)
            .field("num_children", &self.children_ids.len())
            .field("is_bad", &self.is_bad)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_keyframe_with_features(id: u64, num_features: usize) -> KeyFrame {
        let keypoints = (0..num_features)
            .map(|i| KeyPoint::new(10.0 + 20.0 * i as f64, 100.0))
            .collect();
        let descriptors = vec![Descriptor::default(); num_features];
        KeyFrame::new(
            KeyFrameId::new(id),
            id,
            id as f64 * 0.1,
            SE3::identity(),
            FeatureSet::new(keypoints, descriptors),
            (640, 480),
        )
    }

    #[test]
    fn test_map_point_association() {
        let mut kf = create_keyframe_with_features(1, 10);

        kf.set_map_point(3, MapPointId::new(100));
        assert_eq!(kf.get_map_point(3), Some(MapPointId::new(100)));
        assert_eq!(kf.get_map_point(4), None);
        assert_eq!(kf.num_map_points(), 1);

        let prev = kf.set_map_point(3, MapPointId::new(200));
        assert_eq!(prev, Some(MapPointId::new(100)));

        let erased = kf.erase_map_point(3);
        assert_eq!(erased, Some(MapPointId::new(200)));
        assert_eq!(kf.get_map_point(3), None);

        // Out of range is a no-op.
        assert_eq!(kf.set_map_point(99, MapPointId::new(1)), None);
        assert_eq!(kf.num_map_points(), 0);
    }

    #[test]
    fn test_covisibility_graph() {
        let mut kf = create_keyframe_with_features(1, 0);

        kf.add_covisibility(KeyFrameId::new(2), 50);
        kf.add_covisibility(KeyFrameId::new(3), 100);
        kf.add_covisibility(KeyFrameId::new(4), 25);

        assert_eq!(kf.get_covisibility_weight(KeyFrameId::new(2)), 50);
        assert_eq!(kf.get_covisibility_weight(KeyFrameId::new(5)), 0);

        let best = kf.get_best_covisibles(2);
        assert_eq!(best, vec![KeyFrameId::new(3), KeyFrameId::new(2)]);

        let above_30 = kf.get_covisibles_above_weight(30);
        assert_eq!(above_30.len(), 2);

        kf.add_covisibility(KeyFrameId::new(3), 0);
        assert_eq!(kf.get_best_covisibles(1), vec![KeyFrameId::new(2)]);
    }

    #[test]
    fn test_covisibility_no_self_connection() {
        let mut kf = create_keyframe_with_features(1, 0);
        kf.add_covisibility(KeyFrameId::new(1), 100);
        assert_eq!(kf.get_covisibility_weight(KeyFrameId::new(1)), 0);
    }

    #[test]
    fn test_spanning_tree() {
        let mut kf1 = create_keyframe_with_features(1, 0);
        let mut kf2 = create_keyframe_with_features(2, 0);

        assert!(kf1.is_root());

        kf2.set_parent(KeyFrameId::new(1));
        kf1.add_child(KeyFrameId::new(2));

        assert!(!kf2.is_root());
        assert_eq!(kf2.parent_id, Some(KeyFrameId::new(1)));
        assert!(kf1.children_ids.contains(&KeyFrameId::new(2)));
    }

    #[test]
    fn test_features_in_area() {
        let kf = create_keyframe_with_features(1, 10);
        // Keypoints at x = 10, 30, 50, ... on y = 100.
        let mut found = kf.get_features_in_area(30.0, 100.0, 21.0, None);
        found.sort_unstable();
        assert_eq!(found, vec![0, 1, 2]);
    }

    #[test]
    fn test_pose_conventions() {
        let mut kf = create_keyframe_with_features(1, 0);
        let pose_cw = SE3::from_rt(&nalgebra::Matrix3::identity(), &Vector3::new(0.0, 0.0, -2.0));
        kf.set_pose_cw(&pose_cw);
        assert!((kf.camera_center() - Vector3::new(0.0, 0.0, 2.0)).norm() < 1e-12);
        assert!((kf.pose_cw().translation - pose_cw.translation).norm() < 1e-12);
    }
}
