//! Map - Container for KeyFrames and MapPoints.
//!
//! The Map is the central data structure that holds the SLAM graph:
//! - KeyFrames with their poses and features
//! - MapPoints (3D landmarks) with their observations
//! - Covisibility relationships between KeyFrames
//!
//! It provides methods for:
//! - Adding/removing KeyFrames and MapPoints
//! - Creating bidirectional associations (KF↔MP)
//! - Querying local neighborhoods
//! - Frustum-based visibility queries
//! - Culling and merging MapPoints

use std::collections::{HashMap, HashSet};

use nalgebra::Vector3;

use crate::features::{hamming, Descriptor, FeatureSet, ScalePyramid};
use crate::geometry::{CameraModel, SE3};

use super::keyframe::KeyFrame;
use super::map_point::MapPoint;
use super::types::{KeyFrameId, MapPointId};

/// Maximum length of a parent chain followed when resolving the pose of a
/// removed KeyFrame.
const MAX_TOMBSTONE_CHAIN: usize = 1000;

/// The SLAM map containing KeyFrames and MapPoints.
pub struct Map {
    keyframes: HashMap<KeyFrameId, KeyFrame>,
    map_points: HashMap<MapPointId, MapPoint>,

    next_kf_id: u64,
    next_mp_id: u64,

    pyramid: ScalePyramid,

    /// First KeyFrame of the map. Never culled and fixed in optimization.
    initial_kf_id: Option<KeyFrameId>,

    /// Most recent KeyFrame ID.
    last_keyframe_id: Option<KeyFrameId>,

    /// Removed KeyFrames: spanning-tree parent at removal time and the pose
    /// relative to it (T_cp), so frame poses referencing them stay resolvable.
    erased_keyframes: HashMap<KeyFrameId, (KeyFrameId, SE3)>,

    /// MapPoints fused into another point.
    replaced_map_points: HashMap<MapPointId, MapPointId>,

    /// Incremented after loop corrections.
    big_change_index: u64,
}

impl Map {
    pub fn new(pyramid: ScalePyramid) -> Self {
        Self {
            keyframes: HashMap::new(),
            map_points: HashMap::new(),
            next_kf_id: 0,
            next_mp_id: 0,
            pyramid,
            initial_kf_id: None,
            last_keyframe_id: None,
            erased_keyframes: HashMap::new(),
            replaced_map_points: HashMap::new(),
            big_change_index: 0,
        }
    }

    pub fn pyramid(&self) -> &ScalePyramid {
        &self.pyramid
    }

    pub fn initial_keyframe_id(&self) -> Option<KeyFrameId> {
        self.initial_kf_id
    }

    pub fn last_keyframe_id(&self) -> Option<KeyFrameId> {
        self.last_keyframe_id
    }

    /// Largest KeyFrame id handed out so far.
    pub fn max_keyframe_id(&self) -> Option<KeyFrameId> {
        self.next_kf_id.checked_sub(1).map(KeyFrameId::new)
    }

    pub fn inform_big_change(&mut self) {
        self.big_change_index += 1;
    }

    pub fn big_change_index(&self) -> u64 {
        self.big_change_index
    }

    // ─────────────────────────────────────────────────────────────────────────
    // KeyFrame Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Create and add a new KeyFrame. `pose` is T_wc.
    pub fn create_keyframe(
        &mut self,
        frame_id: u64,
        timestamp: f64,
        pose: SE3,
        features: FeatureSet,
        image_size: (u32, u32),
    ) -> KeyFrameId {
        let id = KeyFrameId::new(self.next_kf_id);
        self.next_kf_id += 1;
        let kf = KeyFrame::new(id, frame_id, timestamp, pose, features, image_size);
        self.keyframes.insert(id, kf);
        if self.initial_kf_id.is_none() {
            self.initial_kf_id = Some(id);
        }
        self.last_keyframe_id = Some(id);
        id
    }

    /// KeyFrames in creation order.
    pub fn keyframes_temporal_order(&self) -> Vec<&KeyFrame> {
        let mut kfs: Vec<&KeyFrame> = self.keyframes.values().collect();
        kfs.sort_by_key(|kf| kf.id);
        kfs
    }

    pub fn get_keyframe(&self, id: KeyFrameId) -> Option<&KeyFrame> {
        self.keyframes.get(&id)
    }

    pub fn get_keyframe_mut(&mut self, id: KeyFrameId) -> Option<&mut KeyFrame> {
        self.keyframes.get_mut(&id)
    }

    pub fn keyframe_ids(&self) -> impl Iterator<Item = &KeyFrameId> {
        self.keyframes.keys()
    }

    pub fn keyframes(&self) -> impl Iterator<Item = &KeyFrame> {
        self.keyframes.values()
    }

    pub fn num_keyframes(&self) -> usize {
        self.keyframes.len()
    }

    /// T_cw of a KeyFrame, following the recorded parent chain if the KeyFrame
    /// was removed.
    pub fn keyframe_pose_cw_resolved(&self, id: KeyFrameId) -> Option<SE3> {
        let mut current = id;
        // Accumulated T_c(id) p(current)
        let mut t_acc = SE3::identity();
        for _ in 0..MAX_TOMBSTONE_CHAIN {
            if let Some(kf) = self.keyframes.get(&current) {
                return Some(t_acc.compose(&kf.pose_cw()));
            }
            let (parent, t_cp) = self.erased_keyframes.get(&current)?;
            t_acc = t_acc.compose(t_cp);
            current = *parent;
        }
        None
    }

    // ─────────────────────────────────────────────────────────────────────────
    // MapPoint Operations
    // ─────────────────────────────────────────────────────────────────────────

    pub fn create_map_point(&mut self, position: Vector3<f64>, descriptor: Descriptor, first_kf_id: KeyFrameId) -> MapPointId {
        let id = MapPointId::new(self.next_mp_id);
        self.next_mp_id += 1;
        self.map_points.insert(id, MapPoint::new(id, position, descriptor, first_kf_id));
        id
    }

    pub fn get_map_point(&self, id: MapPointId) -> Option<&MapPoint> {
        self.map_points.get(&id)
    }

    pub fn get_map_point_mut(&mut self, id: MapPointId) -> Option<&mut MapPoint> {
        self.map_points.get_mut(&id)
    }

    pub fn map_point_ids(&self) -> impl Iterator<Item = &MapPointId> {
        self.map_points.keys()
    }

    pub fn map_points(&self) -> impl Iterator<Item = &MapPoint> {
        self.map_points.values()
    }

    pub fn num_map_points(&self) -> usize {
        self.map_points.len()
    }

    /// Follow fusion replacements to the surviving MapPoint, if any.
    pub fn resolve_map_point(&self, id: MapPointId) -> Option<MapPointId> {
        let mut current = id;
        for _ in 0..MAX_TOMBSTONE_CHAIN {
            if self.map_points.contains_key(&current) {
                return Some(current);
            }
            current = *self.replaced_map_points.get(&current)?;
        }
        None
    }

    /// Number of MapPoints of a KeyFrame with at least `min_obs` observers.
    pub fn tracked_map_points(&self, kf_id: KeyFrameId, min_obs: usize) -> usize {
        let Some(kf) = self.keyframes.get(&kf_id) else {
            return 0;
        };
        kf.get_map_point_indices()
            .filter(|(_, mp_id)| {
                self.map_points
                    .get(mp_id)
                    .map_or(false, |mp| !mp.is_bad && mp.num_observations() >= min_obs)
            })
            .count()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Association (KF ↔ MP)
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a bidirectional association between a KeyFrame feature and a MapPoint.
    ///
    /// This:
    /// 1. Links the KeyFrame's feature to the MapPoint
    /// 2. Adds an observation in the MapPoint
    /// 3. Updates covisibility with other KeyFrames observing this MapPoint
    ///
    /// A feature already linked to another point is disassociated first. Fails
    /// if either side is missing or the KeyFrame already observes the point.
    pub fn associate(&mut self, kf_id: KeyFrameId, feature_idx: usize, mp_id: MapPointId) -> bool {
        let Some(kf) = self.keyframes.get(&kf_id) else {
            return false;
        };
        if feature_idx >= kf.num_features() {
            return false;
        }
        let existing_observers: Vec<KeyFrameId> = match self.map_points.get(&mp_id) {
            Some(mp) if !mp.observations.contains_key(&kf_id) => mp.observations.keys().copied().collect(),
            _ => return false,
        };
        if kf.get_map_point(feature_idx).is_some() {
            self.disassociate(kf_id, feature_idx);
        }

        if let Some(mp) = self.map_points.get_mut(&mp_id) {
            mp.add_observation(kf_id, feature_idx);
        }
        if let Some(kf) = self.keyframes.get_mut(&kf_id) {
            kf.set_map_point(feature_idx, mp_id);
        }

        for other_kf_id in existing_observers {
            let new_weight = self
                .keyframes
                .get(&other_kf_id)
                .map(|kf| kf.get_covisibility_weight(kf_id))
                .unwrap_or(0)
                + 1;
            if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                kf.add_covisibility(other_kf_id, new_weight);
            }
            if let Some(other_kf) = self.keyframes.get_mut(&other_kf_id) {
                other_kf.add_covisibility(kf_id, new_weight);
            }
        }

        true
    }

    /// Remove the association between a KeyFrame feature and its MapPoint,
    /// decrementing covisibility with the point's other observers.
    ///
    /// Returns the MapPoint ID that was disassociated, if any.
    pub fn disassociate(&mut self, kf_id: KeyFrameId, feature_idx: usize) -> Option<MapPointId> {
        let mp_id = self.keyframes.get(&kf_id)?.get_map_point(feature_idx)?;

        let other_observers: Vec<KeyFrameId> = self
            .map_points
            .get(&mp_id)
            .map(|mp| mp.observations.keys().filter(|&&id| id != kf_id).copied().collect())
            .unwrap_or_default();

        if let Some(kf) = self.keyframes.get_mut(&kf_id) {
            kf.erase_map_point(feature_idx);
        }
        let was_observed = self
            .map_points
            .get_mut(&mp_id)
            .map_or(false, |mp| mp.erase_observation(kf_id));
        if !was_observed {
            return Some(mp_id);
        }

        for other_kf_id in other_observers {
            let new_weight = self
                .keyframes
                .get(&other_kf_id)
                .map(|kf| kf.get_covisibility_weight(kf_id))
                .unwrap_or(0)
                .saturating_sub(1);
            if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                kf.add_covisibility(other_kf_id, new_weight);
            }
            if let Some(other_kf) = self.keyframes.get_mut(&other_kf_id) {
                other_kf.add_covisibility(kf_id, new_weight);
            }
        }

        Some(mp_id)
    }

    /// Recompute the covisibility of a KeyFrame from its observations and,
    /// for a KeyFrame without spanning-tree parent, attach it to its best
    /// covisible older KeyFrame.
    pub fn update_connections(&mut self, kf_id: KeyFrameId) {
        let Some(kf) = self.keyframes.get(&kf_id) else {
            return;
        };
        let mut counts: HashMap<KeyFrameId, usize> = HashMap::new();
        for (_, mp_id) in kf.get_map_point_indices() {
            if let Some(mp) = self.map_points.get(&mp_id) {
                if mp.is_bad {
                    continue;
                }
                for &other in mp.observations.keys() {
                    if other != kf_id {
                        *counts.entry(other).or_insert(0) += 1;
                    }
                }
            }
        }
        let stale: Vec<KeyFrameId> = kf
            .get_covisibles()
            .filter(|id| !counts.contains_key(id))
            .copied()
            .collect();

        for other in stale {
            if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                kf.erase_covisibility(other);
            }
            if let Some(other_kf) = self.keyframes.get_mut(&other) {
                other_kf.erase_covisibility(kf_id);
            }
        }
        for (&other, &weight) in &counts {
            if !self.keyframes.contains_key(&other) {
                continue;
            }
            if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                kf.add_covisibility(other, weight);
            }
            if let Some(other_kf) = self.keyframes.get_mut(&other) {
                other_kf.add_covisibility(kf_id, weight);
            }
        }

        let needs_parent = self.initial_kf_id != Some(kf_id)
            && self.keyframes.get(&kf_id).map_or(false, |kf| kf.parent_id.is_none());
        if needs_parent {
            // Only older KeyFrames qualify, which keeps the tree acyclic.
            let best = self.keyframes.get(&kf_id).and_then(|kf| {
                kf.ordered_covisibles()
                    .iter()
                    .find(|(id, _)| *id < kf_id)
                    .map(|(id, _)| *id)
            });
            if let Some(parent) = best {
                self.set_parent(kf_id, parent);
            }
        }
    }

    /// Attach `child` to `parent` in the spanning tree.
    pub fn set_parent(&mut self, child: KeyFrameId, parent: KeyFrameId) {
        if child == parent || !self.keyframes.contains_key(&parent) {
            return;
        }
        let old_parent = match self.keyframes.get_mut(&child) {
            Some(kf) => kf.parent_id.replace(parent),
            None => return,
        };
        if let Some(old) = old_parent {
            if let Some(old_kf) = self.keyframes.get_mut(&old) {
                old_kf.erase_child(child);
            }
        }
        if let Some(parent_kf) = self.keyframes.get_mut(&parent) {
            parent_kf.add_child(child);
        }
    }

    /// Record a loop edge in both KeyFrames.
    pub fn add_loop_edge(&mut self, a: KeyFrameId, b: KeyFrameId) {
        if let Some(kf) = self.keyframes.get_mut(&a) {
            kf.add_loop_edge(b);
        }
        if let Some(kf) = self.keyframes.get_mut(&b) {
            kf.add_loop_edge(a);
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────────

    /// The N KeyFrames with the most MapPoints shared with `kf_id`.
    pub fn get_local_keyframes(&self, kf_id: KeyFrameId, n: usize) -> Vec<KeyFrameId> {
        self.keyframes
            .get(&kf_id)
            .map(|kf| kf.get_best_covisibles(n))
            .unwrap_or_default()
    }

    /// Get all MapPoints observed by a set of KeyFrames.
    pub fn get_map_points_from_keyframes(&self, kf_ids: &[KeyFrameId]) -> HashSet<MapPointId> {
        let mut mp_ids = HashSet::new();
        for &kf_id in kf_ids {
            if let Some(kf) = self.keyframes.get(&kf_id) {
                for (_, mp_id) in kf.get_map_point_indices() {
                    if self.map_points.get(&mp_id).map_or(false, |mp| !mp.is_bad) {
                        mp_ids.insert(mp_id);
                    }
                }
            }
        }
        mp_ids
    }

    /// MapPoints visible from a camera at `pose_cw`: in front of the camera,
    /// inside the image grown by `margin`, within their distance range and
    /// viewing-angle limit. Sorted by id.
    pub fn get_map_points_in_frustum(&self, pose_cw: &SE3, camera: &CameraModel, margin: f64) -> Vec<MapPointId> {
        let mut ids: Vec<MapPointId> = self
            .map_points
            .values()
            .filter(|mp| !mp.is_bad && mp.project_into(pose_cw, camera, &self.pyramid, margin).is_some())
            .map(|mp| mp.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Culling
    // ─────────────────────────────────────────────────────────────────────────

    /// Remove MapPoints that are flagged bad, have fewer than `min_observations`
    /// observers or a found ratio below `min_found_ratio`.
    ///
    /// Returns the number of culled MapPoints.
    pub fn cull_bad_map_points(&mut self, min_found_ratio: f64, min_observations: usize) -> usize {
        let to_cull: Vec<MapPointId> = self
            .map_points
            .iter()
            .filter(|(_, mp)| mp.should_cull(min_found_ratio, min_observations))
            .map(|(&id, _)| id)
            .collect();

        let count = to_cull.len();
        for mp_id in to_cull {
            self.remove_map_point_full(mp_id);
        }
        count
    }

    /// Fully remove a MapPoint, cleaning up all associations and covisibility.
    pub fn remove_map_point_full(&mut self, mp_id: MapPointId) {
        let observations: Vec<(KeyFrameId, usize)> = self
            .map_points
            .get(&mp_id)
            .map(|mp| mp.observations.iter().map(|(&kf_id, &idx)| (kf_id, idx)).collect())
            .unwrap_or_default();

        for (kf_id, feat_idx) in observations {
            self.disassociate(kf_id, feat_idx);
        }
        self.map_points.remove(&mp_id);
    }

    /// Fully remove a KeyFrame.
    ///
    /// Its observations are removed from all MapPoints (points left with
    /// fewer than two observers are removed as well), its covisibility edges
    /// dropped and its children reattached in the spanning tree.
    pub fn remove_keyframe_full(&mut self, kf_id: KeyFrameId) {
        let Some(kf) = self.keyframes.get(&kf_id) else {
            return;
        };
        let mp_associations: Vec<(usize, MapPointId)> = kf.get_map_point_indices().collect();
        let parent_id = kf.parent_id;
        let loop_edges: Vec<KeyFrameId> = kf.loop_edges.iter().copied().collect();
        let mut children: Vec<KeyFrameId> = kf.children_ids.iter().copied().collect();
        children.sort_unstable();

        for (feat_idx, mp_id) in mp_associations {
            self.disassociate(kf_id, feat_idx);
            let orphaned = self.map_points.get(&mp_id).map_or(false, |mp| mp.num_observations() < 2);
            if orphaned {
                self.remove_map_point_full(mp_id);
            }
        }

        let covisibles: Vec<KeyFrameId> = self
            .keyframes
            .get(&kf_id)
            .map(|kf| kf.get_covisibles().copied().collect())
            .unwrap_or_default();
        for other_kf_id in covisibles {
            if let Some(other_kf) = self.keyframes.get_mut(&other_kf_id) {
                other_kf.erase_covisibility(kf_id);
            }
        }
        for other in loop_edges {
            if let Some(other_kf) = self.keyframes.get_mut(&other) {
                other_kf.loop_edges.remove(&kf_id);
            }
        }

        // Spanning tree
        if let Some(parent) = parent_id {
            if let Some(parent_kf) = self.keyframes.get_mut(&parent) {
                parent_kf.erase_child(kf_id);
            }
            self.reparent_children(children, parent);

            let t_cp = self
                .keyframes
                .get(&kf_id)
                .zip(self.keyframes.get(&parent))
                .map(|(kf, parent_kf)| kf.pose_cw().compose(&parent_kf.pose));
            if let Some(t_cp) = t_cp {
                self.erased_keyframes.insert(kf_id, (parent, t_cp));
            }
        } else if let Some((&new_root, rest)) = children.split_first() {
            if let Some(root_kf) = self.keyframes.get_mut(&new_root) {
                root_kf.parent_id = None;
            }
            self.reparent_children(rest.to_vec(), new_root);
            if self.initial_kf_id == Some(kf_id) {
                self.initial_kf_id = Some(new_root);
            }
        }

        self.keyframes.remove(&kf_id);
        if self.last_keyframe_id == Some(kf_id) {
            self.last_keyframe_id = self.keyframes.keys().max().copied();
        }
    }

    /// Attach orphaned children, each to the candidate it shares the most
    /// points with. Candidates start as `{fallback}` and grow with every
    /// reattached child. Children connected to no candidate go to `fallback`.
    fn reparent_children(&mut self, mut remaining: Vec<KeyFrameId>, fallback: KeyFrameId) {
        let mut candidates: HashSet<KeyFrameId> = HashSet::from([fallback]);
        while !remaining.is_empty() {
            let mut best: Option<(usize, usize, KeyFrameId)> = None;
            for (pos, child) in remaining.iter().enumerate() {
                let Some(child_kf) = self.keyframes.get(child) else {
                    continue;
                };
                for &(cov_id, weight) in child_kf.ordered_covisibles() {
                    if candidates.contains(&cov_id) && best.map_or(true, |(w, _, _)| weight > w) {
                        best = Some((weight, pos, cov_id));
                    }
                }
            }
            let Some((_, pos, new_parent)) = best else {
                break;
            };
            let child = remaining.swap_remove(pos);
            self.set_parent(child, new_parent);
            candidates.insert(child);
        }
        for child in remaining {
            self.set_parent(child, fallback);
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Map Maintenance
    // ─────────────────────────────────────────────────────────────────────────

    /// Fuse `remove` into `keep`: every KeyFrame observing `remove` observes
    /// `keep` instead (unless it already does), counters are transferred and
    /// `remove` is deleted.
    pub fn merge_map_points(&mut self, keep: MapPointId, remove: MapPointId) {
        if keep == remove || !self.map_points.contains_key(&keep) {
            return;
        }
        let Some(old) = self.map_points.get(&remove) else {
            return;
        };
        let observations: Vec<(KeyFrameId, usize)> = old.observations.iter().map(|(&k, &i)| (k, i)).collect();
        let (visible, found) = (old.visible_count, old.found_count);

        for (kf_id, feat_idx) in observations {
            self.disassociate(kf_id, feat_idx);
            let already_observed = self
                .map_points
                .get(&keep)
                .map_or(true, |mp| mp.observations.contains_key(&kf_id));
            if !already_observed {
                self.associate(kf_id, feat_idx, keep);
            }
        }
        if let Some(mp) = self.map_points.get_mut(&keep) {
            mp.increase_visible(visible);
            mp.increase_found(found);
        }
        self.map_points.remove(&remove);
        self.replaced_map_points.insert(remove, keep);

        self.compute_distinctive_descriptor(keep);
        self.update_map_point_normal_and_depth(keep);
    }

    /// Set the representative descriptor of a MapPoint to the observation
    /// descriptor with the least median distance to all others.
    pub fn compute_distinctive_descriptor(&mut self, mp_id: MapPointId) {
        let Some(mp) = self.map_points.get(&mp_id) else {
            return;
        };
        let descriptors: Vec<Descriptor> = mp
            .observations
            .iter()
            .filter_map(|(kf_id, &idx)| self.keyframes.get(kf_id).and_then(|kf| kf.descriptors.get(idx).copied()))
            .collect();
        if descriptors.is_empty() {
            return;
        }

        let n = descriptors.len();
        let mut best_median = u32::MAX;
        let mut best_idx = 0;
        for i in 0..n {
            let mut dists: Vec<u32> = (0..n).map(|j| hamming(&descriptors[i], &descriptors[j])).collect();
            dists.sort_unstable();
            let median = dists[(n - 1) / 2];
            if median < best_median {
                best_median = median;
                best_idx = i;
            }
        }

        if let Some(mp) = self.map_points.get_mut(&mp_id) {
            mp.descriptor = descriptors[best_idx];
        }
    }

    /// Update the normal and depth bounds for a MapPoint.
    ///
    /// Should be called after the MapPoint's observations or position change.
    pub fn update_map_point_normal_and_depth(&mut self, mp_id: MapPointId) {
        let Some(mp) = self.map_points.get(&mp_id) else {
            return;
        };
        let centers: Vec<Vector3<f64>> = mp
            .observations
            .keys()
            .filter_map(|kf_id| self.keyframes.get(kf_id).map(|kf| kf.camera_center()))
            .collect();

        // Reference observation: the creating KeyFrame if it still observes the
        // point, else the oldest observer.
        let reference_kf = if mp.observations.contains_key(&mp.first_kf_id) {
            Some(mp.first_kf_id)
        } else {
            mp.observations.keys().min().copied()
        };
        let reference = reference_kf.and_then(|kf_id| {
            let kf = self.keyframes.get(&kf_id)?;
            let idx = *mp.observations.get(&kf_id)?;
            Some((kf.camera_center(), kf.keypoints.get(idx)?.octave))
        });
        let Some(reference) = reference else {
            return;
        };

        let pyramid = &self.pyramid;
        if let Some(mp) = self.map_points.get_mut(&mp_id) {
            mp.update_normal_and_depth(centers.into_iter(), reference, pyramid);
        }
    }

    /// Clear the entire map.
    pub fn clear(&mut self) {
        self.keyframes.clear();
        self.map_points.clear();
        self.erased_keyframes.clear();
        self.replaced_map_points.clear();
        self.initial_kf_id = None;
        self.last_keyframe_id = None;
        self.next_kf_id = 0;
        self.next_mp_id = 0;
        self.big_change_index += 1;
    }
}

impl Default for Map {
    fn default() -> Self {
        Self::new(ScalePyramid::default())
    }
}

impl std::fmt::Debug for Map {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Map")
            .field("num_keyframes", &self.keyframes.len())
            .field("num_map_points", &self.map_points.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::KeyPoint;
    use approx::assert_relative_eq;
    use nalgebra::Matrix3;

    fn features(n: usize) -> FeatureSet {
        let keypoints = (0..n).map(|i| KeyPoint::new(5.0 * i as f64, 50.0)).collect();
        let descriptors = (0..n)
            .map(|i| {
                let mut d = Descriptor::default();
                d.0[i % 32] = (i / 32) as u8 + 1;
                d
            })
            .collect();
        FeatureSet::new(keypoints, descriptors)
    }

    fn add_kf(map: &mut Map, n: usize) -> KeyFrameId {
        let frame_id = map.num_keyframes() as u64;
        map.create_keyframe(frame_id, frame_id as f64, SE3::identity(), features(n), (640, 480))
    }

    /// Every MapPoint referenced by a KeyFrame exists, and every remaining
    /// MapPoint has an observer present in the map.
    fn assert_consistent(map: &Map) {
        for kf in map.keyframes() {
            for (idx, mp_id) in kf.get_map_point_indices() {
                let mp = map.get_map_point(mp_id).expect("dangling map point reference");
                assert_eq!(mp.observations.get(&kf.id), Some(&idx));
            }
        }
        for mp in map.map_points() {
            assert!(mp.observations.keys().any(|kf_id| map.get_keyframe(*kf_id).is_some()));
        }
    }

    #[test]
    fn test_create_keyframe() {
        let mut map = Map::default();
        let kf_id = map.create_keyframe(7, 0.5, SE3::identity(), features(3), (640, 480));

        assert_eq!(kf_id, KeyFrameId::new(0));
        assert_eq!(map.num_keyframes(), 1);
        assert_eq!(map.initial_keyframe_id(), Some(kf_id));

        let kf = map.get_keyframe(kf_id).unwrap();
        assert_eq!(kf.frame_id, 7);
        assert_eq!(kf.map_point_ids.len(), 3);
    }

    #[test]
    fn test_associate() {
        let mut map = Map::default();
        let kf1_id = add_kf(&mut map, 10);
        let kf2_id = add_kf(&mut map, 10);
        let mp_id = map.create_map_point(Vector3::new(1.0, 0.0, 5.0), Descriptor::default(), kf1_id);

        assert!(map.associate(kf1_id, 0, mp_id));
        assert!(map.associate(kf2_id, 3, mp_id));
        // Same KeyFrame cannot observe a point twice.
        assert!(!map.associate(kf2_id, 4, mp_id));

        let mp = map.get_map_point(mp_id).unwrap();
        assert_eq!(mp.num_observations(), 2);
        assert_eq!(mp.observations.get(&kf2_id), Some(&3));

        assert_eq!(map.get_keyframe(kf1_id).unwrap().get_covisibility_weight(kf2_id), 1);
        assert_eq!(map.get_keyframe(kf2_id).unwrap().get_covisibility_weight(kf1_id), 1);
    }

    #[test]
    fn test_disassociate() {
        let mut map = Map::default();
        let kf1_id = add_kf(&mut map, 10);
        let kf2_id = add_kf(&mut map, 10);
        let mp_id = map.create_map_point(Vector3::zeros(), Descriptor::default(), kf1_id);

        map.associate(kf1_id, 0, mp_id);
        map.associate(kf2_id, 0, mp_id);

        assert_eq!(map.disassociate(kf1_id, 0), Some(mp_id));
        let mp = map.get_map_point(mp_id).unwrap();
        assert_eq!(mp.num_observations(), 1);
        assert!(mp.observations.contains_key(&kf2_id));
        assert_eq!(map.get_keyframe(kf1_id).unwrap().get_map_point(0), None);
        assert_eq!(map.get_keyframe(kf1_id).unwrap().get_covisibility_weight(kf2_id), 0);
    }

    #[test]
    fn test_cull_bad_map_points_keeps_covisibility_consistent() {
        let mut map = Map::default();
        let kfs: Vec<KeyFrameId> = (0..3).map(|_| add_kf(&mut map, 10)).collect();

        let good = map.create_map_point(Vector3::zeros(), Descriptor::default(), kfs[0]);
        let bad = map.create_map_point(Vector3::new(1.0, 1.0, 1.0), Descriptor::default(), kfs[0]);
        for &kf in &kfs {
            map.associate(kf, 0, good);
            map.associate(kf, 1, bad);
        }
        map.get_map_point_mut(good).unwrap().visible_count = 10;
        map.get_map_point_mut(good).unwrap().found_count = 8;
        map.get_map_point_mut(bad).unwrap().visible_count = 100;
        map.get_map_point_mut(bad).unwrap().found_count = 5;
        assert_eq!(map.get_keyframe(kfs[0]).unwrap().get_covisibility_weight(kfs[1]), 2);

        assert_eq!(map.cull_bad_map_points(0.25, 3), 1);
        assert!(map.get_map_point(good).is_some());
        assert!(map.get_map_point(bad).is_none());
        assert_eq!(map.get_keyframe(kfs[0]).unwrap().get_covisibility_weight(kfs[1]), 1);
        assert_consistent(&map);
    }

    #[test]
    fn test_get_local_keyframes() {
        let mut map = Map::default();
        let kf0 = add_kf(&mut map, 10);
        let kf1 = add_kf(&mut map, 10);
        let kf2 = add_kf(&mut map, 10);
        let kf3 = add_kf(&mut map, 10);

        // kf0 shares 3 points with kf1, 1 point with kf2, 2 points with kf3
        for (other, range) in [(kf1, 0..3), (kf2, 3..4), (kf3, 4..6)] {
            for i in range {
                let mp_id = map.create_map_point(Vector3::zeros(), Descriptor::default(), kf0);
                map.associate(kf0, i, mp_id);
                map.associate(other, i, mp_id);
            }
        }

        assert_eq!(map.get_local_keyframes(kf0, 2), vec![kf1, kf3]);
    }

    #[test]
    fn test_update_connections_sets_parent() {
        let mut map = Map::default();
        let kf0 = add_kf(&mut map, 10);
        let kf1 = add_kf(&mut map, 10);
        let kf2 = add_kf(&mut map, 10);
        for i in 0..4 {
            let mp = map.create_map_point(Vector3::zeros(), Descriptor::default(), kf0);
            map.associate(kf0, i, mp);
            map.associate(kf1, i, mp);
            if i < 3 {
                map.associate(kf2, i, mp);
            }
        }
        map.update_connections(kf0);
        map.update_connections(kf1);
        map.update_connections(kf2);

        assert!(map.get_keyframe(kf0).unwrap().is_root());
        assert_eq!(map.get_keyframe(kf1).unwrap().parent_id, Some(kf0));
        // kf2 shares 3 points with both; ties go to the lower id.
        assert_eq!(map.get_keyframe(kf2).unwrap().parent_id, Some(kf0));
        assert!(map.get_keyframe(kf0).unwrap().children_ids.contains(&kf1));
    }

    #[test]
    fn test_remove_keyframe_full() {
        let mut map = Map::default();
        let kf0 = add_kf(&mut map, 10);
        let kf1 = add_kf(&mut map, 10);
        let kf2 = add_kf(&mut map, 10);

        // Points 0..3 seen by all three, points 3..5 by kf1 and kf2 only.
        let mut shared = Vec::new();
        for i in 0..5 {
            let mp = map.create_map_point(Vector3::zeros(), Descriptor::default(), kf0);
            if i < 3 {
                map.associate(kf0, i, mp);
            }
            map.associate(kf1, i, mp);
            map.associate(kf2, i, mp);
            shared.push(mp);
        }
        for kf in [kf0, kf1, kf2] {
            map.update_connections(kf);
        }
        map.set_parent(kf2, kf1);

        map.remove_keyframe_full(kf1);

        assert!(map.get_keyframe(kf1).is_none());
        // Points 3..5 are left with one observer and are removed.
        assert_eq!(map.num_map_points(), 3);
        assert_eq!(map.get_keyframe(kf2).unwrap().parent_id, Some(kf0));
        assert_eq!(map.get_keyframe(kf0).unwrap().get_covisibility_weight(kf1), 0);
        assert_eq!(map.get_keyframe(kf0).unwrap().get_covisibility_weight(kf2), 3);
        assert_consistent(&map);
    }

    #[test]
    fn test_removed_keyframe_pose_resolves_through_parent() {
        let mut map = Map::default();
        let kf0 = add_kf(&mut map, 4);
        let kf1 = add_kf(&mut map, 4);
        let pose1_cw = SE3::from_rt(&Matrix3::identity(), &Vector3::new(-0.5, 0.0, 0.0));
        map.get_keyframe_mut(kf1).unwrap().set_pose_cw(&pose1_cw);
        map.set_parent(kf1, kf0);

        map.remove_keyframe_full(kf1);
        let resolved = map.keyframe_pose_cw_resolved(kf1).unwrap();
        assert_relative_eq!(resolved.translation, pose1_cw.translation, epsilon = 1e-12);

        // Moving the parent moves the resolved pose along.
        let shift = SE3::from_rt(&Matrix3::identity(), &Vector3::new(0.0, 1.0, 0.0));
        map.get_keyframe_mut(kf0).unwrap().set_pose_cw(&shift);
        let moved = map.keyframe_pose_cw_resolved(kf1).unwrap();
        assert_relative_eq!(moved.translation, Vector3::new(-0.5, 1.0, 0.0), epsilon = 1e-12);
    }

    #[test]
    fn test_merge_map_points() {
        let mut map = Map::default();
        let kf0 = add_kf(&mut map, 10);
        let kf1 = add_kf(&mut map, 10);
        let kf2 = add_kf(&mut map, 10);

        let keep = map.create_map_point(Vector3::new(0.0, 0.0, 3.0), Descriptor::default(), kf0);
        let dup = map.create_map_point(Vector3::new(0.0, 0.0, 3.1), Descriptor::default(), kf1);
        map.associate(kf0, 0, keep);
        map.associate(kf1, 1, keep);
        map.associate(kf1, 2, dup);
        map.associate(kf2, 2, dup);

        map.merge_map_points(keep, dup);

        assert!(map.get_map_point(dup).is_none());
        assert_eq!(map.resolve_map_point(dup), Some(keep));
        let mp = map.get_map_point(keep).unwrap();
        assert_eq!(mp.num_observations(), 3);
        assert_eq!(mp.observations.get(&kf2), Some(&2));
        // kf1 already observed `keep`, its duplicate slot is cleared.
        assert_eq!(map.get_keyframe(kf1).unwrap().get_map_point(2), None);
        assert_consistent(&map);
    }

    #[test]
    fn test_distinctive_descriptor_is_medoid() {
        let mut map = Map::default();
        let kfs: Vec<KeyFrameId> = (0..3).map(|_| add_kf(&mut map, 1)).collect();
        let base = Descriptor([0u8; 32]);
        let mut near = base;
        near.0[0] = 0b1;
        let mut far = base;
        far.0 = [0xFF; 32];
        for (kf, d) in kfs.iter().zip([far, base, near]) {
            map.get_keyframe_mut(*kf).unwrap().descriptors[0] = d;
        }
        let mp = map.create_map_point(Vector3::zeros(), far, kfs[0]);
        for kf in &kfs {
            map.associate(*kf, 0, mp);
        }
        map.compute_distinctive_descriptor(mp);
        let chosen = map.get_map_point(mp).unwrap().descriptor;
        assert!(chosen == base || chosen == near);
    }

    #[test]
    fn test_map_points_in_frustum() {
        let mut map = Map::default();
        let kf = add_kf(&mut map, 2);
        let camera = CameraModel::pinhole(500.0, 500.0, 320.0, 240.0, 640, 480);
        let front = map.create_map_point(Vector3::new(0.0, 0.0, 2.0), Descriptor::default(), kf);
        let behind = map.create_map_point(Vector3::new(0.0, 0.0, -2.0), Descriptor::default(), kf);
        map.associate(kf, 0, front);
        map.associate(kf, 1, behind);
        map.update_map_point_normal_and_depth(front);

        let visible = map.get_map_points_in_frustum(&SE3::identity(), &camera, 0.0);
        assert_eq!(visible, vec![front]);
    }
}
