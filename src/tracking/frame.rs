//! The frame the tracker works on.
//!
//! A `Frame` owns the features of one image, its pose estimate and the
//! temporary associations between its features and `MapPoint`s. It becomes a
//! `KeyFrame` only if the tracker decides to insert it.

use nalgebra::{Vector2, Vector3};

use crate::atlas::map::{KeyFrameId, MapPointId};
use crate::features::{Descriptor, FeatureGrid, FeatureSet, KeyPoint};
use crate::geometry::{CameraModel, SE3};
use crate::vocabulary::{BowVector, FeatureVector, OrbVocabulary};

/// A frame being tracked (not yet a KeyFrame).
#[derive(Debug, Clone)]
pub struct Frame {
    /// Sequential id assigned by the tracker.
    pub id: u64,
    /// Timestamp in seconds.
    pub timestamp: f64,
    /// Keypoints as detected (distorted pixel coordinates).
    pub keypoints_raw: Vec<KeyPoint>,
    /// Undistorted keypoints; all geometry uses these.
    pub keypoints: Vec<KeyPoint>,
    pub descriptors: Vec<Descriptor>,
    grid: FeatureGrid,
    bow: Option<(BowVector, FeatureVector)>,
    /// Estimated world→camera pose, unset until tracked.
    pub pose_cw: Option<SE3>,
    /// map_points[i] = Some(mp_id) if feature i is associated.
    pub map_points: Vec<Option<MapPointId>>,
    /// Associations rejected by the last pose optimization.
    pub outliers: Vec<bool>,
    /// KeyFrame this frame's pose is expressed relative to.
    pub reference_kf: Option<KeyFrameId>,
}

impl Frame {
    /// Build a frame from extracted features, undistorting the keypoints with
    /// the camera's radial-tangential model.
    pub fn new(id: u64, timestamp: f64, features: FeatureSet, camera: &CameraModel) -> Self {
        let FeatureSet {
            keypoints: keypoints_raw,
            descriptors,
        } = features;
        let keypoints: Vec<KeyPoint> = if camera.has_distortion() {
            keypoints_raw
                .iter()
                .map(|kp| {
                    let p = camera.undistort_point(&kp.pt());
                    KeyPoint { x: p.x, y: p.y, ..*kp }
                })
                .collect()
        } else {
            keypoints_raw.clone()
        };
        let grid = FeatureGrid::new(&keypoints, camera.width as f64, camera.height as f64);
        let n = keypoints.len();
        Self {
            id,
            timestamp,
            keypoints_raw,
            keypoints,
            descriptors,
            grid,
            bow: None,
            pose_cw: None,
            map_points: vec![None; n],
            outliers: vec![false; n],
            reference_kf: None,
        }
    }

    pub fn num_features(&self) -> usize {
        self.keypoints.len()
    }

    /// Undistorted features, as stored in a KeyFrame.
    pub fn undistorted_features(&self) -> FeatureSet {
        FeatureSet::new(self.keypoints.clone(), self.descriptors.clone())
    }

    pub fn keypoint_angles(&self) -> Vec<f32> {
        self.keypoints.iter().map(|kp| kp.angle).collect()
    }

    /// Indices of keypoints within `radius` of `(u, v)`, optionally limited
    /// to an inclusive octave range.
    pub fn features_in_area(&self, u: f64, v: f64, radius: f64, levels: Option<(u8, u8)>) -> Vec<usize> {
        self.grid.features_in_area(&self.keypoints, u, v, radius, levels)
    }

    /// Compute the BoW representation once; later calls are free.
    pub fn compute_bow(&mut self, vocabulary: &OrbVocabulary) {
        if self.bow.is_none() {
            self.bow = Some(vocabulary.transform(&self.descriptors, vocabulary.default_levels_up()));
        }
    }

    pub fn bow_vector(&self) -> Option<&BowVector> {
        self.bow.as_ref().map(|(b, _)| b)
    }

    pub fn feature_vector(&self) -> Option<&FeatureVector> {
        self.bow.as_ref().map(|(_, f)| f)
    }

    pub fn set_pose_cw(&mut self, pose_cw: SE3) {
        self.pose_cw = Some(pose_cw);
    }

    pub fn camera_center(&self) -> Option<Vector3<f64>> {
        self.pose_cw.as_ref().map(|p| p.camera_center())
    }

    pub fn keypoint_uv(&self, idx: usize) -> Vector2<f64> {
        self.keypoints[idx].pt()
    }

    /// Drop every association and outlier flag.
    pub fn clear_map_points(&mut self) {
        self.map_points.iter_mut().for_each(|m| *m = None);
        self.outliers.iter_mut().for_each(|o| *o = false);
    }

    /// Drop the associations flagged as outliers. Returns how many were dropped.
    pub fn discard_outliers(&mut self) -> usize {
        let mut dropped = 0;
        for (mp, outlier) in self.map_points.iter_mut().zip(self.outliers.iter_mut()) {
            if *outlier {
                if mp.take().is_some() {
                    dropped += 1;
                }
                *outlier = false;
            }
        }
        dropped
    }

    /// Number of associations not flagged as outliers.
    pub fn num_tracked(&self) -> usize {
        self.map_points
            .iter()
            .zip(&self.outliers)
            .filter(|(mp, &outlier)| mp.is_some() && !outlier)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn features() -> FeatureSet {
        let kps = vec![KeyPoint::new(100.0, 100.0), KeyPoint::new(110.0, 100.0), KeyPoint::new(400.0, 300.0)];
        FeatureSet::new(kps, vec![Descriptor::default(); 3])
    }

    #[test]
    fn test_area_query_and_tracking_counts() {
        let cam = CameraModel::pinhole(500.0, 500.0, 320.0, 240.0, 640, 480);
        let mut frame = Frame::new(7, 0.5, features(), &cam);
        assert_eq!(frame.num_features(), 3);

        let mut near = frame.features_in_area(105.0, 100.0, 8.0, None);
        near.sort_unstable();
        assert_eq!(near, vec![0, 1]);

        frame.map_points[0] = Some(MapPointId::new(1));
        frame.map_points[2] = Some(MapPointId::new(2));
        frame.outliers[2] = true;
        assert_eq!(frame.num_tracked(), 1);
        assert_eq!(frame.discard_outliers(), 1);
        assert_eq!(frame.map_points[2], None);
        frame.clear_map_points();
        assert_eq!(frame.num_tracked(), 0);
    }

    #[test]
    fn test_distorted_keypoints_are_undistorted() {
        let mut cam = CameraModel::pinhole(500.0, 500.0, 320.0, 240.0, 640, 480);
        cam.k1 = -0.2;
        let raw = cam.distort_point(&Vector2::new(500.0, 400.0));
        let fs = FeatureSet::new(vec![KeyPoint::new(raw.x, raw.y)], vec![Descriptor::default()]);
        let frame = Frame::new(0, 0.0, fs, &cam);
        assert!((frame.keypoints[0].x - 500.0).abs() < 1e-3);
        assert!((frame.keypoints[0].y - 400.0).abs() < 1e-3);
        assert_eq!(frame.keypoints_raw[0].x, raw.x);
    }
}
