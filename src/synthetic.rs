//! Synthetic scenes: random landmarks seen by a pinhole camera.
//!
//! Each landmark carries its own random descriptor, so projecting the scene
//! gives features with exact correspondences. Used by tests and the demo
//! binary in place of a dataset.

use image::{GrayImage, Luma};
use nalgebra::{UnitQuaternion, Vector3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::Settings;
use crate::features::{Descriptor, FeatureSet, KeyPoint, DESCRIPTOR_BYTES};
use crate::geometry::{CameraModel, SE3};
use crate::tracking::StampedPose;
use crate::vocabulary::{OrbVocabulary, VocabularyError};

/// Half size of the square drawn per landmark in rendered images.
const PATCH_RADIUS: i64 = 3;
/// Gray level behind the landmarks. Flat, so every corner in a rendered
/// image belongs to a landmark and moves with the camera.
const BACKGROUND: u8 = 128;

#[derive(Debug, Clone)]
pub struct Landmark {
    pub position: Vector3<f64>,
    pub descriptor: Descriptor,
}

/// A static world of landmarks and the camera observing it.
#[derive(Debug, Clone)]
pub struct SyntheticScene {
    pub camera: CameraModel,
    pub landmarks: Vec<Landmark>,
}

impl SyntheticScene {
    /// `n` landmarks uniformly distributed in the box `[min, max]`.
    pub fn random(camera: CameraModel, n: usize, min: Vector3<f64>, max: Vector3<f64>, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let landmarks = (0..n)
            .map(|_| {
                let position = Vector3::new(
                    rng.gen_range(min.x..max.x),
                    rng.gen_range(min.y..max.y),
                    rng.gen_range(min.z..max.z),
                );
                let mut bytes = [0u8; DESCRIPTOR_BYTES];
                rng.fill(&mut bytes);
                Landmark {
                    position,
                    descriptor: Descriptor(bytes),
                }
            })
            .collect();
        Self { camera, landmarks }
    }

    /// Landmarks in front of a camera translating along +x from the origin,
    /// spread wide enough to stay in view over `travel` meters.
    pub fn corridor(camera: CameraModel, n: usize, travel: f64, seed: u64) -> Self {
        Self::random(
            camera,
            n,
            Vector3::new(-1.5, -1.2, 1.5),
            Vector3::new(travel + 1.5, 1.2, 3.5),
            seed,
        )
    }

    /// Features of the landmarks visible from `pose_cw`, with the landmark
    /// index of each feature.
    pub fn observe_with_ids(&self, pose_cw: &SE3) -> (FeatureSet, Vec<usize>) {
        let mut keypoints = Vec::new();
        let mut descriptors = Vec::new();
        let mut ids = Vec::new();
        for (i, lm) in self.landmarks.iter().enumerate() {
            let Some(uv) = self.camera.project(&pose_cw.transform_point(&lm.position)) else {
                continue;
            };
            if !self.camera.is_in_image(&uv) {
                continue;
            }
            let raw = if self.camera.has_distortion() {
                self.camera.distort_point(&uv)
            } else {
                uv
            };
            keypoints.push(KeyPoint::new(raw.x, raw.y));
            descriptors.push(lm.descriptor);
            ids.push(i);
        }
        (FeatureSet::new(keypoints, descriptors), ids)
    }

    pub fn observe(&self, pose_cw: &SE3) -> FeatureSet {
        self.observe_with_ids(pose_cw).0
    }

    /// Render the visible landmarks as textured squares over a flat
    /// background. Nearer landmarks are drawn last.
    pub fn render(&self, pose_cw: &SE3) -> GrayImage {
        let (w, h) = (self.camera.width, self.camera.height);
        let mut img = GrayImage::from_pixel(w, h, Luma([BACKGROUND]));

        let mut visible: Vec<(f64, f64, f64, &Descriptor)> = self
            .landmarks
            .iter()
            .filter_map(|lm| {
                let pc = pose_cw.transform_point(&lm.position);
                let uv = self.camera.project(&pc)?;
                self.camera.is_in_image(&uv).then_some((pc.z, uv.x, uv.y, &lm.descriptor))
            })
            .collect();
        visible.sort_by(|a, b| b.0.total_cmp(&a.0));

        for (_, u, v, desc) in visible {
            let (cu, cv) = (u.round() as i64, v.round() as i64);
            for dy in -PATCH_RADIUS..=PATCH_RADIUS {
                for dx in -PATCH_RADIUS..=PATCH_RADIUS {
                    let (x, y) = (cu + dx, cv + dy);
                    if x < 0 || y < 0 || x >= w as i64 || y >= h as i64 {
                        continue;
                    }
                    let bit = ((dy + PATCH_RADIUS) * (2 * PATCH_RADIUS + 1) + dx + PATCH_RADIUS) as usize;
                    let value = if desc.bit(bit % (DESCRIPTOR_BYTES * 8)) { 230 } else { 20 };
                    img.put_pixel(x as u32, y as u32, Luma([value]));
                }
            }
        }
        img
    }

    /// Settings whose camera matches this scene.
    pub fn settings(&self) -> Settings {
        let mut settings = Settings::default();
        let c = &self.camera;
        settings.camera.fx = c.fx;
        settings.camera.fy = c.fy;
        settings.camera.cx = c.cx;
        settings.camera.cy = c.cy;
        settings.camera.k1 = c.k1;
        settings.camera.k2 = c.k2;
        settings.camera.p1 = c.p1;
        settings.camera.p2 = c.p2;
        settings.camera.k3 = c.k3;
        settings.camera.width = c.width;
        settings.camera.height = c.height;
        settings
    }

    /// A small vocabulary trained on the scene's own descriptors.
    pub fn train_vocabulary(&self, k: usize, l: usize, seed: u64) -> Result<OrbVocabulary, VocabularyError> {
        let descriptors: Vec<Descriptor> = self.landmarks.iter().map(|lm| lm.descriptor).collect();
        OrbVocabulary::train(&descriptors, k, l, seed)
    }
}

/// `n_frames` camera poses (`T_cw`) moving from `start` to `end` without
/// rotating, time-stamped at `fps`.
pub fn straight_line(start: Vector3<f64>, end: Vector3<f64>, n_frames: usize, fps: f64) -> Vec<StampedPose> {
    let steps = n_frames.saturating_sub(1).max(1) as f64;
    (0..n_frames)
        .map(|i| {
            let center = start + (end - start) * (i as f64 / steps);
            let twc = SE3 {
                rotation: UnitQuaternion::identity(),
                translation: center,
            };
            StampedPose {
                frame_id: i as u64,
                timestamp: i as f64 / fps,
                pose: twc.inverse(),
            }
        })
        .collect()
}
