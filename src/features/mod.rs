//! Feature extraction and matching: image preprocessing, ORB keypoints with
//! rBRIEF descriptors, a spatial grid and descriptor matchers.

pub mod descriptor;
pub mod grid;
pub mod input;
pub mod matcher;
pub mod orb;

pub use self::descriptor::{hamming, Descriptor, DESCRIPTOR_BYTES};
pub use self::grid::FeatureGrid;
pub use self::input::{preprocess, ImageInput};
pub use self::matcher::{match_symmetric, FeatureMatch, MatchParams, TH_HIGH, TH_LOW};
pub use self::orb::{OrbExtractor, OrbParams, ScalePyramid};

use nalgebra::Vector2;

/// A detected keypoint in level-0 pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KeyPoint {
    pub x: f64,
    pub y: f64,
    /// Orientation in radians.
    pub angle: f32,
    pub response: f32,
    /// Pyramid level the keypoint was detected on.
    pub octave: u8,
}

impl KeyPoint {
    pub fn new(x: f64, y: f64) -> Self {
        Self {
            x,
            y,
            angle: 0.0,
            response: 0.0,
            octave: 0,
        }
    }

    #[inline]
    pub fn pt(&self) -> Vector2<f64> {
        Vector2::new(self.x, self.y)
    }
}

/// Keypoints with one descriptor each.
#[derive(Debug, Clone, Default)]
pub struct FeatureSet {
    pub keypoints: Vec<KeyPoint>,
    pub descriptors: Vec<Descriptor>,
}

impl FeatureSet {
    pub fn new(keypoints: Vec<KeyPoint>, descriptors: Vec<Descriptor>) -> Self {
        debug_assert_eq!(keypoints.len(), descriptors.len());
        Self {
            keypoints,
            descriptors,
        }
    }

    /// Every keypoint has exactly one descriptor.
    pub fn is_consistent(&self) -> bool {
        self.keypoints.len() == self.descriptors.len()
    }

    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }
}
