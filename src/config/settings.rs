//! YAML settings file.
//!
//! Every section and field has a default, so a settings file only needs to
//! list what differs from it:
//!
//! ```yaml
//! camera:
//!   fx: 458.654
//!   fy: 457.296
//!   cx: 367.215
//!   cy: 248.375
//!   k1: -0.28340811
//!   k2: 0.07395907
//!   width: 752
//!   height: 480
//!   fps: 20
//! orb:
//!   n_features: 1000
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::features::OrbParams;
use crate::geometry::CameraModel;
use crate::vocabulary::VocabularyError;

/// Failure to load the vocabulary or the settings.
#[derive(Error, Debug)]
pub enum ConfigLoadError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse settings YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("failed to load vocabulary: {0}")]
    Vocabulary(#[from] VocabularyError),
    #[error("invalid settings: {0}")]
    Invalid(String),
}

/// Pinhole intrinsics, distortion and frame rate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraSettings {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    pub k1: f64,
    pub k2: f64,
    pub p1: f64,
    pub p2: f64,
    pub k3: f64,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            fx: 500.0,
            fy: 500.0,
            cx: 320.0,
            cy: 240.0,
            k1: 0.0,
            k2: 0.0,
            p1: 0.0,
            p2: 0.0,
            k3: 0.0,
            width: 640,
            height: 480,
            fps: 30.0,
        }
    }
}

/// ORB extractor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrbSettings {
    pub n_features: usize,
    pub scale_factor: f64,
    pub n_levels: usize,
    pub ini_th_fast: u8,
    pub min_th_fast: u8,
}

impl Default for OrbSettings {
    fn default() -> Self {
        Self {
            n_features: 1000,
            scale_factor: 1.2,
            n_levels: 8,
            ini_th_fast: 20,
            min_th_fast: 7,
        }
    }
}

/// Tracker thresholds, initialization and keyframe policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingSettings {
    /// Inliers needed to stay in `Ok`.
    pub min_inliers: usize,
    /// Inliers needed on the frames right after a relocalization.
    pub min_inliers_after_reloc: usize,
    pub search_radius_px: f64,
    pub nn_ratio: f32,
    pub init_min_features: usize,
    pub init_min_matches: usize,
    pub init_min_triangulated: usize,
    pub init_min_parallax_deg: f64,
    pub init_ransac_iterations: usize,
    pub kf_min_frames: usize,
    /// Defaults to the camera frame rate when unset.
    pub kf_max_frames: Option<usize>,
    pub kf_min_tracked_ratio: f64,
    pub kf_min_tracked: usize,
    pub pose_optimization_rounds: usize,
    pub pose_iterations: usize,
}

impl Default for TrackingSettings {
    fn default() -> Self {
        Self {
            min_inliers: 30,
            min_inliers_after_reloc: 50,
            search_radius_px: 15.0,
            nn_ratio: 0.9,
            init_min_features: 100,
            init_min_matches: 100,
            init_min_triangulated: 50,
            init_min_parallax_deg: 1.0,
            init_ransac_iterations: 200,
            kf_min_frames: 0,
            kf_max_frames: None,
            kf_min_tracked_ratio: 0.9,
            kf_min_tracked: 15,
            pose_optimization_rounds: 4,
            pose_iterations: 10,
        }
    }
}

/// Local mapping thresholds and BA budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalMappingSettings {
    pub n_neighbors: usize,
    pub map_point_min_found_ratio: f64,
    pub kf_redundancy: f64,
    pub ba_max_iterations: usize,
    pub ba_max_covisible: usize,
    /// Queue length above which the tracker is asked to hold keyframes.
    pub queue_flow_control: usize,
}

impl Default for LocalMappingSettings {
    fn default() -> Self {
        Self {
            n_neighbors: 20,
            map_point_min_found_ratio: 0.25,
            kf_redundancy: 0.9,
            ba_max_iterations: 10,
            ba_max_covisible: 20,
            queue_flow_control: 3,
        }
    }
}

/// Loop detection, verification and correction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopClosingSettings {
    pub enabled: bool,
    pub min_keyframes_for_loop: usize,
    pub min_temporal_gap: u64,
    pub consistency_threshold: usize,
    pub min_sim3_inliers: usize,
    pub min_loop_matches: usize,
    pub pose_graph_iterations: usize,
    pub min_covisibility_weight: usize,
}

impl Default for LoopClosingSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            min_keyframes_for_loop: 10,
            min_temporal_gap: 10,
            consistency_threshold: 3,
            min_sim3_inliers: 20,
            min_loop_matches: 40,
            pose_graph_iterations: 20,
            min_covisibility_weight: 100,
        }
    }
}

/// All settings of a SLAM session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub camera: CameraSettings,
    pub orb: OrbSettings,
    pub tracking: TrackingSettings,
    pub local_mapping: LocalMappingSettings,
    pub loop_closing: LoopClosingSettings,
}

impl Settings {
    /// Load and validate a YAML settings file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigLoadError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigLoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigLoadError> {
        let settings: Settings = serde_yaml::from_str(content)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn save_yaml<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigLoadError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content).map_err(|source| ConfigLoadError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Semantic checks serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigLoadError> {
        let c = &self.camera;
        if !(c.fx > 0.0 && c.fy > 0.0) {
            return Err(ConfigLoadError::Invalid(format!("focal lengths must be positive (fx={}, fy={})", c.fx, c.fy)));
        }
        if c.width == 0 || c.height == 0 {
            return Err(ConfigLoadError::Invalid("image size must be non-zero".into()));
        }
        if !(c.fps > 0.0) {
            return Err(ConfigLoadError::Invalid("fps must be positive".into()));
        }
        if self.orb.n_features == 0 {
            return Err(ConfigLoadError::Invalid("orb.n_features must be non-zero".into()));
        }
        if !(self.orb.scale_factor > 1.0) {
            return Err(ConfigLoadError::Invalid("orb.scale_factor must be greater than 1".into()));
        }
        if self.orb.n_levels == 0 || self.orb.n_levels > u8::MAX as usize {
            return Err(ConfigLoadError::Invalid("orb.n_levels must be in 1..=255".into()));
        }
        if self.orb.min_th_fast > self.orb.ini_th_fast {
            return Err(ConfigLoadError::Invalid("orb.min_th_fast must not exceed orb.ini_th_fast".into()));
        }
        if !(self.tracking.nn_ratio > 0.0 && self.tracking.nn_ratio <= 1.0) {
            return Err(ConfigLoadError::Invalid("tracking.nn_ratio must be in (0, 1]".into()));
        }
        Ok(())
    }

    pub fn camera_model(&self) -> CameraModel {
        let c = &self.camera;
        CameraModel {
            fx: c.fx,
            fy: c.fy,
            cx: c.cx,
            cy: c.cy,
            k1: c.k1,
            k2: c.k2,
            p1: c.p1,
            p2: c.p2,
            k3: c.k3,
            width: c.width,
            height: c.height,
        }
    }

    pub fn orb_params(&self) -> OrbParams {
        OrbParams {
            n_features: self.orb.n_features,
            scale_factor: self.orb.scale_factor,
            n_levels: self.orb.n_levels,
            ini_th_fast: self.orb.ini_th_fast,
            min_th_fast: self.orb.min_th_fast,
        }
    }

    /// Maximum frames between keyframes (defaults to one second of frames).
    pub fn kf_max_frames(&self) -> usize {
        self.tracking
            .kf_max_frames
            .unwrap_or_else(|| self.camera.fps.round().max(1.0) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = "camera:\n  fx: 450.0\n  fy: 451.0\n  fps: 20\ntracking:\n  min_inliers: 25\n";
        let s = Settings::from_yaml_str(yaml).unwrap();
        assert_eq!(s.camera.fx, 450.0);
        assert_eq!(s.camera.cx, 320.0);
        assert_eq!(s.tracking.min_inliers, 25);
        assert_eq!(s.tracking.min_inliers_after_reloc, 50);
        assert_eq!(s.orb.n_levels, 8);
        assert_eq!(s.kf_max_frames(), 20);
        assert!(s.loop_closing.enabled);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = Settings::from_yaml_str("camera:\n  fx: -1.0\n").unwrap_err();
        assert!(matches!(err, ConfigLoadError::Invalid(_)));
        let err = Settings::from_yaml_str("orb:\n  scale_factor: 1.0\n").unwrap_err();
        assert!(matches!(err, ConfigLoadError::Invalid(_)));
    }

    #[test]
    fn test_malformed_yaml() {
        let err = Settings::from_yaml_str("camera: [1, 2").unwrap_err();
        assert!(matches!(err, ConfigLoadError::Yaml(_)));
    }

    #[test]
    fn test_missing_file() {
        let err = Settings::load("/nonexistent/settings.yaml").unwrap_err();
        assert!(matches!(err, ConfigLoadError::Io { .. }));
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.yaml");
        let mut s = Settings::default();
        s.orb.n_features = 500;
        s.tracking.kf_max_frames = Some(12);
        s.save_yaml(&path).unwrap();
        let loaded = Settings::load(&path).unwrap();
        assert_eq!(loaded.orb.n_features, 500);
        assert_eq!(loaded.kf_max_frames(), 12);
    }
}
