//! Configuration: YAML settings for the camera and every processing unit.

pub mod settings;

pub use settings::{
    CameraSettings, ConfigLoadError, LocalMappingSettings, LoopClosingSettings, OrbSettings, Settings,
    TrackingSettings,
};
