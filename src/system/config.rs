//! System configuration.
//!
//! Plain data; parsing settings from files is left to the embedding
//! application.

use std::path::PathBuf;

/// Sensor modality the system is configured for.
///
/// Each modality has its own frame entry point; calling a mismatched one is
/// a caller-side programming error and fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sensor {
    Monocular,
    Stereo,
    Rgbd,
}

impl std::fmt::Display for Sensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Sensor::Monocular => write!(f, "monocular"),
            Sensor::Stereo => write!(f, "stereo"),
            Sensor::Rgbd => write!(f, "rgbd"),
        }
    }
}

/// Construction-time configuration of the system.
#[derive(Debug, Clone)]
pub struct SystemConfig {
    /// Sensor modality the frame entry points are validated against.
    pub sensor: Sensor,

    /// Trained vocabulary blob; when set, failure to load it is fatal.
    pub vocabulary_path: Option<PathBuf>,

    /// Map file used by `start_in_localization_mode`.
    pub map_path: Option<PathBuf>,

    /// Load the map file at startup and begin in localization-only mode.
    pub start_in_localization_mode: bool,

    /// Insert a keyframe every this many frames while mapping.
    pub keyframe_interval: usize,
}

impl SystemConfig {
    pub fn new(sensor: Sensor) -> Self {
        Self {
            sensor,
            vocabulary_path: None,
            map_path: None,
            start_in_localization_mode: false,
            keyframe_interval: 5,
        }
    }
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self::new(Sensor::Monocular)
    }
}
