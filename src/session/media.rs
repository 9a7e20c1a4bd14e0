use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::signaling::TrackInfo;

/// Local camera as the machine session sees it.
///
/// Only readiness and track metadata matter here; frames never pass through.
#[derive(Clone, Default)]
pub struct CaptureSource {
    live: Arc<RwLock<Option<TrackInfo>>>,
}

impl CaptureSource {
    pub fn new(track: Option<TrackInfo>) -> Self {
        Self {
            live: Arc::new(RwLock::new(track)),
        }
    }

    /// Source that never becomes ready
    pub fn absent() -> Self {
        Self::default()
    }

    pub fn live_track(&self) -> Option<TrackInfo> {
        self.live.read().clone()
    }

    pub fn set_live(&self, track: TrackInfo) {
        *self.live.write() = Some(track);
    }
}

/// Camera description in the config file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub enabled: bool,
    pub label: String,
    pub width: u32,
    pub height: u32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            label: "cab-camera".to_string(),
            width: 1280,
            height: 720,
        }
    }
}

impl From<&CameraConfig> for CaptureSource {
    fn from(config: &CameraConfig) -> Self {
        if !config.enabled {
            return CaptureSource::absent();
        }
        CaptureSource::new(Some(TrackInfo {
            label: config.label.clone(),
            width: config.width,
            height: config.height,
        }))
    }
}
