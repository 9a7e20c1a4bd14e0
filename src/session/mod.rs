//! Peer session: the link between one operator and one machine
//!
//! ```text
//! session/
//! ├── state.rs       - Pure lifecycle FSM (state, event) -> (state, effects)
//! ├── driver.rs      - Task executing effects; SessionHandle
//! ├── signaling.rs   - SignalingClient trait, ids and events
//! ├── local_hub.rs   - In-process signaling
//! ├── mqtt_relay.rs  - Signaling relayed through an MQTT broker
//! ├── wire.rs        - Data channel message format
//! ├── quality.rs     - Latency and loss from acks
//! ├── media.rs       - Capture source readiness
//! └── mailbox.rs     - Latest-frame cell shared with the publisher
//! ```

pub mod driver;
pub mod local_hub;
pub mod mailbox;
pub mod media;
pub mod mqtt_relay;
pub mod quality;
pub mod signaling;
pub mod state;
pub mod wire;

use serde::{Deserialize, Serialize};

pub use driver::{RoleIo, SessionHandle, SessionStats};
pub use local_hub::{LocalEndpoint, LocalHub};
pub use mailbox::LatestFrame;
pub use media::{CameraConfig, CaptureSource};
pub use mqtt_relay::{MqttRelay, SignalingConfig};
pub use signaling::{
    CallId, ChannelId, PeerId, SignalingClient, SignalingError, SignalingEvent, TrackInfo,
};
pub use state::{FailureCause, Role, SessionState};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Session driver is not running")]
    NotRunning,

    #[error("Session task failed: {0}")]
    TaskFailed(String),

    #[error(transparent)]
    Signaling(#[from] SignalingError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub media_retry_ms: u64,
    /// Failed capture-source probes before media is reported as failed
    pub media_retry_limit: u32,
    pub telemetry_interval_ms: u64,
    /// Control frames considered for packet loss
    pub ack_window: usize,
    pub camera: CameraConfig,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            media_retry_ms: 1000,
            media_retry_limit: 30,
            telemetry_interval_ms: 1000,
            ack_window: 100,
            camera: CameraConfig::default(),
        }
    }
}
