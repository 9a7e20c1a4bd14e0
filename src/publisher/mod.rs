//! Machine-side command publisher
//!
//! Reads the newest frame from the session mailbox on a fixed timer and
//! forwards it to the control bus as a [`JointCommand`](crate::mapping::JointCommand).

pub mod engine;

use serde::{Deserialize, Serialize};

use crate::mqtt::config::DEFAULT_COMMAND_TOPIC;
use crate::status::LinkState;

pub use engine::{CommandPublisher, PublisherHandle};

#[derive(Debug, thiserror::Error)]
pub enum PublisherError {
    #[error("Invalid publisher settings: {0}")]
    InvalidSettings(String),

    #[error("Publisher task failed: {0}")]
    TaskFailed(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherSettings {
    pub period_ms: u64,
    /// Filled from the bus section when loaded from the config file
    #[serde(skip)]
    pub topic: String,
}

impl Default for PublisherSettings {
    fn default() -> Self {
        Self {
            period_ms: 100,
            topic: DEFAULT_COMMAND_TOPIC.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Published,
    NoFrame,
    BusUnavailable(LinkState),
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishStats {
    pub published: u64,
    pub skipped_no_frame: u64,
    pub skipped_bus_down: u64,
    pub failed: u64,
}
