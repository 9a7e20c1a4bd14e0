use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::debug;

use crate::mapping::JointCommand;
use crate::status::LinkState;

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Control bus is not connected ({0})")]
    NotConnected(LinkState),

    #[error("Invalid bus endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Failed to encode joint command: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Publish failed: {0}")]
    Publish(String),
}

/// Connection to the machine's control bus
#[async_trait]
pub trait BusClient: Send + Sync {
    fn state(&self) -> LinkState;

    /// Sends one command. Fire-and-forget: nothing is buffered for replay.
    async fn publish(&self, topic: &str, command: &JointCommand) -> Result<(), BusError>;

    async fn shutdown(&self);
}

/// Commands a [`MemoryBus`] keeps; older ones are dropped
pub const MEMORY_BUS_RETAINED: usize = 256;

/// In-process bus that records the most recent published commands
#[derive(Clone)]
pub struct MemoryBus {
    inner: Arc<Mutex<MemoryBusInner>>,
}

struct MemoryBusInner {
    state: LinkState,
    published: VecDeque<(String, JointCommand)>,
    total: usize,
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MemoryBusInner {
                state: LinkState::Connected,
                published: VecDeque::with_capacity(MEMORY_BUS_RETAINED),
                total: 0,
            })),
        }
    }

    pub fn set_state(&self, state: LinkState) {
        debug!("Memory bus state set to {}", state);
        self.inner.lock().state = state;
    }

    /// Retained commands, oldest first
    pub fn published(&self) -> Vec<(String, JointCommand)> {
        self.inner.lock().published.iter().cloned().collect()
    }

    /// Commands accepted since creation, including dropped ones
    pub fn published_count(&self) -> usize {
        self.inner.lock().total
    }

    pub fn last(&self) -> Option<JointCommand> {
        self.inner.lock().published.back().map(|(_, c)| c.clone())
    }
}

#[async_trait]
impl BusClient for MemoryBus {
    fn state(&self) -> LinkState {
        self.inner.lock().state
    }

    async fn publish(&self, topic: &str, command: &JointCommand) -> Result<(), BusError> {
        let mut inner = self.inner.lock();
        if inner.state != LinkState::Connected {
            return Err(BusError::NotConnected(inner.state));
        }
        if inner.published.len() == MEMORY_BUS_RETAINED {
            inner.published.pop_front();
        }
        inner.published.push_back((topic.to_string(), command.clone()));
        inner.total += 1;
        Ok(())
    }

    async fn shutdown(&self) {
        self.inner.lock().state = LinkState::Disconnected;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::ControlFrame;
    use chrono::Utc;

    #[tokio::test]
    async fn memory_bus_refuses_when_down() {
        let bus = MemoryBus::new();
        let command = JointCommand::from_frame(&ControlFrame::NEUTRAL, Utc::now());

        bus.publish("/t", &command).await.unwrap();
        bus.set_state(LinkState::Error);
        assert!(matches!(
            bus.publish("/t", &command).await,
            Err(BusError::NotConnected(LinkState::Error))
        ));
        assert_eq!(bus.published_count(), 1);

        bus.shutdown().await;
        assert_eq!(bus.state(), LinkState::Disconnected);
    }

    #[tokio::test]
    async fn memory_bus_keeps_only_recent_commands() {
        let bus = MemoryBus::new();
        let extra = 10;
        for i in 0..MEMORY_BUS_RETAINED + extra {
            let frame = ControlFrame::clamped(0.0, 0.0, i as f32 / 1000.0, 0.0, 0.0, 0.0);
            let command = JointCommand::from_frame(&frame, Utc::now());
            bus.publish("/t", &command).await.unwrap();
        }

        let retained = bus.published();
        assert_eq!(retained.len(), MEMORY_BUS_RETAINED);
        assert_eq!(bus.published_count(), MEMORY_BUS_RETAINED + extra);

        let oldest = retained[0].1.position_of("body_rotate").unwrap();
        let expected = f64::from(extra as f32 / 1000.0) * std::f64::consts::PI;
        assert!((oldest - expected).abs() < 1e-9);
        assert_eq!(bus.last(), retained.last().map(|(_, c)| c.clone()));
    }
}
