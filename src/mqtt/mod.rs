//! # Control bus
//!
//! The machine side forwards joint commands onto its control bus through a
//! [`BusClient`]. Two implementations exist:
//!
//! ```text
//! mqtt/
//! ├── config.rs        - Endpoint parsing and bus settings
//! ├── bus.rs           - BusClient trait, errors and the in-memory bus
//! └── mqtt_handler.rs  - rumqttc-backed bus with its event loop task
//! ```
//!
//! [`connect`] picks the implementation from the configured URL.

pub mod bus;
pub mod config;
pub mod mqtt_handler;

use std::sync::Arc;

pub use bus::{BusClient, BusError, MemoryBus};
pub use config::{BusConfig, Endpoint};
pub use mqtt_handler::MqttBus;

/// Opens the bus named by `config.url`
pub fn connect(config: &BusConfig) -> Result<Arc<dyn BusClient>, BusError> {
    match config.endpoint()? {
        Endpoint::Memory => Ok(Arc::new(MemoryBus::new())),
        Endpoint::Mqtt { .. } => Ok(Arc::new(MqttBus::connect(config)?)),
    }
}
