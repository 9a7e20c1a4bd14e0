//! Telemetry and status surface
//!
//! Read-only projection of everything a presentation layer shows about a
//! link: per-channel connection state, link quality, the newest control
//! frame and the machine's scalar telemetry. Writers are the session and the
//! publisher; readers take a [`TelemetrySnapshot`] or subscribe for changes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

use crate::frame::ControlFrame;

/// State of one channel or of the bus connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LinkState::Disconnected => "disconnected",
            LinkState::Connecting => "connecting",
            LinkState::Connected => "connected",
            LinkState::Error => "error",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub data_channel_state: LinkState,
    pub media_channel_state: LinkState,
    pub bus_state: LinkState,
}

/// Scalar values reported by the machine
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineTelemetry {
    pub fuel_level: f32,
    pub battery_level: f32,
    pub hydraulic_pressure: f32,
    pub working_hours: f32,
    pub status: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkQuality {
    /// Round trip of the newest acknowledged control frame
    pub latency_ms: Option<u32>,
    pub packet_loss_pct: f32,
}

/// Everything the presentation layer renders, taken at one instant
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySnapshot {
    pub connection: ConnectionStatus,
    pub quality: LinkQuality,
    pub machine: Option<MachineTelemetry>,
    pub latest_frame: Option<ControlFrame>,
}

impl fmt::Display for TelemetrySnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "data={} media={} bus={}",
            self.connection.data_channel_state,
            self.connection.media_channel_state,
            self.connection.bus_state
        )?;
        if let Some(latency) = self.quality.latency_ms {
            write!(f, " rtt={}ms", latency)?;
        }
        write!(f, " loss={:.1}%", self.quality.packet_loss_pct)?;
        if let Some(machine) = &self.machine {
            write!(
                f,
                " fuel={:.0}% battery={:.0}% pressure={:.0}bar",
                machine.fuel_level, machine.battery_level, machine.hydraulic_pressure
            )?;
        }
        Ok(())
    }
}

/// Shared, cloneable writer and reader of the status surface
#[derive(Clone)]
pub struct StatusBoard {
    inner: Arc<watch::Sender<TelemetrySnapshot>>,
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusBoard {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(TelemetrySnapshot::default());
        Self {
            inner: Arc::new(tx),
        }
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        self.inner.borrow().clone()
    }

    pub fn connection(&self) -> ConnectionStatus {
        self.inner.borrow().connection
    }

    pub fn subscribe(&self) -> watch::Receiver<TelemetrySnapshot> {
        self.inner.subscribe()
    }

    pub fn set_data_state(&self, state: LinkState) {
        self.update(|s| replace(&mut s.connection.data_channel_state, state));
    }

    pub fn set_media_state(&self, state: LinkState) {
        self.update(|s| replace(&mut s.connection.media_channel_state, state));
    }

    pub fn set_bus_state(&self, state: LinkState) {
        self.update(|s| replace(&mut s.connection.bus_state, state));
    }

    pub fn set_quality(&self, quality: LinkQuality) {
        self.update(|s| replace(&mut s.quality, quality));
    }

    pub fn set_machine(&self, telemetry: MachineTelemetry) {
        self.update(|s| replace(&mut s.machine, Some(telemetry)));
    }

    pub fn set_latest_frame(&self, frame: ControlFrame) {
        self.update(|s| replace(&mut s.latest_frame, Some(frame)));
    }

    fn update(&self, apply: impl FnOnce(&mut TelemetrySnapshot) -> bool) {
        self.inner.send_if_modified(apply);
    }
}

fn replace<T: PartialEq>(slot: &mut T, value: T) -> bool {
    if *slot == value {
        false
    } else {
        *slot = value;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_projects_all_writers() {
        let board = StatusBoard::new();
        board.set_data_state(LinkState::Connected);
        board.set_bus_state(LinkState::Error);
        board.set_quality(LinkQuality {
            latency_ms: Some(42),
            packet_loss_pct: 2.5,
        });
        board.set_machine(MachineTelemetry {
            fuel_level: 80.0,
            ..Default::default()
        });

        let snapshot = board.snapshot();
        assert_eq!(snapshot.connection.data_channel_state, LinkState::Connected);
        assert_eq!(snapshot.connection.media_channel_state, LinkState::Disconnected);
        assert_eq!(snapshot.connection.bus_state, LinkState::Error);
        assert_eq!(snapshot.quality.latency_ms, Some(42));
        assert_eq!(snapshot.machine.map(|m| m.fuel_level), Some(80.0));
    }

    #[test]
    fn unchanged_writes_do_not_wake_subscribers() {
        let board = StatusBoard::new();
        let mut rx = board.subscribe();
        board.set_media_state(LinkState::Disconnected);
        assert!(!rx.has_changed().unwrap());
        board.set_media_state(LinkState::Connecting);
        assert!(rx.has_changed().unwrap());
        rx.mark_unchanged();
    }

    #[test]
    fn display_is_one_line() {
        let board = StatusBoard::new();
        board.set_data_state(LinkState::Connected);
        let line = board.snapshot().to_string();
        assert!(line.starts_with("data=connected media=disconnected bus=disconnected"));
        assert!(!line.contains('\n'));
    }
}
