use chrono::Local;
use gilrs::{Axis, Button, Event, EventType, GamepadId, Gilrs};
use serde::{Deserialize, Serialize};
use statum::{machine, state};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Neutral reading of a combined hat axis (no direction pressed)
pub const HAT_NEUTRAL: f32 = 1.2857143;

// Which of the two physical controllers a reading belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerSide {
    Left,
    Right,
}

impl ControllerSide {
    fn slot(self) -> usize {
        match self {
            ControllerSide::Left => 0,
            ControllerSide::Right => 1,
        }
    }
}

/// Identifies one axis on a controller.
///
/// Named axes follow gilrs' layout. `Hat` is the combined eight-way hat value
/// (up = -1.0, clockwise in steps of 2/7, neutral = [`HAT_NEUTRAL`]) that the
/// track calibration points are expressed in. `Code` addresses a raw event
/// code for axes gilrs does not name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AxisId {
    LeftStickX,
    LeftStickY,
    LeftZ,
    RightStickX,
    RightStickY,
    RightZ,
    DPadX,
    DPadY,
    Hat,
    Code(u32),
}

impl AxisId {
    fn from_gilrs(axis: Axis) -> Option<Self> {
        match axis {
            Axis::LeftStickX => Some(AxisId::LeftStickX),
            Axis::LeftStickY => Some(AxisId::LeftStickY),
            Axis::LeftZ => Some(AxisId::LeftZ),
            Axis::RightStickX => Some(AxisId::RightStickX),
            Axis::RightStickY => Some(AxisId::RightStickY),
            Axis::RightZ => Some(AxisId::RightZ),
            Axis::DPadX => Some(AxisId::DPadX),
            Axis::DPadY => Some(AxisId::DPadY),
            _ => None,
        }
    }
}

/// Latest raw values of one controller's axes
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AxisSnapshot {
    values: HashMap<AxisId, f32>,
}

impl AxisSnapshot {
    pub fn get(&self, axis: AxisId) -> Option<f32> {
        self.values.get(&axis).copied()
    }

    pub fn set(&mut self, axis: AxisId, value: f32) {
        self.values.insert(axis, value);
    }

    pub fn with(mut self, axis: AxisId, value: f32) -> Self {
        self.set(axis, value);
        self
    }
}

/// Raw state of both controllers; `None` means the controller is absent
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DualSample {
    pub left: Option<AxisSnapshot>,
    pub right: Option<AxisSnapshot>,
}

impl DualSample {
    pub fn side(&self, side: ControllerSide) -> Option<&AxisSnapshot> {
        match side {
            ControllerSide::Left => self.left.as_ref(),
            ControllerSide::Right => self.right.as_ref(),
        }
    }
}

// Collector settings
#[derive(Clone, Debug)]
pub struct CollectorSettings {
    pub poll_interval: Duration,
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1),
        }
    }
}

// Collector errors
#[derive(Debug, thiserror::Error)]
pub enum InputError {
    #[error("Failed to initialize collector: {0}")]
    InitializationError(String),

    #[error("Collector thread failed to start: {0}")]
    SpawnError(String),
}

// Pressed directions of a hat, either from d-pad buttons or d-pad axes
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct HatState {
    up: bool,
    right: bool,
    down: bool,
    left: bool,
}

impl HatState {
    // Combined hat encoding: direction index 0..=7 clockwise from up
    fn value(&self) -> f32 {
        let index = match (self.up, self.right, self.down, self.left) {
            (true, false, false, false) => 0,
            (true, true, false, false) => 1,
            (false, true, false, false) => 2,
            (false, true, true, false) => 3,
            (false, false, true, false) => 4,
            (false, false, true, true) => 5,
            (false, false, false, true) => 6,
            (true, false, false, true) => 7,
            _ => return HAT_NEUTRAL,
        };
        -1.0 + index as f32 * 2.0 / 7.0
    }
}

#[derive(Debug, Default)]
struct ControllerSlot {
    id: Option<GamepadId>,
    axes: AxisSnapshot,
    hat: HatState,
}

impl ControllerSlot {
    fn attach(&mut self, id: GamepadId) {
        self.id = Some(id);
        self.axes = AxisSnapshot::default().with(AxisId::Hat, HAT_NEUTRAL);
        self.hat = HatState::default();
    }

    fn detach(&mut self) {
        self.id = None;
        self.axes = AxisSnapshot::default();
        self.hat = HatState::default();
    }

    fn snapshot(&self) -> Option<AxisSnapshot> {
        self.id.map(|_| self.axes.clone())
    }

    // `value` is as gilrs reports it; the hat reads the d-pad in that convention
    fn record_axis(&mut self, named: Option<AxisId>, code: u32, value: f32) {
        let stored = named.map_or(value, |axis| stored_axis_value(axis, value));
        self.axes.set(AxisId::Code(code), stored);
        if let Some(named) = named {
            self.axes.set(named, stored);
            match named {
                AxisId::DPadX => {
                    self.hat.left = value < -0.5;
                    self.hat.right = value > 0.5;
                }
                AxisId::DPadY => {
                    self.hat.up = value > 0.5;
                    self.hat.down = value < -0.5;
                }
                _ => {}
            }
        }
        let hat = self.hat.value();
        self.axes.set(AxisId::Hat, hat);
    }
}

/// Converts a gilrs axis reading to the value stored in an [`AxisSnapshot`].
///
/// gilrs reports stick Y as +1 when pushed up. Snapshots use the opposite
/// sign (up = -1), which is what the axis layout and joint gains expect.
pub fn stored_axis_value(axis: AxisId, value: f32) -> f32 {
    match axis {
        AxisId::LeftStickY | AxisId::RightStickY => -value,
        _ => value,
    }
}

#[state]
#[derive(Debug, Clone)]
pub enum CollectionState {
    Initializing,
    Collecting,
}

#[machine]
pub struct EventCollector<S: CollectionState> {
    gilrs: Gilrs,

    // Index 0 is the left controller, index 1 the right one
    slots: [ControllerSlot; 2],

    settings: CollectorSettings,

    sample_sender: watch::Sender<DualSample>,
}

impl EventCollector<Initializing> {
    pub fn create(
        settings: Option<CollectorSettings>,
        sample_sender: watch::Sender<DualSample>,
    ) -> Result<Self, InputError> {
        let settings = settings.unwrap_or_default();
        debug!("Creating Event Collector with settings: {:?}", settings);

        info!("Initializing gilrs controller interface");
        let gilrs = match Gilrs::new() {
            Ok(g) => g,
            Err(e) => {
                error!("Failed to initialize gilrs: {}", e);
                return Err(InputError::InitializationError(e.to_string()));
            }
        };

        Ok(Self::new(
            gilrs,
            [ControllerSlot::default(), ControllerSlot::default()],
            settings,
            sample_sender,
        ))
    }

    /// Binds the first two connected gamepads to the left and right slots
    pub fn initialize(mut self) -> EventCollector<Collecting> {
        let connected: Vec<(GamepadId, String)> = self
            .gilrs
            .gamepads()
            .filter(|(_, gamepad)| gamepad.is_connected())
            .map(|(id, gamepad)| (id, gamepad.name().to_string()))
            .collect();

        if connected.is_empty() {
            warn!("No gamepad connected, both controllers read as neutral until one appears");
        }

        for (slot, (id, name)) in self.slots.iter_mut().zip(connected.iter()) {
            info!("Assigned gamepad {} ({})", name, id);
            slot.attach(*id);
        }
        if connected.len() > 2 {
            warn!(
                "{} gamepads connected, only the first two are used",
                connected.len()
            );
        }

        self.publish();
        info!("Event Collector initialized, transitioning to Collecting state");
        self.transition()
    }
}

impl EventCollector<Collecting> {
    /// Drains pending gilrs events. Returns how many were applied.
    pub fn collect_pending(&mut self) -> usize {
        let mut applied = 0;
        while let Some(Event { id, event, .. }) = self.gilrs.next_event() {
            if self.apply_event(id, event) {
                applied += 1;
            }
        }
        if applied > 0 {
            self.publish();
        }
        applied
    }

    pub fn run_collection_loop(&mut self, cancel: CancellationToken) {
        info!("Starting Event Collector loop");

        let mut event_count = 0usize;
        let mut last_log_time = Local::now();
        let log_interval = chrono::Duration::seconds(10);

        while !cancel.is_cancelled() {
            event_count += self.collect_pending();

            let now = Local::now();
            if now - last_log_time > log_interval {
                info!(
                    "Event Collector stats: applied {} events in last {} seconds",
                    event_count,
                    log_interval.num_seconds()
                );
                event_count = 0;
                last_log_time = now;
            }

            std::thread::sleep(self.settings.poll_interval);
        }
        info!("Event Collector loop stopped");
    }

    fn slot_of(&mut self, id: GamepadId) -> Option<&mut ControllerSlot> {
        self.slots.iter_mut().find(|slot| slot.id == Some(id))
    }

    fn apply_event(&mut self, id: GamepadId, event: EventType) -> bool {
        match event {
            EventType::Connected => {
                if self.slot_of(id).is_some() {
                    return false;
                }
                match self.slots.iter_mut().find(|slot| slot.id.is_none()) {
                    Some(slot) => {
                        info!("Gamepad {} connected and assigned", id);
                        slot.attach(id);
                        true
                    }
                    None => {
                        debug!("Gamepad {} connected but both slots are taken", id);
                        false
                    }
                }
            }
            EventType::Disconnected => match self.slot_of(id) {
                Some(slot) => {
                    warn!("Gamepad {} disconnected, its axes now read as neutral", id);
                    slot.detach();
                    true
                }
                None => false,
            },
            EventType::AxisChanged(axis, value, code) => {
                let Some(slot) = self.slot_of(id) else {
                    return false;
                };
                slot.record_axis(AxisId::from_gilrs(axis), code.into_u32(), value);
                true
            }
            EventType::ButtonPressed(button, _) | EventType::ButtonReleased(button, _) => {
                let pressed = matches!(event, EventType::ButtonPressed(..));
                let Some(slot) = self.slot_of(id) else {
                    return false;
                };
                match button {
                    Button::DPadUp => slot.hat.up = pressed,
                    Button::DPadDown => slot.hat.down = pressed,
                    Button::DPadLeft => slot.hat.left = pressed,
                    Button::DPadRight => slot.hat.right = pressed,
                    _ => return false,
                }
                let hat = slot.hat.value();
                slot.axes.set(AxisId::Hat, hat);
                true
            }
            _ => false,
        }
    }
}

impl<S: CollectionState> EventCollector<S> {
    fn publish(&self) {
        let sample = DualSample {
            left: self.slots[ControllerSide::Left.slot()].snapshot(),
            right: self.slots[ControllerSide::Right.slot()].snapshot(),
        };
        self.sample_sender.send_if_modified(|current| {
            if *current == sample {
                false
            } else {
                *current = sample;
                true
            }
        });
    }
}

/// Owns the collector thread; cancelling stops it
pub struct CollectorHandle {
    cancel: CancellationToken,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl CollectorHandle {
    /// Starts gilrs on a dedicated thread and publishes samples into `sample_sender`
    pub fn spawn(
        settings: Option<CollectorSettings>,
        sample_sender: watch::Sender<DualSample>,
    ) -> Result<Self, InputError> {
        info!("Spawning Event Collector with settings: {:?}", settings);
        let cancel = CancellationToken::new();
        let loop_cancel = cancel.clone();
        let (ready_tx, ready_rx) = std::sync::mpsc::sync_channel(1);

        let thread = std::thread::Builder::new()
            .name("gamepad-collector".to_string())
            .spawn(move || {
                let collector = match EventCollector::create(settings, sample_sender) {
                    Ok(collector) => {
                        let _ = ready_tx.send(Ok(()));
                        collector
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let mut collecting = collector.initialize();
                collecting.run_collection_loop(loop_cancel);
            })
            .map_err(|e| InputError::SpawnError(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                info!("Event Collector successfully started");
                Ok(Self {
                    cancel,
                    thread: Some(thread),
                })
            }
            Ok(Err(e)) => Err(e),
            Err(e) => Err(InputError::SpawnError(e.to_string())),
        }
    }

    pub fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Gamepad collector thread panicked");
            }
        }
    }
}

impl Drop for CollectorHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hat_encoding_matches_combined_axis_values() {
        let up = HatState {
            up: true,
            ..Default::default()
        };
        let down = HatState {
            down: true,
            ..Default::default()
        };
        assert_eq!(HatState::default().value(), HAT_NEUTRAL);
        assert!((up.value() - -1.0).abs() < 1e-6);
        assert!((down.value() - 0.142857).abs() < 1e-5);
    }

    #[test]
    fn contradictory_hat_reads_neutral() {
        let both = HatState {
            up: true,
            down: true,
            ..Default::default()
        };
        assert_eq!(both.value(), HAT_NEUTRAL);
    }

    #[test]
    fn snapshot_builder_overwrites() {
        let snapshot = AxisSnapshot::default()
            .with(AxisId::LeftStickX, 0.2)
            .with(AxisId::LeftStickX, 0.4);
        assert_eq!(snapshot.get(AxisId::LeftStickX), Some(0.4));
        assert_eq!(snapshot.get(AxisId::Hat), None);
    }

    #[test]
    fn stick_y_is_stored_with_up_negative() {
        assert_eq!(stored_axis_value(AxisId::LeftStickY, 1.0), -1.0);
        assert_eq!(stored_axis_value(AxisId::RightStickY, -0.5), 0.5);
        assert_eq!(stored_axis_value(AxisId::LeftStickX, 0.7), 0.7);
        assert_eq!(stored_axis_value(AxisId::DPadY, 1.0), 1.0);
    }

    #[test]
    fn pushing_sticks_up_extends_stick_and_boom() {
        use crate::controller::normalizer::{Normalizer, NormalizerSettings};
        use crate::mapping::JointCommand;

        // gilrs: fully up on each controller's Y axis
        let mut left = ControllerSlot::default();
        left.record_axis(Some(AxisId::LeftStickY), 1, 1.0);
        let mut right = ControllerSlot::default();
        right.record_axis(Some(AxisId::LeftStickY), 1, 1.0);

        let sample = DualSample {
            left: Some(left.axes.clone()),
            right: Some(right.axes.clone()),
        };
        let frame = Normalizer::new(NormalizerSettings::default()).frame_from(&sample);
        assert!(frame.stick < 0.0);
        assert!(frame.boom < 0.0);

        let command = JointCommand::from_frame(&frame, chrono::Utc::now());
        assert_eq!(command.position_of("arm_linear"), Some(3.0));
        assert_eq!(command.position_of("boom_linear"), Some(3.0));
    }

    #[test]
    fn dpad_axis_still_drives_the_hat() {
        let mut slot = ControllerSlot::default();
        slot.record_axis(Some(AxisId::DPadY), 17, 1.0);
        assert_eq!(slot.axes.get(AxisId::Hat), Some(-1.0));
        slot.record_axis(Some(AxisId::DPadY), 17, 0.0);
        assert_eq!(slot.axes.get(AxisId::Hat), Some(HAT_NEUTRAL));
    }
}
