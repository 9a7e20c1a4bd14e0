//! Controller subsystem for operator input
//!
//! 1. [`event_collector`] - Raw gamepad axis collection (gilrs thread)
//! 2. [`normalizer`] - Deadzone and track calibration into a [`ControlFrame`]
//! 3. [`controller_handle`] - Unified API and lifecycle management
//!
//! [`ControlFrame`]: crate::frame::ControlFrame

pub mod controller_handle;
pub mod event_collector;
pub mod normalizer;

pub use controller_handle::{ControllerHandle, ControllerSettings};
pub use event_collector::{AxisId, AxisSnapshot, ControllerSide, DualSample, InputError};
pub use normalizer::{AxisLayout, NormalizerSettings, TrackCalibration};
