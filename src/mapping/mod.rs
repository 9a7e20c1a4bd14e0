//! Mapping from normalized control intent to machine joint commands
//!
//! A [`JointCommand`] is built once per publish tick from the newest
//! [`ControlFrame`](crate::frame::ControlFrame) and dropped after sending.

pub mod joint_command;

pub use joint_command::{JointCommand, JOINT_NAMES};
