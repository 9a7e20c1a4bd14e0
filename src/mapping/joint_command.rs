use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

use crate::frame::ControlFrame;

/// Joint identifiers in wire order
pub const JOINT_NAMES: [&str; 4] = ["bucket_linear", "arm_linear", "boom_linear", "body_rotate"];

/// Stroke of the three linear actuators per unit of intent
pub const LINEAR_GAIN: f64 = 3.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stamp {
    pub sec: i64,
    pub nanosec: u32,
}

impl From<DateTime<Utc>> for Stamp {
    fn from(time: DateTime<Utc>) -> Self {
        Self {
            sec: time.timestamp(),
            nanosec: time.timestamp_subsec_nanos(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub stamp: Stamp,
    pub frame_id: String,
}

/// One tick's worth of joint targets, shaped like a `sensor_msgs/JointState`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JointCommand {
    pub header: Header,
    pub name: Vec<String>,
    pub position: Vec<f64>,
    pub velocity: Vec<f64>,
    pub effort: Vec<f64>,
}

impl JointCommand {
    /// Maps a frame onto the four joints.
    ///
    /// `stick` drives `boom_linear` and `boom` drives `arm_linear`; the
    /// crossing matches how the machine's hydraulics are plumbed.
    pub fn from_frame(frame: &ControlFrame, stamped_at: DateTime<Utc>) -> Self {
        let frame = frame.sanitized();
        let position = vec![
            -f64::from(frame.bucket) * LINEAR_GAIN,
            -f64::from(frame.boom) * LINEAR_GAIN,
            -f64::from(frame.stick) * LINEAR_GAIN,
            f64::from(frame.swing) * PI,
        ];

        Self {
            header: Header {
                stamp: stamped_at.into(),
                frame_id: String::new(),
            },
            name: JOINT_NAMES.iter().map(|n| n.to_string()).collect(),
            velocity: vec![0.0; JOINT_NAMES.len()],
            effort: vec![0.0; JOINT_NAMES.len()],
            position,
        }
    }

    pub fn position_of(&self, joint: &str) -> Option<f64> {
        self.name
            .iter()
            .position(|n| n == joint)
            .and_then(|i| self.position.get(i).copied())
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 250_000_000).single().unwrap()
    }

    #[test]
    fn reference_frame_maps_to_expected_positions() {
        let frame = ControlFrame {
            bucket: 0.5,
            boom: -1.0,
            stick: 0.0,
            swing: 1.0,
            ..ControlFrame::NEUTRAL
        };
        let command = JointCommand::from_frame(&frame, at());
        assert_eq!(command.position, vec![-1.5, 3.0, 0.0, PI]);
        assert_eq!(command.velocity, vec![0.0; 4]);
        assert_eq!(command.effort, vec![0.0; 4]);
        assert_eq!(command.name, JOINT_NAMES.to_vec());
    }

    #[test]
    fn tracks_do_not_reach_joints() {
        let frame = ControlFrame {
            left_track: 1.0,
            right_track: -1.0,
            ..ControlFrame::NEUTRAL
        };
        let command = JointCommand::from_frame(&frame, at());
        assert!(command.position.iter().all(|p| *p == 0.0));
    }

    #[test]
    fn stamp_splits_seconds_and_nanos() {
        let command = JointCommand::from_frame(&ControlFrame::NEUTRAL, at());
        assert_eq!(
            command.header.stamp,
            Stamp {
                sec: 1_700_000_000,
                nanosec: 250_000_000
            }
        );

        let json: serde_json::Value = serde_json::from_slice(&command.to_json().unwrap()).unwrap();
        assert_eq!(json["header"]["stamp"]["nanosec"], 250_000_000);
        assert_eq!(json["header"]["frame_id"], "");
        assert_eq!(json["name"][3], "body_rotate");
    }

    #[test]
    fn swing_lookup_by_name() {
        let frame = ControlFrame {
            swing: 0.6,
            ..ControlFrame::NEUTRAL
        };
        let command = JointCommand::from_frame(&frame, at());
        let rotate = command.position_of("body_rotate").unwrap();
        assert!((rotate - 1.885).abs() < 1e-3);
        assert_eq!(command.position_of("missing"), None);
    }
}
