//! Data channel payloads
//!
//! Every message is one JSON object tagged by `type`. Decoding is the
//! boundary where malformed frames get dropped; a decoded control frame has
//! already been forced back into bounds.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::frame::ControlFrame;
use crate::status::MachineTelemetry;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    /// Sent by the operator as soon as the data channel opens
    #[serde(rename = "operator_connected", rename_all = "camelCase")]
    Hello { operator_id: String, timestamp: i64 },
    Control {
        seq: u64,
        sent_at_ms: u64,
        frame: ControlFrame,
    },
    /// Machine's reply to each control frame, echoing its send time
    Ack { seq: u64, sent_at_ms: u64 },
    Telemetry(MachineTelemetry),
}

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("Malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Control frame out of bounds")]
    OutOfBounds,
}

impl WireMessage {
    pub fn encode(&self) -> Result<Bytes, WireError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let message: WireMessage = serde_json::from_slice(payload)?;
        match message {
            WireMessage::Control {
                seq,
                sent_at_ms,
                frame,
            } => {
                if !frame.fields().iter().all(|v| v.is_finite()) {
                    return Err(WireError::OutOfBounds);
                }
                Ok(WireMessage::Control {
                    seq,
                    sent_at_ms,
                    frame: frame.sanitized(),
                })
            }
            other => Ok(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_uses_operator_connected_tag() {
        let hello = WireMessage::Hello {
            operator_id: "control7".into(),
            timestamp: 1_700_000_000_000,
        };
        let json: serde_json::Value = serde_json::from_slice(&hello.encode().unwrap()).unwrap();
        assert_eq!(json["type"], "operator_connected");
        assert_eq!(json["operatorId"], "control7");
    }

    #[test]
    fn control_frames_are_clamped_on_decode() {
        let raw = br#"{"type":"control","seq":4,"sent_at_ms":10,"frame":{"leftTrack":2.5,"rightTrack":0,"swing":-9,"boom":0.3,"stick":0,"bucket":0}}"#;
        match WireMessage::decode(raw).unwrap() {
            WireMessage::Control { seq, frame, .. } => {
                assert_eq!(seq, 4);
                assert_eq!(frame.left_track, 1.0);
                assert_eq!(frame.swing, -1.0);
                assert_eq!(frame.boom, 0.3);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(
            WireMessage::decode(b"not json"),
            Err(WireError::Malformed(_))
        ));
        assert!(matches!(
            WireMessage::decode(br#"{"type":"control","seq":1}"#),
            Err(WireError::Malformed(_))
        ));
        assert!(WireMessage::decode(br#"{"type":"warp"}"#).is_err());
    }

    #[test]
    fn telemetry_is_flattened_into_envelope() {
        let message = WireMessage::Telemetry(MachineTelemetry {
            fuel_level: 64.0,
            status: "working".into(),
            ..Default::default()
        });
        let json: serde_json::Value = serde_json::from_slice(&message.encode().unwrap()).unwrap();
        assert_eq!(json["type"], "telemetry");
        assert_eq!(json["fuelLevel"], 64.0);
    }
}
