//! Normalized control intent shared by both ends of the link
//!
//! A [`ControlFrame`] is what the operator side produces from the two
//! joysticks and what the machine side hands to the command publisher. Every
//! field is meant to lie in `[-1, 1]`. The fields are public, so the bound is
//! enforced where values enter: the normalizer builds frames through
//! [`ControlFrame::clamped`], decoded network frames pass through
//! [`ControlFrame::sanitized`], and the joint mapping sanitizes again.

use serde::{Deserialize, Serialize};

/// Six normalized actuator intents, each in `[-1, 1]`
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlFrame {
    pub left_track: f32,
    pub right_track: f32,
    pub swing: f32,
    pub boom: f32,
    pub stick: f32,
    pub bucket: f32,
}

impl ControlFrame {
    /// All-neutral frame
    pub const NEUTRAL: ControlFrame = ControlFrame {
        left_track: 0.0,
        right_track: 0.0,
        swing: 0.0,
        boom: 0.0,
        stick: 0.0,
        bucket: 0.0,
    };

    /// Builds a frame, forcing every field into `[-1, 1]`.
    ///
    /// NaN inputs become 0 so a broken axis reads as "no command".
    pub fn clamped(
        left_track: f32,
        right_track: f32,
        swing: f32,
        boom: f32,
        stick: f32,
        bucket: f32,
    ) -> Self {
        Self {
            left_track: clamp_unit(left_track),
            right_track: clamp_unit(right_track),
            swing: clamp_unit(swing),
            boom: clamp_unit(boom),
            stick: clamp_unit(stick),
            bucket: clamp_unit(bucket),
        }
    }

    /// Re-applies the bounds, used on frames that crossed the network
    pub fn sanitized(self) -> Self {
        Self::clamped(
            self.left_track,
            self.right_track,
            self.swing,
            self.boom,
            self.stick,
            self.bucket,
        )
    }

    pub fn fields(&self) -> [f32; 6] {
        [
            self.left_track,
            self.right_track,
            self.swing,
            self.boom,
            self.stick,
            self.bucket,
        ]
    }

    pub fn is_within_bounds(&self) -> bool {
        self.fields()
            .iter()
            .all(|v| v.is_finite() && (-1.0..=1.0).contains(v))
    }
}

pub(crate) fn clamp_unit(value: f32) -> f32 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(-1.0, 1.0)
    }
}
