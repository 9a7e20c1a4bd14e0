//! Raw axes → [`ControlFrame`]
//!
//! Two kinds of axes feed a frame. Plain stick axes only get a deadzone.
//! Track axes come from a combined hat whose three calibration points
//! (forward, still, backward) do not form a symmetric bipolar range, so they
//! get a dedicated piecewise conversion.
//!
//! The sampling loop runs on a fixed short interval and overwrites a single
//! watch slot; readers always see the newest frame and nothing is queued.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::controller::event_collector::{AxisId, AxisSnapshot, ControllerSide, DualSample};
use crate::frame::{clamp_unit, ControlFrame};

pub const DEFAULT_DEADZONE: f32 = 0.1;

/// Calibration points of a combined track axis
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackCalibration {
    pub forward: f32,
    pub still: f32,
    pub backward: f32,
}

impl Default for TrackCalibration {
    fn default() -> Self {
        Self {
            forward: -1.0,
            still: 1.286,
            backward: 0.143,
        }
    }
}

impl TrackCalibration {
    /// The points must be ordered `forward < backward < still`
    pub fn is_ordered(&self) -> bool {
        self.forward < self.backward && self.backward < self.still
    }
}

/// Deadzone filter for a plain stick axis
pub fn normalize_axis(value: f32, deadzone: f32) -> f32 {
    if value.is_nan() {
        return 0.0;
    }
    if value.abs() > deadzone {
        value
    } else {
        0.0
    }
}

/// Maps a combined track reading onto `[-1, 1]`.
///
/// Near `still` is neutral. `[backward, still)` ramps from 0 down to -1 at
/// `backward`; anything below `backward` ramps up towards +1, reaching it at
/// `forward`. Readings above `still` are outside the calibrated range and
/// read as neutral.
pub fn normalize_track(value: f32, calibration: &TrackCalibration, deadzone: f32) -> f32 {
    let TrackCalibration {
        forward,
        still,
        backward,
    } = *calibration;

    if value.is_nan() || (value - still).abs() < deadzone {
        return 0.0;
    }

    if value >= backward && value < still {
        let progress = (still - value) / (still - backward);
        return (-progress).max(-1.0);
    }

    if value < backward {
        let progress = (still - value) / (still - forward);
        return progress.min(1.0);
    }

    0.0
}

/// Which axis drives which frame field
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AxisLayout {
    pub swing: AxisId,
    pub stick: AxisId,
    pub left_track: AxisId,
    pub bucket: AxisId,
    pub boom: AxisId,
    pub right_track: AxisId,
}

impl Default for AxisLayout {
    // Left controller: X swings, Y works the stick. Right controller: X curls
    // the bucket, Y works the boom. Both hats drive their track.
    fn default() -> Self {
        Self {
            swing: AxisId::LeftStickX,
            stick: AxisId::LeftStickY,
            left_track: AxisId::Hat,
            bucket: AxisId::LeftStickX,
            boom: AxisId::LeftStickY,
            right_track: AxisId::Hat,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizerSettings {
    pub sample_interval_ms: u64,
    pub deadzone: f32,
    pub track: TrackCalibration,
    pub layout: AxisLayout,
}

impl Default for NormalizerSettings {
    fn default() -> Self {
        Self {
            sample_interval_ms: 16,
            deadzone: DEFAULT_DEADZONE,
            track: TrackCalibration::default(),
            layout: AxisLayout::default(),
        }
    }
}

/// Pure conversion from one raw sample to a frame
#[derive(Debug, Clone)]
pub struct Normalizer {
    settings: NormalizerSettings,
}

impl Normalizer {
    pub fn new(settings: NormalizerSettings) -> Self {
        Self { settings }
    }

    pub fn frame_from(&self, sample: &DualSample) -> ControlFrame {
        let layout = &self.settings.layout;
        let left = sample.side(ControllerSide::Left);
        let right = sample.side(ControllerSide::Right);

        ControlFrame::clamped(
            self.track(left, layout.left_track),
            self.track(right, layout.right_track),
            self.plain(left, layout.swing),
            self.plain(right, layout.boom),
            self.plain(left, layout.stick),
            self.plain(right, layout.bucket),
        )
    }

    fn plain(&self, controller: Option<&AxisSnapshot>, axis: AxisId) -> f32 {
        controller
            .and_then(|c| c.get(axis))
            .map(|v| clamp_unit(normalize_axis(v, self.settings.deadzone)))
            .unwrap_or(0.0)
    }

    fn track(&self, controller: Option<&AxisSnapshot>, axis: AxisId) -> f32 {
        controller
            .and_then(|c| c.get(axis))
            .map(|v| normalize_track(v, &self.settings.track, self.settings.deadzone))
            .unwrap_or(0.0)
    }
}

/// Runs the sampling loop on the tokio runtime
pub struct NormalizerHandle {
    frames: watch::Receiver<ControlFrame>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl NormalizerHandle {
    pub fn spawn(samples: watch::Receiver<DualSample>, settings: NormalizerSettings) -> Self {
        let period = Duration::from_millis(settings.sample_interval_ms.max(1));
        let normalizer = Normalizer::new(settings);
        let (frame_tx, frame_rx) = watch::channel(ControlFrame::NEUTRAL);
        let cancel = CancellationToken::new();
        let loop_cancel = cancel.clone();

        info!("Starting input normalizer at {:?} per sample", period);
        let task = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = loop_cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let frame = normalizer.frame_from(&samples.borrow());
                        // Every tick is a fresh sample even when the value repeats
                        frame_tx.send_replace(frame);
                    }
                }
            }
            debug!("Input normalizer stopped");
        });

        Self {
            frames: frame_rx,
            cancel,
            task: Some(task),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ControlFrame> {
        self.frames.clone()
    }

    pub fn latest(&self) -> ControlFrame {
        *self.frames.borrow()
    }

    pub async fn shutdown(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for NormalizerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f32 = 1e-5;

    fn cal() -> TrackCalibration {
        TrackCalibration::default()
    }

    #[test]
    fn plain_axis_deadzone_is_exclusive() {
        assert_eq!(normalize_axis(0.1, 0.1), 0.0);
        assert_eq!(normalize_axis(-0.1, 0.1), 0.0);
        assert_eq!(normalize_axis(0.05, 0.1), 0.0);
        assert_eq!(normalize_axis(0.1001, 0.1), 0.1001);
        assert_eq!(normalize_axis(-0.75, 0.1), -0.75);
        assert_eq!(normalize_axis(f32::NAN, 0.1), 0.0);
    }

    #[test]
    fn plain_axis_passes_values_outside_deadzone_through() {
        for step in -100..=100 {
            let v = step as f32 / 100.0;
            let out = normalize_axis(v, 0.1);
            if v.abs() <= 0.1 {
                assert_eq!(out, 0.0, "v = {v}");
            } else {
                assert_eq!(out, v, "v = {v}");
            }
        }
    }

    #[test]
    fn track_calibration_points() {
        let c = cal();
        assert_eq!(normalize_track(c.still, &c, 0.1), 0.0);
        assert!((normalize_track(c.forward, &c, 0.1) - 1.0).abs() < EPS);
        assert!((normalize_track(c.backward, &c, 0.1) - -1.0).abs() < EPS);
    }

    #[test]
    fn track_deadzone_around_still() {
        let c = cal();
        assert_eq!(normalize_track(c.still - 0.09, &c, 0.1), 0.0);
        assert_eq!(normalize_track(c.still + 0.09, &c, 0.1), 0.0);
        assert!(normalize_track(c.still - 0.2, &c, 0.1) < 0.0);
    }

    #[test]
    fn track_backward_segment_is_monotone_into_negative_range() {
        let c = cal();
        let mut previous = 0.0;
        let mut v = c.still - 0.11;
        while v > c.backward {
            let out = normalize_track(v, &c, 0.1);
            assert!(out < 0.0 && out > -1.0, "v = {v} out = {out}");
            assert!(out <= previous, "not monotone at {v}");
            previous = out;
            v -= 0.01;
        }
    }

    #[test]
    fn track_forward_segment_is_monotone_into_positive_range() {
        let c = cal();
        let mut previous = 0.0;
        let mut v = c.backward - 0.001;
        while v > c.forward {
            let out = normalize_track(v, &c, 0.1);
            assert!(out > 0.0 && out < 1.0, "v = {v} out = {out}");
            assert!(out >= previous, "not monotone at {v}");
            previous = out;
            v -= 0.01;
        }
    }

    #[test]
    fn track_out_of_range_stays_bounded() {
        let c = cal();
        assert_eq!(normalize_track(5.0, &c, 0.1), 0.0);
        assert_eq!(normalize_track(c.still + 0.5, &c, 0.1), 0.0);
        assert_eq!(normalize_track(-40.0, &c, 0.1), 1.0);
        assert_eq!(normalize_track(f32::NAN, &c, 0.1), 0.0);
    }

    #[test]
    fn missing_controllers_give_neutral_frame() {
        let normalizer = Normalizer::new(NormalizerSettings::default());
        assert_eq!(
            normalizer.frame_from(&DualSample::default()),
            ControlFrame::NEUTRAL
        );
    }

    #[test]
    fn frame_uses_layout_per_side() {
        let normalizer = Normalizer::new(NormalizerSettings::default());
        let c = cal();
        let sample = DualSample {
            left: Some(
                AxisSnapshot::default()
                    .with(AxisId::LeftStickX, 0.6)
                    .with(AxisId::LeftStickY, -0.05)
                    .with(AxisId::Hat, c.forward),
            ),
            right: Some(
                AxisSnapshot::default()
                    .with(AxisId::LeftStickX, -0.4)
                    .with(AxisId::LeftStickY, 0.9)
                    .with(AxisId::Hat, c.backward),
            ),
        };
        let frame = normalizer.frame_from(&sample);
        assert_eq!(frame.swing, 0.6);
        assert_eq!(frame.stick, 0.0);
        assert!((frame.left_track - 1.0).abs() < EPS);
        assert_eq!(frame.bucket, -0.4);
        assert_eq!(frame.boom, 0.9);
        assert!((frame.right_track - -1.0).abs() < EPS);
    }

    #[test]
    fn wild_raw_values_never_leave_bounds() {
        let normalizer = Normalizer::new(NormalizerSettings::default());
        for raw in [-1e9_f32, -3.0, -1.0, 0.0, 0.5, 1.0, 1.29, 2.0, 1e9, f32::INFINITY] {
            let snapshot = AxisSnapshot::default()
                .with(AxisId::LeftStickX, raw)
                .with(AxisId::LeftStickY, raw)
                .with(AxisId::Hat, raw);
            let frame = normalizer.frame_from(&DualSample {
                left: Some(snapshot.clone()),
                right: Some(snapshot),
            });
            assert!(frame.is_within_bounds(), "raw = {raw} frame = {frame:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn handle_tracks_latest_sample() {
        let (sample_tx, sample_rx) = watch::channel(DualSample::default());
        let mut handle = NormalizerHandle::spawn(sample_rx, NormalizerSettings::default());
        let mut frames = handle.subscribe();

        sample_tx.send_replace(DualSample {
            left: Some(AxisSnapshot::default().with(AxisId::LeftStickX, 0.5)),
            right: None,
        });
        tokio::time::sleep(Duration::from_millis(40)).await;
        frames.changed().await.unwrap();
        assert_eq!(frames.borrow().swing, 0.5);
        assert_eq!(handle.latest().swing, 0.5);

        handle.shutdown().await;
    }
}
