//! Controller Handle - Unified API for operator input
//!
//! Wires the two stages of the input pipeline together: the gilrs collector
//! thread publishing raw [`DualSample`]s, and the normalizer task turning the
//! newest sample into a [`ControlFrame`] every sampling tick.
//!
//! ```text
//! Gamepads ──► Collector ──[watch<DualSample>]──► Normalizer ──[watch<ControlFrame>]──► Session
//! ```

use tokio::sync::watch;
use tracing::{debug, info};

pub use super::event_collector::{
    AxisId, AxisSnapshot, CollectorHandle, CollectorSettings, ControllerSide, DualSample,
    InputError,
};
pub use super::normalizer::{
    normalize_axis, normalize_track, AxisLayout, Normalizer, NormalizerHandle,
    NormalizerSettings, TrackCalibration,
};
use crate::frame::ControlFrame;

/// Configuration for the complete input subsystem
#[derive(Clone, Debug, Default)]
pub struct ControllerSettings {
    pub collector: CollectorSettings,
    pub normalizer: NormalizerSettings,
}

/// Owns both stages of the input pipeline.
///
/// Frames are exposed through a watch receiver, so a slow reader only ever
/// sees the newest frame.
pub struct ControllerHandle {
    collector: Option<CollectorHandle>,
    normalizer: NormalizerHandle,
    // Keeps the sample slot alive when no collector owns the sender
    _samples: Option<watch::Sender<DualSample>>,
}

impl ControllerHandle {
    /// Starts gamepad collection and normalization
    pub fn spawn(settings: Option<ControllerSettings>) -> Result<Self, InputError> {
        let settings = settings.unwrap_or_default();
        info!("Initializing Controller system with settings: {:?}", settings);

        let (sample_tx, sample_rx) = watch::channel(DualSample::default());
        debug!("Created sample slot");

        info!("Creating Event Collector");
        let collector = CollectorHandle::spawn(Some(settings.collector), sample_tx)?;

        info!("Creating Input Normalizer");
        let normalizer = NormalizerHandle::spawn(sample_rx, settings.normalizer);

        info!("Controller system initialized successfully");
        Ok(Self {
            collector: Some(collector),
            normalizer,
            _samples: None,
        })
    }

    /// Normalizes samples from an external source instead of gilrs.
    ///
    /// Used for scripted input and headless runs.
    pub fn from_samples(
        samples: watch::Receiver<DualSample>,
        settings: NormalizerSettings,
    ) -> Self {
        info!("Initializing Controller system without gamepads");
        Self {
            collector: None,
            normalizer: NormalizerHandle::spawn(samples, settings),
            _samples: None,
        }
    }

    /// Input pipeline whose controllers are permanently absent
    pub fn idle(settings: NormalizerSettings) -> Self {
        let (sample_tx, sample_rx) = watch::channel(DualSample::default());
        let mut handle = Self::from_samples(sample_rx, settings);
        handle._samples = Some(sample_tx);
        handle
    }

    pub fn frames(&self) -> watch::Receiver<ControlFrame> {
        self.normalizer.subscribe()
    }

    pub fn latest(&self) -> ControlFrame {
        self.normalizer.latest()
    }

    pub async fn shutdown(&mut self) {
        info!("Shutting down Controller system");
        if let Some(mut collector) = self.collector.take() {
            // Joining the collector thread blocks
            let _ = tokio::task::spawn_blocking(move || collector.stop()).await;
        }
        self.normalizer.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn scripted_samples_reach_frames() {
        let (tx, rx) = watch::channel(DualSample::default());
        let mut handle = ControllerHandle::from_samples(rx, NormalizerSettings::default());

        tx.send_replace(DualSample {
            left: None,
            right: Some(AxisSnapshot::default().with(AxisId::LeftStickY, -0.8)),
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let frame = handle.latest();
        assert_eq!(frame.boom, -0.8);
        assert_eq!(frame.swing, 0.0);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn idle_pipeline_stays_neutral() {
        let mut handle = ControllerHandle::idle(NormalizerSettings::default());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.latest(), ControlFrame::NEUTRAL);
        handle.shutdown().await;
    }
}
