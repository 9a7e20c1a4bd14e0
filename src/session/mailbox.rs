use arc_swap::ArcSwapOption;
use std::sync::Arc;

use crate::frame::ControlFrame;

/// Single-slot cell holding the newest control frame.
///
/// The session is the only writer and the publisher the only reader. A store
/// replaces the previous frame atomically; nothing is ever queued.
#[derive(Clone, Default)]
pub struct LatestFrame {
    slot: Arc<ArcSwapOption<ControlFrame>>,
}

impl LatestFrame {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, frame: ControlFrame) {
        self.slot.store(Some(Arc::new(frame)));
    }

    /// `None` until the first frame arrives
    pub fn load(&self) -> Option<ControlFrame> {
        self.slot.load_full().map(|frame| *frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newest_store_wins() {
        let mailbox = LatestFrame::new();
        assert_eq!(mailbox.load(), None);

        let reader = mailbox.clone();
        mailbox.store(ControlFrame {
            swing: 0.2,
            ..ControlFrame::NEUTRAL
        });
        mailbox.store(ControlFrame {
            swing: 0.9,
            ..ControlFrame::NEUTRAL
        });
        assert_eq!(reader.load().map(|f| f.swing), Some(0.9));
    }
}
