use std::collections::VecDeque;

use crate::status::LinkQuality;

/// Unacknowledged frames younger than this may still be in flight
pub const SETTLE_MS: u64 = 1000;

#[derive(Debug, Clone, Copy)]
struct SentFrame {
    seq: u64,
    sent_at_ms: u64,
    acked: bool,
}

/// Round trip and loss over the most recent control frames
#[derive(Debug)]
pub struct LinkMonitor {
    window: usize,
    sent: VecDeque<SentFrame>,
    highest_acked: Option<u64>,
    latency_ms: Option<u32>,
}

impl LinkMonitor {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            sent: VecDeque::new(),
            highest_acked: None,
            latency_ms: None,
        }
    }

    pub fn record_sent(&mut self, seq: u64, sent_at_ms: u64) {
        self.sent.push_back(SentFrame {
            seq,
            sent_at_ms,
            acked: false,
        });
        while self.sent.len() > self.window {
            self.sent.pop_front();
        }
    }

    /// Returns `false` for acks outside the window or already counted
    pub fn record_ack(&mut self, seq: u64, sent_at_ms: u64, now_ms: u64) -> bool {
        let Some(frame) = self.sent.iter_mut().find(|f| f.seq == seq) else {
            return false;
        };
        if frame.acked {
            return false;
        }
        frame.acked = true;
        self.highest_acked = Some(self.highest_acked.map_or(seq, |h| h.max(seq)));
        let rtt = now_ms.saturating_sub(sent_at_ms);
        self.latency_ms = Some(u32::try_from(rtt).unwrap_or(u32::MAX));
        true
    }

    /// A frame counts towards loss once a later frame was acked or it is
    /// older than [`SETTLE_MS`]
    pub fn quality(&self, now_ms: u64) -> LinkQuality {
        let mut settled = 0usize;
        let mut lost = 0usize;
        for frame in &self.sent {
            let overtaken = self.highest_acked.is_some_and(|h| frame.seq <= h);
            let expired = now_ms.saturating_sub(frame.sent_at_ms) >= SETTLE_MS;
            if frame.acked || overtaken || expired {
                settled += 1;
                if !frame.acked {
                    lost += 1;
                }
            }
        }
        let packet_loss_pct = if settled == 0 {
            0.0
        } else {
            lost as f32 * 100.0 / settled as f32
        };
        LinkQuality {
            latency_ms: self.latency_ms,
            packet_loss_pct,
        }
    }

    pub fn reset(&mut self) {
        self.sent.clear();
        self.highest_acked = None;
        self.latency_ms = None;
    }
}
