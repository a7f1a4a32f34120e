//! Throughput actually confirmed by feedback, over a short sliding window.

use std::collections::VecDeque;

use crate::units::{DataRate, DataSize, TimeDelta, Timestamp};

/// Window the acknowledged rate is averaged over.
const RATE_WINDOW: TimeDelta = TimeDelta::from_micros(500_000);
/// Below this many samples the rate is considered unknown.
const MIN_SAMPLES: usize = 2;

/// Estimates the acknowledged bitrate from the receive times reported in
/// feedback. Probe packets are included; they were genuinely delivered.
#[derive(Debug, Default)]
pub struct AcknowledgedBitrateEstimator {
    window: VecDeque<(Timestamp, DataSize)>,
    window_size: DataSize,
    alr_ended: Option<Timestamp>,
}

impl AcknowledgedBitrateEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the end of an application limited period; samples before it are
    /// discarded since they reflect demand, not capacity.
    pub fn set_alr_ended(&mut self, at_time: Timestamp) {
        self.alr_ended = Some(at_time);
    }

    pub fn on_packet_acknowledged(&mut self, receive_time: Timestamp, size: DataSize) {
        if let Some(alr_end) = self.alr_ended.take() {
            while let Some(&(t, s)) = self.window.front() {
                if t >= alr_end {
                    break;
                }
                self.window_size -= s;
                self.window.pop_front();
            }
        }
        self.window.push_back((receive_time, size));
        self.window_size += size;
        self.prune(receive_time);
    }

    pub fn bitrate(&self) -> Option<DataRate> {
        if self.window.len() < MIN_SAMPLES {
            return None;
        }
        let first = self.window.front().unwrap().0;
        let last = self.window.back().unwrap().0;
        // Floor the denominator so a tight burst does not read as a huge
        // rate.
        let span = (last - first).max(TimeDelta::from_micros(150_000));
        Some(self.window_size / span)
    }

    fn prune(&mut self, now: Timestamp) {
        while let Some(&(t, s)) = self.window.front() {
            if now - t <= RATE_WINDOW {
                break;
            }
            self.window_size -= s;
            self.window.pop_front();
        }
    }
}
