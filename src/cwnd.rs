//! Congestion window sizing and encoder overshoot detection.

use std::collections::VecDeque;

use crate::units::{DataRate, DataSize, TimeDelta, Timestamp};

/// Never shrink the window below two full packets.
const MIN_CWND: DataSize = DataSize::from_bytes(2 * 1500);

/// Sizes an optional cap on bytes in flight from the round trip time and the
/// current target rate. When outstanding data exceeds the window the pacer is
/// gated and the estimator gets a backoff signal.
#[derive(Debug)]
pub struct CongestionWindowController {
    enabled: bool,
    additional_time: TimeDelta,
    window: Option<DataSize>,
}

impl CongestionWindowController {
    pub fn new(enabled: bool, additional_time: TimeDelta) -> Self {
        Self {
            enabled,
            additional_time,
            window: None,
        }
    }

    /// Recomputes the window. Without an RTT measurement there is no basis
    /// for a cap, so none is applied.
    pub fn update(&mut self, target: DataRate, min_rtt: Option<TimeDelta>) -> Option<DataSize> {
        if !self.enabled {
            self.window = None;
            return None;
        }
        self.window = min_rtt.map(|rtt| (target * (rtt + self.additional_time)).max(MIN_CWND));
        self.window
    }

    pub fn window(&self) -> Option<DataSize> {
        self.window
    }

    pub fn is_congested(&self, outstanding: DataSize) -> bool {
        matches!(self.window, Some(window) if outstanding > window)
    }
}

/// Compares produced frame sizes against the ideal size for the current
/// rate and frame rate, over a sliding window.
///
/// Overshoot within a frame is only charged up to the current virtual buffer
/// level, so one oversized frame that the encoder compensates for afterwards
/// is not double counted.
#[derive(Debug)]
pub struct OvershootDetector {
    window: TimeDelta,
    utilization_factors: VecDeque<(f64, Timestamp)>,
    sum_utilization: f64,
    target_rate: DataRate,
    target_fps: f64,
    buffer_level_bits: i64,
    last_update: Option<Timestamp>,
}

impl OvershootDetector {
    pub fn new(window: TimeDelta) -> Self {
        Self {
            window,
            utilization_factors: VecDeque::new(),
            sum_utilization: 0.0,
            target_rate: DataRate::zero(),
            target_fps: 0.0,
            buffer_level_bits: 0,
            last_update: None,
        }
    }

    pub fn set_target_rate(&mut self, target: DataRate, target_fps: f64, at_time: Timestamp) {
        if !self.target_rate.is_zero() {
            self.leak_bits(at_time);
        } else if !target.is_zero() {
            // Stream just enabled.
            self.last_update = Some(at_time);
            self.utilization_factors.clear();
            self.sum_utilization = 0.0;
            self.buffer_level_bits = 0;
        }
        self.target_rate = target;
        self.target_fps = target_fps;
    }

    pub fn on_encoded_frame(&mut self, size: DataSize, at_time: Timestamp) {
        self.leak_bits(at_time);

        let ideal_frame_bits = self.ideal_frame_size_bits();
        if ideal_frame_bits == 0 {
            return;
        }

        let frame_bits = size.bits();
        let bitsum = frame_bits + self.buffer_level_bits;
        let overshoot_bits = if bitsum > ideal_frame_bits {
            self.buffer_level_bits.min(bitsum - ideal_frame_bits)
        } else {
            0
        };

        let factor = if self.utilization_factors.is_empty() {
            (frame_bits as f64 / ideal_frame_bits as f64).max(1.0)
        } else {
            1.0 + overshoot_bits as f64 / ideal_frame_bits as f64
        };
        self.utilization_factors.push_back((factor, at_time));
        self.sum_utilization += factor;

        self.buffer_level_bits -= overshoot_bits;
        self.buffer_level_bits += frame_bits;
    }

    /// Mean utilization over the window, or `None` with no recent frames.
    pub fn utilization_factor(&mut self, at_time: Timestamp) -> Option<f64> {
        let cutoff = at_time - self.window;
        while let Some(&(factor, t)) = self.utilization_factors.front() {
            if t >= cutoff {
                break;
            }
            self.sum_utilization = (self.sum_utilization - factor).max(0.0);
            self.utilization_factors.pop_front();
        }
        if self.utilization_factors.is_empty() {
            return None;
        }
        Some(self.sum_utilization / self.utilization_factors.len() as f64)
    }

    pub fn reset(&mut self) {
        self.utilization_factors.clear();
        self.sum_utilization = 0.0;
        self.target_rate = DataRate::zero();
        self.target_fps = 0.0;
        self.buffer_level_bits = 0;
        self.last_update = None;
    }

    fn ideal_frame_size_bits(&self) -> i64 {
        if self.target_fps <= 0.0 || self.target_rate.is_zero() {
            return 0;
        }
        (self.target_rate.bps_f64() / self.target_fps).round() as i64
    }

    fn leak_bits(&mut self, at_time: Timestamp) {
        if let Some(last) = self.last_update {
            if self.target_rate > DataRate::zero() {
                let leaked = (self.target_rate * (at_time - last)).bits();
                self.buffer_level_bits = (self.buffer_level_bits - leaked).max(0);
            }
        }
        self.last_update = Some(at_time);
    }
}
