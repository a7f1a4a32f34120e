//! Trendline filter over one-way delay variations.
//!
//! A smoothed linear regression of accumulated delay against arrival time.
//! A persistently positive slope means queues are building; the detector
//! compares the scaled slope against an adaptive threshold and reports the
//! current bandwidth usage.

use std::collections::VecDeque;

use crate::units::{TimeDelta, Timestamp};

use super::inter_arrival::GroupDeltas;

/// Exponential smoothing applied to the accumulated delay.
const SMOOTHING_COEF: f64 = 0.9;
/// Scale from raw slope to the threshold domain.
const THRESHOLD_GAIN: f64 = 4.0;
/// Regression window, in packet groups.
const WINDOW_SIZE: usize = 20;
/// Adaptive threshold bounds.
const MIN_THRESHOLD: f64 = 6.0;
const MAX_THRESHOLD: f64 = 12.5;
const INITIAL_THRESHOLD: f64 = 12.5;
/// Threshold adaptation gains (per millisecond of elapsed time).
const K_UP: f64 = 0.0087;
const K_DOWN: f64 = 0.039;
/// How long the trend must stay above threshold before declaring overuse.
const OVERUSE_TIME: TimeDelta = TimeDelta::from_micros(10_000);
/// Ignore threshold adaptation after gaps larger than this.
const MAX_ADAPT_GAP: TimeDelta = TimeDelta::from_micros(100_000);

/// Detector verdict for the current delay trend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BandwidthUsage {
    Underusing,
    Normal,
    Overusing,
}

#[derive(Debug)]
pub struct TrendlineEstimator {
    history: VecDeque<(f64, f64)>,
    first_arrival: Option<Timestamp>,
    accumulated_delay_ms: f64,
    smoothed_delay_ms: f64,
    threshold: f64,
    prev_modified_trend: f64,
    last_threshold_update: Option<Timestamp>,
    time_over_using: TimeDelta,
    overuse_count: u32,
    state: BandwidthUsage,
}

impl Default for TrendlineEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl TrendlineEstimator {
    pub fn new() -> Self {
        Self {
            history: VecDeque::with_capacity(WINDOW_SIZE),
            first_arrival: None,
            accumulated_delay_ms: 0.0,
            smoothed_delay_ms: 0.0,
            threshold: INITIAL_THRESHOLD,
            prev_modified_trend: 0.0,
            last_threshold_update: None,
            time_over_using: TimeDelta::zero(),
            overuse_count: 0,
            state: BandwidthUsage::Normal,
        }
    }

    pub fn state(&self) -> BandwidthUsage {
        self.state
    }

    /// Feeds the deltas of one completed packet group.
    pub fn update(&mut self, deltas: GroupDeltas, arrival_time: Timestamp) -> BandwidthUsage {
        let delay_variation_ms = (deltas.arrival_delta - deltas.send_delta).millis_f64();
        let first = *self.first_arrival.get_or_insert(arrival_time);

        self.accumulated_delay_ms += delay_variation_ms;
        self.smoothed_delay_ms = SMOOTHING_COEF * self.smoothed_delay_ms
            + (1.0 - SMOOTHING_COEF) * self.accumulated_delay_ms;

        self.history
            .push_back(((arrival_time - first).millis_f64(), self.smoothed_delay_ms));
        if self.history.len() > WINDOW_SIZE {
            self.history.pop_front();
        }

        let trend = if self.history.len() == WINDOW_SIZE {
            self.linear_fit_slope().unwrap_or(self.prev_modified_trend)
        } else {
            0.0
        };

        self.detect(trend, deltas.send_delta, arrival_time);
        self.state
    }

    /// Least squares slope of smoothed delay over arrival time.
    fn linear_fit_slope(&self) -> Option<f64> {
        let n = self.history.len() as f64;
        let (sum_x, sum_y): (f64, f64) = self
            .history
            .iter()
            .fold((0.0, 0.0), |(sx, sy), (x, y)| (sx + x, sy + y));
        let avg_x = sum_x / n;
        let avg_y = sum_y / n;
        let (numerator, denominator) = self.history.iter().fold((0.0, 0.0), |(num, den), (x, y)| {
            (num + (x - avg_x) * (y - avg_y), den + (x - avg_x) * (x - avg_x))
        });
        (denominator != 0.0).then(|| numerator / denominator)
    }

    fn detect(&mut self, trend: f64, send_delta: TimeDelta, now: Timestamp) {
        if self.history.len() < 2 {
            self.state = BandwidthUsage::Normal;
            return;
        }
        let sample_count = self.history.len().min(60) as f64;
        let modified_trend = sample_count * trend * THRESHOLD_GAIN;
        self.prev_modified_trend = modified_trend;

        if modified_trend > self.threshold {
            self.time_over_using += send_delta;
            self.overuse_count += 1;
            if self.time_over_using > OVERUSE_TIME && self.overuse_count > 1 && trend >= 0.0 {
                self.time_over_using = TimeDelta::zero();
                self.overuse_count = 0;
                self.state = BandwidthUsage::Overusing;
            }
        } else if modified_trend < -self.threshold {
            self.time_over_using = TimeDelta::zero();
            self.overuse_count = 0;
            self.state = BandwidthUsage::Underusing;
        } else {
            self.time_over_using = TimeDelta::zero();
            self.overuse_count = 0;
            self.state = BandwidthUsage::Normal;
        }

        self.update_threshold(modified_trend, now);
    }

    fn update_threshold(&mut self, modified_trend: f64, now: Timestamp) {
        let Some(last) = self.last_threshold_update else {
            self.last_threshold_update = Some(now);
            return;
        };
        if modified_trend.abs() > self.threshold + 15.0 {
            // A sudden big jump (for example a route change) must not drag
            // the threshold up with it.
            self.last_threshold_update = Some(now);
            return;
        }
        let gap = now - last;
        let elapsed_ms = if gap > MAX_ADAPT_GAP {
            MAX_ADAPT_GAP.millis_f64()
        } else {
            gap.millis_f64()
        };
        let k = if modified_trend.abs() < self.threshold {
            K_DOWN
        } else {
            K_UP
        };
        self.threshold += k * (modified_trend.abs() - self.threshold) * elapsed_ms;
        self.threshold = self.threshold.clamp(MIN_THRESHOLD, MAX_THRESHOLD);
        self.last_threshold_update = Some(now);
    }
}
