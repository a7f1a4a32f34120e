//! Loss-rate driven ceiling on the published target.
//!
//! Tracks the fraction of packets declared lost over a sliding window. Low
//! loss ramps the ceiling up, heavy loss pulls it down proportionally to the
//! loss fraction; in between it holds. The delay-based estimate is published
//! through `min(delay_based, loss_ceiling)`.

use std::collections::VecDeque;

use crate::units::{DataRate, TimeDelta, Timestamp};

/// Sliding window the loss fraction is computed over.
const LOSS_WINDOW: TimeDelta = TimeDelta::from_micros(1_000_000);
/// Loss fraction below which the ceiling ramps up.
const LOW_LOSS_THRESHOLD: f64 = 0.02;
/// Loss fraction above which the ceiling is cut.
const HIGH_LOSS_THRESHOLD: f64 = 0.10;
/// Multiplier applied on each ramp step.
const INCREASE_FACTOR: f64 = 1.05;
/// Minimum spacing between ramp steps.
const INCREASE_INTERVAL: TimeDelta = TimeDelta::from_micros(200_000);
/// Minimum spacing between cuts, one window's worth so a single burst is
/// not charged twice.
const DECREASE_INTERVAL: TimeDelta = TimeDelta::from_micros(1_000_000);

#[derive(Debug, Clone, Copy)]
struct LossRecord {
    at_time: Timestamp,
    lost: usize,
    received: usize,
}

#[derive(Debug)]
pub struct LossBasedControl {
    min_rate: DataRate,
    max_rate: DataRate,
    ceiling: DataRate,
    window: VecDeque<LossRecord>,
    last_increase: Option<Timestamp>,
    last_decrease: Option<Timestamp>,
    last_fraction: f64,
}

impl LossBasedControl {
    pub fn new(start_rate: DataRate, min_rate: DataRate, max_rate: DataRate) -> Self {
        Self {
            min_rate,
            max_rate,
            ceiling: start_rate,
            window: VecDeque::new(),
            last_increase: None,
            last_decrease: None,
            last_fraction: 0.0,
        }
    }

    pub fn set_constraints(&mut self, min_rate: DataRate, max_rate: DataRate) {
        self.min_rate = min_rate;
        self.max_rate = max_rate;
    }

    /// Feeds the loss counts of one feedback batch and updates the ceiling.
    pub fn on_feedback(
        &mut self,
        lost: usize,
        received: usize,
        delay_based: DataRate,
        at_time: Timestamp,
    ) {
        self.window.push_back(LossRecord {
            at_time,
            lost,
            received,
        });
        while let Some(front) = self.window.front() {
            if at_time - front.at_time <= LOSS_WINDOW {
                break;
            }
            self.window.pop_front();
        }

        let (lost, total) = self.window.iter().fold((0usize, 0usize), |(l, t), r| {
            (l + r.lost, t + r.lost + r.received)
        });
        if total == 0 {
            return;
        }
        let fraction = lost as f64 / total as f64;
        self.last_fraction = fraction;

        if fraction < LOW_LOSS_THRESHOLD {
            let due = self
                .last_increase
                .map_or(true, |t| at_time - t >= INCREASE_INTERVAL);
            if due {
                // Ramp from at least the delay-based rate so the ceiling never
                // pins the estimate after a quiet period.
                let base = self.ceiling.max(delay_based);
                self.ceiling = (base * INCREASE_FACTOR).clamp(self.min_rate, self.max_rate);
                self.last_increase = Some(at_time);
            }
        } else if fraction > HIGH_LOSS_THRESHOLD {
            let due = self
                .last_decrease
                .map_or(true, |t| at_time - t >= DECREASE_INTERVAL);
            if due {
                self.ceiling = (self.ceiling * (1.0 - 0.5 * fraction))
                    .clamp(self.min_rate, self.max_rate);
                self.last_decrease = Some(at_time);
                tracing::debug!(fraction, ceiling = %self.ceiling, "loss based decrease");
            }
        }
    }

    pub fn ceiling(&self) -> DataRate {
        self.ceiling
    }

    pub fn loss_fraction(&self) -> f64 {
        self.last_fraction
    }
}
