//! Application-limited-region detection.
//!
//! The sender is application limited when it has been sending well below the
//! rate the estimator would allow. Detection runs a virtual budget at a
//! fraction of the target rate; when the budget stays mostly unspent the
//! sender clearly has nothing to pace out, which is the signal the probe
//! controller uses to re-probe a quiet link.

use crate::pacer::IntervalBudget;
use crate::units::{DataRate, DataSize, Timestamp};

/// Fraction of the target rate the ALR budget refills at.
const BANDWIDTH_USAGE_RATIO: f64 = 0.65;
/// Budget level above which ALR starts (sending far below target).
const START_BUDGET_LEVEL_RATIO: f64 = 0.80;
/// Budget level below which ALR ends.
const STOP_BUDGET_LEVEL_RATIO: f64 = 0.50;

#[derive(Debug)]
pub struct AlrDetector {
    budget: IntervalBudget,
    alr_started: Option<Timestamp>,
    last_send_time: Option<Timestamp>,
}

impl AlrDetector {
    pub fn new() -> Self {
        Self {
            budget: IntervalBudget::new(DataRate::zero()),
            alr_started: None,
            last_send_time: None,
        }
    }

    pub fn set_target_rate(&mut self, target: DataRate) {
        self.budget.set_rate(target * BANDWIDTH_USAGE_RATIO);
    }

    /// Accounts bytes that actually left on the wire.
    pub fn on_bytes_sent(&mut self, size: DataSize, send_time: Timestamp) {
        if let Some(last) = self.last_send_time {
            self.budget.increase(send_time - last);
        }
        self.budget.consume(size);
        self.last_send_time = Some(send_time);

        let level = self.budget.level_ratio();
        match self.alr_started {
            None if level > START_BUDGET_LEVEL_RATIO => {
                self.alr_started = Some(send_time);
                tracing::debug!("entering application limited region");
            }
            Some(_) if level < STOP_BUDGET_LEVEL_RATIO => {
                self.alr_started = None;
                tracing::debug!("leaving application limited region");
            }
            _ => {}
        }
    }

    /// When the sender entered ALR, if it is currently in it.
    pub fn alr_start_time(&self) -> Option<Timestamp> {
        self.alr_started
    }
}

impl Default for AlrDetector {
    fn default() -> Self {
        Self::new()
    }
}
