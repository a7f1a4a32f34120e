//! Additive-increase multiplicative-decrease rate controller.
//!
//! Consumes the trendline verdict and moves the delay-based estimate through
//! a three state machine: increase on normal, hold on underuse, decrease to
//! a fraction of the acknowledged rate on overuse. Near the estimated link
//! capacity the increase turns additive so the estimate creeps up to the
//! capacity instead of overshooting it.

use crate::units::{DataRate, TimeDelta, Timestamp};

use super::trendline::BandwidthUsage;

/// Multiplicative backoff applied to the acknowledged rate on overuse.
const BETA: f64 = 0.85;
/// Multiplicative growth per second while far below the link capacity.
const INCREASE_FACTOR_PER_SECOND: f64 = 1.08;
/// Default round trip assumed before the first measurement.
const DEFAULT_RTT: TimeDelta = TimeDelta::from_micros(200_000);
/// Extra response time admitted on top of the RTT for additive increase.
const ADDITIVE_RESPONSE_SLACK: TimeDelta = TimeDelta::from_micros(100_000);
/// Typical paced packet used to size the additive step.
const AVG_PACKET_BITS: f64 = 1200.0 * 8.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RateControlState {
    Hold,
    Increase,
    Decrease,
}

/// Exponentially weighted estimate of the link capacity, tracked around the
/// throughput observed at decrease time.
#[derive(Debug, Default)]
struct LinkCapacityEstimator {
    estimate_kbps: Option<f64>,
    deviation_kbps: f64,
}

impl LinkCapacityEstimator {
    fn on_overuse_detected(&mut self, acknowledged: DataRate) {
        self.update(acknowledged, 0.05);
    }

    fn on_probe_rate(&mut self, probe_rate: DataRate) {
        self.reset();
        self.update(probe_rate, 0.5);
    }

    fn update(&mut self, sample: DataRate, alpha: f64) {
        let sample_kbps = sample.bps_f64() / 1000.0;
        let estimate = match self.estimate_kbps {
            None => sample_kbps,
            Some(e) => (1.0 - alpha) * e + alpha * sample_kbps,
        };
        let error = sample_kbps - estimate;
        // Deviation is normalized by the estimate so it scales with rate.
        let norm = estimate.max(1.0);
        self.deviation_kbps =
            ((1.0 - alpha) * self.deviation_kbps + alpha * error * error / norm).clamp(0.4, 2.5);
        self.estimate_kbps = Some(estimate);
    }

    fn reset(&mut self) {
        self.estimate_kbps = None;
        self.deviation_kbps = 0.0;
    }

    fn upper_bound(&self) -> DataRate {
        match self.estimate_kbps {
            Some(e) => DataRate::from_bps_f64((e + 3.0 * self.std_dev_kbps(e)) * 1000.0),
            None => DataRate::plus_infinity(),
        }
    }

    fn lower_bound(&self) -> DataRate {
        match self.estimate_kbps {
            Some(e) => {
                DataRate::from_bps_f64(((e - 3.0 * self.std_dev_kbps(e)) * 1000.0).max(0.0))
            }
            None => DataRate::zero(),
        }
    }

    fn std_dev_kbps(&self, estimate_kbps: f64) -> f64 {
        (self.deviation_kbps * estimate_kbps).sqrt()
    }

    fn has_estimate(&self) -> bool {
        self.estimate_kbps.is_some()
    }
}

#[derive(Debug)]
pub struct AimdRateControl {
    min_rate: DataRate,
    max_rate: DataRate,
    estimate: DataRate,
    state: RateControlState,
    rtt: TimeDelta,
    link_capacity: LinkCapacityEstimator,
    last_change: Option<Timestamp>,
    latest_acknowledged: Option<DataRate>,
}

impl AimdRateControl {
    pub fn new(start_rate: DataRate, min_rate: DataRate, max_rate: DataRate) -> Self {
        Self {
            min_rate,
            max_rate,
            estimate: start_rate.clamp(min_rate, max_rate),
            state: RateControlState::Hold,
            rtt: DEFAULT_RTT,
            link_capacity: LinkCapacityEstimator::default(),
            last_change: None,
            latest_acknowledged: None,
        }
    }

    pub fn estimate(&self) -> DataRate {
        self.estimate
    }

    pub fn set_rtt(&mut self, rtt: TimeDelta) {
        debug_assert!(rtt > TimeDelta::zero());
        self.rtt = rtt;
    }

    pub fn set_constraints(&mut self, min_rate: DataRate, max_rate: DataRate) {
        self.min_rate = min_rate;
        self.max_rate = max_rate;
        self.estimate = self.estimate.clamp(min_rate, max_rate);
    }

    /// Hard reset to a new starting point, for example after a route change.
    pub fn set_estimate(&mut self, rate: DataRate, at_time: Timestamp) {
        self.estimate = rate.clamp(self.min_rate, self.max_rate);
        self.last_change = Some(at_time);
    }

    /// A probe measured throughput above the current estimate; jump to it.
    pub fn on_probe_result(&mut self, probe_rate: DataRate, at_time: Timestamp) {
        if probe_rate > self.estimate {
            tracing::info!(%probe_rate, "adopting probe measured rate");
            self.link_capacity.on_probe_rate(probe_rate);
            self.set_estimate(probe_rate, at_time);
        }
    }

    /// Moves the state machine for one trendline verdict and returns the new
    /// estimate.
    pub fn update(
        &mut self,
        usage: BandwidthUsage,
        acknowledged: Option<DataRate>,
        at_time: Timestamp,
    ) -> DataRate {
        if let Some(rate) = acknowledged {
            self.latest_acknowledged = Some(rate);
        }

        self.state = match (self.state, usage) {
            (_, BandwidthUsage::Overusing) => RateControlState::Decrease,
            (_, BandwidthUsage::Underusing) => RateControlState::Hold,
            (RateControlState::Hold, BandwidthUsage::Normal) => RateControlState::Increase,
            (state, BandwidthUsage::Normal) => {
                if state == RateControlState::Decrease {
                    RateControlState::Hold
                } else {
                    state
                }
            }
        };

        match self.state {
            RateControlState::Hold => {}
            RateControlState::Increase => self.increase(at_time),
            RateControlState::Decrease => self.decrease(at_time),
        }
        self.estimate
    }

    fn increase(&mut self, at_time: Timestamp) {
        let acknowledged = self
            .latest_acknowledged
            .unwrap_or(self.estimate);
        // Above the measured link capacity band the estimate is speculation;
        // hold it back until the capacity estimate catches up.
        if self.link_capacity.has_estimate() && acknowledged > self.link_capacity.upper_bound() {
            self.link_capacity.reset();
        }

        let elapsed = self
            .last_change
            .map(|t| at_time - t)
            .unwrap_or(TimeDelta::from_micros(0));
        self.last_change = Some(at_time);

        let new_estimate = if self.link_capacity.has_estimate()
            && self.estimate >= self.link_capacity.lower_bound()
        {
            // Close to capacity: creep up by half an average packet per
            // response interval, at least 1 kbps per second.
            let response_time = (self.rtt + ADDITIVE_RESPONSE_SLACK) * 2;
            let increase_per_second =
                (0.5 * AVG_PACKET_BITS / response_time.seconds_f64()).max(1000.0);
            DataRate::from_bps_f64(
                self.estimate.bps_f64() + increase_per_second * elapsed.seconds_f64().min(1.0),
            )
        } else {
            let factor = INCREASE_FACTOR_PER_SECOND.powf(elapsed.seconds_f64().clamp(0.0, 1.0));
            self.estimate * factor
        };

        // Never run further than 1.5x what the network demonstrably carried.
        let ceiling = self
            .latest_acknowledged
            .map(|r| r * 1.5 + DataRate::from_kbps(10))
            .unwrap_or(DataRate::plus_infinity());
        self.estimate = new_estimate.min(ceiling).clamp(self.min_rate, self.max_rate);
    }

    fn decrease(&mut self, at_time: Timestamp) {
        let acknowledged = self.latest_acknowledged.unwrap_or(self.estimate);
        self.link_capacity.on_overuse_detected(acknowledged);
        let backed_off = acknowledged * BETA;
        if backed_off < self.estimate {
            self.estimate = backed_off.clamp(self.min_rate, self.max_rate);
        }
        self.last_change = Some(at_time);
        self.state = RateControlState::Hold;
    }

    /// Period after which the estimate is expected to have converged, used
    /// as the probing interval hint in published updates.
    pub fn expected_period(&self) -> TimeDelta {
        const MIN_PERIOD: TimeDelta = TimeDelta::from_micros(2_000_000);
        const DEFAULT_PERIOD: TimeDelta = TimeDelta::from_micros(3_000_000);
        const MAX_PERIOD: TimeDelta = TimeDelta::from_micros(50_000_000);
        if !self.link_capacity.has_estimate() {
            return DEFAULT_PERIOD;
        }
        // Time to win back one backoff's worth of rate at the additive pace.
        let increase_per_second = self.estimate.bps_f64() * (INCREASE_FACTOR_PER_SECOND - 1.0);
        if increase_per_second <= 0.0 {
            return DEFAULT_PERIOD;
        }
        let backoff_bps = self.estimate.bps_f64() * (1.0 - BETA);
        TimeDelta::from_seconds_f64(backoff_bps / increase_per_second)
            .clamp(MIN_PERIOD, MAX_PERIOD)
    }
}
