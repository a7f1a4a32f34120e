//! Bandwidth estimation: delay gradient, loss rate and probe results merged
//! into one target rate.
//!
//! The delay-based path groups acknowledged packets by arrival time, runs the
//! one-way delay variations through a trendline filter and lets an AIMD
//! controller react to the verdict. Loss feedback maintains a ceiling the
//! published target never exceeds, and completed probe clusters can jump the
//! estimate directly.

mod acknowledged;
mod aimd;
mod inter_arrival;
mod loss_based;
mod probe_rate;
mod trendline;

pub use acknowledged::AcknowledgedBitrateEstimator;
pub use aimd::AimdRateControl;
pub use inter_arrival::{GroupDeltas, InterArrival};
pub use loss_based::LossBasedControl;
pub use probe_rate::ProbeBitrateEstimator;
pub use trendline::{BandwidthUsage, TrendlineEstimator};

use crate::config::CongestionConfig;
use crate::feedback::FeedbackBatch;
use crate::units::{DataRate, TimeDelta, Timestamp};

/// Smoothing weight for new RTT samples, RFC 6298 style.
const RTT_ALPHA: f64 = 0.125;
/// Window over which the minimum RTT is remembered.
const MIN_RTT_WINDOW: TimeDelta = TimeDelta::from_micros(10_000_000);

/// Network state attached to every published target update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NetworkEstimate {
    pub bandwidth: DataRate,
    pub rtt: TimeDelta,
    pub loss_rate_ratio: f64,
    /// Expected time for the estimate to converge again after a backoff;
    /// doubles as the probing interval hint.
    pub bwe_period: TimeDelta,
}

/// The rate update pushed to the embedder, at most once per process
/// interval.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TargetTransferRate {
    pub at_time: Timestamp,
    pub target_rate: DataRate,
    /// Conservative rate that filters out short-lived probe spikes.
    pub stable_target_rate: DataRate,
    pub network_estimate: NetworkEstimate,
}

#[derive(Debug, Default)]
struct RttTracker {
    smoothed: Option<TimeDelta>,
    window: std::collections::VecDeque<(Timestamp, TimeDelta)>,
}

impl RttTracker {
    fn on_sample(&mut self, sample: TimeDelta, at_time: Timestamp) {
        debug_assert!(sample >= TimeDelta::zero());
        self.smoothed = Some(match self.smoothed {
            None => sample,
            Some(prev) => prev * (1.0 - RTT_ALPHA) + sample * RTT_ALPHA,
        });
        while let Some(&(t, _)) = self.window.front() {
            if at_time - t <= MIN_RTT_WINDOW {
                break;
            }
            self.window.pop_front();
        }
        self.window.push_back((at_time, sample));
    }

    fn smoothed(&self) -> Option<TimeDelta> {
        self.smoothed
    }

    fn min_rtt(&self) -> Option<TimeDelta> {
        self.window.iter().map(|&(_, rtt)| rtt).min()
    }
}

pub struct BandwidthEstimator {
    min_rate: DataRate,
    max_rate: DataRate,
    inter_arrival: InterArrival,
    trendline: TrendlineEstimator,
    aimd: AimdRateControl,
    acknowledged: AcknowledgedBitrateEstimator,
    loss_based: Option<LossBasedControl>,
    probe_rate: ProbeBitrateEstimator,
    rtt: RttTracker,
    /// Last delay-based estimate that did not come from a probe jump.
    last_non_probe_estimate: DataRate,
    alr_limited_backoff: bool,
    prev_usage: BandwidthUsage,
    recovered_from_overuse: bool,
}

impl BandwidthEstimator {
    pub fn new(config: &CongestionConfig, alr_limited_backoff: bool) -> Self {
        Self {
            min_rate: config.min_bitrate,
            max_rate: config.max_bitrate,
            inter_arrival: InterArrival::new(),
            trendline: TrendlineEstimator::new(),
            aimd: AimdRateControl::new(config.start_bitrate, config.min_bitrate, config.max_bitrate),
            acknowledged: AcknowledgedBitrateEstimator::new(),
            loss_based: config.loss_based_enabled.then(|| {
                LossBasedControl::new(config.start_bitrate, config.min_bitrate, config.max_bitrate)
            }),
            probe_rate: ProbeBitrateEstimator::new(),
            rtt: RttTracker::default(),
            last_non_probe_estimate: config.start_bitrate,
            alr_limited_backoff,
            prev_usage: BandwidthUsage::Normal,
            recovered_from_overuse: false,
        }
    }

    /// Applies one feedback batch. Outcomes arrive in receive-time order.
    pub fn on_feedback_batch(&mut self, batch: &FeedbackBatch, in_alr: bool) {
        if let Some(rtt) = batch.min_rtt() {
            self.rtt.on_sample(rtt, batch.feedback_time);
            self.aimd.set_rtt(rtt.max(TimeDelta::from_micros(1_000)));
        }

        for outcome in batch.received() {
            let (Some(send_time), Some(receive_time)) =
                (outcome.sent.send_time, outcome.receive_time)
            else {
                continue;
            };
            self.acknowledged
                .on_packet_acknowledged(receive_time, outcome.sent.size);
            if let Some(cluster_id) = outcome.sent.pacing_info.probe_cluster_id {
                self.probe_rate.on_probe_acknowledged(
                    cluster_id,
                    send_time,
                    receive_time,
                    outcome.sent.size,
                );
            }
            if let Some(deltas) =
                self.inter_arrival
                    .compute_deltas(send_time, receive_time, outcome.sent.size)
            {
                self.trendline.update(deltas, receive_time);
            }
        }

        let acked = self.acknowledged.bitrate();
        let usage = self.trendline.state();
        if self.prev_usage == BandwidthUsage::Underusing && usage == BandwidthUsage::Normal {
            // The queues drained after a backoff; capacity may have opened up.
            self.recovered_from_overuse = true;
        }
        self.prev_usage = usage;
        if usage == BandwidthUsage::Overusing && in_alr && self.alr_limited_backoff {
            // Application limited: the acknowledged rate reflects demand, so
            // back off no further than it.
            if let Some(acked) = acked {
                self.aimd.set_estimate(acked, batch.feedback_time);
            }
        } else {
            self.aimd.update(usage, acked, batch.feedback_time);
        }
        self.last_non_probe_estimate = self.aimd.estimate();

        if let Some(probe_rate) = self.probe_rate.fetch_and_reset() {
            self.aimd.on_probe_result(probe_rate, batch.feedback_time);
        }

        if let Some(loss) = &mut self.loss_based {
            loss.on_feedback(
                batch.lost_count(),
                batch.outcomes.len() - batch.lost_count(),
                self.aimd.estimate(),
                batch.feedback_time,
            );
        }
    }

    /// The sender stopped being application limited; acknowledged-rate
    /// samples from before reflect demand rather than capacity.
    pub fn set_alr_ended(&mut self, at_time: Timestamp) {
        self.acknowledged.set_alr_ended(at_time);
    }

    /// Congestion window overflow is treated like a delay overuse signal.
    pub fn on_congestion_window_backoff(&mut self, at_time: Timestamp) {
        self.aimd
            .update(BandwidthUsage::Overusing, self.acknowledged.bitrate(), at_time);
        self.last_non_probe_estimate = self.aimd.estimate();
    }

    pub fn set_constraints(&mut self, min_rate: DataRate, max_rate: DataRate) {
        self.min_rate = min_rate;
        self.max_rate = max_rate;
        self.aimd.set_constraints(min_rate, max_rate);
        if let Some(loss) = &mut self.loss_based {
            loss.set_constraints(min_rate, max_rate);
        }
    }

    /// The published target: delay-based capped by the loss ceiling, clamped
    /// to the configured range.
    pub fn target(&self) -> DataRate {
        let delay_based = self.aimd.estimate();
        let capped = match &self.loss_based {
            Some(loss) => delay_based.min(loss.ceiling()),
            None => delay_based,
        };
        capped.clamp(self.min_rate, self.max_rate)
    }

    pub fn loss_fraction(&self) -> f64 {
        self.loss_based
            .as_ref()
            .map(|l| l.loss_fraction())
            .unwrap_or(0.0)
    }

    pub fn round_trip_time(&self) -> TimeDelta {
        self.rtt
            .smoothed()
            .unwrap_or(TimeDelta::from_micros(200_000))
    }

    pub fn min_round_trip_time(&self) -> Option<TimeDelta> {
        self.rtt.min_rtt()
    }

    pub fn bandwidth_usage(&self) -> BandwidthUsage {
        self.trendline.state()
    }

    /// True once after an overuse backoff has fully drained; signals that a
    /// probe is worth firing to rediscover capacity.
    pub fn take_recovered_from_overuse(&mut self) -> bool {
        std::mem::take(&mut self.recovered_from_overuse)
    }

    /// Builds the update published by the control handler.
    pub fn current_update(&self, at_time: Timestamp) -> TargetTransferRate {
        let target = self.target();
        let stable = self
            .last_non_probe_estimate
            .min(target)
            .clamp(self.min_rate, self.max_rate);
        TargetTransferRate {
            at_time,
            target_rate: target,
            stable_target_rate: stable,
            network_estimate: NetworkEstimate {
                bandwidth: target,
                rtt: self.round_trip_time(),
                loss_rate_ratio: self.loss_fraction(),
                bwe_period: self.aimd.expected_period(),
            },
        }
    }
}
