//! Decides when to probe above the current estimate, and at what rate.
//!
//! Probing happens in clusters: short bursts at a declared rate that the
//! pacer emits and the probe-rate estimator measures. The controller fires
//! an initial pair of clusters at stream start, follows a successful probe
//! with an exponential one while there is headroom to the configured max,
//! and periodically re-probes a link that has been application limited.

use crate::units::{DataRate, DataSize, TimeDelta, Timestamp};

/// Packets a cluster wants acknowledged before it counts as complete.
const MIN_PROBE_PACKETS: usize = 5;
/// A cluster carries at least this much send time worth of data.
const MIN_PROBE_DURATION: TimeDelta = TimeDelta::from_micros(15_000);
/// Follow-up probes go this far above the newly measured estimate.
const FURTHER_PROBE_MULTIPLIER: f64 = 2.0;
/// A probe result within this fraction of the probed rate justifies another
/// exponential step.
const FURTHER_PROBE_THRESHOLD: f64 = 0.7;
/// Re-probe interval while application limited.
const ALR_PROBE_INTERVAL: TimeDelta = TimeDelta::from_micros(10_000_000);
/// Re-probe interval while sending below the configured max; catches a link
/// whose capacity grew without producing any delay signal.
const PERIODIC_PROBE_INTERVAL: TimeDelta = TimeDelta::from_micros(2_000_000);
/// Abandon a pending probe if no result arrives within this time.
const PROBE_RESULT_TIMEOUT: TimeDelta = TimeDelta::from_micros(1_000_000);
/// Fraction of the pre-drop rate a recovery probe aims at.
const PROBE_FRACTION_AFTER_DROP: f64 = 0.85;

/// A probe burst handed to the pacer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeClusterConfig {
    pub id: u32,
    pub target_rate: DataRate,
    pub min_probes: usize,
    pub min_bytes: DataSize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProbeState {
    Init,
    WaitingAfterFirstProbing,
    Probing,
    ProbingComplete,
    AlrProbing,
}

pub struct ProbeController {
    state: ProbeState,
    next_cluster_id: u32,
    start_rate: DataRate,
    max_rate: DataRate,
    estimate: DataRate,
    initial_multipliers: Vec<f64>,
    alr_probing_enabled: bool,
    alr_start_time: Option<Timestamp>,
    last_probe_time: Option<Timestamp>,
    /// Rate of the highest cluster we are waiting on a result for.
    pending_probe_rate: Option<DataRate>,
    /// Estimate right before the last large drop; recovery probes aim here.
    rate_before_last_drop: Option<DataRate>,
}

impl ProbeController {
    pub fn new(
        start_rate: DataRate,
        max_rate: DataRate,
        initial_multipliers: Vec<f64>,
        alr_probing_enabled: bool,
    ) -> Self {
        Self {
            state: ProbeState::Init,
            next_cluster_id: 1,
            start_rate,
            max_rate,
            estimate: start_rate,
            initial_multipliers,
            alr_probing_enabled,
            alr_start_time: None,
            last_probe_time: None,
            pending_probe_rate: None,
            rate_before_last_drop: None,
        }
    }

    /// Fires the initial probe clusters. Idempotent after the first call.
    pub fn on_stream_start(&mut self, at_time: Timestamp) -> Vec<ProbeClusterConfig> {
        if self.state != ProbeState::Init {
            return Vec::new();
        }
        let rates: Vec<DataRate> = self
            .initial_multipliers
            .iter()
            .map(|m| (self.start_rate * *m).min(self.max_rate))
            .collect();
        self.state = ProbeState::WaitingAfterFirstProbing;
        self.initiate_probing(rates, at_time)
    }

    /// New estimate from the bandwidth estimator. A probe that (mostly)
    /// confirmed its target justifies probing further while below max.
    pub fn set_estimate(&mut self, estimate: DataRate, at_time: Timestamp) -> Vec<ProbeClusterConfig> {
        if estimate < self.estimate * 0.66 {
            self.rate_before_last_drop = Some(self.estimate);
        }
        self.estimate = estimate;
        let Some(pending) = self.pending_probe_rate else {
            return Vec::new();
        };
        if estimate < pending * FURTHER_PROBE_THRESHOLD {
            // Not confirmed yet; the pending probe rides until its result
            // arrives or `process` times it out.
            return Vec::new();
        }
        self.pending_probe_rate = None;
        if estimate >= self.max_rate {
            self.state = ProbeState::ProbingComplete;
            return Vec::new();
        }
        self.state = ProbeState::Probing;
        let next = (estimate * FURTHER_PROBE_MULTIPLIER).min(self.max_rate);
        self.initiate_probing(vec![next], at_time)
    }

    /// A raised max bitrate opens new headroom worth probing.
    pub fn on_max_bitrate_changed(
        &mut self,
        max_rate: DataRate,
        at_time: Timestamp,
    ) -> Vec<ProbeClusterConfig> {
        let old_max = self.max_rate;
        self.max_rate = max_rate;
        if max_rate > old_max && self.state == ProbeState::ProbingComplete {
            let target = max_rate.min(self.estimate * FURTHER_PROBE_MULTIPLIER);
            return self.initiate_probing(vec![target], at_time);
        }
        Vec::new()
    }

    /// ALR start time as reported by the pacer, or `None` outside ALR.
    pub fn set_alr_start_time(&mut self, alr_start: Option<Timestamp>) {
        self.alr_start_time = alr_start;
    }

    /// Explicit probe request, fired when the estimator recovered from an
    /// overuse backoff. Rate limited so repeated recoveries do not flood the
    /// link with bursts.
    pub fn request_probe(&mut self, at_time: Timestamp) -> Vec<ProbeClusterConfig> {
        const MIN_REQUEST_SPACING: TimeDelta = TimeDelta::from_micros(1_000_000);
        let too_soon = self
            .last_probe_time
            .map_or(false, |t| at_time - t < MIN_REQUEST_SPACING);
        if too_soon || self.pending_probe_rate.is_some() || self.estimate >= self.max_rate {
            return Vec::new();
        }
        self.state = ProbeState::Probing;
        let recovery = self
            .rate_before_last_drop
            .take()
            .map(|r| r * PROBE_FRACTION_AFTER_DROP)
            .unwrap_or(DataRate::zero());
        let target = (self.estimate * FURTHER_PROBE_MULTIPLIER)
            .max(recovery)
            .min(self.max_rate);
        self.initiate_probing(vec![target], at_time)
    }

    /// Periodic processing: ALR re-probing and pending-probe timeouts.
    pub fn process(&mut self, at_time: Timestamp) -> Vec<ProbeClusterConfig> {
        if let Some(pending) = self.pending_probe_rate {
            let stale = self
                .last_probe_time
                .map_or(false, |t| at_time - t > PROBE_RESULT_TIMEOUT);
            if stale {
                tracing::debug!(rate = %pending, "probe result timed out");
                self.pending_probe_rate = None;
                self.state = ProbeState::ProbingComplete;
            }
        }

        if self.alr_start_time.is_none() {
            // Actively sending: re-probe periodically while below max, in
            // case capacity opened up without leaving a delay signature.
            let due = self.pending_probe_rate.is_none()
                && self.state == ProbeState::ProbingComplete
                && self.estimate < self.max_rate
                && self
                    .last_probe_time
                    .map_or(false, |t| at_time - t >= PERIODIC_PROBE_INTERVAL);
            if due {
                self.state = ProbeState::Probing;
                let target = (self.estimate * FURTHER_PROBE_MULTIPLIER).min(self.max_rate);
                return self.initiate_probing(vec![target], at_time);
            }
            return Vec::new();
        }

        if !self.alr_probing_enabled {
            return Vec::new();
        }
        let Some(alr_start) = self.alr_start_time else {
            return Vec::new();
        };
        let long_alr = at_time - alr_start >= ALR_PROBE_INTERVAL;
        let probe_due = self
            .last_probe_time
            .map_or(true, |t| at_time - t >= ALR_PROBE_INTERVAL);
        if long_alr && probe_due && self.estimate < self.max_rate {
            self.state = ProbeState::AlrProbing;
            let target = (self.estimate * FURTHER_PROBE_MULTIPLIER).min(self.max_rate);
            return self.initiate_probing(vec![target], at_time);
        }
        Vec::new()
    }

    fn initiate_probing(
        &mut self,
        rates: Vec<DataRate>,
        at_time: Timestamp,
    ) -> Vec<ProbeClusterConfig> {
        let mut configs = Vec::with_capacity(rates.len());
        for rate in rates {
            if rate.is_zero() {
                continue;
            }
            let id = self.next_cluster_id;
            self.next_cluster_id += 1;
            // Enough bytes that even small packets yield the minimum probe
            // count the estimator wants acknowledged.
            let min_bytes = (rate * MIN_PROBE_DURATION).max(DataSize::from_bytes(6000));
            configs.push(ProbeClusterConfig {
                id,
                target_rate: rate,
                min_probes: MIN_PROBE_PACKETS,
                min_bytes,
            });
        }
        if let Some(highest) = configs.iter().map(|c| c.target_rate).max() {
            self.pending_probe_rate = Some(highest);
            self.last_probe_time = Some(at_time);
        }
        configs
    }
}
