use crate::error::SendSideError;
use crate::units::{DataRate, TimeDelta};

/// Bitrate constraints and tunables for the whole send side.
///
/// `min <= start <= max` is enforced at construction; everything else has a
/// default matching the values the rest of the stack is calibrated for.
#[derive(Debug, Clone)]
pub struct CongestionConfig {
    pub min_bitrate: DataRate,
    pub start_bitrate: DataRate,
    pub max_bitrate: DataRate,
    /// Pacing rate is `pacing_factor * target`.
    pub pacing_factor: f64,
    /// Rate the pacer pads up to when the queues drain.
    pub padding_rate: DataRate,
    /// How long a packet may sit in the pacer queue before the queue is
    /// declared stalled.
    pub queue_time_limit: TimeDelta,
    pub congestion_window_enabled: bool,
    /// Extra queueing time admitted on top of min RTT when sizing the
    /// congestion window.
    pub cwnd_additional_time: TimeDelta,
    pub loss_based_enabled: bool,
    pub alr_probing_enabled: bool,
    /// Rates of the initial probe clusters, as multiples of `start_bitrate`.
    pub probe_initial_multipliers: Vec<f64>,
    /// Period of the controller's process task.
    pub process_interval: TimeDelta,
}

impl Default for CongestionConfig {
    fn default() -> Self {
        Self {
            min_bitrate: DataRate::from_kbps(30),
            start_bitrate: DataRate::from_kbps(300),
            max_bitrate: DataRate::from_kbps(2000),
            pacing_factor: 2.5,
            padding_rate: DataRate::zero(),
            queue_time_limit: TimeDelta::from_millis(2000),
            congestion_window_enabled: false,
            cwnd_additional_time: TimeDelta::from_millis(100),
            loss_based_enabled: true,
            alr_probing_enabled: false,
            probe_initial_multipliers: vec![3.0, 6.0],
            process_interval: TimeDelta::from_millis(25),
        }
    }
}

impl CongestionConfig {
    pub fn with_bitrates(min: DataRate, start: DataRate, max: DataRate) -> Self {
        Self {
            min_bitrate: min,
            start_bitrate: start,
            max_bitrate: max,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), SendSideError> {
        if self.min_bitrate <= DataRate::zero() || !self.min_bitrate.is_finite() {
            return Err(SendSideError::ConfigInvalid(
                "min_bitrate must be positive and finite".into(),
            ));
        }
        if self.start_bitrate < self.min_bitrate || self.start_bitrate > self.max_bitrate {
            return Err(SendSideError::ConfigInvalid(format!(
                "start_bitrate {} outside [{}, {}]",
                self.start_bitrate, self.min_bitrate, self.max_bitrate
            )));
        }
        if self.pacing_factor < 1.0 {
            return Err(SendSideError::ConfigInvalid(
                "pacing_factor must be >= 1".into(),
            ));
        }
        if self.process_interval <= TimeDelta::zero() {
            return Err(SendSideError::ConfigInvalid(
                "process_interval must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Experiment switches that used to live behind global field-trial lookups.
/// Threaded explicitly through constructors so behavior is visible at the
/// call site.
#[derive(Debug, Clone, Copy, Default)]
pub struct Experiments {
    /// Back off to the acknowledged rate instead of the raw estimate when an
    /// overuse is detected while application limited.
    pub alr_limited_backoff: bool,
    /// Count per-packet transport overhead against the estimate.
    pub include_overhead: bool,
}
