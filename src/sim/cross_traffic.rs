//! Synthetic cross-traffic generators used to stress the congestion core.
//!
//! Generators decide *when* and *how much* to send; the test harness routes
//! the produced packet sizes onto an emulated route. No back-pointers into
//! the emulator.

use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

use crate::units::{DataRate, DataSize, TimeDelta, Timestamp};

/// Cross traffic whose intensity drifts as a biased random walk in [0, 1].
#[derive(Debug, Clone)]
pub struct RandomWalkConfig {
    pub random_seed: u64,
    pub peak_rate: DataRate,
    pub min_packet_size: DataSize,
    pub min_packet_interval: TimeDelta,
    pub update_interval: TimeDelta,
    pub variance: f64,
    pub bias: f64,
}

impl Default for RandomWalkConfig {
    fn default() -> Self {
        Self {
            random_seed: 1,
            peak_rate: DataRate::from_kbps(100),
            min_packet_size: DataSize::from_bytes(200),
            min_packet_interval: TimeDelta::from_millis(1),
            update_interval: TimeDelta::from_millis(200),
            variance: 0.6,
            bias: -0.1,
        }
    }
}

pub struct RandomWalkCrossTraffic {
    config: RandomWalkConfig,
    rng: StdRng,
    intensity: f64,
    pending_size: DataSize,
    last_process_time: Timestamp,
    last_update_time: Timestamp,
    last_send_time: Timestamp,
}

impl RandomWalkCrossTraffic {
    pub fn new(config: RandomWalkConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.random_seed);
        Self {
            config,
            rng,
            intensity: 0.0,
            pending_size: DataSize::zero(),
            last_process_time: Timestamp::minus_infinity(),
            last_update_time: Timestamp::minus_infinity(),
            last_send_time: Timestamp::minus_infinity(),
        }
    }

    /// Advances the walk; returns the size of a packet to inject, if one is
    /// due.
    pub fn process(&mut self, at_time: Timestamp) -> Option<DataSize> {
        if self.last_process_time.is_minus_infinity() {
            self.last_process_time = at_time;
            self.last_update_time = at_time;
        }
        let delta = at_time - self.last_process_time;
        self.last_process_time = at_time;

        if at_time - self.last_update_time >= self.config.update_interval {
            let elapsed = (at_time - self.last_update_time).seconds_f64();
            let step = Normal::new(self.config.bias, self.config.variance)
                .expect("variance is positive")
                .sample(&mut self.rng);
            self.intensity = (self.intensity + step * elapsed.sqrt()).clamp(0.0, 1.0);
            self.last_update_time = at_time;
        }
        self.pending_size += self.traffic_rate() * delta;

        if self.pending_size >= self.config.min_packet_size
            && (self.last_send_time.is_minus_infinity()
                || at_time >= self.last_send_time + self.config.min_packet_interval)
        {
            let size = self.pending_size;
            self.pending_size = DataSize::zero();
            self.last_send_time = at_time;
            return Some(size);
        }
        None
    }

    pub fn traffic_rate(&self) -> DataRate {
        self.config.peak_rate * self.intensity
    }
}

/// Cross traffic alternating between full-rate pulses and silence.
#[derive(Debug, Clone)]
pub struct PulsedPeaksConfig {
    pub peak_rate: DataRate,
    pub min_packet_size: DataSize,
    pub min_packet_interval: TimeDelta,
    pub send_duration: TimeDelta,
    pub hold_duration: TimeDelta,
}

impl Default for PulsedPeaksConfig {
    fn default() -> Self {
        Self {
            peak_rate: DataRate::from_kbps(100),
            min_packet_size: DataSize::from_bytes(200),
            min_packet_interval: TimeDelta::from_millis(1),
            send_duration: TimeDelta::from_millis(100),
            hold_duration: TimeDelta::from_millis(2000),
        }
    }
}

pub struct PulsedPeaksCrossTraffic {
    config: PulsedPeaksConfig,
    last_update_time: Timestamp,
    last_send_time: Timestamp,
    sending: bool,
}

impl PulsedPeaksCrossTraffic {
    pub fn new(config: PulsedPeaksConfig) -> Self {
        Self {
            config,
            last_update_time: Timestamp::minus_infinity(),
            last_send_time: Timestamp::minus_infinity(),
            sending: false,
        }
    }

    pub fn process(&mut self, at_time: Timestamp) -> Option<DataSize> {
        let time_since_toggle = at_time - self.last_update_time;
        if time_since_toggle.is_plus_infinity()
            || (self.sending && time_since_toggle >= self.config.send_duration)
        {
            self.sending = false;
            self.last_update_time = at_time;
        } else if !self.sending && time_since_toggle >= self.config.hold_duration {
            self.sending = true;
            self.last_update_time = at_time;
            self.last_send_time = at_time;
        }

        if !self.sending || self.last_send_time.is_minus_infinity() {
            return None;
        }
        let pending = self.config.peak_rate * (at_time - self.last_send_time);
        if pending >= self.config.min_packet_size
            && at_time >= self.last_send_time + self.config.min_packet_interval
        {
            self.last_send_time = at_time;
            return Some(pending);
        }
        None
    }

    pub fn traffic_rate(&self) -> DataRate {
        if self.sending {
            self.config.peak_rate
        } else {
            DataRate::zero()
        }
    }
}
