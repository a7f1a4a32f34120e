//! Deterministic single-link network model.
//!
//! Packets first sit in a capacity queue drained at the configured link
//! rate, then in a delay queue where jitter, loss and reordering are
//! applied. Loss follows a Gilbert-Elliott burst model; with
//! `avg_burst_loss_length == -1` it degenerates to uniform loss.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use std::collections::VecDeque;

use crate::units::{DataRate, DataSize, TimeDelta, Timestamp};

/// Configuration of one simulated link.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Link capacity; zero means infinite.
    pub link_capacity: DataRate,
    /// Capacity queue bound in packets; zero means unbounded.
    pub queue_length_packets: usize,
    /// Mean extra delay applied after the capacity queue.
    pub queue_delay: TimeDelta,
    /// Standard deviation of the extra delay.
    pub delay_std_dev: TimeDelta,
    /// Average loss, in percent.
    pub loss_percent: f64,
    /// Average number of packets lost in a burst; -1 selects uniform loss.
    pub avg_burst_loss_length: i32,
    pub allow_reordering: bool,
    /// Fixed overhead added to every enqueued packet.
    pub packet_overhead: DataSize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            link_capacity: DataRate::zero(),
            queue_length_packets: 0,
            queue_delay: TimeDelta::zero(),
            delay_std_dev: TimeDelta::zero(),
            loss_percent: 0.0,
            avg_burst_loss_length: -1,
            allow_reordering: false,
            packet_overhead: DataSize::zero(),
        }
    }
}

/// A packet handed to the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketInFlight {
    pub id: u64,
    pub size: DataSize,
    pub send_time: Timestamp,
}

/// A packet leaving the link. `arrival_time` of `None` means the link
/// dropped it; the sentinel is surfaced so upper layers can account losses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveredPacket {
    pub packet: PacketInFlight,
    pub arrival_time: Option<Timestamp>,
}

#[derive(Debug, Clone, Copy)]
struct CapacityEntry {
    packet: PacketInFlight,
    sized: DataSize,
}

#[derive(Debug, Clone, Copy)]
struct DelayEntry {
    packet: PacketInFlight,
    /// None marks a packet chosen for loss.
    arrival_time: Option<Timestamp>,
}

pub struct SimulatedNetwork {
    config: NetworkConfig,
    prob_loss_bursting: f64,
    prob_start_bursting: f64,
    bursting: bool,
    rng: StdRng,
    capacity_queue: VecDeque<CapacityEntry>,
    queue_size: DataSize,
    pending_drain_bits: i64,
    last_visit: Option<Timestamp>,
    delay_queue: VecDeque<DelayEntry>,
    pause_until: Option<Timestamp>,
}

impl SimulatedNetwork {
    pub fn new(config: NetworkConfig, seed: u64) -> Self {
        let mut network = Self {
            config: NetworkConfig::default(),
            prob_loss_bursting: 0.0,
            prob_start_bursting: 0.0,
            bursting: false,
            rng: StdRng::seed_from_u64(seed),
            capacity_queue: VecDeque::new(),
            queue_size: DataSize::zero(),
            pending_drain_bits: 0,
            last_visit: None,
            delay_queue: VecDeque::new(),
            pause_until: None,
        };
        network.set_config(config);
        network
    }

    pub fn set_config(&mut self, config: NetworkConfig) {
        let prob_loss = config.loss_percent / 100.0;
        if config.avg_burst_loss_length == -1 {
            // Uniform loss.
            self.prob_loss_bursting = prob_loss;
            self.prob_start_bursting = prob_loss;
        } else {
            let avg_burst = config.avg_burst_loss_length as f64;
            let min_avg_burst = (prob_loss / (1.0 - prob_loss)).ceil();
            assert!(
                avg_burst > min_avg_burst,
                "avg_burst_loss_length must exceed {min_avg_burst} for {}% loss",
                config.loss_percent
            );
            self.prob_loss_bursting = 1.0 - 1.0 / avg_burst;
            self.prob_start_bursting = prob_loss / (1.0 - prob_loss) / avg_burst;
        }
        self.config = config;
    }

    /// No packet put on the link will arrive before `until`.
    pub fn pause_transmission_until(&mut self, until: Timestamp) {
        self.pause_until = Some(until);
    }

    /// Adds a packet to the capacity queue. Returns false when the queue is
    /// at its configured length and the packet was dropped at the door.
    pub fn enqueue(&mut self, packet: PacketInFlight) -> bool {
        self.update_capacity_queue(packet.send_time);
        if self.config.queue_length_packets > 0
            && self.capacity_queue.len() >= self.config.queue_length_packets
        {
            return false;
        }
        let sized = packet.size + self.config.packet_overhead;
        self.queue_size += sized;
        self.capacity_queue.push_back(CapacityEntry { packet, sized });
        true
    }

    /// Arrival time of the next deliverable packet, if any.
    pub fn next_delivery_time(&self) -> Option<Timestamp> {
        self.delay_queue
            .iter()
            .filter_map(|e| e.arrival_time)
            .next()
    }

    /// Returns every packet whose arrival time has passed, in arrival order.
    /// Lost packets are surfaced with `arrival_time: None` at the position
    /// they would have occupied.
    pub fn dequeue_deliverable(&mut self, receive_time: Timestamp) -> Vec<DeliveredPacket> {
        self.update_capacity_queue(receive_time);
        let mut out = Vec::new();
        while let Some(entry) = self.delay_queue.front() {
            match entry.arrival_time {
                Some(arrival) if arrival > receive_time => break,
                _ => {}
            }
            let entry = self.delay_queue.pop_front().unwrap();
            out.push(DeliveredPacket {
                packet: entry.packet,
                arrival_time: entry.arrival_time,
            });
        }
        out
    }

    /// Drains the capacity queue up to `now`, moving exited packets into the
    /// delay queue with loss and jitter applied.
    fn update_capacity_queue(&mut self, now: Timestamp) {
        // Guard against time observed out of order across callers.
        if self.last_visit.map_or(false, |last| now < last) {
            return;
        }
        let mut time = self.last_visit.unwrap_or(now);
        let capacity_bps = self.config.link_capacity.bps_f64() as i64;

        while let Some(front) = self.capacity_queue.front() {
            let mut exit_delta_us: i64 = 0;
            if capacity_bps > 0 {
                let remaining_bits = front.sized.bits() - self.pending_drain_bits;
                debug_assert!(remaining_bits > 0);
                // Round up; the packet has not exited until its last bit has.
                exit_delta_us = (1_000_000 * remaining_bits + capacity_bps - 1) / capacity_bps;
            }

            if time + TimeDelta::from_micros(exit_delta_us) > now {
                // Front will not exit yet; bank the drained capacity.
                self.pending_drain_bits += (now - time).micros() * capacity_bps / 1_000_000;
                break;
            }

            if capacity_bps > 0 {
                self.pending_drain_bits += exit_delta_us * capacity_bps / 1_000_000;
            } else {
                self.pending_drain_bits = self.queue_size.bits();
            }

            let entry = self.capacity_queue.pop_front().unwrap();
            time += TimeDelta::from_micros(exit_delta_us);
            debug_assert!(time >= entry.packet.send_time);
            self.queue_size -= entry.sized;
            self.pending_drain_bits -= entry.sized.bits();
            debug_assert!(self.pending_drain_bits >= 0);

            let exit_time = match self.pause_until {
                Some(pause) => time.max(pause),
                None => time,
            };
            self.apply_loss_and_jitter(entry.packet, exit_time);
        }
        self.last_visit = Some(now);
        // Unused capacity cannot be banked for later.
        self.pending_drain_bits = self.pending_drain_bits.min(self.queue_size.bits());
    }

    fn apply_loss_and_jitter(&mut self, packet: PacketInFlight, exit_time: Timestamp) {
        let roll: f64 = self.rng.gen();
        let lost = if self.bursting {
            roll < self.prob_loss_bursting
        } else {
            roll < self.prob_start_bursting
        };
        if lost {
            self.bursting = true;
            self.delay_queue.push_back(DelayEntry {
                packet,
                arrival_time: None,
            });
            return;
        }
        self.bursting = false;

        let jitter_us = if self.config.delay_std_dev > TimeDelta::zero() {
            let normal = Normal::new(
                self.config.queue_delay.micros() as f64,
                self.config.delay_std_dev.micros() as f64,
            )
            .expect("std dev is positive");
            normal.sample(&mut self.rng).max(0.0) as i64
        } else {
            self.config.queue_delay.micros()
        };

        let mut arrival = exit_time + TimeDelta::from_micros(jitter_us);
        let last_arrival = self
            .delay_queue
            .iter()
            .rev()
            .filter_map(|e| e.arrival_time)
            .next();
        let mut needs_sort = false;
        if let Some(last) = last_arrival {
            if !self.config.allow_reordering && arrival < last {
                // Clip jitter so delivery stays in order.
                arrival = last;
            } else if arrival < last {
                needs_sort = true;
            }
        }
        self.delay_queue.push_back(DelayEntry {
            packet,
            arrival_time: Some(arrival),
        });
        if needs_sort {
            self.delay_queue.make_contiguous().sort_by_key(|e| {
                e.arrival_time.unwrap_or(Timestamp::minus_infinity())
            });
        }
    }
}
