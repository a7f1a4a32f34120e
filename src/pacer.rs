//! Token-bucket paced egress with per-kind priority queues.
//!
//! The pacer owns everything between "the encoder produced a packet" and
//! "the packet goes on the wire": priority queues per media kind, a bits
//! budget refilled at the pacing rate on every 5 ms tick, padding synthesis,
//! probe cluster emission and congestion-window gating. It never touches the
//! network itself; each tick returns the packets to put on the wire and the
//! control handler routes them to the feedback adapter and the socket.

use smallvec::SmallVec;
use std::collections::VecDeque;

use crate::probe::ProbeClusterConfig;
use crate::units::{DataRate, DataSize, TimeDelta, Timestamp};

/// Pacer tick period.
pub const PACER_TICK: TimeDelta = TimeDelta::from_micros(5_000);
/// Budget that can accumulate over missed ticks.
const MAX_BUDGET_INTERVAL: TimeDelta = TimeDelta::from_micros(500_000);
/// Smallest padding packet worth synthesizing (RTP header plus payload).
const MIN_PADDING_SIZE: DataSize = DataSize::from_bytes(50);
/// Largest synthesized padding packet.
const MAX_PADDING_SIZE: DataSize = DataSize::from_bytes(224);

/// Kind of payload a paced packet carries. Order is the dequeue priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PacketKind {
    Audio,
    Retransmission,
    Video,
    Padding,
}

const KIND_COUNT: usize = 4;

impl PacketKind {
    fn index(self) -> usize {
        match self {
            PacketKind::Audio => 0,
            PacketKind::Retransmission => 1,
            PacketKind::Video => 2,
            PacketKind::Padding => 3,
        }
    }
}

/// Probe cluster tag attached to packets emitted while probing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacedPacketInfo {
    pub probe_cluster_id: Option<u32>,
}

/// A packet waiting in the pacer queue.
#[derive(Debug, Clone)]
struct QueuedPacket {
    kind: PacketKind,
    ssrc: u32,
    size: DataSize,
    enqueue_time: Timestamp,
}

/// A packet released to the wire on a tick.
#[derive(Debug, Clone)]
pub struct EgressPacket {
    pub kind: PacketKind,
    pub ssrc: u32,
    /// Transport-wide sequence number stamped by the pacer.
    pub sequence: u16,
    pub size: DataSize,
    pub send_time: Timestamp,
    pub pacing_info: PacedPacketInfo,
}

/// Everything a single tick produced. Most ticks release only a handful of
/// packets, so the list lives inline.
#[derive(Debug, Default)]
pub struct TickOutcome {
    pub packets: SmallVec<[EgressPacket; 4]>,
    /// Set when a packet exceeded the queue time limit this tick. Non-audio
    /// queues have been flushed.
    pub stalled: bool,
}

impl TickOutcome {
    fn empty() -> Self {
        Self::default()
    }
}

/// Linearly refilled send credit, capped at a fixed interval's worth.
#[derive(Debug)]
pub(crate) struct IntervalBudget {
    rate: DataRate,
    max_bits: i64,
    bits_remaining: i64,
}

impl IntervalBudget {
    pub(crate) fn new(rate: DataRate) -> Self {
        let mut budget = Self {
            rate: DataRate::zero(),
            max_bits: 0,
            bits_remaining: 0,
        };
        budget.set_rate(rate);
        budget
    }

    pub(crate) fn set_rate(&mut self, rate: DataRate) {
        self.rate = rate;
        self.max_bits = (rate * MAX_BUDGET_INTERVAL).bits();
        self.bits_remaining = self.bits_remaining.clamp(-self.max_bits, self.max_bits);
    }

    pub(crate) fn increase(&mut self, elapsed: TimeDelta) {
        let refill = (self.rate * elapsed).bits();
        self.bits_remaining = (self.bits_remaining + refill).min(self.max_bits);
    }

    pub(crate) fn consume(&mut self, size: DataSize) {
        self.bits_remaining = (self.bits_remaining - size.bits()).max(-self.max_bits);
    }

    pub(crate) fn remaining(&self) -> i64 {
        self.bits_remaining
    }

    /// Fraction of the cap currently available, in [0, 1].
    pub(crate) fn level_ratio(&self) -> f64 {
        if self.max_bits == 0 {
            return 0.0;
        }
        (self.bits_remaining.max(0) as f64) / self.max_bits as f64
    }
}

/// An in-progress probe cluster.
#[derive(Debug)]
struct ActiveProbe {
    config: ProbeClusterConfig,
    sent_bytes: DataSize,
    sent_probes: usize,
    /// Set on the first emitting tick; paces the cluster at its target rate.
    started: Option<Timestamp>,
}

impl ActiveProbe {
    fn complete(&self) -> bool {
        self.sent_probes >= self.config.min_probes || self.sent_bytes >= self.config.min_bytes
    }
}

pub struct Pacer {
    queues: [VecDeque<QueuedPacket>; KIND_COUNT],
    queue_size: DataSize,
    max_queue_packets: usize,
    media_budget: IntervalBudget,
    padding_budget: IntervalBudget,
    pacing_rate: DataRate,
    padding_rate: DataRate,
    paused: bool,
    queue_time_limit: TimeDelta,
    congestion_window: Option<DataSize>,
    outstanding: DataSize,
    probes: VecDeque<ActiveProbe>,
    next_sequence: u16,
    last_tick: Option<Timestamp>,
    first_sent_packet_time: Option<Timestamp>,
    last_send_time: Option<Timestamp>,
}

/// Default bound on queued packets before enqueue starts rejecting.
pub const DEFAULT_MAX_QUEUE_PACKETS: usize = 10_000;

impl Pacer {
    pub fn new(pacing_rate: DataRate, padding_rate: DataRate, queue_time_limit: TimeDelta) -> Self {
        Self {
            queues: Default::default(),
            queue_size: DataSize::zero(),
            max_queue_packets: DEFAULT_MAX_QUEUE_PACKETS,
            media_budget: IntervalBudget::new(pacing_rate),
            padding_budget: IntervalBudget::new(padding_rate),
            pacing_rate,
            padding_rate,
            paused: false,
            queue_time_limit,
            congestion_window: None,
            outstanding: DataSize::zero(),
            probes: VecDeque::new(),
            next_sequence: 1,
            last_tick: None,
            first_sent_packet_time: None,
            last_send_time: None,
        }
    }

    /// New pacing and padding rates from the control handler.
    pub fn set_pacing_rates(&mut self, pacing_rate: DataRate, padding_rate: DataRate) {
        self.pacing_rate = pacing_rate;
        self.padding_rate = padding_rate;
        self.paused = pacing_rate.is_zero();
        self.media_budget.set_rate(pacing_rate);
        self.padding_budget.set_rate(padding_rate);
    }

    pub fn set_congestion_window(&mut self, window: Option<DataSize>) {
        self.congestion_window = window;
    }

    /// Outstanding bytes as seen by the feedback adapter; refreshed after
    /// every feedback application and every emission.
    pub fn set_outstanding_data(&mut self, outstanding: DataSize) {
        self.outstanding = outstanding;
    }

    pub fn add_probe_cluster(&mut self, config: ProbeClusterConfig) {
        tracing::info!(id = config.id, rate = %config.target_rate, "probe cluster queued");
        self.probes.push_back(ActiveProbe {
            config,
            sent_bytes: DataSize::zero(),
            sent_probes: 0,
            started: None,
        });
    }

    /// Queues a packet for paced emission. Returns false (and drops the
    /// packet) when the queue is at its configured length.
    pub fn enqueue(
        &mut self,
        kind: PacketKind,
        ssrc: u32,
        size: DataSize,
        at_time: Timestamp,
    ) -> bool {
        if self.queue_len() >= self.max_queue_packets {
            tracing::warn!(queued = self.queue_len(), "pacer queue overflow");
            return false;
        }
        self.queues[kind.index()].push_back(QueuedPacket {
            kind,
            ssrc,
            size,
            enqueue_time: at_time,
        });
        self.queue_size += size;
        true
    }

    pub fn queue_len(&self) -> usize {
        self.queues.iter().map(|q| q.len()).sum()
    }

    pub fn queue_size(&self) -> DataSize {
        self.queue_size
    }

    /// Time the current queue would need to drain at the pacing rate.
    pub fn expected_queue_time(&self) -> TimeDelta {
        if self.pacing_rate.is_zero() {
            return TimeDelta::plus_infinity();
        }
        self.queue_size / self.pacing_rate
    }

    pub fn first_sent_packet_time(&self) -> Option<Timestamp> {
        self.first_sent_packet_time
    }

    pub fn last_send_time(&self) -> Option<Timestamp> {
        self.last_send_time
    }

    /// Runs one pacing tick, releasing whatever the budget (or the pending
    /// probe cluster) allows.
    pub fn tick(&mut self, now: Timestamp) -> TickOutcome {
        let elapsed = match self.last_tick {
            Some(last) => (now - last).min(MAX_BUDGET_INTERVAL),
            None => PACER_TICK,
        };
        self.last_tick = Some(now);

        let mut outcome = TickOutcome::empty();
        self.check_stall(now, &mut outcome);

        let probing = self.probes.front().map(|p| !p.complete()).unwrap_or(false);
        if probing {
            self.emit_probe(now, elapsed, &mut outcome);
            return outcome;
        }

        self.media_budget.increase(elapsed);
        self.padding_budget.increase(elapsed);

        loop {
            let Some((kind, size)) = self.peek_highest_priority().map(|p| (p.kind, p.size)) else {
                break;
            };
            // Audio is exempt from the pause state only; the congestion
            // window and the budget admit every kind alike.
            if self.paused && kind != PacketKind::Audio {
                break;
            }
            if self.congested(size) {
                break;
            }
            // While paused the budget stays empty by definition, so the
            // audio that is still allowed through skips it.
            if !self.paused && self.media_budget.remaining() <= 0 {
                break;
            }
            let packet = self.pop_highest_priority().unwrap();
            self.emit(packet.kind, packet.ssrc, packet.size, now, None, &mut outcome);
        }

        if !self.paused && !self.padding_rate.is_zero() && self.queue_len() == 0 {
            while self.padding_budget.remaining() > 0 && !self.congested(MIN_PADDING_SIZE) {
                let size = DataSize::from_bytes(
                    (self.padding_budget.remaining() / 8).clamp(
                        MIN_PADDING_SIZE.bytes(),
                        MAX_PADDING_SIZE.bytes(),
                    ),
                );
                self.emit(PacketKind::Padding, 0, size, now, None, &mut outcome);
            }
        }

        outcome
    }

    /// Probe emission bypasses the normal budget: the cluster target rate,
    /// applied over the cluster's lifetime, governs how much leaves on each
    /// tick. Media goes first, padding is the filler.
    fn emit_probe(&mut self, now: Timestamp, elapsed: TimeDelta, outcome: &mut TickOutcome) {
        let probe = self.probes.front_mut().unwrap();
        let cluster_id = probe.config.id;
        let started = *probe.started.get_or_insert(now - elapsed);
        let allowed_bits = (probe.config.target_rate * (now - started)).bits();
        let mut probe_bits = allowed_bits - probe.sent_bytes.bits();

        while probe_bits > 0 {
            if self.probes.front().map(|p| p.complete()).unwrap_or(true) {
                break;
            }
            let (kind, ssrc, size) = match self.pop_highest_priority() {
                Some(p) => (p.kind, p.ssrc, p.size),
                None => {
                    let size = DataSize::from_bytes(
                        (probe_bits / 8)
                            .clamp(MIN_PADDING_SIZE.bytes(), MAX_PADDING_SIZE.bytes()),
                    );
                    (PacketKind::Padding, 0, size)
                }
            };
            probe_bits -= size.bits();
            self.emit(kind, ssrc, size, now, Some(cluster_id), outcome);
            let probe = self.probes.front_mut().unwrap();
            probe.sent_bytes += size;
            probe.sent_probes += 1;
        }

        if self.probes.front().map(|p| p.complete()).unwrap_or(false) {
            let done = self.probes.pop_front().unwrap();
            tracing::info!(
                id = done.config.id,
                probes = done.sent_probes,
                bytes = done.sent_bytes.bytes(),
                "probe cluster complete"
            );
        }
    }

    fn emit(
        &mut self,
        kind: PacketKind,
        ssrc: u32,
        size: DataSize,
        now: Timestamp,
        cluster_id: Option<u32>,
        outcome: &mut TickOutcome,
    ) {
        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);
        self.media_budget.consume(size);
        if kind == PacketKind::Padding {
            self.padding_budget.consume(size);
        }
        self.outstanding += size;
        self.first_sent_packet_time.get_or_insert(now);
        self.last_send_time = Some(now);
        outcome.packets.push(EgressPacket {
            kind,
            ssrc,
            sequence,
            size,
            send_time: now,
            pacing_info: PacedPacketInfo {
                probe_cluster_id: cluster_id,
            },
        });
    }

    fn congested(&self, next_size: DataSize) -> bool {
        match self.congestion_window {
            Some(window) => self.outstanding + next_size > window,
            None => false,
        }
    }

    fn peek_highest_priority(&self) -> Option<&QueuedPacket> {
        self.queues.iter().find_map(|q| q.front())
    }

    fn pop_highest_priority(&mut self) -> Option<QueuedPacket> {
        for queue in &mut self.queues {
            if let Some(packet) = queue.pop_front() {
                self.queue_size -= packet.size;
                return Some(packet);
            }
        }
        None
    }

    /// A packet past the queue time limit declares the queue stalled; the
    /// non-audio queues are flushed so fresher data can take over.
    fn check_stall(&mut self, now: Timestamp, outcome: &mut TickOutcome) {
        let stalled = self
            .queues
            .iter()
            .filter_map(|q| q.front())
            .any(|p| now - p.enqueue_time > self.queue_time_limit);
        if !stalled {
            return;
        }
        outcome.stalled = true;
        let mut flushed = 0;
        let mut flushed_size = DataSize::zero();
        // Skip the audio queue; audio is never dropped on a stall.
        for queue in self.queues.iter_mut().skip(1) {
            flushed += queue.len();
            for packet in queue.drain(..) {
                flushed_size += packet.size;
            }
        }
        self.queue_size -= flushed_size;
        tracing::warn!(flushed, "pacer queue stalled, flushed non-audio queues");
    }
}
