//! Correlates sent packets with transport feedback reports.
//!
//! The adapter owns every sent packet record from `add_packet` until the
//! packet's outcome is delivered in a [`FeedbackBatch`] or the record falls
//! out of the history window. Sequence numbers arrive as 16 bits on the wire
//! and are unwrapped into a monotone 64-bit space for bookkeeping.

use std::collections::BTreeMap;

use crate::error::SendSideError;
use crate::pacer::PacedPacketInfo;
use crate::protocol::{SeqUnwrapper, TransportFeedback};
use crate::units::{DataSize, TimeDelta, Timestamp};

/// Upper bounds of the send history. Eviction keeps whichever bound is hit
/// first, but never less than 500 ms of packets.
const HISTORY_MAX_AGE: TimeDelta = TimeDelta::from_micros(60 * 1_000_000);
const HISTORY_MIN_AGE: TimeDelta = TimeDelta::from_micros(500_000);
const HISTORY_MAX_PACKETS: usize = 60_000;

/// A packet handed to the pacer, as remembered by the adapter.
#[derive(Debug, Clone)]
pub struct SentPacketRecord {
    pub ssrc: u32,
    pub sequence: u16,
    pub size: DataSize,
    pub added_time: Timestamp,
    pub send_time: Option<Timestamp>,
    pub pacing_info: PacedPacketInfo,
    pub is_retransmit: bool,
}

impl SentPacketRecord {
    pub fn is_probe(&self) -> bool {
        self.pacing_info.probe_cluster_id.is_some()
    }
}

/// Outcome of one sent packet as established by feedback. `receive_time` of
/// `None` means the feedback declared the packet lost.
#[derive(Debug, Clone)]
pub struct PacketOutcome {
    pub sent: SentPacketRecord,
    pub receive_time: Option<Timestamp>,
}

impl PacketOutcome {
    pub fn is_received(&self) -> bool {
        self.receive_time.is_some()
    }

    /// Position of this outcome inside a batch: receive time for received
    /// packets, send time for losses.
    fn order_key(&self) -> Timestamp {
        self.receive_time
            .or(self.sent.send_time)
            .unwrap_or(Timestamp::minus_infinity())
    }
}

/// All packet outcomes produced by one transport feedback report.
#[derive(Debug, Clone)]
pub struct FeedbackBatch {
    pub feedback_time: Timestamp,
    /// Bytes in flight before this batch was applied.
    pub prior_in_flight: DataSize,
    /// Bytes in flight after this batch was applied.
    pub data_in_flight: DataSize,
    /// Outcomes in receive-time order; losses sit at their send-time spot.
    pub outcomes: Vec<PacketOutcome>,
}

impl FeedbackBatch {
    pub fn received(&self) -> impl Iterator<Item = &PacketOutcome> {
        self.outcomes.iter().filter(|o| o.is_received())
    }

    pub fn lost_count(&self) -> usize {
        self.outcomes.iter().filter(|o| !o.is_received()).count()
    }

    /// Smallest feedback-loop round trip observable from this batch.
    pub fn min_rtt(&self) -> Option<TimeDelta> {
        self.received()
            .filter_map(|o| o.sent.send_time)
            .map(|send| self.feedback_time - send)
            .min()
    }
}

/// Counters for conditions that are recovered from locally.
#[derive(Debug, Default, Clone, Copy)]
pub struct AdapterCounters {
    pub unknown_packets: u64,
    pub out_of_order_batches: u64,
    pub reset_loss_batches: u64,
}

pub struct TransportFeedbackAdapter {
    history: BTreeMap<i64, SentPacketRecord>,
    send_unwrapper: SeqUnwrapper,
    feedback_unwrapper: SeqUnwrapper,
    in_flight: DataSize,
    network_ids: Option<(u16, u16)>,
    counters: AdapterCounters,
}

impl Default for TransportFeedbackAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportFeedbackAdapter {
    pub fn new() -> Self {
        Self {
            history: BTreeMap::new(),
            send_unwrapper: SeqUnwrapper::new(),
            feedback_unwrapper: SeqUnwrapper::new(),
            in_flight: DataSize::zero(),
            network_ids: None,
            counters: AdapterCounters::default(),
        }
    }

    /// Records a packet about to be paced out.
    pub fn add_packet(
        &mut self,
        ssrc: u32,
        sequence: u16,
        size: DataSize,
        pacing_info: PacedPacketInfo,
        is_retransmit: bool,
        at_time: Timestamp,
    ) {
        let key = self.send_unwrapper.unwrap(sequence);
        self.history.insert(
            key,
            SentPacketRecord {
                ssrc,
                sequence,
                size,
                added_time: at_time,
                send_time: None,
                pacing_info,
                is_retransmit,
            },
        );
        self.evict(at_time);
    }

    /// Attaches the actual send time once the packet left the socket.
    pub fn on_sent_packet(
        &mut self,
        sequence: u16,
        send_time: Timestamp,
    ) -> Result<(), SendSideError> {
        // Unwrap against a copy of the send counter so lookups do not
        // advance the unwrapping state.
        let key = self.send_unwrapper.clone().unwrap(sequence);
        match self.history.get_mut(&key) {
            Some(record) if record.sequence == sequence => {
                if record.send_time.is_none() {
                    self.in_flight += record.size;
                }
                record.send_time = Some(send_time);
                Ok(())
            }
            _ => {
                self.counters.unknown_packets += 1;
                tracing::debug!(sequence, "sent notification for unknown packet");
                Err(SendSideError::UnknownPacket(sequence))
            }
        }
    }

    /// Applies a transport feedback report, producing the ordered outcomes.
    pub fn on_feedback(
        &mut self,
        feedback: &TransportFeedback,
        at_time: Timestamp,
    ) -> Result<FeedbackBatch, SendSideError> {
        let prior_in_flight = self.in_flight;
        let base_key = self.feedback_unwrapper.unwrap(feedback.base_sequence());

        if let Some((&oldest, _)) = self.history.iter().next() {
            if base_key + feedback.packet_count() as i64 <= oldest {
                self.counters.out_of_order_batches += 1;
                tracing::debug!(
                    base = feedback.base_sequence(),
                    "feedback batch precedes history window"
                );
                return Err(SendSideError::FeedbackOutOfOrder);
            }
        }

        let mut outcomes = Vec::with_capacity(feedback.packet_count());
        for reported in feedback.packets() {
            let key = base_key + reported.sequence.wrapping_sub(feedback.base_sequence()) as i64;
            let Some(record) = self.history.get(&key) else {
                self.counters.unknown_packets += 1;
                continue;
            };
            if record.send_time.is_none() {
                // Feedback for a packet we never saw leave; skip it.
                self.counters.unknown_packets += 1;
                continue;
            }
            let record = self.history.remove(&key).unwrap();
            self.in_flight -= record.size;
            outcomes.push(PacketOutcome {
                sent: record,
                receive_time: reported.receive_time,
            });
        }
        outcomes.sort_by_key(|o| o.order_key());

        Ok(FeedbackBatch {
            feedback_time: at_time,
            prior_in_flight,
            data_in_flight: self.in_flight,
            outcomes,
        })
    }

    /// Sum of sizes of sent-but-unacknowledged packets.
    pub fn outstanding_data(&self) -> DataSize {
        self.in_flight
    }

    /// Resets all state when either network id changes. Packets in flight at
    /// the moment of the reset are surfaced as one batch of losses stamped
    /// with the current time.
    pub fn set_network_ids(
        &mut self,
        local: u16,
        remote: u16,
        at_time: Timestamp,
    ) -> Option<FeedbackBatch> {
        if self.network_ids == Some((local, remote)) {
            return None;
        }
        self.network_ids = Some((local, remote));
        let prior_in_flight = self.in_flight;
        let mut outcomes: Vec<PacketOutcome> = std::mem::take(&mut self.history)
            .into_values()
            .filter(|r| r.send_time.is_some())
            .map(|sent| PacketOutcome {
                sent,
                receive_time: None,
            })
            .collect();
        outcomes.sort_by_key(|o| o.order_key());
        self.send_unwrapper.reset();
        self.feedback_unwrapper.reset();
        self.in_flight = DataSize::zero();
        if outcomes.is_empty() {
            return None;
        }
        self.counters.reset_loss_batches += 1;
        tracing::info!(
            local,
            remote,
            orphaned = outcomes.len(),
            "network ids changed, flushing in-flight packets as losses"
        );
        Some(FeedbackBatch {
            feedback_time: at_time,
            prior_in_flight,
            data_in_flight: DataSize::zero(),
            outcomes,
        })
    }

    pub fn counters(&self) -> AdapterCounters {
        self.counters
    }

    fn evict(&mut self, now: Timestamp) {
        // Count bound first, but never below 500 ms of history.
        while self.history.len() > HISTORY_MAX_PACKETS {
            let Some((_, oldest)) = self.history.iter().next() else {
                break;
            };
            if now - oldest.added_time <= HISTORY_MIN_AGE {
                break;
            }
            self.drop_oldest();
        }
        while let Some((_, oldest)) = self.history.iter().next() {
            if now - oldest.added_time <= HISTORY_MAX_AGE {
                break;
            }
            self.drop_oldest();
        }
    }

    fn drop_oldest(&mut self) {
        if let Some((&key, _)) = self.history.iter().next() {
            let record = self.history.remove(&key).unwrap();
            if record.send_time.is_some() {
                self.in_flight -= record.size;
            }
        }
    }
}
