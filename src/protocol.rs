//! Binary transport-feedback format and sequence-number bookkeeping.
//!
//! The feedback message carries, big-endian: a 16-bit base sequence, a 16-bit
//! packet-status count, a signed 24-bit reference time in 64 ms units, an
//! 8-bit feedback sequence counter, a list of packet-status chunks and one
//! receive delta (1 or 2 bytes, 250 us ticks) per received packet. Both
//! run-length and status-vector chunks must be accepted; the serializer emits
//! a canonical chunking so parse/serialize round-trips byte for byte.

use crate::units::Timestamp;

/// Resolution of the 24-bit reference time field.
pub const BASE_TIME_TICK_US: i64 = 64_000;
/// Resolution of per-packet receive deltas.
pub const DELTA_TICK_US: i64 = 250;
/// Fixed part of the message: base seq, count, reference time, feedback seq.
const HEADER_SIZE: usize = 8;
/// Run-length chunks carry a 13-bit run.
const MAX_RUN_LENGTH: usize = 0x1FFF;
/// One-bit status vector chunk capacity.
const ONE_BIT_SYMBOLS: usize = 14;
/// Two-bit status vector chunk capacity.
const TWO_BIT_SYMBOLS: usize = 7;
/// The 16-bit status count bounds packets per message.
pub const MAX_PACKETS_PER_FEEDBACK: usize = 0xFFFF;

/// Per-packet reception status, as carried in the status chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketStatus {
    NotReceived,
    ReceivedSmallDelta,
    ReceivedLargeDelta,
}

impl PacketStatus {
    fn symbol(self) -> u16 {
        match self {
            PacketStatus::NotReceived => 0,
            PacketStatus::ReceivedSmallDelta => 1,
            PacketStatus::ReceivedLargeDelta => 2,
        }
    }

    fn from_symbol(symbol: u16) -> Result<Self, FeedbackParseError> {
        match symbol {
            0 => Ok(PacketStatus::NotReceived),
            1 => Ok(PacketStatus::ReceivedSmallDelta),
            2 => Ok(PacketStatus::ReceivedLargeDelta),
            _ => Err(FeedbackParseError::ReservedStatusSymbol),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FeedbackParseError {
    #[error("message truncated")]
    Truncated,
    #[error("reserved status symbol")]
    ReservedStatusSymbol,
    #[error("status count mismatch")]
    CountMismatch,
}

/// One packet as reported by the receiver: sequence number and, when the
/// packet arrived, its receive time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportedPacket {
    pub sequence: u16,
    pub receive_time: Option<Timestamp>,
}

/// A transport feedback message, in either direction of the codec.
///
/// Build one with [`TransportFeedback::new`] + [`add_received_packet`]
/// (gaps in the sequence space become losses), or parse one off the wire.
///
/// [`add_received_packet`]: TransportFeedback::add_received_packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportFeedback {
    base_sequence: u16,
    feedback_seq: u8,
    /// Unwrapped reference time in 64 ms ticks. Only the low 24 bits hit the
    /// wire.
    base_time_ticks: i64,
    statuses: Vec<PacketStatus>,
    /// One entry per received status, in 250 us ticks relative to the
    /// previous received packet (the first is relative to the base time).
    deltas: Vec<i16>,
}

impl TransportFeedback {
    pub fn new(base_sequence: u16, feedback_seq: u8, reference_time: Timestamp) -> Self {
        Self {
            base_sequence,
            feedback_seq,
            base_time_ticks: reference_time.micros().div_euclid(BASE_TIME_TICK_US),
            statuses: Vec::new(),
            deltas: Vec::new(),
        }
    }

    pub fn base_sequence(&self) -> u16 {
        self.base_sequence
    }

    pub fn feedback_seq(&self) -> u8 {
        self.feedback_seq
    }

    pub fn base_time(&self) -> Timestamp {
        Timestamp::from_micros(self.base_time_ticks * BASE_TIME_TICK_US)
    }

    pub fn packet_count(&self) -> usize {
        self.statuses.len()
    }

    /// Records `sequence` as received at `receive_time`. Sequence numbers
    /// must be added in increasing (wrapping) order; skipped numbers are
    /// reported lost. Returns false when the packet cannot be represented
    /// (delta out of range, message full), in which case the caller should
    /// start a new feedback message.
    pub fn add_received_packet(&mut self, sequence: u16, receive_time: Timestamp) -> bool {
        let offset = sequence.wrapping_sub(self.base_sequence) as usize;
        if offset < self.statuses.len() || offset >= MAX_PACKETS_PER_FEEDBACK {
            return false;
        }
        let last_time_us = self.last_receive_time_us();
        let delta_ticks_wide =
            (receive_time.micros() - last_time_us + DELTA_TICK_US / 2).div_euclid(DELTA_TICK_US);
        if delta_ticks_wide < i16::MIN as i64 || delta_ticks_wide > i16::MAX as i64 {
            return false;
        }
        let delta_ticks = delta_ticks_wide as i16;
        let status = if (0..=0xFF).contains(&delta_ticks_wide) {
            PacketStatus::ReceivedSmallDelta
        } else {
            PacketStatus::ReceivedLargeDelta
        };
        while self.statuses.len() < offset {
            self.statuses.push(PacketStatus::NotReceived);
        }
        self.statuses.push(status);
        self.deltas.push(delta_ticks);
        true
    }

    fn last_receive_time_us(&self) -> i64 {
        let mut time = self.base_time_ticks * BASE_TIME_TICK_US;
        for delta in &self.deltas {
            time += *delta as i64 * DELTA_TICK_US;
        }
        time
    }

    /// All reported packets in sequence order, losses included.
    pub fn packets(&self) -> Vec<ReportedPacket> {
        let mut out = Vec::with_capacity(self.statuses.len());
        let mut time_us = self.base_time_ticks * BASE_TIME_TICK_US;
        let mut delta_iter = self.deltas.iter();
        for (i, status) in self.statuses.iter().enumerate() {
            let sequence = self.base_sequence.wrapping_add(i as u16);
            let receive_time = match status {
                PacketStatus::NotReceived => None,
                _ => {
                    let delta = delta_iter.next().copied().unwrap_or(0);
                    time_us += delta as i64 * DELTA_TICK_US;
                    Some(Timestamp::from_micros(time_us))
                }
            };
            out.push(ReportedPacket {
                sequence,
                receive_time,
            });
        }
        out
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + self.statuses.len());
        buf.extend_from_slice(&self.base_sequence.to_be_bytes());
        buf.extend_from_slice(&(self.statuses.len() as u16).to_be_bytes());
        let base_wire = (self.base_time_ticks & 0xFF_FFFF) as u32;
        buf.push((base_wire >> 16) as u8);
        buf.push((base_wire >> 8) as u8);
        buf.push(base_wire as u8);
        buf.push(self.feedback_seq);
        Self::write_chunks(&self.statuses, &mut buf);
        for (status, delta) in self
            .statuses
            .iter()
            .filter(|s| **s != PacketStatus::NotReceived)
            .zip(&self.deltas)
        {
            match status {
                PacketStatus::ReceivedSmallDelta => buf.push(*delta as u8),
                PacketStatus::ReceivedLargeDelta => {
                    buf.extend_from_slice(&delta.to_be_bytes());
                }
                PacketStatus::NotReceived => unreachable!(),
            }
        }
        buf
    }

    /// Canonical chunking: a run of at least two equal statuses becomes a
    /// run-length chunk; otherwise up to 14 one-bit symbols when no large
    /// deltas are pending, else up to 7 two-bit symbols.
    fn write_chunks(statuses: &[PacketStatus], buf: &mut Vec<u8>) {
        let mut i = 0;
        while i < statuses.len() {
            let run_end = statuses[i..]
                .iter()
                .take(MAX_RUN_LENGTH)
                .take_while(|s| **s == statuses[i])
                .count();
            if run_end >= 2 {
                let chunk = (statuses[i].symbol() << 13) | run_end as u16;
                buf.extend_from_slice(&chunk.to_be_bytes());
                i += run_end;
                continue;
            }
            let window = &statuses[i..(i + ONE_BIT_SYMBOLS).min(statuses.len())];
            let one_bit_ok = window
                .iter()
                .all(|s| *s != PacketStatus::ReceivedLargeDelta);
            if one_bit_ok {
                let mut chunk: u16 = 0x8000;
                for (bit, status) in window.iter().enumerate() {
                    if *status == PacketStatus::ReceivedSmallDelta {
                        chunk |= 1 << (ONE_BIT_SYMBOLS - 1 - bit);
                    }
                }
                buf.extend_from_slice(&chunk.to_be_bytes());
                i += window.len();
            } else {
                let window = &statuses[i..(i + TWO_BIT_SYMBOLS).min(statuses.len())];
                let mut chunk: u16 = 0xC000;
                for (slot, status) in window.iter().enumerate() {
                    chunk |= status.symbol() << (2 * (TWO_BIT_SYMBOLS - 1 - slot));
                }
                buf.extend_from_slice(&chunk.to_be_bytes());
                i += window.len();
            }
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self, FeedbackParseError> {
        if data.len() < HEADER_SIZE {
            return Err(FeedbackParseError::Truncated);
        }
        let base_sequence = u16::from_be_bytes([data[0], data[1]]);
        let status_count = u16::from_be_bytes([data[2], data[3]]) as usize;
        let raw_base = ((data[4] as u32) << 16) | ((data[5] as u32) << 8) | data[6] as u32;
        // Sign extend the 24-bit reference time.
        let base_time_ticks = ((raw_base << 8) as i32 >> 8) as i64;
        let feedback_seq = data[7];

        let mut statuses = Vec::with_capacity(status_count);
        let mut cursor = HEADER_SIZE;
        while statuses.len() < status_count {
            if cursor + 2 > data.len() {
                return Err(FeedbackParseError::Truncated);
            }
            let chunk = u16::from_be_bytes([data[cursor], data[cursor + 1]]);
            cursor += 2;
            Self::read_chunk(chunk, status_count - statuses.len(), &mut statuses)?;
        }
        if statuses.len() != status_count {
            return Err(FeedbackParseError::CountMismatch);
        }

        let mut deltas = Vec::new();
        for status in &statuses {
            match status {
                PacketStatus::NotReceived => {}
                PacketStatus::ReceivedSmallDelta => {
                    if cursor + 1 > data.len() {
                        return Err(FeedbackParseError::Truncated);
                    }
                    deltas.push(data[cursor] as i16);
                    cursor += 1;
                }
                PacketStatus::ReceivedLargeDelta => {
                    if cursor + 2 > data.len() {
                        return Err(FeedbackParseError::Truncated);
                    }
                    deltas.push(i16::from_be_bytes([data[cursor], data[cursor + 1]]));
                    cursor += 2;
                }
            }
        }

        Ok(Self {
            base_sequence,
            feedback_seq,
            base_time_ticks,
            statuses,
            deltas,
        })
    }

    fn read_chunk(
        chunk: u16,
        remaining: usize,
        out: &mut Vec<PacketStatus>,
    ) -> Result<(), FeedbackParseError> {
        if chunk & 0x8000 == 0 {
            // Run length chunk.
            let status = PacketStatus::from_symbol((chunk >> 13) & 0x3)?;
            let run = (chunk & 0x1FFF) as usize;
            if run > remaining {
                return Err(FeedbackParseError::CountMismatch);
            }
            out.extend(std::iter::repeat(status).take(run));
        } else if chunk & 0x4000 == 0 {
            // One-bit status vector.
            for bit in 0..ONE_BIT_SYMBOLS.min(remaining) {
                let set = chunk & (1 << (ONE_BIT_SYMBOLS - 1 - bit)) != 0;
                out.push(if set {
                    PacketStatus::ReceivedSmallDelta
                } else {
                    PacketStatus::NotReceived
                });
            }
        } else {
            // Two-bit status vector.
            for slot in 0..TWO_BIT_SYMBOLS.min(remaining) {
                let symbol = (chunk >> (2 * (TWO_BIT_SYMBOLS - 1 - slot))) & 0x3;
                out.push(PacketStatus::from_symbol(symbol)?);
            }
        }
        Ok(())
    }
}

/// Expands 16-bit sequence numbers into a monotone 64-bit space.
///
/// A new number within the forward half-range of the last one advances the
/// count; anything else is treated as a reordered (older) number. This is the
/// same forward bias the 24-bit on-wire base extension produces.
#[derive(Debug, Default, Clone)]
pub struct SeqUnwrapper {
    last_unwrapped: Option<i64>,
}

impl SeqUnwrapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unwrap(&mut self, sequence: u16) -> i64 {
        let unwrapped = match self.last_unwrapped {
            None => sequence as i64,
            Some(last) => {
                let forward = sequence.wrapping_sub(last as u16);
                if forward < 0x8000 {
                    last + forward as i64
                } else {
                    last - (0x1_0000 - forward as i64)
                }
            }
        };
        if unwrapped > self.last_unwrapped.unwrap_or(i64::MIN) {
            self.last_unwrapped = Some(unwrapped);
        }
        unwrapped
    }

    pub fn reset(&mut self) {
        self.last_unwrapped = None;
    }
}
