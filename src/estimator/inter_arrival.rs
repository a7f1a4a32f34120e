//! Arrival-time grouping of acknowledged packets.
//!
//! Packets sent close together are merged into groups of at most 5 ms of
//! departure time, and the deltas between consecutive groups feed the
//! trendline filter. Bursts that arrive back to back after a queue drains
//! are folded into the previous group so they do not register as negative
//! delay variation.

use crate::units::{DataSize, TimeDelta, Timestamp};

/// Span of send time that belongs to one group.
const SEND_TIME_GROUP_LENGTH: TimeDelta = TimeDelta::from_micros(5_000);
/// Arrival gap below which a packet can only be part of a burst.
const BURST_DELTA_LIMIT: TimeDelta = TimeDelta::from_micros(5_000);
/// An arrival gap this large means the stream was interrupted; start over.
const ARRIVAL_TIME_OFFSET_LIMIT: TimeDelta = TimeDelta::from_micros(3_000_000);

/// Deltas between two completed packet groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupDeltas {
    pub send_delta: TimeDelta,
    pub arrival_delta: TimeDelta,
    pub size_delta: DataSize,
}

#[derive(Debug, Clone, Copy)]
struct PacketGroup {
    size: DataSize,
    first_send: Timestamp,
    last_send: Timestamp,
    first_arrival: Timestamp,
    last_arrival: Timestamp,
}

impl PacketGroup {
    fn new(send_time: Timestamp, arrival_time: Timestamp, size: DataSize) -> Self {
        Self {
            size,
            first_send: send_time,
            last_send: send_time,
            first_arrival: arrival_time,
            last_arrival: arrival_time,
        }
    }
}

#[derive(Debug, Default)]
pub struct InterArrival {
    current: Option<PacketGroup>,
    previous: Option<PacketGroup>,
}

impl InterArrival {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one acknowledged packet. Returns the deltas between the two
    /// most recent complete groups whenever the packet starts a new group.
    pub fn compute_deltas(
        &mut self,
        send_time: Timestamp,
        arrival_time: Timestamp,
        size: DataSize,
    ) -> Option<GroupDeltas> {
        let Some(current) = &mut self.current else {
            self.current = Some(PacketGroup::new(send_time, arrival_time, size));
            return None;
        };

        if arrival_time - current.last_arrival > ARRIVAL_TIME_OFFSET_LIMIT {
            // Stream gap; everything before it is stale.
            self.current = Some(PacketGroup::new(send_time, arrival_time, size));
            self.previous = None;
            return None;
        }

        if send_time < current.first_send {
            // Out of order within the group scope; ignore.
            return None;
        }

        if Self::belongs_to_group(current, send_time, arrival_time) {
            current.size += size;
            current.last_send = current.last_send.max(send_time);
            current.last_arrival = arrival_time;
            return None;
        }

        let deltas = self.previous.map(|previous| {
            let current = self.current.as_ref().unwrap();
            GroupDeltas {
                send_delta: current.last_send - previous.last_send,
                arrival_delta: current.last_arrival - previous.last_arrival,
                size_delta: DataSize::from_bytes(
                    current.size.bytes() - previous.size.bytes(),
                ),
            }
        });
        self.previous = self.current;
        self.current = Some(PacketGroup::new(send_time, arrival_time, size));
        deltas
    }

    fn belongs_to_group(group: &PacketGroup, send_time: Timestamp, arrival_time: Timestamp) -> bool {
        if send_time == group.last_send {
            return true;
        }
        if send_time - group.first_send <= SEND_TIME_GROUP_LENGTH {
            return true;
        }
        // Burst: packets queued behind each other arrive nearly back to back
        // with shrinking one way delay.
        let arrival_delta = arrival_time - group.last_arrival;
        let send_delta = send_time - group.last_send;
        arrival_delta < BURST_DELTA_LIMIT && arrival_delta - send_delta < TimeDelta::zero()
    }

    pub fn reset(&mut self) {
        self.current = None;
        self.previous = None;
    }
}
