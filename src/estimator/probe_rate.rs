//! Turns acknowledged probe clusters into throughput measurements.

use std::collections::HashMap;

use crate::units::{DataRate, DataSize, TimeDelta, Timestamp};

/// Probes older than this are abandoned; their cluster state is dropped.
const MAX_CLUSTER_AGE: TimeDelta = TimeDelta::from_micros(1_000_000);
/// Acknowledged probes needed before a cluster yields an estimate.
const MIN_ACKED_PROBES: usize = 5;

#[derive(Debug, Clone, Copy)]
struct ClusterStats {
    first_send: Timestamp,
    last_send: Timestamp,
    first_receive: Timestamp,
    last_receive: Timestamp,
    total_size: DataSize,
    acked: usize,
}

/// Aggregates per-cluster probe feedback and produces a rate once a cluster
/// has enough coherent samples.
#[derive(Debug, Default)]
pub struct ProbeBitrateEstimator {
    clusters: HashMap<u32, ClusterStats>,
    last_estimate: Option<DataRate>,
}

impl ProbeBitrateEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one acknowledged probe packet.
    pub fn on_probe_acknowledged(
        &mut self,
        cluster_id: u32,
        send_time: Timestamp,
        receive_time: Timestamp,
        size: DataSize,
    ) {
        self.clusters.retain(|_, c| receive_time - c.last_receive < MAX_CLUSTER_AGE);

        let stats = self.clusters.entry(cluster_id).or_insert(ClusterStats {
            first_send: send_time,
            last_send: send_time,
            first_receive: receive_time,
            last_receive: receive_time,
            total_size: DataSize::zero(),
            acked: 0,
        });
        stats.first_send = stats.first_send.min(send_time);
        stats.last_send = stats.last_send.max(send_time);
        stats.first_receive = stats.first_receive.min(receive_time);
        stats.last_receive = stats.last_receive.max(receive_time);
        stats.total_size += size;
        stats.acked += 1;

        if stats.acked < MIN_ACKED_PROBES {
            return;
        }
        let interval = stats.last_receive - stats.first_send;
        if interval <= TimeDelta::zero() {
            return;
        }
        // Coherence: the receive side must not have spread the cluster out
        // over more than twice its send duration plus jitter room.
        let send_interval = (stats.last_send - stats.first_send).max(TimeDelta::from_micros(1));
        let receive_interval = stats.last_receive - stats.first_receive;
        if receive_interval > send_interval * 2 + TimeDelta::from_micros(30_000) {
            tracing::debug!(cluster_id, "probe cluster arrived incoherently, discarding");
            self.clusters.remove(&cluster_id);
            return;
        }
        let rate = stats.total_size / interval;
        tracing::info!(cluster_id, %rate, "probe cluster measured");
        self.last_estimate = Some(rate);
    }

    /// Returns and clears the newest probe measurement.
    pub fn fetch_and_reset(&mut self) -> Option<DataRate> {
        self.last_estimate.take()
    }
}
