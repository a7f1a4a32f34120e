//! The rate-update funnel: feedback in, pacing rates and observer updates
//! out.
//!
//! `SendSideController` owns the feedback adapter, the bandwidth estimator,
//! the probe controller, the pacer, the congestion window and the ALR
//! detector, and is itself owned by the worker task queue. All entry points
//! take the current time explicitly so the whole controller runs unchanged
//! under real or simulated clocks.

use std::sync::{Arc, Mutex};

use crate::alr::AlrDetector;
use crate::config::{CongestionConfig, Experiments};
use crate::cwnd::{CongestionWindowController, OvershootDetector};
use crate::error::SendSideError;
use crate::estimator::{BandwidthEstimator, TargetTransferRate};
use crate::feedback::TransportFeedbackAdapter;
use crate::pacer::{EgressPacket, Pacer, PacketKind, PACER_TICK};
use crate::probe::ProbeController;
use crate::protocol::TransportFeedback;
use crate::scheduler::{RepeatDecision, TaskHandle, TaskQueue};
use crate::time::Clock;
use crate::units::{DataRate, DataSize, TimeDelta, Timestamp};

/// Sliding window of the encoder overshoot detector.
const OVERSHOOT_WINDOW: TimeDelta = TimeDelta::from_micros(1_000_000);

/// Receives rate updates on the worker queue. Callbacks must not block.
pub trait TargetTransferRateObserver: Send {
    fn on_target_transfer_rate(&mut self, update: TargetTransferRate);

    /// A packet exceeded the pacer queue time limit.
    fn on_queue_stalled(&mut self) {}
}

/// Consumes the packets the pacer releases.
pub trait PacketSink: Send {
    fn send_packet(&mut self, packet: &EgressPacket);
}

impl<F: FnMut(&EgressPacket) + Send> PacketSink for F {
    fn send_packet(&mut self, packet: &EgressPacket) {
        self(packet)
    }
}

pub struct SendSideController {
    config: CongestionConfig,
    experiments: Experiments,
    adapter: TransportFeedbackAdapter,
    estimator: BandwidthEstimator,
    probe: ProbeController,
    pacer: Pacer,
    cwnd: CongestionWindowController,
    alr: AlrDetector,
    overshoot: OvershootDetector,
    observer: Box<dyn TargetTransferRateObserver>,
    sink: Box<dyn PacketSink>,
    last_published: Option<(DataRate, f64, TimeDelta)>,
    target_frame_rate: f64,
    was_in_alr: bool,
    started: bool,
}

impl SendSideController {
    pub fn new(
        config: CongestionConfig,
        experiments: Experiments,
        observer: Box<dyn TargetTransferRateObserver>,
        sink: Box<dyn PacketSink>,
    ) -> Result<Self, SendSideError> {
        config.validate()?;
        let pacer = Pacer::new(
            config.start_bitrate * config.pacing_factor,
            config.padding_rate,
            config.queue_time_limit,
        );
        let mut alr = AlrDetector::new();
        alr.set_target_rate(config.start_bitrate);
        Ok(Self {
            estimator: BandwidthEstimator::new(&config, experiments.alr_limited_backoff),
            probe: ProbeController::new(
                config.start_bitrate,
                config.max_bitrate,
                config.probe_initial_multipliers.clone(),
                config.alr_probing_enabled,
            ),
            pacer,
            cwnd: CongestionWindowController::new(
                config.congestion_window_enabled,
                config.cwnd_additional_time,
            ),
            alr,
            overshoot: OvershootDetector::new(OVERSHOOT_WINDOW),
            adapter: TransportFeedbackAdapter::new(),
            observer,
            sink,
            last_published: None,
            target_frame_rate: 30.0,
            was_in_alr: false,
            started: false,
            config,
            experiments,
        })
    }

    /// Queues a media packet for paced sending. Returns false on queue
    /// overflow.
    pub fn enqueue_packet(
        &mut self,
        kind: PacketKind,
        ssrc: u32,
        size: DataSize,
        now: Timestamp,
    ) -> bool {
        self.pacer.enqueue(kind, ssrc, size, now)
    }

    /// One pacer tick: release packets, record them with the feedback
    /// adapter, account them against ALR and push them to the sink.
    pub fn on_pacer_tick(&mut self, now: Timestamp) {
        let outcome = self.pacer.tick(now);
        if outcome.stalled {
            self.observer.on_queue_stalled();
        }
        for packet in &outcome.packets {
            self.adapter.add_packet(
                packet.ssrc,
                packet.sequence,
                packet.size,
                packet.pacing_info,
                packet.kind == PacketKind::Retransmission,
                now,
            );
            // The pacer just handed us this packet, so the record exists.
            let _ = self.adapter.on_sent_packet(packet.sequence, packet.send_time);
            self.alr.on_bytes_sent(packet.size, packet.send_time);
            self.sink.send_packet(packet);
        }
        if !outcome.packets.is_empty() {
            self.pacer.set_outstanding_data(self.adapter.outstanding_data());
        }
        self.track_alr_transitions(now);
    }

    /// Periodic processing: initial probes, ALR probing, rate publication.
    pub fn on_process_interval(&mut self, now: Timestamp) {
        if !self.started {
            self.started = true;
            for cluster in self.probe.on_stream_start(now) {
                self.pacer.add_probe_cluster(cluster);
            }
        }
        self.probe.set_alr_start_time(self.alr.alr_start_time());
        for cluster in self.probe.process(now) {
            self.pacer.add_probe_cluster(cluster);
        }
        self.publish_update(now);
    }

    /// A transport feedback report arrived from the receiver.
    pub fn on_transport_feedback(
        &mut self,
        feedback: &TransportFeedback,
        now: Timestamp,
    ) -> Result<(), SendSideError> {
        let batch = self.adapter.on_feedback(feedback, now)?;
        let in_alr = self.alr.alr_start_time().is_some();
        self.estimator.on_feedback_batch(&batch, in_alr);
        self.pacer.set_outstanding_data(self.adapter.outstanding_data());

        if self.cwnd.is_congested(self.adapter.outstanding_data()) {
            self.estimator.on_congestion_window_backoff(now);
        }

        for cluster in self.probe.set_estimate(self.estimator.target(), now) {
            self.pacer.add_probe_cluster(cluster);
        }
        if self.estimator.take_recovered_from_overuse() {
            for cluster in self.probe.request_probe(now) {
                self.pacer.add_probe_cluster(cluster);
            }
        }
        Ok(())
    }

    /// Current trendline verdict, mostly for tests and diagnostics.
    pub fn bandwidth_usage(&self) -> crate::estimator::BandwidthUsage {
        self.estimator.bandwidth_usage()
    }

    /// Either network id changed: reset the whole estimation pipeline and
    /// flush in-flight packets as losses.
    pub fn on_network_route_change(&mut self, local: u16, remote: u16, now: Timestamp) {
        if let Some(batch) = self.adapter.set_network_ids(local, remote, now) {
            // The orphaned packets inform in-flight accounting only; their
            // loss says nothing about the new route.
            tracing::info!(orphaned = batch.outcomes.len(), "dropping in-flight on route change");
        }
        self.estimator =
            BandwidthEstimator::new(&self.config, self.experiments.alr_limited_backoff);
        self.probe = ProbeController::new(
            self.config.start_bitrate,
            self.config.max_bitrate,
            self.config.probe_initial_multipliers.clone(),
            self.config.alr_probing_enabled,
        );
        self.started = false;
        self.pacer.set_outstanding_data(DataSize::zero());
        self.last_published = None;
    }

    /// Tightens or widens the min/max bitrate constraints at runtime.
    pub fn set_bitrate_constraints(
        &mut self,
        min: DataRate,
        max: DataRate,
        now: Timestamp,
    ) -> Result<(), SendSideError> {
        if min <= DataRate::zero() || max < min {
            return Err(SendSideError::ConfigInvalid(format!(
                "bad constraints [{min}, {max}]"
            )));
        }
        self.config.min_bitrate = min;
        self.config.max_bitrate = max;
        self.estimator.set_constraints(min, max);
        for cluster in self.probe.on_max_bitrate_changed(max, now) {
            self.pacer.add_probe_cluster(cluster);
        }
        Ok(())
    }

    /// Encoder produced a frame; feeds the overshoot detector.
    pub fn on_encoded_frame(&mut self, size: DataSize, now: Timestamp) {
        self.overshoot.on_encoded_frame(size, now);
    }

    pub fn set_target_frame_rate(&mut self, fps: f64) {
        self.target_frame_rate = fps;
    }

    /// Current encoder utilization as seen by the overshoot detector.
    pub fn utilization_factor(&mut self, now: Timestamp) -> Option<f64> {
        self.overshoot.utilization_factor(now)
    }

    pub fn current_target(&self) -> DataRate {
        self.estimator.target()
    }

    pub fn outstanding_data(&self) -> DataSize {
        self.adapter.outstanding_data()
    }

    pub fn pacer_queue_len(&self) -> usize {
        self.pacer.queue_len()
    }

    fn track_alr_transitions(&mut self, now: Timestamp) {
        let in_alr = self.alr.alr_start_time().is_some();
        if self.was_in_alr && !in_alr {
            self.estimator.set_alr_ended(now);
            self.probe.set_alr_start_time(None);
        }
        self.was_in_alr = in_alr;
    }

    /// Applies the current estimate to pacer, window and observer. Duplicate
    /// updates (target, loss and RTT all unchanged) are suppressed.
    fn publish_update(&mut self, now: Timestamp) {
        let update = self.estimator.current_update(now);
        let target = update.target_rate;

        self.pacer.set_pacing_rates(
            target * self.config.pacing_factor,
            self.config.padding_rate,
        );
        self.alr.set_target_rate(target);
        let window = self.cwnd.update(target, self.estimator.min_round_trip_time());
        self.pacer.set_congestion_window(window);
        self.overshoot
            .set_target_rate(target, self.target_frame_rate, now);

        let fingerprint = (
            target,
            update.network_estimate.loss_rate_ratio,
            update.network_estimate.rtt,
        );
        if self.last_published.map_or(true, |last| last != fingerprint) {
            self.last_published = Some(fingerprint);
            self.observer.on_target_transfer_rate(update);
        }
    }
}

/// Starts the two periodic tasks (pacer tick and process interval) on the
/// worker queue. The returned handles stop the tasks when dropped.
pub fn start_controller(
    controller: Arc<Mutex<SendSideController>>,
    worker: &TaskQueue,
    clock: Arc<dyn Clock>,
    now: Timestamp,
) -> (TaskHandle, TaskHandle) {
    let process_interval = controller.lock().unwrap().config.process_interval;

    let pacer_controller = Arc::clone(&controller);
    let pacer_clock = Arc::clone(&clock);
    let pacer_task = worker.start_repeating(now, TimeDelta::zero(), move || {
        pacer_controller
            .lock()
            .unwrap()
            .on_pacer_tick(pacer_clock.now());
        RepeatDecision::After(PACER_TICK)
    });

    let process_task = worker.start_repeating(now, TimeDelta::zero(), move || {
        controller
            .lock()
            .unwrap()
            .on_process_interval(clock.now());
        RepeatDecision::After(process_interval)
    });

    (pacer_task, process_task)
}
