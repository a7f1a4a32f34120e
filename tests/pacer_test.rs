use sendside::probe::ProbeClusterConfig;
use sendside::{DataRate, DataSize, Pacer, PacketKind, TimeDelta, Timestamp};

fn ts_ms(ms: i64) -> Timestamp {
    Timestamp::from_millis(ms)
}

fn pacer_at(kbps: i64) -> Pacer {
    Pacer::new(
        DataRate::from_kbps(kbps),
        DataRate::zero(),
        TimeDelta::from_millis(2000),
    )
}

fn fill_video(pacer: &mut Pacer, count: usize, bytes: i64, at: Timestamp) {
    for _ in 0..count {
        assert!(pacer.enqueue(PacketKind::Video, 2, DataSize::from_bytes(bytes), at));
    }
}

/// Runs 5 ms ticks over `duration` and returns the total bytes emitted.
fn run_ticks(pacer: &mut Pacer, start_ms: i64, duration_ms: i64) -> i64 {
    let mut sent = 0;
    let mut t = start_ms;
    while t < start_ms + duration_ms {
        let outcome = pacer.tick(ts_ms(t));
        sent += outcome.packets.iter().map(|p| p.size.bytes()).sum::<i64>();
        t += 5;
    }
    sent
}

#[test]
fn test_egress_respects_pacing_rate() {
    let mut pacer = pacer_at(800);
    fill_video(&mut pacer, 200, 1200, ts_ms(0));

    // 800 kbps over 1 s is 100 kB.
    let sent = run_ticks(&mut pacer, 0, 1000);
    let expected = 100_000;
    assert!(
        (sent - expected).abs() < 10_000,
        "sent {sent} bytes, expected about {expected}"
    );
}

#[test]
fn test_priority_order_audio_retransmit_video_padding() {
    let mut pacer = pacer_at(10_000);
    let now = ts_ms(0);
    assert!(pacer.enqueue(PacketKind::Video, 2, DataSize::from_bytes(500), now));
    assert!(pacer.enqueue(PacketKind::Padding, 0, DataSize::from_bytes(100), now));
    assert!(pacer.enqueue(PacketKind::Audio, 1, DataSize::from_bytes(80), now));
    assert!(pacer.enqueue(PacketKind::Retransmission, 2, DataSize::from_bytes(500), now));

    let outcome = pacer.tick(ts_ms(5));
    let kinds: Vec<PacketKind> = outcome.packets.iter().map(|p| p.kind).collect();
    assert_eq!(
        kinds,
        vec![
            PacketKind::Audio,
            PacketKind::Retransmission,
            PacketKind::Video,
            PacketKind::Padding
        ]
    );
}

#[test]
fn test_sequence_numbers_are_consecutive() {
    let mut pacer = pacer_at(10_000);
    fill_video(&mut pacer, 5, 500, ts_ms(0));
    let outcome = pacer.tick(ts_ms(5));
    let seqs: Vec<u16> = outcome.packets.iter().map(|p| p.sequence).collect();
    for pair in seqs.windows(2) {
        assert_eq!(pair[1], pair[0].wrapping_add(1));
    }
}

#[test]
fn test_budget_does_not_accumulate_past_cap() {
    let mut pacer = pacer_at(800);
    // Prime the tick clock, then go silent for 3 seconds.
    pacer.tick(ts_ms(0));
    fill_video(&mut pacer, 400, 1200, ts_ms(3_000));

    // The gap credits at most 500 ms of rate: 50 kB at 800 kbps.
    let outcome = pacer.tick(ts_ms(3_000));
    let burst: i64 = outcome.packets.iter().map(|p| p.size.bytes()).sum();
    assert!(
        burst <= 51_200,
        "burst of {burst} bytes exceeds 500 ms of budget"
    );
}

#[test]
fn test_zero_rate_pauses_everything_but_audio() {
    let mut pacer = pacer_at(800);
    pacer.set_pacing_rates(DataRate::zero(), DataRate::zero());
    let now = ts_ms(0);
    assert!(pacer.enqueue(PacketKind::Video, 2, DataSize::from_bytes(500), now));
    assert!(pacer.enqueue(PacketKind::Audio, 1, DataSize::from_bytes(80), now));

    let outcome = pacer.tick(ts_ms(5));
    let kinds: Vec<PacketKind> = outcome.packets.iter().map(|p| p.kind).collect();
    assert_eq!(kinds, vec![PacketKind::Audio], "only audio while paused");
    assert_eq!(pacer.queue_len(), 1);
}

#[test]
fn test_padding_fills_idle_budget() {
    let mut pacer = Pacer::new(
        DataRate::from_kbps(1000),
        DataRate::from_kbps(160),
        TimeDelta::from_millis(2000),
    );
    let sent = run_ticks(&mut pacer, 0, 1000);
    // 160 kbps of padding over 1 s is 20 kB.
    assert!(
        (15_000..=25_000).contains(&sent),
        "padding filled {sent} bytes"
    );
    assert!(sent > 0);
}

#[test]
fn test_padding_packets_are_at_least_fifty_bytes() {
    let mut pacer = Pacer::new(
        DataRate::from_kbps(1000),
        DataRate::from_kbps(56),
        TimeDelta::from_millis(2000),
    );
    let mut t = 0;
    loop {
        let outcome = pacer.tick(ts_ms(t));
        if let Some(packet) = outcome.packets.first() {
            assert_eq!(packet.kind, PacketKind::Padding);
            assert!(packet.size >= DataSize::from_bytes(50));
            break;
        }
        t += 5;
        assert!(t < 1000, "padding never emitted");
    }
}

#[test]
fn test_probe_cluster_tags_packets_and_completes() {
    let mut pacer = pacer_at(300);
    pacer.add_probe_cluster(ProbeClusterConfig {
        id: 42,
        target_rate: DataRate::from_kbps(900),
        min_probes: 5,
        min_bytes: DataSize::from_bytes(6000),
    });
    fill_video(&mut pacer, 50, 1200, ts_ms(0));

    let mut probe_packets = 0;
    let mut probe_bytes = 0;
    let mut t = 0;
    while t < 500 {
        let outcome = pacer.tick(ts_ms(t));
        for p in &outcome.packets {
            if p.pacing_info.probe_cluster_id == Some(42) {
                probe_packets += 1;
                probe_bytes += p.size.bytes();
            }
        }
        t += 5;
    }
    assert!(
        probe_packets >= 5 || probe_bytes >= 6000,
        "cluster finished with {probe_packets} packets / {probe_bytes} bytes"
    );
    // After completion the tag disappears.
    fill_video(&mut pacer, 1, 1200, ts_ms(600));
    let outcome = pacer.tick(ts_ms(600));
    assert!(outcome
        .packets
        .iter()
        .all(|p| p.pacing_info.probe_cluster_id.is_none()));
}

#[test]
fn test_probe_cluster_rate_exceeds_pacing_rate() {
    // Pacing at 300 kbps, probing at 1200 kbps: the probe must push more
    // than the plain budget would.
    let mut with_probe = pacer_at(300);
    with_probe.add_probe_cluster(ProbeClusterConfig {
        id: 1,
        target_rate: DataRate::from_kbps(1200),
        min_probes: 100,
        min_bytes: DataSize::from_bytes(150_000),
    });
    fill_video(&mut with_probe, 500, 1200, ts_ms(0));
    let probed = run_ticks(&mut with_probe, 0, 500);

    let mut plain = pacer_at(300);
    fill_video(&mut plain, 500, 1200, ts_ms(0));
    let paced = run_ticks(&mut plain, 0, 500);

    assert!(
        probed > paced * 2,
        "probe egress {probed} not above paced egress {paced}"
    );
}

#[test]
fn test_queue_overflow_rejects_packet() {
    let mut pacer = pacer_at(300);
    let now = ts_ms(0);
    let mut accepted = 0;
    for _ in 0..20_000 {
        if pacer.enqueue(PacketKind::Video, 2, DataSize::from_bytes(100), now) {
            accepted += 1;
        }
    }
    assert_eq!(accepted, 10_000, "default queue bound");
    assert!(!pacer.enqueue(PacketKind::Video, 2, DataSize::from_bytes(100), now));
}

#[test]
fn test_stalled_queue_is_flushed_except_audio() {
    let mut pacer = Pacer::new(
        DataRate::from_kbps(100),
        DataRate::zero(),
        TimeDelta::from_millis(2000),
    );
    fill_video(&mut pacer, 100, 1200, ts_ms(0));

    // At 100 kbps the backlog cannot drain before the limit.
    pacer.tick(ts_ms(0));
    assert!(pacer.queue_len() > 90);

    // Fresh audio right before the stall trips.
    assert!(pacer.enqueue(PacketKind::Audio, 1, DataSize::from_bytes(80), ts_ms(2_400)));
    let outcome = pacer.tick(ts_ms(2_500));
    assert!(outcome.stalled, "stall must be reported");
    // Video is flushed; the audio packet goes out instead of being dropped.
    assert_eq!(outcome.packets.len(), 1);
    assert_eq!(outcome.packets[0].kind, PacketKind::Audio);
    assert_eq!(pacer.queue_len(), 0);
    let outcome = pacer.tick(ts_ms(2_505));
    assert!(!outcome.stalled, "flush clears the stall");
}

#[test]
fn test_congestion_window_admits_only_what_fits() {
    let mut pacer = pacer_at(10_000);
    pacer.set_congestion_window(Some(DataSize::from_bytes(1000)));
    pacer.set_outstanding_data(DataSize::from_bytes(900));
    let now = ts_ms(0);
    assert!(pacer.enqueue(PacketKind::Video, 2, DataSize::from_bytes(500), now));
    assert!(pacer.enqueue(PacketKind::Audio, 1, DataSize::from_bytes(80), now));

    let outcome = pacer.tick(ts_ms(5));
    let kinds: Vec<PacketKind> = outcome.packets.iter().map(|p| p.kind).collect();
    // The 80 byte audio fits under the cap (980 <= 1000); the 500 byte
    // video behind it would overshoot and is held back.
    assert_eq!(kinds, vec![PacketKind::Audio]);

    // Feedback freed the window.
    pacer.set_outstanding_data(DataSize::zero());
    let outcome = pacer.tick(ts_ms(10));
    assert_eq!(outcome.packets.len(), 1);
    assert_eq!(outcome.packets[0].kind, PacketKind::Video);
}

#[test]
fn test_congestion_window_blocks_over_cap_audio() {
    let mut pacer = pacer_at(10_000);
    pacer.set_congestion_window(Some(DataSize::from_bytes(1000)));
    pacer.set_outstanding_data(DataSize::from_bytes(900));
    // 500 bytes of audio would push outstanding to 1400, past the cap;
    // no kind is exempt from admission.
    assert!(pacer.enqueue(PacketKind::Audio, 1, DataSize::from_bytes(500), ts_ms(0)));

    let outcome = pacer.tick(ts_ms(5));
    assert!(
        outcome.packets.is_empty(),
        "over-cap audio must wait for feedback to clear bytes"
    );

    pacer.set_outstanding_data(DataSize::from_bytes(400));
    let outcome = pacer.tick(ts_ms(10));
    assert_eq!(outcome.packets.len(), 1);
    assert_eq!(outcome.packets[0].kind, PacketKind::Audio);
}

#[test]
fn test_audio_is_paced_by_the_budget_when_not_paused() {
    // 160 kbps: one 5 ms tick refills 100 bytes of budget.
    let mut pacer = pacer_at(160);
    let now = ts_ms(0);
    for _ in 0..20 {
        assert!(pacer.enqueue(PacketKind::Audio, 1, DataSize::from_bytes(500), now));
    }
    let outcome = pacer.tick(ts_ms(5));
    assert_eq!(outcome.packets.len(), 1, "budget admits one packet per tick");
    let outcome = pacer.tick(ts_ms(10));
    assert!(
        outcome.packets.is_empty(),
        "audio must wait for the budget to go positive again"
    );
}

#[test]
fn test_expected_queue_time_tracks_backlog() {
    let mut pacer = pacer_at(800);
    assert_eq!(pacer.expected_queue_time(), TimeDelta::zero());
    fill_video(&mut pacer, 10, 1000, ts_ms(0));
    // 10 kB at 800 kbps: 100 ms.
    assert_eq!(pacer.expected_queue_time().millis(), 100);
}

#[test]
fn test_first_and_last_send_times_are_tracked() {
    let mut pacer = pacer_at(10_000);
    assert!(pacer.first_sent_packet_time().is_none());
    fill_video(&mut pacer, 2, 500, ts_ms(0));
    pacer.tick(ts_ms(5));
    assert_eq!(pacer.first_sent_packet_time(), Some(ts_ms(5)));
    fill_video(&mut pacer, 1, 500, ts_ms(100));
    pacer.tick(ts_ms(100));
    assert_eq!(pacer.first_sent_packet_time(), Some(ts_ms(5)));
    assert_eq!(pacer.last_send_time(), Some(ts_ms(100)));
}
