use sendside::{DataRate, ProbeController, Timestamp};

fn ts_ms(ms: i64) -> Timestamp {
    Timestamp::from_millis(ms)
}

fn controller(alr: bool) -> ProbeController {
    ProbeController::new(
        DataRate::from_kbps(300),
        DataRate::from_kbps(5000),
        vec![3.0, 6.0],
        alr,
    )
}

#[test]
fn test_initial_probing_uses_configured_multipliers() {
    let mut probe = controller(false);
    let clusters = probe.on_stream_start(ts_ms(0));
    assert_eq!(clusters.len(), 2);
    assert_eq!(clusters[0].target_rate.kbps(), 900);
    assert_eq!(clusters[1].target_rate.kbps(), 1800);
    assert_eq!(clusters[0].min_probes, 5);
    assert!(clusters[0].min_bytes.bytes() >= 6000);
    assert_ne!(clusters[0].id, clusters[1].id);
}

#[test]
fn test_stream_start_fires_only_once() {
    let mut probe = controller(false);
    assert_eq!(probe.on_stream_start(ts_ms(0)).len(), 2);
    assert!(probe.on_stream_start(ts_ms(100)).is_empty());
}

#[test]
fn test_initial_rates_capped_at_max() {
    let mut probe = ProbeController::new(
        DataRate::from_kbps(300),
        DataRate::from_kbps(1000),
        vec![3.0, 6.0],
        false,
    );
    let clusters = probe.on_stream_start(ts_ms(0));
    assert_eq!(clusters[0].target_rate.kbps(), 900);
    assert_eq!(clusters[1].target_rate.kbps(), 1000, "capped at max");
}

#[test]
fn test_successful_probe_triggers_exponential_continuation() {
    let mut probe = controller(false);
    probe.on_stream_start(ts_ms(0));

    // The estimate reaches most of the probed 1800 kbps.
    let next = probe.set_estimate(DataRate::from_kbps(1500), ts_ms(200));
    assert_eq!(next.len(), 1);
    assert_eq!(next[0].target_rate.kbps(), 3000, "2x the new estimate");
}

#[test]
fn test_unreached_probe_target_stops_probing() {
    let mut probe = controller(false);
    probe.on_stream_start(ts_ms(0));

    // Far below 70% of the 1800 kbps probe target.
    let next = probe.set_estimate(DataRate::from_kbps(500), ts_ms(200));
    assert!(next.is_empty());
    // Later estimates do not spontaneously re-probe either.
    assert!(probe.set_estimate(DataRate::from_kbps(600), ts_ms(400)).is_empty());
    // Even once the pending probe times out.
    assert!(probe.process(ts_ms(1_500)).is_empty());
    assert!(probe.set_estimate(DataRate::from_kbps(600), ts_ms(1_600)).is_empty());
}

#[test]
fn test_probing_stops_at_max_bitrate() {
    let mut probe = ProbeController::new(
        DataRate::from_kbps(300),
        DataRate::from_kbps(1500),
        vec![3.0, 6.0],
        false,
    );
    probe.on_stream_start(ts_ms(0));
    let next = probe.set_estimate(DataRate::from_kbps(1500), ts_ms(200));
    assert!(next.is_empty(), "no headroom left above max");
}

#[test]
fn test_raised_max_bitrate_triggers_probe() {
    let mut probe = ProbeController::new(
        DataRate::from_kbps(300),
        DataRate::from_kbps(1000),
        vec![3.0],
        false,
    );
    probe.on_stream_start(ts_ms(0));
    // Saturated: the initial probe never confirms and times out.
    assert!(probe.set_estimate(DataRate::from_kbps(400), ts_ms(100)).is_empty());
    assert!(probe.process(ts_ms(1_200)).is_empty());

    let clusters = probe.on_max_bitrate_changed(DataRate::from_kbps(3000), ts_ms(1_300));
    assert_eq!(clusters.len(), 1);
    assert_eq!(clusters[0].target_rate.kbps(), 800, "2x estimate under new max");
}

#[test]
fn test_lowered_max_does_not_probe() {
    let mut probe = controller(false);
    probe.on_stream_start(ts_ms(0));
    assert!(probe
        .on_max_bitrate_changed(DataRate::from_kbps(400), ts_ms(100))
        .is_empty());
}

#[test]
fn test_alr_probing_after_long_quiet_period() {
    let mut probe = controller(true);
    probe.on_stream_start(ts_ms(0));
    probe.set_estimate(DataRate::from_kbps(500), ts_ms(100));

    probe.set_alr_start_time(Some(ts_ms(1_000)));
    // Too early: ALR has lasted only 5 s.
    assert!(probe.process(ts_ms(6_000)).is_empty());
    // 10 s in ALR and no recent probe: fire.
    let clusters = probe.process(ts_ms(11_500));
    assert_eq!(clusters.len(), 1);
    assert_eq!(clusters[0].target_rate.kbps(), 1000);
}

#[test]
fn test_alr_probing_disabled_by_config() {
    let mut probe = controller(false);
    probe.on_stream_start(ts_ms(0));
    probe.set_estimate(DataRate::from_kbps(500), ts_ms(100));
    probe.set_alr_start_time(Some(ts_ms(200)));
    assert!(probe.process(ts_ms(60_000)).is_empty());
}

#[test]
fn test_request_probe_is_rate_limited() {
    let mut probe = controller(false);
    probe.on_stream_start(ts_ms(0));
    probe.set_estimate(DataRate::from_kbps(500), ts_ms(100));
    // Expire the unconfirmed initial probe.
    probe.process(ts_ms(1_500));

    let first = probe.request_probe(ts_ms(5_000));
    assert_eq!(first.len(), 1);
    assert!(probe.request_probe(ts_ms(5_200)).is_empty(), "too soon");
    // The requested probe never confirms; expire it, then re-request.
    probe.process(ts_ms(6_400));
    assert_eq!(probe.request_probe(ts_ms(6_500)).len(), 1);
}

#[test]
fn test_recovery_probe_aims_at_pre_drop_rate() {
    let mut probe = controller(false);
    probe.on_stream_start(ts_ms(0));
    probe.set_estimate(DataRate::from_kbps(1500), ts_ms(100));
    // A large drop: 1500 -> 400 kbps. The continuation probe times out.
    probe.set_estimate(DataRate::from_kbps(400), ts_ms(200));
    probe.process(ts_ms(1_500));

    let clusters = probe.request_probe(ts_ms(2_000));
    assert_eq!(clusters.len(), 1);
    // 0.85 * 1500 beats 2 * 400.
    assert_eq!(clusters[0].target_rate.kbps(), 1275);
}

#[test]
fn test_periodic_probe_fires_when_not_in_alr() {
    let mut probe = controller(false);
    probe.on_stream_start(ts_ms(0));
    // Probing completes below max.
    probe.set_estimate(DataRate::from_kbps(500), ts_ms(100));

    assert!(probe.process(ts_ms(1_000)).is_empty(), "interval not reached");
    let clusters = probe.process(ts_ms(2_500));
    assert_eq!(clusters.len(), 1);
    assert_eq!(clusters[0].target_rate.kbps(), 1000);
    // Pending again: quiet while the result is awaited.
    assert!(probe.process(ts_ms(3_000)).is_empty());
}

#[test]
fn test_cluster_ids_are_unique_across_triggers() {
    let mut probe = controller(true);
    let mut ids = Vec::new();
    for c in probe.on_stream_start(ts_ms(0)) {
        ids.push(c.id);
    }
    for c in probe.set_estimate(DataRate::from_kbps(1500), ts_ms(200)) {
        ids.push(c.id);
    }
    probe.set_alr_start_time(Some(ts_ms(1_000)));
    for c in probe.process(ts_ms(20_000)) {
        ids.push(c.id);
    }
    let mut deduped = ids.clone();
    deduped.sort_unstable();
    deduped.dedup();
    assert_eq!(deduped.len(), ids.len(), "duplicate cluster id in {ids:?}");
}
