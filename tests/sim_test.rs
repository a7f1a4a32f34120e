use std::sync::{Arc, Mutex};

use sendside::sim::{
    NetworkConfig, NetworkEmulator, PacketInFlight, PulsedPeaksConfig, PulsedPeaksCrossTraffic,
    RandomWalkConfig, RandomWalkCrossTraffic, SimulatedNetwork,
};
use sendside::{DataRate, DataSize, TimeDelta, Timestamp};

fn ts_ms(ms: i64) -> Timestamp {
    Timestamp::from_millis(ms)
}

fn packet(id: u64, bytes: i64, send_ms: i64) -> PacketInFlight {
    PacketInFlight {
        id,
        size: DataSize::from_bytes(bytes),
        send_time: ts_ms(send_ms),
    }
}

#[test]
fn test_infinite_capacity_delivers_after_fixed_delay() {
    let mut net = SimulatedNetwork::new(
        NetworkConfig {
            queue_delay: TimeDelta::from_millis(100),
            ..Default::default()
        },
        1,
    );
    assert!(net.enqueue(packet(1, 1000, 0)));

    assert!(net.dequeue_deliverable(ts_ms(99)).is_empty());
    let delivered = net.dequeue_deliverable(ts_ms(100));
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].arrival_time, Some(ts_ms(100)));
}

#[test]
fn test_capacity_queue_serializes_packets() {
    // 800 kbps: a 1000 byte packet takes 10 ms to serialize.
    let mut net = SimulatedNetwork::new(
        NetworkConfig {
            link_capacity: DataRate::from_kbps(800),
            ..Default::default()
        },
        1,
    );
    for i in 0..3 {
        assert!(net.enqueue(packet(i, 1000, 0)));
    }
    let delivered = net.dequeue_deliverable(ts_ms(50));
    assert_eq!(delivered.len(), 3);
    assert_eq!(delivered[0].arrival_time, Some(ts_ms(10)));
    assert_eq!(delivered[1].arrival_time, Some(ts_ms(20)));
    assert_eq!(delivered[2].arrival_time, Some(ts_ms(30)));
}

#[test]
fn test_no_packet_exits_before_send_time() {
    let mut net = SimulatedNetwork::new(
        NetworkConfig {
            link_capacity: DataRate::from_kbps(10_000),
            ..Default::default()
        },
        7,
    );
    for i in 0..20 {
        assert!(net.enqueue(packet(i, 500, i as i64 * 3)));
    }
    for delivered in net.dequeue_deliverable(ts_ms(10_000)) {
        let arrival = delivered.arrival_time.expect("no loss configured");
        assert!(arrival >= delivered.packet.send_time);
    }
}

#[test]
fn test_queue_length_drops_excess_packets() {
    let mut net = SimulatedNetwork::new(
        NetworkConfig {
            link_capacity: DataRate::from_kbps(8),
            queue_length_packets: 3,
            ..Default::default()
        },
        1,
    );
    assert!(net.enqueue(packet(1, 1000, 0)));
    assert!(net.enqueue(packet(2, 1000, 0)));
    assert!(net.enqueue(packet(3, 1000, 0)));
    assert!(!net.enqueue(packet(4, 1000, 0)), "queue is full");
}

#[test]
fn test_uniform_loss_rate_is_respected() {
    let mut net = SimulatedNetwork::new(
        NetworkConfig {
            loss_percent: 10.0,
            ..Default::default()
        },
        1234,
    );
    let total = 5000;
    for i in 0..total {
        assert!(net.enqueue(packet(i, 100, i as i64)));
    }
    let delivered = net.dequeue_deliverable(ts_ms(100_000));
    assert_eq!(delivered.len(), total as usize);
    let lost = delivered.iter().filter(|d| d.arrival_time.is_none()).count();
    let loss_rate = lost as f64 / total as f64;
    assert!(
        (0.07..=0.13).contains(&loss_rate),
        "uniform 10% loss measured at {loss_rate}"
    );
}

#[test]
fn test_burst_loss_comes_in_runs() {
    let mut net = SimulatedNetwork::new(
        NetworkConfig {
            loss_percent: 10.0,
            avg_burst_loss_length: 4,
            ..Default::default()
        },
        99,
    );
    let total = 5000;
    for i in 0..total {
        assert!(net.enqueue(packet(i, 100, i as i64)));
    }
    let delivered = net.dequeue_deliverable(ts_ms(100_000));
    let lost = delivered.iter().filter(|d| d.arrival_time.is_none()).count();
    let loss_rate = lost as f64 / total as f64;
    assert!(
        (0.05..=0.16).contains(&loss_rate),
        "burst 10% loss measured at {loss_rate}"
    );

    // Measure the mean run length of consecutive losses; it should be well
    // above 1 (the uniform value).
    let mut runs = Vec::new();
    let mut current = 0usize;
    for d in &delivered {
        if d.arrival_time.is_none() {
            current += 1;
        } else if current > 0 {
            runs.push(current);
            current = 0;
        }
    }
    if current > 0 {
        runs.push(current);
    }
    let mean_run = runs.iter().sum::<usize>() as f64 / runs.len() as f64;
    assert!(mean_run > 2.0, "mean burst length {mean_run} too short");
}

#[test]
fn test_arrivals_are_monotonic_without_reordering() {
    let mut net = SimulatedNetwork::new(
        NetworkConfig {
            link_capacity: DataRate::from_kbps(5000),
            queue_delay: TimeDelta::from_millis(50),
            delay_std_dev: TimeDelta::from_millis(20),
            allow_reordering: false,
            ..Default::default()
        },
        42,
    );
    for i in 0..500 {
        assert!(net.enqueue(packet(i, 500, i as i64)));
    }
    let delivered = net.dequeue_deliverable(ts_ms(60_000));
    let arrivals: Vec<Timestamp> = delivered.iter().filter_map(|d| d.arrival_time).collect();
    assert!(arrivals.len() > 400);
    for pair in arrivals.windows(2) {
        assert!(pair[0] <= pair[1], "arrival order violated");
    }
}

#[test]
fn test_reordering_allowed_preserves_arrival_sort_on_dequeue() {
    let mut net = SimulatedNetwork::new(
        NetworkConfig {
            link_capacity: DataRate::from_kbps(5000),
            queue_delay: TimeDelta::from_millis(50),
            delay_std_dev: TimeDelta::from_millis(20),
            allow_reordering: true,
            ..Default::default()
        },
        42,
    );
    for i in 0..500 {
        assert!(net.enqueue(packet(i, 500, i as i64)));
    }
    let delivered = net.dequeue_deliverable(ts_ms(60_000));
    let arrivals: Vec<Timestamp> = delivered.iter().filter_map(|d| d.arrival_time).collect();
    // Dequeue order is arrival order even when ids got shuffled.
    for pair in arrivals.windows(2) {
        assert!(pair[0] <= pair[1]);
    }
    let ids: Vec<u64> = delivered.iter().map(|d| d.packet.id).collect();
    let mut sorted = ids.clone();
    sorted.sort_unstable();
    assert_ne!(ids, sorted, "jitter this large should reorder some packets");
}

#[test]
fn test_pause_shifts_arrivals_forward() {
    let mut net = SimulatedNetwork::new(NetworkConfig::default(), 1);
    net.pause_transmission_until(ts_ms(500));
    assert!(net.enqueue(packet(1, 100, 0)));
    let delivered = net.dequeue_deliverable(ts_ms(1_000));
    assert_eq!(delivered[0].arrival_time, Some(ts_ms(500)));
}

#[test]
fn test_emulator_routes_packet_to_endpoint() {
    let mut emulator = NetworkEmulator::new();
    let node = emulator.add_node(
        NetworkConfig {
            queue_delay: TimeDelta::from_millis(20),
            ..Default::default()
        },
        1,
    );
    let destination = emulator.add_endpoint(0x0a00_0001);
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    let port = emulator.endpoint_mut(destination).bind_receiver(
        None,
        Box::new(move |packet| sink.lock().unwrap().push(packet)),
    );
    let route = emulator.add_route(vec![node], destination);

    let from = sendside::sim::EndpointAddr { ip: 0x0a00_0002, port: 1000 };
    let to = sendside::sim::EndpointAddr { ip: 0x0a00_0001, port };
    emulator
        .send(route, from, to, DataSize::from_bytes(500), ts_ms(0))
        .expect("accepted");

    emulator.process(ts_ms(10));
    assert!(received.lock().unwrap().is_empty());
    emulator.process(ts_ms(20));
    let received = received.lock().unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].arrival_time, ts_ms(20));
    assert_eq!(received[0].size, DataSize::from_bytes(500));
}

#[test]
fn test_multi_hop_route_accumulates_delay() {
    let mut emulator = NetworkEmulator::new();
    let hop = |emulator: &mut NetworkEmulator, ms: i64, seed: u64| {
        emulator.add_node(
            NetworkConfig {
                queue_delay: TimeDelta::from_millis(ms),
                ..Default::default()
            },
            seed,
        )
    };
    let a = hop(&mut emulator, 30, 1);
    let b = hop(&mut emulator, 40, 2);
    let destination = emulator.add_endpoint(1);
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    let port = emulator
        .endpoint_mut(destination)
        .bind_receiver(None, Box::new(move |p| sink.lock().unwrap().push(p)));
    let route = emulator.add_route(vec![a, b], destination);

    let addr = |ip, port| sendside::sim::EndpointAddr { ip, port };
    emulator
        .send(route, addr(2, 1), addr(1, port), DataSize::from_bytes(200), ts_ms(0))
        .unwrap();

    // Drive with a 5 ms cadence like the network queue would.
    let mut t = 0;
    while t <= 200 {
        emulator.process(ts_ms(t));
        t += 5;
    }
    let received = received.lock().unwrap();
    assert_eq!(received.len(), 1);
    // 30 ms + 40 ms, plus up to one process quantum between hops.
    let arrival = received[0].arrival_time;
    assert!(arrival >= ts_ms(70) && arrival <= ts_ms(80), "arrival {arrival}");
}

#[test]
fn test_removed_route_drops_in_flight_packets() {
    let mut emulator = NetworkEmulator::new();
    let node = emulator.add_node(
        NetworkConfig {
            queue_delay: TimeDelta::from_millis(50),
            ..Default::default()
        },
        1,
    );
    let destination = emulator.add_endpoint(1);
    let received = Arc::new(Mutex::new(0u32));
    let sink = Arc::clone(&received);
    let port = emulator
        .endpoint_mut(destination)
        .bind_receiver(None, Box::new(move |_| *sink.lock().unwrap() += 1));
    let route = emulator.add_route(vec![node], destination);

    let addr = |ip, port| sendside::sim::EndpointAddr { ip, port };
    emulator
        .send(route, addr(2, 1), addr(1, port), DataSize::from_bytes(200), ts_ms(0))
        .unwrap();
    emulator.remove_route(route);

    let mut t = 0;
    while t <= 200 {
        emulator.process(ts_ms(t));
        t += 5;
    }
    assert_eq!(*received.lock().unwrap(), 0, "removed route must drop packets");
}

#[test]
fn test_random_walk_cross_traffic_stays_within_peak() {
    let mut traffic = RandomWalkCrossTraffic::new(RandomWalkConfig {
        peak_rate: DataRate::from_kbps(1000),
        ..Default::default()
    });
    let mut sent = DataSize::zero();
    let mut t = 0;
    while t < 10_000 {
        if let Some(size) = traffic.process(ts_ms(t)) {
            sent += size;
        }
        assert!(traffic.traffic_rate() <= DataRate::from_kbps(1000));
        t += 5;
    }
    // Average rate over 10 s can never exceed the peak.
    let avg = sent / TimeDelta::from_seconds(10);
    assert!(avg <= DataRate::from_kbps(1000), "average {avg}");
}

#[test]
fn test_pulsed_peaks_alternate_between_peak_and_silence() {
    let config = PulsedPeaksConfig {
        peak_rate: DataRate::from_kbps(1000),
        send_duration: TimeDelta::from_millis(500),
        hold_duration: TimeDelta::from_millis(250),
        ..Default::default()
    };
    let mut traffic = PulsedPeaksCrossTraffic::new(config);
    let mut saw_sending = false;
    let mut saw_idle = false;
    let mut sent = DataSize::zero();
    let mut t = 0;
    while t < 10_000 {
        if let Some(size) = traffic.process(ts_ms(t)) {
            sent += size;
        }
        if traffic.traffic_rate() > DataRate::zero() {
            saw_sending = true;
        } else if t > 1_000 {
            saw_idle = true;
        }
        t += 5;
    }
    assert!(saw_sending && saw_idle, "pulse pattern missing a phase");
    // Duty cycle of 500/750 at 1 Mbps over 10 s: about 830 kB.
    let sent_bytes = sent.bytes();
    assert!(
        (600_000..=900_000).contains(&sent_bytes),
        "pulsed traffic sent {sent_bytes} bytes"
    );
}
