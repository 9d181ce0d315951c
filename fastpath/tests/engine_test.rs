use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::unbounded;
use fastpath::config::BindMode;
use fastpath::test_util::{CLIENT_IP, SERVICE_IP, tcp_frame, udp_frame};
use fastpath::xsk::MemoryTransportFactory;
use fastpath::{Binding, EngineConfig, Error, RxAction, ZeroCopyEngine};

const FRAME_COUNT: u32 = 64;
const WAIT: Duration = Duration::from_secs(5);

fn small_config() -> EngineConfig {
    EngineConfig::default()
        .with_frame_count(FRAME_COUNT)
        .with_ring_size(32)
        .with_batch_size(16)
        .with_hugepages(false)
}

fn engine(factory: &MemoryTransportFactory, config: EngineConfig) -> ZeroCopyEngine {
    ZeroCopyEngine::new(Binding::new("eth0", 0), config, factory).expect("Failed to bind engine")
}

/// Poll `cond` until it holds or `WAIT` runs out.
fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

#[test]
fn test_received_frames_reach_handler() {
    let _ = tracing_subscriber::fmt::try_init();

    let factory = MemoryTransportFactory::with_interfaces(["eth0"]);
    let wire = factory.wire("eth0", 0);
    let engine = engine(&factory, small_config());

    let (seen_tx, seen_rx) = unbounded();
    engine
        .start(move |packet: &mut [u8]| {
            let _ = seen_tx.send(packet.len());
            RxAction::Drop
        })
        .expect("Failed to start engine");
    assert!(engine.is_running());

    let frame = udp_frame(CLIENT_IP, 5000, SERVICE_IP, 53, b"query");
    for _ in 0..5 {
        assert!(wire.inject(frame.clone()));
    }
    for _ in 0..5 {
        let len = seen_rx.recv_timeout(WAIT).expect("Handler never saw frame");
        assert_eq!(len, frame.len());
    }

    let stats = engine.stats();
    assert_eq!(stats.interface, "eth0");
    assert_eq!(stats.rx_packets, 5);
    assert_eq!(stats.rx_bytes, 5 * frame.len() as u64);
    assert_eq!(stats.rx_dropped, 5);
    assert!(wire.try_recv_transmitted().is_none());

    engine.stop();
}

#[test]
fn test_transmit_reflects_rewritten_frame() {
    let _ = tracing_subscriber::fmt::try_init();

    let factory = MemoryTransportFactory::with_interfaces(["eth0"]);
    let wire = factory.wire("eth0", 0);
    let engine = engine(&factory, small_config());

    // Swap MAC addresses and bounce the frame
    engine
        .start(|packet: &mut [u8]| {
            let (dst, rest) = packet.split_at_mut(6);
            dst.swap_with_slice(&mut rest[..6]);
            RxAction::Transmit
        })
        .expect("Failed to start engine");

    let frame = tcp_frame(CLIENT_IP, 40000, SERVICE_IP, 80, b"GET /");
    assert!(wire.inject(frame.clone()));

    let reply = wire
        .recv_transmitted(WAIT)
        .expect("No frame transmitted");
    assert_eq!(reply.len(), frame.len());
    assert_eq!(&reply[..6], &frame[6..12]);
    assert_eq!(&reply[6..12], &frame[..6]);
    assert_eq!(&reply[12..], &frame[12..]);

    assert!(wait_for(|| engine.stats().completed == 1));
    assert_eq!(engine.stats().tx_packets, 1);

    engine.stop();
}

#[test]
fn test_send_packet_until_exhausted() {
    let _ = tracing_subscriber::fmt::try_init();

    let factory = MemoryTransportFactory::with_interfaces(["eth0"]);
    let wire = factory.wire("eth0", 0);
    let config = EngineConfig::default()
        .with_frame_count(4)
        .with_ring_size(4)
        .with_hugepages(false);
    let engine = engine(&factory, config);

    // Never started: completions are not reclaimed, so every send holds a frame
    let frame = udp_frame(CLIENT_IP, 5000, SERVICE_IP, 53, b"x");
    for _ in 0..4 {
        engine.send_packet(&frame).expect("Send failed");
    }
    assert_eq!(engine.free_frames(), Some(0));
    assert!(matches!(engine.send_packet(&frame), Err(Error::Exhausted)));

    for _ in 0..4 {
        assert_eq!(wire.recv_transmitted(WAIT).as_deref(), Some(&frame[..]));
    }

    let stats = engine.stats();
    assert_eq!(stats.tx_packets, 4);
    assert_eq!(stats.tx_dropped, 1);
}

#[test]
fn test_send_oversized_packet() {
    let factory = MemoryTransportFactory::with_interfaces(["eth0"]);
    let engine = engine(&factory, small_config());

    let packet = vec![0u8; 2049];
    assert!(matches!(
        engine.send_packet(&packet),
        Err(Error::PacketTooLarge {
            len: 2049,
            frame_size: 2048
        })
    ));
    assert_eq!(engine.free_frames(), Some(FRAME_COUNT as usize));
    assert_eq!(engine.stats().tx_invalid, 1);
}

#[test]
fn test_stop_releases_everything() {
    let _ = tracing_subscriber::fmt::try_init();

    let factory = MemoryTransportFactory::with_interfaces(["eth0"]);
    let wire = factory.wire("eth0", 0);
    let engine = engine(&factory, small_config());
    engine
        .start(|_: &mut [u8]| RxAction::Pass)
        .expect("Failed to start engine");

    engine.stop();
    engine.stop();

    assert!(!engine.is_running());
    assert_eq!(engine.free_frames(), None);
    assert!(!engine.stats().running);
    assert!(matches!(engine.send_packet(b"x"), Err(Error::EngineStopped)));
    assert!(matches!(
        engine.start(|_: &mut [u8]| RxAction::Pass),
        Err(Error::EngineStopped)
    ));

    // A closed transport ignores the wire
    wire.inject(vec![0u8; 64]);
    thread::sleep(Duration::from_millis(50));
    assert_eq!(engine.stats().rx_packets, 0);
}

#[test]
fn test_zero_copy_bind_rejected() {
    let factory = MemoryTransportFactory::with_interfaces(["eth0"]);
    let binding = Binding::new("eth0", 0).with_bind_mode(BindMode::ZeroCopy);
    let result = ZeroCopyEngine::new(binding, small_config(), &factory);
    assert!(matches!(result, Err(Error::Resource { .. })));
}

#[test]
fn test_burst_larger_than_batch_drains_without_stalling() {
    let _ = tracing_subscriber::fmt::try_init();

    let factory = MemoryTransportFactory::with_interfaces(["eth0"]);
    let wire = factory.wire("eth0", 0);
    let mut config = small_config().with_batch_size(1);
    config.poll_timeout_ms = 200;
    let engine = engine(&factory, config);

    let frame = udp_frame(CLIENT_IP, 5000, SERVICE_IP, 53, b"burst");
    for _ in 0..8 {
        assert!(wire.inject(frame.clone()));
    }

    let (seen_tx, seen_rx) = unbounded();
    let start = Instant::now();
    engine
        .start(move |_: &mut [u8]| {
            let _ = seen_tx.send(());
            RxAction::Pass
        })
        .expect("Failed to start engine");
    for _ in 0..8 {
        seen_rx.recv_timeout(WAIT).expect("Frame never handled");
    }

    // One batch per readiness timeout would take 7 * 200ms
    let elapsed = start.elapsed();
    assert!(elapsed < Duration::from_millis(600), "took {elapsed:?}");
    engine.stop();
}

#[test]
fn test_repeated_handler_panics_stop_loop() {
    let _ = tracing_subscriber::fmt::try_init();

    let factory = MemoryTransportFactory::with_interfaces(["eth0"]);
    let wire = factory.wire("eth0", 0);
    let (fault_tx, fault_rx) = unbounded();
    let engine = engine(&factory, small_config()).with_fault_reporter(fault_tx);

    // Queued before start so the first poll sees all of them in one batch
    let frame = udp_frame(CLIENT_IP, 5000, SERVICE_IP, 53, b"boom");
    for _ in 0..3 {
        assert!(wire.inject(frame.clone()));
    }

    let calls = Arc::new(AtomicUsize::new(0));
    let handler_calls = Arc::clone(&calls);
    engine
        .start(move |_: &mut [u8]| -> RxAction {
            handler_calls.fetch_add(1, Ordering::SeqCst);
            panic!("handler exploded");
        })
        .expect("Failed to start engine");

    let fault = fault_rx.recv_timeout(WAIT).expect("No fault reported");
    assert_eq!(fault.interface, "eth0");
    assert_eq!(fault.queue_id, 0);
    assert_eq!(fault.consecutive_faults, 3);
    assert!(fault.reason.contains("handler exploded"), "{}", fault.reason);

    assert!(wait_for(|| !engine.is_running()));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(engine.stats().handler_faults, 3);

    engine.stop();
}

#[test]
fn test_single_panic_does_not_stop_loop() {
    let _ = tracing_subscriber::fmt::try_init();

    let factory = MemoryTransportFactory::with_interfaces(["eth0"]);
    let wire = factory.wire("eth0", 0);
    let (fault_tx, fault_rx) = unbounded();
    let engine = engine(&factory, small_config()).with_fault_reporter(fault_tx);

    let (seen_tx, seen_rx) = unbounded();
    engine
        .start(move |packet: &mut [u8]| {
            if packet.ends_with(b"boom") {
                panic!("bad frame");
            }
            let _ = seen_tx.send(());
            RxAction::Pass
        })
        .expect("Failed to start engine");

    assert!(wire.inject(udp_frame(CLIENT_IP, 5000, SERVICE_IP, 53, b"boom")));
    assert!(wait_for(|| engine.stats().handler_faults == 1));

    assert!(wire.inject(udp_frame(CLIENT_IP, 5000, SERVICE_IP, 53, b"fine")));
    seen_rx.recv_timeout(WAIT).expect("Loop stopped after one panic");

    assert!(engine.is_running());
    assert!(fault_rx.try_recv().is_err());
    engine.stop();
}

#[test]
fn test_frames_return_to_pool_under_load() {
    let _ = tracing_subscriber::fmt::try_init();

    let factory = MemoryTransportFactory::with_interfaces(["eth0"]);
    let wire = factory.wire("eth0", 0);
    let engine = engine(&factory, small_config());
    engine
        .start(|_: &mut [u8]| RxAction::Transmit)
        .expect("Failed to start engine");

    const PACKETS: u64 = 200;
    let frame = udp_frame(CLIENT_IP, 5000, SERVICE_IP, 9, &[0xab; 512]);
    let mut received = 0;
    for _ in 0..PACKETS {
        // Pace the injection so the fill ring never runs dry
        while !wire.inject(frame.clone()) {
            thread::yield_now();
        }
        if wire.recv_transmitted(WAIT).is_some() {
            received += 1;
        }
    }
    assert_eq!(received, PACKETS);

    assert!(wait_for(|| engine.stats().completed == PACKETS));
    // Once idle, every frame is either free or posted on the fill ring
    assert!(wait_for(|| {
        let stats = engine.stats();
        stats.free_frames + stats.fill_posted == FRAME_COUNT as usize
    }));
    let stats = engine.stats();
    assert!(stats.fill_posted > 0);
    assert!(stats.fill_posted <= small_config().fill_target() as usize);

    assert_eq!(stats.rx_packets, PACKETS);
    assert_eq!(stats.tx_packets, PACKETS);
    assert_eq!(stats.rx_invalid, 0);
    engine.stop();
}
