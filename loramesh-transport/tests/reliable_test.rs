use std::time::{Duration, Instant};

use loramesh_transport::error::TransportError;
use loramesh_transport::frame::MessageId;
use loramesh_transport::reliable::{
    BreakerPhase, DeliveryConfig, DeliveryEvent, DeliveryManager, Reliability, RetryPolicy,
};
use loramesh_wire::crypto::NodeId;
use rand::SeedableRng;

fn manager(config: DeliveryConfig) -> DeliveryManager {
    let mut rng = rand::rngs::StdRng::seed_from_u64(1);
    DeliveryManager::new(config, &mut rng).unwrap()
}

fn msg(byte: u8) -> MessageId {
    MessageId([byte; 16])
}

fn peer(byte: u8) -> NodeId {
    NodeId([byte; 32])
}

#[test]
fn ack_confirms_delivery() {
    let mut dm = manager(DeliveryConfig::default());
    let now = Instant::now();
    dm.track(msg(1), peer(1), b"payload".to_vec(), Reliability::Reliable, now)
        .unwrap();
    assert!(dm.is_tracking(&msg(1)));

    assert!(dm.on_ack(&msg(1), &peer(1)));
    assert!(!dm.is_tracking(&msg(1)));
    let events = dm.drain_events();
    assert!(matches!(
        events[0],
        DeliveryEvent::Delivered { message_id, attempts: 0, .. } if message_id == msg(1)
    ));
    // Duplicate ACKs are harmless.
    assert!(!dm.on_ack(&msg(1), &peer(1)));
}

#[test]
fn ack_from_wrong_peer_is_ignored() {
    let mut dm = manager(DeliveryConfig::default());
    let now = Instant::now();
    dm.track(msg(1), peer(1), Vec::new(), Reliability::Reliable, now)
        .unwrap();
    assert!(!dm.on_ack(&msg(1), &peer(2)));
    assert!(dm.is_tracking(&msg(1)));
}

#[test]
fn retry_delays_are_non_decreasing_up_to_cap() {
    let policy = RetryPolicy {
        jitter: Duration::ZERO,
        ..RetryPolicy::default()
    };
    let mut dm = manager(DeliveryConfig {
        policy: policy.clone(),
        ack_timeout: Duration::from_secs(1),
        ..DeliveryConfig::default()
    });
    let start = Instant::now();
    dm.track(msg(1), peer(1), b"x".to_vec(), Reliability::Guaranteed, start)
        .unwrap();

    // Drive the retry path and capture inter-retry gaps.
    let mut now = start;
    let mut retry_times = Vec::new();
    for _ in 0..2000 {
        now += Duration::from_millis(250);
        for directive in dm.poll(now, 0) {
            assert_eq!(directive.target, peer(1));
            retry_times.push(now);
        }
        if retry_times.len() >= 6 {
            break;
        }
    }
    assert!(retry_times.len() >= 6, "expected repeated retries");

    let gaps: Vec<Duration> = retry_times.windows(2).map(|w| w[1] - w[0]).collect();
    for pair in gaps.windows(2) {
        // Non-decreasing within poll quantization.
        assert!(pair[1] + Duration::from_millis(250) >= pair[0]);
    }
    // And capped at the policy maximum (plus quantization).
    assert!(gaps.iter().all(|g| *g <= policy.max + Duration::from_millis(500)));
}

#[test]
fn exhausted_retries_fail_to_dead_letter_queue() {
    let mut dm = manager(DeliveryConfig {
        policy: RetryPolicy {
            max_attempts: 2,
            jitter: Duration::ZERO,
            ..RetryPolicy::default()
        },
        ack_timeout: Duration::from_secs(1),
        ..DeliveryConfig::default()
    });
    let start = Instant::now();
    dm.track(msg(9), peer(3), b"important".to_vec(), Reliability::Reliable, start)
        .unwrap();

    let mut now = start;
    for _ in 0..20 {
        now += Duration::from_secs(60);
        dm.poll(now, 1_700_000_000_000);
        if !dm.is_tracking(&msg(9)) {
            break;
        }
    }

    assert!(!dm.is_tracking(&msg(9)));
    let events = dm.drain_events();
    assert!(events.iter().any(|e| matches!(
        e,
        DeliveryEvent::Failed { message_id, reason: TransportError::MaxRetriesExceeded, .. }
            if *message_id == msg(9)
    )));

    let parked: Vec<_> = dm.dead_letters().collect();
    assert_eq!(parked.len(), 1);
    assert_eq!(parked[0].payload, b"important");
    assert_eq!(parked[0].failed_unix_ms, 1_700_000_000_000);

    // Manual retry pulls it back out.
    let retried = dm.retry_dead_letter(&msg(9)).unwrap();
    assert_eq!(retried.payload, b"important");
    assert_eq!(dm.dead_letters().count(), 0);
}

#[test]
fn circuit_breaker_opens_after_consecutive_failures() {
    let mut dm = manager(DeliveryConfig::default());
    let now = Instant::now();
    let target = peer(7);

    for _ in 0..3 {
        dm.on_send_failure(&target, now);
    }
    assert_eq!(dm.breaker_phase(&target), BreakerPhase::Open);

    // Fourth attempt fails fast without touching the radio.
    let result = dm.track(msg(4), target, Vec::new(), Reliability::Reliable, now);
    assert_eq!(result.unwrap_err(), TransportError::CircuitBreakerOpen);
    assert_eq!(dm.stats().breaker_rejections, 1);

    // After the cool-down a single probe is allowed through.
    let after_cooldown = now + Duration::from_secs(31);
    dm.track(msg(5), target, Vec::new(), Reliability::Reliable, after_cooldown)
        .unwrap();
    assert_eq!(dm.breaker_phase(&target), BreakerPhase::HalfOpen);
    // A second concurrent send is still rejected while the probe is out.
    assert_eq!(
        dm.track(msg(6), target, Vec::new(), Reliability::Reliable, after_cooldown)
            .unwrap_err(),
        TransportError::CircuitBreakerOpen
    );

    // Probe succeeds: breaker closes.
    assert!(dm.on_ack(&msg(5), &target));
    assert_eq!(dm.breaker_phase(&target), BreakerPhase::Closed);
    dm.track(msg(6), target, Vec::new(), Reliability::Reliable, after_cooldown)
        .unwrap();
}

#[test]
fn failed_probe_reopens_breaker() {
    let mut dm = manager(DeliveryConfig::default());
    let now = Instant::now();
    let target = peer(8);
    for _ in 0..3 {
        dm.on_send_failure(&target, now);
    }
    let after = now + Duration::from_secs(31);
    dm.track(msg(1), target, Vec::new(), Reliability::Reliable, after)
        .unwrap();
    dm.on_send_failure(&target, after);
    assert_eq!(dm.breaker_phase(&target), BreakerPhase::Open);
    assert_eq!(
        dm.track(msg(2), target, Vec::new(), Reliability::Reliable, after + Duration::from_secs(1))
            .unwrap_err(),
        TransportError::CircuitBreakerOpen
    );
}

#[test]
fn cancel_releases_tracker() {
    let mut dm = manager(DeliveryConfig::default());
    let now = Instant::now();
    dm.track(msg(2), peer(2), Vec::new(), Reliability::Reliable, now)
        .unwrap();
    dm.cancel(&msg(2)).unwrap();
    assert!(!dm.is_tracking(&msg(2)));
    assert_eq!(dm.cancel(&msg(2)).unwrap_err(), TransportError::Cancelled);
    // No retries fire for a cancelled message.
    assert!(dm.poll(now + Duration::from_secs(60), 0).is_empty());
}

#[test]
fn guaranteed_reliability_raises_attempts() {
    let mut dm = manager(DeliveryConfig {
        policy: RetryPolicy {
            max_attempts: 2,
            jitter: Duration::ZERO,
            ..RetryPolicy::default()
        },
        ack_timeout: Duration::from_secs(1),
        ..DeliveryConfig::default()
    });
    let start = Instant::now();
    dm.track(msg(1), peer(1), Vec::new(), Reliability::Guaranteed, start)
        .unwrap();

    let mut now = start;
    let mut retries = 0;
    for _ in 0..40 {
        now += Duration::from_secs(60);
        retries += dm.poll(now, 0).len();
        if !dm.is_tracking(&msg(1)) {
            break;
        }
    }
    assert!(retries > 2, "guaranteed messages outlive the default budget");
}
