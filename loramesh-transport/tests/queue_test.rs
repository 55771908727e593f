use std::time::{Duration, Instant};

use loramesh_transport::error::TransportError;
use loramesh_transport::queue::{
    PrioritizedMessage, Priority, PriorityQueue, QueueConfig, QueueId,
};
use loramesh_wire::compress::CodecKind;
use loramesh_wire::types::MessageKind;

fn message(priority: Priority, fee: u64, payload_len: usize, now: Instant) -> PrioritizedMessage {
    PrioritizedMessage {
        queue_id: QueueId::random(),
        kind: MessageKind::UtxoTransaction,
        payload: vec![0u8; payload_len],
        destination: None,
        priority,
        emergency: false,
        fee,
        input_count: 1,
        output_count: 1,
        block_height: 0,
        created_at: now,
        ttl: Duration::from_secs(600),
        retry_count: 0,
        max_retries: 3,
        ack_required: false,
        compression_applied: CodecKind::None,
    }
}

#[test]
fn dequeue_order_follows_priority_then_fee() {
    let now = Instant::now();
    let mut queue = PriorityQueue::new(QueueConfig::default());

    let low = message(Priority::Low, 0, 100, now);
    let normal = message(Priority::Normal, 0, 100, now);
    let critical = message(Priority::Critical, 0, 100, now);
    let high_fee_normal = message(Priority::Normal, 5_000, 100, now);

    for msg in [low.clone(), normal.clone(), critical.clone(), high_fee_normal.clone()] {
        queue.enqueue(msg, now).unwrap();
    }

    assert_eq!(queue.dequeue(now).unwrap().queue_id, critical.queue_id);
    // Within the same priority, higher fee-per-byte wins.
    assert_eq!(queue.dequeue(now).unwrap().queue_id, high_fee_normal.queue_id);
    assert_eq!(queue.dequeue(now).unwrap().queue_id, normal.queue_id);
    assert_eq!(queue.dequeue(now).unwrap().queue_id, low.queue_id);
    assert!(queue.dequeue(now).is_none());
}

#[test]
fn ties_break_by_insertion_order() {
    let now = Instant::now();
    let mut queue = PriorityQueue::new(QueueConfig::default());
    let first = message(Priority::Normal, 10, 100, now);
    let second = message(Priority::Normal, 10, 100, now);
    queue.enqueue(first.clone(), now).unwrap();
    queue.enqueue(second.clone(), now).unwrap();
    assert_eq!(queue.dequeue(now).unwrap().queue_id, first.queue_id);
    assert_eq!(queue.dequeue(now).unwrap().queue_id, second.queue_id);
}

#[test]
fn emergency_precedes_everything() {
    let now = Instant::now();
    let mut queue = PriorityQueue::new(QueueConfig::default());
    queue.enqueue(message(Priority::Critical, 10_000, 10, now), now).unwrap();
    let mut emergency = message(Priority::Low, 0, 100, now);
    emergency.emergency = true;
    let emergency_id = emergency.queue_id;
    queue.enqueue(emergency, now).unwrap();
    assert_eq!(queue.dequeue(now).unwrap().queue_id, emergency_id);
}

#[test]
fn age_boost_is_clamped_to_100() {
    let now = Instant::now();
    let mut queue = PriorityQueue::new(QueueConfig::default());

    // 100 s of age are worth at most one fee unit of 10 sat/byte; an ancient
    // Low message still cannot outrank a Normal one (1000 score step).
    let later = now + Duration::from_secs(100_000);
    let ancient_low = message(Priority::Low, 0, 100, now);
    let mut fresh_normal = message(Priority::Normal, 0, 100, now);
    fresh_normal.created_at = later;

    queue.enqueue(ancient_low, later).unwrap();
    queue.enqueue(fresh_normal.clone(), later).unwrap();
    assert_eq!(queue.dequeue(later).unwrap().queue_id, fresh_normal.queue_id);
}

#[test]
fn emergency_reserve_absorbs_when_full() {
    let now = Instant::now();
    let config = QueueConfig {
        max_total_messages: 105,
        emergency_reserve: 5,
        capacity_by_priority: [105, 105, 105, 105],
        memory_limit_bytes: 10 * 1024 * 1024,
        ..QueueConfig::default()
    };
    let mut queue = PriorityQueue::new(config);

    // Fill the non-reserved capacity with Low-priority transactions.
    for _ in 0..100 {
        queue.enqueue(message(Priority::Low, 0, 10, now), now).unwrap();
    }
    assert_eq!(queue.len(), 100);

    let mut emergency = message(Priority::Low, 0, 10, now);
    emergency.emergency = true;
    let emergency_id = emergency.queue_id;
    queue.enqueue(emergency, now).unwrap();

    // Reserve absorbed it without evicting anything.
    assert_eq!(queue.len(), 101);
    assert_eq!(queue.stats().evicted, 0);
    // And it dequeues before any Low-priority item.
    assert_eq!(queue.dequeue(now).unwrap().queue_id, emergency_id);
}

#[test]
fn overflow_evicts_lowest_priority_non_emergency() {
    let now = Instant::now();
    let config = QueueConfig {
        max_total_messages: 4,
        emergency_reserve: 1,
        capacity_by_priority: [4, 4, 4, 4],
        ..QueueConfig::default()
    };
    let mut queue = PriorityQueue::new(config);

    let low = message(Priority::Low, 0, 10, now);
    let low_id = low.queue_id;
    queue.enqueue(low, now).unwrap();
    queue.enqueue(message(Priority::Normal, 0, 10, now), now).unwrap();
    queue.enqueue(message(Priority::Normal, 0, 10, now), now).unwrap();

    // Queue is at its non-emergency cap (3 of 4); a High message evicts the Low.
    queue.enqueue(message(Priority::High, 0, 10, now), now).unwrap();
    assert_eq!(queue.len(), 3);
    assert_eq!(queue.stats().evicted, 1);
    assert!(queue.remove(&low_id).is_none());
}

#[test]
fn overflow_with_nothing_evictable_is_rejected() {
    let now = Instant::now();
    let config = QueueConfig {
        max_total_messages: 3,
        emergency_reserve: 1,
        capacity_by_priority: [3, 3, 3, 3],
        ..QueueConfig::default()
    };
    let mut queue = PriorityQueue::new(config);
    queue.enqueue(message(Priority::Critical, 0, 10, now), now).unwrap();
    queue.enqueue(message(Priority::Critical, 0, 10, now), now).unwrap();

    // A Low-priority arrival cannot evict the better-ranked residents.
    let result = queue.enqueue(message(Priority::Low, 0, 10, now), now);
    assert_eq!(result.unwrap_err(), TransportError::QueueOverflow);
    assert_eq!(queue.stats().rejected, 1);
}

#[test]
fn ttl_sweep_removes_expired() {
    let now = Instant::now();
    let mut queue = PriorityQueue::new(QueueConfig::default());
    let mut short_lived = message(Priority::Normal, 0, 10, now);
    short_lived.ttl = Duration::from_secs(5);
    let keeper = message(Priority::Normal, 0, 10, now);
    queue.enqueue(short_lived.clone(), now).unwrap();
    queue.enqueue(keeper.clone(), now).unwrap();

    let expired = queue.remove_expired(now + Duration::from_secs(10));
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].queue_id, short_lived.queue_id);
    assert_eq!(queue.len(), 1);
    assert_eq!(queue.peek().unwrap().queue_id, keeper.queue_id);
}

#[test]
fn update_priority_reorders_in_place() {
    let now = Instant::now();
    let mut queue = PriorityQueue::new(QueueConfig::default());
    let a = message(Priority::Low, 0, 10, now);
    let b = message(Priority::Normal, 0, 10, now);
    queue.enqueue(a.clone(), now).unwrap();
    queue.enqueue(b.clone(), now).unwrap();

    assert!(queue.update_priority(&a.queue_id, Priority::Critical, now));
    assert_eq!(queue.dequeue(now).unwrap().queue_id, a.queue_id);
    assert!(!queue.update_priority(&QueueId::random(), Priority::Low, now));
}

#[test]
fn memory_limit_is_enforced() {
    let now = Instant::now();
    let config = QueueConfig {
        max_total_messages: 100,
        memory_limit_bytes: 1000,
        ..QueueConfig::default()
    };
    let mut queue = PriorityQueue::new(config);
    queue.enqueue(message(Priority::Critical, 0, 600, now), now).unwrap();
    // Second Critical message cannot fit and nothing of lower rank exists.
    let result = queue.enqueue(message(Priority::Critical, 0, 600, now), now);
    assert_eq!(result.unwrap_err(), TransportError::QueueOverflow);
    // A later message that fits is fine.
    queue.enqueue(message(Priority::Normal, 0, 100, now), now).unwrap();
    assert_eq!(queue.len(), 2);
}

#[test]
fn priority_boost_steps_up_and_saturates() {
    assert_eq!(Priority::Low.boost(), Priority::Normal);
    assert_eq!(Priority::Normal.boost(), Priority::High);
    assert_eq!(Priority::High.boost(), Priority::Critical);
    assert_eq!(Priority::Critical.boost(), Priority::Critical);
}

#[test]
fn dequeue_updates_fee_buckets_and_wait_ewma() {
    let now = Instant::now();
    let mut queue = PriorityQueue::new(QueueConfig::default());
    queue.enqueue(message(Priority::Normal, 2_000, 100, now), now).unwrap(); // 20 sat/B
    queue.enqueue(message(Priority::Normal, 200, 100, now), now).unwrap(); // 2 sat/B
    queue.enqueue(message(Priority::Normal, 0, 100, now), now).unwrap();

    let later = now + Duration::from_secs(2);
    while queue.dequeue(later).is_some() {}
    let stats = queue.stats();
    assert_eq!(stats.fee_bucket_high, 1);
    assert_eq!(stats.fee_bucket_normal, 1);
    assert_eq!(stats.fee_bucket_low, 1);
    assert!(stats.wait_ewma_ms[Priority::Normal.index()] > 0.0);
}
