//! UTXO-aware priority queue.
//!
//! A binary min-heap keyed by a fee- and age-weighted score. A queue-id to
//! heap-index map is maintained on every swap so re-prioritisation is
//! O(log n) after an O(1) lookup.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use loramesh_wire::compress::CodecKind;
use loramesh_wire::crypto::NodeId;
use loramesh_wire::types::MessageKind;
use tracing::debug;
use uuid::Uuid;

use crate::error::TransportError;

/// Message priority. Lower value dequeues first at equal score weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Priority {
    Critical = 0,
    High = 1,
    Normal = 2,
    Low = 3,
}

impl Priority {
    pub fn index(self) -> usize {
        self as usize
    }

    /// One step up, used by emergency mode.
    pub fn boost(self) -> Self {
        match self {
            Priority::Low => Priority::Normal,
            Priority::Normal => Priority::High,
            Priority::High | Priority::Critical => Priority::Critical,
        }
    }
}

/// Durable identifier handed back to callers on enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueId(pub Uuid);

impl QueueId {
    pub fn random() -> Self {
        QueueId(Uuid::new_v4())
    }
}

impl std::fmt::Display for QueueId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Envelope admitted to the queue.
#[derive(Debug, Clone)]
pub struct PrioritizedMessage {
    pub queue_id: QueueId,
    pub kind: MessageKind,
    pub payload: Vec<u8>,
    pub destination: Option<NodeId>,
    pub priority: Priority,
    pub emergency: bool,
    pub fee: u64,
    pub input_count: u32,
    pub output_count: u32,
    pub block_height: u64,
    pub created_at: Instant,
    pub ttl: Duration,
    pub retry_count: u32,
    pub max_retries: u32,
    pub ack_required: bool,
    pub compression_applied: CodecKind,
}

impl PrioritizedMessage {
    pub fn fee_per_byte(&self) -> f64 {
        if self.payload.is_empty() {
            return 0.0;
        }
        self.fee as f64 / self.payload.len() as f64
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.created_at) > self.ttl
    }
}

#[derive(Debug)]
struct HeapNode {
    message: PrioritizedMessage,
    score: f64,
    fee_per_byte: f64,
    /// Insertion sequence; breaks score ties first-in-first-out.
    seq: u64,
}

/// Queue sizing. The emergency reserve is carved out of
/// `max_total_messages` and only `emergency`-flagged messages may use it.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub max_total_messages: usize,
    pub memory_limit_bytes: usize,
    pub capacity_by_priority: [usize; 4],
    pub emergency_reserve: usize,
    pub high_fee_per_byte: f64,
    pub normal_fee_per_byte: f64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_total_messages: 1000,
            memory_limit_bytes: 512 * 1024,
            capacity_by_priority: [200, 300, 400, 300],
            emergency_reserve: 5,
            high_fee_per_byte: 10.0,
            normal_fee_per_byte: 1.0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct QueueStats {
    pub enqueued: u64,
    pub dequeued: u64,
    pub evicted: u64,
    pub expired: u64,
    pub rejected: u64,
    pub fee_bucket_high: u64,
    pub fee_bucket_normal: u64,
    pub fee_bucket_low: u64,
    /// Exponentially weighted average wait before dequeue, per priority.
    pub wait_ewma_ms: [f64; 4],
    pub len: usize,
    pub bytes_held: usize,
}

pub struct PriorityQueue {
    config: QueueConfig,
    heap: Vec<HeapNode>,
    index: HashMap<QueueId, usize>,
    counts: [usize; 4],
    bytes_held: usize,
    next_seq: u64,
    stats: QueueStats,
}

impl PriorityQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            heap: Vec::new(),
            index: HashMap::new(),
            counts: [0; 4],
            bytes_held: 0,
            next_seq: 0,
            stats: QueueStats::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn bytes_held(&self) -> usize {
        self.bytes_held
    }

    pub fn stats(&self) -> QueueStats {
        let mut stats = self.stats.clone();
        stats.len = self.heap.len();
        stats.bytes_held = self.bytes_held;
        stats
    }

    /// Every queued message, in heap (not dequeue) order. For snapshots.
    pub fn snapshot(&self) -> impl Iterator<Item = &PrioritizedMessage> {
        self.heap.iter().map(|node| &node.message)
    }

    /// Admits a message, evicting worse-ranked non-emergency entries when
    /// full.
    pub fn enqueue(
        &mut self,
        message: PrioritizedMessage,
        now: Instant,
    ) -> Result<QueueId, TransportError> {
        let payload_len = message.payload.len();
        let priority_idx = message.priority.index();
        let fee_per_byte = message.fee_per_byte();
        let score = score(&message, fee_per_byte, now);

        let effective_cap = if message.emergency {
            self.config.max_total_messages
        } else {
            self.config
                .max_total_messages
                .saturating_sub(self.config.emergency_reserve)
        };

        // Total-capacity and memory pressure evict strictly worse traffic.
        while self.heap.len() >= effective_cap
            || self.bytes_held + payload_len > self.config.memory_limit_bytes
        {
            if !self.evict_worst(message.priority, message.emergency) {
                self.stats.rejected += 1;
                return Err(TransportError::QueueOverflow);
            }
        }

        // The per-priority cap can only be relieved within the same class.
        if !message.emergency
            && self.counts[priority_idx] >= self.config.capacity_by_priority[priority_idx]
            && !self.evict_worst_in_class(message.priority, score)
        {
            self.stats.rejected += 1;
            return Err(TransportError::QueueOverflow);
        }

        let queue_id = message.queue_id;
        let seq = self.next_seq;
        self.next_seq += 1;

        self.counts[priority_idx] += 1;
        self.bytes_held += payload_len;
        self.stats.enqueued += 1;

        self.heap.push(HeapNode {
            message,
            score,
            fee_per_byte,
            seq,
        });
        let last = self.heap.len() - 1;
        self.index.insert(queue_id, last);
        self.sift_up(last);
        Ok(queue_id)
    }

    pub fn peek(&self) -> Option<&PrioritizedMessage> {
        self.heap.first().map(|node| &node.message)
    }

    /// Pops the lowest-score message and updates the dequeue metrics.
    pub fn dequeue(&mut self, now: Instant) -> Option<PrioritizedMessage> {
        if self.heap.is_empty() {
            return None;
        }
        let node = self.remove_at(0);
        let priority_idx = node.message.priority.index();
        let wait_ms = now.duration_since(node.message.created_at).as_millis() as f64;
        let ewma = &mut self.stats.wait_ewma_ms[priority_idx];
        *ewma = if *ewma == 0.0 {
            wait_ms
        } else {
            0.9 * *ewma + 0.1 * wait_ms
        };
        if node.fee_per_byte >= self.config.high_fee_per_byte {
            self.stats.fee_bucket_high += 1;
        } else if node.fee_per_byte >= self.config.normal_fee_per_byte {
            self.stats.fee_bucket_normal += 1;
        } else {
            self.stats.fee_bucket_low += 1;
        }
        self.stats.dequeued += 1;
        Some(node.message)
    }

    /// Removes a specific message, e.g. on cancellation.
    pub fn remove(&mut self, queue_id: &QueueId) -> Option<PrioritizedMessage> {
        let position = *self.index.get(queue_id)?;
        Some(self.remove_at(position).message)
    }

    /// O(n) sweep dropping messages past their TTL.
    pub fn remove_expired(&mut self, now: Instant) -> Vec<PrioritizedMessage> {
        let expired: Vec<QueueId> = self
            .heap
            .iter()
            .filter(|node| node.message.is_expired(now))
            .map(|node| node.message.queue_id)
            .collect();
        let mut removed = Vec::with_capacity(expired.len());
        for queue_id in expired {
            if let Some(message) = self.remove(&queue_id) {
                self.stats.expired += 1;
                removed.push(message);
            }
        }
        removed
    }

    /// Re-scores one message after a priority change.
    pub fn update_priority(&mut self, queue_id: &QueueId, priority: Priority, now: Instant) -> bool {
        let Some(&position) = self.index.get(queue_id) else {
            return false;
        };
        let node = &mut self.heap[position];
        let old_idx = node.message.priority.index();
        node.message.priority = priority;
        node.score = score(&node.message, node.fee_per_byte, now);
        self.counts[old_idx] -= 1;
        self.counts[priority.index()] += 1;
        let position = self.sift_up(position);
        self.sift_down(position);
        true
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.index.clear();
        self.counts = [0; 4];
        self.bytes_held = 0;
    }

    /// Evicts the worst (highest-score) non-emergency message of strictly
    /// lower priority than the incoming one. Returns false when nothing is
    /// evictable.
    fn evict_worst(&mut self, incoming: Priority, incoming_emergency: bool) -> bool {
        let candidate = self
            .heap
            .iter()
            .filter(|node| !node.message.emergency)
            .filter(|node| incoming_emergency || node.message.priority > incoming)
            .max_by(|a, b| a.score.total_cmp(&b.score))
            .map(|node| node.message.queue_id);
        match candidate {
            Some(queue_id) => {
                let position = self.index[&queue_id];
                let node = self.remove_at(position);
                self.stats.evicted += 1;
                debug!(queue_id = %node.message.queue_id, "evicted lowest-priority message on overflow");
                true
            }
            None => false,
        }
    }

    /// Evicts the worst same-class entry, but only if the incoming message
    /// actually outranks it.
    fn evict_worst_in_class(&mut self, priority: Priority, incoming_score: f64) -> bool {
        let candidate = self
            .heap
            .iter()
            .filter(|node| !node.message.emergency && node.message.priority == priority)
            .max_by(|a, b| a.score.total_cmp(&b.score))
            .filter(|node| node.score > incoming_score)
            .map(|node| node.message.queue_id);
        match candidate {
            Some(queue_id) => {
                let position = self.index[&queue_id];
                self.remove_at(position);
                self.stats.evicted += 1;
                true
            }
            None => false,
        }
    }

    fn remove_at(&mut self, position: usize) -> HeapNode {
        let last = self.heap.len() - 1;
        self.heap.swap(position, last);
        self.index.insert(self.heap[position].message.queue_id, position);
        let node = self.heap.pop().expect("heap non-empty");
        self.index.remove(&node.message.queue_id);
        if position < self.heap.len() {
            let position = self.sift_up(position);
            self.sift_down(position);
        }
        self.counts[node.message.priority.index()] -= 1;
        self.bytes_held -= node.message.payload.len();
        node
    }

    fn less(&self, a: usize, b: usize) -> bool {
        let (na, nb) = (&self.heap[a], &self.heap[b]);
        match na.score.total_cmp(&nb.score) {
            std::cmp::Ordering::Less => true,
            std::cmp::Ordering::Greater => false,
            std::cmp::Ordering::Equal => na.seq < nb.seq,
        }
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.heap.swap(a, b);
        self.index.insert(self.heap[a].message.queue_id, a);
        self.index.insert(self.heap[b].message.queue_id, b);
    }

    fn sift_up(&mut self, mut position: usize) -> usize {
        while position > 0 {
            let parent = (position - 1) / 2;
            if self.less(position, parent) {
                self.swap(position, parent);
                position = parent;
            } else {
                break;
            }
        }
        position
    }

    fn sift_down(&mut self, mut position: usize) {
        loop {
            let left = 2 * position + 1;
            let right = left + 1;
            let mut smallest = position;
            if left < self.heap.len() && self.less(left, smallest) {
                smallest = left;
            }
            if right < self.heap.len() && self.less(right, smallest) {
                smallest = right;
            }
            if smallest == position {
                break;
            }
            self.swap(position, smallest);
            position = smallest;
        }
    }
}

/// Score formula: lower dequeues first. Emergency dominates, then base
/// priority, with age (clamped to 100 s), fee density, and block height as
/// tie-shifting terms.
fn score(message: &PrioritizedMessage, fee_per_byte: f64, now: Instant) -> f64 {
    let age_s = now.duration_since(message.created_at).as_millis() as f64 / 1000.0;
    (message.priority.index() as f64) * 1000.0
        - if message.emergency { 10_000.0 } else { 0.0 }
        - age_s.min(100.0)
        - fee_per_byte * 10.0
        - message.block_height as f64 * 0.01
}
