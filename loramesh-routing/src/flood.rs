//! Duplicate suppression for controlled floods.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use loramesh_wire::crypto::NodeId;

/// Fixed-size LRU cache of `(originator, sequence)` pairs.
///
/// The first successful `should_forward` commits the cache entry
/// atomically; there is no separate mark step to forget.
#[derive(Debug)]
pub struct FloodCache {
    capacity: usize,
    window: Duration,
    entries: HashMap<(NodeId, u64), Instant>,
    recency: VecDeque<(NodeId, u64)>,
}

impl FloodCache {
    pub fn new(capacity: usize, window: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            window,
            entries: HashMap::new(),
            recency: VecDeque::new(),
        }
    }

    /// Returns true exactly once per `(originator, sequence)` within the
    /// cache window, recording the sighting as a side effect.
    pub fn should_forward(&mut self, originator: NodeId, sequence: u64, now: Instant) -> bool {
        let key = (originator, sequence);
        if let Some(&seen_at) = self.entries.get(&key) {
            if now.duration_since(seen_at) <= self.window {
                self.touch(&key);
                return false;
            }
        }

        if self.entries.len() >= self.capacity && !self.entries.contains_key(&key) {
            if let Some(oldest) = self.recency.pop_front() {
                self.entries.remove(&oldest);
            }
        }
        if self.entries.insert(key, now).is_some() {
            self.touch(&key);
        } else {
            self.recency.push_back(key);
        }
        true
    }

    pub fn contains(&self, originator: &NodeId, sequence: u64, now: Instant) -> bool {
        self.entries
            .get(&(*originator, sequence))
            .is_some_and(|&seen_at| now.duration_since(seen_at) <= self.window)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops entries older than the window.
    pub fn prune(&mut self, now: Instant) {
        let window = self.window;
        let entries = &mut self.entries;
        self.recency.retain(|key| {
            match entries.get(key) {
                Some(&seen_at) if now.duration_since(seen_at) <= window => true,
                _ => {
                    entries.remove(key);
                    false
                }
            }
        });
    }

    fn touch(&mut self, key: &(NodeId, u64)) {
        if let Some(position) = self.recency.iter().position(|k| k == key) {
            self.recency.remove(position);
            self.recency.push_back(*key);
        }
    }
}
