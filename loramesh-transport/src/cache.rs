//! Sender-side fragment cache, kept so retransmission requests and NACKs
//! can be served without re-fragmenting or re-signing.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::frame::{Fragment, MessageId};

#[derive(Debug, Clone)]
pub struct FragmentCacheConfig {
    pub max_messages: usize,
    pub retention: Duration,
}

impl Default for FragmentCacheConfig {
    fn default() -> Self {
        Self {
            max_messages: 64,
            retention: Duration::from_secs(300),
        }
    }
}

#[derive(Debug)]
struct CachedMessage {
    fragments: Vec<Fragment>,
    stored_at: Instant,
}

/// Bounded FIFO cache of recently transmitted fragment sets.
#[derive(Debug)]
pub struct FragmentCache {
    config: FragmentCacheConfig,
    messages: HashMap<MessageId, CachedMessage>,
    order: VecDeque<MessageId>,
}

impl FragmentCache {
    pub fn new(config: FragmentCacheConfig) -> Self {
        Self {
            config,
            messages: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn insert(&mut self, message_id: MessageId, fragments: Vec<Fragment>, now: Instant) {
        if self.messages.len() >= self.config.max_messages
            && !self.messages.contains_key(&message_id)
            && let Some(oldest) = self.order.pop_front()
        {
            self.messages.remove(&oldest);
        }
        if self.messages.insert(message_id, CachedMessage { fragments, stored_at: now }).is_none() {
            self.order.push_back(message_id);
        }
    }

    /// Fetches the named sequences of a cached message, skipping unknown ones.
    pub fn fragments(&self, message_id: &MessageId, sequences: &[u16]) -> Vec<Fragment> {
        let Some(cached) = self.messages.get(message_id) else {
            return Vec::new();
        };
        sequences
            .iter()
            .filter_map(|&seq| cached.fragments.get(seq as usize).cloned())
            .collect()
    }

    pub fn contains(&self, message_id: &MessageId) -> bool {
        self.messages.contains_key(message_id)
    }

    pub fn remove(&mut self, message_id: &MessageId) {
        if self.messages.remove(message_id).is_some() {
            self.order.retain(|id| id != message_id);
        }
    }

    pub fn prune(&mut self, now: Instant) {
        let retention = self.config.retention;
        let expired: Vec<MessageId> = self
            .messages
            .iter()
            .filter(|(_, m)| now.duration_since(m.stored_at) > retention)
            .map(|(&id, _)| id)
            .collect();
        for id in expired {
            self.remove(&id);
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
