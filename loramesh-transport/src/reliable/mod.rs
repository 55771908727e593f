//! Reliable delivery: ACK tracking, retry with backoff and jitter, per-peer
//! circuit breakers, and a dead-letter queue for post-mortem inspection.

pub mod breaker;

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use loramesh_wire::crypto::NodeId;
use rand::Rng;
use tracing::{debug, warn};

pub use self::breaker::{BreakerConfig, BreakerPhase, CircuitBreaker};
use crate::error::TransportError;
use crate::frame::MessageId;

/// Delivery guarantee requested by the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reliability {
    BestEffort,
    Reliable,
    /// Raises the retry budget; used for blocks and proofs.
    Guaranteed,
}

/// Retry schedule: `delay(n) = min(base * multiplier^n, max) + U(0, jitter)`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max: Duration,
    pub multiplier: f64,
    pub jitter: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
            multiplier: 1.5,
            jitter: Duration::from_millis(500),
            max_attempts: 3,
        }
    }
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.base.is_zero() || self.multiplier < 1.0 || self.max < self.base {
            return Err(TransportError::ConfigInvalid("retry policy inconsistent".into()));
        }
        Ok(())
    }

    fn delay(&self, attempt: u32, rng: &mut impl Rng) -> Duration {
        let scaled = self.base.mul_f64(self.multiplier.powi(attempt as i32));
        let capped = scaled.min(self.max);
        let jitter = self.jitter.mul_f64(rng.gen_range(0.0..1.0));
        capped + jitter
    }

    fn attempts_for(&self, reliability: Reliability) -> u32 {
        match reliability {
            Reliability::BestEffort | Reliability::Reliable => self.max_attempts,
            Reliability::Guaranteed => self.max_attempts.max(8),
        }
    }
}

/// Per-message delivery state until confirmed, exhausted, or cancelled.
#[derive(Debug, Clone)]
pub struct AckTracker {
    pub message_id: MessageId,
    pub target: NodeId,
    pub sent_at: Instant,
    pub deadline_at: Instant,
    pub attempts: u32,
    pub max_attempts: u32,
    pub next_retry_at: Instant,
    pub requires_delivery: bool,
    payload: Vec<u8>,
}

/// A failed message parked for inspection.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub message_id: MessageId,
    pub target: NodeId,
    pub attempts: u32,
    pub reason: TransportError,
    pub failed_unix_ms: u64,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryEvent {
    Delivered {
        message_id: MessageId,
        target: NodeId,
        attempts: u32,
    },
    Retry {
        message_id: MessageId,
        target: NodeId,
        attempt: u32,
    },
    Failed {
        message_id: MessageId,
        target: NodeId,
        reason: TransportError,
    },
}

/// A retransmission the orchestrator must perform now.
#[derive(Debug, Clone)]
pub struct RetryDirective {
    pub message_id: MessageId,
    pub target: NodeId,
    pub attempt: u32,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct DeliveryStats {
    pub tracked: u64,
    pub delivered: u64,
    pub retries: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub breaker_rejections: u64,
    pub in_flight: usize,
    pub dead_letters: usize,
}

#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    pub policy: RetryPolicy,
    /// Initial wait for an ACK before the retry path engages.
    pub ack_timeout: Duration,
    pub breaker: BreakerConfig,
    pub dead_letter_capacity: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            policy: RetryPolicy::default(),
            ack_timeout: Duration::from_secs(5),
            breaker: BreakerConfig::default(),
            dead_letter_capacity: 32,
        }
    }
}

pub struct DeliveryManager {
    config: DeliveryConfig,
    trackers: HashMap<MessageId, AckTracker>,
    breaker: CircuitBreaker,
    dead_letters: VecDeque<DeadLetter>,
    events: VecDeque<DeliveryEvent>,
    stats: DeliveryStats,
    rng: rand::rngs::StdRng,
}

impl DeliveryManager {
    pub fn new(config: DeliveryConfig, rng: &mut dyn rand::RngCore) -> Result<Self, TransportError> {
        use rand::SeedableRng;
        config.policy.validate()?;
        Ok(Self {
            breaker: CircuitBreaker::new(config.breaker.clone()),
            config,
            trackers: HashMap::new(),
            dead_letters: VecDeque::new(),
            events: VecDeque::new(),
            stats: DeliveryStats::default(),
            rng: rand::rngs::StdRng::seed_from_u64(rng.next_u64()),
        })
    }

    pub fn breaker_phase(&self, peer: &NodeId) -> BreakerPhase {
        self.breaker.phase(peer)
    }

    pub fn is_tracking(&self, message_id: &MessageId) -> bool {
        self.trackers.contains_key(message_id)
    }

    /// Begins tracking a reliable message that has just been transmitted.
    /// Fails fast with `CircuitBreakerOpen` while the peer's breaker is open.
    pub fn track(
        &mut self,
        message_id: MessageId,
        target: NodeId,
        payload: Vec<u8>,
        reliability: Reliability,
        now: Instant,
    ) -> Result<(), TransportError> {
        if !self.breaker.allow(&target, now) {
            self.stats.breaker_rejections += 1;
            return Err(TransportError::CircuitBreakerOpen);
        }
        let max_attempts = self.config.policy.attempts_for(reliability);
        self.trackers.insert(
            message_id,
            AckTracker {
                message_id,
                target,
                sent_at: now,
                deadline_at: now + self.config.ack_timeout,
                attempts: 0,
                max_attempts,
                next_retry_at: now + self.config.ack_timeout,
                requires_delivery: reliability == Reliability::Guaranteed,
                payload,
            },
        );
        self.stats.tracked += 1;
        Ok(())
    }

    /// Confirms delivery. ACK signatures are verified by the caller before
    /// this is invoked; unknown ids are ignored so duplicate ACKs are safe.
    pub fn on_ack(&mut self, message_id: &MessageId, from: &NodeId) -> bool {
        let Some(tracker) = self.trackers.get(message_id) else {
            return false;
        };
        if tracker.target != *from {
            debug!(message_id = %message_id, from = %from, "ACK from unexpected peer ignored");
            return false;
        }
        let tracker = self.trackers.remove(message_id).expect("checked above");
        self.breaker.on_success(from);
        self.stats.delivered += 1;
        self.events.push_back(DeliveryEvent::Delivered {
            message_id: tracker.message_id,
            target: tracker.target,
            attempts: tracker.attempts,
        });
        true
    }

    /// Cancels an in-flight message. Its tracker slot is released and no
    /// further retries will fire.
    pub fn cancel(&mut self, message_id: &MessageId) -> Result<(), TransportError> {
        match self.trackers.remove(message_id) {
            Some(_) => {
                self.stats.cancelled += 1;
                Ok(())
            }
            None => Err(TransportError::Cancelled),
        }
    }

    /// Advances timers. ACK timeouts re-enter the retry path; exhausted
    /// messages go to the dead-letter queue and emit `Failed`. `unix_ms`
    /// only stamps dead letters for the audit trail.
    pub fn poll(&mut self, now: Instant, unix_ms: u64) -> Vec<RetryDirective> {
        let due: Vec<MessageId> = self
            .trackers
            .values()
            .filter(|t| now >= t.next_retry_at)
            .map(|t| t.message_id)
            .collect();

        let mut directives = Vec::new();
        for message_id in due {
            let tracker = self.trackers.get_mut(&message_id).expect("collected above");
            if tracker.attempts >= tracker.max_attempts {
                let tracker = self.trackers.remove(&message_id).expect("present");
                self.breaker.on_failure(&tracker.target, now);
                self.park_dead_letter(&tracker, TransportError::MaxRetriesExceeded, unix_ms);
                warn!(message_id = %message_id, target = %tracker.target, "delivery failed after max retries");
                self.events.push_back(DeliveryEvent::Failed {
                    message_id,
                    target: tracker.target,
                    reason: TransportError::MaxRetriesExceeded,
                });
                self.stats.failed += 1;
                continue;
            }

            // Retransmissions to an open breaker are deferred, not dropped.
            if !self.breaker.allow(&tracker.target, now) {
                tracker.next_retry_at = now + self.config.policy.max;
                continue;
            }

            tracker.attempts += 1;
            let delay = self.config.policy.delay(tracker.attempts, &mut self.rng);
            tracker.next_retry_at = now + delay;
            self.stats.retries += 1;
            self.events.push_back(DeliveryEvent::Retry {
                message_id,
                target: tracker.target,
                attempt: tracker.attempts,
            });
            directives.push(RetryDirective {
                message_id,
                target: tracker.target,
                attempt: tracker.attempts,
                payload: tracker.payload.clone(),
            });
        }
        directives
    }

    /// Records a transport-level failure against the peer without waiting
    /// for an ACK timeout (e.g. the radio driver reported an error).
    pub fn on_send_failure(&mut self, peer: &NodeId, now: Instant) {
        self.breaker.on_failure(peer, now);
    }

    pub fn drain_events(&mut self) -> Vec<DeliveryEvent> {
        self.events.drain(..).collect()
    }

    pub fn dead_letters(&self) -> impl Iterator<Item = &DeadLetter> {
        self.dead_letters.iter()
    }

    /// Pulls a message out of the DLQ for a manual retry. The caller is
    /// responsible for re-transmitting and re-tracking it.
    pub fn retry_dead_letter(&mut self, message_id: &MessageId) -> Option<DeadLetter> {
        let position = self
            .dead_letters
            .iter()
            .position(|d| d.message_id == *message_id)?;
        self.dead_letters.remove(position)
    }

    pub fn stats(&self) -> DeliveryStats {
        let mut stats = self.stats.clone();
        stats.in_flight = self.trackers.len();
        stats.dead_letters = self.dead_letters.len();
        stats
    }

    fn park_dead_letter(&mut self, tracker: &AckTracker, reason: TransportError, unix_ms: u64) {
        if self.dead_letters.len() >= self.config.dead_letter_capacity {
            self.dead_letters.pop_front();
        }
        self.dead_letters.push_back(DeadLetter {
            message_id: tracker.message_id,
            target: tracker.target,
            attempts: tracker.attempts,
            reason,
            failed_unix_ms: unix_ms,
            payload: tracker.payload.clone(),
        });
    }
}
