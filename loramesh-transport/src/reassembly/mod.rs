//! Inbound fragment validation, session management, and missing-fragment
//! detection.
//!
//! Sessions live in an arena of slots addressed by integer handles; the
//! message-id index and per-origin accounting refer to sessions only through
//! those handles.

pub mod buffer;

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use loramesh_wire::crypto::{NodeId, PublicKey};
use loramesh_wire::types::MessageKind;
use rand::Rng;
use tracing::{debug, warn};

use self::buffer::FragmentBuffer;
use crate::error::TransportError;
use crate::frame::{Fragment, FragmentFlags, MAX_FRAGMENTS_PER_MESSAGE, MessageId};
use crate::queue::Priority;

/// Reassembler tuning. Defaults follow the transport profile used on
/// EU868-class links.
#[derive(Debug, Clone)]
pub struct ReassemblyConfig {
    pub max_sessions: usize,
    pub session_timeout: Duration,
    pub retransmission_base: Duration,
    pub retransmission_max: Duration,
    pub retransmission_jitter_pct: f64,
    pub max_retransmission_attempts: u32,
    /// Per-origin quotas; exceeding any returns `RateLimited`.
    pub max_fragments_per_minute: usize,
    pub max_sessions_per_origin: usize,
    pub max_bytes_per_origin: usize,
    /// Completed-message ids remembered for duplicate suppression.
    pub completed_cache_size: usize,
}

impl Default for ReassemblyConfig {
    fn default() -> Self {
        Self {
            max_sessions: 100,
            session_timeout: Duration::from_secs(300),
            retransmission_base: Duration::from_secs(1),
            retransmission_max: Duration::from_secs(30),
            retransmission_jitter_pct: 0.2,
            max_retransmission_attempts: 3,
            max_fragments_per_minute: 600,
            max_sessions_per_origin: 20,
            max_bytes_per_origin: 256 * 1024,
            completed_cache_size: 256,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Receiving,
    WaitingRetransmission,
    Complete,
    Failed,
    Expired,
}

/// One in-flight inbound message.
#[derive(Debug)]
pub struct ReassemblySession {
    pub message_id: MessageId,
    pub origin: NodeId,
    pub kind: Option<MessageKind>,
    pub priority: Priority,
    pub state: SessionState,
    pub created_at: Instant,
    pub last_activity: Instant,
    pub timeout_at: Instant,
    pub retry_count: u32,
    pub next_retransmission_at: Instant,
    pub ack_required: bool,
    buffer: FragmentBuffer,
    /// Per-sequence retransmission request counts.
    attempts_by_sequence: HashMap<u16, u32>,
}

impl ReassemblySession {
    pub fn missing(&self) -> Vec<u16> {
        self.buffer.missing()
    }

    pub fn received_count(&self) -> u16 {
        self.buffer.received_count()
    }

    pub fn total_fragments(&self) -> u16 {
        self.buffer.total_fragments()
    }
}

/// Result of ingesting one valid fragment.
#[derive(Debug, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Fragment accepted; the session is still missing these sequences.
    Accepted { missing: Vec<u16> },
    /// The sequence bit was already set, or the message already completed.
    Duplicate,
    /// All fragments received; the session has been dropped.
    Complete {
        payload: Vec<u8>,
        ack_required: bool,
    },
}

/// Lifecycle notifications drained by `poll`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReassemblyEvent {
    SessionEvicted { message_id: MessageId },
    SessionExpired { message_id: MessageId },
    SessionFailed { message_id: MessageId },
}

/// A retransmission request the orchestrator should sign and send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetransmitPlan {
    pub message_id: MessageId,
    pub origin: NodeId,
    pub missing: Vec<u16>,
    pub attempt: u32,
}

#[derive(Debug, Clone, Default)]
pub struct ReassemblyStats {
    pub sessions_created: u64,
    pub completed: u64,
    pub failed: u64,
    pub expired: u64,
    pub evicted: u64,
    pub duplicates: u64,
    pub invalid_fragments: u64,
    pub intrusion_attempts: u64,
    pub rate_limited: u64,
    pub active_sessions: usize,
    pub buffered_bytes: usize,
}

#[derive(Debug, Default)]
struct OriginUsage {
    fragment_times: VecDeque<Instant>,
    sessions: usize,
    bytes: usize,
}

pub struct Reassembler {
    config: ReassemblyConfig,
    slots: Vec<Option<ReassemblySession>>,
    free: Vec<usize>,
    by_id: HashMap<MessageId, usize>,
    origins: HashMap<NodeId, OriginUsage>,
    /// Recently completed ids, for duplicate suppression after delivery.
    completed: VecDeque<MessageId>,
    completed_set: HashMap<MessageId, ()>,
    events: VecDeque<ReassemblyEvent>,
    intrusions_by_origin: HashMap<NodeId, u64>,
    stats: ReassemblyStats,
    rng: rand::rngs::StdRng,
}

impl Reassembler {
    pub fn new(config: ReassemblyConfig, rng: &mut dyn rand::RngCore) -> Self {
        use rand::SeedableRng;
        Self {
            config,
            slots: Vec::new(),
            free: Vec::new(),
            by_id: HashMap::new(),
            origins: HashMap::new(),
            completed: VecDeque::new(),
            completed_set: HashMap::new(),
            events: VecDeque::new(),
            intrusions_by_origin: HashMap::new(),
            stats: ReassemblyStats::default(),
            rng: rand::rngs::StdRng::seed_from_u64(rng.next_u64()),
        }
    }

    pub fn stats(&self) -> ReassemblyStats {
        let mut stats = self.stats.clone();
        stats.active_sessions = self.by_id.len();
        stats.buffered_bytes = self
            .slots
            .iter()
            .flatten()
            .map(|s| s.buffer.current_size())
            .sum();
        stats
    }

    pub fn intrusions_from(&self, origin: &NodeId) -> u64 {
        self.intrusions_by_origin.get(origin).copied().unwrap_or(0)
    }

    pub fn session(&self, message_id: &MessageId) -> Option<&ReassemblySession> {
        self.by_id
            .get(message_id)
            .and_then(|&slot| self.slots[slot].as_ref())
    }

    /// Every live session, for snapshots and observability.
    pub fn active(&self) -> impl Iterator<Item = &ReassemblySession> {
        self.slots.iter().flatten()
    }

    /// Validates and ingests one radio frame.
    ///
    /// Signature failures are counted against the origin and returned as
    /// `InvalidSignature`; the caller drops the fragment silently.
    pub fn ingest(
        &mut self,
        fragment: &Fragment,
        sender: &PublicKey,
        now: Instant,
    ) -> Result<IngestOutcome, TransportError> {
        self.ingest_inner(fragment, sender.node_id(), Some(sender), now)
    }

    /// Ingests a frame from a peer whose key is not yet known, skipping the
    /// signature check. Only self-certifying payloads (hello beacons) may
    /// be trusted out of the result; per-origin quotas still bound the
    /// memory an unknown peer can pin.
    pub fn ingest_unverified(
        &mut self,
        fragment: &Fragment,
        origin: NodeId,
        now: Instant,
    ) -> Result<IngestOutcome, TransportError> {
        self.ingest_inner(fragment, origin, None, now)
    }

    fn ingest_inner(
        &mut self,
        fragment: &Fragment,
        origin: NodeId,
        sender: Option<&PublicKey>,
        now: Instant,
    ) -> Result<IngestOutcome, TransportError> {
        if let Err(err) = fragment.validate() {
            self.stats.invalid_fragments += 1;
            return Err(err);
        }

        if !self.admit_fragment(origin, now) {
            self.stats.rate_limited += 1;
            return Err(TransportError::RateLimited);
        }

        if let Some(sender) = sender
            && let Err(err) = fragment.verify_signature(sender)
        {
            self.stats.intrusion_attempts += 1;
            *self.intrusions_by_origin.entry(origin).or_insert(0) += 1;
            debug!(origin = %origin, "dropping fragment with bad signature");
            return Err(err);
        }

        let message_id = fragment.header.message_id;
        if self.completed_set.contains_key(&message_id) {
            self.stats.duplicates += 1;
            return Ok(IngestOutcome::Duplicate);
        }

        let slot = match self.by_id.get(&message_id) {
            Some(&slot) => slot,
            None => self.create_session(fragment, origin, now)?,
        };

        let session = self.slots[slot]
            .as_mut()
            .ok_or(TransportError::InvalidFragment("stale session slot"))?;
        if fragment.header.total_fragments != session.buffer.total_fragments() {
            return Err(TransportError::InvalidFragment("total fragments changed"));
        }

        let len = fragment.payload.len();
        let inserted = session
            .buffer
            .insert(fragment.header.sequence, fragment.payload.clone())?;
        if !inserted {
            self.stats.duplicates += 1;
            return Ok(IngestOutcome::Duplicate);
        }

        session.last_activity = now;
        session.timeout_at = now + session_timeout(&self.config, session.priority, session.total_fragments());
        if session.state == SessionState::WaitingRetransmission {
            session.state = SessionState::Receiving;
        }
        if fragment.header.flags.contains(FragmentFlags::ACK_REQUIRED) {
            session.ack_required = true;
        }
        if let Some(usage) = self.origins.get_mut(&session.origin) {
            usage.bytes += len;
        }

        if session.buffer.is_complete() {
            let session = self.remove_slot(slot);
            let ack_required = session.ack_required;
            self.remember_completed(session.message_id);
            self.stats.completed += 1;
            let payload = session
                .buffer
                .assemble()
                .ok_or(TransportError::InvalidFragment("incomplete assemble"))?;
            return Ok(IngestOutcome::Complete {
                payload,
                ack_required,
            });
        }

        Ok(IngestOutcome::Accepted {
            missing: self.slots[slot]
                .as_ref()
                .map(|s| s.missing())
                .unwrap_or_default(),
        })
    }

    /// Serves a NACK by resetting the named sequences for immediate
    /// re-request on the next poll.
    pub fn mark_urgent(&mut self, message_id: &MessageId, now: Instant) {
        if let Some(&slot) = self.by_id.get(message_id)
            && let Some(session) = self.slots[slot].as_mut()
        {
            session.next_retransmission_at = now;
        }
    }

    /// Advances timers: expires idle sessions, fails sessions that ran out
    /// of retransmission attempts, and schedules retransmission requests.
    pub fn poll(&mut self, now: Instant) -> Vec<RetransmitPlan> {
        let mut plans = Vec::new();
        for slot in 0..self.slots.len() {
            let Some(session) = self.slots[slot].as_ref() else {
                continue;
            };
            if now >= session.timeout_at
                || now.duration_since(session.last_activity) > session_timeout(
                    &self.config,
                    session.priority,
                    session.total_fragments(),
                )
            {
                let session = self.remove_slot(slot);
                self.stats.expired += 1;
                self.events.push_back(ReassemblyEvent::SessionExpired {
                    message_id: session.message_id,
                });
                debug!(message_id = %session.message_id, "reassembly session expired");
                continue;
            }

            let session = self.slots[slot].as_mut().expect("slot checked above");
            let missing = session.missing();
            if missing.is_empty() || now < session.next_retransmission_at {
                continue;
            }

            if session.retry_count >= self.config.max_retransmission_attempts {
                let session = self.remove_slot(slot);
                self.stats.failed += 1;
                self.events.push_back(ReassemblyEvent::SessionFailed {
                    message_id: session.message_id,
                });
                warn!(message_id = %session.message_id, "reassembly failed: retransmission budget exhausted");
                continue;
            }

            session.retry_count += 1;
            session.state = SessionState::WaitingRetransmission;
            for &seq in &missing {
                *session.attempts_by_sequence.entry(seq).or_insert(0) += 1;
            }
            let delay = backoff_delay(
                self.config.retransmission_base,
                self.config.retransmission_max,
                self.config.retransmission_jitter_pct,
                session.retry_count,
                &mut self.rng,
            );
            session.next_retransmission_at = now + delay;
            plans.push(RetransmitPlan {
                message_id: session.message_id,
                origin: session.origin,
                missing,
                attempt: session.retry_count,
            });
        }
        plans
    }

    pub fn drain_events(&mut self) -> Vec<ReassemblyEvent> {
        self.events.drain(..).collect()
    }

    fn admit_fragment(&mut self, origin: NodeId, now: Instant) -> bool {
        let usage = self.origins.entry(origin).or_default();
        while let Some(&front) = usage.fragment_times.front() {
            if now.duration_since(front) > Duration::from_secs(60) {
                usage.fragment_times.pop_front();
            } else {
                break;
            }
        }
        if usage.fragment_times.len() >= self.config.max_fragments_per_minute {
            return false;
        }
        usage.fragment_times.push_back(now);
        true
    }

    fn create_session(
        &mut self,
        fragment: &Fragment,
        origin: NodeId,
        now: Instant,
    ) -> Result<usize, TransportError> {
        let total = fragment.header.total_fragments;
        if total > MAX_FRAGMENTS_PER_MESSAGE {
            return Err(TransportError::InvalidFragment("too many fragments"));
        }

        {
            let usage = self.origins.entry(origin).or_default();
            if usage.sessions >= self.config.max_sessions_per_origin
                || usage.bytes >= self.config.max_bytes_per_origin
            {
                self.stats.rate_limited += 1;
                return Err(TransportError::RateLimited);
            }
        }

        if self.by_id.len() >= self.config.max_sessions {
            self.evict_oldest();
        }

        let priority = if fragment.header.flags.contains(FragmentFlags::PRIORITY) {
            Priority::High
        } else {
            Priority::Normal
        };
        let session = ReassemblySession {
            message_id: fragment.header.message_id,
            origin,
            kind: None,
            priority,
            state: SessionState::Receiving,
            created_at: now,
            last_activity: now,
            timeout_at: now + session_timeout(&self.config, priority, total),
            retry_count: 0,
            next_retransmission_at: now + self.config.retransmission_base,
            ack_required: false,
            buffer: FragmentBuffer::new(total),
            attempts_by_sequence: HashMap::new(),
        };

        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(session);
                slot
            }
            None => {
                self.slots.push(Some(session));
                self.slots.len() - 1
            }
        };
        self.by_id.insert(fragment.header.message_id, slot);
        self.origins.entry(origin).or_default().sessions += 1;
        self.stats.sessions_created += 1;
        Ok(slot)
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|s| (i, s.last_activity)))
            .min_by_key(|&(_, at)| at);
        if let Some((slot, _)) = oldest {
            let session = self.remove_slot(slot);
            self.stats.evicted += 1;
            self.events.push_back(ReassemblyEvent::SessionEvicted {
                message_id: session.message_id,
            });
            debug!(message_id = %session.message_id, "evicted oldest reassembly session");
        }
    }

    fn remove_slot(&mut self, slot: usize) -> ReassemblySession {
        let session = self.slots[slot].take().expect("slot occupied");
        self.by_id.remove(&session.message_id);
        self.free.push(slot);
        if let Some(usage) = self.origins.get_mut(&session.origin) {
            usage.sessions = usage.sessions.saturating_sub(1);
            usage.bytes = usage.bytes.saturating_sub(session.buffer.current_size());
        }
        session
    }

    fn remember_completed(&mut self, message_id: MessageId) {
        if self.completed.len() >= self.config.completed_cache_size
            && let Some(old) = self.completed.pop_front()
        {
            self.completed_set.remove(&old);
        }
        self.completed.push_back(message_id);
        self.completed_set.insert(message_id, ());
    }
}

/// Exponential backoff with additive uniform jitter.
fn backoff_delay(
    base: Duration,
    max: Duration,
    jitter_pct: f64,
    attempt: u32,
    rng: &mut impl Rng,
) -> Duration {
    let exp = base.saturating_mul(1u32 << attempt.saturating_sub(1).min(16));
    let capped = exp.min(max);
    let jitter = capped.mul_f64(jitter_pct * rng.gen_range(0.0..1.0));
    capped + jitter
}

/// Session timeout, widened for higher-priority and larger messages.
fn session_timeout(config: &ReassemblyConfig, priority: Priority, total: u16) -> Duration {
    let size_factor = 1.0 + f64::from(total) / f64::from(MAX_FRAGMENTS_PER_MESSAGE);
    let priority_factor = match priority {
        Priority::Critical => 2.0,
        Priority::High => 1.5,
        Priority::Normal | Priority::Low => 1.0,
    };
    config.session_timeout.mul_f64(size_factor * priority_factor)
}
