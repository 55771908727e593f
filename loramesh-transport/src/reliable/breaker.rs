//! Per-peer circuit breakers.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use loramesh_wire::crypto::NodeId;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerPhase {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
struct BreakerState {
    phase: BreakerPhase,
    consecutive_failures: u32,
    opened_at: Instant,
    probe_in_flight: bool,
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures that open the breaker.
    pub failure_threshold: u32,
    /// Open duration before a half-open probe is allowed.
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown: Duration::from_secs(30),
        }
    }
}

/// Fail-fast wrapper around peers known to be failing.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    peers: HashMap<NodeId, BreakerState>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            peers: HashMap::new(),
        }
    }

    pub fn phase(&self, peer: &NodeId) -> BreakerPhase {
        self.peers
            .get(peer)
            .map(|s| s.phase)
            .unwrap_or(BreakerPhase::Closed)
    }

    /// Returns true when a send to `peer` may proceed. While open, only a
    /// single probe is let through after the cool-down.
    pub fn allow(&mut self, peer: &NodeId, now: Instant) -> bool {
        let Some(state) = self.peers.get_mut(peer) else {
            return true;
        };
        match state.phase {
            BreakerPhase::Closed => true,
            BreakerPhase::Open => {
                if now.duration_since(state.opened_at) >= self.config.cooldown {
                    state.phase = BreakerPhase::HalfOpen;
                    state.probe_in_flight = true;
                    debug!(peer = %peer, "circuit breaker half-open, probing");
                    true
                } else {
                    false
                }
            }
            BreakerPhase::HalfOpen => {
                if state.probe_in_flight {
                    false
                } else {
                    state.probe_in_flight = true;
                    true
                }
            }
        }
    }

    pub fn on_success(&mut self, peer: &NodeId) {
        if let Some(state) = self.peers.get_mut(peer) {
            if state.phase != BreakerPhase::Closed {
                info!(peer = %peer, "circuit breaker closed");
            }
            state.phase = BreakerPhase::Closed;
            state.consecutive_failures = 0;
            state.probe_in_flight = false;
        }
    }

    pub fn on_failure(&mut self, peer: &NodeId, now: Instant) {
        let state = self.peers.entry(*peer).or_insert(BreakerState {
            phase: BreakerPhase::Closed,
            consecutive_failures: 0,
            opened_at: now,
            probe_in_flight: false,
        });
        state.consecutive_failures += 1;
        state.probe_in_flight = false;
        match state.phase {
            BreakerPhase::HalfOpen => {
                state.phase = BreakerPhase::Open;
                state.opened_at = now;
                debug!(peer = %peer, "probe failed, breaker re-opened");
            }
            BreakerPhase::Closed if state.consecutive_failures >= self.config.failure_threshold => {
                state.phase = BreakerPhase::Open;
                state.opened_at = now;
                info!(peer = %peer, failures = state.consecutive_failures, "circuit breaker opened");
            }
            _ => {}
        }
    }
}
