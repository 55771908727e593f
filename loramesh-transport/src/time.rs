use std::fmt::Debug;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

/// Clock abstraction. The monotonic instant drives every retry, expiry, and
/// duty-cycle window; wall-clock milliseconds appear only in transmission
/// records and logs.
pub trait TimeProvider: Debug + Send + Sync {
    fn now_instant(&self) -> Instant;
    fn now_unix_ms(&self) -> u64;
}

/// The real clock.
#[derive(Debug, Default)]
pub struct SystemTimeProvider;

impl TimeProvider for SystemTimeProvider {
    fn now_instant(&self) -> Instant {
        Instant::now()
    }

    fn now_unix_ms(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// A manual clock for deterministic tests.
#[derive(Debug)]
pub struct ManualTimeProvider {
    instant: RwLock<Instant>,
    unix_ms: RwLock<u64>,
}

impl ManualTimeProvider {
    pub fn new(instant: Instant, unix_ms: u64) -> Self {
        Self {
            instant: RwLock::new(instant),
            unix_ms: RwLock::new(unix_ms),
        }
    }

    pub fn advance(&self, duration: Duration) {
        *self.instant.write() += duration;
        *self.unix_ms.write() += duration.as_millis() as u64;
    }
}

impl TimeProvider for ManualTimeProvider {
    fn now_instant(&self) -> Instant {
        *self.instant.read()
    }

    fn now_unix_ms(&self) -> u64 {
        *self.unix_ms.read()
    }
}
