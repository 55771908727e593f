use std::time::Duration;

use loramesh_wire::WireError;
use thiserror::Error;

/// Errors raised by the transport stack. All of these are recoverable;
/// nothing in the core panics on malformed input.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransportError {
    #[error("Invalid fragment: {0}")]
    InvalidFragment(&'static str),
    #[error("CRC32 mismatch: stamped {stamped:#010x}, computed {computed:#010x}")]
    Crc32Mismatch { stamped: u32, computed: u32 },
    #[error("Invalid signature")]
    InvalidSignature,
    #[error("Duplicate fragment")]
    DuplicateFragment,
    #[error("Reassembly session evicted")]
    SessionEvicted,
    #[error("Reassembly session expired")]
    SessionExpired,
    #[error("Origin exceeded its resource quota")]
    RateLimited,
    #[error("Priority queue full")]
    QueueOverflow,
    #[error("Transmission blocked by duty cycle; admissible in {retry_in:?}")]
    DutyCycleBlocked { retry_in: Duration },
    #[error("Duty cycle violated by forced transmission")]
    DutyCycleViolation,
    #[error("Circuit breaker open for peer")]
    CircuitBreakerOpen,
    #[error("Acknowledgment timed out")]
    AckTimeout,
    #[error("Delivery failed after maximum retries")]
    MaxRetriesExceeded,
    #[error("Operation cancelled")]
    Cancelled,
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),
    #[error(transparent)]
    Wire(#[from] WireError),
}
