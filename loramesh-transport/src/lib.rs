//! # LoRa Mesh Transport
//!
//! The duty-cycle-aware transport stack for the LoRa UTXO mesh:
//!
//! - **Fragmentation**: splits blockchain messages into signed, CRC32-stamped
//!   radio frames no larger than 256 bytes.
//! - **Reassembly**: bitmap-tracked sessions with missing-fragment detection,
//!   selective retransmission requests, and bounded memory.
//! - **Priority queue**: a fee-weighted binary heap feeding the scheduler.
//! - **Duty cycle**: regional airtime ledgers gating every transmission.
//! - **Reliable delivery**: ACK tracking, backoff with jitter, per-peer
//!   circuit breakers, and a dead-letter queue.
//!
//! Everything here is sans-IO: components are plain state machines fed a
//! monotonic `Instant` by the orchestrator, which makes the whole stack
//! deterministic under test.

pub mod bitset;
pub mod cache;
pub mod control;
pub mod dutycycle;
pub mod error;
pub mod fragmenter;
pub mod frame;
pub mod queue;
pub mod reassembly;
pub mod reliable;
pub mod time;

pub use bitset::BitSet;
pub use error::TransportError;
pub use fragmenter::fragment_payload;
pub use frame::{Fragment, FragmentFlags, FragmentHeader, MessageId};
pub use queue::{PrioritizedMessage, Priority, PriorityQueue, QueueConfig, QueueId};
pub use reassembly::{IngestOutcome, Reassembler, ReassemblyConfig, SessionState};
pub use reliable::{DeliveryEvent, DeliveryManager, Reliability, RetryPolicy};
pub use time::{ManualTimeProvider, SystemTimeProvider, TimeProvider};
