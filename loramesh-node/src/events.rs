//! Typed event surface of the mesh node.

use std::time::Duration;

use loramesh_transport::frame::MessageId;
use loramesh_transport::queue::QueueId;
use loramesh_wire::crypto::NodeId;

use crate::error::MeshError;

/// Everything observable about the node's lifecycle and transport progress.
/// Consumers drain these from `MeshNode::drain_events`.
#[derive(Debug, Clone, PartialEq)]
pub enum MeshEvent {
    Connected,
    Disconnected,
    MessageQueued {
        queue_id: QueueId,
    },
    /// A reliable message was acknowledged end to end.
    MessageDelivered {
        message_id: MessageId,
        attempts: u32,
    },
    RetryScheduled {
        message_id: MessageId,
        attempt: u32,
    },
    MessageFailed {
        message_id: MessageId,
        reason: MeshError,
    },
    MessageExpired {
        queue_id: QueueId,
    },
    /// Transmission deferred by the duty-cycle budget.
    TransmissionDeferred {
        queue_id: QueueId,
        retry_in: Duration,
    },
    /// Emergency bypass exceeded the budget under strict compliance.
    DutyCycleViolation {
        queue_id: QueueId,
    },
    RouteDiscovered {
        target: NodeId,
    },
    RouteDiscoveryFailed {
        target: NodeId,
    },
    ReassemblySessionEvicted {
        message_id: MessageId,
    },
    ReassemblySessionExpired {
        message_id: MessageId,
    },
    ReassemblyFailed {
        message_id: MessageId,
    },
    /// A fragment carried a signature that did not verify.
    IntrusionDetected {
        origin: NodeId,
    },
}
