use thiserror::Error;

/// Routing-layer errors. Dropping a flood packet is normal operation and is
/// reported as a disposition, not an error; these are for callers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoutingError {
    #[error("No route to destination")]
    NoRoute,
    #[error("Packet path contains this node")]
    RouteLoop,
    #[error("TTL exceeded")]
    TtlExceeded,
    #[error("Invalid signature on routing message")]
    InvalidSignature,
    #[error("Invalid routing configuration: {0}")]
    ConfigInvalid(String),
}
