use loramesh_routing::RoutingError;
use loramesh_transport::TransportError;
use loramesh_wire::WireError;
use thiserror::Error;

/// Top-level error surface of the mesh node. Everything except
/// `ConfigInvalid` is recoverable and non-fatal to the node.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MeshError {
    #[error("Node is not connected")]
    NotConnected,
    #[error("No route to destination")]
    NoRoute,
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Routing(#[from] RoutingError),
    #[error(transparent)]
    Wire(#[from] WireError),
}
