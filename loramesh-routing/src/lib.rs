//! # LoRa Mesh Routing
//!
//! AODV-style on-demand route discovery biased toward full nodes.
//!
//! Route requests are controlled-flooded with signed path vectors, TTL
//! bounds, and duplicate suppression; replies travel the reverse path and
//! deposit route entries at every hop. Selection prefers full nodes and
//! fresher UTXO state, and broken links go into hold-down so flapping
//! routes cannot reinstall themselves.

pub mod engine;
pub mod error;
pub mod flood;
pub mod messages;
pub mod table;

pub use engine::{
    DropReason, NodeProfile, ReplyDisposition, RequestDisposition, RoutingConfig, RoutingEngine,
    RoutingEvent,
};
pub use error::RoutingError;
pub use flood::FloodCache;
pub use messages::{
    CapabilityConstraints, HelloBeacon, NodeType, RouteError, RouteReply, RouteRequest,
};
pub use table::{RouteEntry, RoutingTable, TableConfig};
