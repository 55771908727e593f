//! Signed routing control messages.

use loramesh_wire::crypto::{NodeId, PublicKey};
use loramesh_wire::signed::SignedMessage;
use serde::{Deserialize, Serialize};

/// Role of a node in the blockchain, as advertised in hellos and replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Full,
    Light,
    Mining,
}

impl NodeType {
    /// Selection rank: nodes that hold a complete UTXO set come first.
    pub fn rank(self) -> u8 {
        match self {
            NodeType::Full | NodeType::Mining => 0,
            NodeType::Light => 1,
        }
    }
}

/// Minimum capabilities a discovered route must satisfy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityConstraints {
    pub min_node_type: NodeType,
    pub min_utxo_completeness: f64,
    pub min_blockchain_height: u64,
}

/// Controlled-flooded route discovery request carrying its path vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteRequest {
    #[serde(rename = "type")]
    pub kind: String,
    pub origin: NodeId,
    pub target: NodeId,
    /// Nodes traversed so far, starting with the originator.
    pub path: Vec<NodeId>,
    pub sequence: u64,
    pub ttl: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub constraints: Option<CapabilityConstraints>,
    pub timestamp: u64,
    pub signature: String,
}

impl RouteRequest {
    pub const TYPE: &'static str = "route_request";
}

/// Reply travelling the reverse path, advertising the destination's state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteReply {
    #[serde(rename = "type")]
    pub kind: String,
    pub origin: NodeId,
    pub target: NodeId,
    /// Full forward path origin -> ... -> target.
    pub path: Vec<NodeId>,
    pub sequence: u64,
    pub node_type: NodeType,
    pub utxo_completeness: f64,
    pub blockchain_height: u64,
    pub last_utxo_sync: u64,
    pub services: Vec<String>,
    pub timestamp: u64,
    pub signature: String,
}

impl RouteReply {
    pub const TYPE: &'static str = "route_reply";
}

/// Notification that a link broke and which destinations it strands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteError {
    #[serde(rename = "type")]
    pub kind: String,
    pub reporter: NodeId,
    pub broken_from: NodeId,
    pub broken_to: NodeId,
    pub unreachable: Vec<NodeId>,
    pub sequence: u64,
    pub timestamp: u64,
    pub signature: String,
}

impl RouteError {
    pub const TYPE: &'static str = "route_error";
}

/// Periodic neighbour beacon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloBeacon {
    #[serde(rename = "type")]
    pub kind: String,
    pub node_id: NodeId,
    /// Advertised verification key; fragment signatures from this node are
    /// checked against it.
    pub public_key: PublicKey,
    pub node_type: NodeType,
    pub blockchain_height: u64,
    pub utxo_completeness: f64,
    pub last_utxo_sync: u64,
    pub services: Vec<String>,
    pub neighbors: Vec<NodeId>,
    pub sequence: u64,
    pub timestamp: u64,
    pub signature: String,
}

impl HelloBeacon {
    pub const TYPE: &'static str = "hello";
}

macro_rules! impl_signed {
    ($($name:ident),+) => {
        $(impl SignedMessage for $name {
            fn signature(&self) -> &str {
                &self.signature
            }

            fn set_signature(&mut self, signature: String) {
                self.signature = signature;
            }
        })+
    };
}

impl_signed!(RouteRequest, RouteReply, RouteError, HelloBeacon);
