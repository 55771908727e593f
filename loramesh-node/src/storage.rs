//! Key-value persistence boundary.
//!
//! The node persists snapshots of its routing table, priority queue, and
//! transmission ledger under namespace prefixes through this interface;
//! the actual backing store lives outside the core.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Namespace prefixes used by the snapshot writer.
pub const ROUTE_PREFIX: &str = "route/";
pub const QUEUE_PREFIX: &str = "queue/";
pub const TXREC_PREFIX: &str = "txrec/";
pub const SESSION_PREFIX: &str = "session/";

/// Minimal single-writer key-value interface.
pub trait Storage {
    fn get(&self, key: &str) -> Option<Vec<u8>>;
    fn put(&mut self, key: &str, value: Vec<u8>);
    fn delete(&mut self, key: &str);
    fn scan_prefix(&self, prefix: &str) -> Vec<(String, Vec<u8>)>;

    fn clear_prefix(&mut self, prefix: &str) {
        for (key, _) in self.scan_prefix(prefix) {
            self.delete(&key);
        }
    }
}

/// In-memory store for tests and ephemeral nodes.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    entries: BTreeMap<String, Vec<u8>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.entries.get(key).cloned()
    }

    fn put(&mut self, key: &str, value: Vec<u8>) {
        self.entries.insert(key.to_owned(), value);
    }

    fn delete(&mut self, key: &str) {
        self.entries.remove(key);
    }

    fn scan_prefix(&self, prefix: &str) -> Vec<(String, Vec<u8>)> {
        self.entries
            .range(prefix.to_owned()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }
}

/// Serializable mirror of a transmission record; monotonic instants do not
/// survive a restart, so only wall-clock fields are persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransmissionRecordSnapshot {
    pub started_unix_ms: u64,
    pub duration_ms: u64,
    pub frequency_mhz: f64,
    pub power_dbm: f64,
    pub kind: loramesh_wire::types::MessageKind,
}

/// Serializable mirror of a route entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteEntrySnapshot {
    pub destination: loramesh_wire::crypto::NodeId,
    pub next_hop: loramesh_wire::crypto::NodeId,
    pub hop_count: u8,
    pub sequence: u64,
    pub node_type: loramesh_routing::messages::NodeType,
    pub utxo_completeness: f64,
    pub blockchain_height: u64,
    pub link_quality: f64,
    pub last_utxo_sync: u64,
}

/// Serializable descriptor of an in-flight reassembly session. Fragment
/// payloads are not persisted; the descriptor is for the audit surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub message_id: String,
    pub origin: loramesh_wire::crypto::NodeId,
    pub total_fragments: u16,
    pub received_count: u16,
    pub missing: Vec<u16>,
}

/// Serializable mirror of a queued message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedMessageSnapshot {
    pub queue_id: String,
    pub kind: loramesh_wire::types::MessageKind,
    pub payload_hex: String,
    pub destination: Option<loramesh_wire::crypto::NodeId>,
    pub priority: u8,
    pub emergency: bool,
    pub fee: u64,
    pub block_height: u64,
}
