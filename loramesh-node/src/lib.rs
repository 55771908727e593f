//! # LoRa Mesh Node
//!
//! The mesh orchestrator tying the transport stack together: compression
//! selection, the priority queue, duty-cycle scheduling, fragmentation,
//! reliable delivery, and routing, behind one sans-IO public API.
//!
//! ```no_run
//! use std::sync::Arc;
//! use loramesh_node::{MeshConfig, MeshNode, MemoryStorage};
//! use loramesh_routing::engine::NodeProfile;
//! use loramesh_routing::messages::NodeType;
//! use loramesh_transport::time::SystemTimeProvider;
//! use loramesh_wire::crypto::{SignatureAlgorithm, SigningKeyPair};
//!
//! let mut rng = rand::thread_rng();
//! let keys = SigningKeyPair::generate(SignatureAlgorithm::Ed25519, &mut rng);
//! let profile = NodeProfile {
//!     node_type: NodeType::Full,
//!     utxo_completeness: 1.0,
//!     blockchain_height: 0,
//!     last_utxo_sync: 0,
//!     services: vec![],
//! };
//! let mut node = MeshNode::new(
//!     MeshConfig::default(),
//!     keys,
//!     profile,
//!     Arc::new(SystemTimeProvider),
//!     MemoryStorage::new(),
//!     &mut rng,
//! )
//! .unwrap();
//! node.connect();
//! let frames = node.poll(); // hand these to the radio driver
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod node;
pub mod storage;

pub use config::MeshConfig;
pub use error::MeshError;
pub use events::MeshEvent;
pub use node::{MeshNode, MeshStats, SendOptions};
pub use storage::{MemoryStorage, Storage};
