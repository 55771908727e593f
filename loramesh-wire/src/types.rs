//! Domain payload types carried over the mesh.

use serde::{Deserialize, Serialize};

use crate::error::WireError;

/// High-level kind of a mesh payload. Drives fragmentation caps, codec
/// selection, and flood preemption ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageKind {
    UtxoTransaction = 0x01,
    Block = 0x02,
    MerkleProof = 0x03,
    RouteControl = 0x04,
    Ack = 0x05,
    Sync = 0x06,
    Discovery = 0x07,
}

impl MessageKind {
    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u8) -> Result<Self, WireError> {
        match tag {
            0x01 => Ok(MessageKind::UtxoTransaction),
            0x02 => Ok(MessageKind::Block),
            0x03 => Ok(MessageKind::MerkleProof),
            0x04 => Ok(MessageKind::RouteControl),
            0x05 => Ok(MessageKind::Ack),
            0x06 => Ok(MessageKind::Sync),
            0x07 => Ok(MessageKind::Discovery),
            other => Err(WireError::UnknownMessageKind(other)),
        }
    }

    /// Preemption rank when the flood queue is saturated. Lower wins.
    pub fn flood_rank(self) -> u8 {
        match self {
            MessageKind::UtxoTransaction => 0,
            MessageKind::Block => 1,
            MessageKind::Sync => 2,
            MessageKind::Discovery | MessageKind::RouteControl => 3,
            MessageKind::MerkleProof | MessageKind::Ack => 2,
        }
    }
}

/// A spend of an existing output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtxoInput {
    pub tx_hash: Vec<u8>,
    pub output_index: u32,
    pub script_sig: Vec<u8>,
}

/// A newly created output, locked to an address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtxoOutput {
    pub amount: u32,
    pub address: String,
    pub script_pubkey: Vec<u8>,
}

/// A UTXO transaction as carried on the mesh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtxoTransaction {
    pub id: Vec<u8>,
    pub inputs: Vec<UtxoInput>,
    pub outputs: Vec<UtxoOutput>,
    pub fee: u32,
    pub timestamp: u32,
    pub signature: Vec<u8>,
}

impl UtxoTransaction {
    /// Serialized size estimate used for fee-per-byte scoring before the
    /// payload codec has run.
    pub fn estimated_size(&self) -> usize {
        let inputs: usize = self
            .inputs
            .iter()
            .map(|i| i.tx_hash.len() + 4 + i.script_sig.len())
            .sum();
        let outputs: usize = self
            .outputs
            .iter()
            .map(|o| 4 + o.address.len() + o.script_pubkey.len())
            .sum();
        self.id.len() + inputs + outputs + self.signature.len() + 12
    }
}

/// A block as carried on the mesh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtxoBlock {
    pub index: u32,
    pub timestamp: u32,
    pub transactions: Vec<UtxoTransaction>,
    pub previous_hash: Vec<u8>,
    pub hash: Vec<u8>,
    pub merkle_root: Vec<u8>,
    pub nonce: u32,
    pub difficulty: u32,
}

/// The reassembled mesh envelope: kind, addressing, and an opaque payload
/// whose first byte is the codec tag that compressed it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshMessage {
    pub kind: MessageKind,
    pub payload: Vec<u8>,
    pub timestamp: u32,
    pub from_id: Vec<u8>,
    pub to_id: Vec<u8>,
    pub signature: Vec<u8>,
}
