//! Signed control messages: retransmission requests and ACK/NACK.
//!
//! These travel as canonical JSON. The signature field is computed over the
//! serialized structure with `signature` set to the empty string, so field
//! order (declaration order under serde_json) is the canonical order.

use loramesh_wire::crypto::{NodeId, PublicKey, SigningKeyPair};
use loramesh_wire::signed::SignedMessage;
use serde::{Deserialize, Serialize};

use crate::error::TransportError;
use crate::frame::MessageId;

/// Missing-fragment lists longer than this travel as a compressed bitmap.
pub const BITMAP_THRESHOLD: usize = 10;

/// Bitmap form of a missing-fragment set: bit `i` of `bits` (hex, LSB
/// first per byte) stands for sequence `base + i`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressedBitmap {
    pub base: u16,
    pub bits: String,
}

impl CompressedBitmap {
    pub fn from_sequences(sequences: &[u16]) -> Option<Self> {
        let base = *sequences.iter().min()?;
        let last = *sequences.iter().max()?;
        let span = (last - base) as usize + 1;
        let mut bytes = vec![0u8; span.div_ceil(8)];
        for &seq in sequences {
            let offset = (seq - base) as usize;
            bytes[offset / 8] |= 1 << (offset % 8);
        }
        Some(CompressedBitmap {
            base,
            bits: hex::encode(bytes),
        })
    }

    pub fn to_sequences(&self) -> Result<Vec<u16>, TransportError> {
        let bytes = hex::decode(&self.bits)
            .map_err(|_| TransportError::InvalidFragment("malformed bitmap"))?;
        let mut out = Vec::new();
        for (byte_idx, byte) in bytes.iter().enumerate() {
            for bit in 0..8 {
                if byte & (1 << bit) != 0 {
                    out.push(self.base + (byte_idx * 8 + bit) as u16);
                }
            }
        }
        Ok(out)
    }
}

/// Request that the sender re-emit the listed fragments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetransmissionRequest {
    #[serde(rename = "type")]
    pub kind: String,
    pub message_id: MessageId,
    pub missing_fragments: Vec<u16>,
    pub request_id: String,
    pub timestamp: u64,
    pub node_id: NodeId,
    pub signature: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compressed_bitmap: Option<CompressedBitmap>,
}

impl RetransmissionRequest {
    pub const TYPE: &'static str = "retransmission_request";

    pub fn new(
        message_id: MessageId,
        missing: Vec<u16>,
        request_id: String,
        timestamp: u64,
        node_id: NodeId,
    ) -> Self {
        let (missing_fragments, compressed_bitmap) = if missing.len() > BITMAP_THRESHOLD {
            (Vec::new(), CompressedBitmap::from_sequences(&missing))
        } else {
            (missing, None)
        };
        RetransmissionRequest {
            kind: Self::TYPE.to_owned(),
            message_id,
            missing_fragments,
            request_id,
            timestamp,
            node_id,
            signature: String::new(),
            compressed_bitmap,
        }
    }

    /// All requested sequences, whichever form they travelled in.
    pub fn sequences(&self) -> Result<Vec<u16>, TransportError> {
        match &self.compressed_bitmap {
            Some(bitmap) => bitmap.to_sequences(),
            None => Ok(self.missing_fragments.clone()),
        }
    }

    pub fn sign(&mut self, keys: &SigningKeyPair) {
        self.sign_with(keys);
    }

    pub fn verify(&self, sender: &PublicKey) -> Result<(), TransportError> {
        self.verify_with(sender)
            .map_err(|_| TransportError::InvalidSignature)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckKind {
    Ack,
    Nack,
}

/// Positive or negative acknowledgment of fragments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Acknowledgment {
    #[serde(rename = "type")]
    pub kind: AckKind,
    pub message_id: MessageId,
    pub from_node_id: NodeId,
    pub timestamp: u64,
    /// Every sequence up to and including this one is acknowledged.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cumulative_ack: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acknowledged_fragments: Option<Vec<u16>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nack_fragments: Option<Vec<u16>>,
    pub signature: String,
}

impl Acknowledgment {
    pub fn ack_cumulative(
        message_id: MessageId,
        up_to: u16,
        from: NodeId,
        timestamp: u64,
    ) -> Self {
        Acknowledgment {
            kind: AckKind::Ack,
            message_id,
            from_node_id: from,
            timestamp,
            cumulative_ack: Some(up_to),
            acknowledged_fragments: None,
            nack_fragments: None,
            signature: String::new(),
        }
    }

    pub fn ack_list(
        message_id: MessageId,
        fragments: Vec<u16>,
        from: NodeId,
        timestamp: u64,
    ) -> Self {
        Acknowledgment {
            kind: AckKind::Ack,
            message_id,
            from_node_id: from,
            timestamp,
            cumulative_ack: None,
            acknowledged_fragments: Some(fragments),
            nack_fragments: None,
            signature: String::new(),
        }
    }

    pub fn nack(message_id: MessageId, fragments: Vec<u16>, from: NodeId, timestamp: u64) -> Self {
        Acknowledgment {
            kind: AckKind::Nack,
            message_id,
            from_node_id: from,
            timestamp,
            cumulative_ack: None,
            acknowledged_fragments: None,
            nack_fragments: Some(fragments),
            signature: String::new(),
        }
    }

    pub fn sign(&mut self, keys: &SigningKeyPair) {
        self.sign_with(keys);
    }

    pub fn verify(&self, sender: &PublicKey) -> Result<(), TransportError> {
        self.verify_with(sender)
            .map_err(|_| TransportError::InvalidSignature)
    }
}

impl SignedMessage for RetransmissionRequest {
    fn signature(&self) -> &str {
        &self.signature
    }

    fn set_signature(&mut self, signature: String) {
        self.signature = signature;
    }
}

impl SignedMessage for Acknowledgment {
    fn signature(&self) -> &str {
        &self.signature
    }

    fn set_signature(&mut self, signature: String) {
        self.signature = signature;
    }
}
