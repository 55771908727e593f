//! The radio frame: a 27-byte header, up to 197 bytes of payload, and a
//! detached algorithm-tagged signature over header and payload.

use bitflags::bitflags;
use loramesh_wire::crypto::{self, PublicKey, Signature, SigningKeyPair};
use loramesh_wire::types::MessageKind;
use serde::{Deserialize, Serialize};

use crate::error::TransportError;

/// Fixed header length on the wire.
pub const HEADER_LEN: usize = 27;
/// Hard cap on a radio frame.
pub const MAX_RADIO_FRAME: usize = 256;
/// Largest payload any fragment may carry.
pub const MAX_FRAGMENT_PAYLOAD: usize = 197;
/// Upper bound on fragments per message; bounds reassembly memory.
pub const MAX_FRAGMENTS_PER_MESSAGE: u16 = 1024;
/// 64-bit words for a bitset covering `MAX_FRAGMENTS_PER_MESSAGE`.
pub const BITSET_WORDS: usize = (MAX_FRAGMENTS_PER_MESSAGE as usize).div_ceil(64);

/// Per-type payload caps. Transactions and proofs leave headroom for the
/// signature suffix inside a single radio frame.
pub fn payload_cap(kind: MessageKind) -> usize {
    match kind {
        MessageKind::UtxoTransaction => 180,
        MessageKind::Block => MAX_FRAGMENT_PAYLOAD,
        MessageKind::MerkleProof => 150,
        _ => MAX_FRAGMENT_PAYLOAD,
    }
}

/// Truncated SHA-256 of the pre-fragment payload.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct MessageId(pub [u8; 16]);

impl MessageId {
    pub fn from_payload(payload: &[u8]) -> Self {
        MessageId(crypto::message_id(payload))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Debug for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MessageId({})", &hex::encode(self.0)[..8])
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl Serialize for MessageId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for MessageId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        let arr: [u8; 16] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("message id must be 16 bytes"))?;
        Ok(MessageId(arr))
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FragmentFlags: u8 {
        const FIRST = 0x01;
        const LAST = 0x02;
        const PRIORITY = 0x04;
        const ACK_REQUIRED = 0x08;
    }
}

/// The 27-byte fragment header. All multi-byte fields are little-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    pub message_id: MessageId,
    pub sequence: u16,
    pub total_fragments: u16,
    pub fragment_size: u16,
    pub flags: FragmentFlags,
    pub checksum: u32,
}

impl FragmentHeader {
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..16].copy_from_slice(&self.message_id.0);
        out[16..18].copy_from_slice(&self.sequence.to_le_bytes());
        out[18..20].copy_from_slice(&self.total_fragments.to_le_bytes());
        out[20..22].copy_from_slice(&self.fragment_size.to_le_bytes());
        out[22] = self.flags.bits();
        out[23..27].copy_from_slice(&self.checksum.to_le_bytes());
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, TransportError> {
        if data.len() < HEADER_LEN {
            return Err(TransportError::InvalidFragment("header truncated"));
        }
        let mut id = [0u8; 16];
        id.copy_from_slice(&data[0..16]);
        Ok(FragmentHeader {
            message_id: MessageId(id),
            sequence: u16::from_le_bytes([data[16], data[17]]),
            total_fragments: u16::from_le_bytes([data[18], data[19]]),
            fragment_size: u16::from_le_bytes([data[20], data[21]]),
            flags: FragmentFlags::from_bits_truncate(data[22]),
            checksum: u32::from_le_bytes([data[23], data[24], data[25], data[26]]),
        })
    }
}

/// A fully formed radio frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub header: FragmentHeader,
    pub payload: Vec<u8>,
    pub signature: Signature,
}

impl Fragment {
    /// Builds and signs a fragment. The CRC32 covers the payload; the
    /// signature covers header-then-payload.
    pub fn build(
        message_id: MessageId,
        sequence: u16,
        total_fragments: u16,
        flags: FragmentFlags,
        payload: Vec<u8>,
        keys: &SigningKeyPair,
    ) -> Self {
        let header = FragmentHeader {
            message_id,
            sequence,
            total_fragments,
            fragment_size: payload.len() as u16,
            flags,
            checksum: crypto::crc32(&payload),
        };
        let mut signing_bytes = Vec::with_capacity(HEADER_LEN + payload.len());
        signing_bytes.extend_from_slice(&header.encode());
        signing_bytes.extend_from_slice(&payload);
        let signature = keys.sign(&signing_bytes);
        Fragment {
            header,
            payload,
            signature,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len() + Signature::ENCODED_LEN);
        out.extend_from_slice(&self.header.encode());
        out.extend_from_slice(&self.payload);
        out.extend_from_slice(&self.signature.encode());
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, TransportError> {
        let header = FragmentHeader::decode(data)?;
        let payload_len = header.fragment_size as usize;
        if payload_len > MAX_FRAGMENT_PAYLOAD {
            return Err(TransportError::InvalidFragment("payload exceeds cap"));
        }
        let payload_end = HEADER_LEN + payload_len;
        if data.len() < payload_end + Signature::ENCODED_LEN {
            return Err(TransportError::InvalidFragment("frame truncated"));
        }
        let payload = data[HEADER_LEN..payload_end].to_vec();
        let signature = Signature::decode(&data[payload_end..])?;
        Ok(Fragment {
            header,
            payload,
            signature,
        })
    }

    /// Structural validation: flag/sequence invariants and the CRC32.
    pub fn validate(&self) -> Result<(), TransportError> {
        let h = &self.header;
        if h.total_fragments == 0 {
            return Err(TransportError::InvalidFragment("zero total fragments"));
        }
        if h.total_fragments > MAX_FRAGMENTS_PER_MESSAGE {
            return Err(TransportError::InvalidFragment("too many fragments"));
        }
        if h.sequence >= h.total_fragments {
            return Err(TransportError::InvalidFragment("sequence out of range"));
        }
        if h.fragment_size as usize != self.payload.len() {
            return Err(TransportError::InvalidFragment("size field mismatch"));
        }
        if h.flags.contains(FragmentFlags::FIRST) != (h.sequence == 0) {
            return Err(TransportError::InvalidFragment("FIRST flag mismatch"));
        }
        if h.flags.contains(FragmentFlags::LAST) != (h.sequence == h.total_fragments - 1) {
            return Err(TransportError::InvalidFragment("LAST flag mismatch"));
        }
        let computed = crypto::crc32(&self.payload);
        if computed != h.checksum {
            return Err(TransportError::Crc32Mismatch {
                stamped: h.checksum,
                computed,
            });
        }
        Ok(())
    }

    /// Verifies the detached signature under the sender's advertised key.
    pub fn verify_signature(&self, sender: &PublicKey) -> Result<(), TransportError> {
        let mut signing_bytes = Vec::with_capacity(HEADER_LEN + self.payload.len());
        signing_bytes.extend_from_slice(&self.header.encode());
        signing_bytes.extend_from_slice(&self.payload);
        sender
            .verify(&signing_bytes, &self.signature)
            .map_err(|_| TransportError::InvalidSignature)
    }
}
