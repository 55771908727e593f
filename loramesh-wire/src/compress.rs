//! General-purpose compression adapters and the codec selection policy.

use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};

use crate::error::WireError;
use crate::types::MessageKind;

/// Payloads below this size never compress.
pub const MIN_COMPRESSIBLE_LEN: usize = 16;
/// Above this size a known dictionary beats general compressors on the
/// repetitive payloads this mesh carries.
pub const DICTIONARY_PREFERRED_LEN: usize = 192;

/// Gzip effort levels exposed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GzipLevel {
    Fast,
    Balanced,
    Max,
}

impl GzipLevel {
    fn to_flate2(self) -> Compression {
        match self {
            GzipLevel::Fast => Compression::new(1),
            GzipLevel::Balanced => Compression::new(6),
            GzipLevel::Max => Compression::new(9),
        }
    }
}

/// The codec applied to a payload; the tag byte travels as the first byte
/// of every mesh envelope payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum CodecKind {
    None = 0x00,
    Gzip = 0x01,
    Lz4 = 0x02,
    UtxoCustom = 0x03,
    ProtoLite = 0x04,
    Dictionary = 0x05,
}

impl CodecKind {
    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u8) -> Result<Self, WireError> {
        match tag {
            0x00 => Ok(CodecKind::None),
            0x01 => Ok(CodecKind::Gzip),
            0x02 => Ok(CodecKind::Lz4),
            0x03 => Ok(CodecKind::UtxoCustom),
            0x04 => Ok(CodecKind::ProtoLite),
            0x05 => Ok(CodecKind::Dictionary),
            other => Err(WireError::UnknownCodec(other)),
        }
    }

    /// Advertised compression ratio estimate (output/input) per payload
    /// type, used by the selector and by airtime estimation before the
    /// codec has actually run.
    pub fn estimated_ratio(self, kind: MessageKind) -> f32 {
        match (self, kind) {
            (CodecKind::None, _) => 1.0,
            (CodecKind::UtxoCustom, MessageKind::UtxoTransaction) => 0.55,
            (CodecKind::UtxoCustom, MessageKind::Block) => 0.60,
            (CodecKind::UtxoCustom, _) => 0.85,
            (CodecKind::ProtoLite, MessageKind::UtxoTransaction) => 0.60,
            (CodecKind::ProtoLite, MessageKind::Block) => 0.65,
            (CodecKind::ProtoLite, _) => 0.85,
            (CodecKind::Dictionary, _) => 0.50,
            (CodecKind::Gzip, _) => 0.65,
            (CodecKind::Lz4, _) => 0.75,
        }
    }

    /// Advertised rough throughput in MB/s on the class of hardware these
    /// nodes run on. Only the relative order matters to the selector.
    pub fn estimated_throughput_mbps(self) -> f32 {
        match self {
            CodecKind::None => f32::INFINITY,
            CodecKind::Lz4 => 400.0,
            CodecKind::UtxoCustom => 250.0,
            CodecKind::ProtoLite => 200.0,
            CodecKind::Dictionary => 150.0,
            CodecKind::Gzip => 40.0,
        }
    }
}

pub fn gzip_compress(data: &[u8], level: GzipLevel) -> Result<Vec<u8>, WireError> {
    let mut encoder = GzEncoder::new(Vec::new(), level.to_flate2());
    encoder
        .write_all(data)
        .map_err(|e| WireError::CompressionFailure(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| WireError::CompressionFailure(e.to_string()))
}

pub fn gzip_decompress(data: &[u8]) -> Result<Vec<u8>, WireError> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| WireError::DecompressionFailure(e.to_string()))?;
    Ok(out)
}

pub fn lz4_compress(data: &[u8]) -> Vec<u8> {
    lz4_flex::compress_prepend_size(data)
}

pub fn lz4_decompress(data: &[u8]) -> Result<Vec<u8>, WireError> {
    lz4_flex::decompress_size_prepended(data)
        .map_err(|e| WireError::DecompressionFailure(e.to_string()))
}

/// Picks a codec for a payload.
///
/// Typed transaction/block payloads get the UTXO-custom packer; large
/// repetitive payloads with a known dictionary get the dictionary codec;
/// everything else gets gzip, downgraded to lz4 when the node is already
/// pressed against its duty-cycle window and cannot afford encode latency.
pub fn select_codec(
    kind: MessageKind,
    len: usize,
    duty_constrained: bool,
    has_dictionary: bool,
) -> CodecKind {
    if len < MIN_COMPRESSIBLE_LEN {
        return CodecKind::None;
    }
    match kind {
        MessageKind::UtxoTransaction | MessageKind::Block => CodecKind::UtxoCustom,
        _ => {
            if has_dictionary && len >= DICTIONARY_PREFERRED_LEN {
                CodecKind::Dictionary
            } else if duty_constrained {
                CodecKind::Lz4
            } else {
                CodecKind::Gzip
            }
        }
    }
}
