use thiserror::Error;

/// Errors raised by the wire codecs and crypto primitives.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("Invalid signature")]
    InvalidSignature,
    #[error("Unsupported signature algorithm tag {0:#04x}")]
    UnsupportedAlgorithm(u8),
    #[error("Malformed key")]
    MalformedKey,
    #[error("Unexpected end of input")]
    Truncated,
    #[error("Varint exceeds 32 bits")]
    VarintOverflow,
    #[error("Unknown wire type {0}")]
    UnknownWireType(u8),
    #[error("Unknown message kind {0:#04x}")]
    UnknownMessageKind(u8),
    #[error("Unknown codec tag {0:#04x}")]
    UnknownCodec(u8),
    #[error("Unknown address id {0}")]
    UnknownAddressId(u32),
    #[error("Timestamp {0} precedes the session origin epoch")]
    TimestampBeforeOrigin(u64),
    /// Compression failed. Stored as a string because the underlying io
    /// errors are not Clone/Eq.
    #[error("Compression failed: {0}")]
    CompressionFailure(String),
    #[error("Decompression failed: {0}")]
    DecompressionFailure(String),
    #[error("Unknown dictionary id {0}")]
    UnknownDictionaryId(u16),
    #[error("Truncated dictionary reference")]
    TruncatedDictionaryRef,
}
