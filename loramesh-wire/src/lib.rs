//! # LoRa Mesh Wire
//!
//! Wire codecs and crypto primitives for the LoRa UTXO mesh transport.
//!
//! This crate owns everything that turns domain objects into bytes small
//! enough for a 256-byte radio frame:
//!
//! - **Crypto**: Ed25519 / secp256k1 detached signatures, SHA-256 message
//!   ids, CRC32 payload checksums.
//! - **Primitive codecs**: LEB128 varints, fee tiers, relative timestamps,
//!   per-session address interning.
//! - **Payload codecs**: a protobuf-lite schema codec, a UTXO-custom binary
//!   packer, a dictionary codec, and gzip/lz4 adapters.
//! - **Selection**: the policy that picks a codec per payload type and
//!   duty-cycle headroom.

pub mod compact;
pub mod compress;
pub mod crypto;
pub mod dictionary;
pub mod error;
pub mod protolite;
pub mod signed;
pub mod types;
pub mod utxo_codec;
pub mod varint;

pub use compress::{CodecKind, GzipLevel};
pub use crypto::{NodeId, PublicKey, Signature, SignatureAlgorithm, SigningKeyPair};
pub use error::WireError;
pub use types::{MessageKind, UtxoBlock, UtxoInput, UtxoOutput, UtxoTransaction};
