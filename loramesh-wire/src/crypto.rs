use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use secp256k1::{Message, Secp256k1};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::WireError;

/// Length of a detached signature for both supported algorithms
/// (Ed25519 and secp256k1 compact).
pub const SIGNATURE_LEN: usize = 64;
/// Length of a truncated SHA-256 message id.
pub const MESSAGE_ID_LEN: usize = 16;

/// Signature algorithms supported on the radio link.
///
/// Ed25519 is preferred for fragments; secp256k1 is kept for peers whose
/// identity key doubles as their UTXO key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignatureAlgorithm {
    Ed25519,
    Secp256k1,
}

impl SignatureAlgorithm {
    /// Wire tag prefixed to every detached signature.
    pub fn tag(self) -> u8 {
        match self {
            SignatureAlgorithm::Ed25519 => 0x01,
            SignatureAlgorithm::Secp256k1 => 0x02,
        }
    }

    pub fn from_tag(tag: u8) -> Result<Self, WireError> {
        match tag {
            0x01 => Ok(SignatureAlgorithm::Ed25519),
            0x02 => Ok(SignatureAlgorithm::Secp256k1),
            other => Err(WireError::UnsupportedAlgorithm(other)),
        }
    }
}

/// A node identifier: SHA-256 of the advertised public key bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct NodeId(pub [u8; 32]);

impl NodeId {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Debug for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeId({})", &hex::encode(self.0)[..8])
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl Serialize for NodeId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("node id must be 32 bytes"))?;
        Ok(NodeId(arr))
    }
}

/// A detached, algorithm-tagged signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signature {
    pub algorithm: SignatureAlgorithm,
    pub bytes: [u8; SIGNATURE_LEN],
}

impl Signature {
    /// One-byte algorithm tag followed by the 64-byte signature.
    pub const ENCODED_LEN: usize = 1 + SIGNATURE_LEN;

    pub fn encode(&self) -> [u8; Self::ENCODED_LEN] {
        let mut out = [0u8; Self::ENCODED_LEN];
        out[0] = self.algorithm.tag();
        out[1..].copy_from_slice(&self.bytes);
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        if data.len() < Self::ENCODED_LEN {
            return Err(WireError::Truncated);
        }
        let algorithm = SignatureAlgorithm::from_tag(data[0])?;
        let mut bytes = [0u8; SIGNATURE_LEN];
        bytes.copy_from_slice(&data[1..Self::ENCODED_LEN]);
        Ok(Signature { algorithm, bytes })
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.encode())
    }

    pub fn from_hex(s: &str) -> Result<Self, WireError> {
        let bytes = hex::decode(s).map_err(|_| WireError::Truncated)?;
        Self::decode(&bytes)
    }
}

/// An advertised verification key. Key bytes serialize as hex so beacons
/// stay compact on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey {
    pub algorithm: SignatureAlgorithm,
    /// 32 bytes for Ed25519, 33 bytes (compressed) for secp256k1.
    #[serde(with = "hex_bytes")]
    pub bytes: Vec<u8>,
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}

impl PublicKey {
    pub fn node_id(&self) -> NodeId {
        NodeId(sha256(&self.bytes))
    }

    /// Verifies a detached signature over `data`.
    pub fn verify(&self, data: &[u8], signature: &Signature) -> Result<(), WireError> {
        if signature.algorithm != self.algorithm {
            return Err(WireError::InvalidSignature);
        }
        match self.algorithm {
            SignatureAlgorithm::Ed25519 => {
                let key_bytes: &[u8; 32] = self
                    .bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| WireError::MalformedKey)?;
                let key =
                    VerifyingKey::from_bytes(key_bytes).map_err(|_| WireError::MalformedKey)?;
                let sig = ed25519_dalek::Signature::from_bytes(&signature.bytes);
                key.verify(data, &sig)
                    .map_err(|_| WireError::InvalidSignature)
            }
            SignatureAlgorithm::Secp256k1 => {
                let key = secp256k1::PublicKey::from_slice(&self.bytes)
                    .map_err(|_| WireError::MalformedKey)?;
                let sig = secp256k1::ecdsa::Signature::from_compact(&signature.bytes)
                    .map_err(|_| WireError::InvalidSignature)?;
                let msg = Message::from_digest(sha256(data));
                Secp256k1::verification_only()
                    .verify_ecdsa(&msg, &sig, &key)
                    .map_err(|_| WireError::InvalidSignature)
            }
        }
    }
}

/// A node's signing identity. All signatures are deterministic
/// (RFC 8032 for Ed25519, RFC 6979 for secp256k1).
pub enum SigningKeyPair {
    Ed25519(SigningKey),
    Secp256k1 {
        secret: secp256k1::SecretKey,
        public: secp256k1::PublicKey,
    },
}

impl SigningKeyPair {
    pub fn generate(algorithm: SignatureAlgorithm, rng: &mut (impl rand::RngCore + rand::CryptoRng)) -> Self {
        match algorithm {
            SignatureAlgorithm::Ed25519 => SigningKeyPair::Ed25519(SigningKey::generate(rng)),
            SignatureAlgorithm::Secp256k1 => {
                let (secret, public) = Secp256k1::new().generate_keypair(rng);
                SigningKeyPair::Secp256k1 { secret, public }
            }
        }
    }

    /// Builds a key pair from a fixed 32-byte seed. Not every seed is a
    /// valid secp256k1 scalar; those fail with `MalformedKey`.
    pub fn from_seed(algorithm: SignatureAlgorithm, seed: &[u8; 32]) -> Result<Self, WireError> {
        match algorithm {
            SignatureAlgorithm::Ed25519 => Ok(SigningKeyPair::Ed25519(SigningKey::from_bytes(seed))),
            SignatureAlgorithm::Secp256k1 => {
                let secret =
                    secp256k1::SecretKey::from_slice(seed).map_err(|_| WireError::MalformedKey)?;
                let public = secp256k1::PublicKey::from_secret_key(&Secp256k1::new(), &secret);
                Ok(SigningKeyPair::Secp256k1 { secret, public })
            }
        }
    }

    pub fn algorithm(&self) -> SignatureAlgorithm {
        match self {
            SigningKeyPair::Ed25519(_) => SignatureAlgorithm::Ed25519,
            SigningKeyPair::Secp256k1 { .. } => SignatureAlgorithm::Secp256k1,
        }
    }

    pub fn public_key(&self) -> PublicKey {
        match self {
            SigningKeyPair::Ed25519(key) => PublicKey {
                algorithm: SignatureAlgorithm::Ed25519,
                bytes: key.verifying_key().to_bytes().to_vec(),
            },
            SigningKeyPair::Secp256k1 { public, .. } => PublicKey {
                algorithm: SignatureAlgorithm::Secp256k1,
                bytes: public.serialize().to_vec(),
            },
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.public_key().node_id()
    }

    pub fn sign(&self, data: &[u8]) -> Signature {
        match self {
            SigningKeyPair::Ed25519(key) => Signature {
                algorithm: SignatureAlgorithm::Ed25519,
                bytes: key.sign(data).to_bytes(),
            },
            SigningKeyPair::Secp256k1 { secret, .. } => {
                let msg = Message::from_digest(sha256(data));
                let sig = Secp256k1::new().sign_ecdsa(&msg, secret);
                Signature {
                    algorithm: SignatureAlgorithm::Secp256k1,
                    bytes: sig.serialize_compact(),
                }
            }
        }
    }
}

pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Message id: the first 16 bytes of the payload's SHA-256.
pub fn message_id(payload: &[u8]) -> [u8; MESSAGE_ID_LEN] {
    let digest = sha256(payload);
    let mut id = [0u8; MESSAGE_ID_LEN];
    id.copy_from_slice(&digest[..MESSAGE_ID_LEN]);
    id
}

pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}
