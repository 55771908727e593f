//! Canonical-JSON signing for control messages.
//!
//! Control traffic (retransmission requests, ACKs, routing messages) travels
//! as JSON. The detached signature covers the serialized structure with the
//! signature field set to the empty string; serde_json emits fields in
//! declaration order, which makes that serialization canonical.

use serde::Serialize;

use crate::crypto::{PublicKey, Signature, SigningKeyPair};
use crate::error::WireError;

/// A JSON message carrying a hex-encoded detached signature field.
pub trait SignedMessage: Serialize + Clone {
    fn signature(&self) -> &str;
    fn set_signature(&mut self, signature: String);

    fn canonical_bytes(&self) -> Vec<u8> {
        let mut unsigned = self.clone();
        unsigned.set_signature(String::new());
        // Serializing these plain structs cannot fail.
        serde_json::to_vec(&unsigned).unwrap_or_default()
    }

    fn sign_with(&mut self, keys: &SigningKeyPair) {
        let signature = keys.sign(&self.canonical_bytes()).to_hex();
        self.set_signature(signature);
    }

    fn verify_with(&self, sender: &PublicKey) -> Result<(), WireError> {
        let signature =
            Signature::from_hex(self.signature()).map_err(|_| WireError::InvalidSignature)?;
        sender.verify(&self.canonical_bytes(), &signature)
    }
}
