use loramesh_wire::crypto::{self, Signature, SignatureAlgorithm, SigningKeyPair};
use loramesh_wire::error::WireError;

fn seed(byte: u8) -> [u8; 32] {
    [byte; 32]
}

#[test]
fn ed25519_sign_verify_round_trip() {
    let keys = SigningKeyPair::from_seed(SignatureAlgorithm::Ed25519, &seed(1)).unwrap();
    let data = b"fragment header and payload";
    let sig = keys.sign(data);
    assert_eq!(sig.algorithm, SignatureAlgorithm::Ed25519);
    keys.public_key().verify(data, &sig).unwrap();
}

#[test]
fn ed25519_signatures_are_deterministic() {
    let keys = SigningKeyPair::from_seed(SignatureAlgorithm::Ed25519, &seed(2)).unwrap();
    let a = keys.sign(b"payload");
    let b = keys.sign(b"payload");
    assert_eq!(a.bytes, b.bytes);
}

#[test]
fn secp256k1_sign_verify_round_trip() {
    let keys = SigningKeyPair::from_seed(SignatureAlgorithm::Secp256k1, &seed(3)).unwrap();
    let data = b"route reply";
    let sig = keys.sign(data);
    assert_eq!(sig.algorithm, SignatureAlgorithm::Secp256k1);
    keys.public_key().verify(data, &sig).unwrap();

    // RFC 6979: deterministic nonces.
    assert_eq!(keys.sign(data).bytes, sig.bytes);
}

#[test]
fn tampered_data_fails_verification() {
    for algorithm in [SignatureAlgorithm::Ed25519, SignatureAlgorithm::Secp256k1] {
        let keys = SigningKeyPair::from_seed(algorithm, &seed(4)).unwrap();
        let sig = keys.sign(b"original");
        assert_eq!(
            keys.public_key().verify(b"tampered", &sig),
            Err(WireError::InvalidSignature)
        );
    }
}

#[test]
fn cross_key_verification_fails() {
    let alice = SigningKeyPair::from_seed(SignatureAlgorithm::Ed25519, &seed(5)).unwrap();
    let bob = SigningKeyPair::from_seed(SignatureAlgorithm::Ed25519, &seed(6)).unwrap();
    let sig = alice.sign(b"data");
    assert_eq!(
        bob.public_key().verify(b"data", &sig),
        Err(WireError::InvalidSignature)
    );
}

#[test]
fn signature_wire_encoding() {
    let keys = SigningKeyPair::from_seed(SignatureAlgorithm::Ed25519, &seed(7)).unwrap();
    let sig = keys.sign(b"x");
    let encoded = sig.encode();
    assert_eq!(encoded.len(), Signature::ENCODED_LEN);
    assert_eq!(encoded[0], 0x01);
    let decoded = Signature::decode(&encoded).unwrap();
    assert_eq!(decoded, sig);

    assert_eq!(
        Signature::decode(&[0x09; 65]),
        Err(WireError::UnsupportedAlgorithm(0x09))
    );
    assert_eq!(Signature::decode(&encoded[..10]), Err(WireError::Truncated));
}

#[test]
fn message_id_is_truncated_sha256() {
    let id = crypto::message_id(b"payload");
    let full = crypto::sha256(b"payload");
    assert_eq!(id[..], full[..16]);
}

#[test]
fn node_ids_differ_per_key() {
    let a = SigningKeyPair::from_seed(SignatureAlgorithm::Ed25519, &seed(8)).unwrap();
    let b = SigningKeyPair::from_seed(SignatureAlgorithm::Ed25519, &seed(9)).unwrap();
    assert_ne!(a.node_id(), b.node_id());
    assert_eq!(a.node_id(), a.public_key().node_id());
}
