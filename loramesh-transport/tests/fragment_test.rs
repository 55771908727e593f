use loramesh_transport::frame::{Fragment, FragmentFlags, FragmentHeader, HEADER_LEN, MessageId, payload_cap};
use loramesh_transport::fragmenter::{concat_payloads, fragment_payload};
use loramesh_transport::error::TransportError;
use loramesh_wire::crypto::{SignatureAlgorithm, SigningKeyPair};
use loramesh_wire::types::MessageKind;

fn keys() -> SigningKeyPair {
    SigningKeyPair::from_seed(SignatureAlgorithm::Ed25519, &[7; 32]).unwrap()
}

#[test]
fn single_frame_path_sets_both_boundary_flags() {
    let payload = vec![1u8; 64];
    let frags = fragment_payload(&payload, MessageKind::UtxoTransaction, true, true, &keys()).unwrap();
    assert_eq!(frags.len(), 1);
    let flags = frags[0].header.flags;
    assert!(flags.contains(FragmentFlags::FIRST));
    assert!(flags.contains(FragmentFlags::LAST));
    assert!(flags.contains(FragmentFlags::PRIORITY));
    assert!(flags.contains(FragmentFlags::ACK_REQUIRED));
    assert_eq!(frags[0].header.total_fragments, 1);
}

#[test]
fn per_type_caps_drive_fragment_count() {
    let payload = vec![9u8; 500];
    // UTXO_TX cap 180 -> 3 fragments; BLOCK cap 197 -> 3; MERKLE_PROOF cap 150 -> 4.
    assert_eq!(payload_cap(MessageKind::UtxoTransaction), 180);
    assert_eq!(payload_cap(MessageKind::Block), 197);
    assert_eq!(payload_cap(MessageKind::MerkleProof), 150);
    let tx = fragment_payload(&payload, MessageKind::UtxoTransaction, false, false, &keys()).unwrap();
    assert_eq!(tx.len(), 3);
    let proof = fragment_payload(&payload, MessageKind::MerkleProof, false, false, &keys()).unwrap();
    assert_eq!(proof.len(), 4);
}

#[test]
fn fragment_round_trip_preserves_payload_under_reordering() {
    let payload: Vec<u8> = (0..1000).map(|i| (i % 251) as u8).collect();
    let mut frags = fragment_payload(&payload, MessageKind::Block, false, false, &keys()).unwrap();
    frags.reverse();
    frags.swap(0, 2);
    assert_eq!(concat_payloads(frags), payload);
}

#[test]
fn boundary_flags_only_on_boundaries() {
    let payload = vec![3u8; 600];
    let frags = fragment_payload(&payload, MessageKind::Block, true, false, &keys()).unwrap();
    assert_eq!(frags.len(), 4);
    for (i, frag) in frags.iter().enumerate() {
        let h = &frag.header;
        assert_eq!(h.flags.contains(FragmentFlags::FIRST), i == 0);
        assert_eq!(h.flags.contains(FragmentFlags::LAST), i == frags.len() - 1);
        // PRIORITY is copied onto the boundary fragments only.
        let boundary = i == 0 || i == frags.len() - 1;
        assert_eq!(h.flags.contains(FragmentFlags::PRIORITY), boundary);
        assert_eq!(h.sequence as usize, i);
        frag.validate().unwrap();
    }
}

#[test]
fn message_id_is_shared_and_content_derived() {
    let payload = vec![5u8; 400];
    let frags = fragment_payload(&payload, MessageKind::Block, false, false, &keys()).unwrap();
    let expected = MessageId::from_payload(&payload);
    assert!(frags.iter().all(|f| f.header.message_id == expected));
}

#[test]
fn header_wire_layout_is_little_endian() {
    let header = FragmentHeader {
        message_id: MessageId([0xAB; 16]),
        sequence: 0x0102,
        total_fragments: 0x0304,
        fragment_size: 0x0506,
        flags: FragmentFlags::FIRST | FragmentFlags::PRIORITY,
        checksum: 0x0708090A,
    };
    let bytes = header.encode();
    assert_eq!(bytes.len(), HEADER_LEN);
    assert_eq!(&bytes[..16], &[0xAB; 16]);
    assert_eq!(&bytes[16..18], &[0x02, 0x01]);
    assert_eq!(&bytes[18..20], &[0x04, 0x03]);
    assert_eq!(&bytes[20..22], &[0x06, 0x05]);
    assert_eq!(bytes[22], 0x05);
    assert_eq!(&bytes[23..27], &[0x0A, 0x09, 0x08, 0x07]);
    assert_eq!(FragmentHeader::decode(&bytes).unwrap(), header);
}

#[test]
fn frame_encode_decode_round_trip() {
    let payload = vec![11u8; 96];
    let frags = fragment_payload(&payload, MessageKind::UtxoTransaction, false, true, &keys()).unwrap();
    let encoded = frags[0].encode();
    let decoded = Fragment::decode(&encoded).unwrap();
    assert_eq!(decoded, frags[0]);
    decoded.validate().unwrap();
    decoded.verify_signature(&keys().public_key()).unwrap();
}

#[test]
fn tampered_payload_fails_crc() {
    let payload = vec![1u8; 50];
    let frags = fragment_payload(&payload, MessageKind::UtxoTransaction, false, false, &keys()).unwrap();
    let mut frag = frags[0].clone();
    frag.payload[0] ^= 0xFF;
    match frag.validate() {
        Err(TransportError::Crc32Mismatch { .. }) => {}
        other => panic!("expected CRC mismatch, got {other:?}"),
    }
}

#[test]
fn forged_header_fails_signature() {
    let payload = vec![1u8; 50];
    let frags = fragment_payload(&payload, MessageKind::Block, false, false, &keys()).unwrap();
    let mut frag = frags[0].clone();
    // Re-stamp the CRC so only the signature check can catch the forgery.
    frag.payload[0] ^= 0xFF;
    frag.header.checksum = loramesh_wire::crypto::crc32(&frag.payload);
    assert!(frag.validate().is_ok());
    assert_eq!(
        frag.verify_signature(&keys().public_key()),
        Err(TransportError::InvalidSignature)
    );
}

#[test]
fn wrong_key_fails_signature() {
    let payload = vec![1u8; 50];
    let frags = fragment_payload(&payload, MessageKind::Block, false, false, &keys()).unwrap();
    let other = SigningKeyPair::from_seed(SignatureAlgorithm::Ed25519, &[8; 32]).unwrap();
    assert_eq!(
        frags[0].verify_signature(&other.public_key()),
        Err(TransportError::InvalidSignature)
    );
}

#[test]
fn empty_payload_is_rejected() {
    assert!(matches!(
        fragment_payload(&[], MessageKind::Block, false, false, &keys()),
        Err(TransportError::InvalidFragment(_))
    ));
}

proptest::proptest! {
    #[test]
    fn any_payload_survives_fragmentation(
        payload in proptest::collection::vec(proptest::prelude::any::<u8>(), 1..2048),
        kind_idx in 0usize..3,
    ) {
        let kind = [MessageKind::UtxoTransaction, MessageKind::Block, MessageKind::MerkleProof][kind_idx];
        let frags = fragment_payload(&payload, kind, false, false, &keys()).unwrap();
        let cap = payload_cap(kind);
        proptest::prop_assert_eq!(frags.len(), payload.len().div_ceil(cap));
        for frag in &frags {
            frag.validate().unwrap();
        }
        proptest::prop_assert_eq!(concat_payloads(frags), payload);
    }
}
