use loramesh_wire::compact::AddressInterner;
use loramesh_wire::types::{MeshMessage, MessageKind, UtxoBlock, UtxoInput, UtxoOutput, UtxoTransaction};
use loramesh_wire::{protolite, utxo_codec};
use proptest::prelude::*;

fn sample_tx() -> UtxoTransaction {
    UtxoTransaction {
        id: b"t1".to_vec(),
        inputs: vec![UtxoInput {
            tx_hash: vec![0xaa; 32],
            output_index: 3,
            script_sig: b"sig-bytes".to_vec(),
        }],
        outputs: vec![
            UtxoOutput {
                amount: 100,
                address: "A".to_owned(),
                script_pubkey: b"OP_CHECKSIG".to_vec(),
            },
            UtxoOutput {
                amount: 250,
                address: "B".to_owned(),
                script_pubkey: Vec::new(),
            },
        ],
        fee: 10,
        timestamp: 1_700_000_000u64 as u32,
        signature: vec![0x55; 64],
    }
}

fn sample_block() -> UtxoBlock {
    UtxoBlock {
        index: 42,
        timestamp: 123_456,
        transactions: vec![sample_tx(), sample_tx()],
        previous_hash: vec![1; 32],
        hash: vec![2; 32],
        merkle_root: vec![3; 32],
        nonce: 99_999,
        difficulty: 4,
    }
}

#[test]
fn protolite_transaction_round_trip() {
    let tx = sample_tx();
    let mut interner = AddressInterner::new();
    let encoded = protolite::encode_transaction(&tx, &mut interner);
    let decoded = protolite::decode_transaction(&encoded, &interner).unwrap();
    assert_eq!(decoded, tx);
}

#[test]
fn protolite_interner_is_shared_across_messages() {
    let tx = sample_tx();
    let mut interner = AddressInterner::new();
    let first = protolite::encode_transaction(&tx, &mut interner);
    let second = protolite::encode_transaction(&tx, &mut interner);
    // Same session, same ids: identical bytes.
    assert_eq!(first, second);
    assert_eq!(interner.len(), 2);
    assert_eq!(protolite::decode_transaction(&second, &interner).unwrap(), tx);
}

#[test]
fn protolite_block_round_trip() {
    let block = sample_block();
    let mut interner = AddressInterner::new();
    let encoded = protolite::encode_block(&block, &mut interner);
    let decoded = protolite::decode_block(&encoded, &interner).unwrap();
    assert_eq!(decoded, block);
}

#[test]
fn protolite_mesh_message_round_trip() {
    let msg = MeshMessage {
        kind: MessageKind::MerkleProof,
        payload: vec![9; 300],
        timestamp: 7_777,
        from_id: vec![1; 32],
        to_id: vec![2; 32],
        signature: vec![3; 64],
    };
    let encoded = protolite::encode_mesh_message(&msg);
    let decoded = protolite::decode_mesh_message(&encoded).unwrap();
    assert_eq!(decoded, msg);
}

#[test]
fn protolite_skips_unknown_fields() {
    let tx = sample_tx();
    let mut interner = AddressInterner::new();
    let mut encoded = protolite::encode_transaction(&tx, &mut interner);
    // Append field 15, varint wire type, value 7: (15 << 3) | 0 = 120.
    encoded.extend_from_slice(&[120, 7]);
    let decoded = protolite::decode_transaction(&encoded, &interner).unwrap();
    assert_eq!(decoded, tx);
}

#[test]
fn utxo_custom_transaction_round_trip_is_exact() {
    let tx = sample_tx();
    let encoded = utxo_codec::encode_transaction(&tx);
    let decoded = utxo_codec::decode_transaction(&encoded).unwrap();
    assert_eq!(decoded, tx);
}

#[test]
fn utxo_custom_block_round_trip_is_exact() {
    let block = sample_block();
    let encoded = utxo_codec::encode_block(&block);
    let decoded = utxo_codec::decode_block(&encoded).unwrap();
    assert_eq!(decoded, block);
}

#[test]
fn utxo_custom_rejects_trailing_garbage() {
    let mut encoded = utxo_codec::encode_transaction(&sample_tx());
    encoded.push(0);
    assert!(utxo_codec::decode_transaction(&encoded).is_err());
}

#[test]
fn utxo_custom_rejects_truncation() {
    let encoded = utxo_codec::encode_transaction(&sample_tx());
    for cut in [0, 1, encoded.len() / 2, encoded.len() - 1] {
        assert!(utxo_codec::decode_transaction(&encoded[..cut]).is_err());
    }
}

proptest! {
    #[test]
    fn utxo_custom_round_trips_any_transaction(
        id in proptest::collection::vec(any::<u8>(), 0..40),
        fee in any::<u32>(),
        timestamp in any::<u32>(),
        amounts in proptest::collection::vec(any::<u32>(), 0..8),
        script in proptest::collection::vec(any::<u8>(), 0..64),
    ) {
        let outputs = amounts
            .iter()
            .enumerate()
            .map(|(i, &amount)| UtxoOutput {
                amount,
                address: format!("addr-{i}"),
                script_pubkey: script.clone(),
            })
            .collect();
        let tx = UtxoTransaction {
            id,
            inputs: vec![],
            outputs,
            fee,
            timestamp,
            signature: script.clone(),
        };
        let encoded = utxo_codec::encode_transaction(&tx);
        prop_assert_eq!(utxo_codec::decode_transaction(&encoded).unwrap(), tx);
    }
}
