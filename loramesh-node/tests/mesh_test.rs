use std::sync::Arc;
use std::time::{Duration, Instant};

use loramesh_node::config::MeshConfig;
use loramesh_node::error::MeshError;
use loramesh_node::events::MeshEvent;
use loramesh_node::node::MeshNode;
use loramesh_node::storage::{MemoryStorage, Storage, QUEUE_PREFIX, ROUTE_PREFIX, TXREC_PREFIX};
use loramesh_routing::engine::NodeProfile;
use loramesh_routing::messages::NodeType;
use loramesh_transport::queue::QueueConfig;
use loramesh_transport::time::{ManualTimeProvider, TimeProvider};
use loramesh_wire::crypto::{NodeId, SignatureAlgorithm, SigningKeyPair};
use loramesh_wire::types::{MessageKind, UtxoBlock, UtxoOutput, UtxoTransaction};
use loramesh_wire::utxo_codec;
use rand::SeedableRng;

struct TestNode {
    id: NodeId,
    node: MeshNode<MemoryStorage>,
}

fn clock() -> Arc<ManualTimeProvider> {
    Arc::new(ManualTimeProvider::new(Instant::now(), 1_700_000_000_000))
}

fn profile(node_type: NodeType) -> NodeProfile {
    NodeProfile {
        node_type,
        utxo_completeness: 1.0,
        blockchain_height: 100,
        last_utxo_sync: 1_700_000_000,
        services: vec!["relay".to_owned()],
    }
}

/// Test nodes run with a relaxed duty-cycle override unless a test is
/// explicitly about throttling.
fn relaxed_config() -> MeshConfig {
    MeshConfig {
        max_duty_cycle_percent: Some(100.0),
        ..MeshConfig::default()
    }
}

fn build(seed: u8, node_type: NodeType, time: &Arc<ManualTimeProvider>, config: MeshConfig) -> TestNode {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    let keys = SigningKeyPair::from_seed(SignatureAlgorithm::Ed25519, &[seed; 32]).unwrap();
    let mut rng = rand::rngs::StdRng::seed_from_u64(u64::from(seed));
    let mut node = MeshNode::new(
        config,
        keys,
        profile(node_type),
        time.clone() as Arc<dyn TimeProvider>,
        MemoryStorage::new(),
        &mut rng,
    )
    .unwrap();
    node.connect();
    TestNode {
        id: node.node_id(),
        node,
    }
}

/// Polls `from` and feeds every frame to `to`, collecting completed
/// messages.
fn pump(from: &mut TestNode, to: &mut TestNode) -> Vec<loramesh_wire::types::MeshMessage> {
    let frames = from.node.poll();
    let mut delivered = Vec::new();
    for frame in frames {
        if let Ok(Some(message)) = to.node.receive_frame(&frame, from.id) {
            delivered.push(message);
        }
    }
    delivered
}

/// Hello exchange so both nodes learn each other's keys and 1-hop routes.
fn introduce(a: &mut TestNode, b: &mut TestNode) {
    pump(a, b);
    pump(b, a);
    assert!(a.node.routing().peer_key(&b.id).is_some());
    assert!(b.node.routing().peer_key(&a.id).is_some());
}

fn sample_tx(id: &[u8], fee: u32) -> UtxoTransaction {
    UtxoTransaction {
        id: id.to_vec(),
        inputs: vec![],
        outputs: vec![UtxoOutput {
            amount: 100,
            address: "A".to_owned(),
            script_pubkey: Vec::new(),
        }],
        fee,
        timestamp: 1_700_000_000u64 as u32,
        signature: Vec::new(),
    }
}

#[test]
fn connect_disconnect_is_idempotent_and_signalled() {
    let time = clock();
    let mut n = build(1, NodeType::Full, &time, relaxed_config());
    n.node.connect();
    n.node.connect();
    let events = n.node.drain_events();
    assert_eq!(
        events.iter().filter(|e| **e == MeshEvent::Connected).count(),
        1
    );

    n.node.disconnect();
    n.node.disconnect();
    let events = n.node.drain_events();
    assert_eq!(
        events.iter().filter(|e| **e == MeshEvent::Disconnected).count(),
        1
    );

    assert_eq!(
        n.node
            .send_utxo_transaction(&sample_tx(b"t0", 1))
            .unwrap_err(),
        MeshError::NotConnected
    );
    assert!(n.node.poll().is_empty());
}

#[test]
fn happy_path_transaction_round_trips_byte_identical() {
    let time = clock();
    let mut a = build(1, NodeType::Full, &time, relaxed_config());
    let mut b = build(2, NodeType::Full, &time, relaxed_config());
    introduce(&mut a, &mut b);

    let tx = sample_tx(b"t1", 10);
    let queue_id = a.node.send_utxo_transaction(&tx).unwrap();
    assert!(a
        .node
        .drain_events()
        .contains(&MeshEvent::MessageQueued { queue_id }));

    let delivered = pump(&mut a, &mut b);
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].kind, MessageKind::UtxoTransaction);
    let decoded = utxo_codec::decode_transaction(&delivered[0].payload).unwrap();
    assert_eq!(decoded, tx);

    let stats = a.node.stats();
    assert!(stats.frames_sent > 0);
    assert!(stats.duty_cycle.transmissions > 0);
}

#[test]
fn multi_fragment_block_survives_fragment_loss() {
    let time = clock();
    let mut a = build(1, NodeType::Full, &time, relaxed_config());
    let mut b = build(2, NodeType::Full, &time, relaxed_config());
    introduce(&mut a, &mut b);

    // A block large enough for several fragments.
    let transactions = (0..8u8)
        .map(|i| {
            let mut tx = sample_tx(format!("block-tx-{i}").as_bytes(), 5);
            tx.outputs[0].script_pubkey = vec![i; 48];
            tx.signature = vec![i; 32];
            tx
        })
        .collect();
    let block = UtxoBlock {
        index: 7,
        timestamp: 1_000,
        transactions,
        previous_hash: vec![1; 32],
        hash: vec![2; 32],
        merkle_root: vec![3; 32],
        nonce: 42,
        difficulty: 3,
    };
    a.node.send_block(&block).unwrap();

    let frames = a.node.poll();
    assert!(frames.len() >= 3, "expected a multi-fragment block");

    // Drop the second fragment on transport.
    let mut delivered = Vec::new();
    for (i, frame) in frames.iter().enumerate() {
        if i == 1 {
            continue;
        }
        if let Ok(Some(message)) = b.node.receive_frame(frame, a.id) {
            delivered.push(message);
        }
    }
    assert!(delivered.is_empty(), "incomplete message must not deliver");

    // After the retransmission backoff, B requests the missing fragment.
    time.advance(Duration::from_secs(2));
    let request_frames = b.node.poll();
    assert!(!request_frames.is_empty(), "expected a retransmission request");
    for frame in request_frames {
        assert!(a.node.receive_frame(&frame, b.id).unwrap().is_none());
    }

    // A serves it from the fragment cache; B completes the block.
    let retransmission = a.node.poll();
    assert!(!retransmission.is_empty());
    let mut completed = Vec::new();
    for frame in retransmission {
        if let Ok(Some(message)) = b.node.receive_frame(&frame, a.id) {
            completed.push(message);
        }
    }
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].kind, MessageKind::Block);
    let decoded = utxo_codec::decode_block(&completed[0].payload).unwrap();
    assert_eq!(decoded, block);
}

#[test]
fn emergency_transaction_preempts_a_full_queue() {
    let time = clock();
    let config = MeshConfig {
        queue: QueueConfig {
            max_total_messages: 105,
            emergency_reserve: 5,
            capacity_by_priority: [105, 105, 105, 105],
            memory_limit_bytes: 10 * 1024 * 1024,
            ..QueueConfig::default()
        },
        ..relaxed_config()
    };
    let mut a = build(1, NodeType::Full, &time, config);
    let mut b = build(2, NodeType::Full, &time, relaxed_config());
    introduce(&mut a, &mut b);

    for i in 0..100u32 {
        let tx = sample_tx(format!("low-{i}").as_bytes(), 0);
        a.node.send_utxo_transaction(&tx).unwrap();
    }
    let emergency_tx = sample_tx(b"emergency", 0);
    a.node.send_emergency_utxo_transaction(&emergency_tx).unwrap();
    assert_eq!(a.node.stats().queue.evicted, 0, "reserve absorbed it");

    let delivered = pump(&mut a, &mut b);
    assert!(delivered.len() > 1);
    // The emergency transaction is dequeued before any Low-priority item.
    let first = utxo_codec::decode_transaction(&delivered[0].payload).unwrap();
    assert_eq!(first.id, b"emergency".to_vec());
}

#[test]
fn duty_cycle_throttles_and_recovers() {
    let time = clock();
    // Strict EU limits, no override: the default band budget is tight.
    let mut a = build(1, NodeType::Full, &time, MeshConfig::default());
    let mut b = build(2, NodeType::Full, &time, relaxed_config());
    introduce(&mut a, &mut b);

    for i in 0..40u32 {
        let tx = sample_tx(format!("tx-{i}").as_bytes(), 1);
        a.node.send_utxo_transaction(&tx).unwrap();
    }
    let frames_now = a.node.poll();
    assert!(
        frames_now.len() < 40,
        "duty cycle must defer part of the burst, sent {}",
        frames_now.len()
    );
    let events = a.node.drain_events();
    assert!(
        events
            .iter()
            .any(|e| matches!(e, MeshEvent::TransmissionDeferred { .. })),
        "expected a deferral event"
    );
    assert!(a.node.stats().queue.len > 0);

    // When the window slides, the remainder drains.
    time.advance(Duration::from_secs(3700));
    let frames_later = a.node.poll();
    assert!(!frames_later.is_empty(), "deferred messages must drain");
}

#[test]
fn routed_proof_is_delivered_and_acknowledged() {
    let time = clock();
    let mut a = build(1, NodeType::Full, &time, relaxed_config());
    let mut b = build(2, NodeType::Full, &time, relaxed_config());
    introduce(&mut a, &mut b);

    let proof: Vec<u8> = b"merkle-branch:".repeat(30);
    a.node.send_merkle_proof(&proof, b.id).unwrap();

    let delivered = pump(&mut a, &mut b);
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].kind, MessageKind::MerkleProof);
    assert_eq!(delivered[0].payload, proof);

    // B acknowledges; A records the delivery.
    let acks = pump(&mut b, &mut a);
    assert!(acks.is_empty());
    let events = a.node.drain_events();
    assert!(
        events
            .iter()
            .any(|e| matches!(e, MeshEvent::MessageDelivered { .. })),
        "expected delivery confirmation, got {events:?}"
    );
    assert_eq!(a.node.stats().delivery.delivered, 1);
    assert!(b.node.stats().frames_received > 0);
}

/// Feeds pre-collected frames into one receiver.
fn deliver(
    frames: &[Vec<u8>],
    from: NodeId,
    to: &mut TestNode,
) -> Vec<loramesh_wire::types::MeshMessage> {
    let mut delivered = Vec::new();
    for frame in frames {
        if let Ok(Some(message)) = to.node.receive_frame(frame, from) {
            delivered.push(message);
        }
    }
    delivered
}

#[test]
fn multi_hop_discovery_relays_and_acknowledges() {
    let time = clock();
    // Radio topology: X <-> M <-> Y; X cannot hear Y.
    let mut x = build(1, NodeType::Light, &time, relaxed_config());
    let mut m = build(2, NodeType::Full, &time, relaxed_config());
    let mut y = build(3, NodeType::Full, &time, relaxed_config());
    introduce(&mut x, &mut m);
    time.advance(Duration::from_secs(31));
    introduce(&mut m, &mut y);

    let proof: Vec<u8> = b"proof-of-inclusion:".repeat(12);
    x.node.send_merkle_proof(&proof, y.id).unwrap();

    // X floods a route request; M relays it; Y replies along the reverse
    // path through M.
    let request = x.node.poll();
    deliver(&request, x.id, &mut m);
    let forwarded = m.node.poll();
    deliver(&forwarded, m.id, &mut y);
    // X also hears the rebroadcast and drops it as a loop.
    deliver(&forwarded, m.id, &mut x);
    let reply = y.node.poll();
    deliver(&reply, y.id, &mut m);
    let reply_fwd = m.node.poll();
    deliver(&reply_fwd, m.id, &mut x);

    // The parked proof now dispatches through M.
    let proof_frames = x.node.poll();
    assert!(
        x.node
            .drain_events()
            .contains(&MeshEvent::RouteDiscovered { target: y.id })
    );
    assert_eq!(x.node.routing().next_hop(&y.id, time.now_instant()), Some(m.id));
    deliver(&proof_frames, x.id, &mut m);

    // M emits the link ACK to X and the relayed proof to Y.
    let m_frames = m.node.poll();
    let at_y = deliver(&m_frames, m.id, &mut y);
    deliver(&m_frames, m.id, &mut x);

    assert_eq!(at_y.len(), 1);
    assert_eq!(at_y[0].kind, MessageKind::MerkleProof);
    assert_eq!(at_y[0].payload, proof);
    assert!(
        x.node
            .drain_events()
            .iter()
            .any(|e| matches!(e, MeshEvent::MessageDelivered { .. })),
        "first-hop delivery must be acknowledged"
    );
}

#[test]
fn discovery_timeout_fails_queued_messages_with_no_route() {
    let time = clock();
    let mut a = build(1, NodeType::Full, &time, relaxed_config());
    let stranger = NodeId([9; 32]);

    a.node.send_merkle_proof(b"proof", stranger).unwrap();
    // First poll starts a discovery; nobody answers.
    a.node.poll();

    time.advance(Duration::from_secs(20));
    a.node.poll();
    let events = a.node.drain_events();
    assert!(events.contains(&MeshEvent::RouteDiscoveryFailed { target: stranger }));
    assert!(events.iter().any(|e| matches!(
        e,
        MeshEvent::MessageFailed {
            reason: MeshError::NoRoute,
            ..
        }
    )));
    assert_eq!(a.node.stats().queue.len, 0);
}

#[test]
fn snapshots_persist_and_restore_through_kv() {
    let time = clock();
    let mut a = build(1, NodeType::Full, &time, relaxed_config());
    let mut b = build(2, NodeType::Full, &time, relaxed_config());
    introduce(&mut a, &mut b);

    // One transmitted message, one still queued.
    a.node.send_utxo_transaction(&sample_tx(b"sent", 5)).unwrap();
    pump(&mut a, &mut b);
    a.node.send_utxo_transaction(&sample_tx(b"parked", 5)).unwrap();

    a.node.persist_snapshot();
    let storage = a.node.storage();
    assert!(!storage.scan_prefix(TXREC_PREFIX).is_empty());
    assert!(!storage.scan_prefix(ROUTE_PREFIX).is_empty());
    assert_eq!(storage.scan_prefix(QUEUE_PREFIX).len(), 1);

    // A fresh node picks the queue snapshot back up.
    let snapshot = storage.clone();
    let keys = SigningKeyPair::from_seed(SignatureAlgorithm::Ed25519, &[7; 32]).unwrap();
    let mut rng = rand::rngs::StdRng::seed_from_u64(7);
    let mut restored = MeshNode::new(
        relaxed_config(),
        keys,
        profile(NodeType::Full),
        time.clone() as Arc<dyn TimeProvider>,
        snapshot,
        &mut rng,
    )
    .unwrap();
    restored.connect();
    assert_eq!(restored.restore_queue_snapshot(), 1);
    assert_eq!(restored.stats().queue.len, 1);
}

#[test]
fn transmission_history_is_wall_clock_stamped() {
    let time = clock();
    let mut a = build(1, NodeType::Full, &time, relaxed_config());
    let mut b = build(2, NodeType::Full, &time, relaxed_config());
    introduce(&mut a, &mut b);

    a.node.send_utxo_transaction(&sample_tx(b"t", 1)).unwrap();
    pump(&mut a, &mut b);

    let history = a.node.transmission_history();
    assert!(!history.is_empty());
    assert!(history.iter().all(|r| r.started_unix_ms >= 1_700_000_000_000));
    assert!(history.iter().all(|r| r.duration_ms > 0));
}
