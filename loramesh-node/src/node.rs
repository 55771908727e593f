//! The mesh orchestrator.
//!
//! `MeshNode` owns every transport component and is the only code that
//! mutates them. It is sans-IO: `poll` returns radio frames to transmit and
//! `receive_frame` ingests frames the radio heard, both driven by the
//! node's `TimeProvider`. The radio driver and any async runtime live
//! outside the core.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use loramesh_routing::engine::{
    NodeProfile, ReplyDisposition, RequestDisposition, RoutingEngine, RoutingEvent, RoutingStats,
};
use loramesh_routing::messages::{HelloBeacon, RouteError, RouteReply, RouteRequest};
use loramesh_transport::cache::FragmentCache;
use loramesh_transport::control::{Acknowledgment, AckKind, RetransmissionRequest};
use loramesh_transport::dutycycle::{Admission, BandUsage, DutyCycleManager, DutyCycleStats};
use loramesh_transport::error::TransportError;
use loramesh_transport::frame::{Fragment, MessageId};
use loramesh_transport::fragmenter::fragment_payload;
use loramesh_transport::queue::{
    PrioritizedMessage, Priority, PriorityQueue, QueueId, QueueStats,
};
use loramesh_transport::reassembly::{
    IngestOutcome, Reassembler, ReassemblyEvent, ReassemblyStats,
};
use loramesh_transport::reliable::{
    DeliveryEvent, DeliveryManager, DeliveryStats, Reliability,
};
use loramesh_transport::time::TimeProvider;
use loramesh_wire::compress::{self, CodecKind};
use loramesh_wire::crypto::{NodeId, Signature, SigningKeyPair};
use loramesh_wire::dictionary::DictionaryCodec;
use loramesh_wire::protolite;
use loramesh_wire::types::{MeshMessage, MessageKind, UtxoBlock, UtxoTransaction};
use loramesh_wire::{utxo_codec, WireError};
use rand::RngCore;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::config::MeshConfig;
use crate::error::MeshError;
use crate::events::MeshEvent;
use crate::storage::{
    QueuedMessageSnapshot, RouteEntrySnapshot, SessionSnapshot, Storage,
    TransmissionRecordSnapshot, QUEUE_PREFIX, ROUTE_PREFIX, SESSION_PREFIX, TXREC_PREFIX,
};

/// Aggregated observability snapshot.
#[derive(Debug, Clone)]
pub struct MeshStats {
    pub duty_cycle: DutyCycleStats,
    pub band_usage: Vec<BandUsage>,
    pub queue: QueueStats,
    pub delivery: DeliveryStats,
    pub reassembly: ReassemblyStats,
    pub routing: RoutingStats,
    pub frames_sent: u64,
    pub frames_received: u64,
}

/// Options for `send_message`.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub destination: Option<NodeId>,
    pub emergency: bool,
    pub fee: u64,
    pub input_count: u32,
    pub output_count: u32,
    pub block_height: u64,
}

pub struct MeshNode<S: Storage> {
    config: MeshConfig,
    keys: SigningKeyPair,
    self_id: NodeId,
    time: Arc<dyn TimeProvider>,
    connected: bool,
    emergency_mode: bool,

    queue: PriorityQueue,
    duty: DutyCycleManager,
    delivery: DeliveryManager,
    reassembler: Reassembler,
    routing: RoutingEngine,
    fragment_cache: FragmentCache,
    dictionary: Option<DictionaryCodec>,
    storage: S,

    /// Queue ids parked on a pending route discovery per destination.
    awaiting_route: HashMap<NodeId, Vec<QueueId>>,
    outbox: Vec<Vec<u8>>,
    events: VecDeque<MeshEvent>,
    frames_sent: u64,
    frames_received: u64,
    frequency_mhz: f64,
}

impl<S: Storage> MeshNode<S> {
    /// Builds a node. `ConfigInvalid` is the only synchronous error.
    pub fn new(
        config: MeshConfig,
        keys: SigningKeyPair,
        profile: NodeProfile,
        time: Arc<dyn TimeProvider>,
        storage: S,
        rng: &mut dyn RngCore,
    ) -> Result<Self, MeshError> {
        config.validate()?;
        let mut queue_config = config.queue.clone();
        queue_config.high_fee_per_byte = config.high_fee_sat_per_byte;
        queue_config.normal_fee_per_byte = config.normal_fee_sat_per_byte;

        let duty = DutyCycleManager::new(config.duty_cycle_config()?)?;
        let frequency_mhz = duty.config().region.default_frequency_mhz();
        let self_id = keys.node_id();
        Ok(Self {
            queue: PriorityQueue::new(queue_config),
            delivery: DeliveryManager::new(config.delivery_config(), rng)?,
            reassembler: Reassembler::new(config.reassembly.clone(), rng),
            routing: RoutingEngine::new(self_id, profile, config.routing_config()),
            fragment_cache: FragmentCache::new(config.fragment_cache.clone()),
            duty,
            dictionary: None,
            storage,
            config,
            keys,
            self_id,
            time,
            connected: false,
            emergency_mode: false,
            awaiting_route: HashMap::new(),
            outbox: Vec::new(),
            events: VecDeque::new(),
            frames_sent: 0,
            frames_received: 0,
            frequency_mhz,
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.self_id
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Idempotent; the transition is event-signalled.
    pub fn connect(&mut self) {
        if !self.connected {
            self.connected = true;
            self.events.push_back(MeshEvent::Connected);
            info!(node = %self.self_id, "mesh node connected");
        }
    }

    /// Idempotent; queued state survives a disconnect.
    pub fn disconnect(&mut self) {
        if self.connected {
            self.connected = false;
            self.events.push_back(MeshEvent::Disconnected);
            info!(node = %self.self_id, "mesh node disconnected");
        }
    }

    /// Emergency mode boosts every priority one step, for queued messages
    /// as well as new ones, and allows duty-cycle bypass when the override
    /// is enabled.
    pub fn set_emergency_mode(&mut self, enabled: bool) {
        if enabled && !self.emergency_mode {
            let now = self.time.now_instant();
            let boosts: Vec<(QueueId, Priority)> = self
                .queue
                .snapshot()
                .map(|message| (message.queue_id, message.priority.boost()))
                .collect();
            for (queue_id, priority) in boosts {
                self.queue.update_priority(&queue_id, priority, now);
            }
        }
        self.emergency_mode = enabled;
    }

    pub fn set_dictionary(&mut self, dictionary: DictionaryCodec) {
        self.dictionary = Some(dictionary);
    }

    pub fn routing(&self) -> &RoutingEngine {
        &self.routing
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn drain_events(&mut self) -> Vec<MeshEvent> {
        self.events.drain(..).collect()
    }

    pub fn stats(&self) -> MeshStats {
        let now = self.time.now_instant();
        MeshStats {
            duty_cycle: self.duty.stats().clone(),
            band_usage: self.duty.band_usage(now),
            queue: self.queue.stats(),
            delivery: self.delivery.stats(),
            reassembly: self.reassembler.stats(),
            routing: self.routing.stats(),
            frames_sent: self.frames_sent,
            frames_received: self.frames_received,
        }
    }

    /// Wall-clock transmission records for the regulatory audit window.
    pub fn transmission_history(&self) -> Vec<TransmissionRecordSnapshot> {
        self.duty
            .history()
            .map(|rec| TransmissionRecordSnapshot {
                started_unix_ms: rec.started_unix_ms,
                duration_ms: rec.duration.as_millis() as u64,
                frequency_mhz: rec.frequency_mhz,
                power_dbm: rec.power_dbm,
                kind: rec.kind,
            })
            .collect()
    }

    /// Queues an arbitrary payload. General-purpose compression is selected
    /// by payload size and duty-cycle headroom; failures fall back to
    /// sending uncompressed.
    pub fn send_message(
        &mut self,
        kind: MessageKind,
        payload: &[u8],
        priority: Priority,
        options: SendOptions,
    ) -> Result<QueueId, MeshError> {
        let (codec, body) = self.compress_general(kind, payload);
        self.enqueue_message(kind, body, codec, priority, options)
    }

    /// Queues a UTXO transaction with fee-derived priority.
    pub fn send_utxo_transaction(&mut self, tx: &UtxoTransaction) -> Result<QueueId, MeshError> {
        let body = utxo_codec::encode_transaction(tx);
        let fee_per_byte = f64::from(tx.fee) / body.len().max(1) as f64;
        let priority = if fee_per_byte >= self.config.high_fee_sat_per_byte {
            Priority::High
        } else if fee_per_byte >= self.config.normal_fee_sat_per_byte {
            Priority::Normal
        } else {
            Priority::Low
        };
        self.enqueue_message(
            MessageKind::UtxoTransaction,
            body,
            CodecKind::UtxoCustom,
            priority,
            SendOptions {
                fee: u64::from(tx.fee),
                input_count: tx.inputs.len() as u32,
                output_count: tx.outputs.len() as u32,
                ..SendOptions::default()
            },
        )
    }

    /// Queues a transaction that must pre-empt everything else. Uses the
    /// emergency reserve and, when enabled, the duty-cycle override.
    pub fn send_emergency_utxo_transaction(
        &mut self,
        tx: &UtxoTransaction,
    ) -> Result<QueueId, MeshError> {
        let body = utxo_codec::encode_transaction(tx);
        self.enqueue_message(
            MessageKind::UtxoTransaction,
            body,
            CodecKind::UtxoCustom,
            Priority::Critical,
            SendOptions {
                emergency: true,
                fee: u64::from(tx.fee),
                input_count: tx.inputs.len() as u32,
                output_count: tx.outputs.len() as u32,
                ..SendOptions::default()
            },
        )
    }

    /// Queues a block at CRITICAL priority.
    pub fn send_block(&mut self, block: &UtxoBlock) -> Result<QueueId, MeshError> {
        let body = utxo_codec::encode_block(block);
        self.enqueue_message(
            MessageKind::Block,
            body,
            CodecKind::UtxoCustom,
            Priority::Critical,
            SendOptions {
                block_height: u64::from(block.index),
                ..SendOptions::default()
            },
        )
    }

    /// Queues an SPV proof at HIGH priority, routed to the requester.
    pub fn send_merkle_proof(
        &mut self,
        proof: &[u8],
        destination: NodeId,
    ) -> Result<QueueId, MeshError> {
        let (codec, body) = self.compress_general(MessageKind::MerkleProof, proof);
        self.enqueue_message(
            MessageKind::MerkleProof,
            body,
            codec,
            Priority::High,
            SendOptions {
                destination: Some(destination),
                ..SendOptions::default()
            },
        )
    }

    /// Feeds one received radio frame through the validation and reassembly
    /// pipeline. `from` is the link-layer neighbour the radio heard it
    /// from. Returns a complete message only when reassembly finished and
    /// the payload is addressed to the caller.
    pub fn receive_frame(
        &mut self,
        bytes: &[u8],
        from: NodeId,
    ) -> Result<Option<MeshMessage>, MeshError> {
        if !self.connected {
            return Err(MeshError::NotConnected);
        }
        self.frames_received += 1;
        let now = self.time.now_instant();
        let fragment = Fragment::decode(bytes)?;

        let Some(sender_key) = self.routing.peer_key(&from).cloned() else {
            return self.receive_bootstrap(&fragment, from);
        };

        let outcome = match self.reassembler.ingest(&fragment, &sender_key, now) {
            Ok(outcome) => outcome,
            Err(TransportError::InvalidSignature) => {
                // Dropped silently; surfaced only through the intrusion
                // counter and an event.
                self.events
                    .push_back(MeshEvent::IntrusionDetected { origin: from });
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };

        match outcome {
            IngestOutcome::Complete {
                payload,
                ack_required,
            } => {
                // Reliability is per link: the completing hop acknowledges
                // its upstream neighbour, and relays re-arm the flag so the
                // next link does the same.
                if ack_required {
                    self.acknowledge(
                        fragment.header.message_id,
                        fragment.header.total_fragments,
                        from,
                    );
                }
                self.dispatch_payload(&payload, from, ack_required)
            }
            IngestOutcome::Accepted { .. } | IngestOutcome::Duplicate => Ok(None),
        }
    }

    /// Advances every timer and returns the frames to hand to the radio.
    pub fn poll(&mut self) -> Vec<Vec<u8>> {
        if !self.connected {
            return Vec::new();
        }
        let now = self.time.now_instant();
        let unix_ms = self.time.now_unix_ms();

        // Receiver-side missing-fragment requests.
        for plan in self.reassembler.poll(now) {
            let mut request = RetransmissionRequest::new(
                plan.message_id,
                plan.missing,
                format!("{}-{}", plan.message_id, plan.attempt),
                unix_ms,
                self.self_id,
            );
            request.sign(&self.keys);
            if let Ok(body) = serde_json::to_vec(&request) {
                let _ = self.enqueue_control(body, Some(plan.origin));
            }
        }
        for event in self.reassembler.drain_events() {
            self.events.push_back(match event {
                ReassemblyEvent::SessionEvicted { message_id } => {
                    MeshEvent::ReassemblySessionEvicted { message_id }
                }
                ReassemblyEvent::SessionExpired { message_id } => {
                    MeshEvent::ReassemblySessionExpired { message_id }
                }
                ReassemblyEvent::SessionFailed { message_id } => {
                    MeshEvent::ReassemblyFailed { message_id }
                }
            });
        }

        // Sender-side ACK timeouts.
        for directive in self.delivery.poll(now, unix_ms) {
            let fragments = self.cached_or_refragmented(&directive.message_id, &directive.payload);
            self.transmit_fragments(fragments, false);
        }
        for event in self.delivery.drain_events() {
            self.events.push_back(match event {
                DeliveryEvent::Delivered {
                    message_id,
                    attempts,
                    ..
                } => MeshEvent::MessageDelivered {
                    message_id,
                    attempts,
                },
                DeliveryEvent::Retry {
                    message_id, attempt, ..
                } => MeshEvent::RetryScheduled { message_id, attempt },
                DeliveryEvent::Failed {
                    message_id, reason, ..
                } => MeshEvent::MessageFailed {
                    message_id,
                    reason: reason.into(),
                },
            });
        }

        // Routing timers and hellos.
        for event in self.routing.poll(now) {
            match event {
                RoutingEvent::RouteDiscovered { target, .. } => {
                    self.awaiting_route.remove(&target);
                    self.events.push_back(MeshEvent::RouteDiscovered { target });
                }
                RoutingEvent::DiscoveryFailed { target } => {
                    self.fail_awaiting(target);
                    self.events
                        .push_back(MeshEvent::RouteDiscoveryFailed { target });
                }
            }
        }
        if let Some(hello) = self.routing.hello_beacon(&self.keys, now, unix_ms)
            && let Ok(body) = serde_json::to_vec(&hello)
        {
            let _ = self.enqueue_route_control(body, None);
        }

        // TTL sweeps.
        for expired in self.queue.remove_expired(now) {
            self.events.push_back(MeshEvent::MessageExpired {
                queue_id: expired.queue_id,
            });
        }
        self.fragment_cache.prune(now);

        self.dispatch_queue();
        self.frames_sent += self.outbox.len() as u64;
        std::mem::take(&mut self.outbox)
    }

    /// Cancels a message still waiting in the queue, releasing its slot.
    pub fn cancel(&mut self, queue_id: &QueueId) -> Result<(), MeshError> {
        match self.queue.remove(queue_id) {
            Some(message) => {
                for waiting in self.awaiting_route.values_mut() {
                    waiting.retain(|id| id != &message.queue_id);
                }
                Ok(())
            }
            None => Err(TransportError::Cancelled.into()),
        }
    }

    /// Cancels a transmitted message awaiting acknowledgment; no further
    /// retries will fire.
    pub fn cancel_in_flight(&mut self, message_id: &MessageId) -> Result<(), MeshError> {
        self.delivery.cancel(message_id)?;
        self.fragment_cache.remove(message_id);
        Ok(())
    }

    /// Reports a broken link to `peer`, tearing down routes and flooding a
    /// route error.
    pub fn report_broken_link(&mut self, peer: NodeId) {
        let now = self.time.now_instant();
        let unix_ms = self.time.now_unix_ms();
        self.delivery.on_send_failure(&peer, now);
        let error = self.routing.create_route_error(peer, &self.keys, now, unix_ms);
        if let Ok(body) = serde_json::to_vec(&error) {
            let _ = self.enqueue_route_control(body, None);
        }
    }

    /// Persists routing, queue, and transmission-ledger snapshots through
    /// the KV interface.
    pub fn persist_snapshot(&mut self) {
        self.storage.clear_prefix(TXREC_PREFIX);
        for (i, rec) in self.transmission_history().iter().enumerate() {
            if let Ok(bytes) = serde_json::to_vec(rec) {
                self.storage.put(&format!("{TXREC_PREFIX}{i:06}"), bytes);
            }
        }

        self.storage.clear_prefix(ROUTE_PREFIX);
        for entry in self.routing.table().all_entries() {
            let snapshot = RouteEntrySnapshot {
                destination: entry.destination,
                next_hop: entry.next_hop,
                hop_count: entry.hop_count,
                sequence: entry.sequence,
                node_type: entry.node_type,
                utxo_completeness: entry.utxo_completeness,
                blockchain_height: entry.blockchain_height,
                link_quality: entry.link_quality,
                last_utxo_sync: entry.last_utxo_sync,
            };
            if let Ok(bytes) = serde_json::to_vec(&snapshot) {
                self.storage.put(
                    &format!("{ROUTE_PREFIX}{}/{}", entry.destination, entry.next_hop),
                    bytes,
                );
            }
        }

        self.storage.clear_prefix(SESSION_PREFIX);
        let sessions: Vec<SessionSnapshot> = self
            .reassembler
            .active()
            .map(|session| SessionSnapshot {
                message_id: session.message_id.to_hex(),
                origin: session.origin,
                total_fragments: session.total_fragments(),
                received_count: session.received_count(),
                missing: session.missing(),
            })
            .collect();
        for snapshot in sessions {
            if let Ok(bytes) = serde_json::to_vec(&snapshot) {
                self.storage
                    .put(&format!("{SESSION_PREFIX}{}", snapshot.message_id), bytes);
            }
        }

        self.storage.clear_prefix(QUEUE_PREFIX);
        for message in self.queue.snapshot() {
            let snapshot = QueuedMessageSnapshot {
                queue_id: message.queue_id.to_string(),
                kind: message.kind,
                payload_hex: hex::encode(&message.payload),
                destination: message.destination,
                priority: message.priority.index() as u8,
                emergency: message.emergency,
                fee: message.fee,
                block_height: message.block_height,
            };
            if let Ok(bytes) = serde_json::to_vec(&snapshot) {
                self.storage
                    .put(&format!("{QUEUE_PREFIX}{}", snapshot.queue_id), bytes);
            }
        }
    }

    /// Re-enqueues messages persisted by a previous run. Returns how many
    /// were restored.
    pub fn restore_queue_snapshot(&mut self) -> usize {
        let now = self.time.now_instant();
        let mut restored = 0;
        for (_, bytes) in self.storage.scan_prefix(QUEUE_PREFIX) {
            let Ok(snapshot) = serde_json::from_slice::<QueuedMessageSnapshot>(&bytes) else {
                continue;
            };
            let Ok(payload) = hex::decode(&snapshot.payload_hex) else {
                continue;
            };
            let priority = match snapshot.priority {
                0 => Priority::Critical,
                1 => Priority::High,
                2 => Priority::Normal,
                _ => Priority::Low,
            };
            let message = PrioritizedMessage {
                queue_id: QueueId::random(),
                kind: snapshot.kind,
                payload,
                destination: snapshot.destination,
                priority,
                emergency: snapshot.emergency,
                fee: snapshot.fee,
                input_count: 0,
                output_count: 0,
                block_height: snapshot.block_height,
                created_at: now,
                ttl: self.config.message_ttl,
                retry_count: 0,
                max_retries: self.config.retry.max_attempts,
                ack_required: snapshot.destination.is_some(),
                compression_applied: CodecKind::None,
            };
            if self.queue.enqueue(message, now).is_ok() {
                restored += 1;
            }
        }
        restored
    }

    // ---- internal send path -------------------------------------------------

    fn compress_general(&self, kind: MessageKind, payload: &[u8]) -> (CodecKind, Vec<u8>) {
        let now = self.time.now_instant();
        let utilization = self.duty.current_duty_cycle(self.frequency_mhz, now);
        let limit = self
            .duty
            .config()
            .region
            .band_of(self.frequency_mhz)
            .map(|b| b.duty_cycle_percent / 100.0)
            .unwrap_or(1.0);
        let duty_constrained = limit > 0.0 && utilization / limit >= 0.5;

        let selected = compress::select_codec(
            kind,
            payload.len(),
            duty_constrained,
            self.dictionary.is_some(),
        );
        let encoded = match selected {
            CodecKind::Gzip => compress::gzip_compress(payload, compress::GzipLevel::Balanced),
            CodecKind::Lz4 => Ok(compress::lz4_compress(payload)),
            CodecKind::Dictionary => match &self.dictionary {
                Some(dictionary) => Ok(dictionary.encode(payload)),
                None => Err(WireError::CompressionFailure("no dictionary".into())),
            },
            // Typed codecs are applied by the typed send paths.
            CodecKind::UtxoCustom | CodecKind::ProtoLite | CodecKind::None => {
                return (CodecKind::None, payload.to_vec());
            }
        };
        match encoded {
            Ok(body) if body.len() < payload.len() => (selected, body),
            Ok(_) => (CodecKind::None, payload.to_vec()),
            Err(err) => {
                // Compression failure falls back to the uncompressed path.
                debug!(error = %err, "codec failed, sending uncompressed");
                (CodecKind::None, payload.to_vec())
            }
        }
    }

    fn enqueue_message(
        &mut self,
        kind: MessageKind,
        body: Vec<u8>,
        codec: CodecKind,
        priority: Priority,
        options: SendOptions,
    ) -> Result<QueueId, MeshError> {
        if !self.connected {
            return Err(MeshError::NotConnected);
        }
        let priority = if self.emergency_mode {
            priority.boost()
        } else {
            priority
        };
        let envelope = self.build_envelope(kind, codec, &body, options.destination);
        let now = self.time.now_instant();
        let message = PrioritizedMessage {
            queue_id: QueueId::random(),
            kind,
            payload: envelope,
            destination: options.destination,
            priority,
            emergency: options.emergency,
            fee: options.fee,
            input_count: options.input_count,
            output_count: options.output_count,
            block_height: options.block_height,
            created_at: now,
            ttl: self.config.message_ttl,
            retry_count: 0,
            max_retries: self.config.retry.max_attempts,
            // Only directed data earns end-to-end acknowledgments; control
            // traffic is idempotent and retried at its own layer.
            ack_required: options.destination.is_some()
                && matches!(
                    kind,
                    MessageKind::UtxoTransaction
                        | MessageKind::Block
                        | MessageKind::MerkleProof
                        | MessageKind::Sync
                ),
            compression_applied: codec,
        };
        let queue_id = self.queue.enqueue(message, now)?;
        self.events.push_back(MeshEvent::MessageQueued { queue_id });
        Ok(queue_id)
    }

    fn enqueue_control(&mut self, body: Vec<u8>, destination: Option<NodeId>) -> Result<QueueId, MeshError> {
        self.enqueue_message(
            MessageKind::Ack,
            body,
            CodecKind::None,
            Priority::High,
            SendOptions {
                destination,
                ..SendOptions::default()
            },
        )
    }

    fn enqueue_route_control(
        &mut self,
        body: Vec<u8>,
        destination: Option<NodeId>,
    ) -> Result<QueueId, MeshError> {
        self.enqueue_message(
            MessageKind::RouteControl,
            body,
            CodecKind::None,
            Priority::Normal,
            SendOptions {
                destination,
                ..SendOptions::default()
            },
        )
    }

    /// Builds and signs the mesh envelope: the body is prefixed with its
    /// codec tag, and the signature covers the envelope serialized with an
    /// empty signature field.
    fn build_envelope(
        &self,
        kind: MessageKind,
        codec: CodecKind,
        body: &[u8],
        destination: Option<NodeId>,
    ) -> Vec<u8> {
        let mut payload = Vec::with_capacity(body.len() + 1);
        payload.push(codec.tag());
        payload.extend_from_slice(body);
        let mut message = MeshMessage {
            kind,
            payload,
            timestamp: (self.time.now_unix_ms() / 1000) as u32,
            from_id: self.self_id.as_bytes().to_vec(),
            to_id: destination
                .map(|d| d.as_bytes().to_vec())
                .unwrap_or_default(),
            signature: Vec::new(),
        };
        let unsigned = protolite::encode_mesh_message(&message);
        message.signature = self.keys.sign(&unsigned).encode().to_vec();
        protolite::encode_mesh_message(&message)
    }

    fn verify_envelope(&self, envelope: &MeshMessage) -> bool {
        let Ok(origin_bytes) = <[u8; 32]>::try_from(envelope.from_id.as_slice()) else {
            return false;
        };
        let origin = NodeId(origin_bytes);
        let Some(key) = self.routing.peer_key(&origin) else {
            // Originator key not yet learned; per-hop fragment signatures
            // still authenticated the transmitting neighbour.
            return true;
        };
        let Ok(signature) = Signature::decode(&envelope.signature) else {
            return false;
        };
        let mut unsigned = envelope.clone();
        unsigned.signature = Vec::new();
        key.verify(&protolite::encode_mesh_message(&unsigned), &signature)
            .is_ok()
    }

    // ---- inbound pipeline ---------------------------------------------------

    /// Frames from peers whose key is unknown can only bootstrap trust via
    /// a self-certifying hello beacon. Fragment signatures cannot be checked
    /// yet, so the payload is reassembled unverified and everything except
    /// a hello whose own signature verifies is discarded.
    fn receive_bootstrap(
        &mut self,
        fragment: &Fragment,
        from: NodeId,
    ) -> Result<Option<MeshMessage>, MeshError> {
        let now = self.time.now_instant();
        let outcome = self.reassembler.ingest_unverified(fragment, from, now)?;
        let IngestOutcome::Complete { payload, .. } = outcome else {
            return Ok(None);
        };
        let envelope = protolite::decode_mesh_message(&payload)?;
        if envelope.kind != MessageKind::RouteControl || envelope.payload.is_empty() {
            debug!(from = %from, "non-hello traffic from unknown peer dropped");
            return Ok(None);
        }
        let body = &envelope.payload[1..];
        let Ok(hello) = serde_json::from_slice::<HelloBeacon>(body) else {
            return Ok(None);
        };
        if self.routing.handle_hello(&hello, now) {
            debug!(from = %from, "bootstrapped peer key from hello");
        }
        Ok(None)
    }

    /// Routes a fully reassembled envelope to the right consumer.
    fn dispatch_payload(
        &mut self,
        payload: &[u8],
        from: NodeId,
        ack_required: bool,
    ) -> Result<Option<MeshMessage>, MeshError> {
        let envelope = protolite::decode_mesh_message(payload)?;
        if !self.verify_envelope(&envelope) {
            self.events
                .push_back(MeshEvent::IntrusionDetected { origin: from });
            return Ok(None);
        }
        if envelope.payload.is_empty() {
            return Err(WireError::Truncated.into());
        }

        // Envelopes addressed to another node are relayed toward it,
        // whatever their kind. An overheard copy of our own traffic is not.
        if !envelope.to_id.is_empty() && envelope.to_id.as_slice() != self.self_id.as_bytes() {
            if envelope.from_id.as_slice() != self.self_id.as_bytes() {
                self.relay(&envelope, payload, ack_required);
            }
            return Ok(None);
        }

        let codec = CodecKind::from_tag(envelope.payload[0])?;
        let body = self.decode_body(codec, &envelope.payload[1..])?;

        match envelope.kind {
            MessageKind::Ack => {
                self.handle_arq_control(&body, from);
                Ok(None)
            }
            MessageKind::RouteControl | MessageKind::Discovery => {
                self.handle_route_control(&body, from);
                Ok(None)
            }
            _ => {
                let mut delivered = envelope;
                delivered.payload = body;
                Ok(Some(delivered))
            }
        }
    }

    fn decode_body(&self, codec: CodecKind, body: &[u8]) -> Result<Vec<u8>, MeshError> {
        let decoded = match codec {
            CodecKind::None | CodecKind::UtxoCustom | CodecKind::ProtoLite => body.to_vec(),
            CodecKind::Gzip => compress::gzip_decompress(body)?,
            CodecKind::Lz4 => compress::lz4_decompress(body)?,
            CodecKind::Dictionary => match &self.dictionary {
                Some(dictionary) => dictionary.decode(body)?,
                None => {
                    return Err(WireError::DecompressionFailure(
                        "dictionary payload without a dictionary".into(),
                    )
                    .into());
                }
            },
        };
        Ok(decoded)
    }

    /// ACKs, NACKs, and retransmission requests.
    fn handle_arq_control(&mut self, body: &[u8], from: NodeId) {
        #[derive(Deserialize)]
        struct Tagged<'a> {
            #[serde(rename = "type")]
            kind: &'a str,
        }
        let Ok(tag) = serde_json::from_slice::<Tagged>(body) else {
            debug!(from = %from, "unparseable ARQ control message");
            return;
        };
        match tag.kind {
            "ack" | "nack" => {
                let Ok(ack) = serde_json::from_slice::<Acknowledgment>(body) else {
                    return;
                };
                let Some(key) = self.routing.peer_key(&ack.from_node_id) else {
                    return;
                };
                if ack.verify(key).is_err() {
                    debug!(from = %from, "ACK signature invalid; ignored");
                    return;
                }
                match ack.kind {
                    AckKind::Ack => {
                        if self.delivery.on_ack(&ack.message_id, &ack.from_node_id) {
                            self.fragment_cache.remove(&ack.message_id);
                        }
                    }
                    AckKind::Nack => {
                        // Negative-acknowledged fragments are re-sent now.
                        let sequences = ack.nack_fragments.clone().unwrap_or_default();
                        let fragments =
                            self.fragment_cache.fragments(&ack.message_id, &sequences);
                        self.transmit_fragments(fragments, false);
                    }
                }
            }
            "retransmission_request" => {
                let Ok(request) = serde_json::from_slice::<RetransmissionRequest>(body) else {
                    return;
                };
                let Some(key) = self.routing.peer_key(&request.node_id) else {
                    return;
                };
                if request.verify(key).is_err() {
                    debug!(from = %from, "retransmission request signature invalid; ignored");
                    return;
                }
                let Ok(sequences) = request.sequences() else {
                    return;
                };
                let fragments = self
                    .fragment_cache
                    .fragments(&request.message_id, &sequences);
                if fragments.is_empty() {
                    debug!(message_id = %request.message_id, "retransmission requested for unknown message");
                    return;
                }
                self.transmit_fragments(fragments, false);
            }
            other => debug!(kind = other, "unknown ARQ control type"),
        }
    }

    fn handle_route_control(&mut self, body: &[u8], from: NodeId) {
        #[derive(Deserialize)]
        struct Tagged<'a> {
            #[serde(rename = "type")]
            kind: &'a str,
        }
        let Ok(tag) = serde_json::from_slice::<Tagged>(body) else {
            return;
        };
        let now = self.time.now_instant();
        let unix_ms = self.time.now_unix_ms();
        match tag.kind {
            "hello" => {
                if let Ok(hello) = serde_json::from_slice::<HelloBeacon>(body) {
                    self.routing.handle_hello(&hello, now);
                }
            }
            "route_request" => {
                let Ok(request) = serde_json::from_slice::<RouteRequest>(body) else {
                    return;
                };
                match self
                    .routing
                    .handle_request(&request, from, &self.keys, now, unix_ms)
                {
                    RequestDisposition::Reply { reply, next_hop } => {
                        if let Ok(body) = serde_json::to_vec(&reply) {
                            let _ = self.enqueue_route_control(body, Some(next_hop));
                        }
                    }
                    RequestDisposition::Forward { request } => {
                        if let Ok(body) = serde_json::to_vec(&request) {
                            let _ = self.enqueue_route_control(body, None);
                        }
                    }
                    RequestDisposition::Drop { reason } => {
                        debug!(?reason, "route request dropped");
                    }
                }
            }
            "route_reply" => {
                let Ok(reply) = serde_json::from_slice::<RouteReply>(body) else {
                    return;
                };
                match self.routing.handle_reply(&reply, from, now) {
                    ReplyDisposition::Deliver { .. } => {}
                    ReplyDisposition::Forward { reply, next_hop } => {
                        if let Ok(body) = serde_json::to_vec(&reply) {
                            let _ = self.enqueue_route_control(body, Some(next_hop));
                        }
                    }
                    ReplyDisposition::Drop { reason } => {
                        debug!(?reason, "route reply dropped");
                    }
                }
            }
            "route_error" => {
                if let Ok(error) = serde_json::from_slice::<RouteError>(body) {
                    self.routing.handle_route_error(&error, now);
                }
            }
            other => debug!(kind = other, "unknown route control type"),
        }
    }

    fn relay(&mut self, envelope: &MeshMessage, raw_payload: &[u8], ack_required: bool) {
        let Ok(target_bytes) = <[u8; 32]>::try_from(envelope.to_id.as_slice()) else {
            return;
        };
        let target = NodeId(target_bytes);
        let now = self.time.now_instant();
        let message = PrioritizedMessage {
            queue_id: QueueId::random(),
            kind: envelope.kind,
            payload: raw_payload.to_vec(),
            destination: Some(target),
            // Relayed traffic competes by flood rank when the queue is
            // saturated: transactions over blocks over sync over discovery.
            priority: if envelope.kind == MessageKind::Ack {
                Priority::High
            } else {
                match envelope.kind.flood_rank() {
                    0 => Priority::High,
                    1 | 2 => Priority::Normal,
                    _ => Priority::Low,
                }
            },
            emergency: false,
            fee: 0,
            input_count: 0,
            output_count: 0,
            block_height: 0,
            created_at: now,
            ttl: self.config.message_ttl,
            retry_count: 0,
            max_retries: self.config.retry.max_attempts,
            ack_required,
            compression_applied: CodecKind::None,
        };
        if self.queue.enqueue(message, now).is_err() {
            warn!(target = %target, "relay dropped: queue full");
        }
    }

    fn acknowledge(&mut self, message_id: MessageId, total_fragments: u16, to: NodeId) {
        let unix_ms = self.time.now_unix_ms();
        let mut ack = Acknowledgment::ack_cumulative(
            message_id,
            total_fragments.saturating_sub(1),
            self.self_id,
            unix_ms,
        );
        ack.sign(&self.keys);
        if let Ok(body) = serde_json::to_vec(&ack) {
            let _ = self.enqueue_control(body, Some(to));
        }
    }

    // ---- transmission -------------------------------------------------------

    fn fail_awaiting(&mut self, target: NodeId) {
        let Some(queue_ids) = self.awaiting_route.remove(&target) else {
            return;
        };
        for queue_id in queue_ids {
            if let Some(message) = self.queue.remove(&queue_id) {
                let message_id = MessageId::from_payload(&message.payload);
                self.events.push_back(MeshEvent::MessageFailed {
                    message_id,
                    reason: MeshError::NoRoute,
                });
            }
        }
    }

    fn cached_or_refragmented(&mut self, message_id: &MessageId, payload: &[u8]) -> Vec<Fragment> {
        let all: Vec<u16> = (0..loramesh_transport::frame::MAX_FRAGMENTS_PER_MESSAGE).collect();
        let cached = self.fragment_cache.fragments(message_id, &all);
        if !cached.is_empty() {
            return cached;
        }
        match fragment_payload(payload, MessageKind::Sync, false, true, &self.keys) {
            Ok(fragments) => fragments,
            Err(_) => Vec::new(),
        }
    }

    /// Transmits pre-built fragments under duty-cycle admission.
    fn transmit_fragments(&mut self, fragments: Vec<Fragment>, emergency: bool) {
        let now = self.time.now_instant();
        let unix_ms = self.time.now_unix_ms();
        for fragment in fragments {
            let encoded = fragment.encode();
            let airtime = self.duty.estimate_airtime(encoded.len());
            match self.duty.evaluate(airtime, self.frequency_mhz, emergency, now) {
                Admission::Granted | Admission::Bypass { .. } => {
                    self.duty.record_transmission(
                        airtime,
                        self.frequency_mhz,
                        self.tx_power_dbm(),
                        MessageKind::Sync,
                        now,
                        unix_ms,
                    );
                    self.outbox.push(encoded);
                }
                Admission::Deferred { .. } | Admission::Rejected => {
                    // Remaining fragments will be NACKed again later.
                    break;
                }
            }
        }
    }

    /// Pops admissible messages off the heap, fragments them, and stages
    /// radio frames. Stops at the first duty-cycle deferral to preserve
    /// dequeue order.
    fn dispatch_queue(&mut self) {
        let now = self.time.now_instant();
        let unix_ms = self.time.now_unix_ms();
        let mut deferred: Vec<PrioritizedMessage> = Vec::new();

        loop {
            let Some(head) = self.queue.peek() else { break };

            // Routed messages need a next hop before they can leave.
            if let Some(destination) = head.destination
                && self.routing.next_hop(&destination, now).is_none()
            {
                let message = self.queue.dequeue(now).expect("peeked");
                if !self.routing.has_pending_discovery(&destination) {
                    let request =
                        self.routing
                            .discover(destination, None, &self.keys, now, unix_ms);
                    if let Ok(body) = serde_json::to_vec(&request) {
                        let _ = self.enqueue_route_control(body, None);
                    }
                }
                let waiting = self.awaiting_route.entry(destination).or_default();
                if !waiting.contains(&message.queue_id) {
                    waiting.push(message.queue_id);
                }
                deferred.push(message);
                continue;
            }

            let payload_len = head.payload.len();
            let emergency = head.emergency;
            let total_airtime = self.estimate_message_airtime(head.kind, payload_len);
            match self
                .duty
                .evaluate(total_airtime, self.frequency_mhz, emergency, now)
            {
                Admission::Granted => {
                    let message = self.queue.dequeue(now).expect("peeked");
                    self.transmit_message(message, now, unix_ms, false);
                }
                Admission::Bypass { violation } => {
                    let message = self.queue.dequeue(now).expect("peeked");
                    if violation {
                        self.events.push_back(MeshEvent::DutyCycleViolation {
                            queue_id: message.queue_id,
                        });
                    }
                    self.transmit_message(message, now, unix_ms, true);
                }
                Admission::Deferred { until } => {
                    let message = self.queue.dequeue(now).expect("peeked");
                    self.events.push_back(MeshEvent::TransmissionDeferred {
                        queue_id: message.queue_id,
                        retry_in: until.saturating_duration_since(now),
                    });
                    deferred.push(message);
                    // Head-of-line: scheduling stays in score order.
                    break;
                }
                Admission::Rejected => {
                    let message = self.queue.dequeue(now).expect("peeked");
                    let message_id = MessageId::from_payload(&message.payload);
                    self.events.push_back(MeshEvent::MessageFailed {
                        message_id,
                        reason: TransportError::DutyCycleBlocked {
                            retry_in: Duration::ZERO,
                        }
                        .into(),
                    });
                }
            }
        }

        for message in deferred {
            if self.queue.enqueue(message, now).is_err() {
                warn!("deferred message lost to queue overflow");
            }
        }
    }

    fn transmit_message(
        &mut self,
        message: PrioritizedMessage,
        now: std::time::Instant,
        unix_ms: u64,
        bypassed: bool,
    ) {
        let priority_flag = message.priority <= Priority::High || message.emergency;
        let fragments = match fragment_payload(
            &message.payload,
            message.kind,
            priority_flag,
            message.ack_required,
            &self.keys,
        ) {
            Ok(fragments) => fragments,
            Err(err) => {
                warn!(error = %err, "failed to fragment message");
                return;
            }
        };
        let message_id = fragments[0].header.message_id;
        self.fragment_cache
            .insert(message_id, fragments.clone(), now);

        if message.ack_required
            && let Some(destination) = message.destination
        {
            // The ACK comes from the next hop; multi-hop reliability chains
            // link by link through the relays.
            let target = self
                .routing
                .next_hop(&destination, now)
                .unwrap_or(destination);
            let reliability = if message.kind == MessageKind::Block {
                Reliability::Guaranteed
            } else {
                Reliability::Reliable
            };
            if let Err(err) = self.delivery.track(
                message_id,
                target,
                message.payload.clone(),
                reliability,
                now,
            ) {
                self.events.push_back(MeshEvent::MessageFailed {
                    message_id,
                    reason: err.into(),
                });
                return;
            }
        }

        for fragment in &fragments {
            let encoded = fragment.encode();
            let airtime = self.duty.estimate_airtime(encoded.len());
            self.duty.record_transmission(
                airtime,
                self.frequency_mhz,
                self.tx_power_dbm(),
                message.kind,
                now,
                unix_ms,
            );
            self.outbox.push(encoded);
        }
        if bypassed {
            debug!(message_id = %message_id, "transmitted under emergency duty-cycle bypass");
        }
    }

    fn estimate_message_airtime(&self, kind: MessageKind, payload_len: usize) -> Duration {
        let cap = loramesh_transport::frame::payload_cap(kind);
        let fragments = payload_len.div_ceil(cap).max(1);
        let frame_len = payload_len.min(cap)
            + loramesh_transport::frame::HEADER_LEN
            + loramesh_wire::crypto::SIGNATURE_LEN
            + 1;
        self.duty.estimate_airtime(frame_len) * fragments as u32
    }

    fn tx_power_dbm(&self) -> f64 {
        self.duty
            .config()
            .region
            .band_of(self.frequency_mhz)
            .map(|band| band.max_eirp_dbm)
            .unwrap_or(14.0)
    }
}
