//! The routing engine: request flooding, reply handling, hellos, and the
//! peer key registry.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use loramesh_wire::crypto::{NodeId, PublicKey, SigningKeyPair};
use loramesh_wire::signed::SignedMessage;
use tracing::{debug, info, warn};

use crate::flood::FloodCache;
use crate::messages::{
    CapabilityConstraints, HelloBeacon, NodeType, RouteError, RouteReply, RouteRequest,
};
use crate::table::{RouteEntry, RoutingTable, TableConfig};

#[derive(Debug, Clone)]
pub struct RoutingConfig {
    pub max_flood_ttl: u8,
    pub max_path_length: usize,
    pub flood_cache_size: usize,
    pub flood_cache_window: Duration,
    pub route_discovery_timeout: Duration,
    pub hello_interval: Duration,
    pub table: TableConfig,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            max_flood_ttl: 10,
            max_path_length: 15,
            flood_cache_size: 500,
            flood_cache_window: Duration::from_secs(120),
            route_discovery_timeout: Duration::from_secs(15),
            hello_interval: Duration::from_secs(30),
            table: TableConfig::default(),
        }
    }
}

/// What this node advertises about itself.
#[derive(Debug, Clone)]
pub struct NodeProfile {
    pub node_type: NodeType,
    pub utxo_completeness: f64,
    pub blockchain_height: u64,
    pub last_utxo_sync: u64,
    pub services: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Loop,
    PathTooLong,
    Duplicate,
    Stale,
    TtlExceeded,
    UnknownPeer,
    BadSignature,
    NotOnPath,
    ConstraintsUnmet,
}

/// What to do with an inbound route request.
#[derive(Debug)]
pub enum RequestDisposition {
    /// This node is the destination: send the signed reply to `next_hop`.
    Reply {
        reply: RouteReply,
        next_hop: NodeId,
    },
    /// Rebroadcast the amended request.
    Forward { request: RouteRequest },
    Drop { reason: DropReason },
}

/// What to do with an inbound route reply.
#[derive(Debug)]
pub enum ReplyDisposition {
    /// This node originated the discovery; the route is installed.
    Deliver { target: NodeId },
    /// Pass the reply one hop further along the reverse path.
    Forward {
        reply: RouteReply,
        next_hop: NodeId,
    },
    Drop { reason: DropReason },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingEvent {
    RouteDiscovered { target: NodeId, next_hop: NodeId },
    DiscoveryFailed { target: NodeId },
}

#[derive(Debug, Clone, Default)]
pub struct RoutingStats {
    pub requests_forwarded: u64,
    pub requests_replied: u64,
    pub requests_dropped: u64,
    pub replies_forwarded: u64,
    pub replies_delivered: u64,
    pub hellos_received: u64,
    pub errors_handled: u64,
    pub discoveries_started: u64,
    pub discoveries_failed: u64,
    pub route_count: usize,
    pub neighbor_count: usize,
}

/// Freshness record for a direct neighbour.
#[derive(Debug, Clone)]
pub struct Neighbor {
    pub node_type: NodeType,
    pub blockchain_height: u64,
    pub utxo_completeness: f64,
    pub last_seen: Instant,
    pub link_quality: f64,
}

#[derive(Debug, Clone)]
struct PendingDiscovery {
    deadline: Instant,
    sequence: u64,
    constraints: Option<CapabilityConstraints>,
}

pub struct RoutingEngine {
    config: RoutingConfig,
    self_id: NodeId,
    profile: NodeProfile,
    table: RoutingTable,
    flood: FloodCache,
    sequence: u64,
    /// Highest sequence seen per originator; stale floods are dropped.
    highest_seen: HashMap<NodeId, u64>,
    neighbors: HashMap<NodeId, Neighbor>,
    peer_keys: HashMap<NodeId, PublicKey>,
    pending: HashMap<NodeId, PendingDiscovery>,
    last_hello_at: Option<Instant>,
    events: Vec<RoutingEvent>,
    stats: RoutingStats,
}

impl RoutingEngine {
    pub fn new(self_id: NodeId, profile: NodeProfile, config: RoutingConfig) -> Self {
        Self {
            flood: FloodCache::new(config.flood_cache_size, config.flood_cache_window),
            table: RoutingTable::new(config.table.clone()),
            config,
            self_id,
            profile,
            sequence: 0,
            highest_seen: HashMap::new(),
            neighbors: HashMap::new(),
            peer_keys: HashMap::new(),
            pending: HashMap::new(),
            last_hello_at: None,
            events: Vec::new(),
            stats: RoutingStats::default(),
        }
    }

    pub fn self_id(&self) -> NodeId {
        self.self_id
    }

    pub fn table(&self) -> &RoutingTable {
        &self.table
    }

    pub fn peer_key(&self, node_id: &NodeId) -> Option<&PublicKey> {
        self.peer_keys.get(node_id)
    }

    pub fn neighbors(&self) -> &HashMap<NodeId, Neighbor> {
        &self.neighbors
    }

    /// Registers a peer key out of band (e.g. from provisioning).
    pub fn register_peer(&mut self, key: PublicKey) {
        self.peer_keys.insert(key.node_id(), key);
    }

    pub fn set_profile(&mut self, profile: NodeProfile) {
        self.profile = profile;
    }

    pub fn stats(&self) -> RoutingStats {
        let mut stats = self.stats.clone();
        stats.route_count = self.table.len();
        stats.neighbor_count = self.neighbors.len();
        stats
    }

    /// Next hop toward `destination`, if a live route exists.
    pub fn next_hop(&self, destination: &NodeId, now: Instant) -> Option<NodeId> {
        self.table
            .best_route(destination, now)
            .map(|entry| entry.next_hop)
    }

    /// Starts an on-demand discovery and returns the signed request to
    /// flood.
    pub fn discover(
        &mut self,
        target: NodeId,
        constraints: Option<CapabilityConstraints>,
        keys: &SigningKeyPair,
        now: Instant,
        unix_ms: u64,
    ) -> RouteRequest {
        self.sequence += 1;
        let mut request = RouteRequest {
            kind: RouteRequest::TYPE.to_owned(),
            origin: self.self_id,
            target,
            path: vec![self.self_id],
            sequence: self.sequence,
            ttl: self.config.max_flood_ttl,
            constraints,
            timestamp: unix_ms,
            signature: String::new(),
        };
        request.sign_with(keys);
        self.pending.insert(
            target,
            PendingDiscovery {
                deadline: now + self.config.route_discovery_timeout,
                sequence: self.sequence,
                constraints,
            },
        );
        self.stats.discoveries_started += 1;
        debug!(target = %target, sequence = self.sequence, "route discovery started");
        request
    }

    /// Processes a flooded route request arriving from direct neighbour
    /// `from`.
    pub fn handle_request(
        &mut self,
        request: &RouteRequest,
        from: NodeId,
        keys: &SigningKeyPair,
        now: Instant,
        unix_ms: u64,
    ) -> RequestDisposition {
        // The last forwarder re-signed the amended path; verify against it.
        match self.peer_keys.get(&from) {
            Some(key) => {
                if request.verify_with(key).is_err() {
                    self.stats.requests_dropped += 1;
                    return RequestDisposition::Drop {
                        reason: DropReason::BadSignature,
                    };
                }
            }
            None => {
                self.stats.requests_dropped += 1;
                return RequestDisposition::Drop {
                    reason: DropReason::UnknownPeer,
                };
            }
        }

        if request.path.contains(&self.self_id) {
            self.stats.requests_dropped += 1;
            return RequestDisposition::Drop {
                reason: DropReason::Loop,
            };
        }
        if request.path.len() >= self.config.max_path_length {
            self.stats.requests_dropped += 1;
            return RequestDisposition::Drop {
                reason: DropReason::PathTooLong,
            };
        }

        if !self.flood.should_forward(request.origin, request.sequence, now) {
            self.stats.requests_dropped += 1;
            return RequestDisposition::Drop {
                reason: DropReason::Duplicate,
            };
        }

        let highest = self.highest_seen.entry(request.origin).or_insert(0);
        if *highest > request.sequence {
            self.stats.requests_dropped += 1;
            return RequestDisposition::Drop {
                reason: DropReason::Stale,
            };
        }
        *highest = request.sequence;

        // Learn the reverse route toward the originator for the reply path.
        self.learn_reverse_route(request, from, now);

        if request.target == self.self_id {
            let mut path = request.path.clone();
            path.push(self.self_id);
            let mut reply = RouteReply {
                kind: RouteReply::TYPE.to_owned(),
                origin: request.origin,
                target: self.self_id,
                path,
                sequence: request.sequence,
                node_type: self.profile.node_type,
                utxo_completeness: self.profile.utxo_completeness,
                blockchain_height: self.profile.blockchain_height,
                last_utxo_sync: self.profile.last_utxo_sync,
                services: self.profile.services.clone(),
                timestamp: unix_ms,
                signature: String::new(),
            };
            reply.sign_with(keys);
            self.stats.requests_replied += 1;
            return RequestDisposition::Reply {
                reply,
                next_hop: from,
            };
        }

        if request.ttl <= 1 {
            self.stats.requests_dropped += 1;
            return RequestDisposition::Drop {
                reason: DropReason::TtlExceeded,
            };
        }

        let mut forwarded = request.clone();
        forwarded.ttl -= 1;
        forwarded.path.push(self.self_id);
        forwarded.sign_with(keys);
        self.stats.requests_forwarded += 1;
        RequestDisposition::Forward { request: forwarded }
    }

    /// Processes a route reply travelling the reverse path.
    pub fn handle_reply(&mut self, reply: &RouteReply, from: NodeId, now: Instant) -> ReplyDisposition {
        // Replies are signed once by the destination; verify when its key is
        // known (intermediate hops may not have met the destination yet).
        if let Some(key) = self.peer_keys.get(&reply.target)
            && reply.verify_with(key).is_err()
        {
            return ReplyDisposition::Drop {
                reason: DropReason::BadSignature,
            };
        }

        let Some(position) = reply.path.iter().position(|id| *id == self.self_id) else {
            return ReplyDisposition::Drop {
                reason: DropReason::NotOnPath,
            };
        };

        let hops_to_target = (reply.path.len() - 1 - position) as u8;
        let entry = RouteEntry {
            destination: reply.target,
            next_hop: from,
            hop_count: hops_to_target,
            sequence: reply.sequence,
            node_type: reply.node_type,
            utxo_completeness: reply.utxo_completeness,
            blockchain_height: reply.blockchain_height,
            link_quality: self.link_quality(&from),
            last_utxo_sync: reply.last_utxo_sync,
            is_active: true,
            last_updated: now,
            reply_signature: reply.signature.clone(),
        };
        self.table.insert(entry, now);

        if position == 0 {
            // We are the originator.
            if let Some(pending) = self.pending.get(&reply.target)
                && reply.sequence >= pending.sequence
            {
                if let Some(constraints) = pending.constraints
                    && !satisfies(&constraints, reply)
                {
                    debug!(target = %reply.target, "reply does not meet capability constraints");
                    return ReplyDisposition::Drop {
                        reason: DropReason::ConstraintsUnmet,
                    };
                }
                self.pending.remove(&reply.target);
            }
            self.stats.replies_delivered += 1;
            self.events.push(RoutingEvent::RouteDiscovered {
                target: reply.target,
                next_hop: from,
            });
            info!(target = %reply.target, next_hop = %from, "route installed");
            return ReplyDisposition::Deliver {
                target: reply.target,
            };
        }

        self.stats.replies_forwarded += 1;
        ReplyDisposition::Forward {
            reply: reply.clone(),
            next_hop: reply.path[position - 1],
        }
    }

    /// Builds a signed route-error report for a broken link.
    pub fn create_route_error(
        &mut self,
        broken_to: NodeId,
        keys: &SigningKeyPair,
        now: Instant,
        unix_ms: u64,
    ) -> RouteError {
        let unreachable = self.table.routes_via(&broken_to);
        self.sequence += 1;
        let mut error = RouteError {
            kind: RouteError::TYPE.to_owned(),
            reporter: self.self_id,
            broken_from: self.self_id,
            broken_to,
            unreachable,
            sequence: self.sequence,
            timestamp: unix_ms,
            signature: String::new(),
        };
        error.sign_with(keys);
        self.table
            .handle_broken_link(broken_to, &error.unreachable, self.sequence, now);
        error
    }

    /// Applies a route-error report received from a neighbour.
    pub fn handle_route_error(&mut self, error: &RouteError, now: Instant) -> usize {
        if let Some(key) = self.peer_keys.get(&error.reporter)
            && error.verify_with(key).is_err()
        {
            warn!(reporter = %error.reporter, "route error with bad signature ignored");
            return 0;
        }
        self.stats.errors_handled += 1;
        self.table
            .handle_broken_link(error.broken_to, &error.unreachable, error.sequence, now)
    }

    /// Emits a signed hello beacon when the interval has elapsed.
    pub fn hello_beacon(
        &mut self,
        keys: &SigningKeyPair,
        now: Instant,
        unix_ms: u64,
    ) -> Option<HelloBeacon> {
        if let Some(last) = self.last_hello_at
            && now.duration_since(last) < self.config.hello_interval
        {
            return None;
        }
        self.last_hello_at = Some(now);
        self.sequence += 1;
        let mut hello = HelloBeacon {
            kind: HelloBeacon::TYPE.to_owned(),
            node_id: self.self_id,
            public_key: keys.public_key(),
            node_type: self.profile.node_type,
            blockchain_height: self.profile.blockchain_height,
            utxo_completeness: self.profile.utxo_completeness,
            last_utxo_sync: self.profile.last_utxo_sync,
            services: self.profile.services.clone(),
            neighbors: self.neighbors.keys().copied().collect(),
            sequence: self.sequence,
            timestamp: unix_ms,
            signature: String::new(),
        };
        hello.sign_with(keys);
        Some(hello)
    }

    /// Ingests a neighbour's hello. The beacon is self-certifying: the
    /// embedded key must hash to the claimed node id and the signature must
    /// verify under it.
    pub fn handle_hello(&mut self, hello: &HelloBeacon, now: Instant) -> bool {
        if hello.public_key.node_id() != hello.node_id {
            warn!(node_id = %hello.node_id, "hello with mismatched key discarded");
            return false;
        }
        if hello.verify_with(&hello.public_key).is_err() {
            warn!(node_id = %hello.node_id, "hello with bad signature discarded");
            return false;
        }
        self.stats.hellos_received += 1;
        self.peer_keys
            .insert(hello.node_id, hello.public_key.clone());
        self.neighbors.insert(
            hello.node_id,
            Neighbor {
                node_type: hello.node_type,
                blockchain_height: hello.blockchain_height,
                utxo_completeness: hello.utxo_completeness,
                last_seen: now,
                link_quality: 1.0,
            },
        );
        // A neighbour is a one-hop route.
        self.table.insert(
            RouteEntry {
                destination: hello.node_id,
                next_hop: hello.node_id,
                hop_count: 1,
                sequence: hello.sequence,
                node_type: hello.node_type,
                utxo_completeness: hello.utxo_completeness,
                blockchain_height: hello.blockchain_height,
                link_quality: 1.0,
                last_utxo_sync: hello.last_utxo_sync,
                is_active: true,
                last_updated: now,
                reply_signature: hello.signature.clone(),
            },
            now,
        );
        true
    }

    /// Advances timers: discovery deadlines, table expiry, flood pruning.
    pub fn poll(&mut self, now: Instant) -> Vec<RoutingEvent> {
        let timed_out: Vec<NodeId> = self
            .pending
            .iter()
            .filter(|(_, p)| now >= p.deadline)
            .map(|(&target, _)| target)
            .collect();
        for target in timed_out {
            self.pending.remove(&target);
            self.stats.discoveries_failed += 1;
            self.events.push(RoutingEvent::DiscoveryFailed { target });
            debug!(target = %target, "route discovery timed out");
        }
        let stale_after = self.config.hello_interval * 3;
        self.neighbors
            .retain(|_, n| now.duration_since(n.last_seen) <= stale_after);
        self.table.sweep(now);
        self.flood.prune(now);
        std::mem::take(&mut self.events)
    }

    pub fn has_pending_discovery(&self, target: &NodeId) -> bool {
        self.pending.contains_key(target)
    }

    fn learn_reverse_route(&mut self, request: &RouteRequest, from: NodeId, now: Instant) {
        if request.origin == self.self_id {
            return;
        }
        let entry = RouteEntry {
            destination: request.origin,
            next_hop: from,
            hop_count: request.path.len() as u8,
            sequence: request.sequence,
            // The originator's role is unknown from the request alone.
            node_type: NodeType::Light,
            utxo_completeness: 0.0,
            blockchain_height: 0,
            link_quality: self.link_quality(&from),
            last_utxo_sync: 0,
            is_active: true,
            last_updated: now,
            reply_signature: request.signature.clone(),
        };
        self.table.insert(entry, now);
    }

    fn link_quality(&self, neighbor: &NodeId) -> f64 {
        self.neighbors
            .get(neighbor)
            .map(|n| n.link_quality)
            .unwrap_or(0.5)
    }
}

fn satisfies(constraints: &CapabilityConstraints, reply: &RouteReply) -> bool {
    reply.node_type.rank() <= constraints.min_node_type.rank()
        && reply.utxo_completeness >= constraints.min_utxo_completeness
        && reply.blockchain_height >= constraints.min_blockchain_height
}
