//! The blockchain-aware route table.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use loramesh_wire::crypto::NodeId;
use tracing::debug;

use crate::messages::NodeType;

/// One learned path to a destination via a specific next hop.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteEntry {
    pub destination: NodeId,
    pub next_hop: NodeId,
    pub hop_count: u8,
    /// Originator sequence number; freshness authority.
    pub sequence: u64,
    pub node_type: NodeType,
    pub utxo_completeness: f64,
    pub blockchain_height: u64,
    pub link_quality: f64,
    pub last_utxo_sync: u64,
    pub is_active: bool,
    pub last_updated: Instant,
    /// Signature of the route reply that advertised this entry.
    pub reply_signature: String,
}

#[derive(Debug, Clone)]
pub struct TableConfig {
    pub max_entries: usize,
    pub route_expiry: Duration,
    pub hold_down: Duration,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            max_entries: 256,
            route_expiry: Duration::from_secs(300),
            hold_down: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TableStats {
    pub inserted: u64,
    pub rejected_stale: u64,
    pub rejected_hold_down: u64,
    pub expired: u64,
    pub torn_down: u64,
}

/// Route entries per destination, with sequence-number freshness and
/// hold-down of recently broken paths.
pub struct RoutingTable {
    config: TableConfig,
    routes: HashMap<NodeId, Vec<RouteEntry>>,
    /// (destination, next_hop) -> (hold-down expiry, sequence at teardown).
    hold_downs: HashMap<(NodeId, NodeId), (Instant, u64)>,
    stats: TableStats,
}

impl RoutingTable {
    pub fn new(config: TableConfig) -> Self {
        Self {
            config,
            routes: HashMap::new(),
            hold_downs: HashMap::new(),
            stats: TableStats::default(),
        }
    }

    pub fn stats(&self) -> &TableStats {
        &self.stats
    }

    pub fn len(&self) -> usize {
        self.routes.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Inserts or refreshes an entry.
    ///
    /// For a given (destination, nextHop) pair only the highest sequence
    /// number is retained; entries in hold-down are rejected unless their
    /// sequence is strictly newer than the one torn down.
    pub fn insert(&mut self, entry: RouteEntry, now: Instant) -> bool {
        let key = (entry.destination, entry.next_hop);
        if let Some(&(until, torn_sequence)) = self.hold_downs.get(&key) {
            if now < until && entry.sequence <= torn_sequence {
                self.stats.rejected_hold_down += 1;
                debug!(destination = %entry.destination, "route rejected by hold-down");
                return false;
            }
        }

        let entries = self.routes.entry(entry.destination).or_default();
        if let Some(existing) = entries.iter_mut().find(|e| e.next_hop == entry.next_hop) {
            if entry.sequence < existing.sequence {
                self.stats.rejected_stale += 1;
                return false;
            }
            *existing = entry;
            self.stats.inserted += 1;
            return true;
        }

        entries.push(entry);
        self.stats.inserted += 1;
        self.enforce_capacity(now);
        true
    }

    /// The best active route to `destination` under the selection order:
    /// full nodes first, then fewest hops, best link, most complete UTXO
    /// set, most recent sync.
    pub fn best_route(&self, destination: &NodeId, now: Instant) -> Option<&RouteEntry> {
        let entries = self.routes.get(destination)?;
        entries
            .iter()
            .filter(|e| e.is_active)
            .filter(|e| now.duration_since(e.last_updated) <= self.config.route_expiry)
            .min_by(|a, b| {
                (a.node_type.rank(), a.hop_count)
                    .cmp(&(b.node_type.rank(), b.hop_count))
                    .then_with(|| b.link_quality.total_cmp(&a.link_quality))
                    .then_with(|| b.utxo_completeness.total_cmp(&a.utxo_completeness))
                    .then_with(|| b.last_utxo_sync.cmp(&a.last_utxo_sync))
            })
    }

    pub fn routes_to(&self, destination: &NodeId) -> &[RouteEntry] {
        self.routes
            .get(destination)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Every entry in the table, for snapshots and observability.
    pub fn all_entries(&self) -> impl Iterator<Item = &RouteEntry> {
        self.routes.values().flatten()
    }

    /// Destinations currently reached through `next_hop`.
    pub fn routes_via(&self, next_hop: &NodeId) -> Vec<NodeId> {
        self.routes
            .iter()
            .filter(|(_, entries)| entries.iter().any(|e| e.next_hop == *next_hop))
            .map(|(&destination, _)| destination)
            .collect()
    }

    /// Tears down every route using the broken link and starts hold-down
    /// timers for the stranded destinations.
    pub fn handle_broken_link(
        &mut self,
        broken_to: NodeId,
        unreachable: &[NodeId],
        sequence: u64,
        now: Instant,
    ) -> usize {
        let hold_until = now + self.config.hold_down;
        let mut removed = 0;
        for (destination, entries) in self.routes.iter_mut() {
            let strands_destination =
                unreachable.is_empty() || unreachable.contains(destination);
            entries.retain(|entry| {
                if entry.next_hop == broken_to && strands_destination {
                    self.hold_downs
                        .insert((entry.destination, entry.next_hop), (hold_until, sequence.max(entry.sequence)));
                    removed += 1;
                    false
                } else {
                    true
                }
            });
        }
        self.routes.retain(|_, entries| !entries.is_empty());
        self.stats.torn_down += removed as u64;
        removed
    }

    /// Drops expired entries and elapsed hold-downs.
    pub fn sweep(&mut self, now: Instant) {
        let expiry = self.config.route_expiry;
        let mut expired = 0;
        for entries in self.routes.values_mut() {
            entries.retain(|entry| {
                if now.duration_since(entry.last_updated) > expiry {
                    expired += 1;
                    false
                } else {
                    true
                }
            });
        }
        self.routes.retain(|_, entries| !entries.is_empty());
        self.stats.expired += expired;
        self.hold_downs.retain(|_, &mut (until, _)| now < until);
    }

    fn enforce_capacity(&mut self, _now: Instant) {
        while self.len() > self.config.max_entries {
            // Drop the stalest entry table-wide.
            let victim = self
                .routes
                .iter()
                .flat_map(|(dest, entries)| entries.iter().map(move |e| (*dest, e.next_hop, e.last_updated)))
                .min_by_key(|&(_, _, at)| at);
            let Some((dest, hop, _)) = victim else { break };
            if let Some(entries) = self.routes.get_mut(&dest) {
                entries.retain(|e| e.next_hop != hop);
                if entries.is_empty() {
                    self.routes.remove(&dest);
                }
            }
        }
    }
}
