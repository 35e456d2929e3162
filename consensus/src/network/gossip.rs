// Gossip suppression and fan-out selection
//
// Two hash caches keep epidemic dissemination self-terminating:
// - `sent`: payloads this node emitted; never re-emitted, echoes dropped
// - `received`: payloads already handled; a second delivery marks the entry
//   and schedules its expiry, any further delivery is dropped

use super::types::{Node, NodeId};
use crate::crypto::Hash;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::Deserialize;
use std::collections::HashMap;
use tokio::time::{Duration, Instant};
use tracing::debug;

/// Gossip configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GossipConfig {
    /// Fan-out of `send_gossip` / `send_gossip_in`
    pub gossip_recipients: usize,

    /// How long a payload seen twice stays suppressed
    pub gossip_timeout_ms: u64,

    /// How long a payload we emitted stays in the sent cache
    pub sent_ttl_ms: u64,

    /// Soft cap on tracked hashes before a sweep is forced
    pub max_tracked_messages: usize,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            gossip_recipients: 8,
            gossip_timeout_ms: 30_000,
            sent_ttl_ms: 600_000,
            max_tracked_messages: 10_000,
        }
    }
}

/// Gossip statistics
#[derive(Debug, Clone, Default)]
pub struct GossipStats {
    /// Payloads emitted by this node
    pub messages_broadcast: u64,

    /// Payloads dispatched to a handler
    pub messages_received: u64,

    /// Repeat deliveries dropped
    pub duplicates_filtered: u64,

    /// Our own payloads coming back to us
    pub echoes_dropped: u64,

    /// Unicasts that failed inside a fan-out
    pub failed_sends: u64,
}

/// What to do with an inbound gossip payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// We emitted this exact payload ourselves
    Echo,
    /// Already handled
    Duplicate,
    /// First delivery; dispatch to the type handler
    New,
}

#[derive(Debug, Clone)]
struct ReceivedEntry {
    seen_twice: bool,
    expires_at: Option<Instant>,
}

/// Sent/received hash caches for one node
pub struct GossipCache {
    sent: HashMap<Hash, Instant>,
    received: HashMap<Hash, ReceivedEntry>,
    config: GossipConfig,
    stats: GossipStats,
}

impl GossipCache {
    pub fn new(config: GossipConfig) -> Self {
        Self {
            sent: HashMap::new(),
            received: HashMap::new(),
            config,
            stats: GossipStats::default(),
        }
    }

    /// Record a payload we are about to emit.
    ///
    /// Returns `false` when the same payload was already emitted, in which
    /// case the caller must not send it again.
    pub fn mark_sent(&mut self, hash: Hash) -> bool {
        let now = Instant::now();
        self.sweep(now);
        if self.sent.contains_key(&hash) {
            return false;
        }
        self.sent.insert(hash, now);
        self.stats.messages_broadcast += 1;
        true
    }

    pub fn was_sent(&self, hash: &Hash) -> bool {
        self.sent.contains_key(hash)
    }

    /// Classify an inbound payload and update the caches
    pub fn on_receive(&mut self, hash: Hash) -> ReceiveOutcome {
        let now = Instant::now();
        self.sweep(now);

        if self.sent.contains_key(&hash) {
            self.stats.echoes_dropped += 1;
            return ReceiveOutcome::Echo;
        }

        if let Some(entry) = self.received.get_mut(&hash) {
            if !entry.seen_twice {
                entry.seen_twice = true;
                entry.expires_at = Some(now + Duration::from_millis(self.config.gossip_timeout_ms));
            }
            self.stats.duplicates_filtered += 1;
            return ReceiveOutcome::Duplicate;
        }

        self.received.insert(
            hash,
            ReceivedEntry {
                seen_twice: false,
                expires_at: None,
            },
        );
        self.stats.messages_received += 1;
        ReceiveOutcome::New
    }

    pub fn record_failed_send(&mut self) {
        self.stats.failed_sends += 1;
    }

    pub fn stats(&self) -> GossipStats {
        self.stats.clone()
    }

    pub fn tracked(&self) -> (usize, usize) {
        (self.sent.len(), self.received.len())
    }

    /// Drop expired received entries and sent entries past their TTL
    fn sweep(&mut self, now: Instant) {
        let sent_ttl = Duration::from_millis(self.config.sent_ttl_ms);
        self.sent.retain(|_, sent_at| now.duration_since(*sent_at) < sent_ttl);
        self.received
            .retain(|_, entry| entry.expires_at.map_or(true, |at| at > now));

        if self.received.len() > self.config.max_tracked_messages {
            // Entries seen only once never got an expiry; age them out with
            // the same timeout once the cache grows past its cap.
            let expires_at = now + Duration::from_millis(self.config.gossip_timeout_ms);
            for entry in self.received.values_mut() {
                entry.expires_at.get_or_insert(expires_at);
            }
            debug!(
                tracked = self.received.len(),
                "gossip cache over capacity, scheduled expiry for all entries"
            );
        }
    }
}

/// Candidates for a fan-out: everyone except ourselves and the excluded sender
fn candidates<'a>(nodes: &'a [Node], self_id: &NodeId, exclude: Option<&NodeId>) -> Vec<&'a Node> {
    nodes
        .iter()
        .filter(|n| &n.id != self_id && Some(&n.id) != exclude)
        .collect()
}

/// Uniform random subset of size `count`
pub fn select_random<R: Rng + ?Sized>(
    nodes: &[Node],
    count: usize,
    self_id: &NodeId,
    exclude: Option<&NodeId>,
    rng: &mut R,
) -> Vec<Node> {
    let pool = candidates(nodes, self_id, exclude);
    pool.choose_multiple(rng, count.min(pool.len()))
        .map(|n| (*n).clone())
        .collect()
}

/// Ring-biased selection.
///
/// Nodes are ordered by id and our own position located; the next and
/// previous neighbours are always chosen, remaining slots are filled with
/// distinct random positions. Falls back to `select_random` when we are not
/// in the list.
pub fn select_gossip_in<R: Rng + ?Sized>(
    nodes: &[Node],
    count: usize,
    self_id: &NodeId,
    exclude: Option<&NodeId>,
    rng: &mut R,
) -> Vec<Node> {
    let mut sorted: Vec<&Node> = nodes.iter().collect();
    sorted.sort_by(|a, b| a.id.cmp(&b.id));
    sorted.dedup_by(|a, b| a.id == b.id);

    let my_idx = match sorted.iter().position(|n| &n.id == self_id) {
        Some(idx) => idx,
        None => return select_random(nodes, count, self_id, exclude, rng),
    };

    let indices = ring_indices(sorted.len(), count, my_idx, rng);
    indices
        .into_iter()
        .map(|idx| sorted[idx])
        .filter(|n| Some(&n.id) != exclude)
        .cloned()
        .collect()
}

/// Positions chosen around `my_idx` in a ring of `len` nodes
pub fn ring_indices<R: Rng + ?Sized>(len: usize, fan_out: usize, my_idx: usize, rng: &mut R) -> Vec<usize> {
    if len < 2 {
        return Vec::new();
    }
    let fan_out = fan_out.min(len - 1);
    if fan_out == 0 {
        return Vec::new();
    }

    let mut results = vec![(my_idx + 1) % len];
    if fan_out < 2 {
        return results;
    }
    let prev = (my_idx + len - 1) % len;
    if !results.contains(&prev) {
        results.push(prev);
    }

    while results.len() < fan_out {
        let r = rng.gen_range(0..len);
        if r != my_idx && !results.contains(&r) {
            results.push(r);
        }
    }
    results
}

/// Every node except ourselves and the excluded sender
pub fn select_all(nodes: &[Node], self_id: &NodeId, exclude: Option<&NodeId>) -> Vec<Node> {
    candidates(nodes, self_id, exclude).into_iter().cloned().collect()
}
