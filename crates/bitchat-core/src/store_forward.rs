//! Store-and-forward cache for offline recipients.
//!
//! Directed packets for a peer with no live session (or no live peer id)
//! are held keyed by the recipient's *fingerprint*, since the peer id may have
//! rotated by the time they come back. Queues are FIFO with per-recipient
//! count, global byte, and age caps; replay hands entries back
//! oldest-first when the fingerprint becomes reachable.

use std::collections::{HashMap, VecDeque};

use bitchat_proto::Packet;

use crate::config::MeshConfig;

#[derive(Debug)]
struct CachedPacket {
    packet: Packet,
    cached_at_ms: u64,
    size: usize,
}

/// Bounded per-fingerprint packet cache.
#[derive(Debug)]
pub struct StoreForwardCache {
    ttl_ms: u64,
    per_recipient: usize,
    max_bytes: usize,
    total_bytes: usize,
    queues: HashMap<String, VecDeque<CachedPacket>>,
}

impl StoreForwardCache {
    /// Build from the mesh configuration.
    #[must_use]
    pub fn new(config: &MeshConfig) -> Self {
        Self {
            ttl_ms: config.store_forward_ttl.as_millis() as u64,
            per_recipient: config.store_forward_per_recipient,
            max_bytes: config.store_forward_max_bytes,
            total_bytes: 0,
            queues: HashMap::new(),
        }
    }

    /// Cache a directed packet for an offline recipient.
    ///
    /// When the per-recipient queue is full its oldest entry is dropped;
    /// when the global byte budget is exceeded the oldest entries across
    /// the cache are dropped until the new packet fits.
    pub fn enqueue(&mut self, fingerprint: &str, packet: Packet, now_ms: u64) {
        let size = packet.payload.len() + 64;

        // Shed oldest entries globally until the byte budget holds.
        while self.total_bytes + size > self.max_bytes && self.drop_globally_oldest() {}

        let queue = self.queues.entry(fingerprint.to_string()).or_default();
        if queue.len() >= self.per_recipient {
            if let Some(dropped) = queue.pop_front() {
                self.total_bytes -= dropped.size;
            }
        }
        queue.push_back(CachedPacket { packet, cached_at_ms: now_ms, size });
        self.total_bytes += size;
        tracing::debug!(fingerprint, bytes = self.total_bytes, "packet cached for offline peer");
    }

    /// Take every non-expired packet cached for `fingerprint`,
    /// oldest-first.
    pub fn drain_for(&mut self, fingerprint: &str, now_ms: u64) -> Vec<Packet> {
        let Some(queue) = self.queues.remove(fingerprint) else {
            return Vec::new();
        };
        let mut out = Vec::with_capacity(queue.len());
        for cached in queue {
            self.total_bytes -= cached.size;
            if now_ms.saturating_sub(cached.cached_at_ms) <= self.ttl_ms {
                out.push(cached.packet);
            }
        }
        out
    }

    /// True when packets are waiting for `fingerprint`.
    #[must_use]
    pub fn has_pending(&self, fingerprint: &str) -> bool {
        self.queues.get(fingerprint).is_some_and(|q| !q.is_empty())
    }

    /// Packets waiting for `fingerprint`.
    #[must_use]
    pub fn pending_count(&self, fingerprint: &str) -> usize {
        self.queues.get(fingerprint).map_or(0, VecDeque::len)
    }

    /// Drop expired entries everywhere; returns how many were dropped.
    pub fn purge_expired(&mut self, now_ms: u64) -> usize {
        let ttl = self.ttl_ms;
        let mut dropped = 0usize;
        let mut freed = 0usize;
        for queue in self.queues.values_mut() {
            while let Some(front) = queue.front() {
                if now_ms.saturating_sub(front.cached_at_ms) <= ttl {
                    break;
                }
                if let Some(expired) = queue.pop_front() {
                    dropped += 1;
                    freed += expired.size;
                }
            }
        }
        self.queues.retain(|_, q| !q.is_empty());
        self.total_bytes -= freed;
        dropped
    }

    /// Total bytes currently cached.
    #[must_use]
    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    fn drop_globally_oldest(&mut self) -> bool {
        let oldest_key = self
            .queues
            .iter()
            .filter_map(|(key, q)| q.front().map(|c| (key.clone(), c.cached_at_ms)))
            .min_by_key(|&(_, at)| at)
            .map(|(key, _)| key);
        let Some(key) = oldest_key else {
            return false;
        };
        let mut emptied = false;
        if let Some(queue) = self.queues.get_mut(&key) {
            if let Some(dropped) = queue.pop_front() {
                self.total_bytes -= dropped.size;
            }
            emptied = queue.is_empty();
        }
        if emptied {
            self.queues.remove(&key);
        }
        true
    }
}
