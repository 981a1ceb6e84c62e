//! Sliding-window duplicate suppression.
//!
//! Flood routing re-delivers the same packet over every link; the window
//! remembers `(sender, timestamp, payload-hash)` identities for a bounded
//! time and count so each packet is delivered and relayed at most once.
//! Cleanup is lazy: expired entries are swept on insert, and when the
//! window is still full after sweeping, the oldest identity is evicted.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use sha2::{Digest, Sha256};

use bitchat_proto::Packet;

/// Identity of a packet for duplicate detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PacketIdentity {
    sender: [u8; 8],
    timestamp_ms: u64,
    payload_hash: [u8; 32],
}

impl PacketIdentity {
    /// Compute the identity of a packet.
    #[must_use]
    pub fn of(packet: &Packet) -> Self {
        Self {
            sender: *packet.sender_id.as_bytes(),
            timestamp_ms: packet.timestamp_ms,
            payload_hash: Sha256::digest(&packet.payload).into(),
        }
    }
}

/// Time- and count-bounded set of recently seen packet identities.
#[derive(Debug)]
pub struct DedupWindow {
    window: Duration,
    capacity: usize,
    seen: HashMap<PacketIdentity, u64>,
    order: VecDeque<(u64, PacketIdentity)>,
}

impl DedupWindow {
    /// Create a window retaining identities for `window` with at most
    /// `capacity` entries.
    #[must_use]
    pub fn new(window: Duration, capacity: usize) -> Self {
        Self {
            window,
            capacity,
            seen: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
        }
    }

    /// Record a packet identity; returns `true` if it was already
    /// present within the window (i.e. the packet is a duplicate).
    pub fn check_and_insert(&mut self, identity: PacketIdentity, now_ms: u64) -> bool {
        self.sweep(now_ms);
        if let Some(&seen_at) = self.seen.get(&identity) {
            if now_ms.saturating_sub(seen_at) <= self.window.as_millis() as u64 {
                return true;
            }
        }
        if self.seen.len() >= self.capacity {
            if let Some((_, oldest)) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.seen.insert(identity, now_ms);
        self.order.push_back((now_ms, identity));
        false
    }

    /// Entries currently tracked.
    #[must_use]
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// True when no identities are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    fn sweep(&mut self, now_ms: u64) {
        let horizon = self.window.as_millis() as u64;
        while let Some(&(inserted_at, identity)) = self.order.front() {
            if now_ms.saturating_sub(inserted_at) <= horizon {
                break;
            }
            self.order.pop_front();
            // Only remove if the map still holds this insertion (the
            // identity may have been refreshed after expiry).
            if self.seen.get(&identity) == Some(&inserted_at) {
                self.seen.remove(&identity);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use bitchat_proto::{MessageType, PeerId};

    use super::*;

    fn packet(sender: u8, ts: u64, payload: &[u8]) -> Packet {
        Packet::new(MessageType::Message, PeerId::new([sender; 8]), ts, payload.to_vec())
    }

    fn window() -> DedupWindow {
        DedupWindow::new(Duration::from_secs(30), 1000)
    }

    #[test]
    fn repeat_within_window_is_duplicate() {
        let mut dedup = window();
        let id = PacketIdentity::of(&packet(1, 100, b"x"));
        assert!(!dedup.check_and_insert(id, 1_000));
        assert!(dedup.check_and_insert(id, 1_500));
        assert!(dedup.check_and_insert(id, 30_999));
    }

    #[test]
    fn repeat_after_window_is_fresh() {
        let mut dedup = window();
        let id = PacketIdentity::of(&packet(1, 100, b"x"));
        assert!(!dedup.check_and_insert(id, 1_000));
        assert!(!dedup.check_and_insert(id, 32_001));
    }

    #[test]
    fn identity_covers_sender_timestamp_and_payload() {
        let base = PacketIdentity::of(&packet(1, 100, b"x"));
        assert_ne!(base, PacketIdentity::of(&packet(2, 100, b"x")));
        assert_ne!(base, PacketIdentity::of(&packet(1, 101, b"x")));
        assert_ne!(base, PacketIdentity::of(&packet(1, 100, b"y")));
        // TTL and recipient do not affect identity.
        let mut relayed = packet(1, 100, b"x");
        relayed.ttl = 2;
        relayed.recipient_id = Some(PeerId::BROADCAST);
        assert_eq!(base, PacketIdentity::of(&relayed));
    }

    #[test]
    fn capacity_evicts_oldest() {
        let mut dedup = DedupWindow::new(Duration::from_secs(30), 3);
        let ids: Vec<_> =
            (0..4u8).map(|i| PacketIdentity::of(&packet(i, 100, b"p"))).collect();
        for id in &ids[..3] {
            assert!(!dedup.check_and_insert(*id, 1_000));
        }
        assert!(!dedup.check_and_insert(ids[3], 1_001));
        assert_eq!(dedup.len(), 3);
        // Oldest entry fell out, so it reads as fresh again.
        assert!(!dedup.check_and_insert(ids[0], 1_002));
    }

    #[test]
    fn sweep_reclaims_expired_entries() {
        let mut dedup = window();
        for i in 0..10u8 {
            dedup.check_and_insert(PacketIdentity::of(&packet(i, 100, b"p")), 1_000);
        }
        assert_eq!(dedup.len(), 10);
        dedup.check_and_insert(PacketIdentity::of(&packet(99, 100, b"p")), 40_000);
        assert_eq!(dedup.len(), 1);
    }
}
