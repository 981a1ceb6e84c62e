//! Flood router: de-dup, local delivery, TTL-bounded relay.
//!
//! The router is pure decision logic. It does not touch links (the mesh
//! service executes its verdicts) and it does not know about sessions
//! or the directory. A duplicate within the window is neither delivered
//! nor relayed; a relay decrements TTL by exactly one and only happens
//! when the inbound TTL was positive; a TTL-zero packet is delivered
//! only when locally addressed (broadcast counts).

use bitchat_proto::{Packet, PeerId};

use crate::config::MeshConfig;
use crate::dedup::{DedupWindow, PacketIdentity};

/// What to do with a received packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteOutcome {
    /// Hand the payload to local processing.
    pub deliver: bool,
    /// Re-emit this packet (TTL already decremented) on every link
    /// except the arrival link.
    pub relay: Option<Packet>,
}

impl RouteOutcome {
    /// Neither deliver nor relay.
    #[must_use]
    pub const fn drop() -> Self {
        Self { deliver: false, relay: None }
    }
}

/// Why packets were dropped, for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DropCounters {
    /// Malformed frames (decode failures, bad version).
    pub framing: u64,
    /// Duplicates suppressed by the window.
    pub duplicate: u64,
    /// Packets neither deliverable nor relayable (TTL spent).
    pub ttl_exhausted: u64,
    /// Packets from ourselves echoed back by the mesh.
    pub echo: u64,
}

/// Flood router with duplicate suppression.
#[derive(Debug)]
pub struct Router {
    dedup: DedupWindow,
    counters: DropCounters,
}

impl Router {
    /// Build a router from the mesh configuration.
    #[must_use]
    pub fn new(config: &MeshConfig) -> Self {
        Self {
            dedup: DedupWindow::new(config.dedup_window, config.dedup_capacity),
            counters: DropCounters::default(),
        }
    }

    /// Decide delivery and relay for a decoded packet.
    ///
    /// `local_id` is our current peer id; `now_ms` drives the de-dup
    /// window.
    pub fn route(&mut self, packet: &Packet, local_id: &PeerId, now_ms: u64) -> RouteOutcome {
        // Our own packets come back over other links; never re-process.
        if packet.sender_id == *local_id {
            self.counters.echo += 1;
            return RouteOutcome::drop();
        }

        if self.dedup.check_and_insert(PacketIdentity::of(packet), now_ms) {
            self.counters.duplicate += 1;
            tracing::debug!(sender = %packet.sender_id, "duplicate packet suppressed");
            return RouteOutcome::drop();
        }

        let addressed_locally = packet.is_broadcast() || packet.is_addressed_to(local_id);
        let deliver = addressed_locally;

        // The final recipient does not relay a packet addressed only to
        // it; everything else floods while TTL remains.
        let relay = if packet.is_addressed_to(local_id) || packet.ttl == 0 {
            None
        } else {
            let mut relayed = packet.clone();
            relayed.ttl -= 1;
            Some(relayed)
        };

        if !deliver && relay.is_none() {
            self.counters.ttl_exhausted += 1;
            tracing::debug!(sender = %packet.sender_id, "ttl exhausted, packet dropped");
        }

        RouteOutcome { deliver, relay }
    }

    /// Record a frame that failed to decode.
    pub fn note_framing_drop(&mut self) {
        self.counters.framing += 1;
    }

    /// Snapshot of the drop counters.
    #[must_use]
    pub fn counters(&self) -> DropCounters {
        self.counters
    }
}

#[cfg(test)]
mod tests {
    use bitchat_proto::MessageType;

    use super::*;

    const LOCAL: PeerId = PeerId::new([0xAA; 8]);

    fn broadcast(ttl: u8) -> Packet {
        Packet::new(MessageType::Message, PeerId::new([1; 8]), 1_000, b"x".to_vec())
            .with_recipient(PeerId::BROADCAST)
            .with_ttl(ttl)
    }

    fn router() -> Router {
        Router::new(&MeshConfig::default())
    }

    #[test]
    fn broadcast_delivers_and_relays() {
        let mut router = router();
        let outcome = router.route(&broadcast(7), &LOCAL, 1_000);
        assert!(outcome.deliver);
        let relayed = outcome.relay.unwrap();
        assert_eq!(relayed.ttl, 6);
    }

    #[test]
    fn duplicate_is_suppressed_entirely() {
        let mut router = router();
        let packet = broadcast(7);
        assert!(router.route(&packet, &LOCAL, 1_000).deliver);
        // Same packet from another link within a second.
        let again = router.route(&packet, &LOCAL, 1_400);
        assert_eq!(again, RouteOutcome::drop());
        assert_eq!(router.counters().duplicate, 1);
    }

    #[test]
    fn relay_decrements_ttl_by_one() {
        let mut router = router();
        for ttl in 1u8..=7 {
            let mut packet = broadcast(ttl);
            packet.timestamp_ms = 1_000 + u64::from(ttl); // distinct identity
            let relayed = router.route(&packet, &LOCAL, 1_000).relay.unwrap();
            assert_eq!(relayed.ttl, ttl - 1);
        }
    }

    #[test]
    fn ttl_zero_broadcast_delivers_without_relay() {
        let mut router = router();
        let outcome = router.route(&broadcast(0), &LOCAL, 1_000);
        assert!(outcome.deliver);
        assert!(outcome.relay.is_none());
    }

    #[test]
    fn ttl_zero_foreign_packet_is_dropped() {
        let mut router = router();
        let packet = broadcast(0).with_recipient(PeerId::new([0xBB; 8]));
        let outcome = router.route(&packet, &LOCAL, 1_000);
        assert_eq!(outcome, RouteOutcome::drop());
        assert_eq!(router.counters().ttl_exhausted, 1);
    }

    #[test]
    fn directed_to_us_is_not_relayed() {
        let mut router = router();
        let packet = broadcast(7).with_recipient(LOCAL);
        let outcome = router.route(&packet, &LOCAL, 1_000);
        assert!(outcome.deliver);
        assert!(outcome.relay.is_none());
    }

    #[test]
    fn directed_elsewhere_relays_without_delivery() {
        let mut router = router();
        let packet = broadcast(7).with_recipient(PeerId::new([0xBB; 8]));
        let outcome = router.route(&packet, &LOCAL, 1_000);
        assert!(!outcome.deliver);
        assert_eq!(outcome.relay.unwrap().ttl, 6);
    }

    #[test]
    fn own_echo_is_dropped() {
        let mut router = router();
        let mut packet = broadcast(7);
        packet.sender_id = LOCAL;
        assert_eq!(router.route(&packet, &LOCAL, 1_000), RouteOutcome::drop());
        assert_eq!(router.counters().echo, 1);
    }

    #[test]
    fn three_hop_chain_decays_to_zero() {
        // A sends ttl=2; B and C relay; D delivers without relaying.
        let mut b = router();
        let mut c = router();
        let mut d = router();

        let from_a = broadcast(2);
        let at_b = b.route(&from_a, &PeerId::new([0xB0; 8]), 1_000);
        assert!(at_b.deliver);
        let from_b = at_b.relay.unwrap();
        assert_eq!(from_b.ttl, 1);

        let at_c = c.route(&from_b, &PeerId::new([0xC0; 8]), 1_001);
        assert!(at_c.deliver);
        let from_c = at_c.relay.unwrap();
        assert_eq!(from_c.ttl, 0);

        let at_d = d.route(&from_c, &PeerId::new([0xD0; 8]), 1_002);
        assert!(at_d.deliver);
        assert!(at_d.relay.is_none());
    }
}
