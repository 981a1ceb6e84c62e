//! Fragment reassembly.
//!
//! A bounded arena keyed by fragment id. Each train records the chunks
//! received so far and a deadline; completion reconstructs the original
//! packet and removes the train. Partial trains are purged by the
//! maintenance tick, and the oldest train is evicted when the arena is
//! full, so unbounded growth from hostile fragment ids is not possible.

use std::collections::HashMap;

use bitchat_proto::{FragmentPayload, Packet, ProtocolError};

use crate::config::MeshConfig;

/// Maximum chunks a single train may claim. Prevents a hostile START
/// from reserving gigabytes.
const MAX_FRAGMENTS_PER_TRAIN: u16 = 1024;

#[derive(Debug)]
struct Train {
    original_type: bitchat_proto::MessageType,
    total: u16,
    chunks: Vec<Option<Vec<u8>>>,
    received: u16,
    started_at_ms: u64,
    template: Packet,
}

/// Bounded reassembly arena.
#[derive(Debug)]
pub struct ReassemblyTable {
    deadline_ms: u64,
    capacity: usize,
    trains: HashMap<u64, Train>,
}

impl ReassemblyTable {
    /// Build from the mesh configuration.
    #[must_use]
    pub fn new(config: &MeshConfig) -> Self {
        Self {
            deadline_ms: config.fragment_reassembly_deadline.as_millis() as u64,
            capacity: config.fragment_table_capacity,
            trains: HashMap::new(),
        }
    }

    /// Feed one fragment packet.
    ///
    /// Returns the reconstructed packet when this fragment completes its
    /// train, `None` while the train is still partial.
    ///
    /// # Errors
    ///
    /// Malformed fragment payloads and trains with inconsistent metadata
    /// are rejected (the caller counts them as framing drops).
    pub fn insert(&mut self, packet: &Packet, now_ms: u64) -> Result<Option<Packet>, ProtocolError> {
        let fragment = FragmentPayload::decode(&packet.payload)?;
        if fragment.total > MAX_FRAGMENTS_PER_TRAIN {
            return Err(ProtocolError::MalformedFragment("train too long"));
        }

        if !self.trains.contains_key(&fragment.fragment_id) {
            if self.trains.len() >= self.capacity {
                self.evict_oldest();
            }
            self.trains.insert(
                fragment.fragment_id,
                Train {
                    original_type: fragment.original_type,
                    total: fragment.total,
                    chunks: vec![None; fragment.total as usize],
                    received: 0,
                    started_at_ms: now_ms,
                    template: packet.clone(),
                },
            );
        }
        let Some(train) = self.trains.get_mut(&fragment.fragment_id) else {
            return Ok(None);
        };
        if train.total != fragment.total || train.original_type != fragment.original_type {
            return Err(ProtocolError::MalformedFragment("inconsistent train metadata"));
        }

        let slot = &mut train.chunks[fragment.index as usize];
        if slot.is_none() {
            *slot = Some(fragment.chunk);
            train.received += 1;
        }

        if train.received == train.total {
            let train = match self.trains.remove(&fragment.fragment_id) {
                Some(train) => train,
                None => return Ok(None),
            };
            let mut payload = Vec::new();
            for chunk in train.chunks.into_iter().flatten() {
                payload.extend_from_slice(&chunk);
            }
            let mut packet = train.template;
            packet.message_type = train.original_type;
            packet.payload = payload;
            packet.signature = None;
            return Ok(Some(packet));
        }
        Ok(None)
    }

    /// Drop trains past their deadline; returns how many were freed.
    pub fn purge_expired(&mut self, now_ms: u64) -> usize {
        let deadline = self.deadline_ms;
        let before = self.trains.len();
        self.trains.retain(|_, train| now_ms.saturating_sub(train.started_at_ms) <= deadline);
        let freed = before - self.trains.len();
        if freed > 0 {
            tracing::debug!(freed, "expired fragment trains purged");
        }
        freed
    }

    /// Trains currently buffered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.trains.len()
    }

    /// True when no trains are buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.trains.is_empty()
    }

    fn evict_oldest(&mut self) {
        if let Some((&id, _)) =
            self.trains.iter().min_by_key(|(_, train)| train.started_at_ms)
        {
            self.trains.remove(&id);
            tracing::debug!(fragment_id = id, "fragment arena full, oldest train evicted");
        }
    }
}

#[cfg(test)]
mod tests {
    use bitchat_proto::{MessageType, PeerId, split_packet};

    use super::*;

    fn original(len: usize) -> Packet {
        let payload: Vec<u8> = (0..len).map(|i| (i % 249) as u8).collect();
        Packet::new(MessageType::Message, PeerId::new([3; 8]), 1_700_000_000_000, payload)
            .with_recipient(PeerId::new([4; 8]))
    }

    fn table() -> ReassemblyTable {
        ReassemblyTable::new(&MeshConfig::default())
    }

    #[test]
    fn in_order_reassembly() {
        let mut table = table();
        let packet = original(4000);
        let fragments = split_packet(&packet, 512).unwrap();

        let mut result = None;
        for fragment in &fragments {
            result = table.insert(fragment, 1_000).unwrap();
        }
        let rebuilt = result.unwrap();
        assert_eq!(rebuilt.message_type, MessageType::Message);
        assert_eq!(rebuilt.payload, packet.payload);
        assert_eq!(rebuilt.sender_id, packet.sender_id);
        assert_eq!(rebuilt.recipient_id, packet.recipient_id);
        assert!(table.is_empty());
    }

    #[test]
    fn out_of_order_reassembly() {
        let mut table = table();
        let packet = original(3000);
        let mut fragments = split_packet(&packet, 512).unwrap();
        fragments.reverse();

        let mut result = None;
        for fragment in &fragments {
            result = table.insert(fragment, 1_000).unwrap();
        }
        assert_eq!(result.unwrap().payload, packet.payload);
    }

    #[test]
    fn duplicate_fragment_is_idempotent() {
        let mut table = table();
        let packet = original(3000);
        let fragments = split_packet(&packet, 512).unwrap();

        assert!(table.insert(&fragments[0], 1_000).unwrap().is_none());
        assert!(table.insert(&fragments[0], 1_001).unwrap().is_none());
        for fragment in &fragments[1..] {
            let _ = table.insert(fragment, 1_002).unwrap();
        }
        assert!(table.is_empty());
    }

    #[test]
    fn expired_trains_are_purged() {
        let mut table = table();
        let packet = original(3000);
        let fragments = split_packet(&packet, 512).unwrap();
        table.insert(&fragments[0], 1_000).unwrap();

        assert_eq!(table.purge_expired(5_000), 0);
        assert_eq!(table.purge_expired(12_000), 1);
        assert!(table.is_empty());
    }

    #[test]
    fn arena_pressure_drops_oldest() {
        let config =
            MeshConfig { fragment_table_capacity: 2, ..MeshConfig::default() };
        let mut table = ReassemblyTable::new(&config);

        for (i, at) in [(0u8, 1_000u64), (1, 2_000), (2, 3_000)] {
            let mut packet = original(3000);
            packet.sender_id = PeerId::new([i; 8]);
            let fragments = split_packet(&packet, 512).unwrap();
            table.insert(&fragments[0], at).unwrap();
        }
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn hostile_total_is_rejected() {
        let mut table = table();
        let payload = FragmentPayload {
            fragment_id: 42,
            index: 0,
            total: MAX_FRAGMENTS_PER_TRAIN + 1,
            original_type: MessageType::Message,
            chunk: vec![0; 4],
        };
        let mut packet = original(100);
        packet.message_type = MessageType::FragmentStart;
        packet.payload = payload.encode();
        assert!(table.insert(&packet, 1_000).is_err());
        assert!(table.is_empty());
    }
}
