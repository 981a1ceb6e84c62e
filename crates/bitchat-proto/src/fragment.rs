//! Payload fragmentation for links with small frame limits.
//!
//! When an encoded packet would exceed the link MTU, its payload is
//! sliced into chunks and re-sent as a FRAGMENT_START / CONTINUE / END
//! train. Every fragment carries a 13-byte header binding it to a random
//! 64-bit fragment id, its index, the train length, and the original
//! message type; the remaining header fields (sender, recipient, ttl,
//! timestamp) are inherited from the original packet. Fragments are never
//! compressed or signed. Reassembly lives with the router, which owns the
//! bounded table and deadlines.

use rand::Rng;

use crate::errors::{ProtocolError, Result};
use crate::packet::{MessageType, PEER_ID_LEN, Packet};
use crate::wire::FIXED_PREFIX_LEN;

/// Fragment header: id(8) + index(2) + total(2) + original type(1).
pub const FRAGMENT_HEADER_LEN: usize = 13;

/// Wire overhead of a fragment packet besides the chunk itself: fixed
/// prefix, sender, optional recipient, fragment header.
pub const FRAGMENT_OVERHEAD: usize = FIXED_PREFIX_LEN + 2 * PEER_ID_LEN + FRAGMENT_HEADER_LEN;

/// Decoded fragment payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentPayload {
    /// Random id shared by every fragment of one packet
    pub fragment_id: u64,
    /// Position in the train, starting at zero
    pub index: u16,
    /// Total number of fragments in the train
    pub total: u16,
    /// Message type of the packet being carried
    pub original_type: MessageType,
    /// This fragment's slice of the original payload
    pub chunk: Vec<u8>,
}

impl FragmentPayload {
    /// Serialize to the binary fragment layout.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FRAGMENT_HEADER_LEN + self.chunk.len());
        out.extend_from_slice(&self.fragment_id.to_be_bytes());
        out.extend_from_slice(&self.index.to_be_bytes());
        out.extend_from_slice(&self.total.to_be_bytes());
        out.push(self.original_type.as_u8());
        out.extend_from_slice(&self.chunk);
        out
    }

    /// Parse a fragment payload.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < FRAGMENT_HEADER_LEN {
            return Err(ProtocolError::Truncated {
                needed: FRAGMENT_HEADER_LEN,
                available: data.len(),
            });
        }
        let mut id = [0u8; 8];
        id.copy_from_slice(&data[..8]);
        let index = u16::from_be_bytes([data[8], data[9]]);
        let total = u16::from_be_bytes([data[10], data[11]]);
        let original_type = MessageType::from_u8(data[12])?;
        if total == 0 {
            return Err(ProtocolError::MalformedFragment("zero fragment count"));
        }
        if index >= total {
            return Err(ProtocolError::MalformedFragment("index beyond fragment count"));
        }
        Ok(Self {
            fragment_id: u64::from_be_bytes(id),
            index,
            total,
            original_type,
            chunk: data[FRAGMENT_HEADER_LEN..].to_vec(),
        })
    }
}

/// Fragment type for a given train position.
fn fragment_type(index: u16, total: u16) -> MessageType {
    if index == 0 {
        MessageType::FragmentStart
    } else if index + 1 == total {
        MessageType::FragmentEnd
    } else {
        MessageType::FragmentContinue
    }
}

/// Split a packet's payload into fragment packets for the given MTU.
///
/// # Errors
///
/// - [`ProtocolError::MalformedFragment`] if the MTU leaves no room for
///   chunk bytes, the payload is empty, or the train would not fit in a
///   16-bit fragment count.
pub fn split_packet(packet: &Packet, mtu: usize) -> Result<Vec<Packet>> {
    let chunk_size = mtu.saturating_sub(FRAGMENT_OVERHEAD);
    if chunk_size == 0 {
        return Err(ProtocolError::MalformedFragment("mtu smaller than fragment overhead"));
    }
    if packet.payload.is_empty() {
        return Err(ProtocolError::MalformedFragment("nothing to fragment"));
    }

    let chunks: Vec<&[u8]> = packet.payload.chunks(chunk_size).collect();
    if chunks.len() < 2 {
        return Err(ProtocolError::MalformedFragment("payload fits a single frame"));
    }
    let total = u16::try_from(chunks.len())
        .map_err(|_| ProtocolError::MalformedFragment("fragment count overflow"))?;

    let fragment_id: u64 = rand::thread_rng().r#gen();
    let fragments = chunks
        .iter()
        .enumerate()
        .map(|(i, chunk)| {
            let index = i as u16;
            let payload = FragmentPayload {
                fragment_id,
                index,
                total,
                original_type: packet.message_type,
                chunk: chunk.to_vec(),
            }
            .encode();
            Packet {
                version: packet.version,
                message_type: fragment_type(index, total),
                ttl: packet.ttl,
                timestamp_ms: packet.timestamp_ms,
                sender_id: packet.sender_id,
                recipient_id: packet.recipient_id,
                payload,
                signature: None,
            }
        })
        .collect();
    Ok(fragments)
}

#[cfg(test)]
mod tests {
    use crate::packet::PeerId;

    use super::*;

    fn big_packet(len: usize) -> Packet {
        let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        Packet::new(MessageType::Message, PeerId::new([1; 8]), 1_700_000_000_000, payload)
            .with_recipient(PeerId::new([2; 8]))
    }

    #[test]
    fn payload_round_trip() {
        let payload = FragmentPayload {
            fragment_id: 0xDEAD_BEEF_0123_4567,
            index: 3,
            total: 9,
            original_type: MessageType::Message,
            chunk: b"chunk bytes".to_vec(),
        };
        assert_eq!(FragmentPayload::decode(&payload.encode()).unwrap(), payload);
    }

    #[test]
    fn rejects_malformed_headers() {
        assert!(FragmentPayload::decode(&[0u8; 5]).is_err());

        let mut zero_total = FragmentPayload {
            fragment_id: 1,
            index: 0,
            total: 1,
            original_type: MessageType::Message,
            chunk: vec![],
        }
        .encode();
        zero_total[10..12].copy_from_slice(&0u16.to_be_bytes());
        assert_eq!(
            FragmentPayload::decode(&zero_total),
            Err(ProtocolError::MalformedFragment("zero fragment count"))
        );
    }

    #[test]
    fn chunks_reconstruct_payload() {
        let packet = big_packet(5000);
        let fragments = split_packet(&packet, 512).unwrap();

        assert_eq!(fragments[0].message_type, MessageType::FragmentStart);
        assert_eq!(fragments.last().unwrap().message_type, MessageType::FragmentEnd);
        for middle in &fragments[1..fragments.len() - 1] {
            assert_eq!(middle.message_type, MessageType::FragmentContinue);
        }

        let mut rebuilt = Vec::new();
        let mut expected_index = 0u16;
        let first = FragmentPayload::decode(&fragments[0].payload).unwrap();
        for fragment in &fragments {
            let decoded = FragmentPayload::decode(&fragment.payload).unwrap();
            assert_eq!(decoded.fragment_id, first.fragment_id);
            assert_eq!(decoded.index, expected_index);
            assert_eq!(decoded.total, fragments.len() as u16);
            assert_eq!(decoded.original_type, MessageType::Message);
            rebuilt.extend_from_slice(&decoded.chunk);
            expected_index += 1;
        }
        assert_eq!(rebuilt, packet.payload);
    }

    #[test]
    fn fragments_inherit_addressing() {
        let packet = big_packet(3000);
        for fragment in split_packet(&packet, 256).unwrap() {
            assert_eq!(fragment.sender_id, packet.sender_id);
            assert_eq!(fragment.recipient_id, packet.recipient_id);
            assert_eq!(fragment.ttl, packet.ttl);
            assert_eq!(fragment.timestamp_ms, packet.timestamp_ms);
            assert!(fragment.signature.is_none());
        }
    }

    #[test]
    fn chunk_sizes_respect_mtu() {
        let packet = big_packet(4096);
        for fragment in split_packet(&packet, 300).unwrap() {
            assert!(fragment.payload.len() - FRAGMENT_HEADER_LEN <= 300 - FRAGMENT_OVERHEAD);
        }
    }

    #[test]
    fn tiny_mtu_is_rejected() {
        let packet = big_packet(1000);
        assert!(split_packet(&packet, FRAGMENT_OVERHEAD).is_err());
    }

    #[test]
    fn single_chunk_payload_is_rejected() {
        let packet = big_packet(10);
        assert!(split_packet(&packet, 4096).is_err());
    }
}
