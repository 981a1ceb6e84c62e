//! Delivery and read receipt payloads.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::packet::PeerId;
use crate::payloads::cbor_codec;

/// Acknowledgment that a private message reached its recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryAck {
    /// Id of the message being acknowledged
    pub message_id: Uuid,
    /// Peer that received the message
    pub recipient_id: PeerId,
    /// Recipient's nickname at delivery time
    pub recipient_nickname: String,
    /// Hops the original message travelled before delivery
    pub hop_count: u8,
    /// When the message was delivered, ms since the Unix epoch
    pub timestamp_ms: u64,
}

cbor_codec!(DeliveryAck);

/// Notification that a private message was displayed to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadReceipt {
    /// Id of the message that was read
    pub message_id: Uuid,
    /// Peer that read the message
    pub reader_id: PeerId,
    /// Reader's nickname
    pub reader_nickname: String,
    /// When the message was read, ms since the Unix epoch
    pub timestamp_ms: u64,
}

cbor_codec!(ReadReceipt);

/// Ask a peer whether it has seen a message (answered from its cache).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryStatusRequest {
    /// Message being queried
    pub message_id: Uuid,
}

cbor_codec!(DeliveryStatusRequest);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivery_ack_round_trip() {
        let ack = DeliveryAck {
            message_id: Uuid::new_v4(),
            recipient_id: PeerId::new([3; 8]),
            recipient_nickname: "bob".to_string(),
            hop_count: 2,
            timestamp_ms: 1_700_000_000_000,
        };
        assert_eq!(DeliveryAck::decode(&ack.encode().unwrap()).unwrap(), ack);
    }

    #[test]
    fn read_receipt_round_trip() {
        let receipt = ReadReceipt {
            message_id: Uuid::new_v4(),
            reader_id: PeerId::new([4; 8]),
            reader_nickname: "carol".to_string(),
            timestamp_ms: 1_700_000_000_001,
        };
        assert_eq!(ReadReceipt::decode(&receipt.encode().unwrap()).unwrap(), receipt);
    }
}
