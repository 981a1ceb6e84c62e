//! Handshake coordination payloads.
//!
//! `VERSION_HELLO`/`VERSION_ACK` are reserved: the types decode for
//! forward compatibility but nothing emits them and receivers ignore
//! them.

use serde::{Deserialize, Serialize};

use crate::packet::PeerId;
use crate::payloads::cbor_codec;

/// Ask a peer to initiate a Noise handshake toward us.
///
/// Sent by the side that lost the tie-break (larger peer id) when it has
/// traffic queued for a peer without an established session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    /// Peer asking for the handshake
    pub requester_id: PeerId,
    /// Requester's nickname, for UI context on the other side
    pub requester_nickname: String,
    /// Peer being asked to initiate
    pub target_id: PeerId,
    /// Messages the requester is holding for the target
    pub pending_count: u8,
}

cbor_codec!(HandshakeRequest);

/// Protocol version offer (reserved).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionHello {
    /// Versions the sender can speak, ascending
    pub supported_versions: Vec<u8>,
    /// Version the sender prefers
    pub preferred_version: u8,
    /// Free-form client identifier
    pub client: String,
}

cbor_codec!(VersionHello);

/// Protocol version agreement (reserved).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionAck {
    /// Version the responder selected
    pub agreed_version: u8,
    /// Whether any offered version was acceptable
    pub accepted: bool,
}

cbor_codec!(VersionAck);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_request_round_trip() {
        let request = HandshakeRequest {
            requester_id: PeerId::new([9; 8]),
            requester_nickname: "dave".to_string(),
            target_id: PeerId::new([1; 8]),
            pending_count: 3,
        };
        assert_eq!(HandshakeRequest::decode(&request.encode().unwrap()).unwrap(), request);
    }

    #[test]
    fn version_hello_round_trip() {
        let hello = VersionHello {
            supported_versions: vec![1],
            preferred_version: 1,
            client: "bitchat-rs".to_string(),
        };
        assert_eq!(VersionHello::decode(&hello.encode().unwrap()).unwrap(), hello);
    }
}
