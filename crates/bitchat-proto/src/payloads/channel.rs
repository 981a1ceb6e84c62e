//! Channel control payloads.
//!
//! Password-protected channels never put key material on the wire; the
//! metadata carries a key *commitment* (SHA-256 of the derived key) so a
//! joiner can check its derived key locally before attempting to decrypt
//! anything.

use serde::{Deserialize, Serialize};

use crate::packet::PeerId;
use crate::payloads::cbor_codec;

/// Broadcast announcing a channel's existence and protection status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelAnnounce {
    /// Channel tag including the leading `#`
    pub channel: String,
    /// Whether joining requires a password-derived key
    pub is_protected: bool,
    /// Peer that created (and owns) the channel
    pub creator_id: PeerId,
    /// Hex SHA-256 of the derived channel key, when protected
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_commitment: Option<String>,
}

cbor_codec!(ChannelAnnounce);

/// Channel message-retention toggle, set by the creator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRetention {
    /// Channel tag
    pub channel: String,
    /// Whether members should retain channel history
    pub enabled: bool,
}

cbor_codec!(ChannelRetention);

/// Full channel metadata, broadcast by the creator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelMetadata {
    /// Channel tag
    pub channel: String,
    /// Owning peer
    pub creator_id: PeerId,
    /// Creation time, ms since the Unix epoch
    pub created_at_ms: u64,
    /// Whether a password is required
    pub is_protected: bool,
    /// Hex SHA-256 of the derived channel key, when protected
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_commitment: Option<String>,
}

cbor_codec!(ChannelMetadata);

/// Challenge asking a member to prove knowledge of the channel key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelKeyVerifyRequest {
    /// Channel tag
    pub channel: String,
    /// Random challenge bytes to be MACed with the channel key
    pub nonce: Vec<u8>,
}

cbor_codec!(ChannelKeyVerifyRequest);

/// Response to a [`ChannelKeyVerifyRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelKeyVerifyResponse {
    /// Channel tag
    pub channel: String,
    /// SHA-256 over key-commitment bytes and the challenge nonce
    pub proof: Vec<u8>,
}

cbor_codec!(ChannelKeyVerifyResponse);

/// Creator-initiated password rotation.
///
/// The new key is wrapped with the *old* channel key, so only current
/// members can follow the rotation; everyone else must re-join with the
/// new password.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelPasswordUpdate {
    /// Channel tag
    pub channel: String,
    /// New key commitment
    pub new_key_commitment: String,
    /// New channel key encrypted under the previous channel key
    pub wrapped_new_key: Vec<u8>,
}

cbor_codec!(ChannelPasswordUpdate);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_round_trip() {
        let metadata = ChannelMetadata {
            channel: "#lobby".to_string(),
            creator_id: PeerId::new([1; 8]),
            created_at_ms: 1_700_000_000_000,
            is_protected: true,
            key_commitment: Some("ab".repeat(32)),
        };
        assert_eq!(ChannelMetadata::decode(&metadata.encode().unwrap()).unwrap(), metadata);
    }

    #[test]
    fn unprotected_announce_omits_commitment() {
        let announce = ChannelAnnounce {
            channel: "#open".to_string(),
            is_protected: false,
            creator_id: PeerId::new([2; 8]),
            key_commitment: None,
        };
        let decoded = ChannelAnnounce::decode(&announce.encode().unwrap()).unwrap();
        assert_eq!(decoded, announce);
        assert!(decoded.key_commitment.is_none());
    }

    #[test]
    fn password_update_round_trip() {
        let update = ChannelPasswordUpdate {
            channel: "#lobby".to_string(),
            new_key_commitment: "cd".repeat(32),
            wrapped_new_key: vec![1, 2, 3, 4],
        };
        assert_eq!(
            ChannelPasswordUpdate::decode(&update.encode().unwrap()).unwrap(),
            update
        );
    }
}
