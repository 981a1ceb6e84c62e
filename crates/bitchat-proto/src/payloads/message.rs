//! Chat message body.
//!
//! This is the payload of MESSAGE packets: directly for public chat,
//! inside the session ciphertext for private chat, or AES-GCM-encrypted
//! as a whole for password channels. Delivery metadata (status, receipt
//! bookkeeping) is application state and intentionally not on the wire.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::payloads::cbor_codec;

/// Wire form of a chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatPayload {
    /// Stable message id, minted by the sender
    pub id: Uuid,
    /// Sender's display name at send time
    pub sender_nickname: String,
    /// Plaintext content
    pub content: String,
    /// Nicknames mentioned with `@`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mentions: Option<Vec<String>>,
    /// `#channel` tag for channel messages
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
}

cbor_codec!(ChatPayload);

/// Channel-encrypted message body.
///
/// The channel tag stays readable so receivers know which key to use;
/// the sealed bytes are an IV-prefixed AES-GCM box over the CBOR
/// [`ChatPayload`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedChatPayload {
    /// Channel whose key sealed this message
    pub sealed_channel: String,
    /// IV-prefixed ciphertext of the CBOR chat payload
    pub sealed: Vec<u8>,
}

cbor_codec!(SealedChatPayload);

impl ChatPayload {
    /// Build a plain public message body.
    #[must_use]
    pub fn public(id: Uuid, sender_nickname: String, content: String) -> Self {
        Self { id, sender_nickname, content, mentions: None, channel: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_with_all_fields() {
        let body = ChatPayload {
            id: Uuid::new_v4(),
            sender_nickname: "alice".to_string(),
            content: "lunch @bob?".to_string(),
            mentions: Some(vec!["bob".to_string()]),
            channel: Some("#lunch".to_string()),
        };
        assert_eq!(ChatPayload::decode(&body.encode().unwrap()).unwrap(), body);
    }

    #[test]
    fn optional_fields_are_omitted() {
        let body = ChatPayload::public(Uuid::new_v4(), "alice".to_string(), "hi".to_string());
        let decoded = ChatPayload::decode(&body.encode().unwrap()).unwrap();
        assert!(decoded.mentions.is_none());
        assert!(decoded.channel.is_none());
    }
}
