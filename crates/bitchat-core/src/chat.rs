//! Chat records, delivery status, and command parsing.
//!
//! The wire form of a message is [`bitchat_proto::payloads::message::ChatPayload`];
//! this module holds the application-side record with delivery tracking,
//! plus the slash-command grammar the input line feeds through.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use bitchat_proto::PeerId;
use bitchat_proto::payloads::message::ChatPayload;

use crate::error::MeshError;

/// Delivery lifecycle of a sent message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryStatus {
    /// Accepted locally, not yet on the wire
    Sending,
    /// Handed to at least one link
    Sent,
    /// Acknowledged by the recipient
    Delivered {
        /// Who acknowledged
        by: String,
        /// When, ms since the Unix epoch
        at_ms: u64,
    },
    /// Read receipt received
    Read {
        /// Who read it
        by: String,
        /// When, ms since the Unix epoch
        at_ms: u64,
    },
    /// Could not be delivered (peer gone, session dead)
    Failed,
    /// Reached some but not all channel members
    PartiallyDelivered {
        /// Members reached
        reached: usize,
        /// Members targeted
        total: usize,
    },
}

/// A chat message as the application sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Stable id minted by the sender
    pub id: Uuid,
    /// Sender display name
    pub sender_nickname: String,
    /// Sender peer id when known
    pub sender_peer_id: Option<PeerId>,
    /// Message timestamp, ms since the Unix epoch
    pub timestamp_ms: u64,
    /// Plaintext content
    pub content: String,
    /// `@nickname` mentions
    pub mentions: Option<Vec<String>>,
    /// `#channel` tag
    pub channel: Option<String>,
    /// Addressed to us alone
    pub is_private: bool,
    /// Arrived through at least one relay hop
    pub is_relayed: bool,
    /// Arrived under session or channel encryption
    pub is_encrypted: bool,
    /// Delivery tracking for messages we sent
    pub delivery: DeliveryStatus,
}

impl ChatMessage {
    /// Build a record from a received wire payload.
    #[must_use]
    pub fn from_payload(
        payload: ChatPayload,
        sender_peer_id: PeerId,
        timestamp_ms: u64,
        is_private: bool,
        is_relayed: bool,
        is_encrypted: bool,
    ) -> Self {
        Self {
            id: payload.id,
            sender_nickname: payload.sender_nickname,
            sender_peer_id: Some(sender_peer_id),
            timestamp_ms,
            content: payload.content,
            mentions: payload.mentions,
            channel: payload.channel,
            is_private,
            is_relayed,
            is_encrypted,
            delivery: DeliveryStatus::Sent,
        }
    }

    /// Extract `@nickname` mentions from message content.
    #[must_use]
    pub fn extract_mentions(content: &str) -> Option<Vec<String>> {
        let mentions: Vec<String> = content
            .split_whitespace()
            .filter_map(|word| {
                let name = word.strip_prefix('@')?;
                let name: String = name
                    .chars()
                    .take_while(|c| c.is_alphanumeric() || *c == '_' || *c == '#')
                    .collect();
                (!name.is_empty()).then_some(name)
            })
            .collect();
        (!mentions.is_empty()).then_some(mentions)
    }
}

/// A parsed slash command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `/msg <peer> <text>`: private message
    Msg {
        /// Target nickname or hex peer id
        target: String,
        /// Message body
        content: String,
    },
    /// `/join <#channel> [password]`
    Join {
        /// Channel tag (normalized to start with `#`)
        channel: String,
        /// Password for protected channels
        password: Option<String>,
    },
    /// `/leave [#channel]`: current channel when omitted
    Leave {
        /// Channel tag
        channel: Option<String>,
    },
    /// `/nick <name>`
    Nick {
        /// New display name
        nickname: String,
    },
    /// `/who`: list connected peers
    Who,
    /// `/channels`: list known channels
    Channels,
    /// `/block <peer>`
    Block {
        /// Target nickname or hex peer id
        target: String,
    },
    /// `/unblock <peer>`
    Unblock {
        /// Target nickname or hex peer id
        target: String,
    },
    /// `/pass <#channel> <password>`: creator only
    Pass {
        /// Channel tag
        channel: String,
        /// New password
        password: String,
    },
}

impl Command {
    /// Parse an input line starting with `/`.
    ///
    /// # Errors
    ///
    /// [`MeshError::UnknownCommand`] for unrecognized commands or
    /// missing arguments; the caller shows it as an inline system
    /// message.
    pub fn parse(line: &str) -> Result<Self, MeshError> {
        let line = line.trim();
        let mut parts = line.split_whitespace();
        let command = parts.next().unwrap_or_default();

        let unknown = || MeshError::UnknownCommand(line.to_string());

        match command {
            "/msg" | "/m" => {
                let target = parts.next().ok_or_else(unknown)?.to_string();
                let content = parts.collect::<Vec<_>>().join(" ");
                if content.is_empty() {
                    return Err(unknown());
                }
                Ok(Self::Msg { target, content })
            },
            "/join" | "/j" => {
                let channel = normalize_channel(parts.next().ok_or_else(unknown)?);
                let password = parts.next().map(ToString::to_string);
                Ok(Self::Join { channel, password })
            },
            "/leave" => Ok(Self::Leave { channel: parts.next().map(normalize_channel) }),
            "/nick" => {
                Ok(Self::Nick { nickname: parts.next().ok_or_else(unknown)?.to_string() })
            },
            "/who" | "/w" => Ok(Self::Who),
            "/channels" => Ok(Self::Channels),
            "/block" => Ok(Self::Block { target: parts.next().ok_or_else(unknown)?.to_string() }),
            "/unblock" => {
                Ok(Self::Unblock { target: parts.next().ok_or_else(unknown)?.to_string() })
            },
            "/pass" => {
                let channel = normalize_channel(parts.next().ok_or_else(unknown)?);
                let password = parts.next().ok_or_else(unknown)?.to_string();
                Ok(Self::Pass { channel, password })
            },
            _ => Err(unknown()),
        }
    }
}

/// Ensure a channel tag carries its leading `#`.
#[must_use]
pub fn normalize_channel(raw: &str) -> String {
    if raw.starts_with('#') { raw.to_string() } else { format!("#{raw}") }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn msg_command_keeps_spaces() {
        assert_eq!(
            Command::parse("/msg bob see you at 5").unwrap(),
            Command::Msg { target: "bob".to_string(), content: "see you at 5".to_string() }
        );
    }

    #[test]
    fn join_normalizes_channel_tag() {
        assert_eq!(
            Command::parse("/join lobby").unwrap(),
            Command::Join { channel: "#lobby".to_string(), password: None }
        );
        assert_eq!(
            Command::parse("/j #lobby sesame").unwrap(),
            Command::Join { channel: "#lobby".to_string(), password: Some("sesame".to_string()) }
        );
    }

    #[test]
    fn leave_without_argument() {
        assert_eq!(Command::parse("/leave").unwrap(), Command::Leave { channel: None });
    }

    #[test]
    fn unknown_command_is_an_error() {
        assert!(matches!(Command::parse("/frobnicate"), Err(MeshError::UnknownCommand(_))));
        assert!(matches!(Command::parse("/msg bob"), Err(MeshError::UnknownCommand(_))));
    }

    #[test]
    fn mention_extraction() {
        assert_eq!(
            ChatMessage::extract_mentions("hey @bob and @carol_x, lunch?"),
            Some(vec!["bob".to_string(), "carol_x".to_string()])
        );
        assert_eq!(ChatMessage::extract_mentions("no mentions here"), None);
        assert_eq!(ChatMessage::extract_mentions("bare @ sign"), None);
    }

    #[test]
    fn delivery_status_round_trips_through_serde() {
        let status = DeliveryStatus::PartiallyDelivered { reached: 2, total: 5 };
        let mut bytes = Vec::new();
        ciborium::ser::into_writer(&status, &mut bytes).unwrap();
        let back: DeliveryStatus = ciborium::de::from_reader(bytes.as_slice()).unwrap();
        assert_eq!(back, status);
    }
}
