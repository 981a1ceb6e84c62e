//! Packet model for the bitchat wire protocol.
//!
//! A [`Packet`] is the unit handed to the router and the links. The binary
//! layout (big-endian, optional fields gated by [`PacketFlags`]) lives in
//! [`crate::wire`]; this module holds the typed representation plus the
//! Ed25519 signing scheme for the packet types that use it.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::{ProtocolError, Result};

/// Supported protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Default hop budget for freshly created packets.
pub const DEFAULT_TTL: u8 = 7;

/// Size of a peer identifier in bytes.
pub const PEER_ID_LEN: usize = 8;

/// Size of an Ed25519 packet signature in bytes.
pub const SIGNATURE_LEN: usize = 64;

/// Volatile 8-byte address of a device on the mesh.
///
/// Peer ids rotate every few minutes; stable identity is the fingerprint
/// of the peer's static key, not this value. The all-ones id addresses
/// every peer in range.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId([u8; PEER_ID_LEN]);

impl PeerId {
    /// Broadcast address: eight `0xFF` bytes.
    pub const BROADCAST: Self = Self([0xFF; PEER_ID_LEN]);

    /// Construct from raw bytes.
    #[must_use]
    pub const fn new(bytes: [u8; PEER_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Raw byte view.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; PEER_ID_LEN] {
        &self.0
    }

    /// True when this is the broadcast address.
    #[must_use]
    pub fn is_broadcast(&self) -> bool {
        self.0 == [0xFF; PEER_ID_LEN]
    }

    /// Parse the 16-hex-char application-layer form.
    ///
    /// Shorter input is right-padded with zero bytes, matching the
    /// truncate/pad rule the encoder applies to sender ids.
    pub fn from_hex(s: &str) -> Result<Self> {
        let decoded = hex::decode(s).map_err(|_| ProtocolError::InvalidPeerId("not hex"))?;
        if decoded.len() > PEER_ID_LEN {
            return Err(ProtocolError::InvalidPeerId("longer than 8 bytes"));
        }
        let mut bytes = [0u8; PEER_ID_LEN];
        bytes[..decoded.len()].copy_from_slice(&decoded);
        Ok(Self(bytes))
    }

    /// Lowercase 16-hex-char form used at the application layer.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerId({})", self.to_hex())
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Wire message types.
///
/// Values are fixed by the protocol family; any gap is reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Peer presence and nickname broadcast
    Announce = 0x01,
    /// Graceful departure (optionally scoped to a channel)
    Leave = 0x03,
    /// Chat message (public, channel, or carried inside NoiseEncrypted)
    Message = 0x04,
    /// First fragment of an oversized payload
    FragmentStart = 0x05,
    /// Middle fragment
    FragmentContinue = 0x06,
    /// Final fragment
    FragmentEnd = 0x07,
    /// Channel existence/ownership broadcast
    ChannelAnnounce = 0x08,
    /// Channel message-retention toggle
    ChannelRetention = 0x09,
    /// Private-message delivery acknowledgment
    DeliveryAck = 0x0A,
    /// Ask a peer for the delivery status of a message
    DeliveryStatusRequest = 0x0B,
    /// Read receipt for a private message
    ReadReceipt = 0x0C,
    /// Noise XX message 1 (initiator ephemeral)
    NoiseHandshakeInit = 0x10,
    /// Noise XX messages 2 and 3 (disambiguated by session state)
    NoiseHandshakeResp = 0x11,
    /// Transport ciphertext of an established Noise session
    NoiseEncrypted = 0x12,
    /// Signed binding of peer id to static keys
    NoiseIdentityAnnounce = 0x13,
    /// Challenge proving knowledge of a channel key
    ChannelKeyVerifyRequest = 0x14,
    /// Response to a channel key challenge
    ChannelKeyVerifyResponse = 0x15,
    /// Creator-initiated channel password rotation
    ChannelPasswordUpdate = 0x16,
    /// Channel metadata including the key commitment
    ChannelMetadata = 0x17,
    /// Version negotiation offer (reserved, never emitted)
    VersionHello = 0x20,
    /// Version negotiation acknowledgment (reserved, never emitted)
    VersionAck = 0x21,
    /// Request that a peer start a Noise handshake with us
    HandshakeRequest = 0x25,
}

impl MessageType {
    /// Parse from the wire byte.
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(Self::Announce),
            0x03 => Ok(Self::Leave),
            0x04 => Ok(Self::Message),
            0x05 => Ok(Self::FragmentStart),
            0x06 => Ok(Self::FragmentContinue),
            0x07 => Ok(Self::FragmentEnd),
            0x08 => Ok(Self::ChannelAnnounce),
            0x09 => Ok(Self::ChannelRetention),
            0x0A => Ok(Self::DeliveryAck),
            0x0B => Ok(Self::DeliveryStatusRequest),
            0x0C => Ok(Self::ReadReceipt),
            0x10 => Ok(Self::NoiseHandshakeInit),
            0x11 => Ok(Self::NoiseHandshakeResp),
            0x12 => Ok(Self::NoiseEncrypted),
            0x13 => Ok(Self::NoiseIdentityAnnounce),
            0x14 => Ok(Self::ChannelKeyVerifyRequest),
            0x15 => Ok(Self::ChannelKeyVerifyResponse),
            0x16 => Ok(Self::ChannelPasswordUpdate),
            0x17 => Ok(Self::ChannelMetadata),
            0x20 => Ok(Self::VersionHello),
            0x21 => Ok(Self::VersionAck),
            0x25 => Ok(Self::HandshakeRequest),
            other => Err(ProtocolError::UnknownMessageType(other)),
        }
    }

    /// Wire byte value.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// True for the three fragment carrier types.
    #[must_use]
    pub const fn is_fragment(self) -> bool {
        matches!(self, Self::FragmentStart | Self::FragmentContinue | Self::FragmentEnd)
    }
}

/// Bitfield gating the optional packet fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PacketFlags(u8);

impl PacketFlags {
    /// No optional fields.
    pub const NONE: Self = Self(0x00);
    /// Recipient id follows the sender id.
    pub const HAS_RECIPIENT: u8 = 0x01;
    /// A 64-byte Ed25519 signature trails the payload.
    pub const HAS_SIGNATURE: u8 = 0x02;
    /// Payload is zlib-compressed, preceded by its original size.
    pub const IS_COMPRESSED: u8 = 0x04;

    /// Construct from the wire byte (unknown bits are preserved).
    #[must_use]
    pub const fn from_byte(byte: u8) -> Self {
        Self(byte)
    }

    /// Wire byte value.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self.0
    }

    /// Recipient field present?
    #[must_use]
    pub const fn has_recipient(self) -> bool {
        self.0 & Self::HAS_RECIPIENT != 0
    }

    /// Signature field present?
    #[must_use]
    pub const fn has_signature(self) -> bool {
        self.0 & Self::HAS_SIGNATURE != 0
    }

    /// Payload compressed?
    #[must_use]
    pub const fn is_compressed(self) -> bool {
        self.0 & Self::IS_COMPRESSED != 0
    }

    /// Set the recipient bit.
    #[must_use]
    pub const fn with_recipient(self) -> Self {
        Self(self.0 | Self::HAS_RECIPIENT)
    }

    /// Set the signature bit.
    #[must_use]
    pub const fn with_signature(self) -> Self {
        Self(self.0 | Self::HAS_SIGNATURE)
    }

    /// Set the compression bit.
    #[must_use]
    pub const fn with_compression(self) -> Self {
        Self(self.0 | Self::IS_COMPRESSED)
    }
}

/// A wire packet: fixed header fields plus optional recipient/signature.
///
/// Compression state is not represented here; [`crate::wire::encode`]
/// decides compression per packet and [`crate::wire::decode`] always
/// returns the decompressed payload, so a round trip compares equal
/// regardless of what happened on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Protocol version (always [`PROTOCOL_VERSION`] for packets we emit)
    pub version: u8,
    /// Message type
    pub message_type: MessageType,
    /// Remaining hop budget
    pub ttl: u8,
    /// Creation time, milliseconds since the Unix epoch
    pub timestamp_ms: u64,
    /// Originating peer
    pub sender_id: PeerId,
    /// Directed recipient; `None` or [`PeerId::BROADCAST`] means broadcast
    pub recipient_id: Option<PeerId>,
    /// Application payload (plaintext at this layer)
    pub payload: Vec<u8>,
    /// Optional Ed25519 signature over [`Packet::signing_digest`]
    pub signature: Option<[u8; SIGNATURE_LEN]>,
}

impl Packet {
    /// Create a broadcast packet with the default hop budget.
    #[must_use]
    pub fn new(
        message_type: MessageType,
        sender_id: PeerId,
        timestamp_ms: u64,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            message_type,
            ttl: DEFAULT_TTL,
            timestamp_ms,
            sender_id,
            recipient_id: None,
            payload,
            signature: None,
        }
    }

    /// Address the packet to a single peer.
    #[must_use]
    pub fn with_recipient(mut self, recipient_id: PeerId) -> Self {
        self.recipient_id = Some(recipient_id);
        self
    }

    /// Override the hop budget.
    #[must_use]
    pub fn with_ttl(mut self, ttl: u8) -> Self {
        self.ttl = ttl;
        self
    }

    /// Flags implied by the optional fields (compression is added later
    /// by the encoder).
    #[must_use]
    pub fn flags(&self) -> PacketFlags {
        let mut flags = PacketFlags::NONE;
        if self.recipient_id.is_some() {
            flags = flags.with_recipient();
        }
        if self.signature.is_some() {
            flags = flags.with_signature();
        }
        flags
    }

    /// True when the packet is addressed to everyone.
    #[must_use]
    pub fn is_broadcast(&self) -> bool {
        match self.recipient_id {
            None => true,
            Some(id) => id.is_broadcast(),
        }
    }

    /// True when the packet is addressed to `us`.
    #[must_use]
    pub fn is_addressed_to(&self, us: &PeerId) -> bool {
        self.recipient_id.as_ref() == Some(us)
    }

    /// Digest the signature covers.
    ///
    /// TTL is excluded so relays can decrement it without invalidating
    /// the signature; the signature field itself is excluded trivially.
    #[must_use]
    pub fn signing_digest(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(b"bitchat-packet-v1");
        hasher.update([self.version, self.message_type.as_u8()]);
        hasher.update(self.timestamp_ms.to_be_bytes());
        hasher.update(self.sender_id.as_bytes());
        if let Some(recipient) = &self.recipient_id {
            hasher.update(recipient.as_bytes());
        }
        hasher.update(&self.payload);
        hasher.finalize().into()
    }

    /// Sign the packet, setting the signature field.
    pub fn sign(&mut self, key: &SigningKey) {
        let signature = key.sign(&self.signing_digest());
        self.signature = Some(signature.to_bytes());
    }

    /// Verify the packet signature against a known public key.
    pub fn verify_signature(&self, public_key: &VerifyingKey) -> Result<()> {
        let bytes = self.signature.ok_or(ProtocolError::MissingField("signature"))?;
        let signature = Signature::from_bytes(&bytes);
        public_key
            .verify(&self.signing_digest(), &signature)
            .map_err(|_| ProtocolError::BadSignature)
    }
}
