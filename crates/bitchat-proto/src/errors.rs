//! Error types for wire protocol encoding and decoding.
//!
//! Framing errors are terminal for the packet that produced them: the
//! router drops the packet and increments a counter. Nothing here is
//! retried, so the variants carry just enough context for diagnostics.

use thiserror::Error;

/// Result alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors produced while encoding or decoding wire packets.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Buffer ended before a required field.
    #[error("truncated packet: needed {needed} bytes, had {available}")]
    Truncated {
        /// Bytes required to finish parsing the current field
        needed: usize,
        /// Bytes actually available
        available: usize,
    },

    /// Version byte is not the supported protocol version.
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// Type byte does not map to a known message type.
    #[error("unknown message type: {0:#04x}")]
    UnknownMessageType(u8),

    /// Encoded packet would exceed the maximum wire size.
    #[error("packet too large: {size} bytes exceeds {max}")]
    PacketTooLarge {
        /// Encoded size of the offending packet
        size: usize,
        /// Maximum permitted wire size
        max: usize,
    },

    /// Declared payload length does not match the available bytes.
    #[error("payload length mismatch: declared {declared}, available {available}")]
    PayloadLengthMismatch {
        /// Length claimed by the header
        declared: usize,
        /// Bytes actually present
        available: usize,
    },

    /// Trailing padding byte is inconsistent with the buffer.
    #[error("invalid padding")]
    InvalidPadding,

    /// Compressed payload failed to decompress to the declared size.
    #[error("decompression failed: {0}")]
    Decompress(String),

    /// A flag promised an optional field that is absent on the struct.
    #[error("flag set but field missing: {0}")]
    MissingField(&'static str),

    /// A field is present on the struct but its flag is clear.
    #[error("field present but flag clear: {0}")]
    UnflaggedField(&'static str),

    /// Ed25519 signature did not verify.
    #[error("signature verification failed")]
    BadSignature,

    /// Fragment payload is malformed.
    #[error("malformed fragment: {0}")]
    MalformedFragment(&'static str),

    /// Hex peer id could not be parsed.
    #[error("invalid peer id: {0}")]
    InvalidPeerId(&'static str),

    /// A typed application payload failed to encode or decode.
    #[error("payload codec error: {0}")]
    PayloadCodec(String),
}
