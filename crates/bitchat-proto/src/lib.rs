//! Binary wire protocol for the bitchat mesh.
//!
//! This crate owns everything that crosses a link: the packet model and
//! its big-endian binary codec with block padding and gated compression,
//! the fragment train format for oversized payloads, and the CBOR-typed
//! control payloads. It is pure data (no I/O, no time, no crypto state)
//! so every codec is directly testable and fuzzable.
//!
//! Interop note: the packet framing must match the reference peers of
//! this protocol family byte-for-byte. Field order, padding discipline,
//! and the compression prefix are all load-bearing.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod errors;
pub mod fragment;
pub mod packet;
pub mod payloads;
pub mod wire;

pub use errors::{ProtocolError, Result};
pub use fragment::{FRAGMENT_HEADER_LEN, FRAGMENT_OVERHEAD, FragmentPayload, split_packet};
pub use packet::{
    DEFAULT_TTL, MessageType, PEER_ID_LEN, PROTOCOL_VERSION, Packet, PacketFlags, PeerId,
    SIGNATURE_LEN,
};
pub use wire::{BLOCK_SIZES, COMPRESSION_THRESHOLD, MAX_PACKET_LEN, WireOptions, decode, encode};
