//! Typed application payloads riding inside packets.
//!
//! The packet framing is raw binary for interop, but the control-plane
//! payloads (announces, receipts, channel metadata, handshake requests)
//! are CBOR: self-describing, compact, no code generation. There is no
//! unified payload enum because packet payloads are heterogeneous: Noise
//! handshake types carry raw protocol messages, fragment types carry the
//! binary layout in [`crate::fragment`], and MESSAGE payloads may be
//! channel ciphertext. Each typed payload owns its `encode`/`decode`
//! pair and the caller picks the codec from the message type and context.

pub mod announce;
pub mod channel;
pub mod handshake;
pub mod message;
pub mod receipt;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::errors::{ProtocolError, Result};

/// CBOR-encode a payload struct.
pub(crate) fn to_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    ciborium::ser::into_writer(value, &mut out)
        .map_err(|e| ProtocolError::PayloadCodec(e.to_string()))?;
    Ok(out)
}

/// Decode a CBOR payload struct.
pub(crate) fn from_cbor<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    ciborium::de::from_reader(data).map_err(|e| ProtocolError::PayloadCodec(e.to_string()))
}

/// Implement `encode`/`decode` over CBOR for a payload struct.
macro_rules! cbor_codec {
    ($ty:ty) => {
        impl $ty {
            /// Serialize to CBOR bytes.
            pub fn encode(&self) -> crate::errors::Result<Vec<u8>> {
                crate::payloads::to_cbor(self)
            }

            /// Parse from CBOR bytes.
            pub fn decode(data: &[u8]) -> crate::errors::Result<Self> {
                crate::payloads::from_cbor(data)
            }
        }
    };
}

pub(crate) use cbor_codec;
