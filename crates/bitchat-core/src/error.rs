//! Error types for the mesh core.
//!
//! The propagation policy: framing and routing problems are absorbed
//! locally (dropped and counted), crypto failures fail the session they
//! belong to, and only state the application must display crosses the
//! delegate boundary. `MeshError` is what the mesh service and its
//! callers see; lower layers convert in via `From`.

use thiserror::Error;

use bitchat_crypto::{ChannelCipherError, NoiseError};
use bitchat_proto::{PeerId, ProtocolError};

/// Result alias for mesh operations.
pub type Result<T> = std::result::Result<T, MeshError>;

/// Errors surfaced by the mesh core.
#[derive(Error, Debug)]
pub enum MeshError {
    /// Wire codec failure (dropped and counted by the router).
    #[error("framing error: {0}")]
    Framing(#[from] ProtocolError),

    /// Noise failure; the owning session transitions to `Failed`.
    #[error("session crypto error: {0}")]
    Crypto(#[from] NoiseError),

    /// Channel cipher failure; surfaced as a wrong-key system note.
    #[error("channel cipher error: {0}")]
    ChannelCipher(#[from] ChannelCipherError),

    /// Operation requires an established session that does not exist.
    #[error("no established session with {0}")]
    SessionNotEstablished(PeerId),

    /// Session is mid-handshake; the payload was queued.
    #[error("handshake with {0} still in progress")]
    HandshakeInProgress(PeerId),

    /// Session entered the failed state.
    #[error("session with {peer} failed: {reason}")]
    SessionFailed {
        /// Peer whose session failed
        peer: PeerId,
        /// Why it failed
        reason: String,
    },

    /// Recipient is blocked; refused locally, nothing hits the wire.
    #[error("recipient {0} is blocked")]
    RecipientBlocked(PeerId),

    /// Secure store failure.
    #[error("secure store error: {0}")]
    Store(#[from] StoreError),

    /// Channel operation requires a key we do not hold.
    #[error("no key for channel {0}")]
    ChannelKeyMissing(String),

    /// Command line could not be parsed.
    #[error("unknown command: {0}")]
    UnknownCommand(String),
}

/// Errors from the secure key/value store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Backend could not be opened; fatal at init, warning mid-run.
    #[error("secure store unavailable: {0}")]
    Unavailable(String),

    /// Read/write against an open backend failed.
    #[error("secure store i/o failed: {0}")]
    Io(String),

    /// Stored value does not decode to the expected shape.
    #[error("corrupt value for key {key}: {reason}")]
    Corrupt {
        /// Key whose value is corrupt
        key: String,
        /// What went wrong decoding it
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn framing_errors_convert() {
        let err: MeshError = ProtocolError::UnsupportedVersion(3).into();
        assert!(matches!(err, MeshError::Framing(ProtocolError::UnsupportedVersion(3))));
    }

    #[test]
    fn store_errors_convert() {
        let err: MeshError = StoreError::Unavailable("locked".to_string()).into();
        assert!(matches!(err, MeshError::Store(_)));
    }
}
