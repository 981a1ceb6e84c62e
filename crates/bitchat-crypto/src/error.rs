//! Error types for the crypto layer.
//!
//! Every crypto failure is session-fatal for whatever produced it: a
//! failed handshake or AEAD check transitions the session to `Failed`
//! upstream, and a channel decryption failure surfaces as a wrong-key
//! note. Nothing here is retried with the same state.

use thiserror::Error;

/// Errors from the Noise handshake and transport ciphers.
#[derive(Error, Debug)]
pub enum NoiseError {
    /// Underlying snow failure (DH, AEAD, malformed message).
    #[error("noise protocol error: {0}")]
    Snow(#[from] snow::Error),

    /// The compiled-in pattern string failed to parse (build-time bug).
    #[error("invalid noise pattern")]
    BadPattern,

    /// Handshake method called out of phase order.
    #[error("handshake operation out of turn")]
    OutOfTurn,

    /// `split` was attempted before message three was processed.
    #[error("split before handshake completion")]
    SplitBeforeCompletion,

    /// XX completed without revealing the remote static key.
    #[error("remote static key missing after handshake")]
    MissingRemoteStatic,

    /// Message exceeds the Noise 64 KiB ceiling.
    #[error("noise message too large: {0} bytes")]
    MessageTooLarge(usize),

    /// Ciphertext shorter than the AEAD tag.
    #[error("noise message too short: {0} bytes")]
    MessageTooShort(usize),

    /// A cipher counter lock was poisoned by a panicking thread.
    #[error("cipher state lock poisoned")]
    Poisoned,
}

/// Errors from the password-channel cipher.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelCipherError {
    /// Ciphertext too short to contain the IV and tag.
    #[error("channel ciphertext too short: {0} bytes")]
    CiphertextTooShort(usize),

    /// AEAD open failed: wrong key or tampered ciphertext.
    #[error("channel decryption failed")]
    DecryptionFailed,

    /// AEAD seal failed (input exceeded cipher limits).
    #[error("channel encryption failed")]
    EncryptionFailed,
}
