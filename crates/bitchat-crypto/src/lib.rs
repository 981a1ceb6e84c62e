//! Cryptographic primitives for the bitchat mesh.
//!
//! Three independent pieces: the Noise XX handshake and its split
//! transport ciphers (per-peer end-to-end encryption), the PBKDF2 →
//! AES-GCM password-channel cipher, and the static identity whose
//! SHA-256 fingerprint names a device across peer-id rotations.
//!
//! Session bookkeeping (who is handshaking with whom, rekey policy,
//! queued plaintext) lives in the core crate; this one only holds keys
//! and state machines over them.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod channel;
pub mod error;
pub mod identity;
pub mod noise;

pub use channel::{CHANNEL_KEY_LEN, CHANNEL_NONCE_LEN, ChannelKey, PBKDF2_ITERATIONS};
pub use error::{ChannelCipherError, NoiseError};
pub use identity::{StaticIdentity, fingerprint};
pub use noise::{
    HandshakePhase, KEY_LEN, MAX_NOISE_MESSAGE_LEN, MSG1_LEN, MSG2_LEN, MSG3_LEN, NOISE_PATTERN,
    NoiseHandshake, NoiseTransport, RecvCipher, Role, SendCipher, TAG_LEN,
    generate_static_keypair,
};
