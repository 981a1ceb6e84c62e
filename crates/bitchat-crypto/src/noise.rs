//! Noise XX handshake and transport ciphers.
//!
//! The XX pattern gives mutual authentication with identity hiding:
//!
//! ```text
//! -> e
//! <- e, ee, s, es
//! -> s, se
//! ```
//!
//! [`NoiseHandshake`] wraps `snow`'s handshake state with an explicit
//! phase machine; completion splits into a [`SendCipher`] and a
//! [`RecvCipher`] built over the stateless transport with independent
//! nonce counters. The two halves are deliberately separate values with
//! separate locks; the session layer must never serialize sends behind
//! receives or vice versa, and sharing one lock between directions is the
//! exact hazard this construction removes.

use std::sync::{Arc, Mutex};

use snow::{Builder, HandshakeState, StatelessTransportState};

use crate::error::NoiseError;

/// Noise pattern spoken on the mesh.
pub const NOISE_PATTERN: &str = "Noise_XX_25519_ChaChaPoly_SHA256";

/// Poly1305 tag appended to every transport ciphertext.
pub const TAG_LEN: usize = 16;

/// Curve25519 key size.
pub const KEY_LEN: usize = 32;

/// Largest message the Noise protocol permits.
pub const MAX_NOISE_MESSAGE_LEN: usize = 65535;

/// XX message 1 on the wire: the initiator ephemeral.
pub const MSG1_LEN: usize = 32;

/// XX message 2: responder ephemeral + encrypted static + payload tag.
pub const MSG2_LEN: usize = 96;

/// XX message 3: encrypted static + payload tag.
///
/// Protocol family docs sometimes quote 48 here, counting only the
/// encrypted static key; the empty-payload AEAD tag puts 64 bytes on the
/// wire.
pub const MSG3_LEN: usize = 64;

/// Which side of the handshake we are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Sends message 1; chosen by peer-id tie-break
    Initiator,
    /// Waits for message 1
    Responder,
}

/// Phase of an in-flight handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakePhase {
    /// Our turn to write the next handshake message
    WriteMessage,
    /// Waiting for the peer's next handshake message
    ReadMessage,
    /// All three messages exchanged; ready to split
    Complete,
}

/// An in-flight Noise XX handshake.
pub struct NoiseHandshake {
    state: HandshakeState,
    role: Role,
    phase: HandshakePhase,
}

impl NoiseHandshake {
    /// Start as the initiator (sends message 1).
    pub fn new_initiator(static_private: &[u8; KEY_LEN]) -> Result<Self, NoiseError> {
        Ok(Self {
            state: Self::builder(static_private)?.build_initiator()?,
            role: Role::Initiator,
            phase: HandshakePhase::WriteMessage,
        })
    }

    /// Start as the responder (waits for message 1).
    pub fn new_responder(static_private: &[u8; KEY_LEN]) -> Result<Self, NoiseError> {
        Ok(Self {
            state: Self::builder(static_private)?.build_responder()?,
            role: Role::Responder,
            phase: HandshakePhase::ReadMessage,
        })
    }

    fn builder(static_private: &[u8; KEY_LEN]) -> Result<Builder<'_>, NoiseError> {
        let params = NOISE_PATTERN
            .parse()
            .map_err(|_| NoiseError::BadPattern)?;
        Ok(Builder::new(params).local_private_key(static_private))
    }

    /// Our role in this handshake.
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> HandshakePhase {
        self.phase
    }

    /// True once all three messages have been processed.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.phase == HandshakePhase::Complete
    }

    /// Produce the next handshake message.
    pub fn write_message(&mut self) -> Result<Vec<u8>, NoiseError> {
        if self.phase != HandshakePhase::WriteMessage {
            return Err(NoiseError::OutOfTurn);
        }
        let mut buf = vec![0u8; MAX_NOISE_MESSAGE_LEN];
        let len = self.state.write_message(&[], &mut buf)?;
        buf.truncate(len);
        self.phase = if self.state.is_handshake_finished() {
            HandshakePhase::Complete
        } else {
            HandshakePhase::ReadMessage
        };
        Ok(buf)
    }

    /// Consume the peer's next handshake message.
    pub fn read_message(&mut self, message: &[u8]) -> Result<(), NoiseError> {
        if self.phase != HandshakePhase::ReadMessage {
            return Err(NoiseError::OutOfTurn);
        }
        if message.len() > MAX_NOISE_MESSAGE_LEN {
            return Err(NoiseError::MessageTooLarge(message.len()));
        }
        let mut buf = vec![0u8; MAX_NOISE_MESSAGE_LEN];
        self.state.read_message(message, &mut buf)?;
        self.phase = if self.state.is_handshake_finished() {
            HandshakePhase::Complete
        } else {
            HandshakePhase::WriteMessage
        };
        Ok(())
    }

    /// Remote static key, once the pattern has revealed it.
    #[must_use]
    pub fn remote_static(&self) -> Option<[u8; KEY_LEN]> {
        let remote = self.state.get_remote_static()?;
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(remote);
        Some(key)
    }

    /// Split the finished handshake into transport state.
    ///
    /// # Errors
    ///
    /// - [`NoiseError::SplitBeforeCompletion`] if called before all three
    ///   messages were processed. This is a session-fatal bug upstream.
    pub fn into_transport(self) -> Result<NoiseTransport, NoiseError> {
        if self.phase != HandshakePhase::Complete {
            return Err(NoiseError::SplitBeforeCompletion);
        }
        let remote_static = self.remote_static().ok_or(NoiseError::MissingRemoteStatic)?;
        let handshake_hash = self.state.get_handshake_hash().to_vec();
        let transport = Arc::new(self.state.into_stateless_transport_mode()?);
        Ok(NoiseTransport {
            send: SendCipher { state: Arc::clone(&transport), counter: Mutex::new(0) },
            recv: RecvCipher { state: transport, counter: Mutex::new(0) },
            handshake_hash,
            remote_static,
        })
    }
}

impl std::fmt::Debug for NoiseHandshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NoiseHandshake")
            .field("role", &self.role)
            .field("phase", &self.phase)
            .finish()
    }
}

/// Result of a completed handshake: two one-shot cipher halves plus the
/// channel-binding material.
pub struct NoiseTransport {
    /// Outbound cipher half
    pub send: SendCipher,
    /// Inbound cipher half
    pub recv: RecvCipher,
    /// Handshake hash for channel binding
    pub handshake_hash: Vec<u8>,
    /// Peer's Curve25519 static public key
    pub remote_static: [u8; KEY_LEN],
}

impl std::fmt::Debug for NoiseTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NoiseTransport")
            .field("send", &self.send)
            .field("recv", &self.recv)
            .field("remote_static", &hex::encode(self.remote_static))
            .finish_non_exhaustive()
    }
}

/// Outbound transport cipher with its own nonce counter and lock.
///
/// The counter advances exactly once per successful encryption and is
/// never reused; callers get strict outbound ordering for free because
/// the counter lock serializes them.
pub struct SendCipher {
    state: Arc<StatelessTransportState>,
    counter: Mutex<u64>,
}

impl SendCipher {
    /// Encrypt one message, appending the 16-byte tag.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, NoiseError> {
        if plaintext.len() + TAG_LEN > MAX_NOISE_MESSAGE_LEN {
            return Err(NoiseError::MessageTooLarge(plaintext.len()));
        }
        let mut counter = self.counter.lock().map_err(|_| NoiseError::Poisoned)?;
        let mut buf = vec![0u8; plaintext.len() + TAG_LEN];
        let len = self.state.write_message(*counter, plaintext, &mut buf)?;
        buf.truncate(len);
        *counter += 1;
        Ok(buf)
    }

    /// Messages encrypted so far.
    pub fn messages_sent(&self) -> u64 {
        self.counter.lock().map(|c| *c).unwrap_or(u64::MAX)
    }
}

impl std::fmt::Debug for SendCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendCipher").field("messages_sent", &self.messages_sent()).finish()
    }
}

/// Inbound transport cipher with its own nonce counter and lock.
///
/// Messages must arrive in send order (the link is ordered and the
/// router does not reorder within a session); the counter only advances
/// on successful decryption so a garbage frame cannot desynchronize the
/// session.
pub struct RecvCipher {
    state: Arc<StatelessTransportState>,
    counter: Mutex<u64>,
}

impl RecvCipher {
    /// Decrypt one message, stripping the 16-byte tag.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, NoiseError> {
        if ciphertext.len() > MAX_NOISE_MESSAGE_LEN {
            return Err(NoiseError::MessageTooLarge(ciphertext.len()));
        }
        if ciphertext.len() < TAG_LEN {
            return Err(NoiseError::MessageTooShort(ciphertext.len()));
        }
        let mut counter = self.counter.lock().map_err(|_| NoiseError::Poisoned)?;
        let mut buf = vec![0u8; ciphertext.len()];
        let len = self.state.read_message(*counter, ciphertext, &mut buf)?;
        buf.truncate(len);
        *counter += 1;
        Ok(buf)
    }

    /// Messages decrypted so far.
    pub fn messages_received(&self) -> u64 {
        self.counter.lock().map(|c| *c).unwrap_or(u64::MAX)
    }
}

impl std::fmt::Debug for RecvCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecvCipher")
            .field("messages_received", &self.messages_received())
            .finish()
    }
}

/// Generate a fresh Curve25519 static keypair for the configured pattern.
pub fn generate_static_keypair() -> Result<([u8; KEY_LEN], [u8; KEY_LEN]), NoiseError> {
    let params = NOISE_PATTERN.parse().map_err(|_| NoiseError::BadPattern)?;
    let keypair = Builder::new(params).generate_keypair()?;
    let mut private = [0u8; KEY_LEN];
    let mut public = [0u8; KEY_LEN];
    private.copy_from_slice(&keypair.private);
    public.copy_from_slice(&keypair.public);
    Ok((private, public))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keypair() -> ([u8; 32], [u8; 32]) {
        generate_static_keypair().unwrap()
    }

    fn run_handshake() -> (NoiseTransport, NoiseTransport) {
        let (init_priv, _) = keypair();
        let (resp_priv, _) = keypair();
        let mut initiator = NoiseHandshake::new_initiator(&init_priv).unwrap();
        let mut responder = NoiseHandshake::new_responder(&resp_priv).unwrap();

        let msg1 = initiator.write_message().unwrap();
        responder.read_message(&msg1).unwrap();
        let msg2 = responder.write_message().unwrap();
        initiator.read_message(&msg2).unwrap();
        let msg3 = initiator.write_message().unwrap();
        responder.read_message(&msg3).unwrap();

        assert!(initiator.is_complete());
        assert!(responder.is_complete());
        (initiator.into_transport().unwrap(), responder.into_transport().unwrap())
    }

    #[test]
    fn message_sizes_match_pattern() {
        let (init_priv, _) = keypair();
        let (resp_priv, _) = keypair();
        let mut initiator = NoiseHandshake::new_initiator(&init_priv).unwrap();
        let mut responder = NoiseHandshake::new_responder(&resp_priv).unwrap();

        let msg1 = initiator.write_message().unwrap();
        assert_eq!(msg1.len(), MSG1_LEN);
        responder.read_message(&msg1).unwrap();

        let msg2 = responder.write_message().unwrap();
        assert_eq!(msg2.len(), MSG2_LEN);
        initiator.read_message(&msg2).unwrap();

        let msg3 = initiator.write_message().unwrap();
        assert_eq!(msg3.len(), MSG3_LEN);
    }

    #[test]
    fn transport_round_trip() {
        let (alice, bob) = run_handshake();

        let ciphertext = alice.send.encrypt(b"hello bob!!").unwrap();
        assert_eq!(ciphertext.len(), 11 + TAG_LEN);
        assert_eq!(bob.recv.decrypt(&ciphertext).unwrap(), b"hello bob!!");

        let reply = bob.send.encrypt(b"hi alice").unwrap();
        assert_eq!(alice.recv.decrypt(&reply).unwrap(), b"hi alice");
    }

    #[test]
    fn counters_advance_independently() {
        let (alice, bob) = run_handshake();
        for i in 0..5u8 {
            let ct = alice.send.encrypt(&[i]).unwrap();
            assert_eq!(bob.recv.decrypt(&ct).unwrap(), [i]);
        }
        assert_eq!(alice.send.messages_sent(), 5);
        assert_eq!(bob.recv.messages_received(), 5);
        assert_eq!(bob.send.messages_sent(), 0);
        assert_eq!(alice.recv.messages_received(), 0);
    }

    #[test]
    fn garbage_does_not_desync_recv_counter() {
        let (alice, bob) = run_handshake();
        assert!(bob.recv.decrypt(&[0u8; 32]).is_err());
        // A failed decrypt must not consume the nonce.
        let ct = alice.send.encrypt(b"still fine").unwrap();
        assert_eq!(bob.recv.decrypt(&ct).unwrap(), b"still fine");
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let (alice, bob) = run_handshake();
        let mut ct = alice.send.encrypt(b"secret").unwrap();
        ct[0] ^= 0xFF;
        assert!(bob.recv.decrypt(&ct).is_err());
    }

    #[test]
    fn handshake_exposes_binding_material() {
        let (alice, bob) = run_handshake();
        assert_eq!(alice.handshake_hash, bob.handshake_hash);
        assert_eq!(alice.handshake_hash.len(), 32);
        assert_ne!(alice.remote_static, bob.remote_static);
    }

    #[test]
    fn out_of_turn_operations_fail() {
        let (priv_a, _) = keypair();
        let mut responder = NoiseHandshake::new_responder(&priv_a).unwrap();
        assert!(matches!(responder.write_message(), Err(NoiseError::OutOfTurn)));

        let mut initiator = NoiseHandshake::new_initiator(&priv_a).unwrap();
        assert!(matches!(initiator.read_message(&[0; 32]), Err(NoiseError::OutOfTurn)));
    }

    #[test]
    fn split_before_completion_fails() {
        let (priv_a, _) = keypair();
        let initiator = NoiseHandshake::new_initiator(&priv_a).unwrap();
        assert!(matches!(
            initiator.into_transport(),
            Err(NoiseError::SplitBeforeCompletion)
        ));
    }

    #[test]
    fn malformed_handshake_message_fails() {
        let (priv_a, _) = keypair();
        let mut responder = NoiseHandshake::new_responder(&priv_a).unwrap();
        assert!(responder.read_message(&[0xAB; 7]).is_err());
    }
}
