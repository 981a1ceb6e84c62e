//! Per-peer Noise session management.
//!
//! One session per peer id, modeled as a tagged state machine:
//!
//! ```text
//! (absent) --initiate/msg1-------------> Handshaking
//! (absent) --recv msg1 / send msg2-----> Handshaking
//! Handshaking --recv msg2 / send msg3--> Established
//! Handshaking --recv msg3 -------------> Established
//! any --crypto failure / deadline------> Failed
//! Established --age or volume----------> (rekey: torn down, re-initiated)
//! ```
//!
//! Roles are chosen by deterministic tie-break: the lexicographically
//! smaller peer id initiates. Plaintext queued while no session is
//! established is retained across rekeys and handed back for encryption
//! once the new session completes. The manager is driven from a single
//! task; the cipher halves carry their own per-direction locks.

use std::collections::HashMap;
use std::time::Duration;

use zeroize::Zeroizing;

use bitchat_crypto::{NoiseHandshake, NoiseTransport, fingerprint};
use bitchat_proto::PeerId;

use crate::config::MeshConfig;
use crate::error::{MeshError, Result};

/// State of one peer's session.
pub enum SessionState {
    /// Handshake in flight.
    Handshaking {
        /// The Noise handshake state machine
        handshake: NoiseHandshake,
        /// When the handshake started, for deadline enforcement
        started_at_ms: u64,
    },
    /// Transport ciphers live.
    Established(EstablishedSession),
    /// Terminal failure; retried by dropping and re-initiating.
    Failed {
        /// Why the session failed
        reason: String,
    },
}

impl std::fmt::Debug for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Handshaking { started_at_ms, .. } => {
                f.debug_struct("Handshaking").field("started_at_ms", started_at_ms).finish()
            },
            Self::Established(session) => f.debug_tuple("Established").field(session).finish(),
            Self::Failed { reason } => f.debug_struct("Failed").field("reason", reason).finish(),
        }
    }
}

/// A live transport session.
#[derive(Debug)]
pub struct EstablishedSession {
    transport: NoiseTransport,
    /// When the session established, for age-based rekey
    pub created_at_ms: u64,
}

impl EstablishedSession {
    /// Remote static public key.
    #[must_use]
    pub fn remote_static(&self) -> &[u8; 32] {
        &self.transport.remote_static
    }

    /// Handshake hash (channel binding).
    #[must_use]
    pub fn handshake_hash(&self) -> &[u8] {
        &self.transport.handshake_hash
    }

    /// Combined messages sent and received.
    #[must_use]
    pub fn message_count(&self) -> u64 {
        self.transport.send.messages_sent() + self.transport.recv.messages_received()
    }
}

/// What happened to a handshake message we processed.
#[derive(Debug, Default)]
pub struct HandshakeOutcome {
    /// Bytes to send back to the peer (msg2 or msg3)
    pub response: Option<Vec<u8>>,
    /// Set when the session just established: the peer's fingerprint
    pub established: Option<EstablishmentInfo>,
}

/// Facts the mesh needs when a session establishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EstablishmentInfo {
    /// Peer the session is with
    pub peer: PeerId,
    /// Fingerprint derived from the remote static key
    pub fingerprint: String,
    /// Remote Curve25519 static public key
    pub remote_static: [u8; 32],
}

/// Result of asking the manager to encrypt application data.
#[derive(Debug)]
pub enum SendOutcome {
    /// Session live; here is the ciphertext.
    Encrypted(Vec<u8>),
    /// Handshake in flight; plaintext queued behind it.
    Queued {
        /// Messages now waiting on the handshake
        pending: usize,
    },
    /// No session and no handshake; caller should start one. The
    /// plaintext was queued.
    NeedsHandshake {
        /// Messages now waiting for a session
        pending: usize,
    },
}

/// Session table plus handshake policy.
pub struct SessionManager {
    local_static_private: Zeroizing<[u8; 32]>,
    sessions: HashMap<PeerId, SessionState>,
    pending_plaintext: HashMap<PeerId, Vec<Vec<u8>>>,
    rekey_age: Duration,
    rekey_messages: u64,
    handshake_deadline: Duration,
}

impl SessionManager {
    /// Build a manager around our static private key.
    #[must_use]
    pub fn new(local_static_private: [u8; 32], config: &MeshConfig) -> Self {
        Self {
            local_static_private: Zeroizing::new(local_static_private),
            sessions: HashMap::new(),
            pending_plaintext: HashMap::new(),
            rekey_age: config.rekey_age,
            rekey_messages: config.rekey_messages,
            handshake_deadline: config.handshake_deadline,
        }
    }

    /// Deterministic tie-break: the smaller peer id initiates.
    #[must_use]
    pub fn should_initiate(local: &PeerId, remote: &PeerId) -> bool {
        local < remote
    }

    /// Start a handshake toward `peer`, returning msg1.
    ///
    /// Any previous session with the peer is destroyed first; queued
    /// plaintext is kept.
    pub fn initiate(&mut self, peer: PeerId, now_ms: u64) -> Result<Vec<u8>> {
        if let Some(SessionState::Handshaking { started_at_ms, .. }) = self.sessions.get(&peer) {
            if now_ms.saturating_sub(*started_at_ms)
                <= self.handshake_deadline.as_millis() as u64
            {
                return Err(MeshError::HandshakeInProgress(peer));
            }
        }
        let mut handshake = NoiseHandshake::new_initiator(&self.local_static_private)?;
        let msg1 = handshake.write_message()?;
        self.sessions
            .insert(peer, SessionState::Handshaking { handshake, started_at_ms: now_ms });
        tracing::debug!(%peer, "noise handshake initiated");
        Ok(msg1)
    }

    /// Process an incoming NOISE_HANDSHAKE_INIT (msg1).
    ///
    /// If we are mid-handshake as the rightful initiator (smaller id),
    /// the incoming init is ignored; the peer will pick up our msg1
    /// instead. Otherwise we respond as responder.
    pub fn on_handshake_init(
        &mut self,
        local: &PeerId,
        peer: PeerId,
        message: &[u8],
        now_ms: u64,
    ) -> Result<HandshakeOutcome> {
        if let Some(SessionState::Handshaking { .. }) = self.sessions.get(&peer) {
            if Self::should_initiate(local, &peer) {
                tracing::debug!(%peer, "simultaneous handshake, keeping initiator role");
                return Ok(HandshakeOutcome::default());
            }
        }

        let mut handshake = NoiseHandshake::new_responder(&self.local_static_private)?;
        if let Err(e) = handshake.read_message(message) {
            self.fail(peer, format!("bad handshake init: {e}"));
            return Err(e.into());
        }
        let msg2 = match handshake.write_message() {
            Ok(msg2) => msg2,
            Err(e) => {
                self.fail(peer, format!("handshake response failed: {e}"));
                return Err(e.into());
            },
        };
        self.sessions
            .insert(peer, SessionState::Handshaking { handshake, started_at_ms: now_ms });
        Ok(HandshakeOutcome { response: Some(msg2), established: None })
    }

    /// Process an incoming NOISE_HANDSHAKE_RESP (msg2 to an initiator,
    /// msg3 to a responder, disambiguated by our handshake state).
    pub fn on_handshake_resp(
        &mut self,
        peer: PeerId,
        message: &[u8],
        now_ms: u64,
    ) -> Result<HandshakeOutcome> {
        let Some(state) = self.sessions.remove(&peer) else {
            return Err(MeshError::SessionNotEstablished(peer));
        };
        let SessionState::Handshaking { mut handshake, started_at_ms } = state else {
            // A stray response against a live or failed session.
            self.sessions.insert(peer, state);
            return Err(MeshError::SessionNotEstablished(peer));
        };

        if let Err(e) = handshake.read_message(message) {
            self.fail(peer, format!("bad handshake response: {e}"));
            return Err(e.into());
        }

        let mut outcome = HandshakeOutcome::default();
        if !handshake.is_complete() {
            // Initiator path: msg2 consumed, emit msg3.
            match handshake.write_message() {
                Ok(msg3) => outcome.response = Some(msg3),
                Err(e) => {
                    self.fail(peer, format!("handshake final message failed: {e}"));
                    return Err(e.into());
                },
            }
        }

        if handshake.is_complete() {
            outcome.established = Some(self.establish(peer, handshake, now_ms)?);
        } else {
            self.sessions
                .insert(peer, SessionState::Handshaking { handshake, started_at_ms });
        }
        Ok(outcome)
    }

    fn establish(
        &mut self,
        peer: PeerId,
        handshake: NoiseHandshake,
        now_ms: u64,
    ) -> Result<EstablishmentInfo> {
        let transport = match handshake.into_transport() {
            Ok(transport) => transport,
            Err(e) => {
                self.fail(peer, format!("split failed: {e}"));
                return Err(e.into());
            },
        };
        let info = EstablishmentInfo {
            peer,
            fingerprint: fingerprint(&transport.remote_static),
            remote_static: transport.remote_static,
        };
        self.sessions.insert(
            peer,
            SessionState::Established(EstablishedSession { transport, created_at_ms: now_ms }),
        );
        tracing::info!(%peer, fingerprint = %info.fingerprint, "noise session established");
        Ok(info)
    }

    /// Encrypt application data for `peer`, queueing when no session is
    /// live yet.
    pub fn encrypt(&mut self, peer: PeerId, plaintext: &[u8]) -> Result<SendOutcome> {
        match self.sessions.get(&peer) {
            Some(SessionState::Established(session)) => {
                match session.transport.send.encrypt(plaintext) {
                    Ok(ciphertext) => Ok(SendOutcome::Encrypted(ciphertext)),
                    Err(e) => {
                        let reason = format!("encrypt failed: {e}");
                        self.fail(peer, reason.clone());
                        Err(MeshError::SessionFailed { peer, reason })
                    },
                }
            },
            Some(SessionState::Handshaking { .. }) => {
                let queue = self.pending_plaintext.entry(peer).or_default();
                queue.push(plaintext.to_vec());
                Ok(SendOutcome::Queued { pending: queue.len() })
            },
            Some(SessionState::Failed { .. }) | None => {
                let queue = self.pending_plaintext.entry(peer).or_default();
                queue.push(plaintext.to_vec());
                Ok(SendOutcome::NeedsHandshake { pending: queue.len() })
            },
        }
    }

    /// Decrypt a transport message from `peer`.
    ///
    /// AEAD failure is session-fatal: the session moves to `Failed` and
    /// the caller should signal handshake-required.
    pub fn decrypt(&mut self, peer: PeerId, ciphertext: &[u8]) -> Result<Vec<u8>> {
        match self.sessions.get(&peer) {
            Some(SessionState::Established(session)) => {
                match session.transport.recv.decrypt(ciphertext) {
                    Ok(plaintext) => Ok(plaintext),
                    Err(e) => {
                        let reason = format!("decrypt failed: {e}");
                        self.fail(peer, reason.clone());
                        Err(MeshError::SessionFailed { peer, reason })
                    },
                }
            },
            _ => Err(MeshError::SessionNotEstablished(peer)),
        }
    }

    /// Take the plaintext queued for `peer` (called after establishment
    /// to encrypt and flush it).
    pub fn take_queued(&mut self, peer: &PeerId) -> Vec<Vec<u8>> {
        self.pending_plaintext.remove(peer).unwrap_or_default()
    }

    /// Messages queued for `peer` without a live session.
    #[must_use]
    pub fn queued_count(&self, peer: &PeerId) -> usize {
        self.pending_plaintext.get(peer).map_or(0, Vec::len)
    }

    /// True when a transport session is live with `peer`.
    #[must_use]
    pub fn is_established(&self, peer: &PeerId) -> bool {
        matches!(self.sessions.get(peer), Some(SessionState::Established(_)))
    }

    /// True when a handshake with `peer` is in flight.
    #[must_use]
    pub fn is_handshaking(&self, peer: &PeerId) -> bool {
        matches!(self.sessions.get(peer), Some(SessionState::Handshaking { .. }))
    }

    /// True when any handshake is in flight (rotation must wait: a mid-
    /// handshake peer would address its next message to our old id).
    #[must_use]
    pub fn has_pending_handshakes(&self) -> bool {
        self.sessions
            .values()
            .any(|state| matches!(state, SessionState::Handshaking { .. }))
    }

    /// The established session with `peer`, if any.
    #[must_use]
    pub fn established(&self, peer: &PeerId) -> Option<&EstablishedSession> {
        match self.sessions.get(peer) {
            Some(SessionState::Established(session)) => Some(session),
            _ => None,
        }
    }

    /// True when the session with `peer` is due for a rekey.
    #[must_use]
    pub fn needs_rekey(&self, peer: &PeerId, now_ms: u64) -> bool {
        match self.sessions.get(peer) {
            Some(SessionState::Established(session)) => {
                let age = now_ms.saturating_sub(session.created_at_ms);
                age > self.rekey_age.as_millis() as u64
                    || session.message_count() > self.rekey_messages
            },
            _ => false,
        }
    }

    /// Peers whose sessions are due for a rekey.
    #[must_use]
    pub fn sessions_needing_rekey(&self, now_ms: u64) -> Vec<PeerId> {
        self.sessions
            .keys()
            .copied()
            .filter(|peer| self.needs_rekey(peer, now_ms))
            .collect()
    }

    /// Tear down the session with `peer` and start a fresh handshake.
    ///
    /// The old ciphers are destroyed before the new handshake begins;
    /// queued plaintext survives.
    pub fn begin_rekey(&mut self, peer: PeerId, now_ms: u64) -> Result<Vec<u8>> {
        self.sessions.remove(&peer);
        tracing::debug!(%peer, "session torn down for rekey");
        self.initiate(peer, now_ms)
    }

    /// Fail handshakes that blew their deadline; returns the peers.
    pub fn expire_handshakes(&mut self, now_ms: u64) -> Vec<PeerId> {
        let deadline = self.handshake_deadline.as_millis() as u64;
        let expired: Vec<PeerId> = self
            .sessions
            .iter()
            .filter_map(|(peer, state)| match state {
                SessionState::Handshaking { started_at_ms, .. }
                    if now_ms.saturating_sub(*started_at_ms) > deadline =>
                {
                    Some(*peer)
                },
                _ => None,
            })
            .collect();
        for peer in &expired {
            self.fail(*peer, "handshake deadline exceeded".to_string());
        }
        expired
    }

    /// Drop all session state for `peer` (disconnect). Queued plaintext
    /// is discarded too; the messages get a failed delivery status.
    pub fn remove(&mut self, peer: &PeerId) {
        self.sessions.remove(peer);
        self.pending_plaintext.remove(peer);
    }

    /// Failure reason for `peer`, if its session failed.
    #[must_use]
    pub fn failure_reason(&self, peer: &PeerId) -> Option<&str> {
        match self.sessions.get(peer) {
            Some(SessionState::Failed { reason }) => Some(reason),
            _ => None,
        }
    }

    fn fail(&mut self, peer: PeerId, reason: String) {
        tracing::warn!(%peer, %reason, "noise session failed");
        self.sessions.insert(peer, SessionState::Failed { reason });
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("sessions", &self.sessions.len())
            .field("pending_peers", &self.pending_plaintext.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use bitchat_crypto::generate_static_keypair;

    use super::*;

    const SMALL: PeerId = PeerId::new([0, 0, 0, 0, 0, 0, 0, 0x01]);
    const LARGE: PeerId = PeerId::new([0, 0, 0, 0, 0, 0, 0, 0xFF]);

    fn manager() -> SessionManager {
        let (private, _) = generate_static_keypair().unwrap();
        SessionManager::new(private, &MeshConfig::default())
    }

    fn manager_with(config: &MeshConfig) -> SessionManager {
        let (private, _) = generate_static_keypair().unwrap();
        SessionManager::new(private, config)
    }

    /// Drive two managers through a full handshake; `a` initiates.
    fn establish(a: &mut SessionManager, b: &mut SessionManager) {
        let msg1 = a.initiate(LARGE, 0).unwrap();
        let out2 = b.on_handshake_init(&LARGE, SMALL, &msg1, 0).unwrap();
        let msg2 = out2.response.unwrap();
        let out3 = a.on_handshake_resp(LARGE, &msg2, 0).unwrap();
        let msg3 = out3.response.unwrap();
        assert!(out3.established.is_some());
        let done = b.on_handshake_resp(SMALL, &msg3, 0).unwrap();
        assert!(done.response.is_none());
        assert!(done.established.is_some());
    }

    #[test]
    fn tie_break_is_lexicographic() {
        assert!(SessionManager::should_initiate(&SMALL, &LARGE));
        assert!(!SessionManager::should_initiate(&LARGE, &SMALL));
    }

    #[test]
    fn full_handshake_establishes_both_sides() {
        let mut a = manager();
        let mut b = manager();
        establish(&mut a, &mut b);
        assert!(a.is_established(&LARGE));
        assert!(b.is_established(&SMALL));
    }

    #[test]
    fn establishment_reports_matching_fingerprints() {
        let mut a = manager();
        let mut b = manager();

        let msg1 = a.initiate(LARGE, 0).unwrap();
        let msg2 = b.on_handshake_init(&LARGE, SMALL, &msg1, 0).unwrap().response.unwrap();
        let out3 = a.on_handshake_resp(LARGE, &msg2, 0).unwrap();
        let info_a = out3.established.unwrap();
        let info_b = b
            .on_handshake_resp(SMALL, &out3.response.unwrap(), 0)
            .unwrap()
            .established
            .unwrap();

        assert_eq!(info_a.fingerprint, fingerprint(&info_a.remote_static));
        assert_eq!(info_b.fingerprint, fingerprint(&info_b.remote_static));
        assert_ne!(info_a.fingerprint, info_b.fingerprint);
    }

    #[test]
    fn encrypt_decrypt_round_trip() {
        let mut a = manager();
        let mut b = manager();
        establish(&mut a, &mut b);

        let SendOutcome::Encrypted(ciphertext) = a.encrypt(LARGE, b"11 byte msg").unwrap()
        else {
            unreachable!("session is established");
        };
        assert_eq!(b.decrypt(SMALL, &ciphertext).unwrap(), b"11 byte msg");
    }

    #[test]
    fn plaintext_queues_without_session() {
        let mut a = manager();
        match a.encrypt(LARGE, b"early").unwrap() {
            SendOutcome::NeedsHandshake { pending } => assert_eq!(pending, 1),
            other => unreachable!("unexpected outcome: {other:?}"),
        }
        a.initiate(LARGE, 0).unwrap();
        match a.encrypt(LARGE, b"also early").unwrap() {
            SendOutcome::Queued { pending } => assert_eq!(pending, 2),
            other => unreachable!("unexpected outcome: {other:?}"),
        }
        assert_eq!(a.take_queued(&LARGE), vec![b"early".to_vec(), b"also early".to_vec()]);
        assert_eq!(a.queued_count(&LARGE), 0);
    }

    #[test]
    fn decrypt_failure_fails_session() {
        let mut a = manager();
        let mut b = manager();
        establish(&mut a, &mut b);

        assert!(b.decrypt(SMALL, &[0u8; 48]).is_err());
        assert!(!b.is_established(&SMALL));
        assert!(b.failure_reason(&SMALL).is_some());
    }

    #[test]
    fn rekey_at_message_threshold() {
        let config = MeshConfig { rekey_messages: 5, ..MeshConfig::default() };
        let mut a = manager_with(&config);
        let mut b = manager_with(&config);
        establish(&mut a, &mut b);

        for i in 0..5u8 {
            let SendOutcome::Encrypted(ct) = a.encrypt(LARGE, &[i]).unwrap() else {
                unreachable!("session is established");
            };
            b.decrypt(SMALL, &ct).unwrap();
        }
        assert!(!a.needs_rekey(&LARGE, 0));
        // The sixth message pushes the combined count over the line.
        let SendOutcome::Encrypted(_) = a.encrypt(LARGE, b"six").unwrap() else {
            unreachable!("session is established");
        };
        assert!(a.needs_rekey(&LARGE, 0));
        assert_eq!(a.sessions_needing_rekey(0), vec![LARGE]);

        // Rekey tears down and re-establishes without losing queued data.
        let msg1 = a.begin_rekey(LARGE, 1_000).unwrap();
        assert!(!a.is_established(&LARGE));
        match a.encrypt(LARGE, b"while rekeying").unwrap() {
            SendOutcome::Queued { pending } => assert_eq!(pending, 1),
            other => unreachable!("unexpected outcome: {other:?}"),
        }

        let msg2 = b.on_handshake_init(&LARGE, SMALL, &msg1, 1_000).unwrap().response.unwrap();
        let out3 = a.on_handshake_resp(LARGE, &msg2, 1_000).unwrap();
        b.on_handshake_resp(SMALL, &out3.response.unwrap(), 1_000).unwrap();
        assert!(a.is_established(&LARGE));
        assert_eq!(a.take_queued(&LARGE), vec![b"while rekeying".to_vec()]);
    }

    #[test]
    fn rekey_by_age() {
        let config = MeshConfig { rekey_age: Duration::from_secs(10), ..MeshConfig::default() };
        let mut a = manager_with(&config);
        let mut b = manager_with(&config);
        establish(&mut a, &mut b);

        assert!(!a.needs_rekey(&LARGE, 9_000));
        assert!(a.needs_rekey(&LARGE, 10_001));
    }

    #[test]
    fn handshake_deadline_fails_session() {
        let mut a = manager();
        a.initiate(LARGE, 0).unwrap();
        assert!(a.expire_handshakes(4_000).is_empty());
        assert_eq!(a.expire_handshakes(6_000), vec![LARGE]);
        assert!(a.failure_reason(&LARGE).is_some());
    }

    #[test]
    fn simultaneous_handshake_smaller_keeps_initiator_role() {
        let mut small = manager();
        let mut large = manager();

        let msg1_small = small.initiate(LARGE, 0).unwrap();
        let msg1_large = large.initiate(SMALL, 0).unwrap();

        // Small side receives the (wrongful) init while initiating: drop.
        let outcome = small.on_handshake_init(&SMALL, LARGE, &msg1_large, 0).unwrap();
        assert!(outcome.response.is_none());
        assert!(small.is_handshaking(&LARGE));

        // Large side abandons its attempt and responds.
        let outcome = large.on_handshake_init(&LARGE, SMALL, &msg1_small, 0).unwrap();
        let msg2 = outcome.response.unwrap();

        let out3 = small.on_handshake_resp(LARGE, &msg2, 0).unwrap();
        assert!(out3.established.is_some());
        let done = large.on_handshake_resp(SMALL, &out3.response.unwrap(), 0).unwrap();
        assert!(done.established.is_some());
    }

    #[test]
    fn malformed_init_fails_session() {
        let mut b = manager();
        assert!(b.on_handshake_init(&LARGE, SMALL, &[1, 2, 3], 0).is_err());
        assert!(b.failure_reason(&SMALL).is_some());
    }

    #[test]
    fn remove_discards_state_and_queue() {
        let mut a = manager();
        a.encrypt(LARGE, b"queued").unwrap();
        a.initiate(LARGE, 0).unwrap();
        a.remove(&LARGE);
        assert!(!a.is_handshaking(&LARGE));
        assert_eq!(a.queued_count(&LARGE), 0);
    }
}
