//! Presence payloads: ANNOUNCE, LEAVE, and NOISE_IDENTITY_ANNOUNCE.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::{ProtocolError, Result};
use crate::packet::PeerId;
use crate::payloads::cbor_codec;

/// Periodic presence broadcast carrying the sender's nickname.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announce {
    /// Display name chosen by the peer
    pub nickname: String,
}

cbor_codec!(Announce);

/// Graceful departure, optionally scoped to a single channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Leave {
    /// `#channel` being left, or `None` for leaving the mesh entirely
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
}

cbor_codec!(Leave);

/// Signed binding of a volatile peer id to the peer's static keys.
///
/// This is what lets the directory track an identity across peer-id
/// rotations: the fingerprint of `noise_public_key` is stable, and the
/// Ed25519 signature proves the rotation was produced by the key holder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityAnnounce {
    /// Peer id currently in use
    pub peer_id: PeerId,
    /// Display name
    pub nickname: String,
    /// Curve25519 static public key (32 bytes)
    pub noise_public_key: Vec<u8>,
    /// Ed25519 public key used for packet signatures (32 bytes)
    pub signing_public_key: Vec<u8>,
    /// When this binding was produced, ms since the Unix epoch
    pub timestamp_ms: u64,
    /// Ed25519 signature over the binding digest
    pub signature: Vec<u8>,
}

cbor_codec!(IdentityAnnounce);

impl IdentityAnnounce {
    /// Build and sign a binding.
    #[must_use]
    pub fn signed(
        peer_id: PeerId,
        nickname: String,
        noise_public_key: [u8; 32],
        signing_key: &SigningKey,
        timestamp_ms: u64,
    ) -> Self {
        let mut announce = Self {
            peer_id,
            nickname,
            noise_public_key: noise_public_key.to_vec(),
            signing_public_key: signing_key.verifying_key().to_bytes().to_vec(),
            timestamp_ms,
            signature: Vec::new(),
        };
        announce.signature = signing_key.sign(&announce.binding_digest()).to_bytes().to_vec();
        announce
    }

    /// Digest covered by the signature (everything except the signature).
    #[must_use]
    pub fn binding_digest(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(b"bitchat-identity-v1");
        hasher.update(self.peer_id.as_bytes());
        hasher.update(self.nickname.as_bytes());
        hasher.update(&self.noise_public_key);
        hasher.update(&self.signing_public_key);
        hasher.update(self.timestamp_ms.to_be_bytes());
        hasher.finalize().into()
    }

    /// Verify the binding against its embedded signing key.
    pub fn verify(&self) -> Result<()> {
        let key_bytes: [u8; 32] = self
            .signing_public_key
            .as_slice()
            .try_into()
            .map_err(|_| ProtocolError::MissingField("signing_public_key"))?;
        let key =
            VerifyingKey::from_bytes(&key_bytes).map_err(|_| ProtocolError::BadSignature)?;
        let sig_bytes: [u8; 64] = self
            .signature
            .as_slice()
            .try_into()
            .map_err(|_| ProtocolError::MissingField("signature"))?;
        key.verify(&self.binding_digest(), &Signature::from_bytes(&sig_bytes))
            .map_err(|_| ProtocolError::BadSignature)
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::OsRng;

    use super::*;

    #[test]
    fn announce_round_trip() {
        let announce = Announce { nickname: "anon#1234".to_string() };
        assert_eq!(Announce::decode(&announce.encode().unwrap()).unwrap(), announce);
    }

    #[test]
    fn leave_round_trip() {
        for channel in [None, Some("#lobby".to_string())] {
            let leave = Leave { channel };
            assert_eq!(Leave::decode(&leave.encode().unwrap()).unwrap(), leave);
        }
    }

    #[test]
    fn identity_announce_verifies() {
        let key = SigningKey::generate(&mut OsRng);
        let announce = IdentityAnnounce::signed(
            PeerId::new([1; 8]),
            "alice".to_string(),
            [7; 32],
            &key,
            1_700_000_000_000,
        );
        announce.verify().unwrap();

        let decoded = IdentityAnnounce::decode(&announce.encode().unwrap()).unwrap();
        assert_eq!(decoded, announce);
        decoded.verify().unwrap();
    }

    #[test]
    fn tampered_identity_announce_fails() {
        let key = SigningKey::generate(&mut OsRng);
        let mut announce = IdentityAnnounce::signed(
            PeerId::new([1; 8]),
            "alice".to_string(),
            [7; 32],
            &key,
            1_700_000_000_000,
        );
        announce.peer_id = PeerId::new([2; 8]);
        assert_eq!(announce.verify(), Err(ProtocolError::BadSignature));
    }
}
