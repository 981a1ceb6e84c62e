//! Static identity: the keys that survive peer-id rotation.
//!
//! An identity is a Curve25519 static keypair (the Noise `s`) plus an
//! Ed25519 signing keypair for packet and identity-announce signatures.
//! The *fingerprint* (lowercase-hex SHA-256 of the 32-byte Curve25519
//! public key) is the stable name other peers use for favorites and
//! blocklists; peer-id rotation never touches it.

use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::error::NoiseError;
use crate::noise::{KEY_LEN, generate_static_keypair};

/// Lowercase-hex SHA-256 fingerprint of a Curve25519 public key.
#[must_use]
pub fn fingerprint(public_key: &[u8]) -> String {
    hex::encode(Sha256::digest(public_key))
}

/// The device's long-lived key material.
pub struct StaticIdentity {
    noise_private: Zeroizing<[u8; KEY_LEN]>,
    noise_public: [u8; KEY_LEN],
    signing_key: SigningKey,
}

impl StaticIdentity {
    /// Generate a fresh identity (first launch).
    pub fn generate() -> Result<Self, NoiseError> {
        let (private, public) = generate_static_keypair()?;
        Ok(Self {
            noise_private: Zeroizing::new(private),
            noise_public: public,
            signing_key: SigningKey::generate(&mut OsRng),
        })
    }

    /// Rebuild an identity from persisted key material.
    #[must_use]
    pub fn from_parts(
        noise_private: [u8; KEY_LEN],
        noise_public: [u8; KEY_LEN],
        signing_seed: [u8; 32],
    ) -> Self {
        Self {
            noise_private: Zeroizing::new(noise_private),
            noise_public,
            signing_key: SigningKey::from_bytes(&signing_seed),
        }
    }

    /// Curve25519 static private key.
    #[must_use]
    pub fn noise_private(&self) -> &[u8; KEY_LEN] {
        &self.noise_private
    }

    /// Curve25519 static public key.
    #[must_use]
    pub fn noise_public(&self) -> &[u8; KEY_LEN] {
        &self.noise_public
    }

    /// Ed25519 signing key.
    #[must_use]
    pub fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }

    /// Ed25519 seed for persistence.
    #[must_use]
    pub fn signing_seed(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    /// This identity's stable fingerprint.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.noise_public)
    }
}

impl std::fmt::Debug for StaticIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Private key material stays out of logs.
        f.debug_struct("StaticIdentity").field("fingerprint", &self.fingerprint()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_64_hex_chars() {
        let identity = StaticIdentity::generate().unwrap();
        let fp = identity.fingerprint();
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn fingerprint_survives_round_trip_through_parts() {
        let identity = StaticIdentity::generate().unwrap();
        let rebuilt = StaticIdentity::from_parts(
            *identity.noise_private(),
            *identity.noise_public(),
            identity.signing_seed(),
        );
        assert_eq!(identity.fingerprint(), rebuilt.fingerprint());
        assert_eq!(
            identity.signing_key().verifying_key(),
            rebuilt.signing_key().verifying_key()
        );
    }

    #[test]
    fn distinct_identities_have_distinct_fingerprints() {
        let a = StaticIdentity::generate().unwrap();
        let b = StaticIdentity::generate().unwrap();
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn fingerprint_matches_manual_digest() {
        let identity = StaticIdentity::generate().unwrap();
        let digest = hex::encode(Sha256::digest(identity.noise_public()));
        assert_eq!(identity.fingerprint(), digest);
    }
}
