//! Symmetric encryption for password-protected channels.
//!
//! The channel key is PBKDF2-HMAC-SHA256 over the password with the
//! channel tag (including `#`) as salt, 100 000 iterations, 256-bit
//! output. Messages are sealed with AES-256-GCM, a 12-byte random IV
//! prepended to ciphertext+tag. The key itself never crosses the wire;
//! the creator advertises a *commitment* (SHA-256 of the key) so joiners
//! can verify a derived key without any ciphertext probing.
//!
//! Functions take caller-provided randomness so the channel layer stays
//! pure and deterministic under test.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use pbkdf2::pbkdf2_hmac;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::error::ChannelCipherError;

/// PBKDF2 iteration count.
pub const PBKDF2_ITERATIONS: u32 = 100_000;

/// Derived key length in bytes.
pub const CHANNEL_KEY_LEN: usize = 32;

/// AES-GCM IV length in bytes.
pub const CHANNEL_NONCE_LEN: usize = 12;

/// GCM tag length in bytes.
pub const CHANNEL_TAG_LEN: usize = 16;

/// A derived channel key.
///
/// Key material is zeroed on drop. Equality is not derived on purpose:
/// compare commitments, not keys.
pub struct ChannelKey(Zeroizing<[u8; CHANNEL_KEY_LEN]>);

impl ChannelKey {
    /// Derive the key for `channel` from `password`.
    ///
    /// The channel tag is the salt, so the same password on two channels
    /// yields unrelated keys.
    #[must_use]
    pub fn derive(password: &str, channel: &str) -> Self {
        let mut key = Zeroizing::new([0u8; CHANNEL_KEY_LEN]);
        pbkdf2_hmac::<Sha256>(
            password.as_bytes(),
            channel.as_bytes(),
            PBKDF2_ITERATIONS,
            key.as_mut_slice(),
        );
        Self(key)
    }

    /// Rebuild from raw key bytes (e.g. an unwrapped rotation key).
    #[must_use]
    pub fn from_bytes(bytes: [u8; CHANNEL_KEY_LEN]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    /// Lowercase-hex SHA-256 commitment advertised in channel metadata.
    #[must_use]
    pub fn commitment(&self) -> String {
        hex::encode(Sha256::digest(self.0.as_ref()))
    }

    /// Check a derived key against an advertised commitment.
    #[must_use]
    pub fn matches_commitment(&self, commitment: &str) -> bool {
        self.commitment() == commitment.to_ascii_lowercase()
    }

    /// Seal `plaintext`, prepending the caller-supplied IV.
    pub fn encrypt(
        &self,
        plaintext: &[u8],
        nonce: [u8; CHANNEL_NONCE_LEN],
    ) -> Result<Vec<u8>, ChannelCipherError> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(self.0.as_ref()));
        let sealed = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| ChannelCipherError::EncryptionFailed)?;
        let mut out = Vec::with_capacity(CHANNEL_NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    /// Open an IV-prefixed ciphertext.
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, ChannelCipherError> {
        if data.len() < CHANNEL_NONCE_LEN + CHANNEL_TAG_LEN {
            return Err(ChannelCipherError::CiphertextTooShort(data.len()));
        }
        let (nonce, sealed) = data.split_at(CHANNEL_NONCE_LEN);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(self.0.as_ref()));
        cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| ChannelCipherError::DecryptionFailed)
    }

    /// Proof for a key-verify challenge: SHA-256 over the commitment
    /// bytes and the challenge nonce.
    #[must_use]
    pub fn verify_proof(&self, challenge: &[u8]) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(Sha256::digest(self.0.as_ref()));
        hasher.update(challenge);
        hasher.finalize().to_vec()
    }
}

impl std::fmt::Debug for ChannelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        f.debug_struct("ChannelKey").field("commitment", &self.commitment()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_is_deterministic() {
        let a = ChannelKey::derive("sesame", "#lobby");
        let b = ChannelKey::derive("sesame", "#lobby");
        assert_eq!(a.commitment(), b.commitment());
    }

    #[test]
    fn channel_tag_salts_the_key() {
        let lobby = ChannelKey::derive("sesame", "#lobby");
        let other = ChannelKey::derive("sesame", "#other");
        assert_ne!(lobby.commitment(), other.commitment());
    }

    #[test]
    fn wrong_password_fails_commitment_before_any_ciphertext() {
        let creator = ChannelKey::derive("sesame", "#lobby");
        let joiner = ChannelKey::derive("Sesame", "#lobby");
        assert!(!joiner.matches_commitment(&creator.commitment()));
    }

    #[test]
    fn encrypt_decrypt_round_trip() {
        let key = ChannelKey::derive("sesame", "#lobby");
        let sealed = key.encrypt(b"meet at noon", [7; CHANNEL_NONCE_LEN]).unwrap();
        assert_eq!(sealed.len(), CHANNEL_NONCE_LEN + 12 + CHANNEL_TAG_LEN);
        assert_eq!(key.decrypt(&sealed).unwrap(), b"meet at noon");
    }

    #[test]
    fn wrong_key_fails_decryption() {
        let key = ChannelKey::derive("sesame", "#lobby");
        let wrong = ChannelKey::derive("open says me", "#lobby");
        let sealed = key.encrypt(b"secret", [1; CHANNEL_NONCE_LEN]).unwrap();
        assert_eq!(wrong.decrypt(&sealed), Err(ChannelCipherError::DecryptionFailed));
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let key = ChannelKey::derive("sesame", "#lobby");
        let mut sealed = key.encrypt(b"secret", [1; CHANNEL_NONCE_LEN]).unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert_eq!(key.decrypt(&sealed), Err(ChannelCipherError::DecryptionFailed));
    }

    #[test]
    fn short_ciphertext_is_rejected() {
        let key = ChannelKey::derive("sesame", "#lobby");
        assert!(matches!(
            key.decrypt(&[0u8; CHANNEL_NONCE_LEN]),
            Err(ChannelCipherError::CiphertextTooShort(_))
        ));
    }

    #[test]
    fn verify_proof_depends_on_key_and_challenge() {
        let key = ChannelKey::derive("sesame", "#lobby");
        let other = ChannelKey::derive("other", "#lobby");
        let challenge = [9u8; 16];
        assert_eq!(key.verify_proof(&challenge), key.verify_proof(&challenge));
        assert_ne!(key.verify_proof(&challenge), other.verify_proof(&challenge));
        assert_ne!(key.verify_proof(&challenge), key.verify_proof(&[8u8; 16]));
    }

    #[test]
    fn commitment_is_case_insensitive_on_compare() {
        let key = ChannelKey::derive("sesame", "#lobby");
        assert!(key.matches_commitment(&key.commitment().to_ascii_uppercase()));
    }
}
