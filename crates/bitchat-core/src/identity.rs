//! Identity store: persistent static keys and peer-id rotation schedule.
//!
//! The static keypair is created once on first launch and survives
//! everything except an explicit panic wipe. Peer-id rotation changes
//! only the volatile 8-byte address; the keypair, and therefore the
//! fingerprint, is untouched. Rotation intervals are drawn uniformly
//! from the configured range so rotations across a crowd don't
//! synchronize.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::{Rng, RngCore};

use bitchat_crypto::StaticIdentity;
use bitchat_proto::PeerId;

use crate::error::{MeshError, Result, StoreError};
use crate::secure_store::{SecureStore, keys};

/// Persistent identity manager over a secure store.
#[derive(Debug, Clone)]
pub struct IdentityStore<S: SecureStore> {
    store: S,
    rotation_range: (Duration, Duration),
}

impl<S: SecureStore> IdentityStore<S> {
    /// Wrap a secure store with the configured rotation interval range.
    pub fn new(store: S, rotation_range: (Duration, Duration)) -> Self {
        Self { store, rotation_range }
    }

    /// Load the persisted identity, or generate and persist a fresh one
    /// on first launch.
    pub fn load_or_generate(&self) -> Result<StaticIdentity> {
        match self.load()? {
            Some(identity) => Ok(identity),
            None => {
                let identity = StaticIdentity::generate()?;
                self.save(&identity)?;
                tracing::info!(fingerprint = %identity.fingerprint(), "generated new identity");
                Ok(identity)
            },
        }
    }

    /// Load the persisted identity, if one exists.
    pub fn load(&self) -> Result<Option<StaticIdentity>> {
        let Some(private) = self.get_key32(keys::STATIC_PRIV)? else {
            return Ok(None);
        };
        let Some(public) = self.get_key32(keys::STATIC_PUB)? else {
            return Ok(None);
        };
        let Some(seed) = self.get_key32(keys::SIGNING_SEED)? else {
            return Ok(None);
        };
        Ok(Some(StaticIdentity::from_parts(private, public, seed)))
    }

    /// Persist an identity.
    pub fn save(&self, identity: &StaticIdentity) -> Result<()> {
        self.put_key32(keys::STATIC_PRIV, identity.noise_private())?;
        self.put_key32(keys::STATIC_PUB, identity.noise_public())?;
        self.put_key32(keys::SIGNING_SEED, &identity.signing_seed())?;
        Ok(())
    }

    /// True when enough time has passed since the last rotation.
    ///
    /// The first check after launch seeds the schedule: the peer id was
    /// just minted, so the clock starts now rather than rotating
    /// immediately.
    pub fn should_rotate_peer_id(&self, now_ms: u64) -> Result<bool> {
        let Some(last) = self.get_u64(keys::LAST_ROTATION_MS)? else {
            self.mark_rotation_completed(now_ms)?;
            return Ok(false);
        };
        let interval = self
            .get_u64(keys::NEXT_INTERVAL_MS)?
            .unwrap_or(self.rotation_range.0.as_millis() as u64);
        Ok(now_ms.saturating_sub(last) >= interval)
    }

    /// Record a completed rotation and schedule the next one at a fresh
    /// random interval within the configured range.
    pub fn mark_rotation_completed(&self, now_ms: u64) -> Result<()> {
        let (min, max) = self.rotation_range;
        let interval_ms =
            rand::thread_rng().gen_range(min.as_millis() as u64..=max.as_millis() as u64);
        self.put_u64(keys::LAST_ROTATION_MS, now_ms)?;
        self.put_u64(keys::NEXT_INTERVAL_MS, interval_ms)?;
        Ok(())
    }

    /// Mint a random peer id.
    #[must_use]
    pub fn random_peer_id() -> PeerId {
        let mut bytes = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut bytes);
        // The broadcast address is reserved; the all-zero id reads as
        // unset in diagnostic output.
        if bytes == [0xFF; 8] || bytes == [0u8; 8] {
            bytes[0] = 0x42;
        }
        PeerId::new(bytes)
    }

    /// Panic wipe: destroy the static identity and rotation state.
    pub fn clear(&self) -> Result<()> {
        for key in [
            keys::STATIC_PRIV,
            keys::STATIC_PUB,
            keys::SIGNING_SEED,
            keys::LAST_ROTATION_MS,
            keys::NEXT_INTERVAL_MS,
        ] {
            self.store.delete(key)?;
        }
        tracing::warn!("identity cleared");
        Ok(())
    }

    fn get_key32(&self, key: &str) -> Result<Option<[u8; 32]>> {
        let Some(bytes) = self.store.get(key)? else {
            return Ok(None);
        };
        let decoded = BASE64.decode(&bytes).map_err(|e| {
            MeshError::Store(StoreError::Corrupt { key: key.to_string(), reason: e.to_string() })
        })?;
        let arr: [u8; 32] = decoded.as_slice().try_into().map_err(|_| {
            MeshError::Store(StoreError::Corrupt {
                key: key.to_string(),
                reason: format!("expected 32 bytes, got {}", decoded.len()),
            })
        })?;
        Ok(Some(arr))
    }

    fn put_key32(&self, key: &str, value: &[u8; 32]) -> Result<()> {
        self.store.put(key, BASE64.encode(value).as_bytes())?;
        Ok(())
    }

    fn get_u64(&self, key: &str) -> Result<Option<u64>> {
        let Some(bytes) = self.store.get(key)? else {
            return Ok(None);
        };
        let arr: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
            MeshError::Store(StoreError::Corrupt {
                key: key.to_string(),
                reason: format!("expected 8 bytes, got {}", bytes.len()),
            })
        })?;
        Ok(Some(u64::from_be_bytes(arr)))
    }

    fn put_u64(&self, key: &str, value: u64) -> Result<()> {
        self.store.put(key, &value.to_be_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::secure_store::MemorySecureStore;

    use super::*;

    const RANGE: (Duration, Duration) = (Duration::from_secs(300), Duration::from_secs(900));

    fn store() -> IdentityStore<MemorySecureStore> {
        IdentityStore::new(MemorySecureStore::new(), RANGE)
    }

    #[test]
    fn first_launch_generates_and_persists() {
        let identity_store = store();
        let first = identity_store.load_or_generate().unwrap();
        let second = identity_store.load_or_generate().unwrap();
        assert_eq!(first.fingerprint(), second.fingerprint());
    }

    #[test]
    fn fingerprint_stable_across_rotations() {
        let identity_store = store();
        let identity = identity_store.load_or_generate().unwrap();
        let fingerprint = identity.fingerprint();

        for i in 0..5u64 {
            identity_store.mark_rotation_completed(i * 1_000_000).unwrap();
            let _ = IdentityStore::<MemorySecureStore>::random_peer_id();
        }
        assert_eq!(identity_store.load().unwrap().unwrap().fingerprint(), fingerprint);
    }

    #[test]
    fn first_check_seeds_the_schedule() {
        let identity_store = store();
        assert!(!identity_store.should_rotate_peer_id(1_000).unwrap());
        // Within the minimum interval nothing is due; past the maximum
        // a rotation must be.
        assert!(!identity_store.should_rotate_peer_id(1_000 + 299_999).unwrap());
        assert!(identity_store.should_rotate_peer_id(1_000 + 900_001).unwrap());
    }

    #[test]
    fn rotation_schedule_respects_interval() {
        let identity_store = store();
        identity_store.mark_rotation_completed(1_000_000).unwrap();
        // Before the minimum interval it can never be due.
        assert!(!identity_store.should_rotate_peer_id(1_000_000 + 299_999).unwrap());
        // Past the maximum interval it must be due.
        assert!(identity_store.should_rotate_peer_id(1_000_000 + 900_001).unwrap());
    }

    #[test]
    fn random_peer_ids_avoid_reserved_values() {
        for _ in 0..100 {
            let id = IdentityStore::<MemorySecureStore>::random_peer_id();
            assert!(!id.is_broadcast());
            assert_ne!(id.as_bytes(), &[0u8; 8]);
        }
    }

    #[test]
    fn clear_wipes_identity() {
        let identity_store = store();
        let first = identity_store.load_or_generate().unwrap();
        identity_store.clear().unwrap();
        assert!(identity_store.load().unwrap().is_none());
        let fresh = identity_store.load_or_generate().unwrap();
        assert_ne!(first.fingerprint(), fresh.fingerprint());
    }

    #[test]
    fn corrupt_key_is_surfaced() {
        let backing = MemorySecureStore::new();
        backing.put(keys::STATIC_PRIV, b"bm90IGEga2V5").unwrap(); // 9 bytes decoded
        backing.put(keys::STATIC_PUB, b"bm90IGEga2V5").unwrap();
        backing.put(keys::SIGNING_SEED, b"bm90IGEga2V5").unwrap();
        let identity_store = IdentityStore::new(backing, RANGE);
        assert!(identity_store.load().is_err());
    }
}
