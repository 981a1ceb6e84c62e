//! Secure key/value store abstraction and persisted preferences.
//!
//! The OS-protected store (keychain, keystore, encrypted file) is an
//! external collaborator; this trait is the whole interface the mesh
//! needs from it. Implementations must be `Clone + Send + Sync` and
//! synchronous: clones share the same underlying backend, and the
//! runtime decides where blocking happens.
//!
//! The persistent schema is flat, individually scoped keys (see
//! [`keys`]); there is no migration concern because no key's format
//! depends on another's.

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::StoreError;

/// Persistent key names.
pub mod keys {
    /// Curve25519 static private key, base64.
    pub const STATIC_PRIV: &str = "identity.static_priv";
    /// Curve25519 static public key, base64.
    pub const STATIC_PUB: &str = "identity.static_pub";
    /// Ed25519 signing seed, base64.
    pub const SIGNING_SEED: &str = "identity.signing_seed";
    /// Last peer-id rotation, u64 ms big-endian.
    pub const LAST_ROTATION_MS: &str = "identity.last_rotation_ms";
    /// Scheduled interval until the next rotation, u64 ms big-endian.
    pub const NEXT_INTERVAL_MS: &str = "identity.next_interval_ms";
    /// Display name, UTF-8.
    pub const NICKNAME: &str = "prefs.nickname";
    /// Joined channels, CBOR set of `#name`.
    pub const JOINED_CHANNELS: &str = "prefs.joined_channels";
    /// Channels known to be password-protected, CBOR set.
    pub const PASSWORD_PROTECTED_CHANNELS: &str = "prefs.password_protected_channels";
    /// Channel → creator peer-id hex, CBOR map.
    pub const CHANNEL_CREATORS: &str = "prefs.channel_creators";
    /// Favorite fingerprints, CBOR set.
    pub const FAVORITES: &str = "prefs.favorites";
    /// Blocked fingerprints, CBOR set.
    pub const BLOCKED_USERS: &str = "prefs.blocked_users";
}

/// Encrypted key/value store provided by the platform.
pub trait SecureStore: Clone + Send + Sync + 'static {
    /// Read a value. `None` when the key has never been written.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Write a value, replacing any previous one.
    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;

    /// Remove a key. Removing an absent key is not an error.
    fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// In-memory store for tests and ephemeral nodes.
#[derive(Debug, Clone, Default)]
pub struct MemorySecureStore {
    values: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemorySecureStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecureStore for MemorySecureStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let values =
            self.values.lock().map_err(|_| StoreError::Io("lock poisoned".to_string()))?;
        Ok(values.get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let mut values =
            self.values.lock().map_err(|_| StoreError::Io("lock poisoned".to_string()))?;
        values.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut values =
            self.values.lock().map_err(|_| StoreError::Io("lock poisoned".to_string()))?;
        values.remove(key);
        Ok(())
    }
}

fn get_cbor<S: SecureStore, T: DeserializeOwned + Default>(
    store: &S,
    key: &str,
) -> Result<T, StoreError> {
    match store.get(key)? {
        None => Ok(T::default()),
        Some(bytes) => ciborium::de::from_reader(bytes.as_slice()).map_err(|e| {
            StoreError::Corrupt { key: key.to_string(), reason: e.to_string() }
        }),
    }
}

fn put_cbor<S: SecureStore, T: Serialize>(
    store: &S,
    key: &str,
    value: &T,
) -> Result<(), StoreError> {
    let mut bytes = Vec::new();
    ciborium::ser::into_writer(value, &mut bytes)
        .map_err(|e| StoreError::Corrupt { key: key.to_string(), reason: e.to_string() })?;
    store.put(key, &bytes)
}

/// Typed access to the `prefs.*` keys.
///
/// Favorites and blocklists are keyed by fingerprint so they survive
/// peer-id rotation.
#[derive(Debug, Clone)]
pub struct Preferences<S: SecureStore> {
    store: S,
}

impl<S: SecureStore> Preferences<S> {
    /// Wrap a secure store.
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Saved nickname, if any.
    pub fn nickname(&self) -> Result<Option<String>, StoreError> {
        Ok(self
            .store
            .get(keys::NICKNAME)?
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }

    /// Persist the nickname.
    pub fn set_nickname(&self, nickname: &str) -> Result<(), StoreError> {
        self.store.put(keys::NICKNAME, nickname.as_bytes())
    }

    /// Channels the user has joined.
    pub fn joined_channels(&self) -> Result<BTreeSet<String>, StoreError> {
        get_cbor(&self.store, keys::JOINED_CHANNELS)
    }

    /// Record a channel join or leave.
    pub fn set_channel_joined(&self, channel: &str, joined: bool) -> Result<(), StoreError> {
        let mut channels = self.joined_channels()?;
        if joined {
            channels.insert(channel.to_string());
        } else {
            channels.remove(channel);
        }
        put_cbor(&self.store, keys::JOINED_CHANNELS, &channels)
    }

    /// Channels known to require a password.
    pub fn password_protected_channels(&self) -> Result<BTreeSet<String>, StoreError> {
        get_cbor(&self.store, keys::PASSWORD_PROTECTED_CHANNELS)
    }

    /// Record whether a channel is password-protected.
    pub fn set_channel_protected(&self, channel: &str, protected: bool) -> Result<(), StoreError> {
        let mut channels = self.password_protected_channels()?;
        if protected {
            channels.insert(channel.to_string());
        } else {
            channels.remove(channel);
        }
        put_cbor(&self.store, keys::PASSWORD_PROTECTED_CHANNELS, &channels)
    }

    /// Channel → creator peer-id (hex) map.
    pub fn channel_creators(&self) -> Result<HashMap<String, String>, StoreError> {
        get_cbor(&self.store, keys::CHANNEL_CREATORS)
    }

    /// Record a channel's creator.
    pub fn set_channel_creator(&self, channel: &str, creator_hex: &str) -> Result<(), StoreError> {
        let mut creators = self.channel_creators()?;
        creators.insert(channel.to_string(), creator_hex.to_string());
        put_cbor(&self.store, keys::CHANNEL_CREATORS, &creators)
    }

    /// Favorite fingerprints.
    pub fn favorites(&self) -> Result<BTreeSet<String>, StoreError> {
        get_cbor(&self.store, keys::FAVORITES)
    }

    /// Add or remove a favorite fingerprint.
    pub fn set_favorite(&self, fingerprint: &str, favorite: bool) -> Result<(), StoreError> {
        let mut favorites = self.favorites()?;
        if favorite {
            favorites.insert(fingerprint.to_string());
        } else {
            favorites.remove(fingerprint);
        }
        put_cbor(&self.store, keys::FAVORITES, &favorites)
    }

    /// Blocked fingerprints.
    pub fn blocked_users(&self) -> Result<BTreeSet<String>, StoreError> {
        get_cbor(&self.store, keys::BLOCKED_USERS)
    }

    /// Add or remove a blocked fingerprint.
    pub fn set_blocked(&self, fingerprint: &str, blocked: bool) -> Result<(), StoreError> {
        let mut blocked_users = self.blocked_users()?;
        if blocked {
            blocked_users.insert(fingerprint.to_string());
        } else {
            blocked_users.remove(fingerprint);
        }
        put_cbor(&self.store, keys::BLOCKED_USERS, &blocked_users)
    }

    /// True when `fingerprint` is blocked.
    pub fn is_blocked(&self, fingerprint: &str) -> Result<bool, StoreError> {
        Ok(self.blocked_users()?.contains(fingerprint))
    }

    /// True when `fingerprint` is a favorite.
    pub fn is_favorite(&self, fingerprint: &str) -> Result<bool, StoreError> {
        Ok(self.favorites()?.contains(fingerprint))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_round_trip() {
        let store = MemorySecureStore::new();
        assert_eq!(store.get("k").unwrap(), None);
        store.put("k", b"v").unwrap();
        assert_eq!(store.get("k").unwrap(), Some(b"v".to_vec()));
        store.delete("k").unwrap();
        assert_eq!(store.get("k").unwrap(), None);
    }

    #[test]
    fn clones_share_state() {
        let store = MemorySecureStore::new();
        let clone = store.clone();
        store.put("k", b"v").unwrap();
        assert_eq!(clone.get("k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn nickname_round_trip() {
        let prefs = Preferences::new(MemorySecureStore::new());
        assert_eq!(prefs.nickname().unwrap(), None);
        prefs.set_nickname("alice").unwrap();
        assert_eq!(prefs.nickname().unwrap().as_deref(), Some("alice"));
    }

    #[test]
    fn channel_sets_round_trip() {
        let prefs = Preferences::new(MemorySecureStore::new());
        prefs.set_channel_joined("#lobby", true).unwrap();
        prefs.set_channel_joined("#dev", true).unwrap();
        prefs.set_channel_joined("#lobby", false).unwrap();
        let joined = prefs.joined_channels().unwrap();
        assert!(joined.contains("#dev"));
        assert!(!joined.contains("#lobby"));
    }

    #[test]
    fn blocklist_is_fingerprint_keyed() {
        let prefs = Preferences::new(MemorySecureStore::new());
        let fpr = "ab".repeat(32);
        assert!(!prefs.is_blocked(&fpr).unwrap());
        prefs.set_blocked(&fpr, true).unwrap();
        assert!(prefs.is_blocked(&fpr).unwrap());
        prefs.set_blocked(&fpr, false).unwrap();
        assert!(!prefs.is_blocked(&fpr).unwrap());
    }

    #[test]
    fn channel_creators_round_trip() {
        let prefs = Preferences::new(MemorySecureStore::new());
        prefs.set_channel_creator("#lobby", "0102030405060708").unwrap();
        assert_eq!(
            prefs.channel_creators().unwrap().get("#lobby").map(String::as_str),
            Some("0102030405060708")
        );
    }

    #[test]
    fn corrupt_value_is_reported() {
        let store = MemorySecureStore::new();
        store.put(keys::FAVORITES, b"\xff\xff not cbor").unwrap();
        let prefs = Preferences::new(store);
        assert!(matches!(prefs.favorites(), Err(StoreError::Corrupt { .. })));
    }
}
