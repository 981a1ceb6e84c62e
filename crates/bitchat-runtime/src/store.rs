//! Redb-backed secure store.
//!
//! A single key/value table with ACID transactions; all identity and
//! preference state survives restarts. On platforms with a real
//! keychain the application supplies its own [`SecureStore`]
//! implementation instead; this one is for servers, tests, and the
//! demo node, where the database file is protected by filesystem
//! permissions.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, TableDefinition};

use bitchat_core::{SecureStore, StoreError};

/// Table: secure_kv
/// Key: schema key string (e.g. `identity.static_priv`)
/// Value: raw value bytes
const SECURE_KV: TableDefinition<&str, &[u8]> = TableDefinition::new("secure_kv");

/// Durable secure store backed by Redb.
///
/// Thread-safe through Redb's internal locking. Clone is cheap (Arc).
#[derive(Clone)]
pub struct RedbSecureStore {
    db: Arc<Database>,
}

impl RedbSecureStore {
    /// Open or create the database at `path`.
    ///
    /// # Errors
    ///
    /// [`StoreError::Unavailable`] when the database cannot be opened,
    /// fatal at startup, per the storage error policy.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = Database::create(path.as_ref())
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let txn = db.begin_write().map_err(|e| StoreError::Unavailable(e.to_string()))?;
        {
            let _ = txn
                .open_table(SECURE_KV)
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        }
        txn.commit().map_err(|e| StoreError::Unavailable(e.to_string()))?;

        Ok(Self { db: Arc::new(db) })
    }
}

impl SecureStore for RedbSecureStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let txn = self.db.begin_read().map_err(|e| StoreError::Io(e.to_string()))?;
        let table = txn.open_table(SECURE_KV).map_err(|e| StoreError::Io(e.to_string()))?;
        let value = table.get(key).map_err(|e| StoreError::Io(e.to_string()))?;
        Ok(value.map(|guard| guard.value().to_vec()))
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let txn = self.db.begin_write().map_err(|e| StoreError::Io(e.to_string()))?;
        {
            let mut table =
                txn.open_table(SECURE_KV).map_err(|e| StoreError::Io(e.to_string()))?;
            table.insert(key, value).map_err(|e| StoreError::Io(e.to_string()))?;
        }
        txn.commit().map_err(|e| StoreError::Io(e.to_string()))?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        let txn = self.db.begin_write().map_err(|e| StoreError::Io(e.to_string()))?;
        {
            let mut table =
                txn.open_table(SECURE_KV).map_err(|e| StoreError::Io(e.to_string()))?;
            table.remove(key).map_err(|e| StoreError::Io(e.to_string()))?;
        }
        txn.commit().map_err(|e| StoreError::Io(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bitchat_core::{IdentityStore, MeshConfig};

    use super::*;

    #[test]
    fn round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = RedbSecureStore::open(dir.path().join("kv.redb")).unwrap();

        assert_eq!(store.get("k").unwrap(), None);
        store.put("k", b"v1").unwrap();
        assert_eq!(store.get("k").unwrap(), Some(b"v1".to_vec()));
        store.put("k", b"v2").unwrap();
        assert_eq!(store.get("k").unwrap(), Some(b"v2".to_vec()));
        store.delete("k").unwrap();
        assert_eq!(store.get("k").unwrap(), None);
    }

    #[test]
    fn identity_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kv.redb");
        let range = MeshConfig::default().peer_id_rotation_range;

        let fingerprint = {
            let store = RedbSecureStore::open(&path).unwrap();
            let identity_store = IdentityStore::new(store, range);
            identity_store.load_or_generate().unwrap().fingerprint()
        };

        let store = RedbSecureStore::open(&path).unwrap();
        let identity_store = IdentityStore::new(store, range);
        assert_eq!(identity_store.load_or_generate().unwrap().fingerprint(), fingerprint);
    }
}
