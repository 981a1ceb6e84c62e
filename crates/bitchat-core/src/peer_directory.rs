//! Peer directory: volatile peer ids ↔ stable fingerprints.
//!
//! The directory is the single source of truth for identity mapping.
//! Favorites and blocklists key on fingerprints, so they survive the
//! peer-id rotations that happen every few minutes. A record is created
//! by the first ANNOUNCE from a peer (no fingerprint yet) and upgraded
//! when a handshake or identity announce reveals the static key.
//! Invariant maintained throughout: every bound fingerprint maps back to
//! the peer id that carries it, and vice versa.

use std::collections::HashMap;

use bitchat_proto::PeerId;

/// What we know about one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    /// Peer id currently in use
    pub peer_id: PeerId,
    /// 64-hex-char SHA-256 of the peer's static Curve25519 key, once
    /// observed via handshake or identity announce
    pub fingerprint: Option<String>,
    /// Display name, if announced
    pub nickname: Option<String>,
    /// Last packet observed from this peer, ms since the Unix epoch
    pub last_seen_ms: u64,
    /// Link quality indicator for UI sorting (link-defined scale)
    pub rssi: Option<i8>,
    /// Ed25519 verifying key bytes, once an identity announce arrived
    pub signing_public_key: Option<[u8; 32]>,
}

/// Bidirectional peer-id ↔ fingerprint directory.
#[derive(Debug, Default)]
pub struct PeerDirectory {
    by_peer_id: HashMap<PeerId, PeerRecord>,
    by_fingerprint: HashMap<String, PeerId>,
}

impl PeerDirectory {
    /// Empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or refresh a record from presence traffic. Returns `true`
    /// when the peer was previously unknown.
    pub fn upsert(&mut self, peer_id: PeerId, nickname: Option<&str>, now_ms: u64) -> bool {
        let is_new = !self.by_peer_id.contains_key(&peer_id);
        let record = self.by_peer_id.entry(peer_id).or_insert_with(|| PeerRecord {
            peer_id,
            fingerprint: None,
            nickname: None,
            last_seen_ms: now_ms,
            rssi: None,
            signing_public_key: None,
        });
        record.last_seen_ms = now_ms;
        if let Some(name) = nickname {
            record.nickname = Some(name.to_string());
        }
        is_new
    }

    /// Bind `peer_id` to `fingerprint`, superseding any previous binding
    /// of either side (this is how a rotation takes effect).
    pub fn bind(&mut self, peer_id: PeerId, fingerprint: String, now_ms: u64) {
        // A fingerprint moving to a new peer id invalidates its old id.
        if let Some(old_id) = self.by_fingerprint.get(&fingerprint).copied() {
            if old_id != peer_id {
                self.by_peer_id.remove(&old_id);
            }
        }
        // A peer id changing identity invalidates its old fingerprint.
        if let Some(old) = self.by_peer_id.get(&peer_id) {
            if let Some(old_fpr) = &old.fingerprint {
                if *old_fpr != fingerprint {
                    self.by_fingerprint.remove(old_fpr);
                }
            }
        }

        self.upsert(peer_id, None, now_ms);
        if let Some(record) = self.by_peer_id.get_mut(&peer_id) {
            record.fingerprint = Some(fingerprint.clone());
        }
        self.by_fingerprint.insert(fingerprint, peer_id);
    }

    /// Store the Ed25519 key a peer announced.
    pub fn set_signing_key(&mut self, peer_id: &PeerId, key: [u8; 32]) {
        if let Some(record) = self.by_peer_id.get_mut(peer_id) {
            record.signing_public_key = Some(key);
        }
    }

    /// Update the link-quality indicator.
    pub fn set_rssi(&mut self, peer_id: &PeerId, rssi: i8) {
        if let Some(record) = self.by_peer_id.get_mut(peer_id) {
            record.rssi = Some(rssi);
        }
    }

    /// Fingerprint currently bound to a peer id.
    #[must_use]
    pub fn fingerprint_of(&self, peer_id: &PeerId) -> Option<&str> {
        self.by_peer_id.get(peer_id).and_then(|r| r.fingerprint.as_deref())
    }

    /// Peer id currently bound to a fingerprint.
    #[must_use]
    pub fn peer_id_of(&self, fingerprint: &str) -> Option<PeerId> {
        self.by_fingerprint.get(fingerprint).copied()
    }

    /// Full record for a peer id.
    #[must_use]
    pub fn record(&self, peer_id: &PeerId) -> Option<&PeerRecord> {
        self.by_peer_id.get(peer_id)
    }

    /// Remove a peer id binding (disconnect or eviction).
    ///
    /// The reverse mapping is cleared only if it still points at this
    /// peer id; a rotation may already have moved the fingerprint.
    pub fn remove(&mut self, peer_id: &PeerId) -> Option<PeerRecord> {
        let record = self.by_peer_id.remove(peer_id)?;
        if let Some(fingerprint) = &record.fingerprint {
            if self.by_fingerprint.get(fingerprint) == Some(peer_id) {
                self.by_fingerprint.remove(fingerprint);
            }
        }
        Some(record)
    }

    /// Evict peers quiet since before `horizon_ms`; returns the evicted
    /// records.
    pub fn evict_quiet(&mut self, horizon_ms: u64) -> Vec<PeerRecord> {
        let quiet: Vec<PeerId> = self
            .by_peer_id
            .values()
            .filter(|r| r.last_seen_ms < horizon_ms)
            .map(|r| r.peer_id)
            .collect();
        quiet.into_iter().filter_map(|id| self.remove(&id)).collect()
    }

    /// All known peer ids, sorted.
    #[must_use]
    pub fn peer_ids(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self.by_peer_id.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Number of known peers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_peer_id.len()
    }

    /// True when no peers are known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_peer_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fpr(tag: u8) -> String {
        hex::encode([tag; 32])
    }

    fn check_invariant(directory: &PeerDirectory) {
        for (id, record) in &directory.by_peer_id {
            if let Some(fingerprint) = &record.fingerprint {
                assert_eq!(directory.by_fingerprint.get(fingerprint), Some(id));
            }
        }
        for (fingerprint, id) in &directory.by_fingerprint {
            assert_eq!(
                directory.by_peer_id.get(id).and_then(|r| r.fingerprint.as_deref()),
                Some(fingerprint.as_str())
            );
        }
    }

    #[test]
    fn announce_creates_unverified_record() {
        let mut directory = PeerDirectory::new();
        let id = PeerId::new([1; 8]);
        assert!(directory.upsert(id, Some("alice"), 1_000));
        assert!(!directory.upsert(id, None, 2_000));

        let record = directory.record(&id).unwrap();
        assert_eq!(record.nickname.as_deref(), Some("alice"));
        assert_eq!(record.last_seen_ms, 2_000);
        assert!(record.fingerprint.is_none());
        check_invariant(&directory);
    }

    #[test]
    fn bind_and_lookup() {
        let mut directory = PeerDirectory::new();
        let id = PeerId::new([1; 8]);
        directory.bind(id, fpr(1), 1_000);

        assert_eq!(directory.fingerprint_of(&id), Some(fpr(1).as_str()));
        assert_eq!(directory.peer_id_of(&fpr(1)), Some(id));
        check_invariant(&directory);
    }

    #[test]
    fn rotation_moves_fingerprint() {
        let mut directory = PeerDirectory::new();
        let old_id = PeerId::new([1; 8]);
        let new_id = PeerId::new([2; 8]);

        directory.bind(old_id, fpr(1), 1_000);
        directory.bind(new_id, fpr(1), 2_000);

        assert_eq!(directory.peer_id_of(&fpr(1)), Some(new_id));
        assert!(directory.record(&old_id).is_none());
        assert_eq!(directory.len(), 1);
        check_invariant(&directory);
    }

    #[test]
    fn peer_id_reuse_by_other_identity() {
        let mut directory = PeerDirectory::new();
        let id = PeerId::new([1; 8]);

        directory.bind(id, fpr(1), 1_000);
        directory.bind(id, fpr(2), 2_000);

        assert_eq!(directory.fingerprint_of(&id), Some(fpr(2).as_str()));
        assert!(directory.peer_id_of(&fpr(1)).is_none());
        check_invariant(&directory);
    }

    #[test]
    fn remove_clears_reverse_only_if_current() {
        let mut directory = PeerDirectory::new();
        let old_id = PeerId::new([1; 8]);
        let new_id = PeerId::new([2; 8]);
        directory.bind(old_id, fpr(1), 1_000);
        // Rotation happened; the old record was already superseded.
        directory.bind(new_id, fpr(1), 2_000);

        assert!(directory.remove(&old_id).is_none());
        assert_eq!(directory.peer_id_of(&fpr(1)), Some(new_id));
        check_invariant(&directory);
    }

    #[test]
    fn eviction_by_quiet_time() {
        let mut directory = PeerDirectory::new();
        directory.bind(PeerId::new([1; 8]), fpr(1), 1_000);
        directory.bind(PeerId::new([2; 8]), fpr(2), 5_000);

        let evicted = directory.evict_quiet(3_000);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].peer_id, PeerId::new([1; 8]));
        assert_eq!(directory.len(), 1);
        check_invariant(&directory);
    }

    #[test]
    fn bind_preserves_nickname() {
        let mut directory = PeerDirectory::new();
        let id = PeerId::new([1; 8]);
        directory.upsert(id, Some("alice"), 1_000);
        directory.bind(id, fpr(1), 2_000);

        let record = directory.record(&id).unwrap();
        assert_eq!(record.nickname.as_deref(), Some("alice"));
        assert_eq!(record.fingerprint.as_deref(), Some(fpr(1).as_str()));
    }
}
