//! Channel membership and key state.
//!
//! Tracks which channels we are in, their creators and protection
//! status, and the derived keys for password channels. Key commitments
//! are verified before any decryption is attempted: a joiner whose
//! derived key does not match the advertised commitment never touches
//! ciphertext.

use std::collections::{BTreeMap, BTreeSet};

use bitchat_crypto::ChannelKey;
use bitchat_proto::PeerId;

/// What we know about one channel.
#[derive(Debug)]
pub struct ChannelState {
    /// Channel tag including `#`
    pub channel: String,
    /// Creator, when known
    pub creator_id: Option<PeerId>,
    /// Whether the channel is password-protected
    pub is_protected: bool,
    /// Advertised key commitment (hex SHA-256 of the derived key)
    pub key_commitment: Option<String>,
    /// Our derived key, when we joined with a password
    pub key: Option<ChannelKey>,
    /// Whether members retain history
    pub retention: bool,
}

/// All channel state for this node.
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    channels: BTreeMap<String, ChannelState>,
    joined: BTreeSet<String>,
}

/// Outcome of attempting to join a protected channel.
#[derive(Debug, PartialEq, Eq)]
pub enum JoinOutcome {
    /// Joined; key (if any) matches the advertised commitment.
    Joined,
    /// Channel requires a password and none was supplied.
    PasswordRequired,
    /// Derived key does not match the advertised commitment.
    WrongPassword,
}

impl ChannelRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record channel facts from an announce or metadata broadcast.
    pub fn observe(
        &mut self,
        channel: &str,
        creator_id: Option<PeerId>,
        is_protected: bool,
        key_commitment: Option<String>,
    ) {
        let state = self.channels.entry(channel.to_string()).or_insert_with(|| ChannelState {
            channel: channel.to_string(),
            creator_id: None,
            is_protected: false,
            key_commitment: None,
            key: None,
            retention: false,
        });
        if creator_id.is_some() {
            state.creator_id = creator_id;
        }
        state.is_protected = is_protected;
        if key_commitment.is_some() {
            state.key_commitment = key_commitment;
        }
    }

    /// Record a retention toggle.
    pub fn set_retention(&mut self, channel: &str, enabled: bool) {
        if let Some(state) = self.channels.get_mut(channel) {
            state.retention = enabled;
        }
    }

    /// Join a channel, deriving and checking the key when a password is
    /// supplied.
    ///
    /// The commitment check happens before the join is recorded; a
    /// mismatch leaves the registry untouched.
    pub fn join(&mut self, channel: &str, password: Option<&str>) -> JoinOutcome {
        let (is_protected, commitment) = self
            .channels
            .get(channel)
            .map(|s| (s.is_protected, s.key_commitment.clone()))
            .unwrap_or((false, None));

        let key = match (password, is_protected) {
            (Some(password), _) => {
                let key = ChannelKey::derive(password, channel);
                if let Some(commitment) = &commitment {
                    if !key.matches_commitment(commitment) {
                        tracing::warn!(channel, "channel key commitment mismatch");
                        return JoinOutcome::WrongPassword;
                    }
                }
                Some(key)
            },
            (None, true) => return JoinOutcome::PasswordRequired,
            (None, false) => None,
        };

        self.observe(channel, None, is_protected || key.is_some(), commitment);
        if let Some(state) = self.channels.get_mut(channel) {
            state.key = key;
            if state.key.is_some() {
                state.is_protected = true;
            }
        }
        self.joined.insert(channel.to_string());
        JoinOutcome::Joined
    }

    /// Replace a channel's key in place (password rotation for current
    /// members). Membership is unchanged.
    pub fn adopt_key(&mut self, channel: &str, key: ChannelKey) {
        if let Some(state) = self.channels.get_mut(channel) {
            state.key_commitment = Some(key.commitment());
            state.key = Some(key);
            state.is_protected = true;
        }
    }

    /// Leave a channel, dropping its key.
    pub fn leave(&mut self, channel: &str) {
        self.joined.remove(channel);
        if let Some(state) = self.channels.get_mut(channel) {
            state.key = None;
        }
    }

    /// Creator claims a channel, deriving its key and commitment.
    pub fn create_protected(&mut self, channel: &str, password: &str, creator_id: PeerId) {
        let key = ChannelKey::derive(password, channel);
        let commitment = key.commitment();
        self.observe(channel, Some(creator_id), true, Some(commitment));
        if let Some(state) = self.channels.get_mut(channel) {
            state.key = Some(key);
        }
        self.joined.insert(channel.to_string());
    }

    /// True when we are a member of `channel`.
    #[must_use]
    pub fn is_joined(&self, channel: &str) -> bool {
        self.joined.contains(channel)
    }

    /// Key for a channel we hold one for.
    #[must_use]
    pub fn key(&self, channel: &str) -> Option<&ChannelKey> {
        self.channels.get(channel).and_then(|s| s.key.as_ref())
    }

    /// State for a channel.
    #[must_use]
    pub fn state(&self, channel: &str) -> Option<&ChannelState> {
        self.channels.get(channel)
    }

    /// Channels we are a member of.
    #[must_use]
    pub fn joined_channels(&self) -> Vec<String> {
        self.joined.iter().cloned().collect()
    }

    /// Every channel we have heard of.
    #[must_use]
    pub fn known_channels(&self) -> Vec<String> {
        self.channels.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_channel_join() {
        let mut registry = ChannelRegistry::new();
        assert_eq!(registry.join("#open", None), JoinOutcome::Joined);
        assert!(registry.is_joined("#open"));
        assert!(registry.key("#open").is_none());
    }

    #[test]
    fn protected_channel_requires_password() {
        let mut registry = ChannelRegistry::new();
        registry.observe("#lobby", Some(PeerId::new([1; 8])), true, None);
        assert_eq!(registry.join("#lobby", None), JoinOutcome::PasswordRequired);
        assert!(!registry.is_joined("#lobby"));
    }

    #[test]
    fn commitment_gate_blocks_wrong_password() {
        let mut registry = ChannelRegistry::new();
        let creator_key = ChannelKey::derive("sesame", "#lobby");
        registry.observe(
            "#lobby",
            Some(PeerId::new([1; 8])),
            true,
            Some(creator_key.commitment()),
        );

        assert_eq!(registry.join("#lobby", Some("wrong")), JoinOutcome::WrongPassword);
        assert!(!registry.is_joined("#lobby"));
        assert_eq!(registry.join("#lobby", Some("sesame")), JoinOutcome::Joined);
        assert!(registry.is_joined("#lobby"));
    }

    #[test]
    fn joined_key_decrypts_creator_traffic() {
        let mut creator = ChannelRegistry::new();
        creator.create_protected("#lobby", "sesame", PeerId::new([1; 8]));

        let mut joiner = ChannelRegistry::new();
        joiner.observe(
            "#lobby",
            Some(PeerId::new([1; 8])),
            true,
            creator.state("#lobby").unwrap().key_commitment.clone(),
        );
        assert_eq!(joiner.join("#lobby", Some("sesame")), JoinOutcome::Joined);

        let sealed =
            creator.key("#lobby").unwrap().encrypt(b"welcome", [9; 12]).unwrap();
        assert_eq!(joiner.key("#lobby").unwrap().decrypt(&sealed).unwrap(), b"welcome");
    }

    #[test]
    fn leave_drops_key() {
        let mut registry = ChannelRegistry::new();
        registry.create_protected("#lobby", "sesame", PeerId::new([1; 8]));
        assert!(registry.key("#lobby").is_some());
        registry.leave("#lobby");
        assert!(!registry.is_joined("#lobby"));
        assert!(registry.key("#lobby").is_none());
    }

    #[test]
    fn retention_toggle() {
        let mut registry = ChannelRegistry::new();
        registry.observe("#lobby", None, false, None);
        registry.set_retention("#lobby", true);
        assert!(registry.state("#lobby").unwrap().retention);
    }
}
