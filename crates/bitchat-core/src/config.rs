//! Mesh configuration.
//!
//! One struct carries every recognized knob; `Default` matches the
//! values the protocol family ships with. Tests override individual
//! fields (`MeshConfig { rekey_messages: 5, ..MeshConfig::default() }`).

use std::time::Duration;

/// All tunables for a mesh node.
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Padding targets for encoded packets, ascending.
    pub block_sizes: [usize; 4],
    /// Minimum payload size before compression is attempted.
    pub compression_threshold: usize,
    /// Attempt compression on encode (decode support is unconditional).
    pub enable_compression: bool,
    /// Hop budget stamped on locally created packets.
    pub ttl_default: u8,
    /// How long a packet identity stays in the de-dup window.
    pub dedup_window: Duration,
    /// Maximum packet identities retained in the de-dup window.
    pub dedup_capacity: usize,
    /// How long an incomplete fragment train is retained.
    pub fragment_reassembly_deadline: Duration,
    /// Maximum concurrent fragment trains before oldest is dropped.
    pub fragment_table_capacity: usize,
    /// Session age that forces a rekey.
    pub rekey_age: Duration,
    /// Combined send+receive message count that forces a rekey.
    pub rekey_messages: u64,
    /// Deadline for an in-flight handshake before it fails.
    pub handshake_deadline: Duration,
    /// Age after which cached store-and-forward packets are dropped.
    pub store_forward_ttl: Duration,
    /// Cached packets per recipient fingerprint.
    pub store_forward_per_recipient: usize,
    /// Global byte budget for the store-and-forward cache.
    pub store_forward_max_bytes: usize,
    /// Bounds of the random peer-id rotation interval.
    pub peer_id_rotation_range: (Duration, Duration),
    /// Keep-alive announce interval.
    pub announce_interval: Duration,
    /// Quiet time after which a peer record is evicted.
    pub peer_eviction_timeout: Duration,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            block_sizes: [256, 512, 1024, 2048],
            compression_threshold: 100,
            enable_compression: false,
            ttl_default: 7,
            dedup_window: Duration::from_secs(30),
            dedup_capacity: 1000,
            fragment_reassembly_deadline: Duration::from_secs(10),
            fragment_table_capacity: 64,
            rekey_age: Duration::from_secs(60 * 60),
            rekey_messages: 10_000,
            handshake_deadline: Duration::from_secs(5),
            store_forward_ttl: Duration::from_secs(10 * 60),
            store_forward_per_recipient: 100,
            store_forward_max_bytes: 1024 * 1024,
            peer_id_rotation_range: (Duration::from_secs(5 * 60), Duration::from_secs(15 * 60)),
            announce_interval: Duration::from_secs(30),
            peer_eviction_timeout: Duration::from_secs(3 * 60),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_family() {
        let config = MeshConfig::default();
        assert_eq!(config.block_sizes, [256, 512, 1024, 2048]);
        assert_eq!(config.compression_threshold, 100);
        assert!(!config.enable_compression);
        assert_eq!(config.ttl_default, 7);
        assert_eq!(config.dedup_window, Duration::from_secs(30));
        assert_eq!(config.rekey_messages, 10_000);
        assert_eq!(config.peer_id_rotation_range.0, Duration::from_secs(300));
        assert_eq!(config.peer_id_rotation_range.1, Duration::from_secs(900));
    }
}
