//! Fuzz target for the fragment reassembly table.
//!
//! # Strategy
//!
//! Feed arbitrary sequences of fragment payloads (some valid trains,
//! some hostile) through the bounded arena.
//!
//! # Invariants
//!
//! - NEVER panic, regardless of indices, totals, or interleaving
//! - The arena stays within its configured capacity

#![no_main]

use arbitrary::Arbitrary;
use bitchat_core::MeshConfig;
use bitchat_core::fragment::ReassemblyTable;
use bitchat_proto::{FragmentPayload, MessageType, Packet, PeerId};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
struct Fragment {
    fragment_id: u64,
    index: u16,
    total: u16,
    chunk: Vec<u8>,
}

fuzz_target!(|fragments: Vec<Fragment>| {
    let config = MeshConfig::default();
    let mut table = ReassemblyTable::new(&config);

    for (i, fragment) in fragments.into_iter().take(256).enumerate() {
        let payload = FragmentPayload {
            fragment_id: fragment.fragment_id,
            index: fragment.index,
            total: fragment.total.max(1),
            original_type: MessageType::Message,
            chunk: fragment.chunk,
        };
        let packet = Packet::new(
            MessageType::FragmentContinue,
            PeerId::new([1; 8]),
            i as u64,
            payload.encode(),
        );
        let _ = table.insert(&packet, i as u64);
        assert!(table.len() <= config.fragment_table_capacity);
    }
});
