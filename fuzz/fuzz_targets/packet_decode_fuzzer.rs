//! Fuzz target for the wire decoder.
//!
//! # Strategy
//!
//! Raw bytes straight into `decode`. Most inputs are garbage; some get
//! mutated far enough to exercise padding removal, the compression
//! prefix, and the optional-field parsing.
//!
//! # Invariants
//!
//! - NEVER panic on arbitrary input
//! - Any accepted packet re-encodes and decodes to the same value

#![no_main]

use bitchat_proto::{WireOptions, decode, encode};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(packet) = decode(data) {
        // Whatever we accept must survive our own round trip.
        if let Ok(reencoded) = encode(&packet, &WireOptions::default()) {
            let reparsed = decode(&reencoded).expect("re-encoded packet must decode");
            assert_eq!(reparsed, packet);
        }
    }
});
