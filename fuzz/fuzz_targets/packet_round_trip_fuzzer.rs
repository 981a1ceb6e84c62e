//! Fuzz target for structured encode/decode round trips.
//!
//! # Strategy
//!
//! Build packets from arbitrary structured input (including compression
//! enabled) and require an exact round trip for every encodable packet.

#![no_main]

use arbitrary::Arbitrary;
use bitchat_proto::{MessageType, Packet, PeerId, WireOptions, decode, encode};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
struct Input {
    type_byte: u8,
    ttl: u8,
    timestamp_ms: u64,
    sender: [u8; 8],
    recipient: Option<[u8; 8]>,
    signature_seed: Option<u8>,
    compress: bool,
    payload: Vec<u8>,
}

fuzz_target!(|input: Input| {
    let Ok(message_type) = MessageType::from_u8(input.type_byte) else {
        return;
    };
    let packet = Packet {
        version: 1,
        message_type,
        ttl: input.ttl,
        timestamp_ms: input.timestamp_ms,
        sender_id: PeerId::new(input.sender),
        recipient_id: input.recipient.map(PeerId::new),
        payload: input.payload,
        signature: input.signature_seed.map(|seed| [seed; 64]),
    };
    let options = WireOptions { enable_compression: input.compress, ..WireOptions::default() };
    if let Ok(encoded) = encode(&packet, &options) {
        let decoded = decode(&encoded).expect("encoded packet must decode");
        assert_eq!(decoded, packet);
    }
});
