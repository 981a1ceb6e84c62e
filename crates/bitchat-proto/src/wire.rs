//! Binary wire codec: framing, block padding, opportunistic compression.
//!
//! Layout on the wire (big-endian multibyte):
//!
//! ```text
//! version(1) type(1) ttl(1) timestamp_ms(8) flags(1) payload_len(2)
//! sender_id(8) [recipient_id(8)] [original_size(2)] payload [signature(64)]
//! ```
//!
//! The encoded buffer is then padded up to the smallest standard block
//! that fits it with sixteen bytes to spare; padding is random bytes
//! terminated by a length byte, and is skipped entirely when more than
//! 255 bytes would be needed. Interop with the reference peers of this
//! protocol family is byte-for-byte: field order, padding, and the
//! compression framing must not change.

use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use rand::RngCore;

use crate::errors::{ProtocolError, Result};
use crate::packet::{
    MessageType, PEER_ID_LEN, PROTOCOL_VERSION, Packet, PacketFlags, PeerId, SIGNATURE_LEN,
};

/// Fixed prefix before the sender id: version, type, ttl, timestamp,
/// flags, and the 16-bit payload length.
pub const FIXED_PREFIX_LEN: usize = 14;

/// Smallest possible packet: fixed prefix plus the sender id.
pub const MIN_PACKET_LEN: usize = FIXED_PREFIX_LEN + PEER_ID_LEN;

/// Hard ceiling on an encoded packet.
pub const MAX_PACKET_LEN: usize = 64 * 1024;

/// Standard padding targets, ascending.
pub const BLOCK_SIZES: [usize; 4] = [256, 512, 1024, 2048];

/// Largest padding run expressible by the trailing length byte.
const MAX_PADDING: usize = 255;

/// Default minimum payload size before compression is attempted.
pub const COMPRESSION_THRESHOLD: usize = 100;

/// Payloads with byte entropy above this (bits per byte) are assumed
/// incompressible and skipped without attempting compression.
const ENTROPY_CEILING: f64 = 7.5;

/// Encoder knobs. Decoding is configuration-free.
#[derive(Debug, Clone, Copy)]
pub struct WireOptions {
    /// Attempt zlib compression on large, low-entropy payloads.
    ///
    /// Off by default: decode support is unconditional, but encoding
    /// compressed packets is gated until the whole fleet decodes them.
    pub enable_compression: bool,
    /// Minimum payload size to consider compressing.
    pub compression_threshold: usize,
}

impl Default for WireOptions {
    fn default() -> Self {
        Self { enable_compression: false, compression_threshold: COMPRESSION_THRESHOLD }
    }
}

/// Pad `data` to `target` with random bytes plus a trailing length byte.
///
/// No-op when `target` is not larger than the data or the gap exceeds
/// 255 bytes.
#[must_use]
pub fn pad(mut data: Vec<u8>, target: usize) -> Vec<u8> {
    let needed = target.saturating_sub(data.len());
    if needed == 0 || needed > MAX_PADDING {
        return data;
    }
    let mut filler = vec![0u8; needed - 1];
    rand::thread_rng().fill_bytes(&mut filler);
    data.extend_from_slice(&filler);
    data.push(needed as u8);
    data
}

/// Strip trailing padding using the length byte.
///
/// A length byte of zero or one larger than the buffer means the data
/// was never padded; it is returned untouched.
#[must_use]
pub fn unpad(data: &[u8]) -> &[u8] {
    match data.last() {
        Some(&n) if n as usize != 0 && (n as usize) < data.len() => {
            &data[..data.len() - n as usize]
        },
        _ => data,
    }
}

/// Smallest standard block that fits `len` plus a 16-byte margin.
#[must_use]
pub fn optimal_block(len: usize) -> Option<usize> {
    BLOCK_SIZES.iter().copied().find(|&block| len + 16 <= block)
}

/// Shannon entropy of the byte distribution, in bits per byte.
#[must_use]
pub fn byte_entropy(data: &[u8]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    let mut counts = [0usize; 256];
    for &b in data {
        counts[b as usize] += 1;
    }
    let len = data.len() as f64;
    counts
        .iter()
        .filter(|&&c| c > 0)
        .map(|&c| {
            let p = c as f64 / len;
            -p * p.log2()
        })
        .sum()
}

/// zlib-compress `data`, returning `None` unless the result is smaller.
#[must_use]
pub fn compress(data: &[u8]) -> Option<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len()), Compression::default());
    encoder.write_all(data).ok()?;
    let compressed = encoder.finish().ok()?;
    (compressed.len() < data.len()).then_some(compressed)
}

/// Decompress to exactly `original_size` bytes.
pub fn decompress(data: &[u8], original_size: usize) -> Result<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(data).take(original_size as u64 + 1);
    let mut out = Vec::with_capacity(original_size);
    decoder
        .read_to_end(&mut out)
        .map_err(|e| ProtocolError::Decompress(e.to_string()))?;
    if out.len() != original_size {
        return Err(ProtocolError::Decompress(format!(
            "expected {original_size} bytes, got {}",
            out.len()
        )));
    }
    Ok(out)
}

fn should_compress(payload: &[u8], options: &WireOptions) -> bool {
    options.enable_compression
        && payload.len() >= options.compression_threshold
        && payload.len() <= u16::MAX as usize
        && byte_entropy(payload) < ENTROPY_CEILING
}

/// Encode a packet to padded wire bytes.
///
/// # Errors
///
/// - [`ProtocolError::PacketTooLarge`] when the encoded form exceeds
///   64 KiB or the payload length field would overflow. Oversized
///   payloads are the fragmenter's job, not this codec's.
pub fn encode(packet: &Packet, options: &WireOptions) -> Result<Vec<u8>> {
    let mut flags = packet.flags();

    // Compression rewrites the payload and prepends the original size.
    let (payload, original_size) = if should_compress(&packet.payload, options) {
        match compress(&packet.payload) {
            Some(compressed) => {
                flags = flags.with_compression();
                (compressed, Some(packet.payload.len() as u16))
            },
            None => (packet.payload.clone(), None),
        }
    } else {
        (packet.payload.clone(), None)
    };

    let declared_len = payload.len() + if original_size.is_some() { 2 } else { 0 };
    if declared_len > u16::MAX as usize {
        return Err(ProtocolError::PacketTooLarge {
            size: declared_len,
            max: u16::MAX as usize,
        });
    }

    let mut out = Vec::with_capacity(FIXED_PREFIX_LEN + PEER_ID_LEN + declared_len + 80);
    out.push(packet.version);
    out.push(packet.message_type.as_u8());
    out.push(packet.ttl);
    out.extend_from_slice(&packet.timestamp_ms.to_be_bytes());
    out.push(flags.as_byte());
    out.extend_from_slice(&(declared_len as u16).to_be_bytes());
    out.extend_from_slice(packet.sender_id.as_bytes());

    if let Some(recipient) = &packet.recipient_id {
        out.extend_from_slice(recipient.as_bytes());
    }
    if let Some(size) = original_size {
        out.extend_from_slice(&size.to_be_bytes());
    }
    out.extend_from_slice(&payload);
    if let Some(signature) = &packet.signature {
        out.extend_from_slice(signature);
    }

    if out.len() > MAX_PACKET_LEN {
        return Err(ProtocolError::PacketTooLarge { size: out.len(), max: MAX_PACKET_LEN });
    }

    if let Some(block) = optimal_block(out.len()) {
        out = pad(out, block);
    }
    Ok(out)
}

fn take<'a>(data: &'a [u8], offset: &mut usize, len: usize) -> Result<&'a [u8]> {
    let end = offset
        .checked_add(len)
        .ok_or(ProtocolError::Truncated { needed: len, available: 0 })?;
    if end > data.len() {
        return Err(ProtocolError::Truncated { needed: len, available: data.len() - *offset });
    }
    let slice = &data[*offset..end];
    *offset = end;
    Ok(slice)
}

fn take_peer_id(data: &[u8], offset: &mut usize) -> Result<PeerId> {
    let slice = take(data, offset, PEER_ID_LEN)?;
    let mut bytes = [0u8; PEER_ID_LEN];
    bytes.copy_from_slice(slice);
    Ok(PeerId::new(bytes))
}

/// Decode padded wire bytes back into a packet.
///
/// Decode is strict: any malformed length, unknown version or type, or
/// truncation is an error. There is no partial acceptance.
pub fn decode(data: &[u8]) -> Result<Packet> {
    // Padding always lands exactly on a standard block, but a
    // natural-size packet can collide with a block length too (the
    // padding gap exceeded 255 bytes, or the packet was over 2032).
    // Unpadding such a packet would eat payload bytes, so non-block
    // lengths parse raw and block lengths fall back to a raw parse when
    // the unpadded one fails.
    if BLOCK_SIZES.contains(&data.len()) {
        if let Ok(packet) = decode_inner(unpad(data)) {
            return Ok(packet);
        }
    }
    decode_inner(data)
}

fn decode_inner(data: &[u8]) -> Result<Packet> {
    if data.len() < MIN_PACKET_LEN {
        return Err(ProtocolError::Truncated { needed: MIN_PACKET_LEN, available: data.len() });
    }

    let mut offset = 0usize;
    let version = take(data, &mut offset, 1)?[0];
    if version != PROTOCOL_VERSION {
        return Err(ProtocolError::UnsupportedVersion(version));
    }

    let message_type = MessageType::from_u8(take(data, &mut offset, 1)?[0])?;
    let ttl = take(data, &mut offset, 1)?[0];

    let mut ts = [0u8; 8];
    ts.copy_from_slice(take(data, &mut offset, 8)?);
    let timestamp_ms = u64::from_be_bytes(ts);

    let flags = PacketFlags::from_byte(take(data, &mut offset, 1)?[0]);

    let mut len_bytes = [0u8; 2];
    len_bytes.copy_from_slice(take(data, &mut offset, 2)?);
    let declared_len = u16::from_be_bytes(len_bytes) as usize;

    let sender_id = take_peer_id(data, &mut offset)?;
    let recipient_id =
        if flags.has_recipient() { Some(take_peer_id(data, &mut offset)?) } else { None };

    let payload = if flags.is_compressed() {
        if declared_len < 2 {
            return Err(ProtocolError::PayloadLengthMismatch {
                declared: declared_len,
                available: 0,
            });
        }
        let mut size_bytes = [0u8; 2];
        size_bytes.copy_from_slice(take(data, &mut offset, 2)?);
        let original_size = u16::from_be_bytes(size_bytes) as usize;
        let compressed = take(data, &mut offset, declared_len - 2)?;
        decompress(compressed, original_size)?
    } else {
        take(data, &mut offset, declared_len)?.to_vec()
    };

    let signature = if flags.has_signature() {
        let slice = take(data, &mut offset, SIGNATURE_LEN)?;
        let mut bytes = [0u8; SIGNATURE_LEN];
        bytes.copy_from_slice(slice);
        Some(bytes)
    } else {
        None
    };

    Ok(Packet {
        version,
        message_type,
        ttl,
        timestamp_ms,
        sender_id,
        recipient_id,
        payload,
        signature,
    })
}
