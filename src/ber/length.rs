//! BER length octet encoding/decoding (X.690 §8.1.3).

use smallvec::SmallVec;

use crate::error::{DecodeErrorKind, Error, Result};

/// Maximum accepted long-form length octet count. Lengths needing more
/// than 4 octets would exceed any sane SNMP message and are rejected.
const MAX_LENGTH_OCTETS: usize = 4;

/// Encode a length value, short form when `< 128`, long form otherwise.
///
/// Returns a stack array containing the bytes **in reverse order** (ready
/// to be pushed one at a time onto a reverse buffer) and the valid byte
/// count.
pub fn encode_length(len: usize) -> ([u8; 5], usize) {
    if len < 0x80 {
        return ([len as u8, 0, 0, 0, 0], 1);
    }

    let bytes = (len as u64).to_be_bytes();
    let mut start = 0;
    while start < 7 && bytes[start] == 0 {
        start += 1;
    }
    let significant = &bytes[start..];
    let n = significant.len();

    let mut out = [0u8; 5];
    // out[0] is pushed first onto the reverse buffer, so it must be the
    // LAST content byte; out[n] holds the 0x80|n length-of-length byte.
    for (i, &b) in significant.iter().enumerate() {
        out[i] = significant[n - 1 - i];
        let _ = b;
    }
    out[n] = 0x80 | (n as u8);
    (out, n + 1)
}

/// Decode a length field from the front of `input`.
///
/// Returns `(length, remaining)`. Rejects indefinite length (`0x80` alone)
/// and long forms requiring more than [`MAX_LENGTH_OCTETS`] octets.
pub fn decode_length(input: &[u8]) -> Result<(usize, &[u8])> {
    let &first = input
        .first()
        .ok_or(Error::decode(0, DecodeErrorKind::TruncatedData))?;

    if first & 0x80 == 0 {
        return Ok((first as usize, &input[1..]));
    }

    let n = (first & 0x7F) as usize;
    if n == 0 {
        return Err(Error::decode(0, DecodeErrorKind::IndefiniteLength));
    }
    if n > MAX_LENGTH_OCTETS {
        return Err(Error::decode(
            0,
            DecodeErrorKind::LengthTooLong { octets: n },
        ));
    }
    if input.len() < 1 + n {
        return Err(Error::decode(0, DecodeErrorKind::TruncatedData));
    }

    let mut value: u64 = 0;
    for &b in &input[1..1 + n] {
        value = (value << 8) | b as u64;
    }
    if value > usize::MAX as u64 {
        return Err(Error::decode(
            0,
            DecodeErrorKind::LengthExceedsMax {
                length: value as usize,
                max: usize::MAX,
            },
        ));
    }

    Ok((value as usize, &input[1 + n..]))
}

/// Same as [`encode_length`] but returns a `SmallVec` in forward order,
/// for callers building bytes directly (not through the reverse buffer).
pub fn encode_length_forward(len: usize) -> SmallVec<[u8; 5]> {
    let (rev_bytes, count) = encode_length(len);
    let mut out: SmallVec<[u8; 5]> = rev_bytes[..count].into();
    out.reverse();
    out
}
