//! BER decoding.
//!
//! `Decoder` wraps a remaining-buffer cursor over a [`Bytes`] slice. Each
//! `read_*` method consumes one TLV from the front and advances the
//! cursor; nested structures (SEQUENCE, PDU wrappers) hand back a child
//! `Decoder` scoped to their content bytes.

use bytes::Bytes;

use super::length::decode_length;
use super::tag;
use crate::error::{DecodeErrorKind, Error, Result};
use crate::oid::Oid;

/// Maximum length accepted for a single TLV content field. SNMP messages
/// are bounded well under this; guards against a crafted length header
/// claiming more data than could ever be a valid packet.
const MAX_CONTENT_LEN: usize = 65507;

/// A cursor over BER-encoded bytes.
#[derive(Debug, Clone)]
pub struct Decoder {
    data: Bytes,
    base_offset: usize,
}

impl Decoder {
    /// Wrap `data` for decoding, offsets reported relative to its start.
    pub fn new(data: Bytes) -> Self {
        Self {
            data,
            base_offset: 0,
        }
    }

    fn with_offset(data: Bytes, base_offset: usize) -> Self {
        Self { data, base_offset }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> &[u8] {
        &self.data
    }

    /// True if no bytes remain.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Current absolute offset, for error reporting.
    pub fn offset(&self) -> usize {
        self.base_offset
    }

    fn advance(&mut self, n: usize) {
        self.data = self.data.slice(n..);
        self.base_offset += n;
    }

    /// Look at the next tag byte without consuming it.
    pub fn peek_tag(&self) -> Result<u8> {
        self.data
            .first()
            .copied()
            .ok_or_else(|| Error::decode(self.base_offset, DecodeErrorKind::TruncatedData))
    }

    /// Parse the tag/length header at the front of the buffer without
    /// consuming. Returns `(tag, content_len, header_len)`.
    fn parse_header(&self) -> Result<(u8, usize, usize)> {
        let tag = self.peek_tag()?;
        let (content_len, after_length) = decode_length(&self.data[1..])?;
        let header_len = self.data.len() - after_length.len();
        if content_len > MAX_CONTENT_LEN {
            return Err(Error::decode(
                self.base_offset,
                DecodeErrorKind::LengthExceedsMax {
                    length: content_len,
                    max: MAX_CONTENT_LEN,
                },
            ));
        }
        if after_length.len() < content_len {
            return Err(Error::decode(
                self.base_offset,
                DecodeErrorKind::InsufficientData {
                    needed: content_len,
                    available: after_length.len(),
                },
            ));
        }
        Ok((tag, content_len, header_len))
    }

    /// Read the next TLV, returning its raw tag and content bytes.
    pub fn read_tlv(&mut self) -> Result<(u8, Bytes)> {
        let (decoded_tag, len, header_len) = self.parse_header()?;
        let content = self.data.slice(header_len..header_len + len);
        self.advance(header_len + len);
        Ok((decoded_tag, content))
    }

    /// Read the next TLV and require it to carry `expected`'s tag.
    pub fn expect_tag(&mut self, expected: u8) -> Result<Bytes> {
        let before = self.base_offset;
        let (decoded_tag, content) = self.read_tlv()?;
        if decoded_tag != expected {
            return Err(Error::decode(
                before,
                DecodeErrorKind::UnexpectedTag {
                    expected,
                    actual: decoded_tag,
                },
            ));
        }
        Ok(content)
    }

    /// Read a constructed value with the given tag, returning a child
    /// decoder scoped to its content.
    pub fn read_constructed(&mut self, expected: u8) -> Result<Decoder> {
        let before = self.base_offset;
        let (decoded_tag, len, header_len) = self.parse_header()?;
        if decoded_tag != expected {
            return Err(Error::decode(
                before,
                DecodeErrorKind::UnexpectedTag {
                    expected,
                    actual: decoded_tag,
                },
            ));
        }
        let content_offset = self.base_offset + header_len;
        let content = self.data.slice(header_len..header_len + len);
        self.advance(header_len + len);
        Ok(Decoder::with_offset(content, content_offset))
    }

    /// Read a SEQUENCE, returning a child decoder over its elements.
    pub fn read_sequence(&mut self) -> Result<Decoder> {
        self.read_constructed(tag::universal::SEQUENCE)
    }

    /// Read an INTEGER.
    pub fn read_integer(&mut self) -> Result<i32> {
        let before = self.base_offset;
        let content = self.expect_tag(tag::universal::INTEGER)?;
        decode_signed(&content, before)
    }

    /// Read an OCTET STRING, rejecting the constructed form.
    pub fn read_octet_string(&mut self) -> Result<Bytes> {
        let before = self.base_offset;
        if self.peek_tag()? == tag::universal::OCTET_STRING_CONSTRUCTED {
            return Err(Error::decode(
                before,
                DecodeErrorKind::ConstructedOctetString,
            ));
        }
        self.expect_tag(tag::universal::OCTET_STRING)
    }

    /// Read an application-tagged raw octet string (used for Opaque).
    pub fn read_raw_octet_string(&mut self, expected_tag: u8) -> Result<Bytes> {
        self.expect_tag(expected_tag)
    }

    /// Read a NULL; any non-zero length fails `invalid_null_length`.
    pub fn read_null(&mut self) -> Result<()> {
        let before = self.base_offset;
        let content = self.expect_tag(tag::universal::NULL)?;
        if !content.is_empty() {
            return Err(Error::decode(before, DecodeErrorKind::InvalidNull));
        }
        Ok(())
    }

    /// Read an OBJECT IDENTIFIER.
    pub fn read_oid(&mut self) -> Result<Oid> {
        let content = self.expect_tag(tag::universal::OBJECT_IDENTIFIER)?;
        Oid::from_ber(&content)
    }

    /// Read an unsigned 32-bit value tagged `expected_tag` (Counter32,
    /// Gauge32, TimeTicks all share this shape).
    pub fn read_unsigned32(&mut self, expected_tag: u8) -> Result<u32> {
        let before = self.base_offset;
        let content = self.expect_tag(expected_tag)?;
        decode_unsigned(&content, before)
    }

    /// Read a Counter64, tolerating any length from 0 to 8 bytes as the
    /// wire occasionally carries short forms.
    pub fn read_counter64(&mut self) -> Result<u64> {
        let before = self.base_offset;
        let content = self.expect_tag(tag::application::COUNTER64)?;
        if content.len() > 9 {
            return Err(Error::decode(
                before,
                DecodeErrorKind::Integer64TooLong {
                    length: content.len(),
                },
            ));
        }
        let mut value: u64 = 0;
        for &b in content.iter() {
            value = (value << 8) | b as u64;
        }
        Ok(value)
    }

    /// Read an IpAddress (exactly 4 bytes).
    pub fn read_ip_address(&mut self) -> Result<[u8; 4]> {
        let before = self.base_offset;
        let content = self.expect_tag(tag::application::IP_ADDRESS)?;
        if content.len() != 4 {
            return Err(Error::decode(
                before,
                DecodeErrorKind::InvalidIpAddressLength {
                    length: content.len(),
                },
            ));
        }
        let mut out = [0u8; 4];
        out.copy_from_slice(&content);
        Ok(out)
    }

    /// Consume a zero-length exception marker (NoSuchObject/NoSuchInstance/
    /// EndOfMibView) tagged `expected_tag`.
    pub fn read_exception_tag(&mut self, expected_tag: u8) -> Result<()> {
        self.expect_tag(expected_tag)?;
        Ok(())
    }
}

fn decode_signed(content: &[u8], offset: usize) -> Result<i32> {
    if content.is_empty() {
        return Err(Error::decode(offset, DecodeErrorKind::ZeroLengthInteger));
    }
    if content.len() > 8 {
        return Err(Error::decode(offset, DecodeErrorKind::IntegerOverflow));
    }
    let mut value: i64 = if content[0] & 0x80 != 0 { -1 } else { 0 };
    for &b in content {
        value = (value << 8) | b as i64;
    }
    i32::try_from(value).map_err(|_| Error::decode(offset, DecodeErrorKind::IntegerOverflow))
}

fn decode_unsigned(content: &[u8], offset: usize) -> Result<u32> {
    if content.is_empty() {
        return Err(Error::decode(offset, DecodeErrorKind::ZeroLengthInteger));
    }
    if content.len() > 5 {
        return Err(Error::decode(offset, DecodeErrorKind::IntegerOverflow));
    }
    let mut value: u64 = 0;
    for &b in content {
        value = (value << 8) | b as u64;
    }
    u32::try_from(value).map_err(|_| Error::decode(offset, DecodeErrorKind::IntegerOverflow))
}
