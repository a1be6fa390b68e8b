//! SNMP message envelopes: v1/v2c community messages and v3 USM messages.

use bytes::Bytes;

use crate::ber::{Decoder, EncodeBuf, encode_length_forward, tag};
use crate::error::{DecodeErrorKind, Error, Result};
use crate::pdu::Pdu;
use crate::v3::usm::UsmSecurityParams;
use crate::version::Version;

/// RFC 3412 minimum `msgMaxSize`.
pub const MIN_MSG_MAX_SIZE: i32 = 484;

fn encode_octet_string_tlv(data: &[u8]) -> Vec<u8> {
    let mut buf = EncodeBuf::new();
    buf.push_octet_string(data);
    buf.finish_vec()
}

fn encode_integer_tlv(value: i32) -> Vec<u8> {
    let mut buf = EncodeBuf::new();
    buf.push_integer(value);
    buf.finish_vec()
}

fn wrap_tlv(t: u8, content: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(content.len() + 6);
    out.push(t);
    out.extend(encode_length_forward(content.len()));
    out.extend_from_slice(content);
    out
}

/// Security level implied by a v3 message's `auth`/`priv` flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityLevel {
    NoAuthNoPriv,
    AuthNoPriv,
    AuthPriv,
}

impl SecurityLevel {
    pub fn requires_auth(self) -> bool {
        !matches!(self, Self::NoAuthNoPriv)
    }

    pub fn requires_priv(self) -> bool {
        matches!(self, Self::AuthPriv)
    }
}

/// Message flags byte: bit0 = auth, bit1 = priv, bit2 = reportable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MsgFlags {
    pub auth: bool,
    pub priv_: bool,
    pub reportable: bool,
}

impl MsgFlags {
    pub fn security_level(self) -> SecurityLevel {
        match (self.auth, self.priv_) {
            (false, _) => SecurityLevel::NoAuthNoPriv,
            (true, false) => SecurityLevel::AuthNoPriv,
            (true, true) => SecurityLevel::AuthPriv,
        }
    }

    fn to_byte(self) -> u8 {
        (self.auth as u8) | ((self.priv_ as u8) << 1) | ((self.reportable as u8) << 2)
    }

    fn from_byte(b: u8) -> Self {
        Self {
            auth: b & 0x01 != 0,
            priv_: b & 0x02 != 0,
            reportable: b & 0x04 != 0,
        }
    }
}

/// `{contextEngineID, contextName, pdu}`, the payload carried by a v3 message
/// once (if necessary) decrypted.
#[derive(Debug, Clone, PartialEq)]
pub struct ScopedPdu {
    pub context_engine_id: Bytes,
    pub context_name: Bytes,
    pub pdu: Pdu,
}

impl ScopedPdu {
    fn encode_tlv(&self) -> Vec<u8> {
        let context_engine_id = encode_octet_string_tlv(&self.context_engine_id);
        let context_name = encode_octet_string_tlv(&self.context_name);
        let mut pdu_buf = EncodeBuf::new();
        self.pdu.encode(&mut pdu_buf);
        let pdu_bytes = pdu_buf.finish_vec();

        let mut content = Vec::with_capacity(
            context_engine_id.len() + context_name.len() + pdu_bytes.len(),
        );
        content.extend_from_slice(&context_engine_id);
        content.extend_from_slice(&context_name);
        content.extend_from_slice(&pdu_bytes);
        wrap_tlv(tag::universal::SEQUENCE, &content)
    }

    fn decode(decoder: &mut Decoder) -> Result<Self> {
        let mut seq = decoder.read_sequence()?;
        let context_engine_id = seq.read_octet_string()?;
        let context_name = seq.read_octet_string()?;
        let pdu = Pdu::decode(&mut seq)?;
        Ok(Self {
            context_engine_id,
            context_name,
            pdu,
        })
    }

    /// Encode to bytes standalone (used before USM encryption).
    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.encode_tlv())
    }

    /// Decode from the plaintext bytes USM decryption produced.
    pub fn from_bytes(data: Bytes) -> Result<Self> {
        let mut decoder = Decoder::new(data);
        Self::decode(&mut decoder)
    }
}

/// The msgData payload: a plaintext scoped PDU, or (when `priv` is set) the
/// ciphertext OCTET STRING carrying an encrypted one.
#[derive(Debug, Clone, PartialEq)]
pub enum ScopedPduData {
    Plain(ScopedPdu),
    Encrypted(Bytes),
}

/// A decoded/built SNMPv1 or v2c community message.
#[derive(Debug, Clone, PartialEq)]
pub struct CommunityMessage {
    pub version: Version,
    pub community: Bytes,
    pub pdu: Pdu,
}

impl CommunityMessage {
    pub fn new(version: Version, community: Bytes, pdu: Pdu) -> Self {
        Self {
            version,
            community,
            pdu,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = EncodeBuf::new();
        buf.push_sequence(|buf| {
            self.pdu.encode(buf);
            buf.push_octet_string(&self.community);
            buf.push_integer(self.version.as_i32());
        });
        buf.finish()
    }

    pub fn decode(data: Bytes) -> Result<Self> {
        let mut decoder = Decoder::new(data);
        let mut outer = decoder.read_sequence()?;
        let version_code = outer.read_integer()?;
        let version = Version::from_i32(version_code)
            .ok_or(Error::decode(0, DecodeErrorKind::UnknownVersion(version_code)))?;
        if version == Version::V3 {
            return Err(Error::decode(0, DecodeErrorKind::UnknownVersion(version_code)));
        }
        let community = outer.read_octet_string()?;
        let pdu = Pdu::decode(&mut outer)?;
        Ok(Self {
            version,
            community,
            pdu,
        })
    }
}

/// A decoded/built SNMPv3 message.
#[derive(Debug, Clone, PartialEq)]
pub struct V3Message {
    pub msg_id: i32,
    pub msg_max_size: i32,
    pub flags: MsgFlags,
    pub security_params: UsmSecurityParams,
    pub scoped_pdu: ScopedPduData,
}

impl V3Message {
    /// Encode the message. Returns the full bytes and, when `flags.auth` is
    /// set, the byte offset of `authenticationParameters`' content -- the
    /// caller computes the HMAC over the returned bytes (with that range
    /// still zero-filled, as `security_params.auth_params` must already be)
    /// and patches it in place.
    pub fn encode(&self) -> (Vec<u8>, Option<usize>) {
        let version = encode_integer_tlv(3);

        let global_data = {
            let msg_id = encode_integer_tlv(self.msg_id);
            let msg_max_size = encode_integer_tlv(self.msg_max_size);
            let msg_flags = encode_octet_string_tlv(&[self.flags.to_byte()]);
            let msg_security_model = encode_integer_tlv(3);
            let mut content = Vec::with_capacity(
                msg_id.len() + msg_max_size.len() + msg_flags.len() + msg_security_model.len(),
            );
            content.extend_from_slice(&msg_id);
            content.extend_from_slice(&msg_max_size);
            content.extend_from_slice(&msg_flags);
            content.extend_from_slice(&msg_security_model);
            wrap_tlv(tag::universal::SEQUENCE, &content)
        };

        let (sp_bytes, sp_auth_offset) = self.security_params.encode_tlv_with_auth_offset();
        let msg_security_parameters = encode_octet_string_tlv(&sp_bytes);
        let sp_header_len = msg_security_parameters.len() - sp_bytes.len();

        let msg_data = match &self.scoped_pdu {
            ScopedPduData::Plain(scoped) => scoped.encode_tlv(),
            ScopedPduData::Encrypted(ciphertext) => encode_octet_string_tlv(ciphertext),
        };

        let mut content = Vec::with_capacity(
            version.len() + global_data.len() + msg_security_parameters.len() + msg_data.len(),
        );
        content.extend_from_slice(&version);
        content.extend_from_slice(&global_data);
        content.extend_from_slice(&msg_security_parameters);
        content.extend_from_slice(&msg_data);
        let full = wrap_tlv(tag::universal::SEQUENCE, &content);
        let message_header_len = full.len() - content.len();

        let auth_offset = self.flags.auth.then(|| {
            message_header_len + version.len() + global_data.len() + sp_header_len + sp_auth_offset
        });

        (full, auth_offset)
    }

    pub fn decode(data: Bytes) -> Result<Self> {
        Self::decode_with_auth_offset(data).map(|(msg, _)| msg)
    }

    /// Decode, also returning the byte offset of `authenticationParameters`'
    /// content within `data`, when `flags.auth` is set.
    ///
    /// Verifying an incoming message's HMAC requires zero-filling this range
    /// in the raw received bytes and recomputing the tag over them, the same
    /// way [`Self::encode`]'s returned offset lets a sender patch a freshly
    /// computed tag in without re-encoding.
    pub fn decode_with_auth_offset(data: Bytes) -> Result<(Self, Option<usize>)> {
        let mut decoder = Decoder::new(data);
        let mut outer = decoder.read_sequence()?;

        let version_code = outer.read_integer()?;
        if version_code != 3 {
            return Err(Error::decode(
                outer.offset(),
                DecodeErrorKind::UnknownVersion(version_code),
            ));
        }

        let mut global = outer.read_sequence()?;
        let msg_id = global.read_integer()?;
        let msg_max_size = global.read_integer()?;
        if msg_max_size < MIN_MSG_MAX_SIZE {
            return Err(Error::decode(
                global.offset(),
                DecodeErrorKind::MsgMaxSizeTooSmall {
                    value: msg_max_size,
                    minimum: MIN_MSG_MAX_SIZE,
                },
            ));
        }
        let flags_bytes = global.read_octet_string()?;
        let &flags_byte = flags_bytes
            .first()
            .ok_or(Error::decode(global.offset(), DecodeErrorKind::InvalidMsgFlags))?;
        if flags_bytes.len() != 1 {
            return Err(Error::decode(global.offset(), DecodeErrorKind::InvalidMsgFlags));
        }
        let flags = MsgFlags::from_byte(flags_byte);
        if flags.priv_ && !flags.auth {
            return Err(Error::decode(global.offset(), DecodeErrorKind::InvalidMsgFlags));
        }
        let security_model = global.read_integer()?;
        if security_model != 3 {
            return Err(Error::decode(
                global.offset(),
                DecodeErrorKind::UnknownSecurityModel(security_model),
            ));
        }

        let sp_outer = outer.read_octet_string()?;
        let sp_content_offset = outer.offset() - sp_outer.len();
        let (security_params, auth_offset_in_sp) =
            UsmSecurityParams::decode_with_auth_offset(sp_outer)?;

        let scoped_pdu = if flags.priv_ {
            let ciphertext = outer.read_octet_string()?;
            ScopedPduData::Encrypted(ciphertext)
        } else {
            let peeked = outer.peek_tag()?;
            if peeked != tag::universal::SEQUENCE {
                return Err(Error::decode(
                    outer.offset(),
                    DecodeErrorKind::UnexpectedTag {
                        expected: tag::universal::SEQUENCE,
                        actual: peeked,
                    },
                ));
            }
            ScopedPduData::Plain(ScopedPdu::decode(&mut outer)?)
        };

        let auth_offset = flags.auth.then_some(sp_content_offset + auth_offset_in_sp);

        Ok((
            Self {
                msg_id,
                msg_max_size,
                flags,
                security_params,
                scoped_pdu,
            },
            auth_offset,
        ))
    }
}

/// Any decoded SNMP message, dispatched on the wire `msgVersion` byte.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Community(CommunityMessage),
    V3(V3Message),
}

impl Message {
    /// Detects version from the leading `INTEGER` and dispatches to
    /// [`CommunityMessage::decode`] or [`V3Message::decode`].
    pub fn decode(data: Bytes) -> Result<Self> {
        let mut peek = Decoder::new(data.clone());
        let mut outer = peek.read_sequence()?;
        let version_code = outer.read_integer()?;

        match version_code {
            0 | 1 => CommunityMessage::decode(data).map(Message::Community),
            3 => V3Message::decode(data).map(Message::V3),
            other => Err(Error::decode(0, DecodeErrorKind::UnknownVersion(other))),
        }
    }
}
