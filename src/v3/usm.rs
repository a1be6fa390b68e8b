//! USM security parameters (RFC 3414 §2.3): the structure carried inside a
//! v3 message's `msgSecurityParameters` OCTET STRING.

use bytes::Bytes;

use crate::ber::{Decoder, EncodeBuf, tag};

/// `UsmSecurityParameters`, decoded from or destined for the
/// `msgSecurityParameters` OCTET STRING of a [`crate::message::V3Message`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UsmSecurityParams {
    pub engine_id: Bytes,
    pub engine_boots: i32,
    pub engine_time: i32,
    pub user_name: Bytes,
    pub auth_params: Bytes,
    pub priv_params: Bytes,
}

impl UsmSecurityParams {
    /// Encode the `SEQUENCE` wrapping all six fields.
    pub fn encode_tlv(&self) -> Vec<u8> {
        self.encode_tlv_with_auth_offset().0
    }

    /// Encode the `SEQUENCE`, also returning the byte offset of
    /// `authenticationParameters`' content within the returned bytes.
    ///
    /// Callers that need to patch an HMAC into an already-encoded message
    /// combine this offset with the byte position of this TLV's own
    /// OCTET STRING wrapper inside the outer message
    /// (see [`crate::message::V3Message::encode`]).
    pub fn encode_tlv_with_auth_offset(&self) -> (Vec<u8>, usize) {
        let engine_id = field_tlv(|b| b.push_octet_string(&self.engine_id));
        let engine_boots = field_tlv(|b| b.push_integer(self.engine_boots));
        let engine_time = field_tlv(|b| b.push_integer(self.engine_time));
        let user_name = field_tlv(|b| b.push_octet_string(&self.user_name));
        let auth_params = field_tlv(|b| b.push_octet_string(&self.auth_params));
        let priv_params = field_tlv(|b| b.push_octet_string(&self.priv_params));

        let auth_header_len = auth_params.len() - self.auth_params.len();

        let mut content = Vec::with_capacity(
            engine_id.len()
                + engine_boots.len()
                + engine_time.len()
                + user_name.len()
                + auth_params.len()
                + priv_params.len(),
        );
        content.extend_from_slice(&engine_id);
        content.extend_from_slice(&engine_boots);
        content.extend_from_slice(&engine_time);
        content.extend_from_slice(&user_name);
        let auth_offset_in_content = content.len() + auth_header_len;
        content.extend_from_slice(&auth_params);
        content.extend_from_slice(&priv_params);

        let full = wrap_sequence(&content);
        let seq_header_len = full.len() - content.len();
        (full, seq_header_len + auth_offset_in_content)
    }

    pub fn decode(data: Bytes) -> crate::error::Result<Self> {
        Self::decode_with_auth_offset(data).map(|(params, _)| params)
    }

    /// Decode, also returning the byte offset of `authenticationParameters`'
    /// content within `data`.
    ///
    /// Verifying an incoming message's HMAC needs this offset to re-zero the
    /// auth-params region of the raw bytes before recomputing the tag; see
    /// [`crate::message::V3Message::decode_with_auth_offset`].
    pub fn decode_with_auth_offset(data: Bytes) -> crate::error::Result<(Self, usize)> {
        let mut decoder = Decoder::new(data);
        let mut seq = decoder.read_sequence()?;
        let engine_id = seq.read_octet_string()?;
        let engine_boots = seq.read_integer()?;
        let engine_time = seq.read_integer()?;
        let user_name = seq.read_octet_string()?;
        let auth_params = seq.read_octet_string()?;
        let auth_offset = seq.offset() - auth_params.len();
        let priv_params = seq.read_octet_string()?;
        Ok((
            Self {
                engine_id,
                engine_boots,
                engine_time,
                user_name,
                auth_params,
                priv_params,
            },
            auth_offset,
        ))
    }
}

fn field_tlv(f: impl FnOnce(&mut EncodeBuf)) -> Vec<u8> {
    let mut buf = EncodeBuf::new();
    f(&mut buf);
    buf.finish_vec()
}

fn wrap_sequence(content: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(content.len() + 6);
    out.push(tag::universal::SEQUENCE);
    out.extend(crate::ber::encode_length_forward(content.len()));
    out.extend_from_slice(content);
    out
}
