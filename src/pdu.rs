//! PDU (Protocol Data Unit) types and build-time validation.

use crate::ber::tag;
use crate::ber::{Decoder, EncodeBuf};
use crate::error::{DecodeErrorKind, Error, Result};
use crate::varbind::{self, VarBind};
use crate::version::Version;

/// The PDU type discriminant, independent of its contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PduType {
    GetRequest,
    GetNextRequest,
    GetResponse,
    SetRequest,
    GetBulkRequest,
    /// REPORT PDU, emitted by a v3 agent to indicate an engine-discovery
    /// or time-window problem. Decodable but never built by this client.
    Report,
}

impl PduType {
    fn from_tag(t: u8) -> Result<Self> {
        match t {
            tag::pdu::GET_REQUEST => Ok(Self::GetRequest),
            tag::pdu::GET_NEXT_REQUEST => Ok(Self::GetNextRequest),
            tag::pdu::RESPONSE => Ok(Self::GetResponse),
            tag::pdu::SET_REQUEST => Ok(Self::SetRequest),
            tag::pdu::GET_BULK_REQUEST => Ok(Self::GetBulkRequest),
            tag::pdu::REPORT => Ok(Self::Report),
            other => Err(Error::decode(0, DecodeErrorKind::UnknownPduType(other))),
        }
    }

    fn tag(self) -> u8 {
        match self {
            Self::GetRequest => tag::pdu::GET_REQUEST,
            Self::GetNextRequest => tag::pdu::GET_NEXT_REQUEST,
            Self::GetResponse => tag::pdu::RESPONSE,
            Self::SetRequest => tag::pdu::SET_REQUEST,
            Self::GetBulkRequest => tag::pdu::GET_BULK_REQUEST,
            Self::Report => tag::pdu::REPORT,
        }
    }
}

/// A decoded/built SNMP PDU.
///
/// `GetBulkRequest` reuses `error_status`/`error_index` as the wire storage
/// for `non_repeaters`/`max_repetitions` (same TLV shape, different
/// semantics per RFC 3416); accessors below give each PDU kind its own
/// field names.
#[derive(Debug, Clone, PartialEq)]
pub struct Pdu {
    pub pdu_type: PduType,
    pub request_id: i32,
    /// error_status (GET/SET/Response) or non_repeaters (GetBulk).
    pub field2: i32,
    /// error_index (GET/SET/Response) or max_repetitions (GetBulk).
    pub field3: i32,
    pub varbinds: Vec<VarBind>,
}

impl Pdu {
    /// Build a GetRequest.
    pub fn get_request(request_id: i32, oids: &[crate::oid::Oid]) -> Self {
        Self {
            pdu_type: PduType::GetRequest,
            request_id,
            field2: 0,
            field3: 0,
            varbinds: oids.iter().cloned().map(VarBind::null).collect(),
        }
    }

    /// Build a GetNextRequest.
    pub fn get_next_request(request_id: i32, oids: &[crate::oid::Oid]) -> Self {
        Self {
            pdu_type: PduType::GetNextRequest,
            request_id,
            field2: 0,
            field3: 0,
            varbinds: oids.iter().cloned().map(VarBind::null).collect(),
        }
    }

    /// Build a SetRequest.
    pub fn set_request(request_id: i32, varbinds: Vec<VarBind>) -> Self {
        Self {
            pdu_type: PduType::SetRequest,
            request_id,
            field2: 0,
            field3: 0,
            varbinds,
        }
    }

    /// Build a GetBulkRequest. Fails `getbulk_requires_v2c` if `version`
    /// is v1, and validates `non_repeaters`/`max_repetitions` are within
    /// `0 .. 2^31-1` (always true for `i32` input, but negative values are
    /// rejected per spec).
    pub fn get_bulk_request(
        version: Version,
        request_id: i32,
        oids: &[crate::oid::Oid],
        non_repeaters: i32,
        max_repetitions: i32,
    ) -> Result<Self> {
        if version == Version::V1 {
            return Err(Error::GetBulkRequiresV2c);
        }
        if non_repeaters < 0 {
            return Err(Error::decode(0, DecodeErrorKind::IntegerOverflow));
        }
        if max_repetitions < 0 {
            return Err(Error::decode(0, DecodeErrorKind::IntegerOverflow));
        }
        Ok(Self {
            pdu_type: PduType::GetBulkRequest,
            request_id,
            field2: non_repeaters,
            field3: max_repetitions,
            varbinds: oids.iter().cloned().map(VarBind::null).collect(),
        })
    }

    /// Build a GetResponse (used by the decode path's normalized view, and
    /// by tests constructing mock server replies).
    pub fn get_response(
        request_id: i32,
        error_status: i32,
        error_index: i32,
        varbinds: Vec<VarBind>,
    ) -> Self {
        Self {
            pdu_type: PduType::GetResponse,
            request_id,
            field2: error_status,
            field3: error_index,
            varbinds,
        }
    }

    pub fn error_status(&self) -> i32 {
        self.field2
    }

    pub fn error_index(&self) -> i32 {
        self.field3
    }

    pub fn non_repeaters(&self) -> i32 {
        self.field2
    }

    pub fn max_repetitions(&self) -> i32 {
        self.field3
    }

    /// Encode this PDU (the context-tagged SEQUENCE only; callers wrap it
    /// in a community or v3 message envelope).
    pub fn encode(&self, buf: &mut EncodeBuf) {
        let pdu_tag = self.pdu_type.tag();
        buf.push_constructed(pdu_tag, |buf| {
            varbind::encode_varbind_list(buf, &self.varbinds);
            buf.push_integer(self.field3);
            buf.push_integer(self.field2);
            buf.push_integer(self.request_id);
        });
    }

    /// Decode a PDU from the front of `decoder`.
    pub fn decode(decoder: &mut Decoder) -> Result<Self> {
        let tag_byte = decoder.peek_tag()?;
        let pdu_type = PduType::from_tag(tag_byte)?;
        let mut body = decoder.read_constructed(tag_byte)?;

        let request_id = body.read_integer()?;
        let field2 = body.read_integer()?;
        let field3 = body.read_integer()?;
        let varbinds = varbind::decode_varbind_list(&mut body)?;

        Ok(Self {
            pdu_type,
            request_id,
            field2,
            field3,
            varbinds,
        })
    }
}
