//! SNMP typed value union and human-readable formatting helpers.

use bytes::Bytes;

use crate::ber::tag;
use crate::ber::{Decoder, EncodeBuf};
use crate::error::{DecodeErrorKind, Error, Result};
use crate::oid::Oid;

/// Maximum length for OCTET STRING / Opaque values (RFC range).
pub const MAX_OCTET_STRING_LEN: usize = 65535;

/// A typed SNMP value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Integer(i32),
    OctetString(Bytes),
    Null,
    ObjectIdentifier(Oid),
    Counter32(u32),
    Gauge32(u32),
    TimeTicks(u32),
    Counter64(u64),
    IpAddress([u8; 4]),
    Opaque(Bytes),
    /// v2c exception: requested object type does not exist.
    NoSuchObject,
    /// v2c exception: object exists but this instance does not.
    NoSuchInstance,
    /// v2c exception: walk has exhausted the MIB view.
    EndOfMibView,
}

impl Value {
    /// True for the three v2c exception markers.
    pub fn is_exception(&self) -> bool {
        matches!(
            self,
            Value::NoSuchObject | Value::NoSuchInstance | Value::EndOfMibView
        )
    }

    /// Collapse the "exception nested in the value field" shape some
    /// non-conformant agents produce: an OCTET STRING whose content is
    /// itself a bare zero-length exception TLV (tag `0x80`/`0x81`/`0x82`,
    /// length `0`), rather than using the exception tag as the varbind's
    /// outer type directly. Any other value is returned unchanged.
    pub fn normalize(self) -> Self {
        if let Value::OctetString(bytes) = &self
            && bytes.len() == 2
            && bytes[1] == 0
        {
            match bytes[0] {
                tag::context::NO_SUCH_OBJECT => return Value::NoSuchObject,
                tag::context::NO_SUCH_INSTANCE => return Value::NoSuchInstance,
                tag::context::END_OF_MIB_VIEW => return Value::EndOfMibView,
                _ => {}
            }
        }
        self
    }

    /// The BER tag this value encodes as.
    pub fn tag(&self) -> u8 {
        match self {
            Value::Integer(_) => tag::universal::INTEGER,
            Value::OctetString(_) => tag::universal::OCTET_STRING,
            Value::Null => tag::universal::NULL,
            Value::ObjectIdentifier(_) => tag::universal::OBJECT_IDENTIFIER,
            Value::Counter32(_) => tag::application::COUNTER32,
            Value::Gauge32(_) => tag::application::GAUGE32,
            Value::TimeTicks(_) => tag::application::TIMETICKS,
            Value::Counter64(_) => tag::application::COUNTER64,
            Value::IpAddress(_) => tag::application::IP_ADDRESS,
            Value::Opaque(_) => tag::application::OPAQUE,
            Value::NoSuchObject => tag::context::NO_SUCH_OBJECT,
            Value::NoSuchInstance => tag::context::NO_SUCH_INSTANCE,
            Value::EndOfMibView => tag::context::END_OF_MIB_VIEW,
        }
    }

    /// Encode this value into a reverse-buffer encoder.
    pub fn encode(&self, buf: &mut EncodeBuf) {
        match self {
            Value::Integer(v) => buf.push_integer(*v),
            Value::OctetString(bytes) => buf.push_octet_string(bytes),
            Value::Null => buf.push_null(),
            Value::ObjectIdentifier(oid) => buf.push_oid(oid),
            Value::Counter32(v) => buf.push_unsigned32(tag::application::COUNTER32, *v),
            Value::Gauge32(v) => buf.push_unsigned32(tag::application::GAUGE32, *v),
            Value::TimeTicks(v) => buf.push_unsigned32(tag::application::TIMETICKS, *v),
            Value::Counter64(v) => buf.push_integer64(*v),
            Value::IpAddress(addr) => buf.push_ip_address(*addr),
            Value::Opaque(bytes) => {
                buf.push_bytes(bytes);
                buf.push_length(bytes.len());
                buf.push_tag(tag::application::OPAQUE);
            }
            Value::NoSuchObject => {
                buf.push_length(0);
                buf.push_tag(tag::context::NO_SUCH_OBJECT);
            }
            Value::NoSuchInstance => {
                buf.push_length(0);
                buf.push_tag(tag::context::NO_SUCH_INSTANCE);
            }
            Value::EndOfMibView => {
                buf.push_length(0);
                buf.push_tag(tag::context::END_OF_MIB_VIEW);
            }
        }
    }

    /// Decode a value from the front of a decoder.
    ///
    /// Handles the exception-as-outer-tag shape directly; the other
    /// malformed shape some agents produce (an OCTET STRING wrapping an
    /// inner exception TLV) is normalized afterwards by [`Value::normalize`],
    /// since collapsing it requires inspecting the decoded octet string's
    /// content rather than the outer tag seen here.
    pub fn decode(decoder: &mut Decoder) -> Result<Self> {
        let decoded_tag = decoder.peek_tag()?;
        match decoded_tag {
            tag::universal::INTEGER => Ok(Value::Integer(decoder.read_integer()?)),
            tag::universal::OCTET_STRING => {
                Ok(Value::OctetString(decoder.read_octet_string()?))
            }
            tag::universal::NULL => {
                decoder.read_null()?;
                Ok(Value::Null)
            }
            tag::universal::OBJECT_IDENTIFIER => Ok(Value::ObjectIdentifier(decoder.read_oid()?)),
            tag::application::COUNTER32 => {
                Ok(Value::Counter32(decoder.read_unsigned32(decoded_tag)?))
            }
            tag::application::GAUGE32 => {
                Ok(Value::Gauge32(decoder.read_unsigned32(decoded_tag)?))
            }
            tag::application::TIMETICKS => {
                Ok(Value::TimeTicks(decoder.read_unsigned32(decoded_tag)?))
            }
            tag::application::COUNTER64 => Ok(Value::Counter64(decoder.read_counter64()?)),
            tag::application::IP_ADDRESS => Ok(Value::IpAddress(decoder.read_ip_address()?)),
            tag::application::OPAQUE => Ok(Value::Opaque(
                decoder.read_raw_octet_string(tag::application::OPAQUE)?,
            )),
            tag::context::NO_SUCH_OBJECT => {
                decoder.read_exception_tag(tag::context::NO_SUCH_OBJECT)?;
                Ok(Value::NoSuchObject)
            }
            tag::context::NO_SUCH_INSTANCE => {
                decoder.read_exception_tag(tag::context::NO_SUCH_INSTANCE)?;
                Ok(Value::NoSuchInstance)
            }
            tag::context::END_OF_MIB_VIEW => {
                decoder.read_exception_tag(tag::context::END_OF_MIB_VIEW)?;
                Ok(Value::EndOfMibView)
            }
            other => Err(Error::decode(
                decoder.offset(),
                DecodeErrorKind::UnexpectedTag {
                    expected: 0,
                    actual: other,
                },
            )),
        }
    }

    /// Human-readable formatting for TimeTicks (days/hours/minutes/seconds/centiseconds).
    pub fn format_timeticks(ticks: u32) -> String {
        let centis = ticks % 100;
        let total_seconds = ticks / 100;
        let seconds = total_seconds % 60;
        let total_minutes = total_seconds / 60;
        let minutes = total_minutes % 60;
        let total_hours = total_minutes / 60;
        let hours = total_hours % 24;
        let days = total_hours / 24;

        if days > 0 {
            format!(
                "{}d {:02}h {:02}m {:02}.{:02}s",
                days, hours, minutes, seconds, centis
            )
        } else if hours > 0 {
            format!("{:02}h {:02}m {:02}.{:02}s", hours, minutes, seconds, centis)
        } else if minutes > 0 {
            format!("{:02}m {:02}.{:02}s", minutes, seconds, centis)
        } else {
            format!("{}.{:02}s", seconds, centis)
        }
    }

    /// Human-readable byte count using binary-ish decimal units (B/KB/MB/GB).
    pub fn format_bytes(value: u64) -> String {
        const UNITS: &[&str] = &["B", "KB", "MB", "GB"];
        format_scaled(value as f64, UNITS)
    }

    /// Human-readable bit rate (bps/Kbps/Mbps/Gbps), typically used on
    /// Counter32/64 deltas over a polling interval.
    pub fn format_rate_bps(bits_per_sec: f64) -> String {
        const UNITS: &[&str] = &["bps", "Kbps", "Mbps", "Gbps"];
        format_scaled(bits_per_sec, UNITS)
    }
}

fn format_scaled(mut value: f64, units: &[&str]) -> String {
    let mut idx = 0;
    while value >= 1000.0 && idx < units.len() - 1 {
        value /= 1000.0;
        idx += 1;
    }
    if idx == 0 {
        format!("{:.0} {}", value, units[idx])
    } else {
        format!("{:.2} {}", value, units[idx])
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Integer(v) => write!(f, "{}", v),
            Value::OctetString(bytes) => match std::str::from_utf8(bytes) {
                Ok(s) if s.chars().all(|c| !c.is_control() || c == '\t') => write!(f, "{}", s),
                _ => write!(f, "{}", crate::util::HexBytes(bytes)),
            },
            Value::Null => write!(f, "NULL"),
            Value::ObjectIdentifier(oid) => write!(f, "{}", oid),
            Value::Counter32(v) => write!(f, "{}", v),
            Value::Gauge32(v) => write!(f, "{}", v),
            Value::TimeTicks(v) => write!(f, "{} ({})", v, Value::format_timeticks(*v)),
            Value::Counter64(v) => write!(f, "{}", v),
            Value::IpAddress([a, b, c, d]) => write!(f, "{}.{}.{}.{}", a, b, c, d),
            Value::Opaque(bytes) => write!(f, "{}", crate::util::HexBytes(bytes)),
            Value::NoSuchObject => write!(f, "noSuchObject"),
            Value::NoSuchInstance => write!(f, "noSuchInstance"),
            Value::EndOfMibView => write!(f, "endOfMibView"),
        }
    }
}

/// Infer a [`Value`] variant for an untagged input, per spec §4.B:
/// integer range selects `Integer` vs `Counter32`-style `Unsigned32` (here
/// represented as `Gauge32`, the generic RFC Unsigned32 tag) vs `Counter64`;
/// a dotted-quad string becomes `IpAddress`; a list of non-negative
/// integers of length >= 2 becomes an OID; printable bytes become
/// `OctetString`, otherwise `Opaque`.
pub enum InferInput<'a> {
    Integer(i64),
    Text(&'a str),
    Bytes(&'a [u8]),
    Arcs(&'a [u64]),
}

pub fn infer_value(input: InferInput<'_>) -> Value {
    match input {
        InferInput::Integer(n) => {
            if let Ok(i) = i32::try_from(n) {
                Value::Integer(i)
            } else if n >= 0 && n <= u32::MAX as i64 {
                Value::Gauge32(n as u32)
            } else if n >= 0 {
                Value::Counter64(n as u64)
            } else {
                Value::Integer(n as i32)
            }
        }
        InferInput::Text(s) => {
            if let Some(addr) = parse_ipv4_dotted_quad(s) {
                Value::IpAddress(addr)
            } else {
                Value::OctetString(Bytes::copy_from_slice(s.as_bytes()))
            }
        }
        InferInput::Bytes(b) => {
            if b.iter().all(|&c| (0x20..0x7f).contains(&c) || c == b'\t') {
                Value::OctetString(Bytes::copy_from_slice(b))
            } else {
                Value::Opaque(Bytes::copy_from_slice(b))
            }
        }
        InferInput::Arcs(arcs) => {
            if arcs.len() >= 2 {
                Value::ObjectIdentifier(
                    Oid::new(arcs.to_vec()).unwrap_or_else(|_| crate::oid!(0, 0)),
                )
            } else {
                Value::OctetString(Bytes::new())
            }
        }
    }
}

fn parse_ipv4_dotted_quad(s: &str) -> Option<[u8; 4]> {
    let parts: Vec<&str> = s.split('.').collect();
    if parts.len() != 4 {
        return None;
    }
    let mut out = [0u8; 4];
    for (i, p) in parts.iter().enumerate() {
        out[i] = p.parse::<u8>().ok()?;
    }
    Some(out)
}
