//! Engine discovery and time synchronization state (RFC 3414 §4).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Instant;

use bytes::Bytes;

use crate::error::{DecodeErrorKind, Error, Result};
use crate::message::{Message, V3Message};
use crate::oid;
use crate::pdu::PduType;

/// Default `msgMaxSize` this crate advertises, comfortably under a single
/// Ethernet-bounded UDP datagram.
pub const DEFAULT_MSG_MAX_SIZE: i32 = 65507;

/// `2^31 - 1`: an engine that reaches this `engineBoots` value is permanently
/// retired per RFC 3414 §2.3.
pub const MAX_ENGINE_TIME: i32 = i32::MAX;

/// Maximum allowed drift (seconds) between a message's `engineTime` and the
/// locally tracked value before it's rejected as outside the time window.
pub const TIME_WINDOW: i32 = 150;

/// usmStatsUnknownEngineIDs.0
fn oid_unknown_engine_id() -> crate::oid::Oid {
    oid!(1, 3, 6, 1, 6, 3, 15, 1, 1, 4, 0)
}

/// usmStatsNotInTimeWindows.0
fn oid_not_in_time_window() -> crate::oid::Oid {
    oid!(1, 3, 6, 1, 6, 3, 15, 1, 1, 2, 0)
}

/// usmStatsUnknownUserNames.0
fn oid_unknown_user_name() -> crate::oid::Oid {
    oid!(1, 3, 6, 1, 6, 3, 15, 1, 1, 3, 0)
}

/// usmStatsUnsupportedSecLevels.0
fn oid_unsupported_sec_level() -> crate::oid::Oid {
    oid!(1, 3, 6, 1, 6, 3, 15, 1, 1, 1, 0)
}

/// usmStatsWrongDigests.0 (not a standard USM counter name but widely used by
/// agents to report HMAC verification failures via a Report PDU).
fn oid_wrong_digest() -> crate::oid::Oid {
    oid!(1, 3, 6, 1, 6, 3, 15, 1, 1, 5, 0)
}

fn report_varbind_oid(msg: &V3Message) -> Option<crate::oid::Oid> {
    let scoped = match &msg.scoped_pdu {
        crate::message::ScopedPduData::Plain(scoped) => scoped,
        crate::message::ScopedPduData::Encrypted(_) => return None,
    };
    if scoped.pdu.pdu_type != PduType::Report {
        return None;
    }
    scoped.pdu.varbinds.first().map(|vb| vb.oid.clone())
}

/// Does this message carry a Report PDU whose single varbind is
/// `usmStatsUnknownEngineIDs`?
pub fn is_unknown_engine_id_report(msg: &V3Message) -> bool {
    report_varbind_oid(msg).is_some_and(|oid| oid == oid_unknown_engine_id())
}

/// Does this message carry a Report PDU whose single varbind is
/// `usmStatsNotInTimeWindows`?
pub fn is_not_in_time_window_report(msg: &V3Message) -> bool {
    report_varbind_oid(msg).is_some_and(|oid| oid == oid_not_in_time_window())
}

/// Does this message carry a Report PDU whose single varbind is
/// `usmStatsUnknownUserNames`?
pub fn is_unknown_user_name_report(msg: &V3Message) -> bool {
    report_varbind_oid(msg).is_some_and(|oid| oid == oid_unknown_user_name())
}

/// Does this message carry a Report PDU whose single varbind is
/// `usmStatsUnsupportedSecLevels`?
pub fn is_unsupported_sec_level_report(msg: &V3Message) -> bool {
    report_varbind_oid(msg).is_some_and(|oid| oid == oid_unsupported_sec_level())
}

/// Does this message carry a Report PDU whose single varbind is
/// `usmStatsWrongDigests`?
pub fn is_wrong_digest_report(msg: &V3Message) -> bool {
    report_varbind_oid(msg).is_some_and(|oid| oid == oid_wrong_digest())
}

/// Is this message a Report PDU at all, of any USM stats kind (decryption
/// errors surface as one of the above, never as a distinct tag)?
pub fn is_decryption_error_report(msg: &V3Message) -> bool {
    is_unknown_engine_id_report(msg)
        || is_not_in_time_window_report(msg)
        || is_unknown_user_name_report(msg)
        || is_unsupported_sec_level_report(msg)
        || is_wrong_digest_report(msg)
}

/// What's known locally about a remote engine: its ID and the most recently
/// observed boots/time pair, used to validate subsequent messages' time
/// windows and to build outgoing requests' `msgAuthoritativeEngine*` fields.
#[derive(Debug, Clone)]
pub struct EngineState {
    pub engine_id: Bytes,
    pub engine_boots: i32,
    pub engine_time: i32,
    /// Local clock reading when `engine_boots`/`engine_time` were captured,
    /// used to extrapolate the authoritative engine's current time.
    pub captured_at: Instant,
}

impl EngineState {
    /// The authoritative engine's estimated current `engineTime`, projecting
    /// forward by how long it's been since this state was captured.
    pub fn estimated_engine_time(&self) -> i32 {
        let elapsed = self.captured_at.elapsed().as_secs() as i64;
        (self.engine_time as i64 + elapsed).min(MAX_ENGINE_TIME as i64) as i32
    }

    /// Validate an incoming message's boots/time against this state: fail
    /// `engine_boots_mismatch` if `|localBoots - msgBoots| > 1` (in either
    /// direction -- a remote that has rebooted ahead of what we've recorded
    /// is just as invalid as one reporting a stale, lower count), otherwise
    /// fail `time_window_exceeded` if `|localTime - msgTime| > `
    /// [`TIME_WINDOW`] seconds, where `localTime` is the local estimate
    /// projected forward to now.
    pub fn validate_time_window(&self, msg_boots: i32, msg_time: i32) -> Result<()> {
        let boots_delta = (msg_boots as i64 - self.engine_boots as i64).unsigned_abs();
        if msg_boots == MAX_ENGINE_TIME || boots_delta > 1 {
            return Err(Error::EngineBootsMismatch { target: None });
        }
        let estimated = self.estimated_engine_time();
        if (msg_time as i64 - estimated as i64).unsigned_abs() > TIME_WINDOW as u64 {
            return Err(Error::NotInTimeWindow { target: None });
        }
        Ok(())
    }

    /// Update local state after successfully authenticating a message with a
    /// boots/time pair at least as advanced as what's already known.
    pub fn advance(&mut self, msg_boots: i32, msg_time: i32) {
        if msg_boots > self.engine_boots
            || (msg_boots == self.engine_boots && msg_time > self.engine_time)
        {
            self.engine_boots = msg_boots;
            self.engine_time = msg_time;
            self.captured_at = Instant::now();
        }
    }
}

/// Parse a discovery probe's response (a Report PDU, or occasionally a bare
/// unauthenticated Response) into the resulting [`EngineState`].
pub fn parse_discovery_response(data: Bytes) -> Result<EngineState> {
    parse_discovery_response_with_limits(data, DEFAULT_MSG_MAX_SIZE)
}

/// As [`parse_discovery_response`], rejecting messages whose `msgMaxSize`
/// claims to exceed `max_accepted_size` (a defense against an agent
/// advertising an implausibly large buffer).
pub fn parse_discovery_response_with_limits(
    data: Bytes,
    max_accepted_size: i32,
) -> Result<EngineState> {
    let message = match Message::decode(data)? {
        Message::V3(msg) => msg,
        Message::Community(_) => {
            return Err(Error::decode(0, DecodeErrorKind::UnknownVersion(0)));
        }
    };

    if message.msg_max_size > max_accepted_size {
        return Err(Error::MessageTooLarge {
            size: message.msg_max_size as usize,
            max: max_accepted_size as usize,
        });
    }

    Ok(EngineState {
        engine_id: message.security_params.engine_id.clone(),
        engine_boots: message.security_params.engine_boots,
        engine_time: message.security_params.engine_time,
        captured_at: Instant::now(),
    })
}

/// Per-target cache of discovered engine state, so repeated requests to the
/// same device skip re-discovery.
///
/// Shared across `Client` clones behind an `Arc`, so every accessor takes
/// `&self` and locks internally rather than requiring exclusive access.
#[derive(Debug, Default)]
pub struct EngineCache {
    entries: Mutex<HashMap<SocketAddr, EngineState>>,
}

impl EngineCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, target: SocketAddr) -> Option<EngineState> {
        self.entries.lock().unwrap().get(&target).cloned()
    }

    pub fn insert(&self, target: SocketAddr, state: EngineState) {
        self.entries.lock().unwrap().insert(target, state);
    }

    pub fn remove(&self, target: SocketAddr) -> Option<EngineState> {
        self.entries.lock().unwrap().remove(&target)
    }
}
