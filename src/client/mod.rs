//! The SNMP client: request engine, typestate builders, and walk streams.
//!
//! A [`Client`] is bound to one target and one version/security configuration
//! at construction time (via [`builder`]'s typestate builders); per-call
//! [`RequestOptions`] overlay only the parameters that make sense to vary
//! between individual requests (community, timeout, retries, bulk sizing).

mod builder;
mod table;
mod walk;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use getrandom::fill;
use tokio::sync::Mutex as AsyncMutex;

use crate::error::{AuthErrorKind, Error, ErrorStatus, Result};
use crate::message::{CommunityMessage, MsgFlags, ScopedPdu, ScopedPduData};
use crate::oid::Oid;
use crate::pdu::{Pdu, PduType};
use crate::transport::Transport;
use crate::v3::{
    self, AuthProtocol, EngineCache, EngineState, LocalizedKey, PrivKey, PrivProtocol, SaltCounter,
    UsmSecurityParams,
};
use crate::value::Value;
use crate::varbind::VarBind;
use crate::version::Version;

pub use builder::{
    V1ClientBuilder, V2cClientBuilder, V3AuthClientBuilder, V3AuthPrivClientBuilder, V3ClientBuilder,
};
pub use table::{TableSizeEstimate, Walker};
pub use walk::{BulkWalk, Walk};

/// Base delay for retry backoff; doubled per attempt and jittered, capped at
/// [`BACKOFF_MAX`].
const BACKOFF_BASE_MS: u64 = 100;
const BACKOFF_MAX_MS: u64 = 5_000;
const JITTER_FACTOR: f64 = 0.2;

fn random_request_id() -> i32 {
    let mut buf = [0u8; 4];
    let _ = fill(&mut buf);
    (i32::from_be_bytes(buf) & 0x7FFF_FFFF).max(1)
}

fn backoff_delay(attempt: u32) -> Duration {
    let exp = BACKOFF_BASE_MS.saturating_mul(1u64 << attempt.saturating_sub(1).min(10));
    let capped = exp.min(BACKOFF_MAX_MS);
    let jitter_range = (capped as f64 * JITTER_FACTOR) as i64;
    let millis = if jitter_range > 0 {
        let mut buf = [0u8; 8];
        let _ = fill(&mut buf);
        let raw = u64::from_be_bytes(buf);
        let jitter = (raw % (2 * jitter_range as u64 + 1)) as i64 - jitter_range;
        (capped as i64 + jitter).max(0) as u64
    } else {
        capped
    };
    Duration::from_millis(millis)
}

/// Security configuration for a v3 client, built incrementally by
/// [`V3ClientBuilder`]/[`V3AuthClientBuilder`]/[`V3AuthPrivClientBuilder`].
#[derive(Debug, Clone)]
pub struct V3SecurityConfig {
    username: Bytes,
    auth: Option<(AuthProtocol, Vec<u8>)>,
    privacy: Option<(PrivProtocol, Vec<u8>)>,
}

impl V3SecurityConfig {
    pub fn new(username: impl Into<Bytes>) -> Self {
        Self {
            username: username.into(),
            auth: None,
            privacy: None,
        }
    }

    pub fn auth(mut self, protocol: AuthProtocol, password: impl Into<Vec<u8>>) -> Self {
        self.auth = Some((protocol, password.into()));
        self
    }

    pub fn privacy(mut self, protocol: PrivProtocol, password: impl Into<Vec<u8>>) -> Self {
        self.privacy = Some((protocol, password.into()));
        self
    }

    fn requires_auth(&self) -> bool {
        self.auth.is_some()
    }

    fn requires_priv(&self) -> bool {
        self.privacy.is_some()
    }
}

/// Configuration baked into a [`Client`] at construction time by its builder.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub version: Version,
    pub community: Bytes,
    pub timeout: Duration,
    pub retries: u32,
    pub max_oids_per_request: usize,
    pub v3_security: Option<V3SecurityConfig>,
}

/// Per-call overlay onto a [`ClientConfig`]'s defaults.
///
/// `version`, `port`, and `local_port` aren't present here: a `Client` is
/// bound to one resolved peer and one protocol version by its typestate
/// builder, so there's nothing for a later call to overlay. What can vary
/// per call -- community, timeout, retry count, and GETBULK sizing -- does.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub community: Option<Bytes>,
    pub timeout: Option<Duration>,
    pub retries: Option<u32>,
    pub max_repetitions: Option<i32>,
    pub non_repeaters: Option<i32>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn community(mut self, community: &[u8]) -> Self {
        self.community = Some(Bytes::copy_from_slice(community));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn max_repetitions(mut self, max_repetitions: i32) -> Self {
        self.max_repetitions = Some(max_repetitions);
        self
    }

    pub fn non_repeaters(mut self, non_repeaters: i32) -> Self {
        self.non_repeaters = Some(non_repeaters);
        self
    }
}

/// Per-target v3 runtime state: discovered engine, derived keys, and the
/// privacy salt counter. Shared across all clones of a `Client` so engine
/// discovery and key derivation happen once per session.
#[derive(Default)]
struct V3Session {
    engine: Option<EngineState>,
    auth_key: Option<LocalizedKey>,
    priv_key_material: Option<Vec<u8>>,
    salt_counter: SaltCounter,
}

/// An SNMP manager bound to one target, one version, and (for v3) one
/// security configuration.
///
/// Construct via [`Client::v1`], [`Client::v2c`], or [`Client::v3`] (see
/// [`builder`]). Cloning is cheap: the transport, request-id counter, and
/// v3 session state are all held behind `Arc`.
pub struct Client<T: Transport> {
    transport: T,
    config: ClientConfig,
    request_id: Arc<AtomicI32>,
    v3_session: Option<Arc<AsyncMutex<V3Session>>>,
    engine_cache: Option<Arc<EngineCache>>,
}

impl<T: Transport> Clone for Client<T> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            config: self.config.clone(),
            request_id: Arc::clone(&self.request_id),
            v3_session: self.v3_session.clone(),
            engine_cache: self.engine_cache.clone(),
        }
    }
}

impl<T: Transport> Client<T> {
    /// Wrap a transport and configuration into a client.
    pub fn new(transport: T, config: ClientConfig) -> Self {
        let v3_session = config
            .v3_security
            .is_some()
            .then(|| Arc::new(AsyncMutex::new(V3Session::default())));
        Self {
            transport,
            config,
            request_id: Arc::new(AtomicI32::new(random_request_id())),
            v3_session,
            engine_cache: None,
        }
    }

    /// As [`Client::new`], sharing a [`EngineCache`] across clients so
    /// repeated targets skip re-discovery.
    pub fn with_engine_cache(transport: T, config: ClientConfig, cache: Arc<EngineCache>) -> Self {
        let mut client = Self::new(transport, config);
        client.engine_cache = Some(cache);
        client
    }

    /// The resolved peer this client sends to.
    pub fn target(&self) -> SocketAddr {
        self.transport.peer_addr()
    }

    /// The protocol version this client is bound to.
    pub fn version(&self) -> Version {
        self.config.version
    }

    /// A table-walking helper bound to this client, with the default
    /// GETBULK chunk size.
    pub fn walker(&self) -> table::Walker<T>
    where
        T: 'static,
    {
        table::Walker::new(self.clone())
    }

    fn next_request_id(&self) -> i32 {
        self.transport
            .alloc_request_id()
            .unwrap_or_else(|| self.request_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Start a GETNEXT-based walk of `oid`'s subtree.
    pub fn walk(&self, oid: Oid) -> Walk<T> {
        Walk::new(self.clone(), oid)
    }

    /// Start a GETBULK-based walk of `oid`'s subtree.
    pub fn bulk_walk(&self, oid: Oid, max_repetitions: i32) -> BulkWalk<T> {
        BulkWalk::new(self.clone(), oid, max_repetitions)
    }

    /// Fetch a single OID.
    pub async fn get(&self, oid: &Oid) -> Result<VarBind> {
        self.get_opts(oid, &RequestOptions::default()).await
    }

    pub async fn get_opts(&self, oid: &Oid, opts: &RequestOptions) -> Result<VarBind> {
        let oids = std::slice::from_ref(oid);
        let pdu = Pdu::get_request(0, oids);
        let response = self.send_recv_pdu(pdu, opts).await?;
        self.handle_get_response(true, response, oids)?
            .pop()
            .ok_or_else(|| Error::invalid_response("empty varbind list"))
    }

    /// Fetch the lexicographic successor of `oid`.
    ///
    /// Under v1 this issues a true GetNextRequest; under v2c/v3 it issues a
    /// GetBulkRequest with `non_repeaters=0, max_repetitions=1`, which is
    /// equivalent but lets the agent skip its own GetNext dispatch.
    pub async fn get_next(&self, oid: &Oid) -> Result<VarBind> {
        self.get_next_opts(oid, &RequestOptions::default()).await
    }

    pub async fn get_next_opts(&self, oid: &Oid, opts: &RequestOptions) -> Result<VarBind> {
        let oids = std::slice::from_ref(oid);
        let pdu = match self.config.version {
            Version::V1 => Pdu::get_next_request(0, oids),
            _ => Pdu::get_bulk_request(self.config.version, 0, oids, 0, 1)?,
        };
        let response = self.send_recv_pdu(pdu, opts).await?;
        self.handle_get_response(true, response, oids)?
            .pop()
            .ok_or_else(|| Error::invalid_response("empty varbind list"))
    }

    /// Fetch up to `max_repetitions` successors per requested OID.
    pub async fn get_bulk(
        &self,
        oids: &[Oid],
        non_repeaters: i32,
        max_repetitions: i32,
    ) -> Result<Vec<VarBind>> {
        self.get_bulk_opts(oids, non_repeaters, max_repetitions, &RequestOptions::default())
            .await
    }

    pub async fn get_bulk_opts(
        &self,
        oids: &[Oid],
        non_repeaters: i32,
        max_repetitions: i32,
        opts: &RequestOptions,
    ) -> Result<Vec<VarBind>> {
        let non_repeaters = opts.non_repeaters.unwrap_or(non_repeaters);
        let max_repetitions = opts.max_repetitions.unwrap_or(max_repetitions);
        let pdu = Pdu::get_bulk_request(self.config.version, 0, oids, non_repeaters, max_repetitions)?;
        let response = self.send_recv_pdu(pdu, opts).await?;
        self.handle_get_response(false, response, oids)
    }

    /// Set one or more varbinds, returning the agent's echoed values.
    pub async fn set(&self, varbinds: Vec<VarBind>) -> Result<Vec<VarBind>> {
        self.set_opts(varbinds, &RequestOptions::default()).await
    }

    pub async fn set_opts(&self, varbinds: Vec<VarBind>, opts: &RequestOptions) -> Result<Vec<VarBind>> {
        let oids: Vec<Oid> = varbinds.iter().map(|vb| vb.oid.clone()).collect();
        let pdu = Pdu::set_request(0, varbinds);
        let response = self.send_recv_pdu(pdu, opts).await?;
        self.handle_get_response(false, response, &oids)
    }

    /// Fetch several OIDs, splitting into chunks of `max_oids_per_request`.
    pub async fn get_multi(&self, oids: &[Oid]) -> Result<Vec<VarBind>> {
        self.get_multi_opts(oids, &RequestOptions::default()).await
    }

    pub async fn get_multi_opts(&self, oids: &[Oid], opts: &RequestOptions) -> Result<Vec<VarBind>> {
        if oids.is_empty() {
            return Ok(Vec::new());
        }
        let chunk_size = self.config.max_oids_per_request.max(1);
        let mut results = Vec::with_capacity(oids.len());
        for chunk in oids.chunks(chunk_size) {
            let pdu = Pdu::get_request(0, chunk);
            let response = self.send_recv_pdu(pdu, opts).await?;
            results.extend(self.handle_get_response(true, response, chunk)?);
        }
        Ok(results)
    }

    /// Check reachability by fetching `sysDescr.0`. Any response from the
    /// agent -- including one carrying an SNMP error status -- counts as
    /// reachable; only transport-level failures are reported.
    pub async fn ping(&self) -> Result<()> {
        self.ping_opts(&RequestOptions::default()).await
    }

    pub async fn ping_opts(&self, opts: &RequestOptions) -> Result<()> {
        let sys_descr = Oid::from_slice(&[1, 3, 6, 1, 2, 1, 1, 1, 0]);
        match self.get_opts(&sys_descr, opts).await {
            Ok(_) => Ok(()),
            Err(Error::Snmp { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Surface `error_status != 0` as an error before the caller ever sees
    /// varbinds, per the error-status handling this engine implements.
    ///
    /// `genErr` from a single-OID GET/GETNEXT is re-interpreted: under v1 as
    /// `noSuchName`, under v2c+ as a successful response carrying
    /// `NoSuchObject` at the requested OID (matching how v2c+ agents signal
    /// the same condition natively). Multi-OID requests and non-GET PDUs
    /// (GETBULK, SET) surface `genErr` unmodified.
    fn handle_get_response(
        &self,
        is_single_get: bool,
        pdu: Pdu,
        request_oids: &[Oid],
    ) -> Result<Vec<VarBind>> {
        let status = pdu.error_status();
        if status == 0 {
            return Ok(pdu.varbinds);
        }

        let mapped = ErrorStatus::from_i32(status);
        let index = pdu.error_index();
        let oid = if index >= 1 {
            request_oids.get(index as usize - 1).cloned()
        } else {
            None
        };

        if is_single_get && request_oids.len() == 1 && matches!(mapped, ErrorStatus::GenErr) {
            return match self.config.version {
                Version::V1 => Err(Error::Snmp {
                    target: Some(self.transport.peer_addr()),
                    status: ErrorStatus::NoSuchName,
                    index: index as u32,
                    oid,
                }),
                _ => Ok(vec![VarBind::new(request_oids[0].clone(), Value::NoSuchObject)]),
            };
        }

        Err(Error::Snmp {
            target: Some(self.transport.peer_addr()),
            status: mapped,
            index: index as u32,
            oid,
        })
    }

    /// Send `pdu`, retrying transient failures up to `opts`/config's retry
    /// count with exponential backoff. Each attempt gets a fresh request ID:
    /// a response to an earlier attempt that arrives after we've moved on
    /// is just another stray datagram as far as the transport is concerned.
    async fn send_recv_pdu(&self, pdu: Pdu, opts: &RequestOptions) -> Result<Pdu> {
        let timeout = opts.timeout.unwrap_or(self.config.timeout);
        let retries = opts.retries.unwrap_or(self.config.retries);

        let mut attempt = 0u32;
        loop {
            if attempt > 0 {
                tokio::time::sleep(backoff_delay(attempt)).await;
            }

            let request_id = self.next_request_id();
            let mut this_pdu = pdu.clone();
            this_pdu.request_id = request_id;

            match self.try_once(this_pdu, opts, timeout, request_id).await {
                Ok(response) => return Ok(response),
                Err(err) => {
                    let retryable = !self.transport.is_stream()
                        && attempt < retries
                        && (err.is_transient()
                            || matches!(
                                err,
                                Error::UnknownEngineId { .. }
                                    | Error::NotInTimeWindow { .. }
                                    | Error::EngineBootsMismatch { .. }
                            ));
                    if !retryable {
                        return Err(err);
                    }
                    tracing::debug!(
                        snmp.target = %self.transport.peer_addr(),
                        snmp.attempt = attempt,
                        snmp.request_id = request_id,
                        error = %err,
                        "retrying SNMP request"
                    );
                    attempt += 1;
                }
            }
        }
    }

    async fn try_once(
        &self,
        pdu: Pdu,
        opts: &RequestOptions,
        timeout: Duration,
        request_id: i32,
    ) -> Result<Pdu> {
        let response_pdu = match &self.config.v3_security {
            None => {
                let community = opts
                    .community
                    .clone()
                    .unwrap_or_else(|| self.config.community.clone());
                let msg = CommunityMessage::new(self.config.version, community, pdu);
                let bytes = msg.encode();
                tracing::trace!(snmp.request_id = request_id, snmp.target = %self.transport.peer_addr(), "sending SNMP request");
                self.transport.send(&bytes).await?;
                let (response, _from) = self.transport.recv(request_id, timeout).await?;
                let decoded = CommunityMessage::decode(response)?;
                if decoded.version != self.config.version {
                    return Err(Error::VersionMismatch {
                        expected: self.config.version,
                        actual: decoded.version,
                    });
                }
                if decoded.pdu.request_id != request_id {
                    return Err(Error::RequestIdMismatch {
                        expected: request_id,
                        actual: decoded.pdu.request_id,
                    });
                }
                decoded.pdu
            }
            Some(security) => {
                let (bytes, engine, auth_key, priv_key_material) =
                    self.build_v3_request(security, pdu, request_id).await?;
                self.transport.send(&bytes).await?;
                let (response, _from) = self.transport.recv(request_id, timeout).await?;
                self.decode_v3_response(
                    security,
                    &engine,
                    auth_key.as_ref(),
                    priv_key_material.as_deref(),
                    response,
                    request_id,
                )
                .await?
            }
        };

        if response_pdu.pdu_type != PduType::GetResponse {
            return Err(Error::invalid_response("expected a GetResponse PDU"));
        }
        Ok(response_pdu)
    }

    /// Ensure the v3 engine is discovered and this session's keys are
    /// derived, discovering/deriving on first use and caching afterward.
    async fn ensure_v3_ready(
        &self,
        security: &V3SecurityConfig,
    ) -> Result<(EngineState, Option<LocalizedKey>, Option<Vec<u8>>)> {
        let session = self
            .v3_session
            .as_ref()
            .expect("ensure_v3_ready only called when v3_security is configured");

        {
            let guard = session.lock().await;
            if let Some(engine) = &guard.engine {
                return Ok((
                    engine.clone(),
                    guard.auth_key.clone(),
                    guard.priv_key_material.clone(),
                ));
            }
        }

        let cached = self
            .engine_cache
            .as_ref()
            .and_then(|cache| cache.get(self.transport.peer_addr()));
        let engine = match cached {
            Some(engine) => engine,
            None => {
                tracing::debug!(snmp.target = %self.transport.peer_addr(), "discovering SNMPv3 engine");
                let engine = self.discover_engine(security).await?;
                if let Some(cache) = &self.engine_cache {
                    cache.insert(self.transport.peer_addr(), engine.clone());
                }
                engine
            }
        };

        let mut guard = session.lock().await;
        guard.engine = Some(engine.clone());

        if let Some((auth_protocol, password)) = &security.auth {
            if guard.auth_key.is_none() {
                guard.auth_key = Some(LocalizedKey::from_password(*auth_protocol, password, &engine.engine_id));
            }
            if let Some((priv_protocol, priv_password)) = &security.privacy {
                if guard.priv_key_material.is_none() {
                    let localized_priv =
                        LocalizedKey::from_password(*auth_protocol, priv_password, &engine.engine_id);
                    let material = match priv_protocol.key_extension_for(*auth_protocol) {
                        v3::KeyExtension::None => {
                            localized_priv.as_bytes()[..priv_protocol.key_len()].to_vec()
                        }
                        v3::KeyExtension::Blumenthal => {
                            v3::auth::extend_key(*auth_protocol, &localized_priv, priv_protocol.key_len())?
                        }
                    };
                    guard.priv_key_material = Some(material);
                }
            }
        }

        Ok((engine, guard.auth_key.clone(), guard.priv_key_material.clone()))
    }

    /// Send an unauthenticated probe PDU to learn the target's engine ID,
    /// per RFC 3414 engine discovery.
    async fn discover_engine(&self, security: &V3SecurityConfig) -> Result<EngineState> {
        let msg_id = self.next_request_id();
        let scoped = ScopedPdu {
            context_engine_id: Bytes::new(),
            context_name: Bytes::new(),
            pdu: Pdu::get_request(msg_id, &[]),
        };
        let usm = UsmSecurityParams {
            engine_id: Bytes::new(),
            engine_boots: 0,
            engine_time: 0,
            user_name: security.username.clone(),
            auth_params: Bytes::new(),
            priv_params: Bytes::new(),
        };
        let msg = crate::message::V3Message {
            msg_id,
            msg_max_size: v3::DEFAULT_MSG_MAX_SIZE,
            flags: MsgFlags {
                auth: false,
                priv_: false,
                reportable: true,
            },
            security_params: usm,
            scoped_pdu: ScopedPduData::Plain(scoped),
        };
        let (bytes, _) = msg.encode();
        self.transport.send(&bytes).await?;
        let (response, _from) = self.transport.recv(msg_id, self.config.timeout).await?;
        v3::parse_discovery_response(response)
    }

    /// Build and sign/encrypt a v3 request, returning the wire bytes plus
    /// the engine/key state used to build it (handed back to the caller so
    /// the matching response can be validated against exactly that state).
    async fn build_v3_request(
        &self,
        security: &V3SecurityConfig,
        pdu: Pdu,
        msg_id: i32,
    ) -> Result<(Vec<u8>, EngineState, Option<LocalizedKey>, Option<Vec<u8>>)> {
        let (engine, auth_key, priv_key_material) = self.ensure_v3_ready(security).await?;

        let scoped = ScopedPdu {
            context_engine_id: engine.engine_id.clone(),
            context_name: Bytes::new(),
            pdu,
        };

        let (scoped_data, priv_params) = if security.requires_priv() {
            let (priv_protocol, _) = security.privacy.as_ref().unwrap();
            let material = priv_key_material
                .clone()
                .ok_or_else(|| Error::encrypt(Some(self.transport.peer_addr()), crate::error::CryptoErrorKind::NoPrivKey))?;
            let key = PrivKey::new(*priv_protocol, material)
                .map_err(|e| Error::encrypt(Some(self.transport.peer_addr()), e.0))?;
            let salt = {
                let session = self.v3_session.as_ref().unwrap().lock().await;
                session.salt_counter.next()
            };
            let (ciphertext, params) = key
                .encrypt(
                    engine.engine_boots,
                    engine.estimated_engine_time(),
                    salt,
                    &scoped.to_bytes(),
                )
                .map_err(|e| Error::encrypt(Some(self.transport.peer_addr()), e.0))?;
            (ScopedPduData::Encrypted(Bytes::from(ciphertext)), Bytes::copy_from_slice(&params))
        } else {
            (ScopedPduData::Plain(scoped), Bytes::new())
        };

        let mac_len = security.auth.as_ref().map(|(p, _)| p.mac_len()).unwrap_or(0);
        let usm = UsmSecurityParams {
            engine_id: engine.engine_id.clone(),
            engine_boots: engine.engine_boots,
            engine_time: engine.estimated_engine_time(),
            user_name: security.username.clone(),
            auth_params: Bytes::from(vec![0u8; mac_len]),
            priv_params,
        };

        let msg = crate::message::V3Message {
            msg_id,
            msg_max_size: v3::DEFAULT_MSG_MAX_SIZE,
            flags: MsgFlags {
                auth: security.requires_auth(),
                priv_: security.requires_priv(),
                reportable: true,
            },
            security_params: usm,
            scoped_pdu: scoped_data,
        };

        let (mut bytes, auth_offset) = msg.encode();
        if let Some(offset) = auth_offset {
            let (auth_protocol, _) = security.auth.as_ref().unwrap();
            let key = auth_key
                .clone()
                .ok_or_else(|| Error::encode(crate::error::EncodeErrorKind::MissingAuthKey))?;
            let tag = key.sign(*auth_protocol, &bytes);
            bytes[offset..offset + auth_protocol.mac_len()].copy_from_slice(&tag);
        }

        Ok((bytes, engine, auth_key, priv_key_material))
    }

    /// Validate and unwrap a v3 response against the engine/key state that
    /// was used to build the request it's answering.
    async fn decode_v3_response(
        &self,
        security: &V3SecurityConfig,
        engine: &EngineState,
        auth_key: Option<&LocalizedKey>,
        priv_key_material: Option<&[u8]>,
        data: Bytes,
        expected_msg_id: i32,
    ) -> Result<Pdu> {
        let target = Some(self.transport.peer_addr());
        let (v3msg, auth_offset) = crate::message::V3Message::decode_with_auth_offset(data.clone())?;

        if v3::is_unknown_engine_id_report(&v3msg) {
            if let Some(session) = &self.v3_session {
                session.lock().await.engine = None;
            }
            if let Some(cache) = &self.engine_cache {
                cache.remove(self.transport.peer_addr());
            }
            return Err(Error::UnknownEngineId { target });
        }
        if v3::is_not_in_time_window_report(&v3msg) {
            return Err(Error::NotInTimeWindow { target });
        }
        if v3::is_unknown_user_name_report(&v3msg) {
            return Err(Error::auth(target, AuthErrorKind::NoUser));
        }
        if v3::is_unsupported_sec_level_report(&v3msg) {
            return Err(Error::auth(target, AuthErrorKind::NoCredentials));
        }
        if v3::is_wrong_digest_report(&v3msg) {
            return Err(Error::auth(target, AuthErrorKind::HmacMismatch));
        }

        if v3msg.msg_id != expected_msg_id {
            return Err(Error::RequestIdMismatch {
                expected: expected_msg_id,
                actual: v3msg.msg_id,
            });
        }

        let mut engine = engine.clone();

        if v3msg.flags.auth {
            let (auth_protocol, _) = security
                .auth
                .as_ref()
                .ok_or_else(|| Error::auth(target, AuthErrorKind::NoCredentials))?;
            let auth_key = auth_key.ok_or_else(|| Error::auth(target, AuthErrorKind::NoAuthKey))?;
            let offset = auth_offset.ok_or_else(|| Error::auth(target, AuthErrorKind::AuthParamsNotFound))?;
            let mac_len = auth_protocol.mac_len();
            let mut zeroed = data.to_vec();
            zeroed[offset..offset + mac_len].fill(0);
            auth_key
                .verify(*auth_protocol, &zeroed, &v3msg.security_params.auth_params)
                .map_err(|_| Error::auth(target, AuthErrorKind::HmacMismatch))?;

            engine
                .validate_time_window(v3msg.security_params.engine_boots, v3msg.security_params.engine_time)
                .map_err(|err| match err {
                    Error::EngineBootsMismatch { .. } => Error::EngineBootsMismatch { target },
                    _ => Error::NotInTimeWindow { target },
                })?;
            engine.advance(v3msg.security_params.engine_boots, v3msg.security_params.engine_time);

            if let Some(session) = &self.v3_session {
                session.lock().await.engine = Some(engine.clone());
            }
            if let Some(cache) = &self.engine_cache {
                cache.insert(self.transport.peer_addr(), engine.clone());
            }
        }

        let scoped = match v3msg.scoped_pdu {
            ScopedPduData::Plain(scoped) => scoped,
            ScopedPduData::Encrypted(ciphertext) => {
                let (priv_protocol, _) = security
                    .privacy
                    .as_ref()
                    .ok_or_else(|| Error::decrypt(target, crate::error::CryptoErrorKind::NoPrivKey))?;
                let material = priv_key_material
                    .ok_or_else(|| Error::decrypt(target, crate::error::CryptoErrorKind::NoPrivKey))?;
                let key = PrivKey::new(*priv_protocol, material.to_vec())
                    .map_err(|e| Error::decrypt(target, e.0))?;
                let plaintext = key
                    .decrypt(
                        v3msg.security_params.engine_boots,
                        v3msg.security_params.engine_time,
                        &v3msg.security_params.priv_params,
                        &ciphertext,
                    )
                    .map_err(|e| Error::decrypt(target, e.0))?;
                ScopedPdu::from_bytes(Bytes::from(plaintext))?
            }
        };

        Ok(scoped.pdu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oid;
    use crate::transport::{MockTransport, ResponseBuilder};

    fn mock_client(mock: MockTransport, version: Version) -> Client<MockTransport> {
        let config = ClientConfig {
            version,
            community: Bytes::from_static(b"public"),
            timeout: Duration::from_millis(200),
            retries: 2,
            max_oids_per_request: 2,
            v3_security: None,
        };
        Client::new(mock, config)
    }

    #[tokio::test]
    async fn test_get_returns_varbind() {
        let mock = MockTransport::new("127.0.0.1:161".parse().unwrap());
        mock.queue_response(
            ResponseBuilder::new(1)
                .varbind(oid!(1, 3, 6, 1, 2, 1, 1, 1, 0), Value::OctetString("widget".into()))
                .build_v2c(b"public"),
        );
        let client = mock_client(mock, Version::V2c);
        let vb = client.get(&oid!(1, 3, 6, 1, 2, 1, 1, 1, 0)).await.unwrap();
        assert_eq!(vb.value, Value::OctetString("widget".into()));
    }

    #[tokio::test]
    async fn test_get_surfaces_snmp_error_status() {
        let mock = MockTransport::new("127.0.0.1:161".parse().unwrap());
        mock.queue_response(ResponseBuilder::new(1).error(2, 1).build_v2c(b"public"));
        let client = mock_client(mock, Version::V2c);
        let err = client.get(&oid!(1, 3, 6, 1, 2, 1, 1, 1, 0)).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Snmp {
                status: ErrorStatus::NoSuchName,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_gen_err_reinterpreted_as_no_such_object_on_v2c() {
        let mock = MockTransport::new("127.0.0.1:161".parse().unwrap());
        mock.queue_response(ResponseBuilder::new(1).error(5, 1).build_v2c(b"public"));
        let client = mock_client(mock, Version::V2c);
        let vb = client.get(&oid!(1, 3, 6, 1, 2, 1, 1, 1, 0)).await.unwrap();
        assert_eq!(vb.value, Value::NoSuchObject);
    }

    #[tokio::test]
    async fn test_gen_err_reinterpreted_as_no_such_name_on_v1() {
        let mock = MockTransport::new("127.0.0.1:161".parse().unwrap());
        mock.queue_response(ResponseBuilder::new(1).error(5, 1).build_v1(b"public"));
        let client = mock_client(mock, Version::V1);
        let err = client.get(&oid!(1, 3, 6, 1, 2, 1, 1, 1, 0)).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Snmp {
                status: ErrorStatus::NoSuchName,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_retries_on_timeout_then_succeeds() {
        let mock = MockTransport::new("127.0.0.1:161".parse().unwrap());
        mock.queue_timeout();
        mock.queue_response(
            ResponseBuilder::new(1)
                .varbind(oid!(1, 3, 6, 1, 2, 1, 1, 1, 0), Value::OctetString("ok".into()))
                .build_v2c(b"public"),
        );
        let client = mock_client(mock, Version::V2c);
        let vb = client.get(&oid!(1, 3, 6, 1, 2, 1, 1, 1, 0)).await.unwrap();
        assert_eq!(vb.value, Value::OctetString("ok".into()));
    }

    #[tokio::test]
    async fn test_exhausts_retries_and_returns_timeout() {
        let mock = MockTransport::new("127.0.0.1:161".parse().unwrap());
        mock.queue_timeout();
        mock.queue_timeout();
        mock.queue_timeout();
        let client = mock_client(mock, Version::V2c);
        let err = client.get(&oid!(1, 3, 6, 1, 2, 1, 1, 1, 0)).await.unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_get_multi_splits_into_chunks() {
        let mock = MockTransport::new("127.0.0.1:161".parse().unwrap());
        mock.queue_response(
            ResponseBuilder::new(1)
                .varbind(oid!(1, 3, 6, 1, 2, 1, 1, 1, 0), Value::OctetString("a".into()))
                .varbind(oid!(1, 3, 6, 1, 2, 1, 1, 2, 0), Value::OctetString("b".into()))
                .build_v2c(b"public"),
        );
        mock.queue_response(
            ResponseBuilder::new(2)
                .varbind(oid!(1, 3, 6, 1, 2, 1, 1, 3, 0), Value::TimeTicks(5))
                .build_v2c(b"public"),
        );
        let client = mock_client(mock, Version::V2c);
        let oids = vec![
            oid!(1, 3, 6, 1, 2, 1, 1, 1, 0),
            oid!(1, 3, 6, 1, 2, 1, 1, 2, 0),
            oid!(1, 3, 6, 1, 2, 1, 1, 3, 0),
        ];
        let results = client.get_multi(&oids).await.unwrap();
        assert_eq!(results.len(), 3);
    }

    #[tokio::test]
    async fn test_ping_succeeds_even_on_snmp_error() {
        let mock = MockTransport::new("127.0.0.1:161".parse().unwrap());
        mock.queue_response(ResponseBuilder::new(1).error(2, 1).build_v2c(b"public"));
        let client = mock_client(mock, Version::V2c);
        assert!(client.ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_set_returns_echoed_varbinds() {
        let mock = MockTransport::new("127.0.0.1:161".parse().unwrap());
        mock.queue_response(
            ResponseBuilder::new(1)
                .varbind(oid!(1, 3, 6, 1, 2, 1, 1, 4, 0), Value::OctetString("admin".into()))
                .build_v2c(b"private"),
        );
        let client = mock_client(mock, Version::V2c);
        let result = client
            .set(vec![VarBind::new(
                oid!(1, 3, 6, 1, 2, 1, 1, 4, 0),
                Value::OctetString("admin".into()),
            )])
            .await
            .unwrap();
        assert_eq!(result.len(), 1);
    }
}
