//! Owned UDP transport: one socket per target, used by [`crate::client::Client`]
//! directly and as the connection type housed inside [`crate::pool::Pool`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::UdpSocket;

use super::Transport;
use crate::ber::Decoder;
use crate::error::{Error, Result};

/// Maximum UDP datagram this crate will read into a single recv buffer.
/// SNMP messages are bounded well below the theoretical 65507-byte UDP
/// payload limit; see [`crate::ber::decode::MAX_CONTENT_LEN`].
const RECV_BUF_LEN: usize = 65536;

/// A UDP socket connected to exactly one target.
///
/// Cloning shares the underlying socket (`Arc`), so a `Client<UdpTransport>`
/// can be cloned cheaply for concurrent walks.
#[derive(Debug, Clone)]
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
}

impl UdpTransport {
    /// Bind an ephemeral local socket and connect it to `target`.
    ///
    /// `connect` on a UDP socket just fixes the peer address for `send`/`recv`;
    /// it performs no handshake.
    pub async fn connect(target: SocketAddr) -> Result<Self> {
        let socket = crate::util::bind_ephemeral_udp_socket(target)
            .await
            .map_err(|source| Error::Io {
                target: Some(target),
                source,
            })?;
        socket.connect(target).await.map_err(|source| Error::Io {
            target: Some(target),
            source,
        })?;
        Ok(Self {
            socket: Arc::new(socket),
            peer: target,
        })
    }
}

impl Transport for UdpTransport {
    async fn send(&self, data: &[u8]) -> Result<()> {
        self.socket.send(data).await.map_err(|source| Error::Io {
            target: Some(self.peer),
            source,
        })?;
        Ok(())
    }

    async fn recv(&self, request_id: i32, timeout: Duration) -> Result<(Bytes, SocketAddr)> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(Error::Timeout {
                    target: Some(self.peer),
                    elapsed: timeout,
                    request_id,
                    retries: 0,
                });
            }

            let mut buf = vec![0u8; RECV_BUF_LEN];
            let n = match tokio::time::timeout(remaining, self.socket.recv(&mut buf)).await {
                Ok(Ok(n)) => n,
                Ok(Err(source)) => {
                    return Err(Error::Io {
                        target: Some(self.peer),
                        source,
                    });
                }
                Err(_) => {
                    return Err(Error::Timeout {
                        target: Some(self.peer),
                        elapsed: timeout,
                        request_id,
                        retries: 0,
                    });
                }
            };
            buf.truncate(n);
            let bytes = Bytes::from(buf);

            // A connected UDP socket only delivers datagrams from `peer`, but a
            // prior retry's response can still arrive after we've moved on to a
            // new request_id. Skip anything that doesn't correlate.
            match extract_request_id(&bytes) {
                Some(id) if id == request_id => return Ok((bytes, self.peer)),
                _ => {
                    tracing::trace!(snmp.request_id = request_id, "dropping stray datagram");
                    continue;
                }
            }
        }
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    fn local_addr(&self) -> SocketAddr {
        self.socket
            .local_addr()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)))
    }

    fn is_stream(&self) -> bool {
        false
    }
}

/// Peek a SNMP message's correlation id without fully decoding it.
///
/// For v1/v2c this is the PDU's `request_id`: outer SEQUENCE, version,
/// OCTET STRING community, then the PDU SEQUENCE whose first INTEGER is
/// `request_id`. For v3 the PDU itself sits behind `msgSecurityParameters`
/// and is frequently encrypted, so `request_id` isn't recoverable without a
/// localized key; instead this reads `msgGlobalData`'s first field, `msgID`,
/// which travels in cleartext and (by construction in this crate) is always
/// sent equal to the inner PDU's `request_id`. Returns `None` on anything
/// that doesn't look like a well-formed message, which callers treat as
/// "not a response to anything we're waiting for".
pub fn extract_request_id(data: &Bytes) -> Option<i32> {
    let mut decoder = Decoder::new(data.clone());
    let mut outer = decoder.read_sequence().ok()?;
    let version = outer.read_integer().ok()?;

    if version == 3 {
        let mut global_data = outer.read_sequence().ok()?;
        return global_data.read_integer().ok().map(|id| id as i32);
    }

    let _community = outer.read_octet_string().ok()?;
    let tag = outer.peek_tag().ok()?;
    let mut pdu = outer.read_constructed(tag).ok()?;
    pdu.read_integer().ok().map(|id| id as i32)
}
