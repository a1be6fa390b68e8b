//! Physical pooled sockets and the connection handle callers borrow.
//!
//! A [`PooledSocket`] is a single unconnected UDP socket multiplexed across
//! whichever devices currently borrow it, correlated by request id -- the
//! same trick the crate's shared UDP transport uses for high-fanout polling,
//! adapted here so the pool's control loop (not the socket itself) owns
//! checkout/checkin bookkeeping.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::{oneshot, Notify};

use crate::error::{Error, Result};
use crate::transport::Transport;
use crate::util::bind_udp_socket;

struct PendingRequest {
    target: SocketAddr,
    sender: oneshot::Sender<(Bytes, SocketAddr)>,
    deadline: Instant,
}

/// One physical UDP socket owned by a pool slot.
///
/// Sends/receives for any number of targets concurrently; responses are
/// routed back to the waiting caller by request id, exactly as on the wire.
pub(crate) struct PooledSocket {
    socket: UdpSocket,
    local_addr: SocketAddr,
    pending: Mutex<HashMap<i32, PendingRequest>>,
    next_request_id: AtomicI32,
    shutdown: Notify,
    warn_on_source_mismatch: bool,
}

impl PooledSocket {
    pub(crate) async fn bind(
        bind_addr: SocketAddr,
        max_message_size: usize,
        warn_on_source_mismatch: bool,
    ) -> Result<std::sync::Arc<Self>> {
        let socket = bind_udp_socket(bind_addr).await.map_err(|e| Error::Io {
            target: Some(bind_addr),
            source: e,
        })?;
        let local_addr = socket.local_addr().map_err(|e| Error::Io {
            target: Some(bind_addr),
            source: e,
        })?;

        let inner = std::sync::Arc::new(Self {
            socket,
            local_addr,
            pending: Mutex::new(HashMap::new()),
            next_request_id: AtomicI32::new(1),
            shutdown: Notify::new(),
            warn_on_source_mismatch,
        });

        tokio::spawn(Self::recv_loop(inner.clone(), max_message_size));
        Ok(inner)
    }

    async fn recv_loop(inner: std::sync::Arc<Self>, max_message_size: usize) {
        let mut buf = vec![0u8; max_message_size];
        loop {
            tokio::select! {
                _ = inner.shutdown.notified() => {
                    tracing::trace!(snmp.local_addr = %inner.local_addr, "pooled socket recv loop stopping");
                    break;
                }
                res = inner.socket.recv_from(&mut buf) => {
                    match res {
                        Ok((len, source)) => {
                            let data = Bytes::copy_from_slice(&buf[..len]);
                            if let Some(request_id) = crate::transport::extract_request_id(&data) {
                                let pending = inner.pending.lock().unwrap().remove(&request_id);
                                if let Some(pending) = pending {
                                    if inner.warn_on_source_mismatch && source != pending.target {
                                        tracing::warn!(
                                            snmp.request_id = request_id,
                                            snmp.target = %pending.target,
                                            snmp.source = %source,
                                            "pooled response source address mismatch"
                                        );
                                    }
                                    let _ = pending.sender.send((data, source));
                                } else {
                                    tracing::debug!(snmp.request_id = request_id, snmp.source = %source, "pooled response for unknown request_id");
                                }
                            } else {
                                tracing::debug!(snmp.source = %source, len, "pooled socket received malformed response");
                            }
                        }
                        Err(e) => tracing::error!(error = %e, "pooled socket recv error"),
                    }
                }
            }

            let now = Instant::now();
            inner.pending.lock().unwrap().retain(|_, p| p.deadline > now);
        }
    }

    fn alloc_request_id(&self) -> i32 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn send_to(&self, data: &[u8], target: SocketAddr) -> Result<()> {
        self.socket.send_to(data, target).await.map_err(|e| Error::Io {
            target: Some(target),
            source: e,
        })?;
        Ok(())
    }

    async fn recv_for(&self, request_id: i32, target: SocketAddr, timeout: Duration) -> Result<(Bytes, SocketAddr)> {
        let (tx, rx) = oneshot::channel();
        let deadline = Instant::now() + timeout;
        self.pending.lock().unwrap().insert(
            request_id,
            PendingRequest {
                target,
                sender: tx,
                deadline,
            },
        );

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            _ => {
                self.pending.lock().unwrap().remove(&request_id);
                Err(Error::Timeout {
                    target: Some(target),
                    elapsed: timeout,
                    request_id,
                    retries: 0,
                })
            }
        }
    }

    pub(crate) fn close(&self) {
        self.shutdown.notify_waiters();
    }
}

/// Connection health, reclassified on checkin and on the periodic scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Healthy,
    Degraded,
    Unhealthy,
}

impl std::fmt::Display for Health {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

pub(crate) fn classify_health(error_count: u64, idle_for: Duration) -> Health {
    if error_count > 10 {
        Health::Unhealthy
    } else if error_count > 5 || idle_for > Duration::from_secs(600) {
        Health::Degraded
    } else {
        Health::Healthy
    }
}

/// A borrowed pooled connection, handed to the closure passed to
/// [`Pool::with_connection`](crate::pool::Pool::with_connection).
///
/// Implements [`Transport`] so it can back a [`Client`](crate::client::Client)
/// for the duration of the closure.
#[derive(Clone)]
pub struct PooledConnection {
    pub(crate) socket: std::sync::Arc<PooledSocket>,
    pub(crate) target: SocketAddr,
}

impl Transport for PooledConnection {
    async fn send(&self, data: &[u8]) -> Result<()> {
        self.socket.send_to(data, self.target).await
    }

    async fn recv(&self, request_id: i32, timeout: Duration) -> Result<(Bytes, SocketAddr)> {
        self.socket.recv_for(request_id, self.target, timeout).await
    }

    fn peer_addr(&self) -> SocketAddr {
        self.target
    }

    fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr
    }

    fn is_stream(&self) -> bool {
        false
    }

    fn alloc_request_id(&self) -> Option<i32> {
        Some(self.socket.alloc_request_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_health_thresholds() {
        assert_eq!(classify_health(0, Duration::ZERO), Health::Healthy);
        assert_eq!(classify_health(6, Duration::ZERO), Health::Degraded);
        assert_eq!(classify_health(11, Duration::ZERO), Health::Unhealthy);
        assert_eq!(classify_health(0, Duration::from_secs(601)), Health::Degraded);
        assert_eq!(classify_health(0, Duration::from_secs(599)), Health::Healthy);
    }

    #[tokio::test]
    async fn test_pooled_socket_send_recv_roundtrip() {
        let a = PooledSocket::bind("127.0.0.1:0".parse().unwrap(), 2048, true).await.unwrap();
        let b = PooledSocket::bind("127.0.0.1:0".parse().unwrap(), 2048, true).await.unwrap();
        let b_addr = b.local_addr;

        a.send_to(b"ping", b_addr).await.unwrap();
        // No request-id framing on raw bytes, so we can't correlate through
        // recv_for here; just confirm the datagram round trip at the socket layer.
        let mut buf = [0u8; 16];
        let (len, from) = tokio::time::timeout(Duration::from_secs(1), b.socket.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], b"ping");
        assert_eq!(from.port(), a.local_addr.port());
        a.close();
        b.close();
    }
}
