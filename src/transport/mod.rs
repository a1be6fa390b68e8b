//! Transport layer abstraction.
//!
//! Provides the [`Transport`] trait and the UDP implementation used by
//! [`crate::client::Client`] and [`crate::pool`]. SNMP over UDP is the only
//! transport this crate builds.

mod udp;

#[cfg(any(test, feature = "testing"))]
mod mock;

pub use udp::{UdpTransport, extract_request_id};

#[cfg(any(test, feature = "testing"))]
pub use mock::{MockTransport, ResponseBuilder};

use crate::error::Result;
use bytes::Bytes;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

/// Client-side transport abstraction.
///
/// All transports implement this trait uniformly so [`Client`](crate::client::Client)
/// is generic over how bytes actually move.
///
/// # Clone requirement
///
/// `Clone` is required because walk streams own a clone of the client (and
/// thus the transport), enabling concurrent walks without borrow conflicts.
/// Implementations use `Arc` internally, making clone cheap.
pub trait Transport: Send + Sync + Clone {
    /// Send request data to the target.
    fn send(&self, data: &[u8]) -> impl Future<Output = Result<()>> + Send;

    /// Receive a response, correlated by `request_id`, bounded by `timeout`.
    ///
    /// Returns `(response_data, actual_source_address)`.
    fn recv(
        &self,
        request_id: i32,
        timeout: Duration,
    ) -> impl Future<Output = Result<(Bytes, SocketAddr)>> + Send;

    /// The peer address this transport sends to and receives from.
    fn peer_addr(&self) -> SocketAddr;

    /// Local bind address.
    fn local_addr(&self) -> SocketAddr;

    /// Whether this is a stream transport.
    ///
    /// UDP transports return `false`; [`Client`](crate::client::Client) retries
    /// on timeout only when this is `false`.
    fn is_stream(&self) -> bool {
        false
    }

    /// Allocate a request ID from the transport's shared counter, if it has one.
    ///
    /// Pooled transports return `Some` to hand out IDs from a single counter
    /// shared across clients; owned transports return `None` and the client
    /// falls back to its own counter.
    fn alloc_request_id(&self) -> Option<i32> {
        None
    }
}
