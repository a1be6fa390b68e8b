//! An in-memory [`Transport`] for exercising [`crate::client::Client`] and
//! its walk streams without a real socket.
//!
//! Responses are queued in order with [`MockTransport::queue_response`] and
//! handed back on the next `recv`, rewritten in place so their `request_id`
//! (or `msgID`) matches whatever the client actually sent -- tests build
//! expected response content without having to predict the client's
//! internally-generated request IDs.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;

use super::Transport;
use crate::error::{Error, Result};
use crate::message::{CommunityMessage, Message};
use crate::oid::Oid;
use crate::pdu::Pdu;
use crate::value::Value;
use crate::varbind::VarBind;
use crate::version::Version;

enum QueuedItem {
    Response(Bytes),
    Timeout,
}

struct Inner {
    queue: VecDeque<QueuedItem>,
    sent: Vec<Bytes>,
}

/// A mock transport that replays queued responses.
#[derive(Clone)]
pub struct MockTransport {
    peer: SocketAddr,
    inner: Arc<Mutex<Inner>>,
}

impl MockTransport {
    pub fn new(peer: SocketAddr) -> Self {
        Self {
            peer,
            inner: Arc::new(Mutex::new(Inner {
                queue: VecDeque::new(),
                sent: Vec::new(),
            })),
        }
    }

    /// Queue a response (built with [`ResponseBuilder`]) to be returned by
    /// the next `recv`, after its correlation id is rewritten to match.
    pub fn queue_response(&self, response: Bytes) {
        self.inner.lock().unwrap().queue.push_back(QueuedItem::Response(response));
    }

    /// Queue a timeout: the next `recv` fails with [`Error::Timeout`]
    /// without consulting the deadline passed in.
    pub fn queue_timeout(&self) {
        self.inner.lock().unwrap().queue.push_back(QueuedItem::Timeout);
    }

    /// All datagrams handed to `send` so far, in order.
    pub fn sent(&self) -> Vec<Bytes> {
        self.inner.lock().unwrap().sent.clone()
    }
}

/// Rewrite a queued response's correlation id (`request_id` for v1/v2c,
/// `msgID` for v3) to match what the client is actually expecting, by
/// decoding and re-encoding rather than patching bytes in place -- the
/// queued id and the expected one may not encode to the same length.
fn patch_request_id(data: Bytes, request_id: i32) -> Bytes {
    match Message::decode(data.clone()) {
        Ok(Message::Community(mut msg)) => {
            msg.pdu.request_id = request_id;
            msg.encode()
        }
        Ok(Message::V3(mut msg)) => {
            msg.msg_id = request_id;
            Bytes::from(msg.encode().0)
        }
        Err(_) => data,
    }
}

impl Transport for MockTransport {
    async fn send(&self, data: &[u8]) -> Result<()> {
        self.inner.lock().unwrap().sent.push(Bytes::copy_from_slice(data));
        Ok(())
    }

    async fn recv(&self, request_id: i32, timeout: Duration) -> Result<(Bytes, SocketAddr)> {
        let item = self.inner.lock().unwrap().queue.pop_front();
        match item {
            None | Some(QueuedItem::Timeout) => Err(Error::Timeout {
                target: Some(self.peer),
                elapsed: timeout,
                request_id,
                retries: 0,
            }),
            Some(QueuedItem::Response(bytes)) => Ok((patch_request_id(bytes, request_id), self.peer)),
        }
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    fn local_addr(&self) -> SocketAddr {
        self.peer
    }
}

/// Builds encoded GetResponse messages for [`MockTransport::queue_response`].
#[derive(Debug, Default)]
pub struct ResponseBuilder {
    request_id: i32,
    error_status: i32,
    error_index: i32,
    varbinds: Vec<VarBind>,
}

impl ResponseBuilder {
    pub fn new(request_id: i32) -> Self {
        Self {
            request_id,
            ..Default::default()
        }
    }

    pub fn varbind(mut self, oid: Oid, value: Value) -> Self {
        self.varbinds.push(VarBind::new(oid, value));
        self
    }

    pub fn error(mut self, error_status: i32, error_index: i32) -> Self {
        self.error_status = error_status;
        self.error_index = error_index;
        self
    }

    fn pdu(self) -> Pdu {
        Pdu::get_response(self.request_id, self.error_status, self.error_index, self.varbinds)
    }

    pub fn build_v1(self, community: &[u8]) -> Bytes {
        let community = Bytes::copy_from_slice(community);
        CommunityMessage::new(Version::V1, community, self.pdu()).encode()
    }

    pub fn build_v2c(self, community: &[u8]) -> Bytes {
        let community = Bytes::copy_from_slice(community);
        CommunityMessage::new(Version::V2c, community, self.pdu()).encode()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oid;

    #[tokio::test]
    async fn test_queued_response_is_returned() {
        let mock = MockTransport::new("127.0.0.1:161".parse().unwrap());
        mock.queue_response(
            ResponseBuilder::new(1)
                .varbind(oid!(1, 3, 6, 1, 2, 1, 1, 1, 0), Value::OctetString("x".into()))
                .build_v2c(b"public"),
        );
        let (bytes, from) = mock.recv(42, Duration::from_secs(1)).await.unwrap();
        assert_eq!(from, "127.0.0.1:161".parse::<SocketAddr>().unwrap());
        let decoded = CommunityMessage::decode(bytes).unwrap();
        assert_eq!(decoded.pdu.request_id, 42);
    }

    #[tokio::test]
    async fn test_queued_timeout_errors() {
        let mock = MockTransport::new("127.0.0.1:161".parse().unwrap());
        mock.queue_timeout();
        let err = mock.recv(1, Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_empty_queue_errors_as_timeout() {
        let mock = MockTransport::new("127.0.0.1:161".parse().unwrap());
        let err = mock.recv(1, Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_sent_is_recorded() {
        let mock = MockTransport::new("127.0.0.1:161".parse().unwrap());
        mock.send(b"hello").await.unwrap();
        assert_eq!(mock.sent(), vec![Bytes::from_static(b"hello")]);
    }
}
