//! Connection pool: reusable UDP sockets shared across many targets.
//!
//! A [`Pool`] is a single-owner actor task ([`actor`]) that exclusively
//! owns the pool's mutable tables -- idle list, in-flight map,
//! device-affinity map, waiter queue, stats -- and is mutated only by
//! processing messages sent over a channel (spec.md §5). Callers never
//! touch pool state directly; a [`Pool`] handle is just a cheap-to-clone
//! sender half of that channel.
//!
//! ```rust,no_run
//! use snmp_core::pool::{Pool, PoolConfig};
//! use snmp_core::prelude::*;
//! use snmp_core::ClientConfig;
//! use snmp_core::Version;
//! use bytes::Bytes;
//! use std::time::Duration;
//!
//! # async fn run() -> Result<()> {
//! let pool = Pool::start("devices", PoolConfig::default()).await?;
//! let target = "192.0.2.1:161".parse().unwrap();
//! let result = pool
//!     .with_connection(target, Some("router-1"), |conn| async move {
//!         let client = Client::new(
//!             conn,
//!             ClientConfig {
//!                 version: Version::V2c,
//!                 community: Bytes::from_static(b"public"),
//!                 timeout: Duration::from_secs(2),
//!                 retries: 1,
//!                 max_oids_per_request: 10,
//!                 v3_security: None,
//!             },
//!         );
//!         client.get(&oid!(1, 3, 6, 1, 2, 1, 1, 1, 0)).await
//!     })
//!     .await?;
//! println!("{}", result.value);
//! pool.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod actor;
mod conn;
mod stats;

use std::collections::VecDeque;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};

pub use conn::{Health, PooledConnection};
pub use stats::PoolStats;

use crate::error::{Error, PoolErrorKind, Result};
use actor::{Command, State};

/// Size of the actor's command channel. Callers block on send only if the
/// actor falls this far behind processing checkouts/checkins, which would
/// indicate the control loop itself (not the network) is the bottleneck.
const COMMAND_CHANNEL_CAPACITY: usize = 1024;

/// Connection selection strategy (spec.md §4.E).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PoolStrategy {
    /// Take the head of the idle list; return to the tail on checkin.
    #[default]
    Fifo,
    /// Documented as functionally identical to FIFO for a single checkout
    /// (spec.md §9's REDESIGN FLAG): the connection taken is immediately in
    /// use, so "rotate without removing" and "remove then append" coincide.
    /// Kept as a distinct strategy for predictable, named behavior rather
    /// than silently aliasing `Fifo`.
    RoundRobin,
    /// Prefer the connection last used by the same named device, falling
    /// back to the head of the idle list when that connection isn't idle
    /// (in use, or never checked out before).
    DeviceAffinity,
}

/// Configuration for [`Pool::start`].
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of connections created at pool startup and never closed
    /// except to replace an unhealthy one.
    pub size: usize,
    /// Extra connections created lazily when `size` is exhausted; closed
    /// (not recycled) on checkin.
    pub max_overflow: usize,
    /// Selection strategy among idle connections.
    pub strategy: PoolStrategy,
    /// How long [`Pool::with_connection`] waits in the waiter queue before
    /// failing with `PoolErrorKind::CheckoutTimeout`.
    pub checkout_timeout: Duration,
    /// Interval between health scans of idle connections.
    pub health_check_interval: Duration,
    /// Local address each pooled socket binds to (port 0 for ephemeral).
    pub bind_addr: SocketAddr,
    /// Receive buffer size; packets larger than this are never observed
    /// (see spec.md §6's 65507-byte UDP payload ceiling).
    pub max_message_size: usize,
    /// Log a warning when a response arrives from an address other than
    /// the one a pending request was sent to.
    pub warn_on_source_mismatch: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 4,
            max_overflow: 2,
            strategy: PoolStrategy::Fifo,
            checkout_timeout: Duration::from_secs(5),
            health_check_interval: Duration::from_secs(60),
            bind_addr: "0.0.0.0:0".parse().unwrap(),
            max_message_size: 65507,
            warn_on_source_mismatch: true,
        }
    }
}

/// A running connection pool.
///
/// Cloning a `Pool` is cheap: it clones the handle to the actor task's
/// command channel, not the pool's state. All clones see the same
/// underlying pool.
#[derive(Clone)]
pub struct Pool {
    name: Arc<str>,
    cmd_tx: mpsc::Sender<Command>,
    checkout_timeout: Duration,
}

impl Pool {
    /// Start a pool, binding `config.size` sockets up front.
    pub async fn start(name: impl Into<Arc<str>>, config: PoolConfig) -> Result<Self> {
        let name: Arc<str> = name.into();
        let mut idle = VecDeque::with_capacity(config.size);
        let mut next_id = 0u64;
        for _ in 0..config.size {
            let socket =
                conn::PooledSocket::bind(config.bind_addr, config.max_message_size, config.warn_on_source_mismatch)
                    .await?;
            idle.push_back(actor::Slot::new(next_id, socket));
            next_id += 1;
        }

        let checkout_timeout = config.checkout_timeout;
        let state = State::new(name.clone(), config, idle, next_id);
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        tokio::spawn(actor::run(state, cmd_rx));

        Ok(Self {
            name,
            cmd_tx,
            checkout_timeout,
        })
    }

    /// This pool's name, as given to [`Pool::start`].
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Borrow a connection, run `f` with it, and return it to the pool.
    ///
    /// `device` enables device-affinity selection (ignored by other
    /// strategies): passing the same `device` across calls prefers the same
    /// underlying socket when it's idle. `target` is the address the
    /// borrowed [`PooledConnection`] sends to and receives from -- a pool
    /// doesn't bind its sockets to one peer, so it travels with the call,
    /// not the pool.
    ///
    /// Blocks up to `checkout_timeout` waiting for a connection; fails with
    /// `PoolErrorKind::CheckoutTimeout` if none frees up in time,
    /// `PoolErrorKind::Exhausted` if the pool has zero base and overflow
    /// capacity (so waiting could never help), or `PoolErrorKind::ShuttingDown`
    /// if the pool is shutting down.
    pub async fn with_connection<F, Fut, R>(&self, target: SocketAddr, device: Option<&str>, f: F) -> Result<R>
    where
        F: FnOnce(PooledConnection) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let device_owned: Option<Box<str>> = device.map(Into::into);
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Checkout {
                device: device_owned.clone(),
                respond_to: tx,
            })
            .await
            .map_err(|_| Error::pool(self.name.clone(), PoolErrorKind::ShuttingDown))?;

        let grant = match tokio::time::timeout(self.checkout_timeout, rx).await {
            Ok(Ok(Ok(grant))) => grant,
            Ok(Ok(Err(e))) => return Err(e),
            Ok(Err(_)) => return Err(Error::pool(self.name.clone(), PoolErrorKind::ShuttingDown)),
            Err(_) => return Err(Error::pool(self.name.clone(), PoolErrorKind::CheckoutTimeout)),
        };

        let conn = PooledConnection {
            socket: grant.socket,
            target,
        };
        let started = Instant::now();
        let result = f(conn).await;
        let duration = started.elapsed();
        let had_error = result.is_err();

        // Best-effort: if the actor's gone, there's nothing left to check
        // the connection back into.
        let _ = self
            .cmd_tx
            .send(Command::Checkin {
                slot_id: grant.slot_id,
                is_overflow: grant.is_overflow,
                device: device_owned,
                had_error,
                duration,
            })
            .await;

        result
    }

    /// Snapshot of pool state (active/idle/overflow counts, health
    /// histogram, rolling response-time window).
    pub async fn stats(&self) -> Result<PoolStats> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Stats { respond_to: tx })
            .await
            .map_err(|_| Error::pool(self.name.clone(), PoolErrorKind::ShuttingDown))?;
        rx.await
            .map_err(|_| Error::pool(self.name.clone(), PoolErrorKind::ShuttingDown))
    }

    /// Close every connection (idle and in-flight) and fail any queued
    /// waiters with `PoolErrorKind::ShuttingDown`. Idempotent; safe to call
    /// from multiple clones concurrently.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Shutdown { respond_to: tx }).await.is_ok() {
            let _ = rx.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PoolErrorKind;
    use crate::transport::Transport;

    fn test_config(size: usize, max_overflow: usize) -> PoolConfig {
        PoolConfig {
            size,
            max_overflow,
            strategy: PoolStrategy::Fifo,
            checkout_timeout: Duration::from_millis(200),
            health_check_interval: Duration::from_secs(3600),
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            max_message_size: 2048,
            warn_on_source_mismatch: true,
        }
    }

    #[tokio::test]
    async fn test_checkout_and_checkin_roundtrip() {
        let pool = Pool::start("t1", test_config(2, 0)).await.unwrap();
        let target: SocketAddr = "192.0.2.1:161".parse().unwrap();

        let result = pool
            .with_connection(target, None, |conn| async move {
                assert_eq!(conn.peer_addr(), target);
                Ok(42)
            })
            .await
            .unwrap();
        assert_eq!(result, 42);

        let stats = pool.stats().await.unwrap();
        assert_eq!(stats.idle, 2);
        assert_eq!(stats.active, 0);
        assert_eq!(stats.total_checkouts, 1);
        assert_eq!(stats.total_checkins, 1);
    }

    #[tokio::test]
    async fn test_device_affinity_prefers_same_socket() {
        let pool = Pool::start(
            "t2",
            PoolConfig {
                strategy: PoolStrategy::DeviceAffinity,
                ..test_config(3, 0)
            },
        )
        .await
        .unwrap();
        let target: SocketAddr = "192.0.2.1:161".parse().unwrap();

        let first_local = pool
            .with_connection(target, Some("router-a"), |conn| async move { Ok(conn.local_addr()) })
            .await
            .unwrap();

        let second_local = pool
            .with_connection(target, Some("router-a"), |conn| async move { Ok(conn.local_addr()) })
            .await
            .unwrap();

        assert_eq!(first_local, second_local);
    }

    #[tokio::test]
    async fn test_overflow_created_and_closed_on_checkin() {
        let pool = Pool::start("t3", test_config(1, 1)).await.unwrap();
        let target: SocketAddr = "192.0.2.1:161".parse().unwrap();

        // Hold the single base connection open while checking out a second.
        let (hold_tx, hold_rx) = oneshot::channel::<()>();
        let pool_clone = pool.clone();
        let holder = tokio::spawn(async move {
            pool_clone
                .with_connection(target, None, |_conn| async move {
                    let _ = hold_rx.await;
                    Ok(())
                })
                .await
        });

        // Give the holder a moment to check out the base connection.
        tokio::time::sleep(Duration::from_millis(20)).await;

        pool.with_connection(target, None, |conn| async move {
            assert_eq!(conn.peer_addr(), target);
            Ok(())
        })
        .await
        .unwrap();

        let mid_stats = pool.stats().await.unwrap();
        assert_eq!(mid_stats.idle, 0);
        assert_eq!(mid_stats.active, 1);

        let _ = hold_tx.send(());
        holder.await.unwrap().unwrap();

        // The overflow connection above is closed on checkin, not recycled.
        let final_stats = pool.stats().await.unwrap();
        assert_eq!(final_stats.idle, 1);
        assert_eq!(final_stats.overflow, 0);
    }

    #[tokio::test]
    async fn test_exhaustion_times_out() {
        let pool = Pool::start("t4", test_config(1, 0)).await.unwrap();
        let target: SocketAddr = "192.0.2.1:161".parse().unwrap();

        let (hold_tx, hold_rx) = oneshot::channel::<()>();
        let pool_clone = pool.clone();
        let holder = tokio::spawn(async move {
            pool_clone
                .with_connection(target, None, |_conn| async move {
                    let _ = hold_rx.await;
                    Ok(())
                })
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;

        let err = pool
            .with_connection(target, None, |_conn| async move { Ok(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Pool { kind: PoolErrorKind::CheckoutTimeout, .. }));

        let _ = hold_tx.send(());
        holder.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_zero_capacity_pool_fails_fast_with_exhausted() {
        let pool = Pool::start(
            "t4b",
            PoolConfig {
                checkout_timeout: Duration::from_secs(5),
                ..test_config(0, 0)
            },
        )
        .await
        .unwrap();
        let target: SocketAddr = "192.0.2.1:161".parse().unwrap();

        let started = Instant::now();
        let err = pool
            .with_connection(target, None, |_conn| async move { Ok(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Pool { kind: PoolErrorKind::Exhausted, .. }));
        // Should fail immediately, not wait out the 5s checkout timeout.
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_waiter_gets_connection_after_checkin() {
        let pool = Pool::start(
            "t5",
            PoolConfig {
                checkout_timeout: Duration::from_secs(2),
                ..test_config(1, 0)
            },
        )
        .await
        .unwrap();
        let target: SocketAddr = "192.0.2.1:161".parse().unwrap();

        let (hold_tx, hold_rx) = oneshot::channel::<()>();
        let pool_clone = pool.clone();
        let holder = tokio::spawn(async move {
            pool_clone
                .with_connection(target, None, |_conn| async move {
                    let _ = hold_rx.await;
                    Ok(())
                })
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;

        let pool_clone = pool.clone();
        let waiter = tokio::spawn(async move {
            pool_clone
                .with_connection(target, None, |_conn| async move { Ok(1) })
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        let _ = hold_tx.send(());

        holder.await.unwrap().unwrap();
        let result = waiter.await.unwrap().unwrap();
        assert_eq!(result, 1);
    }

    #[tokio::test]
    async fn test_shutdown_fails_pending_and_future_checkouts() {
        let pool = Pool::start("t6", test_config(1, 0)).await.unwrap();
        pool.shutdown().await;

        let target: SocketAddr = "192.0.2.1:161".parse().unwrap();
        let err = pool
            .with_connection(target, None, |_conn| async move { Ok(()) })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Pool { kind: PoolErrorKind::ShuttingDown, .. }
        ));
    }
}
