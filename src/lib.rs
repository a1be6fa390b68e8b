//! Async-first SNMPv1/v2c/v3 manager library.
//!
//! `snmp-core` implements the manager (client) side of SNMP: a BER/ASN.1
//! codec, RFC 3414 User-based Security Model for v3, a request engine with
//! retry/backoff and adaptive GETBULK walking, and a connection pool for
//! services that talk to many devices concurrently.
//!
//! ```rust,no_run
//! use snmp_core::prelude::*;
//!
//! # async fn run() -> Result<()> {
//! let client = Client::v2c("192.0.2.1:161", "public").connect().await?;
//! let sys_descr = client.get(&oid!(1, 3, 6, 1, 2, 1, 1, 1, 0)).await?;
//! println!("{sys_descr}");
//! # Ok(())
//! # }
//! ```

mod ber;
pub mod client;
mod error;
mod host;
mod message;
mod oid;
mod pdu;
pub mod pool;
pub mod prelude;
pub mod transport;
mod util;
pub mod v3;
mod value;
mod varbind;
mod version;

pub use client::{Client, ClientConfig, RequestOptions, V3SecurityConfig};
pub use error::{Error, Result};
pub use oid::Oid;
pub use pool::{Pool, PoolConfig, PoolStrategy};
pub use value::Value;
pub use varbind::VarBind;
pub use version::Version;

// `oid!` is `#[macro_export]`'d from `oid.rs`, which places it at the crate
// root automatically; nothing to re-export here.
