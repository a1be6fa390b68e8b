//! Host-string parsing for client targets.
//!
//! Accepts everything [`BaseConfig`](crate::client)'s `target` string can be:
//! a bare IPv4/IPv6 address, `ipv4:port`, bracketed `[ipv6]:port`, or a
//! hostname resolved through the system resolver. A bracketed or
//! `host:port` form always wins over a separately-supplied default port;
//! bare IPv6 addresses (which themselves contain colons) are never mistaken
//! for `host:port`.

use std::net::{SocketAddr, ToSocketAddrs};

use crate::error::{Error, Result};

fn validate_port(port: u32, original: &str) -> Result<u16> {
    if port == 0 || port > u16::MAX as u32 {
        return Err(Error::InvalidPort { value: port as i64 });
    }
    let _ = original;
    Ok(port as u16)
}

/// Resolve a target string to a socket address, using `default_port` when
/// the string doesn't carry its own port.
pub(crate) fn resolve(target: &str, default_port: u16) -> Result<SocketAddr> {
    let target = target.trim();

    if let Some(rest) = target.strip_prefix('[') {
        // Bracketed form: "[ipv6]" or "[ipv6]:port".
        let close = rest.find(']').ok_or_else(|| {
            Error::InvalidIpv6 {
                input: target.into(),
            }
        })?;
        let host = &rest[..close];
        let after = &rest[close + 1..];
        let addr: std::net::Ipv6Addr = host.parse().map_err(|_| Error::InvalidIpv6 { input: target.into() })?;
        let port = if let Some(port_str) = after.strip_prefix(':') {
            let parsed: u32 = port_str.parse().map_err(|_| Error::InvalidPort { value: -1 })?;
            validate_port(parsed, target)?
        } else {
            default_port
        };
        return Ok(SocketAddr::from((addr, port)));
    }

    // Bare IPv6 (contains more than one colon, no brackets): never treated
    // as host:port.
    if target.matches(':').count() > 1 {
        let addr: std::net::Ipv6Addr = target
            .parse()
            .map_err(|_| Error::InvalidIpv6 { input: target.into() })?;
        return Ok(SocketAddr::from((addr, default_port)));
    }

    // Exactly one colon: host:port (IPv4 literal, or hostname).
    if let Some((host, port_str)) = target.rsplit_once(':') {
        let parsed: u32 = port_str
            .parse()
            .map_err(|_| Error::InvalidPort { value: -1 })?;
        let port = validate_port(parsed, target)?;
        return resolve_host(host, port);
    }

    // No colon at all: bare IPv4 literal or hostname, default port.
    resolve_host(target, default_port)
}

fn resolve_host(host: &str, port: u16) -> Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()
        .map_err(|source| Error::Io { target: None, source })?
        .next()
        .ok_or_else(|| Error::Io {
            target: None,
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "could not resolve address"),
        })
}
