//! Local address resolution.
//!
//! # Responsibilities
//! - Enumerate the addresses bound to this host's interfaces
//! - Pick the first non-loopback IPv4 address in enumeration order
//!
//! # Design Decisions
//! - Never fails: enumeration errors and empty results become `""`
//! - No caching, every call re-reads the interface table
//! - Enumeration order is whatever the OS reports; with several candidate
//!   addresses the pick is implementation-defined

use std::net::{IpAddr, Ipv4Addr};

/// Source of the address stamped onto responses.
pub trait AddressResolver: Send + Sync + std::fmt::Debug {
    /// Returns the host's address, or an empty string when none is known.
    fn local_ip(&self) -> String;
}

/// Reads the OS interface table on every call.
#[derive(Debug, Clone, Copy, Default)]
pub struct InterfaceResolver;

impl AddressResolver for InterfaceResolver {
    fn local_ip(&self) -> String {
        pick_local_ip(local_ip_address::list_afinet_netifas())
    }
}

/// Reduce an interface listing to the address to advertise.
fn pick_local_ip(interfaces: Result<Vec<(String, IpAddr)>, local_ip_address::Error>) -> String {
    match interfaces {
        Ok(interfaces) => first_non_loopback_v4(interfaces.into_iter().map(|(_, ip)| ip))
            .map(|ip| ip.to_string())
            .unwrap_or_default(),
        Err(e) => {
            tracing::debug!(error = %e, "Interface enumeration failed");
            String::new()
        }
    }
}

/// A resolver that always answers with the same value.
///
/// Useful for hosts that already know their advertised address, and for tests.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver(String);

impl StaticResolver {
    pub fn new(ip: impl Into<String>) -> Self {
        Self(ip.into())
    }
}

impl AddressResolver for StaticResolver {
    fn local_ip(&self) -> String {
        self.0.clone()
    }
}

/// First address that is IPv4 and outside 127.0.0.0/8.
pub fn first_non_loopback_v4<I>(addrs: I) -> Option<Ipv4Addr>
where
    I: IntoIterator<Item = IpAddr>,
{
    addrs.into_iter().find_map(|addr| match addr {
        IpAddr::V4(v4) if !v4.is_loopback() => Some(v4),
        _ => None,
    })
}

/// Shorthand for [`InterfaceResolver::local_ip`].
pub fn local_ip() -> String {
    InterfaceResolver.local_ip()
}
