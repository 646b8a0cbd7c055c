//! Host resolver access
//!
//! Reverse lookups for unknown IPs and the cached-hostname refresh both
//! go through the host's configured resolver. The trait keeps the
//! filtering engine testable without network access; resolution results
//! distinguish "name not found" (an empty answer) from real failures.

use std::net::IpAddr;

use hickory_resolver::error::{ResolveError, ResolveErrorKind};
use hickory_resolver::Resolver;

use crate::error::{Error, Result};
use crate::packet::IpFamily;

/// Resolver interface used by the traffic filter and the pre-cache task.
pub trait HostResolver: Send + Sync + 'static {
    /// Resolve `hostname` to addresses of the given family.
    /// A name that does not exist yields an empty vector, not an error.
    fn lookup_ips(&self, hostname: &str, family: IpFamily) -> Result<Vec<IpAddr>>;

    /// Reverse-resolve `addr` to its PTR names. Names are returned as
    /// the resolver produced them, which usually means a trailing dot.
    /// An address with no PTR record yields an empty vector.
    fn reverse_lookup(&self, addr: IpAddr) -> Result<Vec<String>>;
}

/// `HostResolver` backed by the system resolver configuration.
///
/// Lookups made through this resolver leave the host like any other DNS
/// traffic; with a `selfDNSQueue` configured they are classified into
/// the engine's own queues and vetted by the self-filter.
pub struct SystemResolver {
    inner: Resolver,
}

impl SystemResolver {
    /// Build a resolver from /etc/resolv.conf.
    pub fn from_system_conf() -> Result<Self> {
        let inner = Resolver::from_system_conf()
            .map_err(|e| Error::resolve("system resolver", e.to_string()))?;
        Ok(Self { inner })
    }
}

impl HostResolver for SystemResolver {
    fn lookup_ips(&self, hostname: &str, family: IpFamily) -> Result<Vec<IpAddr>> {
        match family {
            IpFamily::V4 => match self.inner.ipv4_lookup(hostname) {
                Ok(lookup) => Ok(lookup.iter().map(|r| IpAddr::V4(r.0)).collect()),
                Err(e) => not_found_as_empty(hostname, e),
            },
            IpFamily::V6 => match self.inner.ipv6_lookup(hostname) {
                Ok(lookup) => Ok(lookup.iter().map(|r| IpAddr::V6(r.0)).collect()),
                Err(e) => not_found_as_empty(hostname, e),
            },
        }
    }

    fn reverse_lookup(&self, addr: IpAddr) -> Result<Vec<String>> {
        match self.inner.reverse_lookup(addr) {
            Ok(lookup) => Ok(lookup.iter().map(|ptr| ptr.0.to_utf8()).collect()),
            Err(e) => not_found_as_empty(&addr.to_string(), e),
        }
    }
}

fn not_found_as_empty<T>(name: &str, err: ResolveError) -> Result<Vec<T>> {
    match err.kind() {
        ResolveErrorKind::NoRecordsFound { .. } => Ok(Vec::new()),
        _ => Err(Error::resolve(name, err.to_string())),
    }
}
