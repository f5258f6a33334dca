//! Turns SOCKS5 addresses into connectable socket addresses.
//!
//! This is the only place the proxy performs DNS lookups.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;

use log::trace;
use tokio::net::lookup_host;

use crate::error::{Error, Result};
use crate::protocol::{AddressSpec, Host};

/// An owned, in-flight lookup that a connection can park on.
pub type Lookup = Pin<Box<dyn Future<Output = Result<SocketAddr>> + Send>>;

/// Resolve `spec`, preferring the first IPv4 answer for domain names.
pub async fn resolve(spec: &AddressSpec) -> Result<SocketAddr> {
    let Host::Domain(name) = &spec.host else {
        return spec
            .socket_addr()
            .ok_or_else(|| Error::NoAddress(spec.to_string()));
    };
    let name = name.as_str();

    let addrs: Vec<SocketAddr> = lookup_host((name, spec.port))
        .await
        .map_err(|source| Error::Resolve {
            host: name.to_owned(),
            source,
        })?
        .collect();

    trace!("resolved {} to {:?}", spec, addrs);

    addrs
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| Error::NoAddress(name.to_owned()))
}

/// Start resolving `spec` without borrowing it.
pub fn lookup(spec: AddressSpec) -> Lookup {
    Box::pin(async move { resolve(&spec).await })
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::{Ipv4Addr, Ipv6Addr};

    #[tokio::test]
    async fn test_resolve_ip_without_lookup() {
        let spec = AddressSpec::new(Host::Ipv4(Ipv4Addr::new(10, 0, 0, 7)), 8080);
        assert_eq!(resolve(&spec).await.unwrap(), "10.0.0.7:8080".parse().unwrap());

        let spec = AddressSpec::new(Host::Ipv6(Ipv6Addr::LOCALHOST), 53);
        assert_eq!(resolve(&spec).await.unwrap(), "[::1]:53".parse().unwrap());
    }

    #[tokio::test]
    async fn test_resolve_localhost() {
        let spec = AddressSpec::new(Host::Domain("localhost".into()), 1080);
        let addr = resolve(&spec).await.unwrap();
        assert!(addr.ip().is_loopback());
        assert_eq!(addr.port(), 1080);
    }

    #[tokio::test]
    async fn test_resolve_failure_maps_to_host_unreachable() {
        let spec = AddressSpec::new(Host::Domain("does-not-exist.invalid".into()), 80);
        let err = lookup(spec).await.unwrap_err();
        assert_eq!(err.reply(), crate::protocol::Reply::HostUnreachable);
    }
}
