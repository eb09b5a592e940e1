//! Endpoint URI parsing and resolution.
//!
//! Channels and adapters are addressed with `tcp:host:port` URIs
//! (`tcp://host:port` is tolerated). The host may be a name, an IPv4
//! address, or a bracketed IPv6 address.

use std::net::{SocketAddr, ToSocketAddrs};

use crate::error::{Error, ErrorKind, Result};

/// A parsed `tcp:host:port` endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    /// Returns the `host:port` authority string accepted by the resolver.
    pub(crate) fn authority(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Resolves the endpoint into an ordered list of candidate addresses.
    pub(crate) fn resolve(&self) -> Result<Vec<SocketAddr>> {
        let candidates: Vec<SocketAddr> = self
            .authority()
            .to_socket_addrs()
            .map_err(|err| Error::with_io(ErrorKind::Resolve, err))?
            .collect();
        if candidates.is_empty() {
            return Err(Error::new(ErrorKind::Resolve));
        }
        Ok(candidates)
    }
}

/// Parses an endpoint URI into host and port.
pub(crate) fn parse(uri: &str) -> Result<Endpoint> {
    let rest = uri
        .strip_prefix("tcp:")
        .ok_or_else(|| Error::new(ErrorKind::Endpoint))?;
    let rest = rest.strip_prefix("//").unwrap_or(rest);

    let (host, port) = rest
        .rsplit_once(':')
        .ok_or_else(|| Error::new(ErrorKind::Endpoint))?;
    if host.is_empty() {
        return Err(Error::new(ErrorKind::Endpoint));
    }
    let port: u16 = port.parse().map_err(|_| Error::new(ErrorKind::Endpoint))?;

    Ok(Endpoint {
        host: host.to_string(),
        port,
    })
}
