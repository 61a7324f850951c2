/*
 * ptio - Event loop, non-blocking sockets and HTTP messaging over mio
 * This is free and unencumbered software released into the public domain.
 */
use std::fmt::{Display, Formatter};
use std::io::{Error as IoError, ErrorKind};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::sync::Arc;

use log::trace;

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Host {
    Name(Arc<str>),
    Addr(IpAddr),
}

/// Address of a socket: a host name or IP address plus a port
///
/// Cheap to clone; host names are shared, not copied.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    host: Host,
    port: u16,
}

impl Endpoint {
    /// Creates an endpoint from a host name or a textual IP address.
    pub fn new(host: &str, port: u16) -> Self {
        let host = match host.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>() {
            Ok(addr) => Host::Addr(addr),
            Err(_) => Host::Name(Arc::from(host)),
        };
        Self { host, port }
    }

    pub fn from_ip(addr: IpAddr, port: u16) -> Self {
        Self {
            host: Host::Addr(addr),
            port,
        }
    }

    pub fn ip4_any(port: u16) -> Self {
        Self::from_ip(Ipv4Addr::UNSPECIFIED.into(), port)
    }

    pub fn ip4_loopback(port: u16) -> Self {
        Self::from_ip(Ipv4Addr::LOCALHOST.into(), port)
    }

    pub fn ip4_broadcast(port: u16) -> Self {
        Self::from_ip(Ipv4Addr::BROADCAST.into(), port)
    }

    pub fn ip6_any(port: u16) -> Self {
        Self::from_ip(Ipv6Addr::UNSPECIFIED.into(), port)
    }

    pub fn ip6_loopback(port: u16) -> Self {
        Self::from_ip(Ipv6Addr::LOCALHOST.into(), port)
    }

    pub fn host(&self) -> &Host {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Resolves the endpoint into one or more socket addresses, in the order
    /// they should be tried. Fails if the name does not resolve.
    pub fn resolve(&self) -> Result<Vec<SocketAddr>> {
        let addrs: Vec<SocketAddr> = match &self.host {
            Host::Addr(addr) => vec![SocketAddr::new(*addr, self.port)],
            Host::Name(name) => (name.as_ref(), self.port).to_socket_addrs()?.collect(),
        };
        trace!("Resolved {} to {:?}", self, addrs);
        match addrs.is_empty() {
            true => Err(IoError::new(ErrorKind::NotFound, format!("no address found for {}", self)).into()),
            false => Ok(addrs),
        }
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::from_ip(addr.ip(), addr.port())
    }
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.host {
            Host::Name(name) => write!(f, "{}:{}", name, self.port),
            Host::Addr(IpAddr::V6(addr)) => write!(f, "[{}]:{}", addr, self.port),
            Host::Addr(IpAddr::V4(addr)) => write!(f, "{}:{}", addr, self.port),
        }
    }
}
