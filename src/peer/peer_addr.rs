use std::fmt::{Debug, Display, Formatter};
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use anyhow::anyhow;


/// A peer's listening endpoint. Its string form `host:port` (with brackets for IPv6) is the key
///  under which the connection pool caches links.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct PeerAddress {
    pub host: IpAddr,
    pub port: u16,
}

impl PeerAddress {
    pub fn new(host: IpAddr, port: u16) -> PeerAddress {
        PeerAddress { host, port }
    }

    #[cfg(test)]
    pub fn localhost(port: u16) -> PeerAddress {
        PeerAddress::new(std::net::Ipv4Addr::LOCALHOST.into(), port)
    }

    pub fn key(&self) -> String {
        self.to_string()
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

impl Debug for PeerAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]", self.socket_addr())
    }
}
impl Display for PeerAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}

impl From<SocketAddr> for PeerAddress {
    fn from(value: SocketAddr) -> Self {
        PeerAddress::new(value.ip(), value.port())
    }
}

impl FromStr for PeerAddress {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let addr = SocketAddr::from_str(s)
            .map_err(|e| anyhow!("invalid peer address {:?}: {}", s, e))?;
        Ok(addr.into())
    }
}
