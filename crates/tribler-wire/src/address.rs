//! Host/port pairs as carried in EXTEND, DATA and PUNCTURE bodies.
//!
//! The wire encodes a host as raw UTF-8 and a port as a u32. The pair
//! `("0.0.0.0", 0)` is reserved: as a DATA destination it means "deliver to
//! the originator", as an origin it means "no origin".

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use crate::{Result, WireError};

/// Host carried by the unspecified address.
pub const UNSPECIFIED_HOST: &str = "0.0.0.0";

/// A host (IP literal or DNS name) and port.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct HostPort {
    /// IP literal or DNS name.
    pub host: String,
    /// UDP port.
    pub port: u16,
}

impl HostPort {
    /// Create a host/port pair.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// The reserved `("0.0.0.0", 0)` pair.
    pub fn unspecified() -> Self {
        Self::new(UNSPECIFIED_HOST, 0)
    }

    /// Whether this is the reserved `("0.0.0.0", 0)` pair.
    pub fn is_unspecified(&self) -> bool {
        self.port == 0 && (self.host == UNSPECIFIED_HOST || self.host.is_empty())
    }

    /// Resolve without DNS: succeeds only for IP literals.
    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        self.host
            .parse::<IpAddr>()
            .ok()
            .map(|ip| SocketAddr::new(ip, self.port))
    }

    /// Map the reserved pair to `None`.
    pub fn into_option(self) -> Option<Self> {
        if self.is_unspecified() {
            None
        } else {
            Some(self)
        }
    }

    pub(crate) fn from_wire(host: &[u8], port: u32) -> Result<Self> {
        let port = u16::try_from(port)
            .map_err(|_| WireError::Inconsistent(format!("port {port} out of range")))?;
        let host = std::str::from_utf8(host)
            .map_err(|_| WireError::Inconsistent("host is not UTF-8".into()))?;
        Ok(Self::new(host, port))
    }
}

impl From<SocketAddr> for HostPort {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

impl Default for HostPort {
    fn default() -> Self {
        Self::new(Ipv4Addr::UNSPECIFIED.to_string(), 0)
    }
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unspecified() {
        assert!(HostPort::unspecified().is_unspecified());
        assert!(HostPort::default().is_unspecified());
        assert!(!HostPort::new("0.0.0.0", 53).is_unspecified());
        assert_eq!(HostPort::unspecified().into_option(), None);
    }

    #[test]
    fn test_socket_addr_conversion() {
        let addr: SocketAddr = "127.0.0.1:9999".parse().expect("addr");
        let hp = HostPort::from(addr);
        assert_eq!(hp.to_string(), "127.0.0.1:9999");
        assert_eq!(hp.to_socket_addr(), Some(addr));
        assert_eq!(HostPort::new("example.org", 53).to_socket_addr(), None);
    }

    #[test]
    fn test_port_range_checked() {
        assert!(HostPort::from_wire(b"1.2.3.4", 70_000).is_err());
        assert!(HostPort::from_wire(&[0xFF, 0xFE], 1).is_err());
    }
}
