//! # tribler-socks
//!
//! SOCKS5 ingress (RFC 1928) for the anonymous tunnel.
//!
//! Only the no-authentication method and `UDP ASSOCIATE` are supported.
//! Every association reserves a set of circuits from the tunnel runtime and
//! relays the client's UDP datagrams through them.
//!
//! - [`codec`] - Method negotiation, requests and replies on the TCP control connection
//! - [`udp`] - The UDP request header of RFC 1928 §7
//! - [`server`] - TCP listener
//! - [`session`] - One UDP association

pub mod codec;
pub mod server;
pub mod session;
pub mod udp;

use std::time::Duration;

/// Protocol version byte.
pub const SOCKS_VERSION: u8 = 0x05;

/// Default listen port.
pub const DEFAULT_PORT: u16 = 1080;

/// Circuits reserved per association.
pub const DEFAULT_CIRCUITS_PER_SESSION: usize = 4;

/// How long an association may wait for its circuits.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(10);

/// SOCKS5 errors.
#[derive(Debug, thiserror::Error)]
pub enum SocksError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unsupported SOCKS version {0:#04x}")]
    UnsupportedVersion(u8),

    /// The client offered no method we accept.
    #[error("no acceptable authentication method")]
    NoAcceptableMethod,

    #[error("unsupported command {0:#04x}")]
    UnsupportedCommand(u8),

    #[error("unsupported address type {0:#04x}")]
    UnsupportedAddressType(u8),

    /// UDP fragmentation is not supported.
    #[error("fragmented datagram (FRAG {0})")]
    Fragmented(u8),

    #[error("truncated message: needed {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("domain name is not UTF-8")]
    InvalidDomain,

    #[error("tunnel error: {0}")]
    Tunnel(#[from] tribler_tunnel::TunnelError),
}

/// Convenience result type for SOCKS operations.
pub type Result<T> = std::result::Result<T, SocksError>;

/// Listener and per-association settings.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SocksSettings {
    pub port: u16,
    pub circuits_per_session: usize,
    pub grace: Duration,
}

impl Default for SocksSettings {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            circuits_per_session: DEFAULT_CIRCUITS_PER_SESSION,
            grace: DEFAULT_GRACE,
        }
    }
}

pub use codec::{Command, Reply, Request};
pub use server::SocksServer;
