//! Peer identity and link keys.

use std::fmt;
use std::net::SocketAddr;

use tribler_crypto::x25519::X25519PublicKey;
use tribler_wire::CandidateEntry;

/// A verified overlay peer: address plus long-term public key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Peer {
    pub address: SocketAddr,
    pub public_key: X25519PublicKey,
}

impl Peer {
    pub fn new(address: SocketAddr, public_key: X25519PublicKey) -> Self {
        Self {
            address,
            public_key,
        }
    }
}

impl From<CandidateEntry> for Peer {
    fn from(entry: CandidateEntry) -> Self {
        Self::new(entry.address, entry.public_key)
    }
}

impl From<Peer> for CandidateEntry {
    fn from(peer: Peer) -> Self {
        Self {
            address: peer.address,
            public_key: peer.public_key,
        }
    }
}

/// A circuit id as seen on one link: `(neighbour address, circuit id)`.
///
/// This is the one canonical key for relays, direction tags, session keys
/// and exit sockets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkKey {
    pub peer: SocketAddr,
    pub circuit_id: u32,
}

impl LinkKey {
    pub fn new(peer: SocketAddr, circuit_id: u32) -> Self {
        Self { peer, circuit_id }
    }
}

impl fmt::Display for LinkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.peer, self.circuit_id)
    }
}
