//! The slice of the overlay substrate the engine consumes.
//!
//! Peer discovery and membership live outside this crate. The engine only
//! needs to send datagrams and to ask for verified candidates.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use crate::peer::Peer;

/// Unreliable datagram delivery.
pub trait Endpoint: Send {
    /// Send one datagram. Failures are logged by the implementation and
    /// otherwise ignored.
    fn send(&self, to: SocketAddr, datagram: &[u8]);
}

/// Source of verified peers with known long-term keys.
pub trait CandidateSource: Send + Sync {
    fn verified_candidates(&self) -> Vec<Peer>;
}

/// A shared, mutable candidate list.
#[derive(Clone, Debug, Default)]
pub struct PeerList {
    peers: Arc<Mutex<Vec<Peer>>>,
}

impl PeerList {
    pub fn new(peers: Vec<Peer>) -> Self {
        Self {
            peers: Arc::new(Mutex::new(peers)),
        }
    }

    /// Add a peer, replacing any entry with the same address.
    pub fn add(&self, peer: Peer) {
        let mut peers = self.peers.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = peers.iter_mut().find(|p| p.address == peer.address) {
            *existing = peer;
        } else {
            peers.push(peer);
        }
    }

    /// Remove the peer at `address`.
    pub fn remove(&self, address: SocketAddr) {
        self.peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|p| p.address != address);
    }

    pub fn len(&self) -> usize {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CandidateSource for PeerList {
    fn verified_candidates(&self) -> Vec<Peer> {
        self.peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tribler_crypto::x25519::X25519PublicKey;

    fn peer(port: u16, key: u8) -> Peer {
        Peer::new(
            SocketAddr::from(([127, 0, 0, 1], port)),
            X25519PublicKey::from_bytes([key; 32]),
        )
    }

    #[test]
    fn test_peer_list_replaces_by_address() {
        let list = PeerList::default();
        list.add(peer(1, 1));
        list.add(peer(2, 2));
        list.add(peer(1, 3));
        let peers = list.verified_candidates();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].public_key, X25519PublicKey::from_bytes([3; 32]));

        list.remove(peer(2, 2).address);
        assert_eq!(list.len(), 1);
    }
}
