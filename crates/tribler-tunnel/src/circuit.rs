//! Originator-side circuits.
//!
//! A circuit grows one [`Hop`] per CREATED/EXTENDED. While an extension is
//! outstanding the pending hop lives in `unverified` together with our DH
//! secret for it; at most one extension is outstanding at a time.
//!
//! ## States
//!
//! ```text
//! EXTENDING --(len(hops) == goal)--> READY
//!     |                                |
//!     +------(timeout / failure)-------+--> BROKEN (removed from the tables)
//! ```

use std::net::SocketAddr;
use std::time::Instant;

use tribler_crypto::dh::DhSecret;
use tribler_crypto::layer::SessionKey;

use crate::peer::Peer;
use crate::strategy::{CircuitSummary, ExtendStrategy};

/// Derived circuit state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CircuitState {
    Extending,
    Ready,
    Broken,
}

/// A confirmed hop.
#[derive(Clone, Debug)]
pub struct Hop {
    /// `None` when the previous hop picked this one for us.
    pub peer: Option<Peer>,
    pub session_key: SessionKey,
}

/// The hop whose CREATED/EXTENDED we are waiting for.
pub struct UnverifiedHop {
    pub peer: Option<Peer>,
    pub dh_secret: DhSecret,
}

impl std::fmt::Debug for UnverifiedHop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnverifiedHop")
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

/// A circuit this node originated.
#[derive(Debug)]
pub struct Circuit {
    id: u32,
    goal_hops: usize,
    first_hop: Peer,
    hops: Vec<Hop>,
    unverified: Option<UnverifiedHop>,
    broken: bool,
    pub(crate) extend_strategy: Box<dyn ExtendStrategy>,
    created_at: Instant,
    pub last_incoming: Instant,
    pub bytes_up: u64,
    pub bytes_down: u64,
}

impl Circuit {
    pub fn new(
        id: u32,
        goal_hops: usize,
        first_hop: Peer,
        extend_strategy: Box<dyn ExtendStrategy>,
        now: Instant,
    ) -> Self {
        Self {
            id,
            goal_hops,
            first_hop,
            hops: Vec::with_capacity(goal_hops),
            unverified: None,
            broken: false,
            extend_strategy,
            created_at: now,
            last_incoming: now,
            bytes_up: 0,
            bytes_down: 0,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn goal_hops(&self) -> usize {
        self.goal_hops
    }

    pub fn first_hop(&self) -> &Peer {
        &self.first_hop
    }

    pub fn hops(&self) -> &[Hop] {
        &self.hops
    }

    pub fn unverified(&self) -> Option<&UnverifiedHop> {
        self.unverified.as_ref()
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn state(&self) -> CircuitState {
        if self.broken {
            CircuitState::Broken
        } else if self.hops.len() >= self.goal_hops && self.unverified.is_none() {
            CircuitState::Ready
        } else {
            CircuitState::Extending
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state() == CircuitState::Ready
    }

    /// Zero-hop circuits exit from this node in clear text.
    pub fn is_zero_hop(&self) -> bool {
        self.goal_hops == 0
    }

    /// Known addresses of confirmed and pending hops.
    pub fn addresses(&self) -> Vec<SocketAddr> {
        self.hops
            .iter()
            .filter_map(|h| h.peer.map(|p| p.address))
            .chain(self.unverified.iter().filter_map(|u| u.peer.map(|p| p.address)))
            .collect()
    }

    /// Start waiting for a hop. Replaces any stale pending hop.
    pub fn set_unverified(&mut self, hop: UnverifiedHop) {
        self.unverified = Some(hop);
    }

    pub fn take_unverified(&mut self) -> Option<UnverifiedHop> {
        self.unverified.take()
    }

    /// Confirm a hop. Returns the new state.
    pub fn add_hop(&mut self, hop: Hop) -> CircuitState {
        self.hops.push(hop);
        self.state()
    }

    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    pub fn summary(&self) -> CircuitSummary {
        CircuitSummary {
            circuit_id: self.id,
            hops: self.goal_hops,
        }
    }

    /// Session keys of confirmed hops, nearest first.
    pub fn session_keys(&self) -> impl DoubleEndedIterator<Item = &SessionKey> {
        self.hops.iter().map(|h| &h.session_key)
    }
}
