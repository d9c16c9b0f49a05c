//! Circuit, relay, direction and destination maps.
//!
//! The bundle sits behind one coarse mutex so the stats sampler and the
//! crawler writer can read a consistent snapshot. All writes happen on the
//! engine loop.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use tribler_wire::HostPort;

use crate::circuit::Circuit;
use crate::peer::LinkKey;
use crate::relay::{Direction, RelayRoute};
use crate::strategy::CircuitSummary;

/// Tables shared between the engine and readers.
pub type SharedTables = Arc<Mutex<TunnelTables>>;

/// Lock the shared tables. A poisoned lock is recovered: the tables hold
/// no invariant that a panicking reader could have broken.
pub fn lock(tables: &SharedTables) -> MutexGuard<'_, TunnelTables> {
    tables.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
pub struct TunnelTables {
    pub circuits: HashMap<u32, Circuit>,
    pub relays: HashMap<LinkKey, RelayRoute>,
    pub directions: HashMap<LinkKey, Direction>,
    pub destinations: HashMap<HostPort, u32>,
}

impl TunnelTables {
    pub fn shared() -> SharedTables {
        Arc::new(Mutex::new(Self::default()))
    }

    /// Install both sides of a relay. `toward_originator` is the link the
    /// EXTEND came in on; `toward_exit` is the new link to the next hop.
    pub fn insert_relay_pair(&mut self, toward_originator: LinkKey, toward_exit: LinkKey, now: Instant) {
        self.relays
            .insert(toward_originator, RelayRoute::new(toward_exit, now));
        self.relays
            .insert(toward_exit, RelayRoute::new(toward_originator, now));
        // Packets from the originator side travel to the exit, and back.
        self.directions.insert(toward_originator, Direction::Endpoint);
        self.directions.insert(toward_exit, Direction::Originator);
    }

    /// Mark both sides online.
    pub fn set_online(&mut self, key: &LinkKey) -> Option<LinkKey> {
        let mate = self.relays.get_mut(key).map(|r| {
            r.online = true;
            r.mate
        })?;
        if let Some(route) = self.relays.get_mut(&mate) {
            route.online = true;
        }
        Some(mate)
    }

    /// Remove one side only.
    pub fn remove_relay_side(&mut self, key: &LinkKey) -> Option<RelayRoute> {
        self.directions.remove(key);
        self.relays.remove(key)
    }

    /// Remove a side and its mate. Returns the removed keys.
    pub fn remove_relay_pair(&mut self, key: &LinkKey) -> Vec<LinkKey> {
        let mut removed = Vec::with_capacity(2);
        if let Some(route) = self.remove_relay_side(key) {
            removed.push(*key);
            if self.remove_relay_side(&route.mate).is_some() {
                removed.push(route.mate);
            }
        }
        removed
    }

    /// Whether `id` is taken for a new link towards `peer`.
    pub fn id_in_use(&self, peer: std::net::SocketAddr, id: u32) -> bool {
        self.circuits.contains_key(&id) || self.relays.contains_key(&LinkKey::new(peer, id))
    }

    /// READY circuits, sorted by id.
    pub fn ready_circuits(&self) -> Vec<CircuitSummary> {
        let mut ready: Vec<_> = self
            .circuits
            .values()
            .filter(|c| c.is_ready())
            .map(Circuit::summary)
            .collect();
        ready.sort_by_key(|c| c.circuit_id);
        ready
    }

    /// Circuits not yet broken, excluding the zero-hop circuit.
    pub fn live_circuit_count(&self) -> usize {
        self.circuits.values().filter(|c| !c.is_zero_hop()).count()
    }

    /// Drop every destination mapped to `circuit_id`.
    pub fn forget_destinations(&mut self, circuit_id: u32) {
        self.destinations.retain(|_, id| *id != circuit_id);
    }
}
