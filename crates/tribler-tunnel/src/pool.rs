//! Circuit reservations for client sessions.
//!
//! A READY circuit belongs to at most one session. Sessions hand their
//! circuits back on close; broken circuits are forgotten.

use std::collections::HashMap;

use tracing::debug;

use crate::strategy::CircuitSummary;
use crate::{Result, TunnelError};

/// Identifier of a client session.
pub type SessionId = u64;

#[derive(Debug, Default)]
pub struct ReservationPool {
    sessions: HashMap<SessionId, Vec<u32>>,
    owners: HashMap<u32, SessionId>,
}

impl ReservationPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve up to `wanted` circuits for `session`, keeping the ones it
    /// already holds. Returns the full reserved set.
    ///
    /// Fails with `NotEnoughCircuits` only when the session ends up with no
    /// circuit at all; a partial reservation is topped up on later calls.
    pub fn reserve(
        &mut self,
        session: SessionId,
        wanted: usize,
        ready: &[CircuitSummary],
    ) -> Result<Vec<u32>> {
        let held = self.sessions.entry(session).or_default();
        let free: Vec<u32> = ready
            .iter()
            .map(|c| c.circuit_id)
            .filter(|id| !self.owners.contains_key(id))
            .take(wanted.saturating_sub(held.len()))
            .collect();
        for id in &free {
            self.owners.insert(*id, session);
        }
        held.extend(free);

        if held.is_empty() {
            return Err(TunnelError::NotEnoughCircuits {
                wanted,
                available: 0,
            });
        }
        debug!(session, reserved = held.len(), wanted, "reservation");
        Ok(held.clone())
    }

    pub fn circuits(&self, session: SessionId) -> &[u32] {
        self.sessions.get(&session).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn owner(&self, circuit_id: u32) -> Option<SessionId> {
        self.owners.get(&circuit_id).copied()
    }

    /// Whether `session` holds fewer than `wanted` circuits.
    pub fn is_short(&self, session: SessionId, wanted: usize) -> bool {
        self.circuits(session).len() < wanted
    }

    /// Return every circuit of `session` to the pool.
    pub fn release(&mut self, session: SessionId) -> Vec<u32> {
        let circuits = self.sessions.remove(&session).unwrap_or_default();
        for id in &circuits {
            self.owners.remove(id);
        }
        circuits
    }

    /// Drop a broken circuit. Returns the session that held it.
    pub fn forget_circuit(&mut self, circuit_id: u32) -> Option<SessionId> {
        let session = self.owners.remove(&circuit_id)?;
        if let Some(held) = self.sessions.get_mut(&session) {
            held.retain(|id| *id != circuit_id);
        }
        Some(session)
    }
}
