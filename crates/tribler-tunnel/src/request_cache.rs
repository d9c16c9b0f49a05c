//! Deadlines for outstanding requests.
//!
//! Loop-local: the engine is the only user, so no locking.

use std::collections::HashMap;
use std::time::Instant;

use crate::peer::LinkKey;

/// What an entry waits for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RequestKey {
    /// CREATED or EXTENDED for an originated circuit.
    Circuit(u32),
    /// PONG on an originated circuit.
    Ping(u32),
    /// CREATED from the next hop of a relay we are setting up.
    Relay(LinkKey),
}

impl RequestKey {
    fn circuit_id(&self) -> Option<u32> {
        match self {
            Self::Circuit(id) | Self::Ping(id) => Some(*id),
            Self::Relay(_) => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct RequestCache {
    deadlines: HashMap<RequestKey, Instant>,
}

impl RequestCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or re-arm an entry.
    pub fn insert(&mut self, key: RequestKey, deadline: Instant) {
        self.deadlines.insert(key, deadline);
    }

    pub fn contains(&self, key: &RequestKey) -> bool {
        self.deadlines.contains_key(key)
    }

    /// Remove an entry; returns whether it was present.
    pub fn pop(&mut self, key: &RequestKey) -> bool {
        self.deadlines.remove(key).is_some()
    }

    /// Remove every entry belonging to an originated circuit.
    pub fn remove_circuit(&mut self, circuit_id: u32) {
        self.deadlines
            .retain(|key, _| key.circuit_id() != Some(circuit_id));
    }

    /// Remove and return the entries whose deadline has passed.
    pub fn expire(&mut self, now: Instant) -> Vec<RequestKey> {
        let mut expired: Vec<RequestKey> = self
            .deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(key, _)| *key)
            .collect();
        for key in &expired {
            self.deadlines.remove(key);
        }
        expired.sort_by_key(|k| self.order(k));
        expired
    }

    fn order(&self, key: &RequestKey) -> (u8, u32) {
        match key {
            RequestKey::Circuit(id) => (0, *id),
            RequestKey::Ping(id) => (1, *id),
            RequestKey::Relay(link) => (2, link.circuit_id),
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.values().min().copied()
    }

    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_expiry() {
        let t0 = Instant::now();
        let mut cache = RequestCache::new();
        cache.insert(RequestKey::Circuit(1), t0 + Duration::from_secs(5));
        cache.insert(RequestKey::Ping(2), t0 + Duration::from_secs(2));

        assert!(cache.expire(t0 + Duration::from_secs(1)).is_empty());
        assert_eq!(cache.next_deadline(), Some(t0 + Duration::from_secs(2)));
        assert_eq!(
            cache.expire(t0 + Duration::from_secs(5)),
            vec![RequestKey::Circuit(1), RequestKey::Ping(2)]
        );
        assert!(cache.is_empty());
    }

    #[test]
    fn test_rearm_and_remove_circuit() {
        let t0 = Instant::now();
        let mut cache = RequestCache::new();
        cache.insert(RequestKey::Circuit(1), t0);
        cache.insert(RequestKey::Circuit(1), t0 + Duration::from_secs(5));
        assert!(cache.expire(t0 + Duration::from_secs(1)).is_empty());

        let link = LinkKey::new("127.0.0.1:1".parse().expect("addr"), 1);
        cache.insert(RequestKey::Ping(1), t0);
        cache.insert(RequestKey::Relay(link), t0);
        cache.remove_circuit(1);
        assert_eq!(cache.len(), 1);
        assert!(cache.pop(&RequestKey::Relay(link)));
        assert!(!cache.pop(&RequestKey::Relay(link)));
    }
}
