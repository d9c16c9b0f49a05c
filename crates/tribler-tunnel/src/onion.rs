//! Layering policy.
//!
//! | Where | Direction | Transform |
//! |---|---|---|
//! | originator, sending | outward | encrypt with every hop key, farthest first |
//! | originator, receiving | inward | decrypt with every hop key, nearest first |
//! | relay, tag ENDPOINT | outward | decrypt with the key of the arrival link |
//! | relay, tag ORIGINATOR | inward | encrypt with the key of the mate link |
//! | end of circuit, receiving | outward | decrypt with the link key |
//! | end of circuit, sending | inward | encrypt with the link key |
//!
//! CREATE and CREATED are never layered; CREATE is wrapped under the
//! recipient's long-term key instead.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tribler_crypto::layer::SessionKey;

use crate::circuit::Circuit;
use crate::peer::LinkKey;
use crate::relay::Direction;

/// Add the originator's layers to an outgoing body.
pub fn wrap_outgoing(circuit: &Circuit, body: &mut [u8]) {
    for key in circuit.session_keys().rev() {
        key.encrypt(body);
    }
}

/// Peel the originator's layers off an incoming body.
pub fn peel_incoming(circuit: &Circuit, body: &mut [u8]) {
    for key in circuit.session_keys() {
        key.decrypt(body);
    }
}

/// One relay step. `key` is the arrival link's key for [`Direction::Endpoint`]
/// and the mate's key for [`Direction::Originator`].
pub fn relay_transform(direction: Direction, key: &SessionKey, body: &mut [u8]) {
    match direction {
        Direction::Originator => key.encrypt(body),
        Direction::Endpoint => key.decrypt(body),
    }
}

/// A key we agreed on when another node extended onto us.
#[derive(Clone, Debug)]
pub struct LinkSession {
    pub key: SessionKey,
    pub last_incoming: Instant,
}

/// `(peer, circuit id) -> session key`, with liveness.
#[derive(Debug, Default)]
pub struct SessionKeyTable {
    links: HashMap<LinkKey, LinkSession>,
}

impl SessionKeyTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, link: LinkKey, key: SessionKey, now: Instant) {
        self.links.insert(
            link,
            LinkSession {
                key,
                last_incoming: now,
            },
        );
    }

    pub fn get(&self, link: &LinkKey) -> Option<&SessionKey> {
        self.links.get(link).map(|s| &s.key)
    }

    pub fn contains(&self, link: &LinkKey) -> bool {
        self.links.contains_key(link)
    }

    pub fn touch(&mut self, link: &LinkKey, now: Instant) {
        if let Some(session) = self.links.get_mut(link) {
            session.last_incoming = now;
        }
    }

    pub fn remove(&mut self, link: &LinkKey) -> Option<SessionKey> {
        self.links.remove(link).map(|s| s.key)
    }

    /// Links idle for at least `timeout`, excluding those `keep` accepts.
    pub fn idle(&self, now: Instant, timeout: Duration, keep: impl Fn(&LinkKey) -> bool) -> Vec<LinkKey> {
        self.links
            .iter()
            .filter(|(link, s)| now.saturating_duration_since(s.last_incoming) >= timeout && !keep(link))
            .map(|(link, _)| *link)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}
