//! Intermediate-side relay routes.
//!
//! A relay ties two links together. Each side gets its own [`RelayRoute`]
//! pointing at the other (its mate), plus a [`Direction`] tag recording
//! where packets arriving on that side are headed.

use std::time::Instant;

use crate::peer::LinkKey;

/// Travel direction of packets arriving on a link.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Heading back to the originator: add a layer.
    Originator,
    /// Heading towards the exit: remove a layer.
    Endpoint,
}

/// One side of a relay.
#[derive(Clone, Debug)]
pub struct RelayRoute {
    pub mate: LinkKey,
    /// False until the next hop answered the forwarded CREATE.
    pub online: bool,
    pub created_at: Instant,
    pub last_incoming: Instant,
    /// Bytes that arrived on this side.
    pub bytes: u64,
}

impl RelayRoute {
    pub fn new(mate: LinkKey, now: Instant) -> Self {
        Self {
            mate,
            online: false,
            created_at: now,
            last_incoming: now,
            bytes: 0,
        }
    }
}
