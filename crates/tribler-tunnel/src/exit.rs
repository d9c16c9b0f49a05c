//! Exit sockets: clear-text UDP on behalf of circuits ending here.
//!
//! One socket per link, opened on the first DATA with a destination and
//! closed when the link or circuit goes away. Replies come back to the
//! engine through [`TunnelEngine::on_exit_reply`](crate::TunnelEngine::on_exit_reply).

use std::collections::HashMap;
use std::io;
use std::time::Instant;

use tracing::debug;
use tribler_wire::HostPort;

use crate::peer::LinkKey;

/// A UDP socket owned by one link. Closed on drop.
pub trait ExitSocket: Send {
    fn send_to(&mut self, destination: &HostPort, payload: &[u8]) -> io::Result<usize>;
}

/// Opens exit sockets.
pub trait ExitFactory: Send {
    fn open(&mut self, link: LinkKey) -> io::Result<Box<dyn ExitSocket>>;
}

struct ExitEntry {
    socket: Box<dyn ExitSocket>,
    last_used: Instant,
}

/// Open exit sockets, keyed by link.
pub struct ExitTable {
    factory: Box<dyn ExitFactory>,
    sockets: HashMap<LinkKey, ExitEntry>,
}

impl ExitTable {
    pub fn new(factory: Box<dyn ExitFactory>) -> Self {
        Self {
            factory,
            sockets: HashMap::new(),
        }
    }

    /// Find or open the socket of `link` and send through it.
    pub fn send(
        &mut self,
        link: LinkKey,
        destination: &HostPort,
        payload: &[u8],
        now: Instant,
    ) -> io::Result<usize> {
        let entry = match self.sockets.entry(link) {
            std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
            std::collections::hash_map::Entry::Vacant(e) => {
                debug!(%link, "opening exit socket");
                e.insert(ExitEntry {
                    socket: self.factory.open(link)?,
                    last_used: now,
                })
            }
        };
        entry.last_used = now;
        entry.socket.send_to(destination, payload)
    }

    pub fn contains(&self, link: &LinkKey) -> bool {
        self.sockets.contains_key(link)
    }

    /// Mark a socket used by an incoming reply.
    pub fn touch(&mut self, link: &LinkKey, now: Instant) {
        if let Some(entry) = self.sockets.get_mut(link) {
            entry.last_used = now;
        }
    }

    pub fn last_used(&self, link: &LinkKey) -> Option<Instant> {
        self.sockets.get(link).map(|e| e.last_used)
    }

    /// Close the socket of `link`, if any.
    pub fn close(&mut self, link: &LinkKey) -> bool {
        let closed = self.sockets.remove(link).is_some();
        if closed {
            debug!(%link, "closed exit socket");
        }
        closed
    }

    pub fn links(&self) -> Vec<LinkKey> {
        self.sockets.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.sockets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sockets.is_empty()
    }
}
