//! In-memory overlay for deterministic tests.
//!
//! A [`MemoryNetwork`] runs several engines in one thread. Datagrams are
//! queued on a shared outbox and delivered in FIFO order by
//! [`MemoryNetwork::pump`]; nothing moves until the test asks for it.

use std::collections::{HashSet, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tribler_crypto::x25519::X25519StaticSecret;
use tribler_wire::{BypassTag, HostPort, RawFrame, StatsReport};

use crate::engine::{EngineIo, TunnelEngine};
use crate::exit::{ExitFactory, ExitSocket};
use crate::observer::{TunnelEvent, TunnelObserver};
use crate::overlay::{Endpoint, PeerList};
use crate::peer::{LinkKey, Peer};
use crate::settings::TunnelSettings;

/// Upper bound on deliveries per [`MemoryNetwork::pump`].
const MAX_DELIVERIES: usize = 10_000;

/// A datagram in flight.
#[derive(Clone, Debug)]
pub struct Envelope {
    pub from: SocketAddr,
    pub to: SocketAddr,
    pub datagram: Vec<u8>,
}

type Outbox = Arc<Mutex<VecDeque<Envelope>>>;

/// Endpoint that appends to a shared outbox.
#[derive(Clone, Debug)]
pub struct MemoryEndpoint {
    address: SocketAddr,
    outbox: Outbox,
}

impl MemoryEndpoint {
    pub fn new(address: SocketAddr, outbox: Outbox) -> Self {
        Self { address, outbox }
    }
}

impl Endpoint for MemoryEndpoint {
    fn send(&self, to: SocketAddr, datagram: &[u8]) {
        self.outbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(Envelope {
                from: self.address,
                to,
                datagram: datagram.to_vec(),
            });
    }
}

/// One clear-text send performed by an exit socket.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExitSend {
    pub link: LinkKey,
    pub destination: HostPort,
    pub payload: Vec<u8>,
}

/// Exit factory recording every send instead of touching the network.
#[derive(Clone, Debug, Default)]
pub struct MemoryExitFactory {
    sent: Arc<Mutex<Vec<ExitSend>>>,
    failing: bool,
}

impl MemoryExitFactory {
    /// A factory whose sockets refuse every send.
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    pub fn sent(&self) -> Arc<Mutex<Vec<ExitSend>>> {
        Arc::clone(&self.sent)
    }
}

impl ExitFactory for MemoryExitFactory {
    fn open(&mut self, link: LinkKey) -> io::Result<Box<dyn ExitSocket>> {
        Ok(Box::new(MemoryExitSocket {
            link,
            sent: Arc::clone(&self.sent),
            failing: self.failing,
        }))
    }
}

struct MemoryExitSocket {
    link: LinkKey,
    sent: Arc<Mutex<Vec<ExitSend>>>,
    failing: bool,
}

impl ExitSocket for MemoryExitSocket {
    fn send_to(&mut self, destination: &HostPort, payload: &[u8]) -> io::Result<usize> {
        if self.failing {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "exit disabled"));
        }
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(ExitSend {
                link: self.link,
                destination: destination.clone(),
                payload: payload.to_vec(),
            });
        Ok(payload.len())
    }
}

/// Observer that keeps every event.
#[derive(Clone, Debug, Default)]
pub struct RecordingObserver {
    events: Arc<Mutex<Vec<TunnelEvent>>>,
}

impl RecordingObserver {
    pub fn events(&self) -> Vec<TunnelEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn clear(&self) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn push(&self, event: TunnelEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

impl TunnelObserver for RecordingObserver {
    fn on_circuit_ready(&mut self, circuit_id: u32, hops: usize) {
        self.push(TunnelEvent::CircuitReady { circuit_id, hops });
    }

    fn on_break_circuit(&mut self, circuit_id: u32, reason: &str) {
        self.push(TunnelEvent::BreakCircuit {
            circuit_id,
            reason: reason.to_string(),
        });
    }

    fn on_tunnel_data(&mut self, circuit_id: u32, origin: Option<&HostPort>, payload: &[u8]) {
        self.push(TunnelEvent::TunnelData {
            circuit_id,
            origin: origin.cloned(),
            payload: payload.to_vec(),
        });
    }

    fn on_tunnel_stats(&mut self, peer: SocketAddr, report: &StatsReport) {
        self.push(TunnelEvent::TunnelStats {
            peer,
            report: report.clone(),
        });
    }

    fn on_exiting_from_tunnel(&mut self, link: LinkKey, destination: &HostPort) {
        self.push(TunnelEvent::ExitingFromTunnel {
            link,
            destination: destination.clone(),
        });
    }
}

/// A delivered frame, as seen on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TraceEntry {
    pub from: SocketAddr,
    pub to: SocketAddr,
    pub type_byte: u8,
    pub circuit_id: u32,
}

/// One engine and its test handles.
pub struct MemoryNode {
    pub engine: TunnelEngine,
    pub peer: Peer,
    pub observer: RecordingObserver,
    pub exits: Arc<Mutex<Vec<ExitSend>>>,
    pub candidates: PeerList,
}

impl MemoryNode {
    pub fn events(&self) -> Vec<TunnelEvent> {
        self.observer.events()
    }

    pub fn exit_sends(&self) -> Vec<ExitSend> {
        self.exits
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Engines wired to each other through an in-memory outbox.
pub struct MemoryNetwork {
    nodes: Vec<MemoryNode>,
    outbox: Outbox,
    bypass_tag: BypassTag,
    muted: HashSet<SocketAddr>,
    trace: Vec<TraceEntry>,
}

impl MemoryNetwork {
    /// `count` nodes on `127.0.0.1:7000+i`, each knowing every other node
    /// as a verified candidate.
    pub fn new(count: usize, settings: &TunnelSettings, now: Instant) -> Self {
        Self::with_settings(vec![settings.clone(); count], now)
    }

    /// One node per settings entry.
    pub fn with_settings(settings: Vec<TunnelSettings>, now: Instant) -> Self {
        let outbox: Outbox = Arc::default();
        let bypass_tag = settings
            .first()
            .map(|s| s.bypass_tag.clone())
            .unwrap_or_default();

        let secrets: Vec<(SocketAddr, X25519StaticSecret)> = (0..settings.len())
            .map(|i| {
                let address = SocketAddr::from(([127, 0, 0, 1], 7000 + i as u16));
                (address, X25519StaticSecret::from_bytes([i as u8 + 1; 32]))
            })
            .collect();
        let peers: Vec<Peer> = secrets
            .iter()
            .map(|(address, secret)| Peer::new(*address, secret.public_key()))
            .collect();

        let nodes = secrets
            .into_iter()
            .zip(settings)
            .enumerate()
            .map(|(i, ((address, secret), settings))| {
                let candidates = PeerList::new(
                    peers
                        .iter()
                        .filter(|p| p.address != address)
                        .copied()
                        .collect(),
                );
                let exits = MemoryExitFactory::default();
                let sent = exits.sent();
                let io = EngineIo {
                    endpoint: Box::new(MemoryEndpoint::new(address, Arc::clone(&outbox))),
                    candidates: Arc::new(candidates.clone()),
                    exits: Box::new(exits),
                };
                let mut engine = TunnelEngine::new(
                    secret,
                    address,
                    settings,
                    io,
                    StdRng::seed_from_u64(i as u64),
                    now,
                );
                let observer = RecordingObserver::default();
                engine.add_observer(Box::new(observer.clone()));
                MemoryNode {
                    peer: engine.own_peer(),
                    engine,
                    observer,
                    exits: sent,
                    candidates,
                }
            })
            .collect();

        Self {
            nodes,
            outbox,
            bypass_tag,
            muted: HashSet::new(),
            trace: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, index: usize) -> &MemoryNode {
        &self.nodes[index]
    }

    pub fn node_mut(&mut self, index: usize) -> &mut MemoryNode {
        &mut self.nodes[index]
    }

    pub fn engine(&mut self, index: usize) -> &mut TunnelEngine {
        &mut self.nodes[index].engine
    }

    pub fn peer(&self, index: usize) -> Peer {
        self.nodes[index].peer
    }

    pub fn address(&self, index: usize) -> SocketAddr {
        self.nodes[index].peer.address
    }

    pub fn index_of(&self, address: SocketAddr) -> Option<usize> {
        self.nodes.iter().position(|n| n.peer.address == address)
    }

    /// Drop everything addressed to `index` from now on.
    pub fn mute(&mut self, index: usize) {
        let address = self.address(index);
        self.muted.insert(address);
    }

    pub fn unmute(&mut self, index: usize) {
        let address = self.address(index);
        self.muted.remove(&address);
    }

    /// Inject a raw datagram as if `from` had sent it.
    pub fn inject(&mut self, from: SocketAddr, to: SocketAddr, datagram: Vec<u8>) {
        self.outbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(Envelope { from, to, datagram });
    }

    /// Datagrams waiting for delivery.
    pub fn in_flight(&self) -> usize {
        self.outbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Drop every datagram in flight.
    pub fn discard(&mut self) -> usize {
        let mut outbox = self.outbox.lock().unwrap_or_else(PoisonError::into_inner);
        let dropped = outbox.len();
        outbox.clear();
        dropped
    }

    /// Deliver until the network is quiet. Returns the number of datagrams
    /// delivered.
    pub fn pump(&mut self, now: Instant) -> usize {
        let mut delivered = 0;
        while delivered < MAX_DELIVERIES {
            let next = self
                .outbox
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front();
            let Some(envelope) = next else {
                break;
            };
            if self.muted.contains(&envelope.to) {
                continue;
            }
            let Some(index) = self.index_of(envelope.to) else {
                continue;
            };
            if let Some(frame) = self
                .bypass_tag
                .strip(&envelope.datagram)
                .ok()
                .and_then(|f| RawFrame::decode(f).ok())
            {
                self.trace.push(TraceEntry {
                    from: envelope.from,
                    to: envelope.to,
                    type_byte: frame.type_byte,
                    circuit_id: frame.circuit_id,
                });
            }
            self.nodes[index]
                .engine
                .on_datagram(envelope.from, &envelope.datagram, now);
            delivered += 1;
        }
        delivered
    }

    pub fn trace(&self) -> &[TraceEntry] {
        &self.trace
    }

    pub fn clear_trace(&mut self) {
        self.trace.clear();
    }

    /// Run the request-cache tick on every node.
    pub fn tick(&mut self, now: Instant) {
        for node in &mut self.nodes {
            node.engine.on_tick(now);
        }
    }

    /// Run the keepalive pass on every node.
    pub fn keepalive(&mut self, now: Instant) {
        for node in &mut self.nodes {
            node.engine.keepalive(now);
        }
    }
}
