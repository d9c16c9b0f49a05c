//! The tunnel engine.
//!
//! [`TunnelEngine`] owns every piece of tunnel state and is driven from a
//! single loop: inbound datagrams, exit replies, timer ticks and local
//! commands. It never blocks and never reads a clock; callers pass `now`.
//!
//! ## Roles
//!
//! The same node plays up to three roles at once:
//!
//! - **originator** of the circuits in `tables.circuits`,
//! - **relay** for link pairs in `tables.relays`,
//! - **end of circuit** (and possibly exit) for links in the session key table.
//!
//! [`dispatch`] routes each frame to the right role.

mod dispatch;

#[cfg(test)]
mod tests;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use rand::rngs::StdRng;
use rand::Rng;
use tracing::{debug, info, trace, warn};
use tribler_crypto::dh::DhSecret;
use tribler_crypto::ecies;
use tribler_crypto::layer::SessionKey;
use tribler_crypto::x25519::X25519StaticSecret;
use tribler_wire::{frame, HostPort, StatsPayload, StatsReport, TunnelMessage};

use crate::circuit::{Circuit, CircuitState, UnverifiedHop};
use crate::exit::{ExitFactory, ExitTable};
use crate::observer::{self, TunnelEvent, TunnelObserver};
use crate::onion::{self, SessionKeyTable};
use crate::overlay::{CandidateSource, Endpoint};
use crate::peer::{LinkKey, Peer};
use crate::request_cache::{RequestCache, RequestKey};
use crate::settings::TunnelSettings;
use crate::stats::StatsCollector;
use crate::strategy::{CircuitSummary, Delegate, ExtendStrategy, LengthStrategy, SelectionStrategy};
use crate::tables::{self, SharedTables, TunnelTables};
use crate::{Result, TunnelError, MAX_ID_REROLLS};

/// Engine counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TunnelCounters {
    /// Exit sends that failed.
    pub dropped_exit: u64,
    /// Frames with a type byte we do not know.
    pub unknown_type: u64,
    pub decode_errors: u64,
    pub crypto_errors: u64,
    pub relayed_frames: u64,
    pub circuits_created: u64,
    pub circuits_broken: u64,
    /// Payload bytes sent on our own circuits.
    pub bytes_up: u64,
    /// Payload bytes received on our own circuits.
    pub bytes_down: u64,
    /// Relayed bytes heading to the exit.
    pub bytes_relay_up: u64,
    /// Relayed bytes heading to the originator.
    pub bytes_relay_down: u64,
    /// Payload bytes sent or received by exit sockets.
    pub bytes_exit: u64,
}

/// The collaborators an engine talks to.
pub struct EngineIo {
    pub endpoint: Box<dyn Endpoint>,
    pub candidates: Arc<dyn CandidateSource>,
    pub exits: Box<dyn ExitFactory>,
}

/// Loop-local tunnel state machine.
pub struct TunnelEngine {
    own: Peer,
    secret: X25519StaticSecret,
    settings: TunnelSettings,
    length: Box<dyn LengthStrategy>,
    tables: SharedTables,
    links: SessionKeyTable,
    requests: RequestCache,
    exits: ExitTable,
    endpoint: Box<dyn Endpoint>,
    candidates: Arc<dyn CandidateSource>,
    observers: Vec<Box<dyn TunnelObserver>>,
    events: Vec<TunnelEvent>,
    rng: StdRng,
    counters: TunnelCounters,
    stats: StatsCollector,
}

impl TunnelEngine {
    pub fn new(
        secret: X25519StaticSecret,
        own_address: SocketAddr,
        settings: TunnelSettings,
        io: EngineIo,
        rng: StdRng,
        now: Instant,
    ) -> Self {
        let own = Peer::new(own_address, secret.public_key());
        Self {
            own,
            secret,
            length: settings.length.build(),
            settings,
            tables: TunnelTables::shared(),
            links: SessionKeyTable::new(),
            requests: RequestCache::new(),
            exits: ExitTable::new(io.exits),
            endpoint: io.endpoint,
            candidates: io.candidates,
            observers: Vec::new(),
            events: Vec::new(),
            rng,
            counters: TunnelCounters::default(),
            stats: StatsCollector::new(now),
        }
    }

    pub fn own_peer(&self) -> Peer {
        self.own
    }

    pub fn settings(&self) -> &TunnelSettings {
        &self.settings
    }

    /// Handle on the shared tables, for readers off the loop.
    pub fn tables(&self) -> SharedTables {
        Arc::clone(&self.tables)
    }

    pub fn counters(&self) -> TunnelCounters {
        self.counters
    }

    pub fn add_observer(&mut self, observer: Box<dyn TunnelObserver>) {
        self.observers.push(observer);
    }

    pub fn circuit_state(&self, circuit_id: u32) -> Option<CircuitState> {
        tables::lock(&self.tables)
            .circuits
            .get(&circuit_id)
            .map(Circuit::state)
    }

    pub fn ready_circuits(&self) -> Vec<CircuitSummary> {
        tables::lock(&self.tables).ready_circuits()
    }

    /// Circuits still being built.
    pub fn extending_circuits(&self) -> usize {
        tables::lock(&self.tables)
            .circuits
            .values()
            .filter(|c| c.state() == CircuitState::Extending)
            .count()
    }

    /// Session key this node agreed on for a link it was extended over.
    pub fn link_key(&self, link: &LinkKey) -> Option<SessionKey> {
        self.links.get(link).cloned()
    }

    pub fn has_request(&self, key: &RequestKey) -> bool {
        self.requests.contains(key)
    }

    pub fn has_exit_socket(&self, link: &LinkKey) -> bool {
        self.exits.contains(link)
    }

    /// Earliest pending request deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.requests.next_deadline()
    }

    // ------------------------------------------------------------------
    // Circuit lifecycle
    // ------------------------------------------------------------------

    /// Create a circuit through a verified candidate. `goal_hops` defaults
    /// to the length strategy.
    pub fn create_circuit(&mut self, goal_hops: Option<usize>, now: Instant) -> Result<u32> {
        let result = self.start_circuit(None, goal_hops, now);
        self.flush_events();
        result
    }

    /// Create a circuit through a given first hop.
    pub fn create_circuit_via(&mut self, first_hop: Peer, goal_hops: usize, now: Instant) -> Result<u32> {
        let result = self.start_circuit(Some(first_hop), Some(goal_hops), now);
        self.flush_events();
        result
    }

    fn start_circuit(&mut self, first_hop: Option<Peer>, goal_hops: Option<usize>, now: Instant) -> Result<u32> {
        let goal = match goal_hops {
            Some(goal) => goal,
            None => self.length.circuit_length(&mut self.rng),
        };
        if goal == 0 {
            return self.create_zero_hop(now);
        }

        let candidates = self.candidates.verified_candidates();
        let (first, strategy) =
            self.settings
                .extend
                .start(first_hop, &candidates, goal, self.own.address, &mut self.rng)?;

        let shared = Arc::clone(&self.tables);
        let mut tables = tables::lock(&shared);
        let id = self.allocate_id(&tables, first.address)?;

        let dh_secret = DhSecret::random(&mut self.rng);
        let encrypted_key = ecies::wrap(&mut self.rng, &first.public_key, dh_secret.public_share().as_bytes())?;

        let mut circuit = Circuit::new(id, goal, first, strategy, now);
        circuit.set_unverified(UnverifiedHop {
            peer: Some(first),
            dh_secret,
        });
        tables.circuits.insert(id, circuit);
        drop(tables);

        self.requests
            .insert(RequestKey::Circuit(id), now + self.settings.request_timeout);
        self.counters.circuits_created += 1;
        info!(circuit_id = id, first_hop = %first.address, goal, "creating circuit");
        self.send_message(first.address, id, &TunnelMessage::Create { encrypted_key });
        Ok(id)
    }

    fn create_zero_hop(&mut self, now: Instant) -> Result<u32> {
        if !self.settings.allow_zero_hop {
            return Err(TunnelError::ZeroHopDisabled);
        }
        let id = frame::ZERO_HOP_CIRCUIT;
        let mut tables = tables::lock(&self.tables);
        if tables.circuits.contains_key(&id) {
            return Ok(id);
        }
        let strategy: Box<dyn ExtendStrategy> = Box::new(Delegate);
        tables
            .circuits
            .insert(id, Circuit::new(id, 0, self.own, strategy, now));
        drop(tables);

        self.counters.circuits_created += 1;
        info!(circuit_id = id, "zero-hop circuit ready");
        self.events.push(TunnelEvent::CircuitReady {
            circuit_id: id,
            hops: 0,
        });
        Ok(id)
    }

    /// Pick a circuit id for a new link towards `peer`.
    fn allocate_id(&mut self, tables: &TunnelTables, peer: SocketAddr) -> Result<u32> {
        for _ in 0..MAX_ID_REROLLS {
            let id = self.rng.gen_range(1..=u32::MAX);
            if !tables.id_in_use(peer, id) && !self.links.contains(&LinkKey::new(peer, id)) {
                return Ok(id);
            }
            trace!(circuit_id = id, %peer, "circuit id collision, rerolling");
        }
        Err(TunnelError::Capacity(MAX_ID_REROLLS))
    }

    /// Destroy a circuit. Destroying an unknown circuit is a no-op.
    pub fn destroy_circuit(&mut self, circuit_id: u32, reason: &str) {
        self.break_circuit(circuit_id, reason);
        self.flush_events();
    }

    fn break_circuit(&mut self, circuit_id: u32, reason: &str) {
        let removed = {
            let mut tables = tables::lock(&self.tables);
            let removed = tables.circuits.remove(&circuit_id);
            if removed.is_some() {
                tables.forget_destinations(circuit_id);
            }
            removed
        };
        let Some(mut circuit) = removed else {
            return;
        };
        circuit.mark_broken();
        self.requests.remove_circuit(circuit_id);
        if circuit.is_zero_hop() {
            self.exits.close(&LinkKey::new(self.own.address, circuit_id));
        }
        self.counters.circuits_broken += 1;
        info!(circuit_id, reason, hops = circuit.hops().len(), "circuit broken");
        self.events.push(TunnelEvent::BreakCircuit {
            circuit_id,
            reason: reason.to_string(),
        });
    }

    /// Forget everything this node holds for a link it was extended over.
    fn drop_link(&mut self, link: &LinkKey, reason: &str) {
        self.links.remove(link);
        self.exits.close(link);
        let removed = tables::lock(&self.tables).remove_relay_pair(link);
        for key in removed {
            self.requests.pop(&RequestKey::Relay(key));
        }
        debug!(%link, reason, "dropped link");
    }

    /// Create circuits until `max_circuits` are live. Returns how many were
    /// started.
    pub fn top_up(&mut self, now: Instant) -> usize {
        let live = tables::lock(&self.tables).live_circuit_count();
        let missing = self.settings.max_circuits.saturating_sub(live);
        let mut started = 0;
        for _ in 0..missing {
            match self.start_circuit(None, None, now) {
                Ok(_) => started += 1,
                Err(TunnelError::ZeroHopDisabled) => continue,
                Err(e) => {
                    debug!(error = %e, "top-up stopped");
                    break;
                }
            }
        }
        self.flush_events();
        started
    }

    // ------------------------------------------------------------------
    // Data
    // ------------------------------------------------------------------

    /// Send `payload` to `destination` through a READY circuit.
    pub fn send_data(&mut self, circuit_id: u32, destination: HostPort, payload: &[u8], now: Instant) -> Result<()> {
        let shared = Arc::clone(&self.tables);
        let mut tables = tables::lock(&shared);
        let circuit = tables
            .circuits
            .get_mut(&circuit_id)
            .ok_or(TunnelError::UnknownCircuit(circuit_id))?;
        if !circuit.is_ready() {
            return Err(TunnelError::CircuitNotReady(circuit_id));
        }
        circuit.bytes_up += payload.len() as u64;
        self.counters.bytes_up += payload.len() as u64;

        if circuit.is_zero_hop() {
            drop(tables);
            let link = LinkKey::new(self.own.address, circuit_id);
            self.exit_send(link, &destination, payload, now);
            self.flush_events();
            return Ok(());
        }

        let message = TunnelMessage::Data {
            destination: Some(destination),
            origin: None,
            payload: payload.to_vec(),
        };
        let frame = layered(circuit, &message)?;
        let first_hop = circuit.first_hop().address;
        drop(tables);
        trace!(circuit_id, bytes = payload.len(), "sending data");
        self.send_frame(first_hop, &frame);
        Ok(())
    }

    /// Send through the circuit `destination` is pinned to, or pin it to
    /// one chosen by `selector` among the READY circuits in `allowed`.
    pub fn send_via(
        &mut self,
        destination: HostPort,
        payload: &[u8],
        allowed: &[u32],
        selector: &mut dyn SelectionStrategy,
        now: Instant,
    ) -> Result<u32> {
        let circuit_id = {
            let mut tables = tables::lock(&self.tables);
            let ready: Vec<CircuitSummary> = tables
                .ready_circuits()
                .into_iter()
                .filter(|c| allowed.contains(&c.circuit_id))
                .collect();
            match tables.destinations.get(&destination) {
                Some(id) if ready.iter().any(|c| c.circuit_id == *id) => *id,
                _ => {
                    let id = selector.select(&ready, &mut self.rng).ok_or(
                        TunnelError::NotEnoughCircuits {
                            wanted: 1,
                            available: ready.len(),
                        },
                    )?;
                    debug!(circuit_id = id, %destination, "pinned destination");
                    tables.destinations.insert(destination.clone(), id);
                    id
                }
            }
        };
        self.send_data(circuit_id, destination, payload, now)?;
        Ok(circuit_id)
    }

    /// Feed a reply that arrived on the exit socket of `link`.
    pub fn on_exit_reply(&mut self, link: LinkKey, from: SocketAddr, payload: &[u8], now: Instant) {
        self.exits.touch(&link, now);
        self.counters.bytes_exit += payload.len() as u64;

        if link.circuit_id == frame::ZERO_HOP_CIRCUIT && link.peer == self.own.address {
            let known = {
                let mut tables = tables::lock(&self.tables);
                match tables.circuits.get_mut(&link.circuit_id) {
                    Some(circuit) => {
                        circuit.bytes_down += payload.len() as u64;
                        circuit.last_incoming = now;
                        true
                    }
                    None => false,
                }
            };
            if known {
                self.counters.bytes_down += payload.len() as u64;
                self.events.push(TunnelEvent::TunnelData {
                    circuit_id: link.circuit_id,
                    origin: Some(HostPort::from(from)),
                    payload: payload.to_vec(),
                });
                self.flush_events();
            }
            return;
        }

        let message = TunnelMessage::Data {
            destination: None,
            origin: Some(HostPort::from(from)),
            payload: payload.to_vec(),
        };
        if !self.send_on_link(link, &message) {
            debug!(%link, "exit reply for unknown link");
        }
    }

    /// An exit send that was accepted but failed later, e.g. on name
    /// resolution. `bytes` were already counted as exit traffic.
    pub fn on_exit_failure(&mut self, link: LinkKey, bytes: usize) {
        self.counters.dropped_exit += 1;
        self.counters.bytes_exit = self.counters.bytes_exit.saturating_sub(bytes as u64);
        debug!(%link, bytes, "deferred exit send failed");
    }

    fn exit_send(&mut self, link: LinkKey, destination: &HostPort, payload: &[u8], now: Instant) {
        let first = !self.exits.contains(&link);
        match self.exits.send(link, destination, payload, now) {
            Ok(sent) => {
                self.counters.bytes_exit += sent as u64;
                if first {
                    self.events.push(TunnelEvent::ExitingFromTunnel {
                        link,
                        destination: destination.clone(),
                    });
                }
            }
            Err(e) => {
                self.counters.dropped_exit += 1;
                debug!(%link, %destination, error = %e, "exit send failed");
            }
        }
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    /// Expire request-cache entries.
    pub fn on_tick(&mut self, now: Instant) {
        for key in self.requests.expire(now) {
            match key {
                RequestKey::Circuit(id) | RequestKey::Ping(id) => self.break_circuit(id, "timeout"),
                RequestKey::Relay(link) => {
                    let mut tables = tables::lock(&self.tables);
                    if tables.relays.get(&link).is_some_and(|r| !r.online) {
                        tables.remove_relay_pair(&link);
                        debug!(%link, "next hop never answered CREATE");
                    }
                }
            }
        }
        self.flush_events();
    }

    /// The 10 s keepalive pass: drop idle relays and links, PING quiet
    /// circuits.
    pub fn keepalive(&mut self, now: Instant) {
        let relay_timeout = self.settings.relay_idle_timeout();
        let ping_after = self
            .settings
            .circuit_idle_timeout
            .saturating_sub(self.settings.keepalive_interval);

        let to_ping = {
            let mut tables = tables::lock(&self.tables);

            let idle: Vec<LinkKey> = tables
                .relays
                .iter()
                .filter(|(_, r)| now.saturating_duration_since(r.last_incoming) >= relay_timeout)
                .map(|(key, _)| *key)
                .collect();
            for key in idle {
                tables.remove_relay_side(&key);
                debug!(link = %key, "relay idle, removed");
            }

            let half_open: Vec<LinkKey> = tables
                .relays
                .iter()
                .filter(|(_, r)| {
                    !r.online
                        && now.saturating_duration_since(r.created_at) >= self.settings.request_timeout
                })
                .map(|(key, _)| *key)
                .collect();
            for key in half_open {
                for removed in tables.remove_relay_pair(&key) {
                    self.requests.pop(&RequestKey::Relay(removed));
                }
            }

            let to_ping: Vec<u32> = tables
                .circuits
                .values()
                .filter(|c| c.is_ready() && !c.is_zero_hop())
                .filter(|c| now.saturating_duration_since(c.last_incoming) >= ping_after)
                .map(Circuit::id)
                .filter(|id| !self.requests.contains(&RequestKey::Ping(*id)))
                .collect();
            to_ping
        };

        for circuit_id in to_ping {
            if let Err(e) = self.ping(circuit_id, now) {
                debug!(circuit_id, error = %e, "ping failed");
            }
        }

        let idle_links = {
            let tables = tables::lock(&self.tables);
            let idle = self
                .links
                .idle(now, relay_timeout, |link| tables.relays.contains_key(link));
            idle
        };
        for link in idle_links {
            self.drop_link(&link, "idle");
        }
        self.flush_events();
    }

    /// Send a PING on a READY circuit and wait for the PONG.
    pub fn ping(&mut self, circuit_id: u32, now: Instant) -> Result<()> {
        let (first_hop, frame) = {
            let tables = tables::lock(&self.tables);
            let circuit = tables
                .circuits
                .get(&circuit_id)
                .ok_or(TunnelError::UnknownCircuit(circuit_id))?;
            let frame = layered(circuit, &TunnelMessage::Ping)?;
            (circuit.first_hop().address, frame)
        };
        trace!(circuit_id, "ping");
        self.send_frame(first_hop, &frame);
        self.requests
            .insert(RequestKey::Ping(circuit_id), now + self.settings.request_timeout);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Stats
    // ------------------------------------------------------------------

    /// Take one 1 Hz sample of every byte counter.
    pub fn sample_stats(&mut self, now: Instant) {
        let tables = tables::lock(&self.tables);
        self.stats.sample(&tables, now);
    }

    pub fn stats_report(&self, now: Instant) -> StatsReport {
        let tables = tables::lock(&self.tables);
        self.stats.report(&tables, &self.counters, now)
    }

    /// Ask every verified candidate for its stats.
    pub fn request_stats(&mut self) -> usize {
        let peers: Vec<Peer> = self
            .candidates
            .verified_candidates()
            .into_iter()
            .filter(|p| p.address != self.own.address)
            .collect();
        for peer in &peers {
            self.send_message(
                peer.address,
                frame::ZERO_HOP_CIRCUIT,
                &TunnelMessage::Stats(StatsPayload::Request),
            );
        }
        debug!(peers = peers.len(), "requested stats");
        peers.len()
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    fn send_frame(&self, to: SocketAddr, frame: &[u8]) {
        let datagram = self.settings.bypass_tag.wrap(frame);
        self.endpoint.send(to, &datagram);
    }

    /// Send a message without symmetric layers.
    fn send_message(&self, to: SocketAddr, circuit_id: u32, message: &TunnelMessage) {
        match message.to_frame(circuit_id) {
            Ok(frame) => self.send_frame(to, &frame),
            Err(e) => warn!(circuit_id, error = %e, "failed to encode message"),
        }
    }

    /// Send towards the originator over a link we were extended over.
    fn send_on_link(&self, link: LinkKey, message: &TunnelMessage) -> bool {
        let Some(key) = self.links.get(&link) else {
            return false;
        };
        match message.encode_body() {
            Ok(mut body) => {
                key.encrypt(&mut body);
                let frame = frame::encode(link.circuit_id, message.message_type().as_u8(), &body);
                self.send_frame(link.peer, &frame);
                true
            }
            Err(e) => {
                warn!(%link, error = %e, "failed to encode message");
                false
            }
        }
    }

    fn flush_events(&mut self) {
        let events = std::mem::take(&mut self.events);
        for event in &events {
            for observer in &mut self.observers {
                observer::dispatch(observer.as_mut(), event);
            }
        }
    }
}

/// Encode `message` on `circuit` with every hop's layer.
fn layered(circuit: &Circuit, message: &TunnelMessage) -> Result<Vec<u8>> {
    let mut body = message.encode_body()?;
    onion::wrap_outgoing(circuit, &mut body);
    Ok(frame::encode(circuit.id(), message.message_type().as_u8(), &body))
}
