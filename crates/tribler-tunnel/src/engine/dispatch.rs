//! Inbound frame routing and per-message handlers.
//!
//! ## Routing
//!
//! 1. Strip the bypass tag and decode `(circuit id, type, body)`.
//! 2. If `(source, circuit id)` is an online relay side, re-layer the body
//!    and forward it to the mate.
//! 3. Otherwise remove our layers (originator or end of circuit), decode
//!    the body and run the handler. A body that fails to decode breaks the
//!    circuit or link it arrived on.
//!
//! Unknown type bytes are counted and dropped without breaking anything.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use rand::rngs::StdRng;
use rand::seq::{IteratorRandom, SliceRandom};
use tracing::{debug, info, trace, warn};
use tribler_crypto::dh::{DhSecret, DhShare};
use tribler_crypto::ecies;
use tribler_crypto::layer::SessionKey;
use tribler_wire::message::KeyReply;
use tribler_wire::{candidates, frame, CandidateEntry, HostPort, MessageType, RawFrame};
use tribler_wire::{StatsPayload, TunnelMessage};

use super::{layered, TunnelEngine};
use crate::circuit::{Circuit, CircuitState, Hop, UnverifiedHop};
use crate::observer::TunnelEvent;
use crate::onion;
use crate::peer::{LinkKey, Peer};
use crate::relay::Direction;
use crate::request_cache::RequestKey;
use crate::strategy::ExtendContext;
use crate::tables;
use crate::{Result, TunnelError};

/// Who we are for a locally delivered frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Role {
    /// The frame belongs to a circuit we originated.
    Originator,
    /// We are the end of a circuit someone else built.
    Endpoint,
    /// Circuit 0 or a link-local type: no layers.
    Clear,
}

/// Where a circuit stands after a verified CREATED/EXTENDED.
enum Advance {
    Ready { hops: usize },
    /// Layered PUNCTURE/EXTEND frames for the first hop.
    Extend { first_hop: SocketAddr, frames: Vec<Vec<u8>> },
}

impl TunnelEngine {
    /// Handle a datagram from the overlay, bypass tag included.
    pub fn on_datagram(&mut self, source: SocketAddr, datagram: &[u8], now: Instant) {
        match self.settings.bypass_tag.strip(datagram) {
            Ok(frame) => self.on_frame(source, frame, now),
            Err(_) => trace!(%source, "datagram without bypass tag"),
        }
    }

    /// Handle a frame with the bypass tag already stripped.
    pub fn on_frame(&mut self, source: SocketAddr, frame: &[u8], now: Instant) {
        let raw = match RawFrame::decode(frame) {
            Ok(raw) => raw,
            Err(e) => {
                self.counters.decode_errors += 1;
                debug!(%source, error = %e, "undecodable header");
                return;
            }
        };
        let message_type = match MessageType::from_u8(raw.type_byte) {
            Ok(t) => t,
            Err(_) => {
                self.counters.unknown_type += 1;
                debug!(%source, type_byte = raw.type_byte, "unknown message type, dropped");
                return;
            }
        };
        let link = LinkKey::new(source, raw.circuit_id);
        trace!(%link, ?message_type, bytes = raw.body.len(), "frame");

        if raw.circuit_id != frame::ZERO_HOP_CIRCUIT && self.try_relay(link, message_type, raw.body, now) {
            self.flush_events();
            return;
        }
        self.deliver_local(link, message_type, raw.body, now);
        self.flush_events();
    }

    /// Forward over an online relay. Returns false if `link` is not one.
    fn try_relay(&mut self, link: LinkKey, message_type: MessageType, body: &[u8], now: Instant) -> bool {
        let (mate, direction) = {
            let mut tables = tables::lock(&self.tables);
            let Some(direction) = tables.directions.get(&link).copied() else {
                return false;
            };
            let Some(route) = tables.relays.get_mut(&link) else {
                return false;
            };
            if !route.online {
                return false;
            }
            route.last_incoming = now;
            route.bytes += body.len() as u64;
            (route.mate, direction)
        };

        if message_type.is_link_local() {
            debug!(%link, ?message_type, "link-local message on a relay, dropped");
            return true;
        }

        // The key of the originator-facing side layers both directions.
        let key_link = match direction {
            Direction::Endpoint => link,
            Direction::Originator => mate,
        };
        let Some(key) = self.links.get(&key_link).cloned() else {
            debug!(%link, "relay without session key, dropped");
            return true;
        };
        self.links.touch(&key_link, now);

        let mut body = body.to_vec();
        onion::relay_transform(direction, &key, &mut body);
        let frame = frame::encode(mate.circuit_id, message_type.as_u8(), &body);
        self.send_frame(mate.peer, &frame);

        self.counters.relayed_frames += 1;
        match direction {
            Direction::Endpoint => self.counters.bytes_relay_up += body.len() as u64,
            Direction::Originator => self.counters.bytes_relay_down += body.len() as u64,
        }
        trace!(from = %link, to = %mate, ?message_type, "relayed");
        true
    }

    fn deliver_local(&mut self, link: LinkKey, message_type: MessageType, body: &[u8], now: Instant) {
        let (role, plain) = if message_type.is_link_local() {
            (Role::Clear, body.to_vec())
        } else {
            match self.unlayer(link, body, now) {
                Some(found) => found,
                None => {
                    debug!(%link, ?message_type, "no circuit or key for frame, dropped");
                    return;
                }
            }
        };

        let message = match TunnelMessage::decode_body(message_type, &plain) {
            Ok(message) => message,
            Err(e) => {
                self.counters.decode_errors += 1;
                warn!(%link, ?message_type, error = %e, "malformed body");
                self.fail(link, role, "decode error");
                return;
            }
        };

        match (role, message) {
            (_, TunnelMessage::Create { encrypted_key }) => self.on_create(link, &encrypted_key, now),
            (_, TunnelMessage::Created(reply)) => {
                if self.is_own_circuit(&link) {
                    self.on_key_reply(link, reply, now);
                } else {
                    self.on_relay_created(link, reply);
                }
            }
            (Role::Originator, TunnelMessage::Extended(reply)) => self.on_key_reply(link, reply, now),
            (Role::Endpoint, TunnelMessage::Extend { target, encrypted_key }) => {
                self.on_extend(link, target, encrypted_key, now)
            }
            (Role::Originator, TunnelMessage::Data { destination: None, origin, payload }) => {
                self.on_tunnel_data(link.circuit_id, origin, payload)
            }
            (Role::Endpoint, TunnelMessage::Data { destination: Some(destination), payload, .. }) => {
                self.on_exit_data(link, destination, &payload, now)
            }
            (Role::Endpoint, TunnelMessage::Ping) => {
                self.send_on_link(link, &TunnelMessage::Pong);
            }
            (Role::Originator, TunnelMessage::Pong) => {
                if self.requests.pop(&RequestKey::Ping(link.circuit_id)) {
                    trace!(circuit_id = link.circuit_id, "pong");
                }
            }
            (Role::Endpoint, TunnelMessage::Puncture { target }) => self.on_puncture(link, &target),
            (Role::Clear, TunnelMessage::Puncture { .. }) => {
                trace!(%link, "bare puncture");
            }
            (Role::Clear, TunnelMessage::Stats(payload)) => self.on_stats(link.peer, payload, now),
            (role, message) => {
                debug!(%link, ?role, message_type = ?message.message_type(), "unexpected message, dropped");
            }
        }
    }

    /// Remove our layers from a body. `None` if nothing here owns `link`.
    fn unlayer(&mut self, link: LinkKey, body: &[u8], now: Instant) -> Option<(Role, Vec<u8>)> {
        {
            let mut tables = tables::lock(&self.tables);
            if let Some(circuit) = tables.circuits.get_mut(&link.circuit_id) {
                if !circuit.is_zero_hop() && circuit.first_hop().address == link.peer {
                    let mut plain = body.to_vec();
                    onion::peel_incoming(circuit, &mut plain);
                    circuit.last_incoming = now;
                    return Some((Role::Originator, plain));
                }
            }
        }
        if let Some(key) = self.links.get(&link) {
            let plain = key.decrypt_to_vec(body);
            self.links.touch(&link, now);
            return Some((Role::Endpoint, plain));
        }
        if link.circuit_id == frame::ZERO_HOP_CIRCUIT {
            return Some((Role::Clear, body.to_vec()));
        }
        None
    }

    fn is_own_circuit(&self, link: &LinkKey) -> bool {
        tables::lock(&self.tables)
            .circuits
            .get(&link.circuit_id)
            .is_some_and(|c| !c.is_zero_hop() && c.first_hop().address == link.peer)
    }

    /// Tear down whatever a bad frame arrived on.
    fn fail(&mut self, link: LinkKey, role: Role, reason: &str) {
        match role {
            Role::Originator => self.break_circuit(link.circuit_id, reason),
            Role::Endpoint => self.drop_link(&link, reason),
            Role::Clear => {
                if self.is_own_circuit(&link) {
                    self.break_circuit(link.circuit_id, reason);
                } else if self.links.contains(&link) {
                    self.drop_link(&link, reason);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // CREATE / CREATED / EXTEND / EXTENDED
    // ------------------------------------------------------------------

    /// Someone extends onto us.
    fn on_create(&mut self, link: LinkKey, encrypted_key: &[u8], now: Instant) {
        if self.links.contains(&link) {
            debug!(%link, "duplicate CREATE, dropped");
            return;
        }
        let share = match ecies::unwrap(&self.secret, encrypted_key).and_then(|raw| DhShare::from_bytes(&raw)) {
            Ok(share) => share,
            Err(e) => {
                self.counters.crypto_errors += 1;
                warn!(%link, error = %e, "cannot unwrap CREATE");
                return;
            }
        };

        let secret = DhSecret::random(&mut self.rng);
        let key = secret.agree(&share).session_key();

        let entries: Vec<CandidateEntry> = self
            .candidates
            .verified_candidates()
            .into_iter()
            .filter(|p| p.address != link.peer && p.address != self.own.address)
            .choose_multiple(&mut self.rng, self.settings.max_candidates_returned)
            .into_iter()
            .map(CandidateEntry::from)
            .collect();
        let reply = KeyReply {
            dh_share: secret.public_share().as_bytes().to_vec(),
            hashed_key: key.hashed(),
            candidates: key.encrypt_to_vec(&candidates::encode(&entries)),
        };
        self.links.insert(link, key, now);
        debug!(%link, candidates = entries.len(), "accepted CREATE");
        self.send_message(link.peer, link.circuit_id, &TunnelMessage::Created(reply));
    }

    /// CREATED or EXTENDED for a circuit we are building.
    fn on_key_reply(&mut self, link: LinkKey, reply: KeyReply, now: Instant) {
        let circuit_id = link.circuit_id;
        let step = {
            let mut tables = tables::lock(&self.tables);
            match tables.circuits.get_mut(&circuit_id) {
                Some(circuit) => {
                    circuit.last_incoming = now;
                    advance_circuit(circuit, &reply, self.own.address, &mut self.rng)
                }
                None => Ok(None),
            }
        };

        match step {
            Ok(None) => debug!(circuit_id, "unexpected key reply, dropped"),
            Ok(Some(Advance::Ready { hops })) => {
                self.requests.pop(&RequestKey::Circuit(circuit_id));
                info!(circuit_id, hops, "circuit ready");
                self.events.push(TunnelEvent::CircuitReady { circuit_id, hops });
            }
            Ok(Some(Advance::Extend { first_hop, frames })) => {
                for f in &frames {
                    self.send_frame(first_hop, f);
                }
                self.requests
                    .insert(RequestKey::Circuit(circuit_id), now + self.settings.request_timeout);
                debug!(circuit_id, "extending");
            }
            Err(e) => {
                let reason = match e {
                    TunnelError::NoCandidates => "no candidates",
                    TunnelError::Crypto(_) => {
                        self.counters.crypto_errors += 1;
                        "crypto error"
                    }
                    TunnelError::Decode(_) => {
                        self.counters.decode_errors += 1;
                        "decode error"
                    }
                    _ => "extend failed",
                };
                warn!(circuit_id, error = %e, "cannot continue circuit");
                self.break_circuit(circuit_id, reason);
            }
        }
    }

    /// The end of our circuit asks us to extend it by one hop.
    fn on_extend(&mut self, link: LinkKey, target: Option<HostPort>, encrypted_key: Vec<u8>, now: Instant) {
        {
            let mut tables = tables::lock(&self.tables);
            match tables.relays.get(&link).map(|route| route.online) {
                Some(true) => {
                    debug!(%link, "EXTEND on an online relay, dropped");
                    return;
                }
                Some(false) => {
                    for removed in tables.remove_relay_pair(&link) {
                        self.requests.pop(&RequestKey::Relay(removed));
                    }
                    debug!(%link, "replacing half-open extension");
                }
                None => {}
            }
        }

        let (next_hop, create_key) = match target {
            Some(hp) => match hp.to_socket_addr() {
                Some(address) => (address, encrypted_key),
                None => {
                    self.counters.decode_errors += 1;
                    warn!(%link, target = %hp, "EXTEND target is not an address");
                    return;
                }
            },
            None => {
                let pick: Option<Peer> = self
                    .candidates
                    .verified_candidates()
                    .into_iter()
                    .filter(|p| p.address != link.peer && p.address != self.own.address)
                    .collect::<Vec<_>>()
                    .choose(&mut self.rng)
                    .copied();
                let Some(peer) = pick else {
                    warn!(%link, "no candidate to extend to");
                    return;
                };
                match ecies::wrap(&mut self.rng, &peer.public_key, &encrypted_key) {
                    Ok(wrapped) => (peer.address, wrapped),
                    Err(e) => {
                        self.counters.crypto_errors += 1;
                        warn!(%link, error = %e, "cannot wrap delegated CREATE");
                        return;
                    }
                }
            }
        };
        if next_hop == self.own.address || next_hop == link.peer {
            warn!(%link, %next_hop, "EXTEND would loop, dropped");
            return;
        }

        let next_link = {
            let shared = Arc::clone(&self.tables);
            let mut tables = tables::lock(&shared);
            let next_id = match self.allocate_id(&tables, next_hop) {
                Ok(id) => id,
                Err(e) => {
                    warn!(%link, error = %e, "cannot allocate circuit id");
                    return;
                }
            };
            let next_link = LinkKey::new(next_hop, next_id);
            tables.insert_relay_pair(link, next_link, now);
            next_link
        };
        self.requests
            .insert(RequestKey::Relay(next_link), now + self.settings.request_timeout);
        debug!(from = %link, to = %next_link, "extending circuit");
        self.send_message(
            next_hop,
            next_link.circuit_id,
            &TunnelMessage::Create {
                encrypted_key: create_key,
            },
        );
    }

    /// The next hop of a half-open relay answered.
    fn on_relay_created(&mut self, link: LinkKey, reply: KeyReply) {
        let mate = {
            let mut tables = tables::lock(&self.tables);
            if tables.relays.get(&link).is_some_and(|route| !route.online) {
                tables.set_online(&link)
            } else {
                None
            }
        };
        let Some(mate) = mate else {
            debug!(%link, "CREATED for no pending relay, dropped");
            return;
        };
        self.requests.pop(&RequestKey::Relay(link));
        if self.send_on_link(mate, &TunnelMessage::Extended(reply)) {
            debug!(from = %link, to = %mate, "relay online");
        } else {
            self.drop_link(&mate, "missing key");
        }
    }

    // ------------------------------------------------------------------
    // DATA / PUNCTURE / STATS
    // ------------------------------------------------------------------

    fn on_tunnel_data(&mut self, circuit_id: u32, origin: Option<HostPort>, payload: Vec<u8>) {
        {
            let mut tables = tables::lock(&self.tables);
            if let Some(circuit) = tables.circuits.get_mut(&circuit_id) {
                circuit.bytes_down += payload.len() as u64;
            }
        }
        self.counters.bytes_down += payload.len() as u64;
        trace!(circuit_id, bytes = payload.len(), "tunnel data");
        self.events.push(TunnelEvent::TunnelData {
            circuit_id,
            origin,
            payload,
        });
    }

    fn on_exit_data(&mut self, link: LinkKey, destination: HostPort, payload: &[u8], now: Instant) {
        if !self.settings.become_exit {
            self.counters.dropped_exit += 1;
            debug!(%link, %destination, "not an exit, dropped");
            return;
        }
        self.exit_send(link, &destination, payload, now);
    }

    fn on_puncture(&mut self, link: LinkKey, target: &HostPort) {
        let Some(address) = target.to_socket_addr() else {
            debug!(%link, %target, "puncture target is not an address");
            return;
        };
        trace!(%link, %address, "puncturing");
        self.send_message(
            address,
            frame::ZERO_HOP_CIRCUIT,
            &TunnelMessage::Puncture {
                target: HostPort::unspecified(),
            },
        );
    }

    fn on_stats(&mut self, peer: SocketAddr, payload: StatsPayload, now: Instant) {
        match payload {
            StatsPayload::Request => {
                let report = self.stats_report(now);
                match StatsPayload::encode_response_within(&report, self.settings.stats_budget) {
                    Ok(body) => {
                        let frame = frame::encode(frame::ZERO_HOP_CIRCUIT, MessageType::Stats.as_u8(), &body);
                        self.send_frame(peer, &frame);
                    }
                    Err(e) => warn!(%peer, error = %e, "cannot encode stats"),
                }
            }
            StatsPayload::Response(report) => {
                debug!(%peer, circuits = report.circuits.len(), "stats received");
                self.events.push(TunnelEvent::TunnelStats { peer, report });
            }
        }
    }
}

/// Verify the pending hop and, unless the circuit is now READY, prepare the
/// next extension. `Ok(None)` if nothing was pending.
fn advance_circuit(
    circuit: &mut Circuit,
    reply: &KeyReply,
    own_address: SocketAddr,
    rng: &mut StdRng,
) -> Result<Option<Advance>> {
    let Some(pending) = circuit.take_unverified() else {
        return Ok(None);
    };
    let (session_key, list) = check_key_reply(&pending, reply)?;
    let state = circuit.add_hop(Hop {
        peer: pending.peer,
        session_key,
    });
    if state == CircuitState::Ready {
        return Ok(Some(Advance::Ready {
            hops: circuit.hops().len(),
        }));
    }

    let on_circuit = circuit.addresses();
    let ctx = ExtendContext {
        candidates: &list,
        on_circuit: &on_circuit,
        own_address,
        hop_index: circuit.hops().len(),
    };
    let action = circuit.extend_strategy.next_hop(&ctx, rng)?;

    let dh_secret = DhSecret::random(rng);
    let share = dh_secret.public_share();
    let (target, encrypted_key) = match action.target {
        Some(peer) => (
            Some(HostPort::from(peer.address)),
            ecies::wrap(rng, &peer.public_key, share.as_bytes())?,
        ),
        None => (None, share.as_bytes().to_vec()),
    };

    let mut frames = Vec::with_capacity(2);
    if let (true, Some(peer)) = (action.puncture, action.target) {
        let puncture = TunnelMessage::Puncture {
            target: HostPort::from(peer.address),
        };
        frames.push(layered(circuit, &puncture)?);
    }
    frames.push(layered(circuit, &TunnelMessage::Extend { target, encrypted_key })?);
    circuit.set_unverified(UnverifiedHop {
        peer: action.target,
        dh_secret,
    });
    Ok(Some(Advance::Extend {
        first_hop: circuit.first_hop().address,
        frames,
    }))
}

/// Agree on the hop key and open the candidate list.
fn check_key_reply(pending: &UnverifiedHop, reply: &KeyReply) -> Result<(SessionKey, Vec<CandidateEntry>)> {
    let share = DhShare::from_bytes(&reply.dh_share)?;
    let key = pending.dh_secret.agree(&share).session_key();
    key.verify_hash(&reply.hashed_key)?;
    let list = candidates::decode(&key.decrypt_to_vec(&reply.candidates))?;
    Ok((key, list))
}
