use std::net::SocketAddr;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::SeedableRng;
use tribler_crypto::dh::DhSecret;
use tribler_wire::message::KeyReply;
use tribler_wire::{frame, BypassTag, HostPort, MessageType, TunnelMessage};

use crate::circuit::CircuitState;
use crate::memory::MemoryNetwork;
use crate::observer::TunnelEvent;
use crate::peer::LinkKey;
use crate::request_cache::RequestKey;
use crate::settings::{ExtendPolicy, LengthPolicy, TunnelSettings};
use crate::strategy::RoundRobin;
use crate::tables;
use crate::TunnelError;

fn settings() -> TunnelSettings {
    TunnelSettings {
        max_circuits: 0,
        ..TunnelSettings::default()
    }
}

fn dest() -> HostPort {
    HostPort::new("127.0.0.1", 9999)
}

fn types(net: &MemoryNetwork) -> Vec<u8> {
    net.trace().iter().map(|t| t.type_byte).collect()
}

fn breaks(events: &[TunnelEvent], id: u32) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            TunnelEvent::BreakCircuit { circuit_id, reason } if *circuit_id == id => {
                Some(reason.clone())
            }
            _ => None,
        })
        .collect()
}

/// Build 0 -> 1 -> 2 and return (network, circuit id, id on the 1 -> 2 link).
fn two_hop(now: Instant) -> (MemoryNetwork, u32, u32) {
    let mut net = MemoryNetwork::new(3, &settings(), now);
    let first = net.peer(1);
    let id = net
        .engine(0)
        .create_circuit_via(first, 2, now)
        .expect("create");
    net.pump(now);
    let next_id = net
        .trace()
        .iter()
        .find(|t| t.type_byte == MessageType::Create.as_u8() && t.to == net.address(2))
        .map(|t| t.circuit_id)
        .expect("CREATE towards the second hop");
    (net, id, next_id)
}

#[test]
fn test_two_hop_build() {
    let now = Instant::now();
    let (mut net, id, next_id) = two_hop(now);

    assert_eq!(net.engine(0).circuit_state(id), Some(CircuitState::Ready));
    assert_eq!(types(&net), vec![1, 2, 3, 1, 2, 4]);
    assert!(!net.engine(0).has_request(&RequestKey::Circuit(id)));
    assert!(net
        .node(0)
        .events()
        .contains(&TunnelEvent::CircuitReady { circuit_id: id, hops: 2 }));

    let toward_originator = LinkKey::new(net.address(0), id);
    let toward_exit = LinkKey::new(net.address(2), next_id);
    {
        let shared = net.engine(1).tables();
        let relays = tables::lock(&shared);
        let route = relays.relays.get(&toward_originator).expect("relay");
        assert_eq!(route.mate, toward_exit);
        assert!(route.online);
        let mate = relays.relays.get(&toward_exit).expect("mate");
        assert_eq!(mate.mate, toward_originator);
        assert!(mate.online);
    }
    assert!(!net.engine(1).has_request(&RequestKey::Relay(toward_exit)));
}

#[test]
fn test_session_keys_agree() {
    let now = Instant::now();
    let (mut net, id, next_id) = two_hop(now);
    let a1 = net.address(1);
    let a0 = net.address(0);

    let originator_keys: Vec<_> = {
        let shared = net.engine(0).tables();
        let tables = tables::lock(&shared);
        let circuit = tables.circuits.get(&id).expect("circuit");
        circuit.hops().iter().map(|h| h.session_key.clone()).collect()
    };
    assert_eq!(originator_keys.len(), 2);
    assert_eq!(
        net.engine(1).link_key(&LinkKey::new(a0, id)),
        Some(originator_keys[0].clone())
    );
    assert_eq!(
        net.engine(2).link_key(&LinkKey::new(a1, next_id)),
        Some(originator_keys[1].clone())
    );
}

#[test]
fn test_data_round_trip() {
    let now = Instant::now();
    let (mut net, id, next_id) = two_hop(now);
    let exit_link = LinkKey::new(net.address(1), next_id);

    net.engine(0)
        .send_data(id, dest(), b"hello", now)
        .expect("send");
    net.pump(now);

    let sent = net.node(2).exit_sends();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].link, exit_link);
    assert_eq!(sent[0].destination, dest());
    assert_eq!(sent[0].payload, b"hello");
    assert!(net.engine(2).has_exit_socket(&exit_link));
    assert!(net.node(2).events().contains(&TunnelEvent::ExitingFromTunnel {
        link: exit_link,
        destination: dest(),
    }));

    let from: SocketAddr = "127.0.0.1:9999".parse().expect("addr");
    net.engine(2).on_exit_reply(exit_link, from, b"world", now);
    net.pump(now);

    assert!(net.node(0).events().contains(&TunnelEvent::TunnelData {
        circuit_id: id,
        origin: Some(dest()),
        payload: b"world".to_vec(),
    }));

    let originator = net.engine(0).counters();
    assert_eq!(originator.bytes_up, 5);
    assert_eq!(originator.bytes_down, 5);
    let relay = net.engine(1).counters();
    assert!(relay.bytes_relay_up > 0);
    assert!(relay.bytes_relay_down > 0);
    assert!(relay.relayed_frames >= 3);
    assert_eq!(net.engine(2).counters().bytes_exit, 10);
}

#[test]
fn test_send_before_ready_fails() {
    let now = Instant::now();
    let mut net = MemoryNetwork::new(3, &settings(), now);
    let first = net.peer(1);
    let id = net
        .engine(0)
        .create_circuit_via(first, 2, now)
        .expect("create");
    assert!(matches!(
        net.engine(0).send_data(id, dest(), b"x", now),
        Err(TunnelError::CircuitNotReady(_))
    ));
    assert!(matches!(
        net.engine(0).send_data(42, dest(), b"x", now),
        Err(TunnelError::UnknownCircuit(42))
    ));
}

#[test]
fn test_extend_timeout_cleans_up() {
    let now = Instant::now();
    let mut net = MemoryNetwork::new(3, &settings(), now);
    net.mute(2);
    let first = net.peer(1);
    let id = net
        .engine(0)
        .create_circuit_via(first, 2, now)
        .expect("create");
    net.pump(now);

    assert_eq!(net.engine(0).circuit_state(id), Some(CircuitState::Extending));
    assert_eq!(tables::lock(&net.engine(1).tables()).relays.len(), 2);

    net.tick(now + Duration::from_secs(6));

    assert_eq!(net.engine(0).circuit_state(id), None);
    assert_eq!(breaks(&net.node(0).events(), id), vec!["timeout".to_string()]);
    assert!(tables::lock(&net.engine(1).tables()).relays.is_empty());
    assert!(tables::lock(&net.engine(1).tables()).directions.is_empty());
}

#[test]
fn test_create_timeout() {
    let now = Instant::now();
    let mut net = MemoryNetwork::new(2, &settings(), now);
    net.mute(1);
    let first = net.peer(1);
    let id = net
        .engine(0)
        .create_circuit_via(first, 1, now)
        .expect("create");
    net.pump(now);

    net.tick(now + Duration::from_secs(4));
    assert_eq!(net.engine(0).circuit_state(id), Some(CircuitState::Extending));
    net.tick(now + Duration::from_secs(5));
    assert_eq!(net.engine(0).circuit_state(id), None);
    assert_eq!(net.engine(0).counters().circuits_broken, 1);
}

#[test]
fn test_bad_hash_breaks_circuit() {
    let now = Instant::now();
    let mut net = MemoryNetwork::new(2, &settings(), now);
    let first = net.peer(1);
    let id = net
        .engine(0)
        .create_circuit_via(first, 1, now)
        .expect("create");
    assert_eq!(net.discard(), 1);

    let mut rng = StdRng::seed_from_u64(99);
    let forged = TunnelMessage::Created(KeyReply {
        dh_share: DhSecret::random(&mut rng).public_share().as_bytes().to_vec(),
        hashed_key: [0u8; 20],
        candidates: Vec::new(),
    });
    let datagram = BypassTag::default().wrap(&forged.to_frame(id).expect("frame"));
    let (a1, a0) = (net.address(1), net.address(0));
    net.inject(a1, a0, datagram);
    net.pump(now);

    assert_eq!(net.engine(0).circuit_state(id), None);
    assert_eq!(breaks(&net.node(0).events(), id), vec!["crypto error".to_string()]);
    assert_eq!(net.engine(0).counters().crypto_errors, 1);
}

#[test]
fn test_single_hop_ready_after_created() {
    let now = Instant::now();
    let mut net = MemoryNetwork::new(2, &settings(), now);
    let first = net.peer(1);
    let id = net
        .engine(0)
        .create_circuit_via(first, 1, now)
        .expect("create");
    net.pump(now);

    assert_eq!(net.engine(0).circuit_state(id), Some(CircuitState::Ready));
    assert_eq!(types(&net), vec![1, 2]);
    assert!(tables::lock(&net.engine(1).tables()).relays.is_empty());
}

#[test]
fn test_zero_hop() {
    let now = Instant::now();
    let mut net = MemoryNetwork::new(
        1,
        &TunnelSettings {
            allow_zero_hop: true,
            ..settings()
        },
        now,
    );
    let id = net.engine(0).create_circuit(Some(0), now).expect("zero hop");
    assert_eq!(id, frame::ZERO_HOP_CIRCUIT);
    assert_eq!(net.engine(0).circuit_state(id), Some(CircuitState::Ready));

    net.engine(0).send_data(id, dest(), b"clear", now).expect("send");
    assert_eq!(net.in_flight(), 0);
    let link = LinkKey::new(net.address(0), id);
    assert_eq!(net.node(0).exit_sends()[0].link, link);

    let from: SocketAddr = "127.0.0.1:9999".parse().expect("addr");
    net.engine(0).on_exit_reply(link, from, b"back", now);
    assert!(net.node(0).events().contains(&TunnelEvent::TunnelData {
        circuit_id: id,
        origin: Some(dest()),
        payload: b"back".to_vec(),
    }));

    net.engine(0).destroy_circuit(id, "done");
    assert!(!net.engine(0).has_exit_socket(&link));
}

#[test]
fn test_zero_hop_disabled() {
    let now = Instant::now();
    let mut net = MemoryNetwork::new(1, &settings(), now);
    assert!(matches!(
        net.engine(0).create_circuit(Some(0), now),
        Err(TunnelError::ZeroHopDisabled)
    ));
}

#[test]
fn test_ping_pong() {
    let now = Instant::now();
    let (mut net, id, _) = two_hop(now);
    net.clear_trace();

    net.engine(0).ping(id, now).expect("ping");
    assert!(net.engine(0).has_request(&RequestKey::Ping(id)));
    net.pump(now);

    assert!(!net.engine(0).has_request(&RequestKey::Ping(id)));
    assert_eq!(types(&net), vec![7, 7, 8, 8]);
    assert_eq!(net.engine(0).circuit_state(id), Some(CircuitState::Ready));
}

#[test]
fn test_ping_timeout_breaks_circuit() {
    let now = Instant::now();
    let (mut net, id, _) = two_hop(now);
    net.mute(2);

    net.engine(0).ping(id, now).expect("ping");
    net.pump(now);
    net.tick(now + Duration::from_secs(6));

    assert_eq!(net.engine(0).circuit_state(id), None);
    assert_eq!(breaks(&net.node(0).events(), id), vec!["timeout".to_string()]);
}

#[test]
fn test_keepalive_pings_quiet_circuits() {
    let now = Instant::now();
    let (mut net, id, _) = two_hop(now);

    let later = now + Duration::from_secs(5);
    net.engine(0).keepalive(later);
    assert!(!net.engine(0).has_request(&RequestKey::Ping(id)));

    let quiet = now + Duration::from_secs(10);
    net.engine(0).keepalive(quiet);
    assert!(net.engine(0).has_request(&RequestKey::Ping(id)));
    net.pump(quiet);
    assert!(!net.engine(0).has_request(&RequestKey::Ping(id)));
}

#[test]
fn test_idle_relay_removed() {
    let now = Instant::now();
    let (mut net, id, _) = two_hop(now);
    let link = LinkKey::new(net.address(0), id);

    net.engine(1).keepalive(now + Duration::from_secs(64));
    assert_eq!(tables::lock(&net.engine(1).tables()).relays.len(), 2);

    net.engine(1).keepalive(now + Duration::from_secs(65));
    assert!(tables::lock(&net.engine(1).tables()).relays.is_empty());
    assert_eq!(net.engine(1).link_key(&link), None);
}

#[test]
fn test_destroy_is_idempotent() {
    let now = Instant::now();
    let (mut net, id, _) = two_hop(now);
    let mut selector = RoundRobin::new(1);
    net.engine(0)
        .send_via(dest(), b"pin", &[id], &mut selector, now)
        .expect("send");

    net.engine(0).destroy_circuit(id, "user");
    net.engine(0).destroy_circuit(id, "user");
    net.engine(0).destroy_circuit(12345, "unknown");

    assert_eq!(breaks(&net.node(0).events(), id), vec!["user".to_string()]);
    assert!(net.engine(0).ready_circuits().is_empty());
    assert!(!net.engine(0).has_request(&RequestKey::Circuit(id)));
    assert!(!net.engine(0).has_request(&RequestKey::Ping(id)));
    assert!(tables::lock(&net.engine(0).tables()).destinations.is_empty());
    assert_eq!(net.engine(0).counters().circuits_broken, 1);
}

#[test]
fn test_send_via_pins_destination() {
    let now = Instant::now();
    let mut net = MemoryNetwork::new(3, &settings(), now);
    let (p1, p2) = (net.peer(1), net.peer(2));
    let a = net.engine(0).create_circuit_via(p1, 1, now).expect("create");
    let b = net.engine(0).create_circuit_via(p2, 1, now).expect("create");
    net.pump(now);

    let mut selector = RoundRobin::new(1);
    let first = net
        .engine(0)
        .send_via(dest(), b"1", &[a, b], &mut selector, now)
        .expect("send");
    let second = net
        .engine(0)
        .send_via(dest(), b"2", &[a, b], &mut selector, now)
        .expect("send");
    assert_eq!(first, second);

    let other = HostPort::new("127.0.0.1", 1);
    let third = net
        .engine(0)
        .send_via(other, b"3", &[a, b], &mut selector, now)
        .expect("send");
    assert_ne!(first, third);
}

#[test]
fn test_unknown_type_keeps_circuit() {
    let now = Instant::now();
    let (mut net, id, _) = two_hop(now);
    let datagram = BypassTag::default().wrap(&frame::encode(id, 0x63, b"junk"));
    let (a1, a0) = (net.address(1), net.address(0));
    net.inject(a1, a0, datagram);
    net.pump(now);

    assert_eq!(net.engine(0).circuit_state(id), Some(CircuitState::Ready));
    assert_eq!(net.engine(0).counters().unknown_type, 1);
}

#[test]
fn test_malformed_body_breaks_circuit() {
    let now = Instant::now();
    let (mut net, id, _) = two_hop(now);
    let datagram = BypassTag::default().wrap(&frame::encode(id, MessageType::Data.as_u8(), &[0xAB; 3]));
    let (a1, a0) = (net.address(1), net.address(0));
    net.inject(a1, a0, datagram);
    net.pump(now);

    assert_eq!(net.engine(0).circuit_state(id), None);
    assert_eq!(breaks(&net.node(0).events(), id), vec!["decode error".to_string()]);
    assert_eq!(net.engine(0).counters().decode_errors, 1);
}

#[test]
fn test_missing_bypass_tag_ignored() {
    let now = Instant::now();
    let (mut net, id, _) = two_hop(now);
    let (a1, a0) = (net.address(1), net.address(0));
    net.inject(a1, a0, frame::encode(id, MessageType::Ping.as_u8(), &[]));
    net.pump(now);
    assert_eq!(net.engine(0).circuit_state(id), Some(CircuitState::Ready));
    assert_eq!(net.engine(0).counters().decode_errors, 0);
}

#[test]
fn test_delegated_extension() {
    let now = Instant::now();
    let mut net = MemoryNetwork::new(
        3,
        &TunnelSettings {
            extend: ExtendPolicy::Delegate,
            ..settings()
        },
        now,
    );
    let first = net.peer(1);
    let id = net
        .engine(0)
        .create_circuit_via(first, 2, now)
        .expect("create");
    net.pump(now);

    assert_eq!(net.engine(0).circuit_state(id), Some(CircuitState::Ready));
    let shared = net.engine(0).tables();
    let tables = tables::lock(&shared);
    let circuit = tables.circuits.get(&id).expect("circuit");
    assert_eq!(circuit.hops()[0].peer, Some(first));
    assert_eq!(circuit.hops()[1].peer, None);
}

#[test]
fn test_random_a_priori_punctures() {
    let now = Instant::now();
    let mut net = MemoryNetwork::new(
        3,
        &TunnelSettings {
            extend: ExtendPolicy::Random,
            ..settings()
        },
        now,
    );
    let id = net.engine(0).create_circuit(Some(2), now).expect("create");
    net.pump(now);

    assert_eq!(net.engine(0).circuit_state(id), Some(CircuitState::Ready));
    let punctures: Vec<_> = net
        .trace()
        .iter()
        .filter(|t| t.type_byte == MessageType::Puncture.as_u8())
        .collect();
    assert_eq!(punctures.len(), 2);
    assert_eq!(punctures[0].circuit_id, id);
    assert_eq!(punctures[1].circuit_id, frame::ZERO_HOP_CIRCUIT);
}

#[test]
fn test_not_an_exit() {
    let now = Instant::now();
    let exit_settings = TunnelSettings {
        become_exit: false,
        ..settings()
    };
    let mut net = MemoryNetwork::with_settings(vec![settings(), exit_settings], now);
    let first = net.peer(1);
    let id = net
        .engine(0)
        .create_circuit_via(first, 1, now)
        .expect("create");
    net.pump(now);

    net.engine(0).send_data(id, dest(), b"nope", now).expect("send");
    net.pump(now);

    assert!(net.node(1).exit_sends().is_empty());
    assert_eq!(net.engine(1).counters().dropped_exit, 1);
}

#[test]
fn test_stats_exchange() {
    let now = Instant::now();
    let mut net = MemoryNetwork::new(2, &settings(), now);
    assert_eq!(net.engine(0).request_stats(), 1);
    net.pump(now);

    let a1 = net.address(1);
    assert!(net
        .node(0)
        .events()
        .iter()
        .any(|e| matches!(e, TunnelEvent::TunnelStats { peer, .. } if *peer == a1)));
}

#[test]
fn test_top_up() {
    let now = Instant::now();
    let mut net = MemoryNetwork::new(
        3,
        &TunnelSettings {
            max_circuits: 2,
            length: LengthPolicy::Constant { hops: 1 },
            ..settings()
        },
        now,
    );
    assert_eq!(net.engine(0).top_up(now), 2);
    net.pump(now);
    assert_eq!(net.engine(0).ready_circuits().len(), 2);
    assert_eq!(net.engine(0).top_up(now), 0);
}

#[test]
fn test_duplicate_create_ignored() {
    let now = Instant::now();
    let mut net = MemoryNetwork::new(2, &settings(), now);
    let first = net.peer(1);
    let id = net
        .engine(0)
        .create_circuit_via(first, 1, now)
        .expect("create");
    net.pump(now);
    let (a0, a1) = (net.address(0), net.address(1));
    let key = net.engine(1).link_key(&LinkKey::new(a0, id));
    assert!(key.is_some());

    let replay = TunnelMessage::Create {
        encrypted_key: vec![0u8; 64],
    };
    let datagram = BypassTag::default().wrap(&replay.to_frame(id).expect("frame"));
    net.inject(a0, a1, datagram);
    net.pump(now);

    assert_eq!(net.engine(1).link_key(&LinkKey::new(a0, id)), key);
    assert_eq!(net.engine(0).circuit_state(id), Some(CircuitState::Ready));
}

/// Send an EXTEND from node 0 to node 1 on circuit `id`, layered with the
/// key node 1 holds for that link.
fn inject_extend(net: &mut MemoryNetwork, id: u32, target: Option<HostPort>, encrypted_key: Vec<u8>) {
    let (a0, a1) = (net.address(0), net.address(1));
    let key = net.engine(1).link_key(&LinkKey::new(a0, id)).expect("link key");
    let message = TunnelMessage::Extend {
        target,
        encrypted_key,
    };
    let mut body = message.encode_body().expect("encode");
    key.encrypt(&mut body);
    let datagram = BypassTag::default().wrap(&frame::encode(id, MessageType::Extend.as_u8(), &body));
    net.inject(a0, a1, datagram);
}

#[test]
fn test_extend_to_unspecified_picks_candidate() {
    let now = Instant::now();
    let mut net = MemoryNetwork::new(3, &settings(), now);
    let first = net.peer(1);
    let id = net
        .engine(0)
        .create_circuit_via(first, 1, now)
        .expect("create");
    net.pump(now);
    net.clear_trace();

    let mut rng = StdRng::seed_from_u64(7);
    let share = DhSecret::random(&mut rng).public_share().as_bytes().to_vec();
    inject_extend(&mut net, id, Some(HostPort::unspecified()), share);
    net.pump(now);

    let (a0, a1, a2) = (net.address(0), net.address(1), net.address(2));
    assert!(net
        .trace()
        .iter()
        .any(|t| t.type_byte == MessageType::Create.as_u8() && t.from == a1 && t.to == a2));
    let shared = net.engine(1).tables();
    let relays = tables::lock(&shared);
    assert_eq!(relays.relays.len(), 2);
    let route = relays.relays.get(&LinkKey::new(a0, id)).expect("relay");
    assert_eq!(route.mate.peer, a2);
    assert!(relays.relays.keys().all(|k| !k.peer.ip().is_unspecified()));
}

#[test]
fn test_extend_replaces_half_open_relay() {
    let now = Instant::now();
    let mut net = MemoryNetwork::new(3, &settings(), now);
    net.mute(2);
    let first = net.peer(1);
    let id = net
        .engine(0)
        .create_circuit_via(first, 2, now)
        .expect("create");
    net.pump(now);

    let (a0, a2) = (net.address(0), net.address(2));
    let toward_originator = LinkKey::new(a0, id);
    let old = {
        let shared = net.engine(1).tables();
        let relays = tables::lock(&shared);
        let route = relays.relays.get(&toward_originator).expect("half-open relay");
        assert!(!route.online);
        route.mate
    };
    assert!(net.engine(1).has_request(&RequestKey::Relay(old)));

    inject_extend(&mut net, id, Some(HostPort::from(a2)), vec![0u8; 64]);
    net.pump(now);

    let new = {
        let shared = net.engine(1).tables();
        let relays = tables::lock(&shared);
        assert_eq!(relays.relays.len(), 2);
        assert!(!relays.relays.contains_key(&old));
        let route = relays.relays.get(&toward_originator).expect("replacement relay");
        assert!(!route.online);
        route.mate
    };
    assert_ne!(new, old);
    assert_eq!(new.peer, a2);
    assert!(!net.engine(1).has_request(&RequestKey::Relay(old)));
    assert!(net.engine(1).has_request(&RequestKey::Relay(new)));
}

#[test]
fn test_failed_exit_send_counts_drop() {
    let now = Instant::now();
    let mut net = MemoryNetwork::new(
        1,
        &TunnelSettings {
            allow_zero_hop: true,
            ..settings()
        },
        now,
    );
    let id = net.engine(0).create_circuit(Some(0), now).expect("zero hop");
    let destination = HostPort::new("unresolvable.invalid", 53);
    net.engine(0).send_data(id, destination, b"query", now).expect("send");
    let link = LinkKey::new(net.address(0), id);
    assert_eq!(net.engine(0).counters().bytes_exit, 5);

    net.engine(0).on_exit_failure(link, 5);
    let counters = net.engine(0).counters();
    assert_eq!(counters.dropped_exit, 1);
    assert_eq!(counters.bytes_exit, 0);
}
