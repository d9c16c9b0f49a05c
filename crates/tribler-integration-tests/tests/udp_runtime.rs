//! Runtimes talking over loopback UDP.

use std::time::Duration;

use tribler_integration_tests::{eventually, udp_responder, Cluster};
use tribler_wire::HostPort;

fn shout(payload: &[u8]) -> Vec<u8> {
    payload.to_ascii_uppercase()
}

#[tokio::test]
async fn circuits_build_over_udp() {
    let cluster = Cluster::start(3).await;
    let origin = cluster.origin.handle();

    let id = origin.create_circuit(None).await.expect("create");
    let handle = origin.clone();
    let ready = eventually(Duration::from_secs(10), || {
        let handle = handle.clone();
        async move {
            handle
                .ready_circuits()
                .await
                .map(|c| c.iter().any(|c| c.circuit_id == id && c.hops == 2))
                .unwrap_or(false)
        }
    })
    .await;
    assert!(ready, "circuit {id} never became ready");

    let counters = origin.counters().await.expect("counters");
    assert_eq!(counters.circuits_created, 1);
    cluster.shutdown().await;
}

#[tokio::test]
async fn session_round_trip_through_exit() {
    let cluster = Cluster::start(3).await;
    let responder = udp_responder(shout).await;

    let mut session = cluster
        .origin
        .handle()
        .open_session(2, Duration::from_secs(10))
        .await
        .expect("session");
    assert!(!session.circuits().is_empty());

    session
        .send_to(HostPort::from(responder), b"hello".to_vec())
        .expect("send");
    let datagram = tokio::time::timeout(Duration::from_secs(10), session.recv())
        .await
        .expect("reply in time")
        .expect("datagram");
    assert_eq!(datagram.payload, b"HELLO");
    assert_eq!(datagram.origin, Some(HostPort::from(responder)));
    assert!(session.circuits().contains(&datagram.circuit_id));

    let mut exit_bytes = 0;
    for relay in &cluster.relays {
        exit_bytes += relay.handle().counters().await.expect("counters").bytes_exit;
    }
    assert_eq!(exit_bytes, 10);

    drop(session);
    cluster.shutdown().await;
}
