//! End-to-end fixtures.
//!
//! The tests under `tests/` run the tunnel in two ways: deterministically
//! on [`tribler_tunnel::memory::MemoryNetwork`], and over real loopback UDP
//! with one [`TunnelRuntime`] per node built by [`Cluster::start`].
//!
//! ```sh
//! cargo test -p tribler-integration-tests
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tribler_crypto::x25519::X25519StaticSecret;
use tribler_tunnel::overlay::PeerList;
use tribler_tunnel::settings::{ExtendPolicy, LengthPolicy};
use tribler_tunnel::{Peer, TunnelRuntime, TunnelSettings};
use tribler_wire::HostPort;

/// Settings shared by every scenario: two hops, subset extension, no
/// background top-up.
pub fn scenario_settings() -> TunnelSettings {
    TunnelSettings {
        max_circuits: 0,
        length: LengthPolicy::Constant { hops: 2 },
        extend: ExtendPolicy::Subset,
        ..TunnelSettings::default()
    }
}

/// The destination every scenario talks to.
pub fn destination() -> HostPort {
    HostPort::new("127.0.0.1", 9999)
}

/// A UDP server answering every datagram with `reply(payload)`.
pub async fn udp_responder(reply: fn(&[u8]) -> Vec<u8>) -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind responder");
    let address = socket.local_addr().expect("responder address");
    tokio::spawn(async move {
        let mut buf = vec![0u8; 65_536];
        while let Ok((len, from)) = socket.recv_from(&mut buf).await {
            let _ = socket.send_to(&reply(&buf[..len]), from).await;
        }
    });
    address
}

/// Origin plus relays over loopback UDP; every node knows every other.
pub struct Cluster {
    pub origin: TunnelRuntime,
    pub relays: Vec<TunnelRuntime>,
}

impl Cluster {
    pub async fn start(relays: usize) -> Self {
        let count = relays + 1;
        let mut sockets = Vec::with_capacity(count);
        let mut peers = Vec::with_capacity(count);
        let mut secrets = Vec::with_capacity(count);
        for i in 0..count {
            let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind node");
            let secret = X25519StaticSecret::from_bytes([i as u8 + 11; 32]);
            peers.push(Peer::new(
                socket.local_addr().expect("node address"),
                secret.public_key(),
            ));
            sockets.push(socket);
            secrets.push(secret);
        }

        let mut runtimes = sockets
            .into_iter()
            .zip(secrets)
            .enumerate()
            .map(|(i, (socket, secret))| {
                let others: Vec<Peer> = peers
                    .iter()
                    .enumerate()
                    .filter(|(j, _)| *j != i)
                    .map(|(_, p)| *p)
                    .collect();
                TunnelRuntime::start(
                    socket,
                    secret,
                    scenario_settings(),
                    Arc::new(PeerList::new(others)),
                    Vec::new(),
                )
                .expect("start node")
            })
            .collect::<Vec<_>>();
        let origin = runtimes.remove(0);
        Self {
            origin,
            relays: runtimes,
        }
    }

    pub async fn shutdown(self) {
        self.origin.shutdown().await;
        for relay in self.relays {
            relay.shutdown().await;
        }
    }
}

/// Poll `check` every 50 ms until it holds or `limit` passes.
pub async fn eventually<F, Fut>(limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}
