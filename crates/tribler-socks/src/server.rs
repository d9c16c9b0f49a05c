//! TCP listener for SOCKS5 clients.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};
use tribler_tunnel::TunnelHandle;

use crate::session;
use crate::{Result, SocksSettings};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub struct SocksServer {
    listener: TcpListener,
    tunnel: TunnelHandle,
    settings: SocksSettings,
}

impl SocksServer {
    pub async fn bind(
        address: SocketAddr,
        tunnel: TunnelHandle,
        settings: SocksSettings,
    ) -> Result<Self> {
        let listener = TcpListener::bind(address).await?;
        info!(address = %listener.local_addr()?, "SOCKS5 listening");
        Ok(Self {
            listener,
            tunnel,
            settings,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept clients until the task is dropped. Each client runs on its
    /// own task.
    pub async fn run(self) -> Result<()> {
        accept_loop(self.listener, self.tunnel, self.settings).await
    }
}

/// Where client connections come from.
trait Incoming: Send + Sync {
    fn accept(&self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send;
}

impl Incoming for TcpListener {
    fn accept(&self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send {
        TcpListener::accept(self)
    }
}

/// Accept errors (e.g. out of file descriptors) are logged and retried
/// after a pause.
async fn accept_loop(incoming: impl Incoming, tunnel: TunnelHandle, settings: SocksSettings) -> Result<()> {
    loop {
        let (stream, peer) = match incoming.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "SOCKS5 accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };
        let tunnel = tunnel.clone();
        tokio::spawn(async move {
            if let Err(e) = session::serve(stream, tunnel, settings).await {
                debug!(%peer, error = %e, "SOCKS5 client closed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::UdpSocket;
    use tribler_crypto::x25519::X25519StaticSecret;
    use tribler_tunnel::overlay::PeerList;
    use tribler_tunnel::{TunnelRuntime, TunnelSettings};

    use crate::Reply;

    /// A listener whose first `failures` accepts fail.
    struct Flaky {
        listener: TcpListener,
        failures: AtomicUsize,
    }

    impl Incoming for Flaky {
        fn accept(&self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send {
            async move {
                let left = self.failures.load(Ordering::SeqCst);
                if left > 0 {
                    self.failures.store(left - 1, Ordering::SeqCst);
                    return Err(io::Error::other("too many open files"));
                }
                self.listener.accept().await
            }
        }
    }

    #[tokio::test]
    async fn test_accept_error_keeps_listening() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind");
        let tunnel = TunnelRuntime::start(
            socket,
            X25519StaticSecret::from_bytes([6; 32]),
            TunnelSettings {
                max_circuits: 0,
                ..TunnelSettings::default()
            },
            Arc::new(PeerList::default()),
            Vec::new(),
        )
        .expect("runtime");

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("listen");
        let address = listener.local_addr().expect("local");
        let flaky = Flaky {
            listener,
            failures: AtomicUsize::new(2),
        };
        let server = tokio::spawn(accept_loop(flaky, tunnel.handle(), SocksSettings::default()));

        let mut control = TcpStream::connect(address).await.expect("connect");
        control.write_all(&[0x05, 0x01, 0x00]).await.expect("greeting");
        let mut method = [0u8; 2];
        control.read_exact(&mut method).await.expect("method");
        assert_eq!(method, [0x05, 0x00]);
        control
            .write_all(&[0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, 0, 80])
            .await
            .expect("request");
        let mut reply = [0u8; 10];
        control.read_exact(&mut reply).await.expect("reply");
        assert_eq!(reply[1], Reply::CommandNotSupported as u8);

        server.abort();
        tunnel.shutdown().await;
    }
}
