//! One SOCKS5 client: handshake, then a UDP association relayed through
//! reserved circuits until the control connection closes.

use std::net::SocketAddr;

use tokio::io::AsyncReadExt;
use tokio::net::{TcpStream, UdpSocket};
use tracing::{debug, info, trace, warn};
use tribler_tunnel::{TunnelDatagram, TunnelHandle, TunnelSession};

use crate::codec::{self, Command, Reply};
use crate::{udp, Result, SocksSettings};

const MAX_DATAGRAM: usize = 65_536;

/// Serve one control connection to completion.
pub async fn serve(
    mut stream: TcpStream,
    tunnel: TunnelHandle,
    settings: SocksSettings,
) -> Result<()> {
    let peer = stream.peer_addr()?;
    let local = stream.local_addr()?;
    let unbound = SocketAddr::new(local.ip(), 0);

    codec::negotiate(&mut stream).await?;
    let request = match codec::read_request(&mut stream).await {
        Ok(request) => request,
        Err(e) => {
            codec::write_reply(&mut stream, Reply::for_error(&e), unbound).await?;
            return Err(e);
        }
    };
    if request.command != Command::UdpAssociate {
        debug!(%peer, command = ?request.command, "refusing command");
        codec::write_reply(&mut stream, Reply::CommandNotSupported, unbound).await?;
        return Ok(());
    }

    let session = match tunnel
        .open_session(settings.circuits_per_session, settings.grace)
        .await
    {
        Ok(session) => session,
        Err(e) => {
            warn!(%peer, error = %e, "no circuits for SOCKS5 session");
            codec::write_reply(&mut stream, Reply::GeneralFailure, unbound).await?;
            return Err(e.into());
        }
    };

    let socket = UdpSocket::bind(unbound).await?;
    let bound = socket.local_addr()?;
    codec::write_reply(&mut stream, Reply::Succeeded, bound).await?;
    info!(
        %peer,
        %bound,
        session = session.id(),
        circuits = session.circuits().len(),
        "UDP association open"
    );

    // A zero port means the client will tell us by sending.
    let declared = request
        .destination
        .to_socket_addr()
        .filter(|a| a.port() != 0 && !a.ip().is_unspecified());
    let association = Association {
        socket,
        session,
        client: declared,
        client_ip: peer.ip(),
    };
    let result = association.run(&mut stream).await;
    info!(%peer, "UDP association closed");
    result
}

struct Association {
    socket: UdpSocket,
    session: TunnelSession,
    client: Option<SocketAddr>,
    client_ip: std::net::IpAddr,
}

impl Association {
    async fn run(mut self, control: &mut TcpStream) -> Result<()> {
        let mut control_buf = [0u8; 64];
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            tokio::select! {
                read = control.read(&mut control_buf) => {
                    match read {
                        Ok(0) => return Ok(()),
                        Ok(_) => continue,
                        Err(e) => return Err(e.into()),
                    }
                }

                received = self.socket.recv_from(&mut buf) => {
                    let (len, from) = received?;
                    self.from_client(from, &buf[..len])?;
                }

                datagram = self.session.recv() => {
                    match datagram {
                        Some(datagram) => self.to_client(datagram).await,
                        // Reservation starved for longer than its grace.
                        None => return Ok(()),
                    }
                }
            }
        }
    }

    fn from_client(&mut self, from: SocketAddr, datagram: &[u8]) -> Result<()> {
        match self.client {
            Some(client) if client != from => {
                trace!(%from, "datagram from foreign address dropped");
                return Ok(());
            }
            None if from.ip() != self.client_ip => {
                trace!(%from, "datagram from foreign host dropped");
                return Ok(());
            }
            None => self.client = Some(from),
            Some(_) => {}
        }

        match udp::decode(datagram) {
            Ok((destination, payload)) => {
                self.session.send_to(destination, payload.to_vec())?;
            }
            Err(e) => debug!(%from, error = %e, "bad SOCKS5 UDP datagram"),
        }
        Ok(())
    }

    async fn to_client(&self, datagram: TunnelDatagram) {
        let (Some(client), Some(origin)) = (self.client, datagram.origin) else {
            trace!(
                circuit_id = datagram.circuit_id,
                "tunnel data with no client or origin dropped"
            );
            return;
        };
        let wire = udp::encode(&origin, &datagram.payload);
        if let Err(e) = self.socket.send_to(&wire, client).await {
            debug!(%client, error = %e, "send to SOCKS5 client failed");
        }
    }
}
