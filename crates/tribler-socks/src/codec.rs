//! Control-connection messages (RFC 1928 §3-§6).
//!
//! ```text
//! greeting: VER | NMETHODS | METHODS...
//! request:  VER | CMD | RSV | ATYP | DST.ADDR | DST.PORT
//! reply:    VER | REP | RSV | ATYP | BND.ADDR | BND.PORT
//! ```

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tribler_wire::HostPort;

use crate::{Result, SocksError, SOCKS_VERSION};

pub const METHOD_NO_AUTH: u8 = 0x00;
pub const METHOD_NONE_ACCEPTABLE: u8 = 0xFF;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Connect = 0x01,
    Bind = 0x02,
    UdpAssociate = 0x03,
}

impl Command {
    pub fn from_u8(byte: u8) -> Result<Self> {
        match byte {
            0x01 => Ok(Self::Connect),
            0x02 => Ok(Self::Bind),
            0x03 => Ok(Self::UdpAssociate),
            other => Err(SocksError::UnsupportedCommand(other)),
        }
    }
}

/// REP field of a reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Reply {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    NotAllowed = 0x02,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    TtlExpired = 0x06,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

impl Reply {
    /// The reply a failed request earns.
    pub fn for_error(error: &SocksError) -> Self {
        match error {
            SocksError::UnsupportedCommand(_) => Self::CommandNotSupported,
            SocksError::UnsupportedAddressType(_) => Self::AddressTypeNotSupported,
            _ => Self::GeneralFailure,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Request {
    pub command: Command,
    pub destination: HostPort,
}

/// Method negotiation. Only "no authentication" is accepted.
pub async fn negotiate<S>(stream: &mut S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let version = stream.read_u8().await?;
    if version != SOCKS_VERSION {
        return Err(SocksError::UnsupportedVersion(version));
    }
    let count = stream.read_u8().await? as usize;
    let mut methods = vec![0u8; count];
    stream.read_exact(&mut methods).await?;

    if !methods.contains(&METHOD_NO_AUTH) {
        stream
            .write_all(&[SOCKS_VERSION, METHOD_NONE_ACCEPTABLE])
            .await?;
        return Err(SocksError::NoAcceptableMethod);
    }
    stream.write_all(&[SOCKS_VERSION, METHOD_NO_AUTH]).await?;
    Ok(())
}

/// Read one request. The address is consumed even when the command is
/// unsupported, so the caller can still reply.
pub async fn read_request<S>(stream: &mut S) -> Result<Request>
where
    S: AsyncRead + Unpin,
{
    let version = stream.read_u8().await?;
    if version != SOCKS_VERSION {
        return Err(SocksError::UnsupportedVersion(version));
    }
    let command = stream.read_u8().await?;
    let _reserved = stream.read_u8().await?;
    let destination = read_address(stream).await?;
    Ok(Request {
        command: Command::from_u8(command)?,
        destination,
    })
}

async fn read_address<S>(stream: &mut S) -> Result<HostPort>
where
    S: AsyncRead + Unpin,
{
    let host = match stream.read_u8().await? {
        ATYP_IPV4 => {
            let mut ip = [0u8; 4];
            stream.read_exact(&mut ip).await?;
            Ipv4Addr::from(ip).to_string()
        }
        ATYP_IPV6 => {
            let mut ip = [0u8; 16];
            stream.read_exact(&mut ip).await?;
            Ipv6Addr::from(ip).to_string()
        }
        ATYP_DOMAIN => {
            let len = stream.read_u8().await? as usize;
            let mut name = vec![0u8; len];
            stream.read_exact(&mut name).await?;
            String::from_utf8(name).map_err(|_| SocksError::InvalidDomain)?
        }
        other => return Err(SocksError::UnsupportedAddressType(other)),
    };
    let port = stream.read_u16().await?;
    Ok(HostPort::new(host, port))
}

pub async fn write_reply<S>(stream: &mut S, reply: Reply, bound: SocketAddr) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut out = vec![SOCKS_VERSION, reply as u8, 0x00];
    encode_address(&mut out, &HostPort::from(bound));
    stream.write_all(&out).await?;
    Ok(())
}

/// `ATYP | ADDR | PORT`. Names longer than 255 bytes are cut.
pub fn encode_address(out: &mut Vec<u8>, address: &HostPort) {
    match address.host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            out.push(ATYP_IPV4);
            out.extend_from_slice(&ip.octets());
        }
        Ok(IpAddr::V6(ip)) => {
            out.push(ATYP_IPV6);
            out.extend_from_slice(&ip.octets());
        }
        Err(_) => {
            let name = address.host.as_bytes();
            let name = &name[..name.len().min(u8::MAX as usize)];
            out.push(ATYP_DOMAIN);
            out.push(name.len() as u8);
            out.extend_from_slice(name);
        }
    }
    out.extend_from_slice(&address.port.to_be_bytes());
}

/// Decode `ATYP | ADDR | PORT` from the front of `data`. Returns the
/// address and the bytes consumed.
pub fn decode_address(data: &[u8]) -> Result<(HostPort, usize)> {
    let take = |start: usize, len: usize| -> Result<&[u8]> {
        data.get(start..start + len).ok_or(SocksError::Truncated {
            needed: start + len,
            available: data.len(),
        })
    };
    let atyp = take(0, 1)?[0];
    let (host, end) = match atyp {
        ATYP_IPV4 => {
            let mut ip = [0u8; 4];
            ip.copy_from_slice(take(1, 4)?);
            (Ipv4Addr::from(ip).to_string(), 5)
        }
        ATYP_IPV6 => {
            let mut ip = [0u8; 16];
            ip.copy_from_slice(take(1, 16)?);
            (Ipv6Addr::from(ip).to_string(), 17)
        }
        ATYP_DOMAIN => {
            let len = take(1, 1)?[0] as usize;
            let name = std::str::from_utf8(take(2, len)?).map_err(|_| SocksError::InvalidDomain)?;
            (name.to_string(), 2 + len)
        }
        other => return Err(SocksError::UnsupportedAddressType(other)),
    };
    let port = take(end, 2)?;
    Ok((HostPort::new(host, u16::from_be_bytes([port[0], port[1]])), end + 2))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_negotiate_no_auth() {
        let (mut client, mut server) = duplex(64);
        client.write_all(&[0x05, 0x02, 0x02, 0x00]).await.expect("write");
        negotiate(&mut server).await.expect("negotiate");
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.expect("read");
        assert_eq!(reply, [0x05, 0x00]);
    }

    #[tokio::test]
    async fn test_negotiate_rejects_auth_only() {
        let (mut client, mut server) = duplex(64);
        client.write_all(&[0x05, 0x01, 0x02]).await.expect("write");
        assert!(matches!(
            negotiate(&mut server).await,
            Err(SocksError::NoAcceptableMethod)
        ));
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.expect("read");
        assert_eq!(reply, [0x05, 0xFF]);
    }

    #[tokio::test]
    async fn test_read_udp_associate() {
        let (mut client, mut server) = duplex(64);
        client
            .write_all(&[0x05, 0x03, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
            .await
            .expect("write");
        let request = read_request(&mut server).await.expect("request");
        assert_eq!(request.command, Command::UdpAssociate);
        assert!(request.destination.is_unspecified());
    }

    #[tokio::test]
    async fn test_read_domain_request() {
        let (mut client, mut server) = duplex(64);
        let mut msg = vec![0x05, 0x01, 0x00, ATYP_DOMAIN, 11];
        msg.extend_from_slice(b"example.org");
        msg.extend_from_slice(&443u16.to_be_bytes());
        client.write_all(&msg).await.expect("write");
        let request = read_request(&mut server).await.expect("request");
        assert_eq!(request.command, Command::Connect);
        assert_eq!(request.destination, HostPort::new("example.org", 443));
    }

    #[tokio::test]
    async fn test_unknown_command_consumes_address() {
        let (mut client, mut server) = duplex(64);
        client
            .write_all(&[0x05, 0x09, 0x00, 0x01, 10, 0, 0, 1, 0, 80])
            .await
            .expect("write");
        let err = read_request(&mut server).await.expect_err("unknown");
        assert_eq!(Reply::for_error(&err), Reply::CommandNotSupported);
    }

    #[tokio::test]
    async fn test_reply_layout() {
        let (mut client, mut server) = duplex(64);
        let bound: SocketAddr = "127.0.0.1:4000".parse().expect("addr");
        write_reply(&mut server, Reply::Succeeded, bound)
            .await
            .expect("reply");
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.expect("read");
        assert_eq!(reply, [0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0x0F, 0xA0]);
    }

    #[test]
    fn test_address_codec() {
        for address in [
            HostPort::new("10.1.2.3", 53),
            HostPort::new("::1", 8080),
            HostPort::new("tracker.example", 6969),
        ] {
            let mut out = Vec::new();
            encode_address(&mut out, &address);
            let (decoded, used) = decode_address(&out).expect("decode");
            assert_eq!(decoded, address);
            assert_eq!(used, out.len());
        }
        assert!(matches!(
            decode_address(&[ATYP_IPV4, 1, 2]),
            Err(SocksError::Truncated { .. })
        ));
        assert!(matches!(
            decode_address(&[0x07]),
            Err(SocksError::UnsupportedAddressType(0x07))
        ));
    }
}
