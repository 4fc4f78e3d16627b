//! Server side of the SOCKS5 handshake (RFC 1928) for local clients
//!
//! Only the no-authentication method and the CONNECT command are accepted.
//! Local clients are tun2socks or applications on the loopback interface, so
//! authentication happens between this proxy and the upstream instead.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_NONE_ACCEPTABLE: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

pub const REPLY_SUCCEEDED: u8 = 0x00;
pub const REPLY_GENERAL_FAILURE: u8 = 0x01;
pub const REPLY_NETWORK_UNREACHABLE: u8 = 0x03;
pub const REPLY_HOST_UNREACHABLE: u8 = 0x04;
pub const REPLY_CONNECTION_REFUSED: u8 = 0x05;
pub const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
pub const REPLY_ADDRESS_NOT_SUPPORTED: u8 = 0x08;

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("Unsupported SOCKS version {0}")]
    Version(u8),

    #[error("Client offered no acceptable authentication method")]
    NoAcceptableMethod,

    #[error("Unsupported command {0}")]
    Command(u8),

    #[error("Unsupported address type {0}")]
    AddressType(u8),

    #[error("Invalid domain name in request")]
    Domain,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Destination requested by a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl std::fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetAddr::Ip(addr) => write!(f, "{}", addr),
            TargetAddr::Domain(host, port) => write!(f, "{}:{}", host, port),
        }
    }
}

/// Run method negotiation and read the CONNECT request
///
/// Protocol errors that have a SOCKS reply code are answered before
/// returning the error; the caller only needs to drop the stream.
pub async fn accept<S>(stream: &mut S) -> Result<TargetAddr, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Greeting: VER NMETHODS METHODS...
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;
    if header[0] != VERSION {
        return Err(HandshakeError::Version(header[0]));
    }

    let mut methods = vec![0u8; header[1] as usize];
    stream.read_exact(&mut methods).await?;

    if !methods.contains(&METHOD_NO_AUTH) {
        stream.write_all(&[VERSION, METHOD_NONE_ACCEPTABLE]).await?;
        return Err(HandshakeError::NoAcceptableMethod);
    }
    stream.write_all(&[VERSION, METHOD_NO_AUTH]).await?;

    // Request: VER CMD RSV ATYP DST.ADDR DST.PORT
    let mut request = [0u8; 4];
    stream.read_exact(&mut request).await?;
    if request[0] != VERSION {
        return Err(HandshakeError::Version(request[0]));
    }

    if request[1] != CMD_CONNECT {
        send_reply(stream, REPLY_COMMAND_NOT_SUPPORTED).await?;
        return Err(HandshakeError::Command(request[1]));
    }

    let target = match request[3] {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            let port = stream.read_u16().await?;
            TargetAddr::Ip(SocketAddr::from((Ipv4Addr::from(octets), port)))
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            let port = stream.read_u16().await?;
            TargetAddr::Ip(SocketAddr::from((Ipv6Addr::from(octets), port)))
        }
        ATYP_DOMAIN => {
            let len = stream.read_u8().await?;
            let mut name = vec![0u8; len as usize];
            stream.read_exact(&mut name).await?;
            let port = stream.read_u16().await?;
            match String::from_utf8(name) {
                Ok(host) if !host.is_empty() => TargetAddr::Domain(host, port),
                _ => {
                    send_reply(stream, REPLY_ADDRESS_NOT_SUPPORTED).await?;
                    return Err(HandshakeError::Domain);
                }
            }
        }
        other => {
            send_reply(stream, REPLY_ADDRESS_NOT_SUPPORTED).await?;
            return Err(HandshakeError::AddressType(other));
        }
    };

    Ok(target)
}

/// Send a reply with an unspecified IPv4 bind address
pub async fn send_reply<S>(stream: &mut S, code: u8) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream
        .write_all(&[VERSION, code, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
        .await?;
    stream.flush().await
}

/// Map an upstream dial failure onto a SOCKS reply code
pub fn reply_code(error: &tokio_socks::Error) -> u8 {
    match error {
        tokio_socks::Error::NetworkUnreachable => REPLY_NETWORK_UNREACHABLE,
        tokio_socks::Error::HostUnreachable => REPLY_HOST_UNREACHABLE,
        tokio_socks::Error::ConnectionRefused => REPLY_CONNECTION_REFUSED,
        _ => REPLY_GENERAL_FAILURE,
    }
}
