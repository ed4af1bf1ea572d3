//! Minimal SOCKS5 client
//!
//! Only what the connectivity probes need: the no-auth greeting, CONNECT,
//! UDP ASSOCIATE and the UDP request header (RFC 1928 section 7).

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const SOCKS_VERSION: u8 = 0x05;
const NO_AUTH: u8 = 0x00;
const NO_ACCEPTABLE_METHOD: u8 = 0xFF;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// SOCKS5 commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Connect = 0x01,
    UdpAssociate = 0x03,
}

/// Destination of a SOCKS request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl TargetAddr {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<(), SocksError> {
        match self {
            TargetAddr::Ip(addr) => {
                match addr.ip() {
                    IpAddr::V4(ip) => {
                        buf.push(ATYP_IPV4);
                        buf.extend_from_slice(&ip.octets());
                    }
                    IpAddr::V6(ip) => {
                        buf.push(ATYP_IPV6);
                        buf.extend_from_slice(&ip.octets());
                    }
                }
                buf.extend_from_slice(&addr.port().to_be_bytes());
            }
            TargetAddr::Domain(domain, port) => {
                let len = u8::try_from(domain.len())
                    .map_err(|_| SocksError::Protocol(format!("domain too long: {}", domain)))?;
                buf.push(ATYP_DOMAIN);
                buf.push(len);
                buf.extend_from_slice(domain.as_bytes());
                buf.extend_from_slice(&port.to_be_bytes());
            }
        }
        Ok(())
    }
}

impl std::fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetAddr::Ip(addr) => write!(f, "{}", addr),
            TargetAddr::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

/// Errors raised while talking to a SOCKS5 proxy
#[derive(Debug, thiserror::Error)]
pub enum SocksError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("request rejected: {}", reply_message(.0))]
    Rejected(u8),
}

fn reply_message(code: &u8) -> &'static str {
    match *code {
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown error",
    }
}

/// Open a relayed TCP connection to `target` through the proxy
pub async fn connect(proxy: SocketAddr, target: &TargetAddr) -> Result<TcpStream, SocksError> {
    let mut stream = TcpStream::connect(proxy).await?;
    negotiate(&mut stream).await?;
    send_request(&mut stream, Command::Connect, target).await?;
    read_reply(&mut stream).await?;
    Ok(stream)
}

/// Ask the proxy for a UDP relay
///
/// Returns the control connection, which must stay open for the lifetime of
/// the association, and the address datagrams should be sent to.
pub async fn udp_associate(proxy: SocketAddr) -> Result<(TcpStream, SocketAddr), SocksError> {
    let mut stream = TcpStream::connect(proxy).await?;
    negotiate(&mut stream).await?;
    let unspecified = TargetAddr::Ip(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0));
    send_request(&mut stream, Command::UdpAssociate, &unspecified).await?;
    let bound = read_reply(&mut stream).await?;

    // An unspecified bind address means "the proxy's own address".
    let relay = if bound.ip().is_unspecified() {
        SocketAddr::new(proxy.ip(), bound.port())
    } else {
        bound
    };

    Ok((stream, relay))
}

/// Wrap a datagram in the SOCKS5 UDP request header
pub fn udp_frame(target: &TargetAddr, payload: &[u8]) -> Result<Vec<u8>, SocksError> {
    // RSV(2) FRAG(1)
    let mut frame = vec![0x00, 0x00, 0x00];
    target.encode(&mut frame)?;
    frame.extend_from_slice(payload);
    Ok(frame)
}

async fn negotiate(stream: &mut TcpStream) -> Result<(), SocksError> {
    stream.write_all(&[SOCKS_VERSION, 0x01, NO_AUTH]).await?;

    let mut response = [0u8; 2];
    stream.read_exact(&mut response).await?;

    if response[0] != SOCKS_VERSION {
        return Err(SocksError::Protocol(format!(
            "unexpected SOCKS version {}",
            response[0]
        )));
    }

    match response[1] {
        NO_AUTH => Ok(()),
        NO_ACCEPTABLE_METHOD => Err(SocksError::Protocol(
            "no acceptable authentication method".to_string(),
        )),
        other => Err(SocksError::Protocol(format!(
            "unsupported authentication method {}",
            other
        ))),
    }
}

async fn send_request(
    stream: &mut TcpStream,
    command: Command,
    target: &TargetAddr,
) -> Result<(), SocksError> {
    let mut request = vec![SOCKS_VERSION, command as u8, 0x00];
    target.encode(&mut request)?;
    stream.write_all(&request).await?;
    Ok(())
}

async fn read_reply(stream: &mut TcpStream) -> Result<SocketAddr, SocksError> {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;

    if header[0] != SOCKS_VERSION {
        return Err(SocksError::Protocol(format!(
            "unexpected SOCKS version {}",
            header[0]
        )));
    }

    if header[1] != 0x00 {
        return Err(SocksError::Rejected(header[1]));
    }

    let ip = match header[3] {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        ATYP_DOMAIN => {
            // Bound domains are not used by any proxy we talk to; skip it.
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut domain = vec![0u8; len[0] as usize];
            stream.read_exact(&mut domain).await?;
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        }
        other => {
            return Err(SocksError::Protocol(format!(
                "unsupported address type {}",
                other
            )))
        }
    };

    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;

    Ok(SocketAddr::new(ip, u16::from_be_bytes(port)))
}
