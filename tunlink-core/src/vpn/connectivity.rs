//! Network connectivity probes
//!
//! Name resolution, TCP reachability with retries, and two checks that run
//! through the local SOCKS proxy: one validates the server credentials by
//! fetching a well-known website, the other detects whether the server
//! relays UDP by round-tripping a DNS query.

use crate::error::NativeError;
use crate::vpn::socks::{self, TargetAddr};
use async_trait::async_trait;
use rand::seq::SliceRandom;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tracing::{debug, error, info, warn};

/// How long name resolution may take
pub const DNS_LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Overall budget of the UDP forwarding check
pub const UDP_FORWARDING_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Delay between DNS queries sent by the UDP forwarding check
pub const UDP_FORWARDING_TEST_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Websites fetched through the proxy to validate the credentials
const CREDENTIALS_TEST_DOMAINS: [&str; 3] = ["example.com", "ietf.org", "wikipedia.org"];

/// Public resolver the UDP forwarding check queries
const UDP_TEST_RESOLVER: SocketAddr =
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)), 53);

/// DNS query for google.com, type A, class IN
const DNS_REQUEST: [u8; 28] = [
    0, 0, // ID
    1, 0, // flags: recursion desired
    0, 1, // QDCOUNT
    0, 0, // ANCOUNT
    0, 0, // NSCOUNT
    0, 0, // ARCOUNT
    6, b'g', b'o', b'o', b'g', b'l', b'e', //
    3, b'c', b'o', b'm', //
    0, // root label
    0, 1, // QTYPE A
    0, 1, // QCLASS IN
];

/// Retry policy for [`is_server_reachable`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReachabilityOptions {
    /// Per-attempt connect timeout; zero means no timeout
    pub timeout: Duration,

    /// Total number of connection attempts
    pub max_attempts: u32,

    /// Delay between failed attempts
    pub retry_interval: Duration,
}

impl Default for ReachabilityOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::ZERO,
            max_attempts: 1,
            retry_interval: Duration::ZERO,
        }
    }
}

/// Resolve `hostname` to an IPv4 address using the system resolver
///
/// Effectively a no-op when `hostname` already is an IPv4 literal.
#[tracing::instrument]
pub async fn lookup_ip(hostname: &str) -> Result<Ipv4Addr, NativeError> {
    if let Ok(ip) = hostname.parse::<Ipv4Addr>() {
        return Ok(ip);
    }

    let lookup = tokio::net::lookup_host((hostname, 0));
    let addrs = match tokio::time::timeout(DNS_LOOKUP_TIMEOUT, lookup).await {
        Ok(Ok(addrs)) => addrs,
        Ok(Err(e)) => {
            debug!(error = %e, "DNS lookup failed");
            return Err(NativeError::server_unreachable(
                "could not resolve proxy server hostname",
            ));
        }
        Err(_) => {
            return Err(NativeError::server_unreachable(format!(
                "DNS lookup timed out after {:?}",
                DNS_LOOKUP_TIMEOUT
            )));
        }
    };

    addrs
        .filter_map(|addr| match addr.ip() {
            IpAddr::V4(ip) => Some(ip),
            IpAddr::V6(_) => None,
        })
        .next()
        .ok_or_else(|| NativeError::server_unreachable("proxy server has no IPv4 address"))
}

/// Succeeds iff a TCP connection to `host:port` can be established
///
/// The connection is closed immediately. Failed attempts are retried up to
/// `max_attempts` times in total, `retry_interval` apart.
#[tracing::instrument(fields(max_attempts = options.max_attempts))]
pub async fn is_server_reachable(
    host: &str,
    port: u16,
    options: ReachabilityOptions,
) -> Result<(), NativeError> {
    let max_attempts = options.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;

        let connect = TcpStream::connect((host, port));
        let result = if options.timeout.is_zero() {
            connect.await
        } else {
            match tokio::time::timeout(options.timeout, connect).await {
                Ok(result) => result,
                Err(_) => Err(std::io::ErrorKind::TimedOut.into()),
            }
        };

        match result {
            Ok(stream) => {
                drop(stream);
                debug!(attempt, "Server reachable");
                return Ok(());
            }
            Err(e) if attempt < max_attempts => {
                debug!(attempt, error = %e, "Connection attempt failed, retrying");
                tokio::time::sleep(options.retry_interval).await;
            }
            Err(e) => {
                debug!(attempt, error = %e, "Server unreachable");
                return Err(NativeError::server_unreachable(format!(
                    "could not connect to {}:{} after {} attempt(s)",
                    host, port, attempt
                )));
            }
        }
    }
}

/// Succeeds iff a website can be fetched through the local proxy
///
/// One of a few well-known domains is picked at random and sent a `HEAD`
/// request; the first bytes back must be an HTTP/1.1 status line.
#[tracing::instrument]
pub async fn validate_server_credentials(proxy: SocketAddr) -> Result<(), NativeError> {
    let domain = CREDENTIALS_TEST_DOMAINS
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or(CREDENTIALS_TEST_DOMAINS[0]);

    let mut stream = socks::connect(proxy, &TargetAddr::Domain(domain.to_string(), 80))
        .await
        .map_err(|e| {
            NativeError::invalid_credentials(format!(
                "could not connect to remote test website: {}",
                e
            ))
        })?;

    let request = format!("HEAD / HTTP/1.1\r\nHost: {}\r\n\r\n", domain);
    stream.write_all(request.as_bytes()).await.map_err(|e| {
        NativeError::invalid_credentials(format!("could not send test request: {}", e))
    })?;

    let mut buf = [0u8; 512];
    let n = stream.read(&mut buf).await.map_err(|e| {
        NativeError::invalid_credentials(format!("could not connect to remote test website: {}", e))
    })?;
    let _ = stream.shutdown().await;

    if n == 0 {
        return Err(NativeError::invalid_credentials(
            "could not connect to remote test website",
        ));
    }

    if buf[..n].starts_with(b"HTTP/1.1") {
        debug!(domain, "Credentials validated");
        Ok(())
    } else {
        Err(NativeError::invalid_credentials(
            "unexpected response from remote test website",
        ))
    }
}

/// Detects whether the server forwards UDP
///
/// Sends a DNS query through a SOCKS UDP association every second and
/// returns `true` as soon as any datagram comes back, `false` once
/// [`UDP_FORWARDING_TEST_TIMEOUT`] elapses. Only local socket failures are
/// errors.
#[tracing::instrument]
pub async fn check_udp_forwarding_enabled(proxy: SocketAddr) -> Result<bool, NativeError> {
    check_udp_forwarding_with(
        proxy,
        UDP_FORWARDING_TEST_RETRY_INTERVAL,
        UDP_FORWARDING_TEST_TIMEOUT,
    )
    .await
}

pub(crate) async fn check_udp_forwarding_with(
    proxy: SocketAddr,
    retry_interval: Duration,
    overall_timeout: Duration,
) -> Result<bool, NativeError> {
    // The association lives as long as the control connection stays open.
    let (_control, relay) = socks::udp_associate(proxy).await.map_err(|e| {
        warn!(error = %e, "UDP associate failed");
        NativeError::udp_forwarding_disabled("could not connect to local proxy")
    })?;

    let bind_addr: SocketAddr = if relay.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(bind_addr)
        .await
        .map_err(|_| NativeError::udp_forwarding_disabled("UDP socket failure"))?;

    let packet = socks::udp_frame(&TargetAddr::Ip(UDP_TEST_RESOLVER), &DNS_REQUEST)
        .map_err(|e| NativeError::udp_forwarding_disabled(e.to_string()))?;

    let deadline = tokio::time::sleep(overall_timeout);
    tokio::pin!(deadline);
    let mut ticker = tokio::time::interval(retry_interval);
    let mut buf = [0u8; 512];

    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => {
                return match received {
                    Ok((len, from)) => {
                        info!(len, %from, "UDP forwarding enabled");
                        Ok(true)
                    }
                    Err(e) => {
                        warn!(error = %e, "UDP socket failure");
                        Err(NativeError::udp_forwarding_disabled("UDP socket failure"))
                    }
                };
            }
            _ = ticker.tick() => {
                if let Err(e) = socket.send_to(&packet, relay).await {
                    error!(error = %e, "Failed to send data through UDP");
                }
            }
            _ = &mut deadline => {
                info!("No UDP response before timeout, UDP forwarding disabled");
                return Ok(false);
            }
        }
    }
}

/// The probes a connection needs, as a seam for tests
#[async_trait]
pub trait Connectivity: Send + Sync {
    async fn is_reachable(
        &self,
        host: &str,
        port: u16,
        options: ReachabilityOptions,
    ) -> Result<(), NativeError>;

    async fn validate_credentials(&self, proxy: SocketAddr) -> Result<(), NativeError>;

    async fn check_udp_forwarding(&self, proxy: SocketAddr) -> Result<bool, NativeError>;
}

/// Probes backed by real sockets
#[derive(Debug, Default, Clone, Copy)]
pub struct SocksConnectivity;

#[async_trait]
impl Connectivity for SocksConnectivity {
    async fn is_reachable(
        &self,
        host: &str,
        port: u16,
        options: ReachabilityOptions,
    ) -> Result<(), NativeError> {
        is_server_reachable(host, port, options).await
    }

    async fn validate_credentials(&self, proxy: SocketAddr) -> Result<(), NativeError> {
        validate_server_credentials(proxy).await
    }

    async fn check_udp_forwarding(&self, proxy: SocketAddr) -> Result<bool, NativeError> {
        check_udp_forwarding_enabled(proxy).await
    }
}
