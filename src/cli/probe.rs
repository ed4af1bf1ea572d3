//! Probe command implementation
//!
//! Runs one connectivity check and reports the result. The credential and
//! UDP checks need a local proxy that is already running.

use clap::Subcommand;
use colored::Colorize;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tunlink_core::error::TunlinkError;
use tunlink_core::vpn::connectivity::{
    check_udp_forwarding_enabled, is_server_reachable, validate_server_credentials,
    ReachabilityOptions,
};

/// Default local SOCKS proxy port
const DEFAULT_PROXY_PORT: u16 = 1081;

#[derive(Subcommand)]
pub enum ProbeCommand {
    /// Check that a TCP connection to a server can be established
    Reachable {
        #[arg(long)]
        host: String,

        #[arg(long)]
        port: u16,

        /// Total number of connection attempts
        #[arg(long, default_value_t = 1)]
        attempts: u32,

        /// Delay between attempts in milliseconds
        #[arg(long, default_value_t = 0)]
        interval_ms: u64,

        /// Per-attempt timeout in milliseconds; 0 disables it
        #[arg(long, default_value_t = 0)]
        timeout_ms: u64,
    },
    /// Fetch a test website through the local proxy
    Credentials {
        #[arg(long, default_value_t = DEFAULT_PROXY_PORT)]
        proxy_port: u16,
    },
    /// Check whether the server forwards UDP
    Udp {
        #[arg(long, default_value_t = DEFAULT_PROXY_PORT)]
        proxy_port: u16,
    },
}

/// Run a probe subcommand
pub async fn run_probe(command: ProbeCommand) -> Result<(), TunlinkError> {
    match command {
        ProbeCommand::Reachable {
            host,
            port,
            attempts,
            interval_ms,
            timeout_ms,
        } => {
            let options = ReachabilityOptions {
                timeout: Duration::from_millis(timeout_ms),
                max_attempts: attempts,
                retry_interval: Duration::from_millis(interval_ms),
            };
            is_server_reachable(&host, port, options).await?;
            println!("{} {}:{} is reachable", "✓".green(), host, port);
        }
        ProbeCommand::Credentials { proxy_port } => {
            validate_server_credentials(local_proxy(proxy_port)).await?;
            println!("{} Server credentials are valid", "✓".green());
        }
        ProbeCommand::Udp { proxy_port } => {
            if check_udp_forwarding_enabled(local_proxy(proxy_port)).await? {
                println!("{} Server forwards UDP", "✓".green());
            } else {
                println!("{} Server does not forward UDP", "✗".yellow());
            }
        }
    }

    Ok(())
}

fn local_proxy(port: u16) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, port))
}
