//! Connect command implementation
//!
//! Brings up the tunnel and keeps it up until Ctrl-C or until a helper dies.

use clap::Args;
use colored::Colorize;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use tunlink_core::config::toml_config::load_settings;
use tunlink_core::config::{Platform, TunnelConfig};
use tunlink_core::error::TunlinkError;
use tunlink_core::types::Password;
use tunlink_core::vpn::connectivity::{is_server_reachable, lookup_ip, ReachabilityOptions};
use tunlink_core::vpn::{ConnectionManager, HelperBinaries, ManagerOptions, PkexecInstaller};

/// How long to wait for the server before giving up
const SERVER_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// How long to wait for the helpers to go away after a failed start
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Server parameters for `tunlink connect`
#[derive(Args)]
pub struct ConnectArgs {
    /// Server hostname or IPv4 address
    #[arg(long)]
    host: String,

    /// Server port
    #[arg(long)]
    port: u16,

    /// Cipher, e.g. chacha20-ietf-poly1305
    #[arg(long)]
    method: String,

    /// Server password
    #[arg(long, env = "TUNLINK_PASSWORD", hide_env_values = true)]
    password: String,

    /// Background reconnect: skip credential validation
    #[arg(long)]
    auto_connect: bool,
}

/// Run the connect command
pub async fn run_connect(args: ConnectArgs) -> Result<(), TunlinkError> {
    let password = Password::from(args.password);
    let mut config = TunnelConfig::new(args.host.clone(), args.port, password, args.method);
    config.validate()?;

    let settings = load_settings()?;
    let mut platform = Platform::current();
    settings.apply_to(&mut platform);
    let binaries = HelperBinaries::resolve(&settings.helpers)?;

    // The routing daemon needs the server's IP to exempt it from the tunnel.
    let ip = lookup_ip(&args.host).await?;
    if !args.auto_connect {
        let options = ReachabilityOptions {
            timeout: SERVER_CONNECT_TIMEOUT,
            ..ReachabilityOptions::default()
        };
        is_server_reachable(&ip.to_string(), args.port, options).await?;
    }
    config.host = ip.to_string();

    let mut options = ManagerOptions::new(platform, binaries);
    options.is_auto_connect = args.auto_connect;
    if let Some(command) = settings.helpers.install_command.clone() {
        options.installer = Arc::new(PkexecInstaller::new(command));
    }

    let manager = ConnectionManager::new(config, options);
    manager.on_reconnecting(|| println!("{}", "⚠️  Network changed, reconnecting...".yellow()));
    manager.on_reconnected(|| println!("{}", "✓ Reconnected".green()));
    watch_power_events(&manager).await;

    println!("🔐 Connecting to {} ({}:{})...", args.host, ip, args.port);
    if let Err(e) = manager.start().await {
        let _ = tokio::time::timeout(SHUTDOWN_TIMEOUT, manager.once_stopped()).await;
        return Err(e.into());
    }

    let udp = if manager.is_udp_enabled() {
        "UDP enabled".green()
    } else {
        "UDP disabled".yellow()
    };
    println!("{} ({})", "✅ Connected".green().bold(), udp);
    println!("Press Ctrl+C to disconnect");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            println!("Disconnecting...");
            manager.stop().await;
        }
        _ = manager.once_stopped() => {
            println!("{}", "Connection lost".red());
        }
    }

    manager.once_stopped().await;
    println!("Disconnected");
    Ok(())
}

#[cfg(target_os = "linux")]
async fn watch_power_events(manager: &ConnectionManager) {
    use tunlink_core::vpn::power_monitor::PowerMonitor;

    match PowerMonitor::connect().await {
        Ok(monitor) => match monitor.start().await {
            Ok(events) => manager.watch_power_events(events),
            Err(e) => warn!(error = %e, "Suspend/resume events unavailable"),
        },
        Err(e) => warn!(error = %e, "Suspend/resume events unavailable"),
    }
}

#[cfg(not(target_os = "linux"))]
async fn watch_power_events(_manager: &ConnectionManager) {
    warn!("Suspend/resume events not supported on this platform");
}
