//! tunlink - full-system VPN over Shadowsocks
//!
//! Establishes a system-wide tunnel by coordinating a local Shadowsocks
//! client, a tun2socks packet relay and the privileged routing daemon.

use clap::{Parser, Subcommand};
use tunlink_core::error::{NativeErrorKind, TunlinkError};
use tunlink_core::init_logging;

mod cli;

#[derive(Parser)]
#[command(name = "tunlink")]
#[command(about = "Full-system VPN through a Shadowsocks server")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and route all traffic through the server until interrupted
    Connect(cli::connect::ConnectArgs),
    /// Run a single connectivity check
    Probe {
        #[command(subcommand)]
        check: cli::probe::ProbeCommand,
    },
}

fn main() {
    if let Err(e) = init_logging() {
        eprintln!("Failed to initialize logging: {}", e);
        std::process::exit(NativeErrorKind::Unexpected.code());
    }

    let cli = Cli::parse();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Failed to start async runtime: {}", e);
            std::process::exit(NativeErrorKind::Unexpected.code());
        }
    };

    let result = runtime.block_on(async {
        match cli.command {
            Commands::Connect(args) => cli::connect::run_connect(args).await,
            Commands::Probe { check } => cli::probe::run_probe(check).await,
        }
    });

    match result {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            let exit_code = match &e {
                // Same codes as the native error taxonomy
                TunlinkError::Native(native) => native.kind().code(),
                TunlinkError::Config(_) | TunlinkError::Toml(_) => {
                    NativeErrorKind::SystemConfigurationException.code()
                }
                TunlinkError::Io(_) => NativeErrorKind::Unexpected.code(),
            };

            eprintln!("{}", e);
            std::process::exit(exit_code);
        }
    }
}
