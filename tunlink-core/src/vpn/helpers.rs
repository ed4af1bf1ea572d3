//! The two helper executables a tunnel needs
//!
//! [`ProxyProcess`] runs the Shadowsocks client (`ss-local`) that exposes a
//! local SOCKS5 endpoint, and [`TunnelProcess`] runs `badvpn-tun2socks`,
//! which owns the virtual network interface and relays its traffic into that
//! endpoint. Both are thin argument builders over [`HelperProcess`].

use crate::config::toml_config::HelperSettings;
use crate::config::{Platform, TunnelConfig};
use crate::error::ConfigError;
use crate::vpn::process::HelperProcess;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Executable name of the Shadowsocks client
pub const PROXY_BINARY_NAME: &str = "ss-local";

/// Executable name of the packet relay
pub const TUNNEL_BINARY_NAME: &str = "badvpn-tun2socks";

/// Per-connection timeout passed to the proxy, effectively disabling it
const PROXY_TIMEOUT_SECS: i32 = i32::MAX;

/// Resolved locations of the helper executables
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelperBinaries {
    pub proxy: PathBuf,
    pub tunnel: PathBuf,
}

impl HelperBinaries {
    /// Use the configured paths, falling back to a `PATH` lookup
    pub fn resolve(settings: &HelperSettings) -> Result<Self, ConfigError> {
        Ok(Self {
            proxy: locate(settings.proxy_binary.as_deref(), PROXY_BINARY_NAME)?,
            tunnel: locate(settings.tunnel_binary.as_deref(), TUNNEL_BINARY_NAME)?,
        })
    }
}

fn locate(configured: Option<&Path>, name: &str) -> Result<PathBuf, ConfigError> {
    if let Some(path) = configured {
        if path.is_file() {
            return Ok(path.to_path_buf());
        }
        return Err(ConfigError::BinaryNotFound {
            name: path.display().to_string(),
        });
    }

    let path = which::which(name).map_err(|_| ConfigError::BinaryNotFound {
        name: name.to_string(),
    })?;
    debug!(name, path = %path.display(), "Located helper binary");
    Ok(path)
}

/// The local Shadowsocks client
#[derive(Debug)]
pub struct ProxyProcess {
    process: HelperProcess,
    listen_port: u16,
}

impl ProxyProcess {
    pub fn new(path: impl Into<PathBuf>, listen_port: u16) -> Self {
        Self {
            process: HelperProcess::new("proxy", path),
            listen_port,
        }
    }

    /// Launch the proxy for `config`; exit is reported via the exit listener
    pub fn start(&self, config: &TunnelConfig) {
        let args = proxy_args(config, self.listen_port);
        info!(
            host = %config.host,
            port = config.port,
            method = %config.method,
            args = ?redact_password(&args),
            "Starting proxy"
        );
        self.process.launch(args);
    }
}

impl Deref for ProxyProcess {
    type Target = HelperProcess;

    fn deref(&self) -> &HelperProcess {
        &self.process
    }
}

/// Command line of `ss-local`
pub fn proxy_args(config: &TunnelConfig, listen_port: u16) -> Vec<String> {
    vec![
        "-l".to_string(),
        listen_port.to_string(),
        "-s".to_string(),
        config.host.clone(),
        "-p".to_string(),
        config.port.to_string(),
        "-k".to_string(),
        config.password.expose().to_string(),
        "-m".to_string(),
        config.method.clone(),
        "-t".to_string(),
        PROXY_TIMEOUT_SECS.to_string(),
        "-u".to_string(),
    ]
}

/// Copy of a proxy command line that is safe to log
pub fn redact_password(args: &[String]) -> Vec<String> {
    let mut redacted = args.to_vec();
    if let Some(pos) = redacted.iter().position(|arg| arg == "-k") {
        if let Some(value) = redacted.get_mut(pos + 1) {
            *value = "[REDACTED]".to_string();
        }
    }
    redacted
}

/// The tun2socks packet relay
#[derive(Debug)]
pub struct TunnelProcess {
    process: HelperProcess,
    platform: Platform,
}

impl TunnelProcess {
    pub fn new(path: impl Into<PathBuf>, platform: Platform) -> Self {
        Self {
            process: HelperProcess::new("tunnel", path),
            platform,
        }
    }

    /// Launch the relay, with UDP relaying only when the server forwards UDP
    pub fn start(&self, udp_enabled: bool) {
        info!(device = %self.platform.tun_device_name, udp_enabled, "Starting tunnel");
        self.process.launch(tunnel_args(&self.platform, udp_enabled));
    }
}

impl Deref for TunnelProcess {
    type Target = HelperProcess;

    fn deref(&self) -> &HelperProcess {
        &self.process
    }
}

/// Command line of `badvpn-tun2socks`
pub fn tunnel_args(platform: &Platform, udp_enabled: bool) -> Vec<String> {
    let proxy = platform.proxy_endpoint();
    let mut args = vec![
        "--tundev".to_string(),
        platform.tun_device_descriptor(),
        "--netif-ipaddr".to_string(),
        platform.virtual_router_ip.to_string(),
        "--netif-netmask".to_string(),
        platform.virtual_router_netmask.to_string(),
        "--socks-server-addr".to_string(),
        proxy.clone(),
        "--loglevel".to_string(),
        "error".to_string(),
        "--transparent-dns".to_string(),
    ];

    if udp_enabled {
        args.push("--socks5-udp".to_string());
        args.push("--udp-relay-addr".to_string());
        args.push(proxy);
    }

    args
}
