//! Platform capabilities
//!
//! Everything that differs between operating systems is captured here once,
//! at construction, instead of being branched on throughout the code.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;

/// How the tunnel process is told which virtual device to use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunDeviceStyle {
    /// Plain device name (`--tundev tunlink-tun0`)
    Name,
    /// TAP-Windows descriptor (`tap0901:<name>:<ip>:<network>:<netmask>`)
    Tap0901,
}

/// Per-platform settings for the tunnel and the routing daemon
#[derive(Debug, Clone)]
pub struct Platform {
    /// Virtual network interface name
    pub tun_device_name: String,

    /// Descriptor style for `--tundev`
    pub tun_device_style: TunDeviceStyle,

    /// Address of the virtual interface itself
    pub tun_device_ip: Ipv4Addr,

    /// Network the virtual interface lives on
    pub tun_device_network: Ipv4Addr,

    /// Address of the virtual router tun2socks emulates
    pub virtual_router_ip: Ipv4Addr,

    /// Netmask of the virtual network
    pub virtual_router_netmask: Ipv4Addr,

    /// Local address the proxy process listens on
    pub proxy_address: Ipv4Addr,

    /// Local port the proxy process listens on
    pub proxy_port: u16,

    /// Unix socket path or named pipe of the routing daemon
    pub routing_service_path: PathBuf,

    /// Whether a missing routing daemon can be (re)installed on demand
    pub supports_daemon_install: bool,

    /// Whether the TAP device must be checked before connecting
    pub requires_tap_precheck: bool,
}

const PROXY_PORT: u16 = 1081;

impl Platform {
    /// Settings for the platform this binary was built for
    pub fn current() -> Self {
        if cfg!(target_os = "linux") {
            Self::linux()
        } else if cfg!(windows) {
            Self::windows()
        } else {
            Self::linux_like("tunlink-tap0", TunDeviceStyle::Tap0901, false)
        }
    }

    /// Linux: plain tun device, daemon installable through privilege escalation
    pub fn linux() -> Self {
        Self::linux_like("tunlink-tun0", TunDeviceStyle::Name, true)
    }

    /// Windows: TAP-Windows adapter that must already be configured, daemon behind a named pipe
    pub fn windows() -> Self {
        Self {
            routing_service_path: PathBuf::from(r"\\.\pipe\OutlineServicePipe"),
            requires_tap_precheck: true,
            ..Self::linux_like("tunlink-tap0", TunDeviceStyle::Tap0901, false)
        }
    }

    fn linux_like(device: &str, style: TunDeviceStyle, supports_daemon_install: bool) -> Self {
        Self {
            tun_device_name: device.to_string(),
            tun_device_style: style,
            tun_device_ip: Ipv4Addr::new(10, 0, 85, 2),
            tun_device_network: Ipv4Addr::new(10, 0, 85, 0),
            virtual_router_ip: Ipv4Addr::new(10, 0, 85, 1),
            virtual_router_netmask: Ipv4Addr::new(255, 255, 255, 0),
            proxy_address: Ipv4Addr::LOCALHOST,
            proxy_port: PROXY_PORT,
            routing_service_path: PathBuf::from("/var/run/outline_controller"),
            supports_daemon_install,
            requires_tap_precheck: false,
        }
    }

    /// The `--tundev` argument for the tunnel process
    pub fn tun_device_descriptor(&self) -> String {
        match self.tun_device_style {
            TunDeviceStyle::Name => self.tun_device_name.clone(),
            TunDeviceStyle::Tap0901 => format!(
                "tap0901:{}:{}:{}:{}",
                self.tun_device_name,
                self.tun_device_ip,
                self.tun_device_network,
                self.virtual_router_netmask
            ),
        }
    }

    /// `address:port` of the local SOCKS proxy
    pub fn proxy_endpoint(&self) -> String {
        format!("{}:{}", self.proxy_address, self.proxy_port)
    }

    /// Socket address of the local SOCKS proxy
    pub fn proxy_socket_addr(&self) -> SocketAddr {
        SocketAddr::from((self.proxy_address, self.proxy_port))
    }
}
