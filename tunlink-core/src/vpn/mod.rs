//! VPN connection module
//!
//! Connectivity probes, helper process supervision, the routing daemon
//! session and the connection manager that ties them together.

pub mod connectivity;
pub mod socks;

// Helper processes
pub mod helpers;
pub mod process;

// Routing daemon
pub mod installer;
pub mod ipc;
pub mod routing;

// Orchestration
pub mod connection_manager;
pub mod lifecycle;
pub mod power_monitor;
pub mod tap_device;

// Public re-exports
pub use connection_manager::{ConnectionManager, ManagerOptions};
pub use connectivity::{Connectivity, ReachabilityOptions, SocksConnectivity};
pub use helpers::{HelperBinaries, ProxyProcess, TunnelProcess};
pub use installer::{DaemonInstaller, PkexecInstaller};
pub use ipc::NetworkStatus;
pub use power_monitor::PowerEvent;
pub use process::{HelperProcess, ProcessExit};
pub use routing::{RoutingSession, SessionState};
