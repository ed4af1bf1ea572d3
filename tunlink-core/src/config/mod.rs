//! Configuration module
//!
//! Holds the server parameters a tunnel is started with, the per-platform
//! capabilities the orchestration code needs, and the TOML client settings.

use crate::error::{NativeError, NativeErrorKind};
use crate::types::Password;

pub mod platform;
pub mod toml_config;

pub use platform::{Platform, TunDeviceStyle};
pub use toml_config::ClientSettings;

/// Shadowsocks server parameters
///
/// Supplied by the caller for every connection and never persisted. The
/// value is immutable once handed to the proxy process.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Server hostname or IPv4 address
    pub host: String,

    /// Server port
    pub port: u16,

    /// Server password
    pub password: Password,

    /// Cipher name, e.g. `chacha20-ietf-poly1305`
    pub method: String,
}

impl TunnelConfig {
    /// Create a new tunnel configuration
    pub fn new(
        host: impl Into<String>,
        port: u16,
        password: impl Into<Password>,
        method: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            password: password.into(),
            method: method.into(),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), NativeError> {
        let illegal =
            |message: &str| NativeError::with_message(NativeErrorKind::IllegalServerConfiguration, message);

        if self.host.trim().is_empty() {
            return Err(illegal("host cannot be empty"));
        }

        if self.host.chars().any(char::is_whitespace) {
            return Err(illegal("host contains whitespace"));
        }

        if self.port == 0 {
            return Err(illegal("port cannot be zero"));
        }

        if self.method.trim().is_empty() {
            return Err(illegal("cipher cannot be empty"));
        }

        if self.password.is_empty() {
            return Err(illegal("password cannot be empty"));
        }

        Ok(())
    }
}
