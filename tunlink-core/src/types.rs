//! Type definitions and wrappers for secure data handling
//!
//! Wraps sensitive values with the secrecy crate so they never end up in
//! logs or debug output by accident.

use secrecy::{ExposeSecret, Secret};

/// Wrapper for the Shadowsocks server password
///
/// The password is only exposed when building the proxy process argument
/// vector; everywhere else it prints as `[REDACTED]`.
#[derive(Clone, Debug)]
pub struct Password(Secret<String>);

impl Password {
    /// Create a new password
    pub fn new(password: String) -> Self {
        Self(Secret::new(password))
    }

    /// Expose the password value (use with caution!)
    ///
    /// This should only be called when handing the password to the proxy process.
    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }

    pub fn is_empty(&self) -> bool {
        self.expose().is_empty()
    }
}

impl From<String> for Password {
    fn from(password: String) -> Self {
        Self::new(password)
    }
}

impl From<&str> for Password {
    fn from(password: &str) -> Self {
        Self::new(password.to_string())
    }
}
