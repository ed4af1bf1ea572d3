//! Routing daemon (re)installation
//!
//! When the routing daemon is not running, Linux clients may install and
//! start it by running a setup script with elevated privileges, once.

use crate::error::{NativeError, NativeErrorKind};
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::{info, warn};

/// Script installed alongside the client that sets up the routing daemon
pub const DEFAULT_INSTALL_COMMAND: &str = "/usr/share/tunlink/install_linux_service.sh";

/// Installs and starts the routing daemon
#[async_trait]
pub trait DaemonInstaller: Send + Sync {
    /// Run the install command with elevated privileges
    ///
    /// Any failure, including the user dismissing the password prompt, is
    /// reported as `NoAdminPermissions`.
    async fn install(&self) -> Result<(), NativeError>;
}

/// Runs the install script through `pkexec`
#[derive(Debug, Clone)]
pub struct PkexecInstaller {
    command: PathBuf,
}

impl PkexecInstaller {
    pub fn new(command: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

impl Default for PkexecInstaller {
    fn default() -> Self {
        Self::new(DEFAULT_INSTALL_COMMAND)
    }
}

#[async_trait]
impl DaemonInstaller for PkexecInstaller {
    async fn install(&self) -> Result<(), NativeError> {
        info!(command = %self.command.display(), "(Re-)installing routing daemon");

        let status = Command::new("pkexec")
            .arg(&self.command)
            .status()
            .await
            .map_err(|e| {
                warn!(error = %e, "Could not run pkexec");
                NativeError::new(NativeErrorKind::NoAdminPermissions)
            })?;

        if status.success() {
            Ok(())
        } else {
            // pkexec exits 126 when the prompt is dismissed, but the script
            // itself may fail with any code; both look the same to us.
            warn!(code = ?status.code(), "Routing daemon install failed");
            Err(NativeError::new(NativeErrorKind::NoAdminPermissions))
        }
    }
}
