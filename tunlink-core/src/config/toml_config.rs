//! TOML client settings
//!
//! Loads optional overrides for helper binary locations and the routing
//! daemon endpoint from the user's configuration directory. Server profiles
//! are deliberately not stored here.

use crate::config::Platform;
use crate::error::{ConfigError, TunlinkError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Complete TOML settings structure
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSettings {
    /// Helper executable locations
    #[serde(default)]
    pub helpers: HelperSettings,

    /// Routing daemon settings
    #[serde(default)]
    pub routing: RoutingSettings,
}

/// Locations of the external executables
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelperSettings {
    /// Shadowsocks client (`ss-local`); looked up on PATH when unset
    pub proxy_binary: Option<PathBuf>,

    /// Packet relay (`badvpn-tun2socks`); looked up on PATH when unset
    pub tunnel_binary: Option<PathBuf>,

    /// Script that installs and starts the routing daemon
    pub install_command: Option<PathBuf>,
}

/// Routing daemon endpoint override
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingSettings {
    /// Unix socket path or named pipe name
    pub service_path: Option<PathBuf>,
}

impl ClientSettings {
    /// Load settings from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, TunlinkError> {
        use tracing::debug;

        let contents = std::fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ConfigError::LoadFailed {
                path: path.to_string_lossy().to_string(),
            },
            _ => ConfigError::IoError {
                message: format!("Failed to read settings file: {}", e),
            },
        })?;

        let settings: ClientSettings = toml::from_str(&contents)?;
        settings.validate()?;

        debug!(path = %path.display(), "Loaded client settings");
        Ok(settings)
    }

    /// Reject empty paths, which would otherwise resolve to the working directory
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fields = [
            ("helpers.proxy_binary", &self.helpers.proxy_binary),
            ("helpers.tunnel_binary", &self.helpers.tunnel_binary),
            ("helpers.install_command", &self.helpers.install_command),
            ("routing.service_path", &self.routing.service_path),
        ];

        for (field, value) in fields {
            if matches!(value, Some(path) if path.as_os_str().is_empty()) {
                return Err(ConfigError::ValidationError {
                    message: format!("{} cannot be empty", field),
                });
            }
        }

        Ok(())
    }

    /// Apply the overrides to a platform description
    pub fn apply_to(&self, platform: &mut Platform) {
        if let Some(path) = &self.routing.service_path {
            platform.routing_service_path = path.clone();
        }
    }
}

/// Default settings file name
const CONFIG_FILE_NAME: &str = "config.toml";

/// Get the configuration directory
///
/// Returns `$TUNLINK_CONFIG_DIR` if set, otherwise `~/.config/tunlink`
pub fn get_config_dir() -> Result<PathBuf, TunlinkError> {
    if let Ok(config_dir) = std::env::var("TUNLINK_CONFIG_DIR") {
        return Ok(PathBuf::from(config_dir));
    }

    let home = std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .map_err(|_| ConfigError::IoError {
            message: "HOME environment variable not set".to_string(),
        })?;

    Ok(PathBuf::from(home).join(".config").join("tunlink"))
}

/// Get the default settings file path
pub fn get_config_path() -> Result<PathBuf, TunlinkError> {
    Ok(get_config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load settings from the default location, falling back to defaults when absent
pub fn load_settings() -> Result<ClientSettings, TunlinkError> {
    load_settings_from_path(get_config_path()?)
}

/// Load settings from a specific file, falling back to defaults when absent
pub fn load_settings_from_path<P: AsRef<Path>>(path: P) -> Result<ClientSettings, TunlinkError> {
    let path = path.as_ref();
    if !path.exists() {
        tracing::debug!(path = %path.display(), "No settings file, using defaults");
        return Ok(ClientSettings::default());
    }
    ClientSettings::from_file(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_yields_defaults() {
        let temp_dir = tempdir().unwrap();
        let settings = load_settings_from_path(temp_dir.path().join("absent.toml")).unwrap();
        assert_eq!(settings, ClientSettings::default());
    }

    #[test]
    fn test_load_overrides() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[helpers]
proxy_binary = "/opt/shadowsocks/ss-local"
install_command = "/opt/tunlink/install_linux_service.sh"

[routing]
service_path = "/run/tunlink.sock"
"#,
        )
        .unwrap();

        let settings = load_settings_from_path(&path).unwrap();
        assert_eq!(
            settings.helpers.proxy_binary,
            Some(PathBuf::from("/opt/shadowsocks/ss-local"))
        );
        assert_eq!(settings.helpers.tunnel_binary, None);

        let mut platform = Platform::linux();
        settings.apply_to(&mut platform);
        assert_eq!(platform.routing_service_path, PathBuf::from("/run/tunlink.sock"));
    }

    #[test]
    fn test_empty_path_is_rejected() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("config.toml");
        std::fs::write(&path, "[helpers]\ntunnel_binary = \"\"\n").unwrap();

        let err = load_settings_from_path(&path).unwrap_err();
        assert!(matches!(err, TunlinkError::Config(ConfigError::ValidationError { .. })));
    }

    #[test]
    fn test_malformed_toml() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("config.toml");
        std::fs::write(&path, "[helpers\n").unwrap();

        let err = load_settings_from_path(&path).unwrap_err();
        assert!(matches!(err, TunlinkError::Toml(_)));
    }
}
