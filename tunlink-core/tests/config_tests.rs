//! Configuration tests: server parameters, platform values and settings files

use std::path::PathBuf;
use tempfile::tempdir;
use tunlink_core::config::toml_config::{load_settings_from_path, ClientSettings};
use tunlink_core::config::{Platform, TunnelConfig};
use tunlink_core::error::NativeErrorKind;

#[test]
fn test_tunnel_config_debug_redacts_password() {
    let config = TunnelConfig::new("203.0.113.7", 8388, "hunter2", "aes-256-gcm");
    let debug = format!("{:?}", config);
    assert!(debug.contains("203.0.113.7"));
    assert!(!debug.contains("hunter2"));
}

#[test]
fn test_tunnel_config_rejects_zero_port() {
    let config = TunnelConfig::new("203.0.113.7", 0, "hunter2", "aes-256-gcm");
    let err = config.validate().unwrap_err();
    assert_eq!(err.kind(), NativeErrorKind::IllegalServerConfiguration);
}

#[test]
fn test_platform_shares_virtual_network() {
    let linux = Platform::linux();
    let windows = Platform::windows();

    assert_eq!(linux.virtual_router_ip, windows.virtual_router_ip);
    assert_eq!(linux.virtual_router_netmask.to_string(), "255.255.255.0");
    assert_ne!(linux.tun_device_name, windows.tun_device_name);
    assert_ne!(linux.routing_service_path, windows.routing_service_path);
}

#[test]
fn test_settings_override_routing_service_path() {
    // Given: a settings file pointing at a custom daemon socket
    let temp_dir = tempdir().unwrap();
    let path = temp_dir.path().join("config.toml");
    std::fs::write(&path, "[routing]\nservice_path = \"/tmp/routing.sock\"\n").unwrap();

    // When: it is loaded and applied
    let settings = load_settings_from_path(&path).unwrap();
    let mut platform = Platform::linux();
    settings.apply_to(&mut platform);

    // Then: only the routing path changes
    assert_eq!(platform.routing_service_path, PathBuf::from("/tmp/routing.sock"));
    assert_eq!(platform.tun_device_name, Platform::linux().tun_device_name);
}

#[test]
fn test_settings_round_trip_through_toml() {
    let mut settings = ClientSettings::default();
    settings.helpers.tunnel_binary = Some(PathBuf::from("/usr/bin/badvpn-tun2socks"));

    let serialized = toml::to_string(&settings).unwrap();
    let parsed: ClientSettings = toml::from_str(&serialized).unwrap();
    assert_eq!(parsed, settings);
}

#[test]
fn test_unknown_sections_are_ignored() {
    let temp_dir = tempdir().unwrap();
    let path = temp_dir.path().join("config.toml");
    std::fs::write(&path, "[ui]\ntheme = \"dark\"\n").unwrap();

    let settings = load_settings_from_path(&path).unwrap();
    assert_eq!(settings, ClientSettings::default());
}
