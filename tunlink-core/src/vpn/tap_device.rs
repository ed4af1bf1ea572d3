//! TAP adapter precheck
//!
//! On Windows the virtual adapter is created and addressed by the installer,
//! not by the tunnel process. Before connecting we confirm it exists and
//! carries the expected address by scanning `netsh interface ipv4 dump`.

use crate::config::Platform;
use crate::error::NativeError;
use tokio::process::Command;
use tracing::debug;

/// Fail with `SystemConfigurationException` unless the TAP adapter is ready
pub async fn check_tap_device(platform: &Platform) -> Result<(), NativeError> {
    let output = Command::new("netsh")
        .args(["interface", "ipv4", "dump"])
        .output()
        .await
        .map_err(|e| {
            NativeError::system_configuration(format!("could not list network interfaces: {}", e))
        })?;

    let dump = String::from_utf8_lossy(&output.stdout);
    verify_tap_dump(
        &dump,
        &platform.tun_device_name,
        &platform.tun_device_ip.to_string(),
    )?;

    debug!(device = %platform.tun_device_name, "TAP device present");
    Ok(())
}

/// Check a `netsh interface ipv4 dump` listing for the adapter and its address
pub fn verify_tap_dump(dump: &str, device_name: &str, device_ip: &str) -> Result<(), NativeError> {
    let device_lines: Vec<&str> = dump.lines().filter(|line| line.contains(device_name)).collect();

    if device_lines.is_empty() {
        return Err(NativeError::system_configuration("TAP device not found"));
    }

    if !device_lines.iter().any(|line| line.contains(device_ip)) {
        return Err(NativeError::system_configuration("TAP device has wrong IP"));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NativeErrorKind;

    const DUMP: &str = r#"
# ----------------------------------
# IPv4 Configuration
# ----------------------------------
pushd interface ipv4

set interface interface="tunlink-tap0" forwarding=enabled advertise=enabled nud=enabled ignoredefaultroutes=disabled
add address name="tunlink-tap0" address=10.0.85.2 mask=255.255.255.0

popd
# End of IPv4 configuration
"#;

    #[test]
    fn test_device_present_with_expected_ip() {
        assert!(verify_tap_dump(DUMP, "tunlink-tap0", "10.0.85.2").is_ok());
    }

    #[test]
    fn test_device_missing() {
        let err = verify_tap_dump(DUMP, "other-tap0", "10.0.85.2").unwrap_err();
        assert_eq!(err.kind(), NativeErrorKind::SystemConfigurationException);
        assert_eq!(err.message(), Some("TAP device not found"));
    }

    #[test]
    fn test_device_has_wrong_ip() {
        let err = verify_tap_dump(DUMP, "tunlink-tap0", "10.0.86.2").unwrap_err();
        assert_eq!(err.message(), Some("TAP device has wrong IP"));
    }
}
