//! Integration tests for the tunlink binary
//!
//! Runs the built binary and checks output and exit codes. Nothing here
//! touches the routing table: every connect attempt fails before any helper
//! is launched.

use std::fs;
use std::net::TcpListener;
use std::process::{Command, Output};

const TUNLINK_BINARY: &str = env!("CARGO_BIN_EXE_tunlink");

fn tunlink(args: &[&str], config_dir: &std::path::Path) -> Output {
    Command::new(TUNLINK_BINARY)
        .args(args)
        .env("TUNLINK_CONFIG_DIR", config_dir)
        .env_remove("TUNLINK_PASSWORD")
        .output()
        .expect("Failed to run tunlink")
}

#[test]
fn test_help_lists_commands() {
    let temp_dir = tempfile::tempdir().unwrap();
    let output = tunlink(&["--help"], temp_dir.path());

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("connect"));
    assert!(stdout.contains("probe"));
}

#[test]
fn test_probe_reachable_open_port() {
    let temp_dir = tempfile::tempdir().unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port().to_string();

    let output = tunlink(
        &["probe", "reachable", "--host", "127.0.0.1", "--port", &port],
        temp_dir.path(),
    );

    assert!(output.status.success(), "{:?}", output);
    assert!(String::from_utf8_lossy(&output.stdout).contains("is reachable"));
}

#[test]
fn test_probe_unreachable_exits_with_server_unreachable_code() {
    let temp_dir = tempfile::tempdir().unwrap();
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port().to_string()
    };

    let output = tunlink(
        &[
            "probe",
            "reachable",
            "--host",
            "127.0.0.1",
            "--port",
            &port,
            "--attempts",
            "2",
            "--interval-ms",
            "10",
        ],
        temp_dir.path(),
    );

    assert_eq!(output.status.code(), Some(5));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("server unreachable"), "{}", stderr);
}

#[test]
fn test_connect_with_missing_helper_binary() {
    // Given: settings pointing at a proxy binary that does not exist
    let temp_dir = tempfile::tempdir().unwrap();
    fs::write(
        temp_dir.path().join("config.toml"),
        "[helpers]\nproxy_binary = \"/nonexistent/ss-local\"\n",
    )
    .unwrap();

    // When: connecting
    let output = tunlink(
        &[
            "connect",
            "--host",
            "127.0.0.1",
            "--port",
            "8388",
            "--method",
            "chacha20-ietf-poly1305",
            "--password",
            "hunter2",
        ],
        temp_dir.path(),
    );

    // Then: it fails with the system configuration code before connecting
    assert_eq!(output.status.code(), Some(12));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("/nonexistent/ss-local"), "{}", stderr);
}

#[test]
fn test_connect_requires_password() {
    let temp_dir = tempfile::tempdir().unwrap();

    let output = tunlink(
        &[
            "connect",
            "--host",
            "127.0.0.1",
            "--port",
            "8388",
            "--method",
            "aes-256-gcm",
        ],
        temp_dir.path(),
    );

    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("--password"));
}

#[test]
fn test_connect_with_blank_host_is_illegal_configuration() {
    let temp_dir = tempfile::tempdir().unwrap();

    let output = tunlink(
        &[
            "connect",
            "--host",
            " ",
            "--port",
            "8388",
            "--method",
            "aes-256-gcm",
            "--password",
            "hunter2",
        ],
        temp_dir.path(),
    );

    // Rejected before any lookup or reachability check
    assert_eq!(output.status.code(), Some(7));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("illegal server configuration"), "{}", stderr);
}
