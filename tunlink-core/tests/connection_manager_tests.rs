//! Connection manager tests with shell-script helpers and a fake routing daemon
//!
//! The tunnel script appends its command line to the file passed as its
//! `--tundev` argument, so each test can count tunnel launches.

#![cfg(unix)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tunlink_core::config::{Platform, TunnelConfig};
use tunlink_core::error::{NativeError, NativeErrorKind};
use tunlink_core::vpn::ipc::FrameReader;
use tunlink_core::vpn::{
    ConnectionManager, Connectivity, HelperBinaries, ManagerOptions, PowerEvent,
    ReachabilityOptions,
};

const WAIT: Duration = Duration::from_secs(10);

struct Scripts {
    _dir: TempDir,
    proxy: PathBuf,
    short_lived_proxy: PathBuf,
    tunnel: PathBuf,
    stubborn_tunnel: PathBuf,
}

static SCRIPTS: OnceLock<Scripts> = OnceLock::new();

/// Helper scripts, written once before any test spawns a process
fn scripts() -> &'static Scripts {
    SCRIPTS.get_or_init(|| {
        let dir = tempfile::tempdir().unwrap();
        let proxy = write_script(dir.path(), "proxy", "exec sleep 3600");
        let short_lived_proxy = write_script(dir.path(), "short-lived-proxy", "sleep 2\nexit 0");
        let tunnel = write_script(dir.path(), "tunnel", "echo \"$*\" >> \"$2\"\nexec sleep 3600");
        // Ignores SIGTERM, so it only goes away once killed.
        let stubborn_tunnel = write_script(
            dir.path(),
            "stubborn-tunnel",
            "echo \"$*\" >> \"$2\"\ntrap '' TERM\nwhile :; do sleep 1; done",
        );
        Scripts {
            _dir: dir,
            proxy,
            short_lived_proxy,
            tunnel,
            stubborn_tunnel,
        }
    })
}

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Probes with scripted answers
struct FakeConnectivity {
    proxy_up: bool,
    credentials_valid: bool,
    udp: Mutex<VecDeque<bool>>,
    udp_checks: AtomicUsize,
}

impl FakeConnectivity {
    fn new(udp: &[bool]) -> Arc<Self> {
        Self::build(true, true, udp)
    }

    fn build(proxy_up: bool, credentials_valid: bool, udp: &[bool]) -> Arc<Self> {
        Arc::new(Self {
            proxy_up,
            credentials_valid,
            udp: Mutex::new(udp.iter().copied().collect()),
            udp_checks: AtomicUsize::new(0),
        })
    }

    fn udp_checks(&self) -> usize {
        self.udp_checks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connectivity for FakeConnectivity {
    async fn is_reachable(
        &self,
        _host: &str,
        _port: u16,
        _options: ReachabilityOptions,
    ) -> Result<(), NativeError> {
        if !self.proxy_up {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn validate_credentials(&self, _proxy: SocketAddr) -> Result<(), NativeError> {
        if self.credentials_valid {
            Ok(())
        } else {
            Err(NativeError::invalid_credentials("bad password"))
        }
    }

    async fn check_udp_forwarding(&self, _proxy: SocketAddr) -> Result<bool, NativeError> {
        // Give a freshly launched tunnel time to log its launch.
        tokio::time::sleep(Duration::from_millis(200)).await;
        self.udp_checks.fetch_add(1, Ordering::SeqCst);
        let mut answers = self.udp.lock().unwrap();
        let answer = if answers.len() > 1 {
            answers.pop_front()
        } else {
            answers.front().copied()
        };
        Ok(answer.unwrap_or(false))
    }
}

/// Routing daemon that accepts one client
struct FakeDaemon {
    received: mpsc::UnboundedReceiver<Value>,
    pushes: mpsc::UnboundedSender<Value>,
    release_reset: Arc<Notify>,
}

impl FakeDaemon {
    /// `hold_reset` delays the reset confirmation until released
    fn spawn(path: &Path, hold_reset: bool) -> Self {
        let listener = UnixListener::bind(path).unwrap();
        let (received_tx, received) = mpsc::unbounded_channel();
        let (pushes, mut push_rx) = mpsc::unbounded_channel::<Value>();
        let release_reset = Arc::new(Notify::new());
        let release = Arc::clone(&release_reset);

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut frames = FrameReader::new();
            let mut buf = [0u8; 1024];

            loop {
                tokio::select! {
                    read = socket.read(&mut buf) => {
                        let n = match read {
                            Ok(0) | Err(_) => return,
                            Ok(n) => n,
                        };
                        for message in frames.push(&buf[..n]) {
                            let message = message.unwrap();
                            let _ = received_tx.send(message.clone());
                            match message["action"].as_str() {
                                Some("configureRouting") => {
                                    write_json(&mut socket, json!({"action": "configureRouting", "statusCode": 0})).await;
                                }
                                Some("resetRouting") => {
                                    if hold_reset {
                                        release.notified().await;
                                    }
                                    write_json(&mut socket, json!({"action": "resetRouting", "statusCode": 0})).await;
                                    return;
                                }
                                _ => {}
                            }
                        }
                    }
                    Some(push) = push_rx.recv() => write_json(&mut socket, push).await,
                }
            }
        });

        Self {
            received,
            pushes,
            release_reset,
        }
    }

    async fn next_message(&mut self) -> Value {
        tokio::time::timeout(WAIT, self.received.recv())
            .await
            .expect("daemon received nothing")
            .expect("daemon gone")
    }

    fn push_status(&self, status: i32) {
        self.pushes
            .send(json!({"action": "statusChanged", "connectionStatus": status}))
            .unwrap();
    }
}

async fn write_json(socket: &mut UnixStream, value: Value) {
    let _ = socket.write_all(&serde_json::to_vec(&value).unwrap()).await;
}

fn tunnel_log(dir: &TempDir) -> PathBuf {
    dir.path().join("tunnel.log")
}

fn platform(dir: &TempDir) -> Platform {
    let mut platform = Platform::linux();
    platform.tun_device_name = tunnel_log(dir).display().to_string();
    platform.routing_service_path = dir.path().join("routing.sock");
    platform.supports_daemon_install = false;
    platform
}

fn manager(dir: &TempDir, proxy: &Path, connectivity: Arc<FakeConnectivity>) -> ConnectionManager {
    manager_with_tunnel(dir, proxy, &scripts().tunnel, connectivity)
}

fn manager_with_tunnel(
    dir: &TempDir,
    proxy: &Path,
    tunnel: &Path,
    connectivity: Arc<FakeConnectivity>,
) -> ConnectionManager {
    let binaries = HelperBinaries {
        proxy: proxy.to_path_buf(),
        tunnel: tunnel.to_path_buf(),
    };
    let mut options = ManagerOptions::new(platform(dir), binaries);
    options.connectivity = connectivity;

    let config = TunnelConfig::new("203.0.113.7", 8388, "hunter2", "chacha20-ietf-poly1305");
    ConnectionManager::new(config, options)
}

fn read_launches(log: &Path) -> Vec<String> {
    std::fs::read_to_string(log)
        .map(|content| content.lines().map(String::from).collect())
        .unwrap_or_default()
}

/// Wait until the tunnel has been launched `count` times
async fn tunnel_launches(log: &Path, count: usize) -> Vec<String> {
    let deadline = Instant::now() + WAIT;
    loop {
        let launches = read_launches(log);
        if launches.len() >= count {
            return launches;
        }
        assert!(
            Instant::now() < deadline,
            "expected {} tunnel launches, saw {:?}",
            count,
            launches
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

async fn wait_stopped(manager: &ConnectionManager) {
    tokio::time::timeout(WAIT, manager.once_stopped())
        .await
        .expect("connection did not stop");
}

#[tokio::test]
async fn test_start_then_stop() {
    let scripts = scripts();
    let dir = tempfile::tempdir().unwrap();
    let mut daemon = FakeDaemon::spawn(&dir.path().join("routing.sock"), false);
    let manager = manager(&dir, &scripts.proxy, FakeConnectivity::new(&[false]));

    manager.start().await.unwrap();

    assert!(!manager.is_udp_enabled());
    let launches = tunnel_launches(&tunnel_log(&dir), 1).await;
    assert!(launches[0].starts_with("--tundev"));
    assert!(!launches[0].contains("--socks5-udp"));
    assert_eq!(
        daemon.next_message().await,
        json!({
            "action": "configureRouting",
            "parameters": {"proxyIp": "203.0.113.7", "isAutoConnect": false}
        })
    );

    manager.stop().await;

    assert_eq!(daemon.next_message().await["action"], "resetRouting");
    wait_stopped(&manager).await;
    assert!(manager.is_terminated());
}

#[tokio::test]
async fn test_helper_exit_tears_down_and_waits_for_all() {
    // Given: a running connection whose proxy exits on its own, and a
    // daemon that holds its reset confirmation
    let scripts = scripts();
    let dir = tempfile::tempdir().unwrap();
    let mut daemon = FakeDaemon::spawn(&dir.path().join("routing.sock"), true);
    let manager = manager(&dir, &scripts.short_lived_proxy, FakeConnectivity::new(&[true]));
    manager.start().await.unwrap();
    assert!(manager.is_udp_enabled());
    assert_eq!(daemon.next_message().await["action"], "configureRouting");

    // When: the proxy exits
    // Then: routing is reset, but the connection is not terminated while the
    // daemon has not confirmed
    assert_eq!(daemon.next_message().await["action"], "resetRouting");
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!manager.is_terminated());

    // And: it terminates once the daemon confirms
    daemon.release_reset.notify_one();
    wait_stopped(&manager).await;
    assert!(manager.is_terminated());
}

#[tokio::test]
async fn test_invalid_credentials_stop_everything() {
    // Given: a server that rejects the credentials
    let scripts = scripts();
    let dir = tempfile::tempdir().unwrap();
    let connectivity = FakeConnectivity::build(true, false, &[true]);
    let manager = manager(&dir, &scripts.proxy, connectivity);

    // When: the connection starts
    let err = manager.start().await.unwrap_err();

    // Then: it fails, everything is stopped and the tunnel never ran
    assert_eq!(err.kind(), NativeErrorKind::InvalidServerCredentials);
    wait_stopped(&manager).await;
    assert!(manager.is_terminated());
    assert!(read_launches(&tunnel_log(&dir)).is_empty());
}

#[tokio::test]
async fn test_proxy_exiting_during_startup() {
    let scripts = scripts();
    let dir = tempfile::tempdir().unwrap();
    let connectivity = FakeConnectivity::build(false, true, &[true]);
    let manager = manager(&dir, &scripts.short_lived_proxy, connectivity);

    let err = manager.start().await.unwrap_err();

    assert_eq!(err.kind(), NativeErrorKind::ShadowsocksStartFailure);
    wait_stopped(&manager).await;
    assert!(read_launches(&tunnel_log(&dir)).is_empty());
}

#[tokio::test]
async fn test_stop_after_termination_is_harmless() {
    let scripts = scripts();
    let dir = tempfile::tempdir().unwrap();
    let _daemon = FakeDaemon::spawn(&dir.path().join("routing.sock"), false);
    let manager = manager(&dir, &scripts.proxy, FakeConnectivity::new(&[false]));
    manager.start().await.unwrap();

    manager.stop().await;
    wait_stopped(&manager).await;

    tokio::time::timeout(WAIT, async {
        manager.stop().await;
        manager.stop().await;
    })
    .await
    .unwrap();
    assert!(manager.is_terminated());

    let err = manager.start().await.unwrap_err();
    assert_eq!(err.kind(), NativeErrorKind::Unexpected);
}

#[tokio::test]
async fn test_suspend_and_resume_restart_tunnel_silently() {
    // Given: a connection without UDP, on a network that gains UDP support
    let scripts = scripts();
    let dir = tempfile::tempdir().unwrap();
    let mut daemon = FakeDaemon::spawn(&dir.path().join("routing.sock"), false);
    let connectivity = FakeConnectivity::new(&[false, true]);
    let manager = manager(&dir, &scripts.proxy, connectivity);
    let (power, power_events) = mpsc::unbounded_channel();
    manager.watch_power_events(power_events);
    manager.start().await.unwrap();
    assert_eq!(daemon.next_message().await["action"], "configureRouting");

    // When: the machine suspends and resumes
    power.send(PowerEvent::Suspending).unwrap();
    power.send(PowerEvent::Resumed).unwrap();

    // Then: the tunnel comes back with the same arguments, then restarts
    // with UDP once the re-test notices the change
    let log = tunnel_log(&dir);
    let launches = tunnel_launches(&log, 3).await;
    assert_eq!(launches[1], launches[0]);
    assert!(!launches[1].contains("--socks5-udp"));
    assert!(launches[2].contains("--socks5-udp"));
    assert!(manager.is_udp_enabled());

    // And: none of this tore the connection down
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!manager.is_terminated());
    assert!(daemon.received.try_recv().is_err());

    manager.stop().await;
    wait_stopped(&manager).await;
}

#[tokio::test]
async fn test_network_changes_reach_listeners() {
    // Given: a connection with reconnect listeners
    let scripts = scripts();
    let dir = tempfile::tempdir().unwrap();
    let mut daemon = FakeDaemon::spawn(&dir.path().join("routing.sock"), false);
    let connectivity = FakeConnectivity::new(&[true]);
    let manager = manager(&dir, &scripts.proxy, Arc::clone(&connectivity));
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let reconnecting = events_tx.clone();
    manager.on_reconnecting(move || {
        let _ = reconnecting.send("reconnecting");
    });
    manager.on_reconnected(move || {
        let _ = events_tx.send("reconnected");
    });
    manager.start().await.unwrap();
    assert_eq!(daemon.next_message().await["action"], "configureRouting");

    // When: the daemon reports a network change
    daemon.push_status(2);
    daemon.push_status(0);

    // Then: both listeners fire in order
    for expected in ["reconnecting", "reconnected"] {
        let event = tokio::time::timeout(WAIT, events.recv()).await.unwrap();
        assert_eq!(event, Some(expected));
    }

    // And: UDP was re-tested, and since it did not change the tunnel was left alone
    let deadline = Instant::now() + WAIT;
    while connectivity.udp_checks() < 2 {
        assert!(Instant::now() < deadline, "UDP was not re-tested");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(read_launches(&tunnel_log(&dir)).len(), 1);
    assert!(!manager.is_terminated());

    manager.stop().await;
    wait_stopped(&manager).await;
}

#[tokio::test]
async fn test_suspend_during_stop_still_terminates() {
    // Given: a connection whose tunnel ignores SIGTERM, with the event loop
    // busy re-testing UDP after a network change
    let scripts = scripts();
    let dir = tempfile::tempdir().unwrap();
    let mut daemon = FakeDaemon::spawn(&dir.path().join("routing.sock"), false);
    let manager = manager_with_tunnel(
        &dir,
        &scripts.proxy,
        &scripts.stubborn_tunnel,
        FakeConnectivity::new(&[false]),
    );
    let (reconnected_tx, mut reconnected) = mpsc::unbounded_channel();
    manager.on_reconnected(move || {
        let _ = reconnected_tx.send(());
    });
    let (power, power_events) = mpsc::unbounded_channel();
    manager.watch_power_events(power_events);
    manager.start().await.unwrap();
    assert_eq!(daemon.next_message().await["action"], "configureRouting");
    tunnel_launches(&tunnel_log(&dir), 1).await;

    daemon.push_status(0);
    tokio::time::timeout(WAIT, reconnected.recv())
        .await
        .unwrap()
        .unwrap();

    // When: a suspend is queued behind the re-test and the connection stops
    power.send(PowerEvent::Suspending).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    manager.stop().await;

    // Then: the tunnel's forced exit still counts and the connection terminates
    tokio::time::timeout(Duration::from_secs(15), manager.once_stopped())
        .await
        .expect("connection did not stop");
    assert!(manager.is_terminated());
}
