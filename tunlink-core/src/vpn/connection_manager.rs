//! Full-system tunnel orchestration
//!
//! A [`ConnectionManager`] brings up the proxy, the tunnel and the routing
//! session in order, then mediates between them. None of the three helpers
//! knows about the others:
//!
//! - once any helper exits, all of them are stopped
//! - once all of them have exited, the manager is terminated
//! - when the network changes, UDP support is re-tested and the tunnel is
//!   restarted if it changed
//! - around suspend, the tunnel is stopped and restarted silently
//!
//! Network and power events are processed one at a time by a single event
//! loop task.

use crate::config::{Platform, TunnelConfig};
use crate::error::{NativeError, NativeErrorKind};
use crate::vpn::connectivity::{Connectivity, ReachabilityOptions, SocksConnectivity};
use crate::vpn::helpers::{HelperBinaries, ProxyProcess, TunnelProcess};
use crate::vpn::installer::{DaemonInstaller, PkexecInstaller};
use crate::vpn::ipc::NetworkStatus;
use crate::vpn::lifecycle::{ExitLatch, ExitLatches};
use crate::vpn::power_monitor::PowerEvent;
use crate::vpn::process::ExitListener;
use crate::vpn::routing::RoutingSession;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How the manager waits for the local proxy to come up
pub const PROXY_REACHABILITY: ReachabilityOptions = ReachabilityOptions {
    timeout: Duration::from_secs(1),
    max_attempts: 30,
    retry_interval: Duration::from_millis(100),
};

/// Callback without arguments, for reconnect notifications
pub type Listener = Arc<dyn Fn() + Send + Sync>;

/// Everything a manager needs besides the server parameters
#[derive(Clone)]
pub struct ManagerOptions {
    pub platform: Platform,
    pub binaries: HelperBinaries,
    /// Set for background reconnects, e.g. at boot
    pub is_auto_connect: bool,
    pub connectivity: Arc<dyn Connectivity>,
    pub installer: Arc<dyn DaemonInstaller>,
}

impl ManagerOptions {
    /// Options with the real probes and the default daemon installer
    pub fn new(platform: Platform, binaries: HelperBinaries) -> Self {
        Self {
            platform,
            binaries,
            is_auto_connect: false,
            connectivity: Arc::new(SocksConnectivity),
            installer: Arc::new(PkexecInstaller::default()),
        }
    }
}

enum ManagerEvent {
    NetworkChanged(NetworkStatus),
    Power(PowerEvent),
    RestartTunnel,
}

struct Inner {
    config: TunnelConfig,
    is_auto_connect: bool,
    platform: Platform,
    connectivity: Arc<dyn Connectivity>,

    proxy: ProxyProcess,
    tunnel: TunnelProcess,
    routing: RoutingSession,

    exits: ExitLatches,
    stopped: ExitLatch,
    tunnel_exit_listener: ExitListener,

    udp_enabled: AtomicBool,
    terminated: AtomicBool,
    stopping: Mutex<bool>,

    events: mpsc::UnboundedSender<ManagerEvent>,
    power_task: Mutex<Option<JoinHandle<()>>>,
    reconnecting_listener: Mutex<Option<Listener>>,
    reconnected_listener: Mutex<Option<Listener>>,
}

/// Establishes and supervises one full-system tunnel
///
/// Must be created inside a tokio runtime. A manager is single use: once
/// stopped it cannot be started again.
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(config: TunnelConfig, options: ManagerOptions) -> Self {
        let ManagerOptions {
            platform,
            binaries,
            is_auto_connect,
            connectivity,
            installer,
        } = options;

        let exits = ExitLatches::new();
        let (events, event_rx) = mpsc::unbounded_channel();

        let proxy = ProxyProcess::new(&binaries.proxy, platform.proxy_port);
        let proxy_exit = exits.proxy.clone();
        proxy.on_exit(move |exit| {
            debug!(?exit, "Proxy exit");
            proxy_exit.open();
        });

        let tunnel = TunnelProcess::new(&binaries.tunnel, platform.clone());
        let tunnel_exit = exits.tunnel.clone();
        let tunnel_exit_listener: ExitListener = Arc::new(move |exit| {
            debug!(?exit, "Tunnel exit");
            tunnel_exit.open();
        });
        tunnel.set_exit_listener(Arc::clone(&tunnel_exit_listener));

        let routing = RoutingSession::new(
            config.host.clone(),
            is_auto_connect,
            platform.routing_service_path.clone(),
            platform.supports_daemon_install,
            installer,
        );
        let network_events = events.clone();
        routing.set_network_change_listener(Some(Arc::new(move |status| {
            let _ = network_events.send(ManagerEvent::NetworkChanged(status));
        })));

        let routing_exit = exits.routing.clone();
        let disconnected = routing.once_disconnected();
        tokio::spawn(async move {
            disconnected.await;
            routing_exit.open();
        });

        let inner = Arc::new(Inner {
            config,
            is_auto_connect,
            platform,
            connectivity,
            proxy,
            tunnel,
            routing,
            exits,
            stopped: ExitLatch::new(),
            tunnel_exit_listener,
            udp_enabled: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            stopping: Mutex::new(false),
            events,
            power_task: Mutex::new(None),
            reconnecting_listener: Mutex::new(None),
            reconnected_listener: Mutex::new(None),
        });

        // Once any helper fails or exits, stop them all.
        let first_exit = inner.exits.first();
        let weak = Arc::downgrade(&inner);
        tokio::spawn(async move {
            let helper = first_exit.await;
            info!(%helper, "A helper has exited, disconnecting");
            if let Some(inner) = weak.upgrade() {
                inner.stop().await;
            }
        });

        // Once all helpers have stopped, we're done.
        let all_exited = inner.exits.all();
        let weak = Arc::downgrade(&inner);
        let stopped = inner.stopped.clone();
        tokio::spawn(async move {
            all_exited.await;
            info!("All helpers have exited");
            if let Some(inner) = weak.upgrade() {
                inner.terminated.store(true, Ordering::SeqCst);
            }
            stopped.open();
        });

        tokio::spawn(run_events(Arc::downgrade(&inner), event_rx));

        Self { inner }
    }

    /// Bring up the proxy, the tunnel and the routing session
    ///
    /// Completes once all three are running. On failure everything already
    /// started is stopped again.
    pub async fn start(&self) -> Result<(), NativeError> {
        let result = self.inner.start().await;
        if let Err(e) = &result {
            warn!(error = %e, "Connection failed to start, stopping helpers");
            self.inner.stop().await;
        }
        result
    }

    /// Tear everything down; safe to call any number of times
    ///
    /// Use [`ConnectionManager::once_stopped`] to learn when the helpers are gone.
    pub async fn stop(&self) {
        self.inner.stop().await;
    }

    /// Completes once all helpers have exited
    ///
    /// By then as many of the system changes made for the tunnel as possible
    /// have been reverted.
    pub fn once_stopped(&self) -> impl Future<Output = ()> + Send + 'static {
        self.inner.stopped.wait()
    }

    /// True once all helpers have exited
    pub fn is_terminated(&self) -> bool {
        self.inner.terminated.load(Ordering::SeqCst)
    }

    /// Whether the tunnel currently relays UDP
    pub fn is_udp_enabled(&self) -> bool {
        self.inner.udp_enabled.load(Ordering::SeqCst)
    }

    /// Called when the routing daemon reports it is reconnecting
    pub fn on_reconnecting<F>(&self, listener: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *lock(&self.inner.reconnecting_listener) = Some(Arc::new(listener));
    }

    /// Called when the routing daemon reports it has reconnected
    pub fn on_reconnected<F>(&self, listener: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *lock(&self.inner.reconnected_listener) = Some(Arc::new(listener));
    }

    /// Handle suspend and resume events from `events`
    ///
    /// Replaces any previous source. The subscription ends with `stop`.
    pub fn watch_power_events(&self, mut events: mpsc::UnboundedReceiver<PowerEvent>) {
        let sender = self.inner.events.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if sender.send(ManagerEvent::Power(event)).is_err() {
                    break;
                }
            }
        });

        if *lock(&self.inner.stopping) {
            task.abort();
            return;
        }
        if let Some(previous) = lock(&self.inner.power_task).replace(task) {
            previous.abort();
        }
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("host", &self.inner.config.host)
            .field("is_auto_connect", &self.inner.is_auto_connect)
            .field("udp_enabled", &self.is_udp_enabled())
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

impl Inner {
    async fn start(&self) -> Result<(), NativeError> {
        if *lock(&self.stopping) {
            return Err(stopped_error());
        }

        if self.platform.requires_tap_precheck {
            crate::vpn::tap_device::check_tap_device(&self.platform).await?;
        }

        // The proxy must be up in order to test UDP support and validate credentials.
        self.proxy.start(&self.config);
        self.wait_for_proxy().await?;

        // Don't validate credentials on auto-connect: if the key was revoked,
        // the system stays "connected" so that traffic doesn't leak.
        if !self.is_auto_connect {
            self.connectivity
                .validate_credentials(self.platform.proxy_socket_addr())
                .await?;
        }

        let udp_enabled = self
            .connectivity
            .check_udp_forwarding(self.platform.proxy_socket_addr())
            .await?;
        self.udp_enabled.store(udp_enabled, Ordering::SeqCst);
        info!(udp_enabled, "UDP support");

        {
            let stopping = lock(&self.stopping);
            if *stopping {
                return Err(stopped_error());
            }
            self.tunnel.start(udp_enabled);
        }

        self.routing.start(true).await
    }

    /// Wait until the local proxy accepts connections, or fail if it exits first
    async fn wait_for_proxy(&self) -> Result<(), NativeError> {
        let address = self.platform.proxy_address.to_string();
        let reachable =
            self.connectivity
                .is_reachable(&address, self.platform.proxy_port, PROXY_REACHABILITY);

        tokio::select! {
            result = reachable => result,
            _ = self.exits.proxy.wait() => Err(NativeError::with_message(
                NativeErrorKind::ShadowsocksStartFailure,
                "proxy exited during startup",
            )),
        }
    }

    async fn stop(&self) {
        *lock(&self.stopping) = true;

        if let Some(task) = lock(&self.power_task).take() {
            task.abort();
        }

        if let Err(e) = self.routing.stop().await {
            // e.g. the daemon stopped while we were connected
            error!(error = %e, "Could not stop routing");
        }

        self.proxy.stop();

        // Undo any suspend or restart listener so the exit is counted.
        self.tunnel
            .set_exit_listener(Arc::clone(&self.tunnel_exit_listener));
        self.tunnel.stop();
        if !self.tunnel.is_running() {
            self.exits.tunnel.open();
        }
    }

    fn is_stopping(&self) -> bool {
        *lock(&self.stopping)
    }

    async fn handle_event(&self, event: ManagerEvent) {
        match event {
            ManagerEvent::NetworkChanged(status) => self.network_changed(status).await,
            ManagerEvent::Power(PowerEvent::Suspending) => self.suspend().await,
            ManagerEvent::Power(PowerEvent::Resumed) => self.resume().await,
            ManagerEvent::RestartTunnel => self.restart_tunnel(),
        }
    }

    async fn network_changed(&self, status: NetworkStatus) {
        match status {
            NetworkStatus::Connected => {
                let listener = lock(&self.reconnected_listener).clone();
                if let Some(listener) = listener {
                    listener();
                }
                // UDP support rarely changes, so re-test only after telling
                // the client we've reconnected.
                self.retest_udp().await;
            }
            NetworkStatus::Reconnecting => {
                let listener = lock(&self.reconnecting_listener).clone();
                if let Some(listener) = listener {
                    listener();
                }
            }
            NetworkStatus::Disconnected => {
                error!(?status, "Unexpected network change status from routing daemon");
            }
        }
    }

    /// Stop the tunnel without triggering the teardown
    async fn suspend(&self) {
        let exited_rx = {
            // stop() restores the tunnel's exit listener; never swap it out after that.
            let stopping = lock(&self.stopping);
            if *stopping {
                info!("Suspend event received while stopping, doing nothing");
                return;
            }

            if !self.tunnel.is_running() {
                self.tunnel.on_exit(|_| info!("Tunnel stopped before suspend"));
                return;
            }

            let (exited_tx, exited_rx) = oneshot::channel();
            let exited_tx = Mutex::new(Some(exited_tx));
            self.tunnel.on_exit(move |_| {
                info!("Stopped tunnel in preparation for suspend");
                if let Some(tx) = lock(&exited_tx).take() {
                    let _ = tx.send(());
                }
            });
            self.tunnel.stop();
            exited_rx
        };

        // Also resolves if stop() swaps the listener out.
        let _ = exited_rx.await;
    }

    async fn resume(&self) {
        if self.terminated.load(Ordering::SeqCst) || self.is_stopping() {
            error!("Resume event received but this connection is terminated, doing nothing");
            return;
        }

        info!("Restarting tunnel after resume");
        {
            let stopping = lock(&self.stopping);
            if *stopping {
                return;
            }
            self.tunnel
                .set_exit_listener(Arc::clone(&self.tunnel_exit_listener));
            self.tunnel.start(self.udp_enabled.load(Ordering::SeqCst));
        }

        // Check if UDP support has changed; if so, silently restart.
        self.retest_udp().await;
    }

    /// Re-probe UDP support and restart the tunnel if it changed
    async fn retest_udp(&self) {
        // Probes occasionally fail right after a network change; make sure
        // the proxy is reachable first.
        let address = self.platform.proxy_address.to_string();
        if let Err(e) = self
            .connectivity
            .is_reachable(&address, self.platform.proxy_port, PROXY_REACHABILITY)
            .await
        {
            error!(error = %e, "UDP test failed");
            return;
        }

        let udp_enabled = match self
            .connectivity
            .check_udp_forwarding(self.platform.proxy_socket_addr())
            .await
        {
            Ok(enabled) => enabled,
            Err(e) => {
                error!(error = %e, "UDP test failed");
                return;
            }
        };

        if udp_enabled == self.udp_enabled.load(Ordering::SeqCst) {
            debug!(udp_enabled, "UDP support unchanged");
            return;
        }

        let stopping = lock(&self.stopping);
        if *stopping {
            return;
        }

        self.udp_enabled.store(udp_enabled, Ordering::SeqCst);
        info!(udp_enabled, "UDP support changed, restarting tunnel");

        // Restart once the current process exits.
        let events = self.events.clone();
        self.tunnel.on_exit(move |_| {
            let _ = events.send(ManagerEvent::RestartTunnel);
        });
        self.tunnel.stop();
    }

    fn restart_tunnel(&self) {
        let stopping = lock(&self.stopping);
        if *stopping {
            debug!("Not restarting tunnel, connection is stopping");
            return;
        }

        info!("Restarting tunnel");
        self.tunnel
            .set_exit_listener(Arc::clone(&self.tunnel_exit_listener));
        self.tunnel.start(self.udp_enabled.load(Ordering::SeqCst));
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.proxy.stop();
        self.tunnel.stop();
    }
}

async fn run_events(inner: Weak<Inner>, mut events: mpsc::UnboundedReceiver<ManagerEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.handle_event(event).await;
    }
}

fn stopped_error() -> NativeError {
    NativeError::with_message(NativeErrorKind::Unexpected, "connection was stopped")
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
