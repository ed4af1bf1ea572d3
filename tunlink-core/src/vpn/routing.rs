//! Routing daemon session
//!
//! A [`RoutingSession`] holds the one connection a client keeps open to the
//! privileged routing daemon while a tunnel is up. The protocol is short:
//!
//! 1. The client connects and sends `configureRouting`.
//! 2. The daemon replies once, with a status code.
//! 3. The daemon may push `statusChanged` messages at any time afterwards.
//! 4. The client sends `resetRouting`; the daemon restores the routing table,
//!    confirms, and the connection closes.
//!
//! The session ends, and `once_disconnected` completes, exactly once no
//! matter which side tears the connection down.

use crate::error::{NativeError, NativeErrorKind};
use crate::vpn::installer::DaemonInstaller;
use crate::vpn::ipc::{
    self, status_code, FrameReader, IpcStream, NetworkStatus, ResponseAction, RoutingRequest,
    RoutingResponse,
};
use serde_json::Value;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

const READ_BUFFER_SIZE: usize = 4096;

/// Lifecycle of a routing session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Installing,
    Configuring,
    Active,
    Disconnecting,
    /// Terminal
    Disconnected,
}

/// Callback for `statusChanged` pushes
pub type NetworkChangeListener = Arc<dyn Fn(NetworkStatus) + Send + Sync>;

type Reader = ReadHalf<Box<dyn IpcStream>>;
type Writer = WriteHalf<Box<dyn IpcStream>>;

struct Shared {
    state: watch::Sender<SessionState>,
    writer: tokio::sync::Mutex<Option<Writer>>,
    listener: Mutex<Option<NetworkChangeListener>>,
    network_status: Mutex<Option<NetworkStatus>>,
}

impl Shared {
    /// Move to `next` unless the session already ended
    fn transition(&self, next: SessionState) -> bool {
        self.state.send_if_modified(|state| {
            if *state == SessionState::Disconnected || *state == next {
                false
            } else {
                debug!(from = ?*state, to = ?next, "Routing session state change");
                *state = next;
                true
            }
        })
    }

    /// Claim an idle session for connecting
    ///
    /// Returns the state found instead if the session was not idle.
    fn begin_start(&self) -> Result<(), SessionState> {
        let mut found = SessionState::Idle;
        self.state.send_if_modified(|state| {
            found = *state;
            if *state != SessionState::Idle {
                return false;
            }
            debug!(from = ?*state, to = ?SessionState::Connecting, "Routing session state change");
            *state = SessionState::Connecting;
            true
        });

        match found {
            SessionState::Idle => Ok(()),
            other => Err(other),
        }
    }

    /// End the session; returns false if it had already ended
    fn disconnect(&self) -> bool {
        let fired = self.transition(SessionState::Disconnected);
        if fired {
            info!("Routing session disconnected");
        }
        fired
    }

    fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    async fn close_writer(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
    }

    fn notify_network_change(&self, status: NetworkStatus) {
        *self
            .network_status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(status);
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        if let Some(listener) = listener {
            listener(status);
        }
    }
}

/// Client side of the routing daemon protocol
pub struct RoutingSession {
    proxy_ip: String,
    is_auto_connect: bool,
    service_path: PathBuf,
    supports_install: bool,
    installer: Arc<dyn DaemonInstaller>,
    install_attempted: AtomicBool,
    shared: Arc<Shared>,
}

impl RoutingSession {
    /// Create an idle session
    ///
    /// `supports_install` enables the one-time daemon installation when the
    /// daemon cannot be reached.
    pub fn new(
        proxy_ip: impl Into<String>,
        is_auto_connect: bool,
        service_path: impl Into<PathBuf>,
        supports_install: bool,
        installer: Arc<dyn DaemonInstaller>,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        Self {
            proxy_ip: proxy_ip.into(),
            is_auto_connect,
            service_path: service_path.into(),
            supports_install,
            installer,
            install_attempted: AtomicBool::new(false),
            shared: Arc::new(Shared {
                state,
                writer: tokio::sync::Mutex::new(None),
                listener: Mutex::new(None),
                network_status: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Last status pushed by the daemon
    pub fn network_status(&self) -> Option<NetworkStatus> {
        *self
            .shared
            .network_status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Replace the `statusChanged` listener
    pub fn set_network_change_listener(&self, listener: Option<NetworkChangeListener>) {
        *self
            .shared
            .listener
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = listener;
    }

    /// Completes once the session has ended
    pub fn once_disconnected(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut state = self.shared.state.subscribe();
        async move {
            let _ = state
                .wait_for(|state| *state == SessionState::Disconnected)
                .await;
        }
    }

    /// Connect to the daemon and have it configure the routing table
    ///
    /// If the daemon cannot be reached and `allow_install_retry` is set, the
    /// daemon is installed and the connection retried. Installation is
    /// attempted at most once per session. A failed start ends the session.
    pub async fn start(&self, allow_install_retry: bool) -> Result<(), NativeError> {
        match self.shared.begin_start() {
            Ok(()) => {}
            Err(SessionState::Disconnected) => {
                return Err(NativeError::with_message(
                    NativeErrorKind::Unexpected,
                    "routing session has already ended",
                ))
            }
            Err(other) => {
                return Err(NativeError::with_message(
                    NativeErrorKind::Unexpected,
                    format!("routing session already started ({:?})", other),
                ))
            }
        }

        let result = self.connect_and_configure(allow_install_retry).await;
        if result.is_err() {
            self.shared.close_writer().await;
            self.shared.disconnect();
        }
        result
    }

    async fn connect_and_configure(&self, allow_install_retry: bool) -> Result<(), NativeError> {
        let mut allow_install = allow_install_retry;

        let stream = loop {
            self.shared.transition(SessionState::Connecting);

            match ipc::connect_transport(&self.service_path).await {
                Ok(stream) => break stream,
                Err(e) => {
                    warn!(path = %self.service_path.display(), error = %e, "Could not connect to routing daemon");

                    if !allow_install
                        || !self.supports_install
                        || self.install_attempted.swap(true, Ordering::SeqCst)
                    {
                        return Err(NativeError::system_configuration(
                            "routing daemon is not running",
                        ));
                    }

                    self.shared.transition(SessionState::Installing);
                    self.installer.install().await?;
                    allow_install = false;
                }
            }
        };

        let (mut reader, writer) = tokio::io::split(stream);

        // A stop() while connecting already ended the session.
        if !self.shared.transition(SessionState::Configuring) {
            return Err(NativeError::with_message(
                NativeErrorKind::Unexpected,
                "routing session stopped while connecting",
            ));
        }
        *self.shared.writer.lock().await = Some(writer);

        let request = RoutingRequest::ConfigureRouting {
            proxy_ip: self.proxy_ip.clone(),
            is_auto_connect: self.is_auto_connect,
        };
        self.send(&request).await?;

        let mut frames = FrameReader::new();
        let (reply, backlog) = read_reply(&mut reader, &mut frames).await?;

        if reply.action != ResponseAction::ConfigureRouting || !reply.is_success() {
            let message = reply
                .error_message
                .unwrap_or_else(|| "routing daemon rejected the configuration".to_string());
            let kind = match reply.status_code {
                Some(status_code::UNSUPPORTED_ROUTING_TABLE) => {
                    NativeErrorKind::UnsupportedRoutingTable
                }
                _ => NativeErrorKind::Unexpected,
            };
            error!(action = ?reply.action, status = ?reply.status_code, %message, "Routing configuration failed");
            return Err(NativeError::with_message(kind, message));
        }

        // A stop() while configuring has already queued resetRouting; let the
        // session task see its confirmation through.
        let activated = self.shared.state.send_if_modified(|state| {
            if *state == SessionState::Configuring {
                *state = SessionState::Active;
                true
            } else {
                false
            }
        });
        if activated {
            info!(proxy_ip = %self.proxy_ip, "Routing configured");
        } else {
            debug!("Routing configured while stopping");
        }

        tokio::spawn(run_session(Arc::clone(&self.shared), reader, frames, backlog));
        Ok(())
    }

    /// Ask the daemon to restore the routing table
    ///
    /// The session ends when the daemon confirms and the connection closes.
    /// Stopping a session that never connected ends it immediately.
    pub async fn stop(&self) -> Result<(), NativeError> {
        if self.state() == SessionState::Disconnected {
            debug!("Routing session already disconnected");
            return Ok(());
        }

        if self.shared.writer.lock().await.is_none() {
            debug!("Routing session never connected");
            self.shared.disconnect();
            return Ok(());
        }

        self.shared.transition(SessionState::Disconnecting);
        self.send(&RoutingRequest::ResetRouting {}).await
    }

    async fn send(&self, request: &RoutingRequest) -> Result<(), NativeError> {
        let bytes = request.to_bytes().map_err(|e| {
            NativeError::with_message(NativeErrorKind::Unexpected, e.to_string())
        })?;

        let mut guard = self.shared.writer.lock().await;
        let writer = guard.as_mut().ok_or_else(|| {
            NativeError::with_message(NativeErrorKind::Unexpected, "routing daemon connection closed")
        })?;

        writer.write_all(&bytes).await.map_err(|e| {
            NativeError::with_message(
                NativeErrorKind::Unexpected,
                format!("could not write to routing daemon: {}", e),
            )
        })?;
        writer.flush().await.map_err(|e| {
            NativeError::with_message(
                NativeErrorKind::Unexpected,
                format!("could not write to routing daemon: {}", e),
            )
        })
    }
}

impl std::fmt::Debug for RoutingSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingSession")
            .field("proxy_ip", &self.proxy_ip)
            .field("is_auto_connect", &self.is_auto_connect)
            .field("service_path", &self.service_path)
            .field("state", &self.state())
            .finish()
    }
}

/// Wait for the reply to `configureRouting`
///
/// Returns the reply plus any messages that arrived in the same read.
async fn read_reply(
    reader: &mut Reader,
    frames: &mut FrameReader,
) -> Result<(RoutingResponse, Vec<Value>), NativeError> {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let n = reader.read(&mut buf).await.map_err(|e| {
            NativeError::with_message(
                NativeErrorKind::Unexpected,
                format!("could not read from routing daemon: {}", e),
            )
        })?;
        if n == 0 {
            return Err(NativeError::with_message(
                NativeErrorKind::Unexpected,
                "routing daemon closed the connection before replying",
            ));
        }

        let mut values = Vec::new();
        for message in frames.push(&buf[..n]) {
            match message {
                Ok(value) => values.push(value),
                Err(e) => warn!(error = %e, "Dropping malformed message from routing daemon"),
            }
        }

        let mut values = values.into_iter();
        while let Some(value) = values.next() {
            match serde_json::from_value::<RoutingResponse>(value) {
                Ok(reply) => return Ok((reply, values.collect())),
                Err(e) => warn!(error = %e, "Dropping malformed message from routing daemon"),
            }
        }
    }
}

/// Steady state: dispatch pushes until the connection closes
async fn run_session(shared: Arc<Shared>, mut reader: Reader, mut frames: FrameReader, backlog: Vec<Value>) {
    let mut closing = false;
    for value in backlog {
        closing |= dispatch(&shared, value);
    }

    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    while !closing {
        match reader.read(&mut buf).await {
            Ok(0) => {
                debug!("Routing daemon closed the connection");
                break;
            }
            Ok(n) => {
                for message in frames.push(&buf[..n]) {
                    match message {
                        Ok(value) => closing |= dispatch(&shared, value),
                        Err(e) => {
                            error!(error = %e, "Dropping malformed message from routing daemon")
                        }
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "Routing daemon connection failed");
                break;
            }
        }
    }

    shared.close_writer().await;
    shared.disconnect();
}

/// Handle one daemon message; returns true when the session should close
fn dispatch(shared: &Shared, value: Value) -> bool {
    let message: RoutingResponse = match serde_json::from_value(value.clone()) {
        Ok(message) => message,
        Err(e) => {
            error!(error = %e, %value, "Unexpected message from routing daemon");
            return false;
        }
    };

    match message.action {
        ResponseAction::StatusChanged => {
            match message.connection_status.and_then(NetworkStatus::from_code) {
                Some(status) => {
                    info!(?status, "Network status changed");
                    shared.notify_network_change(status);
                }
                None => {
                    error!(status = ?message.connection_status, "Unknown network status from routing daemon");
                }
            }
            false
        }
        ResponseAction::ResetRouting => {
            debug!(status = ?message.status_code, "Routing reset confirmed");
            true
        }
        _ => {
            error!(%value, "Unexpected message from routing daemon");
            false
        }
    }
}
