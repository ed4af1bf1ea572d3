//! System suspend/resume detection
//!
//! On Linux the events come from systemd-logind's `PrepareForSleep` D-Bus
//! signal. Any other source can feed a [`ConnectionManager`] through the same
//! channel type.
//!
//! [`ConnectionManager`]: crate::vpn::ConnectionManager

/// Power state transitions the tunnel reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerEvent {
    /// System about to suspend
    Suspending,
    /// System resumed from suspend
    Resumed,
}

impl PowerEvent {
    /// Map the `PrepareForSleep` argument to an event
    pub fn from_prepare_for_sleep(starting: bool) -> Self {
        if starting {
            PowerEvent::Suspending
        } else {
            PowerEvent::Resumed
        }
    }
}

#[cfg(target_os = "linux")]
pub use logind::{PowerMonitor, PowerMonitorError};

#[cfg(target_os = "linux")]
mod logind {
    use super::PowerEvent;
    use futures_util::StreamExt;
    use tokio::sync::mpsc;
    use tracing::{debug, warn};
    use zbus::Connection;

    const LOGIN1_SERVICE: &str = "org.freedesktop.login1";
    const LOGIN1_PATH: &str = "/org/freedesktop/login1";
    const LOGIN1_MANAGER: &str = "org.freedesktop.login1.Manager";

    /// Watches logind for suspend and resume
    pub struct PowerMonitor {
        connection: Connection,
    }

    impl PowerMonitor {
        /// Connect to the system bus and verify logind is available
        #[tracing::instrument]
        pub async fn connect() -> Result<Self, PowerMonitorError> {
            let connection = Connection::system().await?;

            let proxy = zbus::fdo::DBusProxy::new(&connection).await?;
            let bus_name = zbus::names::BusName::try_from(LOGIN1_SERVICE)
                .map_err(|e| PowerMonitorError::QueryFailed(e.to_string()))?;
            let name_has_owner = proxy
                .name_has_owner(bus_name)
                .await
                .map_err(|e| PowerMonitorError::QueryFailed(e.to_string()))?;

            if !name_has_owner {
                return Err(PowerMonitorError::LogindUnavailable);
            }

            Ok(Self { connection })
        }

        /// Subscribe to `PrepareForSleep`
        ///
        /// A background task forwards events until the receiver is dropped.
        pub async fn start(self) -> Result<mpsc::UnboundedReceiver<PowerEvent>, PowerMonitorError> {
            let proxy = zbus::Proxy::new(&self.connection, LOGIN1_SERVICE, LOGIN1_PATH, LOGIN1_MANAGER)
                .await?;
            let mut signals = proxy.receive_signal("PrepareForSleep").await?;

            let (tx, rx) = mpsc::unbounded_channel();
            let connection = self.connection;

            tokio::spawn(async move {
                let _connection = connection;
                while let Some(message) = signals.next().await {
                    let starting: bool = match message.body().deserialize() {
                        Ok(starting) => starting,
                        Err(e) => {
                            warn!(error = %e, "Malformed PrepareForSleep signal");
                            continue;
                        }
                    };

                    let event = PowerEvent::from_prepare_for_sleep(starting);
                    debug!(?event, "Power event");
                    if tx.send(event).is_err() {
                        break;
                    }
                }
            });

            Ok(rx)
        }
    }

    /// Errors that can occur while subscribing to power events
    #[derive(Debug, thiserror::Error)]
    pub enum PowerMonitorError {
        #[error("D-Bus connection failed: {0}")]
        DBusConnectionFailed(#[from] zbus::Error),

        #[error("systemd-logind not available")]
        LogindUnavailable,

        #[error("Failed to query D-Bus: {0}")]
        QueryFailed(String),
    }
}
