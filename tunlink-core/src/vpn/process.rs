//! One-shot helper process supervisor
//!
//! A [`HelperProcess`] launches an external executable and reports its exit
//! through a single replaceable exit listener. Launching never fails
//! synchronously: a binary that cannot be started is reported through the
//! same listener, right away.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// How long a helper may take to exit after SIGTERM before it is killed
const TERMINATION_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Why a helper is no longer running
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessExit {
    /// `stop` was called before the helper was ever launched
    NeverStarted,
    /// The executable could not be started
    LaunchFailed(String),
    /// The process ran and exited; `None` when killed by a signal
    Exited(Option<i32>),
}

/// Callback invoked once per launch when the helper exits
pub type ExitListener = Arc<dyn Fn(ProcessExit) + Send + Sync>;

enum Lifecycle {
    Unstarted,
    Running {
        pid: Option<u32>,
        stop_tx: Option<oneshot::Sender<()>>,
    },
    Exited,
}

/// Launcher for one external executable
///
/// Owns at most one live OS process at a time. The exit listener slot holds
/// exactly one listener; replacing it takes effect for the next exit.
pub struct HelperProcess {
    name: String,
    path: PathBuf,
    lifecycle: Arc<Mutex<Lifecycle>>,
    exit_listener: Arc<Mutex<ExitListener>>,
}

impl HelperProcess {
    /// Create a supervisor for the executable at `path`
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            lifecycle: Arc::new(Mutex::new(Lifecycle::Unstarted)),
            exit_listener: Arc::new(Mutex::new(Arc::new(|_| {}))),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the exit listener, returning the previous one
    pub fn set_exit_listener(&self, listener: ExitListener) -> ExitListener {
        let mut slot = lock(&self.exit_listener);
        std::mem::replace(&mut *slot, listener)
    }

    /// Convenience wrapper around [`HelperProcess::set_exit_listener`]
    pub fn on_exit<F>(&self, listener: F) -> ExitListener
    where
        F: Fn(ProcessExit) + Send + Sync + 'static,
    {
        self.set_exit_listener(Arc::new(listener))
    }

    /// PID of the running process, if any
    pub fn pid(&self) -> Option<u32> {
        match &*lock(&self.lifecycle) {
            Lifecycle::Running { pid, .. } => *pid,
            _ => None,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(&*lock(&self.lifecycle), Lifecycle::Running { .. })
    }

    /// Start the executable with `args`
    ///
    /// Must be called from within a tokio runtime. Launching while a process
    /// is still running is refused; stop it and wait for the exit first.
    pub fn launch(&self, args: Vec<String>) {
        let mut lifecycle = lock(&self.lifecycle);
        if matches!(*lifecycle, Lifecycle::Running { .. }) {
            warn!(helper = %self.name, "Launch requested while already running, ignoring");
            return;
        }

        let spawned = Command::new(&self.path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                *lifecycle = Lifecycle::Exited;
                drop(lifecycle);
                warn!(helper = %self.name, path = %self.path.display(), error = %e, "Failed to launch helper");
                self.notify_exit(ProcessExit::LaunchFailed(e.to_string()));
                return;
            }
        };

        let pid = child.id();
        info!(helper = %self.name, pid = ?pid, "Helper launched");

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(self.name.clone(), stderr));
        }

        let (stop_tx, stop_rx) = oneshot::channel();
        *lifecycle = Lifecycle::Running {
            pid,
            stop_tx: Some(stop_tx),
        };
        drop(lifecycle);

        let name = self.name.clone();
        let state = Arc::clone(&self.lifecycle);
        let listener_slot = Arc::clone(&self.exit_listener);
        tokio::spawn(async move {
            let code = supervise(&name, child, stop_rx).await;
            *lock(&state) = Lifecycle::Exited;
            info!(helper = %name, code = ?code, "Helper exited");
            let listener = Arc::clone(&*lock(&listener_slot));
            listener(ProcessExit::Exited(code));
        });
    }

    /// Request termination
    ///
    /// Stopping a helper that was never launched reports the exit right away.
    /// Stopping an exited helper does nothing.
    pub fn stop(&self) {
        let mut lifecycle = lock(&self.lifecycle);
        match &mut *lifecycle {
            Lifecycle::Unstarted => {
                *lifecycle = Lifecycle::Exited;
                drop(lifecycle);
                debug!(helper = %self.name, "Stop requested before launch");
                self.notify_exit(ProcessExit::NeverStarted);
            }
            Lifecycle::Running { stop_tx, pid } => {
                if let Some(tx) = stop_tx.take() {
                    debug!(helper = %self.name, pid = ?pid, "Stopping helper");
                    let _ = tx.send(());
                }
            }
            Lifecycle::Exited => {
                debug!(helper = %self.name, "Stop requested after exit, nothing to do");
            }
        }
    }

    fn notify_exit(&self, exit: ProcessExit) {
        let listener = Arc::clone(&*lock(&self.exit_listener));
        listener(exit);
    }
}

impl std::fmt::Debug for HelperProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HelperProcess")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("pid", &self.pid())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Wait for the child to exit or for a stop request, whichever comes first
async fn supervise(name: &str, mut child: Child, stop_rx: oneshot::Receiver<()>) -> Option<i32> {
    tokio::select! {
        status = child.wait() => {
            return status.ok().and_then(|s| s.code());
        }
        _ = stop_rx => {}
    }

    terminate(name, &mut child).await;
    child.wait().await.ok().and_then(|s| s.code())
}

/// SIGTERM first, SIGKILL after the grace period
async fn terminate(name: &str, child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                Ok(()) => {
                    if tokio::time::timeout(TERMINATION_GRACE_PERIOD, child.wait())
                        .await
                        .is_ok()
                    {
                        return;
                    }
                    warn!(helper = %name, pid, "Graceful shutdown timed out, sending SIGKILL");
                }
                Err(e) => {
                    warn!(helper = %name, pid, error = %e, "Failed to send SIGTERM");
                }
            }
        }
    }

    #[cfg(not(unix))]
    let _ = TERMINATION_GRACE_PERIOD;

    if let Err(e) = child.start_kill() {
        debug!(helper = %name, error = %e, "Kill failed, process probably gone");
    }
}

/// Log the helper's stderr until it closes
///
/// Lines need not be UTF-8. The pipe is drained until EOF so the helper
/// never writes into a closed pipe.
async fn forward_stderr(name: String, stderr: ChildStderr) {
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                debug!(helper = %name, "{}", line.trim_end());
            }
            Err(e) => {
                debug!(helper = %name, error = %e, "Stopped reading helper output");
                break;
            }
        }
    }
}
