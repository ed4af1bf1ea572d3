//! Exit coordination between the three helpers
//!
//! Each helper gets an [`ExitLatch`] that opens when it has gone away.
//! [`ExitLatches::first`] resolves as soon as any latch opens and drives the
//! teardown; [`ExitLatches::all`] is the barrier that resolves once every
//! latch has opened.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;

/// A one-way flag that can be awaited
#[derive(Debug, Clone)]
pub struct ExitLatch {
    open: Arc<watch::Sender<bool>>,
}

impl ExitLatch {
    pub fn new() -> Self {
        let (open, _) = watch::channel(false);
        Self {
            open: Arc::new(open),
        }
    }

    /// Open the latch; returns true only for the call that opened it
    pub fn open(&self) -> bool {
        self.open.send_if_modified(|open| !std::mem::replace(open, true))
    }

    pub fn is_open(&self) -> bool {
        *self.open.borrow()
    }

    /// Completes once the latch is open
    pub fn wait(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut open = self.open.subscribe();
        async move {
            let _ = open.wait_for(|open| *open).await;
        }
    }
}

impl Default for ExitLatch {
    fn default() -> Self {
        Self::new()
    }
}

/// Which helper went away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Helper {
    Routing,
    Proxy,
    Tunnel,
}

impl std::fmt::Display for Helper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Helper::Routing => write!(f, "routing daemon"),
            Helper::Proxy => write!(f, "proxy"),
            Helper::Tunnel => write!(f, "tunnel"),
        }
    }
}

/// One latch per helper
#[derive(Debug, Clone, Default)]
pub struct ExitLatches {
    pub routing: ExitLatch,
    pub proxy: ExitLatch,
    pub tunnel: ExitLatch,
}

impl ExitLatches {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves with the first helper to exit
    pub fn first(&self) -> impl Future<Output = Helper> + Send + 'static {
        let routing = self.routing.wait();
        let proxy = self.proxy.wait();
        let tunnel = self.tunnel.wait();
        async move {
            tokio::select! {
                _ = routing => Helper::Routing,
                _ = proxy => Helper::Proxy,
                _ = tunnel => Helper::Tunnel,
            }
        }
    }

    /// Resolves once all three helpers have exited
    pub fn all(&self) -> impl Future<Output = ()> + Send + 'static {
        let routing = self.routing.wait();
        let proxy = self.proxy.wait();
        let tunnel = self.tunnel.wait();
        async move {
            tokio::join!(routing, proxy, tunnel);
        }
    }

    /// Number of helpers that have exited so far
    pub fn exited(&self) -> usize {
        [&self.routing, &self.proxy, &self.tunnel]
            .into_iter()
            .filter(|latch| latch.is_open())
            .count()
    }
}
