//! Process-wide shutdown signal handling.
//!
//! Handlers for SIGINT and SIGTERM are installed once, at process start,
//! before the listener is acquired. On receipt the watcher logs the signal
//! and cancels the shared [`CancellationToken`]; what happens next is up to
//! the configured shutdown mode.

use std::io;

use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::notify::notify_stopping;

/// Watches for the termination signals a service manager sends.
pub struct SignalWatcher {
    sigterm: Signal,
    sigint: Signal,
}

impl SignalWatcher {
    /// Install the SIGTERM and SIGINT handlers.
    ///
    /// From this point on neither signal kills the process by default.
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if a handler cannot be registered.
    pub fn register() -> io::Result<Self> {
        Ok(Self {
            sigterm: signal(SignalKind::terminate())?,
            sigint: signal(SignalKind::interrupt())?,
        })
    }

    /// Wait for the next signal and return its name.
    pub async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.sigterm.recv() => "SIGTERM",
            _ = self.sigint.recv() => "SIGINT",
        }
    }

    /// Spawn the watcher. The first signal cancels `shutdown`.
    ///
    /// The task also ends quietly if `shutdown` is cancelled elsewhere.
    pub fn spawn(mut self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            tokio::select! {
                name = self.recv() => {
                    info!(signal = name, "Received signal, shutting down");
                    notify_stopping();
                    shutdown.cancel();
                }
                _ = shutdown.cancelled() => {}
            }
        })
    }
}
