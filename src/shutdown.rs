//! Process shutdown signals.
//!
//! | Signal  | Action        |
//! |---------|---------------|
//! | SIGINT  | Stop serving  |
//! | SIGTERM | Stop serving  |

use std::io;
use tracing::info;

#[cfg(unix)]
use tokio::signal::unix::{signal, Signal, SignalKind};

/// Registered shutdown signal handlers.
#[cfg(unix)]
pub struct ShutdownSignal {
    sigterm: Signal,
    sigint: Signal,
}

#[cfg(unix)]
impl ShutdownSignal {
    /// Install the handlers. Must be called from within a tokio runtime.
    pub fn register() -> io::Result<Self> {
        Ok(Self {
            sigterm: signal(SignalKind::terminate())?,
            sigint: signal(SignalKind::interrupt())?,
        })
    }

    /// Resolve once SIGINT or SIGTERM arrives.
    pub async fn recv(mut self) {
        tokio::select! {
            _ = self.sigterm.recv() => info!(signal = "SIGTERM", "Shutdown requested"),
            _ = self.sigint.recv() => info!(signal = "SIGINT", "Shutdown requested"),
        }
    }
}

#[cfg(not(unix))]
pub struct ShutdownSignal;

#[cfg(not(unix))]
impl ShutdownSignal {
    pub fn register() -> io::Result<Self> {
        Ok(Self)
    }

    /// Resolve once Ctrl+C is pressed.
    pub async fn recv(self) {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!(signal = "ctrl-c", "Shutdown requested"),
            Err(e) => {
                tracing::error!(error = %e, "Ctrl+C handler failed, serving until killed");
                std::future::pending::<()>().await;
            }
        }
    }
}
