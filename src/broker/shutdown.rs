//! Graceful shutdown.
//!
//! # Sequence
//!
//! 1. Stop the liveness monitor
//! 2. Stop accepting connections
//! 3. Ask every open connection to close
//! 4. Wait up to the grace period for their event loops to finish
//!
//! The coordinator returns either way; the caller exits the process.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tracing::{info, warn};

use crate::error::Result;
use crate::transport::RelayServer;

use super::{Broker, LivenessMonitor};

// ============================================================================
// Signals
// ============================================================================

/// Completes on SIGINT or SIGTERM (Ctrl+C elsewhere).
///
/// # Errors
///
/// Returns [`crate::Error::Io`] if a signal handler cannot be installed.
pub async fn wait_for_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = sigint.recv() => info!("Received SIGINT"),
            _ = sigterm.recv() => info!("Received SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}

// ============================================================================
// DrainOutcome
// ============================================================================

/// How the drain step ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Every connection finished closing within the grace period.
    Clean,
    /// The grace period ran out with connections still open.
    TimedOut {
        /// Event loops still running at the deadline.
        remaining: usize,
    },
}

impl DrainOutcome {
    /// Returns `true` if nothing was left behind.
    #[inline]
    #[must_use]
    pub const fn is_clean(&self) -> bool {
        matches!(self, Self::Clean)
    }
}

// ============================================================================
// ShutdownCoordinator
// ============================================================================

/// Single-shot shutdown sequence.
#[derive(Debug)]
pub struct ShutdownCoordinator {
    broker: Arc<Broker>,
    server: Arc<RelayServer>,
    liveness: Option<LivenessMonitor>,
    grace: Duration,
}

impl ShutdownCoordinator {
    /// Creates a coordinator over the running components.
    #[must_use]
    pub fn new(
        broker: Arc<Broker>,
        server: Arc<RelayServer>,
        liveness: Option<LivenessMonitor>,
        grace: Duration,
    ) -> Self {
        Self {
            broker,
            server,
            liveness,
            grace,
        }
    }

    /// Runs the shutdown sequence. Consumes the coordinator.
    pub async fn run(self) -> DrainOutcome {
        info!(grace = ?self.grace, "Shutting down relay");

        if let Some(liveness) = self.liveness {
            liveness.stop().await;
        }

        self.server.stop_accepting();
        let closing = self.broker.drain();
        info!(connections = closing, "Close requested on all connections");

        match timeout(self.grace, self.server.wait_idle()).await {
            Ok(()) => {
                info!("All connections closed");
                DrainOutcome::Clean
            }
            Err(_) => {
                let remaining = self.server.live_connections();
                warn!(remaining, "Grace period elapsed with connections still open");
                DrainOutcome::TimedOut { remaining }
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
