//! Liveness monitor.
//!
//! Sweeps the registry on a fixed interval. A connection that has not
//! answered the previous probe by the next sweep is reclaimed, so a dead
//! peer is gone within two intervals.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, warn};

use super::Broker;

// ============================================================================
// LivenessMonitor
// ============================================================================

/// Handle to the background sweep task.
///
/// Dropping the handle also stops the task.
#[derive(Debug)]
pub struct LivenessMonitor {
    stop_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl LivenessMonitor {
    /// Starts sweeping every `period`. The first sweep runs one period
    /// after the call.
    #[must_use]
    pub fn spawn(broker: Arc<Broker>, period: Duration) -> Self {
        let (stop_tx, mut stop_rx) = oneshot::channel();

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            debug!(?period, "Liveness monitor started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let reclaimed = broker.sweep();
                        for conn in &reclaimed {
                            warn!(%conn, "Reclaimed unresponsive connection");
                        }
                    }

                    _ = &mut stop_rx => break,
                }
            }

            debug!("Liveness monitor stopped");
        });

        Self { stop_tx, handle }
    }

    /// Stops the sweep task and waits for it to finish.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(());
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Liveness monitor task failed");
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
