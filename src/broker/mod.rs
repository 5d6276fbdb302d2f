//! Session registry, message routing and lifecycle control.
//!
//! # Components
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Registry`] | Device and operator bookkeeping |
//! | [`Broker`] | Decodes frames and routes them through the registry |
//! | [`LivenessMonitor`] | Periodic probe and reclamation |
//! | [`ShutdownCoordinator`] | Bounded drain on termination |
//!
//! # Example
//!
//! ```ignore
//! let broker = Arc::new(Broker::new(&config));
//! let server = RelayServer::bind(&config, Arc::clone(&broker)).await?;
//! let liveness = LivenessMonitor::spawn(Arc::clone(&broker), config.heartbeat_interval);
//!
//! wait_for_signal().await?;
//! ShutdownCoordinator::new(broker, server, Some(liveness), config.shutdown_grace)
//!     .run()
//!     .await;
//! ```

// ============================================================================
// Submodules
// ============================================================================

/// Periodic liveness sweeps.
pub mod liveness;

/// Device and operator bookkeeping.
pub mod registry;

/// Frame decoding and dispatch.
pub mod router;

/// Signal handling and bounded drain.
pub mod shutdown;

// ============================================================================
// Re-exports
// ============================================================================

pub use liveness::LivenessMonitor;
pub use registry::{Registry, Role};
pub use router::Broker;
pub use shutdown::{DrainOutcome, ShutdownCoordinator, wait_for_signal};
