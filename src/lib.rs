//! Device relay - WebSocket broker between unattended devices and operators.
//!
//! Devices and operators both dial out to the relay, so neither needs a
//! routable address. The relay authenticates devices, keeps one
//! authoritative connection per device identifier, attaches operators to
//! devices and forwards terminal, status and recording traffic between them.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────┐   register / output   ┌─────────────────────┐   attach / input   ┌──────────┐
//! │  Device  │──────────────────────►│       Broker        │◄───────────────────│ Operator │
//! │          │◄──────────────────────│  Registry + Router  │───────────────────►│          │
//! └──────────┘   input / command     └─────────────────────┘   output / status  └──────────┘
//! ```
//!
//! Key design principles:
//!
//! - The [`Registry`] is the only shared mutable state, guarded by one lock
//! - Connections never reference their peers; relations live in the registry
//! - Message types form a closed enum with an explicit fallback variant
//! - Forwarding is best-effort and never blocks the router
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use device_relay::{Broker, LivenessMonitor, RelayConfig, RelayServer, Result, ShutdownCoordinator};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = RelayConfig::builder()
//!         .port(8080)
//!         .device("pi-7", "s3cret")
//!         .build()?;
//!
//!     let broker = Arc::new(Broker::new(&config));
//!     let server = RelayServer::bind(&config, Arc::clone(&broker)).await?;
//!     let liveness = LivenessMonitor::spawn(Arc::clone(&broker), config.heartbeat_interval);
//!
//!     device_relay::wait_for_signal().await?;
//!     ShutdownCoordinator::new(broker, server, Some(liveness), config.shutdown_grace)
//!         .run()
//!         .await;
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`auth`] | Device credential check |
//! | [`broker`] | [`Registry`], [`Broker`], [`LivenessMonitor`], [`ShutdownCoordinator`] |
//! | [`config`] | [`RelayConfig`] builder and environment loader |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`identifiers`] | Type-safe ID wrappers |
//! | [`protocol`] | WebSocket message types |
//! | [`transport`] | Listener, connection handles, health check |

// ============================================================================
// Modules
// ============================================================================

/// Device credential check.
pub mod auth;

/// Session registry, router, liveness and shutdown.
///
/// - [`Registry`] - Device and operator bookkeeping
/// - [`Broker`] - Frame dispatch
/// - [`LivenessMonitor`] - Dead connection reclamation
/// - [`ShutdownCoordinator`] - Bounded drain
pub mod broker;

/// Relay configuration.
///
/// Use [`RelayConfig::builder()`] or [`RelayConfig::from_env()`].
pub mod config;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Type-safe identifiers.
pub mod identifiers;

/// WebSocket protocol message types.
pub mod protocol;

/// WebSocket transport shell.
///
/// Accepts connections and hands text frames to the [`Broker`].
pub mod transport;

// ============================================================================
// Re-exports
// ============================================================================

// Auth types
pub use auth::{AuthDecision, AuthGate};

// Broker types
pub use broker::{
    Broker, DrainOutcome, LivenessMonitor, Registry, Role, ShutdownCoordinator, wait_for_signal,
};

// Config types
pub use config::{AttachPolicy, DeviceTable, RelayConfig, RelayConfigBuilder};

// Error types
pub use error::{Error, Result};

// Identifier types
pub use identifiers::{ConnectionId, DeviceId};

// Protocol types
pub use protocol::{Inbound, Outbound};

// Transport types
pub use transport::{Connection, RelayServer};
