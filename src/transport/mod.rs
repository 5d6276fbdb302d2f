//! WebSocket transport shell.
//!
//! Accepts devices and operators on one port, turns each socket into a
//! [`Connection`] handle and feeds its text frames to the broker.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────┐                ┌──────────────────────────┐                ┌──────────┐
//! │  Device  │   WebSocket    │        RelayServer       │   WebSocket    │ Operator │
//! │ (pi-7)   │◄──────────────►│  Connection ─► Broker    │◄──────────────►│          │
//! └──────────┘                │  health (GET /)          │                └──────────┘
//!                             └──────────────────────────┘
//! ```
//!
//! # Connection Lifecycle
//!
//! 1. `RelayServer::bind` - Bind the listener and start the axum server
//! 2. Non-upgrade requests receive the health response
//! 3. Upgraded sockets get a `Connection` and an event loop task
//! 4. The broker routes frames between connections via their handles
//! 5. Close, error or reclamation runs disconnect cleanup, then drops the socket
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `connection` | Connection handle and event loop |
//! | `health` | Plain HTTP health responder |
//! | `server` | Listener and request routing |

// ============================================================================
// Submodules
// ============================================================================

/// Connection handle and per-connection event loop.
pub mod connection;

/// Plain HTTP health responder.
pub mod health;

/// Relay listener and request routing.
pub mod server;

// ============================================================================
// Re-exports
// ============================================================================

pub use connection::Connection;
pub use server::RelayServer;
