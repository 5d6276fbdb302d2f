//! WebSocket protocol message types.
//!
//! This module defines the JSON envelope exchanged between devices,
//! operators and the relay.
//!
//! # Protocol Overview
//!
//! Every frame is a JSON object with a `type` discriminator:
//!
//! ```json
//! { "type": "input", "data": "ls\n" }
//! ```
//!
//! | Message Type | Direction | Purpose |
//! |--------------|-----------|---------|
//! | [`Inbound`] | Peer → Relay | Control (`register`, `attach`, `release`) and relayed traffic |
//! | [`Outbound`] | Relay → Peer | Acknowledgements, errors, presence notifications |
//!
//! Relayed traffic (`input`, `output`, `status_update`, ...) is forwarded
//! verbatim; the relay only decodes enough of it to route it.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `inbound` | Closed enumeration of frames peers may send |
//! | `outbound` | Frames generated by the relay |

// ============================================================================
// Submodules
// ============================================================================

/// Frames sent by devices and operators.
pub mod inbound;

/// Frames generated by the relay itself.
pub mod outbound;

// ============================================================================
// Re-exports
// ============================================================================

pub use inbound::{Inbound, RequiredRole};
pub use outbound::Outbound;
