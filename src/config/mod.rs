//! Relay configuration.
//!
//! Provides the tunables and the device credential table consumed by the
//! broker and transport layers.
//!
//! # Example
//!
//! ```ignore
//! use device_relay::{AttachPolicy, RelayConfig};
//!
//! let config = RelayConfig::builder()
//!     .port(8080)
//!     .device("pi-7", "s3cret")
//!     .attach_policy(AttachPolicy::Exclusive)
//!     .build()?;
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `options` | [`RelayConfig`] and [`AttachPolicy`] |
//! | `builder` | Fluent [`RelayConfigBuilder`] with validation |
//! | `env` | Loading from process environment variables |

// ============================================================================
// Submodules
// ============================================================================

/// Fluent configuration builder.
pub mod builder;

/// Environment variable loader.
pub mod env;

/// Configuration values and attach policy.
pub mod options;

// ============================================================================
// Re-exports
// ============================================================================

pub use builder::RelayConfigBuilder;
pub use env::parse_device_table;
pub use options::{AttachPolicy, DeviceTable, RelayConfig};
