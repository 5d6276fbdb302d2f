//! Relay configuration values.
//!
//! [`RelayConfig`] is immutable once built. The device table in particular
//! is read-only for the lifetime of the process.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::identifiers::DeviceId;

use super::builder::RelayConfigBuilder;

// ============================================================================
// Constants
// ============================================================================

/// Default listen address (all interfaces).
pub const DEFAULT_BIND_IP: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);

/// Default listen port.
pub const DEFAULT_PORT: u16 = 8080;

/// Interval between liveness sweeps.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Upper bound on waiting for connections to close at shutdown.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Per-connection outbound queue capacity.
pub const DEFAULT_OUTBOUND_BUFFER: usize = 256;

/// Largest accepted inbound frame (1 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1024 * 1024;

// ============================================================================
// Types
// ============================================================================

/// Device identifier to expected secret.
pub type DeviceTable = FxHashMap<DeviceId, String>;

// ============================================================================
// AttachPolicy
// ============================================================================

/// How many operators may be attached to one device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachPolicy {
    /// At most one operator; a second attach is answered with "busy".
    Exclusive,
    /// Any number of operators; all receive device output.
    #[default]
    Broadcast,
}

impl AttachPolicy {
    /// Returns the policy name as used in configuration.
    #[inline]
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Exclusive => "exclusive",
            Self::Broadcast => "broadcast",
        }
    }
}

impl fmt::Display for AttachPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttachPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "exclusive" | "single" => Ok(Self::Exclusive),
            "broadcast" | "shared" | "multi" => Ok(Self::Broadcast),
            other => Err(Error::config(format!(
                "unknown attach policy '{other}' (expected 'exclusive' or 'broadcast')"
            ))),
        }
    }
}

// ============================================================================
// RelayConfig
// ============================================================================

/// Complete relay configuration.
///
/// Use [`RelayConfig::builder()`] or [`RelayConfig::from_env()`] to create
/// a validated instance.
#[derive(Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Address to listen on.
    pub bind_ip: IpAddr,

    /// Port to listen on (0 lets the OS choose).
    pub port: u16,

    /// Device credentials accepted by the auth gate.
    pub devices: DeviceTable,

    /// Exclusive or broadcast operator attachment.
    pub attach_policy: AttachPolicy,

    /// Interval between liveness sweeps.
    pub heartbeat_interval: Duration,

    /// Bounded wait for connections to close at shutdown.
    pub shutdown_grace: Duration,

    /// Per-connection outbound queue capacity.
    pub outbound_buffer: usize,

    /// Largest accepted inbound frame in bytes.
    pub max_message_size: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_ip: DEFAULT_BIND_IP,
            port: DEFAULT_PORT,
            devices: DeviceTable::default(),
            attach_policy: AttachPolicy::default(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            outbound_buffer: DEFAULT_OUTBOUND_BUFFER,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

impl RelayConfig {
    /// Creates a configuration builder.
    #[inline]
    #[must_use]
    pub fn builder() -> RelayConfigBuilder {
        RelayConfigBuilder::new()
    }

    /// Returns the socket address to bind.
    #[inline]
    #[must_use]
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_ip, self.port)
    }
}

// Secrets never reach the logs
impl fmt::Debug for RelayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayConfig")
            .field("bind_ip", &self.bind_ip)
            .field("port", &self.port)
            .field("device_count", &self.devices.len())
            .field("attach_policy", &self.attach_policy)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("shutdown_grace", &self.shutdown_grace)
            .field("outbound_buffer", &self.outbound_buffer)
            .field("max_message_size", &self.max_message_size)
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
