//! Builder pattern for relay configuration.
//!
//! Provides a fluent API for configuring and validating [`RelayConfig`].
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use device_relay::{AttachPolicy, RelayConfig};
//!
//! # fn example() -> device_relay::Result<()> {
//! let config = RelayConfig::builder()
//!     .port(9000)
//!     .device("pi-7", "s3cret")
//!     .attach_policy(AttachPolicy::Exclusive)
//!     .heartbeat_interval(Duration::from_secs(15))
//!     .build()?;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::identifiers::DeviceId;

use super::options::{AttachPolicy, DeviceTable, RelayConfig};

// ============================================================================
// RelayConfigBuilder
// ============================================================================

/// Builder for a validated [`RelayConfig`].
///
/// Unset values fall back to the [`RelayConfig::default()`] values.
#[derive(Default, Clone)]
pub struct RelayConfigBuilder {
    bind_ip: Option<IpAddr>,
    port: Option<u16>,
    devices: DeviceTable,
    attach_policy: Option<AttachPolicy>,
    heartbeat_interval: Option<Duration>,
    shutdown_grace: Option<Duration>,
    outbound_buffer: Option<usize>,
    max_message_size: Option<usize>,
}

impl fmt::Debug for RelayConfigBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayConfigBuilder")
            .field("bind_ip", &self.bind_ip)
            .field("port", &self.port)
            .field("device_count", &self.devices.len())
            .field("attach_policy", &self.attach_policy)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// RelayConfigBuilder Implementation
// ============================================================================

impl RelayConfigBuilder {
    /// Creates a new builder with no configuration.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the listen address.
    #[inline]
    #[must_use]
    pub fn bind_ip(mut self, ip: IpAddr) -> Self {
        self.bind_ip = Some(ip);
        self
    }

    /// Sets the listen port (0 for a random port).
    #[inline]
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Adds one device credential. A later entry for the same ID wins.
    #[inline]
    #[must_use]
    pub fn device(mut self, device_id: impl Into<DeviceId>, secret: impl Into<String>) -> Self {
        self.devices.insert(device_id.into(), secret.into());
        self
    }

    /// Adds every credential from a table.
    #[inline]
    #[must_use]
    pub fn devices(mut self, devices: impl IntoIterator<Item = (DeviceId, String)>) -> Self {
        self.devices.extend(devices);
        self
    }

    /// Sets the operator attach policy.
    #[inline]
    #[must_use]
    pub fn attach_policy(mut self, policy: AttachPolicy) -> Self {
        self.attach_policy = Some(policy);
        self
    }

    /// Sets the liveness sweep interval.
    #[inline]
    #[must_use]
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = Some(interval);
        self
    }

    /// Sets the shutdown grace period.
    #[inline]
    #[must_use]
    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = Some(grace);
        self
    }

    /// Sets the per-connection outbound queue capacity.
    #[inline]
    #[must_use]
    pub fn outbound_buffer(mut self, capacity: usize) -> Self {
        self.outbound_buffer = Some(capacity);
        self
    }

    /// Sets the largest accepted inbound frame in bytes.
    #[inline]
    #[must_use]
    pub fn max_message_size(mut self, bytes: usize) -> Self {
        self.max_message_size = Some(bytes);
        self
    }

    /// Builds the configuration with validation.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if an interval, buffer or size is zero
    /// - [`Error::Config`] if a device entry has an empty ID or secret
    pub fn build(self) -> Result<RelayConfig> {
        self.validate_devices()?;

        let defaults = RelayConfig::default();

        let heartbeat_interval = self
            .heartbeat_interval
            .unwrap_or(defaults.heartbeat_interval);
        if heartbeat_interval.is_zero() {
            return Err(Error::config("heartbeat interval must be non-zero"));
        }

        let outbound_buffer = self.outbound_buffer.unwrap_or(defaults.outbound_buffer);
        if outbound_buffer == 0 {
            return Err(Error::config("outbound buffer must hold at least one frame"));
        }

        let max_message_size = self.max_message_size.unwrap_or(defaults.max_message_size);
        if max_message_size == 0 {
            return Err(Error::config("max message size must be non-zero"));
        }

        Ok(RelayConfig {
            bind_ip: self.bind_ip.unwrap_or(defaults.bind_ip),
            port: self.port.unwrap_or(defaults.port),
            devices: self.devices,
            attach_policy: self.attach_policy.unwrap_or(defaults.attach_policy),
            heartbeat_interval,
            shutdown_grace: self.shutdown_grace.unwrap_or(defaults.shutdown_grace),
            outbound_buffer,
            max_message_size,
        })
    }
}

// ============================================================================
// Validation
// ============================================================================

impl RelayConfigBuilder {
    /// Rejects entries that could never authenticate.
    fn validate_devices(&self) -> Result<()> {
        for (device_id, secret) in &self.devices {
            if device_id.is_empty() {
                return Err(Error::config("device table contains an empty device ID"));
            }
            if secret.is_empty() {
                return Err(Error::config(format!(
                    "device '{device_id}' has an empty secret"
                )));
            }
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
