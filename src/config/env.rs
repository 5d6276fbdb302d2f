//! Loading configuration from environment variables.
//!
//! | Variable | Meaning | Default |
//! |----------|---------|---------|
//! | `PORT` | Listen port | `8080` |
//! | `RELAY_BIND` | Listen address | `0.0.0.0` |
//! | `RELAY_DEVICES` | Inline table `id=secret,id2=secret2` | empty |
//! | `RELAY_DEVICES_FILE` | JSON object `{"id": "secret"}` | none |
//! | `RELAY_ATTACH_POLICY` | `exclusive` or `broadcast` | `broadcast` |
//! | `RELAY_HEARTBEAT_SECS` | Liveness sweep interval | `30` |
//! | `RELAY_SHUTDOWN_GRACE_SECS` | Shutdown drain bound | `5` |
//! | `RELAY_OUTBOUND_BUFFER` | Outbound queue per connection | `256` |
//! | `RELAY_MAX_MESSAGE_BYTES` | Largest inbound frame | `1048576` |
//!
//! File entries are loaded first; inline entries override them.

// ============================================================================
// Imports
// ============================================================================

use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::identifiers::DeviceId;

use super::options::{AttachPolicy, DeviceTable, RelayConfig};

// ============================================================================
// Variable Names
// ============================================================================

const VAR_PORT: &str = "PORT";
const VAR_BIND: &str = "RELAY_BIND";
const VAR_DEVICES: &str = "RELAY_DEVICES";
const VAR_DEVICES_FILE: &str = "RELAY_DEVICES_FILE";
const VAR_ATTACH_POLICY: &str = "RELAY_ATTACH_POLICY";
const VAR_HEARTBEAT_SECS: &str = "RELAY_HEARTBEAT_SECS";
const VAR_SHUTDOWN_GRACE_SECS: &str = "RELAY_SHUTDOWN_GRACE_SECS";
const VAR_OUTBOUND_BUFFER: &str = "RELAY_OUTBOUND_BUFFER";
const VAR_MAX_MESSAGE_BYTES: &str = "RELAY_MAX_MESSAGE_BYTES";

// ============================================================================
// RelayConfig - Environment
// ============================================================================

impl RelayConfig {
    /// Loads configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a variable cannot be parsed, or
    /// [`Error::Io`] / [`Error::Json`] if the devices file is unreadable.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let mut builder = RelayConfig::builder();

        if let Some(port) = get(VAR_PORT) {
            builder = builder.port(parse_var(VAR_PORT, &port)?);
        }
        if let Some(bind) = get(VAR_BIND) {
            builder = builder.bind_ip(parse_var::<IpAddr>(VAR_BIND, &bind)?);
        }
        if let Some(path) = get(VAR_DEVICES_FILE) {
            builder = builder.devices(load_device_file(Path::new(path.trim()))?);
        }
        if let Some(inline) = get(VAR_DEVICES) {
            builder = builder.devices(parse_device_table(&inline)?);
        }
        if let Some(policy) = get(VAR_ATTACH_POLICY) {
            builder = builder.attach_policy(policy.parse::<AttachPolicy>()?);
        }
        if let Some(secs) = get(VAR_HEARTBEAT_SECS) {
            let secs: u64 = parse_var(VAR_HEARTBEAT_SECS, &secs)?;
            builder = builder.heartbeat_interval(Duration::from_secs(secs));
        }
        if let Some(secs) = get(VAR_SHUTDOWN_GRACE_SECS) {
            let secs: u64 = parse_var(VAR_SHUTDOWN_GRACE_SECS, &secs)?;
            builder = builder.shutdown_grace(Duration::from_secs(secs));
        }
        if let Some(capacity) = get(VAR_OUTBOUND_BUFFER) {
            builder = builder.outbound_buffer(parse_var(VAR_OUTBOUND_BUFFER, &capacity)?);
        }
        if let Some(bytes) = get(VAR_MAX_MESSAGE_BYTES) {
            builder = builder.max_message_size(parse_var(VAR_MAX_MESSAGE_BYTES, &bytes)?);
        }

        let config = builder.build()?;

        if config.devices.is_empty() {
            warn!("No devices configured; every register will be rejected");
        }
        debug!(?config, "Configuration loaded from environment");

        Ok(config)
    }
}

// ============================================================================
// Parsing Helpers
// ============================================================================

/// Parses an inline device table of the form `id=secret,id2=secret2`.
///
/// Whitespace around entries is ignored, as are empty entries.
///
/// # Errors
///
/// Returns [`Error::Config`] if an entry lacks `=` or has an empty side.
pub fn parse_device_table(raw: &str) -> Result<DeviceTable> {
    let mut table = DeviceTable::default();

    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (id, secret) = entry.split_once('=').ok_or_else(|| {
            Error::config(format!("device entry '{entry}' is not of the form id=secret"))
        })?;

        let (id, secret) = (id.trim(), secret.trim());
        if id.is_empty() || secret.is_empty() {
            return Err(Error::config(format!(
                "device entry '{entry}' has an empty id or secret"
            )));
        }

        table.insert(DeviceId::new(id), secret.to_string());
    }

    Ok(table)
}

/// Reads a JSON object mapping device IDs to secrets.
fn load_device_file(path: &Path) -> Result<DeviceTable> {
    let contents = fs::read_to_string(path)?;
    let table: DeviceTable = serde_json::from_str(&contents)?;
    debug!(path = %path.display(), count = table.len(), "Loaded device file");
    Ok(table)
}

fn parse_var<T: FromStr>(name: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| Error::config(format!("{name}='{raw}' could not be parsed")))
}

// ============================================================================
// Tests
// ============================================================================
