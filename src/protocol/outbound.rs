//! Frames generated by the relay.

// ============================================================================
// Imports
// ============================================================================

use axum::extract::ws::Message;
use serde::Serialize;
use serde_json::to_string;

use crate::error::{Error, Result};
use crate::identifiers::DeviceId;

// ============================================================================
// Outbound
// ============================================================================

/// A frame the relay sends on its own behalf.
///
/// # Format
///
/// ```json
/// { "type": "device-offline", "deviceId": "pi-7" }
/// { "type": "error", "message": "device not found" }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type")]
pub enum Outbound {
    /// Device registration accepted.
    #[serde(rename = "registered")]
    Registered {
        /// Registered identifier.
        #[serde(rename = "deviceId")]
        device_id: DeviceId,
    },

    /// Operator attached.
    #[serde(rename = "attached")]
    Attached {
        /// Device the operator is now attached to.
        #[serde(rename = "deviceId")]
        device_id: DeviceId,
    },

    /// Request failed; the connection stays open unless auth failed.
    #[serde(rename = "error")]
    Error {
        /// Human-readable reason.
        message: String,
    },

    /// The attached device (re)connected.
    #[serde(rename = "device-online")]
    DeviceOnline {
        /// Device that came online.
        #[serde(rename = "deviceId")]
        device_id: DeviceId,
    },

    /// The attached device went away.
    #[serde(rename = "device-offline")]
    DeviceOffline {
        /// Device that went offline.
        #[serde(rename = "deviceId")]
        device_id: DeviceId,
    },
}

impl Outbound {
    /// Creates an error reply from a crate error.
    #[inline]
    #[must_use]
    pub fn error(err: &Error) -> Self {
        Self::Error {
            message: err.client_message(),
        }
    }

    /// Serializes into a WebSocket text frame.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] if serialization fails.
    pub fn to_message(&self) -> Result<Message> {
        Ok(Message::Text(to_string(self)?.into()))
    }
}

// ============================================================================
// Tests
// ============================================================================
