//! Error types for the device relay.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use device_relay::{Error, Result};
//!
//! fn lookup(registry: &Registry, id: &DeviceId) -> Result<ConnectionId> {
//!     registry
//!         .device(id)
//!         .ok_or_else(|| Error::device_not_found(id.clone()))
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Configuration | [`Error::Config`] |
//! | Session | [`Error::AuthRejected`], [`Error::DeviceNotFound`], [`Error::DeviceBusy`], [`Error::AlreadyAttached`], [`Error::NotAttached`], [`Error::WrongRole`] |
//! | Protocol | [`Error::Malformed`] |
//! | Delivery | [`Error::ConnectionClosed`] |
//! | External | [`Error::Io`], [`Error::Json`], [`Error::WebSocket`] |

// ============================================================================
// Imports
// ============================================================================

use std::io::Error as IoError;
use std::result::Result as StdResult;

use thiserror::Error;

use crate::identifiers::DeviceId;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    ///
    /// Returned when relay configuration is missing or invalid.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    // ========================================================================
    // Session Errors
    // ========================================================================
    /// Device credentials rejected.
    ///
    /// Deliberately carries no detail: unknown identifiers and wrong secrets
    /// must be indistinguishable to the peer.
    #[error("authentication failed")]
    AuthRejected,

    /// No live device is registered under the identifier.
    #[error("device not found: {device_id}")]
    DeviceNotFound {
        /// The identifier that has no live device.
        device_id: DeviceId,
    },

    /// Exclusive attach policy and another operator holds the device.
    #[error("device busy: {device_id}")]
    DeviceBusy {
        /// The contested device.
        device_id: DeviceId,
    },

    /// Operator tried to attach while already attached.
    #[error("already attached to {device_id}")]
    AlreadyAttached {
        /// The device the operator is currently attached to.
        device_id: DeviceId,
    },

    /// Operator sent a device-bound message without an attachment.
    #[error("not attached")]
    NotAttached,

    /// Sender's role does not permit the message type.
    #[error("{kind} not permitted for this connection")]
    WrongRole {
        /// Wire name of the rejected message type.
        kind: &'static str,
    },

    // ========================================================================
    // Protocol Errors
    // ========================================================================
    /// Undecodable payload or missing required field.
    #[error("Malformed message: {message}")]
    Malformed {
        /// Description of the decoding failure.
        message: String,
    },

    // ========================================================================
    // Delivery Errors
    // ========================================================================
    /// Target connection closed or its outbound queue is unavailable.
    #[error("Connection closed")]
    ConnectionClosed,

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] axum::Error),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a device not found error.
    #[inline]
    pub fn device_not_found(device_id: DeviceId) -> Self {
        Self::DeviceNotFound { device_id }
    }

    /// Creates a device busy error.
    #[inline]
    pub fn device_busy(device_id: DeviceId) -> Self {
        Self::DeviceBusy { device_id }
    }

    /// Creates an already attached error.
    #[inline]
    pub fn already_attached(device_id: DeviceId) -> Self {
        Self::AlreadyAttached { device_id }
    }

    /// Creates a malformed message error.
    #[inline]
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed {
            message: message.into(),
        }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if the sender's connection must be closed.
    #[inline]
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::AuthRejected)
    }

    /// Returns `true` if the sender is told about this error.
    ///
    /// Malformed input, role violations and delivery failures are dropped
    /// without a reply.
    #[inline]
    #[must_use]
    pub fn is_reportable(&self) -> bool {
        matches!(
            self,
            Self::AuthRejected
                | Self::DeviceNotFound { .. }
                | Self::DeviceBusy { .. }
                | Self::AlreadyAttached { .. }
                | Self::NotAttached
        )
    }

    /// Returns the text placed in an `error` reply to the sender.
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            Self::DeviceNotFound { .. } => "device not found".to_string(),
            Self::DeviceBusy { .. } => "device busy".to_string(),
            other => other.to_string(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
