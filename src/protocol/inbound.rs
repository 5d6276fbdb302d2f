//! Frames sent by devices and operators.
//!
//! # Dispatch Table
//!
//! | `type` | Sender role | Action |
//! |--------|-------------|--------|
//! | `register` | any | authenticate and install device |
//! | `attach` | any | attach operator to device |
//! | `release` | operator | detach operator |
//! | `input`, `resize`, `command` | operator | forward to the attached device |
//! | `output`, `status_update`, `recording_complete`, `upload_progress`, `heartbeat` | device | forward to attached operators |
//! | anything else | any | dropped |

// ============================================================================
// Imports
// ============================================================================

use serde::Deserialize;
use serde_json::from_str;

use crate::error::{Error, Result};
use crate::identifiers::DeviceId;

// ============================================================================
// Inbound
// ============================================================================

/// A decoded frame from a peer.
///
/// # Format
///
/// ```json
/// { "type": "register", "deviceId": "pi-7", "token": "s3cret" }
/// ```
///
/// Unknown `type` values decode to [`Inbound::Unrecognized`] so newer peers
/// never break an older relay.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Inbound {
    /// Device announces itself.
    Register {
        /// Claimed identifier.
        #[serde(rename = "deviceId")]
        device_id: DeviceId,
        /// Shared secret. Missing is treated as a failed check.
        #[serde(default)]
        token: Option<String>,
    },

    /// Operator asks to be attached to a device.
    Attach {
        /// Target device.
        #[serde(rename = "deviceId")]
        device_id: DeviceId,
    },

    /// Operator detaches from its device.
    Release,

    /// Terminal input for the device.
    Input,

    /// Terminal size change for the device.
    Resize,

    /// Device control command (`start_recording`, ...).
    Command {
        /// Requested action.
        action: String,
    },

    /// Terminal output from the device.
    Output,

    /// Device status report.
    StatusUpdate,

    /// A recording finished on the device.
    RecordingComplete,

    /// Upload progress of a recording.
    UploadProgress,

    /// Application-level device heartbeat.
    Heartbeat,

    /// Any other `type`.
    #[serde(other)]
    Unrecognized,
}

// ============================================================================
// RequiredRole
// ============================================================================

/// Role a sender must hold for a frame to be accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequiredRole {
    /// Control frames valid before a role is assigned.
    Any,
    /// Frames only an attached operator may send.
    Operator,
    /// Frames only a registered device may send.
    Device,
}

// ============================================================================
// Inbound - Decoding
// ============================================================================

impl Inbound {
    /// Decodes a text frame.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Malformed`] if the frame is not a JSON object with a
    /// string `type`, or a known type lacks a required field.
    pub fn parse(text: &str) -> Result<Self> {
        from_str(text).map_err(|e| Error::malformed(e.to_string()))
    }

    /// Returns the wire name of the message type.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Register { .. } => "register",
            Self::Attach { .. } => "attach",
            Self::Release => "release",
            Self::Input => "input",
            Self::Resize => "resize",
            Self::Command { .. } => "command",
            Self::Output => "output",
            Self::StatusUpdate => "status_update",
            Self::RecordingComplete => "recording_complete",
            Self::UploadProgress => "upload_progress",
            Self::Heartbeat => "heartbeat",
            Self::Unrecognized => "unrecognized",
        }
    }

    /// Returns the role the sender must hold.
    #[must_use]
    pub const fn required_role(&self) -> RequiredRole {
        match self {
            Self::Register { .. } | Self::Attach { .. } | Self::Unrecognized => RequiredRole::Any,
            Self::Release | Self::Input | Self::Resize | Self::Command { .. } => {
                RequiredRole::Operator
            }
            Self::Output
            | Self::StatusUpdate
            | Self::RecordingComplete
            | Self::UploadProgress
            | Self::Heartbeat => RequiredRole::Device,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
