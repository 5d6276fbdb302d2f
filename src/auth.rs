//! Device authentication gate.
//!
//! Validates a device's claimed identifier and secret against the table
//! loaded at startup. The gate has no side effects; closing a rejected
//! connection is the router's job.

// ============================================================================
// Imports
// ============================================================================

use rustc_hash::FxHashMap;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::config::DeviceTable;
use crate::identifiers::DeviceId;

// ============================================================================
// AuthDecision
// ============================================================================

/// Outcome of a device authentication attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthDecision {
    /// Identifier known and secret matches exactly.
    Accepted,
    /// Anything else. Carries no reason on purpose.
    Rejected,
}

impl AuthDecision {
    /// Returns `true` if the device may register.
    #[inline]
    #[must_use]
    pub const fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted)
    }
}

// ============================================================================
// AuthGate
// ============================================================================

/// SHA-256 digest of a secret.
type SecretDigest = [u8; 32];

/// Read-only credential table for devices.
///
/// Only digests of the configured secrets are kept. Every check compares two
/// 32-byte digests, so timing reveals neither the content nor the length of
/// the expected secret.
#[derive(Clone, Default)]
pub struct AuthGate {
    digests: FxHashMap<DeviceId, SecretDigest>,
}

impl AuthGate {
    /// Creates a gate over a fixed credential table.
    #[must_use]
    pub fn new(secrets: DeviceTable) -> Self {
        let digests = secrets
            .into_iter()
            .map(|(device_id, secret)| (device_id, digest(&secret)))
            .collect();
        Self { digests }
    }

    /// Returns the number of known devices.
    #[inline]
    #[must_use]
    pub fn device_count(&self) -> usize {
        self.digests.len()
    }

    /// Checks a presented secret for a device.
    ///
    /// Unknown identifiers still go through a full comparison so the
    /// response time does not reveal which half failed.
    #[must_use]
    pub fn authenticate(&self, device_id: &DeviceId, presented: Option<&str>) -> AuthDecision {
        let presented = presented.unwrap_or_default();
        let presented_digest = digest(presented);
        let expected = self.digests.get(device_id);

        // Unknown devices compare against a digest that never matches a
        // non-empty secret
        let secret_matches =
            digests_match(&presented_digest, expected.unwrap_or(&EMPTY_DIGEST));

        if expected.is_some() && !presented.is_empty() && secret_matches {
            AuthDecision::Accepted
        } else {
            debug!(device_id = %device_id, "Device credentials rejected");
            AuthDecision::Rejected
        }
    }
}

impl std::fmt::Debug for AuthGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthGate")
            .field("device_count", &self.digests.len())
            .finish()
    }
}

/// Digest of the empty string.
const EMPTY_DIGEST: SecretDigest = [
    0xe3, 0xb0, 0xc4, 0x42, 0x98, 0xfc, 0x1c, 0x14, 0x9a, 0xfb, 0xf4, 0xc8, 0x99, 0x6f, 0xb9, 0x24,
    0x27, 0xae, 0x41, 0xe4, 0x64, 0x9b, 0x93, 0x4c, 0xa4, 0x95, 0x99, 0x1b, 0x78, 0x52, 0xb8, 0x55,
];

fn digest(secret: &str) -> SecretDigest {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(secret.as_bytes()));
    out
}

/// Constant-time comparison of two digests.
fn digests_match(a: &SecretDigest, b: &SecretDigest) -> bool {
    let mut diff: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

// ============================================================================
// Tests
// ============================================================================
