//! Plain HTTP health responder.
//!
//! The relay listens on a single port. Requests that are not WebSocket
//! upgrades get a fixed `200 OK` so load balancers and uptime checks can
//! probe the process without speaking WebSocket. The response says nothing
//! about individual devices.

// ============================================================================
// Imports
// ============================================================================

use axum::http::StatusCode;
use axum::response::IntoResponse;

// ============================================================================
// Constants
// ============================================================================

/// Body returned to health checks.
pub const HEALTH_BODY: &str = "Relay alive";

// ============================================================================
// Handler
// ============================================================================

/// Answers a health check.
pub async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, HEALTH_BODY)
}

// ============================================================================
// Tests
// ============================================================================
