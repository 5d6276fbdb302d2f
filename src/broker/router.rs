//! Message router.
//!
//! The [`Broker`] is what the transport talks to. It decodes each text
//! frame, checks the sender's role, consults the auth gate for `register`
//! and applies the result to the [`Registry`] under a single lock.
//!
//! # Error Replies
//!
//! | Outcome | Sender sees |
//! |---------|-------------|
//! | Auth rejected | `error` then close |
//! | Device not found, busy, already attached, not attached | `error` |
//! | Malformed frame, wrong role, unknown type, delivery failure | nothing |

// ============================================================================
// Imports
// ============================================================================

use axum::extract::ws::Utf8Bytes;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::auth::AuthGate;
use crate::config::{AttachPolicy, RelayConfig};
use crate::error::{Error, Result};
use crate::identifiers::{ConnectionId, DeviceId};
use crate::protocol::{Inbound, Outbound};
use crate::transport::Connection;

use super::registry::{Registry, Role};

// ============================================================================
// Broker
// ============================================================================

/// Routes frames between devices and operators.
///
/// Shared as `Arc<Broker>` by every connection task, the liveness monitor
/// and the shutdown coordinator.
///
/// # Example
///
/// ```ignore
/// let broker = Arc::new(Broker::new(&config));
/// broker.open(&connection);
/// broker.handle_text(&connection, text);
/// broker.disconnect(&connection);
/// ```
#[derive(Debug)]
pub struct Broker {
    auth: AuthGate,
    registry: Mutex<Registry>,
}

// ============================================================================
// Broker - Constructor
// ============================================================================

impl Broker {
    /// Creates a broker with an empty registry.
    #[must_use]
    pub fn new(config: &RelayConfig) -> Self {
        Self {
            auth: AuthGate::new(config.devices.clone()),
            registry: Mutex::new(Registry::new(config.attach_policy)),
        }
    }
}

// ============================================================================
// Broker - Connection Events
// ============================================================================

impl Broker {
    /// Starts tracking an accepted connection.
    pub fn open(&self, conn: &Connection) {
        if self.registry.lock().open(conn) {
            debug!(conn = %conn.id(), peer = ?conn.peer(), "Connection opened");
        }
    }

    /// Handles one inbound text frame.
    ///
    /// Never fails: every outcome is either routed, answered with an
    /// `error` frame, or dropped.
    pub fn handle_text(&self, conn: &Connection, text: Utf8Bytes) {
        let message = match Inbound::parse(text.as_str()) {
            Ok(message) => message,
            Err(e) => {
                debug!(conn = %conn.id(), error = %e, "Dropping malformed frame");
                return;
            }
        };

        let kind = message.kind();
        let required = message.required_role();
        let Err(e) = self.dispatch(conn, message, &text) else {
            return;
        };

        if e.is_reportable() && conn.send_outbound(&Outbound::error(&e)).is_err() {
            debug!(conn = %conn.id(), "Error reply dropped");
        }

        if e.is_fatal() {
            conn.close();
        }

        debug!(conn = %conn.id(), kind, ?required, error = %e, "Frame not routed");
    }

    /// Runs disconnect cleanup for a connection. Idempotent.
    pub fn disconnect(&self, conn: &Connection) {
        if self.registry.lock().disconnect(conn.id()) {
            debug!(conn = %conn.id(), "Connection removed from registry");
        }
    }

    /// Runs one liveness sweep, returning reclaimed connections.
    pub fn sweep(&self) -> Vec<ConnectionId> {
        self.registry.lock().sweep()
    }

    /// Asks every connection to close and refuses new ones.
    pub fn drain(&self) -> usize {
        self.registry.lock().drain()
    }
}

// ============================================================================
// Broker - Queries
// ============================================================================

impl Broker {
    /// Returns the configured attach policy.
    #[inline]
    #[must_use]
    pub fn policy(&self) -> AttachPolicy {
        self.registry.lock().policy()
    }

    /// Returns the number of tracked connections.
    #[inline]
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.registry.lock().connection_count()
    }

    /// Returns the number of online devices.
    #[inline]
    #[must_use]
    pub fn device_count(&self) -> usize {
        self.registry.lock().device_count()
    }

    /// Returns `true` if a device connection is registered under the id.
    #[inline]
    #[must_use]
    pub fn is_online(&self, device_id: &DeviceId) -> bool {
        self.registry.lock().device(device_id).is_some()
    }

    /// Returns how many operators are attached to a device.
    #[inline]
    #[must_use]
    pub fn operator_count(&self, device_id: &DeviceId) -> usize {
        self.registry.lock().operators(device_id).len()
    }

    /// Returns the role of a connection, if still tracked.
    #[inline]
    #[must_use]
    pub fn role(&self, conn: &Connection) -> Option<Role> {
        self.registry.lock().role(conn.id())
    }
}

// ============================================================================
// Broker - Dispatch
// ============================================================================

impl Broker {
    fn dispatch(&self, conn: &Connection, message: Inbound, text: &Utf8Bytes) -> Result<()> {
        let kind = message.kind();

        match message {
            Inbound::Register { device_id, token } => {
                let mut registry = self.registry.lock();

                match registry.role(conn.id()) {
                    Some(Role::Unknown) => {}
                    Some(_) => return Err(Error::WrongRole { kind }),
                    None => return Err(Error::ConnectionClosed),
                }

                if !self.auth.authenticate(&device_id, token.as_deref()).is_accepted() {
                    warn!(conn = %conn.id(), %device_id, peer = ?conn.peer(), "Device authentication rejected");
                    return Err(Error::AuthRejected);
                }

                registry.register(conn.id(), device_id)
            }

            Inbound::Attach { device_id } => self.registry.lock().attach(conn.id(), device_id),

            Inbound::Release => self.registry.lock().release(conn.id()).map(|_| ()),

            Inbound::Input | Inbound::Resize | Inbound::Command { .. } => {
                self.registry.lock().route_to_device(conn.id(), kind, text)
            }

            Inbound::Output
            | Inbound::StatusUpdate
            | Inbound::RecordingComplete
            | Inbound::UploadProgress
            | Inbound::Heartbeat => self
                .registry
                .lock()
                .route_to_operators(conn.id(), kind, text)
                .map(|_| ()),

            Inbound::Unrecognized => {
                debug!(conn = %conn.id(), "Ignoring unrecognized message type");
                Ok(())
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use axum::extract::ws::Message;
    use serde_json::{Value, json};
    use tokio::sync::mpsc;

    fn broker(policy: AttachPolicy) -> Broker {
        let config = RelayConfig::builder()
            .device("pi-7", "s3cret")
            .device("pi-8", "hunter2")
            .attach_policy(policy)
            .build()
            .expect("valid config");
        Broker::new(&config)
    }

    fn connect(broker: &Broker) -> (Connection, mpsc::Receiver<Message>) {
        let (conn, rx) = Connection::new(None, 32);
        broker.open(&conn);
        (conn, rx)
    }

    fn send(broker: &Broker, conn: &Connection, frame: Value) {
        broker.handle_text(conn, frame.to_string().into());
    }

    fn drain(rx: &mut mpsc::Receiver<Message>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(message) = rx.try_recv() {
            if let Message::Text(text) = message {
                out.push(serde_json::from_str(text.as_str()).expect("json"));
            }
        }
        out
    }

    #[test]
    fn test_register_with_valid_token() {
        let broker = broker(AttachPolicy::Broadcast);
        let (device, mut rx) = connect(&broker);

        send(&broker, &device, json!({"type": "register", "deviceId": "pi-7", "token": "s3cret"}));

        assert_eq!(drain(&mut rx), [json!({"type": "registered", "deviceId": "pi-7"})]);
        assert!(broker.is_online(&DeviceId::new("pi-7")));
        assert_eq!(broker.role(&device), Some(Role::Device));
    }

    #[test]
    fn test_register_ignored_while_draining() {
        let broker = broker(AttachPolicy::Broadcast);
        let (device, mut rx) = connect(&broker);

        assert_eq!(broker.drain(), 1);
        send(&broker, &device, json!({"type": "register", "deviceId": "pi-7", "token": "s3cret"}));

        assert!(drain(&mut rx).is_empty());
        assert!(!broker.is_online(&DeviceId::new("pi-7")));
        assert_eq!(broker.role(&device), Some(Role::Unknown));
    }

    #[test]
    fn test_auth_failures_are_indistinguishable() {
        let broker = broker(AttachPolicy::Broadcast);
        let mut replies = Vec::new();

        for frame in [
            json!({"type": "register", "deviceId": "pi-7", "token": "wrong"}),
            json!({"type": "register", "deviceId": "nobody", "token": "s3cret"}),
            json!({"type": "register", "deviceId": "pi-7"}),
            json!({"type": "register", "deviceId": "pi-7", "token": ""}),
        ] {
            let (conn, mut rx) = connect(&broker);
            send(&broker, &conn, frame);

            assert!(conn.is_closing());
            assert_eq!(broker.role(&conn), Some(Role::Unknown));
            replies.push(drain(&mut rx));
        }

        assert_eq!(broker.device_count(), 0);
        for reply in &replies {
            assert_eq!(reply, &[json!({"type": "error", "message": "authentication failed"})]);
        }
    }

    #[test]
    fn test_end_to_end_session() {
        let broker = broker(AttachPolicy::Broadcast);
        let pi7 = DeviceId::new("pi-7");
        let (device, mut device_rx) = connect(&broker);
        let (operator, mut operator_rx) = connect(&broker);

        send(&broker, &device, json!({"type": "register", "deviceId": "pi-7", "token": "s3cret"}));
        send(&broker, &operator, json!({"type": "attach", "deviceId": "pi-7"}));
        assert_eq!(drain(&mut operator_rx), [json!({"type": "attached", "deviceId": "pi-7"})]);
        drain(&mut device_rx);

        let input = json!({"type": "input", "data": "ls\n"});
        send(&broker, &operator, input.clone());
        assert_eq!(drain(&mut device_rx), [input]);

        let output = json!({"type": "output", "deviceId": "pi-7", "data": "file.txt\n"});
        send(&broker, &device, output.clone());
        assert_eq!(drain(&mut operator_rx), [output]);

        broker.disconnect(&operator);
        assert_eq!(broker.operator_count(&pi7), 0);

        broker.disconnect(&device);
        assert!(!broker.is_online(&pi7));
        assert_eq!(broker.connection_count(), 0);
    }

    #[test]
    fn test_attach_ghost_device() {
        let broker = broker(AttachPolicy::Broadcast);
        let (operator, mut rx) = connect(&broker);

        send(&broker, &operator, json!({"type": "attach", "deviceId": "ghost-device"}));

        assert_eq!(drain(&mut rx), [json!({"type": "error", "message": "device not found"})]);
        assert_eq!(broker.role(&operator), Some(Role::Unknown));
        assert!(!operator.is_closing());
    }

    #[test]
    fn test_exclusive_busy_reply() {
        let broker = broker(AttachPolicy::Exclusive);
        let (device, _device_rx) = connect(&broker);
        let (first, _first_rx) = connect(&broker);
        let (second, mut second_rx) = connect(&broker);

        send(&broker, &device, json!({"type": "register", "deviceId": "pi-7", "token": "s3cret"}));
        send(&broker, &first, json!({"type": "attach", "deviceId": "pi-7"}));
        send(&broker, &second, json!({"type": "attach", "deviceId": "pi-7"}));

        assert_eq!(drain(&mut second_rx), [json!({"type": "error", "message": "device busy"})]);
        assert_eq!(broker.operator_count(&DeviceId::new("pi-7")), 1);
        assert_eq!(broker.role(&first), Some(Role::Operator));
    }

    #[test]
    fn test_device_events_reach_operators() {
        let broker = broker(AttachPolicy::Exclusive);
        let (device, _device_rx) = connect(&broker);
        let (operator, mut operator_rx) = connect(&broker);

        send(&broker, &device, json!({"type": "register", "deviceId": "pi-7", "token": "s3cret"}));
        send(&broker, &operator, json!({"type": "attach", "deviceId": "pi-7"}));
        drain(&mut operator_rx);

        let events = [
            json!({"type": "status_update", "data": {"recording": false}}),
            json!({"type": "recording_complete", "data": {"file": "a.mp4"}}),
            json!({"type": "upload_progress", "data": 0.5}),
            json!({"type": "heartbeat"}),
        ];
        for event in &events {
            send(&broker, &device, event.clone());
        }

        assert_eq!(drain(&mut operator_rx), events);
    }

    #[test]
    fn test_wrong_role_and_garbage_are_silent() {
        let broker = broker(AttachPolicy::Broadcast);
        let (device, mut device_rx) = connect(&broker);
        let (idle, mut idle_rx) = connect(&broker);

        send(&broker, &device, json!({"type": "register", "deviceId": "pi-7", "token": "s3cret"}));
        drain(&mut device_rx);

        // Device sending operator-only frames
        send(&broker, &device, json!({"type": "input", "data": "x"}));
        send(&broker, &device, json!({"type": "release"}));
        // Re-register from an established device
        send(&broker, &device, json!({"type": "register", "deviceId": "pi-8", "token": "hunter2"}));
        // Role-less connection sending device events, unknown and broken frames
        send(&broker, &idle, json!({"type": "output", "data": "x"}));
        send(&broker, &idle, json!({"type": "firmware_v9"}));
        broker.handle_text(&idle, String::from("{not json").into());
        broker.handle_text(&idle, String::from(r#"{"type":"attach"}"#).into());

        assert!(drain(&mut device_rx).is_empty());
        assert!(drain(&mut idle_rx).is_empty());
        assert!(!device.is_closing());
        assert!(!idle.is_closing());
        assert!(!broker.is_online(&DeviceId::new("pi-8")));
    }

    #[test]
    fn test_operator_errors_are_reported() {
        let broker = broker(AttachPolicy::Broadcast);
        let (device, _device_rx) = connect(&broker);
        let (operator, mut rx) = connect(&broker);

        send(&broker, &device, json!({"type": "register", "deviceId": "pi-7", "token": "s3cret"}));
        send(&broker, &operator, json!({"type": "attach", "deviceId": "pi-7"}));
        send(&broker, &operator, json!({"type": "attach", "deviceId": "pi-7"}));
        send(&broker, &operator, json!({"type": "release"}));
        send(&broker, &operator, json!({"type": "release"}));
        send(&broker, &operator, json!({"type": "command", "action": "reboot"}));

        let replies = drain(&mut rx);
        assert_eq!(replies.len(), 4);
        assert_eq!(replies[0]["type"], "attached");
        assert_eq!(replies[1], json!({"type": "error", "message": "already attached to pi-7"}));
        assert_eq!(replies[2], json!({"type": "error", "message": "not attached"}));
        assert_eq!(replies[3], json!({"type": "error", "message": "not attached"}));
    }

    #[test]
    fn test_input_to_offline_device_reports_not_found() {
        let broker = broker(AttachPolicy::Broadcast);
        let (device, _device_rx) = connect(&broker);
        let (operator, mut rx) = connect(&broker);

        send(&broker, &device, json!({"type": "register", "deviceId": "pi-7", "token": "s3cret"}));
        send(&broker, &operator, json!({"type": "attach", "deviceId": "pi-7"}));
        broker.disconnect(&device);
        send(&broker, &operator, json!({"type": "resize", "cols": 80, "rows": 24}));

        let replies = drain(&mut rx);
        assert_eq!(
            replies,
            [
                json!({"type": "attached", "deviceId": "pi-7"}),
                json!({"type": "device-offline", "deviceId": "pi-7"}),
                json!({"type": "error", "message": "device not found"}),
            ]
        );
    }

    #[test]
    fn test_reregister_supersedes_old_connection() {
        let broker = broker(AttachPolicy::Broadcast);
        let (old, _old_rx) = connect(&broker);
        let (new, mut new_rx) = connect(&broker);
        let (operator, mut operator_rx) = connect(&broker);

        send(&broker, &old, json!({"type": "register", "deviceId": "pi-7", "token": "s3cret"}));
        send(&broker, &operator, json!({"type": "attach", "deviceId": "pi-7"}));
        drain(&mut operator_rx);

        send(&broker, &new, json!({"type": "register", "deviceId": "pi-7", "token": "s3cret"}));
        assert!(old.is_closing());
        assert_eq!(drain(&mut new_rx)[0]["type"], "registered");
        assert_eq!(
            drain(&mut operator_rx),
            [
                json!({"type": "device-offline", "deviceId": "pi-7"}),
                json!({"type": "device-online", "deviceId": "pi-7"}),
            ]
        );

        // Cleanup from the old socket must not evict the new device
        broker.disconnect(&old);
        assert!(broker.is_online(&DeviceId::new("pi-7")));
    }
}
