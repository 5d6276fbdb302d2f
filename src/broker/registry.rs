//! Session registry.
//!
//! Single source of truth for who is connected, which connection speaks for
//! each device, and which operators are attached to it.
//!
//! # State
//!
//! | Map | Key | Value |
//! |-----|-----|-------|
//! | `sessions` | [`ConnectionId`] | handle, role, device |
//! | `devices` | [`DeviceId`] | the authoritative device connection |
//! | `operators` | [`DeviceId`] | attached operator connections, in attach order |
//!
//! Operator attachments are keyed by device identifier, not by device
//! connection, so they survive a device going offline or being superseded.
//!
//! Every operation takes `&mut self`; callers serialize access (the
//! [`Broker`](super::Broker) holds the registry behind one mutex). Outbound
//! notifications are queued while the caller holds that lock, which keeps
//! `device-offline` ahead of the matching `device-online`.

// ============================================================================
// Imports
// ============================================================================

use axum::extract::ws::Utf8Bytes;
use rustc_hash::FxHashMap;
use tracing::{debug, info, trace, warn};

use crate::config::AttachPolicy;
use crate::error::{Error, Result};
use crate::identifiers::{ConnectionId, DeviceId};
use crate::protocol::Outbound;
use crate::transport::Connection;

// ============================================================================
// Role
// ============================================================================

/// Role of a connection. Set once, never changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    /// Neither registered nor attached yet.
    #[default]
    Unknown,
    /// Registered device.
    Device,
    /// Operator that has attached at least once.
    Operator,
}

// ============================================================================
// Session
// ============================================================================

/// Per-connection registry entry.
#[derive(Debug)]
struct Session {
    conn: Connection,
    role: Role,
    /// Own identifier for devices, attach target for operators.
    device_id: Option<DeviceId>,
}

// ============================================================================
// Registry
// ============================================================================

/// Device and operator bookkeeping.
#[derive(Debug)]
pub struct Registry {
    policy: AttachPolicy,
    sessions: FxHashMap<ConnectionId, Session>,
    devices: FxHashMap<DeviceId, ConnectionId>,
    operators: FxHashMap<DeviceId, Vec<ConnectionId>>,
    draining: bool,
}

// ============================================================================
// Registry - Constructor
// ============================================================================

impl Registry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new(policy: AttachPolicy) -> Self {
        Self {
            policy,
            sessions: FxHashMap::default(),
            devices: FxHashMap::default(),
            operators: FxHashMap::default(),
            draining: false,
        }
    }
}

// ============================================================================
// Registry - Transitions
// ============================================================================

impl Registry {
    /// Tracks a newly accepted connection with no role.
    ///
    /// Returns `false` (and closes the connection) once draining has begun.
    pub fn open(&mut self, conn: &Connection) -> bool {
        if self.draining {
            debug!(conn = %conn.id(), "Rejecting connection during drain");
            conn.close();
            return false;
        }

        self.sessions.insert(
            conn.id(),
            Session {
                conn: conn.clone(),
                role: Role::Unknown,
                device_id: None,
            },
        );
        true
    }

    /// Installs `conn_id` as the device connection for `device_id`.
    ///
    /// Credentials must already have been checked. A previous connection for
    /// the same identifier is removed, its operators are told
    /// `device-offline`, and it is closed before the new one is installed.
    ///
    /// # Errors
    ///
    /// - [`Error::ConnectionClosed`] if the connection is not tracked or the
    ///   registry is draining
    /// - [`Error::WrongRole`] if the connection already has a role
    pub fn register(&mut self, conn_id: ConnectionId, device_id: DeviceId) -> Result<()> {
        if self.draining {
            debug!(conn = %conn_id, %device_id, "Registration refused while draining");
            return Err(Error::ConnectionClosed);
        }

        let session = self.sessions.get(&conn_id).ok_or(Error::ConnectionClosed)?;
        if session.role != Role::Unknown {
            return Err(Error::WrongRole { kind: "register" });
        }

        if let Some(previous_id) = self.devices.remove(&device_id)
            && let Some(previous) = self.sessions.remove(&previous_id)
        {
            info!(
                %device_id,
                old = %previous_id,
                new = %conn_id,
                "Device connection superseded"
            );
            self.notify_operators(&device_id, &Outbound::DeviceOffline {
                device_id: device_id.clone(),
            });
            previous.conn.close();
        }

        let Some(session) = self.sessions.get_mut(&conn_id) else {
            return Err(Error::ConnectionClosed);
        };
        session.role = Role::Device;
        session.device_id = Some(device_id.clone());
        if session
            .conn
            .send_outbound(&Outbound::Registered {
                device_id: device_id.clone(),
            })
            .is_err()
        {
            trace!(conn = %conn_id, "Registration acknowledgement dropped");
        }

        self.devices.insert(device_id.clone(), conn_id);
        info!(conn = %conn_id, %device_id, "Device registered");

        self.notify_operators(&device_id, &Outbound::DeviceOnline {
            device_id: device_id.clone(),
        });

        Ok(())
    }

    /// Attaches an operator connection to a live device.
    ///
    /// # Errors
    ///
    /// - [`Error::ConnectionClosed`] if the connection is not tracked
    /// - [`Error::WrongRole`] if the connection is a device
    /// - [`Error::AlreadyAttached`] if the operator must release first
    /// - [`Error::DeviceNotFound`] if no device is registered under the id
    /// - [`Error::DeviceBusy`] under the exclusive policy when taken
    pub fn attach(&mut self, conn_id: ConnectionId, device_id: DeviceId) -> Result<()> {
        let session = self.sessions.get(&conn_id).ok_or(Error::ConnectionClosed)?;

        match (session.role, &session.device_id) {
            (Role::Device, _) => return Err(Error::WrongRole { kind: "attach" }),
            (Role::Operator, Some(current)) => return Err(Error::already_attached(current.clone())),
            _ => {}
        }

        if !self.devices.contains_key(&device_id) {
            return Err(Error::device_not_found(device_id));
        }

        let attached = self.operators.entry(device_id.clone()).or_default();
        if self.policy == AttachPolicy::Exclusive && !attached.is_empty() {
            return Err(Error::device_busy(device_id));
        }
        attached.push(conn_id);

        let Some(session) = self.sessions.get_mut(&conn_id) else {
            return Err(Error::ConnectionClosed);
        };
        session.role = Role::Operator;
        session.device_id = Some(device_id.clone());
        if session
            .conn
            .send_outbound(&Outbound::Attached {
                device_id: device_id.clone(),
            })
            .is_err()
        {
            trace!(conn = %conn_id, "Attach acknowledgement dropped");
        }

        info!(conn = %conn_id, %device_id, policy = %self.policy, "Operator attached");
        Ok(())
    }

    /// Detaches an operator, returning the device it was attached to.
    ///
    /// # Errors
    ///
    /// - [`Error::ConnectionClosed`] if the connection is not tracked
    /// - [`Error::WrongRole`] if the connection is not an operator
    /// - [`Error::NotAttached`] if the operator already released
    pub fn release(&mut self, conn_id: ConnectionId) -> Result<DeviceId> {
        let session = self
            .sessions
            .get_mut(&conn_id)
            .ok_or(Error::ConnectionClosed)?;
        if session.role != Role::Operator {
            return Err(Error::WrongRole { kind: "release" });
        }

        let device_id = session.device_id.take().ok_or(Error::NotAttached)?;
        self.detach_operator(&device_id, conn_id);

        info!(conn = %conn_id, %device_id, "Operator released");
        Ok(device_id)
    }

    /// Removes every trace of a connection.
    ///
    /// Returns `false` if the connection was already gone.
    pub fn disconnect(&mut self, conn_id: ConnectionId) -> bool {
        let Some(session) = self.sessions.remove(&conn_id) else {
            return false;
        };

        match (session.role, session.device_id) {
            (Role::Device, Some(device_id)) => {
                // A superseded connection must not evict its replacement
                if self.devices.get(&device_id) == Some(&conn_id) {
                    self.devices.remove(&device_id);
                    info!(conn = %conn_id, %device_id, "Device offline");
                    self.notify_operators(&device_id, &Outbound::DeviceOffline { device_id: device_id.clone() });
                }
            }
            (Role::Operator, Some(device_id)) => {
                self.detach_operator(&device_id, conn_id);
                info!(conn = %conn_id, %device_id, "Operator disconnected");
            }
            _ => debug!(conn = %conn_id, "Connection closed before taking a role"),
        }

        true
    }

    /// Runs one liveness sweep.
    ///
    /// Connections that missed the previous probe are disconnected and
    /// closed; the rest are marked unanswered and probed again. Returns the
    /// reclaimed connection IDs.
    pub fn sweep(&mut self) -> Vec<ConnectionId> {
        let dead: Vec<Connection> = self
            .sessions
            .values()
            .filter(|session| !session.conn.is_alive())
            .map(|session| session.conn.clone())
            .collect();

        for conn in &dead {
            self.disconnect(conn.id());
            conn.close();
        }

        for session in self.sessions.values() {
            session.conn.clear_alive();
            if session.conn.probe().is_err() {
                trace!(conn = %session.conn.id(), "Connection closing, probe skipped");
            }
        }

        dead.iter().map(Connection::id).collect()
    }

    /// Stops accepting new connections and asks every open one to close.
    ///
    /// Entries are removed by each connection's own disconnect cleanup.
    /// Returns the number of connections asked to close.
    pub fn drain(&mut self) -> usize {
        self.draining = true;
        for session in self.sessions.values() {
            session.conn.close();
        }
        self.sessions.len()
    }
}

// ============================================================================
// Registry - Routing
// ============================================================================

impl Registry {
    /// Forwards an operator frame to its attached device.
    ///
    /// Delivery is best-effort: a closing or saturated device drops it.
    ///
    /// # Errors
    ///
    /// - [`Error::ConnectionClosed`] if the sender is not tracked
    /// - [`Error::WrongRole`] if the sender is not an operator
    /// - [`Error::NotAttached`] if the operator released
    /// - [`Error::DeviceNotFound`] if the device is offline
    pub fn route_to_device(
        &self,
        conn_id: ConnectionId,
        kind: &'static str,
        text: &Utf8Bytes,
    ) -> Result<()> {
        let session = self.sessions.get(&conn_id).ok_or(Error::ConnectionClosed)?;
        if session.role != Role::Operator {
            return Err(Error::WrongRole { kind });
        }

        let device_id = session.device_id.as_ref().ok_or(Error::NotAttached)?;
        let target = self
            .devices
            .get(device_id)
            .and_then(|id| self.sessions.get(id))
            .ok_or_else(|| Error::device_not_found(device_id.clone()))?;

        match target.conn.forward(text) {
            Ok(()) => trace!(from = %conn_id, to = %target.conn.id(), kind, "Forwarded to device"),
            Err(_) => debug!(from = %conn_id, %device_id, kind, "Device unavailable, frame dropped"),
        }
        Ok(())
    }

    /// Forwards a device frame to every attached operator.
    ///
    /// Returns how many operators the frame was queued for.
    ///
    /// # Errors
    ///
    /// - [`Error::ConnectionClosed`] if the sender is not tracked
    /// - [`Error::WrongRole`] if the sender is not a device
    pub fn route_to_operators(
        &self,
        conn_id: ConnectionId,
        kind: &'static str,
        text: &Utf8Bytes,
    ) -> Result<usize> {
        let session = self.sessions.get(&conn_id).ok_or(Error::ConnectionClosed)?;
        let (Role::Device, Some(device_id)) = (session.role, &session.device_id) else {
            return Err(Error::WrongRole { kind });
        };

        let delivered = self
            .operator_sessions(device_id)
            .filter(|operator| operator.conn.forward(text).is_ok())
            .count();

        trace!(from = %conn_id, %device_id, kind, delivered, "Forwarded to operators");
        Ok(delivered)
    }
}

// ============================================================================
// Registry - Queries
// ============================================================================

impl Registry {
    /// Returns the attach policy.
    #[inline]
    #[must_use]
    pub const fn policy(&self) -> AttachPolicy {
        self.policy
    }

    /// Returns `true` once [`Self::drain`] has run.
    #[inline]
    #[must_use]
    pub const fn is_draining(&self) -> bool {
        self.draining
    }

    /// Returns the number of tracked connections.
    #[inline]
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.sessions.len()
    }

    /// Returns the number of online devices.
    #[inline]
    #[must_use]
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Returns the connection currently speaking for a device.
    #[inline]
    #[must_use]
    pub fn device(&self, device_id: &DeviceId) -> Option<ConnectionId> {
        self.devices.get(device_id).copied()
    }

    /// Returns the operators attached to a device, in attach order.
    #[must_use]
    pub fn operators(&self, device_id: &DeviceId) -> &[ConnectionId] {
        self.operators.get(device_id).map_or(&[], Vec::as_slice)
    }

    /// Returns the role of a tracked connection.
    #[inline]
    #[must_use]
    pub fn role(&self, conn_id: ConnectionId) -> Option<Role> {
        self.sessions.get(&conn_id).map(|session| session.role)
    }

    /// Returns the device a connection represents or is attached to.
    #[inline]
    #[must_use]
    pub fn attached_device(&self, conn_id: ConnectionId) -> Option<&DeviceId> {
        self.sessions
            .get(&conn_id)
            .and_then(|session| session.device_id.as_ref())
    }
}

// ============================================================================
// Registry - Internal
// ============================================================================

impl Registry {
    fn operator_sessions<'a>(&'a self, device_id: &DeviceId) -> impl Iterator<Item = &'a Session> + 'a {
        self.operators(device_id)
            .iter()
            .filter_map(|id| self.sessions.get(id))
    }

    fn notify_operators(&self, device_id: &DeviceId, notice: &Outbound) {
        let frame = match notice.to_message() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(%device_id, error = %e, "Failed to encode presence notice");
                return;
            }
        };

        for operator in self.operator_sessions(device_id) {
            if operator.conn.send(frame.clone()).is_err() {
                trace!(conn = %operator.conn.id(), "Presence notice dropped");
            }
        }
    }

    fn detach_operator(&mut self, device_id: &DeviceId, conn_id: ConnectionId) {
        if let Some(attached) = self.operators.get_mut(device_id) {
            attached.retain(|id| *id != conn_id);
            if attached.is_empty() {
                self.operators.remove(device_id);
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

    use std::time::Duration;

    use axum::extract::ws::Message;
    use proptest::prelude::*;
    use serde_json::Value;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    struct Peer {
        conn: Connection,
        rx: mpsc::Receiver<Message>,
    }

    impl Peer {
        fn open(registry: &mut Registry) -> Self {
            let (conn, rx) = Connection::new(None, 64);
            assert!(registry.open(&conn));
            Self { conn, rx }
        }

        fn id(&self) -> ConnectionId {
            self.conn.id()
        }

        /// Drains queued text frames as JSON values.
        fn frames(&mut self) -> Vec<Value> {
            let mut out = Vec::new();
            while let Ok(message) = self.rx.try_recv() {
                if let Message::Text(text) = message {
                    out.push(serde_json::from_str(text.as_str()).expect("json frame"));
                }
            }
            out
        }

        fn frame_types(&mut self) -> Vec<String> {
            self.frames()
                .into_iter()
                .map(|v| v["type"].as_str().unwrap_or_default().to_string())
                .collect()
        }
    }

    fn text(raw: &str) -> Utf8Bytes {
        String::from(raw).into()
    }

    fn pi7() -> DeviceId {
        DeviceId::new("pi-7")
    }

    impl Registry {
        /// Asserts the structural invariants between the three maps.
        fn check_invariants(&self) {
            for (device_id, conn_id) in &self.devices {
                let session = self.sessions.get(conn_id).expect("device has session");
                assert_eq!(session.role, Role::Device);
                assert_eq!(session.device_id.as_ref(), Some(device_id));
            }

            for (conn_id, session) in &self.sessions {
                match (session.role, &session.device_id) {
                    (Role::Device, Some(device_id)) => {
                        assert_eq!(self.devices.get(device_id), Some(conn_id));
                    }
                    (Role::Device, None) => panic!("device without identifier"),
                    (Role::Operator, Some(device_id)) => {
                        let attached = self.operators(device_id);
                        assert_eq!(attached.iter().filter(|id| *id == conn_id).count(), 1);
                    }
                    (Role::Unknown, Some(_)) => panic!("unknown role with device"),
                    _ => {}
                }
            }

            for (device_id, attached) in &self.operators {
                assert!(!attached.is_empty(), "empty operator set kept");
                if self.policy == AttachPolicy::Exclusive {
                    assert!(attached.len() <= 1);
                }
                for conn_id in attached {
                    let session = self.sessions.get(conn_id).expect("operator has session");
                    assert_eq!(session.role, Role::Operator);
                    assert_eq!(session.device_id.as_ref(), Some(device_id));
                }
            }
        }
    }

    #[test]
    fn test_register_acknowledges_device() {
        let mut registry = Registry::new(AttachPolicy::Broadcast);
        let mut device = Peer::open(&mut registry);

        registry.register(device.id(), pi7()).expect("register");

        assert_eq!(registry.device(&pi7()), Some(device.id()));
        assert_eq!(registry.role(device.id()), Some(Role::Device));
        let frames = device.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["type"], "registered");
        assert_eq!(frames[0]["deviceId"], "pi-7");
        registry.check_invariants();
    }

    #[test]
    fn test_register_twice_from_same_connection_is_rejected() {
        let mut registry = Registry::new(AttachPolicy::Broadcast);
        let device = Peer::open(&mut registry);

        registry.register(device.id(), pi7()).expect("register");
        let err = registry
            .register(device.id(), DeviceId::new("pi-8"))
            .expect_err("role is fixed");

        assert!(matches!(err, Error::WrongRole { .. }));
        assert_eq!(registry.device(&DeviceId::new("pi-8")), None);
        registry.check_invariants();
    }

    #[test]
    fn test_supersede_notifies_offline_then_online() {
        let mut registry = Registry::new(AttachPolicy::Broadcast);
        let old = Peer::open(&mut registry);
        let new = Peer::open(&mut registry);
        let mut operator = Peer::open(&mut registry);

        registry.register(old.id(), pi7()).expect("register");
        registry.attach(operator.id(), pi7()).expect("attach");
        operator.frames();

        registry.register(new.id(), pi7()).expect("supersede");

        assert!(old.conn.is_closing());
        assert_eq!(registry.role(old.id()), None);
        assert_eq!(registry.device(&pi7()), Some(new.id()));
        assert_eq!(operator.frame_types(), ["device-offline", "device-online"]);
        assert_eq!(registry.operators(&pi7()), [operator.id()]);
        registry.check_invariants();
    }

    #[test]
    fn test_superseded_disconnect_keeps_replacement() {
        let mut registry = Registry::new(AttachPolicy::Broadcast);
        let old = Peer::open(&mut registry);
        let new = Peer::open(&mut registry);
        let mut operator = Peer::open(&mut registry);

        registry.register(old.id(), pi7()).expect("register");
        registry.register(new.id(), pi7()).expect("supersede");
        registry.attach(operator.id(), pi7()).expect("attach");
        operator.frames();

        // Late cleanup from the superseded socket's event loop
        assert!(!registry.disconnect(old.id()));

        assert_eq!(registry.device(&pi7()), Some(new.id()));
        assert!(operator.frames().is_empty());
        registry.check_invariants();
    }

    #[test]
    fn test_attach_unknown_device_leaves_role_unset() {
        let mut registry = Registry::new(AttachPolicy::Broadcast);
        let operator = Peer::open(&mut registry);

        let err = registry
            .attach(operator.id(), DeviceId::new("ghost-device"))
            .expect_err("not found");

        assert!(matches!(err, Error::DeviceNotFound { .. }));
        assert_eq!(err.client_message(), "device not found");
        assert_eq!(registry.role(operator.id()), Some(Role::Unknown));
        assert!(registry.operators(&DeviceId::new("ghost-device")).is_empty());
        registry.check_invariants();
    }

    #[test]
    fn test_exclusive_policy_rejects_second_operator() {
        let mut registry = Registry::new(AttachPolicy::Exclusive);
        let device = Peer::open(&mut registry);
        let first = Peer::open(&mut registry);
        let second = Peer::open(&mut registry);

        registry.register(device.id(), pi7()).expect("register");
        registry.attach(first.id(), pi7()).expect("attach");
        let err = registry.attach(second.id(), pi7()).expect_err("busy");

        assert!(matches!(err, Error::DeviceBusy { .. }));
        assert_eq!(registry.operators(&pi7()), [first.id()]);
        assert_eq!(registry.role(second.id()), Some(Role::Unknown));
        registry.check_invariants();
    }

    #[test]
    fn test_broadcast_policy_fans_out_in_order() {
        let mut registry = Registry::new(AttachPolicy::Broadcast);
        let device = Peer::open(&mut registry);
        let mut operators: Vec<Peer> = (0..3).map(|_| Peer::open(&mut registry)).collect();

        registry.register(device.id(), pi7()).expect("register");
        for operator in &mut operators {
            registry.attach(operator.id(), pi7()).expect("attach");
            operator.frames();
        }

        for n in 0..5 {
            let frame = text(&format!(r#"{{"type":"output","data":"{n}"}}"#));
            let delivered = registry
                .route_to_operators(device.id(), "output", &frame)
                .expect("route");
            assert_eq!(delivered, 3);
        }

        for operator in &mut operators {
            let data: Vec<String> = operator
                .frames()
                .iter()
                .map(|v| v["data"].as_str().unwrap_or_default().to_string())
                .collect();
            assert_eq!(data, ["0", "1", "2", "3", "4"]);
        }
    }

    #[test]
    fn test_already_attached_must_release_first() {
        let mut registry = Registry::new(AttachPolicy::Broadcast);
        let a = Peer::open(&mut registry);
        let b = Peer::open(&mut registry);
        let operator = Peer::open(&mut registry);

        registry.register(a.id(), DeviceId::new("a")).expect("register");
        registry.register(b.id(), DeviceId::new("b")).expect("register");
        registry.attach(operator.id(), DeviceId::new("a")).expect("attach");

        let err = registry
            .attach(operator.id(), DeviceId::new("b"))
            .expect_err("must release");
        assert!(matches!(err, Error::AlreadyAttached { .. }));

        assert_eq!(registry.release(operator.id()).expect("release"), DeviceId::new("a"));
        registry.attach(operator.id(), DeviceId::new("b")).expect("re-attach");
        assert_eq!(registry.operators(&DeviceId::new("b")), [operator.id()]);
        assert!(registry.operators(&DeviceId::new("a")).is_empty());
        registry.check_invariants();
    }

    #[test]
    fn test_release_without_attachment() {
        let mut registry = Registry::new(AttachPolicy::Broadcast);
        let device = Peer::open(&mut registry);
        let operator = Peer::open(&mut registry);

        assert!(matches!(
            registry.release(operator.id()),
            Err(Error::WrongRole { .. })
        ));

        registry.register(device.id(), pi7()).expect("register");
        registry.attach(operator.id(), pi7()).expect("attach");
        registry.release(operator.id()).expect("release");

        assert!(matches!(registry.release(operator.id()), Err(Error::NotAttached)));
        assert_eq!(registry.role(operator.id()), Some(Role::Operator));
    }

    #[test]
    fn test_device_cannot_attach() {
        let mut registry = Registry::new(AttachPolicy::Broadcast);
        let device = Peer::open(&mut registry);

        registry.register(device.id(), pi7()).expect("register");
        let err = registry.attach(device.id(), pi7()).expect_err("wrong role");
        assert!(matches!(err, Error::WrongRole { kind: "attach" }));
    }

    #[test]
    fn test_route_to_device() {
        let mut registry = Registry::new(AttachPolicy::Broadcast);
        let mut device = Peer::open(&mut registry);
        let operator = Peer::open(&mut registry);
        let idle = Peer::open(&mut registry);

        registry.register(device.id(), pi7()).expect("register");
        registry.attach(operator.id(), pi7()).expect("attach");
        device.frames();

        let input = text(r#"{"type":"input","data":"ls\n"}"#);
        registry
            .route_to_device(operator.id(), "input", &input)
            .expect("route");
        let frames = device.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["data"], "ls\n");

        let err = registry
            .route_to_device(idle.id(), "input", &input)
            .expect_err("no role");
        assert!(matches!(err, Error::WrongRole { .. }));

        let err = registry
            .route_to_device(device.id(), "input", &input)
            .expect_err("device cannot send input");
        assert!(!err.is_reportable());
    }

    #[test]
    fn test_operator_survives_device_offline() {
        let mut registry = Registry::new(AttachPolicy::Broadcast);
        let device = Peer::open(&mut registry);
        let mut operator = Peer::open(&mut registry);

        registry.register(device.id(), pi7()).expect("register");
        registry.attach(operator.id(), pi7()).expect("attach");
        operator.frames();

        assert!(registry.disconnect(device.id()));
        assert_eq!(operator.frame_types(), ["device-offline"]);
        assert_eq!(registry.operators(&pi7()), [operator.id()]);

        let err = registry
            .route_to_device(operator.id(), "input", &text(r#"{"type":"input"}"#))
            .expect_err("device offline");
        assert!(matches!(err, Error::DeviceNotFound { .. }));

        let returning = Peer::open(&mut registry);
        registry.register(returning.id(), pi7()).expect("register");
        assert_eq!(operator.frame_types(), ["device-online"]);
        registry.check_invariants();
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let mut registry = Registry::new(AttachPolicy::Broadcast);
        let device = Peer::open(&mut registry);
        let operator = Peer::open(&mut registry);

        registry.register(device.id(), pi7()).expect("register");
        registry.attach(operator.id(), pi7()).expect("attach");

        assert!(registry.disconnect(operator.id()));
        assert!(registry.operators(&pi7()).is_empty());
        let connections = registry.connection_count();

        assert!(!registry.disconnect(operator.id()));
        assert_eq!(registry.connection_count(), connections);
        assert!(registry.operators(&pi7()).is_empty());

        assert!(registry.disconnect(device.id()));
        assert!(!registry.disconnect(device.id()));
        assert_eq!(registry.device(&pi7()), None);
        assert_eq!(registry.connection_count(), 0);
    }

    async fn probed(conn: &Connection) -> bool {
        timeout(Duration::from_millis(50), conn.probe_requested())
            .await
            .is_ok()
    }

    #[tokio::test]
    async fn test_sweep_reclaims_after_two_intervals() {
        let mut registry = Registry::new(AttachPolicy::Broadcast);
        let mut device = Peer::open(&mut registry);
        let mut responsive = Peer::open(&mut registry);

        registry.register(device.id(), pi7()).expect("register");
        registry.attach(responsive.id(), pi7()).expect("attach");
        device.frames();
        responsive.frames();

        // First sweep: everyone probed
        assert!(registry.sweep().is_empty());
        assert!(probed(&device.conn).await);
        assert!(probed(&responsive.conn).await);

        // Only the operator answers
        responsive.conn.mark_alive();

        let reclaimed = registry.sweep();
        assert_eq!(reclaimed, [device.id()]);
        assert!(device.conn.is_closing());
        assert_eq!(registry.device(&pi7()), None);
        assert_eq!(registry.role(device.id()), None);
        assert_eq!(registry.operators(&pi7()), [responsive.id()]);
        registry.check_invariants();
    }

    #[tokio::test]
    async fn test_sweep_probes_connection_with_full_queue() {
        let mut registry = Registry::new(AttachPolicy::Broadcast);
        let (conn, mut rx) = Connection::new(None, 1);
        assert!(registry.open(&conn));
        conn.send(Message::Text(String::from("busy").into()))
            .expect("queued");

        assert!(registry.sweep().is_empty());
        assert!(probed(&conn).await);

        // Peer drains its queue and answers the probe
        assert!(matches!(rx.recv().await, Some(Message::Text(_))));
        conn.mark_alive();

        assert!(registry.sweep().is_empty());
        assert!(!conn.is_closing());
        assert_eq!(registry.connection_count(), 1);
    }

    #[test]
    fn test_register_refused_while_draining() {
        let mut registry = Registry::new(AttachPolicy::Broadcast);
        let device = Peer::open(&mut registry);
        let mut operator = Peer::open(&mut registry);

        registry.drain();

        let err = registry
            .register(device.id(), pi7())
            .expect_err("draining");
        assert!(matches!(err, Error::ConnectionClosed));
        assert_eq!(registry.device(&pi7()), None);
        assert_eq!(registry.role(device.id()), Some(Role::Unknown));
        assert!(operator.frames().is_empty());
        registry.check_invariants();
    }

    #[test]
    fn test_drain_closes_everything_and_refuses_new() {
        let mut registry = Registry::new(AttachPolicy::Broadcast);
        let a = Peer::open(&mut registry);
        let b = Peer::open(&mut registry);

        assert_eq!(registry.drain(), 2);
        assert!(registry.is_draining());
        assert!(a.conn.is_closing());
        assert!(b.conn.is_closing());

        let (late, _rx) = Connection::new(None, 4);
        assert!(!registry.open(&late));
        assert!(late.is_closing());
    }

    // ========================================================================
    // Property Tests
    // ========================================================================

    #[derive(Debug, Clone)]
    enum Op {
        Register(usize, usize),
        Attach(usize, usize),
        Release(usize),
        Disconnect(usize),
        Answer(usize),
        Sweep,
        Output(usize),
    }

    const PEERS: usize = 6;
    const DEVICES: usize = 2;

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0..PEERS, 0..DEVICES).prop_map(|(c, d)| Op::Register(c, d)),
            (0..PEERS, 0..DEVICES).prop_map(|(c, d)| Op::Attach(c, d)),
            (0..PEERS).prop_map(Op::Release),
            (0..PEERS).prop_map(Op::Disconnect),
            (0..PEERS).prop_map(Op::Answer),
            Just(Op::Sweep),
            (0..PEERS).prop_map(Op::Output),
        ]
    }

    fn policy_strategy() -> impl Strategy<Value = AttachPolicy> {
        prop_oneof![Just(AttachPolicy::Exclusive), Just(AttachPolicy::Broadcast)]
    }

    proptest! {
        #[test]
        fn prop_registry_invariants_hold(
            policy in policy_strategy(),
            ops in prop::collection::vec(op_strategy(), 1..60),
        ) {
            let mut registry = Registry::new(policy);
            let peers: Vec<Peer> = (0..PEERS).map(|_| Peer::open(&mut registry)).collect();
            let ids: Vec<DeviceId> = (0..DEVICES).map(|d| DeviceId::new(format!("dev-{d}"))).collect();
            let frame = text(r#"{"type":"output"}"#);

            for op in ops {
                match op {
                    Op::Register(c, d) => { let _ = registry.register(peers[c].id(), ids[d].clone()); }
                    Op::Attach(c, d) => { let _ = registry.attach(peers[c].id(), ids[d].clone()); }
                    Op::Release(c) => { let _ = registry.release(peers[c].id()); }
                    Op::Disconnect(c) => { registry.disconnect(peers[c].id()); }
                    Op::Answer(c) => peers[c].conn.mark_alive(),
                    Op::Sweep => { registry.sweep(); }
                    Op::Output(c) => { let _ = registry.route_to_operators(peers[c].id(), "output", &frame); }
                }

                registry.check_invariants();
                for id in &ids {
                    // At most one authoritative connection, and it is a live device
                    if let Some(conn_id) = registry.device(id) {
                        prop_assert_eq!(registry.role(conn_id), Some(Role::Device));
                    }
                }
            }
        }

        #[test]
        fn prop_disconnect_twice_equals_once(
            ops in prop::collection::vec(op_strategy(), 1..40),
            victim in 0..PEERS,
        ) {
            let mut registry = Registry::new(AttachPolicy::Broadcast);
            let peers: Vec<Peer> = (0..PEERS).map(|_| Peer::open(&mut registry)).collect();
            let ids: Vec<DeviceId> = (0..DEVICES).map(|d| DeviceId::new(format!("dev-{d}"))).collect();

            for op in ops {
                match op {
                    Op::Register(c, d) => { let _ = registry.register(peers[c].id(), ids[d].clone()); }
                    Op::Attach(c, d) => { let _ = registry.attach(peers[c].id(), ids[d].clone()); }
                    Op::Release(c) => { let _ = registry.release(peers[c].id()); }
                    _ => {}
                }
            }

            registry.disconnect(peers[victim].id());
            let snapshot = (
                registry.connection_count(),
                ids.iter().map(|id| registry.device(id)).collect::<Vec<_>>(),
                ids.iter().map(|id| registry.operators(id).to_vec()).collect::<Vec<_>>(),
            );

            prop_assert!(!registry.disconnect(peers[victim].id()));
            let again = (
                registry.connection_count(),
                ids.iter().map(|id| registry.device(id)).collect::<Vec<_>>(),
                ids.iter().map(|id| registry.operators(id).to_vec()).collect::<Vec<_>>(),
            );
            prop_assert_eq!(snapshot, again);
        }
    }
}
