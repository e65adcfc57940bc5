//! Connection coordinator
//!
//! Tracks, per device address, the GATT link state (`Idle`, `Attempting`,
//! `Connected`) and at most one Connect/Disconnect session. Link Engine
//! callbacks are matched by connection id, never by address, so callbacks for
//! superseded attempts fall through and are ignored.

use crate::device::Device;
use crate::engine::{ConnectState, ConnectionId, HidId, LinkEngine};
use crate::error::{BluetoothError, HostResult};
use crate::registry::DeviceRegistry;
use crate::reply::Responder;
use std::collections::HashMap;
use tracing::{debug, error, info, warn};

// ============================================================================
// SESSIONS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Connect,
    Disconnect,
}

/// Who asked for the operation
#[derive(Debug)]
pub enum SessionOrigin {
    /// A client waiting on the held reply
    Client(Responder),
    /// Issued by the host itself; nobody to answer
    Internal,
}

impl SessionOrigin {
    fn resolve(self, address: &str, result: HostResult<()>) {
        match self {
            Self::Client(reply) => reply.send(result),
            Self::Internal => {
                if let Err(e) = result {
                    debug!("Internal operation for {} ended: {}", address, e);
                }
            }
        }
    }

    pub fn is_internal(&self) -> bool {
        matches!(self, Self::Internal)
    }
}

/// Outstanding Connect or Disconnect for one device
#[derive(Debug)]
pub struct ConnectSession {
    pub kind: SessionKind,
    origin: SessionOrigin,
}

/// A live GATT link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connection {
    pub conn_id: ConnectionId,
    pub hid_id: Option<HidId>,
}

/// Terminal result of a GATT callback, for device state and observers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkOutcome {
    Connected {
        address: String,
        conn_id: ConnectionId,
    },
    ConnectFailed {
        address: String,
    },
    Disconnected {
        address: String,
        conn_id: ConnectionId,
        intentional: bool,
    },
}

impl LinkOutcome {
    pub fn address(&self) -> &str {
        match self {
            Self::Connected { address, .. }
            | Self::ConnectFailed { address }
            | Self::Disconnected { address, .. } => address,
        }
    }
}

// ============================================================================
// COORDINATOR
// ============================================================================

#[derive(Debug, Default)]
pub struct ConnectionCoordinator {
    sessions: HashMap<String, ConnectSession>,
    attempts: HashMap<String, ConnectionId>,
    connections: HashMap<String, Connection>,
}

impl ConnectionCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_session(&self, address: &str) -> bool {
        self.sessions.contains_key(address)
    }

    pub fn session_kind(&self, address: &str) -> Option<SessionKind> {
        self.sessions.get(address).map(|s| s.kind)
    }

    pub fn is_attempting(&self, address: &str) -> bool {
        self.attempts.contains_key(address)
    }

    pub fn is_connected(&self, address: &str) -> bool {
        self.connections.contains_key(address)
    }

    pub fn connection(&self, address: &str) -> Option<&Connection> {
        self.connections.get(address)
    }

    /// Start a GATT connection. Returns true if an attempt was started;
    /// rejections are delivered through `origin`.
    pub fn connect(
        &mut self,
        device: Option<&Device>,
        address: &str,
        engine: &mut dyn LinkEngine,
        origin: SessionOrigin,
    ) -> bool {
        if self.sessions.contains_key(address) {
            origin.resolve(
                address,
                Err(BluetoothError::InProgress(
                    "Connection/disconnection in progress".to_string(),
                )),
            );
            return false;
        }

        let Some(device) = device else {
            warn!("Connect: device {} not found", address);
            origin.resolve(
                address,
                Err(BluetoothError::DoesNotExist(format!("Unknown device {}", address))),
            );
            return false;
        };

        if self.attempts.contains_key(address) {
            warn!("Connection with device {} in progress", address);
            origin.resolve(
                address,
                Err(BluetoothError::InProgress("Connection in progress".to_string())),
            );
            return false;
        }

        if self.connections.contains_key(address) {
            warn!("Connection with device {} already exists", address);
            origin.resolve(
                address,
                Err(BluetoothError::AlreadyExists("Already connected".to_string())),
            );
            return false;
        }

        let conn_id = match engine.gatt_connect(&device.address, device.is_random_address) {
            Ok(conn_id) => conn_id,
            Err(e) => {
                error!("GATT connect to {} failed: {}", address, e);
                origin.resolve(address, Err(BluetoothError::Failed("GATT connect failed".to_string())));
                return false;
            }
        };

        info!(
            "Connecting to {} (conn id {}, internal: {})",
            address,
            conn_id,
            origin.is_internal()
        );
        self.attempts.insert(address.to_string(), conn_id);
        self.sessions.insert(
            address.to_string(),
            ConnectSession {
                kind: SessionKind::Connect,
                origin,
            },
        );
        true
    }

    /// Tear down a link or a pending attempt. Returns true if the Link Engine
    /// accepted the disconnection.
    pub fn disconnect(
        &mut self,
        device: Option<&Device>,
        address: &str,
        engine: &mut dyn LinkEngine,
        origin: SessionOrigin,
    ) -> bool {
        if self.sessions.contains_key(address) {
            origin.resolve(
                address,
                Err(BluetoothError::InProgress(
                    "Connection/disconnection in progress".to_string(),
                )),
            );
            return false;
        }

        if device.is_none() {
            warn!("Disconnect: device {} not found", address);
            origin.resolve(
                address,
                Err(BluetoothError::DoesNotExist(format!("Unknown device {}", address))),
            );
            return false;
        }

        let attempt = self.attempts.get(address).copied();
        let connection = self.connections.get_mut(address);

        debug_assert!(
            !(attempt.is_some() && connection.is_some()),
            "device is both attempting and connected"
        );

        let mut stale = false;
        let conn_id = match (attempt, connection) {
            (Some(conn_id), None) => conn_id,
            (None, Some(connection)) => {
                if let Some(hid_id) = connection.hid_id.take() {
                    engine.hid_detach(hid_id);
                }
                connection.conn_id
            }
            (Some(conn_id), Some(connection)) => {
                error!("Device {} is both attempting and connected", address);
                if let Some(hid_id) = connection.hid_id.take() {
                    engine.hid_detach(hid_id);
                }
                stale = true;
                conn_id
            }
            (None, None) => {
                debug!("Device {} has neither a connection nor an attempt", address);
                origin.resolve(
                    address,
                    Err(BluetoothError::NotConnected("Not connected".to_string())),
                );
                return false;
            }
        };

        // The attempt supersedes the stale link record.
        if stale {
            self.connections.remove(address);
        }

        if let Err(e) = engine.gatt_disconnect(conn_id) {
            error!("Failed to disconnect from device {}: {}", address, e);
            origin.resolve(address, Err(BluetoothError::Failed("GATT disconnect failed".to_string())));
            return false;
        }

        info!("Disconnecting from {} (conn id {})", address, conn_id);
        self.sessions.insert(
            address.to_string(),
            ConnectSession {
                kind: SessionKind::Disconnect,
                origin,
            },
        );
        true
    }

    /// Apply a GATT connection-state callback
    pub fn on_state_changed(
        &mut self,
        conn_id: ConnectionId,
        state: ConnectState,
        registry: &DeviceRegistry,
        engine: &mut dyn LinkEngine,
        attach_hid: bool,
    ) -> Option<LinkOutcome> {
        let attempt = self
            .attempts
            .iter()
            .find(|(_, id)| **id == conn_id)
            .map(|(address, _)| address.clone());

        if let Some(address) = attempt {
            self.attempts.remove(&address);
            return if state.is_disconnect() {
                Some(self.attempt_failed(address, state))
            } else {
                self.attempt_connected(address, conn_id, registry, engine, attach_hid)
            };
        }

        if !state.is_disconnect() {
            debug!("Ignoring connected event with conn id {}", conn_id);
            return None;
        }

        let connected = self
            .connections
            .iter()
            .find(|(_, c)| c.conn_id == conn_id)
            .map(|(address, _)| address.clone());

        match connected {
            Some(address) => Some(self.link_lost(address, conn_id, state, engine)),
            None => {
                debug!("Ignoring {:?} for unknown conn id {}", state, conn_id);
                None
            }
        }
    }

    fn attempt_connected(
        &mut self,
        address: String,
        conn_id: ConnectionId,
        registry: &DeviceRegistry,
        engine: &mut dyn LinkEngine,
        attach_hid: bool,
    ) -> Option<LinkOutcome> {
        let Some(device) = registry.get(&address) else {
            debug!("Ignoring connected event with conn id {}, {} is gone", conn_id, address);
            return None;
        };

        info!("Connection with id {} established for {}", conn_id, address);

        if let Err(e) = engine.start_encryption(conn_id) {
            warn!("Could not start encryption with {}: {}", address, e);
        }

        let hid_id = if attach_hid && device.may_be_hid() {
            engine.hid_attach(conn_id, device.name.value())
        } else {
            None
        };

        self.connections
            .insert(address.clone(), Connection { conn_id, hid_id });
        self.resolve_session(&address, Ok(()));

        Some(LinkOutcome::Connected { address, conn_id })
    }

    fn attempt_failed(&mut self, address: String, state: ConnectState) -> LinkOutcome {
        info!("Connection attempt for {} ended with {:?}", address, state);

        match self.sessions.remove(&address) {
            Some(ConnectSession {
                kind: SessionKind::Disconnect,
                origin,
            }) => origin.resolve(&address, Ok(())),
            Some(ConnectSession { origin, .. }) => origin.resolve(
                &address,
                Err(BluetoothError::Failed("Connection failed".to_string())),
            ),
            None => {}
        }

        LinkOutcome::ConnectFailed { address }
    }

    fn link_lost(
        &mut self,
        address: String,
        conn_id: ConnectionId,
        state: ConnectState,
        engine: &mut dyn LinkEngine,
    ) -> LinkOutcome {
        if let Some(hid_id) = self.connections.remove(&address).and_then(|c| c.hid_id) {
            engine.hid_detach(hid_id);
        }

        let requested = self.session_kind(&address) == Some(SessionKind::Disconnect);
        if requested {
            self.resolve_session(&address, Ok(()));
        }

        let intentional = requested || state == ConnectState::DisconnectedByUs;
        info!(
            "Disconnected from {} (conn id {}, intentional: {})",
            address, conn_id, intentional
        );

        LinkOutcome::Disconnected {
            address,
            conn_id,
            intentional,
        }
    }

    fn resolve_session(&mut self, address: &str, result: HostResult<()>) {
        if let Some(session) = self.sessions.remove(address) {
            session.origin.resolve(address, result);
        }
    }

    /// Cancel everything tied to a device being removed. Sessions are
    /// answered immediately and any link or attempt is torn down; late
    /// callbacks for it no longer match anything, so the returned outcome
    /// is the only report of the link ending.
    pub fn cancel_for_removal(
        &mut self,
        address: &str,
        engine: &mut dyn LinkEngine,
    ) -> Option<LinkOutcome> {
        if let Some(session) = self.sessions.remove(address) {
            match session.kind {
                SessionKind::Disconnect => session.origin.resolve(address, Ok(())),
                SessionKind::Connect => session.origin.resolve(
                    address,
                    Err(BluetoothError::Failed("Device removed".to_string())),
                ),
            }
        }

        let attempt = self.attempts.remove(address);
        let connection = self.connections.remove(address);
        if let Some(hid_id) = connection.and_then(|c| c.hid_id) {
            engine.hid_detach(hid_id);
        }

        if let Some(conn_id) = attempt.or(connection.map(|c| c.conn_id)) {
            if let Err(e) = engine.gatt_disconnect(conn_id) {
                error!("Failed to disconnect removed device {}: {}", address, e);
            }
        }

        match (attempt, connection) {
            (_, Some(connection)) => Some(LinkOutcome::Disconnected {
                address: address.to_string(),
                conn_id: connection.conn_id,
                intentional: true,
            }),
            (Some(_), None) => Some(LinkOutcome::ConnectFailed {
                address: address.to_string(),
            }),
            (None, None) => None,
        }
    }
}
