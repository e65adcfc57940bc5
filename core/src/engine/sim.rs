//! In-memory Link Engine
//!
//! Records every command it receives and answers from a small amount of
//! state. Clones share that state, so a test (or the replay harness) can keep
//! a handle to inspect and steer the engine after handing it to the host.

use super::{
    ConnectionId, EngineError, HidId, KnownDevice, LinkEngine, SecurityRequirements,
};
use crate::config::ScanParameters;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// A command as seen by the simulated engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum EngineCommand {
    StartDiscovery { params: ScanParameters },
    StopDiscovery,
    Pair { address: String, security: SecurityRequirements },
    CancelPair { address: String },
    GattConnect { address: String, conn_id: u32 },
    GattDisconnect { conn_id: u32 },
    StartEncryption { conn_id: u32 },
    HidAttach { conn_id: u32, name: String },
    HidDetach { hid_id: u32 },
}

/// Failure switches for steering the simulated engine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimFaults {
    pub fail_start_discovery: bool,
    pub fail_stop_discovery: bool,
    pub reject_pair: bool,
    pub reject_cancel_pair: bool,
    pub reject_connect: bool,
    pub reject_disconnect: bool,
    pub refuse_hid: bool,
}

#[derive(Debug)]
struct SimState {
    commands: Vec<EngineCommand>,
    discovering: bool,
    next_conn_id: u32,
    next_hid_id: u32,
    known_devices: Vec<KnownDevice>,
    faults: SimFaults,
}

/// Simulated Link Engine; cheap to clone, clones share state
#[derive(Debug, Clone)]
pub struct SimulatedEngine {
    state: Arc<Mutex<SimState>>,
}

impl Default for SimulatedEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedEngine {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                commands: Vec::new(),
                discovering: false,
                next_conn_id: 1,
                next_hid_id: 1,
                known_devices: Vec::new(),
                faults: SimFaults::default(),
            })),
        }
    }

    /// Seed the persistent store returned by `known_devices`
    pub fn with_known_devices(self, devices: Vec<KnownDevice>) -> Self {
        self.state.lock().known_devices = devices;
        self
    }

    /// Identifier handed out by the next `gatt_connect`
    pub fn set_next_conn_id(&self, conn_id: u32) {
        self.state.lock().next_conn_id = conn_id;
    }

    pub fn faults(&self) -> SimFaults {
        self.state.lock().faults
    }

    pub fn set_faults(&self, faults: SimFaults) {
        self.state.lock().faults = faults;
    }

    /// Change failure switches in place
    pub fn update_faults(&self, f: impl FnOnce(&mut SimFaults)) {
        f(&mut self.state.lock().faults);
    }

    pub fn is_discovering(&self) -> bool {
        self.state.lock().discovering
    }

    pub fn commands(&self) -> Vec<EngineCommand> {
        self.state.lock().commands.clone()
    }

    pub fn clear_commands(&self) {
        self.state.lock().commands.clear();
    }

    /// Number of recorded commands matching a predicate
    pub fn count(&self, predicate: impl Fn(&EngineCommand) -> bool) -> usize {
        self.state.lock().commands.iter().filter(|c| predicate(c)).count()
    }

    pub fn start_discovery_count(&self) -> usize {
        self.count(|c| matches!(c, EngineCommand::StartDiscovery { .. }))
    }

    pub fn stop_discovery_count(&self) -> usize {
        self.count(|c| matches!(c, EngineCommand::StopDiscovery))
    }

    pub fn pair_count(&self) -> usize {
        self.count(|c| matches!(c, EngineCommand::Pair { .. }))
    }

    pub fn gatt_connect_count(&self) -> usize {
        self.count(|c| matches!(c, EngineCommand::GattConnect { .. }))
    }

    /// Parameters of the most recent `start_discovery`
    pub fn last_scan_parameters(&self) -> Option<ScanParameters> {
        self.state
            .lock()
            .commands
            .iter()
            .rev()
            .find_map(|c| match c {
                EngineCommand::StartDiscovery { params } => Some(*params),
                _ => None,
            })
    }
}

impl LinkEngine for SimulatedEngine {
    fn start_discovery(&mut self, params: &ScanParameters) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        state.commands.push(EngineCommand::StartDiscovery { params: *params });
        if state.faults.fail_start_discovery {
            return Err(EngineError::Rejected("start discovery".to_string()));
        }
        if state.discovering {
            return Err(EngineError::Rejected("discovery already running".to_string()));
        }
        state.discovering = true;
        debug!("sim: discovery started (active: {})", params.active);
        Ok(())
    }

    fn stop_discovery(&mut self) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        state.commands.push(EngineCommand::StopDiscovery);
        if state.faults.fail_stop_discovery {
            return Err(EngineError::Rejected("stop discovery".to_string()));
        }
        if !state.discovering {
            return Err(EngineError::Rejected("discovery not running".to_string()));
        }
        state.discovering = false;
        debug!("sim: discovery stopped");
        Ok(())
    }

    fn pair(
        &mut self,
        address: &str,
        _is_random: bool,
        security: SecurityRequirements,
    ) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        state.commands.push(EngineCommand::Pair {
            address: address.to_string(),
            security,
        });
        if state.faults.reject_pair {
            return Err(EngineError::UnknownDevice(address.to_string()));
        }
        Ok(())
    }

    fn cancel_pair(&mut self, address: &str, _is_random: bool) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        state.commands.push(EngineCommand::CancelPair {
            address: address.to_string(),
        });
        if state.faults.reject_cancel_pair {
            return Err(EngineError::Rejected("cancel pair".to_string()));
        }
        Ok(())
    }

    fn gatt_connect(&mut self, address: &str, _is_random: bool) -> Result<ConnectionId, EngineError> {
        let mut state = self.state.lock();
        if state.faults.reject_connect {
            return Err(EngineError::Rejected(format!("connect {}", address)));
        }
        let conn_id = state.next_conn_id;
        state.next_conn_id = state.next_conn_id.wrapping_add(1);
        state.commands.push(EngineCommand::GattConnect {
            address: address.to_string(),
            conn_id,
        });
        Ok(ConnectionId(conn_id))
    }

    fn gatt_disconnect(&mut self, conn_id: ConnectionId) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        state.commands.push(EngineCommand::GattDisconnect { conn_id: conn_id.0 });
        if state.faults.reject_disconnect {
            return Err(EngineError::UnknownConnection(conn_id.0));
        }
        Ok(())
    }

    fn start_encryption(&mut self, conn_id: ConnectionId) -> Result<(), EngineError> {
        self.state
            .lock()
            .commands
            .push(EngineCommand::StartEncryption { conn_id: conn_id.0 });
        Ok(())
    }

    fn hid_attach(&mut self, conn_id: ConnectionId, name: &str) -> Option<HidId> {
        let mut state = self.state.lock();
        state.commands.push(EngineCommand::HidAttach {
            conn_id: conn_id.0,
            name: name.to_string(),
        });
        if state.faults.refuse_hid {
            return None;
        }
        let hid_id = state.next_hid_id;
        state.next_hid_id += 1;
        Some(HidId(hid_id))
    }

    fn hid_detach(&mut self, hid_id: HidId) {
        self.state
            .lock()
            .commands
            .push(EngineCommand::HidDetach { hid_id: hid_id.0 });
    }

    fn known_devices(&mut self) -> Vec<KnownDevice> {
        self.state.lock().known_devices.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discovery_start_stop_tracking() {
        let handle = SimulatedEngine::new();
        let mut engine = handle.clone();

        engine
            .start_discovery(&ScanParameters::default_active())
            .expect("start");
        assert!(handle.is_discovering());
        assert!(engine.start_discovery(&ScanParameters::default_passive()).is_err());

        engine.stop_discovery().expect("stop");
        assert!(!handle.is_discovering());
        assert_eq!(handle.start_discovery_count(), 2);
        assert_eq!(handle.stop_discovery_count(), 1);
        assert_eq!(
            handle.last_scan_parameters(),
            Some(ScanParameters::default_passive())
        );
    }

    #[test]
    fn test_connection_ids_are_sequential() {
        let handle = SimulatedEngine::new();
        handle.set_next_conn_id(7);
        let mut engine = handle.clone();

        assert_eq!(engine.gatt_connect("A", false), Ok(ConnectionId(7)));
        assert_eq!(engine.gatt_connect("B", false), Ok(ConnectionId(8)));
        assert_eq!(handle.gatt_connect_count(), 2);
    }

    #[test]
    fn test_faults() {
        let handle = SimulatedEngine::new();
        handle.update_faults(|f| f.reject_connect = true);
        let mut engine = handle.clone();

        assert!(engine.gatt_connect("A", false).is_err());
        assert_eq!(handle.gatt_connect_count(), 0);
    }
}
