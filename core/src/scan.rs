//! Scan Manager
//!
//! Owns the single physical discovery resource. Demand comes from three
//! places: explicit client scans, the background need to re-acquire paired
//! devices that dropped off unexpectedly, and the suspend gate. The desired
//! state is a pure function of those inputs; [`ScanManager::update`] drives
//! the Link Engine towards it.

use crate::config::ScanConfig;
use crate::engine::{ConnectionId, LinkEngine};
use crate::error::{BluetoothError, HostResult};
use crate::observer::DeviceObserver;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::{debug, error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanState {
    Idle,
    ActiveScan,
    PassiveScan,
}

impl std::fmt::Display for ScanState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::ActiveScan => write!(f, "ActiveScan"),
            Self::PassiveScan => write!(f, "PassiveScan"),
        }
    }
}

/// Scan state wanted for the given inputs
pub fn desired_state(client_count: usize, needs_background_scan: bool, is_suspended: bool) -> ScanState {
    if is_suspended {
        ScanState::Idle
    } else if client_count > 0 {
        ScanState::ActiveScan
    } else if needs_background_scan {
        ScanState::PassiveScan
    } else {
        ScanState::Idle
    }
}

/// Link state of a paired device as far as background scanning cares
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PairedDeviceState {
    pub is_connected: bool,
    pub disconnected_intentionally: bool,
}

#[derive(Debug)]
pub struct ScanManager {
    state: ScanState,
    clients: HashSet<String>,
    is_suspended: bool,
    paired: HashMap<String, PairedDeviceState>,
    config: ScanConfig,
}

impl ScanManager {
    pub fn new(config: ScanConfig) -> Self {
        Self {
            state: ScanState::Idle,
            clients: HashSet::new(),
            is_suspended: false,
            paired: HashMap::new(),
            config,
        }
    }

    pub fn state(&self) -> ScanState {
        self.state
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn has_client(&self, client_id: &str) -> bool {
        self.clients.contains(client_id)
    }

    pub fn is_suspended(&self) -> bool {
        self.is_suspended
    }

    /// True iff a paired device is neither connected nor known to have been
    /// disconnected on purpose
    pub fn needs_background_scan(&self) -> bool {
        self.paired
            .values()
            .any(|d| !d.is_connected && !d.disconnected_intentionally)
    }

    pub fn paired_state(&self, address: &str) -> Option<PairedDeviceState> {
        self.paired.get(address).copied()
    }

    /// Add a scan client; rolled back if the transition fails
    pub fn start_scan(&mut self, client_id: &str, engine: &mut dyn LinkEngine) -> HostResult<()> {
        let inserted = self.clients.insert(client_id.to_string());
        if let Err(e) = self.update(engine) {
            if inserted {
                self.clients.remove(client_id);
            }
            return Err(e);
        }
        Ok(())
    }

    /// Remove a scan client; rolled back if the transition fails
    pub fn stop_scan(&mut self, client_id: &str, engine: &mut dyn LinkEngine) -> HostResult<()> {
        let removed = self.clients.remove(client_id);
        if let Err(e) = self.update(engine) {
            if removed {
                self.clients.insert(client_id.to_string());
            }
            return Err(e);
        }
        Ok(())
    }

    /// Drop a client without driving the Link Engine; the next update
    /// applies it
    pub fn forget_client(&mut self, client_id: &str) {
        self.clients.remove(client_id);
    }

    /// Gate scanning for suspend. The flag sticks even if the transition
    /// fails.
    pub fn set_suspended(&mut self, suspended: bool, engine: &mut dyn LinkEngine) -> HostResult<()> {
        self.is_suspended = suspended;
        self.update(engine)
    }

    /// Drive the Link Engine towards the desired state. Switching profiles
    /// stops discovery fully before starting again; if the restart fails the
    /// state is left `Idle`.
    pub fn update(&mut self, engine: &mut dyn LinkEngine) -> HostResult<()> {
        let desired = desired_state(
            self.clients.len(),
            self.needs_background_scan(),
            self.is_suspended,
        );

        if desired == self.state {
            return Ok(());
        }

        debug!("Scan state {} -> {}", self.state, desired);

        if self.state != ScanState::Idle {
            if let Err(e) = engine.stop_discovery() {
                error!("Failed to stop discovery: {}", e);
                return Err(BluetoothError::Failed("Failed to stop discovery".to_string()));
            }
            self.state = ScanState::Idle;
        }

        let params = match desired {
            ScanState::Idle => {
                info!("Discovery stopped");
                return Ok(());
            }
            ScanState::ActiveScan => self.config.active,
            ScanState::PassiveScan => self.config.passive,
        };

        if let Err(e) = engine.start_discovery(&params) {
            error!("Failed to start discovery ({}): {}", desired, e);
            return Err(BluetoothError::Failed("Failed to start discovery".to_string()));
        }

        info!("Discovery started ({})", desired);
        self.state = desired;
        Ok(())
    }
}

impl DeviceObserver for ScanManager {
    fn on_paired_changed(&mut self, address: &str, paired: bool, connected: bool) {
        if paired {
            self.paired.entry(address.to_string()).or_default().is_connected = connected;
        } else {
            self.paired.remove(address);
        }
    }

    fn on_gatt_connected(&mut self, address: &str, _conn_id: ConnectionId) {
        if let Some(state) = self.paired.get_mut(address) {
            state.is_connected = true;
            state.disconnected_intentionally = false;
        }
    }

    fn on_gatt_disconnected(&mut self, address: &str, _conn_id: ConnectionId, intentional: bool) {
        if let Some(state) = self.paired.get_mut(address) {
            state.is_connected = false;
            state.disconnected_intentionally = intentional;
        }
    }

    fn on_device_removed(&mut self, address: &str) {
        self.paired.remove(address);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScanParameters;
    use crate::engine::{EngineError, MockLinkEngine};
    use mockall::predicate::eq;
    use mockall::Sequence;

    const ADDR: &str = "AA:BB:CC:DD:EE:FF";

    #[test]
    fn test_desired_state_table() {
        assert_eq!(desired_state(0, false, false), ScanState::Idle);
        assert_eq!(desired_state(1, false, false), ScanState::ActiveScan);
        assert_eq!(desired_state(0, true, false), ScanState::PassiveScan);
        assert_eq!(desired_state(2, true, false), ScanState::ActiveScan);
        assert_eq!(desired_state(2, true, true), ScanState::Idle);
    }

    #[test]
    fn test_refcount_start_stop_once() {
        let mut engine = MockLinkEngine::new();
        engine
            .expect_start_discovery()
            .with(eq(ScanParameters::default_active()))
            .times(1)
            .returning(|_| Ok(()));
        engine.expect_stop_discovery().times(1).returning(|| Ok(()));

        let mut scan = ScanManager::new(ScanConfig::default());
        scan.start_scan("a", &mut engine).expect("start a");
        scan.start_scan("b", &mut engine).expect("start b");
        scan.stop_scan("a", &mut engine).expect("stop a");
        assert_eq!(scan.state(), ScanState::ActiveScan);
        scan.stop_scan("b", &mut engine).expect("stop b");
        assert_eq!(scan.state(), ScanState::Idle);
    }

    #[test]
    fn test_start_failure_rolls_back() {
        let mut engine = MockLinkEngine::new();
        engine
            .expect_start_discovery()
            .returning(|_| Err(EngineError::Rejected("radio off".to_string())));

        let mut scan = ScanManager::new(ScanConfig::default());
        assert!(matches!(
            scan.start_scan("a", &mut engine),
            Err(BluetoothError::Failed(_))
        ));
        assert_eq!(scan.client_count(), 0);
        assert_eq!(scan.state(), ScanState::Idle);
    }

    #[test]
    fn test_profile_switch_stops_before_restart() {
        let mut engine = MockLinkEngine::new();
        let mut seq = Sequence::new();
        engine
            .expect_start_discovery()
            .with(eq(ScanParameters::default_passive()))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        engine
            .expect_stop_discovery()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(()));
        engine
            .expect_start_discovery()
            .with(eq(ScanParameters::default_active()))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(EngineError::Rejected("busy".to_string())));

        let mut scan = ScanManager::new(ScanConfig::default());
        scan.on_paired_changed(ADDR, true, false);
        scan.update(&mut engine).expect("background scan");
        assert_eq!(scan.state(), ScanState::PassiveScan);

        // Stop succeeds, restart fails: left Idle, client rolled back.
        assert!(scan.start_scan("a", &mut engine).is_err());
        assert_eq!(scan.state(), ScanState::Idle);
        assert_eq!(scan.client_count(), 0);
    }

    #[test]
    fn test_stop_failure_keeps_client() {
        let mut engine = MockLinkEngine::new();
        engine.expect_start_discovery().returning(|_| Ok(()));
        engine
            .expect_stop_discovery()
            .returning(|| Err(EngineError::Rejected("stuck".to_string())));

        let mut scan = ScanManager::new(ScanConfig::default());
        scan.start_scan("a", &mut engine).expect("start");
        assert!(scan.stop_scan("a", &mut engine).is_err());
        assert!(scan.has_client("a"));
        assert_eq!(scan.state(), ScanState::ActiveScan);
    }

    #[test]
    fn test_background_need_tracks_links() {
        let mut scan = ScanManager::new(ScanConfig::default());
        assert!(!scan.needs_background_scan());

        scan.on_paired_changed(ADDR, true, false);
        assert!(scan.needs_background_scan());

        scan.on_gatt_connected(ADDR, ConnectionId(1));
        assert!(!scan.needs_background_scan());

        scan.on_gatt_disconnected(ADDR, ConnectionId(1), true);
        assert!(!scan.needs_background_scan());

        scan.on_gatt_connected(ADDR, ConnectionId(2));
        scan.on_gatt_disconnected(ADDR, ConnectionId(2), false);
        assert!(scan.needs_background_scan());

        scan.on_device_removed(ADDR);
        scan.on_paired_changed(ADDR, true, true);
        assert!(!scan.needs_background_scan());

        scan.on_device_removed(ADDR);
        assert!(!scan.needs_background_scan());
    }

    #[test]
    fn test_suspend_gates_everything() {
        let mut engine = MockLinkEngine::new();
        engine.expect_start_discovery().times(2).returning(|_| Ok(()));
        engine.expect_stop_discovery().times(1).returning(|| Ok(()));

        let mut scan = ScanManager::new(ScanConfig::default());
        scan.start_scan("a", &mut engine).expect("start");
        scan.set_suspended(true, &mut engine).expect("suspend");
        assert_eq!(scan.state(), ScanState::Idle);
        scan.set_suspended(false, &mut engine).expect("resume");
        assert_eq!(scan.state(), ScanState::ActiveScan);
    }
}
