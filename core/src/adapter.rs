//! Adapter Controller
//!
//! [`HostController`] is the single owner of all host state. Client requests
//! arrive as method calls, Link Engine callbacks through [`LinkCallbacks`];
//! each is handled to completion before the next. Device state changes are
//! published through the [`ObjectExporter`] at the end of every handler.

use crate::config::HostConfig;
use crate::connection::{ConnectionCoordinator, LinkOutcome, SessionOrigin};
use crate::eir::Advertisement;
use crate::engine::{
    ConnectState, ConnectionId, DiscoveryReport, EngineEvent, LinkCallbacks, LinkEngine,
    PairError, PairState,
};
use crate::error::{BluetoothError, HostResult};
use crate::exporter::{
    changed_device_properties, device_object_path, device_properties, ObjectExporter,
    PropertyChange, PropertyValue,
};
use crate::observer::{DeviceObserver, ObserverId, ObserverList};
use crate::pairing::{paired_transition, PairingCoordinator};
use crate::registry::{merge_advertisement, DeviceRegistry};
use crate::reply::Responder;
use crate::scan::{ScanManager, ScanState};
use crate::suspend::{SuspendResumeState, SuspendTask, SuspendTracker};
use std::collections::HashSet;
use tracing::{debug, error, info, warn};

pub struct HostController<E: LinkEngine> {
    engine: E,
    config: HostConfig,
    registry: DeviceRegistry,
    pairing: PairingCoordinator,
    connections: ConnectionCoordinator,
    scan: ScanManager,
    /// One discovery vote per requester
    discovery_clients: HashSet<String>,
    suspend: SuspendTracker,
    exporter: Box<dyn ObjectExporter>,
    observers: ObserverList,
    discovering: bool,
    stack_sync_quitting: bool,
}

impl<E: LinkEngine> HostController<E> {
    pub fn new(engine: E, exporter: Box<dyn ObjectExporter>, config: HostConfig) -> Self {
        Self {
            engine,
            scan: ScanManager::new(config.scan.clone()),
            config,
            registry: DeviceRegistry::new(),
            pairing: PairingCoordinator::new(),
            connections: ConnectionCoordinator::new(),
            discovery_clients: HashSet::new(),
            suspend: SuspendTracker::new(),
            exporter,
            observers: ObserverList::new(),
            discovering: false,
            stack_sync_quitting: false,
        }
    }

    // ========================================================================
    // ACCESSORS
    // ========================================================================

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    pub fn pairing(&self) -> &PairingCoordinator {
        &self.pairing
    }

    pub fn connections(&self) -> &ConnectionCoordinator {
        &self.connections
    }

    pub fn scan_state(&self) -> ScanState {
        self.scan.state()
    }

    pub fn needs_background_scan(&self) -> bool {
        self.scan.needs_background_scan()
    }

    pub fn suspend_state(&self) -> SuspendResumeState {
        self.suspend.state()
    }

    pub fn discovery_client_count(&self) -> usize {
        self.discovery_clients.len()
    }

    pub fn stack_sync_quitting(&self) -> bool {
        self.stack_sync_quitting
    }

    pub fn add_observer(&mut self, observer: Box<dyn DeviceObserver>) -> ObserverId {
        self.observers.add(observer)
    }

    pub fn remove_observer(&mut self, id: ObserverId) -> bool {
        self.observers.remove(id)
    }

    // ========================================================================
    // START OF DAY
    // ========================================================================

    /// Publish the adapter and load the devices the Link Engine remembers
    pub fn init(&mut self) {
        self.exporter.update_adapter(vec![
            PropertyChange::new("Powered", PropertyValue::Bool(true)),
            PropertyChange::new("Discovering", PropertyValue::Bool(false)),
            PropertyChange::new("StackSyncQuitting", PropertyValue::Bool(false)),
        ]);

        if !self.config.load_known_devices {
            return;
        }

        let known = self.engine.known_devices();
        let mut loaded = 0usize;
        for record in known.iter().filter(|k| k.is_paired) {
            if self.registry.insert_known(record).is_none() {
                continue;
            }
            loaded += 1;
            self.notify(|o| o.on_paired_changed(&record.address, true, false));
            self.publish_device(&record.address);
        }
        info!("Loaded {} paired device(s) from the link engine", loaded);

        self.update_scan();
    }

    // ========================================================================
    // DISCOVERY
    // ========================================================================

    /// Take a discovery vote for `requester`
    pub fn start_discovery(&mut self, requester: &str) -> HostResult<()> {
        if self.discovery_clients.contains(requester) {
            warn!("{} already holds a discovery vote", requester);
            return Err(BluetoothError::InProgress(
                "Discovery already started".to_string(),
            ));
        }

        self.scan.start_scan(requester, &mut self.engine)?;
        self.discovery_clients.insert(requester.to_string());
        info!(
            "Discovery started by {} ({} client(s))",
            requester,
            self.discovery_clients.len()
        );
        self.publish_discovering();
        Ok(())
    }

    /// Release the discovery vote held by `requester`
    pub fn stop_discovery(&mut self, requester: &str) -> HostResult<()> {
        if !self.discovery_clients.contains(requester) {
            warn!("{} holds no discovery vote", requester);
            return Err(BluetoothError::Failed("No discovery started".to_string()));
        }

        self.scan.stop_scan(requester, &mut self.engine)?;
        self.discovery_clients.remove(requester);
        info!(
            "Discovery stopped by {} ({} client(s))",
            requester,
            self.discovery_clients.len()
        );
        self.publish_discovering();
        Ok(())
    }

    /// Drop the vote of a requester that disappeared. Nobody is waiting for
    /// an answer, so a failed transition is only logged.
    pub fn client_vanished(&mut self, requester: &str) {
        if !self.discovery_clients.remove(requester) {
            return;
        }
        info!("Discovery client {} vanished", requester);
        if let Err(e) = self.scan.stop_scan(requester, &mut self.engine) {
            error!("Failed to release discovery of vanished {}: {}", requester, e);
            self.scan.forget_client(requester);
        }
        self.publish_discovering();
    }

    // ========================================================================
    // DEVICE METHODS
    // ========================================================================

    /// Remove a device, cancelling anything in flight for it. Removing an
    /// unknown device succeeds.
    pub fn remove_device(&mut self, address: &str) -> HostResult<()> {
        let Some(device) = self.registry.get(address) else {
            debug!("RemoveDevice: {} not known, nothing to do", address);
            return Ok(());
        };

        if !self.pairing.cancel_for_removal(device, &mut self.engine) {
            // Clears any pairing state the Link Engine keeps for the device.
            if let Err(e) = self
                .engine
                .cancel_pair(&device.address, device.is_random_address)
            {
                debug!("No pairing state to clear for {}: {}", address, e);
            }
        }
        if let Some(outcome) = self.connections.cancel_for_removal(address, &mut self.engine) {
            self.report_link_outcome(&outcome);
        }

        let was_exported = self.registry.is_exported(address);
        self.registry.remove(address);
        if was_exported {
            self.exporter.unexport_device(&device_object_path(address));
        }
        info!("Removed device {}", address);

        self.notify(|o| o.on_device_removed(address));
        self.update_scan();
        Ok(())
    }

    pub fn pair(&mut self, address: &str, reply: Responder) {
        self.pairing
            .pair(self.registry.get(address), address, &mut self.engine, reply);
    }

    pub fn cancel_pairing(&mut self, address: &str, reply: Responder) {
        self.pairing
            .cancel(self.registry.get(address), address, &mut self.engine, reply);
    }

    pub fn connect(&mut self, address: &str, reply: Responder) {
        self.connections.connect(
            self.registry.get(address),
            address,
            &mut self.engine,
            SessionOrigin::Client(reply),
        );
    }

    pub fn disconnect(&mut self, address: &str, reply: Responder) {
        self.connections.disconnect(
            self.registry.get(address),
            address,
            &mut self.engine,
            SessionOrigin::Client(reply),
        );
    }

    /// Set the user alias; an empty alias falls back to name or address
    pub fn set_alias(&mut self, address: &str, alias: &str) -> HostResult<()> {
        let device = self
            .registry
            .get_mut(address)
            .ok_or_else(|| BluetoothError::DoesNotExist(format!("Unknown device {}", address)))?;
        device.user_alias = alias.to_string();
        device.update_alias();
        self.publish_device(address);
        Ok(())
    }

    pub fn set_trusted(&mut self, address: &str, trusted: bool) -> HostResult<()> {
        let device = self
            .registry
            .get_mut(address)
            .ok_or_else(|| BluetoothError::DoesNotExist(format!("Unknown device {}", address)))?;
        device.trusted.set(trusted);
        self.publish_device(address);
        Ok(())
    }

    // ========================================================================
    // SUSPEND / RESUME
    // ========================================================================

    pub fn suspend_imminent(&mut self, reply: Responder) {
        self.suspend.suspend_imminent(reply);
        let result = self.scan.set_suspended(true, &mut self.engine);
        self.suspend
            .complete_task(SuspendTask::PauseUnpauseDiscovery, result);
        self.publish_discovering();
    }

    pub fn suspend_done(&mut self, reply: Responder) {
        self.suspend.suspend_done(reply);
        let result = self.scan.set_suspended(false, &mut self.engine);
        self.suspend
            .complete_task(SuspendTask::PauseUnpauseDiscovery, result);
        self.publish_discovering();
    }

    // ========================================================================
    // ADAPTER PROPERTIES
    // ========================================================================

    pub fn set_stack_sync_quitting(&mut self, quitting: bool) {
        if self.stack_sync_quitting == quitting {
            return;
        }
        self.stack_sync_quitting = quitting;
        self.exporter.update_adapter(vec![PropertyChange::new(
            "StackSyncQuitting",
            PropertyValue::Bool(quitting),
        )]);
    }

    /// Feed one Link Engine callback
    pub fn handle_engine_event(&mut self, event: EngineEvent) {
        self.dispatch(event);
    }

    // ========================================================================
    // INTERNALS
    // ========================================================================

    fn notify(&mut self, f: impl Fn(&mut dyn DeviceObserver)) {
        f(&mut self.scan);
        self.observers.notify(&f);
    }

    fn update_scan(&mut self) {
        if let Err(e) = self.scan.update(&mut self.engine) {
            error!("Scan re-evaluation failed: {}", e);
        }
        self.publish_discovering();
    }

    fn publish_discovering(&mut self) {
        let discovering = self.scan.state() == ScanState::ActiveScan;
        if discovering == self.discovering {
            return;
        }
        self.discovering = discovering;
        self.exporter.update_adapter(vec![PropertyChange::new(
            "Discovering",
            PropertyValue::Bool(discovering),
        )]);
    }

    /// Export a device on first publish, otherwise send its changed
    /// properties
    fn publish_device(&mut self, address: &str) {
        let exported = self.registry.is_exported(address);
        let Some(device) = self.registry.get_mut(address) else {
            return;
        };
        let path = device_object_path(address);

        if exported {
            let changes = changed_device_properties(device);
            if !changes.is_empty() {
                self.exporter.update_device(&path, changes);
            }
        } else {
            self.exporter.export_device(&path, device_properties(device));
        }
        device.clear_updated();

        if !exported {
            self.registry.mark_exported(address);
        }
    }

    fn set_paired(&mut self, address: &str, paired: bool) {
        let Some(device) = self.registry.get_mut(address) else {
            return;
        };
        let changed = *device.paired.value() != paired;
        device.paired.set(paired);
        if changed {
            let connected = self.connections.is_connected(address);
            self.notify(|o| o.on_paired_changed(address, paired, connected));
            self.update_scan();
        }
    }

    /// Record a terminal link outcome and tell every observer once
    fn report_link_outcome(&mut self, outcome: &LinkOutcome) {
        match outcome {
            LinkOutcome::Connected { address, conn_id } => {
                self.set_connected(address, true);
                self.notify(|o| o.on_gatt_connected(address, *conn_id));
            }
            LinkOutcome::ConnectFailed { address } => {
                self.set_connected(address, false);
                self.notify(|o| o.on_gatt_connect_failed(address));
            }
            LinkOutcome::Disconnected {
                address,
                conn_id,
                intentional,
            } => {
                self.set_connected(address, false);
                self.notify(|o| o.on_gatt_disconnected(address, *conn_id, *intentional));
            }
        }
    }

    fn set_connected(&mut self, address: &str, connected: bool) {
        if let Some(device) = self.registry.get_mut(address) {
            device.connected.set(connected);
        }
    }

    /// Reconnect a paired device that reappeared after an unexpected loss
    fn maybe_reconnect(&mut self, address: &str) {
        if !self.config.auto_reconnect_paired {
            return;
        }
        let Some(device) = self.registry.get(address) else {
            return;
        };
        if !*device.paired.value()
            || *device.connected.value()
            || self.connections.has_session(address)
            || self.connections.is_attempting(address)
            || self.connections.is_connected(address)
        {
            return;
        }
        let lost = self
            .scan
            .paired_state(address)
            .map(|s| !s.disconnected_intentionally)
            .unwrap_or(false);
        if !lost {
            return;
        }

        info!("Reconnecting to paired device {}", address);
        self.connections
            .connect(Some(device), address, &mut self.engine, SessionOrigin::Internal);
    }
}

impl<E: LinkEngine> LinkCallbacks for HostController<E> {
    fn on_device_discovered(&mut self, report: DiscoveryReport) {
        let scanned_by_client = self.scan.state() == ScanState::ActiveScan;

        if scanned_by_client {
            let adv = Advertisement::parse(&report.eir);
            let device = self.registry.upsert_discovered(
                &report.address,
                &report.advertised_address,
                report.address_type,
            );
            merge_advertisement(device, &adv, report.rssi);
            self.publish_device(&report.address);
        } else {
            debug!("Background report from {}", report.address);
        }

        self.maybe_reconnect(&report.address);
    }

    fn on_pair_state_changed(
        &mut self,
        address: &str,
        state: PairState,
        error: PairError,
        identity_address: Option<String>,
    ) {
        let Some(device) = self.registry.get_mut(address) else {
            // Pairing data may arrive after the device was removed.
            debug!("Pairing state {} for unknown device {}", state, address);
            return;
        };

        debug!("Pairing state changed to {} for {}", state, address);

        if state == PairState::Paired {
            if let Some(identity) = identity_address.filter(|a| !a.is_empty()) {
                device.identity_address.set(identity);
            }
        }

        if let Some(paired) = paired_transition(state, error) {
            self.set_paired(address, paired);
        }

        self.pairing.on_pair_state_changed(address, state, error);
        self.publish_device(address);
    }

    fn on_gatt_connection_state_changed(&mut self, conn_id: ConnectionId, state: ConnectState) {
        let outcome = self.connections.on_state_changed(
            conn_id,
            state,
            &self.registry,
            &mut self.engine,
            self.config.attach_hid,
        );
        let Some(outcome) = outcome else {
            return;
        };

        self.report_link_outcome(&outcome);
        self.publish_device(outcome.address());
        self.update_scan();
    }
}
