// Integration tests for GATT connection sessions
//
// Connection ids come from the Link Engine; callbacks are matched by id and
// anything that matches nothing must leave the host untouched.

use lehost_core::exporter::device_object_path;
use lehost_core::reply::channel;
use lehost_core::*;

const KEYBOARD: &str = "AA:BB:CC:DD:EE:FF";
const SPEAKER: &str = "11:22:33:44:55:66";

fn host_with_devices(
    devices: &[(&str, u16)],
) -> (HostController<SimulatedEngine>, SimulatedEngine, RecordingExporter) {
    let engine = SimulatedEngine::new();
    let exporter = RecordingExporter::new();
    let mut host = HostController::new(
        engine.clone(),
        Box::new(exporter.clone()),
        HostConfig::default(),
    );
    host.init();
    host.start_discovery("scanner").expect("discovery");
    for (address, appearance) in devices {
        let [lo, hi] = appearance.to_le_bytes();
        host.handle_engine_event(EngineEvent::DeviceDiscovered(DiscoveryReport {
            address: address.to_string(),
            advertised_address: address.to_string(),
            address_type: AddressType::Public,
            rssi: -40,
            eir: vec![0x03, 0x19, lo, hi],
        }));
    }
    (host, engine, exporter)
}

fn gatt(conn_id: u32, state: ConnectState) -> EngineEvent {
    EngineEvent::GattConnectionStateChanged {
        conn_id: ConnectionId(conn_id),
        state,
    }
}

fn paired_event(address: &str) -> EngineEvent {
    EngineEvent::PairStateChanged {
        address: address.to_string(),
        state: PairState::Paired,
        error: PairError::None,
        identity_address: None,
    }
}

#[test]
fn test_connected_event_matched_by_id() {
    let (mut host, engine, exporter) = host_with_devices(&[(KEYBOARD, 0x03c1)]);
    engine.set_next_conn_id(7);

    let (tx, mut rx) = channel("Connect");
    host.connect(KEYBOARD, tx);
    assert!(rx.try_take().is_none());
    assert!(host.connections().is_attempting(KEYBOARD));

    // A stray id resolves nothing.
    host.handle_engine_event(gatt(17, ConnectState::Connected));
    assert!(rx.try_take().is_none());
    assert!(host.connections().is_attempting(KEYBOARD));

    host.handle_engine_event(gatt(7, ConnectState::Connected));
    assert!(matches!(rx.try_take(), Some(Ok(()))));
    assert!(host.connections().is_connected(KEYBOARD));
    assert!(!host.connections().is_attempting(KEYBOARD));
    assert_eq!(
        exporter.property(&device_object_path(KEYBOARD), "Connected"),
        Some(PropertyValue::Bool(true))
    );

    let commands = engine.commands();
    assert!(commands.contains(&EngineCommand::StartEncryption { conn_id: 7 }));
    assert!(commands
        .iter()
        .any(|c| matches!(c, EngineCommand::HidAttach { conn_id: 7, .. })));

    println!("✓ Connect resolves only on its own connection id");
}

#[test]
fn test_operations_are_exclusive_per_device() {
    let (mut host, engine, _exporter) = host_with_devices(&[(KEYBOARD, 0x03c1)]);
    engine.set_next_conn_id(5);

    let (first_tx, _first_rx) = channel("Connect");
    host.connect(KEYBOARD, first_tx);

    let (second_tx, mut second_rx) = channel("Connect");
    host.connect(KEYBOARD, second_tx);
    assert!(matches!(
        second_rx.try_take(),
        Some(Err(BluetoothError::InProgress(_)))
    ));

    let (disc_tx, mut disc_rx) = channel("Disconnect");
    host.disconnect(KEYBOARD, disc_tx);
    assert!(matches!(
        disc_rx.try_take(),
        Some(Err(BluetoothError::InProgress(_)))
    ));
    assert_eq!(engine.gatt_connect_count(), 1);

    host.handle_engine_event(gatt(5, ConnectState::Connected));
    let (again_tx, mut again_rx) = channel("Connect");
    host.connect(KEYBOARD, again_tx);
    assert!(matches!(
        again_rx.try_take(),
        Some(Err(BluetoothError::AlreadyExists(_)))
    ));
}

#[test]
fn test_unknown_and_unconnected_devices() {
    let (mut host, _engine, _exporter) = host_with_devices(&[(KEYBOARD, 0x03c1)]);

    let (tx, mut rx) = channel("Connect");
    host.connect(SPEAKER, tx);
    assert!(matches!(rx.try_take(), Some(Err(BluetoothError::DoesNotExist(_)))));

    let (tx, mut rx) = channel("Disconnect");
    host.disconnect(KEYBOARD, tx);
    assert!(matches!(rx.try_take(), Some(Err(BluetoothError::NotConnected(_)))));
}

#[test]
fn test_connect_failure_and_engine_rejection() {
    let (mut host, engine, exporter) = host_with_devices(&[(KEYBOARD, 0x03c1)]);

    engine.update_faults(|f| f.reject_connect = true);
    let (tx, mut rx) = channel("Connect");
    host.connect(KEYBOARD, tx);
    assert!(matches!(rx.try_take(), Some(Err(BluetoothError::Failed(_)))));
    assert!(!host.connections().has_session(KEYBOARD));

    engine.update_faults(|f| f.reject_connect = false);
    engine.set_next_conn_id(9);
    let (tx, mut rx) = channel("Connect");
    host.connect(KEYBOARD, tx);
    host.handle_engine_event(gatt(9, ConnectState::Error));
    assert!(matches!(rx.try_take(), Some(Err(BluetoothError::Failed(_)))));
    assert!(!host.connections().is_attempting(KEYBOARD));
    assert_eq!(
        exporter.property(&device_object_path(KEYBOARD), "Connected"),
        Some(PropertyValue::Bool(false))
    );
}

#[test]
fn test_failed_attempt_frees_the_device() {
    let (mut host, engine, _exporter) = host_with_devices(&[(KEYBOARD, 0x03c1)]);
    engine.set_next_conn_id(3);

    let (conn_tx, mut conn_rx) = channel("Connect");
    host.connect(KEYBOARD, conn_tx);
    host.handle_engine_event(gatt(3, ConnectState::Disconnected));
    assert!(matches!(conn_rx.try_take(), Some(Err(BluetoothError::Failed(_)))));
    assert!(!host.connections().has_session(KEYBOARD));

    // A repeated callback for the finished attempt is ignored.
    host.handle_engine_event(gatt(3, ConnectState::Disconnected));

    let (conn_tx, mut conn_rx) = channel("Connect");
    host.connect(KEYBOARD, conn_tx);
    assert!(host.connections().is_attempting(KEYBOARD));
    host.handle_engine_event(gatt(4, ConnectState::Connected));
    assert!(matches!(conn_rx.try_take(), Some(Ok(()))));
}

#[test]
fn test_client_and_peer_disconnects() {
    let (mut host, engine, _exporter) = host_with_devices(&[(KEYBOARD, 0x03c1)]);
    host.handle_engine_event(paired_event(KEYBOARD));
    host.stop_discovery("scanner").expect("stop");
    assert_eq!(host.scan_state(), ScanState::PassiveScan);

    engine.set_next_conn_id(20);
    let (tx, mut rx) = channel("Connect");
    host.connect(KEYBOARD, tx);
    host.handle_engine_event(gatt(20, ConnectState::Connected));
    assert!(matches!(rx.try_take(), Some(Ok(()))));
    assert_eq!(host.scan_state(), ScanState::Idle);

    // Peer drops the link: background scanning comes back.
    host.handle_engine_event(gatt(20, ConnectState::Disconnected));
    assert!(!host.connections().is_connected(KEYBOARD));
    assert_eq!(host.scan_state(), ScanState::PassiveScan);
    assert!(engine.commands().contains(&EngineCommand::HidDetach { hid_id: 1 }));

    // Reconnect, then disconnect on request: no background scan.
    let (tx, _rx) = channel("Connect");
    host.connect(KEYBOARD, tx);
    host.handle_engine_event(gatt(21, ConnectState::Connected));
    assert_eq!(host.scan_state(), ScanState::Idle);

    let (tx, mut rx) = channel("Disconnect");
    host.disconnect(KEYBOARD, tx);
    assert!(rx.try_take().is_none());
    assert!(engine
        .commands()
        .contains(&EngineCommand::GattDisconnect { conn_id: 21 }));

    host.handle_engine_event(gatt(21, ConnectState::DisconnectedByUs));
    assert!(matches!(rx.try_take(), Some(Ok(()))));
    assert!(!host.needs_background_scan());
    assert_eq!(host.scan_state(), ScanState::Idle);
}

#[test]
fn test_hid_attach_follows_appearance() {
    let (mut host, engine, _exporter) =
        host_with_devices(&[(KEYBOARD, 0x03c1), (SPEAKER, 0x0841)]);
    engine.set_next_conn_id(30);

    let (tx, _rx) = channel("Connect");
    host.connect(KEYBOARD, tx);
    let (tx, _rx) = channel("Connect");
    host.connect(SPEAKER, tx);

    host.handle_engine_event(gatt(30, ConnectState::Connected));
    host.handle_engine_event(gatt(31, ConnectState::Connected));

    let attached: Vec<u32> = engine
        .commands()
        .iter()
        .filter_map(|c| match c {
            EngineCommand::HidAttach { conn_id, .. } => Some(*conn_id),
            _ => None,
        })
        .collect();
    assert_eq!(attached, vec![30]);
    assert!(host
        .connections()
        .connection(KEYBOARD)
        .and_then(|c| c.hid_id)
        .is_some());
    assert!(host
        .connections()
        .connection(SPEAKER)
        .and_then(|c| c.hid_id)
        .is_none());
}

#[test]
fn test_removal_tears_down_link() {
    let (mut host, engine, exporter) = host_with_devices(&[(KEYBOARD, 0x03c1)]);
    engine.set_next_conn_id(12);

    let (tx, _rx) = channel("Connect");
    host.connect(KEYBOARD, tx);
    host.handle_engine_event(gatt(12, ConnectState::Connected));

    host.remove_device(KEYBOARD).expect("remove");
    let commands = engine.commands();
    assert!(commands.contains(&EngineCommand::HidDetach { hid_id: 1 }));
    assert!(commands.contains(&EngineCommand::GattDisconnect { conn_id: 12 }));
    assert!(!exporter.is_exported(&device_object_path(KEYBOARD)));

    // The disconnect callback for the removed link matches nothing.
    exporter.clear_events();
    host.handle_engine_event(gatt(12, ConnectState::DisconnectedByUs));
    assert!(exporter.events().is_empty());
    assert!(!host.registry().contains(KEYBOARD));
}

#[test]
fn test_removal_answers_pending_connect() {
    let (mut host, engine, _exporter) = host_with_devices(&[(KEYBOARD, 0x03c1)]);
    engine.set_next_conn_id(4);

    let (tx, mut rx) = channel("Connect");
    host.connect(KEYBOARD, tx);
    host.remove_device(KEYBOARD).expect("remove");

    assert!(matches!(rx.try_take(), Some(Err(BluetoothError::Failed(_)))));
    assert!(engine
        .commands()
        .contains(&EngineCommand::GattDisconnect { conn_id: 4 }));

    // Connected arriving late for the removed attempt is ignored.
    host.handle_engine_event(gatt(4, ConnectState::Connected));
    assert!(!host.connections().is_connected(KEYBOARD));
}

#[test]
fn test_pairing_a_connected_device_needs_no_background_scan() {
    let (mut host, engine, _exporter) = host_with_devices(&[(KEYBOARD, 0x03c1)]);
    engine.set_next_conn_id(7);

    let (tx, mut connect) = channel("Connect");
    host.connect(KEYBOARD, tx);
    host.handle_engine_event(gatt(7, ConnectState::Connected));
    assert!(matches!(connect.try_take(), Some(Ok(()))));

    let (tx, mut pair) = channel("Pair");
    host.pair(KEYBOARD, tx);
    host.handle_engine_event(paired_event(KEYBOARD));
    assert!(matches!(pair.try_take(), Some(Ok(()))));
    assert!(!host.needs_background_scan());

    host.stop_discovery("scanner").expect("stop");
    assert_eq!(host.scan_state(), ScanState::Idle);

    // Losing the link to the peer brings the background scan back.
    host.handle_engine_event(gatt(7, ConnectState::Disconnected));
    assert!(host.needs_background_scan());
    assert_eq!(host.scan_state(), ScanState::PassiveScan);
    println!("✓ Paired while connected keeps the radio idle");
}

struct LinkLog(std::sync::Arc<parking_lot::Mutex<Vec<String>>>);

impl DeviceObserver for LinkLog {
    fn on_gatt_connect_failed(&mut self, address: &str) {
        self.0.lock().push(format!("connect failed {}", address));
    }

    fn on_gatt_disconnected(&mut self, address: &str, conn_id: ConnectionId, intentional: bool) {
        self.0
            .lock()
            .push(format!("disconnected {} {} {}", address, conn_id.0, intentional));
    }

    fn on_device_removed(&mut self, address: &str) {
        self.0.lock().push(format!("removed {}", address));
    }
}

#[test]
fn test_removal_reports_the_link_ending_once() {
    let (mut host, engine, _exporter) = host_with_devices(&[(KEYBOARD, 0x03c1), (SPEAKER, 0x0841)]);
    let seen = std::sync::Arc::new(parking_lot::Mutex::new(Vec::new()));
    host.add_observer(Box::new(LinkLog(seen.clone())));

    engine.set_next_conn_id(7);
    let (tx, _connect) = channel("Connect");
    host.connect(KEYBOARD, tx);
    host.handle_engine_event(gatt(7, ConnectState::Connected));

    host.remove_device(KEYBOARD).expect("remove");
    host.handle_engine_event(gatt(7, ConnectState::DisconnectedByUs));

    engine.set_next_conn_id(9);
    let (tx, _attempt) = channel("Connect");
    host.connect(SPEAKER, tx);
    host.remove_device(SPEAKER).expect("remove");
    host.handle_engine_event(gatt(9, ConnectState::Connected));

    assert_eq!(
        *seen.lock(),
        vec![
            format!("disconnected {} 7 true", KEYBOARD),
            format!("removed {}", KEYBOARD),
            format!("connect failed {}", SPEAKER),
            format!("removed {}", SPEAKER),
        ]
    );
    println!("✓ Removal reports the link ending exactly once");
}
