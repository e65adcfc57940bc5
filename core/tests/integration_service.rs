// Integration tests for the host service task
//
// Requests and Link Engine callbacks travel through one HostHandle queue and
// are handled in arrival order.

use lehost_core::*;

const BAND: &str = "AA:BB:CC:DD:EE:FF";

fn start(engine: SimulatedEngine) -> (HostHandle, tokio::task::JoinHandle<HostController<SimulatedEngine>>, RecordingExporter) {
    let exporter = RecordingExporter::new();
    let mut controller = HostController::new(
        engine,
        Box::new(exporter.clone()),
        HostConfig::default(),
    );
    controller.init();
    let (handle, task) = spawn(controller);
    (handle, task, exporter)
}

fn discovered(address: &str) -> EngineEvent {
    EngineEvent::DeviceDiscovered(DiscoveryReport {
        address: address.to_string(),
        advertised_address: address.to_string(),
        address_type: AddressType::Random,
        rssi: -65,
        eir: vec![0x05, 0x09, b'B', b'a', b'n', b'd'],
    })
}

#[tokio::test]
async fn test_pair_and_connect_through_the_queue() {
    let engine = SimulatedEngine::new();
    engine.set_next_conn_id(7);
    let (handle, task, exporter) = start(engine.clone());

    handle.start_discovery(":1.42").await.expect("discovery");
    handle.engine_event(discovered(BAND)).await.expect("report");

    let mut pair = handle.pair(BAND).await;
    handle.flush().await.expect("flush");
    assert!(pair.try_take().is_none());
    assert_eq!(
        handle.status().await.expect("status").pairing_with,
        Some(BAND.to_string())
    );

    handle
        .engine_event(EngineEvent::PairStateChanged {
            address: BAND.to_string(),
            state: PairState::Paired,
            error: PairError::None,
            identity_address: None,
        })
        .await
        .expect("pair callback");
    pair.await.expect("paired");

    let connect = handle.connect(BAND).await;
    handle
        .engine_event(EngineEvent::GattConnectionStateChanged {
            conn_id: ConnectionId(7),
            state: ConnectState::Connected,
        })
        .await
        .expect("gatt callback");
    connect.await.expect("connected");

    handle.stop_discovery(":1.42").await.expect("stop");
    let status = handle.status().await.expect("status");
    assert_eq!(status.scan_state, ScanState::Idle);
    assert_eq!(status.devices, 1);
    assert_eq!(status.pairing_with, None);

    let path = lehost_core::exporter::device_object_path(BAND);
    assert_eq!(exporter.property(&path, "Paired"), Some(PropertyValue::Bool(true)));
    assert_eq!(exporter.property(&path, "Connected"), Some(PropertyValue::Bool(true)));

    handle.shutdown().await.expect("shutdown");
    let controller = task.await.expect("task joined");
    assert!(controller.connections().is_connected(BAND));

    println!("✓ Pair and connect complete through the host service");
}

#[tokio::test]
async fn test_cloned_handles_share_one_host() {
    let (handle, _task, _exporter) = start(SimulatedEngine::new());
    let other = handle.clone();

    handle.start_discovery(":1.1").await.expect("first client");
    other.start_discovery(":1.2").await.expect("second client");
    assert_eq!(handle.status().await.expect("status").discovery_clients, 2);

    other.client_vanished(":1.2").await.expect("vanish queued");
    handle.stop_discovery(":1.1").await.expect("stop");
    let status = other.status().await.expect("status");
    assert_eq!(status.discovery_clients, 0);
    assert_eq!(status.scan_state, ScanState::Idle);
}

#[tokio::test]
async fn test_device_methods_and_adapter_flags() {
    let (handle, _task, exporter) = start(SimulatedEngine::new());
    handle.start_discovery(":1.1").await.expect("discovery");
    handle.engine_event(discovered(BAND)).await.expect("report");

    handle.set_alias(BAND, "Wrist").await.expect("alias");
    handle.set_trusted(BAND, true).await.expect("trusted");
    assert!(matches!(
        handle.set_alias("11:22:33:44:55:66", "x").await,
        Err(BluetoothError::DoesNotExist(_))
    ));

    handle.set_stack_sync_quitting(true).await.expect("flag");
    let status = handle.status().await.expect("status");
    assert!(status.stack_sync_quitting);
    assert_eq!(
        exporter.adapter_property("StackSyncQuitting"),
        Some(PropertyValue::Bool(true))
    );

    let path = lehost_core::exporter::device_object_path(BAND);
    assert_eq!(
        exporter.property(&path, "Alias"),
        Some(PropertyValue::Str("Wrist".to_string()))
    );

    handle.remove_device(BAND).await.expect("remove");
    handle.remove_device(BAND).await.expect("remove again");
    assert_eq!(handle.status().await.expect("status").devices, 0);
}

#[tokio::test]
async fn test_suspend_through_the_queue() {
    let (handle, _task, _exporter) = start(SimulatedEngine::new());
    handle.start_discovery(":1.1").await.expect("discovery");

    handle.suspend_imminent().await.await.expect("suspend acked");
    let status = handle.status().await.expect("status");
    assert_eq!(status.suspend_state, SuspendResumeState::SuspendImminentAcked);
    assert_eq!(status.scan_state, ScanState::Idle);

    handle.suspend_done().await.await.expect("resumed");
    let status = handle.status().await.expect("status");
    assert_eq!(status.suspend_state, SuspendResumeState::Running);
    assert_eq!(status.scan_state, ScanState::ActiveScan);
}

#[tokio::test]
async fn test_shutdown_abandons_held_replies() {
    let (handle, task, _exporter) = start(SimulatedEngine::new());
    handle.start_discovery(":1.1").await.expect("discovery");
    handle.engine_event(discovered(BAND)).await.expect("report");

    let pair = handle.pair(BAND).await;
    handle.shutdown().await.expect("shutdown");
    let controller = task.await.expect("task joined");
    drop(controller);

    assert!(matches!(pair.await, Err(BluetoothError::Failed(_))));
}
