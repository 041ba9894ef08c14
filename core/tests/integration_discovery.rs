//! Adapter, scanner and discovery behavior against the simulated stack

use futures::StreamExt;
use podlink_core::ble::sim::{
    SimApplication, SimDeviceConfig, SimulatedBle, COMMAND_CHARACTERISTIC, RESPONSE_CHARACTERISTIC,
};
use podlink_core::ble::{
    AdapterStatus, ConnectionStatus, DiscoveryState, NativeDevice, PeripheralAdapter, ScannerState,
};
use podlink_core::config::{AdapterConfig, LeaseConfig};
use podlink_core::pod::{BleRadio, CharacteristicProtocol, RadioRecord};
use podlink_core::LinkError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

fn service() -> Uuid {
    Uuid::from_u128(0x0235733b_99c5_4197_b856_69219c2a3845)
}

fn world() -> (Arc<SimulatedBle>, Arc<SimApplication>, Arc<PeripheralAdapter>) {
    let sim = SimulatedBle::new();
    let app = SimApplication::new();
    let adapter = PeripheralAdapter::new(
        sim.clone(),
        app.clone(),
        vec![service()],
        AdapterConfig::default(),
    );
    (sim, app, adapter)
}

fn state_of(adapter: &PeripheralAdapter, id: Uuid) -> Option<DiscoveryState> {
    adapter
        .get_peripheral(id, service())
        .discovery_state()
        .map(|(state, _)| state)
}

#[tokio::test(start_paused = true)]
async fn test_adapter_off_without_power_on_event() {
    let (sim, _app, adapter) = world();
    sim.set_adapter_status(AdapterStatus::PoweredOff);
    sim.set_power_on_responds(false);

    let started = Instant::now();
    let result = adapter
        .ensure_adapter_enabled(Duration::from_secs(5), &CancellationToken::new())
        .await;

    assert_eq!(result, Err(LinkError::AdapterNotEnabled));
    assert!(started.elapsed() >= Duration::from_secs(5));
    assert_eq!(sim.power_on_requests(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_adapter_off_blocks_arbitration() {
    let (sim, app, adapter) = world();
    sim.set_adapter_status(AdapterStatus::PoweredOff);
    sim.set_adapter_controllable(false);
    let _sub = adapter.scanner().subscribe();

    let result = adapter
        .acquire_connection_arbitration(Duration::from_secs(5), &CancellationToken::new())
        .await;
    assert!(matches!(result, Err(LinkError::AdapterNotEnabled)));
    assert_eq!(app.keep_awake_held(), 0);
    assert!(!adapter.scanner().is_paused());
}

#[tokio::test(start_paused = true)]
async fn test_arbitration_strictly_sequential() {
    let (_sim, _app, adapter) = world();
    let inside = Arc::new(AtomicUsize::new(0));
    let max_inside = Arc::new(AtomicUsize::new(0));

    let tasks: Vec<_> = (0..3)
        .map(|_| {
            let adapter = adapter.clone();
            let inside = inside.clone();
            let max_inside = max_inside.clone();
            tokio::spawn(async move {
                let guard = adapter
                    .acquire_connection_arbitration(Duration::from_secs(60), &CancellationToken::new())
                    .await
                    .unwrap();
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_inside.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(300)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
                guard.release().await;
            })
        })
        .collect();

    for task in tasks {
        task.await.unwrap();
    }
    assert_eq!(max_inside.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_while_waiting_for_arbitration() {
    let (_sim, app, adapter) = world();
    let _sub = adapter.scanner().subscribe();
    let holder = adapter
        .acquire_connection_arbitration(Duration::from_secs(5), &CancellationToken::new())
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let waiter = {
        let adapter = adapter.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            adapter
                .acquire_connection_arbitration(Duration::from_secs(30), &cancel)
                .await
                .map(|_| ())
        })
    };
    tokio::time::sleep(Duration::from_secs(1)).await;
    cancel.cancel();
    assert_eq!(waiter.await.unwrap(), Err(LinkError::OperationCanceled));

    holder.release().await;
    assert_eq!(adapter.scanner().state(), ScannerState::Scanning);
    // only the scanner's own keep-awake remains
    assert_eq!(app.keep_awake_held(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_settle_leaves_scanner_running() {
    let (_sim, app, adapter) = world();
    let _sub = adapter.scanner().subscribe();
    let cancel = CancellationToken::new();

    let acquisition = {
        let adapter = adapter.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            adapter
                .acquire_connection_arbitration(Duration::from_secs(5), &cancel)
                .await
                .map(|_| ())
        })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(adapter.scanner().is_paused());
    cancel.cancel();

    assert_eq!(acquisition.await.unwrap(), Err(LinkError::OperationCanceled));
    assert!(!adapter.scanner().is_paused());
    assert!(adapter.scanner().is_scanning());
    assert_eq!(app.keep_awake_held(), 1);

    // the lock is free again
    let guard = adapter
        .acquire_connection_arbitration(Duration::from_secs(1), &CancellationToken::new())
        .await;
    tokio_test::assert_ok!(&guard);
}

#[tokio::test(start_paused = true)]
async fn test_vanished_peripheral_reaches_not_found() {
    let (sim, _app, adapter) = world();
    let steady = sim.add_device(SimDeviceConfig::new("steady", service()));
    let fleeting = sim.add_device(SimDeviceConfig::new("fleeting", service()));

    // first cycle sees both
    {
        let mut discovery = adapter.discover_peripherals();
        let mut seen = Vec::new();
        while seen.len() < 2 {
            seen.push(discovery.next().await.unwrap().unwrap().id());
        }
        assert!(seen.contains(&steady.id()));
        assert!(seen.contains(&fleeting.id()));
    }

    fleeting.set_advertising(false);
    // let the replay window forget the old sighting
    tokio::time::sleep(Duration::from_secs(11)).await;

    // second cycle only re-observes the steady device
    {
        let mut discovery = adapter.discover_peripherals();
        let found = discovery.next().await.unwrap().unwrap();
        assert_eq!(found.id(), steady.id());
        assert_eq!(state_of(&adapter, fleeting.id()), Some(DiscoveryState::Searching));
    }

    assert_eq!(state_of(&adapter, fleeting.id()), Some(DiscoveryState::NotFound));
    assert_eq!(state_of(&adapter, steady.id()), Some(DiscoveryState::Discovered));
    assert!(adapter.cached_native_device(fleeting.id()).is_none());
    assert!(adapter.cached_native_device(steady.id()).is_some());
}

#[tokio::test(start_paused = true)]
async fn test_discovery_reports_adapter_error() {
    let (sim, _app, adapter) = world();
    let known = adapter.get_peripheral(Uuid::new_v4(), service());
    sim.set_adapter_status(AdapterStatus::PoweredOff);
    sim.set_adapter_controllable(false);

    let mut discovery = adapter.discover_peripherals();
    let first = discovery.next().await.unwrap();
    assert!(matches!(first, Err(LinkError::AdapterNotEnabled)));
    // never reached Searching, so nothing to resolve
    assert_eq!(known.discovery_state(), None);
}

#[tokio::test(start_paused = true)]
async fn test_adapter_state_streams() {
    let (sim, _app, adapter) = world();
    let mut enabled = adapter.when_adapter_enabled();
    let mut disabled = adapter.when_adapter_disabled();

    assert_eq!(enabled.next().await, Some(()));
    sim.set_adapter_status(AdapterStatus::PoweredOff);
    assert_eq!(disabled.next().await, Some(()));
    sim.set_adapter_status(AdapterStatus::PoweredOn);
    assert_eq!(enabled.next().await, Some(()));
}

#[tokio::test(start_paused = true)]
async fn test_scan_state_follows_discovery() {
    let (sim, _app, adapter) = world();
    sim.add_device(SimDeviceConfig::new("RL", service()));
    let mut states = adapter.scan_state_changes();

    let mut discovery = adapter.discover_peripherals();
    discovery.next().await.unwrap().unwrap();
    assert_eq!(*states.borrow_and_update(), ScannerState::Scanning);

    drop(discovery);
    states.wait_for(|s| *s == ScannerState::Idle).await.unwrap();
    assert_eq!(sim.active_scan_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_discovery_ends_when_scan_cannot_start() {
    let (sim, app, adapter) = world();
    let ghost = adapter.get_peripheral(Uuid::new_v4(), service());
    sim.set_adapter_status(AdapterStatus::Unsupported);

    let mut discovery = adapter.discover_peripherals();
    let first = tokio::time::timeout(Duration::from_secs(600), discovery.next())
        .await
        .expect("discovery must not hang");
    assert!(matches!(first, Some(Err(LinkError::AdapterNotEnabled))));
    assert!(discovery.next().await.is_none());

    assert_eq!(ghost.discovery_state().map(|(s, _)| s), Some(DiscoveryState::NotFound));
    assert!(!adapter.scanner().is_scanning());
    assert_eq!(app.keep_awake_held(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_scan_dying_mid_discovery_ends_discovery() {
    let (sim, _app, adapter) = world();
    let device = sim.add_device(SimDeviceConfig::new("RL", service()));

    let mut discovery = adapter.discover_peripherals();
    assert_eq!(discovery.next().await.unwrap().unwrap().id(), device.id());

    sim.fail_running_scans(LinkError::Native("scan aborted".into()));
    let failure = discovery.next().await.unwrap();
    assert!(matches!(failure, Err(LinkError::Native(_))));
    assert!(discovery.next().await.is_none());
    assert_eq!(state_of(&adapter, device.id()), Some(DiscoveryState::Discovered));
}

#[tokio::test(start_paused = true)]
async fn test_radio_open_bounded_while_arbitration_held() {
    let (sim, _app, adapter) = world();
    let device = sim.add_device(SimDeviceConfig::new("RL", service()));
    {
        let mut discovery = adapter.discover_peripherals();
        discovery.next().await.unwrap().unwrap();
    }

    let radio = BleRadio::new(
        RadioRecord::new(service(), device.id(), Some("RL".into())),
        adapter.clone(),
        Arc::new(CharacteristicProtocol::new(service(), COMMAND_CHARACTERISTIC, RESPONSE_CHARACTERISTIC)),
        LeaseConfig::default(),
    );
    let cancel = CancellationToken::new();
    let held = adapter
        .acquire_connection_arbitration(Duration::from_secs(5), &cancel)
        .await
        .unwrap();

    let started = Instant::now();
    let result = radio.open(Duration::from_secs(5), &cancel).await;
    assert!(matches!(result, Err(LinkError::Timeout(_))));
    assert!(started.elapsed() < Duration::from_secs(6));
    assert_eq!(device.connect_count(), 0);

    held.release().await;
    let lease = radio.open(Duration::from_secs(5), &cancel).await.unwrap();
    assert!(lease.is_connected());
    radio.close(lease).await;
    assert!(!device.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_connect_waits_out_pending_disconnect() {
    let (sim, _app, adapter) = world();
    let device = sim.add_device(
        SimDeviceConfig::new("RL", service()).with_disconnect_delay(Duration::from_secs(2)),
    );
    let cancel = CancellationToken::new();
    let lease = adapter.lease(device.id(), service(), &cancel).await.unwrap();
    lease.connect(false, Duration::from_secs(15), &cancel).await.unwrap();

    device.cancel_connection();
    assert_eq!(device.status(), ConnectionStatus::Disconnecting);

    let started = Instant::now();
    lease.connect(false, Duration::from_secs(15), &cancel).await.unwrap();
    assert!(started.elapsed() >= Duration::from_secs(2));
    assert!(lease.is_connected());
    assert_eq!(device.connect_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_pending_disconnect_outlasting_connect_timeout() {
    let (sim, app, adapter) = world();
    let device = sim.add_device(
        SimDeviceConfig::new("RL", service()).with_disconnect_delay(Duration::from_secs(30)),
    );
    let cancel = CancellationToken::new();
    let lease = adapter.lease(device.id(), service(), &cancel).await.unwrap();
    lease.connect(false, Duration::from_secs(15), &cancel).await.unwrap();

    device.cancel_connection();
    let result = lease.connect(false, Duration::from_secs(3), &cancel).await;
    assert!(matches!(result, Err(LinkError::Timeout(_))));
    assert_eq!(device.status(), ConnectionStatus::Disconnecting);
    assert_eq!(device.connect_count(), 1);
    assert_eq!(app.keep_awake_held(), 0);
}
