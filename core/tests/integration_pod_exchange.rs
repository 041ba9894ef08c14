//! Pod requests end to end: pod service, queue, radio selection and the
//! simulated radios behind them

use podlink_core::ble::sim::{
    SimApplication, SimDevice, SimDeviceConfig, SimulatedBle, COMMAND_CHARACTERISTIC,
    RESPONSE_CHARACTERISTIC,
};
use podlink_core::ble::{NativeDevice, PeripheralAdapter};
use podlink_core::config::{LinkConfig, ProbeConfig, QueueConfig, RadioOptions};
use podlink_core::pod::{
    BleRadioProvider, CharacteristicProtocol, PodContext, PodProgress, PodService, PodState,
    ProbeEvent, ProbeState, RadioRecord, RadioRegistry,
};
use podlink_core::store::{MemoryStorage, PodRepository, StoredPodRepository};
use podlink_core::LinkError;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

fn service() -> Uuid {
    Uuid::from_u128(0x0235733b_99c5_4197_b856_69219c2a3845)
}

struct World {
    sim: Arc<SimulatedBle>,
    repository: Arc<StoredPodRepository<MemoryStorage>>,
    pods: Arc<PodService>,
}

impl World {
    fn new(config: LinkConfig) -> Self {
        let sim = SimulatedBle::new();
        let adapter = PeripheralAdapter::new(
            sim.clone(),
            SimApplication::new(),
            vec![service()],
            config.adapter.clone(),
        );
        let protocol = CharacteristicProtocol::new(service(), COMMAND_CHARACTERISTIC, RESPONSE_CHARACTERISTIC);
        let mut registry = RadioRegistry::new();
        registry.register(Arc::new(BleRadioProvider::new(
            service(),
            adapter,
            Arc::new(protocol),
            config.lease.clone(),
        )));

        let repository = Arc::new(StoredPodRepository::new(MemoryStorage::new()));
        let pods = PodService::new(PodContext {
            repository: repository.clone(),
            registry: Arc::new(registry),
            config,
        });
        sim.start_advertising(Duration::from_secs(1));
        Self {
            sim,
            repository,
            pods,
        }
    }

    fn radio(&self, name: &str) -> (Arc<SimDevice>, RadioRecord) {
        self.radio_with(SimDeviceConfig::new(name, service()))
    }

    fn radio_with(&self, config: SimDeviceConfig) -> (Arc<SimDevice>, RadioRecord) {
        let name = config.name.clone();
        let device = self.sim.add_device(config);
        let record = RadioRecord::new(service(), device.id(), Some(name));
        (device, record)
    }
}

fn no_probing() -> ProbeConfig {
    ProbeConfig {
        initial_delay_ms: 24 * 60 * 60 * 1000,
        ..ProbeConfig::default()
    }
}

fn quiet_config() -> LinkConfig {
    LinkConfig {
        probe: no_probing(),
        ..LinkConfig::default()
    }
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_radio_falls_through_to_next() {
    let world = World::new(quiet_config());
    let (_dead, dead_record) = world.radio_with(SimDeviceConfig::new("dead", service()).unreachable());
    let (live, live_record) = world.radio("live");
    let cancel = CancellationToken::new();

    let pod = world
        .pods
        .create_pod(1, 100, vec![dead_record, live_record.clone()], &cancel)
        .await
        .unwrap();
    let record = pod
        .bolus_request(b"B1".to_vec(), &cancel)
        .unwrap()
        .response()
        .await
        .unwrap();

    assert_eq!(record.radio_id, Some(live_record.id));
    assert_eq!(live.commands(), vec![b"B1".to_vec()]);
    assert_eq!(pod.queue().selector().preferred(), Some(live_record.id));
    pod.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_missing_radio_fails_every_request_in_order() {
    let world = World::new(quiet_config());
    let ghost = RadioRecord::new(service(), Uuid::new_v4(), Some("ghost".into()));
    let cancel = CancellationToken::new();

    let pod = world.pods.create_pod(2, 200, vec![ghost], &cancel).await.unwrap();
    let handles: Vec<_> = (1..=3u8)
        .map(|n| pod.bolus_request(vec![n], &cancel).unwrap())
        .collect();
    for handle in handles {
        let result = handle.response().await;
        assert!(matches!(result, Err(LinkError::RadioNotReachable(_))), "{:?}", result);
    }

    let history = world.repository.exchanges_for_pod(pod.id()).unwrap();
    let commands: Vec<_> = history.iter().map(|r| r.command.clone()).collect();
    assert_eq!(commands, vec![vec![1], vec![2], vec![3]]);
    assert_eq!(pod.running_state().last_radio_contact, None);
    pod.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_single_pod_requests_never_overlap() {
    let world = World::new(quiet_config());
    let (device, record) = world.radio("RL");
    let cancel = CancellationToken::new();
    let pod = world.pods.create_pod(3, 300, vec![record], &cancel).await.unwrap();

    device.hold_responses();
    let handles: Vec<_> = (1..=3u8)
        .map(|n| pod.bolus_request(vec![n], &cancel).unwrap())
        .collect();

    tokio::time::sleep(Duration::from_secs(5)).await;
    // the first exchange is stalled, nothing else reached the radio
    assert_eq!(device.commands(), vec![vec![1]]);
    assert_eq!(pod.queue().pending_count(), 2);

    device.release_responses();
    for handle in handles {
        tokio_test::assert_ok!(handle.response().await);
    }
    assert_eq!(device.commands(), vec![vec![1], vec![2], vec![3]]);
    // the connection was held across the backlog
    assert_eq!(device.connect_count(), 1);
    assert!(!device.is_connected());
    pod.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_pods_exchange_concurrently() {
    let world = World::new(LinkConfig {
        queue: QueueConfig {
            exchange_timeout_ms: 60_000,
            ..QueueConfig::default()
        },
        ..quiet_config()
    });
    let (first_device, first_radio) = world.radio("first");
    let (second_device, second_radio) = world.radio("second");
    let cancel = CancellationToken::new();
    let first = world.pods.create_pod(4, 400, vec![first_radio], &cancel).await.unwrap();
    let second = world.pods.create_pod(4, 401, vec![second_radio], &cancel).await.unwrap();

    first_device.hold_responses();
    second_device.hold_responses();
    let first_handle = first.bolus_request(b"first".to_vec(), &cancel).unwrap();
    let second_handle = second.bolus_request(b"second".to_vec(), &cancel).unwrap();

    tokio::time::sleep(Duration::from_secs(10)).await;
    // both radios are mid-exchange at the same time
    assert_eq!(first_device.commands(), vec![b"first".to_vec()]);
    assert_eq!(second_device.commands(), vec![b"second".to_vec()]);

    second_device.release_responses();
    let record = second_handle.response().await.unwrap();
    assert_eq!(record.response, Some(b"OKsecond".to_vec()));

    first_device.release_responses();
    let record = first_handle.response().await.unwrap();
    assert_eq!(record.response, Some(b"OKfirst".to_vec()));

    first.shutdown().await;
    second.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_exchange_timeout_then_recovery() {
    let world = World::new(quiet_config());
    let (device, record) = world.radio("RL");
    let cancel = CancellationToken::new();
    let pod = world.pods.create_pod(5, 500, vec![record], &cancel).await.unwrap();

    device.hold_responses();
    let stalled = pod.bolus_request(vec![1], &cancel).unwrap().response().await;
    assert_eq!(stalled, Err(LinkError::ExchangeTimeout(Duration::from_secs(10))));
    assert!(!device.is_connected());

    device.release_responses();
    let record = pod.bolus_request(vec![2], &cancel).unwrap().response().await.unwrap();
    assert!(record.is_success());
    assert_eq!(device.connect_count(), 2);

    let history = world.repository.exchanges_for_pod(pod.id()).unwrap();
    assert_eq!(history.len(), 2);
    assert!(!history[0].is_success());
    assert!(history[1].is_success());
    pod.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_probe_interval_follows_outcome() {
    let world = World::new(LinkConfig {
        probe: ProbeConfig {
            initial_delay_ms: 1_000,
            ..ProbeConfig::default()
        },
        ..LinkConfig::default()
    });
    let options = RadioOptions {
        status_check_interval_good_ms: 120_000,
        status_check_interval_bad_ms: 20_000,
    };
    let (device, record) = world.radio("RL");
    device.set_responder(|_| b"ERR".to_vec());
    let cancel = CancellationToken::new();
    let pod = world
        .pods
        .create_pod(6, 600, vec![record.with_options(options)], &cancel)
        .await
        .unwrap();
    let mut events = pod.probe().events();

    assert_eq!(
        events.recv().await.unwrap(),
        ProbeEvent::Completed {
            success: false,
            next_interval: Duration::from_secs(20),
        }
    );

    device.set_responder(|_| b"OK".to_vec());
    assert_eq!(
        events.recv().await.unwrap(),
        ProbeEvent::Completed {
            success: true,
            next_interval: Duration::from_secs(120),
        }
    );
    assert_eq!(device.commands(), vec![b"STATE".to_vec(), b"STATE".to_vec()]);
    assert!(pod.running_state().last_radio_contact.is_some());
    pod.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_stop_during_probe_ends_probing() {
    let world = World::new(LinkConfig {
        probe: ProbeConfig {
            initial_delay_ms: 1_000,
            ..ProbeConfig::default()
        },
        ..LinkConfig::default()
    });
    let (device, record) = world.radio("RL");
    device.hold_responses();
    let cancel = CancellationToken::new();
    let pod = world.pods.create_pod(7, 700, vec![record], &cancel).await.unwrap();
    let mut events = pod.probe().events();
    let mut states = pod.probe().state_changes();

    states.wait_for(|s| *s == ProbeState::Running).await.unwrap();
    pod.stop_probing().await;
    assert_eq!(pod.probe().state(), ProbeState::Stopped);

    device.release_responses();
    tokio::time::sleep(Duration::from_secs(600)).await;
    assert!(events.try_recv().is_err());
    assert!(device.commands().len() <= 1);
    pod.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_progress_in_response_updates_running_state() {
    let world = World::new(quiet_config());
    let (device, record) = world.radio("RL");
    device.set_responder(|_| b"OK progress=Running".to_vec());
    let cancel = CancellationToken::new();
    let pod = world.pods.create_pod(8, 800, vec![record], &cancel).await.unwrap();
    assert_eq!(pod.running_state().state, PodState::Unknown);

    let mut changes = pod.running_state_changes();
    let record = pod
        .activation_request(b"ACT".to_vec(), &cancel)
        .unwrap()
        .response()
        .await
        .unwrap();
    assert_eq!(record.progress, Some(PodProgress::Running));

    changes.wait_for(|s| s.state == PodState::Started).await.unwrap();
    assert!(pod.running_state().last_radio_contact.is_some());
    pod.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_restart_restores_running_state() {
    let world = World::new(quiet_config());
    let (device, record) = world.radio("RL");
    device.set_responder(|_| b"OK progress=RunningLow".to_vec());
    let cancel = CancellationToken::new();
    let pod = world.pods.create_pod(9, 900, vec![record], &cancel).await.unwrap();
    tokio_test::assert_ok!(pod.bolus_request(vec![9], &cancel).unwrap().response().await);
    world.pods.shutdown().await;

    // a second service over the same repository picks the pod back up
    let restarted = PodService::new(PodContext {
        repository: world.repository.clone(),
        registry: Arc::new(RadioRegistry::new()),
        config: quiet_config(),
    });
    assert_eq!(restarted.start(&cancel).await.unwrap(), 1);
    let pod = restarted.find_by_identity(9, 900, &cancel).await.unwrap().unwrap();
    assert_eq!(pod.running_state().state, PodState::Started);
    assert!(pod.running_state().last_radio_contact.is_some());
    restarted.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_mid_exchange_disconnects_radio() {
    let world = World::new(quiet_config());
    let (device, record) = world.radio("RL");
    let cancel = CancellationToken::new();
    let pod = world.pods.create_pod(10, 1000, vec![record], &cancel).await.unwrap();

    device.hold_responses();
    let handle = pod.bolus_request(vec![1], &cancel).unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(device.is_connected());
    assert_eq!(device.commands(), vec![vec![1]]);

    pod.shutdown().await;
    assert_eq!(handle.response().await, Err(LinkError::QueueClosed));
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(!device.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_archived_pod_stops_probing() {
    let world = World::new(LinkConfig {
        probe: ProbeConfig {
            initial_delay_ms: 1_000,
            ..ProbeConfig::default()
        },
        ..LinkConfig::default()
    });
    let (device, record) = world.radio("RL");
    let cancel = CancellationToken::new();
    let pod = world.pods.create_pod(11, 1100, vec![record], &cancel).await.unwrap();
    let mut events = pod.probe().events();
    tokio_test::assert_ok!(events.recv().await);

    world.pods.archive(pod.id()).await.unwrap();
    let probes = device.commands().len();
    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(device.commands().len(), probes);
    assert_eq!(pod.probe().state(), ProbeState::Stopped);
    assert_eq!(
        world.pods.archive(pod.id()).await,
        Err(LinkError::PodNotFound(pod.id()))
    );
}
