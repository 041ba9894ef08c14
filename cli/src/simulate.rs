// `podlink simulate`: simulated pods probing through the in-memory stack

use crate::config::Config;
use anyhow::{Context, Result};
use colored::*;
use podlink_core::ble::sim::{
    SimApplication, SimDeviceConfig, SimulatedBle, COMMAND_CHARACTERISTIC, RESPONSE_CHARACTERISTIC,
};
use podlink_core::ble::{NativeDevice, PeripheralAdapter};
use podlink_core::pod::{
    BleRadioProvider, CharacteristicProtocol, PodContext, PodService, ProbeEvent, RadioRecord,
    RadioRegistry,
};
use podlink_core::store::{MemoryStorage, PodRepository, StoredPodRepository};
use podlink_core::Pod;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Service id advertised by simulated radios
const SIM_SERVICE: Uuid = Uuid::from_u128(0x0235733b_99c5_4197_b856_69219c2a3845);

pub struct SimulateOptions {
    pub pods: usize,
    pub seconds: u64,
    pub flaky: bool,
}

pub async fn run(config: &Config, options: SimulateOptions) -> Result<()> {
    let sim = SimulatedBle::new();
    let app = SimApplication::new();
    let advertising = sim.start_advertising(Duration::from_secs(1));
    let adapter = PeripheralAdapter::new(
        sim.clone(),
        app.clone(),
        vec![SIM_SERVICE],
        config.link.adapter.clone(),
    );

    let protocol = CharacteristicProtocol::new(SIM_SERVICE, COMMAND_CHARACTERISTIC, RESPONSE_CHARACTERISTIC);
    let mut registry = RadioRegistry::new();
    registry.register(Arc::new(BleRadioProvider::new(
        SIM_SERVICE,
        adapter,
        Arc::new(protocol),
        config.link.lease.clone(),
    )));

    let repository = Arc::new(StoredPodRepository::new(MemoryStorage::new()));
    let service = PodService::new(PodContext {
        repository: repository.clone(),
        registry: Arc::new(registry),
        config: config.link.clone(),
    });
    let cancel = CancellationToken::new();

    println!("{}", "Podlink simulation".bold());
    println!(
        "  {} pods, {} seconds{}",
        options.pods,
        options.seconds,
        if options.flaky { ", flaky radios" } else { "" }
    );
    println!();

    for n in 0..options.pods {
        let lot = 1000 + n as u32;
        let primary = sim.add_device(SimDeviceConfig::new(format!("RL-{}-A", n), SIM_SERVICE));
        let backup = sim.add_device(SimDeviceConfig::new(format!("RL-{}-B", n), SIM_SERVICE));
        if options.flaky {
            primary.set_connectable(false);
            let exchanges = AtomicUsize::new(0);
            backup.set_responder(move |command| {
                if exchanges.fetch_add(1, Ordering::SeqCst) % 3 == 2 {
                    b"ERR".to_vec()
                } else {
                    let mut response = b"OK ".to_vec();
                    response.extend_from_slice(command);
                    response
                }
            });
        }

        let radios = [(&primary, "A"), (&backup, "B")]
            .into_iter()
            .map(|(device, label)| {
                RadioRecord::new(SIM_SERVICE, device.id(), Some(format!("RL-{}-{}", n, label)))
                    .with_options(config.link.radio)
            })
            .collect();
        let pod = service
            .create_pod(lot, 1, radios, &cancel)
            .await
            .with_context(|| format!("Failed to create pod {}", lot))?;
        println!("  {} Pod {} ({})", "✓".green(), lot.to_string().bright_cyan(), pod.id());
        tokio::spawn(print_events(pod));
    }
    println!();

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(options.seconds)) => {}
        _ = tokio::signal::ctrl_c() => println!("Interrupted"),
    }
    cancel.cancel();

    println!();
    println!("{}", "Summary".bold());
    for pod in service.active_pods() {
        let record = pod.record();
        let state = pod.running_state();
        let exchanges = repository.exchanges_for_pod(record.id)?;
        let succeeded = exchanges.iter().filter(|e| e.is_success()).count();
        println!(
            "  {} {:<8} state {:<10} exchanges {}/{} last contact {}",
            "•".bright_green(),
            record.lot.to_string().bright_cyan(),
            state.state.to_string(),
            succeeded,
            exchanges.len(),
            format_time(state.last_radio_contact)
        );
    }
    println!(
        "  native scans started {} stopped {}",
        sim.scan_start_count(),
        sim.scan_stop_count()
    );

    service.shutdown().await;
    advertising.abort();
    Ok(())
}

async fn print_events(pod: Arc<Pod>) {
    let lot = pod.record().lot;
    let mut events = pod.probe().events();
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => return,
        };
        let stamp = chrono::Local::now().format("%H:%M:%S");
        match event {
            ProbeEvent::Completed {
                success: true,
                next_interval,
            } => println!(
                "[{}] pod {} probe {} next in {}s",
                stamp,
                lot.to_string().bright_cyan(),
                "ok".green(),
                next_interval.as_secs()
            ),
            ProbeEvent::Completed {
                success: false,
                next_interval,
            } => println!(
                "[{}] pod {} probe {} next in {}s",
                stamp,
                lot.to_string().bright_cyan(),
                "failed".yellow(),
                next_interval.as_secs()
            ),
            ProbeEvent::Unreachable {
                consecutive_failures,
                last_contact,
            } => println!(
                "[{}] pod {} {} after {} failures, last contact {}",
                stamp,
                lot.to_string().bright_cyan(),
                "unreachable".bright_red().bold(),
                consecutive_failures,
                format_time(last_contact)
            ),
        }
    }
}

fn format_time(time: Option<SystemTime>) -> String {
    match time {
        Some(time) => chrono::DateTime::<chrono::Local>::from(time)
            .format("%H:%M:%S")
            .to_string(),
        None => "never".to_string(),
    }
}
