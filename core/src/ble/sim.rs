//! In-memory BLE stack
//!
//! Implements the native bridge traits without hardware. Used by the test
//! suites and by the CLI `simulate` command. Devices advertise, connect after
//! a configurable delay, and answer commands written to their command
//! characteristic through a pluggable responder. Responses can be held back
//! with a gate to model a radio that stalls mid-exchange.

use crate::ble::native::{
    AdapterStatus, BleStack, ConnectionEvent, ConnectionStatus, NativeCharacteristic,
    NativeDevice, ScanCallback, ScanHandle, ScanRecord,
};
use crate::platform::{ApplicationFunctions, KeepAwakeGuard};
use crate::{LinkError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Characteristic a simulated radio accepts commands on
pub const COMMAND_CHARACTERISTIC: Uuid = Uuid::from_u128(0xc842_e849_5028_42e2_867c_016adada9155);
/// Characteristic a simulated radio publishes its last response on
pub const RESPONSE_CHARACTERISTIC: Uuid = Uuid::from_u128(0x6e6c_7910_b89e_43a5_a0fe_50c5e2b81f4a);

/// Computes a response from a received command
pub type Responder = Arc<dyn Fn(&[u8]) -> Vec<u8> + Send + Sync>;

fn ok_responder() -> Responder {
    Arc::new(|command: &[u8]| {
        let mut response = b"OK".to_vec();
        response.extend_from_slice(command);
        response
    })
}

// ============================================================================
// DEVICES
// ============================================================================

/// Initial setup of a simulated device
#[derive(Clone)]
pub struct SimDeviceConfig {
    pub name: String,
    pub service_id: Uuid,
    pub rssi: i16,
    pub advertising: bool,
    pub connectable: bool,
    pub connect_delay: Duration,
    /// Time spent in `Disconnecting` before the link is down
    pub disconnect_delay: Duration,
}

impl SimDeviceConfig {
    pub fn new(name: impl Into<String>, service_id: Uuid) -> Self {
        Self {
            name: name.into(),
            service_id,
            rssi: -60,
            advertising: true,
            connectable: true,
            connect_delay: Duration::from_millis(50),
            disconnect_delay: Duration::ZERO,
        }
    }

    pub fn not_advertising(mut self) -> Self {
        self.advertising = false;
        self
    }

    /// Advertises but refuses every connection
    pub fn unreachable(mut self) -> Self {
        self.connectable = false;
        self
    }

    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = rssi;
        self
    }

    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    pub fn with_disconnect_delay(mut self, delay: Duration) -> Self {
        self.disconnect_delay = delay;
        self
    }
}

struct DeviceState {
    advertising: bool,
    connectable: bool,
    status: ConnectionStatus,
    pending_response: Option<Vec<u8>>,
    commands: Vec<Vec<u8>>,
    connects: usize,
}

pub struct SimDevice {
    id: Uuid,
    name: String,
    service_id: Uuid,
    rssi: i16,
    connect_delay: Duration,
    disconnect_delay: Duration,
    state: Mutex<DeviceState>,
    responder: Mutex<Responder>,
    gate: watch::Sender<bool>,
    events: broadcast::Sender<ConnectionEvent>,
    me: Weak<SimDevice>,
}

impl SimDevice {
    fn new(config: SimDeviceConfig) -> Arc<Self> {
        let (gate, _) = watch::channel(true);
        let (events, _) = broadcast::channel(32);
        Arc::new_cyclic(|me| Self {
            id: Uuid::new_v4(),
            name: config.name,
            service_id: config.service_id,
            rssi: config.rssi,
            connect_delay: config.connect_delay,
            disconnect_delay: config.disconnect_delay,
            state: Mutex::new(DeviceState {
                advertising: config.advertising,
                connectable: config.connectable,
                status: ConnectionStatus::Disconnected,
                pending_response: None,
                commands: Vec::new(),
                connects: 0,
            }),
            responder: Mutex::new(ok_responder()),
            gate,
            events,
            me: me.clone(),
        })
    }

    pub fn service_id(&self) -> Uuid {
        self.service_id
    }

    pub fn is_advertising(&self) -> bool {
        self.state.lock().advertising
    }

    pub fn set_advertising(&self, advertising: bool) {
        self.state.lock().advertising = advertising;
    }

    pub fn set_connectable(&self, connectable: bool) {
        self.state.lock().connectable = connectable;
    }

    pub fn set_responder(&self, responder: impl Fn(&[u8]) -> Vec<u8> + Send + Sync + 'static) {
        *self.responder.lock() = Arc::new(responder);
    }

    /// Stall response reads until [`release_responses`](Self::release_responses)
    pub fn hold_responses(&self) {
        self.gate.send_replace(false);
    }

    pub fn release_responses(&self) {
        self.gate.send_replace(true);
    }

    /// Commands received so far, oldest first
    pub fn commands(&self) -> Vec<Vec<u8>> {
        self.state.lock().commands.clone()
    }

    pub fn connect_count(&self) -> usize {
        self.state.lock().connects
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().status == ConnectionStatus::Connected
    }

    /// Drop the link from the device side
    pub fn drop_connection(&self) {
        self.set_status(ConnectionStatus::Disconnected);
        let _ = self.events.send(ConnectionEvent::Disconnected);
    }

    fn set_status(&self, status: ConnectionStatus) {
        self.state.lock().status = status;
    }

    fn scan_record(self: &Arc<Self>) -> ScanRecord {
        ScanRecord {
            device: self.clone(),
            advertised_name: Some(self.name.clone()),
            rssi: self.rssi,
            service_ids: vec![self.service_id],
        }
    }

    fn write_command(&self, data: &[u8]) -> Result<()> {
        let responder = self.responder.lock().clone();
        let response = responder(data);
        let mut state = self.state.lock();
        if state.status != ConnectionStatus::Connected {
            return Err(LinkError::Native("device not connected".to_string()));
        }
        state.commands.push(data.to_vec());
        state.pending_response = Some(response);
        Ok(())
    }

    async fn read_response(&self) -> Result<Vec<u8>> {
        let mut gate = self.gate.subscribe();
        gate.wait_for(|open| *open)
            .await
            .map_err(|_| LinkError::Native("device gone".to_string()))?;

        let mut state = self.state.lock();
        if state.status != ConnectionStatus::Connected {
            return Err(LinkError::Native("device not connected".to_string()));
        }
        state
            .pending_response
            .take()
            .ok_or_else(|| LinkError::Native("no response pending".to_string()))
    }
}

#[async_trait]
impl NativeDevice for SimDevice {
    fn id(&self) -> Uuid {
        self.id
    }

    fn name(&self) -> Option<String> {
        Some(self.name.clone())
    }

    fn status(&self) -> ConnectionStatus {
        self.state.lock().status
    }

    fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    fn connect(&self, _auto_reconnect: bool) {
        {
            let mut state = self.state.lock();
            if state.status == ConnectionStatus::Connected {
                drop(state);
                let _ = self.events.send(ConnectionEvent::Connected);
                return;
            }
            state.status = ConnectionStatus::Connecting;
            state.connects += 1;
        }

        let Some(device) = self.me.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            tokio::time::sleep(device.connect_delay).await;
            let mut state = device.state.lock();
            if state.status != ConnectionStatus::Connecting {
                return;
            }
            if state.connectable {
                state.status = ConnectionStatus::Connected;
                drop(state);
                let _ = device.events.send(ConnectionEvent::Connected);
            } else {
                state.status = ConnectionStatus::Disconnected;
                drop(state);
                let _ = device
                    .events
                    .send(ConnectionEvent::ConnectionFailed("device refused connection".to_string()));
            }
        });
    }

    fn cancel_connection(&self) {
        if self.disconnect_delay.is_zero() {
            let was = {
                let mut state = self.state.lock();
                std::mem::replace(&mut state.status, ConnectionStatus::Disconnected)
            };
            if was != ConnectionStatus::Disconnected {
                let _ = self.events.send(ConnectionEvent::Disconnected);
            }
            return;
        }

        {
            let mut state = self.state.lock();
            match state.status {
                ConnectionStatus::Disconnected | ConnectionStatus::Disconnecting => return,
                ConnectionStatus::Connecting | ConnectionStatus::Connected => {
                    state.status = ConnectionStatus::Disconnecting;
                }
            }
        }
        let Some(device) = self.me.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            tokio::time::sleep(device.disconnect_delay).await;
            let mut state = device.state.lock();
            if state.status != ConnectionStatus::Disconnecting {
                return;
            }
            state.status = ConnectionStatus::Disconnected;
            drop(state);
            let _ = device.events.send(ConnectionEvent::Disconnected);
        });
    }

    async fn discover_services(&self) -> Result<Vec<Uuid>> {
        if self.status() != ConnectionStatus::Connected {
            return Err(LinkError::Native("device not connected".to_string()));
        }
        Ok(vec![self.service_id])
    }

    async fn discover_characteristics(
        &self,
        service_id: Uuid,
    ) -> Result<Vec<Arc<dyn NativeCharacteristic>>> {
        if self.status() != ConnectionStatus::Connected {
            return Err(LinkError::Native("device not connected".to_string()));
        }
        if service_id != self.service_id {
            return Ok(Vec::new());
        }
        let device = self.me.clone();
        Ok(vec![
            Arc::new(SimCharacteristic {
                device: device.clone(),
                id: COMMAND_CHARACTERISTIC,
                service_id,
            }),
            Arc::new(SimCharacteristic {
                device,
                id: RESPONSE_CHARACTERISTIC,
                service_id,
            }),
        ])
    }

    async fn read_rssi(&self) -> Result<i16> {
        Ok(self.rssi)
    }
}

struct SimCharacteristic {
    device: Weak<SimDevice>,
    id: Uuid,
    service_id: Uuid,
}

impl SimCharacteristic {
    fn device(&self) -> Result<Arc<SimDevice>> {
        self.device
            .upgrade()
            .ok_or_else(|| LinkError::Native("device gone".to_string()))
    }
}

#[async_trait]
impl NativeCharacteristic for SimCharacteristic {
    fn id(&self) -> Uuid {
        self.id
    }

    fn service_id(&self) -> Uuid {
        self.service_id
    }

    async fn read(&self) -> Result<Vec<u8>> {
        if self.id != RESPONSE_CHARACTERISTIC {
            return Err(LinkError::Native("characteristic not readable".to_string()));
        }
        self.device()?.read_response().await
    }

    async fn write(&self, data: &[u8]) -> Result<()> {
        if self.id != COMMAND_CHARACTERISTIC {
            return Err(LinkError::Native("characteristic not writable".to_string()));
        }
        self.device()?.write_command(data)
    }
}

// ============================================================================
// STACK
// ============================================================================

struct ActiveScan {
    filter: Vec<Uuid>,
    callback: ScanCallback,
}

struct StackState {
    status: AdapterStatus,
    controllable: bool,
    power_on_responds: bool,
    power_on_requests: usize,
    devices: HashMap<Uuid, Arc<SimDevice>>,
    scans: HashMap<u64, ActiveScan>,
    next_scan: u64,
    scans_started: usize,
    scans_stopped: usize,
}

pub struct SimulatedBle {
    state: Mutex<StackState>,
    status_tx: broadcast::Sender<AdapterStatus>,
    me: Weak<SimulatedBle>,
}

impl SimulatedBle {
    /// Powered-on, controllable adapter with no devices
    pub fn new() -> Arc<Self> {
        let (status_tx, _) = broadcast::channel(16);
        Arc::new_cyclic(|me| Self {
            state: Mutex::new(StackState {
                status: AdapterStatus::PoweredOn,
                controllable: true,
                power_on_responds: true,
                power_on_requests: 0,
                devices: HashMap::new(),
                scans: HashMap::new(),
                next_scan: 0,
                scans_started: 0,
                scans_stopped: 0,
            }),
            status_tx,
            me: me.clone(),
        })
    }

    pub fn set_adapter_status(&self, status: AdapterStatus) {
        self.state.lock().status = status;
        let _ = self.status_tx.send(status);
    }

    pub fn set_adapter_controllable(&self, controllable: bool) {
        self.state.lock().controllable = controllable;
    }

    /// When false, power-on requests are accepted but never complete
    pub fn set_power_on_responds(&self, responds: bool) {
        self.state.lock().power_on_responds = responds;
    }

    pub fn power_on_requests(&self) -> usize {
        self.state.lock().power_on_requests
    }

    pub fn add_device(&self, config: SimDeviceConfig) -> Arc<SimDevice> {
        let device = SimDevice::new(config);
        self.state.lock().devices.insert(device.id(), device.clone());
        device
    }

    pub fn device(&self, id: Uuid) -> Option<Arc<SimDevice>> {
        self.state.lock().devices.get(&id).cloned()
    }

    /// Mark a device as connected at the OS level, outside any lease
    pub fn force_connected(&self, id: Uuid) {
        if let Some(device) = self.device(id) {
            device.set_status(ConnectionStatus::Connected);
        }
    }

    /// Deliver one advertisement of `id` to every matching running scan
    pub fn advertise(&self, id: Uuid) {
        let deliveries = {
            let state = self.state.lock();
            let Some(device) = state.devices.get(&id).filter(|d| d.is_advertising()) else {
                return;
            };
            let record = device.scan_record();
            state
                .scans
                .values()
                .filter(|scan| Self::matches(&scan.filter, device))
                .map(|scan| (scan.callback.clone(), record.clone()))
                .collect::<Vec<_>>()
        };
        for (callback, record) in deliveries {
            callback(Ok(record));
        }
    }

    /// Advertise every advertising device each `interval` until the
    /// simulator is dropped
    pub fn start_advertising(&self, interval: Duration) -> JoinHandle<()> {
        let me = self.me.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let Some(sim) = me.upgrade() else {
                    return;
                };
                let ids: Vec<Uuid> = sim.state.lock().devices.keys().copied().collect();
                for id in ids {
                    sim.advertise(id);
                }
            }
        })
    }

    /// End every running scan with `error`, as a native scan dying would
    pub fn fail_running_scans(&self, error: LinkError) {
        let callbacks: Vec<ScanCallback> = {
            let mut state = self.state.lock();
            let failed: Vec<ScanCallback> = state.scans.drain().map(|(_, scan)| scan.callback).collect();
            state.scans_stopped += failed.len();
            failed
        };
        for callback in callbacks {
            callback(Err(error.clone()));
        }
    }

    pub fn active_scan_count(&self) -> usize {
        self.state.lock().scans.len()
    }

    pub fn scan_start_count(&self) -> usize {
        self.state.lock().scans_started
    }

    pub fn scan_stop_count(&self) -> usize {
        self.state.lock().scans_stopped
    }

    fn matches(filter: &[Uuid], device: &SimDevice) -> bool {
        filter.is_empty() || filter.contains(&device.service_id)
    }

    fn stop_scan(&self, scan_id: u64) {
        let mut state = self.state.lock();
        if state.scans.remove(&scan_id).is_some() {
            state.scans_stopped += 1;
        }
    }
}

#[async_trait]
impl BleStack for SimulatedBle {
    fn adapter_status(&self) -> AdapterStatus {
        self.state.lock().status
    }

    fn adapter_status_changes(&self) -> broadcast::Receiver<AdapterStatus> {
        self.status_tx.subscribe()
    }

    fn can_control_adapter(&self) -> bool {
        self.state.lock().controllable
    }

    async fn set_adapter_enabled(&self, enabled: bool) -> Result<()> {
        let responds = {
            let mut state = self.state.lock();
            if !state.controllable {
                return Err(LinkError::Native("adapter not controllable".to_string()));
            }
            state.power_on_requests += 1;
            state.power_on_responds
        };
        if responds {
            let status = if enabled {
                AdapterStatus::PoweredOn
            } else {
                AdapterStatus::PoweredOff
            };
            self.set_adapter_status(status);
        }
        Ok(())
    }

    fn start_scan(
        &self,
        service_filter: &[Uuid],
        callback: ScanCallback,
    ) -> Result<Box<dyn ScanHandle>> {
        let (scan_id, visible) = {
            let mut state = self.state.lock();
            if state.status != AdapterStatus::PoweredOn {
                return Err(LinkError::AdapterNotEnabled);
            }
            let scan_id = state.next_scan;
            state.next_scan += 1;
            state.scans_started += 1;
            state.scans.insert(
                scan_id,
                ActiveScan {
                    filter: service_filter.to_vec(),
                    callback: callback.clone(),
                },
            );
            let visible: Vec<ScanRecord> = state
                .devices
                .values()
                .filter(|d| d.is_advertising() && Self::matches(service_filter, d))
                .map(|d| d.scan_record())
                .collect();
            (scan_id, visible)
        };

        for record in visible {
            callback(Ok(record));
        }

        Ok(Box::new(SimScanHandle {
            sim: self.me.clone(),
            scan_id,
        }))
    }

    async fn connected_devices(&self) -> Result<Vec<Arc<dyn NativeDevice>>> {
        Ok(self
            .state
            .lock()
            .devices
            .values()
            .filter(|d| d.is_connected())
            .map(|d| d.clone() as Arc<dyn NativeDevice>)
            .collect())
    }
}

struct SimScanHandle {
    sim: Weak<SimulatedBle>,
    scan_id: u64,
}

impl ScanHandle for SimScanHandle {
    fn stop(self: Box<Self>) {
        if let Some(sim) = self.sim.upgrade() {
            sim.stop_scan(self.scan_id);
        }
    }
}

// ============================================================================
// APPLICATION
// ============================================================================

/// Host application stand-in that counts keep-awake guards
pub struct SimApplication {
    held: Arc<AtomicUsize>,
    acquired: AtomicUsize,
    data_directory: PathBuf,
}

impl SimApplication {
    pub fn new() -> Arc<Self> {
        Self::with_data_directory(std::env::temp_dir().join("podlink-sim"))
    }

    pub fn with_data_directory(path: PathBuf) -> Arc<Self> {
        Arc::new(Self {
            held: Arc::new(AtomicUsize::new(0)),
            acquired: AtomicUsize::new(0),
            data_directory: path,
        })
    }

    /// Guards currently held
    pub fn keep_awake_held(&self) -> usize {
        self.held.load(Ordering::SeqCst)
    }

    /// Guards handed out since creation
    pub fn keep_awake_acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }
}

impl ApplicationFunctions for SimApplication {
    fn acquire_radio_keep_awake(&self) -> KeepAwakeGuard {
        self.held.fetch_add(1, Ordering::SeqCst);
        self.acquired.fetch_add(1, Ordering::SeqCst);
        let held = self.held.clone();
        KeepAwakeGuard::new(move || {
            held.fetch_sub(1, Ordering::SeqCst);
        })
    }

    fn data_directory(&self) -> PathBuf {
        self.data_directory.clone()
    }
}
