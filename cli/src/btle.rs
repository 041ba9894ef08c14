// Host BLE stack through btleplug
//
// Maps btleplug's central API onto the core's native bridge. btleplug has no
// adapter power control and no adapter state stream on every platform, so a
// present adapter is reported as powered on.

use async_trait::async_trait;
use btleplug::api::{Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use podlink_core::ble::{
    AdapterStatus, BleStack, ConnectionEvent, ConnectionStatus, NativeCharacteristic, NativeDevice,
    ScanCallback, ScanHandle, ScanRecord,
};
use podlink_core::{LinkError, Result};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

fn native(e: btleplug::Error) -> LinkError {
    LinkError::Native(e.to_string())
}

/// Stable id for a btleplug peripheral
fn device_uuid(id: &PeripheralId) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, id.to_string().as_bytes())
}

// ============================================================================
// STACK
// ============================================================================

pub struct BtleStack {
    adapter: Adapter,
    devices: Mutex<HashMap<Uuid, Arc<BtleDevice>>>,
    status_tx: broadcast::Sender<AdapterStatus>,
    me: Weak<BtleStack>,
}

impl BtleStack {
    /// Bind to the first adapter the host reports
    ///
    /// Connection events are followed for as long as the stack lives, so a
    /// dropped link is noticed whether or not a scan is running.
    pub async fn first_adapter() -> anyhow::Result<Arc<Self>> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("No Bluetooth adapter found"))?;
        if let Ok(info) = adapter.adapter_info().await {
            debug!(adapter = %info, "Using Bluetooth adapter");
        }
        let events = adapter.events().await?;

        let (status_tx, _) = broadcast::channel(8);
        let stack = Arc::new_cyclic(|me| Self {
            adapter,
            devices: Mutex::new(HashMap::new()),
            status_tx,
            me: me.clone(),
        });
        tokio::spawn(Self::watch_connections(Arc::downgrade(&stack), events));
        Ok(stack)
    }

    fn device_for(&self, peripheral: Peripheral, name: Option<String>) -> Arc<BtleDevice> {
        let id = device_uuid(&peripheral.id());
        let mut devices = self.devices.lock();
        let device = devices
            .entry(id)
            .or_insert_with(|| BtleDevice::new(id, peripheral));
        if let Some(name) = name {
            *device.name.lock() = Some(name);
        }
        device.clone()
    }

    fn cached_device(&self, id: &PeripheralId) -> Option<Arc<BtleDevice>> {
        self.devices.lock().get(&device_uuid(id)).cloned()
    }

    async fn record_for(&self, id: &PeripheralId) -> Option<ScanRecord> {
        let peripheral = self.adapter.peripheral(id).await.ok()?;
        let properties = peripheral.properties().await.ok().flatten()?;
        let device = self.device_for(peripheral, properties.local_name.clone());
        Some(ScanRecord {
            device,
            advertised_name: properties.local_name,
            rssi: properties.rssi.unwrap_or_default(),
            service_ids: properties.services,
        })
    }

    async fn watch_connections(stack: Weak<Self>, mut events: AdapterEvents) {
        while let Some(event) = events.next().await {
            let Some(stack) = stack.upgrade() else {
                return;
            };
            match event {
                CentralEvent::DeviceDisconnected(id) => {
                    if let Some(device) = stack.cached_device(&id) {
                        debug!(device = %device.id, "Link dropped");
                        device.set_disconnected();
                    }
                }
                CentralEvent::DeviceConnected(id) => {
                    if let Some(device) = stack.cached_device(&id) {
                        if device.status() == ConnectionStatus::Disconnected {
                            device.set_status(ConnectionStatus::Connected);
                        }
                    }
                }
                _ => {}
            }
        }
        debug!("Adapter event stream ended");
    }

    async fn run_scan(
        self: Arc<Self>,
        filter: Vec<Uuid>,
        callback: ScanCallback,
        stop: CancellationToken,
    ) {
        let started = async {
            let events = self.adapter.events().await?;
            self.adapter.start_scan(ScanFilter { services: filter }).await?;
            Ok::<_, btleplug::Error>(events)
        };
        let mut events = match started.await {
            Ok(events) => events,
            Err(e) => {
                warn!(error = %e, "Native scan failed to start");
                if !stop.is_cancelled() {
                    callback(Err(native(e)));
                }
                return;
            }
        };

        loop {
            let event = tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                event = events.next() => event,
            };
            let id = match event {
                Some(CentralEvent::DeviceDiscovered(id))
                | Some(CentralEvent::DeviceUpdated(id))
                | Some(CentralEvent::ServicesAdvertisement { id, .. }) => id,
                Some(_) => continue,
                None => {
                    if !stop.is_cancelled() {
                        callback(Err(LinkError::Native("adapter event stream ended".to_string())));
                    }
                    break;
                }
            };
            if let Some(record) = self.record_for(&id).await {
                if !stop.is_cancelled() {
                    callback(Ok(record));
                }
            }
        }

        if let Err(e) = self.adapter.stop_scan().await {
            debug!(error = %e, "Stopping native scan failed");
        }
    }
}

type AdapterEvents = Pin<Box<dyn Stream<Item = CentralEvent> + Send>>;

#[async_trait]
impl BleStack for BtleStack {
    fn adapter_status(&self) -> AdapterStatus {
        AdapterStatus::PoweredOn
    }

    fn adapter_status_changes(&self) -> broadcast::Receiver<AdapterStatus> {
        self.status_tx.subscribe()
    }

    fn can_control_adapter(&self) -> bool {
        false
    }

    async fn set_adapter_enabled(&self, _enabled: bool) -> Result<()> {
        Err(LinkError::Native("adapter power control not available".to_string()))
    }

    // The native start completes on a task; a failure reaches the scanner
    // through the callback.
    fn start_scan(&self, service_filter: &[Uuid], callback: ScanCallback) -> Result<Box<dyn ScanHandle>> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| LinkError::Native(e.to_string()))?;
        let stack = self
            .me
            .upgrade()
            .ok_or_else(|| LinkError::Native("stack dropped".to_string()))?;

        let stop = CancellationToken::new();
        let task = runtime.spawn(stack.run_scan(service_filter.to_vec(), callback, stop.clone()));
        Ok(Box::new(BtleScan { stop, _task: task }))
    }

    async fn connected_devices(&self) -> Result<Vec<Arc<dyn NativeDevice>>> {
        let mut connected: Vec<Arc<dyn NativeDevice>> = Vec::new();
        for peripheral in self.adapter.peripherals().await.map_err(native)? {
            if !peripheral.is_connected().await.unwrap_or(false) {
                continue;
            }
            let name = peripheral
                .properties()
                .await
                .ok()
                .flatten()
                .and_then(|p| p.local_name);
            let device = self.device_for(peripheral, name);
            device.set_status(ConnectionStatus::Connected);
            connected.push(device);
        }
        Ok(connected)
    }
}

struct BtleScan {
    stop: CancellationToken,
    _task: JoinHandle<()>,
}

impl ScanHandle for BtleScan {
    fn stop(self: Box<Self>) {
        self.stop.cancel();
    }
}

// ============================================================================
// DEVICES
// ============================================================================

pub struct BtleDevice {
    id: Uuid,
    peripheral: Peripheral,
    name: Mutex<Option<String>>,
    status: Mutex<ConnectionStatus>,
    events: broadcast::Sender<ConnectionEvent>,
    connecting: Mutex<Option<JoinHandle<()>>>,
    me: Weak<BtleDevice>,
}

impl BtleDevice {
    fn new(id: Uuid, peripheral: Peripheral) -> Arc<Self> {
        let (events, _) = broadcast::channel(16);
        Arc::new_cyclic(|me| Self {
            id,
            peripheral,
            name: Mutex::new(None),
            status: Mutex::new(ConnectionStatus::Disconnected),
            events,
            connecting: Mutex::new(None),
            me: me.clone(),
        })
    }

    fn set_status(&self, status: ConnectionStatus) {
        *self.status.lock() = status;
    }

    fn set_disconnected(&self) {
        let was = std::mem::replace(&mut *self.status.lock(), ConnectionStatus::Disconnected);
        if was != ConnectionStatus::Disconnected {
            let _ = self.events.send(ConnectionEvent::Disconnected);
        }
    }

    async fn establish(&self) -> std::result::Result<(), btleplug::Error> {
        self.peripheral.connect().await?;
        self.peripheral.discover_services().await
    }
}

#[async_trait]
impl NativeDevice for BtleDevice {
    fn id(&self) -> Uuid {
        self.id
    }

    fn name(&self) -> Option<String> {
        self.name.lock().clone()
    }

    fn status(&self) -> ConnectionStatus {
        *self.status.lock()
    }

    fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    // btleplug has no background reconnect, so `auto_reconnect` is ignored
    fn connect(&self, _auto_reconnect: bool) {
        if self.status() == ConnectionStatus::Connected {
            let _ = self.events.send(ConnectionEvent::Connected);
            return;
        }
        let Some(device) = self.me.upgrade() else {
            return;
        };
        self.set_status(ConnectionStatus::Connecting);

        let task = tokio::spawn(async move {
            match device.establish().await {
                Ok(()) => {
                    device.set_status(ConnectionStatus::Connected);
                    let _ = device.events.send(ConnectionEvent::Connected);
                }
                Err(e) => {
                    device.set_status(ConnectionStatus::Disconnected);
                    let _ = device.events.send(ConnectionEvent::ConnectionFailed(e.to_string()));
                }
            }
        });
        if let Some(previous) = self.connecting.lock().replace(task) {
            previous.abort();
        }
    }

    fn cancel_connection(&self) {
        if let Some(task) = self.connecting.lock().take() {
            task.abort();
        }
        let peripheral = self.peripheral.clone();
        tokio::spawn(async move {
            if let Err(e) = peripheral.disconnect().await {
                debug!(error = %e, "Native disconnect failed");
            }
        });
        self.set_disconnected();
    }

    async fn discover_services(&self) -> Result<Vec<Uuid>> {
        if self.peripheral.services().is_empty() {
            self.peripheral.discover_services().await.map_err(native)?;
        }
        Ok(self.peripheral.services().into_iter().map(|s| s.uuid).collect())
    }

    async fn discover_characteristics(
        &self,
        service_id: Uuid,
    ) -> Result<Vec<Arc<dyn NativeCharacteristic>>> {
        Ok(self
            .peripheral
            .characteristics()
            .into_iter()
            .filter(|c| c.service_uuid == service_id)
            .map(|characteristic| {
                Arc::new(BtleCharacteristic {
                    peripheral: self.peripheral.clone(),
                    characteristic,
                }) as Arc<dyn NativeCharacteristic>
            })
            .collect())
    }

    async fn read_rssi(&self) -> Result<i16> {
        self.peripheral
            .properties()
            .await
            .map_err(native)?
            .and_then(|p| p.rssi)
            .ok_or_else(|| LinkError::Native("RSSI not available".to_string()))
    }
}

struct BtleCharacteristic {
    peripheral: Peripheral,
    characteristic: Characteristic,
}

#[async_trait]
impl NativeCharacteristic for BtleCharacteristic {
    fn id(&self) -> Uuid {
        self.characteristic.uuid
    }

    fn service_id(&self) -> Uuid {
        self.characteristic.service_uuid
    }

    async fn read(&self) -> Result<Vec<u8>> {
        self.peripheral.read(&self.characteristic).await.map_err(native)
    }

    async fn write(&self, data: &[u8]) -> Result<()> {
        self.peripheral
            .write(&self.characteristic, data, WriteType::WithResponse)
            .await
            .map_err(native)
    }
}
