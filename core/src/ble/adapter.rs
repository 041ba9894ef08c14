//! Peripheral adapter
//!
//! Single point of truth for the peripheral cache, adapter power state, and
//! connection arbitration. Arbitration is one system-wide critical section:
//! it pauses the scanner and holds a keep-awake resource while a connection
//! attempt is in flight, because the native stack cannot scan and connect at
//! the same time.

use crate::ble::lease::PeripheralLease;
use crate::ble::native::{AdapterStatus, BleStack, NativeDevice, ScanRecord};
use crate::ble::peripheral::{DiscoveryState, Peripheral};
use crate::ble::scanner::{PeripheralScanner, ScannerState};
use crate::cancel;
use crate::config::AdapterConfig;
use crate::platform::{ApplicationFunctions, KeepAwakeGuard};
use crate::{LinkError, Result};
use futures::stream::{self, BoxStream, Stream, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, SystemTime};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, watch, OwnedMutexGuard};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

struct DeviceEntry {
    device: Arc<dyn NativeDevice>,
    /// Seen in the current discovery cycle (or currently connected)
    fresh: bool,
}

pub struct PeripheralAdapter {
    stack: Arc<dyn BleStack>,
    app: Arc<dyn ApplicationFunctions>,
    config: AdapterConfig,
    service_ids: Vec<Uuid>,
    scanner: Arc<PeripheralScanner>,
    arbitration: Arc<tokio::sync::Mutex<()>>,
    management: tokio::sync::Mutex<()>,
    peripherals: RwLock<HashMap<Uuid, Arc<Peripheral>>>,
    devices: RwLock<HashMap<Uuid, DeviceEntry>>,
    sessions: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

impl PeripheralAdapter {
    /// Create an adapter recognizing the given radio service ids
    pub fn new(
        stack: Arc<dyn BleStack>,
        app: Arc<dyn ApplicationFunctions>,
        service_ids: Vec<Uuid>,
        config: AdapterConfig,
    ) -> Arc<Self> {
        let scanner = PeripheralScanner::new(
            stack.clone(),
            app.clone(),
            service_ids.clone(),
            config.replay_window(),
        );
        Arc::new(Self {
            stack,
            app,
            config,
            service_ids,
            scanner,
            arbitration: Arc::new(tokio::sync::Mutex::new(())),
            management: tokio::sync::Mutex::new(()),
            peripherals: RwLock::new(HashMap::new()),
            devices: RwLock::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &AdapterConfig {
        &self.config
    }

    pub fn service_ids(&self) -> &[Uuid] {
        &self.service_ids
    }

    pub fn scanner(&self) -> &Arc<PeripheralScanner> {
        &self.scanner
    }

    pub fn scan_state_changes(&self) -> watch::Receiver<ScannerState> {
        self.scanner.state_changes()
    }

    // ------------------------------------------------------------------------
    // Adapter power state
    // ------------------------------------------------------------------------

    pub fn adapter_status(&self) -> AdapterStatus {
        self.stack.adapter_status()
    }

    /// Emits once now if the adapter is on, then on every power-on
    pub fn when_adapter_enabled(&self) -> BoxStream<'static, ()> {
        self.status_stream(AdapterStatus::PoweredOn)
    }

    /// Emits once now if the adapter is off, then on every power-off
    pub fn when_adapter_disabled(&self) -> BoxStream<'static, ()> {
        self.status_stream(AdapterStatus::PoweredOff)
    }

    fn status_stream(&self, target: AdapterStatus) -> BoxStream<'static, ()> {
        let rx = self.stack.adapter_status_changes();
        let initial = stream::iter((self.stack.adapter_status() == target).then_some(()));
        let changes = stream::unfold(rx, move |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(status) if status == target => return Some(((), rx)),
                    Ok(_) | Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => return None,
                }
            }
        });
        initial.chain(changes).boxed()
    }

    /// Make sure the adapter is powered on.
    ///
    /// Unsupported and unauthorized adapters are terminal and pass through;
    /// a powered-off adapter is switched on when the platform allows it,
    /// waiting at most `timeout` or the configured enable timeout.
    pub async fn ensure_adapter_enabled(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        match self.stack.adapter_status() {
            AdapterStatus::PoweredOn
            | AdapterStatus::Unsupported
            | AdapterStatus::Unauthorized
            | AdapterStatus::Unknown => Ok(()),
            AdapterStatus::PoweredOff => {
                let timeout = timeout.min(self.config.enable_timeout());
                if self.stack.can_control_adapter() && self.try_enable_adapter(timeout, cancel).await? {
                    return Ok(());
                }
                Err(LinkError::AdapterNotEnabled)
            }
        }
    }

    /// Power the adapter on and wait for the power-on event.
    /// Returns `false` if it did not come up within `timeout`.
    pub async fn try_enable_adapter(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        let _management = match cancel::until(cancel, deadline, "adapter management", self.management.lock()).await {
            Ok(guard) => guard,
            Err(LinkError::Timeout(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        if self.stack.adapter_status() == AdapterStatus::PoweredOn {
            return Ok(true);
        }

        let mut changes = self.stack.adapter_status_changes();
        debug!("Trying to enable adapter");
        if let Err(e) = self.stack.set_adapter_enabled(true).await {
            warn!(error = %e, "Adapter refused power-on request");
            return Ok(false);
        }

        debug!("Waiting for adapter to get enabled");
        let stack = self.stack.clone();
        let powered_on = async move {
            loop {
                match changes.recv().await {
                    Ok(AdapterStatus::PoweredOn) => return true,
                    Ok(_) => continue,
                    Err(RecvError::Lagged(_)) => {
                        if stack.adapter_status() == AdapterStatus::PoweredOn {
                            return true;
                        }
                    }
                    Err(RecvError::Closed) => return false,
                }
            }
        };

        match cancel::until(cancel, deadline, "adapter power-on", powered_on).await {
            Ok(true) => {
                info!("Adapter enabled");
                Ok(self.stack.adapter_status() == AdapterStatus::PoweredOn)
            }
            Ok(false) | Err(LinkError::Timeout(_)) => {
                warn!("Adapter did not power on");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    // ------------------------------------------------------------------------
    // Connection arbitration
    // ------------------------------------------------------------------------

    /// Enter the system-wide connection critical section.
    ///
    /// Anything acquired before a failure or cancellation is released before
    /// the error is returned.
    pub async fn acquire_connection_arbitration(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ArbitrationGuard> {
        let deadline = Instant::now() + timeout;
        let lock = cancel::until(
            cancel,
            deadline,
            "connection arbitration",
            self.arbitration.clone().lock_owned(),
        )
        .await?;

        let remaining = deadline.saturating_duration_since(Instant::now());
        if let Err(e) = self.ensure_adapter_enabled(remaining, cancel).await {
            drop(lock);
            return Err(e);
        }

        self.scanner.pause();
        let keep_awake = self.app.acquire_radio_keep_awake();
        let inner = ArbitrationInner {
            lock,
            scanner: self.scanner.clone(),
            keep_awake,
            settle_delay: self.config.settle_delay(),
        };

        if let Err(e) = cancel::sleep(cancel, self.config.settle_delay()).await {
            inner.release_now();
            debug!("Arbitration acquisition canceled, partial acquisition released");
            return Err(e);
        }

        debug!("Connection arbitration acquired");
        Ok(ArbitrationGuard { inner: Some(inner) })
    }

    // ------------------------------------------------------------------------
    // Peripheral cache
    // ------------------------------------------------------------------------

    /// Cached logical peripheral, created on first request
    pub fn get_peripheral(&self, id: Uuid, primary_service_id: Uuid) -> Arc<Peripheral> {
        if let Some(peripheral) = self.peripherals.read().get(&id) {
            return peripheral.clone();
        }
        self.peripherals
            .write()
            .entry(id)
            .or_insert_with(|| Arc::new(Peripheral::new(id, primary_service_id)))
            .clone()
    }

    pub fn known_peripherals(&self) -> Vec<Arc<Peripheral>> {
        self.peripherals.read().values().cloned().collect()
    }

    /// Native handle seen in the current discovery cycle, if any
    pub fn cached_native_device(&self, id: Uuid) -> Option<Arc<dyn NativeDevice>> {
        self.devices
            .read()
            .get(&id)
            .filter(|entry| entry.fresh)
            .map(|entry| entry.device.clone())
    }

    /// Native handle for `id`, running a discovery pass if it is not cached
    pub async fn get_native_device(
        self: &Arc<Self>,
        id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn NativeDevice>> {
        if let Some(device) = self.cached_native_device(id) {
            return Ok(device);
        }

        debug!(peripheral = %id, "Native device not cached, waiting for discovery");
        let mut discovery = self.discover_peripherals();
        let found = async {
            while let Some(item) = discovery.next().await {
                if item?.id() == id {
                    return Ok(());
                }
            }
            Err(LinkError::Native("discovery ended".to_string()))
        };
        cancel::within(cancel, self.config.discovery_timeout(), "peripheral discovery", found)
            .await??;

        self.cached_native_device(id)
            .ok_or_else(|| LinkError::RadioNotReachable(format!("{} not discovered", id)))
    }

    /// Open an exclusive session on one peripheral
    pub async fn lease(
        self: &Arc<Self>,
        peripheral_id: Uuid,
        primary_service_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<PeripheralLease> {
        let session = self
            .sessions
            .lock()
            .entry(peripheral_id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let session = cancel::within(
            cancel,
            self.config.arbitration_timeout(),
            "peripheral lease",
            session.lock_owned(),
        )
        .await?;

        let device = self.get_native_device(peripheral_id, cancel).await?;
        let peripheral = self.get_peripheral(peripheral_id, primary_service_id);
        Ok(PeripheralLease::new(
            self.clone(),
            peripheral,
            Arc::downgrade(&device),
            session,
        ))
    }

    // ------------------------------------------------------------------------
    // Discovery
    // ------------------------------------------------------------------------

    /// Start a discovery subscription.
    ///
    /// Connected devices exposing a recognized service are reported first,
    /// then live scan results. Each peripheral is reported once per
    /// subscription. When the subscription ends, peripherals still searching
    /// are marked `NotFound`.
    pub fn discover_peripherals(self: &Arc<Self>) -> PeripheralDiscovery {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let adapter = self.clone();
        let token = cancel.clone();

        tokio::spawn(async move {
            let result = adapter.run_discovery(&tx, &token).await;
            adapter.resolve_unseen();
            match result {
                Ok(()) | Err(LinkError::OperationCanceled) => {}
                Err(e) => {
                    warn!(error = %e, "Discovery failed");
                    let _ = tx.send(Err(e));
                }
            }
        });

        PeripheralDiscovery {
            rx,
            cancel,
            adapter: self.clone(),
        }
    }

    async fn run_discovery(
        &self,
        tx: &mpsc::UnboundedSender<Result<Arc<Peripheral>>>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut observed = HashSet::new();

        let arbitration = self
            .acquire_connection_arbitration(self.config.arbitration_timeout(), cancel)
            .await?;
        debug!("Requesting connected devices");
        let enumerated = self.enumerate_connected(tx, &mut observed, cancel).await;
        arbitration.release().await;
        let connected = enumerated?;

        self.mark_searching(&connected);

        debug!("Connecting to scan results");
        let mut scan = self.scanner.subscribe();
        loop {
            let record = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(LinkError::OperationCanceled),
                record = scan.next_record() => record,
            };
            let record = match record {
                Some(Ok(record)) => record,
                Some(Err(e)) => return Err(e),
                None => return Err(LinkError::Native("scan results closed".to_string())),
            };

            let peripheral = self.record_sighting(&record);
            if observed.insert(peripheral.id()) {
                debug!(peripheral = %peripheral.id(), rssi = record.rssi, "Reporting found peripheral");
                if tx.send(Ok(peripheral)).is_err() {
                    return Ok(());
                }
            }
        }
    }

    async fn enumerate_connected(
        &self,
        tx: &mpsc::UnboundedSender<Result<Arc<Peripheral>>>,
        observed: &mut HashSet<Uuid>,
        cancel: &CancellationToken,
    ) -> Result<HashSet<Uuid>> {
        let devices = self.stack.connected_devices().await?;
        let mut connected = HashSet::new();

        for device in devices {
            if cancel.is_cancelled() {
                return Err(LinkError::OperationCanceled);
            }
            connected.insert(device.id());

            let services = match device.discover_services().await {
                Ok(services) => services,
                Err(e) => {
                    debug!(device = %device.id(), error = %e, "Skipping connected device");
                    continue;
                }
            };
            let Some(service_id) = services.iter().find(|s| self.service_ids.contains(s)) else {
                continue;
            };

            self.cache_device(device.clone());
            let peripheral = self.get_peripheral(device.id(), *service_id);
            if let Some(name) = device.name().filter(|n| !n.is_empty()) {
                peripheral.set_name(name);
            }
            peripheral.set_discovery_state(DiscoveryState::Discovered, SystemTime::now());

            debug!(peripheral = %peripheral.id(), "Reporting connected peripheral as found");
            observed.insert(peripheral.id());
            let _ = tx.send(Ok(peripheral));
        }
        Ok(connected)
    }

    fn mark_searching(&self, connected: &HashSet<Uuid>) {
        let search_start = SystemTime::now();
        for (id, entry) in self.devices.write().iter_mut() {
            if !connected.contains(id) {
                entry.fresh = false;
            }
        }
        for peripheral in self.peripherals.read().values() {
            if !connected.contains(&peripheral.id()) {
                peripheral.set_discovery_state(DiscoveryState::Searching, search_start);
            }
        }
    }

    fn record_sighting(&self, record: &ScanRecord) -> Arc<Peripheral> {
        self.cache_device(record.device.clone());
        let service_id = record
            .service_ids
            .iter()
            .find(|s| self.service_ids.contains(s))
            .or_else(|| self.service_ids.first())
            .copied()
            .unwrap_or_else(Uuid::nil);

        let peripheral = self.get_peripheral(record.device_id(), service_id);
        if let Some(name) = &record.advertised_name {
            peripheral.set_name_if_missing(name);
        }
        if let Some(name) = record.device.name().filter(|n| !n.is_empty()) {
            peripheral.set_name(name);
        }
        let now = SystemTime::now();
        peripheral.set_rssi(record.rssi, now);
        peripheral.set_discovery_state(DiscoveryState::Discovered, now);
        peripheral
    }

    fn cache_device(&self, device: Arc<dyn NativeDevice>) {
        let mut devices = self.devices.write();
        devices
            .entry(device.id())
            .and_modify(|entry| entry.fresh = true)
            .or_insert(DeviceEntry {
                device,
                fresh: true,
            });
    }

    /// Peripherals still searching at the end of a cycle were not found
    fn resolve_unseen(&self) {
        let finished = SystemTime::now();
        let resolved = self
            .peripherals
            .read()
            .values()
            .filter(|p| p.resolve_not_found(finished))
            .count();
        if resolved > 0 {
            debug!(count = resolved, "Peripherals not found in discovery cycle");
        }
    }
}

// ============================================================================
// ARBITRATION GUARD
// ============================================================================

struct ArbitrationInner {
    lock: OwnedMutexGuard<()>,
    scanner: Arc<PeripheralScanner>,
    keep_awake: KeepAwakeGuard,
    settle_delay: Duration,
}

/// Resumes the scanner when dropped
struct ResumeScan(Arc<PeripheralScanner>);

impl Drop for ResumeScan {
    fn drop(&mut self) {
        self.0.resume();
    }
}

impl ArbitrationInner {
    async fn release(self) {
        let ArbitrationInner {
            lock,
            scanner,
            keep_awake,
            settle_delay,
        } = self;
        // dropped in reverse order: scan resumes, then the lock goes
        let _lock = lock;
        let _resume = ResumeScan(scanner);
        keep_awake.release();
        tokio::time::sleep(settle_delay).await;
        debug!("Connection arbitration released");
    }

    fn release_now(self) {
        let ArbitrationInner {
            lock,
            scanner,
            keep_awake,
            ..
        } = self;
        keep_awake.release();
        scanner.resume();
        drop(lock);
    }
}

/// Held connection arbitration. Released exactly once: by `release()`, or
/// on drop (asynchronously when a runtime is available).
pub struct ArbitrationGuard {
    inner: Option<ArbitrationInner>,
}

impl ArbitrationGuard {
    /// Release keep-awake, wait the settle delay, resume scanning, unlock
    pub async fn release(mut self) {
        if let Some(inner) = self.inner.take() {
            inner.release().await;
        }
    }
}

impl Drop for ArbitrationGuard {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(inner.release());
                }
                Err(_) => inner.release_now(),
            }
        }
    }
}

// ============================================================================
// DISCOVERY STREAM
// ============================================================================

/// Live discovery subscription; dropping it ends the discovery cycle
pub struct PeripheralDiscovery {
    rx: mpsc::UnboundedReceiver<Result<Arc<Peripheral>>>,
    cancel: CancellationToken,
    adapter: Arc<PeripheralAdapter>,
}

impl Stream for PeripheralDiscovery {
    type Item = Result<Arc<Peripheral>>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for PeripheralDiscovery {
    fn drop(&mut self) {
        debug!("Disconnecting from scan results");
        self.cancel.cancel();
        self.adapter.resolve_unseen();
    }
}
