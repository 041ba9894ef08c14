//! Exclusive connection session on one peripheral
//!
//! A lease owns the peripheral's session slot from creation until
//! `dispose()` (or drop). The native device handle is held weakly: the
//! adapter owns it, and a lease outliving the cache entry fails with
//! `RadioNotReachable` instead of keeping a dead handle alive.

use crate::ble::adapter::PeripheralAdapter;
use crate::ble::native::{ConnectionEvent, ConnectionStatus, NativeCharacteristic, NativeDevice};
use crate::ble::peripheral::Peripheral;
use crate::cancel;
use crate::{LinkError, Result};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::broadcast::Receiver;
use tokio::sync::OwnedMutexGuard;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

pub struct PeripheralLease {
    adapter: Arc<PeripheralAdapter>,
    peripheral: Arc<Peripheral>,
    device: Weak<dyn NativeDevice>,
    session: Mutex<Option<OwnedMutexGuard<()>>>,
}

impl PeripheralLease {
    pub(crate) fn new(
        adapter: Arc<PeripheralAdapter>,
        peripheral: Arc<Peripheral>,
        device: Weak<dyn NativeDevice>,
        session: OwnedMutexGuard<()>,
    ) -> Self {
        Self {
            adapter,
            peripheral,
            device,
            session: Mutex::new(Some(session)),
        }
    }

    pub fn peripheral(&self) -> &Arc<Peripheral> {
        &self.peripheral
    }

    pub fn peripheral_id(&self) -> Uuid {
        self.peripheral.id()
    }

    pub fn is_connected(&self) -> bool {
        self.device
            .upgrade()
            .map_or(false, |d| d.status() == ConnectionStatus::Connected)
    }

    pub fn is_disposed(&self) -> bool {
        self.session.lock().is_none()
    }

    fn device(&self) -> Result<Arc<dyn NativeDevice>> {
        if self.is_disposed() {
            return Err(LinkError::Native("lease already disposed".to_string()));
        }
        self.device.upgrade().ok_or_else(|| {
            LinkError::RadioNotReachable(format!("{} no longer cached", self.peripheral.id()))
        })
    }

    /// Connect under connection arbitration. Idempotent when connected;
    /// a disconnect in flight is waited out first.
    pub async fn connect(
        &self,
        auto_reconnect: bool,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let device = self.device()?;
        let deadline = Instant::now() + timeout;

        match device.status() {
            ConnectionStatus::Connected => return Ok(()),
            ConnectionStatus::Disconnecting => {
                debug!(peripheral = %device.id(), "Waiting for disconnect before connecting");
                let events = device.connection_events();
                cancel::until(cancel, deadline, "pending disconnect", wait_disconnected(&device, events))
                    .await??;
            }
            ConnectionStatus::Disconnected | ConnectionStatus::Connecting => {}
        }

        // arbitration and the connect itself share this attempt's deadline
        let budget = deadline
            .saturating_duration_since(Instant::now())
            .min(self.adapter.config().arbitration_timeout());
        let arbitration = self.adapter.acquire_connection_arbitration(budget, cancel).await?;
        let remaining = deadline.saturating_duration_since(Instant::now());
        let result = self.connect_device(&device, auto_reconnect, remaining, cancel).await;
        arbitration.release().await;
        result
    }

    async fn connect_device(
        &self,
        device: &Arc<dyn NativeDevice>,
        auto_reconnect: bool,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if device.status() == ConnectionStatus::Connected {
            return Ok(());
        }

        let mut events = device.connection_events();
        debug!(peripheral = %device.id(), auto_reconnect, "Connecting");
        device.connect(auto_reconnect);

        let outcome = async {
            loop {
                match events.recv().await {
                    Ok(ConnectionEvent::Connected) => return Ok(()),
                    Ok(ConnectionEvent::ConnectionFailed(reason)) => {
                        return Err(LinkError::RadioNotReachable(format!(
                            "{}: {}",
                            device.id(),
                            reason
                        )))
                    }
                    Ok(ConnectionEvent::Disconnected) => continue,
                    Err(RecvError::Lagged(_)) => {
                        if device.status() == ConnectionStatus::Connected {
                            return Ok(());
                        }
                    }
                    Err(RecvError::Closed) => {
                        return Err(LinkError::Native("connection events closed".to_string()))
                    }
                }
            }
        };

        match cancel::within(cancel, timeout, "connection", outcome).await {
            Ok(Ok(())) => {
                debug!(peripheral = %device.id(), "Connected");
                Ok(())
            }
            Ok(Err(e)) => {
                warn!(peripheral = %device.id(), error = %e, "Connection failed");
                Err(e)
            }
            Err(e) => {
                device.cancel_connection();
                Err(e)
            }
        }
    }

    /// Idempotent when already disconnected
    pub async fn disconnect(&self, timeout: Duration, cancel: &CancellationToken) -> Result<()> {
        let Some(device) = self.device.upgrade() else {
            return Ok(());
        };
        if device.status() == ConnectionStatus::Disconnected {
            return Ok(());
        }

        let events = device.connection_events();
        debug!(peripheral = %device.id(), "Disconnecting");
        device.cancel_connection();
        cancel::within(cancel, timeout, "disconnect", wait_disconnected(&device, events)).await?
    }

    /// Characteristics of `service_id` whose ids are in `ids`, in native
    /// discovery order. Empty when not connected or the service is absent.
    pub async fn get_characteristics(
        &self,
        service_id: Uuid,
        ids: &[Uuid],
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<Arc<dyn NativeCharacteristic>>> {
        let device = self.device()?;
        if device.status() != ConnectionStatus::Connected {
            return Ok(Vec::new());
        }

        let lookup = async {
            let services = device.discover_services().await?;
            if !services.contains(&service_id) {
                return Ok(Vec::new());
            }
            let characteristics = device.discover_characteristics(service_id).await?;
            Ok(characteristics
                .into_iter()
                .filter(|c| ids.contains(&c.id()))
                .collect())
        };
        cancel::within(cancel, timeout, "characteristic discovery", lookup).await?
    }

    /// One RSSI read, no retry
    pub async fn read_signal_strength(&self) -> Result<i16> {
        let rssi = self.device()?.read_rssi().await?;
        self.peripheral.set_rssi(rssi, SystemTime::now());
        Ok(rssi)
    }

    /// Give up the session slot. Safe to call more than once.
    pub fn dispose(&self) {
        if self.session.lock().take().is_some() {
            debug!(peripheral = %self.peripheral.id(), "Lease released");
        }
    }
}

impl Drop for PeripheralLease {
    fn drop(&mut self) {
        self.dispose();
    }
}

async fn wait_disconnected(
    device: &Arc<dyn NativeDevice>,
    mut events: Receiver<ConnectionEvent>,
) -> Result<()> {
    loop {
        if device.status() == ConnectionStatus::Disconnected {
            return Ok(());
        }
        match events.recv().await {
            Ok(ConnectionEvent::Disconnected) => return Ok(()),
            Ok(_) | Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => {
                return Err(LinkError::Native("connection events closed".to_string()))
            }
        }
    }
}
