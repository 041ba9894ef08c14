//! Radios
//!
//! A radio is a registered BLE bridge that relays commands to a pod. The
//! byte-level codec is a [`RadioProtocol`] supplied by the caller; this
//! module only opens leases and moves opaque payloads.

use crate::ble::{PeripheralAdapter, PeripheralLease};
use crate::cancel;
use crate::config::LeaseConfig;
use crate::pod::request::{PodRequest, RequestKind};
use crate::pod::state::PodProgress;
use crate::{LinkError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

pub use crate::config::RadioOptions;

/// Persisted registration of one physical radio
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RadioRecord {
    pub id: Uuid,
    pub service_id: Uuid,
    pub device_id: Uuid,
    pub name: Option<String>,
    #[serde(default)]
    pub options: RadioOptions,
}

impl RadioRecord {
    pub fn new(service_id: Uuid, device_id: Uuid, name: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            service_id,
            device_id,
            name,
            options: RadioOptions::default(),
        }
    }

    pub fn with_options(mut self, options: RadioOptions) -> Self {
        self.options = options;
        self
    }
}

// ============================================================================
// PROTOCOL
// ============================================================================

/// Codec seam between the queue and a radio's firmware
#[async_trait]
pub trait RadioProtocol: Send + Sync {
    /// Send `command` over a connected lease and return the raw response
    async fn exchange(
        &self,
        lease: &PeripheralLease,
        command: &[u8],
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>>;

    /// Command used for health checks
    fn probe_command(&self) -> Vec<u8> {
        b"STATE".to_vec()
    }

    /// Exchange the probe command; the radio must answer `OK...`
    async fn health_check(
        &self,
        lease: &PeripheralLease,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        let response = self.exchange(lease, &self.probe_command(), cancel).await?;
        if !response.starts_with(b"OK") {
            return Err(LinkError::ExchangeFailed(format!(
                "unexpected state response: {}",
                String::from_utf8_lossy(&response)
            )));
        }
        Ok(response)
    }

    /// Pod progress carried by a response, if the codec understands it
    fn interpret(&self, _response: &[u8]) -> Option<PodProgress> {
        None
    }
}

/// Command/response over two characteristics of one service: write the
/// command, then read the response.
#[derive(Debug, Clone)]
pub struct CharacteristicProtocol {
    pub service_id: Uuid,
    pub command_characteristic: Uuid,
    pub response_characteristic: Uuid,
    pub characteristic_timeout: Duration,
}

impl CharacteristicProtocol {
    pub fn new(service_id: Uuid, command_characteristic: Uuid, response_characteristic: Uuid) -> Self {
        Self {
            service_id,
            command_characteristic,
            response_characteristic,
            characteristic_timeout: LeaseConfig::default().characteristic_timeout(),
        }
    }
}

#[async_trait]
impl RadioProtocol for CharacteristicProtocol {
    async fn exchange(
        &self,
        lease: &PeripheralLease,
        command: &[u8],
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        let characteristics = lease
            .get_characteristics(
                self.service_id,
                &[self.command_characteristic, self.response_characteristic],
                self.characteristic_timeout,
                cancel,
            )
            .await?;
        let find = |id: Uuid| {
            characteristics
                .iter()
                .find(|c| c.id() == id)
                .cloned()
                .ok_or_else(|| LinkError::ExchangeFailed(format!("characteristic {} missing", id)))
        };
        let command_char = find(self.command_characteristic)?;
        let response_char = find(self.response_characteristic)?;

        command_char.write(command).await?;
        response_char.read().await
    }

    /// Text responses may carry `progress=<Name>`
    fn interpret(&self, response: &[u8]) -> Option<PodProgress> {
        let text = std::str::from_utf8(response).ok()?;
        text.split_whitespace()
            .find_map(|token| token.strip_prefix("progress="))
            .and_then(PodProgress::from_name)
    }
}

// ============================================================================
// BLE RADIO
// ============================================================================

/// A registered radio bound to the adapter and its protocol
pub struct BleRadio {
    record: RadioRecord,
    adapter: Arc<PeripheralAdapter>,
    protocol: Arc<dyn RadioProtocol>,
    lease_config: LeaseConfig,
}

impl BleRadio {
    pub fn new(
        record: RadioRecord,
        adapter: Arc<PeripheralAdapter>,
        protocol: Arc<dyn RadioProtocol>,
        lease_config: LeaseConfig,
    ) -> Self {
        Self {
            record,
            adapter,
            protocol,
            lease_config,
        }
    }

    pub fn id(&self) -> Uuid {
        self.record.id
    }

    pub fn device_id(&self) -> Uuid {
        self.record.device_id
    }

    pub fn record(&self) -> &RadioRecord {
        &self.record
    }

    pub fn options(&self) -> RadioOptions {
        self.record.options
    }

    /// Lease the radio's peripheral and connect, all within `timeout`
    pub async fn open(&self, timeout: Duration, cancel: &CancellationToken) -> Result<PeripheralLease> {
        let deadline = Instant::now() + timeout;
        let lease = cancel::until(
            cancel,
            deadline,
            "radio lookup",
            self.adapter
                .lease(self.record.device_id, self.record.service_id, cancel),
        )
        .await??;

        let remaining = deadline.saturating_duration_since(Instant::now());
        lease
            .connect(
                self.lease_config.auto_reconnect,
                remaining.min(self.lease_config.connect_timeout()),
                cancel,
            )
            .await?;
        debug!(radio = %self.record.id, "Radio connected");
        Ok(lease)
    }

    /// Run one request over an open lease
    pub async fn perform(
        &self,
        lease: &PeripheralLease,
        request: &PodRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        match request.kind {
            RequestKind::StatusCheck => self.protocol.health_check(lease, cancel).await,
            _ => self.protocol.exchange(lease, &request.command, cancel).await,
        }
    }

    pub fn interpret(&self, response: &[u8]) -> Option<PodProgress> {
        self.protocol.interpret(response)
    }

    /// Disconnect and give the lease back. The disconnect runs to completion
    /// on its own timeout.
    pub async fn close(&self, lease: PeripheralLease) {
        let cancel = CancellationToken::new();
        if let Err(e) = lease
            .disconnect(self.lease_config.disconnect_timeout(), &cancel)
            .await
        {
            debug!(radio = %self.record.id, error = %e, "Disconnect did not complete");
        }
        lease.dispose();
    }
}

// ============================================================================
// PROVIDERS
// ============================================================================

/// Resolves radio records of one service id to live radios
#[async_trait]
pub trait RadioProvider: Send + Sync {
    fn service_uuid(&self) -> Uuid;

    async fn get_radio(&self, record: &RadioRecord, cancel: &CancellationToken) -> Result<Arc<BleRadio>>;
}

/// Provider for radios speaking one protocol on one service id. Radios are
/// shared between pods referencing the same record.
pub struct BleRadioProvider {
    service_id: Uuid,
    adapter: Arc<PeripheralAdapter>,
    protocol: Arc<dyn RadioProtocol>,
    lease_config: LeaseConfig,
    radios: Mutex<HashMap<Uuid, Arc<BleRadio>>>,
}

impl BleRadioProvider {
    pub fn new(
        service_id: Uuid,
        adapter: Arc<PeripheralAdapter>,
        protocol: Arc<dyn RadioProtocol>,
        lease_config: LeaseConfig,
    ) -> Self {
        Self {
            service_id,
            adapter,
            protocol,
            lease_config,
            radios: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl RadioProvider for BleRadioProvider {
    fn service_uuid(&self) -> Uuid {
        self.service_id
    }

    async fn get_radio(&self, record: &RadioRecord, _cancel: &CancellationToken) -> Result<Arc<BleRadio>> {
        let mut radios = self.radios.lock();
        if let Some(radio) = radios.get(&record.id).filter(|r| r.record() == record) {
            return Ok(radio.clone());
        }
        let radio = Arc::new(BleRadio::new(
            record.clone(),
            self.adapter.clone(),
            self.protocol.clone(),
            self.lease_config.clone(),
        ));
        radios.insert(record.id, radio.clone());
        Ok(radio)
    }
}

/// All radio providers, chosen by service id
#[derive(Default)]
pub struct RadioRegistry {
    providers: Vec<Arc<dyn RadioProvider>>,
}

impl RadioRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: Arc<dyn RadioProvider>) {
        self.providers.push(provider);
    }

    pub fn service_ids(&self) -> Vec<Uuid> {
        self.providers.iter().map(|p| p.service_uuid()).collect()
    }

    pub async fn get_radio(&self, record: &RadioRecord, cancel: &CancellationToken) -> Result<Arc<BleRadio>> {
        record.options.validate()?;
        let provider = self
            .providers
            .iter()
            .find(|p| p.service_uuid() == record.service_id)
            .ok_or_else(|| {
                LinkError::RadioNotReachable(format!("no provider for service {}", record.service_id))
            })?;
        provider.get_radio(record, cancel).await
    }
}
