//! Native BLE bridge
//!
//! The host's Bluetooth stack (Android, CoreBluetooth, BlueZ via btleplug, or
//! the in-memory simulator) is reached only through these traits. Only the
//! scanner starts scans and only leases drive connections.

use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

// ============================================================================
// STATE TYPES
// ============================================================================

/// Power/permission state reported by the adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AdapterStatus {
    Unknown,
    Unsupported,
    Unauthorized,
    PoweredOff,
    PoweredOn,
}

impl fmt::Display for AdapterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "Unknown"),
            Self::Unsupported => write!(f, "Unsupported"),
            Self::Unauthorized => write!(f, "Unauthorized"),
            Self::PoweredOff => write!(f, "PoweredOff"),
            Self::PoweredOn => write!(f, "PoweredOn"),
        }
    }
}

/// Link state of one native device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Connection state change published by a native device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected,
    ConnectionFailed(String),
}

// ============================================================================
// SCANNING
// ============================================================================

/// One advertisement seen by a native scan
#[derive(Clone)]
pub struct ScanRecord {
    pub device: Arc<dyn NativeDevice>,
    /// Local name from the advertisement payload
    pub advertised_name: Option<String>,
    pub rssi: i16,
    /// Advertised service ids
    pub service_ids: Vec<Uuid>,
}

impl ScanRecord {
    pub fn device_id(&self) -> Uuid {
        self.device.id()
    }
}

impl fmt::Debug for ScanRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanRecord")
            .field("device_id", &self.device.id())
            .field("advertised_name", &self.advertised_name)
            .field("rssi", &self.rssi)
            .field("service_ids", &self.service_ids)
            .finish()
    }
}

/// Receives native scan results, or the error that ended the scan.
///
/// Errors are never delivered from inside `start_scan`; a scan that cannot
/// start is reported through its result instead.
pub type ScanCallback = Arc<dyn Fn(Result<ScanRecord>) + Send + Sync>;

/// A running native scan
pub trait ScanHandle: Send + Sync {
    /// Stop the native scan. No further callbacks arrive after this returns.
    fn stop(self: Box<Self>);
}

// ============================================================================
// BRIDGE TRAITS
// ============================================================================

/// Adapter-level operations of the native stack
#[async_trait]
pub trait BleStack: Send + Sync {
    /// Current adapter state
    fn adapter_status(&self) -> AdapterStatus;

    /// Stream of adapter state changes
    fn adapter_status_changes(&self) -> broadcast::Receiver<AdapterStatus>;

    /// Whether this platform lets applications power the adapter on
    fn can_control_adapter(&self) -> bool;

    /// Request an adapter power state; completion is reported through
    /// `adapter_status_changes`
    async fn set_adapter_enabled(&self, enabled: bool) -> Result<()>;

    /// Start a continuous scan filtered by service id
    fn start_scan(&self, service_filter: &[Uuid], callback: ScanCallback)
        -> Result<Box<dyn ScanHandle>>;

    /// Devices the stack currently holds a connection to
    async fn connected_devices(&self) -> Result<Vec<Arc<dyn NativeDevice>>>;
}

/// One native device handle
#[async_trait]
pub trait NativeDevice: Send + Sync {
    fn id(&self) -> Uuid;

    /// Name known to the OS, if any
    fn name(&self) -> Option<String>;

    fn status(&self) -> ConnectionStatus;

    /// Stream of connection events for this device
    fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent>;

    /// Issue a connect request; the outcome arrives as a [`ConnectionEvent`]
    fn connect(&self, auto_reconnect: bool);

    /// Cancel a pending or established connection
    fn cancel_connection(&self);

    /// Service ids exposed by the connected device
    async fn discover_services(&self) -> Result<Vec<Uuid>>;

    /// Characteristics of one service, in native discovery order
    async fn discover_characteristics(
        &self,
        service_id: Uuid,
    ) -> Result<Vec<Arc<dyn NativeCharacteristic>>>;

    async fn read_rssi(&self) -> Result<i16>;
}

/// One GATT characteristic
#[async_trait]
pub trait NativeCharacteristic: Send + Sync {
    fn id(&self) -> Uuid;

    fn service_id(&self) -> Uuid;

    async fn read(&self) -> Result<Vec<u8>>;

    async fn write(&self, data: &[u8]) -> Result<()>;
}
