// Podlink Core: BLE coordination for insulin pods
#![allow(clippy::empty_line_after_doc_comments)]
//
// One shared adapter, many redundant radios, one exchange per pod at a time.
// Everything here exists to keep a live pod's status current without ever
// leaving a lock, a paused scan, or a keep-awake resource behind.

pub mod ble;
pub mod cancel;
pub mod config;
pub mod platform;
pub mod pod;
pub mod store;

use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

pub use ble::{
    ArbitrationGuard, DiscoveryState, Peripheral, PeripheralAdapter, PeripheralDiscovery,
    PeripheralLease, PeripheralScanner,
};
pub use config::LinkConfig;
pub use platform::{ApplicationFunctions, KeepAwakeGuard};
pub use pod::{
    Pod, PodService, ProbeEvent, ProbeScheduler, ProbeState, RadioSelector, RequestHandle,
    RequestQueue,
};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("Bluetooth adapter is not enabled")]
    AdapterNotEnabled,
    #[error("Radio not reachable: {0}")]
    RadioNotReachable(String),
    #[error("Operation canceled")]
    OperationCanceled,
    #[error("Exchange timed out after {0:?}")]
    ExchangeTimeout(Duration),
    #[error("Timed out waiting for {0}")]
    Timeout(String),
    #[error("Exchange failed: {0}")]
    ExchangeFailed(String),
    #[error("Native BLE error: {0}")]
    Native(String),
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Pod has been archived")]
    PodArchived,
    #[error("No active pod {0}")]
    PodNotFound(Uuid),
    #[error("Request queue closed")]
    QueueClosed,
}

impl LinkError {
    /// True for the errors an exchange can end with without the caller
    /// having asked for it.
    pub fn is_exchange_failure(&self) -> bool {
        !matches!(self, LinkError::OperationCanceled)
    }
}

impl From<anyhow::Error> for LinkError {
    fn from(err: anyhow::Error) -> Self {
        LinkError::Native(format!("{:#}", err))
    }
}

pub type Result<T> = std::result::Result<T, LinkError>;
