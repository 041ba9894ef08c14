//! BLE layer
//!
//! Scanner, adapter, and leases over an abstract native stack. The native
//! stack is reached only through the traits in [`native`]; [`sim`] provides
//! an in-memory implementation.

pub mod adapter;
pub mod lease;
pub mod native;
pub mod peripheral;
pub mod replay;
pub mod scanner;
pub mod sim;

pub use adapter::{ArbitrationGuard, PeripheralAdapter, PeripheralDiscovery};
pub use lease::PeripheralLease;
pub use native::{
    AdapterStatus, BleStack, ConnectionEvent, ConnectionStatus, NativeCharacteristic,
    NativeDevice, ScanCallback, ScanHandle, ScanRecord,
};
pub use peripheral::{DiscoveryState, Peripheral, PeripheralSnapshot};
pub use scanner::{PeripheralScanner, ScanSubscription, ScannerState};
