//! Pod layer
//!
//! Radio selection, per-pod request serialization and adaptive probing on
//! top of the BLE layer.

#[allow(clippy::module_inception)]
pub mod pod;
pub mod probe;
pub mod queue;
pub mod radio;
pub mod request;
pub mod selector;
pub mod service;
pub mod state;

pub use pod::{Pod, PodContext, PodRecord};
pub use probe::{ProbeEvent, ProbeScheduler, ProbeState};
pub use queue::{RequestHandle, RequestQueue};
pub use radio::{
    BleRadio, BleRadioProvider, CharacteristicProtocol, RadioOptions, RadioProtocol,
    RadioProvider, RadioRecord, RadioRegistry,
};
pub use request::{ExchangeOutcome, ExchangeRecord, PodRequest, RequestKind};
pub use selector::RadioSelector;
pub use service::PodService;
pub use state::{PodProgress, PodState, RunningState};
