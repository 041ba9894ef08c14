//! Pod lifecycle state
//!
//! The coarse state shown for a pod is derived from the newest exchange that
//! reported a delivery progress value. The last radio contact is the newest
//! successful exchange.

use crate::pod::request::ExchangeRecord;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::SystemTime;

/// Delivery progress as reported by the pod itself
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PodProgress {
    InitialState,
    TankPowerActivated,
    TankFillCompleted,
    PairingSuccess,
    Purging,
    ReadyForInjection,
    BasalScheduleSet,
    Priming,
    Running,
    RunningLow,
    ErrorShuttingDown,
    AlertExpiredShuttingDown,
    Inactive,
}

impl PodProgress {
    /// Parse the progress name used in simulated and text protocols
    pub fn from_name(name: &str) -> Option<Self> {
        let progress = match name {
            "InitialState" => Self::InitialState,
            "TankPowerActivated" => Self::TankPowerActivated,
            "TankFillCompleted" => Self::TankFillCompleted,
            "PairingSuccess" => Self::PairingSuccess,
            "Purging" => Self::Purging,
            "ReadyForInjection" => Self::ReadyForInjection,
            "BasalScheduleSet" => Self::BasalScheduleSet,
            "Priming" => Self::Priming,
            "Running" => Self::Running,
            "RunningLow" => Self::RunningLow,
            "ErrorShuttingDown" => Self::ErrorShuttingDown,
            "AlertExpiredShuttingDown" => Self::AlertExpiredShuttingDown,
            "Inactive" => Self::Inactive,
            _ => return None,
        };
        Some(progress)
    }
}

/// Coarse lifecycle state shown for a pod
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PodState {
    #[default]
    Unknown,
    Pairing,
    Paired,
    Priming,
    Primed,
    Starting,
    Started,
    Faulted,
    Expired,
    Stopped,
}

impl From<PodProgress> for PodState {
    fn from(progress: PodProgress) -> Self {
        match progress {
            PodProgress::InitialState
            | PodProgress::TankPowerActivated
            | PodProgress::TankFillCompleted => PodState::Pairing,
            PodProgress::PairingSuccess => PodState::Paired,
            PodProgress::Purging => PodState::Priming,
            PodProgress::ReadyForInjection => PodState::Primed,
            PodProgress::BasalScheduleSet | PodProgress::Priming => PodState::Starting,
            PodProgress::Running | PodProgress::RunningLow => PodState::Started,
            PodProgress::ErrorShuttingDown => PodState::Faulted,
            PodProgress::AlertExpiredShuttingDown => PodState::Expired,
            PodProgress::Inactive => PodState::Stopped,
        }
    }
}

impl fmt::Display for PodState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "Unknown"),
            Self::Pairing => write!(f, "Pairing"),
            Self::Paired => write!(f, "Paired"),
            Self::Priming => write!(f, "Priming"),
            Self::Primed => write!(f, "Primed"),
            Self::Starting => write!(f, "Starting"),
            Self::Started => write!(f, "Started"),
            Self::Faulted => write!(f, "Faulted"),
            Self::Expired => write!(f, "Expired"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Live summary of a pod
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunningState {
    pub last_radio_contact: Option<SystemTime>,
    pub state: PodState,
    pub last_updated: Option<SystemTime>,
    /// Start time of the exchange `state` was taken from
    state_source: Option<SystemTime>,
}

impl RunningState {
    /// Recompute from persisted exchange history, in any order
    pub fn from_history(records: &[ExchangeRecord]) -> Self {
        let mut state = RunningState::default();
        for record in records {
            state.apply(record);
        }
        state.last_updated = Some(SystemTime::now());
        state
    }

    /// Fold one finished exchange in. Older records never override newer
    /// information.
    pub fn apply(&mut self, record: &ExchangeRecord) {
        if record.is_success() && self.last_radio_contact.map_or(true, |t| record.finished_at > t) {
            self.last_radio_contact = Some(record.finished_at);
        }
        if let Some(progress) = record.progress {
            if self.state_source.map_or(true, |t| record.started_at >= t) {
                self.state = progress.into();
                self.state_source = Some(record.started_at);
            }
        }
        self.last_updated = Some(SystemTime::now());
    }
}
