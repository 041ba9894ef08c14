//! Pod requests and exchange records

use crate::pod::state::PodProgress;
use crate::LinkError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::SystemTime;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestKind {
    Activation,
    Bolus,
    DeliveryCancellation,
    ScheduledDelivery,
    /// Periodic health check issued by the probe scheduler
    StatusCheck,
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Activation => write!(f, "activation"),
            Self::Bolus => write!(f, "bolus"),
            Self::DeliveryCancellation => write!(f, "delivery-cancellation"),
            Self::ScheduledDelivery => write!(f, "scheduled-delivery"),
            Self::StatusCheck => write!(f, "status-check"),
        }
    }
}

/// One queued command for a pod. The payload is opaque to this crate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodRequest {
    pub id: Uuid,
    pub pod_id: Uuid,
    pub kind: RequestKind,
    pub command: Vec<u8>,
    pub created_at: SystemTime,
}

impl PodRequest {
    pub fn new(pod_id: Uuid, kind: RequestKind, command: Vec<u8>) -> Self {
        Self {
            id: Uuid::new_v4(),
            pod_id,
            kind,
            command,
            created_at: SystemTime::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExchangeOutcome {
    Succeeded,
    TimedOut,
    Failed(String),
}

/// Immutable result of one exchange, persisted append-only
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeRecord {
    pub request_id: Uuid,
    pub pod_id: Uuid,
    pub kind: RequestKind,
    /// Radio that carried the exchange, if one was reached
    pub radio_id: Option<Uuid>,
    pub command: Vec<u8>,
    pub response: Option<Vec<u8>>,
    pub progress: Option<PodProgress>,
    pub started_at: SystemTime,
    pub finished_at: SystemTime,
    pub outcome: ExchangeOutcome,
}

impl ExchangeRecord {
    pub fn is_success(&self) -> bool {
        self.outcome == ExchangeOutcome::Succeeded
    }

    /// Record for a request that failed before or during its exchange
    pub(crate) fn failed(
        request: &PodRequest,
        radio_id: Option<Uuid>,
        started_at: SystemTime,
        error: &LinkError,
    ) -> Self {
        let outcome = match error {
            LinkError::ExchangeTimeout(_) | LinkError::Timeout(_) => ExchangeOutcome::TimedOut,
            other => ExchangeOutcome::Failed(other.to_string()),
        };
        Self {
            request_id: request.id,
            pod_id: request.pod_id,
            kind: request.kind,
            radio_id,
            command: request.command.clone(),
            response: None,
            progress: None,
            started_at,
            finished_at: SystemTime::now(),
            outcome,
        }
    }
}
