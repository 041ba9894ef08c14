//! Radio selection for one pod
//!
//! The radio that last completed a connection or exchange is tried first;
//! the rest follow in registration order. Each candidate gets its own
//! bounded attempt, so one dead radio cannot starve the others.

use crate::ble::PeripheralLease;
use crate::pod::radio::{BleRadio, RadioOptions};
use crate::{LinkError, Result};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

pub struct RadioSelector {
    radios: RwLock<Vec<Arc<BleRadio>>>,
    preferred: RwLock<Option<Uuid>>,
    attempt_timeout: Duration,
}

impl RadioSelector {
    pub fn new(attempt_timeout: Duration) -> Self {
        Self {
            radios: RwLock::new(Vec::new()),
            preferred: RwLock::new(None),
            attempt_timeout,
        }
    }

    /// Replace the candidate set, keeping registration order
    pub fn initialize(&self, radios: Vec<Arc<BleRadio>>) {
        let mut preferred = self.preferred.write();
        if preferred.map_or(false, |id| !radios.iter().any(|r| r.id() == id)) {
            *preferred = None;
        }
        *self.radios.write() = radios;
    }

    pub fn radios(&self) -> Vec<Arc<BleRadio>> {
        self.radios.read().clone()
    }

    pub fn preferred(&self) -> Option<Uuid> {
        *self.preferred.read()
    }

    /// Remember `radio_id` as the first candidate for the next selection
    pub fn mark_success(&self, radio_id: Uuid) {
        let mut preferred = self.preferred.write();
        if *preferred != Some(radio_id) {
            debug!(radio = %radio_id, "Preferred radio changed");
            *preferred = Some(radio_id);
        }
    }

    /// Candidates in the order they will be tried
    pub fn candidates(&self) -> Vec<Arc<BleRadio>> {
        let mut radios = self.radios();
        if let Some(id) = self.preferred() {
            if let Some(pos) = radios.iter().position(|r| r.id() == id) {
                let radio = radios.remove(pos);
                radios.insert(0, radio);
            }
        }
        radios
    }

    /// Intervals for probing, taken from the preferred radio
    pub fn probe_options(&self) -> RadioOptions {
        self.candidates()
            .first()
            .map(|r| r.options())
            .unwrap_or_default()
    }

    /// A connected radio and its lease
    pub async fn select(&self, cancel: &CancellationToken) -> Result<(Arc<BleRadio>, PeripheralLease)> {
        let candidates = self.candidates();
        if candidates.is_empty() {
            return Err(LinkError::RadioNotReachable("no radios registered".to_string()));
        }

        for radio in &candidates {
            if cancel.is_cancelled() {
                return Err(LinkError::OperationCanceled);
            }
            match radio.open(self.attempt_timeout, cancel).await {
                Ok(lease) => {
                    info!(radio = %radio.id(), "Radio selected");
                    self.mark_success(radio.id());
                    return Ok((radio.clone(), lease));
                }
                Err(LinkError::OperationCanceled) => return Err(LinkError::OperationCanceled),
                Err(e) => {
                    debug!(radio = %radio.id(), error = %e, "Radio not usable, trying next");
                }
            }
        }

        Err(LinkError::RadioNotReachable(format!(
            "none of {} radios reachable",
            candidates.len()
        )))
    }
}
