//! Adaptive status probing for one pod
//!
//! `Idle -> Scheduled -> Running -> (Scheduled | Stopped)`. A successful
//! probe schedules the next one after the good interval, a failed one after
//! the shorter bad interval. Cancellation never reschedules; the owner has
//! to call `start` again.

use crate::cancel;
use crate::config::ProbeConfig;
use crate::pod::queue::RequestQueue;
use crate::pod::request::{PodRequest, RequestKind};
use crate::pod::state::RunningState;
use crate::{LinkError, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProbeState {
    Idle,
    Scheduled,
    Running,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeEvent {
    /// A probe finished; the next one runs after `next_interval`
    Completed {
        success: bool,
        next_interval: Duration,
    },
    /// Published once per failure streak when it reaches the alert threshold
    Unreachable {
        consecutive_failures: u32,
        last_contact: Option<SystemTime>,
    },
}

struct ProbeRun {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct ProbeScheduler {
    pod_id: Uuid,
    queue: Arc<RequestQueue>,
    running_state: watch::Receiver<RunningState>,
    config: ProbeConfig,
    run: tokio::sync::Mutex<Option<ProbeRun>>,
    state_tx: watch::Sender<ProbeState>,
    events: broadcast::Sender<ProbeEvent>,
}

impl ProbeScheduler {
    pub fn new(
        pod_id: Uuid,
        queue: Arc<RequestQueue>,
        running_state: watch::Receiver<RunningState>,
        config: ProbeConfig,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ProbeState::Idle);
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            pod_id,
            queue,
            running_state,
            config,
            run: tokio::sync::Mutex::new(None),
            state_tx,
            events,
        })
    }

    pub fn state(&self) -> ProbeState {
        *self.state_tx.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<ProbeState> {
        self.state_tx.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<ProbeEvent> {
        self.events.subscribe()
    }

    /// Arm the first probe after `initial_interval`. A running loop is
    /// stopped first, so at most one loop exists per pod.
    pub async fn start(self: &Arc<Self>, initial_interval: Duration) {
        let mut run = self.run.lock().await;
        if let Some(previous) = run.take() {
            previous.cancel.cancel();
            let _ = previous.task.await;
        }

        let cancel = CancellationToken::new();
        self.state_tx.send_replace(ProbeState::Scheduled);
        let task = tokio::spawn(self.clone().run_loop(initial_interval, cancel.clone()));
        *run = Some(ProbeRun { cancel, task });
        info!(pod = %self.pod_id, interval = ?initial_interval, "Probing started");
    }

    /// Cancel the armed timer and any probe in flight
    pub async fn stop(&self) {
        let mut run = self.run.lock().await;
        if let Some(current) = run.take() {
            current.cancel.cancel();
            let _ = current.task.await;
            info!(pod = %self.pod_id, "Probing stopped");
        }
        self.state_tx.send_replace(ProbeState::Stopped);
    }

    async fn run_loop(self: Arc<Self>, initial_interval: Duration, cancel: CancellationToken) {
        let mut interval = initial_interval;
        let mut failures = 0u32;

        loop {
            self.state_tx.send_replace(ProbeState::Scheduled);
            if cancel::sleep(&cancel, interval).await.is_err() {
                break;
            }

            self.state_tx.send_replace(ProbeState::Running);
            info!(pod = %self.pod_id, "Starting pod probe");
            let outcome = self.probe(&cancel).await;
            if cancel.is_cancelled() {
                info!(pod = %self.pod_id, "Pod probe canceled");
                break;
            }
            if outcome == Err(LinkError::QueueClosed) {
                info!(pod = %self.pod_id, "Request queue closed, probing ends");
                break;
            }

            let options = self.queue.selector().probe_options();
            let success = match outcome {
                Ok(()) => {
                    info!(pod = %self.pod_id, "Pod probe ended");
                    failures = 0;
                    interval = options.good_interval();
                    true
                }
                Err(e) => {
                    warn!(pod = %self.pod_id, error = %e, "Pod probe failed");
                    failures = failures.saturating_add(1);
                    interval = options.bad_interval();
                    if failures == self.config.alert_after_failures {
                        let last_contact = self.running_state.borrow().last_radio_contact;
                        warn!(pod = %self.pod_id, failures, "Pod unreachable");
                        let _ = self.events.send(ProbeEvent::Unreachable {
                            consecutive_failures: failures,
                            last_contact,
                        });
                    }
                    false
                }
            };
            let _ = self.events.send(ProbeEvent::Completed {
                success,
                next_interval: interval,
            });
        }

        self.state_tx.send_replace(ProbeState::Stopped);
    }

    async fn probe(&self, cancel: &CancellationToken) -> Result<()> {
        let request = PodRequest::new(self.pod_id, RequestKind::StatusCheck, Vec::new());
        let handle = self.queue.enqueue(request, cancel);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(LinkError::OperationCanceled),
            response = handle.response() => response.map(|_| ()),
        }
    }
}
