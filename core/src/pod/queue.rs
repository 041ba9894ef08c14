//! Per-pod request queue
//!
//! Requests for one pod run strictly one at a time in enqueue order. A single
//! drain task exists while there is work; it selects a radio, runs the
//! exchange under a bounded timeout, persists the record, and keeps the
//! connection open only while more requests are waiting. Failures fail the
//! request; retrying is up to the caller.

use crate::ble::PeripheralLease;
use crate::cancel;
use crate::config::QueueConfig;
use crate::pod::radio::BleRadio;
use crate::pod::request::{ExchangeOutcome, ExchangeRecord, PodRequest};
use crate::pod::selector::RadioSelector;
use crate::pod::state::RunningState;
use crate::store::PodRepository;
use crate::{LinkError, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::SystemTime;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

type Session = (Arc<BleRadio>, PeripheralLease);

struct Pending {
    request: PodRequest,
    responder: oneshot::Sender<Result<ExchangeRecord>>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Pending>,
    draining: bool,
    closed: bool,
}

/// Awaitable result of one enqueued request
pub struct RequestHandle {
    request_id: Uuid,
    rx: oneshot::Receiver<Result<ExchangeRecord>>,
    cancel: CancellationToken,
}

impl RequestHandle {
    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    /// Cancel this request only
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the exchange record or the failure
    pub async fn response(self) -> Result<ExchangeRecord> {
        self.rx.await.unwrap_or(Err(LinkError::QueueClosed))
    }
}

pub struct RequestQueue {
    pod_id: Uuid,
    config: QueueConfig,
    selector: RwLock<Arc<RadioSelector>>,
    repository: Arc<dyn PodRepository>,
    running_state: Arc<watch::Sender<RunningState>>,
    state: Mutex<QueueState>,
    shutdown: CancellationToken,
    me: Weak<RequestQueue>,
}

impl RequestQueue {
    pub fn new(
        pod_id: Uuid,
        selector: Arc<RadioSelector>,
        repository: Arc<dyn PodRepository>,
        running_state: Arc<watch::Sender<RunningState>>,
        config: QueueConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            pod_id,
            config,
            selector: RwLock::new(selector),
            repository,
            running_state,
            state: Mutex::new(QueueState::default()),
            shutdown: CancellationToken::new(),
            me: me.clone(),
        })
    }

    pub fn pod_id(&self) -> Uuid {
        self.pod_id
    }

    pub fn selector(&self) -> Arc<RadioSelector> {
        self.selector.read().clone()
    }

    /// Swap the radio set used for subsequent requests
    pub fn set_selector(&self, selector: Arc<RadioSelector>) {
        *self.selector.write() = selector;
    }

    /// Requests waiting, not counting the one in flight
    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Append a request; draining starts if nothing is running for this pod
    pub fn enqueue(&self, request: PodRequest, cancel: &CancellationToken) -> RequestHandle {
        let (tx, rx) = oneshot::channel();
        let token = cancel.child_token();
        let handle = RequestHandle {
            request_id: request.id,
            rx,
            cancel: token.clone(),
        };

        let mut state = self.state.lock();
        if state.closed {
            let _ = tx.send(Err(LinkError::QueueClosed));
            return handle;
        }

        debug!(pod = %self.pod_id, request = %request.id, kind = %request.kind, "Request queued");
        state.pending.push_back(Pending {
            request,
            responder: tx,
            cancel: token,
        });
        if !state.draining {
            if let Some(queue) = self.me.upgrade() {
                state.draining = true;
                tokio::spawn(queue.drain());
            }
        }
        handle
    }

    /// Fail everything waiting and refuse new requests
    pub fn shutdown(&self) {
        let drained: Vec<Pending> = {
            let mut state = self.state.lock();
            state.closed = true;
            state.pending.drain(..).collect()
        };
        self.shutdown.cancel();
        for pending in drained {
            let _ = pending.responder.send(Err(LinkError::QueueClosed));
        }
        info!(pod = %self.pod_id, "Request queue shut down");
    }

    async fn drain(self: Arc<Self>) {
        let mut session: Option<Session> = None;

        loop {
            let next = self.state.lock().pending.pop_front();
            let Some(Pending {
                request,
                responder,
                cancel,
            }) = next
            else {
                self.close_session(&mut session).await;
                let mut state = self.state.lock();
                if state.pending.is_empty() || state.closed {
                    state.draining = false;
                    return;
                }
                continue;
            };

            if cancel.is_cancelled() {
                let _ = responder.send(Err(LinkError::OperationCanceled));
                continue;
            }

            let started_at = SystemTime::now();
            let result = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => Err(LinkError::QueueClosed),
                result = self.execute(&mut session, &request, started_at, &cancel) => result,
            };

            let record = match &result {
                Ok(record) => record.clone(),
                Err(e) => {
                    if e.is_exchange_failure() {
                        warn!(pod = %self.pod_id, request = %request.id, error = %e, "Request failed");
                    } else {
                        debug!(pod = %self.pod_id, request = %request.id, "Request canceled");
                    }
                    let radio_id = session.as_ref().map(|(radio, _)| radio.id());
                    self.close_session(&mut session).await;
                    ExchangeRecord::failed(&request, radio_id, started_at, e)
                }
            };
            self.finish(&record);

            let hold = result.is_ok()
                && self.config.hold_connection_while_pending
                && !self.state.lock().pending.is_empty();
            if !hold {
                self.close_session(&mut session).await;
            }

            let _ = responder.send(result);
        }
    }

    async fn execute(
        &self,
        session: &mut Option<Session>,
        request: &PodRequest,
        started_at: SystemTime,
        cancel: &CancellationToken,
    ) -> Result<ExchangeRecord> {
        if session.as_ref().map_or(false, |(_, lease)| !lease.is_connected()) {
            self.close_session(session).await;
        }

        let selector = self.selector();
        if session.is_none() {
            *session = Some(selector.select(cancel).await?);
        }
        // the session stays with the caller so it can be closed if this
        // future is dropped mid-exchange
        let Some((radio, lease)) = session.as_ref() else {
            return Err(LinkError::RadioNotReachable("no radio session".to_string()));
        };

        let timeout = self.config.exchange_timeout();
        let exchange = cancel::within(cancel, timeout, "exchange", radio.perform(lease, request, cancel)).await;

        let response = match exchange {
            Ok(response) => response?,
            Err(LinkError::Timeout(_)) => return Err(LinkError::ExchangeTimeout(timeout)),
            Err(e) => return Err(e),
        };

        selector.mark_success(radio.id());
        debug!(pod = %self.pod_id, request = %request.id, radio = %radio.id(), "Exchange completed");
        Ok(ExchangeRecord {
            request_id: request.id,
            pod_id: request.pod_id,
            kind: request.kind,
            radio_id: Some(radio.id()),
            command: request.command.clone(),
            progress: radio.interpret(&response),
            response: Some(response),
            started_at,
            finished_at: SystemTime::now(),
            outcome: ExchangeOutcome::Succeeded,
        })
    }

    fn finish(&self, record: &ExchangeRecord) {
        if let Err(e) = self.repository.append_exchange(record) {
            warn!(pod = %self.pod_id, error = %e, "Failed to persist exchange");
        }
        self.running_state.send_modify(|state| state.apply(record));
    }

    async fn close_session(&self, session: &mut Option<Session>) {
        if let Some((radio, lease)) = session.take() {
            radio.close(lease).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pod::request::RequestKind;
    use crate::store::{MemoryStorage, StoredPodRepository};
    use std::time::Duration;

    fn empty_queue() -> (Arc<RequestQueue>, Arc<StoredPodRepository<MemoryStorage>>) {
        let repository = Arc::new(StoredPodRepository::new(MemoryStorage::new()));
        let (running, _) = watch::channel(RunningState::default());
        let queue = RequestQueue::new(
            Uuid::new_v4(),
            Arc::new(RadioSelector::new(Duration::from_secs(1))),
            repository.clone(),
            Arc::new(running),
            QueueConfig::default(),
        );
        (queue, repository)
    }

    #[tokio::test(start_paused = true)]
    async fn test_requests_without_radio_fail_in_order() {
        let (queue, repository) = empty_queue();
        let cancel = CancellationToken::new();

        let handles: Vec<_> = (0..3u8)
            .map(|n| queue.enqueue(PodRequest::new(queue.pod_id(), RequestKind::Bolus, vec![n]), &cancel))
            .collect();
        for handle in handles {
            assert!(matches!(
                handle.response().await,
                Err(LinkError::RadioNotReachable(_))
            ));
        }

        let history = repository.exchanges_for_pod(queue.pod_id()).unwrap();
        let commands: Vec<_> = history.iter().map(|r| r.command.clone()).collect();
        assert_eq!(commands, vec![vec![0], vec![1], vec![2]]);
        assert!(history.iter().all(|r| !r.is_success()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_canceled_request_is_skipped() {
        let (queue, repository) = empty_queue();
        let cancel = CancellationToken::new();
        let handle = queue.enqueue(PodRequest::new(queue.pod_id(), RequestKind::Bolus, vec![]), &cancel);
        handle.cancel();
        assert_eq!(handle.response().await, Err(LinkError::OperationCanceled));
        assert!(repository.exchanges_for_pod(queue.pod_id()).unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_queue_refuses_requests() {
        let (queue, _) = empty_queue();
        queue.shutdown();
        let handle = queue.enqueue(
            PodRequest::new(queue.pod_id(), RequestKind::StatusCheck, vec![]),
            &CancellationToken::new(),
        );
        assert_eq!(handle.response().await, Err(LinkError::QueueClosed));
        assert!(queue.is_closed());
    }
}
