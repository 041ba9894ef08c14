//! Pod aggregate
//!
//! Owns the pod's radio selector, request queue, probe scheduler and live
//! running state. Radios are referenced by id and resolved through the
//! registry; nothing here holds a native handle.

use crate::config::LinkConfig;
use crate::pod::probe::ProbeScheduler;
use crate::pod::queue::{RequestHandle, RequestQueue};
use crate::pod::radio::{BleRadio, RadioRecord, RadioRegistry};
use crate::pod::request::{PodRequest, RequestKind};
use crate::pod::selector::RadioSelector;
use crate::pod::state::RunningState;
use crate::store::PodRepository;
use crate::{LinkError, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// Persisted pod identity and radio assignment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodRecord {
    pub id: Uuid,
    pub lot: u32,
    pub serial: u32,
    /// Radio address assigned at pairing, `0x34xxxxxx`
    pub radio_address: u32,
    /// Registered radios, in registration order
    pub radios: Vec<Uuid>,
    pub archived: bool,
    pub created_at: SystemTime,
}

impl PodRecord {
    pub fn new(lot: u32, serial: u32, radios: Vec<Uuid>) -> Self {
        Self {
            id: Uuid::new_v4(),
            lot,
            serial,
            radio_address: generate_radio_address(),
            radios,
            archived: false,
            created_at: SystemTime::now(),
        }
    }
}

fn generate_radio_address() -> u32 {
    let random = Uuid::new_v4();
    let bytes = random.as_bytes();
    0x3400_0000 | (u32::from(bytes[0]) << 16) | (u32::from(bytes[1]) << 8) | u32::from(bytes[2])
}

/// Collaborators shared by every pod
#[derive(Clone)]
pub struct PodContext {
    pub repository: Arc<dyn PodRepository>,
    pub registry: Arc<RadioRegistry>,
    pub config: LinkConfig,
}

pub struct Pod {
    record: RwLock<PodRecord>,
    context: PodContext,
    queue: Arc<RequestQueue>,
    probe: Arc<ProbeScheduler>,
    running_state: Arc<watch::Sender<RunningState>>,
    archived_tx: broadcast::Sender<Uuid>,
}

impl Pod {
    /// Resolve radios, rebuild the running state from history and arm the
    /// first probe
    pub async fn initialize(
        record: PodRecord,
        context: PodContext,
        archived_tx: broadcast::Sender<Uuid>,
        cancel: &CancellationToken,
    ) -> Result<Arc<Self>> {
        let selector = Arc::new(RadioSelector::new(context.config.queue.radio_select_timeout()));
        selector.initialize(resolve_radios(&record, &context, cancel).await?);

        let history = context.repository.exchanges_for_pod(record.id)?;
        let (running_tx, running_rx) = watch::channel(RunningState::from_history(&history));
        let running_state = Arc::new(running_tx);

        let queue = RequestQueue::new(
            record.id,
            selector,
            context.repository.clone(),
            running_state.clone(),
            context.config.queue.clone(),
        );
        let probe = ProbeScheduler::new(record.id, queue.clone(), running_rx, context.config.probe.clone());

        let pod = Arc::new(Self {
            record: RwLock::new(record),
            context,
            queue,
            probe,
            running_state,
            archived_tx,
        });
        if !pod.is_archived() {
            pod.probe.start(pod.context.config.probe.initial_delay()).await;
        }
        info!(pod = %pod.id(), "Pod initialized");
        Ok(pod)
    }

    pub fn id(&self) -> Uuid {
        self.record.read().id
    }

    pub fn record(&self) -> PodRecord {
        self.record.read().clone()
    }

    pub fn is_archived(&self) -> bool {
        self.record.read().archived
    }

    pub fn running_state(&self) -> RunningState {
        self.running_state.borrow().clone()
    }

    pub fn running_state_changes(&self) -> watch::Receiver<RunningState> {
        self.running_state.subscribe()
    }

    pub fn probe(&self) -> &Arc<ProbeScheduler> {
        &self.probe
    }

    pub fn queue(&self) -> &Arc<RequestQueue> {
        &self.queue
    }

    /// Pod ids published as pods get archived
    pub fn when_archived(&self) -> broadcast::Receiver<Uuid> {
        self.archived_tx.subscribe()
    }

    // ------------------------------------------------------------------------
    // Requests
    // ------------------------------------------------------------------------

    pub fn submit(
        &self,
        kind: RequestKind,
        payload: Vec<u8>,
        cancel: &CancellationToken,
    ) -> Result<RequestHandle> {
        if self.is_archived() {
            return Err(LinkError::PodArchived);
        }
        let request = PodRequest::new(self.id(), kind, payload);
        Ok(self.queue.enqueue(request, cancel))
    }

    pub fn activation_request(&self, payload: Vec<u8>, cancel: &CancellationToken) -> Result<RequestHandle> {
        self.submit(RequestKind::Activation, payload, cancel)
    }

    pub fn bolus_request(&self, payload: Vec<u8>, cancel: &CancellationToken) -> Result<RequestHandle> {
        self.submit(RequestKind::Bolus, payload, cancel)
    }

    pub fn cancellation_request(&self, payload: Vec<u8>, cancel: &CancellationToken) -> Result<RequestHandle> {
        self.submit(RequestKind::DeliveryCancellation, payload, cancel)
    }

    pub fn scheduled_delivery_request(
        &self,
        payload: Vec<u8>,
        cancel: &CancellationToken,
    ) -> Result<RequestHandle> {
        self.submit(RequestKind::ScheduledDelivery, payload, cancel)
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    pub async fn start_probing(&self) {
        if !self.is_archived() {
            let interval = self.queue.selector().probe_options().good_interval();
            self.probe.start(interval).await;
        }
    }

    pub async fn stop_probing(&self) {
        self.probe.stop().await;
    }

    /// Replace the pod's radios and restart probing on the new set
    pub async fn update_radio_list(&self, radios: Vec<RadioRecord>, cancel: &CancellationToken) -> Result<()> {
        if self.is_archived() {
            return Err(LinkError::PodArchived);
        }
        self.probe.stop().await;

        for radio in &radios {
            self.context.repository.save_radio(radio)?;
        }
        let updated = {
            let mut record = self.record.write();
            record.radios = radios.iter().map(|r| r.id).collect();
            record.clone()
        };
        self.context.repository.save_pod(&updated)?;

        let selector = Arc::new(RadioSelector::new(self.context.config.queue.radio_select_timeout()));
        selector.initialize(resolve_radios(&updated, &self.context, cancel).await?);
        self.queue.set_selector(selector);
        info!(pod = %updated.id, radios = updated.radios.len(), "Radio list updated");

        self.start_probing().await;
        Ok(())
    }

    /// Stop probing, persist the archived flag and announce it
    pub async fn archive(&self) -> Result<()> {
        self.probe.stop().await;
        let updated = {
            let mut record = self.record.write();
            record.archived = true;
            record.clone()
        };
        self.context.repository.save_pod(&updated)?;
        self.queue.shutdown();
        info!(pod = %updated.id, "Pod archived");
        let _ = self.archived_tx.send(updated.id);
        Ok(())
    }

    /// Stop background work without changing the record
    pub async fn shutdown(&self) {
        self.probe.stop().await;
        self.queue.shutdown();
    }
}

async fn resolve_radios(
    record: &PodRecord,
    context: &PodContext,
    cancel: &CancellationToken,
) -> Result<Vec<Arc<BleRadio>>> {
    let mut radios = Vec::with_capacity(record.radios.len());
    for radio_id in &record.radios {
        let Some(radio_record) = context.repository.load_radio(*radio_id)? else {
            warn!(pod = %record.id, radio = %radio_id, "Registered radio missing from store");
            continue;
        };
        match context.registry.get_radio(&radio_record, cancel).await {
            Ok(radio) => radios.push(radio),
            Err(e) => warn!(pod = %record.id, radio = %radio_id, error = %e, "Radio could not be resolved"),
        }
    }
    Ok(radios)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MockPodRepository;
    use mockall::predicate::*;

    fn context(repository: MockPodRepository) -> PodContext {
        PodContext {
            repository: Arc::new(repository),
            registry: Arc::new(RadioRegistry::new()),
            config: LinkConfig::default(),
        }
    }

    #[test]
    fn test_radio_address_prefix() {
        let record = PodRecord::new(1, 2, Vec::new());
        assert_eq!(record.radio_address & 0xff00_0000, 0x3400_0000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_archive_persists_and_announces() {
        let record = PodRecord::new(44, 55, Vec::new());
        let pod_id = record.id;

        let mut repository = MockPodRepository::new();
        repository
            .expect_exchanges_for_pod()
            .with(eq(pod_id))
            .returning(|_| Ok(Vec::new()));
        repository
            .expect_save_pod()
            .withf(move |r| r.id == pod_id && r.archived)
            .times(1)
            .returning(|_| Ok(()));

        let (archived_tx, _) = broadcast::channel(4);
        let pod = Pod::initialize(record, context(repository), archived_tx, &CancellationToken::new())
            .await
            .unwrap();
        let mut archived = pod.when_archived();

        pod.archive().await.unwrap();
        assert_eq!(archived.recv().await.unwrap(), pod_id);
        assert!(pod.is_archived());
        assert_eq!(
            pod.probe().state(),
            crate::pod::probe::ProbeState::Stopped
        );
        assert!(matches!(
            pod.bolus_request(vec![1], &CancellationToken::new()),
            Err(LinkError::PodArchived)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_radio_is_skipped() {
        let radio_id = Uuid::new_v4();
        let record = PodRecord::new(1, 1, vec![radio_id]);

        let mut repository = MockPodRepository::new();
        repository
            .expect_load_radio()
            .with(eq(radio_id))
            .returning(|_| Ok(None));
        repository
            .expect_exchanges_for_pod()
            .returning(|_| Ok(Vec::new()));

        let (archived_tx, _) = broadcast::channel(4);
        let pod = Pod::initialize(record, context(repository), archived_tx, &CancellationToken::new())
            .await
            .unwrap();
        assert!(pod.queue().selector().radios().is_empty());
        pod.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_history_storage_error_fails_initialize() {
        let mut repository = MockPodRepository::new();
        repository
            .expect_exchanges_for_pod()
            .returning(|_| Err(LinkError::Storage("disk gone".into())));

        let (archived_tx, _) = broadcast::channel(4);
        let result = Pod::initialize(
            PodRecord::new(1, 1, Vec::new()),
            context(repository),
            archived_tx,
            &CancellationToken::new(),
        )
        .await;
        assert!(matches!(result, Err(LinkError::Storage(_))));
    }
}
