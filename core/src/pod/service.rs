//! Active pod registry
//!
//! Loads the active pods at startup, creates new ones, and forgets pods once
//! they are archived.

use crate::pod::pod::{Pod, PodContext, PodRecord};
use crate::pod::radio::RadioRecord;
use crate::{LinkError, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub struct PodService {
    context: PodContext,
    pods: RwLock<HashMap<Uuid, Arc<Pod>>>,
    archived_tx: broadcast::Sender<Uuid>,
}

impl PodService {
    pub fn new(context: PodContext) -> Arc<Self> {
        let (archived_tx, _) = broadcast::channel(16);
        Arc::new(Self {
            context,
            pods: RwLock::new(HashMap::new()),
            archived_tx,
        })
    }

    /// Initialize every active pod in the repository. A pod that fails to
    /// initialize is logged and skipped.
    pub async fn start(&self, cancel: &CancellationToken) -> Result<usize> {
        let records = self.context.repository.load_active_pods()?;
        let mut started = 0;
        for record in records {
            let pod_id = record.id;
            if self.pods.read().contains_key(&pod_id) {
                debug!(pod = %pod_id, "Pod already running");
                continue;
            }
            match Pod::initialize(record, self.context.clone(), self.archived_tx.clone(), cancel).await {
                Ok(pod) => {
                    self.adopt(pod).await;
                    started += 1;
                }
                Err(LinkError::OperationCanceled) => return Err(LinkError::OperationCanceled),
                Err(e) => warn!(pod = %pod_id, error = %e, "Pod failed to initialize"),
            }
        }
        info!(pods = started, "Pod service started");
        Ok(started)
    }

    /// Register radios, persist a new pod and bring it up
    pub async fn create_pod(
        &self,
        lot: u32,
        serial: u32,
        radios: Vec<RadioRecord>,
        cancel: &CancellationToken,
    ) -> Result<Arc<Pod>> {
        for radio in &radios {
            self.context.repository.save_radio(radio)?;
        }
        let record = PodRecord::new(lot, serial, radios.iter().map(|r| r.id).collect());
        self.context.repository.save_pod(&record)?;

        let pod = Pod::initialize(record, self.context.clone(), self.archived_tx.clone(), cancel).await?;
        self.pods.write().insert(pod.id(), pod.clone());
        info!(pod = %pod.id(), lot, serial, "Pod created");
        Ok(pod)
    }

    /// Live, non-archived pods
    pub fn active_pods(&self) -> Vec<Arc<Pod>> {
        self.prune_archived();
        self.pods.read().values().cloned().collect()
    }

    pub fn get(&self, pod_id: Uuid) -> Option<Arc<Pod>> {
        self.prune_archived();
        self.pods.read().get(&pod_id).cloned()
    }

    /// Active pod with this lot and serial, loading it if only persisted
    pub async fn find_by_identity(
        &self,
        lot: u32,
        serial: u32,
        cancel: &CancellationToken,
    ) -> Result<Option<Arc<Pod>>> {
        if let Some(pod) = self.active_pods().into_iter().find(|p| {
            let record = p.record();
            record.lot == lot && record.serial == serial
        }) {
            return Ok(Some(pod));
        }

        let Some(record) = self.context.repository.load_by_identity(lot, serial)? else {
            return Ok(None);
        };
        let pod = Pod::initialize(record, self.context.clone(), self.archived_tx.clone(), cancel).await?;
        Ok(Some(self.adopt(pod).await))
    }

    /// Archive a pod and drop it from the registry
    pub async fn archive(&self, pod_id: Uuid) -> Result<()> {
        let pod = self
            .pods
            .write()
            .remove(&pod_id)
            .ok_or(LinkError::PodNotFound(pod_id))?;
        pod.archive().await
    }

    /// Pod ids published as pods get archived
    pub fn when_pod_archived(&self) -> broadcast::Receiver<Uuid> {
        self.archived_tx.subscribe()
    }

    /// Stop probing and queues of every pod
    pub async fn shutdown(&self) {
        let pods: Vec<Arc<Pod>> = self.pods.write().drain().map(|(_, pod)| pod).collect();
        for pod in pods {
            pod.shutdown().await;
        }
    }

    /// Register a freshly initialized pod unless another instance won the
    /// race; the loser is shut down so only one probe loop runs per pod.
    async fn adopt(&self, pod: Arc<Pod>) -> Arc<Pod> {
        let existing = {
            let mut pods = self.pods.write();
            match pods.get(&pod.id()) {
                Some(existing) if !existing.is_archived() => Some(existing.clone()),
                _ => {
                    pods.insert(pod.id(), pod.clone());
                    None
                }
            }
        };
        match existing {
            Some(existing) => {
                debug!(pod = %pod.id(), "Discarding duplicate pod instance");
                pod.shutdown().await;
                existing
            }
            None => pod,
        }
    }

    fn prune_archived(&self) {
        self.pods.write().retain(|_, pod| !pod.is_archived());
    }
}
