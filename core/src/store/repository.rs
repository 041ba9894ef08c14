//! Pod repository
//!
//! Pods, radios and exchange history as JSON documents in a
//! [`StorageBackend`]. Exchange records are append-only and keyed by pod and
//! start time, so a prefix scan returns one pod's history oldest first.

use crate::pod::{ExchangeRecord, PodRecord, RadioRecord};
use crate::store::backend::StorageBackend;
use crate::{LinkError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::UNIX_EPOCH;
use tracing::debug;
use uuid::Uuid;

const POD_PREFIX: &str = "pod:";
const RADIO_PREFIX: &str = "radio:";
const EXCHANGE_PREFIX: &str = "exchange:";

/// Persistence collaborator used by pods and the pod service
#[cfg_attr(test, mockall::automock)]
pub trait PodRepository: Send + Sync {
    fn save_pod(&self, pod: &PodRecord) -> Result<()>;
    fn load_pod(&self, id: Uuid) -> Result<Option<PodRecord>>;
    /// Pods not archived, in no particular order
    fn load_active_pods(&self) -> Result<Vec<PodRecord>>;
    /// Active pod with the given lot and serial number
    fn load_by_identity(&self, lot: u32, serial: u32) -> Result<Option<PodRecord>>;
    fn save_radio(&self, radio: &RadioRecord) -> Result<()>;
    fn load_radio(&self, id: Uuid) -> Result<Option<RadioRecord>>;
    /// Store a finished exchange; records are never overwritten
    fn append_exchange(&self, record: &ExchangeRecord) -> Result<()>;
    /// History of one pod, oldest first
    fn exchanges_for_pod(&self, pod_id: Uuid) -> Result<Vec<ExchangeRecord>>;
}

pub struct StoredPodRepository<B: StorageBackend> {
    backend: B,
}

impl<B: StorageBackend> StoredPodRepository<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn put<T: Serialize>(&self, key: String, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value).map_err(|e| LinkError::Storage(e.to_string()))?;
        self.backend.put(key.as_bytes(), &bytes)
    }

    fn get<T: DeserializeOwned>(&self, key: String) -> Result<Option<T>> {
        self.backend
            .get(key.as_bytes())?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    fn scan<T: DeserializeOwned>(&self, prefix: &str) -> Result<Vec<T>> {
        self.backend
            .scan_prefix(prefix.as_bytes())?
            .iter()
            .map(|(_, bytes)| decode(bytes))
            .collect()
    }
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|e| LinkError::Storage(e.to_string()))
}

fn exchange_key(record: &ExchangeRecord) -> String {
    let nanos = record
        .started_at
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!(
        "{}{}:{:024}:{}",
        EXCHANGE_PREFIX, record.pod_id, nanos, record.request_id
    )
}

impl<B: StorageBackend> PodRepository for StoredPodRepository<B> {
    fn save_pod(&self, pod: &PodRecord) -> Result<()> {
        self.put(format!("{}{}", POD_PREFIX, pod.id), pod)
    }

    fn load_pod(&self, id: Uuid) -> Result<Option<PodRecord>> {
        self.get(format!("{}{}", POD_PREFIX, id))
    }

    fn load_active_pods(&self) -> Result<Vec<PodRecord>> {
        let pods: Vec<PodRecord> = self.scan(POD_PREFIX)?;
        Ok(pods.into_iter().filter(|p| !p.archived).collect())
    }

    fn load_by_identity(&self, lot: u32, serial: u32) -> Result<Option<PodRecord>> {
        Ok(self
            .load_active_pods()?
            .into_iter()
            .find(|p| p.lot == lot && p.serial == serial))
    }

    fn save_radio(&self, radio: &RadioRecord) -> Result<()> {
        self.put(format!("{}{}", RADIO_PREFIX, radio.id), radio)
    }

    fn load_radio(&self, id: Uuid) -> Result<Option<RadioRecord>> {
        self.get(format!("{}{}", RADIO_PREFIX, id))
    }

    fn append_exchange(&self, record: &ExchangeRecord) -> Result<()> {
        let key = exchange_key(record);
        if self.backend.get(key.as_bytes())?.is_some() {
            return Err(LinkError::Storage(format!(
                "exchange {} already recorded",
                record.request_id
            )));
        }
        self.put(key, record)?;
        debug!(pod = %record.pod_id, kind = %record.kind, "Exchange recorded");
        Ok(())
    }

    fn exchanges_for_pod(&self, pod_id: Uuid) -> Result<Vec<ExchangeRecord>> {
        self.scan(&format!("{}{}:", EXCHANGE_PREFIX, pod_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pod::{ExchangeOutcome, RequestKind};
    use crate::store::backend::{MemoryStorage, SledStorage};
    use std::time::Duration;

    fn exchange(pod_id: Uuid, at_secs: u64) -> ExchangeRecord {
        let started_at = UNIX_EPOCH + Duration::from_secs(at_secs);
        ExchangeRecord {
            request_id: Uuid::new_v4(),
            pod_id,
            kind: RequestKind::Bolus,
            radio_id: None,
            command: vec![1, 2],
            response: Some(vec![3]),
            progress: None,
            started_at,
            finished_at: started_at,
            outcome: ExchangeOutcome::Succeeded,
        }
    }

    #[test]
    fn test_active_pods_and_identity_lookup() {
        let repo = StoredPodRepository::new(MemoryStorage::new());
        let active = PodRecord::new(100, 200, Vec::new());
        let mut archived = PodRecord::new(100, 201, Vec::new());
        archived.archived = true;
        repo.save_pod(&active).unwrap();
        repo.save_pod(&archived).unwrap();

        let pods = repo.load_active_pods().unwrap();
        assert_eq!(pods, vec![active.clone()]);
        assert_eq!(repo.load_by_identity(100, 200).unwrap(), Some(active));
        assert_eq!(repo.load_by_identity(100, 201).unwrap(), None);
    }

    #[test]
    fn test_exchange_history_is_ordered_per_pod() {
        let repo = StoredPodRepository::new(MemoryStorage::new());
        let pod = Uuid::new_v4();
        let other = Uuid::new_v4();
        let late = exchange(pod, 2_000);
        let early = exchange(pod, 1_000);
        repo.append_exchange(&late).unwrap();
        repo.append_exchange(&early).unwrap();
        repo.append_exchange(&exchange(other, 1_500)).unwrap();

        assert_eq!(repo.exchanges_for_pod(pod).unwrap(), vec![early, late]);
    }

    #[test]
    fn test_exchange_records_are_append_only() {
        let repo = StoredPodRepository::new(MemoryStorage::new());
        let record = exchange(Uuid::new_v4(), 10);
        repo.append_exchange(&record).unwrap();
        assert!(matches!(
            repo.append_exchange(&record),
            Err(LinkError::Storage(_))
        ));
    }

    #[test]
    fn test_sled_repository_stores_radios() {
        let dir = tempfile::tempdir().unwrap();
        let repo = StoredPodRepository::new(SledStorage::open(&dir.path().join("pods")).unwrap());
        let radio = RadioRecord::new(Uuid::new_v4(), Uuid::new_v4(), Some("RL".into()));

        repo.save_radio(&radio).unwrap();
        repo.backend().flush().unwrap();
        assert_eq!(repo.load_radio(radio.id).unwrap(), Some(radio));
        assert_eq!(repo.load_radio(Uuid::new_v4()).unwrap(), None);
    }
}
