// Store module: pod, radio and exchange persistence

pub mod backend;
pub mod repository;

pub use backend::{MemoryStorage, SledStorage, StorageBackend};
pub use repository::{PodRepository, StoredPodRepository};

#[cfg(test)]
pub use repository::MockPodRepository;
