//! Logical peripheral record
//!
//! One entry per physical device ever seen. Entries are never deleted; a
//! discovery cycle that ends without re-observing a device marks it
//! `NotFound`, which is what consumers use as the "radio went away" signal.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use uuid::Uuid;

/// Discovery state of a peripheral within the current discovery cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiscoveryState {
    Searching,
    Discovered,
    NotFound,
}

/// Point-in-time copy of a peripheral's mutable fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeripheralSnapshot {
    pub id: Uuid,
    pub primary_service_id: Uuid,
    pub name: Option<String>,
    pub rssi: Option<(i16, SystemTime)>,
    pub discovery: Option<(DiscoveryState, SystemTime)>,
}

#[derive(Debug, Default)]
struct PeripheralInfo {
    name: Option<String>,
    rssi: Option<(i16, SystemTime)>,
    discovery: Option<(DiscoveryState, SystemTime)>,
}

/// A discoverable/connectable BLE endpoint as seen by the adapter
#[derive(Debug)]
pub struct Peripheral {
    id: Uuid,
    primary_service_id: Uuid,
    info: RwLock<PeripheralInfo>,
}

impl Peripheral {
    pub fn new(id: Uuid, primary_service_id: Uuid) -> Self {
        Self {
            id,
            primary_service_id,
            info: RwLock::new(PeripheralInfo::default()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn primary_service_id(&self) -> Uuid {
        self.primary_service_id
    }

    pub fn name(&self) -> Option<String> {
        self.info.read().name.clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        self.info.write().name = Some(name.into());
    }

    /// Take `name` only if no name is known yet
    pub fn set_name_if_missing(&self, name: &str) {
        let mut info = self.info.write();
        if info.name.as_deref().map_or(true, str::is_empty) && !name.is_empty() {
            info.name = Some(name.to_string());
        }
    }

    pub fn rssi(&self) -> Option<(i16, SystemTime)> {
        self.info.read().rssi
    }

    pub fn set_rssi(&self, rssi: i16, at: SystemTime) {
        self.info.write().rssi = Some((rssi, at));
    }

    pub fn discovery_state(&self) -> Option<(DiscoveryState, SystemTime)> {
        self.info.read().discovery
    }

    pub fn set_discovery_state(&self, state: DiscoveryState, at: SystemTime) {
        self.info.write().discovery = Some((state, at));
    }

    /// Move `Searching` to `NotFound`; other states are left alone.
    /// Returns whether the transition happened.
    pub fn resolve_not_found(&self, at: SystemTime) -> bool {
        let mut info = self.info.write();
        match info.discovery {
            Some((DiscoveryState::Searching, _)) => {
                info.discovery = Some((DiscoveryState::NotFound, at));
                true
            }
            _ => false,
        }
    }

    pub fn snapshot(&self) -> PeripheralSnapshot {
        let info = self.info.read();
        PeripheralSnapshot {
            id: self.id,
            primary_service_id: self.primary_service_id,
            name: info.name.clone(),
            rssi: info.rssi,
            discovery: info.discovery,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_only_from_searching() {
        let peripheral = Peripheral::new(Uuid::new_v4(), Uuid::new_v4());
        let now = SystemTime::now();

        assert!(!peripheral.resolve_not_found(now));
        assert_eq!(peripheral.discovery_state(), None);

        peripheral.set_discovery_state(DiscoveryState::Discovered, now);
        assert!(!peripheral.resolve_not_found(now));

        peripheral.set_discovery_state(DiscoveryState::Searching, now);
        assert!(peripheral.resolve_not_found(now));
        assert_eq!(
            peripheral.discovery_state().map(|(s, _)| s),
            Some(DiscoveryState::NotFound)
        );
    }

    #[test]
    fn test_name_if_missing_keeps_existing() {
        let peripheral = Peripheral::new(Uuid::new_v4(), Uuid::new_v4());
        peripheral.set_name_if_missing("");
        assert_eq!(peripheral.name(), None);
        peripheral.set_name_if_missing("adv");
        peripheral.set_name_if_missing("other");
        assert_eq!(peripheral.name().as_deref(), Some("adv"));
    }

    #[test]
    fn test_snapshot_reflects_current_info() {
        let id = Uuid::new_v4();
        let service = Uuid::new_v4();
        let peripheral = Peripheral::new(id, service);
        let now = SystemTime::now();
        peripheral.set_name("pod");
        peripheral.set_rssi(-61, now);
        peripheral.set_discovery_state(DiscoveryState::Discovered, now);

        let snapshot = peripheral.snapshot();
        assert_eq!(snapshot.id, id);
        assert_eq!(snapshot.primary_service_id, service);
        assert_eq!(snapshot.name.as_deref(), Some("pod"));
        assert_eq!(snapshot.rssi, Some((-61, now)));
        assert_eq!(snapshot.discovery, Some((DiscoveryState::Discovered, now)));

        peripheral.set_name("renamed");
        assert_eq!(snapshot.name.as_deref(), Some("pod"));
    }
}
