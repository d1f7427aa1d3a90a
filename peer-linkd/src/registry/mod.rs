pub mod hash;

use shared::types::{Device, DeviceAddress, PeerSnapshot};
use crate::error::{P2pError, P2pResult};

/// Emitted when a refresh actually replaced the peer list
#[derive(Debug, Clone, PartialEq)]
pub struct PeersChanged {
    pub devices: Vec<Device>,
}

/// Known peers, in the order of the most recent snapshot.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    current: PeerSnapshot,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the peer list if the snapshot differs structurally.
    /// Returns the change event only when something changed.
    pub fn refresh(&mut self, snapshot: PeerSnapshot) -> Option<PeersChanged> {
        if snapshot == self.current {
            return None;
        }

        if snapshot.is_empty() {
            tracing::debug!("No devices found");
        }

        self.current = snapshot;
        Some(PeersChanged {
            devices: self.current.devices().to_vec(),
        })
    }

    /// Drop every peer, e.g. when the radio goes down
    pub fn clear(&mut self) -> Option<PeersChanged> {
        self.refresh(PeerSnapshot::empty())
    }

    pub fn list_devices(&self) -> &[Device] {
        self.current.devices()
    }

    /// Lookup for a device picked by its position in the displayed list
    pub fn find_by_index(&self, index: usize) -> P2pResult<&Device> {
        let devices = self.current.devices();
        devices.get(index).ok_or(P2pError::IndexOutOfRange {
            index,
            len: devices.len(),
        })
    }

    pub fn find_by_address(&self, address: &DeviceAddress) -> Option<&Device> {
        self.current.devices().iter().find(|d| &d.address == address)
    }

    pub fn len(&self) -> usize {
        self.current.len()
    }

    pub fn is_empty(&self) -> bool {
        self.current.is_empty()
    }

    pub fn fingerprint(&self) -> String {
        hash::compute_hash(self.current.devices())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn device(n: u8) -> Device {
        Device::new(format!("peer-{}", n), format!("02:00:00:00:00:{:02x}", n).as_str())
    }

    fn snapshot(ids: &[u8]) -> PeerSnapshot {
        PeerSnapshot::new(ids.iter().map(|&n| device(n)))
    }

    #[test]
    fn test_equal_snapshot_is_not_a_change() {
        let mut registry = PeerRegistry::new();

        assert!(registry.refresh(snapshot(&[1, 2])).is_some());
        assert!(registry.refresh(snapshot(&[1, 2])).is_none(), "Identical refresh should not report change");
    }

    #[test]
    fn test_different_snapshot_reports_new_order() {
        let mut registry = PeerRegistry::new();
        registry.refresh(snapshot(&[1, 2]));

        let change = registry.refresh(snapshot(&[2, 1, 3])).unwrap();
        let addresses: Vec<_> = change.devices.iter().map(|d| d.name.clone()).collect();
        assert_eq!(addresses, vec!["peer-2", "peer-1", "peer-3"]);
        assert_eq!(registry.list_devices(), change.devices.as_slice());
    }

    #[test]
    fn test_empty_snapshot_replaces_peers() {
        let mut registry = PeerRegistry::new();
        registry.refresh(snapshot(&[1]));

        let change = registry.refresh(PeerSnapshot::empty()).unwrap();
        assert!(change.devices.is_empty());
        assert!(registry.is_empty());

        // Empty after empty is not a change
        assert!(registry.clear().is_none());
    }

    #[test]
    fn test_addresses_stay_unique() {
        let mut registry = PeerRegistry::new();
        let sequences: [&[u8]; 4] = [&[1, 1, 2], &[3, 2, 3, 3], &[], &[4, 4, 4, 5]];

        for ids in sequences {
            registry.refresh(snapshot(ids));
            let unique: HashSet<_> = registry.list_devices().iter().map(|d| &d.address).collect();
            assert_eq!(unique.len(), registry.len());
        }
    }

    #[test]
    fn test_find_by_index_bounds() {
        let mut registry = PeerRegistry::new();
        registry.refresh(snapshot(&[7, 8, 9]));

        assert_eq!(registry.find_by_index(2).unwrap().name, "peer-9");
        for index in 3..6 {
            assert_eq!(
                registry.find_by_index(index),
                Err(P2pError::IndexOutOfRange { index, len: 3 })
            );
        }
    }

    #[test]
    fn test_find_by_address() {
        let mut registry = PeerRegistry::new();
        registry.refresh(snapshot(&[1, 2]));

        let found = registry.find_by_address(&DeviceAddress::new("02:00:00:00:00:02"));
        assert_eq!(found.map(|d| d.name.as_str()), Some("peer-2"));
        assert!(registry.find_by_address(&DeviceAddress::new("02:00:00:00:00:03")).is_none());
    }

    #[test]
    fn test_fingerprint_tracks_contents() {
        let mut registry = PeerRegistry::new();
        let empty = registry.fingerprint();

        registry.refresh(snapshot(&[1]));
        assert_ne!(registry.fingerprint(), empty);

        registry.clear();
        assert_eq!(registry.fingerprint(), empty);
    }
}
