use serde::Serialize;
use sha2::{Sha256, Digest};
use shared::types::{Device, DeviceStatus};

/// Only the fields that make two peer lists different
#[derive(Serialize)]
struct HashView<'a> {
    name: &'a str,
    address: &'a str,
    status: DeviceStatus,
    primary_type: Option<&'a str>,
}

/// Computes a SHA-256 fingerprint of the peer list.
/// Display order is part of the list, so devices are hashed as given.
pub fn compute_hash(devices: &[Device]) -> String {
    let views: Vec<HashView<'_>> = devices
        .iter()
        .map(|d| HashView {
            name: &d.name,
            address: d.address.as_str(),
            status: d.status,
            primary_type: d.primary_type.as_deref(),
        })
        .collect();

    let json = serde_json::to_string(&views)
        .expect("Failed to serialize peers for hashing");

    let hash = Sha256::digest(json.as_bytes());
    hex::encode(hash)
}
