use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::IpAddr;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};

/// Hardware identifier of a peer, e.g. "02:1a:2b:3c:4d:5e".
/// Stored lowercase so lookups are case-insensitive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceAddress(String);

impl DeviceAddress {
    pub fn new(address: impl AsRef<str>) -> Self {
        Self(address.as_ref().trim().to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceAddress {
    fn from(address: &str) -> Self {
        Self::new(address)
    }
}

/// Availability of a peer as last reported by the radio
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    #[default]
    Available,
    Invited,
    Connected,
    Failed,
    Unavailable,
}

/// A peer seen in a discovery snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Device {
    /// Human-readable name, not guaranteed unique
    pub name: String,

    /// Unique key within a discovery session
    pub address: DeviceAddress,

    #[serde(default)]
    pub status: DeviceStatus,

    /// Primary device type string, e.g. "10-0050F204-5"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_type: Option<String>,
}

impl Device {
    pub fn new(name: impl Into<String>, address: impl Into<DeviceAddress>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            status: DeviceStatus::Available,
            primary_type: None,
        }
    }

    /// "name:address" label shown in peer lists
    pub fn label(&self) -> String {
        format!("{}:{}", self.name, self.address)
    }
}

/// Devices received atomically from one peer query, in arrival order.
/// Later duplicates of an address are dropped on construction.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "Vec<Device>", into = "Vec<Device>")]
pub struct PeerSnapshot {
    devices: Vec<Device>,
}

impl From<Vec<Device>> for PeerSnapshot {
    fn from(devices: Vec<Device>) -> Self {
        Self::new(devices)
    }
}

impl From<PeerSnapshot> for Vec<Device> {
    fn from(snapshot: PeerSnapshot) -> Self {
        snapshot.devices
    }
}

impl PeerSnapshot {
    pub fn new(devices: impl IntoIterator<Item = Device>) -> Self {
        let mut seen = HashSet::new();
        let devices = devices
            .into_iter()
            .filter(|d| seen.insert(d.address.clone()))
            .collect();
        Self { devices }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

/// A service this device publishes before any connection exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRecord {
    /// Instance name, e.g. "_test"
    pub instance_name: String,

    /// "_protocol._transport", e.g. "_presence._tcp"
    pub service_type: String,

    /// TXT attributes, e.g. listenport / buddyname / available
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

/// A remote service, assembled from an identity response and a TXT response
/// sent by the same device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredService {
    pub instance_name: String,
    pub registration_type: String,
    pub attributes: HashMap<String, String>,
    pub device_address: DeviceAddress,
    pub discovered_at: DateTime<Utc>,
}

/// Out-of-band method used to authorize a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PairingMode {
    #[default]
    PushButton,
    Pin,
}

/// Role taken after group negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupRole {
    GroupOwner,
    Client,
}

/// Connection negotiation state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", content = "role", rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Idle,
    Discovering,
    ConnectRequested,
    Negotiating,
    Connected(GroupRole),
    Disconnected,
}

impl ConnectionState {
    pub fn role(&self) -> Option<GroupRole> {
        match self {
            ConnectionState::Connected(role) => Some(*role),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Idle => f.write_str("idle"),
            ConnectionState::Discovering => f.write_str("discovering"),
            ConnectionState::ConnectRequested => f.write_str("connect-requested"),
            ConnectionState::Negotiating => f.write_str("negotiating"),
            ConnectionState::Connected(GroupRole::GroupOwner) => f.write_str("connected(group-owner)"),
            ConnectionState::Connected(GroupRole::Client) => f.write_str("connected(client)"),
            ConnectionState::Disconnected => f.write_str("disconnected"),
        }
    }
}

/// Group details reported once negotiation has progressed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub group_formed: bool,
    pub is_group_owner: bool,
    pub group_owner_address: Option<IpAddr>,
}

/// Snapshot of the negotiator exposed to clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    #[serde(flatten)]
    pub state: ConnectionState,
    pub peer: Option<Device>,
    pub group_owner_address: Option<IpAddr>,
}
