//! LAN emulation of the peer-to-peer radio over multicast DNS.
//!
//! Each node publishes a presence record carrying its device address and
//! group owner intent. Peers are the presence records seen while discovering,
//! local services are ordinary mDNS registrations, and group negotiation is
//! decided locally from the two intents: the higher one owns the group, two
//! 15s cannot agree, and ties go to the higher device address. A group with a
//! peer ends when that peer's presence record goes away.

pub mod advertise;
pub mod browser;

use std::collections::HashMap;
use std::sync::Arc;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use mdns_sd::{ServiceDaemon, ServiceInfo};
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use shared::protocol::{MAX_GROUP_OWNER_INTENT, PRESENCE_SERVICE_TYPE};
use shared::types::{
    ConnectionInfo, Device, DeviceAddress, DeviceStatus, PairingMode, PeerSnapshot, ServiceRecord,
};
use crate::config::RadioConfig;
use crate::notification::Notification;
use super::{RadioChannel, RadioFailure, RadioResult, RadioService, ServiceResponse};
use browser::PeerTable;

/// The group this node is part of, shared with the presence browser
pub type SharedLink = Arc<Mutex<GroupLink>>;

#[derive(Debug, Default)]
pub struct GroupLink {
    info: ConnectionInfo,
    peer: Option<DeviceAddress>,
}

impl GroupLink {
    pub fn info(&self) -> ConnectionInfo {
        self.info
    }

    /// Form a group owned by this node with no peer yet
    pub fn create(&mut self) -> RadioResult<ConnectionInfo> {
        if self.info.group_formed {
            return Err(RadioFailure::new("a group already exists"));
        }
        self.info = ConnectionInfo {
            group_formed: true,
            is_group_owner: true,
            group_owner_address: None,
        };
        self.peer = None;
        Ok(self.info)
    }

    pub fn join(&mut self, peer: DeviceAddress, info: ConnectionInfo) {
        self.info = info;
        self.peer = Some(peer);
    }

    /// Tear the group down if `address` was its peer
    pub fn peer_lost(&mut self, address: &DeviceAddress) -> bool {
        if self.peer.as_ref() != Some(address) {
            return false;
        }
        *self = Self::default();
        true
    }
}

const META_QUERY_TYPE: &str = "_services._dns-sd._udp.local.";

/// Locally administered unicast address derived from `seed`
pub fn derive_address(seed: &str) -> DeviceAddress {
    let digest = Sha256::digest(seed.as_bytes());
    let mut octets = [0u8; 6];
    octets.copy_from_slice(&digest[..6]);
    octets[0] = (octets[0] | 0x02) & !0x01;

    let text = octets
        .iter()
        .map(|b| hex::encode([*b]))
        .collect::<Vec<_>>()
        .join(":");
    DeviceAddress::new(text)
}

/// Decide whether the local side owns the group
fn resolve_owner(
    local: &DeviceAddress,
    local_intent: u8,
    remote: &DeviceAddress,
    remote_intent: u8,
) -> RadioResult<bool> {
    if local_intent == MAX_GROUP_OWNER_INTENT && remote_intent == MAX_GROUP_OWNER_INTENT {
        return Err(RadioFailure::new("both peers demand the group owner role"));
    }
    Ok(local_intent > remote_intent || (local_intent == remote_intent && local > remote))
}

struct Senders {
    notifications: mpsc::Sender<Notification>,
    responses: mpsc::Sender<ServiceResponse>,
}

#[derive(Default)]
struct MdnsState {
    presence: Option<ServiceInfo>,
    services: HashMap<(String, String), ServiceInfo>,
    browsing_peers: bool,
    browsing_services: bool,
    service_request: bool,
}

pub struct MdnsRadio {
    daemon: ServiceDaemon,
    local: Device,
    group_owner_intent: u8,
    hostname: String,
    peers: PeerTable,
    link: SharedLink,
    state: Mutex<MdnsState>,
    senders: Mutex<Option<Senders>>,
    cancel: CancellationToken,
}

impl MdnsRadio {
    pub fn new(config: &RadioConfig, local: Device, group_owner_intent: u8) -> Result<Self> {
        let hostname = hostname::get()
            .context("Failed to get system hostname")?
            .to_string_lossy()
            .to_string();

        let daemon = ServiceDaemon::new()
            .context("Failed to create mDNS daemon")?;
        if let Some(interface) = &config.interface {
            daemon
                .disable_interface(mdns_sd::IfKind::All)
                .context("Failed to disable default interfaces")?;
            daemon
                .enable_interface(interface.as_str())
                .with_context(|| format!("Failed to enable interface {}", interface))?;
        }

        Ok(Self {
            daemon,
            local,
            group_owner_intent,
            hostname,
            peers: Arc::new(Mutex::new(Vec::new())),
            link: Arc::new(Mutex::new(GroupLink::default())),
            state: Mutex::new(MdnsState::default()),
            senders: Mutex::new(None),
            cancel: CancellationToken::new(),
        })
    }

    async fn notifications(&self) -> RadioResult<mpsc::Sender<Notification>> {
        self.senders
            .lock()
            .await
            .as_ref()
            .map(|s| s.notifications.clone())
            .ok_or_else(|| RadioFailure::new("radio not initialized"))
    }

    async fn responses(&self) -> RadioResult<mpsc::Sender<ServiceResponse>> {
        self.senders
            .lock()
            .await
            .as_ref()
            .map(|s| s.responses.clone())
            .ok_or_else(|| RadioFailure::new("radio not initialized"))
    }

    async fn set_peer_status(&self, address: &DeviceAddress, status: DeviceStatus) -> bool {
        let mut peers = self.peers.lock().await;
        match peers.iter_mut().find(|p| &p.device.address == address) {
            Some(entry) if entry.device.status != status => {
                entry.device.status = status;
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl RadioService for MdnsRadio {
    async fn initialize(&self) -> Result<RadioChannel> {
        let mut senders = self.senders.lock().await;
        if senders.is_some() {
            bail!("mDNS radio already initialized");
        }

        let presence = advertise::register_presence(
            &self.daemon,
            &self.local,
            self.group_owner_intent,
            &self.hostname,
        )?;
        self.state.lock().await.presence = Some(presence);

        let (notifications, notifications_rx) = mpsc::channel(256);
        let (responses, responses_rx) = mpsc::channel(256);

        // The LAN is always up as far as peers are concerned
        notifications
            .send(Notification::RadioStateChanged { enabled: true })
            .await
            .context("Notification channel closed")?;
        notifications
            .send(Notification::LocalDeviceChanged(self.local.clone()))
            .await
            .context("Notification channel closed")?;

        *senders = Some(Senders {
            notifications,
            responses,
        });

        Ok(RadioChannel {
            notifications: notifications_rx,
            service_responses: responses_rx,
        })
    }

    async fn discover_peers(&self) -> RadioResult<()> {
        let notifications = self.notifications().await?;
        let mut state = self.state.lock().await;
        if state.browsing_peers {
            return Ok(());
        }

        let receiver = self
            .daemon
            .browse(PRESENCE_SERVICE_TYPE)
            .map_err(|e| RadioFailure::new(format!("browse failed: {}", e)))?;
        state.browsing_peers = true;

        tokio::spawn(browser::run_presence_browser(
            receiver,
            self.local.address.clone(),
            self.peers.clone(),
            self.link.clone(),
            notifications,
            self.cancel.child_token(),
        ));
        Ok(())
    }

    async fn request_peers(&self) -> PeerSnapshot {
        let peers = self.peers.lock().await;
        PeerSnapshot::new(peers.iter().map(|p| p.device.clone()))
    }

    async fn create_group(&self) -> RadioResult<()> {
        let notifications = self.notifications().await?;
        let info = self.link.lock().await.create()?;
        tracing::debug!("Autonomous group formed, local side is owner");

        tokio::spawn(async move {
            let _ = notifications
                .send(Notification::ConnectionStateChanged {
                    connected: true,
                    info: Some(info),
                    peer: None,
                })
                .await;
        });
        Ok(())
    }

    async fn add_local_service(&self, record: &ServiceRecord) -> RadioResult<()> {
        let info = advertise::register_service(&self.daemon, record, &self.local, &self.hostname)
            .map_err(|e| RadioFailure::new(format!("{:#}", e)))?;

        self.state
            .lock()
            .await
            .services
            .insert((record.instance_name.clone(), record.service_type.clone()), info);
        Ok(())
    }

    async fn remove_local_service(&self, record: &ServiceRecord) -> RadioResult<()> {
        let mut state = self.state.lock().await;
        let key = (record.instance_name.clone(), record.service_type.clone());
        let info = state
            .services
            .get(&key)
            .ok_or_else(|| RadioFailure::new("service is not registered"))?;

        advertise::unregister(&self.daemon, info)
            .map_err(|e| RadioFailure::new(format!("{:#}", e)))?;
        state.services.remove(&key);
        Ok(())
    }

    async fn add_service_request(&self) -> RadioResult<()> {
        self.state.lock().await.service_request = true;
        Ok(())
    }

    async fn discover_services(&self) -> RadioResult<()> {
        let responses = self.responses().await?;
        let mut state = self.state.lock().await;
        if !state.service_request {
            return Err(RadioFailure::new("no service requests registered"));
        }
        if state.browsing_services {
            return Ok(());
        }

        let meta_receiver = self
            .daemon
            .browse(META_QUERY_TYPE)
            .map_err(|e| RadioFailure::new(format!("meta-query browse failed: {}", e)))?;
        state.browsing_services = true;

        tokio::spawn(browser::run_service_browser(
            self.daemon.clone(),
            meta_receiver,
            self.local.address.clone(),
            self.peers.clone(),
            responses,
            self.cancel.child_token(),
        ));
        Ok(())
    }

    async fn connect(
        &self,
        device: &Device,
        pairing: PairingMode,
        group_owner_intent: u8,
    ) -> RadioResult<()> {
        if pairing == PairingMode::Pin {
            return Err(RadioFailure::new("PIN pairing is not available over mDNS"));
        }

        let remote = self
            .peers
            .lock()
            .await
            .iter()
            .find(|p| p.device.address == device.address)
            .cloned()
            .ok_or_else(|| RadioFailure::new("peer not found"))?;

        let is_owner = resolve_owner(
            &self.local.address,
            group_owner_intent,
            &remote.device.address,
            remote.group_owner_intent,
        )?;
        let group_owner_address = if is_owner {
            None
        } else {
            remote.addresses.first().copied()
        };

        self.link.lock().await.join(
            device.address.clone(),
            ConnectionInfo {
                group_formed: true,
                is_group_owner: is_owner,
                group_owner_address,
            },
        );
        let status_changed = self.set_peer_status(&device.address, DeviceStatus::Connected).await;

        tracing::debug!(
            "Group with {} formed, local side is {}",
            remote.device.label(),
            if is_owner { "owner" } else { "client" }
        );

        // Reported after the call itself has completed
        let notifications = self.notifications().await?;
        let peer = device.address.clone();
        tokio::spawn(async move {
            if status_changed {
                let _ = notifications.send(Notification::PeerListChanged).await;
            }
            let _ = notifications
                .send(Notification::ConnectionStateChanged {
                    connected: true,
                    info: None,
                    peer: Some(peer),
                })
                .await;
        });
        Ok(())
    }

    async fn request_connection_info(&self) -> ConnectionInfo {
        self.link.lock().await.info()
    }

    async fn shutdown(&self) -> Result<()> {
        self.cancel.cancel();

        let mut state = self.state.lock().await;
        for (_, info) in state.services.drain() {
            if let Err(e) = advertise::unregister(&self.daemon, &info) {
                tracing::error!("Failed to unregister mDNS service: {}", e);
            }
        }
        if let Some(presence) = state.presence.take() {
            advertise::unregister(&self.daemon, &presence)?;
        }

        self.daemon
            .shutdown()
            .context("Failed to shutdown mDNS daemon")?;
        Ok(())
    }
}
