use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use futures::stream::{FuturesUnordered, StreamExt};
use futures::Future;
use shared::protocol::{
    MAX_GROUP_OWNER_INTENT, PRESENCE_SERVICE_TYPE, TXT_ADDRESS, TXT_DEVICE_TYPE, TXT_INTENT,
    TXT_PEER,
};
use shared::types::{Device, DeviceAddress};
use crate::notification::Notification;
use crate::radio::ServiceResponse;
use super::SharedLink;

/// Intent assumed for peers that do not publish one
const DEFAULT_PEER_INTENT: u8 = 7;

/// A peer as seen through its presence record
#[derive(Debug, Clone)]
pub struct PeerEntry {
    pub fullname: String,
    pub device: Device,
    pub group_owner_intent: u8,
    pub addresses: Vec<IpAddr>,
}

/// Peers in first-seen order
pub type PeerTable = Arc<Mutex<Vec<PeerEntry>>>;

type RecvResult = (usize, flume::Receiver<ServiceEvent>, std::result::Result<ServiceEvent, flume::RecvError>);
type RecvFuture = Pin<Box<dyn Future<Output = RecvResult> + Send>>;

/// Each future owns a clone of the receiver, avoiding borrow issues with the
/// receivers vec. flume::Receiver is Clone (multi-consumer).
fn make_recv_future(idx: usize, rx: flume::Receiver<ServiceEvent>) -> RecvFuture {
    Box::pin(async move {
        let result = rx.recv_async().await;
        (idx, rx, result)
    })
}

/// Track presence records and report every change as a peer-list change.
/// Losing the peer of our group also ends the connection.
pub async fn run_presence_browser(
    receiver: flume::Receiver<ServiceEvent>,
    local: DeviceAddress,
    peers: PeerTable,
    link: SharedLink,
    notifications: mpsc::Sender<Notification>,
    cancel: CancellationToken,
) {
    tracing::info!("Starting peer discovery browser");

    loop {
        tokio::select! {
            event = receiver.recv_async() => {
                let changed = match event {
                    Ok(ServiceEvent::ServiceResolved(info)) => match parse_presence(&info) {
                        Some(entry) if entry.device.address != local => upsert_peer(&peers, entry).await,
                        Some(_) => false,
                        None => {
                            tracing::debug!("Ignoring presence record without address: {}", info.get_fullname());
                            false
                        }
                    },
                    Ok(ServiceEvent::ServiceRemoved(_typ, fullname)) => {
                        match remove_peer(&peers, &fullname).await {
                            Some(entry) => {
                                if link.lock().await.peer_lost(&entry.device.address) {
                                    tracing::info!("Group peer {} left", entry.device.label());
                                    let lost = Notification::ConnectionStateChanged {
                                        connected: false,
                                        info: None,
                                        peer: Some(entry.device.address),
                                    };
                                    if notifications.send(lost).await.is_err() {
                                        break;
                                    }
                                }
                                true
                            }
                            None => false,
                        }
                    }
                    Ok(_) => false,
                    Err(e) => {
                        tracing::warn!("Peer discovery receiver disconnected: {}", e);
                        break;
                    }
                };

                if changed && notifications.send(Notification::PeerListChanged).await.is_err() {
                    break;
                }
            }

            _ = cancel.cancelled() => {
                tracing::info!("Peer discovery browser shutting down");
                break;
            }
        }
    }
}

/// Browse every advertised service type and split each resolution into the
/// identity and TXT halves of a service response
pub async fn run_service_browser(
    daemon: ServiceDaemon,
    meta_receiver: flume::Receiver<ServiceEvent>,
    local: DeviceAddress,
    peers: PeerTable,
    responses: mpsc::Sender<ServiceResponse>,
    cancel: CancellationToken,
) {
    tracing::info!("Starting service discovery browser");

    let mut browsed_types = HashSet::new();
    let mut next_idx = 0usize;
    let mut type_futures: FuturesUnordered<RecvFuture> = FuturesUnordered::new();

    loop {
        tokio::select! {
            // Check for new service types from meta-query
            event = meta_receiver.recv_async() => {
                match event {
                    Ok(ServiceEvent::ServiceResolved(info)) => {
                        let service_type = info.get_type();

                        if service_type != PRESENCE_SERVICE_TYPE && !browsed_types.contains(service_type) {
                            tracing::info!("Discovered new service type: {}", service_type);
                            browsed_types.insert(service_type.to_string());

                            match daemon.browse(service_type) {
                                Ok(receiver) => {
                                    let idx = next_idx;
                                    next_idx += 1;
                                    type_futures.push(make_recv_future(idx, receiver));
                                }
                                Err(e) => {
                                    tracing::error!("Failed to browse {}: {}", service_type, e);
                                }
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::error!("Error receiving meta-query event: {}", e);
                        break;
                    }
                }
            }

            Some((idx, rx, result)) = type_futures.next() => {
                match result {
                    Ok(ServiceEvent::ServiceResolved(info)) => {
                        if let Some((identity, txt)) = split_response(&info, &local, &peers).await {
                            if responses.send(identity).await.is_err() || responses.send(txt).await.is_err() {
                                tracing::debug!("Service response listener gone");
                                break;
                            }
                        }
                        type_futures.push(make_recv_future(idx, rx));
                    }
                    Ok(_) => {
                        type_futures.push(make_recv_future(idx, rx));
                    }
                    Err(e) => {
                        tracing::warn!("Receiver {} disconnected: {}", idx, e);
                    }
                }
            }

            _ = cancel.cancelled() => {
                tracing::info!("Service discovery browser shutting down");
                break;
            }
        }
    }
}

async fn upsert_peer(peers: &PeerTable, entry: PeerEntry) -> bool {
    let mut table = peers.lock().await;
    match table.iter_mut().find(|p| p.device.address == entry.device.address) {
        Some(existing) => {
            // Keep the status we assigned locally
            let status = existing.device.status;
            let mut entry = entry;
            entry.device.status = status;
            let changed = existing.device != entry.device || existing.fullname != entry.fullname;
            *existing = entry;
            changed
        }
        None => {
            tracing::debug!("Peer appeared: {}", entry.device.label());
            table.push(entry);
            true
        }
    }
}

async fn remove_peer(peers: &PeerTable, fullname: &str) -> Option<PeerEntry> {
    let mut table = peers.lock().await;
    let index = table.iter().position(|p| p.fullname == fullname)?;
    Some(table.remove(index))
}

/// Instance part of "instance._type._proto.local."
fn instance_of(info: &ServiceInfo) -> String {
    let fullname = info.get_fullname();
    fullname
        .strip_suffix(info.get_type())
        .map(|s| s.trim_end_matches('.'))
        .unwrap_or(fullname)
        .to_string()
}

fn parse_presence(info: &ServiceInfo) -> Option<PeerEntry> {
    let address = info.get_property_val_str(TXT_ADDRESS)?;
    let group_owner_intent = info
        .get_property_val_str(TXT_INTENT)
        .and_then(|v| v.parse::<u8>().ok())
        .unwrap_or(DEFAULT_PEER_INTENT)
        .min(MAX_GROUP_OWNER_INTENT);

    let mut device = Device::new(instance_of(info), address);
    device.primary_type = info.get_property_val_str(TXT_DEVICE_TYPE).map(str::to_string);

    Some(PeerEntry {
        fullname: info.get_fullname().to_string(),
        device,
        group_owner_intent,
        addresses: info.get_addresses().iter().copied().collect(),
    })
}

async fn split_response(
    info: &ServiceInfo,
    local: &DeviceAddress,
    peers: &PeerTable,
) -> Option<(ServiceResponse, ServiceResponse)> {
    let Some(address) = info.get_property_val_str(TXT_PEER).map(DeviceAddress::new) else {
        tracing::debug!("Skipping service {} - not published by a peer", info.get_fullname());
        return None;
    };
    if &address == local {
        return None;
    }

    let device = peers
        .lock()
        .await
        .iter()
        .find(|p| p.device.address == address)
        .map(|p| p.device.clone())
        .unwrap_or_else(|| Device::new(info.get_hostname().trim_end_matches(".local."), address));

    let attributes: HashMap<String, String> = info
        .get_properties()
        .iter()
        .filter(|prop| prop.key() != TXT_PEER)
        .map(|prop| (prop.key().to_string(), prop.val_str().to_string()))
        .collect();

    let identity = ServiceResponse::Identity {
        instance_name: instance_of(info),
        registration_type: info.get_type().to_string(),
        device: device.clone(),
    };
    let txt = ServiceResponse::TxtRecord {
        full_domain_name: info.get_fullname().to_string(),
        attributes,
        device,
    };

    Some((identity, txt))
}
