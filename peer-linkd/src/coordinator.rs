//! Single-writer event loop owning all peer-to-peer state.
//!
//! Radio notifications, service responses, radio call completions and
//! commands from [`CoordinatorHandle`] are all processed on one task, so no
//! state is shared and notifications are handled in arrival order. Radio
//! calls run on spawned tasks and report back through the completion channel.
//! Peer snapshots older than the last one applied, and connection info asked
//! for by a connection that has since ended, are dropped on arrival.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use anyhow::Result;
use shared::types::{
    ConnectionInfo, ConnectionState, ConnectionStatus, Device, DeviceAddress, DiscoveredService,
    GroupRole, PeerSnapshot, ServiceRecord,
};
use crate::config::{DiscoveryConfig, NegotiationConfig};
use crate::error::{P2pError, P2pResult};
use crate::negotiator::{ConnectionNegotiator, RoleDirective, Transition};
use crate::notification::{self, NotificationSink};
use crate::radio::{RadioChannel, RadioResult, RadioService};
use crate::radio_state::RadioStateTracker;
use crate::registry::PeerRegistry;
use crate::services::ServiceManager;

type Reply<T> = oneshot::Sender<P2pResult<T>>;

/// Events published to the presentation layer
#[derive(Debug, Clone, PartialEq)]
pub enum CoreEvent {
    RadioStateChanged(bool),
    PeersChanged(Vec<Device>),
    LocalDeviceChanged(Device),
    ConnectionChanged {
        state: ConnectionState,
        role: Option<GroupRole>,
    },
    RoleAssigned(RoleDirective),
    ServiceDiscovered(DiscoveredService),
    ConnectionFailed(P2pError),
}

/// Commands sent to the coordinator task
enum Command {
    StartDiscovery(Reply<()>),
    CreateGroup(Reply<()>),
    Advertise(ServiceRecord, Reply<()>),
    Withdraw(Reply<()>),
    DiscoverServices(Reply<()>),
    Connect(usize, Reply<()>),
    Peers(oneshot::Sender<Vec<Device>>),
    Connection(oneshot::Sender<ConnectionStatus>),
    Services(oneshot::Sender<Vec<DiscoveredService>>),
    LocalDevice(oneshot::Sender<Option<Device>>),
}

/// Radio call results, delivered back onto the coordinator task
enum Completion {
    Discovery(Reply<()>, RadioResult<()>),
    Peers {
        request: u64,
        snapshot: PeerSnapshot,
    },
    ConnectionInfo {
        epoch: u64,
        info: ConnectionInfo,
        peer: Option<DeviceAddress>,
    },
    Group(Reply<()>, RadioResult<()>),
    Advertise(Reply<()>, RadioResult<()>),
    Withdraw(ServiceRecord, Reply<()>, RadioResult<()>),
    ServiceRequest(Reply<()>, RadioResult<()>),
    ServiceDiscovery(Reply<()>, RadioResult<()>),
    Connect {
        attempt: u64,
        reply: Reply<()>,
        result: RadioResult<()>,
    },
}

/// Handle to interact with the coordinator task
#[derive(Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::Sender<Command>,
    events: broadcast::Sender<CoreEvent>,
    peers_hash: watch::Receiver<String>,
}

impl CoordinatorHandle {
    /// Initialize the radio and spawn the coordinator task
    pub async fn spawn(
        radio: Arc<dyn RadioService>,
        negotiation: NegotiationConfig,
        discovery: DiscoveryConfig,
        cancel: CancellationToken,
    ) -> Result<(Self, JoinHandle<()>)> {
        let channel = radio.initialize().await?;

        let (tx, rx) = mpsc::channel::<Command>(256);
        let (completions_tx, completions_rx) = mpsc::channel::<Completion>(256);
        let (events, _) = broadcast::channel(256);

        let registry = PeerRegistry::new();
        let (hash_tx, hash_rx) = watch::channel(registry.fingerprint());

        let coordinator = Coordinator {
            radio,
            services: ServiceManager::new(discovery.partial_timeout(), discovery.max_partials),
            negotiation,
            discovery,
            tracker: RadioStateTracker::new(),
            registry,
            negotiator: ConnectionNegotiator::new(),
            local_device: None,
            peer_requests: 0,
            peers_applied: 0,
            completions: completions_tx,
            events: events.clone(),
            peers_hash: hash_tx,
        };

        let task = tokio::spawn(coordinator.run(rx, completions_rx, channel, cancel));

        Ok((
            Self {
                tx,
                events,
                peers_hash: hash_rx,
            },
            task,
        ))
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> P2pResult<T> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(make(reply)).await.map_err(|_| P2pError::Unavailable)?;
        rx.await.map_err(|_| P2pError::Unavailable)
    }

    pub async fn start_discovery(&self) -> P2pResult<()> {
        self.request(Command::StartDiscovery).await?
    }

    pub async fn create_group(&self) -> P2pResult<()> {
        self.request(Command::CreateGroup).await?
    }

    pub async fn advertise_service(&self, record: ServiceRecord) -> P2pResult<()> {
        self.request(|reply| Command::Advertise(record, reply)).await?
    }

    pub async fn withdraw_service(&self) -> P2pResult<()> {
        self.request(Command::Withdraw).await?
    }

    pub async fn discover_services(&self) -> P2pResult<()> {
        self.request(Command::DiscoverServices).await?
    }

    /// Connect to the peer at `index` in the current peer list
    pub async fn connect(&self, index: usize) -> P2pResult<()> {
        self.request(|reply| Command::Connect(index, reply)).await?
    }

    pub async fn peers(&self) -> P2pResult<Vec<Device>> {
        self.request(Command::Peers).await
    }

    pub async fn connection(&self) -> P2pResult<ConnectionStatus> {
        self.request(Command::Connection).await
    }

    pub async fn services(&self) -> P2pResult<Vec<DiscoveredService>> {
        self.request(Command::Services).await
    }

    pub async fn local_device(&self) -> P2pResult<Option<Device>> {
        self.request(Command::LocalDevice).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.events.subscribe()
    }

    /// Fingerprint of the current peer list
    pub fn peers_hash(&self) -> String {
        self.peers_hash.borrow().clone()
    }
}

struct Coordinator {
    radio: Arc<dyn RadioService>,
    negotiation: NegotiationConfig,
    discovery: DiscoveryConfig,
    tracker: RadioStateTracker,
    registry: PeerRegistry,
    services: ServiceManager,
    negotiator: ConnectionNegotiator,
    local_device: Option<Device>,
    /// Last peer query issued, and the newest one whose snapshot was applied
    peer_requests: u64,
    peers_applied: u64,
    completions: mpsc::Sender<Completion>,
    events: broadcast::Sender<CoreEvent>,
    peers_hash: watch::Sender<String>,
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl Coordinator {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut completions: mpsc::Receiver<Completion>,
        mut channel: RadioChannel,
        cancel: CancellationToken,
    ) {
        let mut maintenance_interval = tokio::time::interval(self.discovery.maintenance_interval());

        loop {
            let deadline = self.negotiator.deadline();

            // Notifications first, so a queued radio state change is seen
            // before commands that depend on it
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    tracing::info!("Coordinator shutting down");
                    break;
                }
                Some(notification) = channel.notifications.recv() => {
                    notification::dispatch(&mut self, notification);
                }
                Some(completion) = completions.recv() => {
                    self.handle_completion(completion);
                }
                Some(response) = channel.service_responses.recv() => {
                    if let Some(service) = self.services.on_response(response, Instant::now()) {
                        tracing::info!(
                            "Discovered service {} ({}) on {}",
                            service.instance_name,
                            service.registration_type,
                            service.device_address
                        );
                        self.publish(CoreEvent::ServiceDiscovered(service));
                    }
                }
                Some(command) = commands.recv() => {
                    self.handle_command(command);
                }
                _ = wait_until(deadline) => {
                    if let Some(transition) = self.negotiator.on_deadline(Instant::now()) {
                        self.publish_transition(transition);
                        self.publish(CoreEvent::ConnectionFailed(P2pError::NegotiationTimeout));
                    }
                }
                _ = maintenance_interval.tick() => {
                    let expired = self.services.expire(Instant::now());
                    if expired > 0 {
                        tracing::debug!(
                            "Expired {} partial service responses, {} pending",
                            expired,
                            self.services.pending_partials()
                        );
                    }
                }
            }
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::StartDiscovery(reply) => {
                if let Err(e) = self.tracker.ensure_enabled() {
                    let _ = reply.send(Err(e));
                    return;
                }
                if let Some(transition) = self.negotiator.on_discovery_requested() {
                    self.publish_transition(transition);
                }
                self.spawn_call(|radio| async move {
                    Completion::Discovery(reply, radio.discover_peers().await)
                });
            }
            Command::CreateGroup(reply) => {
                if let Err(e) = self.tracker.ensure_enabled() {
                    let _ = reply.send(Err(e));
                    return;
                }
                self.spawn_call(|radio| async move {
                    Completion::Group(reply, radio.create_group().await)
                });
            }
            Command::Advertise(record, reply) => {
                let reserved = self
                    .tracker
                    .ensure_enabled()
                    .and_then(|_| self.services.begin_advertise(record.clone()));
                if let Err(e) = reserved {
                    let _ = reply.send(Err(e));
                    return;
                }
                self.spawn_call(|radio| async move {
                    let result = radio.add_local_service(&record).await;
                    Completion::Advertise(reply, result)
                });
            }
            Command::Withdraw(reply) => {
                let record = match self.services.begin_withdraw() {
                    Ok(record) => record,
                    Err(e) => {
                        let _ = reply.send(Err(e));
                        return;
                    }
                };
                self.spawn_call(|radio| async move {
                    let result = radio.remove_local_service(&record).await;
                    Completion::Withdraw(record, reply, result)
                });
            }
            Command::DiscoverServices(reply) => {
                if let Err(e) = self.tracker.ensure_enabled() {
                    let _ = reply.send(Err(e));
                    return;
                }
                if self.services.needs_service_request() {
                    self.spawn_call(|radio| async move {
                        Completion::ServiceRequest(reply, radio.add_service_request().await)
                    });
                } else {
                    self.spawn_call(|radio| async move {
                        Completion::ServiceDiscovery(reply, radio.discover_services().await)
                    });
                }
            }
            Command::Connect(index, reply) => {
                let target = self
                    .tracker
                    .ensure_enabled()
                    .and_then(|_| self.registry.find_by_index(index).cloned());
                let target = match target {
                    Ok(target) => target,
                    Err(e) => {
                        let _ = reply.send(Err(e));
                        return;
                    }
                };

                let pairing = self.negotiation.pairing;
                let intent = self.negotiation.group_owner_intent;
                let deadline = Instant::now() + self.negotiation.timeout();
                let started = self.negotiator.begin_connect(target.clone(), deadline);
                if let Some(transition) = started.transition {
                    self.publish_transition(transition);
                }

                let attempt = started.attempt;
                self.spawn_call(move |radio| async move {
                    let result = radio.connect(&target, pairing, intent).await;
                    Completion::Connect { attempt, reply, result }
                });
            }
            Command::Peers(reply) => {
                let _ = reply.send(self.registry.list_devices().to_vec());
            }
            Command::Connection(reply) => {
                let _ = reply.send(self.negotiator.status());
            }
            Command::Services(reply) => {
                let _ = reply.send(self.services.discovered().to_vec());
            }
            Command::LocalDevice(reply) => {
                let _ = reply.send(self.local_device.clone());
            }
        }
    }

    fn handle_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Discovery(reply, result) => {
                let result = match result {
                    Ok(()) => {
                        tracing::debug!("P2P discovery started successfully");
                        Ok(())
                    }
                    Err(failure) => {
                        tracing::error!("Could not start P2P discovery: {}", failure);
                        if let Some(transition) = self.negotiator.on_discovery_failed() {
                            self.publish_transition(transition);
                        }
                        Err(P2pError::DiscoveryFailed(failure.reason))
                    }
                };
                let _ = reply.send(result);
            }
            Completion::Peers { request, snapshot } => {
                if request <= self.peers_applied {
                    tracing::debug!("Dropping outdated peer snapshot {}", request);
                    return;
                }
                self.peers_applied = request;
                tracing::debug!("Peers available: {}", snapshot.len());
                if let Some(change) = self.registry.refresh(snapshot) {
                    self.publish_peers(change.devices);
                }
            }
            Completion::ConnectionInfo { epoch, info, peer } => {
                if epoch != self.negotiator.epoch() {
                    tracing::debug!("Dropping connection info from an ended connection");
                    return;
                }
                self.apply_connection_info(info, peer);
            }
            Completion::Group(reply, result) => {
                let result = match result {
                    Ok(()) => {
                        tracing::info!("Group has been created");
                        Ok(())
                    }
                    Err(failure) => {
                        tracing::error!("Could not create P2P group: {}", failure);
                        Err(P2pError::GroupFailed(failure.reason))
                    }
                };
                let _ = reply.send(result);
            }
            Completion::Advertise(reply, result) => {
                let _ = reply.send(self.services.on_advertise_result(result));
            }
            Completion::Withdraw(record, reply, result) => {
                let _ = reply.send(self.services.on_withdraw_result(record, result));
            }
            Completion::ServiceRequest(reply, result) => {
                match self.services.on_service_request_result(result) {
                    Ok(()) => {
                        self.spawn_call(|radio| async move {
                            Completion::ServiceDiscovery(reply, radio.discover_services().await)
                        });
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }
            Completion::ServiceDiscovery(reply, result) => {
                let _ = reply.send(self.services.on_discover_services_result(result));
            }
            Completion::Connect { attempt, reply, result } => {
                let outcome = self.negotiator.on_connect_result(attempt, result);
                if let Some(transition) = outcome.transition {
                    self.publish_transition(transition);
                }
                if let Err(e) = &outcome.result {
                    self.publish(CoreEvent::ConnectionFailed(e.clone()));
                }
                let _ = reply.send(outcome.result);
            }
        }
    }

    fn apply_connection_info(&mut self, info: ConnectionInfo, peer: Option<DeviceAddress>) {
        if let Some(address) = info.group_owner_address {
            tracing::debug!("Group owner address: {}", address);
        }
        let peer = peer.map(|address| {
            self.registry
                .find_by_address(&address)
                .cloned()
                .unwrap_or_else(|| Device::new(address.to_string(), address))
        });
        if let Some(transition) = self.negotiator.on_connected(info, peer) {
            self.publish_transition(transition);
        }
    }

    /// Run a radio call off the coordinator task and feed its result back
    fn spawn_call<F, Fut>(&self, call: F)
    where
        F: FnOnce(Arc<dyn RadioService>) -> Fut,
        Fut: Future<Output = Completion> + Send + 'static,
    {
        let completions = self.completions.clone();
        let pending = call(self.radio.clone());
        tokio::spawn(async move {
            let completion = pending.await;
            if completions.send(completion).await.is_err() {
                tracing::debug!("Coordinator gone, dropping radio completion");
            }
        });
    }

    fn publish(&self, event: CoreEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn publish_peers(&self, devices: Vec<Device>) {
        let _ = self.peers_hash.send(self.registry.fingerprint());
        self.publish(CoreEvent::PeersChanged(devices));
    }

    fn publish_transition(&self, transition: Transition) {
        tracing::info!("Connection state {} -> {}", transition.from, transition.to);
        self.publish(CoreEvent::ConnectionChanged {
            state: transition.to,
            role: transition.to.role(),
        });

        match transition.directive {
            Some(RoleDirective::Listen) => {
                tracing::info!("Is group owner, listening for clients");
                self.publish(CoreEvent::RoleAssigned(RoleDirective::Listen));
            }
            Some(RoleDirective::ConnectTo(owner)) => {
                tracing::info!("Other device is group owner ({:?})", owner);
                self.publish(CoreEvent::RoleAssigned(RoleDirective::ConnectTo(owner)));
            }
            None => {}
        }
    }
}

impl NotificationSink for Coordinator {
    fn on_radio_state_changed(&mut self, enabled: bool) {
        if !self.tracker.on_radio_state_changed(enabled) {
            return;
        }

        tracing::info!("P2P radio {}", if enabled { "enabled" } else { "disabled" });
        self.publish(CoreEvent::RadioStateChanged(enabled));

        if !enabled {
            // Snapshots still in flight predate the radio going down
            self.peers_applied = self.peer_requests;
            self.services.clear_partials();
            if let Some(change) = self.registry.clear() {
                self.publish_peers(change.devices);
            }
        }
    }

    fn on_peer_list_changed(&mut self) {
        tracing::debug!("P2P peers changed");
        self.peer_requests += 1;
        let request = self.peer_requests;
        self.spawn_call(move |radio| async move {
            let snapshot = radio.request_peers().await;
            Completion::Peers { request, snapshot }
        });
    }

    fn on_connection_state_changed(
        &mut self,
        connected: bool,
        info: Option<ConnectionInfo>,
        peer: Option<DeviceAddress>,
    ) {
        if !connected {
            tracing::debug!("Disconnected");
            if let Some(transition) = self.negotiator.on_disconnected() {
                self.publish_transition(transition);
            }
            return;
        }

        match info {
            Some(info) => self.apply_connection_info(info, peer),
            None if self.negotiator.accepts_peer(peer.as_ref()) => {
                tracing::debug!("Connected, requesting connection info");
                let epoch = self.negotiator.epoch();
                self.spawn_call(move |radio| async move {
                    let info = radio.request_connection_info().await;
                    Completion::ConnectionInfo { epoch, info, peer }
                });
            }
            None => {
                tracing::debug!("Ignoring connection notification for a superseded peer");
            }
        }
    }

    fn on_local_device_changed(&mut self, device: Device) {
        tracing::debug!("This device changed: {}", device.label());
        self.local_device = Some(device.clone());
        self.publish(CoreEvent::LocalDeviceChanged(device));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;
    use crate::notification::Notification;
    use crate::radio::loopback::{LoopbackController, LoopbackRadio, RadioCall};
    use crate::radio::ServiceResponse;

    struct Harness {
        handle: CoordinatorHandle,
        radio: LoopbackController,
        events: broadcast::Receiver<CoreEvent>,
        cancel: CancellationToken,
    }

    impl Harness {
        async fn start() -> Self {
            let (radio, controller) = LoopbackRadio::new();
            let cancel = CancellationToken::new();
            let (handle, _task) = CoordinatorHandle::spawn(
                Arc::new(radio),
                NegotiationConfig::default(),
                DiscoveryConfig::default(),
                cancel.clone(),
            )
            .await
            .unwrap();
            let events = handle.subscribe();

            let mut harness = Self {
                handle,
                radio: controller,
                events,
                cancel,
            };
            harness.radio.notify(Notification::RadioStateChanged { enabled: true }).await;
            harness.expect(|e| matches!(e, CoreEvent::RadioStateChanged(true))).await;
            harness
        }

        /// Next event matching `pred`, skipping others
        async fn expect(&mut self, pred: impl Fn(&CoreEvent) -> bool) -> CoreEvent {
            loop {
                let event = tokio::time::timeout(Duration::from_secs(120), self.events.recv())
                    .await
                    .expect("Timed out waiting for event")
                    .expect("Event channel closed");
                if pred(&event) {
                    return event;
                }
            }
        }

        async fn expect_state(&mut self, state: ConnectionState) {
            self.expect(|e| matches!(e, CoreEvent::ConnectionChanged { state: s, .. } if *s == state))
                .await;
        }

        async fn with_peers(&mut self, ids: &[u8]) {
            self.radio.publish_peers(PeerSnapshot::new(ids.iter().map(|&n| peer(n)))).await;
            self.expect(|e| matches!(e, CoreEvent::PeersChanged(_))).await;
        }
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            self.cancel.cancel();
        }
    }

    /// Let every runnable task finish. Needs paused time.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    fn disconnected() -> Notification {
        Notification::ConnectionStateChanged {
            connected: false,
            info: None,
            peer: None,
        }
    }

    fn connected_without_info() -> Notification {
        Notification::ConnectionStateChanged {
            connected: true,
            info: None,
            peer: None,
        }
    }

    fn peer(n: u8) -> Device {
        Device::new(format!("peer-{}", n), format!("02:00:00:00:00:{:02x}", n).as_str())
    }

    fn connected(peer: Option<&Device>, owner: bool) -> Notification {
        Notification::ConnectionStateChanged {
            connected: true,
            info: Some(ConnectionInfo {
                group_formed: true,
                is_group_owner: owner,
                group_owner_address: Some(IpAddr::V4(Ipv4Addr::new(192, 168, 49, 1))),
            }),
            peer: peer.map(|p| p.address.clone()),
        }
    }

    #[tokio::test]
    async fn test_commands_fail_fast_while_radio_disabled() {
        let (radio, controller) = LoopbackRadio::new();
        let cancel = CancellationToken::new();
        let (handle, _task) = CoordinatorHandle::spawn(
            Arc::new(radio),
            NegotiationConfig::default(),
            DiscoveryConfig::default(),
            cancel.clone(),
        )
        .await
        .unwrap();

        assert_eq!(handle.start_discovery().await, Err(P2pError::RadioDisabled));
        assert_eq!(handle.discover_services().await, Err(P2pError::RadioDisabled));
        assert_eq!(handle.connect(0).await, Err(P2pError::RadioDisabled));
        assert!(controller.calls().await.is_empty(), "No radio call should be issued");
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_peer_list_changes_are_diffed() {
        let mut h = Harness::start().await;

        h.handle.start_discovery().await.unwrap();
        h.with_peers(&[1, 2]).await;
        let first_hash = h.handle.peers_hash();

        // Same list again, then a different one: only the second is reported
        h.radio.publish_peers(PeerSnapshot::new(vec![peer(1), peer(2)])).await;
        h.radio.publish_peers(PeerSnapshot::new(vec![peer(2)])).await;
        let event = h.expect(|e| matches!(e, CoreEvent::PeersChanged(_))).await;
        assert_eq!(event, CoreEvent::PeersChanged(vec![peer(2)]));

        assert_eq!(h.handle.peers().await.unwrap(), vec![peer(2)]);
        assert_ne!(h.handle.peers_hash(), first_hash);
    }

    #[tokio::test]
    async fn test_connect_index_out_of_range() {
        let mut h = Harness::start().await;
        h.with_peers(&[1, 2]).await;

        assert_eq!(
            h.handle.connect(2).await,
            Err(P2pError::IndexOutOfRange { index: 2, len: 2 })
        );
        assert!(!h.radio.calls().await.contains(&RadioCall::Connect));
    }

    #[tokio::test]
    async fn test_connect_resolves_client_role() {
        let mut h = Harness::start().await;
        h.with_peers(&[1]).await;

        h.handle.connect(0).await.unwrap();
        h.expect_state(ConnectionState::Negotiating).await;
        let (device, _, intent) = h.radio.connects().await.remove(0);
        assert_eq!((device, intent), (peer(1), 0));

        h.radio.notify(connected(Some(&peer(1)), false)).await;
        h.expect_state(ConnectionState::Connected(GroupRole::Client)).await;
        let directive = h.expect(|e| matches!(e, CoreEvent::RoleAssigned(_))).await;
        assert_eq!(
            directive,
            CoreEvent::RoleAssigned(RoleDirective::ConnectTo(Some(IpAddr::V4(Ipv4Addr::new(192, 168, 49, 1)))))
        );

        let status = h.handle.connection().await.unwrap();
        assert_eq!(status.state, ConnectionState::Connected(GroupRole::Client));
        assert_eq!(status.peer, Some(peer(1)));
    }

    #[tokio::test]
    async fn test_connection_info_requested_when_not_inline() {
        let mut h = Harness::start().await;
        h.with_peers(&[1]).await;
        h.handle.connect(0).await.unwrap();

        h.radio
            .set_connection_info(ConnectionInfo {
                group_formed: true,
                is_group_owner: true,
                group_owner_address: None,
            })
            .await;
        h.radio.notify(connected_without_info()).await;

        h.expect_state(ConnectionState::Connected(GroupRole::GroupOwner)).await;
        h.expect(|e| *e == CoreEvent::RoleAssigned(RoleDirective::Listen)).await;
        assert!(h.radio.calls().await.contains(&RadioCall::RequestConnectionInfo));
    }

    #[tokio::test]
    async fn test_superseded_attempt_is_ignored() {
        let mut h = Harness::start().await;
        h.with_peers(&[1, 2]).await;

        h.handle.connect(0).await.unwrap();
        h.handle.connect(1).await.unwrap();

        h.radio.notify(connected(Some(&peer(1)), true)).await;
        h.radio.notify(connected(Some(&peer(2)), false)).await;

        let event = h
            .expect(|e| matches!(e, CoreEvent::ConnectionChanged { state: ConnectionState::Connected(_), .. }))
            .await;
        assert_eq!(
            event,
            CoreEvent::ConnectionChanged {
                state: ConnectionState::Connected(GroupRole::Client),
                role: Some(GroupRole::Client),
            }
        );
        assert_eq!(h.handle.connection().await.unwrap().peer, Some(peer(2)));
    }

    #[tokio::test]
    async fn test_rejected_connect_returns_to_idle() {
        let mut h = Harness::start().await;
        h.with_peers(&[1]).await;
        h.radio.fail(RadioCall::Connect, "busy").await;

        assert_eq!(h.handle.connect(0).await, Err(P2pError::ConnectFailed("busy".to_string())));
        h.expect_state(ConnectionState::Idle).await;

        // Usable again
        h.radio.succeed(RadioCall::Connect).await;
        assert!(h.handle.connect(0).await.is_ok());
    }

    #[tokio::test]
    async fn test_disconnect_resets_from_connected() {
        let mut h = Harness::start().await;
        h.with_peers(&[1]).await;
        h.handle.connect(0).await.unwrap();
        h.radio.notify(connected(None, true)).await;
        h.expect_state(ConnectionState::Connected(GroupRole::GroupOwner)).await;

        h.radio.notify(disconnected()).await;
        h.expect_state(ConnectionState::Disconnected).await;
        assert!(h.handle.connection().await.unwrap().peer.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_negotiation_times_out() {
        let mut h = Harness::start().await;
        h.with_peers(&[1]).await;
        h.handle.connect(0).await.unwrap();
        h.expect_state(ConnectionState::Negotiating).await;

        h.expect_state(ConnectionState::Disconnected).await;
        h.expect(|e| *e == CoreEvent::ConnectionFailed(P2pError::NegotiationTimeout)).await;
    }

    #[tokio::test]
    async fn test_discovery_failure_is_reported() {
        let mut h = Harness::start().await;
        h.radio.fail(RadioCall::DiscoverPeers, "busy").await;

        assert_eq!(
            h.handle.start_discovery().await,
            Err(P2pError::DiscoveryFailed("busy".to_string()))
        );
        h.expect_state(ConnectionState::Discovering).await;
        h.expect_state(ConnectionState::Idle).await;
    }

    #[tokio::test]
    async fn test_double_advertise_is_rejected() {
        let h = Harness::start().await;
        let record = ServiceRecord {
            instance_name: "_test".to_string(),
            service_type: "_presence._tcp".to_string(),
            attributes: HashMap::from([("listenport".to_string(), "9000".to_string())]),
        };

        h.handle.advertise_service(record.clone()).await.unwrap();
        assert_eq!(
            h.handle.advertise_service(record.clone()).await,
            Err(P2pError::AlreadyAdvertising)
        );
        assert_eq!(h.radio.local_services().await, vec![record.clone()]);

        h.handle.withdraw_service().await.unwrap();
        assert!(h.radio.local_services().await.is_empty());
        assert!(h.handle.advertise_service(record).await.is_ok());
    }

    #[tokio::test]
    async fn test_service_discovery_correlates_responses() {
        let mut h = Harness::start().await;

        h.handle.discover_services().await.unwrap();
        h.handle.discover_services().await.unwrap();
        let calls = h.radio.calls().await;
        assert_eq!(calls.iter().filter(|c| **c == RadioCall::AddServiceRequest).count(), 1);
        assert_eq!(calls.iter().filter(|c| **c == RadioCall::DiscoverServices).count(), 2);

        h.radio
            .respond(ServiceResponse::TxtRecord {
                full_domain_name: "_test._presence._tcp.local.".to_string(),
                attributes: HashMap::from([("buddyname".to_string(), "John Doe".to_string())]),
                device: peer(4),
            })
            .await;
        h.radio
            .respond(ServiceResponse::Identity {
                instance_name: "_test".to_string(),
                registration_type: "_presence._tcp.local.".to_string(),
                device: peer(4),
            })
            .await;

        let event = h.expect(|e| matches!(e, CoreEvent::ServiceDiscovered(_))).await;
        let CoreEvent::ServiceDiscovered(service) = event else {
            unreachable!()
        };
        assert_eq!(service.device_address, peer(4).address);
        assert_eq!(service.attributes.get("buddyname").map(String::as_str), Some("John Doe"));
        assert_eq!(h.handle.services().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_service_request_failure_is_retryable() {
        let h = Harness::start().await;
        h.radio.fail(RadioCall::AddServiceRequest, "no channel").await;

        assert_eq!(
            h.handle.discover_services().await,
            Err(P2pError::DiscoveryFailed("no channel".to_string()))
        );

        h.radio.succeed(RadioCall::AddServiceRequest).await;
        assert!(h.handle.discover_services().await.is_ok());
    }

    #[tokio::test]
    async fn test_radio_disable_clears_peers() {
        let mut h = Harness::start().await;
        h.with_peers(&[1, 2]).await;

        h.radio.notify(Notification::RadioStateChanged { enabled: false }).await;
        h.expect(|e| matches!(e, CoreEvent::RadioStateChanged(false))).await;
        let event = h.expect(|e| matches!(e, CoreEvent::PeersChanged(_))).await;
        assert_eq!(event, CoreEvent::PeersChanged(vec![]));
        assert_eq!(h.handle.create_group().await, Err(P2pError::RadioDisabled));
    }

    #[tokio::test]
    async fn test_local_device_and_unknown_notifications() {
        let mut h = Harness::start().await;

        h.radio.notify(Notification::Unknown("discovery-changed".to_string())).await;
        h.radio.notify(Notification::LocalDeviceChanged(peer(9))).await;

        h.expect(|e| matches!(e, CoreEvent::LocalDeviceChanged(_))).await;
        assert_eq!(h.handle.local_device().await.unwrap(), Some(peer(9)));
    }

    #[tokio::test]
    async fn test_queued_radio_enable_precedes_commands() {
        let (radio, controller) = LoopbackRadio::new();
        controller.notify(Notification::RadioStateChanged { enabled: true }).await;

        let cancel = CancellationToken::new();
        let (handle, _task) = CoordinatorHandle::spawn(
            Arc::new(radio),
            NegotiationConfig::default(),
            DiscoveryConfig::default(),
            cancel.clone(),
        )
        .await
        .unwrap();

        assert_eq!(handle.start_discovery().await, Ok(()));
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_older_peer_snapshot_does_not_overwrite_newer() {
        let mut h = Harness::start().await;

        let mut held = h.radio.hold_next(RadioCall::RequestPeers).await;
        h.radio.publish_peers(PeerSnapshot::new(vec![peer(1)])).await;
        held.arrived().await;

        h.with_peers(&[2]).await;
        assert_eq!(h.handle.peers().await.unwrap(), vec![peer(2)]);

        // The first query answers last
        held.release();
        settle().await;
        assert_eq!(h.handle.peers().await.unwrap(), vec![peer(2)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_info_after_disconnect_is_dropped() {
        let mut h = Harness::start().await;
        h.with_peers(&[1]).await;
        h.radio
            .set_connection_info(ConnectionInfo {
                group_formed: true,
                is_group_owner: true,
                group_owner_address: None,
            })
            .await;
        h.handle.connect(0).await.unwrap();

        let mut held = h.radio.hold_next(RadioCall::RequestConnectionInfo).await;
        h.radio.notify(connected_without_info()).await;
        held.arrived().await;

        h.radio.notify(disconnected()).await;
        h.expect_state(ConnectionState::Disconnected).await;

        held.release();
        settle().await;
        let status = h.handle.connection().await.unwrap();
        assert_eq!(status.state, ConnectionState::Disconnected);
        assert!(status.peer.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_info_for_superseded_attempt_is_dropped() {
        let mut h = Harness::start().await;
        h.with_peers(&[1, 2]).await;
        h.radio
            .set_connection_info(ConnectionInfo {
                group_formed: true,
                is_group_owner: true,
                group_owner_address: None,
            })
            .await;
        h.handle.connect(0).await.unwrap();

        let mut held = h.radio.hold_next(RadioCall::RequestConnectionInfo).await;
        h.radio.notify(connected_without_info()).await;
        held.arrived().await;

        h.handle.connect(1).await.unwrap();
        held.release();
        settle().await;

        let status = h.handle.connection().await.unwrap();
        assert_eq!(status.state, ConnectionState::Negotiating);
        assert_eq!(status.peer, Some(peer(2)));
    }

    #[tokio::test]
    async fn test_connected_while_connect_requested() {
        let mut h = Harness::start().await;
        h.with_peers(&[1]).await;

        let mut held = h.radio.hold_next(RadioCall::Connect).await;
        let handle = h.handle.clone();
        let pending = tokio::spawn(async move { handle.connect(0).await });
        h.expect_state(ConnectionState::ConnectRequested).await;
        held.arrived().await;

        // The radio reports the group before answering the connect call
        h.radio.notify(connected(Some(&peer(1)), true)).await;
        h.expect_state(ConnectionState::Connected(GroupRole::GroupOwner)).await;
        h.expect(|e| *e == CoreEvent::RoleAssigned(RoleDirective::Listen)).await;

        held.release();
        assert_eq!(pending.await.unwrap(), Ok(()));
        let status = h.handle.connection().await.unwrap();
        assert_eq!(status.state, ConnectionState::Connected(GroupRole::GroupOwner));
        assert_eq!(status.peer, Some(peer(1)));
    }
}
