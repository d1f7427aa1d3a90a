//! In-process radio driven by a [`LoopbackController`].
//!
//! Calls succeed unless a failure was scripted for them. Notifications and
//! service responses are whatever the controller injects. A call can be held
//! mid-flight with [`LoopbackController::hold_next`] to reorder its reply.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, Mutex};
use shared::types::{ConnectionInfo, Device, PairingMode, PeerSnapshot, ServiceRecord};
use crate::notification::Notification;
use super::{RadioChannel, RadioFailure, RadioResult, RadioService, ServiceResponse};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RadioCall {
    DiscoverPeers,
    RequestPeers,
    CreateGroup,
    AddLocalService,
    RemoveLocalService,
    AddServiceRequest,
    DiscoverServices,
    Connect,
    RequestConnectionInfo,
}

/// Radio side of a held call
struct Hold {
    arrived: oneshot::Sender<()>,
    release: oneshot::Receiver<()>,
}

impl Hold {
    async fn wait(self) {
        let _ = self.arrived.send(());
        let _ = self.release.await;
    }
}

/// Controller side of a held call
pub struct HeldCall {
    arrived: Option<oneshot::Receiver<()>>,
    release: oneshot::Sender<()>,
}

impl HeldCall {
    /// Wait until the radio has entered the call
    pub async fn arrived(&mut self) {
        if let Some(arrived) = self.arrived.take() {
            let _ = arrived.await;
        }
    }

    /// Let the call return
    pub fn release(self) {
        let _ = self.release.send(());
    }
}

#[derive(Default)]
struct LoopbackState {
    peers: PeerSnapshot,
    connection_info: ConnectionInfo,
    failures: HashMap<RadioCall, String>,
    calls: Vec<RadioCall>,
    local_services: Vec<ServiceRecord>,
    connects: Vec<(Device, PairingMode, u8)>,
    holds: HashMap<RadioCall, VecDeque<Hold>>,
}

impl LoopbackState {
    fn take_hold(&mut self, call: RadioCall) -> Option<Hold> {
        self.holds.get_mut(&call).and_then(VecDeque::pop_front)
    }

    fn record(&mut self, call: RadioCall) -> RadioResult<()> {
        self.calls.push(call);
        match self.failures.get(&call) {
            Some(reason) => Err(RadioFailure::new(reason.clone())),
            None => Ok(()),
        }
    }
}

pub struct LoopbackRadio {
    state: Arc<Mutex<LoopbackState>>,
    channel: Mutex<Option<RadioChannel>>,
}

/// Test-side handle of a [`LoopbackRadio`]
#[derive(Clone)]
pub struct LoopbackController {
    state: Arc<Mutex<LoopbackState>>,
    notifications: mpsc::Sender<Notification>,
    responses: mpsc::Sender<ServiceResponse>,
}

impl LoopbackRadio {
    pub fn new() -> (Self, LoopbackController) {
        let (notifications, notifications_rx) = mpsc::channel(256);
        let (responses, responses_rx) = mpsc::channel(256);
        let state = Arc::new(Mutex::new(LoopbackState::default()));

        let radio = Self {
            state: state.clone(),
            channel: Mutex::new(Some(RadioChannel {
                notifications: notifications_rx,
                service_responses: responses_rx,
            })),
        };
        let controller = LoopbackController {
            state,
            notifications,
            responses,
        };

        (radio, controller)
    }
}

impl LoopbackController {
    pub async fn notify(&self, notification: Notification) {
        if self.notifications.send(notification).await.is_err() {
            tracing::warn!("Loopback radio has no listener for notifications");
        }
    }

    pub async fn respond(&self, response: ServiceResponse) {
        if self.responses.send(response).await.is_err() {
            tracing::warn!("Loopback radio has no listener for service responses");
        }
    }

    /// Set the peers returned by the next peer query and announce the change
    pub async fn publish_peers(&self, peers: PeerSnapshot) {
        self.state.lock().await.peers = peers;
        self.notify(Notification::PeerListChanged).await;
    }

    pub async fn set_connection_info(&self, info: ConnectionInfo) {
        self.state.lock().await.connection_info = info;
    }

    /// Make every subsequent `call` fail with `reason`
    pub async fn fail(&self, call: RadioCall, reason: &str) {
        self.state.lock().await.failures.insert(call, reason.to_string());
    }

    pub async fn succeed(&self, call: RadioCall) {
        self.state.lock().await.failures.remove(&call);
    }

    /// Hold the next `call` after it has taken its result, until released
    pub async fn hold_next(&self, call: RadioCall) -> HeldCall {
        let (arrived_tx, arrived_rx) = oneshot::channel();
        let (release_tx, release_rx) = oneshot::channel();
        self.state
            .lock()
            .await
            .holds
            .entry(call)
            .or_default()
            .push_back(Hold {
                arrived: arrived_tx,
                release: release_rx,
            });

        HeldCall {
            arrived: Some(arrived_rx),
            release: release_tx,
        }
    }

    pub async fn calls(&self) -> Vec<RadioCall> {
        self.state.lock().await.calls.clone()
    }

    pub async fn local_services(&self) -> Vec<ServiceRecord> {
        self.state.lock().await.local_services.clone()
    }

    pub async fn connects(&self) -> Vec<(Device, PairingMode, u8)> {
        self.state.lock().await.connects.clone()
    }
}

#[async_trait]
impl RadioService for LoopbackRadio {
    async fn initialize(&self) -> Result<RadioChannel> {
        match self.channel.lock().await.take() {
            Some(channel) => Ok(channel),
            None => bail!("Loopback radio already initialized"),
        }
    }

    async fn discover_peers(&self) -> RadioResult<()> {
        self.state.lock().await.record(RadioCall::DiscoverPeers)
    }

    async fn request_peers(&self) -> PeerSnapshot {
        let (snapshot, hold) = {
            let mut state = self.state.lock().await;
            state.calls.push(RadioCall::RequestPeers);
            (state.peers.clone(), state.take_hold(RadioCall::RequestPeers))
        };
        if let Some(hold) = hold {
            hold.wait().await;
        }
        snapshot
    }

    async fn create_group(&self) -> RadioResult<()> {
        self.state.lock().await.record(RadioCall::CreateGroup)
    }

    async fn add_local_service(&self, record: &ServiceRecord) -> RadioResult<()> {
        let mut state = self.state.lock().await;
        state.record(RadioCall::AddLocalService)?;
        state.local_services.push(record.clone());
        Ok(())
    }

    async fn remove_local_service(&self, record: &ServiceRecord) -> RadioResult<()> {
        let mut state = self.state.lock().await;
        state.record(RadioCall::RemoveLocalService)?;
        state.local_services.retain(|r| r != record);
        Ok(())
    }

    async fn add_service_request(&self) -> RadioResult<()> {
        self.state.lock().await.record(RadioCall::AddServiceRequest)
    }

    async fn discover_services(&self) -> RadioResult<()> {
        self.state.lock().await.record(RadioCall::DiscoverServices)
    }

    async fn connect(
        &self,
        device: &Device,
        pairing: PairingMode,
        group_owner_intent: u8,
    ) -> RadioResult<()> {
        let (result, hold) = {
            let mut state = self.state.lock().await;
            state.connects.push((device.clone(), pairing, group_owner_intent));
            (state.record(RadioCall::Connect), state.take_hold(RadioCall::Connect))
        };
        if let Some(hold) = hold {
            hold.wait().await;
        }
        result
    }

    async fn request_connection_info(&self) -> ConnectionInfo {
        let (info, hold) = {
            let mut state = self.state.lock().await;
            state.calls.push(RadioCall::RequestConnectionInfo);
            (state.connection_info, state.take_hold(RadioCall::RequestConnectionInfo))
        };
        if let Some(hold) = hold {
            hold.wait().await;
        }
        info
    }
}
