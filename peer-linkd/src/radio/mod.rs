//! The peer-to-peer radio service the core drives.
//!
//! Every call completes asynchronously with a success or a failure reason.
//! Notifications and service-discovery responses arrive on the receivers
//! handed out by [`RadioService::initialize`].

pub mod loopback;
pub mod mdns;

use std::collections::HashMap;
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use shared::types::{ConnectionInfo, Device, PairingMode, PeerSnapshot, ServiceRecord};
use crate::notification::Notification;

/// Reason reported by the radio for a rejected call
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}")]
pub struct RadioFailure {
    pub reason: String,
}

impl RadioFailure {
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }
}

pub type RadioResult<T> = std::result::Result<T, RadioFailure>;

/// One half of a remote service description. A device answers a service
/// request with both halves, in no guaranteed order.
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceResponse {
    Identity {
        instance_name: String,
        registration_type: String,
        device: Device,
    },
    TxtRecord {
        full_domain_name: String,
        attributes: HashMap<String, String>,
        device: Device,
    },
}

impl ServiceResponse {
    pub fn device(&self) -> &Device {
        match self {
            ServiceResponse::Identity { device, .. } => device,
            ServiceResponse::TxtRecord { device, .. } => device,
        }
    }
}

/// Receivers handed out once per radio
pub struct RadioChannel {
    pub notifications: mpsc::Receiver<Notification>,
    pub service_responses: mpsc::Receiver<ServiceResponse>,
}

#[async_trait]
pub trait RadioService: Send + Sync {
    /// Must succeed before any other call
    async fn initialize(&self) -> anyhow::Result<RadioChannel>;

    async fn discover_peers(&self) -> RadioResult<()>;

    async fn request_peers(&self) -> PeerSnapshot;

    async fn create_group(&self) -> RadioResult<()>;

    async fn add_local_service(&self, record: &ServiceRecord) -> RadioResult<()>;

    async fn remove_local_service(&self, record: &ServiceRecord) -> RadioResult<()>;

    async fn add_service_request(&self) -> RadioResult<()>;

    async fn discover_services(&self) -> RadioResult<()>;

    async fn connect(
        &self,
        device: &Device,
        pairing: PairingMode,
        group_owner_intent: u8,
    ) -> RadioResult<()>;

    async fn request_connection_info(&self) -> ConnectionInfo;

    /// Release the radio. Called once on shutdown.
    async fn shutdown(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
