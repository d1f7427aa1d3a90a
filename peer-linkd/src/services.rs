use std::collections::HashMap;
use std::time::Duration;
use chrono::Utc;
use tokio::time::Instant;
use shared::types::{DeviceAddress, DiscoveredService, ServiceRecord};
use crate::error::{P2pError, P2pResult};
use crate::radio::{RadioResult, ServiceResponse};

#[derive(Debug, Clone, PartialEq)]
enum Advertisement {
    None,
    Registering(ServiceRecord),
    Active(ServiceRecord),
}

/// Device and lowercased "instance.type" name both halves of a service share
type PartialKey = (DeviceAddress, String);

fn service_name(full_domain_name: &str) -> String {
    full_domain_name.trim_end_matches('.').to_ascii_lowercase()
}

/// Half-assembled service from one device
#[derive(Debug)]
struct Partial {
    identity: Option<(String, String)>,
    attributes: Option<HashMap<String, String>>,
    received_at: Instant,
}

/// Local service advertisement plus remote service discovery.
///
/// Identity and TXT responses naming the same service on the same device are
/// merged into a [`DiscoveredService`] once both have arrived. Unmatched halves are kept for
/// `partial_timeout` at most, and never more than `max_partials` of them.
#[derive(Debug)]
pub struct ServiceManager {
    advertisement: Advertisement,
    service_request_added: bool,
    partials: HashMap<PartialKey, Partial>,
    discovered: Vec<DiscoveredService>,
    partial_timeout: Duration,
    max_partials: usize,
}

impl ServiceManager {
    pub fn new(partial_timeout: Duration, max_partials: usize) -> Self {
        Self {
            advertisement: Advertisement::None,
            service_request_added: false,
            partials: HashMap::new(),
            discovered: Vec::new(),
            partial_timeout,
            max_partials: max_partials.max(1),
        }
    }

    /// Reserve the advertisement slot before calling the radio
    pub fn begin_advertise(&mut self, record: ServiceRecord) -> P2pResult<()> {
        if self.advertisement != Advertisement::None {
            return Err(P2pError::AlreadyAdvertising);
        }
        self.advertisement = Advertisement::Registering(record);
        Ok(())
    }

    pub fn on_advertise_result(&mut self, result: RadioResult<()>) -> P2pResult<()> {
        let record = match std::mem::replace(&mut self.advertisement, Advertisement::None) {
            Advertisement::Registering(record) => record,
            other => {
                self.advertisement = other;
                return Ok(());
            }
        };

        match result {
            Ok(()) => {
                tracing::info!("Advertising {} as {}", record.service_type, record.instance_name);
                self.advertisement = Advertisement::Active(record);
                Ok(())
            }
            Err(failure) => {
                tracing::error!("Failed to advertise {}: {}", record.instance_name, failure);
                Err(P2pError::AdvertiseFailed(failure.reason))
            }
        }
    }

    /// Take the active record out for withdrawal
    pub fn begin_withdraw(&mut self) -> P2pResult<ServiceRecord> {
        match std::mem::replace(&mut self.advertisement, Advertisement::None) {
            Advertisement::Active(record) => Ok(record),
            other => {
                self.advertisement = other;
                Err(P2pError::NotAdvertising)
            }
        }
    }

    /// A failed withdrawal leaves the record advertised
    pub fn on_withdraw_result(&mut self, record: ServiceRecord, result: RadioResult<()>) -> P2pResult<()> {
        match result {
            Ok(()) => {
                tracing::info!("Withdrew {}", record.instance_name);
                Ok(())
            }
            Err(failure) => {
                tracing::error!("Failed to withdraw {}: {}", record.instance_name, failure);
                if self.advertisement == Advertisement::None {
                    self.advertisement = Advertisement::Active(record);
                }
                Err(P2pError::AdvertiseFailed(failure.reason))
            }
        }
    }

    #[cfg(test)]
    fn advertised(&self) -> Option<&ServiceRecord> {
        match &self.advertisement {
            Advertisement::Active(record) => Some(record),
            _ => None,
        }
    }

    /// The service request is registered once per radio session
    pub fn needs_service_request(&self) -> bool {
        !self.service_request_added
    }

    pub fn on_service_request_result(&mut self, result: RadioResult<()>) -> P2pResult<()> {
        match result {
            Ok(()) => {
                tracing::debug!("Added service request");
                self.service_request_added = true;
                Ok(())
            }
            Err(failure) => {
                tracing::error!("Could not add service request: {}", failure);
                Err(P2pError::DiscoveryFailed(failure.reason))
            }
        }
    }

    pub fn on_discover_services_result(&mut self, result: RadioResult<()>) -> P2pResult<()> {
        match result {
            Ok(()) => {
                tracing::debug!("Discovering services");
                Ok(())
            }
            Err(failure) => {
                tracing::error!("Could not start service discovery: {}", failure);
                Err(P2pError::DiscoveryFailed(failure.reason))
            }
        }
    }

    /// Merge one response half. Returns the service once both halves are in.
    pub fn on_response(&mut self, response: ServiceResponse, now: Instant) -> Option<DiscoveredService> {
        let address = response.device().address.clone();
        let name = match &response {
            ServiceResponse::Identity { instance_name, registration_type, .. } => {
                service_name(&format!("{}.{}", instance_name, registration_type))
            }
            ServiceResponse::TxtRecord { full_domain_name, .. } => service_name(full_domain_name),
        };
        let key = (address.clone(), name);

        if !self.partials.contains_key(&key) && self.partials.len() >= self.max_partials {
            self.evict_oldest();
        }

        let partial = self.partials.entry(key.clone()).or_insert_with(|| Partial {
            identity: None,
            attributes: None,
            received_at: now,
        });

        match response {
            ServiceResponse::Identity { instance_name, registration_type, .. } => {
                tracing::debug!("Service response {} ({}) from {}", instance_name, registration_type, address);
                partial.identity = Some((instance_name, registration_type));
            }
            ServiceResponse::TxtRecord { full_domain_name, attributes, .. } => {
                tracing::debug!("TXT record for {} from {}", full_domain_name, address);
                partial.attributes = Some(attributes);
            }
        }

        if partial.identity.is_none() || partial.attributes.is_none() {
            return None;
        }

        let partial = self.partials.remove(&key)?;
        let (instance_name, registration_type) = partial.identity?;
        let service = DiscoveredService {
            instance_name,
            registration_type,
            attributes: partial.attributes?,
            device_address: address,
            discovered_at: Utc::now(),
        };

        self.discovered.retain(|s| {
            s.device_address != service.device_address || s.instance_name != service.instance_name
        });
        self.discovered.push(service.clone());
        Some(service)
    }

    /// Drop halves older than the correlation window. Returns how many expired.
    pub fn expire(&mut self, now: Instant) -> usize {
        let timeout = self.partial_timeout;
        let before = self.partials.len();
        self.partials
            .retain(|_, p| now.saturating_duration_since(p.received_at) < timeout);
        before - self.partials.len()
    }

    pub fn clear_partials(&mut self) {
        self.partials.clear();
    }

    /// Halves still waiting for their counterpart
    pub fn pending_partials(&self) -> usize {
        self.partials.len()
    }

    pub fn discovered(&self) -> &[DiscoveredService] {
        &self.discovered
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .partials
            .iter()
            .min_by_key(|(_, p)| p.received_at)
            .map(|(key, _)| key.clone());

        if let Some(key) = oldest {
            tracing::debug!("Partial service buffer full, dropping {} from {}", key.1, key.0);
            self.partials.remove(&key);
        }
    }
}
