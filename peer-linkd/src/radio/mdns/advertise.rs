use std::collections::HashMap;
use mdns_sd::{ServiceDaemon, ServiceInfo};
use anyhow::{Context, Result};
use shared::protocol::{PRESENCE_SERVICE_TYPE, TXT_ADDRESS, TXT_DEVICE_TYPE, TXT_INTENT, TXT_LISTEN_PORT, TXT_PEER};
use shared::types::{Device, ServiceRecord};

/// "_presence._tcp" -> "_presence._tcp.local."
pub fn qualified_type(service_type: &str) -> String {
    let trimmed = service_type.trim_end_matches('.');
    if trimmed.ends_with(".local") {
        format!("{}.", trimmed)
    } else {
        format!("{}.local.", trimmed)
    }
}

/// Publish this node so other nodes see it as a peer
pub fn register_presence(
    daemon: &ServiceDaemon,
    local: &Device,
    group_owner_intent: u8,
    hostname: &str,
) -> Result<ServiceInfo> {
    let mut txt_records = HashMap::from([
        (TXT_ADDRESS.to_string(), local.address.to_string()),
        (TXT_INTENT.to_string(), group_owner_intent.to_string()),
    ]);
    if let Some(primary_type) = &local.primary_type {
        txt_records.insert(TXT_DEVICE_TYPE.to_string(), primary_type.clone());
    }

    let service_info = ServiceInfo::new(
        PRESENCE_SERVICE_TYPE,
        &local.name,
        &format!("{}.local.", hostname),
        "",
        0,
        txt_records,
    )
    .context("Failed to create presence ServiceInfo")?
    .enable_addr_auto();

    daemon
        .register(service_info.clone())
        .context("Failed to register presence record")?;

    tracing::info!("Registered presence of {} as {}", local.address, local.name);

    Ok(service_info)
}

/// Publish a local service record, stamped with this device's address
pub fn register_service(
    daemon: &ServiceDaemon,
    record: &ServiceRecord,
    local: &Device,
    hostname: &str,
) -> Result<ServiceInfo> {
    let port = record
        .attributes
        .get(TXT_LISTEN_PORT)
        .and_then(|p| p.parse::<u16>().ok())
        .unwrap_or(0);

    let mut txt_records = record.attributes.clone();
    txt_records.insert(TXT_PEER.to_string(), local.address.to_string());

    let service_type = qualified_type(&record.service_type);
    let service_info = ServiceInfo::new(
        &service_type,
        &record.instance_name,
        &format!("{}.local.", hostname),
        "",
        port,
        txt_records,
    )
    .context("Failed to create ServiceInfo")?
    .enable_addr_auto();

    daemon
        .register(service_info.clone())
        .context("Failed to register mDNS service")?;

    tracing::info!(
        "Registered {} as {} on port {}",
        service_type,
        record.instance_name,
        port
    );

    Ok(service_info)
}

pub fn unregister(daemon: &ServiceDaemon, service_info: &ServiceInfo) -> Result<()> {
    daemon
        .unregister(service_info.get_fullname())
        .context("Failed to unregister mDNS service")?;

    tracing::info!("Unregistered {}", service_info.get_fullname());
    Ok(())
}
