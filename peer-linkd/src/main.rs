use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use anyhow::{Context, Result};
use peer_linkd::api;
use peer_linkd::config::{Config, RadioBackend};
use peer_linkd::coordinator::{CoordinatorHandle, CoreEvent};
use peer_linkd::notification::Notification;
use peer_linkd::radio::loopback::LoopbackRadio;
use peer_linkd::radio::mdns::{derive_address, MdnsRadio};
use peer_linkd::radio::RadioService;
use shared::types::{Device, DeviceAddress};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("peer_linkd=info"))
        )
        .init();

    tracing::info!("Starting peer-linkd");

    // Load config
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/peer-link/linkd.toml".to_string());

    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;

    tracing::info!("Loaded config from {}", config_path);

    // Identify this device
    let name = match &config.device.name {
        Some(name) => name.clone(),
        None => hostname::get()
            .context("Failed to get system hostname")?
            .to_string_lossy()
            .to_string(),
    };
    let address = config
        .device
        .address
        .as_deref()
        .map(DeviceAddress::new)
        .unwrap_or_else(|| derive_address(&name));
    let mut local = Device::new(name, address);
    local.primary_type = config.device.primary_type.clone();

    tracing::info!("This device is {}", local.label());

    // Create the radio service
    let radio: Arc<dyn RadioService> = match config.radio.backend {
        RadioBackend::Mdns => Arc::new(
            MdnsRadio::new(&config.radio, local.clone(), config.negotiation.group_owner_intent)
                .context("Failed to create mDNS radio")?,
        ),
        RadioBackend::Loopback => {
            tracing::warn!("Using the loopback radio, no peers will be found");
            let (radio, controller) = LoopbackRadio::new();
            controller.notify(Notification::RadioStateChanged { enabled: true }).await;
            controller.notify(Notification::LocalDeviceChanged(local.clone())).await;
            Arc::new(radio)
        }
    };

    // Create cancellation token for graceful shutdown
    let cancel = CancellationToken::new();

    // Spawn coordinator task
    let (coordinator, coordinator_handle) = CoordinatorHandle::spawn(
        radio.clone(),
        config.negotiation.clone(),
        config.discovery.clone(),
        cancel.clone(),
    )
    .await
    .context("Failed to initialize radio")?;

    // Log core events
    let mut events = coordinator.subscribe();
    let events_cancel = cancel.clone();
    let events_handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(CoreEvent::PeersChanged(devices)) => {
                        let labels: Vec<String> = devices.iter().map(Device::label).collect();
                        tracing::info!("Peers: [{}]", labels.join(", "));
                    }
                    Ok(CoreEvent::RoleAssigned(directive)) => {
                        tracing::info!("Role assigned: {:?}", directive);
                    }
                    Ok(CoreEvent::ConnectionFailed(e)) => {
                        tracing::warn!("Connection failed: {}", e);
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("Event log lagged by {} events", n);
                    }
                    Err(_) => break,
                },
                _ = events_cancel.cancelled() => break,
            }
        }
    });

    // Advertise the configured service
    if let Some(service) = &config.service {
        let record = service.to_record(&local.name);
        let startup = coordinator.clone();
        tokio::spawn(async move {
            if let Err(e) = startup.advertise_service(record).await {
                tracing::error!("Failed to advertise service: {}", e);
            }
        });
    }

    // Build API router
    let app_state = api::routes::AppState {
        coordinator: coordinator.clone(),
    };
    let app = api::routes::router(app_state);

    // Bind HTTP server
    let listener = tokio::net::TcpListener::bind(&config.api.listen)
        .await
        .with_context(|| format!("Failed to bind to {}", config.api.listen))?;

    tracing::info!("API listening on {}", config.api.listen);

    // Run server with graceful shutdown
    let server_cancel = cancel.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await
        {
            tracing::error!("Server error: {}", e);
        }
    });

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutdown signal received");

    // Withdraw the advertisement while the coordinator is still running
    if config.service.is_some() {
        if let Err(e) = coordinator.withdraw_service().await {
            tracing::error!("Failed to withdraw service: {}", e);
        }
    }

    // Trigger cancellation
    cancel.cancel();

    // Wait for all tasks to complete
    let _ = tokio::join!(coordinator_handle, events_handle, server_handle);

    // Release the radio
    if let Err(e) = radio.shutdown().await {
        tracing::error!("Failed to shutdown radio: {}", e);
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
