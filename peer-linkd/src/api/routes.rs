use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use crate::coordinator::CoordinatorHandle;
use crate::error::P2pError;
use shared::types::{ConnectionStatus, Device, DiscoveredService, ServiceRecord};

#[derive(Clone)]
pub struct AppState {
    pub coordinator: CoordinatorHandle,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ErrorResponse>)>;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/device", get(get_device))
        .route("/v1/peers", get(get_peers))
        .route("/v1/peers/hash", get(get_peers_hash))
        .route("/v1/connection", get(get_connection))
        .route("/v1/services", get(get_services))
        .route("/v1/discover", post(start_discovery))
        .route("/v1/group", post(create_group))
        .route("/v1/advertise", post(advertise).delete(withdraw))
        .route("/v1/services/discover", post(discover_services))
        .route("/v1/connect/:index", post(connect))
        .with_state(state)
}

fn status_for(error: &P2pError) -> StatusCode {
    match error {
        P2pError::RadioDisabled | P2pError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        P2pError::IndexOutOfRange { .. } => StatusCode::NOT_FOUND,
        P2pError::AlreadyAdvertising | P2pError::NotAdvertising => StatusCode::CONFLICT,
        P2pError::NegotiationTimeout => StatusCode::GATEWAY_TIMEOUT,
        P2pError::ConnectFailed(_)
        | P2pError::DiscoveryFailed(_)
        | P2pError::AdvertiseFailed(_)
        | P2pError::GroupFailed(_) => StatusCode::BAD_GATEWAY,
    }
}

fn reply<T>(result: Result<T, P2pError>) -> ApiResult<T> {
    result.map(Json).map_err(|e| {
        tracing::warn!("Command failed: {}", e);
        (status_for(&e), Json(ErrorResponse { error: e.to_string() }))
    })
}

async fn get_device(State(state): State<AppState>) -> Result<Json<Device>, StatusCode> {
    state
        .coordinator
        .local_device()
        .await
        .map_err(|e| {
            tracing::error!("Failed to query local device: {}", e);
            StatusCode::SERVICE_UNAVAILABLE
        })?
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn get_peers(State(state): State<AppState>) -> ApiResult<Vec<Device>> {
    reply(state.coordinator.peers().await)
}

async fn get_peers_hash(State(state): State<AppState>) -> String {
    state.coordinator.peers_hash()
}

async fn get_connection(State(state): State<AppState>) -> ApiResult<ConnectionStatus> {
    reply(state.coordinator.connection().await)
}

async fn get_services(State(state): State<AppState>) -> ApiResult<Vec<DiscoveredService>> {
    reply(state.coordinator.services().await)
}

async fn start_discovery(State(state): State<AppState>) -> ApiResult<()> {
    reply(state.coordinator.start_discovery().await)
}

async fn create_group(State(state): State<AppState>) -> ApiResult<()> {
    reply(state.coordinator.create_group().await)
}

async fn advertise(
    State(state): State<AppState>,
    Json(record): Json<ServiceRecord>,
) -> ApiResult<()> {
    reply(state.coordinator.advertise_service(record).await)
}

async fn withdraw(State(state): State<AppState>) -> ApiResult<()> {
    reply(state.coordinator.withdraw_service().await)
}

async fn discover_services(State(state): State<AppState>) -> ApiResult<()> {
    reply(state.coordinator.discover_services().await)
}

async fn connect(State(state): State<AppState>, Path(index): Path<usize>) -> ApiResult<()> {
    reply(state.coordinator.connect(index).await)
}
