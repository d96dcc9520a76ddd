use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use std::sync::Arc;

use crate::{
    api::auth::OperatorAuth,
    error::ApiResult,
    protocol::AuthRequest,
    registry::{DeviceStatus, DeviceUpdate, RegisterDevice, RegistryService},
    AppState,
};

#[derive(Deserialize)]
pub struct ListDevicesQuery {
    pub status: Option<DeviceStatus>,
    pub search: Option<String>,
}

fn registry(state: &AppState) -> RegistryService {
    RegistryService::new(
        state.pool.clone(),
        state.event_tx.clone(),
        state.config.offline_threshold(),
    )
}

/// POST /api/v1/devices/auth
pub async fn authenticate(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<AuthRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(req) = payload?;
    let resp = registry(&state)
        .authenticate(&state.tokens, &req.hardware_id, &req.device_secret)
        .await?;
    Ok(Json(resp))
}

/// GET /api/v1/devices
pub async fn list_devices(
    State(state): State<Arc<AppState>>,
    operator: OperatorAuth,
    query: Result<Query<ListDevicesQuery>, axum::extract::rejection::QueryRejection>,
) -> ApiResult<impl IntoResponse> {
    let Query(q) = query?;
    let devices = registry(&state)
        .list(operator.organization_id(), q.status, q.search.as_deref())
        .await?;
    Ok(Json(serde_json::json!({ "devices": devices })))
}

/// POST /api/v1/devices
pub async fn register_device(
    State(state): State<Arc<AppState>>,
    operator: OperatorAuth,
    payload: Result<Json<RegisterDevice>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(req) = payload?;
    let (device, secret) = registry(&state)
        .register(operator.organization_id(), req)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "device": device, "device_secret": secret })),
    ))
}

/// GET /api/v1/devices/:id
pub async fn get_device(
    State(state): State<Arc<AppState>>,
    operator: OperatorAuth,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let device = registry(&state).get(operator.organization_id(), &id).await?;
    Ok(Json(device))
}

/// PATCH /api/v1/devices/:id
pub async fn update_device(
    State(state): State<Arc<AppState>>,
    operator: OperatorAuth,
    Path(id): Path<String>,
    payload: Result<Json<DeviceUpdate>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(patch) = payload?;
    let device = registry(&state)
        .update_config(operator.organization_id(), &id, patch)
        .await?;
    Ok(Json(device))
}
