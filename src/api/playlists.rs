use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use std::sync::Arc;

use crate::{
    api::{
        auth::{DeviceAuth, OperatorAuth},
        operator_device,
    },
    error::ApiResult,
    playlists::{AssignPlaylist, CreatePlaylist, ItemSpec, PlaylistService},
    AppState,
};

fn service(state: &AppState) -> PlaylistService {
    PlaylistService::new(state.pool.clone(), state.event_tx.clone())
}

/// GET /api/v1/devices/:id/playlists
///
/// The playlist this device should play right now, or 204 when nothing is
/// scheduled (the device keeps its last known good playlist).
pub async fn device_playlist(
    State(state): State<Arc<AppState>>,
    auth: DeviceAuth,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let device = auth.for_path(&id)?;
    match service(&state).resolve_for_device(&device, Utc::now()).await? {
        Some(playlist) => Ok(Json(playlist).into_response()),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

/// POST /api/v1/playlists
pub async fn create_playlist(
    State(state): State<Arc<AppState>>,
    operator: OperatorAuth,
    payload: Result<Json<CreatePlaylist>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(req) = payload?;
    let playlist = service(&state)
        .create(operator.organization_id(), req)
        .await?;
    Ok((StatusCode::CREATED, Json(playlist)))
}

/// GET /api/v1/playlists/:id
pub async fn get_playlist(
    State(state): State<Arc<AppState>>,
    operator: OperatorAuth,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let playlist = service(&state).get(operator.organization_id(), &id).await?;
    Ok(Json(playlist))
}

/// PUT /api/v1/playlists/:id/items  (full ordered list, replaces the old one)
pub async fn replace_items(
    State(state): State<Arc<AppState>>,
    operator: OperatorAuth,
    Path(id): Path<String>,
    payload: Result<Json<Vec<ItemSpec>>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(items) = payload?;
    let playlist = service(&state)
        .replace_items(operator.organization_id(), &id, items)
        .await?;
    Ok(Json(playlist))
}

/// GET /api/v1/devices/:id/assignments
pub async fn list_assignments(
    State(state): State<Arc<AppState>>,
    operator: OperatorAuth,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let device = operator_device(&state, operator.organization_id(), &id).await?;
    let assignments = service(&state).assignments(&device).await?;
    Ok(Json(serde_json::json!({ "assignments": assignments })))
}

/// POST /api/v1/devices/:id/assignments
pub async fn assign_playlist(
    State(state): State<Arc<AppState>>,
    operator: OperatorAuth,
    Path(id): Path<String>,
    payload: Result<Json<AssignPlaylist>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let device = operator_device(&state, operator.organization_id(), &id).await?;
    let Json(req) = payload?;
    let assignment = service(&state).assign(&device, req).await?;
    Ok((StatusCode::CREATED, Json(assignment)))
}

/// DELETE /api/v1/devices/:id/assignments/:playlist_id
pub async fn unassign_playlist(
    State(state): State<Arc<AppState>>,
    operator: OperatorAuth,
    Path((id, playlist_id)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let device = operator_device(&state, operator.organization_id(), &id).await?;
    service(&state).unassign(&device, &playlist_id).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}
