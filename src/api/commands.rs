use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use std::sync::Arc;

use crate::{
    api::{
        auth::{DeviceAuth, OperatorAuth},
        operator_device,
    },
    commands::CommandDispatcher,
    db::queries,
    error::{ApiError, ApiResult},
    protocol::{CommandAck, CommandEnvelope, DeviceCommand, IssueCommandResponse},
    AppState,
};

fn dispatcher(state: &AppState) -> CommandDispatcher {
    CommandDispatcher::new(
        state.pool.clone(),
        state.event_tx.clone(),
        state.command_locks.clone(),
    )
}

/// POST /api/v1/devices/:id/command
pub async fn issue_command(
    State(state): State<Arc<AppState>>,
    operator: OperatorAuth,
    Path(id): Path<String>,
    payload: Result<Json<CommandEnvelope>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let device = operator_device(&state, operator.organization_id(), &id).await?;
    let Json(envelope) = payload?;
    let command = envelope
        .into_command()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    if let DeviceCommand::UpdatePlaylist { playlist_id } = &command {
        queries::get_playlist_in_org(&state.pool, &device.organization_id, playlist_id)
            .await?
            .ok_or(ApiError::NotFound("playlist"))?;
    }

    let command_id = dispatcher(&state).issue(&device, command).await?;
    Ok((StatusCode::CREATED, Json(IssueCommandResponse { command_id })))
}

/// GET /api/v1/devices/:id/commands
pub async fn poll_commands(
    State(state): State<Arc<AppState>>,
    auth: DeviceAuth,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let device = auth.for_path(&id)?;
    let commands = dispatcher(&state).poll(&device.id).await?;
    Ok(Json(commands))
}

/// POST /api/v1/devices/:id/commands/:cmd_id/ack
pub async fn ack_command(
    State(state): State<Arc<AppState>>,
    auth: DeviceAuth,
    Path((id, command_id)): Path<(String, String)>,
    payload: Result<Json<CommandAck>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let device = auth.for_path(&id)?;
    let Json(ack) = payload?;
    dispatcher(&state)
        .acknowledge(&device, &command_id, ack)
        .await?;
    Ok(Json(serde_json::json!({})))
}
