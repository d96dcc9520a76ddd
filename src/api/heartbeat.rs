use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use std::sync::Arc;

use crate::{
    api::{
        auth::{DeviceAuth, OperatorAuth},
        operator_device,
    },
    error::ApiResult,
    heartbeat::HeartbeatService,
    protocol::HeartbeatReport,
    AppState,
};

#[derive(Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<i64>,
}

/// POST /api/v1/devices/:id/heartbeat
pub async fn ingest(
    State(state): State<Arc<AppState>>,
    auth: DeviceAuth,
    Path(id): Path<String>,
    payload: Result<Json<HeartbeatReport>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let device = auth.for_path(&id)?;
    let Json(report) = payload?;
    HeartbeatService::new(state.pool.clone(), state.event_tx.clone())
        .ingest(&device, report)
        .await?;
    Ok(Json(serde_json::json!({})))
}

/// GET /api/v1/devices/:id/heartbeats?limit=N
pub async fn history(
    State(state): State<Arc<AppState>>,
    operator: OperatorAuth,
    Path(id): Path<String>,
    Query(q): Query<HistoryQuery>,
) -> ApiResult<impl IntoResponse> {
    let device = operator_device(&state, operator.organization_id(), &id).await?;
    let heartbeats = HeartbeatService::new(state.pool.clone(), state.event_tx.clone())
        .history(&device.id, q.limit)
        .await?;
    Ok(Json(serde_json::json!({ "heartbeats": heartbeats })))
}
