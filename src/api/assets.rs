use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use std::sync::Arc;

use crate::{
    api::auth::OperatorAuth,
    error::ApiResult,
    manifest::{ManifestService, RegisterAsset},
    AppState,
};

/// POST /api/v1/assets
///
/// 201 for a new asset, 200 when the SHA-256 already exists in the organization.
pub async fn register_asset(
    State(state): State<Arc<AppState>>,
    operator: OperatorAuth,
    payload: Result<Json<RegisterAsset>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(req) = payload?;
    let (asset, created) = ManifestService::new(state.pool.clone(), state.event_tx.clone())
        .register(operator.organization_id(), req)
        .await?;
    let status = if created { StatusCode::CREATED } else { StatusCode::OK };
    Ok((status, Json(asset)))
}

/// GET /api/v1/assets/:id
pub async fn get_asset(
    State(state): State<Arc<AppState>>,
    operator: OperatorAuth,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let asset = ManifestService::new(state.pool.clone(), state.event_tx.clone())
        .get(operator.organization_id(), &id)
        .await?;
    Ok(Json(asset))
}
