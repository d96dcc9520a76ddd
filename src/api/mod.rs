pub mod assets;
pub mod auth;
pub mod commands;
pub mod devices;
pub mod heartbeat;
pub mod playlists;
pub mod ws_handler;

use crate::db::{models::Device, queries};
use crate::error::{ApiError, ApiResult};
use crate::AppState;

/// Loads a device the operator's organization owns. Devices of other
/// organizations look exactly like missing ones.
pub(crate) async fn operator_device(state: &AppState, organization_id: &str, id: &str) -> ApiResult<Device> {
    queries::get_device_in_org(&state.pool, organization_id, id)
        .await?
        .ok_or(ApiError::NotFound("device"))
}

/// GET /health
pub async fn health() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}
