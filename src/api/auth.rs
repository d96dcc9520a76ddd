//! Bearer-token extractors for the two principals: devices and operators.

use axum::{
    extract::FromRequestParts,
    http::{header, request::Parts},
};
use std::sync::Arc;

use crate::db::{models::Device, queries};
use crate::error::{ApiError, ApiResult};
use crate::registry::{
    credentials::{Claims, TokenType},
    stored_status, DeviceStatus,
};
use crate::AppState;

fn bearer_token(parts: &Parts) -> Option<&str> {
    parts
        .headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

/// An authenticated device. The token's device must still exist and must
/// not be decommissioned.
pub struct DeviceAuth(pub Device);

impl DeviceAuth {
    /// The device, if it is the one named in the path.
    pub fn for_path(self, device_id: &str) -> ApiResult<Device> {
        if self.0.id == device_id {
            Ok(self.0)
        } else {
            tracing::warn!(token_device = %self.0.id, path_device = device_id, "Token used for another device");
            Err(ApiError::Unauthenticated)
        }
    }
}

#[axum::async_trait]
impl FromRequestParts<Arc<AppState>> for DeviceAuth {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &Arc<AppState>) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts).ok_or(ApiError::Unauthenticated)?;
        let claims = state
            .tokens
            .verify(token)
            .map_err(|_| ApiError::Unauthenticated)?;
        if claims.typ != TokenType::Device {
            return Err(ApiError::Unauthenticated);
        }

        let device = queries::get_device(&state.pool, &claims.sub)
            .await?
            .filter(|d| d.organization_id == claims.org)
            .ok_or(ApiError::Unauthenticated)?;

        if stored_status(&device) == DeviceStatus::Decommissioned {
            return Err(ApiError::DeviceDecommissioned);
        }
        Ok(DeviceAuth(device))
    }
}

/// An operator of one organization, authenticated by a token from the user
/// service.
pub struct OperatorAuth(pub Claims);

impl OperatorAuth {
    pub fn organization_id(&self) -> &str {
        &self.0.org
    }

    pub fn from_token(state: &AppState, token: &str) -> ApiResult<Self> {
        let claims = state
            .tokens
            .verify(token)
            .map_err(|_| ApiError::Unauthenticated)?;
        if claims.typ != TokenType::Operator {
            return Err(ApiError::Forbidden("operator token required".into()));
        }
        Ok(OperatorAuth(claims))
    }
}

#[axum::async_trait]
impl FromRequestParts<Arc<AppState>> for OperatorAuth {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &Arc<AppState>) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts).ok_or(ApiError::Unauthenticated)?;
        OperatorAuth::from_token(state, token)
    }
}
