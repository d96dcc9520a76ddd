pub mod credentials;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use sqlx::{types::Json, SqlitePool};
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::db::{is_unique_violation, models::Device, queries};
use crate::error::{ApiError, ApiResult};
use crate::heartbeat;
use crate::protocol::{AuthResponse, UnknownVariant};
use crate::ws::WsEvent;
use credentials::TokenIssuer;

/// Stored device lifecycle state. `Offline` is never written; readers see it
/// through [`heartbeat::effective_status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Pending,
    Active,
    Offline,
    Maintenance,
    Decommissioned,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Pending => "pending",
            DeviceStatus::Active => "active",
            DeviceStatus::Offline => "offline",
            DeviceStatus::Maintenance => "maintenance",
            DeviceStatus::Decommissioned => "decommissioned",
        }
    }

    /// Only these can be set by an operator; the rest follow from heartbeats.
    pub fn is_operator_settable(&self) -> bool {
        matches!(
            self,
            DeviceStatus::Pending | DeviceStatus::Maintenance | DeviceStatus::Decommissioned
        )
    }
}

impl FromStr for DeviceStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DeviceStatus::Pending),
            "active" => Ok(DeviceStatus::Active),
            "offline" => Ok(DeviceStatus::Offline),
            "maintenance" => Ok(DeviceStatus::Maintenance),
            "decommissioned" => Ok(DeviceStatus::Decommissioned),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// Stored status of a device row. Rows are only ever written by this crate,
/// so an unknown value means a foreign writer; treat it as not yet active.
pub fn stored_status(device: &Device) -> DeviceStatus {
    device.status.parse().unwrap_or(DeviceStatus::Pending)
}

/// Timezone from `display_config.timezone`, if set and valid.
pub fn device_timezone(device: &Device) -> Option<Tz> {
    device
        .display_config
        .get("timezone")
        .and_then(|v| v.as_str())
        .and_then(|name| name.parse().ok())
}

/// What operators see: the stored row with status replaced by its projection.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceView {
    pub id: String,
    pub organization_id: String,
    pub name: String,
    pub hardware_type: String,
    pub hardware_id: String,
    pub status: DeviceStatus,
    pub is_online: bool,
    pub display_config: serde_json::Value,
    pub network_info: serde_json::Value,
    pub location_metadata: serde_json::Value,
    pub tags: Vec<String>,
    pub firmware_version: Option<String>,
    pub client_version: Option<String>,
    pub current_playlist_id: Option<String>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DeviceView {
    pub fn project(device: Device, now: DateTime<Utc>, threshold: Duration) -> Self {
        let stored = stored_status(&device);
        let is_online = heartbeat::is_online(device.last_heartbeat, now, threshold);
        DeviceView {
            status: heartbeat::effective_status(stored, device.last_heartbeat, now, threshold),
            is_online,
            id: device.id,
            organization_id: device.organization_id,
            name: device.name,
            hardware_type: device.hardware_type,
            hardware_id: device.hardware_id,
            display_config: device.display_config.0,
            network_info: device.network_info.0,
            location_metadata: device.location_metadata.0,
            tags: device.tags.0,
            firmware_version: device.firmware_version,
            client_version: device.client_version,
            current_playlist_id: device.current_playlist_id,
            last_heartbeat: device.last_heartbeat,
            created_at: device.created_at,
            updated_at: device.updated_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RegisterDevice {
    pub name: String,
    pub hardware_type: String,
    pub hardware_id: String,
    #[serde(default)]
    pub display_config: Option<serde_json::Value>,
    #[serde(default)]
    pub location_metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Operator patch. Anything outside these fields is rejected.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceUpdate {
    pub name: Option<String>,
    pub status: Option<DeviceStatus>,
    pub location_metadata: Option<serde_json::Value>,
    pub tags: Option<Vec<String>>,
    pub display_config: Option<serde_json::Value>,
}

/// Checks an operator-requested status change.
pub fn check_transition(current: DeviceStatus, target: DeviceStatus) -> ApiResult<()> {
    if current == DeviceStatus::Decommissioned && target != DeviceStatus::Decommissioned {
        return Err(ApiError::Conflict(
            "a decommissioned device cannot be returned to service".into(),
        ));
    }
    if !target.is_operator_settable() {
        return Err(ApiError::BadRequest(format!(
            "status '{}' is derived from heartbeats and cannot be set",
            target.as_str()
        )));
    }
    Ok(())
}

fn validate_display_config(value: &serde_json::Value) -> ApiResult<()> {
    let obj = value
        .as_object()
        .ok_or_else(|| ApiError::BadRequest("display_config must be an object".into()))?;
    if let Some(tz) = obj.get("timezone") {
        let valid = tz.as_str().map_or(false, |name| name.parse::<Tz>().is_ok());
        if !valid {
            return Err(ApiError::BadRequest(format!(
                "display_config.timezone is not an IANA zone: {tz}"
            )));
        }
    }
    Ok(())
}

fn require_object(field: &str, value: &serde_json::Value) -> ApiResult<()> {
    if value.is_object() {
        Ok(())
    } else {
        Err(ApiError::BadRequest(format!("{field} must be an object")))
    }
}

/// Device registry: registration, authentication, operator configuration.
pub struct RegistryService {
    pool: SqlitePool,
    event_tx: broadcast::Sender<WsEvent>,
    threshold: Duration,
}

impl RegistryService {
    pub fn new(pool: SqlitePool, event_tx: broadcast::Sender<WsEvent>, threshold: Duration) -> Self {
        RegistryService {
            pool,
            event_tx,
            threshold,
        }
    }

    /// Creates a `pending` device and returns it with its plaintext secret.
    /// The secret is not stored and cannot be retrieved again.
    pub async fn register(&self, organization_id: &str, req: RegisterDevice) -> ApiResult<(DeviceView, String)> {
        for (field, value) in [
            ("name", &req.name),
            ("hardware_type", &req.hardware_type),
            ("hardware_id", &req.hardware_id),
        ] {
            if value.trim().is_empty() {
                return Err(ApiError::BadRequest(format!("{field} must not be empty")));
            }
        }
        if let Some(cfg) = &req.display_config {
            validate_display_config(cfg)?;
        }
        if let Some(loc) = &req.location_metadata {
            require_object("location_metadata", loc)?;
        }
        if queries::hardware_id_taken(&self.pool, organization_id, &req.hardware_id).await? {
            return Err(ApiError::Conflict(format!(
                "hardware_id {} is already registered",
                req.hardware_id
            )));
        }

        let secret = credentials::generate_secret();
        let to_hash = secret.clone();
        let secret_hash = tokio::task::spawn_blocking(move || credentials::hash_secret(&to_hash))
            .await
            .map_err(|e| anyhow::anyhow!("hashing task failed: {e}"))??;

        let mut device = Device::new(
            organization_id.to_string(),
            req.name,
            req.hardware_type,
            req.hardware_id,
            secret_hash,
        );
        if let Some(cfg) = req.display_config {
            device.display_config = Json(cfg);
        }
        if let Some(loc) = req.location_metadata {
            device.location_metadata = Json(loc);
        }
        device.tags = Json(req.tags);

        if let Err(e) = queries::insert_device(&self.pool, &device).await {
            if is_unique_violation(&e) {
                return Err(ApiError::Conflict(format!(
                    "hardware_id {} is already registered",
                    device.hardware_id
                )));
            }
            return Err(e.into());
        }

        tracing::info!(
            device_id = %device.id,
            organization_id = %device.organization_id,
            hardware_id = %device.hardware_id,
            "Device registered"
        );
        let _ = self.event_tx.send(WsEvent::DeviceRegistered {
            organization_id: device.organization_id.clone(),
            device_id: device.id.clone(),
            name: device.name.clone(),
        });

        Ok((DeviceView::project(device, Utc::now(), self.threshold), secret))
    }

    /// Exchanges a hardware id and secret for a device access token. Does not
    /// change the device's status; the first heartbeat does that.
    pub async fn authenticate(
        &self,
        tokens: &TokenIssuer,
        hardware_id: &str,
        secret: &str,
    ) -> ApiResult<AuthResponse> {
        let candidates = queries::find_devices_by_hardware_id(&self.pool, hardware_id).await?;

        let mut matched = None;
        for device in candidates {
            let secret = secret.to_string();
            let phc = device.secret_hash.clone();
            let ok = tokio::task::spawn_blocking(move || credentials::verify_secret(&secret, &phc))
                .await
                .map_err(|e| anyhow::anyhow!("verification task failed: {e}"))?;
            if ok {
                matched = Some(device);
                break;
            }
        }

        let Some(device) = matched else {
            tracing::warn!(hardware_id, "Device authentication failed");
            return Err(ApiError::InvalidCredentials);
        };

        if stored_status(&device) == DeviceStatus::Decommissioned {
            tracing::warn!(device_id = %device.id, "Decommissioned device attempted to authenticate");
            return Err(ApiError::DeviceDecommissioned);
        }

        let access_token = tokens.issue_device_token(&device.id, &device.organization_id)?;
        tracing::info!(device_id = %device.id, "Device authenticated");

        Ok(AuthResponse {
            access_token,
            token_type: "bearer".into(),
            expires_in: tokens.device_ttl().num_seconds(),
            device_id: device.id,
            organization_id: device.organization_id,
        })
    }

    pub async fn get(&self, organization_id: &str, id: &str) -> ApiResult<DeviceView> {
        let device = queries::get_device_in_org(&self.pool, organization_id, id)
            .await?
            .ok_or(ApiError::NotFound("device"))?;
        Ok(DeviceView::project(device, Utc::now(), self.threshold))
    }

    /// Lists devices; `status` filters on the effective (projected) status.
    pub async fn list(
        &self,
        organization_id: &str,
        status: Option<DeviceStatus>,
        search: Option<&str>,
    ) -> ApiResult<Vec<DeviceView>> {
        let now = Utc::now();
        let devices = queries::list_devices(&self.pool, organization_id, search).await?;
        Ok(devices
            .into_iter()
            .map(|d| DeviceView::project(d, now, self.threshold))
            .filter(|v| status.map_or(true, |s| v.status == s))
            .collect())
    }

    pub async fn update_config(
        &self,
        organization_id: &str,
        id: &str,
        patch: DeviceUpdate,
    ) -> ApiResult<DeviceView> {
        let mut device = queries::get_device_in_org(&self.pool, organization_id, id)
            .await?
            .ok_or(ApiError::NotFound("device"))?;

        if let Some(target) = patch.status {
            check_transition(stored_status(&device), target)?;
            device.status = target.as_str().to_string();
        }
        if let Some(name) = patch.name {
            if name.trim().is_empty() {
                return Err(ApiError::BadRequest("name must not be empty".into()));
            }
            device.name = name;
        }
        if let Some(cfg) = patch.display_config {
            validate_display_config(&cfg)?;
            device.display_config = Json(cfg);
        }
        if let Some(loc) = patch.location_metadata {
            require_object("location_metadata", &loc)?;
            device.location_metadata = Json(loc);
        }
        if let Some(tags) = patch.tags {
            device.tags = Json(tags);
        }
        device.updated_at = Utc::now();

        queries::update_device_config(&self.pool, &device).await?;

        tracing::info!(device_id = %device.id, status = %device.status, "Device configuration updated");
        let _ = self.event_tx.send(WsEvent::DeviceUpdated {
            organization_id: device.organization_id.clone(),
            device_id: device.id.clone(),
            status: device.status.clone(),
        });

        Ok(DeviceView::project(device, Utc::now(), self.threshold))
    }
}
