use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use uuid::Uuid;

use crate::protocol::AssetOutputs;
use crate::schedule::ScheduleConfig;

// ─── Device ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Device {
    pub id: String,
    pub organization_id: String,
    pub name: String,
    pub hardware_type: String,
    pub hardware_id: String,
    #[serde(skip_serializing)]
    pub secret_hash: String,
    pub status: String, // pending | active | offline | maintenance | decommissioned
    pub display_config: Json<serde_json::Value>,
    pub network_info: Json<serde_json::Value>,
    pub location_metadata: Json<serde_json::Value>,
    pub tags: Json<Vec<String>>,
    pub firmware_version: Option<String>,
    pub client_version: Option<String>,
    pub current_playlist_id: Option<String>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Device {
    pub fn new(
        organization_id: String,
        name: String,
        hardware_type: String,
        hardware_id: String,
        secret_hash: String,
    ) -> Self {
        let now = Utc::now();
        Device {
            id: Uuid::new_v4().to_string(),
            organization_id,
            name,
            hardware_type,
            hardware_id,
            secret_hash,
            status: "pending".into(),
            display_config: Json(serde_json::json!({})),
            network_info: Json(serde_json::json!({})),
            location_metadata: Json(serde_json::json!({})),
            tags: Json(Vec::new()),
            firmware_version: None,
            client_version: None,
            current_playlist_id: None,
            last_heartbeat: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// The subset of a device row the status sweeper needs.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DeviceLiveness {
    pub id: String,
    pub organization_id: String,
    pub status: String,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

// ─── Heartbeat ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Heartbeat {
    pub device_id: String,
    pub time: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
    pub cpu_usage_percent: Option<f64>,
    pub memory_usage_percent: Option<f64>,
    pub storage_used_percent: Option<f64>,
    pub temperature_celsius: Option<f64>,
    pub bandwidth_mbps: Option<f64>,
    pub latency_ms: Option<f64>,
    pub packet_loss_percent: Option<f64>,
    pub current_playlist_id: Option<String>,
    pub current_asset_id: Option<String>,
    pub playback_position_sec: Option<i64>,
    pub error_count: i64,
    pub last_error: Option<String>,
}

// ─── Asset ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Asset {
    pub id: String,
    pub organization_id: String,
    pub name: String,
    pub sha256: String,
    pub mime_type: String,
    pub file_size: i64,
    pub file_url: String,
    pub processing_status: String, // pending | processing | completed | failed
    pub outputs: Option<Json<AssetOutputs>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ─── Playlist ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Playlist {
    pub id: String,
    pub organization_id: String,
    pub name: String,
    pub description: Option<String>,
    pub is_active: bool,
    pub loop_mode: bool,
    pub shuffle_mode: bool,
    pub transition_type: String,
    pub transition_duration_ms: i64,
    pub schedule: Option<Json<ScheduleConfig>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PlaylistItem {
    pub id: String,
    pub playlist_id: String,
    pub asset_id: String,
    pub position: i64,
    pub duration_seconds: i64,
    pub transition_override: Option<String>,
}

/// A playlist item joined with the asset fields a device needs to fetch it.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PlaylistItemWithAsset {
    pub id: String,
    pub asset_id: String,
    pub position: i64,
    pub duration_seconds: i64,
    pub transition_override: Option<String>,
    pub mime_type: String,
    pub file_url: String,
    pub file_size: i64,
    pub sha256: String,
    pub outputs: Option<Json<AssetOutputs>>,
}

// ─── Assignment ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DevicePlaylist {
    pub device_id: String,
    pub playlist_id: String,
    pub priority: i64,
    pub schedule_override: Option<Json<ScheduleConfig>>,
    pub assigned_at: DateTime<Utc>,
}

/// An assignment joined with the playlist fields the resolver looks at.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AssignmentCandidate {
    pub playlist_id: String,
    pub priority: i64,
    pub assigned_at: DateTime<Utc>,
    pub schedule_override: Option<Json<ScheduleConfig>>,
    pub schedule: Option<Json<ScheduleConfig>>,
    pub is_active: bool,
}

// ─── Command ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Command {
    pub id: String,
    pub device_id: String,
    pub kind: String,
    pub params: Json<serde_json::Value>,
    pub status: String, // pending | superseded | acknowledged
    pub issued_at: DateTime<Utc>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub result: Option<Json<serde_json::Value>>,
}
