use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::protocol::CommandKind;

/// All WebSocket events sent to connected operator clients. Every event is
/// scoped to one organization and only delivered to that organization.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsEvent {
    /// An operator registered a new device
    DeviceRegistered {
        organization_id: String,
        device_id: String,
        name: String,
    },
    /// Operator-editable configuration changed
    DeviceUpdated {
        organization_id: String,
        device_id: String,
        status: String,
    },
    /// A device came back within the offline threshold
    DeviceOnline {
        organization_id: String,
        device_id: String,
    },
    /// A device's last heartbeat aged past the offline threshold
    DeviceOffline {
        organization_id: String,
        device_id: String,
        last_heartbeat: Option<DateTime<Utc>>,
    },
    /// A heartbeat was stored (duplicates don't fire this)
    HeartbeatReceived {
        organization_id: String,
        device_id: String,
        health_score: f64,
        is_healthy: bool,
    },
    /// The resolver picked a playlist for a device
    PlaylistResolved {
        organization_id: String,
        device_id: String,
        playlist_id: String,
    },

    // ─── Commands ────────────────────────────────────────────────────────

    CommandIssued {
        organization_id: String,
        device_id: String,
        command_id: String,
        kind: CommandKind,
    },
    /// A pending command was replaced by a newer one of the same kind
    CommandSuperseded {
        organization_id: String,
        device_id: String,
        command_id: String,
        superseded_by: String,
    },
    CommandAcknowledged {
        organization_id: String,
        device_id: String,
        command_id: String,
        success: bool,
    },

    // ─── Content ─────────────────────────────────────────────────────────

    AssetRegistered {
        organization_id: String,
        asset_id: String,
        sha256: String,
        processing_status: String,
    },
}

impl WsEvent {
    pub fn organization_id(&self) -> &str {
        match self {
            WsEvent::DeviceRegistered { organization_id, .. }
            | WsEvent::DeviceUpdated { organization_id, .. }
            | WsEvent::DeviceOnline { organization_id, .. }
            | WsEvent::DeviceOffline { organization_id, .. }
            | WsEvent::HeartbeatReceived { organization_id, .. }
            | WsEvent::PlaylistResolved { organization_id, .. }
            | WsEvent::CommandIssued { organization_id, .. }
            | WsEvent::CommandSuperseded { organization_id, .. }
            | WsEvent::CommandAcknowledged { organization_id, .. }
            | WsEvent::AssetRegistered { organization_id, .. } => organization_id,
        }
    }
}
