//! Wire types shared by the server handlers and the device agent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ─── Authentication ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthRequest {
    pub hardware_id: String,
    pub device_secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthResponse {
    pub access_token: String,
    pub token_type: String,
    /// Seconds until the token expires.
    pub expires_in: i64,
    pub device_id: String,
    pub organization_id: String,
}

/// Error body returned by every failing endpoint. `code` is stable and
/// machine-readable; the agent branches on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: String,
}

// ─── Heartbeat ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub ip: Option<String>,
    pub mac: Option<String>,
    pub wifi_ssid: Option<String>,
    pub hostname: Option<String>,
}

/// Health/liveness report sent by a device. `time` is the device-side
/// timestamp and doubles as the dedup key for retransmissions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatReport {
    pub time: Option<DateTime<Utc>>,
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
    #[serde(default)]
    pub error_count: i64,
    pub last_error: Option<String>,
    pub firmware_version: Option<String>,
    pub client_version: Option<String>,
    pub network_info: Option<NetworkInfo>,
}

// ─── Content manifest ────────────────────────────────────────────────────────

/// One downloadable artifact. Opaque bytes, verified by SHA-256.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub url: String,
    pub size: i64,
    pub sha256: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuiltArtifact {
    #[serde(flatten)]
    pub artifact: Artifact,
    pub views: u32,
    pub columns: u32,
    pub rows: u32,
}

/// Finished outputs of the processing pipeline for one asset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetOutputs {
    pub optimized_model: Option<Artifact>,
    pub compressed_model: Option<Artifact>,
    #[serde(default)]
    pub quilts: Vec<QuiltArtifact>,
    pub video: Option<Artifact>,
    pub thumbnail: Option<Artifact>,
}

// ─── Playlists ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionType {
    Cut,
    Fade,
    Dissolve,
    Wipe,
}

impl TransitionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransitionType::Cut => "cut",
            TransitionType::Fade => "fade",
            TransitionType::Dissolve => "dissolve",
            TransitionType::Wipe => "wipe",
        }
    }
}

impl FromStr for TransitionType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cut" => Ok(TransitionType::Cut),
            "fade" => Ok(TransitionType::Fade),
            "dissolve" => Ok(TransitionType::Dissolve),
            "wipe" => Ok(TransitionType::Wipe),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// A playlist as delivered to a device: every item carries the manifest the
/// agent needs to fetch and verify its content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedPlaylist {
    pub id: String,
    pub name: String,
    pub loop_mode: bool,
    pub shuffle_mode: bool,
    pub transition_type: TransitionType,
    pub transition_duration_ms: i64,
    pub items: Vec<ResolvedItem>,
    pub resolved_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedItem {
    pub id: String,
    pub asset_id: String,
    pub position: i64,
    pub duration_seconds: i64,
    pub transition_override: Option<TransitionType>,
    pub mime_type: String,
    /// The original upload. Used when no processed output suits the display.
    pub source: Artifact,
    #[serde(default)]
    pub outputs: AssetOutputs,
}

// ─── Commands ────────────────────────────────────────────────────────────────

/// Supersession key: at most one pending command per (device, kind).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Restart,
    ClearCache,
    Screenshot,
    UpdatePlaylist,
}

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::Restart => "restart",
            CommandKind::ClearCache => "clear_cache",
            CommandKind::Screenshot => "screenshot",
            CommandKind::UpdatePlaylist => "update_playlist",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandKind {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "restart" => Ok(CommandKind::Restart),
            "clear_cache" => Ok(CommandKind::ClearCache),
            "screenshot" => Ok(CommandKind::Screenshot),
            "update_playlist" => Ok(CommandKind::UpdatePlaylist),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// Typed command. On the wire it travels as an open `{kind, params}`
/// envelope; see [`CommandEnvelope`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCommand {
    Restart,
    ClearCache,
    Screenshot,
    UpdatePlaylist { playlist_id: String },
}

impl DeviceCommand {
    pub fn kind(&self) -> CommandKind {
        match self {
            DeviceCommand::Restart => CommandKind::Restart,
            DeviceCommand::ClearCache => CommandKind::ClearCache,
            DeviceCommand::Screenshot => CommandKind::Screenshot,
            DeviceCommand::UpdatePlaylist { .. } => CommandKind::UpdatePlaylist,
        }
    }

    pub fn params(&self) -> serde_json::Value {
        match self {
            DeviceCommand::UpdatePlaylist { playlist_id } => {
                serde_json::json!({ "playlist_id": playlist_id })
            }
            _ => serde_json::json!({}),
        }
    }

    pub fn from_parts(kind: CommandKind, params: &serde_json::Value) -> Result<Self, InvalidCommand> {
        match kind {
            CommandKind::Restart => Ok(DeviceCommand::Restart),
            CommandKind::ClearCache => Ok(DeviceCommand::ClearCache),
            CommandKind::Screenshot => Ok(DeviceCommand::Screenshot),
            CommandKind::UpdatePlaylist => {
                let playlist_id = params
                    .get("playlist_id")
                    .and_then(|v| v.as_str())
                    .filter(|s| !s.is_empty())
                    .ok_or(InvalidCommand {
                        kind,
                        reason: "params.playlist_id is required",
                    })?;
                Ok(DeviceCommand::UpdatePlaylist {
                    playlist_id: playlist_id.to_string(),
                })
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub kind: CommandKind,
    #[serde(default = "empty_params")]
    pub params: serde_json::Value,
}

impl CommandEnvelope {
    pub fn into_command(self) -> Result<DeviceCommand, InvalidCommand> {
        DeviceCommand::from_parts(self.kind, &self.params)
    }
}

impl From<&DeviceCommand> for CommandEnvelope {
    fn from(cmd: &DeviceCommand) -> Self {
        CommandEnvelope {
            kind: cmd.kind(),
            params: cmd.params(),
        }
    }
}

fn empty_params() -> serde_json::Value {
    serde_json::json!({})
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueCommandResponse {
    pub command_id: String,
}

/// A pending command as handed to the device on poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingCommand {
    pub command_id: String,
    pub kind: CommandKind,
    pub params: serde_json::Value,
    pub issued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandAck {
    pub success: bool,
    pub message: Option<String>,
    pub data: Option<serde_json::Value>,
}

// ─── Parse errors ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown variant: {0}")]
pub struct UnknownVariant(pub String);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {kind} command: {reason}")]
pub struct InvalidCommand {
    pub kind: CommandKind,
    pub reason: &'static str,
}
