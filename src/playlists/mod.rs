use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{types::Json, SqliteConnection, SqlitePool};
use std::collections::HashSet;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::db::{
    models::{AssignmentCandidate, Device, DevicePlaylist, Playlist, PlaylistItem, PlaylistItemWithAsset},
    queries,
};
use crate::error::{ApiError, ApiResult};
use crate::protocol::{Artifact, ResolvedItem, ResolvedPlaylist, TransitionType};
use crate::registry::device_timezone;
use crate::schedule::{self, Assignment, ScheduleConfig};
use crate::ws::WsEvent;

#[derive(Debug, Deserialize)]
pub struct CreatePlaylist {
    pub name: String,
    pub description: Option<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default = "default_true")]
    pub loop_mode: bool,
    #[serde(default)]
    pub shuffle_mode: bool,
    #[serde(default = "default_transition")]
    pub transition_type: TransitionType,
    #[serde(default = "default_transition_ms")]
    pub transition_duration_ms: i64,
    pub schedule: Option<ScheduleConfig>,
    #[serde(default)]
    pub items: Vec<ItemSpec>,
}

fn default_true() -> bool {
    true
}

fn default_transition() -> TransitionType {
    TransitionType::Fade
}

fn default_transition_ms() -> i64 {
    500
}

/// One entry of a full item list. Positions are assigned from list order.
#[derive(Debug, Clone, Deserialize)]
pub struct ItemSpec {
    pub asset_id: String,
    #[serde(default = "default_duration")]
    pub duration_seconds: i64,
    pub transition_override: Option<TransitionType>,
}

fn default_duration() -> i64 {
    10
}

#[derive(Debug, Deserialize)]
pub struct AssignPlaylist {
    pub playlist_id: String,
    #[serde(default)]
    pub priority: i64,
    pub schedule_override: Option<ScheduleConfig>,
}

#[derive(Debug, Serialize)]
pub struct PlaylistDetail {
    #[serde(flatten)]
    pub playlist: Playlist,
    pub items: Vec<PlaylistItem>,
}

impl From<AssignmentCandidate> for Assignment {
    fn from(row: AssignmentCandidate) -> Self {
        Assignment {
            playlist_id: row.playlist_id,
            priority: row.priority,
            assigned_at: row.assigned_at,
            is_active: row.is_active,
            schedule: row.schedule.map(|s| s.0),
            schedule_override: row.schedule_override.map(|s| s.0),
        }
    }
}

fn validate_items(items: &[ItemSpec]) -> ApiResult<()> {
    for (i, item) in items.iter().enumerate() {
        if item.duration_seconds < 1 {
            return Err(ApiError::BadRequest(format!(
                "items[{i}].duration_seconds must be at least 1"
            )));
        }
    }
    Ok(())
}

async fn check_assets(
    conn: &mut SqliteConnection,
    organization_id: &str,
    items: &[ItemSpec],
) -> ApiResult<()> {
    let distinct: Vec<String> = items
        .iter()
        .map(|i| i.asset_id.clone())
        .collect::<HashSet<_>>()
        .into_iter()
        .collect();
    let found = queries::count_assets_in_org(conn, organization_id, &distinct).await?;
    if found != distinct.len() {
        return Err(ApiError::BadRequest(
            "every item must reference an asset of this organization".into(),
        ));
    }
    Ok(())
}

fn validate_schedule(label: &str, schedule: Option<&ScheduleConfig>) -> ApiResult<()> {
    if let Some(s) = schedule {
        s.validate()
            .map_err(|e| ApiError::BadRequest(format!("{label}: {e}")))?;
    }
    Ok(())
}

/// Dense, zero-based positions in list order.
fn to_rows(playlist_id: &str, items: &[ItemSpec]) -> Vec<PlaylistItem> {
    items
        .iter()
        .enumerate()
        .map(|(i, spec)| PlaylistItem {
            id: Uuid::new_v4().to_string(),
            playlist_id: playlist_id.to_string(),
            asset_id: spec.asset_id.clone(),
            position: i as i64,
            duration_seconds: spec.duration_seconds,
            transition_override: spec.transition_override.map(|t| t.as_str().to_string()),
        })
        .collect()
}

fn resolved_item(row: PlaylistItemWithAsset) -> ResolvedItem {
    ResolvedItem {
        transition_override: row
            .transition_override
            .as_deref()
            .and_then(|t| t.parse().ok()),
        source: Artifact {
            url: row.file_url,
            size: row.file_size,
            sha256: row.sha256,
        },
        outputs: row.outputs.map(|o| o.0).unwrap_or_default(),
        id: row.id,
        asset_id: row.asset_id,
        position: row.position,
        duration_seconds: row.duration_seconds,
        mime_type: row.mime_type,
    }
}

pub struct PlaylistService {
    pool: SqlitePool,
    event_tx: broadcast::Sender<WsEvent>,
}

impl PlaylistService {
    pub fn new(pool: SqlitePool, event_tx: broadcast::Sender<WsEvent>) -> Self {
        PlaylistService { pool, event_tx }
    }

    pub async fn create(&self, organization_id: &str, req: CreatePlaylist) -> ApiResult<PlaylistDetail> {
        if req.name.trim().is_empty() {
            return Err(ApiError::BadRequest("name must not be empty".into()));
        }
        if !(0..=5000).contains(&req.transition_duration_ms) {
            return Err(ApiError::BadRequest(
                "transition_duration_ms must be within 0..=5000".into(),
            ));
        }
        validate_schedule("schedule", req.schedule.as_ref())?;
        validate_items(&req.items)?;

        let now = Utc::now();
        let playlist = Playlist {
            id: Uuid::new_v4().to_string(),
            organization_id: organization_id.to_string(),
            name: req.name,
            description: req.description,
            is_active: req.is_active,
            loop_mode: req.loop_mode,
            shuffle_mode: req.shuffle_mode,
            transition_type: req.transition_type.as_str().to_string(),
            transition_duration_ms: req.transition_duration_ms,
            schedule: req.schedule.map(Json),
            created_at: now,
            updated_at: now,
        };
        let rows = to_rows(&playlist.id, &req.items);

        // The playlist row and its items land together or not at all.
        let mut tx = self.pool.begin().await?;
        check_assets(&mut tx, organization_id, &req.items).await?;
        queries::insert_playlist(&mut tx, &playlist).await?;
        queries::replace_playlist_items(&mut tx, &playlist.id, &rows).await?;
        tx.commit().await?;

        tracing::info!(playlist_id = %playlist.id, items = rows.len(), "Playlist created");
        Ok(PlaylistDetail {
            playlist,
            items: rows,
        })
    }

    pub async fn get(&self, organization_id: &str, id: &str) -> ApiResult<PlaylistDetail> {
        let playlist = queries::get_playlist_in_org(&self.pool, organization_id, id)
            .await?
            .ok_or(ApiError::NotFound("playlist"))?;
        let items = queries::list_playlist_items(&self.pool, id).await?;
        Ok(PlaylistDetail { playlist, items })
    }

    /// Atomically replaces the whole item list. Readers see the old order or
    /// the new one, never a mix.
    pub async fn replace_items(
        &self,
        organization_id: &str,
        playlist_id: &str,
        items: Vec<ItemSpec>,
    ) -> ApiResult<PlaylistDetail> {
        validate_items(&items)?;
        let playlist = queries::get_playlist_in_org(&self.pool, organization_id, playlist_id)
            .await?
            .ok_or(ApiError::NotFound("playlist"))?;

        let rows = to_rows(playlist_id, &items);

        let mut tx = self.pool.begin().await?;
        check_assets(&mut tx, organization_id, &items).await?;
        queries::replace_playlist_items(&mut tx, playlist_id, &rows).await?;
        tx.commit().await?;

        tracing::info!(playlist_id, items = rows.len(), "Playlist items rewritten");
        Ok(PlaylistDetail {
            playlist,
            items: rows,
        })
    }

    // ─── Assignments ─────────────────────────────────────────────────────

    pub async fn assign(&self, device: &Device, req: AssignPlaylist) -> ApiResult<DevicePlaylist> {
        validate_schedule("schedule_override", req.schedule_override.as_ref())?;
        queries::get_playlist_in_org(&self.pool, &device.organization_id, &req.playlist_id)
            .await?
            .ok_or(ApiError::NotFound("playlist"))?;

        let assignment = DevicePlaylist {
            device_id: device.id.clone(),
            playlist_id: req.playlist_id,
            priority: req.priority,
            schedule_override: req.schedule_override.map(Json),
            assigned_at: Utc::now(),
        };
        queries::upsert_assignment(&self.pool, &assignment).await?;
        tracing::info!(
            device_id = %device.id,
            playlist_id = %assignment.playlist_id,
            priority = assignment.priority,
            "Playlist assigned"
        );
        Ok(assignment)
    }

    pub async fn assignments(&self, device: &Device) -> ApiResult<Vec<DevicePlaylist>> {
        Ok(queries::list_assignments(&self.pool, &device.id).await?)
    }

    pub async fn unassign(&self, device: &Device, playlist_id: &str) -> ApiResult<()> {
        if !queries::delete_assignment(&self.pool, &device.id, playlist_id).await? {
            return Err(ApiError::NotFound("assignment"));
        }
        tracing::info!(device_id = %device.id, playlist_id, "Playlist unassigned");
        Ok(())
    }

    // ─── Resolution ──────────────────────────────────────────────────────

    /// The playlist `device` should be playing at `now`, with everything the
    /// agent needs to fetch its content. Records the pick on the device.
    pub async fn resolve_for_device(
        &self,
        device: &Device,
        now: DateTime<Utc>,
    ) -> ApiResult<Option<ResolvedPlaylist>> {
        let assignments: Vec<Assignment> = queries::list_assignment_candidates(&self.pool, &device.id)
            .await?
            .into_iter()
            .map(Assignment::from)
            .collect();

        let Some(chosen) = schedule::resolve(&assignments, now, device_timezone(device)) else {
            tracing::debug!(device_id = %device.id, "No eligible playlist");
            return Ok(None);
        };

        let playlist = queries::get_playlist(&self.pool, &chosen.playlist_id)
            .await?
            .ok_or(ApiError::NotFound("playlist"))?;
        let items = queries::list_playlist_items_with_assets(&self.pool, &playlist.id).await?;

        if device.current_playlist_id.as_deref() != Some(playlist.id.as_str()) {
            queries::set_current_playlist(&self.pool, &device.id, &playlist.id).await?;
            tracing::info!(device_id = %device.id, playlist_id = %playlist.id, "Resolved playlist changed");
            let _ = self.event_tx.send(WsEvent::PlaylistResolved {
                organization_id: device.organization_id.clone(),
                device_id: device.id.clone(),
                playlist_id: playlist.id.clone(),
            });
        }

        Ok(Some(ResolvedPlaylist {
            transition_type: playlist
                .transition_type
                .parse()
                .unwrap_or(TransitionType::Fade),
            id: playlist.id,
            name: playlist.name,
            loop_mode: playlist.loop_mode,
            shuffle_mode: playlist.shuffle_mode,
            transition_duration_ms: playlist.transition_duration_ms,
            items: items.into_iter().map(resolved_item).collect(),
            resolved_at: now,
        }))
    }
}
