use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::{types::Json, SqliteConnection, SqlitePool};

use super::models::{
    Asset, AssignmentCandidate, Command, Device, DeviceLiveness, DevicePlaylist, Heartbeat,
    Playlist, PlaylistItem, PlaylistItemWithAsset,
};
use crate::protocol::{AssetOutputs, NetworkInfo};

// ─── Device queries ──────────────────────────────────────────────────────────

pub async fn list_devices(
    pool: &SqlitePool,
    organization_id: &str,
    search: Option<&str>,
) -> Result<Vec<Device>> {
    let devices = match search {
        Some(term) => {
            let pattern = format!("%{}%", term);
            sqlx::query_as::<_, Device>(
                "SELECT * FROM devices
                 WHERE organization_id = ? AND (name LIKE ? OR hardware_id LIKE ?)
                 ORDER BY created_at DESC",
            )
            .bind(organization_id)
            .bind(&pattern)
            .bind(&pattern)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query_as::<_, Device>(
                "SELECT * FROM devices WHERE organization_id = ? ORDER BY created_at DESC",
            )
            .bind(organization_id)
            .fetch_all(pool)
            .await?
        }
    };
    Ok(devices)
}

pub async fn get_device(pool: &SqlitePool, id: &str) -> Result<Option<Device>> {
    let device = sqlx::query_as::<_, Device>("SELECT * FROM devices WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(device)
}

pub async fn get_device_in_org(
    pool: &SqlitePool,
    organization_id: &str,
    id: &str,
) -> Result<Option<Device>> {
    let device =
        sqlx::query_as::<_, Device>("SELECT * FROM devices WHERE id = ? AND organization_id = ?")
            .bind(id)
            .bind(organization_id)
            .fetch_optional(pool)
            .await?;
    Ok(device)
}

/// Hardware ids are only unique per organization, so this may return several.
pub async fn find_devices_by_hardware_id(pool: &SqlitePool, hardware_id: &str) -> Result<Vec<Device>> {
    let devices = sqlx::query_as::<_, Device>(
        "SELECT * FROM devices WHERE hardware_id = ? ORDER BY created_at ASC",
    )
    .bind(hardware_id)
    .fetch_all(pool)
    .await?;
    Ok(devices)
}

pub async fn hardware_id_taken(
    pool: &SqlitePool,
    organization_id: &str,
    hardware_id: &str,
) -> Result<bool> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM devices WHERE organization_id = ? AND hardware_id = ?",
    )
    .bind(organization_id)
    .bind(hardware_id)
    .fetch_one(pool)
    .await?;
    Ok(count > 0)
}

pub async fn insert_device(pool: &SqlitePool, d: &Device) -> Result<()> {
    sqlx::query(
        "INSERT INTO devices (id, organization_id, name, hardware_type, hardware_id, secret_hash, status, display_config, network_info, location_metadata, tags, firmware_version, client_version, current_playlist_id, last_heartbeat, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&d.id)
    .bind(&d.organization_id)
    .bind(&d.name)
    .bind(&d.hardware_type)
    .bind(&d.hardware_id)
    .bind(&d.secret_hash)
    .bind(&d.status)
    .bind(&d.display_config)
    .bind(&d.network_info)
    .bind(&d.location_metadata)
    .bind(&d.tags)
    .bind(&d.firmware_version)
    .bind(&d.client_version)
    .bind(&d.current_playlist_id)
    .bind(d.last_heartbeat)
    .bind(d.created_at)
    .bind(d.updated_at)
    .execute(pool)
    .await?;
    Ok(())
}

/// Persists the operator-editable fields of a device.
pub async fn update_device_config(pool: &SqlitePool, d: &Device) -> Result<()> {
    sqlx::query(
        "UPDATE devices SET
           name = ?, status = ?, location_metadata = ?, tags = ?, display_config = ?, updated_at = ?
         WHERE id = ?",
    )
    .bind(&d.name)
    .bind(&d.status)
    .bind(&d.location_metadata)
    .bind(&d.tags)
    .bind(&d.display_config)
    .bind(d.updated_at)
    .bind(&d.id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Refreshes liveness and reported versions; promotes `pending` to `active`.
pub async fn touch_device_heartbeat(
    conn: &mut SqliteConnection,
    id: &str,
    received_at: DateTime<Utc>,
    firmware_version: Option<&str>,
    client_version: Option<&str>,
    network_info: Option<&NetworkInfo>,
) -> Result<()> {
    let network_info = network_info.map(Json);
    sqlx::query(
        "UPDATE devices SET
           last_heartbeat = ?,
           firmware_version = COALESCE(?, firmware_version),
           client_version = COALESCE(?, client_version),
           network_info = COALESCE(?, network_info),
           status = CASE WHEN status = 'pending' THEN 'active' ELSE status END,
           updated_at = ?
         WHERE id = ?",
    )
    .bind(received_at)
    .bind(firmware_version)
    .bind(client_version)
    .bind(network_info)
    .bind(received_at)
    .bind(id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn set_current_playlist(pool: &SqlitePool, id: &str, playlist_id: &str) -> Result<()> {
    sqlx::query("UPDATE devices SET current_playlist_id = ? WHERE id = ?")
        .bind(playlist_id)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn list_device_liveness(pool: &SqlitePool) -> Result<Vec<DeviceLiveness>> {
    let rows = sqlx::query_as::<_, DeviceLiveness>(
        "SELECT id, organization_id, status, last_heartbeat FROM devices",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

// ─── Heartbeat queries ───────────────────────────────────────────────────────

/// Returns false when a heartbeat with the same (device_id, time) already exists.
pub async fn insert_heartbeat(conn: &mut SqliteConnection, h: &Heartbeat) -> Result<bool> {
    let res = sqlx::query(
        "INSERT INTO heartbeats (device_id, time, received_at, cpu_usage_percent, memory_usage_percent, storage_used_percent, temperature_celsius, bandwidth_mbps, latency_ms, packet_loss_percent, current_playlist_id, current_asset_id, playback_position_sec, error_count, last_error)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(device_id, time) DO NOTHING",
    )
    .bind(&h.device_id)
    .bind(h.time)
    .bind(h.received_at)
    .bind(h.cpu_usage_percent)
    .bind(h.memory_usage_percent)
    .bind(h.storage_used_percent)
    .bind(h.temperature_celsius)
    .bind(h.bandwidth_mbps)
    .bind(h.latency_ms)
    .bind(h.packet_loss_percent)
    .bind(&h.current_playlist_id)
    .bind(&h.current_asset_id)
    .bind(h.playback_position_sec)
    .bind(h.error_count)
    .bind(&h.last_error)
    .execute(&mut *conn)
    .await?;
    Ok(res.rows_affected() == 1)
}

pub async fn list_heartbeats(pool: &SqlitePool, device_id: &str, limit: i64) -> Result<Vec<Heartbeat>> {
    let rows = sqlx::query_as::<_, Heartbeat>(
        "SELECT * FROM heartbeats WHERE device_id = ? ORDER BY time DESC LIMIT ?",
    )
    .bind(device_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn count_heartbeats(pool: &SqlitePool, device_id: &str) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM heartbeats WHERE device_id = ?")
        .bind(device_id)
        .fetch_one(pool)
        .await?;
    Ok(count)
}

// ─── Asset queries ───────────────────────────────────────────────────────────

pub async fn get_asset(pool: &SqlitePool, organization_id: &str, id: &str) -> Result<Option<Asset>> {
    let asset =
        sqlx::query_as::<_, Asset>("SELECT * FROM assets WHERE id = ? AND organization_id = ?")
            .bind(id)
            .bind(organization_id)
            .fetch_optional(pool)
            .await?;
    Ok(asset)
}

pub async fn get_asset_by_sha256(
    pool: &SqlitePool,
    organization_id: &str,
    sha256: &str,
) -> Result<Option<Asset>> {
    let asset = sqlx::query_as::<_, Asset>(
        "SELECT * FROM assets WHERE organization_id = ? AND sha256 = ?",
    )
    .bind(organization_id)
    .bind(sha256)
    .fetch_optional(pool)
    .await?;
    Ok(asset)
}

/// Returns false if an asset with the same (organization_id, sha256) won the race.
pub async fn insert_asset(pool: &SqlitePool, a: &Asset) -> Result<bool> {
    let res = sqlx::query(
        "INSERT INTO assets (id, organization_id, name, sha256, mime_type, file_size, file_url, processing_status, outputs, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(organization_id, sha256) DO NOTHING",
    )
    .bind(&a.id)
    .bind(&a.organization_id)
    .bind(&a.name)
    .bind(&a.sha256)
    .bind(&a.mime_type)
    .bind(a.file_size)
    .bind(&a.file_url)
    .bind(&a.processing_status)
    .bind(&a.outputs)
    .bind(a.created_at)
    .bind(a.updated_at)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

pub async fn update_asset_processing(
    pool: &SqlitePool,
    id: &str,
    processing_status: &str,
    outputs: Option<&AssetOutputs>,
) -> Result<()> {
    sqlx::query(
        "UPDATE assets SET processing_status = ?, outputs = COALESCE(?, outputs), updated_at = ?
         WHERE id = ?",
    )
    .bind(processing_status)
    .bind(outputs.map(Json))
    .bind(Utc::now())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn count_assets_in_org(
    conn: &mut SqliteConnection,
    organization_id: &str,
    asset_ids: &[String],
) -> Result<usize> {
    let mut found = 0;
    for id in asset_ids {
        let exists: Option<String> =
            sqlx::query_scalar("SELECT id FROM assets WHERE id = ? AND organization_id = ?")
                .bind(id)
                .bind(organization_id)
                .fetch_optional(&mut *conn)
                .await?;
        if exists.is_some() {
            found += 1;
        }
    }
    Ok(found)
}

// ─── Playlist queries ────────────────────────────────────────────────────────

pub async fn insert_playlist(conn: &mut SqliteConnection, p: &Playlist) -> Result<()> {
    sqlx::query(
        "INSERT INTO playlists (id, organization_id, name, description, is_active, loop_mode, shuffle_mode, transition_type, transition_duration_ms, schedule, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&p.id)
    .bind(&p.organization_id)
    .bind(&p.name)
    .bind(&p.description)
    .bind(p.is_active)
    .bind(p.loop_mode)
    .bind(p.shuffle_mode)
    .bind(&p.transition_type)
    .bind(p.transition_duration_ms)
    .bind(&p.schedule)
    .bind(p.created_at)
    .bind(p.updated_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn get_playlist(pool: &SqlitePool, id: &str) -> Result<Option<Playlist>> {
    let playlist = sqlx::query_as::<_, Playlist>("SELECT * FROM playlists WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(playlist)
}

pub async fn get_playlist_in_org(
    pool: &SqlitePool,
    organization_id: &str,
    id: &str,
) -> Result<Option<Playlist>> {
    let playlist = sqlx::query_as::<_, Playlist>(
        "SELECT * FROM playlists WHERE id = ? AND organization_id = ?",
    )
    .bind(id)
    .bind(organization_id)
    .fetch_optional(pool)
    .await?;
    Ok(playlist)
}

pub async fn list_playlist_items(pool: &SqlitePool, playlist_id: &str) -> Result<Vec<PlaylistItem>> {
    let items = sqlx::query_as::<_, PlaylistItem>(
        "SELECT * FROM playlist_items WHERE playlist_id = ? ORDER BY position ASC",
    )
    .bind(playlist_id)
    .fetch_all(pool)
    .await?;
    Ok(items)
}

pub async fn list_playlist_items_with_assets(
    pool: &SqlitePool,
    playlist_id: &str,
) -> Result<Vec<PlaylistItemWithAsset>> {
    let items = sqlx::query_as::<_, PlaylistItemWithAsset>(
        "SELECT pi.id, pi.asset_id, pi.position, pi.duration_seconds, pi.transition_override,
                a.mime_type, a.file_url, a.file_size, a.sha256, a.outputs
         FROM playlist_items pi
         JOIN assets a ON a.id = pi.asset_id
         WHERE pi.playlist_id = ?
         ORDER BY pi.position ASC",
    )
    .bind(playlist_id)
    .fetch_all(pool)
    .await?;
    Ok(items)
}

/// Drops every item of the playlist and writes `items` in their place.
/// Callers run this inside a transaction so readers never see a partial order.
pub async fn replace_playlist_items(
    conn: &mut SqliteConnection,
    playlist_id: &str,
    items: &[PlaylistItem],
) -> Result<()> {
    sqlx::query("DELETE FROM playlist_items WHERE playlist_id = ?")
        .bind(playlist_id)
        .execute(&mut *conn)
        .await?;

    for item in items {
        sqlx::query(
            "INSERT INTO playlist_items (id, playlist_id, asset_id, position, duration_seconds, transition_override)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&item.id)
        .bind(playlist_id)
        .bind(&item.asset_id)
        .bind(item.position)
        .bind(item.duration_seconds)
        .bind(&item.transition_override)
        .execute(&mut *conn)
        .await?;
    }

    sqlx::query("UPDATE playlists SET updated_at = ? WHERE id = ?")
        .bind(Utc::now())
        .bind(playlist_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

// ─── Assignment queries ──────────────────────────────────────────────────────

pub async fn upsert_assignment(pool: &SqlitePool, a: &DevicePlaylist) -> Result<()> {
    sqlx::query(
        "INSERT INTO device_playlists (device_id, playlist_id, priority, schedule_override, assigned_at)
         VALUES (?, ?, ?, ?, ?)
         ON CONFLICT(device_id, playlist_id) DO UPDATE SET
           priority = excluded.priority,
           schedule_override = excluded.schedule_override,
           assigned_at = excluded.assigned_at",
    )
    .bind(&a.device_id)
    .bind(&a.playlist_id)
    .bind(a.priority)
    .bind(&a.schedule_override)
    .bind(a.assigned_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn list_assignments(pool: &SqlitePool, device_id: &str) -> Result<Vec<DevicePlaylist>> {
    let rows = sqlx::query_as::<_, DevicePlaylist>(
        "SELECT * FROM device_playlists WHERE device_id = ? ORDER BY priority DESC, assigned_at DESC",
    )
    .bind(device_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn delete_assignment(pool: &SqlitePool, device_id: &str, playlist_id: &str) -> Result<bool> {
    let res = sqlx::query("DELETE FROM device_playlists WHERE device_id = ? AND playlist_id = ?")
        .bind(device_id)
        .bind(playlist_id)
        .execute(pool)
        .await?;
    Ok(res.rows_affected() > 0)
}

pub async fn list_assignment_candidates(
    pool: &SqlitePool,
    device_id: &str,
) -> Result<Vec<AssignmentCandidate>> {
    let rows = sqlx::query_as::<_, AssignmentCandidate>(
        "SELECT dp.playlist_id, dp.priority, dp.assigned_at, dp.schedule_override,
                p.schedule, p.is_active
         FROM device_playlists dp
         JOIN playlists p ON p.id = dp.playlist_id
         WHERE dp.device_id = ?",
    )
    .bind(device_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

// ─── Command queries ─────────────────────────────────────────────────────────

pub async fn get_command(pool: &SqlitePool, device_id: &str, id: &str) -> Result<Option<Command>> {
    let cmd = sqlx::query_as::<_, Command>("SELECT * FROM commands WHERE id = ? AND device_id = ?")
        .bind(id)
        .bind(device_id)
        .fetch_optional(pool)
        .await?;
    Ok(cmd)
}

/// Marks every pending command of this kind superseded and returns their ids.
pub async fn supersede_pending_commands(
    conn: &mut SqliteConnection,
    device_id: &str,
    kind: &str,
) -> Result<Vec<String>> {
    let ids: Vec<String> = sqlx::query_scalar(
        "UPDATE commands SET status = 'superseded'
         WHERE device_id = ? AND kind = ? AND status = 'pending'
         RETURNING id",
    )
    .bind(device_id)
    .bind(kind)
    .fetch_all(&mut *conn)
    .await?;
    Ok(ids)
}

pub async fn insert_command(conn: &mut SqliteConnection, c: &Command) -> Result<()> {
    sqlx::query(
        "INSERT INTO commands (id, device_id, kind, params, status, issued_at, acknowledged_at, result)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&c.id)
    .bind(&c.device_id)
    .bind(&c.kind)
    .bind(&c.params)
    .bind(&c.status)
    .bind(c.issued_at)
    .bind(c.acknowledged_at)
    .bind(&c.result)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn list_pending_commands(pool: &SqlitePool, device_id: &str) -> Result<Vec<Command>> {
    let rows = sqlx::query_as::<_, Command>(
        "SELECT * FROM commands WHERE device_id = ? AND status = 'pending'
         ORDER BY issued_at ASC, rowid ASC",
    )
    .bind(device_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Transitions a pending command to acknowledged. Returns false when the
/// command was not pending (already acknowledged, or superseded).
pub async fn acknowledge_command(
    conn: &mut SqliteConnection,
    device_id: &str,
    id: &str,
    result: &serde_json::Value,
    acknowledged_at: DateTime<Utc>,
) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE commands SET status = 'acknowledged', acknowledged_at = ?, result = ?
         WHERE id = ? AND device_id = ? AND status = 'pending'",
    )
    .bind(acknowledged_at)
    .bind(Json(result))
    .bind(id)
    .bind(device_id)
    .execute(&mut *conn)
    .await?;
    Ok(res.rows_affected() == 1)
}
