//! Heartbeat ingestion, liveness projection and health scoring.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::db::{
    models::{Device, Heartbeat},
    queries,
};
use crate::error::{ApiError, ApiResult};
use crate::protocol::HeartbeatReport;
use crate::registry::{stored_status, DeviceStatus};
use crate::ws::WsEvent;

pub const DEFAULT_HISTORY_LIMIT: i64 = 100;
pub const MAX_HISTORY_LIMIT: i64 = 1000;

/// Online iff the last heartbeat is strictly younger than `threshold`.
/// A timestamp in the future (clock skew) counts as fresh.
pub fn is_online(last_heartbeat: Option<DateTime<Utc>>, now: DateTime<Utc>, threshold: Duration) -> bool {
    match last_heartbeat {
        None => false,
        Some(last) => match (now - last).to_std() {
            Ok(age) => age < threshold,
            Err(_) => true,
        },
    }
}

/// Status as any reader should see it. Operator-controlled states are
/// reported as stored; otherwise liveness decides.
pub fn effective_status(
    stored: DeviceStatus,
    last_heartbeat: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    threshold: Duration,
) -> DeviceStatus {
    match stored {
        DeviceStatus::Pending | DeviceStatus::Maintenance | DeviceStatus::Decommissioned => stored,
        DeviceStatus::Active | DeviceStatus::Offline => {
            if is_online(last_heartbeat, now, threshold) {
                DeviceStatus::Active
            } else {
                DeviceStatus::Offline
            }
        }
    }
}

// ─── Health ──────────────────────────────────────────────────────────────────

impl Heartbeat {
    pub fn is_healthy(&self) -> bool {
        self.cpu_usage_percent.map_or(true, |v| v <= 90.0)
            && self.memory_usage_percent.map_or(true, |v| v <= 90.0)
            && self.temperature_celsius.map_or(true, |v| v <= 70.0)
            && self.error_count == 0
    }

    /// 0-100. Penalizes CPU and memory above 50%, temperature above 60 °C,
    /// and every reported error.
    pub fn health_score(&self) -> f64 {
        let mut score = 100.0;
        if let Some(cpu) = self.cpu_usage_percent.filter(|v| *v > 50.0) {
            score -= (cpu - 50.0) * 2.0;
        }
        if let Some(mem) = self.memory_usage_percent.filter(|v| *v > 50.0) {
            score -= (mem - 50.0) * 2.0;
        }
        if let Some(temp) = self.temperature_celsius.filter(|v| *v > 60.0) {
            score -= (temp - 60.0) * 5.0;
        }
        score -= self.error_count as f64 * 10.0;
        score.clamp(0.0, 100.0)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatView {
    #[serde(flatten)]
    pub heartbeat: Heartbeat,
    pub health_score: f64,
    pub is_healthy: bool,
}

impl From<Heartbeat> for HeartbeatView {
    fn from(heartbeat: Heartbeat) -> Self {
        HeartbeatView {
            health_score: heartbeat.health_score(),
            is_healthy: heartbeat.is_healthy(),
            heartbeat,
        }
    }
}

fn validate_report(report: &HeartbeatReport) -> ApiResult<()> {
    let percents = [
        ("cpu_usage_percent", report.cpu_usage_percent),
        ("memory_usage_percent", report.memory_usage_percent),
        ("storage_used_percent", report.storage_used_percent),
        ("packet_loss_percent", report.packet_loss_percent),
    ];
    for (field, value) in percents {
        if let Some(v) = value {
            if !(0.0..=100.0).contains(&v) {
                return Err(ApiError::BadRequest(format!("{field} must be within 0..=100")));
            }
        }
    }
    let non_negative = [
        ("bandwidth_mbps", report.bandwidth_mbps),
        ("latency_ms", report.latency_ms),
    ];
    for (field, value) in non_negative {
        if value.is_some_and(|v| v < 0.0 || !v.is_finite()) {
            return Err(ApiError::BadRequest(format!("{field} must be a non-negative number")));
        }
    }
    if report.error_count < 0 {
        return Err(ApiError::BadRequest("error_count must not be negative".into()));
    }
    Ok(())
}

// ─── Service ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IngestOutcome {
    /// False when this was a retransmission of an already stored heartbeat.
    pub stored: bool,
}

pub struct HeartbeatService {
    pool: SqlitePool,
    event_tx: broadcast::Sender<WsEvent>,
}

impl HeartbeatService {
    pub fn new(pool: SqlitePool, event_tx: broadcast::Sender<WsEvent>) -> Self {
        HeartbeatService { pool, event_tx }
    }

    /// Appends a heartbeat and refreshes the device's liveness. The caller has
    /// already checked that the token belongs to `device`.
    pub async fn ingest(&self, device: &Device, report: HeartbeatReport) -> ApiResult<IngestOutcome> {
        validate_report(&report)?;

        let received_at = Utc::now();
        let heartbeat = Heartbeat {
            device_id: device.id.clone(),
            time: report.time.unwrap_or(received_at),
            received_at,
            cpu_usage_percent: report.cpu_usage_percent,
            memory_usage_percent: report.memory_usage_percent,
            storage_used_percent: report.storage_used_percent,
            temperature_celsius: report.temperature_celsius,
            bandwidth_mbps: report.bandwidth_mbps,
            latency_ms: report.latency_ms,
            packet_loss_percent: report.packet_loss_percent,
            current_playlist_id: report.current_playlist_id.clone(),
            current_asset_id: report.current_asset_id.clone(),
            playback_position_sec: report.playback_position_sec,
            error_count: report.error_count,
            last_error: report.last_error.clone(),
        };

        let mut tx = self.pool.begin().await?;
        let stored = queries::insert_heartbeat(&mut tx, &heartbeat).await?;
        queries::touch_device_heartbeat(
            &mut tx,
            &device.id,
            received_at,
            report.firmware_version.as_deref(),
            report.client_version.as_deref(),
            report.network_info.as_ref(),
        )
        .await?;
        tx.commit().await?;

        if stored_status(device) == DeviceStatus::Pending {
            tracing::info!(device_id = %device.id, "First heartbeat, device is now active");
        }

        if stored {
            tracing::debug!(
                device_id = %device.id,
                time = %heartbeat.time,
                errors = heartbeat.error_count,
                "Heartbeat stored"
            );
            let _ = self.event_tx.send(WsEvent::HeartbeatReceived {
                organization_id: device.organization_id.clone(),
                device_id: device.id.clone(),
                health_score: heartbeat.health_score(),
                is_healthy: heartbeat.is_healthy(),
            });
        } else {
            tracing::debug!(device_id = %device.id, time = %heartbeat.time, "Duplicate heartbeat ignored");
        }

        Ok(IngestOutcome { stored })
    }

    /// Most recent heartbeats, newest first.
    pub async fn history(&self, device_id: &str, limit: Option<i64>) -> ApiResult<Vec<HeartbeatView>> {
        let limit = limit
            .unwrap_or(DEFAULT_HISTORY_LIMIT)
            .clamp(1, MAX_HISTORY_LIMIT);
        let rows = queries::list_heartbeats(&self.pool, device_id, limit).await?;
        Ok(rows.into_iter().map(HeartbeatView::from).collect())
    }
}

// ─── Status sweeper ──────────────────────────────────────────────────────────

/// Recomputes every device's projected status and broadcasts transitions
/// between online and offline. Nothing is written back.
pub struct StatusSweeper {
    pool: SqlitePool,
    event_tx: broadcast::Sender<WsEvent>,
    threshold: Duration,
    known: HashMap<String, bool>,
}

impl StatusSweeper {
    pub fn new(pool: SqlitePool, event_tx: broadcast::Sender<WsEvent>, threshold: Duration) -> Self {
        StatusSweeper {
            pool,
            event_tx,
            threshold,
            known: HashMap::new(),
        }
    }

    /// One pass. Returns how many transitions were broadcast.
    pub async fn sweep(&mut self, now: DateTime<Utc>) -> anyhow::Result<usize> {
        let rows = queries::list_device_liveness(&self.pool).await?;
        let mut seen = HashMap::with_capacity(rows.len());
        let mut transitions = 0;

        for row in rows {
            let stored = row.status.parse().unwrap_or(DeviceStatus::Pending);
            let online = match effective_status(stored, row.last_heartbeat, now, self.threshold) {
                DeviceStatus::Active => true,
                DeviceStatus::Offline => false,
                // Operator-held states aren't tracked.
                _ => continue,
            };

            if let Some(&was_online) = self.known.get(&row.id) {
                if was_online != online {
                    transitions += 1;
                    let event = if online {
                        tracing::info!(device_id = %row.id, "Device online");
                        WsEvent::DeviceOnline {
                            organization_id: row.organization_id.clone(),
                            device_id: row.id.clone(),
                        }
                    } else {
                        tracing::info!(device_id = %row.id, last_heartbeat = ?row.last_heartbeat, "Device offline");
                        WsEvent::DeviceOffline {
                            organization_id: row.organization_id.clone(),
                            device_id: row.id.clone(),
                            last_heartbeat: row.last_heartbeat,
                        }
                    };
                    let _ = self.event_tx.send(event);
                }
            }
            seen.insert(row.id, online);
        }

        self.known = seen;
        Ok(transitions)
    }

    pub fn spawn(mut self, every: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                if let Err(e) = self.sweep(Utc::now()).await {
                    tracing::warn!("Status sweep failed: {}", e);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const FIVE_MIN: Duration = Duration::from_secs(300);

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, 12, 0, 0).unwrap()
    }

    fn heartbeat() -> Heartbeat {
        Heartbeat {
            device_id: "d".into(),
            time: now(),
            received_at: now(),
            cpu_usage_percent: None,
            memory_usage_percent: None,
            storage_used_percent: None,
            temperature_celsius: None,
            bandwidth_mbps: None,
            latency_ms: None,
            packet_loss_percent: None,
            current_playlist_id: None,
            current_asset_id: None,
            playback_position_sec: None,
            error_count: 0,
            last_error: None,
        }
    }

    #[test]
    fn online_at_four_minutes_offline_at_six() {
        let four = now() - chrono::Duration::minutes(4);
        let six = now() - chrono::Duration::minutes(6);
        assert!(is_online(Some(four), now(), FIVE_MIN));
        assert!(!is_online(Some(six), now(), FIVE_MIN));
        assert!(!is_online(None, now(), FIVE_MIN));
    }

    #[test]
    fn threshold_is_exclusive() {
        let exactly = now() - chrono::Duration::minutes(5);
        assert!(!is_online(Some(exactly), now(), FIVE_MIN));
    }

    #[test]
    fn effective_status_respects_operator_states() {
        let fresh = Some(now());
        let stale = Some(now() - chrono::Duration::hours(1));
        assert_eq!(
            effective_status(DeviceStatus::Active, stale, now(), FIVE_MIN),
            DeviceStatus::Offline
        );
        assert_eq!(
            effective_status(DeviceStatus::Active, fresh, now(), FIVE_MIN),
            DeviceStatus::Active
        );
        assert_eq!(
            effective_status(DeviceStatus::Maintenance, fresh, now(), FIVE_MIN),
            DeviceStatus::Maintenance
        );
        assert_eq!(
            effective_status(DeviceStatus::Decommissioned, fresh, now(), FIVE_MIN),
            DeviceStatus::Decommissioned
        );
    }

    #[test]
    fn idle_device_scores_full_health() {
        let hb = heartbeat();
        assert!(hb.is_healthy());
        assert_eq!(hb.health_score(), 100.0);
    }

    #[test]
    fn health_score_penalties() {
        let mut hb = heartbeat();
        hb.cpu_usage_percent = Some(70.0); // -40
        hb.temperature_celsius = Some(64.0); // -20
        hb.error_count = 1; // -10
        assert_eq!(hb.health_score(), 30.0);
        assert!(!hb.is_healthy());

        hb.memory_usage_percent = Some(99.0);
        assert_eq!(hb.health_score(), 0.0);
    }

    #[test]
    fn out_of_range_metrics_are_rejected() {
        let report = HeartbeatReport {
            cpu_usage_percent: Some(140.0),
            ..Default::default()
        };
        assert!(matches!(validate_report(&report), Err(ApiError::BadRequest(_))));
        assert!(validate_report(&HeartbeatReport::default()).is_ok());
    }
}
