//! Per-device command queue with supersession and idempotent acknowledgment.

use chrono::Utc;
use serde::Serialize;
use sqlx::{types::Json, SqlitePool};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::db::{
    models::{Command, Device},
    queries,
};
use crate::error::{ApiError, ApiResult};
use crate::protocol::{CommandAck, CommandKind, DeviceCommand, PendingCommand};
use crate::ws::WsEvent;

type LockKey = (String, CommandKind);

/// One async mutex per (device, kind). Issue and acknowledge on the same key
/// run one at a time; different keys never contend.
#[derive(Default)]
pub struct CommandLocks {
    inner: Mutex<HashMap<LockKey, Arc<AsyncMutex<()>>>>,
}

impl CommandLocks {
    pub async fn acquire(&self, device_id: &str, kind: CommandKind) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            map.entry((device_id.to_string(), kind)).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Drops the entry if nobody else holds or waits on it.
    pub fn release_idle(&self, device_id: &str, kind: CommandKind) {
        let mut map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let key = (device_id.to_string(), kind);
        if map.get(&key).is_some_and(|m| Arc::strong_count(m) == 1) {
            map.remove(&key);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AckOutcome {
    Acknowledged,
    /// Repeat ack, or ack of a superseded command. Nothing changed.
    NoOp,
}

pub struct CommandDispatcher {
    pool: SqlitePool,
    event_tx: broadcast::Sender<WsEvent>,
    locks: Arc<CommandLocks>,
}

impl CommandDispatcher {
    pub fn new(
        pool: SqlitePool,
        event_tx: broadcast::Sender<WsEvent>,
        locks: Arc<CommandLocks>,
    ) -> Self {
        CommandDispatcher {
            pool,
            event_tx,
            locks,
        }
    }

    /// Queues a command, superseding any pending one of the same kind.
    pub async fn issue(&self, device: &Device, command: DeviceCommand) -> ApiResult<String> {
        let kind = command.kind();
        let row = Command {
            id: Uuid::new_v4().to_string(),
            device_id: device.id.clone(),
            kind: kind.as_str().to_string(),
            params: Json(command.params()),
            status: "pending".into(),
            issued_at: Utc::now(),
            acknowledged_at: None,
            result: None,
        };

        let guard = self.locks.acquire(&device.id, kind).await;
        let superseded = {
            let mut tx = self.pool.begin().await?;
            let superseded =
                queries::supersede_pending_commands(&mut tx, &device.id, kind.as_str()).await?;
            queries::insert_command(&mut tx, &row).await?;
            tx.commit().await?;
            superseded
        };
        drop(guard);
        self.locks.release_idle(&device.id, kind);

        for old in &superseded {
            tracing::info!(
                device_id = %device.id,
                kind = %kind,
                superseded = %old,
                by = %row.id,
                "Pending command superseded"
            );
            let _ = self.event_tx.send(WsEvent::CommandSuperseded {
                organization_id: device.organization_id.clone(),
                device_id: device.id.clone(),
                command_id: old.clone(),
                superseded_by: row.id.clone(),
            });
        }

        tracing::info!(device_id = %device.id, kind = %kind, command_id = %row.id, "Command issued");
        let _ = self.event_tx.send(WsEvent::CommandIssued {
            organization_id: device.organization_id.clone(),
            device_id: device.id.clone(),
            command_id: row.id.clone(),
            kind,
        });

        Ok(row.id)
    }

    /// Pending commands, oldest first.
    pub async fn poll(&self, device_id: &str) -> ApiResult<Vec<PendingCommand>> {
        let rows = queries::list_pending_commands(&self.pool, device_id).await?;
        let mut pending = Vec::with_capacity(rows.len());
        for row in rows {
            let kind: CommandKind = row
                .kind
                .parse()
                .map_err(|e| anyhow::anyhow!("command {} has {}", row.id, e))?;
            pending.push(PendingCommand {
                command_id: row.id,
                kind,
                params: row.params.0,
                issued_at: row.issued_at,
            });
        }
        Ok(pending)
    }

    /// Terminal acknowledgment. Safe to repeat; acknowledging a superseded
    /// command never touches the command that replaced it.
    pub async fn acknowledge(
        &self,
        device: &Device,
        command_id: &str,
        ack: CommandAck,
    ) -> ApiResult<AckOutcome> {
        let command = queries::get_command(&self.pool, &device.id, command_id)
            .await?
            .ok_or(ApiError::NotFound("command"))?;

        if command.status != "pending" {
            tracing::debug!(
                device_id = %device.id,
                command_id,
                status = %command.status,
                "Ack for non-pending command ignored"
            );
            return Ok(AckOutcome::NoOp);
        }

        let kind: CommandKind = command
            .kind
            .parse()
            .map_err(|e| anyhow::anyhow!("command {} has {}", command.id, e))?;
        let result = serde_json::to_value(&ack).map_err(anyhow::Error::from)?;

        let guard = self.locks.acquire(&device.id, kind).await;
        let updated = {
            let mut tx = self.pool.begin().await?;
            let updated =
                queries::acknowledge_command(&mut tx, &device.id, command_id, &result, Utc::now())
                    .await?;
            tx.commit().await?;
            updated
        };
        drop(guard);
        self.locks.release_idle(&device.id, kind);

        if !updated {
            // Lost a race with a supersession or a concurrent ack.
            return Ok(AckOutcome::NoOp);
        }

        tracing::info!(
            device_id = %device.id,
            command_id,
            kind = %kind,
            success = ack.success,
            "Command acknowledged"
        );
        let _ = self.event_tx.send(WsEvent::CommandAcknowledged {
            organization_id: device.organization_id.clone(),
            device_id: device.id.clone(),
            command_id: command_id.to_string(),
            success: ack.success,
        });
        Ok(AckOutcome::Acknowledged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn locks_are_dropped_when_idle() {
        let locks = CommandLocks::default();
        let guard = locks.acquire("dev", CommandKind::Restart).await;
        locks.release_idle("dev", CommandKind::Restart);
        assert_eq!(locks.len(), 1, "held lock must survive release_idle");
        drop(guard);
        locks.release_idle("dev", CommandKind::Restart);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn same_key_serializes() {
        let locks = Arc::new(CommandLocks::default());
        let first = locks.acquire("dev", CommandKind::ClearCache).await;

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _g = locks.acquire("dev", CommandKind::ClearCache).await;
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        // A different kind on the same device is independent.
        let _other = locks.acquire("dev", CommandKind::Restart).await;

        drop(first);
        waiter.await.unwrap();
    }
}
