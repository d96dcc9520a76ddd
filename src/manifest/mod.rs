//! Content manifest store.
//!
//! Assets are identified by the SHA-256 of the original upload. The
//! processing pipeline registers finished outputs here; the sync core only
//! reads them when building a device's playlist.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::{types::Json, SqlitePool};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::db::{models::Asset, queries};
use crate::error::{ApiError, ApiResult};
use crate::protocol::{Artifact, AssetOutputs};
use crate::ws::WsEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Pending => "pending",
            ProcessingStatus::Processing => "processing",
            ProcessingStatus::Completed => "completed",
            ProcessingStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RegisterAsset {
    pub name: String,
    pub sha256: String,
    pub mime_type: String,
    pub file_size: i64,
    pub file_url: String,
    #[serde(default)]
    pub processing_status: Option<ProcessingStatus>,
    #[serde(default)]
    pub outputs: Option<AssetOutputs>,
}

pub fn is_sha256_hex(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

fn check_artifact(label: &str, a: &Artifact) -> ApiResult<()> {
    if a.url.trim().is_empty() {
        return Err(ApiError::BadRequest(format!("{label}.url must not be empty")));
    }
    if a.size < 0 {
        return Err(ApiError::BadRequest(format!("{label}.size must not be negative")));
    }
    if !is_sha256_hex(&a.sha256) {
        return Err(ApiError::BadRequest(format!("{label}.sha256 must be 64 hex characters")));
    }
    Ok(())
}

/// Every artifact in a manifest must carry a location, a size and a digest.
pub fn validate_outputs(outputs: &AssetOutputs) -> ApiResult<()> {
    let named = [
        ("optimized_model", &outputs.optimized_model),
        ("compressed_model", &outputs.compressed_model),
        ("video", &outputs.video),
        ("thumbnail", &outputs.thumbnail),
    ];
    for (label, artifact) in named {
        if let Some(a) = artifact {
            check_artifact(label, a)?;
        }
    }
    for (i, quilt) in outputs.quilts.iter().enumerate() {
        check_artifact(&format!("quilts[{i}]"), &quilt.artifact)?;
        if quilt.views == 0 || quilt.columns == 0 || quilt.rows == 0 {
            return Err(ApiError::BadRequest(format!(
                "quilts[{i}] needs non-zero views, columns and rows"
            )));
        }
    }
    Ok(())
}

/// Lowercases digests so lookups and cache keys agree.
fn normalize(mut outputs: AssetOutputs) -> AssetOutputs {
    for a in [
        &mut outputs.optimized_model,
        &mut outputs.compressed_model,
        &mut outputs.video,
        &mut outputs.thumbnail,
    ]
    .into_iter()
    .flatten()
    {
        a.sha256.make_ascii_lowercase();
    }
    for q in &mut outputs.quilts {
        q.artifact.sha256.make_ascii_lowercase();
    }
    outputs
}

pub struct ManifestService {
    pool: SqlitePool,
    event_tx: broadcast::Sender<WsEvent>,
}

impl ManifestService {
    pub fn new(pool: SqlitePool, event_tx: broadcast::Sender<WsEvent>) -> Self {
        ManifestService { pool, event_tx }
    }

    /// Registers an upload. An identical SHA-256 within the organization
    /// resolves to the existing asset; a newer processing status or manifest
    /// in the request is applied to it. Returns the asset and whether it was
    /// newly created.
    pub async fn register(&self, organization_id: &str, req: RegisterAsset) -> ApiResult<(Asset, bool)> {
        let sha256 = req.sha256.to_ascii_lowercase();
        if !is_sha256_hex(&sha256) {
            return Err(ApiError::BadRequest("sha256 must be 64 hex characters".into()));
        }
        if req.name.trim().is_empty() || req.file_url.trim().is_empty() {
            return Err(ApiError::BadRequest("name and file_url are required".into()));
        }
        if req.file_size < 0 {
            return Err(ApiError::BadRequest("file_size must not be negative".into()));
        }
        let outputs = match req.outputs {
            Some(o) => {
                validate_outputs(&o)?;
                Some(normalize(o))
            }
            None => None,
        };
        let status = match (req.processing_status, &outputs) {
            (Some(s), _) => s,
            (None, Some(_)) => ProcessingStatus::Completed,
            (None, None) => ProcessingStatus::Pending,
        };
        if status == ProcessingStatus::Completed && outputs.is_none() {
            return Err(ApiError::BadRequest("a completed asset needs an outputs manifest".into()));
        }

        if let Some(existing) = queries::get_asset_by_sha256(&self.pool, organization_id, &sha256).await? {
            return self.refresh(existing, req.processing_status, outputs).await;
        }

        let now = Utc::now();
        let asset = Asset {
            id: Uuid::new_v4().to_string(),
            organization_id: organization_id.to_string(),
            name: req.name,
            sha256,
            mime_type: req.mime_type,
            file_size: req.file_size,
            file_url: req.file_url,
            processing_status: status.as_str().to_string(),
            outputs: outputs.map(Json),
            created_at: now,
            updated_at: now,
        };

        if !queries::insert_asset(&self.pool, &asset).await? {
            // Concurrent upload of the same bytes; the other insert won.
            let existing = queries::get_asset_by_sha256(&self.pool, organization_id, &asset.sha256)
                .await?
                .ok_or_else(|| anyhow::anyhow!("asset {} vanished after conflict", asset.sha256))?;
            return Ok((existing, false));
        }

        tracing::info!(asset_id = %asset.id, sha256 = %asset.sha256, "Asset registered");
        let _ = self.event_tx.send(WsEvent::AssetRegistered {
            organization_id: asset.organization_id.clone(),
            asset_id: asset.id.clone(),
            sha256: asset.sha256.clone(),
            processing_status: asset.processing_status.clone(),
        });
        Ok((asset, true))
    }

    async fn refresh(
        &self,
        existing: Asset,
        status: Option<ProcessingStatus>,
        outputs: Option<AssetOutputs>,
    ) -> ApiResult<(Asset, bool)> {
        let status = match (status, &outputs) {
            (Some(s), _) => s,
            (None, Some(_)) => ProcessingStatus::Completed,
            (None, None) => {
                tracing::debug!(asset_id = %existing.id, "Duplicate upload resolved to existing asset");
                return Ok((existing, false));
            }
        };
        queries::update_asset_processing(&self.pool, &existing.id, status.as_str(), outputs.as_ref())
            .await?;
        tracing::info!(asset_id = %existing.id, status = status.as_str(), "Asset manifest updated");

        let asset = queries::get_asset(&self.pool, &existing.organization_id, &existing.id)
            .await?
            .ok_or(ApiError::NotFound("asset"))?;
        let _ = self.event_tx.send(WsEvent::AssetRegistered {
            organization_id: asset.organization_id.clone(),
            asset_id: asset.id.clone(),
            sha256: asset.sha256.clone(),
            processing_status: asset.processing_status.clone(),
        });
        Ok((asset, false))
    }

    pub async fn get(&self, organization_id: &str, id: &str) -> ApiResult<Asset> {
        queries::get_asset(&self.pool, organization_id, id)
            .await?
            .ok_or(ApiError::NotFound("asset"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::QuiltArtifact;

    fn artifact(sha: &str) -> Artifact {
        Artifact {
            url: "https://cdn.example/a".into(),
            size: 1024,
            sha256: sha.into(),
        }
    }

    #[test]
    fn sha256_shape() {
        assert!(is_sha256_hex(&"a".repeat(64)));
        assert!(!is_sha256_hex(&"a".repeat(63)));
        assert!(!is_sha256_hex(&"z".repeat(64)));
    }

    #[test]
    fn manifest_artifacts_need_digests() {
        let ok = AssetOutputs {
            optimized_model: Some(artifact(&"b".repeat(64))),
            ..Default::default()
        };
        assert!(validate_outputs(&ok).is_ok());

        let bad = AssetOutputs {
            video: Some(artifact("nope")),
            ..Default::default()
        };
        assert!(validate_outputs(&bad).is_err());

        let flat_quilt = AssetOutputs {
            quilts: vec![QuiltArtifact {
                artifact: artifact(&"c".repeat(64)),
                views: 0,
                columns: 8,
                rows: 6,
            }],
            ..Default::default()
        };
        assert!(validate_outputs(&flat_quilt).is_err());
    }

    #[test]
    fn digests_are_lowercased() {
        let outputs = normalize(AssetOutputs {
            thumbnail: Some(artifact(&"AB".repeat(32))),
            ..Default::default()
        });
        assert_eq!(outputs.thumbnail.unwrap().sha256, "ab".repeat(32));
    }
}
