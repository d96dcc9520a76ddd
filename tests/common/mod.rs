//! Shared helpers for the HTTP integration tests.

#![allow(dead_code)]

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

use holohub_sync::{build_router, config::ServerConfig, db, AppState};

pub const JWT_SECRET: &str = "integration-test-secret";
pub const ORG: &str = "org-acme";

/// Fresh in-memory database with migrations applied.
pub async fn test_state() -> Arc<AppState> {
    let pool = db::init_pool("sqlite::memory:").await.unwrap();
    let config = ServerConfig {
        database_url: "sqlite::memory:".into(),
        jwt_secret: JWT_SECRET.into(),
        ..ServerConfig::default()
    };
    Arc::new(AppState::new(pool, config))
}

pub struct TestApp {
    pub state: Arc<AppState>,
    pub router: Router,
}

impl TestApp {
    pub async fn new() -> Self {
        let state = test_state().await;
        let router = build_router(state.clone());
        TestApp { state, router }
    }

    /// Operator token for `ORG`.
    pub fn operator(&self) -> String {
        self.operator_for(ORG)
    }

    pub fn operator_for(&self, org: &str) -> String {
        self.state
            .tokens
            .issue_operator_token("user-1", org, chrono::Duration::hours(1))
            .unwrap()
    }

    pub async fn request(
        &self,
        method: &str,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let body = match body {
            Some(json) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let response = self
            .router
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }

    pub async fn get(&self, uri: &str, token: &str) -> (StatusCode, Value) {
        self.request("GET", uri, Some(token), None).await
    }

    pub async fn post(&self, uri: &str, token: &str, body: Value) -> (StatusCode, Value) {
        self.request("POST", uri, Some(token), Some(body)).await
    }

    pub async fn put(&self, uri: &str, token: &str, body: Value) -> (StatusCode, Value) {
        self.request("PUT", uri, Some(token), Some(body)).await
    }

    pub async fn patch(&self, uri: &str, token: &str, body: Value) -> (StatusCode, Value) {
        self.request("PATCH", uri, Some(token), Some(body)).await
    }

    pub async fn delete(&self, uri: &str, token: &str) -> (StatusCode, Value) {
        self.request("DELETE", uri, Some(token), None).await
    }

    /// Registers a device and returns `(device_id, hardware_id, secret)`.
    pub async fn register_device(&self, hardware_id: &str) -> (String, String, String) {
        let (status, body) = self
            .post(
                "/api/v1/devices",
                &self.operator(),
                json!({
                    "name": format!("Lobby {hardware_id}"),
                    "hardware_type": "looking_glass_portrait",
                    "hardware_id": hardware_id,
                }),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "{body}");
        (
            body["device"]["id"].as_str().unwrap().to_string(),
            hardware_id.to_string(),
            body["device_secret"].as_str().unwrap().to_string(),
        )
    }

    /// Device token via the public auth endpoint.
    pub async fn device_token(&self, hardware_id: &str, secret: &str) -> String {
        let (status, body) = self
            .request(
                "POST",
                "/api/v1/devices/auth",
                None,
                Some(json!({ "hardware_id": hardware_id, "device_secret": secret })),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        body["access_token"].as_str().unwrap().to_string()
    }

    /// Registered device plus a token for it: `(device_id, token)`.
    pub async fn authed_device(&self, hardware_id: &str) -> (String, String) {
        let (id, hw, secret) = self.register_device(hardware_id).await;
        let token = self.device_token(&hw, &secret).await;
        (id, token)
    }

    pub async fn register_asset(&self, name: &str, sha256: &str) -> String {
        let (status, body) = self
            .post(
                "/api/v1/assets",
                &self.operator(),
                json!({
                    "name": name,
                    "sha256": sha256,
                    "mime_type": "model/gltf-binary",
                    "file_size": 1024,
                    "file_url": format!("https://cdn.example.com/{sha256}"),
                }),
            )
            .await;
        assert!(status.is_success(), "{status}: {body}");
        body["id"].as_str().unwrap().to_string()
    }

    /// Playlist holding the given assets, returning its id.
    pub async fn create_playlist(&self, name: &str, asset_ids: &[&str]) -> String {
        let items: Vec<Value> = asset_ids
            .iter()
            .map(|id| json!({ "asset_id": id, "duration_seconds": 15 }))
            .collect();
        let (status, body) = self
            .post(
                "/api/v1/playlists",
                &self.operator(),
                json!({ "name": name, "items": items }),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "{body}");
        body["id"].as_str().unwrap().to_string()
    }

    pub async fn assign(&self, device_id: &str, playlist_id: &str, priority: i64) {
        let (status, body) = self
            .post(
                &format!("/api/v1/devices/{device_id}/assignments"),
                &self.operator(),
                json!({ "playlist_id": playlist_id, "priority": priority }),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "{body}");
    }
}

pub fn sha(seed: char) -> String {
    std::iter::repeat(seed).take(64).collect()
}
