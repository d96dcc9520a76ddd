//! HTTP integration tests for the fleet API.
//!
//! Each test builds the router over a fresh in-memory SQLite database and
//! drives it with `tower::ServiceExt::oneshot`; no listener is started.

mod common;

use axum::http::StatusCode;
use serde_json::json;

use common::{sha, TestApp, ORG};

// ─── Health and auth ─────────────────────────────────────────────────────────

#[tokio::test]
async fn health_needs_no_token() {
    let app = TestApp::new().await;
    let (status, body) = app.request("GET", "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn operator_routes_reject_missing_and_device_tokens() {
    let app = TestApp::new().await;
    let (status, body) = app.request("GET", "/api/v1/devices", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "unauthenticated");

    let (_, device_token) = app.authed_device("LKG-OPS").await;
    let (status, body) = app.get("/api/v1/devices", &device_token).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "forbidden");
}

#[tokio::test]
async fn register_then_authenticate() {
    let app = TestApp::new().await;
    let (device_id, hw, secret) = app.register_device("LKG-0001").await;

    let (status, body) = app
        .request(
            "POST",
            "/api/v1/devices/auth",
            None,
            Some(json!({ "hardware_id": hw, "device_secret": secret })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["device_id"], device_id.as_str());
    assert_eq!(body["organization_id"], ORG);
    assert_eq!(body["token_type"], "bearer");
    assert_eq!(body["expires_in"], 30 * 24 * 3600);
}

#[tokio::test]
async fn duplicate_hardware_id_in_org_conflicts() {
    let app = TestApp::new().await;
    app.register_device("LKG-DUP").await;
    let (status, body) = app
        .post(
            "/api/v1/devices",
            &app.operator(),
            json!({ "name": "again", "hardware_type": "looking_glass_16", "hardware_id": "LKG-DUP" }),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "conflict");
}

#[tokio::test]
async fn wrong_secret_is_invalid_credentials() {
    let app = TestApp::new().await;
    let (_, hw, _) = app.register_device("LKG-0002").await;
    let (status, body) = app
        .request(
            "POST",
            "/api/v1/devices/auth",
            None,
            Some(json!({ "hardware_id": hw, "device_secret": "wrong" })),
        )
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "invalid_credentials");

    let (status, _) = app
        .request(
            "POST",
            "/api/v1/devices/auth",
            None,
            Some(json!({ "hardware_id": "never-registered", "device_secret": "x" })),
        )
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn decommissioned_device_is_locked_out() {
    let app = TestApp::new().await;
    let (device_id, hw, secret) = app.register_device("LKG-0003").await;
    let token = app.device_token(&hw, &secret).await;

    let (status, body) = app
        .patch(
            &format!("/api/v1/devices/{device_id}"),
            &app.operator(),
            json!({ "status": "decommissioned" }),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["status"], "decommissioned");

    let (status, body) = app
        .request(
            "POST",
            "/api/v1/devices/auth",
            None,
            Some(json!({ "hardware_id": hw, "device_secret": secret })),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "device_decommissioned");

    // Tokens issued earlier stop working too.
    let (status, body) = app
        .post(
            &format!("/api/v1/devices/{device_id}/heartbeat"),
            &token,
            json!({}),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "device_decommissioned");

    // And there is no way back.
    let (status, _) = app
        .patch(
            &format!("/api/v1/devices/{device_id}"),
            &app.operator(),
            json!({ "status": "active" }),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn device_token_only_works_on_its_own_path() {
    let app = TestApp::new().await;
    let (_, token_a) = app.authed_device("LKG-A").await;
    let (device_b, _) = app.authed_device("LKG-B").await;

    let (status, _) = app
        .post(&format!("/api/v1/devices/{device_b}/heartbeat"), &token_a, json!({}))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn operators_only_see_their_organization() {
    let app = TestApp::new().await;
    let (device_id, _, _) = app.register_device("LKG-ORG").await;
    let other = app.operator_for("org-other");

    let (status, body) = app.get(&format!("/api/v1/devices/{device_id}"), &other).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "not_found");

    let (status, body) = app.get("/api/v1/devices", &other).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["devices"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn operator_patch_rejects_derived_status_and_unknown_fields() {
    let app = TestApp::new().await;
    let (device_id, _, _) = app.register_device("LKG-PATCH").await;
    let uri = format!("/api/v1/devices/{device_id}");

    let (status, _) = app.patch(&uri, &app.operator(), json!({ "status": "offline" })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = app.patch(&uri, &app.operator(), json!({ "secret_hash": "x" })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = app
        .patch(
            &uri,
            &app.operator(),
            json!({ "display_config": { "timezone": "Europe/Berlin" }, "tags": ["lobby"] }),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["display_config"]["timezone"], "Europe/Berlin");
    assert_eq!(body["tags"], json!(["lobby"]));

    let (status, _) = app
        .patch(&uri, &app.operator(), json!({ "display_config": { "timezone": "Mars/Olympus" } }))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

// ─── Heartbeats ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn first_heartbeat_activates_device() {
    let app = TestApp::new().await;
    let (device_id, token) = app.authed_device("LKG-HB1").await;
    let uri = format!("/api/v1/devices/{device_id}");

    let (_, body) = app.get(&uri, &app.operator()).await;
    assert_eq!(body["status"], "pending");
    assert_eq!(body["is_online"], false);

    let (status, body) = app
        .post(
            &format!("{uri}/heartbeat"),
            &token,
            json!({
                "cpu_usage_percent": 35.5,
                "firmware_version": "2.1.0",
                "network_info": { "ip": "10.0.0.7", "hostname": "lobby" }
            }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({}));

    let (_, body) = app.get(&uri, &app.operator()).await;
    assert_eq!(body["status"], "active");
    assert_eq!(body["is_online"], true);
    assert_eq!(body["firmware_version"], "2.1.0");
    assert_eq!(body["network_info"]["ip"], "10.0.0.7");
}

#[tokio::test]
async fn retransmitted_heartbeat_is_stored_once() {
    let app = TestApp::new().await;
    let (device_id, token) = app.authed_device("LKG-HB2").await;
    let report = json!({ "time": "2026-10-19T08:00:00.123Z", "memory_usage_percent": 40.0 });

    for _ in 0..2 {
        let (status, _) = app
            .post(&format!("/api/v1/devices/{device_id}/heartbeat"), &token, report.clone())
            .await;
        assert_eq!(status, StatusCode::OK);
    }

    let (status, body) = app
        .get(&format!("/api/v1/devices/{device_id}/heartbeats"), &app.operator())
        .await;
    assert_eq!(status, StatusCode::OK);
    let rows = body["heartbeats"].as_array().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["memory_usage_percent"], 40.0);
    assert_eq!(rows[0]["is_healthy"], true);
}

#[tokio::test]
async fn heartbeat_with_impossible_metrics_is_rejected() {
    let app = TestApp::new().await;
    let (device_id, token) = app.authed_device("LKG-HB3").await;
    let (status, body) = app
        .post(
            &format!("/api/v1/devices/{device_id}/heartbeat"),
            &token,
            json!({ "cpu_usage_percent": 250.0 }),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "bad_request");
}

// ─── Playlists ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn no_assignment_means_no_content() {
    let app = TestApp::new().await;
    let (device_id, token) = app.authed_device("LKG-PL0").await;
    let (status, body) = app
        .get(&format!("/api/v1/devices/{device_id}/playlists"), &token)
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(body, serde_json::Value::Null);
}

#[tokio::test]
async fn highest_priority_assignment_wins() {
    let app = TestApp::new().await;
    let (device_id, token) = app.authed_device("LKG-PL1").await;
    let asset = app.register_asset("dragon.glb", &sha('a')).await;
    let low = app.create_playlist("Morning", &[&asset]).await;
    let high = app.create_playlist("Launch event", &[&asset, &asset]).await;
    app.assign(&device_id, &low, 1).await;
    app.assign(&device_id, &high, 5).await;

    let (status, body) = app
        .get(&format!("/api/v1/devices/{device_id}/playlists"), &token)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], high.as_str());
    assert_eq!(body["name"], "Launch event");
    let items = body["items"].as_array().unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0]["position"], 0);
    assert_eq!(items[1]["position"], 1);
    assert_eq!(items[0]["source"]["sha256"], sha('a').as_str());
    assert_eq!(items[0]["duration_seconds"], 15);

    let (_, device) = app
        .get(&format!("/api/v1/devices/{device_id}"), &app.operator())
        .await;
    assert_eq!(device["current_playlist_id"], high.as_str());
}

#[tokio::test]
async fn unassigning_falls_back_to_remaining_playlist() {
    let app = TestApp::new().await;
    let (device_id, token) = app.authed_device("LKG-PL2").await;
    let asset = app.register_asset("whale.glb", &sha('b')).await;
    let low = app.create_playlist("Default", &[&asset]).await;
    let high = app.create_playlist("Promo", &[&asset]).await;
    app.assign(&device_id, &low, 1).await;
    app.assign(&device_id, &high, 9).await;

    let (status, _) = app
        .delete(
            &format!("/api/v1/devices/{device_id}/assignments/{high}"),
            &app.operator(),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = app
        .get(&format!("/api/v1/devices/{device_id}/playlists"), &token)
        .await;
    assert_eq!(body["id"], low.as_str());

    let (status, _) = app
        .delete(
            &format!("/api/v1/devices/{device_id}/assignments/{high}"),
            &app.operator(),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn playlist_items_must_reference_own_assets() {
    let app = TestApp::new().await;
    let (status, body) = app
        .post(
            "/api/v1/playlists",
            &app.operator(),
            json!({
                "name": "Broken",
                "items": [{ "asset_id": "no-such-asset", "duration_seconds": 10 }]
            }),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");

    // Another organization's asset is just as unknown.
    let (status, body) = app
        .post(
            "/api/v1/assets",
            &app.operator_for("org-other"),
            json!({ "name": "theirs.glb", "sha256": sha('e'), "file_url": "s3://other/theirs.glb", "file_size": 10, "mime_type": "model/gltf-binary" }),
        )
        .await;
    assert!(status.is_success(), "{body}");
    let foreign = body["id"].as_str().unwrap().to_string();
    let (status, _) = app
        .post(
            "/api/v1/playlists",
            &app.operator(),
            json!({
                "name": "Broken",
                "items": [{ "asset_id": foreign, "duration_seconds": 10 }]
            }),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Neither attempt left a half-created playlist behind.
    let created: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM playlists WHERE name = 'Broken'")
        .fetch_one(&app.state.pool)
        .await
        .unwrap();
    assert_eq!(created, 0);
}

#[tokio::test]
async fn replacing_items_renumbers_positions() {
    let app = TestApp::new().await;
    let a = app.register_asset("a.glb", &sha('c')).await;
    let b = app.register_asset("b.glb", &sha('d')).await;
    let playlist = app.create_playlist("Rotation", &[&a]).await;

    let (status, body) = app
        .put(
            &format!("/api/v1/playlists/{playlist}/items"),
            &app.operator(),
            json!([
                { "asset_id": b, "duration_seconds": 5 },
                { "asset_id": a, "duration_seconds": 7, "transition_override": "cut" }
            ]),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let items = body["items"].as_array().unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0]["asset_id"], b.as_str());
    assert_eq!(items[0]["position"], 0);
    assert_eq!(items[1]["position"], 1);
}

// ─── Commands ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn newer_command_of_same_kind_supersedes_older() {
    let app = TestApp::new().await;
    let (device_id, token) = app.authed_device("LKG-CMD1").await;
    let issue_uri = format!("/api/v1/devices/{device_id}/command");

    let (status, first) = app
        .post(&issue_uri, &app.operator(), json!({ "kind": "restart" }))
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let (_, second) = app
        .post(&issue_uri, &app.operator(), json!({ "kind": "restart" }))
        .await;
    let (_, other_kind) = app
        .post(&issue_uri, &app.operator(), json!({ "kind": "clear_cache" }))
        .await;

    let (status, body) = app
        .get(&format!("/api/v1/devices/{device_id}/commands"), &token)
        .await;
    assert_eq!(status, StatusCode::OK);
    let ids: Vec<&str> = body
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["command_id"].as_str().unwrap())
        .collect();
    assert_eq!(
        ids,
        vec![
            second["command_id"].as_str().unwrap(),
            other_kind["command_id"].as_str().unwrap()
        ]
    );
    assert!(!ids.contains(&first["command_id"].as_str().unwrap()));
}

#[tokio::test]
async fn acknowledging_twice_is_a_no_op() {
    let app = TestApp::new().await;
    let (device_id, token) = app.authed_device("LKG-CMD2").await;
    let (_, issued) = app
        .post(
            &format!("/api/v1/devices/{device_id}/command"),
            &app.operator(),
            json!({ "kind": "screenshot" }),
        )
        .await;
    let command_id = issued["command_id"].as_str().unwrap();
    let ack_uri = format!("/api/v1/devices/{device_id}/commands/{command_id}/ack");

    let (status, body) = app
        .post(&ack_uri, &token, json!({ "success": true, "message": "done" }))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({}));

    let (status, body) = app
        .post(&ack_uri, &token, json!({ "success": false, "message": "late" }))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({}));

    let (_, pending) = app
        .get(&format!("/api/v1/devices/{device_id}/commands"), &token)
        .await;
    assert_eq!(pending, json!([]));
}

#[tokio::test]
async fn acknowledging_a_foreign_command_is_not_found() {
    let app = TestApp::new().await;
    let (device_a, _) = app.authed_device("LKG-CMD3").await;
    let (device_b, token_b) = app.authed_device("LKG-CMD4").await;
    let (_, issued) = app
        .post(
            &format!("/api/v1/devices/{device_a}/command"),
            &app.operator(),
            json!({ "kind": "restart" }),
        )
        .await;
    let command_id = issued["command_id"].as_str().unwrap();

    let (status, _) = app
        .post(
            &format!("/api/v1/devices/{device_b}/commands/{command_id}/ack"),
            &token_b,
            json!({ "success": true }),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn malformed_commands_are_rejected() {
    let app = TestApp::new().await;
    let (device_id, _, _) = app.register_device("LKG-CMD5").await;
    let uri = format!("/api/v1/devices/{device_id}/command");

    let (status, _) = app.post(&uri, &app.operator(), json!({ "kind": "self_destruct" })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = app
        .post(&uri, &app.operator(), json!({ "kind": "update_playlist", "params": {} }))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = app
        .post(
            &uri,
            &app.operator(),
            json!({ "kind": "update_playlist", "params": { "playlist_id": "missing" } }),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// ─── Assets ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn same_content_registers_once_per_organization() {
    let app = TestApp::new().await;
    let body = json!({
        "name": "phoenix.glb",
        "sha256": sha('e').to_uppercase(),
        "mime_type": "model/gltf-binary",
        "file_size": 2048,
        "file_url": "https://cdn.example.com/phoenix.glb",
    });

    let (status, first) = app.post("/api/v1/assets", &app.operator(), body.clone()).await;
    assert_eq!(status, StatusCode::CREATED, "{first}");
    assert_eq!(first["sha256"], sha('e').as_str());

    let (status, second) = app.post("/api/v1/assets", &app.operator(), body.clone()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["id"], first["id"]);

    let (status, _) = app
        .post("/api/v1/assets", &app.operator_for("org-other"), body)
        .await;
    assert_eq!(status, StatusCode::CREATED);
}

#[tokio::test]
async fn asset_with_bad_digest_is_rejected() {
    let app = TestApp::new().await;
    let (status, body) = app
        .post(
            "/api/v1/assets",
            &app.operator(),
            json!({
                "name": "x.glb",
                "sha256": "not-a-digest",
                "mime_type": "model/gltf-binary",
                "file_size": 1,
                "file_url": "https://cdn.example.com/x.glb",
            }),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "bad_request");
}
