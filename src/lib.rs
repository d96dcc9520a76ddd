//! Fleet synchronization core for holographic display devices: device
//! registry, heartbeats, playlist resolution, command dispatch, and the
//! device-side agent.

pub mod agent;
pub mod api;
pub mod commands;
pub mod config;
pub mod db;
pub mod error;
pub mod heartbeat;
pub mod manifest;
pub mod playlists;
pub mod protocol;
pub mod registry;
pub mod schedule;
pub mod ws;

use axum::{
    routing::{delete, get, post, put},
    Router,
};
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::sync::broadcast;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::commands::CommandLocks;
use crate::config::ServerConfig;
use crate::registry::credentials::TokenIssuer;
use crate::ws::WsEvent;

// ─── App State ───────────────────────────────────────────────────────────────

pub struct AppState {
    pub pool: SqlitePool,
    pub event_tx: broadcast::Sender<WsEvent>,
    pub config: ServerConfig,
    pub tokens: TokenIssuer,
    pub command_locks: Arc<CommandLocks>,
}

impl AppState {
    pub fn new(pool: SqlitePool, config: ServerConfig) -> Self {
        let (event_tx, _) = broadcast::channel::<WsEvent>(256);
        let tokens = TokenIssuer::new(&config.jwt_secret, config.device_token_ttl_days);
        AppState {
            pool,
            event_tx,
            config,
            tokens,
            command_locks: Arc::new(CommandLocks::default()),
        }
    }
}

// ─── Router ──────────────────────────────────────────────────────────────────

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let v1 = Router::new()
        // Device-facing
        .route("/devices/auth", post(api::devices::authenticate))
        .route("/devices/:id/heartbeat", post(api::heartbeat::ingest))
        .route("/devices/:id/playlists", get(api::playlists::device_playlist))
        .route("/devices/:id/commands", get(api::commands::poll_commands))
        .route("/devices/:id/commands/:cmd_id/ack", post(api::commands::ack_command))
        // Operator-facing devices
        .route(
            "/devices",
            get(api::devices::list_devices).post(api::devices::register_device),
        )
        .route(
            "/devices/:id",
            get(api::devices::get_device).patch(api::devices::update_device),
        )
        .route("/devices/:id/heartbeats", get(api::heartbeat::history))
        .route("/devices/:id/command", post(api::commands::issue_command))
        .route(
            "/devices/:id/assignments",
            get(api::playlists::list_assignments).post(api::playlists::assign_playlist),
        )
        .route(
            "/devices/:id/assignments/:playlist_id",
            delete(api::playlists::unassign_playlist),
        )
        // Playlists
        .route("/playlists", post(api::playlists::create_playlist))
        .route("/playlists/:id", get(api::playlists::get_playlist))
        .route("/playlists/:id/items", put(api::playlists::replace_items))
        // Content manifest
        .route("/assets", post(api::assets::register_asset))
        .route("/assets/:id", get(api::assets::get_asset));

    Router::new()
        .route("/health", get(api::health))
        .route("/ws", get(api::ws_handler::ws_handler))
        .nest("/api/v1", v1)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
