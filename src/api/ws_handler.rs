use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{header, HeaderMap},
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::api::auth::OperatorAuth;
use crate::error::{ApiError, ApiResult};
use crate::ws::WsEvent;
use crate::AppState;

#[derive(Deserialize)]
pub struct WsParams {
    /// Browsers can't set headers on a WebSocket upgrade, so the operator
    /// token may also come as `?token=`.
    pub token: Option<String>,
}

/// GET /ws: upgrade to WebSocket and stream fleet events for the operator's organization
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<WsParams>,
) -> ApiResult<impl IntoResponse> {
    let header_token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string);
    let token = header_token
        .or(params.token)
        .ok_or(ApiError::Unauthenticated)?;
    let operator = OperatorAuth::from_token(&state, &token)?;
    let organization_id = operator.organization_id().to_string();

    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, organization_id)))
}

/// JSON for `event` if it belongs to `organization_id`.
fn frame_for(event: &WsEvent, organization_id: &str) -> Option<String> {
    if event.organization_id() != organization_id {
        return None;
    }
    serde_json::to_string(event).ok()
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, organization_id: String) {
    let (mut sender, mut receiver) = socket.split();
    let mut event_rx = state.event_tx.subscribe();
    tracing::debug!(organization_id = %organization_id, "Operator WebSocket connected");

    loop {
        tokio::select! {
            event = event_rx.recv() => match event {
                Ok(event) => {
                    let Some(text) = frame_for(&event, &organization_id) else {
                        continue;
                    };
                    if sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::debug!("WebSocket client lagged, {} events dropped", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Ping(data))) => {
                    if sender.send(Message::Pong(data)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    tracing::debug!(organization_id = %organization_id, "Operator WebSocket disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_are_scoped_to_the_organization() {
        let event = WsEvent::DeviceOnline {
            organization_id: "org-a".into(),
            device_id: "dev-1".into(),
        };
        let frame = frame_for(&event, "org-a").unwrap();
        let json: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(json["type"], "device_online");
        assert_eq!(json["device_id"], "dev-1");
        assert!(frame_for(&event, "org-b").is_none());
    }
}
