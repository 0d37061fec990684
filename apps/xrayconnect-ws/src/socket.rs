use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::hub::HubHandle;

pub const USER_ID_HEADER: &str = "x-user-id";

pub async fn ws_handler(ws: WebSocketUpgrade, State(hub): State<HubHandle>, headers: HeaderMap) -> Response {
    let Some(user_id) = user_from_headers(&headers) else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    ws.on_upgrade(move |socket| handle_socket(socket, hub, user_id))
}

pub fn user_from_headers(headers: &HeaderMap) -> Option<Uuid> {
    headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| Uuid::parse_str(v.trim()).ok())
        .filter(|id| !id.is_nil())
}

async fn handle_socket(socket: WebSocket, hub: HubHandle, user_id: Uuid) {
    let (client_id, mut outbound) = match hub.register(user_id).await {
        Ok(registered) => registered,
        Err(e) => {
            warn!(user_id = %user_id, "Rejecting socket: {}", e);
            return;
        }
    };
    let (mut sender, mut receiver) = socket.split();

    let send_task = tokio::spawn(async move {
        while let Some(msg) = outbound.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(json) => json,
                Err(e) => {
                    warn!("Failed to encode notification: {}", e);
                    continue;
                }
            };
            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    // Clients only listen; inbound frames are drained to notice the close.
    while let Some(frame) = receiver.next().await {
        match frame {
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(client_id, "WebSocket error: {}", e);
                break;
            }
        }
    }

    hub.unregister(client_id).await;
    send_task.abort();
    info!(client_id, user_id = %user_id, "WebSocket connection closed");
}
