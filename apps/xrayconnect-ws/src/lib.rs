pub mod config;
pub mod forwarder;
pub mod hub;
pub mod socket;

use axum::Router;
use axum::routing::get;
use serde_json::{Value, json};
use tower_http::trace::TraceLayer;

pub use forwarder::NotificationForwarder;
pub use hub::{HubHandle, spawn as spawn_hub};

pub fn router(hub: HubHandle) -> Router {
    Router::new()
        .route("/health", get(|| async { axum::Json::<Value>(json!({ "status": "ok" })) }))
        .route("/ws", get(socket::ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(hub)
}
