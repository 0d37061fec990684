pub mod config;
pub mod error;
pub mod handlers;
pub mod services;
pub mod state;

use axum::Router;
use axum::middleware;
use axum::routing::{delete, get};
use tower_http::trace::TraceLayer;

pub use error::ServiceError;
pub use services::connection_service::ConnectionService;
pub use state::AppState;

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route(
            "/connections",
            get(handlers::connections::list_connections).post(handlers::connections::create_connection),
        )
        .route("/connections/{id}", delete(handlers::connections::delete_connection))
        .layer(middleware::from_fn(handlers::require_user));

    Router::new()
        .route("/health", get(handlers::health::health))
        .nest("/api", api)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
