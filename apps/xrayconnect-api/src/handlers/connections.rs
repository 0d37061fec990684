use axum::extract::rejection::{JsonRejection, PathRejection};
use axum::extract::{Path, State};
use axum::{Extension, Json};
use serde::Deserialize;
use serde_json::{Value, json};
use uuid::Uuid;
use xrayconnect_db::models::connection::Connection;

use super::CurrentUser;
use crate::error::ServiceError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateConnectionRequest {
    pub server_id: Uuid,
}

pub async fn create_connection(
    State(state): State<AppState>,
    Extension(CurrentUser(user_id)): Extension<CurrentUser>,
    payload: Result<Json<CreateConnectionRequest>, JsonRejection>,
) -> Result<Json<Connection>, ServiceError> {
    let Json(req) = payload.map_err(|e| ServiceError::Validation(e.body_text()))?;
    if req.server_id.is_nil() {
        return Err(ServiceError::Validation("server_id is required".into()));
    }

    let conn = state
        .connection_service
        .create_connection(user_id, req.server_id)
        .await?;
    Ok(Json(conn))
}

pub async fn list_connections(
    State(state): State<AppState>,
    Extension(CurrentUser(user_id)): Extension<CurrentUser>,
) -> Result<Json<Value>, ServiceError> {
    let connections = state.connection_service.get_user_connections(user_id).await?;
    Ok(Json(json!({ "connections": connections })))
}

pub async fn delete_connection(
    State(state): State<AppState>,
    Extension(CurrentUser(user_id)): Extension<CurrentUser>,
    id: Result<Path<Uuid>, PathRejection>,
) -> Result<Json<Value>, ServiceError> {
    let Path(connection_id) = id.map_err(|_| ServiceError::Validation("invalid connection id".into()))?;
    state
        .connection_service
        .delete_user_connection(user_id, connection_id)
        .await?;
    Ok(Json(json!({ "message": "Connection deleted" })))
}
