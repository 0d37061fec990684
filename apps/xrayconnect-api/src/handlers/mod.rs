pub mod connections;
pub mod health;

use axum::extract::Request;
use axum::middleware::Next;
use axum::response::Response;
use uuid::Uuid;

use crate::error::ServiceError;

pub const USER_ID_HEADER: &str = "x-user-id";

/// Identity resolved by the upstream gateway.
#[derive(Debug, Clone, Copy)]
pub struct CurrentUser(pub Uuid);

pub async fn require_user(mut req: Request, next: Next) -> Result<Response, ServiceError> {
    let user_id = req
        .headers()
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| Uuid::parse_str(v.trim()).ok())
        .filter(|id| !id.is_nil())
        .ok_or(ServiceError::Unauthorized)?;

    req.extensions_mut().insert(CurrentUser(user_id));
    Ok(next.run(req).await)
}
