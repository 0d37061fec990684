use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Server {
    pub id: Uuid,
    pub name: String,
    pub country: String,
    pub flag: String,
    pub protocol: String, // vless, vmess, trojan
    pub status: String,   // online, maintenance, crowded
    pub host: Option<String>,
    pub port: i32,
    pub xray_panel_id: Option<Uuid>,
    pub inbound_id: i32, // 0 = use the panel's default
    pub max_connections: i32,
    pub current_load: i32,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Credentials and endpoint of one 3x-ui control panel.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct XrayPanel {
    pub id: Uuid,
    pub name: String,
    pub panel_type: String,
    pub url: String,
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub inbound_id: i32,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
