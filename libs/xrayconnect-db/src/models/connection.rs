use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::server::Server;

/// A user's access to one server. `xray_client_id == 0` means the panel has
/// never confirmed the client, so the row is pending whatever else it holds.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Connection {
    pub id: Uuid,
    pub user_id: Uuid,
    pub server_id: Uuid,
    pub xray_inbound_id: i32,
    pub xray_client_id: i32,
    pub connection_key: String,
    pub subscription_link: String,
    pub is_active: bool,
    pub traffic_used: i64,  // bytes
    pub traffic_limit: i64, // bytes, 0 = unlimited
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip)]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Connection {
    pub fn is_provisioned(&self) -> bool {
        self.xray_client_id != 0
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Identifier of this connection's client entry on the panel inbound.
    pub fn panel_email(&self) -> String {
        format!("user_{}_{}", self.user_id, self.id)
    }

    pub fn over_traffic_limit(&self) -> bool {
        self.traffic_limit > 0 && self.traffic_used >= self.traffic_limit
    }
}

#[derive(Debug, Clone)]
pub struct NewConnection {
    pub user_id: Uuid,
    pub server_id: Uuid,
    pub traffic_limit: i64,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Values written back once the panel has accepted the client.
#[derive(Debug, Clone, PartialEq)]
pub struct ProvisionedClient {
    pub inbound_id: i32,
    pub client_id: i32,
    pub connection_key: String,
    pub subscription_link: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionWithServer {
    #[serde(flatten)]
    pub connection: Connection,
    pub server: Server,
}
