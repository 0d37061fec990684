use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::server::{Server, XrayPanel};

#[derive(Debug, Clone)]
pub struct ServerRepository {
    pool: PgPool,
}

impl ServerRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get_server_by_id(&self, id: Uuid) -> Result<Option<Server>> {
        sqlx::query_as::<_, Server>("SELECT * FROM servers WHERE id = $1 AND deleted_at IS NULL")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch server by ID")
    }

    pub async fn get_servers_by_ids(&self, ids: &[Uuid]) -> Result<Vec<Server>> {
        sqlx::query_as::<_, Server>("SELECT * FROM servers WHERE id = ANY($1)")
            .bind(ids)
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch servers")
    }

    pub async fn get_panel_by_id(&self, id: Uuid) -> Result<Option<XrayPanel>> {
        sqlx::query_as::<_, XrayPanel>("SELECT * FROM xray_panels WHERE id = $1 AND deleted_at IS NULL")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch xray panel by ID")
    }
}
