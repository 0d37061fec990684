use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::connection::{Connection, NewConnection, ProvisionedClient};

#[derive(Debug, Clone)]
pub struct ConnectionRepository {
    pool: PgPool,
}

impl ConnectionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn find_active(&self, user_id: Uuid, server_id: Uuid) -> Result<Option<Connection>> {
        sqlx::query_as::<_, Connection>(
            "SELECT * FROM connections WHERE user_id = $1 AND server_id = $2 AND is_active = TRUE AND deleted_at IS NULL",
        )
        .bind(user_id)
        .bind(server_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to look up active connection")
    }

    /// Inserts unless a live row for the pair exists. `None` means the
    /// partial unique index rejected the row.
    pub async fn insert_if_absent(&self, new: &NewConnection) -> Result<Option<Connection>> {
        sqlx::query_as::<_, Connection>(
            r#"
            INSERT INTO connections (user_id, server_id, is_active, traffic_used, traffic_limit, expires_at)
            VALUES ($1, $2, TRUE, 0, $3, $4)
            ON CONFLICT (user_id, server_id) WHERE is_active AND deleted_at IS NULL DO NOTHING
            RETURNING *
            "#,
        )
        .bind(new.user_id)
        .bind(new.server_id)
        .bind(new.traffic_limit)
        .bind(new.expires_at)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to insert connection")
    }

    pub async fn get_by_id(&self, id: Uuid) -> Result<Option<Connection>> {
        sqlx::query_as::<_, Connection>("SELECT * FROM connections WHERE id = $1 AND deleted_at IS NULL")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch connection by ID")
    }

    /// Also returns soft-deleted rows; panel cleanup runs after the row is gone.
    pub async fn get_by_id_including_deleted(&self, id: Uuid) -> Result<Option<Connection>> {
        sqlx::query_as::<_, Connection>("SELECT * FROM connections WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch connection by ID")
    }

    pub async fn list_active_for_user(&self, user_id: Uuid) -> Result<Vec<Connection>> {
        sqlx::query_as::<_, Connection>(
            "SELECT * FROM connections WHERE user_id = $1 AND is_active = TRUE AND deleted_at IS NULL ORDER BY created_at ASC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list user connections")
    }

    /// Writes panel results back only while the row is still pending and live.
    pub async fn mark_provisioned(&self, id: Uuid, client: &ProvisionedClient) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE connections
            SET xray_inbound_id = $2, xray_client_id = $3, connection_key = $4,
                subscription_link = $5, updated_at = CURRENT_TIMESTAMP
            WHERE id = $1 AND xray_client_id = 0 AND deleted_at IS NULL
            "#,
        )
        .bind(id)
        .bind(client.inbound_id)
        .bind(client.client_id)
        .bind(&client.connection_key)
        .bind(&client.subscription_link)
        .execute(&self.pool)
        .await
        .context("Failed to store provisioning result")?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn soft_delete(&self, id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE connections SET deleted_at = CURRENT_TIMESTAMP, is_active = FALSE, updated_at = CURRENT_TIMESTAMP WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .context("Failed to delete connection")?;
        Ok(())
    }

    pub async fn update_traffic(&self, id: Uuid, traffic_used: i64) -> Result<()> {
        sqlx::query(
            "UPDATE connections SET traffic_used = $2, updated_at = CURRENT_TIMESTAMP WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(id)
        .bind(traffic_used)
        .execute(&self.pool)
        .await
        .context("Failed to update traffic")?;
        Ok(())
    }

    pub async fn deactivate(&self, id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE connections SET is_active = FALSE, updated_at = CURRENT_TIMESTAMP WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .context("Failed to deactivate connection")?;
        Ok(())
    }

    pub async fn list_provisioned_active(&self) -> Result<Vec<Connection>> {
        sqlx::query_as::<_, Connection>(
            "SELECT * FROM connections WHERE is_active = TRUE AND xray_client_id <> 0 AND deleted_at IS NULL",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to list provisioned connections")
    }
}
