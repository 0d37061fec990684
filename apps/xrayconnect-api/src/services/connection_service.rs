use std::sync::Arc;

use tracing::{debug, error, info};
use uuid::Uuid;
use xrayconnect_db::models::connection::{Connection, ConnectionWithServer, NewConnection};
use xrayconnect_db::{InsertOutcome, ProvisioningStore};
use xrayconnect_queue::TaskPublisher;
use xrayconnect_shared::Task;

use crate::error::ServiceError;

/// Synchronous half of provisioning: persists intent and queues the panel work.
pub struct ConnectionService {
    store: Arc<dyn ProvisioningStore>,
    queue: Arc<dyn TaskPublisher>,
}

impl ConnectionService {
    pub fn new(store: Arc<dyn ProvisioningStore>, queue: Arc<dyn TaskPublisher>) -> Self {
        Self { store, queue }
    }

    /// Returns the live connection for the pair, creating it if needed. The
    /// returned row has an empty key until the worker has provisioned it.
    pub async fn create_connection(&self, user_id: Uuid, server_id: Uuid) -> Result<Connection, ServiceError> {
        let server = self
            .store
            .get_server(server_id)
            .await?
            .filter(|s| s.is_active)
            .ok_or(ServiceError::NotFound("server"))?;

        if let Some(existing) = self.store.find_active_connection(user_id, server_id).await? {
            debug!(connection_id = %existing.id, "Returning existing connection");
            return Ok(existing);
        }

        let user = self
            .store
            .get_user(user_id)
            .await?
            .ok_or(ServiceError::NotFound("user"))?;
        let subscription = self.store.get_active_subscription(user.id).await?;

        let conn = match self
            .store
            .insert_connection(NewConnection {
                user_id: user.id,
                server_id,
                traffic_limit: 0,
                expires_at: subscription.and_then(|s| s.expires_at),
            })
            .await?
        {
            InsertOutcome::Created(conn) => conn,
            InsertOutcome::Existing(conn) => {
                debug!(connection_id = %conn.id, "Concurrent request already created the connection");
                return Ok(conn);
            }
        };

        let task = Task::create_connection(user.id, server_id, conn.id, &server.name, &server.protocol);
        if let Err(e) = self.queue.publish_task(&task).await {
            // The row stays pending until it is re-queued.
            error!(connection_id = %conn.id, "Failed to enqueue create_connection task: {}", e);
        }

        info!(connection_id = %conn.id, user_id = %user.id, server = %server.name, "Connection created");
        Ok(conn)
    }

    pub async fn get_user_connections(&self, user_id: Uuid) -> Result<Vec<ConnectionWithServer>, ServiceError> {
        Ok(self.store.list_user_connections(user_id).await?)
    }

    pub async fn delete_connection(&self, connection_id: Uuid) -> Result<(), ServiceError> {
        let conn = self
            .store
            .get_connection(connection_id)
            .await?
            .ok_or(ServiceError::NotFound("connection"))?;
        self.remove(&conn).await
    }

    /// Like `delete_connection`, but another user's connection is reported
    /// as not found.
    pub async fn delete_user_connection(&self, user_id: Uuid, connection_id: Uuid) -> Result<(), ServiceError> {
        let conn = self
            .store
            .get_connection(connection_id)
            .await?
            .filter(|c| c.user_id == user_id)
            .ok_or(ServiceError::NotFound("connection"))?;
        self.remove(&conn).await
    }

    // The row is soft-deleted before cleanup is queued so the worker never
    // sees a live row for a delete task.
    async fn remove(&self, conn: &Connection) -> Result<(), ServiceError> {
        self.store.soft_delete_connection(conn.id).await?;
        let task = Task::delete_connection(conn.user_id, conn.server_id, conn.id);
        if let Err(e) = self.queue.publish_task(&task).await {
            error!(connection_id = %conn.id, "Failed to enqueue delete_connection task: {}", e);
        }
        info!(connection_id = %conn.id, "Connection deleted");
        Ok(())
    }
}
