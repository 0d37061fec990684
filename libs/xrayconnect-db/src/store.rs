use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::debug;
use uuid::Uuid;

use crate::models::connection::{Connection, ConnectionWithServer, NewConnection, ProvisionedClient};
use crate::models::server::{Server, XrayPanel};
use crate::models::user::{Subscription, User};
use crate::repositories::{ConnectionRepository, ServerRepository, UserRepository};

/// Result of an insert guarded by the one-live-connection-per-pair index.
#[derive(Debug, Clone)]
pub enum InsertOutcome {
    Created(Connection),
    /// A concurrent request won; this is its row.
    Existing(Connection),
}

impl InsertOutcome {
    pub fn into_connection(self) -> Connection {
        match self {
            InsertOutcome::Created(conn) | InsertOutcome::Existing(conn) => conn,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, InsertOutcome::Created(_))
    }
}

/// Exclusive right to run side effects for one connection. Dropping it
/// without `release` frees it as well.
pub enum ConnectionLease {
    Postgres(Transaction<'static, Postgres>),
    Memory(tokio::sync::OwnedMutexGuard<()>),
}

impl ConnectionLease {
    pub async fn release(self) -> Result<()> {
        match self {
            ConnectionLease::Postgres(tx) => tx.commit().await.context("Failed to release advisory lock"),
            ConnectionLease::Memory(guard) => {
                drop(guard);
                Ok(())
            }
        }
    }
}

impl std::fmt::Debug for ConnectionLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionLease::Postgres(_) => f.write_str("ConnectionLease::Postgres"),
            ConnectionLease::Memory(_) => f.write_str("ConnectionLease::Memory"),
        }
    }
}

/// Storage operations the connection service and the provisioning worker need.
#[async_trait]
pub trait ProvisioningStore: Send + Sync {
    async fn get_user(&self, id: Uuid) -> Result<Option<User>>;
    async fn get_active_subscription(&self, user_id: Uuid) -> Result<Option<Subscription>>;
    async fn get_server(&self, id: Uuid) -> Result<Option<Server>>;
    async fn get_servers(&self, ids: &[Uuid]) -> Result<Vec<Server>>;
    async fn get_panel(&self, id: Uuid) -> Result<Option<XrayPanel>>;

    async fn find_active_connection(&self, user_id: Uuid, server_id: Uuid) -> Result<Option<Connection>>;
    async fn insert_connection(&self, new: NewConnection) -> Result<InsertOutcome>;
    async fn get_connection(&self, id: Uuid) -> Result<Option<Connection>>;
    async fn get_connection_including_deleted(&self, id: Uuid) -> Result<Option<Connection>>;
    async fn list_active_connections(&self, user_id: Uuid) -> Result<Vec<Connection>>;
    /// `false` when the row was already provisioned or deleted meanwhile.
    async fn mark_provisioned(&self, id: Uuid, client: &ProvisionedClient) -> Result<bool>;
    async fn soft_delete_connection(&self, id: Uuid) -> Result<()>;
    async fn update_traffic(&self, id: Uuid, traffic_used: i64) -> Result<()>;
    async fn deactivate_connection(&self, id: Uuid) -> Result<()>;
    async fn list_provisioned_connections(&self) -> Result<Vec<Connection>>;

    /// Waits until no other holder runs side effects for `id`.
    async fn lease_connection(&self, id: Uuid) -> Result<ConnectionLease>;

    async fn list_user_connections(&self, user_id: Uuid) -> Result<Vec<ConnectionWithServer>> {
        let connections = self.list_active_connections(user_id).await?;
        let mut server_ids: Vec<Uuid> = connections.iter().map(|c| c.server_id).collect();
        server_ids.sort();
        server_ids.dedup();
        let servers = self.get_servers(&server_ids).await?;
        Ok(attach_servers(connections, servers))
    }
}

fn attach_servers(connections: Vec<Connection>, servers: Vec<Server>) -> Vec<ConnectionWithServer> {
    let servers: HashMap<Uuid, Server> = servers.into_iter().map(|s| (s.id, s)).collect();
    connections
        .into_iter()
        .filter_map(|connection| {
            let server = servers.get(&connection.server_id)?.clone();
            Some(ConnectionWithServer { connection, server })
        })
        .collect()
}

pub(crate) fn advisory_key(id: Uuid) -> i64 {
    let (hi, lo) = id.as_u64_pair();
    (hi ^ lo) as i64
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
    users: UserRepository,
    servers: ServerRepository,
    connections: ConnectionRepository,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            users: UserRepository::new(pool.clone()),
            servers: ServerRepository::new(pool.clone()),
            connections: ConnectionRepository::new(pool.clone()),
            pool,
        }
    }
}

#[async_trait]
impl ProvisioningStore for PgStore {
    async fn get_user(&self, id: Uuid) -> Result<Option<User>> {
        self.users.get_user_by_id(id).await
    }

    async fn get_active_subscription(&self, user_id: Uuid) -> Result<Option<Subscription>> {
        self.users.get_active_subscription(user_id).await
    }

    async fn get_server(&self, id: Uuid) -> Result<Option<Server>> {
        self.servers.get_server_by_id(id).await
    }

    async fn get_servers(&self, ids: &[Uuid]) -> Result<Vec<Server>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.servers.get_servers_by_ids(ids).await
    }

    async fn get_panel(&self, id: Uuid) -> Result<Option<XrayPanel>> {
        self.servers.get_panel_by_id(id).await
    }

    async fn find_active_connection(&self, user_id: Uuid, server_id: Uuid) -> Result<Option<Connection>> {
        self.connections.find_active(user_id, server_id).await
    }

    async fn insert_connection(&self, new: NewConnection) -> Result<InsertOutcome> {
        // The winner of a conflict may be deleted before we read it back.
        for _ in 0..3 {
            if let Some(created) = self.connections.insert_if_absent(&new).await? {
                return Ok(InsertOutcome::Created(created));
            }
            if let Some(existing) = self.connections.find_active(new.user_id, new.server_id).await? {
                debug!(connection_id = %existing.id, "Concurrent create resolved to existing connection");
                return Ok(InsertOutcome::Existing(existing));
            }
        }
        Err(anyhow::anyhow!(
            "Connection insert for user {} server {} kept conflicting",
            new.user_id,
            new.server_id
        ))
    }

    async fn get_connection(&self, id: Uuid) -> Result<Option<Connection>> {
        self.connections.get_by_id(id).await
    }

    async fn get_connection_including_deleted(&self, id: Uuid) -> Result<Option<Connection>> {
        self.connections.get_by_id_including_deleted(id).await
    }

    async fn list_active_connections(&self, user_id: Uuid) -> Result<Vec<Connection>> {
        self.connections.list_active_for_user(user_id).await
    }

    async fn mark_provisioned(&self, id: Uuid, client: &ProvisionedClient) -> Result<bool> {
        self.connections.mark_provisioned(id, client).await
    }

    async fn soft_delete_connection(&self, id: Uuid) -> Result<()> {
        self.connections.soft_delete(id).await
    }

    async fn update_traffic(&self, id: Uuid, traffic_used: i64) -> Result<()> {
        self.connections.update_traffic(id, traffic_used).await
    }

    async fn deactivate_connection(&self, id: Uuid) -> Result<()> {
        self.connections.deactivate(id).await
    }

    async fn list_provisioned_connections(&self) -> Result<Vec<Connection>> {
        self.connections.list_provisioned_active().await
    }

    async fn lease_connection(&self, id: Uuid) -> Result<ConnectionLease> {
        let mut tx = self.pool.begin().await.context("Failed to open lease transaction")?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(advisory_key(id))
            .execute(&mut *tx)
            .await
            .context("Failed to take advisory lock")?;
        Ok(ConnectionLease::Postgres(tx))
    }
}
