use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use xrayconnect_db::ProvisioningStore;
use xrayconnect_db::models::connection::{Connection, ProvisionedClient};
use xrayconnect_db::models::server::{Server, XrayPanel};
use xrayconnect_panel::{PanelApi, generate_connection_key, panel_host};
use xrayconnect_queue::{HandlerError, TaskHandler, TaskPublisher};
use xrayconnect_shared::notification::{CONNECTION_FAILED, CONNECTION_READY, TRAFFIC_LIMIT_REACHED};
use xrayconnect_shared::{Task, TaskType};

use crate::error::{Stage, TaskError};
use crate::panels::PanelConnector;

const DEFAULT_INBOUND_ID: i32 = 1;
const DEFAULT_PORT: u16 = 443;
const DEFAULT_VALIDITY_DAYS: i64 = 30;

/// Server inbound wins, then the panel default, then inbound 1.
pub fn resolve_inbound_id(server_inbound_id: i32, panel_inbound_id: i32) -> i32 {
    if server_inbound_id > 0 {
        server_inbound_id
    } else if panel_inbound_id > 0 {
        panel_inbound_id
    } else {
        DEFAULT_INBOUND_ID
    }
}

/// Client expiry in Unix milliseconds; open-ended connections get 30 days.
pub fn panel_expiry_millis(expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> i64 {
    expires_at
        .unwrap_or(now + Duration::days(DEFAULT_VALIDITY_DAYS))
        .timestamp_millis()
}

/// Where clients connect: the server's own host, else the panel's.
fn endpoint(server: &Server, panel: &XrayPanel) -> Option<(String, u16)> {
    let host = server
        .host
        .as_deref()
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .map(str::to_string)
        .or_else(|| panel_host(&panel.url))?;
    let port = u16::try_from(server.port)
        .ok()
        .filter(|p| *p > 0)
        .unwrap_or(DEFAULT_PORT);
    Some((host, port))
}

pub struct Provisioner {
    store: Arc<dyn ProvisioningStore>,
    queue: Arc<dyn TaskPublisher>,
    panels: Arc<dyn PanelConnector>,
    subscription_base_url: String,
}

impl Provisioner {
    pub fn new(
        store: Arc<dyn ProvisioningStore>,
        queue: Arc<dyn TaskPublisher>,
        panels: Arc<dyn PanelConnector>,
        subscription_base_url: &str,
    ) -> Self {
        Self {
            store,
            queue,
            panels,
            subscription_base_url: subscription_base_url.trim_end_matches('/').to_string(),
        }
    }

    pub async fn process(&self, task: &Task) -> Result<(), TaskError> {
        match &task.task_type {
            TaskType::CreateConnection => self.create_connection(task).await,
            TaskType::DeleteConnection => self.delete_connection(task).await,
            TaskType::UpdateTraffic => self.update_traffic(task).await,
            other => {
                warn!(task_type = %other, user_id = %task.user_id, "Unknown task type, acknowledging");
                Ok(())
            }
        }
    }

    fn connection_id(task: &Task) -> Result<Uuid, TaskError> {
        task.connection_id
            .ok_or_else(|| TaskError::terminal(Stage::Received, anyhow!("task carries no connection_id")))
    }

    async fn notify(&self, user_id: Uuid, message_type: &str, payload: serde_json::Value) {
        let task = Task::notification(Some(user_id), message_type, payload);
        if let Err(e) = self.queue.publish_task(&task).await {
            warn!(%user_id, message_type, "Failed to publish notification: {}", e);
        }
    }

    async fn resolve_server(&self, conn: &Connection) -> Result<Server, TaskError> {
        let server = self
            .store
            .get_server(conn.server_id)
            .await
            .map_err(|e| TaskError::retryable(Stage::ServerResolved, e))?
            .ok_or_else(|| TaskError::terminal(Stage::ServerResolved, anyhow!("server {} not found", conn.server_id)))?;
        Ok(server)
    }

    async fn resolve_panel(&self, server: &Server) -> Result<XrayPanel, TaskError> {
        let panel_id = server
            .xray_panel_id
            .ok_or_else(|| TaskError::terminal(Stage::PanelResolved, anyhow!("server has no associated panel")))?;
        let panel = self
            .store
            .get_panel(panel_id)
            .await
            .map_err(|e| TaskError::retryable(Stage::PanelResolved, e))?
            .ok_or_else(|| TaskError::terminal(Stage::PanelResolved, anyhow!("panel {} not found", panel_id)))?;
        if !panel.is_active {
            return Err(TaskError::terminal(Stage::PanelResolved, anyhow!("panel is not active")));
        }
        Ok(panel)
    }

    fn panel_api(&self, panel: &XrayPanel) -> Result<Arc<dyn PanelApi>, TaskError> {
        self.panels
            .connect(panel)
            .map_err(|e| TaskError::retryable(Stage::PanelResolved, e))
    }

    // ==================== CREATE ====================

    async fn create_connection(&self, task: &Task) -> Result<(), TaskError> {
        let connection_id = Self::connection_id(task)?;
        let lease = self
            .store
            .lease_connection(connection_id)
            .await
            .map_err(|e| TaskError::retryable(Stage::Received, e))?;

        let result = self.provision(connection_id).await;

        if let Err(e) = lease.release().await {
            warn!(%connection_id, "Failed to release connection lease: {}", e);
        }

        if let Err(err) = &result {
            let gone = matches!(err.stage(), Stage::Received | Stage::ConnectionLoaded);
            if err.is_terminal() && !gone {
                self.notify(
                    task.user_id,
                    CONNECTION_FAILED,
                    json!({ "connection_id": connection_id, "error": err.to_string() }),
                )
                .await;
            }
        }
        result
    }

    async fn provision(&self, connection_id: Uuid) -> Result<(), TaskError> {
        let conn = self
            .store
            .get_connection(connection_id)
            .await
            .map_err(|e| TaskError::retryable(Stage::ConnectionLoaded, e))?
            .ok_or_else(|| {
                TaskError::terminal(Stage::ConnectionLoaded, anyhow!("connection {} not found", connection_id))
            })?;

        if conn.is_provisioned() {
            info!(%connection_id, client_id = conn.xray_client_id, "Connection already provisioned, skipping");
            return Ok(());
        }
        if !conn.is_active {
            return Err(TaskError::terminal(Stage::ConnectionLoaded, anyhow!("connection is inactive")));
        }

        let server = self.resolve_server(&conn).await?;
        if !server.is_active {
            return Err(TaskError::terminal(Stage::ServerResolved, anyhow!("server {} is not active", server.name)));
        }
        let panel = self.resolve_panel(&server).await?;
        let api = self.panel_api(&panel)?;

        let (host, port) = endpoint(&server, &panel)
            .ok_or_else(|| TaskError::terminal(Stage::KeyGenerated, anyhow!("no host known for server {}", server.name)))?;
        let inbound_id = resolve_inbound_id(server.inbound_id, panel.inbound_id);
        let email = conn.panel_email();
        let client_uuid = Uuid::new_v4().to_string();
        let expiry = panel_expiry_millis(conn.expires_at, Utc::now());

        let added = api
            .add_client(inbound_id, &email, &client_uuid, expiry, 0)
            .await
            .map_err(|e| TaskError::retryable(Stage::ClientAdded, e))?;
        if added.reused {
            info!(%connection_id, inbound_id, "Adopted panel client left by an earlier attempt");
        }

        let remark = format!("{}-User", server.country);
        let provisioned = ProvisionedClient {
            inbound_id,
            client_id: added.position,
            connection_key: generate_connection_key(&server.protocol, &added.uuid, &host, port, &remark),
            subscription_link: format!("{}/sub/{}", self.subscription_base_url, conn.id),
        };

        // A failed write leaves the panel client in place; the next delivery adopts it.
        let stored = self
            .store
            .mark_provisioned(conn.id, &provisioned)
            .await
            .map_err(|e| TaskError::retryable(Stage::Persisted, e))?;

        if !stored {
            warn!(%connection_id, "Connection removed while provisioning, rolling back panel client");
            if let Err(e) = api.delete_client(inbound_id, &email).await {
                error!(%connection_id, inbound_id, "Failed to roll back panel client: {}", e);
            }
            return Ok(());
        }

        info!(
            %connection_id,
            user_id = %conn.user_id,
            server = %server.name,
            inbound_id,
            client_id = added.position,
            "Connection created in Xray panel"
        );

        self.notify(
            conn.user_id,
            CONNECTION_READY,
            json!({
                "connection_id": conn.id,
                "server_id": conn.server_id,
                "connection_key": provisioned.connection_key,
                "subscription_link": provisioned.subscription_link,
            }),
        )
        .await;
        Ok(())
    }

    // ==================== DELETE ====================

    async fn delete_connection(&self, task: &Task) -> Result<(), TaskError> {
        let connection_id = Self::connection_id(task)?;
        let lease = self
            .store
            .lease_connection(connection_id)
            .await
            .map_err(|e| TaskError::retryable(Stage::Received, e))?;

        let result = self.remove_panel_client(connection_id).await;

        if let Err(e) = lease.release().await {
            warn!(%connection_id, "Failed to release connection lease: {}", e);
        }
        result
    }

    /// Panel-side cleanup. The row is normally soft-deleted already, so it is
    /// read regardless of `deleted_at`; panel failures are logged, not retried.
    async fn remove_panel_client(&self, connection_id: Uuid) -> Result<(), TaskError> {
        let Some(conn) = self
            .store
            .get_connection_including_deleted(connection_id)
            .await
            .map_err(|e| TaskError::retryable(Stage::ConnectionLoaded, e))?
        else {
            warn!(%connection_id, "Connection to delete does not exist");
            return Ok(());
        };

        if !conn.is_provisioned() {
            if !conn.is_deleted() {
                // A create may still write back before the soft delete lands.
                return Err(TaskError::retryable(
                    Stage::ConnectionLoaded,
                    anyhow!("connection is not deleted yet"),
                ));
            }
            debug!(%connection_id, "Connection was never provisioned, nothing to clean up");
            return Ok(());
        }

        let panel = match self.resolve_server(&conn).await {
            Ok(server) => match self.resolve_panel(&server).await {
                Ok(panel) => Some((server, panel)),
                Err(e) if !e.is_terminal() => return Err(e),
                Err(e) => {
                    warn!(%connection_id, "Skipping panel cleanup: {}", e);
                    None
                }
            },
            Err(e) if !e.is_terminal() => return Err(e),
            Err(e) => {
                warn!(%connection_id, "Skipping panel cleanup: {}", e);
                None
            }
        };
        let Some((server, panel)) = panel else {
            return Ok(());
        };

        let inbound_id = if conn.xray_inbound_id > 0 {
            conn.xray_inbound_id
        } else {
            resolve_inbound_id(server.inbound_id, panel.inbound_id)
        };
        let email = conn.panel_email();

        let outcome = match self.panel_api(&panel) {
            Ok(api) => api.delete_client(inbound_id, &email).await.map_err(anyhow::Error::from),
            Err(e) => Err(anyhow!(e)),
        };
        match outcome {
            Ok(true) => info!(%connection_id, inbound_id, "Connection deleted from Xray panel"),
            Ok(false) => debug!(%connection_id, inbound_id, "Panel had no client for connection"),
            Err(e) => warn!(%connection_id, inbound_id, "Panel cleanup failed, leaving client in place: {:#}", e),
        }
        Ok(())
    }

    // ==================== TRAFFIC ====================

    async fn update_traffic(&self, task: &Task) -> Result<(), TaskError> {
        let connection_id = Self::connection_id(task)?;
        let lease = self
            .store
            .lease_connection(connection_id)
            .await
            .map_err(|e| TaskError::retryable(Stage::Received, e))?;

        let result = self.sync_traffic(connection_id).await;

        if let Err(e) = lease.release().await {
            warn!(%connection_id, "Failed to release connection lease: {}", e);
        }
        result
    }

    async fn sync_traffic(&self, connection_id: Uuid) -> Result<(), TaskError> {
        let Some(conn) = self
            .store
            .get_connection(connection_id)
            .await
            .map_err(|e| TaskError::retryable(Stage::ConnectionLoaded, e))?
        else {
            debug!(%connection_id, "Connection gone, skipping traffic update");
            return Ok(());
        };
        if !conn.is_provisioned() || !conn.is_active {
            debug!(%connection_id, "Connection not live on panel, skipping traffic update");
            return Ok(());
        }

        let server = self.resolve_server(&conn).await?;
        let panel = self.resolve_panel(&server).await?;
        let api = self.panel_api(&panel)?;

        let Some(traffic) = api
            .client_traffic(&conn.panel_email())
            .await
            .map_err(|e| TaskError::retryable(Stage::TrafficFetched, e))?
        else {
            debug!(%connection_id, "Panel has no traffic statistics yet");
            return Ok(());
        };

        let used = traffic.used();
        self.store
            .update_traffic(conn.id, used)
            .await
            .map_err(|e| TaskError::retryable(Stage::TrafficFetched, e))?;
        debug!(%connection_id, used, limit = conn.traffic_limit, "Traffic updated");

        if conn.traffic_limit <= 0 || used < conn.traffic_limit {
            return Ok(());
        }

        // Cleanup is queued before deactivating so a crash in between is retried.
        self.queue
            .publish_task(&Task::delete_connection(conn.user_id, conn.server_id, conn.id))
            .await
            .map_err(|e| TaskError::retryable(Stage::Deactivated, e))?;
        self.store
            .deactivate_connection(conn.id)
            .await
            .map_err(|e| TaskError::retryable(Stage::Deactivated, e))?;

        info!(%connection_id, used, limit = conn.traffic_limit, "Traffic limit reached, connection deactivated");
        self.notify(
            conn.user_id,
            TRAFFIC_LIMIT_REACHED,
            json!({ "connection_id": conn.id, "traffic_used": used, "traffic_limit": conn.traffic_limit }),
        )
        .await;
        Ok(())
    }
}

#[async_trait]
impl TaskHandler for Provisioner {
    async fn handle(&self, task: Task) -> Result<(), HandlerError> {
        self.process(&task).await.map_err(|err| {
            if err.is_terminal() {
                error!(
                    task_type = %task.task_type,
                    connection_id = ?task.connection_id,
                    stage = %err.stage(),
                    "Task failed permanently: {}",
                    err
                );
            }
            HandlerError::from(err)
        })
    }
}
