//! In-process store for tests. Mirrors the Postgres semantics that matter to
//! callers: scoped reads skip soft-deleted rows, inserts respect the
//! one-live-connection-per-pair rule, and leases serialise per connection.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::models::connection::{Connection, NewConnection, ProvisionedClient};
use crate::models::server::{Server, XrayPanel};
use crate::models::user::{Subscription, User};
use crate::store::{ConnectionLease, InsertOutcome, ProvisioningStore};

#[derive(Default)]
struct State {
    users: HashMap<Uuid, User>,
    subscriptions: Vec<Subscription>,
    servers: HashMap<Uuid, Server>,
    panels: HashMap<Uuid, XrayPanel>,
    connections: Vec<Connection>,
    interleave_reads: bool,
    unique_index: bool,
    fail_next_mark: bool,
}

#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    leases: Arc<Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let state = State {
            unique_index: true,
            ..State::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
            leases: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, State>> {
        self.state.lock().map_err(|_| anyhow!("memory store poisoned"))
    }

    pub fn insert_user(&self, user: User) {
        if let Ok(mut state) = self.state() {
            state.users.insert(user.id, user);
        }
    }

    pub fn insert_subscription(&self, subscription: Subscription) {
        if let Ok(mut state) = self.state() {
            state.subscriptions.push(subscription);
        }
    }

    pub fn insert_server(&self, server: Server) {
        if let Ok(mut state) = self.state() {
            state.servers.insert(server.id, server);
        }
    }

    pub fn insert_panel(&self, panel: XrayPanel) {
        if let Ok(mut state) = self.state() {
            state.panels.insert(panel.id, panel);
        }
    }

    pub fn insert_connection_row(&self, connection: Connection) {
        if let Ok(mut state) = self.state() {
            state.connections.push(connection);
        }
    }

    /// Every connection row, soft-deleted ones included.
    pub fn connection_rows(&self) -> Vec<Connection> {
        self.state().map(|s| s.connections.clone()).unwrap_or_default()
    }

    pub fn connection_row(&self, id: Uuid) -> Option<Connection> {
        self.connection_rows().into_iter().find(|c| c.id == id)
    }

    /// Yields to the scheduler inside `find_active_connection` so concurrent
    /// creates both observe "no connection yet".
    pub fn interleave_reads(&self, enabled: bool) {
        if let Ok(mut state) = self.state() {
            state.interleave_reads = enabled;
        }
    }

    /// Drops the one-live-connection-per-pair rule.
    pub fn without_unique_index(&self) {
        if let Ok(mut state) = self.state() {
            state.unique_index = false;
        }
    }

    pub fn fail_next_mark_provisioned(&self) {
        if let Ok(mut state) = self.state() {
            state.fail_next_mark = true;
        }
    }

    fn live_pair(state: &State, user_id: Uuid, server_id: Uuid) -> Option<Connection> {
        state
            .connections
            .iter()
            .find(|c| c.user_id == user_id && c.server_id == server_id && c.is_active && c.deleted_at.is_none())
            .cloned()
    }

    fn update_live<F>(&self, id: Uuid, f: F) -> Result<bool>
    where
        F: FnOnce(&mut Connection) -> bool,
    {
        let mut state = self.state()?;
        let Some(conn) = state.connections.iter_mut().find(|c| c.id == id && c.deleted_at.is_none()) else {
            return Ok(false);
        };
        let changed = f(conn);
        if changed {
            conn.updated_at = Utc::now();
        }
        Ok(changed)
    }
}

#[async_trait]
impl ProvisioningStore for MemoryStore {
    async fn get_user(&self, id: Uuid) -> Result<Option<User>> {
        Ok(self.state()?.users.get(&id).cloned())
    }

    async fn get_active_subscription(&self, user_id: Uuid) -> Result<Option<Subscription>> {
        let now = Utc::now();
        let state = self.state()?;
        let mut live: Vec<&Subscription> = state
            .subscriptions
            .iter()
            .filter(|s| s.user_id == user_id && s.is_active && s.expires_at.is_none_or(|at| at > now))
            .collect();
        live.sort_by_key(|s| std::cmp::Reverse(s.expires_at));
        Ok(live.first().map(|s| (*s).clone()))
    }

    async fn get_server(&self, id: Uuid) -> Result<Option<Server>> {
        Ok(self.state()?.servers.get(&id).cloned())
    }

    async fn get_servers(&self, ids: &[Uuid]) -> Result<Vec<Server>> {
        let state = self.state()?;
        Ok(ids.iter().filter_map(|id| state.servers.get(id).cloned()).collect())
    }

    async fn get_panel(&self, id: Uuid) -> Result<Option<XrayPanel>> {
        Ok(self.state()?.panels.get(&id).cloned())
    }

    async fn find_active_connection(&self, user_id: Uuid, server_id: Uuid) -> Result<Option<Connection>> {
        let (found, interleave) = {
            let state = self.state()?;
            (Self::live_pair(&state, user_id, server_id), state.interleave_reads)
        };
        if interleave {
            tokio::task::yield_now().await;
        }
        Ok(found)
    }

    async fn insert_connection(&self, new: NewConnection) -> Result<InsertOutcome> {
        let mut state = self.state()?;
        if state.unique_index {
            if let Some(existing) = Self::live_pair(&state, new.user_id, new.server_id) {
                return Ok(InsertOutcome::Existing(existing));
            }
        }
        let now = Utc::now();
        let conn = Connection {
            id: Uuid::new_v4(),
            user_id: new.user_id,
            server_id: new.server_id,
            xray_inbound_id: 0,
            xray_client_id: 0,
            connection_key: String::new(),
            subscription_link: String::new(),
            is_active: true,
            traffic_used: 0,
            traffic_limit: new.traffic_limit,
            expires_at: new.expires_at,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        state.connections.push(conn.clone());
        Ok(InsertOutcome::Created(conn))
    }

    async fn get_connection(&self, id: Uuid) -> Result<Option<Connection>> {
        let state = self.state()?;
        Ok(state.connections.iter().find(|c| c.id == id && c.deleted_at.is_none()).cloned())
    }

    async fn get_connection_including_deleted(&self, id: Uuid) -> Result<Option<Connection>> {
        let state = self.state()?;
        Ok(state.connections.iter().find(|c| c.id == id).cloned())
    }

    async fn list_active_connections(&self, user_id: Uuid) -> Result<Vec<Connection>> {
        let state = self.state()?;
        Ok(state
            .connections
            .iter()
            .filter(|c| c.user_id == user_id && c.is_active && c.deleted_at.is_none())
            .cloned()
            .collect())
    }

    async fn mark_provisioned(&self, id: Uuid, client: &ProvisionedClient) -> Result<bool> {
        {
            let mut state = self.state()?;
            if state.fail_next_mark {
                state.fail_next_mark = false;
                return Err(anyhow!("simulated write failure"));
            }
        }
        self.update_live(id, |conn| {
            if conn.xray_client_id != 0 {
                return false;
            }
            conn.xray_inbound_id = client.inbound_id;
            conn.xray_client_id = client.client_id;
            conn.connection_key = client.connection_key.clone();
            conn.subscription_link = client.subscription_link.clone();
            true
        })
    }

    async fn soft_delete_connection(&self, id: Uuid) -> Result<()> {
        self.update_live(id, |conn| {
            conn.deleted_at = Some(Utc::now());
            conn.is_active = false;
            true
        })?;
        Ok(())
    }

    async fn update_traffic(&self, id: Uuid, traffic_used: i64) -> Result<()> {
        self.update_live(id, |conn| {
            conn.traffic_used = traffic_used;
            true
        })?;
        Ok(())
    }

    async fn deactivate_connection(&self, id: Uuid) -> Result<()> {
        self.update_live(id, |conn| {
            conn.is_active = false;
            true
        })?;
        Ok(())
    }

    async fn list_provisioned_connections(&self) -> Result<Vec<Connection>> {
        let state = self.state()?;
        Ok(state
            .connections
            .iter()
            .filter(|c| c.is_active && c.is_provisioned() && c.deleted_at.is_none())
            .cloned()
            .collect())
    }

    async fn lease_connection(&self, id: Uuid) -> Result<ConnectionLease> {
        let slot = {
            let mut leases = self.leases.lock().map_err(|_| anyhow!("lease table poisoned"))?;
            leases.entry(id).or_default().clone()
        };
        Ok(ConnectionLease::Memory(slot.lock_owned().await))
    }
}

/// Rows with plausible defaults for seeding a `MemoryStore`.
pub mod fixtures {
    use chrono::Utc;
    use uuid::Uuid;

    use crate::models::server::{Server, XrayPanel};
    use crate::models::user::{Subscription, User};

    pub fn user() -> User {
        User {
            id: Uuid::new_v4(),
            telegram_id: rand_telegram_id(),
            username: Some("tester".into()),
            first_name: "Test".into(),
            balance: 0,
            is_active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    pub fn panel() -> XrayPanel {
        XrayPanel {
            id: Uuid::new_v4(),
            name: "panel-1".into(),
            panel_type: "3x-ui".into(),
            url: "https://panel.example.com:2053".into(),
            username: "admin".into(),
            password: "secret".into(),
            inbound_id: 0,
            is_active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    pub fn server(panel_id: Option<Uuid>) -> Server {
        Server {
            id: Uuid::new_v4(),
            name: "Frankfurt".into(),
            country: "DE".into(),
            flag: "🇩🇪".into(),
            protocol: "vless".into(),
            status: "online".into(),
            host: Some("de1.example.com".into()),
            port: 443,
            xray_panel_id: panel_id,
            inbound_id: 0,
            max_connections: 1000,
            current_load: 0,
            is_active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    pub fn subscription(user_id: Uuid, days: i64) -> Subscription {
        let now = Utc::now();
        Subscription {
            id: Uuid::new_v4(),
            user_id,
            plan_id: Uuid::new_v4(),
            is_active: true,
            started_at: Some(now),
            expires_at: Some(now + chrono::Duration::days(days)),
            created_at: now,
        }
    }

    fn rand_telegram_id() -> i64 {
        (Uuid::new_v4().as_u128() % 1_000_000_000) as i64
    }
}
