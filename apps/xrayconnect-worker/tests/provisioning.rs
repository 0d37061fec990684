use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Map;
use tokio::sync::watch;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use uuid::Uuid;
use xrayconnect_db::memory::fixtures;
use xrayconnect_db::models::connection::{Connection, NewConnection};
use xrayconnect_db::models::server::{Server, XrayPanel};
use xrayconnect_db::{MemoryStore, ProvisioningStore};
use xrayconnect_panel::{AddedClient, ClientTraffic, Inbound, PanelApi, PanelError};
use xrayconnect_queue::{
    ConsumeOptions, HandlerError, MemoryTaskQueue, TaskConsumer, TaskHandler, TaskPublisher, consume_tasks,
};
use xrayconnect_shared::notification::{CONNECTION_FAILED, CONNECTION_READY, TRAFFIC_LIMIT_REACHED};
use xrayconnect_shared::{Lane, Task, TaskType};
use xrayconnect_worker::{PanelConnector, Provisioner, Stage, TaskError, TrafficSweep};

#[derive(Debug, Clone)]
struct StoredClient {
    inbound_id: i32,
    email: String,
    uuid: String,
    expiry: i64,
}

/// Records calls and keeps clients in memory, like a tiny 3x-ui.
#[derive(Default)]
struct FakePanel {
    clients: Mutex<Vec<StoredClient>>,
    add_calls: AtomicUsize,
    delete_calls: AtomicUsize,
    fail_add: AtomicBool,
    fail_delete: AtomicBool,
    traffic: Mutex<Option<ClientTraffic>>,
    add_delay: Mutex<Option<Duration>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    delete_row_during_add: Mutex<Option<(MemoryStore, Uuid)>>,
}

impl FakePanel {
    fn clients(&self) -> Vec<StoredClient> {
        self.clients.lock().unwrap().clone()
    }
}

#[async_trait]
impl PanelApi for FakePanel {
    async fn get_inbound(&self, inbound_id: i32) -> Result<Inbound, PanelError> {
        Ok(Inbound {
            id: inbound_id as i64,
            remark: String::new(),
            protocol: "vless".into(),
            port: 443,
            settings: String::new(),
            extra: Map::new(),
        })
    }

    async fn add_client(
        &self,
        inbound_id: i32,
        email: &str,
        uuid: &str,
        expiry_millis: i64,
        _total_bytes: i64,
    ) -> Result<AddedClient, PanelError> {
        self.add_calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = *self.add_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.fail_add.load(Ordering::SeqCst) {
            return Err(PanelError::Status {
                status: 502,
                body: "bad gateway".into(),
            });
        }

        let added = {
            let mut clients = self.clients.lock().unwrap();
            if let Some(pos) = clients.iter().position(|c| c.email == email) {
                AddedClient {
                    position: pos as i32 + 1,
                    uuid: clients[pos].uuid.clone(),
                    reused: true,
                }
            } else {
                clients.push(StoredClient {
                    inbound_id,
                    email: email.to_string(),
                    uuid: uuid.to_string(),
                    expiry: expiry_millis,
                });
                AddedClient {
                    position: clients.len() as i32,
                    uuid: uuid.to_string(),
                    reused: false,
                }
            }
        };

        let pending_delete = self.delete_row_during_add.lock().unwrap().take();
        if let Some((store, id)) = pending_delete {
            store.soft_delete_connection(id).await.unwrap();
        }
        Ok(added)
    }

    async fn delete_client(&self, _inbound_id: i32, email: &str) -> Result<bool, PanelError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(PanelError::Status {
                status: 500,
                body: "internal error".into(),
            });
        }
        let mut clients = self.clients.lock().unwrap();
        let before = clients.len();
        clients.retain(|c| c.email != email);
        Ok(clients.len() != before)
    }

    async fn client_traffic(&self, _email: &str) -> Result<Option<ClientTraffic>, PanelError> {
        Ok(self.traffic.lock().unwrap().clone())
    }
}

struct FakeConnector(Arc<FakePanel>);

impl PanelConnector for FakeConnector {
    fn connect(&self, _panel: &XrayPanel) -> Result<Arc<dyn PanelApi>, PanelError> {
        Ok(self.0.clone())
    }
}

struct Harness {
    store: MemoryStore,
    queue: MemoryTaskQueue,
    panel: Arc<FakePanel>,
    provisioner: Provisioner,
    user_id: Uuid,
    server: Server,
}

fn harness_with(configure: impl FnOnce(&mut Server, &mut XrayPanel)) -> Harness {
    let store = MemoryStore::new();
    let queue = MemoryTaskQueue::new();
    let panel = Arc::new(FakePanel::default());

    let user = fixtures::user();
    let mut panel_row = fixtures::panel();
    panel_row.inbound_id = 7;
    let mut server = fixtures::server(Some(panel_row.id));
    server.inbound_id = 5;
    configure(&mut server, &mut panel_row);

    store.insert_user(user.clone());
    store.insert_panel(panel_row);
    store.insert_server(server.clone());

    let provisioner = Provisioner::new(
        Arc::new(store.clone()),
        Arc::new(queue.clone()),
        Arc::new(FakeConnector(panel.clone())),
        "https://sub.test/",
    );

    Harness {
        store,
        queue,
        panel,
        provisioner,
        user_id: user.id,
        server,
    }
}

fn harness() -> Harness {
    harness_with(|_, _| {})
}

impl Harness {
    async fn pending_connection(&self, traffic_limit: i64) -> Connection {
        self.store
            .insert_connection(NewConnection {
                user_id: self.user_id,
                server_id: self.server.id,
                traffic_limit,
                expires_at: None,
            })
            .await
            .unwrap()
            .into_connection()
    }

    fn create_task(&self, conn: &Connection) -> Task {
        Task::create_connection(conn.user_id, conn.server_id, conn.id, &self.server.name, &self.server.protocol)
    }

    fn delete_task(&self, conn: &Connection) -> Task {
        Task::delete_connection(conn.user_id, conn.server_id, conn.id)
    }

    fn row(&self, id: Uuid) -> Connection {
        self.store.connection_row(id).unwrap()
    }

    fn notifications(&self, message_type: &str) -> Vec<Task> {
        self.queue
            .published()
            .into_iter()
            .filter(|t| t.task_type == TaskType::WebsocketNotification && t.data["message_type"] == message_type)
            .collect()
    }
}

// ==================== CREATE ====================

#[tokio::test]
async fn create_provisions_client_and_notifies_user() {
    let h = harness();
    let conn = h.pending_connection(0).await;

    h.provisioner.process(&h.create_task(&conn)).await.unwrap();

    let clients = h.panel.clients();
    assert_eq!(clients.len(), 1);
    assert_eq!(clients[0].inbound_id, 5);
    assert_eq!(clients[0].email, format!("user_{}_{}", h.user_id, conn.id));

    let row = h.row(conn.id);
    assert_eq!(row.xray_client_id, 1);
    assert_eq!(row.xray_inbound_id, 5);
    assert_eq!(
        row.connection_key,
        format!(
            "vless://{}@de1.example.com:443?security=reality&type=tcp&headerType=none#DE-User",
            clients[0].uuid
        )
    );
    assert_eq!(row.subscription_link, format!("https://sub.test/sub/{}", conn.id));

    let ready = h.notifications(CONNECTION_READY);
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].user_id, h.user_id);
    assert_eq!(ready[0].data["payload"]["connection_key"], row.connection_key.as_str());
}

#[tokio::test]
async fn replayed_create_is_a_no_op() {
    let h = harness();
    let conn = h.pending_connection(0).await;
    let task = h.create_task(&conn);

    h.provisioner.process(&task).await.unwrap();
    let first = h.row(conn.id);
    h.provisioner.process(&task).await.unwrap();
    let second = h.row(conn.id);

    assert_eq!(h.panel.add_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.panel.clients().len(), 1);
    assert_eq!(first.connection_key, second.connection_key);
    assert_eq!(first.xray_client_id, second.xray_client_id);
}

#[tokio::test]
async fn create_for_deleted_connection_fails_without_touching_panel() {
    let h = harness();
    let conn = h.pending_connection(0).await;
    h.store.soft_delete_connection(conn.id).await.unwrap();

    let err = h.provisioner.process(&h.create_task(&conn)).await.unwrap_err();

    assert!(err.is_terminal());
    assert_eq!(err.stage(), Stage::ConnectionLoaded);
    assert_eq!(h.panel.add_calls.load(Ordering::SeqCst), 0);
    assert!(h.row(conn.id).is_deleted());
    assert!(h.notifications(CONNECTION_FAILED).is_empty());
}

#[tokio::test]
async fn inactive_panel_is_terminal_and_reported() {
    let h = harness_with(|_, panel| panel.is_active = false);
    let conn = h.pending_connection(0).await;

    let err = h.provisioner.process(&h.create_task(&conn)).await.unwrap_err();

    assert!(matches!(err, TaskError::Terminal { stage: Stage::PanelResolved, .. }));
    assert!(err.to_string().contains("panel is not active"));
    assert_eq!(h.panel.add_calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.notifications(CONNECTION_FAILED).len(), 1);
}

#[tokio::test]
async fn server_without_panel_is_terminal() {
    let h = harness_with(|server, _| server.xray_panel_id = None);
    let conn = h.pending_connection(0).await;

    let err = h.provisioner.process(&h.create_task(&conn)).await.unwrap_err();
    assert!(err.is_terminal());
    assert_eq!(err.stage(), Stage::PanelResolved);
}

#[tokio::test]
async fn panel_outage_is_retryable_and_leaves_row_pending() {
    let h = harness();
    h.panel.fail_add.store(true, Ordering::SeqCst);
    let conn = h.pending_connection(0).await;

    let err = h.provisioner.process(&h.create_task(&conn)).await.unwrap_err();

    assert!(matches!(err, TaskError::Retryable { stage: Stage::ClientAdded, .. }));
    assert!(!h.row(conn.id).is_provisioned());
    assert!(h.notifications(CONNECTION_FAILED).is_empty());

    let handled = h.provisioner.handle(h.create_task(&conn)).await;
    assert!(matches!(handled, Err(HandlerError::Retryable(_))));
}

#[tokio::test]
async fn failed_write_back_is_repaired_by_adopting_panel_client() {
    let h = harness();
    let conn = h.pending_connection(0).await;
    h.store.fail_next_mark_provisioned();

    let err = h.provisioner.process(&h.create_task(&conn)).await.unwrap_err();
    assert!(matches!(err, TaskError::Retryable { stage: Stage::Persisted, .. }));
    assert_eq!(h.panel.clients().len(), 1);
    let first_uuid = h.panel.clients()[0].uuid.clone();

    h.provisioner.process(&h.create_task(&conn)).await.unwrap();

    assert_eq!(h.panel.clients().len(), 1, "redelivery must not add a second client");
    let row = h.row(conn.id);
    assert!(row.connection_key.contains(&first_uuid));
    assert_eq!(row.xray_client_id, 1);
}

#[tokio::test]
async fn deletion_during_provisioning_rolls_back_panel_client() {
    let h = harness();
    let conn = h.pending_connection(0).await;
    *h.panel.delete_row_during_add.lock().unwrap() = Some((h.store.clone(), conn.id));

    h.provisioner.process(&h.create_task(&conn)).await.unwrap();

    assert!(h.panel.clients().is_empty());
    assert_eq!(h.panel.delete_calls.load(Ordering::SeqCst), 1);
    let row = h.row(conn.id);
    assert!(row.is_deleted());
    assert!(!row.is_provisioned());
    assert!(h.notifications(CONNECTION_READY).is_empty());
}

#[tokio::test]
async fn inbound_falls_back_to_panel_then_default() {
    let h = harness_with(|server, _| server.inbound_id = 0);
    let conn = h.pending_connection(0).await;
    h.provisioner.process(&h.create_task(&conn)).await.unwrap();
    assert_eq!(h.panel.clients()[0].inbound_id, 7);

    let h = harness_with(|server, panel| {
        server.inbound_id = 0;
        panel.inbound_id = 0;
    });
    let conn = h.pending_connection(0).await;
    h.provisioner.process(&h.create_task(&conn)).await.unwrap();
    assert_eq!(h.panel.clients()[0].inbound_id, 1);
}

#[tokio::test]
async fn key_uses_panel_host_and_default_port_when_server_has_none() {
    let h = harness_with(|server, _| {
        server.host = None;
        server.port = 0;
        server.protocol = "trojan".into();
        server.country = "NL".into();
    });
    let conn = h.pending_connection(0).await;

    h.provisioner.process(&h.create_task(&conn)).await.unwrap();

    let uuid = h.panel.clients()[0].uuid.clone();
    assert_eq!(
        h.row(conn.id).connection_key,
        format!("trojan://{uuid}@panel.example.com:443?security=tls#NL-User")
    );
}

#[tokio::test]
async fn open_ended_connection_expires_in_thirty_days() {
    let h = harness();
    let conn = h.pending_connection(0).await;
    let expected = (Utc::now() + chrono::Duration::days(30)).timestamp_millis();

    h.provisioner.process(&h.create_task(&conn)).await.unwrap();

    let expiry = h.panel.clients()[0].expiry;
    assert!((expiry - expected).abs() < 5_000, "expiry {expiry} vs {expected}");
}

#[tokio::test]
async fn concurrent_deliveries_call_panel_once() {
    let h = harness();
    *h.panel.add_delay.lock().unwrap() = Some(Duration::from_millis(50));
    let conn = h.pending_connection(0).await;
    let task = h.create_task(&conn);

    let (a, b) = tokio::join!(h.provisioner.process(&task), h.provisioner.process(&task));
    a.unwrap();
    b.unwrap();

    assert_eq!(h.panel.add_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.panel.max_in_flight.load(Ordering::SeqCst), 1);
}

// ==================== DELETE ====================

#[tokio::test]
async fn delete_of_unprovisioned_connection_never_calls_panel() {
    let h = harness();
    let conn = h.pending_connection(0).await;
    h.store.soft_delete_connection(conn.id).await.unwrap();

    h.provisioner.process(&h.delete_task(&conn)).await.unwrap();

    assert_eq!(h.panel.delete_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn delete_ahead_of_soft_delete_is_retried_until_cleanup_can_run() {
    let h = harness();
    let conn = h.pending_connection(0).await;

    let early = h.provisioner.process(&h.delete_task(&conn)).await.unwrap_err();
    assert!(!early.is_terminal());
    assert_eq!(h.panel.delete_calls.load(Ordering::SeqCst), 0);

    // the create wins the lease and provisions before the row is deleted
    h.provisioner.process(&h.create_task(&conn)).await.unwrap();
    h.store.soft_delete_connection(conn.id).await.unwrap();

    h.provisioner.process(&h.delete_task(&conn)).await.unwrap();
    assert_eq!(h.panel.delete_calls.load(Ordering::SeqCst), 1);
    assert!(h.panel.clients().is_empty());
}

#[tokio::test]
async fn delete_after_soft_delete_removes_panel_client() {
    let h = harness();
    let conn = h.pending_connection(0).await;
    h.provisioner.process(&h.create_task(&conn)).await.unwrap();
    h.store.soft_delete_connection(conn.id).await.unwrap();

    h.provisioner.process(&h.delete_task(&conn)).await.unwrap();

    assert_eq!(h.panel.delete_calls.load(Ordering::SeqCst), 1);
    assert!(h.panel.clients().is_empty());
}

#[tokio::test]
async fn panel_failure_on_delete_is_acked_and_row_stays_deleted() {
    let h = harness();
    let conn = h.pending_connection(0).await;
    h.provisioner.process(&h.create_task(&conn)).await.unwrap();
    h.store.soft_delete_connection(conn.id).await.unwrap();
    h.panel.fail_delete.store(true, Ordering::SeqCst);

    let handled = h.provisioner.handle(h.delete_task(&conn)).await;

    assert!(handled.is_ok());
    assert_eq!(h.panel.delete_calls.load(Ordering::SeqCst), 1);
    let row = h.row(conn.id);
    assert!(row.is_deleted());
    assert!(!row.is_active);
}

#[tokio::test]
async fn delete_of_missing_row_is_acked() {
    let h = harness();
    let task = Task::delete_connection(h.user_id, h.server.id, Uuid::new_v4());
    h.provisioner.process(&task).await.unwrap();
    assert_eq!(h.panel.delete_calls.load(Ordering::SeqCst), 0);
}

// ==================== TRAFFIC ====================

async fn provisioned(h: &Harness, limit: i64) -> Connection {
    let conn = h.pending_connection(limit).await;
    h.provisioner.process(&h.create_task(&conn)).await.unwrap();
    h.row(conn.id)
}

fn traffic(up: i64, down: i64) -> Option<ClientTraffic> {
    Some(ClientTraffic {
        email: String::new(),
        up,
        down,
        total: 0,
    })
}

#[tokio::test]
async fn traffic_below_limit_is_recorded() {
    let h = harness();
    let conn = provisioned(&h, 10_000).await;
    *h.panel.traffic.lock().unwrap() = traffic(1_000, 2_000);

    h.provisioner
        .process(&Task::update_traffic(conn.user_id, conn.server_id, conn.id))
        .await
        .unwrap();

    let row = h.row(conn.id);
    assert_eq!(row.traffic_used, 3_000);
    assert!(row.is_active);
    assert!(h.notifications(TRAFFIC_LIMIT_REACHED).is_empty());
}

#[tokio::test]
async fn traffic_over_limit_deactivates_and_queues_cleanup() {
    let h = harness();
    let conn = provisioned(&h, 10_000).await;
    *h.panel.traffic.lock().unwrap() = traffic(6_000, 4_000);

    h.provisioner
        .process(&Task::update_traffic(conn.user_id, conn.server_id, conn.id))
        .await
        .unwrap();

    let row = h.row(conn.id);
    assert_eq!(row.traffic_used, 10_000);
    assert!(!row.is_active);
    assert!(!row.is_deleted());

    let published = h.queue.published();
    let delete_pos = published
        .iter()
        .position(|t| t.task_type == TaskType::DeleteConnection && t.connection_id == Some(conn.id))
        .expect("cleanup task queued");
    let notice_pos = published
        .iter()
        .position(|t| t.data.get("message_type").is_some_and(|m| *m == TRAFFIC_LIMIT_REACHED))
        .expect("user notified");
    assert!(delete_pos < notice_pos);
}

#[tokio::test]
async fn unlimited_connection_is_never_deactivated() {
    let h = harness();
    let conn = provisioned(&h, 0).await;
    *h.panel.traffic.lock().unwrap() = traffic(i64::MAX / 2, i64::MAX / 2);

    h.provisioner
        .process(&Task::update_traffic(conn.user_id, conn.server_id, conn.id))
        .await
        .unwrap();

    assert!(h.row(conn.id).is_active);
}

#[tokio::test]
async fn traffic_update_skips_pending_connection() {
    let h = harness();
    let conn = h.pending_connection(10).await;
    *h.panel.traffic.lock().unwrap() = traffic(100, 100);

    h.provisioner
        .process(&Task::update_traffic(conn.user_id, conn.server_id, conn.id))
        .await
        .unwrap();

    assert_eq!(h.row(conn.id).traffic_used, 0);
    assert!(h.row(conn.id).is_active);
}

#[tokio::test]
async fn sweep_queues_updates_for_live_provisioned_connections() {
    let h = harness();
    let live = provisioned(&h, 0).await;

    let other_server = {
        let mut s = fixtures::server(h.server.xray_panel_id);
        s.name = "Amsterdam".into();
        h.store.insert_server(s.clone());
        s
    };
    h.store
        .insert_connection(NewConnection {
            user_id: h.user_id,
            server_id: other_server.id,
            traffic_limit: 0,
            expires_at: None,
        })
        .await
        .unwrap();

    let sweep = TrafficSweep::new(Arc::new(h.store.clone()), Arc::new(h.queue.clone()), Duration::from_secs(600));
    assert_eq!(sweep.sweep_once().await.unwrap(), 1);

    let updates: Vec<Task> = h
        .queue
        .published()
        .into_iter()
        .filter(|t| t.task_type == TaskType::UpdateTraffic)
        .collect();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].connection_id, Some(live.id));
}

// ==================== UNKNOWN ====================

/// Counts events logged at exactly one level.
struct LevelCounter(Level, Arc<AtomicUsize>);

impl<S: Subscriber> Layer<S> for LevelCounter {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if *event.metadata().level() == self.0 {
            self.1.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[tokio::test]
async fn unknown_task_is_acked_with_one_warning() {
    let warnings = Arc::new(AtomicUsize::new(0));
    let subscriber = tracing_subscriber::registry().with(LevelCounter(Level::WARN, warnings.clone()));
    let _guard = tracing::subscriber::set_default(subscriber);

    let h = harness();
    let task: Task = serde_json::from_value(serde_json::json!({
        "type": "rotate_keys",
        "user_id": h.user_id,
    }))
    .unwrap();

    let handled = h.provisioner.handle(task).await;

    assert!(handled.is_ok());
    assert_eq!(warnings.load(Ordering::SeqCst), 1);
    assert!(h.queue.published().is_empty());
}

#[tokio::test]
async fn terminal_failure_through_consumer_logs_one_error() {
    let errors = Arc::new(AtomicUsize::new(0));
    let subscriber = tracing_subscriber::registry().with(LevelCounter(Level::ERROR, errors.clone()));
    let _guard = tracing::subscriber::set_default(subscriber);

    let h = harness_with(|_, panel| panel.is_active = false);
    let conn = h.pending_connection(0).await;
    h.queue.publish_task(&h.create_task(&conn)).await.unwrap();

    let provisioner = Arc::new(Provisioner::new(
        Arc::new(h.store.clone()),
        Arc::new(h.queue.clone()),
        Arc::new(FakeConnector(h.panel.clone())),
        "https://sub.test/",
    ));
    let (tx, rx) = watch::channel(false);
    let consumer: Arc<dyn TaskConsumer> = Arc::new(h.queue.clone());
    let options = ConsumeOptions {
        requeue_delay: Duration::from_millis(5),
        poll_interval: Duration::from_millis(10),
    };
    let worker = tokio::spawn(consume_tasks(consumer, Lane::Tasks, provisioner, options, rx));

    tokio::time::timeout(Duration::from_secs(5), async {
        while h.queue.dropped().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    tx.send(true).unwrap();
    worker.await.unwrap();

    assert_eq!(errors.load(Ordering::SeqCst), 1);
}
