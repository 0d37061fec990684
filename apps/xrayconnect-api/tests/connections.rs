use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{Value, json};
use tower::ServiceExt;
use uuid::Uuid;
use xrayconnect_api::{AppState, ConnectionService, ServiceError, router};
use xrayconnect_db::memory::fixtures;
use xrayconnect_db::MemoryStore;
use xrayconnect_queue::MemoryTaskQueue;
use xrayconnect_shared::TaskType;

struct Seeded {
    store: MemoryStore,
    queue: MemoryTaskQueue,
    service: Arc<ConnectionService>,
    user_id: Uuid,
    server_id: Uuid,
}

fn seeded() -> Seeded {
    let store = MemoryStore::new();
    let queue = MemoryTaskQueue::new();

    let user = fixtures::user();
    let panel = fixtures::panel();
    let server = fixtures::server(Some(panel.id));
    let (user_id, server_id) = (user.id, server.id);
    store.insert_subscription(fixtures::subscription(user.id, 30));
    store.insert_user(user);
    store.insert_panel(panel);
    store.insert_server(server);

    let service = Arc::new(ConnectionService::new(
        Arc::new(store.clone()),
        Arc::new(queue.clone()),
    ));
    Seeded { store, queue, service, user_id, server_id }
}

#[tokio::test]
async fn create_inserts_pending_row_and_queues_task() {
    let s = seeded();
    let conn = s.service.create_connection(s.user_id, s.server_id).await.unwrap();

    assert!(!conn.is_provisioned());
    assert!(conn.connection_key.is_empty());
    assert!(conn.expires_at.is_some());

    let published = s.queue.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].task_type, TaskType::CreateConnection);
    assert_eq!(published[0].connection_id, Some(conn.id));
    assert_eq!(published[0].data["server_name"], "Frankfurt");
}

#[tokio::test]
async fn repeated_create_returns_same_row_without_new_task() {
    let s = seeded();
    let first = s.service.create_connection(s.user_id, s.server_id).await.unwrap();
    let second = s.service.create_connection(s.user_id, s.server_id).await.unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(s.store.connection_rows().len(), 1);
    assert_eq!(s.queue.published().len(), 1);
}

#[tokio::test]
async fn concurrent_creates_yield_one_row() {
    let s = seeded();
    s.store.interleave_reads(true);

    let (a, b) = tokio::join!(
        s.service.create_connection(s.user_id, s.server_id),
        s.service.create_connection(s.user_id, s.server_id),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a.id, b.id);
    assert_eq!(s.store.connection_rows().len(), 1);
    assert_eq!(s.queue.published().len(), 1);
}

#[tokio::test]
async fn check_then_insert_alone_duplicates_without_the_index() {
    let s = seeded();
    s.store.interleave_reads(true);
    s.store.without_unique_index();

    let (a, b) = tokio::join!(
        s.service.create_connection(s.user_id, s.server_id),
        s.service.create_connection(s.user_id, s.server_id),
    );

    assert_ne!(a.unwrap().id, b.unwrap().id);
    assert_eq!(s.store.connection_rows().len(), 2);
}

#[tokio::test]
async fn unknown_or_inactive_server_is_not_found() {
    let s = seeded();
    let err = s.service.create_connection(s.user_id, Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, ServiceError::NotFound("server")));

    let mut inactive = fixtures::server(None);
    inactive.is_active = false;
    let inactive_id = inactive.id;
    s.store.insert_server(inactive);
    let err = s.service.create_connection(s.user_id, inactive_id).await.unwrap_err();
    assert!(matches!(err, ServiceError::NotFound("server")));
    assert!(s.store.connection_rows().is_empty());
}

#[tokio::test]
async fn unknown_user_is_not_found() {
    let s = seeded();
    let err = s.service.create_connection(Uuid::new_v4(), s.server_id).await.unwrap_err();
    assert!(matches!(err, ServiceError::NotFound("user")));
    assert!(s.queue.published().is_empty());
}

#[tokio::test]
async fn user_without_subscription_gets_no_expiry() {
    let s = seeded();
    let user = fixtures::user();
    let user_id = user.id;
    s.store.insert_user(user);

    let conn = s.service.create_connection(user_id, s.server_id).await.unwrap();
    assert_eq!(conn.expires_at, None);
}

#[tokio::test]
async fn failed_enqueue_still_returns_pending_row() {
    let s = seeded();
    s.queue.fail_publishes(true);

    let conn = s.service.create_connection(s.user_id, s.server_id).await.unwrap();
    assert!(!conn.is_provisioned());
    assert_eq!(s.store.connection_rows().len(), 1);
    assert!(s.queue.published().is_empty());
}

#[tokio::test]
async fn delete_soft_deletes_and_queues_panel_cleanup() {
    let s = seeded();
    let conn = s.service.create_connection(s.user_id, s.server_id).await.unwrap();
    s.service.delete_connection(conn.id).await.unwrap();

    let row = s.store.connection_row(conn.id).unwrap();
    assert!(row.is_deleted());
    assert!(!row.is_active);

    let published = s.queue.published();
    assert_eq!(published.last().unwrap().task_type, TaskType::DeleteConnection);
    assert_eq!(published.last().unwrap().connection_id, Some(conn.id));

    // deleted rows are invisible to reads and to a second delete
    assert!(s.service.get_user_connections(s.user_id).await.unwrap().is_empty());
    let err = s.service.delete_connection(conn.id).await.unwrap_err();
    assert!(matches!(err, ServiceError::NotFound("connection")));

    // and a new create starts over
    let again = s.service.create_connection(s.user_id, s.server_id).await.unwrap();
    assert_ne!(again.id, conn.id);
}

#[tokio::test]
async fn delete_survives_failed_enqueue() {
    let s = seeded();
    let conn = s.service.create_connection(s.user_id, s.server_id).await.unwrap();
    s.queue.fail_publishes(true);

    s.service.delete_connection(conn.id).await.unwrap();
    assert!(s.store.connection_row(conn.id).unwrap().is_deleted());
}

#[tokio::test]
async fn listing_attaches_servers() {
    let s = seeded();
    let conn = s.service.create_connection(s.user_id, s.server_id).await.unwrap();

    let listed = s.service.get_user_connections(s.user_id).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].connection.id, conn.id);
    assert_eq!(listed[0].server.id, s.server_id);
}

fn app(s: &Seeded) -> axum::Router {
    router(AppState {
        connection_service: s.service.clone(),
    })
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn request(method: &str, uri: &str, user: Option<Uuid>, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(user) = user {
        builder = builder.header("X-User-Id", user.to_string());
    }
    match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

#[tokio::test]
async fn health_needs_no_identity() {
    let s = seeded();
    let response = app(&s).oneshot(request("GET", "/health", None, None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn missing_identity_is_unauthorized() {
    let s = seeded();
    let response = app(&s)
        .oneshot(request("GET", "/api/connections", None, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app(&s)
        .oneshot(
            Request::builder()
                .uri("/api/connections")
                .header("X-User-Id", "not-a-uuid")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn http_create_list_delete() {
    let s = seeded();
    let body = json!({ "server_id": s.server_id });

    let response = app(&s)
        .oneshot(request("POST", "/api/connections", Some(s.user_id), Some(body)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let created = body_json(response).await;
    assert_eq!(created["connection_key"], "");
    assert!(created.get("deleted_at").is_none());
    let id = created["id"].as_str().unwrap().to_string();

    let response = app(&s)
        .oneshot(request("GET", "/api/connections", Some(s.user_id), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let listed = body_json(response).await;
    assert_eq!(listed["connections"][0]["id"], id.as_str());
    assert_eq!(listed["connections"][0]["server"]["name"], "Frankfurt");

    let response = app(&s)
        .oneshot(request("DELETE", &format!("/api/connections/{id}"), Some(s.user_id), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["message"], "Connection deleted");
}

#[tokio::test]
async fn malformed_create_body_is_bad_request() {
    let s = seeded();
    for body in [json!({}), json!({ "server_id": "abc" }), json!({ "server_id": Uuid::nil() })] {
        let response = app(&s)
            .oneshot(request("POST", "/api/connections", Some(s.user_id), Some(body)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_json(response).await["error"].is_string());
    }
    assert!(s.store.connection_rows().is_empty());
}

#[tokio::test]
async fn deleting_someone_elses_connection_is_not_found() {
    let s = seeded();
    let conn = s.service.create_connection(s.user_id, s.server_id).await.unwrap();

    let response = app(&s)
        .oneshot(request(
            "DELETE",
            &format!("/api/connections/{}", conn.id),
            Some(Uuid::new_v4()),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(!s.store.connection_row(conn.id).unwrap().is_deleted());

    let response = app(&s)
        .oneshot(request("DELETE", "/api/connections/nope", Some(s.user_id), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
