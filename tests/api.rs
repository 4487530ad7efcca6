use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::{Body, Bytes};
use axum::http::{Request, StatusCode, header};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;
use ulid::Ulid;

use deskpool::engine::Engine;
use deskpool::http::{self, AppState, RouterOptions};
use deskpool::image::{DownloadUrlTemplate, ImageSink, MemoryImageSink, SinkError};
use deskpool::model::{AssignmentInput, NewFloor, User};
use deskpool::store::{FloorProvider, MemoryStore, WorkspaceProvider};

const PNG: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0x0D, b'I', b'H', b'D', b'R'];
const BOUNDARY: &str = "deskpool-test-boundary";

// ── Test infrastructure ──────────────────────────────────────

struct TestApp {
    app: Router,
    engine: Arc<Engine>,
    store: Arc<MemoryStore>,
    sink: MemoryImageSink,
}

fn test_app() -> TestApp {
    let sink = MemoryImageSink::new();
    build(Arc::new(sink.clone()), sink, RouterOptions::default())
}

fn build(images: Arc<dyn ImageSink>, sink: MemoryImageSink, opts: RouterOptions) -> TestApp {
    let store = Arc::new(MemoryStore::new());
    let engine = Arc::new(Engine::new(store.clone()));
    let state = AppState {
        engine: engine.clone(),
        images,
        download_url: DownloadUrlTemplate::new("https://cdn.example/{id}"),
    };
    TestApp {
        app: http::router(state, opts),
        engine,
        store,
        sink,
    }
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(req).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn with_json(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn multipart(parts: &[(&str, Option<&str>, &[u8])]) -> Request<Body> {
    let mut body = Vec::new();
    for (name, file_name, data) in parts {
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        match file_name {
            Some(f) => body.extend_from_slice(
                format!(
                    "Content-Disposition: form-data; name=\"{name}\"; filename=\"{f}\"\r\n\
                     Content-Type: application/octet-stream\r\n\r\n"
                )
                .as_bytes(),
            ),
            None => body.extend_from_slice(format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes()),
        }
        body.extend_from_slice(data);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    Request::builder()
        .method("POST")
        .uri("/floors")
        .header(header::CONTENT_TYPE, format!("multipart/form-data; boundary={BOUNDARY}"))
        .body(Body::from(body))
        .unwrap()
}

async fn seed_floor(engine: &Engine) -> Ulid {
    engine
        .create_floor(NewFloor {
            name: "Ground".into(),
            address: "1 Main St".into(),
            download_url: "https://cdn.example/seed".into(),
        })
        .await
        .unwrap()
        .id
}

async fn seed_user(engine: &Engine, name: &str) -> Ulid {
    engine
        .create_user(User {
            id: Ulid::new(),
            name: name.into(),
            department: "R&D".into(),
            email: format!("{}@example.com", name.to_lowercase()),
            is_admin: false,
        })
        .await
        .unwrap()
        .id
}

async fn post_workspace(app: &Router, floor_id: Ulid, name: &str) -> Ulid {
    let (status, body) = send(app, with_json("POST", "/workspaces", json!({ "name": name, "floor_id": floor_id }))).await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    body["id"].as_str().unwrap().parse().unwrap()
}

fn reservation(ws: Ulid, user: Ulid, start: &str, end: &str) -> Value {
    json!({ "workspace_id": ws, "user_id": user, "start_time": start, "end_time": end })
}

// ── Floors ───────────────────────────────────────────────────

#[tokio::test]
async fn health_is_ok() {
    let t = test_app();
    let (status, _) = send(&t.app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn create_floor_uploads_image_and_stores_download_url() {
    let t = test_app();
    let (status, body) = send(
        &t.app,
        multipart(&[
            ("name", None, "Ground".as_bytes()),
            ("address", None, "1 Main St".as_bytes()),
            ("image", Some("plan.png"), PNG),
        ]),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    assert_eq!(body["name"], "Ground");
    assert_eq!(t.sink.len(), 1);
    let url = body["download_url"].as_str().unwrap();
    assert!(url.starts_with("https://cdn.example/img-"), "{url}");

    let (status, list) = send(&t.app, get("/floors")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn create_floor_rejects_non_image_and_missing_fields() {
    let t = test_app();
    let (status, body) = send(
        &t.app,
        multipart(&[
            ("name", None, "Ground".as_bytes()),
            ("address", None, "1 Main St".as_bytes()),
            ("image", Some("plan.txt"), "definitely not an image".as_bytes()),
        ]),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["kind"], "validation");

    let (status, _) = send(&t.app, multipart(&[("address", None, "1 Main St".as_bytes()), ("image", Some("p.png"), PNG)])).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(t.sink.is_empty());
}

#[tokio::test]
async fn force_delete_floor() {
    let t = test_app();
    let floor = seed_floor(&t.engine).await;
    let w1 = post_workspace(&t.app, floor, "W1").await;
    let w2 = post_workspace(&t.app, floor, "W2").await;

    let (status, body) = send(&t.app, with_json("DELETE", &format!("/floors/{floor}"), json!({ "force_delete": false }))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["kind"], "invalid_operation");

    let (status, _) = send(&t.app, with_json("DELETE", &format!("/floors/{floor}"), json!({ "force_delete": true }))).await;
    assert_eq!(status, StatusCode::OK);

    let deleted: Vec<Ulid> = t.store.deleted_workspaces().await.unwrap().iter().map(|w| w.id).collect();
    assert!(deleted.contains(&w1) && deleted.contains(&w2));
    assert_eq!(t.store.deleted_floors().await.unwrap().len(), 1);
    let (status, _) = send(&t.app, get(&format!("/floors/{floor}"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn delete_empty_floor_without_body() {
    let t = test_app();
    let floor = seed_floor(&t.engine).await;
    let req = Request::builder()
        .method("DELETE")
        .uri(format!("/floors/{floor}"))
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&t.app, req).await;
    assert_eq!(status, StatusCode::OK);
}

// ── Workspaces ───────────────────────────────────────────────

#[tokio::test]
async fn workspace_crud() {
    let t = test_app();
    let floor = seed_floor(&t.engine).await;
    let ws = post_workspace(&t.app, floor, "A-1").await;

    let (status, body) = send(
        &t.app,
        with_json("PATCH", &format!("/workspaces/{ws}"), json!({ "name": "A-1 window", "floor_id": floor, "details": "by the window" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["details"], "by the window");

    let (status, body) = send(
        &t.app,
        with_json("PATCH", &format!("/workspaces/{ws}/properties"), json!({ "monitors": 2, "standing": true })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["properties"]["monitors"], 2);
    assert_eq!(body["name"], "A-1 window");

    let (status, list) = send(&t.app, get(&format!("/workspaces?floor_id={floor}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list.as_array().unwrap().len(), 1);

    let (status, _) = send(&t.app, Request::builder().method("DELETE").uri(format!("/workspaces/{ws}")).body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(&t.app, get(&format!("/workspaces/{ws}"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn put_workspace_creates_then_updates() {
    let t = test_app();
    let floor = seed_floor(&t.engine).await;
    let id = Ulid::new();

    let (status, body) = send(&t.app, with_json("PUT", &format!("/workspaces/{id}"), json!({ "name": "B-1", "floor_id": floor }))).await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    assert_eq!(body["id"], id.to_string());

    let (status, body) = send(&t.app, with_json("PUT", &format!("/workspaces/{id}"), json!({ "name": "B-1 quiet", "floor_id": floor }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["name"], "B-1 quiet");

    let (status, _) = send(&t.app, Request::builder().method("DELETE").uri(format!("/workspaces/{id}")).body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = send(&t.app, with_json("PUT", &format!("/workspaces/{id}"), json!({ "name": "B-1", "floor_id": floor }))).await;
    assert_eq!(status, StatusCode::FORBIDDEN, "{body}");
}

#[tokio::test]
async fn assigned_workspace_and_floor_ids() {
    let t = test_app();
    let floor = seed_floor(&t.engine).await;
    let owner = seed_user(&t.engine, "Ada").await;
    let guest = seed_user(&t.engine, "Grace").await;

    let (status, created) = send(
        &t.app,
        with_json(
            "POST",
            "/workspaces/assigned",
            json!({
                "name": "C-1",
                "floor_id": floor,
                "user_id": owner,
                "start_time": "2025-03-01T00:00:00Z",
                "end_time": "2025-04-01T00:00:00Z",
                "offer_by_default": true
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{created}");
    let ws: Ulid = created["workspace"]["id"].as_str().unwrap().parse().unwrap();
    assert_eq!(created["assignment"]["workspace_id"], ws.to_string());
    assert_eq!(created["offering"]["user_id"], owner.to_string());

    let (status, _) = send(
        &t.app,
        with_json("POST", "/bookings", reservation(ws, guest, "2025-03-03T09:00:00Z", "2025-03-03T17:00:00Z")),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, ids) = send(&t.app, get("/floors/ids")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ids, json!([floor]));
}

#[tokio::test]
async fn malformed_requests_are_400_with_envelope() {
    let t = test_app();
    let req = Request::builder()
        .method("POST")
        .uri("/workspaces")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, body) = send(&t.app, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["kind"], "validation");

    let (status, body) = send(&t.app, with_json("POST", "/workspaces", json!({ "name": "no floor" }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"]["message"].is_string());

    let (status, _) = send(&t.app, get("/workspaces/not-a-ulid")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(&t.app, get(&format!("/bookings/{}", Ulid::new()))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["kind"], "not_found");
}

// ── Reservations ─────────────────────────────────────────────

#[tokio::test]
async fn bare_booking_then_overlap_conflicts() {
    let t = test_app();
    let floor = seed_floor(&t.engine).await;
    let ws = post_workspace(&t.app, floor, "A-1").await;
    let u1 = seed_user(&t.engine, "Ada").await;
    let u2 = seed_user(&t.engine, "Grace").await;

    let (status, first) = send(
        &t.app,
        with_json("POST", "/bookings", reservation(ws, u1, "2025-03-01T09:00:00Z", "2025-03-01T10:00:00Z")),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{first}");
    assert_eq!(first["cancelled"], false);
    assert_eq!(first["created_by"], u1.to_string());

    let (status, body) = send(
        &t.app,
        with_json("POST", "/bookings", reservation(ws, u2, "2025-03-01T09:30:00Z", "2025-03-01T10:30:00Z")),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["kind"], "conflict");

    let (status, _) = send(
        &t.app,
        with_json("POST", "/bookings", reservation(ws, u2, "2025-03-01T10:00:00Z", "2025-03-01T11:00:00Z")),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = send(
        &t.app,
        with_json("POST", "/bookings", reservation(ws, u2, "2025-03-01T12:00:00Z", "2025-03-01T11:00:00Z")),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["kind"], "validation");
}

#[tokio::test]
async fn offering_unlocks_assigned_workspace() {
    let t = test_app();
    let floor = seed_floor(&t.engine).await;
    let ws = post_workspace(&t.app, floor, "A-1").await;
    let owner = seed_user(&t.engine, "Ada").await;
    let guest = seed_user(&t.engine, "Grace").await;

    let (status, _) = send(
        &t.app,
        with_json("POST", "/offerings", reservation(ws, owner, "2025-03-01T09:00:00Z", "2025-03-01T10:00:00Z")),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    t.engine
        .create_assignment(AssignmentInput {
            workspace_id: ws,
            user_id: owner,
            start_time: "2025-03-01T00:00:00Z".parse().unwrap(),
            end_time: "2026-01-01T00:00:00Z".parse().unwrap(),
            offer_by_default: false,
        })
        .await
        .unwrap();

    let booking = reservation(ws, guest, "2025-03-01T09:00:00Z", "2025-03-01T10:00:00Z");
    let (status, _) = send(&t.app, with_json("POST", "/bookings", booking.clone())).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, offering) = send(
        &t.app,
        with_json("POST", "/offerings", reservation(ws, owner, "2025-03-01T09:00:00Z", "2025-03-01T10:00:00Z")),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{offering}");

    let (status, _) = send(&t.app, with_json("POST", "/bookings", booking)).await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, covering) = send(
        &t.app,
        get(&format!("/workspaces/{ws}/offering?start=2025-03-01T09:15:00Z&end=2025-03-01T09:45:00Z")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(covering["id"], offering["id"]);

    let (status, assignment) = send(
        &t.app,
        get(&format!("/workspaces/{ws}/assignment?start=2025-03-01T09:00:00Z&end=2025-03-02T09:00:00Z")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(assignment["assigned"], true);
    assert_eq!(assignment["fully_assigned"], true);

    let (status, users) = send(&t.app, get("/assignments/users?at=2025-06-01T00:00:00Z")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(users[0]["name"], "Ada");
    let (status, _) = send(&t.app, get("/assignments/users")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn availability_endpoint_matches_booking_outcome() {
    let t = test_app();
    let floor = seed_floor(&t.engine).await;
    let free = post_workspace(&t.app, floor, "free").await;
    let taken = post_workspace(&t.app, floor, "taken").await;
    let user = seed_user(&t.engine, "Ada").await;
    let (status, _) = send(
        &t.app,
        with_json("POST", "/bookings", reservation(taken, user, "2025-03-01T09:00:00Z", "2025-03-01T17:00:00Z")),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = send(
        &t.app,
        get(&format!("/floors/{floor}/availability?start=2025-03-01T12:00:00Z&end=2025-03-01T13:00:00Z")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["workspace_ids"], json!([free]));

    let (status, _) = send(&t.app, get(&format!("/floors/{floor}/availability?start=2025-03-01T12:00:00Z"))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn cancel_is_idempotent_and_lists_filter() {
    let t = test_app();
    let floor = seed_floor(&t.engine).await;
    let ws = post_workspace(&t.app, floor, "A-1").await;
    let user = seed_user(&t.engine, "Ada").await;
    let (_, booking) = send(
        &t.app,
        with_json("POST", "/bookings", reservation(ws, user, "2025-03-01T09:00:00Z", "2025-03-01T10:00:00Z")),
    )
    .await;
    let id = booking["id"].as_str().unwrap().to_string();

    let delete = || Request::builder().method("DELETE").uri(format!("/bookings/{id}")).body(Body::empty()).unwrap();
    let (status, first) = send(&t.app, delete()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["cancelled"], true);
    let (status, second) = send(&t.app, delete()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first, second);

    let (status, list) = send(&t.app, get(&format!("/bookings?user_id={user}&expand=true"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list[0]["workspace_name"], "A-1");
    assert_eq!(list[0]["floor_name"], "Ground");

    let (status, list) = send(&t.app, get("/bookings?start=2025-03-01T10:00:00Z&end=2025-03-01T11:00:00Z")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(list.as_array().unwrap().is_empty());

    let (status, _) = send(&t.app, get(&format!("/bookings?user_id={user}&workspace_id={ws}"))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(
        &t.app,
        with_json("PATCH", &format!("/bookings/{id}"), reservation(ws, user, "2025-03-01T11:00:00Z", "2025-03-01T12:00:00Z")),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["kind"], "invalid_operation");
}

// ── Deadline ─────────────────────────────────────────────────

struct SlowSink;

#[async_trait]
impl ImageSink for SlowSink {
    async fn upload(&self, _name: &str, _content_type: &str, _body: Bytes) -> Result<String, SinkError> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok("late".into())
    }
}

#[tokio::test]
async fn slow_request_hits_deadline() {
    let t = build(
        Arc::new(SlowSink),
        MemoryImageSink::new(),
        RouterOptions {
            request_timeout: Duration::from_millis(50),
            max_in_flight: 4,
        },
    );
    let (status, body) = send(
        &t.app,
        multipart(&[("name", None, "Ground".as_bytes()), ("address", None, "1 Main St".as_bytes()), ("image", Some("p.png"), PNG)]),
    )
    .await;
    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(body["error"]["kind"], "timeout");
    assert!(t.engine.list_floors().await.unwrap().is_empty());
    assert!(t.store.get_all_floors().await.unwrap().is_empty());
}

// ── Logging ──────────────────────────────────────────────────

#[derive(Clone, Default)]
struct CapturedLogs(Arc<std::sync::Mutex<Vec<u8>>>);

impl CapturedLogs {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl std::io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for CapturedLogs {
    type Writer = CapturedLogs;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[tokio::test]
async fn rejected_requests_log_method_and_route() {
    let logs = CapturedLogs::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(logs.clone())
        .with_ansi(false)
        .finish();
    let _default = tracing::subscriber::set_default(subscriber);

    let t = test_app();
    let floor = seed_floor(&t.engine).await;
    let ws = post_workspace(&t.app, floor, "A-1").await;
    let u1 = seed_user(&t.engine, "Ada").await;
    let window = reservation(ws, u1, "2025-03-01T09:00:00Z", "2025-03-01T10:00:00Z");
    let (status, _) = send(&t.app, with_json("POST", "/bookings", window.clone())).await;
    assert_eq!(status, StatusCode::CREATED);
    let (status, _) = send(&t.app, with_json("POST", "/bookings", window)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    let (status, _) = send(&t.app, get("/no-such-route")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let text = logs.text();
    let rejected: Vec<&str> = text.lines().filter(|l| l.contains("request rejected")).collect();
    assert_eq!(rejected.len(), 2, "{text}");
    assert!(rejected[0].contains("method=POST"), "{text}");
    assert!(rejected[0].contains("/bookings"), "{text}");
    assert!(rejected[0].contains("status=409"), "{text}");
    assert!(rejected[1].contains("method=GET"), "{text}");
    assert!(rejected[1].contains("/no-such-route"), "{text}");
    assert!(rejected[1].contains("status=404"), "{text}");
}

