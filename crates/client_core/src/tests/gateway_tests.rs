use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Mutex as StdMutex,
};

use axum::{
    extract::{Multipart, State},
    http::header::AUTHORIZATION,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{TimeZone, Utc};
use serde_json::json;
use shared::auth::RefreshRequest;
use tokio::{net::TcpListener, sync::broadcast};

use super::*;
use crate::{
    credentials::Credential,
    refresh::HttpTokenRefresher,
    ClientEvent,
};

#[derive(Clone)]
struct Backend {
    valid_token: &'static str,
    fail_refresh: bool,
    item_hits: Arc<StdMutex<Vec<Option<String>>>>,
    refresh_calls: Arc<AtomicUsize>,
    refresh_tokens_seen: Arc<StdMutex<Vec<String>>>,
}

impl Backend {
    fn new(valid_token: &'static str) -> Self {
        Self {
            valid_token,
            fail_refresh: false,
            item_hits: Arc::new(StdMutex::new(Vec::new())),
            refresh_calls: Arc::new(AtomicUsize::new(0)),
            refresh_tokens_seen: Arc::new(StdMutex::new(Vec::new())),
        }
    }

    fn hits_with(&self, token: &str) -> usize {
        self.item_hits
            .lock()
            .unwrap()
            .iter()
            .filter(|hit| hit.as_deref() == Some(token))
            .count()
    }

    fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }
}

fn bearer(headers: &HeaderMap) -> Option<String> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::to_string)
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "code": "unauthorized", "message": "token expired" })),
    )
        .into_response()
}

async fn list_items(State(backend): State<Backend>, headers: HeaderMap) -> Response {
    let token = bearer(&headers);
    backend.item_hits.lock().unwrap().push(token.clone());
    if token.as_deref() == Some(backend.valid_token) {
        Json(json!({ "items": [1, 2, 3] })).into_response()
    } else {
        unauthorized()
    }
}

async fn refresh(State(backend): State<Backend>, Json(body): Json<RefreshRequest>) -> Response {
    backend.refresh_calls.fetch_add(1, Ordering::SeqCst);
    backend
        .refresh_tokens_seen
        .lock()
        .unwrap()
        .push(body.refresh_token);
    tokio::time::sleep(Duration::from_millis(25)).await;
    if backend.fail_refresh {
        return unauthorized();
    }
    Json(json!({
        "access_token": backend.valid_token,
        "access_token_expires_at": "2031-01-01T00:00:00Z"
    }))
    .into_response()
}

async fn missing() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "code": "not_found", "message": "no such group" })),
    )
        .into_response()
}

async fn always_unauthorized(State(backend): State<Backend>, headers: HeaderMap) -> Response {
    backend.item_hits.lock().unwrap().push(bearer(&headers));
    unauthorized()
}

async fn plain_failure() -> Response {
    (StatusCode::SERVICE_UNAVAILABLE, "").into_response()
}

async fn echo_content_type(headers: HeaderMap) -> Json<Value> {
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    Json(json!({ "content_type": content_type }))
}

async fn upload(headers: HeaderMap, mut multipart: Multipart) -> Json<Value> {
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let mut fields = Vec::new();
    while let Ok(Some(field)) = multipart.next_field().await {
        let name = field.name().unwrap_or_default().to_string();
        let file_name = field.file_name().map(str::to_string);
        let data = field.bytes().await.map(|b| b.len()).unwrap_or_default();
        fields.push(json!({ "name": name, "file_name": file_name, "len": data }));
    }
    Json(json!({ "content_type": content_type, "fields": fields }))
}

async fn spawn_backend(backend: Backend) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let app = Router::new()
        .route("/api/items", get(list_items))
        .route("/api/missing", get(missing))
        .route("/api/locked", get(always_unauthorized))
        .route("/api/unavailable", get(plain_failure))
        .route("/api/echo", post(echo_content_type))
        .route("/api/upload", post(upload))
        .route("/auth/refresh", post(refresh))
        .with_state(backend);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

struct Harness {
    gateway: Arc<RequestGateway>,
    store: Arc<CredentialStore>,
    events: broadcast::Receiver<ClientEvent>,
}

fn harness(base_url: &str, access: &str, refresh: &str) -> Harness {
    let store = Arc::new(CredentialStore::with_credential(Credential {
        access_token: access.to_string(),
        refresh_token: refresh.to_string(),
        access_expiry: Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap(),
    }));
    let (events, rx) = broadcast::channel(16);
    let http = Client::new();
    let refresher = HttpTokenRefresher::new(
        http.clone(),
        endpoint_url(base_url, "/auth/refresh").expect("refresh url"),
    );
    let coordinator = Arc::new(RefreshCoordinator::new(
        Arc::clone(&store),
        Arc::new(refresher),
        events,
    ));
    let gateway = Arc::new(RequestGateway::new(
        http,
        base_url,
        Duration::from_secs(5),
        Arc::clone(&store),
        coordinator,
    ));
    Harness {
        gateway,
        store,
        events: rx,
    }
}

#[test]
fn endpoint_url_keeps_base_path() {
    let url = endpoint_url("https://campus.example/api/v1/", "/groups").expect("url");
    assert_eq!(url.as_str(), "https://campus.example/api/v1/groups");
}

#[tokio::test]
async fn concurrent_unauthorized_calls_share_one_refresh() {
    let backend = Backend::new("T2");
    let base_url = spawn_backend(backend.clone()).await;
    let harness = harness(&base_url, "T1", "R1");

    let mut tasks = Vec::new();
    for _ in 0..3 {
        let gateway = Arc::clone(&harness.gateway);
        tasks.push(tokio::spawn(async move {
            gateway.get_json::<Value>("/api/items").await
        }));
    }
    for task in tasks {
        let body = task.await.expect("join").expect("request succeeds");
        assert_eq!(body["items"], json!([1, 2, 3]));
    }

    assert_eq!(backend.refresh_calls(), 1);
    assert_eq!(
        *backend.refresh_tokens_seen.lock().unwrap(),
        vec!["R1".to_string()]
    );
    assert_eq!(backend.hits_with("T1"), 3);
    assert_eq!(backend.hits_with("T2"), 3);
    assert_eq!(harness.store.access_token().await.as_deref(), Some("T2"));
}

#[tokio::test]
async fn refresh_failure_expires_session_for_every_caller() {
    let mut backend = Backend::new("T2");
    backend.fail_refresh = true;
    let base_url = spawn_backend(backend.clone()).await;
    let mut harness = harness(&base_url, "T1", "R1");

    let mut tasks = Vec::new();
    for _ in 0..3 {
        let gateway = Arc::clone(&harness.gateway);
        tasks.push(tokio::spawn(async move {
            gateway.execute(ApiRequest::get("/api/items")).await
        }));
    }
    for task in tasks {
        let err = task.await.expect("join").expect_err("session expired");
        assert!(err.is_session_terminal(), "unexpected error: {err}");
    }

    assert_eq!(backend.refresh_calls(), 1);
    assert_eq!(backend.hits_with("T2"), 0);
    assert!(harness.store.is_empty().await);
    assert_eq!(
        harness.events.try_recv().expect("event"),
        ClientEvent::SessionExpired
    );
    assert!(harness.events.try_recv().is_err());
}

#[tokio::test]
async fn valid_token_is_sent_as_bearer_without_refresh() {
    let backend = Backend::new("T1");
    let base_url = spawn_backend(backend.clone()).await;
    let harness = harness(&base_url, "T1", "R1");

    let response = harness
        .gateway
        .execute(ApiRequest::get("/api/items"))
        .await
        .expect("request succeeds");

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(backend.hits_with("T1"), 1);
    assert_eq!(backend.refresh_calls(), 0);
}

#[tokio::test]
async fn other_statuses_are_classified_and_never_retried() {
    let backend = Backend::new("T1");
    let base_url = spawn_backend(backend.clone()).await;
    let harness = harness(&base_url, "T1", "R1");

    let err = harness
        .gateway
        .execute(ApiRequest::get("/api/missing"))
        .await
        .expect_err("not found");
    match err {
        GatewayError::Api {
            status,
            code,
            message,
        } => {
            assert_eq!(status, 404);
            assert_eq!(code, ErrorCode::NotFound);
            assert_eq!(message, "no such group");
        }
        other => panic!("unexpected error: {other}"),
    }

    let err = harness
        .gateway
        .execute(ApiRequest::get("/api/unavailable"))
        .await
        .expect_err("unavailable");
    assert!(matches!(
        err,
        GatewayError::Api {
            status: 503,
            code: ErrorCode::Unavailable,
            ..
        }
    ));
    assert_eq!(backend.refresh_calls(), 0);
}

#[tokio::test]
async fn second_unauthorized_response_is_not_retried_again() {
    let backend = Backend::new("T2");
    let base_url = spawn_backend(backend.clone()).await;
    let harness = harness(&base_url, "T1", "R1");

    let err = harness
        .gateway
        .execute(ApiRequest::get("/api/locked"))
        .await
        .expect_err("still locked");

    assert!(matches!(err, GatewayError::AuthExpired));
    assert_eq!(backend.refresh_calls(), 1);
    assert_eq!(backend.item_hits.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn anonymous_requests_skip_token_and_refresh() {
    let backend = Backend::new("T2");
    let base_url = spawn_backend(backend.clone()).await;
    let harness = harness(&base_url, "T1", "R1");

    let err = harness
        .gateway
        .execute(ApiRequest::get("/api/locked").anonymous())
        .await
        .expect_err("unauthorized");

    assert!(matches!(err, GatewayError::Api { status: 401, .. }));
    assert_eq!(*backend.item_hits.lock().unwrap(), vec![None]);
    assert_eq!(backend.refresh_calls(), 0);
    assert_eq!(harness.store.access_token().await.as_deref(), Some("T1"));
}

#[tokio::test]
async fn binary_body_keeps_its_content_type() {
    let backend = Backend::new("T1");
    let base_url = spawn_backend(backend).await;
    let harness = harness(&base_url, "T1", "R1");

    let body: Value = harness
        .gateway
        .execute(ApiRequest::post("/api/echo").bytes("image/png", vec![0x89, 0x50, 0x4e, 0x47]))
        .await
        .expect("upload")
        .json()
        .expect("json");

    assert_eq!(body["content_type"], "image/png");
}

#[tokio::test]
async fn multipart_body_keeps_boundary_content_type() {
    let backend = Backend::new("T1");
    let base_url = spawn_backend(backend).await;
    let harness = harness(&base_url, "T1", "R1");

    let request = ApiRequest::post("/api/upload").multipart(vec![
        MultipartPart::text("caption", "lab notes"),
        MultipartPart::file(
            "attachment",
            "notes.pdf",
            Some("application/pdf".to_string()),
            vec![1; 64],
        ),
    ]);
    let body: Value = harness
        .gateway
        .execute(request)
        .await
        .expect("upload")
        .json()
        .expect("json");

    let content_type = body["content_type"].as_str().unwrap_or_default();
    assert!(
        content_type.starts_with("multipart/form-data; boundary="),
        "unexpected content type {content_type}"
    );
    assert_eq!(body["fields"][0]["name"], "caption");
    assert_eq!(body["fields"][1]["file_name"], "notes.pdf");
    assert_eq!(body["fields"][1]["len"], 64);
}

#[tokio::test]
async fn unreachable_backend_is_a_transient_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);
    let harness = harness(&format!("http://{addr}"), "T1", "R1");

    let err = harness
        .gateway
        .execute(ApiRequest::get("/api/items"))
        .await
        .expect_err("connection refused");

    assert!(matches!(err, GatewayError::Transient(_)));
    assert_eq!(harness.store.access_token().await.as_deref(), Some("T1"));
}
