use super::*;
use crate::Config;
use crate::clients::ClientAdapter;
use crate::error::{ApiError, ClientError};
use crate::types::{DownloadRecord, DownloadStatus};
use async_trait::async_trait;
use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use std::sync::Mutex;
use std::time::Duration;
use tempfile::TempDir;
use tower::ServiceExt;

mod events;

/// Adapter serving whatever records the test puts in it
struct StaticAdapter {
    name: String,
    records: Mutex<Vec<DownloadRecord>>,
}

impl StaticAdapter {
    fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            records: Mutex::new(Vec::new()),
        })
    }

    fn serve(&self, items: &[(&str, f64, DownloadStatus)]) {
        *self.records.lock().unwrap() = items
            .iter()
            .map(|(hash, progress, status)| {
                let mut record = DownloadRecord::new(&self.name, *hash, *hash);
                record.progress = *progress;
                record.status = *status;
                record
            })
            .collect();
    }
}

#[async_trait]
impl ClientAdapter for StaticAdapter {
    fn source(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "static"
    }

    async fn list_active(&self) -> std::result::Result<Vec<DownloadRecord>, ClientError> {
        Ok(self.records.lock().unwrap().clone())
    }

    async fn health_check(&self) -> std::result::Result<(), ClientError> {
        Ok(())
    }
}

/// Build a relay on a temporary database; nothing is started
async fn create_test_relay(configure: impl FnOnce(&mut Config)) -> (Arc<DownloadRelay>, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.persistence.database_path = temp_dir.path().join("relay.db");
    configure(&mut config);
    let relay = DownloadRelay::new(config).await.unwrap();
    (Arc::new(relay), temp_dir)
}

/// Relay whose snapshot already holds the given records from instance "box"
async fn relay_with_records(
    items: &[(&str, f64, DownloadStatus)],
) -> (Arc<DownloadRelay>, Arc<StaticAdapter>, TempDir) {
    let (relay, temp_dir) = create_test_relay(|_| {}).await;
    let adapter = StaticAdapter::new("box");
    adapter.serve(items);
    relay.poller().attach(adapter.clone()).await;
    relay.poller().tick().await;
    (relay, adapter, temp_dir)
}

fn get(uri: &str) -> axum::http::request::Builder {
    Request::builder()
        .uri(uri)
        .extension(ConnectInfo(SocketAddr::from(([10, 0, 0, 1], 40000))))
}

fn get_as(uri: &str, user: &str) -> Request<Body> {
    get(uri).header("x-user-id", user).body(Body::empty()).unwrap()
}

async fn json_body<T: serde::de::DeserializeOwned>(response: Response) -> T {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn test_health_endpoint() {
    let (relay, _temp_dir) = create_test_relay(|_| {}).await;
    let app = create_router(relay);

    let response = app
        .oneshot(get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json: serde_json::Value = json_body(response).await;
    assert_eq!(json["status"], "ok");
    assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
    assert_eq!(json["instances"].as_array().unwrap().len(), 0);
    assert_eq!(json["subscribers"]["connections"], 0);
    assert_eq!(json["cache"]["entries"], 0);
}

#[tokio::test]
async fn test_health_reports_unreachable_instance() {
    let (relay, _temp_dir) = create_test_relay(|config| {
        config.clients.push(
            serde_json::from_value(serde_json::json!({
                "name": "nas",
                "type": "sabnzbd",
                "base_url": "http://127.0.0.1:9",
                "api_key": "k"
            }))
            .unwrap(),
        );
    })
    .await;
    let app = create_router(relay);

    let response = app
        .oneshot(get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let json: serde_json::Value = json_body(response).await;

    assert_eq!(json["status"], "degraded");
    assert_eq!(json["instances"][0]["name"], "nas");
    assert_eq!(json["instances"][0]["kind"], "sabnzbd");
    assert_eq!(json["instances"][0]["health"]["state"], "disconnected");
}

#[tokio::test]
async fn test_downloads_requires_identity() {
    let (relay, _temp_dir) = create_test_relay(|_| {}).await;
    let app = create_router(relay);

    let response = app
        .oneshot(get("/downloads").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let error: ApiError = json_body(response).await;
    assert_eq!(error.error.code, "unauthorized");
    assert_eq!(error.error.status, 4010);
}

#[tokio::test]
async fn test_identity_header_is_configurable() {
    let (relay, _temp_dir) = create_test_relay(|config| {
        config.api.user_header = "x-forwarded-user".to_string();
    })
    .await;
    let app = create_router(relay);

    let response = app
        .clone()
        .oneshot(get_as("/downloads", "alice"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .oneshot(
            get("/downloads")
                .header("x-forwarded-user", "alice")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_downloads_returns_snapshot() {
    let (relay, _adapter, _temp_dir) = relay_with_records(&[
        ("a", 10.0, DownloadStatus::Downloading),
        ("b", 100.0, DownloadStatus::Completed),
    ])
    .await;
    let app = create_router(relay);

    let response = app
        .clone()
        .oneshot(get_as("/downloads", "alice"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let records: Vec<DownloadRecord> = json_body(response).await;
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].id, "box:a");

    let response = app
        .clone()
        .oneshot(get_as("/downloads?status=completed", "alice"))
        .await
        .unwrap();
    let records: Vec<DownloadRecord> = json_body(response).await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].hash, "b");

    let response = app
        .oneshot(get_as("/downloads?source=elsewhere", "alice"))
        .await
        .unwrap();
    let records: Vec<DownloadRecord> = json_body(response).await;
    assert!(records.is_empty());
}

#[tokio::test]
async fn test_openapi_endpoint() {
    let (relay, _temp_dir) = create_test_relay(|_| {}).await;
    let app = create_router(relay);

    let response = app
        .oneshot(get("/openapi.json").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json: serde_json::Value = json_body(response).await;
    assert!(json["paths"]["/events"].is_object());
}

#[tokio::test]
async fn test_swagger_ui_toggle() {
    let (relay, _temp_dir) = create_test_relay(|config| config.api.swagger_ui = true).await;
    let response = create_router(relay)
        .oneshot(get("/api-docs/openapi.json").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let (relay, _temp_dir) = create_test_relay(|_| {}).await;
    let response = create_router(relay)
        .oneshot(get("/api-docs/openapi.json").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_cors_enabled() {
    let (relay, _temp_dir) = create_test_relay(|config| {
        config.api.cors_enabled = true;
        config.api.cors_origins = vec!["*".to_string()];
    })
    .await;
    let app = create_router(relay);

    let response = app
        .oneshot(
            get("/health")
                .header("Origin", "http://localhost:3000")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(
        response
            .headers()
            .contains_key("access-control-allow-origin"),
        "CORS header should be present when CORS is enabled"
    );
}

#[tokio::test]
async fn test_cors_disabled() {
    let (relay, _temp_dir) = create_test_relay(|config| config.api.cors_enabled = false).await;
    let app = create_router(relay);

    let response = app
        .oneshot(
            get("/health")
                .header("Origin", "http://localhost:3000")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert!(
        !response
            .headers()
            .contains_key("access-control-allow-origin")
    );
}

#[tokio::test]
async fn test_api_server_stops_on_cancel() {
    let (relay, _temp_dir) = create_test_relay(|config| {
        config.api.bind_address = "127.0.0.1:0".parse().unwrap();
    })
    .await;

    let shutdown = CancellationToken::new();
    let server = tokio::spawn(start_api_server(relay, shutdown.clone()));
    tokio::time::sleep(Duration::from_millis(100)).await;

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(2), server)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}
