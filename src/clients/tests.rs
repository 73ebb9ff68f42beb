use super::*;
use crate::types::{DownloadStatus, TimeLeft};
use wiremock::matchers::{body_string_contains, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn qb_config(base_url: &str) -> ClientConfig {
    serde_json::from_value(serde_json::json!({
        "name": "qb",
        "type": "qbittorrent",
        "base_url": base_url,
        "username": "admin",
        "password": "secret",
        "timeout": 2
    }))
    .unwrap()
}

fn sab_config(base_url: &str, api_key: &str) -> ClientConfig {
    serde_json::from_value(serde_json::json!({
        "name": "sab",
        "type": "sabnzbd",
        "base_url": base_url,
        "api_key": api_key,
        "timeout": 2
    }))
    .unwrap()
}

async fn mount_qb_login(server: &MockServer, sid: &str) {
    Mock::given(method("POST"))
        .and(path("/api/v2/auth/login"))
        .and(body_string_contains("username=admin"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("set-cookie", format!("SID={}; HttpOnly; path=/", sid).as_str())
                .set_body_string("Ok."),
        )
        .up_to_n_times(1)
        .mount(server)
        .await;
}

fn torrents_body() -> serde_json::Value {
    serde_json::json!([
        {"hash": "aaa", "name": "Movie.2024.1080p", "progress": 0.402, "eta": 600, "state": "downloading"},
        {"hash": "bbb", "name": "Show.S01", "progress": 1.0, "eta": 8640000, "state": "stalledUP"}
    ])
}

#[tokio::test]
async fn qbittorrent_login_and_list() {
    let server = MockServer::start().await;
    mount_qb_login(&server, "first").await;

    Mock::given(method("GET"))
        .and(path("/api/v2/torrents/info"))
        .and(header("cookie", "SID=first"))
        .respond_with(ResponseTemplate::new(200).set_body_json(torrents_body()))
        .mount(&server)
        .await;

    let adapter = QbittorrentAdapter::connect(qb_config(&server.uri()))
        .await
        .unwrap();
    assert_eq!(adapter.source(), "qb");
    assert_eq!(adapter.kind(), "qbittorrent");

    let records = adapter.list_active().await.unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].id, "qb:aaa");
    assert_eq!(records[0].progress, 40.2);
    assert_eq!(records[0].time_left, TimeLeft::from_secs(600));
    assert_eq!(records[1].status, DownloadStatus::Completed);
    assert_eq!(records[1].progress, 100.0);
}

#[tokio::test]
async fn qbittorrent_seeding_torrent_is_reported_once() {
    let server = MockServer::start().await;
    mount_qb_login(&server, "first").await;

    Mock::given(method("GET"))
        .and(path("/api/v2/torrents/info"))
        .respond_with(ResponseTemplate::new(200).set_body_json(torrents_body()))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v2/torrents/info"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
            {"hash": "aaa", "name": "Movie.2024.1080p", "progress": 0.95, "eta": 30, "state": "forcedDL"},
            {"hash": "bbb", "name": "Show.S01", "progress": 0.5, "eta": 900, "state": "checkingDL"}
        ])))
        .mount(&server)
        .await;

    let adapter = QbittorrentAdapter::connect(qb_config(&server.uri()))
        .await
        .unwrap();

    let first = adapter.list_active().await.unwrap();
    assert_eq!(first.len(), 2);

    // Still seeding: only the unfinished download is listed
    let second = adapter.list_active().await.unwrap();
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].hash, "aaa");

    // Rechecking pieces; it counts as unfinished again
    let third = adapter.list_active().await.unwrap();
    assert_eq!(third.len(), 2);
}

#[tokio::test]
async fn qbittorrent_rejected_password_is_permanent() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v2/auth/login"))
        .respond_with(ResponseTemplate::new(200).set_body_string("Fails."))
        .mount(&server)
        .await;

    let result = QbittorrentAdapter::connect(qb_config(&server.uri())).await;
    assert!(matches!(result, Err(ClientError::PermanentAuth { .. })));
}

#[tokio::test]
async fn qbittorrent_banned_ip_is_permanent() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v2/auth/login"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;

    let result = QbittorrentAdapter::connect(qb_config(&server.uri())).await;
    let err = result.err().unwrap();
    assert!(matches!(err, ClientError::PermanentAuth { .. }));
}

#[tokio::test]
async fn qbittorrent_expired_session_logs_in_again() {
    let server = MockServer::start().await;
    mount_qb_login(&server, "first").await;
    mount_qb_login(&server, "second").await;

    Mock::given(method("GET"))
        .and(path("/api/v2/torrents/info"))
        .and(header("cookie", "SID=first"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v2/torrents/info"))
        .and(header("cookie", "SID=second"))
        .respond_with(ResponseTemplate::new(200).set_body_json(torrents_body()))
        .mount(&server)
        .await;

    let adapter = QbittorrentAdapter::connect(qb_config(&server.uri()))
        .await
        .unwrap();
    let records = adapter.list_active().await.unwrap();
    assert_eq!(records.len(), 2);
}

#[tokio::test]
async fn qbittorrent_garbage_payload_is_decode_error() {
    let server = MockServer::start().await;
    mount_qb_login(&server, "first").await;
    Mock::given(method("GET"))
        .and(path("/api/v2/torrents/info"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>maintenance</html>"))
        .mount(&server)
        .await;

    let adapter = QbittorrentAdapter::connect(qb_config(&server.uri()))
        .await
        .unwrap();
    match adapter.list_active().await {
        Err(ClientError::Decode { instance, raw, .. }) => {
            assert_eq!(instance, "qb");
            assert!(raw.contains("maintenance"));
        }
        other => panic!("expected decode error, got {:?}", other.map(|r| r.len())),
    }
}

#[tokio::test]
async fn qbittorrent_server_error_is_transient() {
    let server = MockServer::start().await;
    mount_qb_login(&server, "first").await;
    Mock::given(method("GET"))
        .and(path("/api/v2/torrents/info"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let adapter = QbittorrentAdapter::connect(qb_config(&server.uri()))
        .await
        .unwrap();
    let result = adapter.list_active().await;
    assert!(matches!(result, Err(ClientError::TransientConnection { .. })));
}

#[tokio::test]
async fn sabnzbd_connect_and_list() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api"))
        .and(query_param("mode", "queue"))
        .and(query_param("apikey", "k3y"))
        .and(query_param("output", "json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "queue": {
                "paused": false,
                "slots": [
                    {"nzo_id": "SABnzbd_nzo_a", "filename": "Show.S01E01.nzb", "percentage": "55",
                     "timeleft": "0:04:10", "status": "Downloading", "cat": "tv"},
                    {"nzo_id": "SABnzbd_nzo_b", "filename": "Film", "percentage": "0",
                     "timeleft": "0:00:00", "status": "Queued"}
                ]
            }
        })))
        .mount(&server)
        .await;

    let adapter = SabnzbdAdapter::connect(sab_config(&server.uri(), "k3y"))
        .await
        .unwrap();
    let records = adapter.list_active().await.unwrap();

    assert_eq!(records.len(), 2);
    assert_eq!(records[0].id, "sab:SABnzbd_nzo_a");
    assert_eq!(records[0].progress, 55.0);
    assert_eq!(records[0].time_left, TimeLeft::from_secs(250));
    assert_eq!(records[0].title, "Show S01E01");
    assert_eq!(records[1].status, DownloadStatus::Queued);
    assert_eq!(records[1].time_left, TimeLeft::Unknown);
}

#[tokio::test]
async fn sabnzbd_bad_key_is_permanent() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "status": false,
            "error": "API Key Incorrect"
        })))
        .mount(&server)
        .await;

    let result = SabnzbdAdapter::connect(sab_config(&server.uri(), "wrong")).await;
    match result {
        Err(ClientError::PermanentAuth { instance, reason }) => {
            assert_eq!(instance, "sab");
            assert_eq!(reason, "API Key Incorrect");
        }
        other => panic!("expected auth error, got {:?}", other.err()),
    }
}

#[tokio::test]
async fn sabnzbd_missing_key_fails_without_request() {
    let config: ClientConfig = serde_json::from_value(serde_json::json!({
        "type": "sabnzbd",
        "base_url": "http://127.0.0.1:9"
    }))
    .unwrap();
    let result = SabnzbdAdapter::connect(config).await;
    assert!(matches!(result, Err(ClientError::InvalidConfig { .. })));
}

#[tokio::test]
async fn refused_connection_is_transient() {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let result = SabnzbdAdapter::connect(sab_config(&format!("http://127.0.0.1:{}", port), "k")).await;
    assert!(matches!(result, Err(ClientError::TransientConnection { .. })));
}

#[test]
fn base_url_keeps_path_prefix() {
    let config = sab_config("http://nas.local/sabnzbd", "k");
    let base = parse_base_url(&config).unwrap();
    let url = endpoint("sab", &base, "api").unwrap();
    assert_eq!(url.as_str(), "http://nas.local/sabnzbd/api");
}

#[test]
fn http_status_classification() {
    use reqwest::StatusCode;
    assert!(check_status("x", StatusCode::OK).is_ok());
    assert!(matches!(
        check_status("x", StatusCode::UNAUTHORIZED),
        Err(ClientError::PermanentAuth { .. })
    ));
    assert!(matches!(
        check_status("x", StatusCode::BAD_GATEWAY),
        Err(ClientError::TransientConnection { .. })
    ));
    assert!(matches!(
        check_status("x", StatusCode::NOT_FOUND),
        Err(ClientError::InvalidConfig { .. })
    ));
}

#[test]
fn lenient_numbers() {
    #[derive(serde::Deserialize)]
    struct Probe {
        #[serde(default, deserialize_with = "lenient_f64")]
        value: Option<f64>,
    }

    let parse = |json: &str| serde_json::from_str::<Probe>(json).unwrap().value;
    assert_eq!(parse(r#"{"value": 3.5}"#), Some(3.5));
    assert_eq!(parse(r#"{"value": " 42 "}"#), Some(42.0));
    assert_eq!(parse(r#"{"value": "n/a"}"#), None);
    assert_eq!(parse(r#"{"value": null}"#), None);
    assert_eq!(parse(r#"{}"#), None);
}
