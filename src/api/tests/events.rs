use super::*;
use futures::StreamExt;

/// Read one complete SSE frame (`event:` + `data:` lines) from the body
async fn next_event<S>(body: &mut S) -> (String, serde_json::Value)
where
    S: futures::Stream<Item = std::result::Result<axum::body::Bytes, axum::Error>> + Unpin,
{
    let mut buffer = String::new();
    while !buffer.contains("\n\n") {
        let chunk = tokio::time::timeout(Duration::from_secs(2), body.next())
            .await
            .expect("event within timeout")
            .expect("stream still open")
            .unwrap();
        buffer.push_str(std::str::from_utf8(&chunk).unwrap());
    }

    let mut name = String::new();
    let mut data = String::new();
    for line in buffer.lines() {
        if let Some(value) = line.strip_prefix("event:") {
            name = value.trim().to_string();
        } else if let Some(value) = line.strip_prefix("data:") {
            data.push_str(value.trim());
        }
    }
    (name, serde_json::from_str(&data).unwrap())
}

async fn wait_for_connections(relay: &DownloadRelay, expected: usize) {
    for _ in 0..50 {
        if relay.broadcaster().connection_count().await == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("connection count never reached {expected}");
}

#[tokio::test]
async fn test_events_requires_identity() {
    let (relay, _temp_dir) = create_test_relay(|_| {}).await;
    let app = create_router(relay.clone());

    let response = app
        .oneshot(get("/events").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(relay.broadcaster().connection_count().await, 0);
}

#[tokio::test]
async fn test_first_event_is_current_snapshot() {
    let (relay, _adapter, _temp_dir) =
        relay_with_records(&[("a", 42.0, DownloadStatus::Downloading)]).await;
    let app = create_router(relay.clone());

    let response = app.oneshot(get_as("/events", "alice")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(
        response.headers()["content-type"]
            .to_str()
            .unwrap()
            .starts_with("text/event-stream")
    );

    let mut body = response.into_body().into_data_stream();
    let (name, data) = next_event(&mut body).await;
    assert_eq!(name, "download_progress_batch");
    assert_eq!(data["type"], "download_progress_batch");
    assert_eq!(data["downloads"][0]["id"], "box:a");
    assert_eq!(data["downloads"][0]["progress"], 42.0);

    assert_eq!(relay.broadcaster().connections_for(&"alice".into()).await, 1);
}

#[tokio::test]
async fn test_changes_follow_the_snapshot() {
    let (relay, adapter, _temp_dir) =
        relay_with_records(&[("a", 42.0, DownloadStatus::Downloading)]).await;
    let app = create_router(relay.clone());

    let response = app.oneshot(get_as("/events", "alice")).await.unwrap();
    let mut body = response.into_body().into_data_stream();
    next_event(&mut body).await;

    adapter.serve(&[
        ("a", 42.5, DownloadStatus::Downloading),
        ("b", 0.0, DownloadStatus::Queued),
    ]);
    relay.poller().tick().await;

    // Only the new record; the half-point move on "a" is suppressed
    let (_, data) = next_event(&mut body).await;
    let downloads = data["downloads"].as_array().unwrap();
    assert_eq!(downloads.len(), 1);
    assert_eq!(downloads[0]["id"], "box:b");
    assert_eq!(downloads[0]["status"], "queued");
}

#[tokio::test]
async fn test_each_tab_gets_its_own_stream() {
    let (relay, _temp_dir) = create_test_relay(|_| {}).await;
    let app = create_router(relay.clone());

    let first = app.clone().oneshot(get_as("/events", "alice")).await.unwrap();
    let second = app.clone().oneshot(get_as("/events", "alice")).await.unwrap();
    let other = app.oneshot(get_as("/events", "bob")).await.unwrap();

    assert_eq!(relay.broadcaster().connection_count().await, 3);
    assert_eq!(relay.broadcaster().user_count().await, 2);

    drop(first);
    wait_for_connections(&relay, 2).await;
    drop(second);
    drop(other);
    wait_for_connections(&relay, 0).await;
}

#[tokio::test]
async fn test_shutdown_ends_streams() {
    let (relay, _temp_dir) = create_test_relay(|_| {}).await;
    let app = create_router(relay.clone());

    let response = app.oneshot(get_as("/events", "alice")).await.unwrap();
    let mut body = response.into_body().into_data_stream();
    next_event(&mut body).await;

    relay.shutdown().await.unwrap();

    let end = tokio::time::timeout(Duration::from_secs(2), body.next())
        .await
        .unwrap();
    assert!(end.is_none());
}

#[tokio::test]
async fn test_subscribe_after_shutdown_is_rejected() {
    let (relay, _temp_dir) = create_test_relay(|_| {}).await;
    relay.shutdown().await.unwrap();

    let response = create_router(relay.clone())
        .oneshot(get_as("/events", "alice"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(relay.broadcaster().connection_count().await, 0);
}

fn status_of<'a>(batch: &'a serde_json::Value, id: &str) -> Option<&'a str> {
    batch["downloads"]
        .as_array()?
        .iter()
        .find(|record| record["id"] == id)?["status"]
        .as_str()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_update_racing_a_new_subscriber_is_not_lost() {
    let (relay, adapter, _temp_dir) =
        relay_with_records(&[("a", 40.0, DownloadStatus::Downloading)]).await;
    let app = create_router(relay.clone());

    adapter.serve(&[("a", 100.0, DownloadStatus::Completed)]);
    let (_, response) = tokio::join!(
        relay.poller().tick(),
        app.oneshot(get_as("/events", "alice"))
    );
    let mut body = response.unwrap().into_body().into_data_stream();

    // Either the snapshot already has the change or the next batch carries it
    let (_, first) = next_event(&mut body).await;
    if status_of(&first, "box:a") != Some("completed") {
        let (_, next) = next_event(&mut body).await;
        assert_eq!(status_of(&next, "box:a"), Some("completed"));
    }
}
