//! System handlers: health, OpenAPI, events.

use crate::api::AppState;
use crate::api::auth::CurrentUser;
use crate::broadcast::{Broadcaster, ChannelSink, ConnectionId};
use crate::cache::CacheStats;
use crate::poller::InstanceStatus;
use crate::types::OutboundMessage;
use axum::{
    Json,
    extract::State,
    response::{
        IntoResponse,
        sse::{Event as SseEvent, KeepAlive, Sse},
    },
};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use utoipa::ToSchema;

/// Batches buffered between a connection's writer task and its SSE stream
const SSE_CHANNEL_BUFFER: usize = 4;

/// Subscriber counts reported by /health
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SubscriberStats {
    /// Live connections
    pub connections: usize,
    /// Distinct users behind them
    pub users: usize,
}

/// Response for GET /health
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    /// "ok" when every client instance is healthy, otherwise "degraded"
    pub status: String,
    /// Crate version
    pub version: String,
    /// Per-instance health
    pub instances: Vec<InstanceStatus>,
    /// Subscriber counts
    pub subscribers: SubscriberStats,
    /// Cache row counts; absent when the cache store is failing
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheStats>,
}

/// GET /health - Instance health, subscriber and cache counts
#[utoipa::path(
    get,
    path = "/health",
    tag = "system",
    responses(
        (status = 200, description = "Relay health", body = HealthResponse)
    )
)]
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let relay = &state.relay;
    let instances = relay.instance_health().await;

    let cache = match relay.cache().stats().await {
        Ok(stats) => Some(stats),
        Err(e) => {
            tracing::error!(error = %e, "Failed to read cache stats");
            None
        }
    };

    let status = if instances.iter().all(|i| i.health.is_healthy()) {
        "ok"
    } else {
        "degraded"
    };

    Json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        instances,
        subscribers: SubscriberStats {
            connections: relay.broadcaster().connection_count().await,
            users: relay.broadcaster().user_count().await,
        },
        cache,
    })
}

/// GET /openapi.json - OpenAPI specification
#[utoipa::path(
    get,
    path = "/openapi.json",
    tag = "system",
    responses(
        (status = 200, description = "OpenAPI 3 specification in JSON format")
    )
)]
pub async fn openapi_spec() -> impl IntoResponse {
    use crate::api::openapi::ApiDoc;
    use utoipa::OpenApi;

    Json(ApiDoc::openapi())
}

/// GET /events - Server-sent download progress batches for the calling user
///
/// The first event carries the current snapshot; later events carry only the
/// records that changed.
#[utoipa::path(
    get,
    path = "/events",
    tag = "system",
    responses(
        (status = 200, description = "Server-sent events stream (text/event-stream)", content_type = "text/event-stream", body = OutboundMessage),
        (status = 401, description = "No user identity", body = crate::error::ApiError),
        (status = 503, description = "Relay is shutting down", body = crate::error::ApiError)
    )
)]
pub async fn event_stream(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
) -> crate::Result<Sse<impl tokio_stream::Stream<Item = Result<SseEvent, Infallible>>>> {
    if state.relay.is_shutting_down() {
        return Err(crate::Error::ShuttingDown);
    }

    let broadcaster = state.relay.broadcaster().clone();
    let (sink, rx) = ChannelSink::new(SSE_CHANNEL_BUFFER);
    let id = broadcaster.register(user.clone(), sink).await;
    tracing::debug!(user_id = %user, connection_id = id, "SSE subscriber connected");

    // Read after registering so a concurrent tick lands in the snapshot or the queue
    let initial = Arc::new(OutboundMessage::progress_batch(
        state.relay.snapshot().to_vec(),
    ));

    let registration = Registration { broadcaster, id };

    let stream = tokio_stream::once(initial)
        .chain(ReceiverStream::new(rx))
        .filter_map(move |message| {
            let _registration = &registration;
            match SseEvent::default()
                .event(message.event_name())
                .json_data(&*message)
            {
                Ok(event) => Some(Ok(event)),
                Err(e) => {
                    tracing::warn!("Failed to serialize event to JSON: {}", e);
                    None
                }
            }
        });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// Unregisters the connection when the SSE stream is dropped
struct Registration {
    broadcaster: Arc<Broadcaster>,
    id: ConnectionId,
}

impl Drop for Registration {
    fn drop(&mut self) {
        let broadcaster = self.broadcaster.clone();
        let id = self.id;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if broadcaster.unregister(id).await {
                    tracing::debug!(connection_id = id, "SSE subscriber disconnected");
                }
            });
        }
    }
}
