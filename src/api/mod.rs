//! HTTP surface
//!
//! A small axum router around a [`DownloadRelay`]: per-user server-sent event
//! subscriptions, the current snapshot, health and an OpenAPI document. Hosts
//! that serve their own sensitive endpoints (invitations and the like) can
//! mount them through [`create_router_with`] so the sliding-window limiter
//! guards them too.

use crate::{DownloadRelay, Result};
use axum::{Router, http::HeaderValue, middleware, routing::get};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

pub mod auth;
pub mod error_response;
pub mod openapi;
pub mod rate_limit;
pub mod routes;
pub mod state;

pub use openapi::ApiDoc;
pub use state::AppState;

/// Create the API router
///
/// # Routes
///
/// - `GET /downloads` - Current merged snapshot (identity header required)
/// - `GET /events` - Server-sent progress batches (identity header required)
/// - `GET /health` - Instance health, subscriber and cache counts
/// - `GET /openapi.json` - OpenAPI specification
/// - `GET /swagger-ui` - Interactive Swagger UI documentation (if enabled)
pub fn create_router(relay: Arc<DownloadRelay>) -> Router {
    create_router_with(relay, Router::new())
}

/// Create the API router with additional host routes merged in
///
/// The extra routes sit behind the same rate limiting, tracing and CORS
/// layers as the built-in ones.
pub fn create_router_with(relay: Arc<DownloadRelay>, extra: Router<AppState>) -> Router {
    let state = AppState::new(relay);
    let config = state.config.clone();

    let router = Router::new()
        .route("/downloads", get(routes::list_downloads))
        .route("/events", get(routes::event_stream))
        .route("/health", get(routes::health_check))
        .route("/openapi.json", get(routes::openapi_spec))
        .merge(extra);

    // Merge Swagger UI routes if enabled in config (before applying state)
    let router = if config.api.swagger_ui {
        router.merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
    } else {
        router
    };

    let limiter = state.relay.limiter().clone();
    let router = router.with_state(state);

    let router = if config.rate_limit.enabled {
        let guard = Arc::new(rate_limit::PathRateLimit::new(limiter, &config.rate_limit));
        router.layer(middleware::from_fn_with_state(
            guard,
            rate_limit::rate_limit_middleware,
        ))
    } else {
        router
    };

    let router = router.layer(TraceLayer::new_for_http());

    if config.api.cors_enabled {
        let cors = build_cors_layer(&config.api.cors_origins);
        router.layer(cors)
    } else {
        router
    }
}

/// Build a CORS layer based on configured origins
///
/// `"*"` or an empty list allows any origin.
fn build_cors_layer(origins: &[String]) -> CorsLayer {
    let allow_any = origins.iter().any(|o| o == "*");

    if allow_any || origins.is_empty() {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let allowed: Vec<HeaderValue> = origins.iter().filter_map(|o| o.parse().ok()).collect();

        CorsLayer::new()
            .allow_origin(AllowOrigin::list(allowed))
            .allow_methods(Any)
            .allow_headers(Any)
    }
}

/// Serve the API on the configured bind address until `shutdown` is cancelled
///
/// # Example
///
/// ```no_run
/// use download_relay::{Config, DownloadRelay};
/// use std::sync::Arc;
/// use tokio_util::sync::CancellationToken;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let relay = Arc::new(DownloadRelay::new(Config::default()).await?);
/// relay.start().await;
///
/// download_relay::api::start_api_server(relay, CancellationToken::new()).await?;
/// # Ok(())
/// # }
/// ```
pub async fn start_api_server(relay: Arc<DownloadRelay>, shutdown: CancellationToken) -> Result<()> {
    let bind_address = relay.config().api.bind_address;

    tracing::info!(address = %bind_address, "Starting API server");

    let app = create_router(relay);

    let listener = TcpListener::bind(bind_address)
        .await
        .map_err(crate::error::Error::Io)?;

    tracing::info!(
        address = %listener.local_addr().unwrap_or(bind_address),
        "API server listening"
    );

    // ConnectInfo<SocketAddr> is required by the rate limiting middleware
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await
    .map_err(|e| crate::error::Error::ApiServerError(e.to_string()))?;

    tracing::info!("API server stopped");
    Ok(())
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;
