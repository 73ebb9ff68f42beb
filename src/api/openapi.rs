//! OpenAPI documentation and schema generation
//!
//! Defines the OpenAPI specification for the download-relay HTTP surface using
//! utoipa for compile-time document generation.

use utoipa::OpenApi;

/// OpenAPI documentation for the download-relay HTTP surface
///
/// The document is served at:
/// - `/openapi.json` - JSON format OpenAPI specification
/// - `/swagger-ui` - Interactive Swagger UI documentation (if enabled)
#[derive(OpenApi)]
#[openapi(
    info(
        title = "download-relay API",
        version = "0.1.0",
        description = "Live download progress from torrent and Usenet clients, delivered over server-sent events",
        license(
            name = "MIT OR Apache-2.0"
        )
    ),
    servers(
        (url = "http://localhost:7878", description = "Local development server")
    ),
    paths(
        // Downloads
        crate::api::routes::list_downloads,

        // System
        crate::api::routes::health_check,
        crate::api::routes::openapi_spec,
        crate::api::routes::event_stream,
    ),
    components(schemas(
        // Core types from types.rs
        crate::types::DownloadRecord,
        crate::types::DownloadStatus,
        crate::types::OutboundMessage,
        crate::types::UserId,

        // Poller and cache views
        crate::poller::InstanceHealth,
        crate::poller::InstanceStatus,
        crate::cache::CacheStats,

        // API request/response types from routes
        crate::api::routes::DownloadsQuery,
        crate::api::routes::HealthResponse,
        crate::api::routes::SubscriberStats,

        // Error types from error.rs
        crate::error::ApiError,
        crate::error::ErrorDetail,
    )),
    tags(
        (name = "downloads", description = "Downloads - Current merged snapshot across client instances"),
        (name = "system", description = "System endpoints - Health checks, OpenAPI spec, progress events"),
    ),
    modifiers(&IdentityAddon)
)]
pub struct ApiDoc;

/// Documents the identity header set by the upstream auth layer
struct IdentityAddon;

impl utoipa::Modify for IdentityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = &mut openapi.components {
            components.add_security_scheme(
                "user_id",
                utoipa::openapi::security::SecurityScheme::ApiKey(
                    utoipa::openapi::security::ApiKey::Header(
                        utoipa::openapi::security::ApiKeyValue::new("X-User-Id"),
                    ),
                ),
            );
        }
    }
}
