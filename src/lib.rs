//! # download-relay
//!
//! Real-time download progress aggregation for torrent and Usenet clients.
//!
//! The relay polls every configured download client (qBittorrent, SABnzbd, or
//! any adapter registered at startup), normalizes their vendor-specific states
//! into one [`DownloadRecord`] model, and pushes the records that changed to
//! every connected subscriber without letting a slow connection hold up the
//! others.
//!
//! ## Design Philosophy
//!
//! - **Failure stays local** - one broken client, connection or cache write
//!   never affects the rest
//! - **Sensible defaults** - an empty JSON config is a valid (idle) relay
//! - **Library-first** - the HTTP surface is optional glue on top of
//!   [`DownloadRelay`]
//!
//! ## Quick Start
//!
//! ```no_run
//! use download_relay::{Config, DownloadRelay, run_with_shutdown};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config: Config = serde_json::from_str(r#"{
//!         "clients": [
//!             {"type": "qbittorrent", "base_url": "http://seedbox:8080",
//!              "username": "admin", "password": "adminadmin"},
//!             {"type": "sabnzbd", "base_url": "http://nas:8085", "api_key": "..."}
//!         ]
//!     }"#)?;
//!
//!     let relay = DownloadRelay::new(config).await?;
//!     relay.start().await;
//!
//!     let mut snapshots = relay.subscribe();
//!     tokio::spawn(async move {
//!         while snapshots.changed().await.is_ok() {
//!             println!("{} downloads", snapshots.borrow().len());
//!         }
//!     });
//!
//!     run_with_shutdown(relay).await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// HTTP surface (SSE subscriptions, snapshot, health)
pub mod api;
/// Subscriber connection registry and fan-out
pub mod broadcast;
/// Metadata cache with tiered TTLs
pub mod cache;
/// Download client adapters
pub mod clients;
/// Configuration types
pub mod config;
/// Database persistence layer
pub mod db;
/// Error types
pub mod error;
/// Periodic polling and change detection
pub mod poller;
/// Sliding-window rate limiting
pub mod rate_limiter;
/// Service wiring and lifecycle
pub mod relay;
/// Backoff for degraded client instances
pub mod retry;
/// Core types
pub mod types;

// Re-export commonly used types
pub use broadcast::{Broadcaster, ChannelSink, ConnectionId, MessageSink};
pub use cache::{CacheStats, TtlCache, TtlTier, cache_key, ttl_for};
pub use clients::{AdapterRegistry, ClientAdapter, QbittorrentAdapter, SabnzbdAdapter};
pub use config::{ClientConfig, Config};
pub use db::Database;
pub use error::{
    ApiError, CacheError, ClientError, DatabaseError, DeliveryError, Error, ErrorDetail, Result,
    ToHttpStatus,
};
pub use poller::{DownloadPoller, InstanceHealth, InstanceStatus};
pub use rate_limiter::RateLimiter;
pub use relay::DownloadRelay;
pub use types::{DownloadRecord, DownloadStatus, OutboundMessage, TimeLeft, UserId};

/// Helper function to run the relay with graceful signal handling.
///
/// Waits for a termination signal and then calls the relay's `shutdown()` method.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
pub async fn run_with_shutdown(relay: DownloadRelay) -> Result<()> {
    wait_for_signal().await;
    relay.shutdown().await
}

// A handler that cannot be registered never fires; the other one still can.
async fn wait_for_signal() {
    let interrupt = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Received SIGINT signal (Ctrl+C)"),
            Err(e) => {
                tracing::warn!(error = %e, "Could not listen for Ctrl+C");
                std::future::pending::<()>().await
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                tracing::info!("Received SIGTERM signal");
            }
            Err(e) => {
                tracing::warn!(error = %e, "Could not register SIGTERM handler");
                std::future::pending::<()>().await
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => {}
        _ = terminate => {}
    }
}
