//! Service wiring and lifecycle
//!
//! [`DownloadRelay`] owns every long-lived component and the background tasks
//! that drive them. All tasks hang off one [`CancellationToken`], so
//! [`shutdown`](DownloadRelay::shutdown) stops the poll loop, the cache sweep and
//! the rate-limiter sweep together.

use crate::broadcast::Broadcaster;
use crate::cache::TtlCache;
use crate::clients::AdapterRegistry;
use crate::config::Config;
use crate::db::Database;
use crate::error::Result;
use crate::poller::{DownloadPoller, InstanceStatus};
use crate::rate_limiter::RateLimiter;
use crate::types::DownloadRecord;
use std::sync::Arc;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// The download progress relay
pub struct DownloadRelay {
    config: Arc<Config>,
    db: Arc<Database>,
    poller: Arc<DownloadPoller>,
    broadcaster: Arc<Broadcaster>,
    cache: Arc<TtlCache>,
    limiter: Arc<RateLimiter>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for DownloadRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadRelay")
            .field("clients", &self.config.clients.len())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl DownloadRelay {
    /// Build the relay with the built-in qBittorrent and SABnzbd adapters
    ///
    /// Every configured instance gets one connection attempt. Instances that
    /// fail stay in the poller and are retried with backoff; they never abort
    /// startup.
    pub async fn new(config: Config) -> Result<Self> {
        Self::with_registry(config, AdapterRegistry::with_builtin()).await
    }

    /// Build the relay with a caller-supplied adapter registry
    pub async fn with_registry(config: Config, registry: AdapterRegistry) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let db = Arc::new(Database::new(&config.persistence.database_path).await?);
        let cache = Arc::new(TtlCache::new(db.clone(), config.cache.clone()));
        let limiter = Arc::new(RateLimiter::from_config(&config.rate_limit));
        let broadcaster = Arc::new(Broadcaster::new(config.broadcast.clone()));

        let poller = Arc::new(DownloadPoller::new(
            config.poller.clone(),
            config.retry.clone(),
            config.clients.clone(),
            Arc::new(registry),
            broadcaster.clone(),
        ));
        poller.connect_all().await;

        let health = poller.instance_health().await;
        let healthy = health.iter().filter(|s| s.health.is_healthy()).count();
        tracing::info!(
            instances = health.len(),
            healthy,
            "Download relay initialized"
        );

        Ok(Self {
            config,
            db,
            poller,
            broadcaster,
            cache,
            limiter,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the poll loop, cache cleanup and rate-limiter sweep
    ///
    /// Calling it again while the tasks are running does nothing.
    pub async fn start(&self) {
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() || self.cancel.is_cancelled() {
            return;
        }

        tasks.push(self.poller.start(self.cancel.child_token()));
        tasks.push(self.cache.start_cleanup(self.cancel.child_token()));
        tasks.push(
            self.limiter
                .start_sweep(self.config.rate_limit.sweep_interval, self.cancel.child_token()),
        );

        tracing::info!("Download relay started");
    }

    /// Stop background tasks and disconnect every subscriber
    ///
    /// No final batch is broadcast.
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("Initiating relay shutdown");

        // 1. Stop the poll loop and the sweeps
        self.cancel.cancel();

        // 2. Wait for the tasks to observe cancellation
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Background task ended abnormally");
            }
        }

        // 3. Drop subscriber connections
        self.broadcaster.close_all().await;

        // 4. Release the cache database
        self.db.pool().close().await;

        tracing::info!("Relay shutdown complete");
        Ok(())
    }

    /// Whether [`shutdown`](Self::shutdown) has been called
    pub fn is_shutting_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Current merged download snapshot
    pub fn snapshot(&self) -> Arc<Vec<DownloadRecord>> {
        self.poller.snapshot()
    }

    /// Observe snapshot updates
    pub fn subscribe(&self) -> watch::Receiver<Arc<Vec<DownloadRecord>>> {
        self.poller.subscribe()
    }

    /// Health of every configured client instance
    pub async fn instance_health(&self) -> Vec<InstanceStatus> {
        self.poller.instance_health().await
    }

    /// Effective configuration
    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// The poller
    pub fn poller(&self) -> &Arc<DownloadPoller> {
        &self.poller
    }

    /// The subscriber registry
    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    /// The metadata cache
    pub fn cache(&self) -> &Arc<TtlCache> {
        &self.cache
    }

    /// The rate limiter guarding protected endpoints
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }
}
