//! Content-addressed metadata cache with tiered TTLs
//!
//! Two storage paths share one SQLite database:
//!
//! - The generic path (`api_cache`) stores an absolute `expires_at` on write.
//!   Reads only compare against it; expired rows are physically removed by the
//!   cleanup sweep started with [`TtlCache::start_cleanup`].
//! - The static-data path (`static_data`) stores `updated_at` and decides
//!   staleness on every read from [`ttl_for`], without deleting anything.
//!
//! A miss is `Ok(None)`. A [`CacheError`] always means the store failed, so the
//! caller may bypass the cache instead of treating it as a miss.

use crate::config::CacheConfig;
use crate::db::Database;
use crate::error::{CacheError, Error};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use utoipa::ToSchema;

const DAY: u64 = 24 * 60 * 60;

/// Volatility class of an upstream endpoint
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TtlTier {
    /// Taxonomies that almost never change (genres, companies, watch providers)
    Static,
    /// Title and detail lookups; also the fallback for unclassified endpoints
    Detail,
    /// Search results
    Search,
    /// High-churn lists (trending, popular, now playing)
    Trending,
}

impl TtlTier {
    const STATIC_ROOTS: &'static [&'static str] =
        &["genre", "company", "watch", "configuration", "certification"];

    const TRENDING_SEGMENTS: &'static [&'static str] = &[
        "trending",
        "popular",
        "top_rated",
        "now_playing",
        "upcoming",
        "airing_today",
        "on_the_air",
    ];

    /// Classify an endpoint path such as `genre/movie/list` or `movie/12345`
    pub fn classify(endpoint: &str) -> Self {
        let path = endpoint.trim().trim_start_matches('/').to_ascii_lowercase();
        let mut segments = path.split('/').filter(|s| !s.is_empty());

        let Some(root) = segments.next() else {
            return TtlTier::Detail;
        };

        if root == "search" {
            return TtlTier::Search;
        }
        if Self::STATIC_ROOTS.contains(&root) {
            return TtlTier::Static;
        }
        if Self::TRENDING_SEGMENTS.contains(&root)
            || segments.any(|s| Self::TRENDING_SEGMENTS.contains(&s))
        {
            return TtlTier::Trending;
        }
        TtlTier::Detail
    }

    /// Lifetime of entries in this tier
    pub fn ttl(&self) -> Duration {
        match self {
            TtlTier::Static => Duration::from_secs(30 * DAY),
            TtlTier::Detail => Duration::from_secs(7 * DAY),
            TtlTier::Search => Duration::from_secs(60 * 60),
            TtlTier::Trending => Duration::from_secs(15 * 60),
        }
    }
}

/// TTL applied to responses from `endpoint`
pub fn ttl_for(endpoint: &str) -> Duration {
    TtlTier::classify(endpoint).ttl()
}

/// Deterministic cache key over an endpoint and its parameters
///
/// Parameters are sorted by name and then value before hashing, so the order
/// they are passed in never matters. Repeated names are all kept.
pub fn cache_key<I, K, V>(endpoint: &str, params: I) -> String
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Display,
{
    let mut canonical: Vec<(String, String)> = params
        .into_iter()
        .map(|(k, v)| (k.into(), v.to_string()))
        .collect();
    canonical.sort_unstable();

    // Length-prefixed fields, so `a=b=c` cannot be produced two ways
    let mut hasher = Sha256::new();
    for field in std::iter::once(endpoint.trim())
        .chain(canonical.iter().flat_map(|(k, v)| [k.as_str(), v.as_str()]))
    {
        hasher.update((field.len() as u64).to_le_bytes());
        hasher.update(field.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// Row counts reported by [`TtlCache::stats`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct CacheStats {
    /// Rows in the generic cache
    pub entries: i64,
    /// Generic rows past expiry, waiting for the cleanup sweep
    pub expired: i64,
    /// Rows in the static-data table
    pub static_entries: i64,
}

/// Metadata cache backed by [`Database`]
pub struct TtlCache {
    db: Arc<Database>,
    config: CacheConfig,
}

impl std::fmt::Debug for TtlCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TtlCache")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl TtlCache {
    /// Create a cache over an open database
    pub fn new(db: Arc<Database>, config: CacheConfig) -> Self {
        Self { db, config }
    }

    /// Look up a generic entry; `Ok(None)` on a miss or an expired row
    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        self.db
            .get_cached_response(key, now())
            .await
            .map_err(storage)
    }

    /// Store a generic entry that expires `ttl` from now
    pub async fn set(
        &self,
        key: &str,
        endpoint: &str,
        data: &[u8],
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let expires_at = now().saturating_add(secs(ttl));
        self.db
            .put_cached_response(key, endpoint, data, expires_at)
            .await
            .map_err(storage)
    }

    /// Look up a static-data entry, treating one older than `ttl_for(endpoint)` as a miss
    ///
    /// Stale rows are not deleted.
    pub async fn get_static(
        &self,
        key: &str,
        endpoint: &str,
    ) -> Result<Option<Vec<u8>>, CacheError> {
        self.get_static_at(key, endpoint, now()).await
    }

    async fn get_static_at(
        &self,
        key: &str,
        endpoint: &str,
        now: i64,
    ) -> Result<Option<Vec<u8>>, CacheError> {
        let Some(row) = self.db.get_static_data(key).await.map_err(storage)? else {
            return Ok(None);
        };

        let age = now.saturating_sub(row.updated_at);
        if age > secs(ttl_for(endpoint)) {
            tracing::debug!(key, endpoint, age_secs = age, "Static data is stale");
            return Ok(None);
        }
        Ok(Some(row.data))
    }

    /// Store a static-data entry stamped with the current time
    pub async fn set_static(&self, key: &str, endpoint: &str, data: &[u8]) -> Result<(), CacheError> {
        self.db
            .put_static_data(key, endpoint, data, now())
            .await
            .map_err(storage)
    }

    /// Return the cached response for `(endpoint, params)`, fetching it on a miss
    ///
    /// Fresh responses are stored with [`ttl_for`]. When the store itself fails
    /// the fetch result is returned uncached.
    pub async fn get_or_fetch<I, K, V, F, Fut, E>(
        &self,
        endpoint: &str,
        params: I,
        fetch: F,
    ) -> Result<Vec<u8>, E>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Display,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<u8>, E>>,
    {
        let key = cache_key(endpoint, params);

        match self.get(&key).await {
            Ok(Some(data)) => {
                tracing::debug!(endpoint, "Cache hit");
                return Ok(data);
            }
            Ok(None) => {}
            Err(e) => {
                tracing::error!(endpoint, error = %e, "Cache read failed, bypassing cache");
                return fetch().await;
            }
        }

        let data = fetch().await?;
        if let Err(e) = self.set(&key, endpoint, &data, ttl_for(endpoint)).await {
            tracing::error!(endpoint, error = %e, "Cache write failed, response not cached");
        }
        Ok(data)
    }

    /// Delete generic entries past their expiry; returns the number removed
    pub async fn cleanup_expired(&self) -> Result<u64, CacheError> {
        self.db
            .delete_expired_responses(now())
            .await
            .map_err(storage)
    }

    /// Current row counts
    pub async fn stats(&self) -> Result<CacheStats, CacheError> {
        let counts = self.db.cache_counts(now()).await.map_err(storage)?;
        Ok(CacheStats {
            entries: counts.entries,
            expired: counts.expired,
            static_entries: counts.static_entries,
        })
    }

    /// Spawn the periodic reclaim sweep
    pub fn start_cleanup(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(cache.config.cleanup_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        match cache.cleanup_expired().await {
                            Ok(0) => {}
                            Ok(removed) => tracing::info!(removed, "Reclaimed expired cache entries"),
                            Err(e) => tracing::error!(error = %e, "Cache cleanup failed"),
                        }
                    }
                }
            }

            tracing::debug!("Cache cleanup task stopped");
        })
    }
}

fn now() -> i64 {
    Utc::now().timestamp()
}

fn secs(duration: Duration) -> i64 {
    i64::try_from(duration.as_secs()).unwrap_or(i64::MAX)
}

fn storage(err: Error) -> CacheError {
    CacheError::Storage(err.to_string())
}
