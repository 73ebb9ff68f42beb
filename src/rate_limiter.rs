//! Sliding-window rate limiter
//!
//! Each key (usually a client IP) keeps the timestamps of its recent requests.
//! A check prunes timestamps older than the window, compares the remainder to
//! the limit and records the new request if there is room. The map lock is
//! held only for that prune-check-record step.
//!
//! Keys whose window has emptied are removed by [`RateLimiter::sweep`], which
//! [`RateLimiter::start_sweep`] runs on an interval so memory stays bounded
//! even for keys that never come back.

use crate::config::RateLimitConfig;
use crate::error::{Error, Result};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Sliding-window counter keyed by an arbitrary string
#[derive(Debug)]
pub struct RateLimiter {
    windows: Mutex<HashMap<String, VecDeque<Instant>>>,
    max_requests: usize,
    window: Duration,
}

impl RateLimiter {
    /// Create a limiter allowing `max_requests` per `window` per key
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            max_requests,
            window,
        }
    }

    /// Create a limiter from configuration
    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.max_requests, config.window)
    }

    /// Record a request for `key` if it is within the limit
    pub async fn allow(&self, key: &str) -> bool {
        self.check(key).await.is_ok()
    }

    /// Like [`allow`](Self::allow), but a rejection carries the wait time
    pub async fn check(&self, key: &str) -> Result<()> {
        let now = Instant::now();
        let mut windows = self.windows.lock().await;
        let stamps = windows.entry(key.to_string()).or_default();
        prune(stamps, now, self.window);

        if stamps.len() < self.max_requests {
            stamps.push_back(now);
            return Ok(());
        }

        let wait = stamps
            .front()
            .map(|oldest| (*oldest + self.window).saturating_duration_since(now))
            .unwrap_or(self.window);
        Err(Error::RateLimited {
            retry_after_secs: ceil_secs(wait),
        })
    }

    /// Requests `key` may still make in the current window
    pub async fn remaining(&self, key: &str) -> usize {
        let now = Instant::now();
        let mut windows = self.windows.lock().await;
        match windows.get_mut(key) {
            Some(stamps) => {
                prune(stamps, now, self.window);
                self.max_requests.saturating_sub(stamps.len())
            }
            None => self.max_requests,
        }
    }

    /// Drop keys with no requests inside the window; returns how many were removed
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut windows = self.windows.lock().await;
        let before = windows.len();
        windows.retain(|_, stamps| {
            prune(stamps, now, self.window);
            !stamps.is_empty()
        });
        before - windows.len()
    }

    /// Number of keys currently tracked
    pub async fn tracked_keys(&self) -> usize {
        self.windows.lock().await.len()
    }

    /// Spawn the periodic sweep
    pub fn start_sweep(
        self: &Arc<Self>,
        every: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let limiter = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let removed = limiter.sweep().await;
                        if removed > 0 {
                            tracing::debug!(removed, "Swept idle rate-limit keys");
                        }
                    }
                }
            }
        })
    }
}

fn prune(stamps: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(oldest) = stamps.front() {
        if now.saturating_duration_since(*oldest) >= window {
            stamps.pop_front();
        } else {
            break;
        }
    }
}

fn ceil_secs(duration: Duration) -> u64 {
    let secs = duration.as_secs();
    if duration.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs.max(1)
    }
}
