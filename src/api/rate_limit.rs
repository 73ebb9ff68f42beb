//! Rate limiting middleware for the API
//!
//! Requests whose path starts with one of the configured protected prefixes
//! are counted per client IP in the relay's sliding-window
//! [`RateLimiter`](crate::rate_limiter::RateLimiter). Everything else passes
//! through untouched, as do requests from exempt addresses.

use axum::{
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
};

use crate::config::RateLimitConfig;
use crate::rate_limiter::RateLimiter;

/// Middleware state: the shared limiter and which requests it applies to
#[derive(Debug)]
pub struct PathRateLimit {
    limiter: Arc<RateLimiter>,
    protected_paths: Vec<String>,
    exempt_ips: Vec<IpAddr>,
}

impl PathRateLimit {
    /// Guard the prefixes in `config` with `limiter`
    pub fn new(limiter: Arc<RateLimiter>, config: &RateLimitConfig) -> Self {
        Self {
            limiter,
            protected_paths: config.protected_paths.clone(),
            exempt_ips: config.exempt_ips.clone(),
        }
    }

    fn is_protected(&self, path: &str) -> bool {
        self.protected_paths
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
    }

    fn is_ip_exempt(&self, addr: &SocketAddr) -> bool {
        self.exempt_ips.contains(&addr.ip())
    }
}

/// Rate limiting middleware function
pub async fn rate_limit_middleware(
    State(guard): State<Arc<PathRateLimit>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request,
    next: Next,
) -> Response {
    if !guard.is_protected(req.uri().path()) || guard.is_ip_exempt(&addr) {
        return next.run(req).await;
    }

    match guard.limiter.check(&addr.ip().to_string()).await {
        Ok(()) => next.run(req).await,
        Err(e) => {
            tracing::warn!(
                client = %addr.ip(),
                path = req.uri().path(),
                "Rate limit exceeded"
            );
            e.into_response()
        }
    }
}
