//! Download client adapters
//!
//! Each supported backend family implements [`ClientAdapter`], translating its
//! authentication scheme, progress unit and status vocabulary into the
//! canonical [`DownloadRecord`]. Adapters are constructed through the
//! [`AdapterRegistry`] so the poller never names a concrete backend.
//!
//! - [`qbittorrent`] - session-cookie login, fractional progress
//! - [`sabnzbd`] - API key query parameter, percentage progress
//! - [`registry`] - backend type string to constructor mapping

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::types::DownloadRecord;
use async_trait::async_trait;
use serde::{Deserialize, Deserializer};
use std::time::Duration;

pub mod qbittorrent;
pub mod registry;
pub mod sabnzbd;

pub use qbittorrent::QbittorrentAdapter;
pub use registry::AdapterRegistry;
pub use sabnzbd::SabnzbdAdapter;

/// Request timeout used when neither the instance nor the poller supplies one
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Capability shared by every download client backend
///
/// Implementations must be cheap to call concurrently: the poller invokes
/// [`list_active`](ClientAdapter::list_active) once per tick from its own task
/// and drops the future if the per-instance timeout fires.
#[async_trait]
pub trait ClientAdapter: Send + Sync {
    /// Instance name, used as the `source` of every record
    fn source(&self) -> &str;

    /// Backend type identifier (e.g. "qbittorrent")
    fn kind(&self) -> &'static str;

    /// Fetch the backend's current downloads, normalized
    ///
    /// # Errors
    ///
    /// - [`ClientError::TransientConnection`] for network failures and 5xx
    /// - [`ClientError::PermanentAuth`] when the session or key is rejected
    /// - [`ClientError::Decode`] when the payload shape is not understood
    async fn list_active(&self) -> Result<Vec<DownloadRecord>, ClientError>;

    /// Re-validate connectivity and credentials
    async fn health_check(&self) -> Result<(), ClientError>;
}

/// Build the HTTP client for one instance, honoring its TLS and timeout settings
pub(crate) fn build_http_client(config: &ClientConfig) -> Result<reqwest::Client, ClientError> {
    let timeout = config.timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT);
    reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout)
        .danger_accept_invalid_certs(!config.tls_verify)
        .user_agent(concat!("download-relay/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| ClientError::InvalidConfig {
            instance: config.instance_name(),
            reason: format!("failed to build HTTP client: {}", e),
        })
}

/// Parse the instance base URL, making sure it ends with a slash so that
/// relative joins keep any path prefix (reverse-proxied installs).
pub(crate) fn parse_base_url(config: &ClientConfig) -> Result<url::Url, ClientError> {
    let mut raw = config.base_url.trim().to_string();
    if !raw.ends_with('/') {
        raw.push('/');
    }
    url::Url::parse(&raw).map_err(|e| ClientError::InvalidConfig {
        instance: config.instance_name(),
        reason: format!("invalid base URL '{}': {}", config.base_url, e),
    })
}

/// Join a relative API path onto the base URL
pub(crate) fn endpoint(instance: &str, base: &url::Url, path: &str) -> Result<url::Url, ClientError> {
    base.join(path).map_err(|e| ClientError::InvalidConfig {
        instance: instance.to_string(),
        reason: format!("cannot build endpoint '{}': {}", path, e),
    })
}

/// Map an HTTP status to the client error taxonomy, or `Ok` for 2xx
pub(crate) fn check_status(
    instance: &str,
    status: reqwest::StatusCode,
) -> Result<(), ClientError> {
    if status.is_success() {
        return Ok(());
    }
    let reason = format!("HTTP {}", status);
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        return Err(ClientError::PermanentAuth {
            instance: instance.to_string(),
            reason,
        });
    }
    if status.is_server_error()
        || status == reqwest::StatusCode::REQUEST_TIMEOUT
        || status == reqwest::StatusCode::TOO_MANY_REQUESTS
    {
        return Err(ClientError::TransientConnection {
            instance: instance.to_string(),
            reason,
        });
    }
    Err(ClientError::InvalidConfig {
        instance: instance.to_string(),
        reason: format!("unexpected {}", reason),
    })
}

/// Decode a JSON payload, keeping a raw excerpt on failure
pub(crate) fn decode_json<T: serde::de::DeserializeOwned>(
    instance: &str,
    body: &[u8],
) -> Result<T, ClientError> {
    serde_json::from_slice(body).map_err(|e| {
        tracing::warn!(
            instance = %instance,
            error = %e,
            raw = %String::from_utf8_lossy(&body[..body.len().min(ClientError::RAW_EXCERPT_LEN)]),
            "Failed to decode client response"
        );
        ClientError::decode(instance, e, body)
    })
}

/// Accept a number, a numeric string, or null
///
/// Vendors are inconsistent about quoting numbers; anything unparseable
/// becomes `None` rather than a misleading zero.
pub(crate) fn lenient_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(f64),
        Text(String),
    }

    Ok(match Option::<Raw>::deserialize(deserializer)? {
        Some(Raw::Number(n)) => Some(n),
        Some(Raw::Text(s)) => s.trim().parse().ok(),
        None => None,
    })
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;
