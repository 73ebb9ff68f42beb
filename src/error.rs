//! Error types for download-relay
//!
//! Every failure in the relay is scoped to one backend instance, one subscriber
//! connection, or one cache operation. The types here carry enough context for
//! callers to pick a policy (retry next tick, mark degraded, drop a connection,
//! bypass the cache) and map cleanly onto HTTP responses.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

/// Result type alias for download-relay operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for download-relay
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "clients[0].base_url")
        key: Option<String>,
    },

    /// Database operation failed
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    /// Download client backend error
    #[error("client error: {0}")]
    Client(#[from] ClientError),

    /// Metadata cache error
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    /// Subscriber delivery error
    #[error("delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Too many requests from one key within the sliding window
    #[error("rate limit exceeded, retry in {retry_after_secs}s")]
    RateLimited {
        /// Seconds until the oldest request leaves the window
        retry_after_secs: u64,
    },

    /// Request lacked a user identity
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// API server error
    #[error("API server error: {0}")]
    ApiServerError(String),

    /// Shutdown in progress
    #[error("shutdown in progress")]
    ShuttingDown,
}

/// Database-related errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Failed to connect to database
    #[error("failed to connect to database: {0}")]
    ConnectionFailed(String),

    /// Failed to run migrations
    #[error("failed to run migrations: {0}")]
    MigrationFailed(String),

    /// Query failed
    #[error("query failed: {0}")]
    QueryFailed(String),
}

/// Errors raised by download client adapters
///
/// The split between transient and permanent failures lets the poller choose
/// between "try again next tick" and "back off until reconfigured".
#[derive(Debug, Error)]
pub enum ClientError {
    /// Network failure, timeout, or 5xx from the backend
    #[error("{instance}: transient connection failure: {reason}")]
    TransientConnection {
        /// Instance name
        instance: String,
        /// What went wrong
        reason: String,
    },

    /// Credentials rejected by the backend
    #[error("{instance}: authentication rejected: {reason}")]
    PermanentAuth {
        /// Instance name
        instance: String,
        /// What the backend said
        reason: String,
    },

    /// TLS handshake or certificate failure
    #[error("{instance}: TLS failure: {reason}")]
    Tls {
        /// Instance name
        instance: String,
        /// What went wrong
        reason: String,
    },

    /// Vendor payload did not have the expected shape
    #[error("{instance}: could not decode response: {reason}")]
    Decode {
        /// Instance name
        instance: String,
        /// Decoder message
        reason: String,
        /// Leading bytes of the raw payload
        raw: String,
    },

    /// No adapter registered for this backend type
    #[error("unknown backend type: {0}")]
    UnknownBackend(String),

    /// An adapter for this backend type is already registered
    #[error("backend type already registered: {0}")]
    DuplicateBackend(String),

    /// Instance configuration is unusable (missing credentials, bad URL)
    #[error("{instance}: invalid client configuration: {reason}")]
    InvalidConfig {
        /// Instance name
        instance: String,
        /// What is wrong
        reason: String,
    },
}

impl ClientError {
    /// Longest raw payload excerpt kept in a decode error
    pub const RAW_EXCERPT_LEN: usize = 512;

    /// Build a decode error keeping a bounded excerpt of the payload
    pub fn decode(instance: &str, reason: impl std::fmt::Display, raw: &[u8]) -> Self {
        let end = raw.len().min(Self::RAW_EXCERPT_LEN);
        ClientError::Decode {
            instance: instance.to_string(),
            reason: reason.to_string(),
            raw: String::from_utf8_lossy(&raw[..end]).into_owned(),
        }
    }

    /// Classify a reqwest failure for the given instance
    pub fn from_reqwest(instance: &str, err: &reqwest::Error) -> Self {
        let reason = err.to_string();
        if is_tls_failure(err) {
            return ClientError::Tls {
                instance: instance.to_string(),
                reason,
            };
        }
        ClientError::TransientConnection {
            instance: instance.to_string(),
            reason,
        }
    }
}

// reqwest does not expose a TLS predicate, so walk the source chain.
fn is_tls_failure(err: &reqwest::Error) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> = std::error::Error::source(err);
    while let Some(inner) = source {
        let text = inner.to_string().to_ascii_lowercase();
        if text.contains("certificate") || text.contains("tls") || text.contains("ssl") {
            return true;
        }
        source = inner.source();
    }
    false
}

/// Metadata cache errors
///
/// A miss is `Ok(None)`, never an error: a `CacheError` always means the
/// backing store itself failed and the caller may choose to bypass caching.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Backing store failed
    #[error("cache storage failure: {0}")]
    Storage(String),
}

impl From<sqlx::Error> for CacheError {
    fn from(err: sqlx::Error) -> Self {
        CacheError::Storage(err.to_string())
    }
}

/// Errors delivering a batch to one subscriber connection
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The peer went away
    #[error("connection closed")]
    Closed,

    /// The write did not complete in time
    #[error("send timed out after {0:?}")]
    TimedOut(std::time::Duration),

    /// Outbound queue was full and a batch was discarded
    #[error("outbound queue overflow")]
    Overflow,
}

/// API error response format
///
/// # Example JSON Response
///
/// ```json
/// {
///   "error": {
///     "code": "rate_limited",
///     "status": 4290,
///     "message": "rate limit exceeded, retry in 42s",
///     "details": { "retry_after_seconds": 42 }
///   }
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ApiError {
    /// The error details
    pub error: ErrorDetail,
}

/// Detailed error information for API responses
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorDetail {
    /// Machine-readable error code (e.g., "rate_limited")
    pub code: String,

    /// Stable numeric error code
    pub status: u32,

    /// Human-readable error message
    pub message: String,

    /// Optional additional context about the error
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    /// Create a new API error with code and message
    pub fn new(code: impl Into<String>, status: u32, message: impl Into<String>) -> Self {
        Self {
            error: ErrorDetail {
                code: code.into(),
                status,
                message: message.into(),
                details: None,
            },
        }
    }

    /// Create an "unauthorized" error
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new("unauthorized", 4010, message)
    }

    /// Create an "internal server error"
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new("internal_error", 5000, message)
    }
}

/// Convert errors to HTTP status codes for API responses
pub trait ToHttpStatus {
    /// Get the HTTP status code for this error
    fn status_code(&self) -> u16;

    /// Get the machine-readable error code
    fn error_code(&self) -> &str;

    /// Get the stable numeric error code
    ///
    /// The HTTP status times ten plus a discriminator, so codes sharing an HTTP
    /// status stay distinct.
    fn numeric_code(&self) -> u32;
}

impl ToHttpStatus for Error {
    fn status_code(&self) -> u16 {
        match self {
            Error::Config { .. } => 400,
            Error::Unauthorized(_) => 401,
            Error::RateLimited { .. } => 429,

            Error::Client(ClientError::UnknownBackend(_)) => 400,
            Error::Client(ClientError::InvalidConfig { .. }) => 400,
            Error::Client(ClientError::DuplicateBackend(_)) => 409,

            Error::Database(_) => 500,
            Error::Io(_) => 500,
            Error::ApiServerError(_) => 500,
            Error::Serialization(_) => 500,
            Error::Delivery(_) => 500,

            Error::Client(_) => 502,

            Error::Cache(_) => 503,
            Error::ShuttingDown => 503,
        }
    }

    fn error_code(&self) -> &str {
        match self {
            Error::Config { .. } => "config_error",
            Error::Database(_) => "database_error",
            Error::Client(e) => match e {
                ClientError::TransientConnection { .. } => "client_unreachable",
                ClientError::PermanentAuth { .. } => "client_auth_failed",
                ClientError::Tls { .. } => "client_tls_failed",
                ClientError::Decode { .. } => "client_decode_failed",
                ClientError::UnknownBackend(_) => "unknown_backend",
                ClientError::DuplicateBackend(_) => "duplicate_backend",
                ClientError::InvalidConfig { .. } => "invalid_client_config",
            },
            Error::Cache(_) => "cache_storage_failure",
            Error::Delivery(_) => "delivery_failure",
            Error::Io(_) => "io_error",
            Error::Serialization(_) => "serialization_error",
            Error::RateLimited { .. } => "rate_limited",
            Error::Unauthorized(_) => "unauthorized",
            Error::ApiServerError(_) => "api_server_error",
            Error::ShuttingDown => "shutting_down",
        }
    }

    fn numeric_code(&self) -> u32 {
        let discriminator = match self {
            Error::Client(ClientError::PermanentAuth { .. }) => 1,
            Error::Client(ClientError::Tls { .. }) => 2,
            Error::Client(ClientError::Decode { .. }) => 3,
            Error::Client(ClientError::InvalidConfig { .. }) => 1,
            Error::Client(ClientError::UnknownBackend(_)) => 2,
            Error::Database(_) => 1,
            Error::Io(_) => 2,
            Error::ApiServerError(_) => 3,
            Error::Serialization(_) => 4,
            Error::Delivery(_) => 5,
            Error::ShuttingDown => 1,
            _ => 0,
        };
        u32::from(self.status_code()) * 10 + discriminator
    }
}

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        let code = error.error_code().to_string();
        let status = error.numeric_code();
        let message = error.to_string();

        let details = match &error {
            Error::RateLimited { retry_after_secs } => Some(serde_json::json!({
                "retry_after_seconds": retry_after_secs,
            })),
            Error::Config { key: Some(key), .. } => Some(serde_json::json!({
                "key": key,
            })),
            Error::Client(
                ClientError::TransientConnection { instance, .. }
                | ClientError::PermanentAuth { instance, .. }
                | ClientError::Tls { instance, .. }
                | ClientError::Decode { instance, .. }
                | ClientError::InvalidConfig { instance, .. },
            ) => Some(serde_json::json!({
                "instance": instance,
            })),
            _ => None,
        };

        ApiError {
            error: ErrorDetail {
                code,
                status,
                message,
                details,
            },
        }
    }
}
