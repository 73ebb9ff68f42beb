//! Route handlers for the HTTP surface
//!
//! Handlers are organized by domain:
//! - [`downloads`] - Snapshot of current downloads
//! - [`system`] - Health, events, OpenAPI

use crate::types::DownloadStatus;
use serde::{Deserialize, Serialize};

mod downloads;
mod system;

// Re-export all handlers so `routes::function_name` continues to work
pub use downloads::*;
pub use system::*;

/// Query parameters for GET /downloads
#[derive(Debug, Default, Deserialize, Serialize, utoipa::IntoParams, utoipa::ToSchema)]
#[into_params(parameter_in = Query)]
pub struct DownloadsQuery {
    /// Only records from this client instance
    pub source: Option<String>,
    /// Only records in this status
    pub status: Option<DownloadStatus>,
}
