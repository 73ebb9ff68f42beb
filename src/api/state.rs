//! Application state for the API server

use crate::{Config, DownloadRelay};
use std::sync::Arc;

/// Shared application state accessible to all route handlers
///
/// Cloned for each request (cheap Arc clone).
#[derive(Clone)]
pub struct AppState {
    /// The relay serving snapshots, subscriptions and health
    pub relay: Arc<DownloadRelay>,

    /// Configuration the relay was built with
    pub config: Arc<Config>,
}

impl AppState {
    /// Create a new AppState
    pub fn new(relay: Arc<DownloadRelay>) -> Self {
        let config = relay.config().clone();
        Self { relay, config }
    }
}
