//! Download snapshot handlers.

use super::DownloadsQuery;
use crate::api::AppState;
use crate::api::auth::CurrentUser;
use crate::types::DownloadRecord;
use axum::{
    Json,
    extract::{Query, State},
};

/// GET /downloads - Current merged snapshot across all client instances
#[utoipa::path(
    get,
    path = "/downloads",
    tag = "downloads",
    params(DownloadsQuery),
    responses(
        (status = 200, description = "Current downloads, ordered by source and hash", body = Vec<DownloadRecord>),
        (status = 401, description = "No user identity", body = crate::error::ApiError)
    )
)]
pub async fn list_downloads(
    State(state): State<AppState>,
    CurrentUser(_user): CurrentUser,
    Query(query): Query<DownloadsQuery>,
) -> Json<Vec<DownloadRecord>> {
    let snapshot = state.relay.snapshot();
    let records = snapshot
        .iter()
        .filter(|r| query.source.as_deref().is_none_or(|s| r.source == s))
        .filter(|r| query.status.is_none_or(|s| r.status == s))
        .cloned()
        .collect();
    Json(records)
}
