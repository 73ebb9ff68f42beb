//! Subscriber identity
//!
//! Authentication happens upstream. The authenticating proxy forwards the
//! user id in a header (default `x-user-id`, see
//! [`ApiConfig::user_header`](crate::config::ApiConfig::user_header)); handlers
//! that act on behalf of a user take a [`CurrentUser`] and reject requests
//! without one with 401.

use crate::api::AppState;
use crate::error::Error;
use crate::types::UserId;
use axum::{async_trait, extract::FromRequestParts, http::request::Parts};

/// User id taken from the identity header
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CurrentUser(pub UserId);

#[async_trait]
impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = Error;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let header = state.config.api.user_header.as_str();
        let user = parts
            .headers
            .get(header)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty());

        match user {
            Some(id) => Ok(CurrentUser(UserId::new(id))),
            None => Err(Error::Unauthorized(format!("missing {} header", header))),
        }
    }
}
