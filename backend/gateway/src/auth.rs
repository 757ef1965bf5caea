//! Gateway Authentication Module
//!
//! A single shared access keyword guards the control endpoints. `/start` and
//! `/stop` carry it in the JSON body; `/status` takes it from the
//! `x-access-keyword` header or the `keyword` query parameter.

use axum::{
    async_trait,
    extract::{FromRequestParts, Query},
    http::request::Parts,
};
use serde::Deserialize;
use tracing::warn;

use crate::error::ApiError;
use crate::server::GatewayState;

pub const KEYWORD_HEADER: &str = "x-access-keyword";

/// Exact match against the configured keyword. An empty configured keyword
/// disables the control surface entirely.
pub fn check_keyword(configured: &str, provided: Option<&str>) -> Result<(), ApiError> {
    if configured.is_empty() {
        return Err(ApiError::keyword_not_configured());
    }
    match provided {
        Some(keyword) if keyword == configured => Ok(()),
        Some(_) => {
            warn!("Rejected request with invalid access keyword");
            Err(ApiError::unauthorized())
        }
        None => {
            warn!("Rejected request without access keyword");
            Err(ApiError::unauthorized())
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct KeywordQuery {
    keyword: Option<String>,
}

/// Extractor that admits only requests carrying the access keyword in the
/// header or query string.
pub struct RequireKeyword;

#[async_trait]
impl FromRequestParts<GatewayState> for RequireKeyword {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &GatewayState,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(KEYWORD_HEADER)
            .and_then(|val| val.to_str().ok())
            .map(str::to_string);

        let provided = match header {
            Some(keyword) => Some(keyword),
            None => Query::<KeywordQuery>::from_request_parts(parts, state)
                .await
                .map(|Query(q)| q.keyword)
                .unwrap_or_default(),
        };

        check_keyword(state.access_keyword(), provided.as_deref())?;
        Ok(RequireKeyword)
    }
}
