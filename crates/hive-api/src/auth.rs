//! Caller authentication.
//!
//! Programmatic callers present an API key in `Authorization: Bearer`;
//! WebSocket clients may fall back to a `key` query parameter since browsers
//! cannot set headers on upgrade requests. Resolution produces the
//! [`CallerIdentity`] sum everything downstream dispatches on.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use hive_types::{CallerIdentity, HiveError};

use crate::error::ApiError;
use crate::AppState;

/// Extractor yielding the resolved caller.
#[derive(Debug, Clone)]
pub struct Caller(pub CallerIdentity);

fn bearer_from(parts: &Parts) -> Option<String> {
    let header = parts.headers.get(axum::http::header::AUTHORIZATION)?;
    let value = header.to_str().ok()?;
    value.strip_prefix("Bearer ").map(str::to_string)
}

fn query_key_from(parts: &Parts) -> Option<String> {
    let query = parts.uri.query()?;
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == "key").then(|| v.to_string())
    })
}

#[axum::async_trait]
impl FromRequestParts<AppState> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let Some(key) = bearer_from(parts).or_else(|| query_key_from(parts)) else {
            return Err(ApiError(HiveError::PermissionDenied {
                caller: "anonymous".to_string(),
                target: "api".to_string(),
            }));
        };
        let identity = state.resolver.resolve(&key).await?;
        Ok(Caller(identity))
    }
}
