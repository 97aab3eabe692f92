//! Deterministic error-to-status mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use hive_types::HiveError;
use serde_json::json;
use tracing::error;

/// Wrapper turning workspace errors into HTTP responses.
#[derive(Debug)]
pub struct ApiError(pub HiveError);

impl From<HiveError> for ApiError {
    fn from(err: HiveError) -> Self {
        Self(err)
    }
}

/// The status a kind maps to. One kind, one status, no exceptions.
pub fn status_for(err: &HiveError) -> StatusCode {
    match err {
        HiveError::Validation(_) => StatusCode::BAD_REQUEST,
        HiveError::NotFound(_) => StatusCode::NOT_FOUND,
        HiveError::PermissionDenied { .. } => StatusCode::FORBIDDEN,
        HiveError::Busy { .. } => StatusCode::CONFLICT,
        HiveError::Conflict(_) => StatusCode::CONFLICT,
        HiveError::DependencyUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        HiveError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        HiveError::Cancelled => StatusCode::CONFLICT,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("internal error surfaced to API: {}", self.0);
        }
        let mut body = json!({
            "error": self.0.kind(),
            "message": self.0.to_string(),
        });
        if let HiveError::Busy { holder, retry_after_secs } = &self.0 {
            body["holder"] = json!(holder);
            body["retry_after_secs"] = json!(retry_after_secs);
        }
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapping_is_deterministic() {
        assert_eq!(status_for(&HiveError::Validation("x".into())), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(&HiveError::NotFound("x".into())), StatusCode::NOT_FOUND);
        assert_eq!(
            status_for(&HiveError::PermissionDenied { caller: "a".into(), target: "b".into() }),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            status_for(&HiveError::Busy { holder: "u".into(), retry_after_secs: 3 }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&HiveError::DependencyUnavailable("redis".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(status_for(&HiveError::Internal("bug".into())),
            StatusCode::INTERNAL_SERVER_ERROR);
    }
}
