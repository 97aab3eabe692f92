//! Request handlers.

pub mod agents;
pub mod events;
pub mod executions;
pub mod internal;
pub mod schedules;

use axum::extract::{Query, State};
use axum::Json;
use chrono::{Duration, Utc};
use serde::Deserialize;
use serde_json::json;

use crate::auth::Caller;
use crate::dto::ActivityDto;
use crate::error::ApiError;
use crate::{visible_agents, AppState};

/// Service liveness.
pub async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[derive(Deserialize)]
pub struct ActivityWindow {
    /// Window size in minutes; defaults to one hour.
    #[serde(default = "default_window")]
    pub minutes: i64,
    /// Maximum rows returned.
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_window() -> i64 {
    60
}

fn default_limit() -> i64 {
    200
}

/// Recent activities over the caller's visible agent set.
pub async fn recent_activities(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Query(window): Query<ActivityWindow>,
) -> Result<Json<Vec<ActivityDto>>, ApiError> {
    let visible = visible_agents(&state, &caller).await?;
    let since = Utc::now() - Duration::minutes(window.minutes.clamp(1, 24 * 60));
    let rows = state
        .store
        .recent_activities(&visible, since, window.limit.clamp(1, 1000))
        .await?;
    Ok(Json(rows.into_iter().map(ActivityDto::from).collect()))
}
