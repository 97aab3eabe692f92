//! Schedule CRUD and the manual trigger.
//!
//! Agent-scoped callers may manage only their own agent's schedules; an
//! attempt to touch another agent's is `permission_denied`. The scheduler
//! process is the only evaluator; these endpoints just maintain state and
//! compute the initial `next_run_at` so new schedules fire without waiting
//! for a resync.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use hive_scheduler::next_fire;
use hive_store::ScheduleRecord;
use hive_types::{AgentName, HiveError};
use serde::Deserialize;

use crate::auth::Caller;
use crate::dto::{ExecutionDto, ScheduleDto};
use crate::error::ApiError;
use crate::{parse_name, require_manage, AppState};

async fn schedule_on_agent(
    state: &AppState,
    name: &AgentName,
    id: i64,
) -> Result<ScheduleRecord, ApiError> {
    state
        .store
        .schedule_by_id(id)
        .await?
        .filter(|s| s.agent == *name)
        .ok_or_else(|| ApiError(HiveError::NotFound(format!("schedule {id}"))))
}

pub async fn list(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(name): Path<String>,
) -> Result<Json<Vec<ScheduleDto>>, ApiError> {
    let name = parse_name(&name)?;
    require_manage(&state, &caller, &name).await?;
    let rows = state.store.schedules_for_agent(&name).await?;
    Ok(Json(rows.into_iter().map(ScheduleDto::from).collect()))
}

#[derive(Deserialize)]
pub struct CreateBody {
    pub cron: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    pub message: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub parallel: bool,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_enabled() -> bool {
    true
}

pub async fn create(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(name): Path<String>,
    Json(body): Json<CreateBody>,
) -> Result<(StatusCode, Json<ScheduleDto>), ApiError> {
    let name = parse_name(&name)?;
    require_manage(&state, &caller, &name).await?;
    if body.message.trim().is_empty() {
        return Err(ApiError(HiveError::Validation("schedule message is empty".into())));
    }
    // Validates the expression and the timezone in one step.
    let next = next_fire(&body.cron, &body.timezone, Utc::now())?;
    let record = state
        .store
        .create_schedule(
            &name,
            &body.cron,
            &body.timezone,
            &body.message,
            body.enabled,
            body.parallel,
            Some(next),
        )
        .await?;
    Ok((StatusCode::CREATED, Json(ScheduleDto::from(record))))
}

pub async fn show(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path((name, id)): Path<(String, i64)>,
) -> Result<Json<ScheduleDto>, ApiError> {
    let name = parse_name(&name)?;
    require_manage(&state, &caller, &name).await?;
    let record = schedule_on_agent(&state, &name, id).await?;
    Ok(Json(ScheduleDto::from(record)))
}

#[derive(Deserialize)]
pub struct UpdateBody {
    pub cron: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    pub message: String,
    #[serde(default)]
    pub parallel: bool,
}

pub async fn update(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path((name, id)): Path<(String, i64)>,
    Json(body): Json<UpdateBody>,
) -> Result<Json<ScheduleDto>, ApiError> {
    let name = parse_name(&name)?;
    require_manage(&state, &caller, &name).await?;
    schedule_on_agent(&state, &name, id).await?;
    let next = next_fire(&body.cron, &body.timezone, Utc::now())?;
    state
        .store
        .update_schedule(id, &body.cron, &body.timezone, &body.message, body.parallel, Some(next))
        .await?;
    let record = schedule_on_agent(&state, &name, id).await?;
    Ok(Json(ScheduleDto::from(record)))
}

pub async fn destroy(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path((name, id)): Path<(String, i64)>,
) -> Result<StatusCode, ApiError> {
    let name = parse_name(&name)?;
    require_manage(&state, &caller, &name).await?;
    schedule_on_agent(&state, &name, id).await?;
    state.store.delete_schedule(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn enable(
    State(state): State<AppState>,
    caller: Caller,
    Path((name, id)): Path<(String, i64)>,
) -> Result<StatusCode, ApiError> {
    set_enabled(state, caller, name, id, true).await
}

pub async fn disable(
    State(state): State<AppState>,
    caller: Caller,
    Path((name, id)): Path<(String, i64)>,
) -> Result<StatusCode, ApiError> {
    set_enabled(state, caller, name, id, false).await
}

async fn set_enabled(
    state: AppState,
    Caller(caller): Caller,
    name: String,
    id: i64,
    enabled: bool,
) -> Result<StatusCode, ApiError> {
    let name = parse_name(&name)?;
    require_manage(&state, &caller, &name).await?;
    schedule_on_agent(&state, &name, id).await?;
    state.store.set_schedule_enabled(id, enabled).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Manual fire: same path as a cron fire minus the cron advance.
pub async fn trigger(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path((name, id)): Path<(String, i64)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let name = parse_name(&name)?;
    require_manage(&state, &caller, &name).await?;
    schedule_on_agent(&state, &name, id).await?;
    let execution_id = state.scheduler.trigger_now(id, &caller).await?;
    Ok(Json(serde_json::json!({ "execution_id": execution_id })))
}

pub async fn executions(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path((name, id)): Path<(String, i64)>,
) -> Result<Json<Vec<ExecutionDto>>, ApiError> {
    let name = parse_name(&name)?;
    require_manage(&state, &caller, &name).await?;
    schedule_on_agent(&state, &name, id).await?;
    let rows = state.store.executions_for_schedule(id, 100).await?;
    Ok(Json(rows.into_iter().map(ExecutionDto::from).collect()))
}
