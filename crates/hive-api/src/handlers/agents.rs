//! Agent lifecycle and configuration endpoints.

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use hive_coord::creds_key;
use hive_lifecycle::CreateAgent;
use hive_types::{AgentConfig, AgentName, CallerIdentity, HiveError, ResourceSpec};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::auth::Caller;
use crate::dto::AgentDto;
use crate::error::ApiError;
use crate::{denied, parse_name, require_manage, require_owner, visible_agents, AppState};

#[derive(Deserialize, Default)]
pub struct ListParams {
    /// Include orphaned agents. Admin only.
    #[serde(default)]
    pub orphans: bool,
}

pub async fn list(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<AgentDto>>, ApiError> {
    if params.orphans {
        let admin = matches!(
            caller,
            CallerIdentity::System | CallerIdentity::User { admin: true, .. }
        );
        if !admin {
            return Err(ApiError(HiveError::PermissionDenied {
                caller: caller.holder_label(),
                target: "orphan listing".to_string(),
            }));
        }
        let rows = state.store.list_agents(true).await?;
        return Ok(Json(rows.into_iter().map(AgentDto::from).collect()));
    }

    let visible = visible_agents(&state, &caller).await?;
    let mut out = Vec::with_capacity(visible.len());
    for name in visible {
        if let Some(record) = state.store.agent_by_name(&name).await? {
            out.push(AgentDto::from(record));
        }
    }
    Ok(Json(out))
}

#[derive(Deserialize)]
pub struct CreateBody {
    pub name: String,
    #[serde(default = "default_template")]
    pub template: String,
    #[serde(default)]
    pub config: Option<AgentConfig>,
    #[serde(default)]
    pub edges: Vec<AgentName>,
    #[serde(default)]
    pub auto_start: bool,
    /// Owner for system-scoped creation; user callers own what they create.
    #[serde(default)]
    pub owner_id: Option<Uuid>,
}

fn default_template() -> String {
    "default".to_string()
}

pub async fn create(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Json(body): Json<CreateBody>,
) -> Result<(StatusCode, Json<AgentDto>), ApiError> {
    let owner_id = match &caller {
        CallerIdentity::User { id, .. } => *id,
        CallerIdentity::System => body.owner_id.ok_or_else(|| {
            ApiError(HiveError::Validation("owner_id required for system creation".into()))
        })?,
        CallerIdentity::Agent { .. } => {
            return Err(ApiError(HiveError::PermissionDenied {
                caller: caller.holder_label(),
                target: "agent creation".to_string(),
            }))
        }
    };
    let record = state
        .lifecycle
        .create(CreateAgent {
            name: body.name,
            owner_id,
            template: body.template,
            config: body.config.unwrap_or_default(),
            edges: body.edges,
            auto_start: body.auto_start,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(AgentDto::from(record))))
}

pub async fn show(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(name): Path<String>,
) -> Result<Json<AgentDto>, ApiError> {
    let name = parse_name(&name)?;
    let record = require_manage(&state, &caller, &name).await?;
    Ok(Json(AgentDto::from(record)))
}

pub async fn destroy(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    let name = parse_name(&name)?;
    require_owner(&state, &caller, &name).await?;
    state.lifecycle.delete(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn start(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    let name = parse_name(&name)?;
    require_manage(&state, &caller, &name).await?;
    state.lifecycle.start(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn stop(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    let name = parse_name(&name)?;
    require_manage(&state, &caller, &name).await?;
    state.lifecycle.stop(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub struct LogsParams {
    #[serde(default = "default_tail")]
    pub tail: usize,
}

fn default_tail() -> usize {
    100
}

pub async fn logs(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(name): Path<String>,
    Query(params): Query<LogsParams>,
) -> Result<Json<Vec<String>>, ApiError> {
    let name = parse_name(&name)?;
    require_manage(&state, &caller, &name).await?;
    Ok(Json(state.lifecycle.logs(&name, params.tail.min(10_000)).await?))
}

pub async fn stats(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(name): Path<String>,
) -> Result<Json<hive_container::ContainerStats>, ApiError> {
    let name = parse_name(&name)?;
    require_manage(&state, &caller, &name).await?;
    Ok(Json(state.lifecycle.stats(&name).await?))
}

pub async fn busy(
    State(state): State<AppState>,
    Caller(caller): Caller,
) -> Result<Json<Vec<AgentName>>, ApiError> {
    let visible = visible_agents(&state, &caller).await?;
    let busy = state.queue.busy_agents().await?;
    Ok(Json(busy.into_iter().filter(|a| visible.contains(a)).collect()))
}

//─────────────────────────────
//  Declared-config endpoints
//─────────────────────────────

async fn update_config<F>(
    state: &AppState,
    caller: &CallerIdentity,
    name: &AgentName,
    mutate: F,
) -> Result<AgentConfig, ApiError>
where
    F: FnOnce(&mut AgentConfig),
{
    let mut record = require_manage(state, caller, name).await?;
    mutate(&mut record.config);
    state.store.update_agent_config(name, &record.config).await?;
    Ok(record.config)
}

pub async fn get_resources(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(name): Path<String>,
) -> Result<Json<ResourceSpec>, ApiError> {
    let name = parse_name(&name)?;
    let record = require_manage(&state, &caller, &name).await?;
    Ok(Json(record.config.resources))
}

pub async fn put_resources(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(name): Path<String>,
    Json(resources): Json<ResourceSpec>,
) -> Result<Json<ResourceSpec>, ApiError> {
    if resources.cpus <= 0.0 || resources.memory_mb == 0 {
        return Err(ApiError(HiveError::Validation("resources must be positive".into())));
    }
    let name = parse_name(&name)?;
    let config =
        update_config(&state, &caller, &name, |c| c.resources = resources).await?;
    Ok(Json(config.resources))
}

#[derive(Serialize, Deserialize)]
pub struct FoldersBody {
    pub expose: bool,
    pub consume: bool,
}

pub async fn get_folders(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(name): Path<String>,
) -> Result<Json<FoldersBody>, ApiError> {
    let name = parse_name(&name)?;
    let record = require_manage(&state, &caller, &name).await?;
    Ok(Json(FoldersBody {
        expose: record.config.share_expose,
        consume: record.config.share_consume,
    }))
}

pub async fn put_folders(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(name): Path<String>,
    Json(body): Json<FoldersBody>,
) -> Result<Json<FoldersBody>, ApiError> {
    let name = parse_name(&name)?;
    update_config(&state, &caller, &name, |c| {
        c.share_expose = body.expose;
        c.share_consume = body.consume;
    })
    .await?;
    Ok(Json(body))
}

pub async fn get_permissions(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(name): Path<String>,
) -> Result<Json<Vec<AgentName>>, ApiError> {
    let name = parse_name(&name)?;
    require_manage(&state, &caller, &name).await?;
    Ok(Json(state.store.permitted_targets(&name).await?))
}

pub async fn put_permissions(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(name): Path<String>,
    Json(targets): Json<Vec<AgentName>>,
) -> Result<Json<Vec<AgentName>>, ApiError> {
    let name = parse_name(&name)?;
    // Widening the call graph is an owner decision.
    require_owner(&state, &caller, &name).await?;
    for target in &targets {
        state.store.agent_required(target).await?;
    }
    state.store.set_edges(&name, &targets).await?;
    Ok(Json(state.store.permitted_targets(&name).await?))
}

#[derive(Serialize, Deserialize)]
pub struct FlagBody {
    pub enabled: bool,
}

pub async fn get_autonomy(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(name): Path<String>,
) -> Result<Json<FlagBody>, ApiError> {
    let name = parse_name(&name)?;
    let record = require_manage(&state, &caller, &name).await?;
    Ok(Json(FlagBody { enabled: record.config.autonomy_enabled }))
}

pub async fn put_autonomy(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(name): Path<String>,
    Json(body): Json<FlagBody>,
) -> Result<Json<FlagBody>, ApiError> {
    let name = parse_name(&name)?;
    update_config(&state, &caller, &name, |c| c.autonomy_enabled = body.enabled).await?;
    Ok(Json(body))
}

pub async fn get_read_only(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(name): Path<String>,
) -> Result<Json<FlagBody>, ApiError> {
    let name = parse_name(&name)?;
    let record = require_manage(&state, &caller, &name).await?;
    Ok(Json(FlagBody { enabled: record.config.read_only }))
}

pub async fn put_read_only(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(name): Path<String>,
    Json(body): Json<FlagBody>,
) -> Result<Json<FlagBody>, ApiError> {
    let name = parse_name(&name)?;
    update_config(&state, &caller, &name, |c| c.read_only = body.enabled).await?;
    Ok(Json(body))
}

pub async fn get_tags(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(name): Path<String>,
) -> Result<Json<Vec<String>>, ApiError> {
    let name = parse_name(&name)?;
    let record = require_manage(&state, &caller, &name).await?;
    Ok(Json(record.config.tags))
}

pub async fn put_tags(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(name): Path<String>,
    Json(tags): Json<Vec<String>>,
) -> Result<Json<Vec<String>>, ApiError> {
    let name = parse_name(&name)?;
    let config = update_config(&state, &caller, &name, |c| c.tags = tags).await?;
    Ok(Json(config.tags))
}

//─────────────────────────────
//  Credential blobs
//─────────────────────────────

pub async fn put_credentials(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(name): Path<String>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let name = parse_name(&name)?;
    require_owner(&state, &caller, &name).await?;
    state.coord.put_blob(&creds_key(name.as_str()), &body).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn delete_credentials(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    let name = parse_name(&name)?;
    require_owner(&state, &caller, &name).await?;
    state.coord.del(&creds_key(name.as_str())).await?;
    Ok(StatusCode::NO_CONTENT)
}

//─────────────────────────────
//  Chat history
//─────────────────────────────

pub async fn messages(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let name = parse_name(&name)?;
    require_manage(&state, &caller, &name).await?;
    let CallerIdentity::User { id, .. } = &caller else {
        return Err(denied(&caller, &name));
    };
    let session = state.store.session_for(&name, *id).await?;
    let rows = state.store.messages_for_session(session.id, 500).await?;
    let messages: Vec<serde_json::Value> = rows
        .into_iter()
        .map(|m| {
            json!({
                "id": m.id,
                "role": m.role,
                "content": m.content,
                "cost_usd": m.cost_usd,
                "context_tokens": m.context_tokens,
                "tool_summary": m.tool_summary,
                "execution_ms": m.execution_ms,
                "created_at": m.created_at,
            })
        })
        .collect();
    Ok(Json(json!({ "session_id": session.id, "messages": messages })))
}
