//! Internal gateway surface used by sandboxes.
//!
//! Authenticated by agent-scoped API keys. The `X-Source-Agent` header is
//! advisory; the key binding is authoritative, and a mismatch between the
//! two is treated as a forged header and denied.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use hive_gateway::{CallOutcome, CallRequest, SOURCE_AGENT_HEADER};
use hive_types::{
    AgentName, CallOverrides, CallerIdentity, ExecutionMode, ExecutionStatus, HiveError,
};
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use crate::auth::Caller;
use crate::error::ApiError;
use crate::AppState;

fn check_source_header(headers: &HeaderMap, caller: &CallerIdentity) -> Result<(), ApiError> {
    let Some(raw) = headers.get(SOURCE_AGENT_HEADER) else {
        return Ok(());
    };
    let claimed = raw
        .to_str()
        .map_err(|_| ApiError(HiveError::Validation("bad X-Source-Agent header".into())))?;
    match caller {
        CallerIdentity::Agent { name } if name.as_str() == claimed => Ok(()),
        CallerIdentity::System => Ok(()),
        _ => {
            warn!(claimed, caller = %caller.holder_label(), "source header mismatch");
            Err(ApiError(HiveError::PermissionDenied {
                caller: caller.holder_label(),
                target: format!("source header {claimed}"),
            }))
        }
    }
}

#[derive(Deserialize)]
pub struct InternalCallBody {
    pub target: AgentName,
    pub message: String,
    #[serde(default)]
    pub r#async: bool,
    #[serde(default)]
    pub overrides: CallOverrides,
}

/// Inter-agent sequential chat.
pub async fn chat(
    State(state): State<AppState>,
    Caller(caller): Caller,
    headers: HeaderMap,
    Json(body): Json<InternalCallBody>,
) -> Result<impl IntoResponse, ApiError> {
    check_source_header(&headers, &caller)?;
    let outcome = state
        .gateway
        .call(CallRequest {
            caller,
            target: body.target,
            message: body.message,
            mode: ExecutionMode::Sequential,
            overrides: body.overrides,
        })
        .await?;
    respond(outcome)
}

/// Inter-agent parallel task, optionally fire-and-forget.
pub async fn task(
    State(state): State<AppState>,
    Caller(caller): Caller,
    headers: HeaderMap,
    Json(body): Json<InternalCallBody>,
) -> Result<impl IntoResponse, ApiError> {
    check_source_header(&headers, &caller)?;
    let mode = if body.r#async { ExecutionMode::ParallelAsync } else { ExecutionMode::Parallel };
    let outcome = state
        .gateway
        .call(CallRequest {
            caller,
            target: body.target,
            message: body.message,
            mode,
            overrides: body.overrides,
        })
        .await?;
    respond(outcome)
}

fn respond(outcome: CallOutcome) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    match outcome {
        CallOutcome::Completed { execution_id, response } => Ok((
            StatusCode::OK,
            Json(json!({
                "status": "completed",
                "execution_id": execution_id,
                "result": response.result,
                "transcript": response.transcript,
                "cost_usd": response.cost_usd,
                "tokens": response.tokens,
            })),
        )),
        CallOutcome::Accepted { execution_id } => Ok((
            StatusCode::ACCEPTED,
            Json(json!({ "status": "accepted", "execution_id": execution_id })),
        )),
        CallOutcome::Busy { holder, retry_after_secs } => {
            Err(ApiError(HiveError::Busy { holder, retry_after_secs }))
        }
    }
}

#[derive(Deserialize)]
pub struct CompleteBody {
    pub status: String,
    #[serde(default)]
    pub error: Option<String>,
}

/// Completion event from a sandbox, emitted after an operator-requested
/// termination. Releases the queue slot and seals the row; both steps are
/// conditional, so arriving after the control-plane handler is harmless.
pub async fn complete(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(execution_id): Path<i64>,
    Json(body): Json<CompleteBody>,
) -> Result<StatusCode, ApiError> {
    let record = state
        .store
        .execution_by_id(execution_id)
        .await?
        .ok_or_else(|| ApiError(HiveError::NotFound(format!("execution {execution_id}"))))?;

    // Only the executing agent (or system) may report completion.
    match &caller {
        CallerIdentity::System => {}
        CallerIdentity::Agent { name } if *name == record.agent => {}
        _ => {
            return Err(ApiError(HiveError::PermissionDenied {
                caller: caller.holder_label(),
                target: format!("execution {execution_id}"),
            }))
        }
    }

    let status = match body.status.as_str() {
        "cancelled" => ExecutionStatus::Cancelled,
        "failed" => ExecutionStatus::Failed,
        "succeeded" => ExecutionStatus::Succeeded,
        other => {
            return Err(ApiError(HiveError::Validation(format!(
                "unknown completion status {other:?}"
            ))))
        }
    };

    if let Some(queue_id) = record.queue_id {
        state.queue.complete(&record.agent, queue_id).await?;
    }
    state
        .ledger
        .seal_execution(execution_id, status, None, None, None, body.error.as_deref())
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
