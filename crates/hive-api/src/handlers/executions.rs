//! Execution endpoints: chat, task, inspection, live stream, termination.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::Json;
use futures::stream::Stream;
use hive_gateway::{CallOutcome, CallRequest};
use hive_types::{CallOverrides, ExecutionMode, HiveError};
use serde::Deserialize;
use serde_json::json;
use tokio_stream::StreamExt;

use crate::auth::Caller;
use crate::dto::ExecutionDto;
use crate::error::ApiError;
use crate::{parse_name, require_manage, AppState};

#[derive(Deserialize)]
pub struct ChatBody {
    pub message: String,
    #[serde(default)]
    pub overrides: CallOverrides,
}

/// Sequential chat. Returns the sealed result, or a busy envelope naming the
/// holder when the queue slot is taken.
pub async fn chat(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(name): Path<String>,
    Json(body): Json<ChatBody>,
) -> Result<impl IntoResponse, ApiError> {
    let name = parse_name(&name)?;
    let outcome = state
        .gateway
        .call(CallRequest {
            caller,
            target: name,
            message: body.message,
            mode: ExecutionMode::Sequential,
            overrides: body.overrides,
        })
        .await?;
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
        CallOutcome::Busy { holder, retry_after_secs } => Err(ApiError(HiveError::Busy {
            holder,
            retry_after_secs,
        })),
        CallOutcome::Accepted { .. } => {
            Err(ApiError(HiveError::Internal("sequential chat returned a receipt".into())))
        }
    }
}

#[derive(Deserialize)]
pub struct TaskBody {
    pub message: String,
    #[serde(default)]
    pub r#async: bool,
    #[serde(default)]
    pub overrides: CallOverrides,
}

/// Stateless parallel task. With `async=true` returns an accepted receipt
/// immediately; the caller polls the execution endpoint.
pub async fn task(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(name): Path<String>,
    Json(body): Json<TaskBody>,
) -> Result<impl IntoResponse, ApiError> {
    let name = parse_name(&name)?;
    let mode = if body.r#async { ExecutionMode::ParallelAsync } else { ExecutionMode::Parallel };
    let outcome = state
        .gateway
        .call(CallRequest {
            caller,
            target: name,
            message: body.message,
            mode,
            overrides: body.overrides,
        })
        .await?;
    match outcome {
        CallOutcome::Completed { execution_id, response } => Ok((
            StatusCode::OK,
            Json(json!({
                "status": "completed",
                "execution_id": execution_id,
                "result": response.result,
                "cost_usd": response.cost_usd,
                "tokens": response.tokens,
            })),
        )),
        CallOutcome::Accepted { execution_id } => Ok((
            StatusCode::ACCEPTED,
            Json(json!({
                "status": "accepted",
                "execution_id": execution_id,
            })),
        )),
        CallOutcome::Busy { .. } => {
            Err(ApiError(HiveError::Internal("parallel task reported busy".into())))
        }
    }
}

#[derive(Deserialize)]
pub struct ListParams {
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    50
}

pub async fn list(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(name): Path<String>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<ExecutionDto>>, ApiError> {
    let name = parse_name(&name)?;
    require_manage(&state, &caller, &name).await?;
    let rows = state
        .store
        .executions_for_agent(&name, params.limit.clamp(1, 500))
        .await?;
    Ok(Json(rows.into_iter().map(ExecutionDto::from).collect()))
}

pub async fn show(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path((name, id)): Path<(String, i64)>,
) -> Result<Json<ExecutionDto>, ApiError> {
    let name = parse_name(&name)?;
    require_manage(&state, &caller, &name).await?;
    let record = state
        .store
        .execution_by_id(id)
        .await?
        .filter(|r| r.agent == name)
        .ok_or_else(|| ApiError(HiveError::NotFound(format!("execution {id}"))))?;
    Ok(Json(ExecutionDto::from(record)))
}

/// Sealed transcript of a finished execution.
pub async fn log(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path((name, id)): Path<(String, i64)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let name = parse_name(&name)?;
    require_manage(&state, &caller, &name).await?;
    let record = state
        .store
        .execution_by_id(id)
        .await?
        .filter(|r| r.agent == name)
        .ok_or_else(|| ApiError(HiveError::NotFound(format!("execution {id}"))))?;
    if !record.status.is_terminal() {
        return Err(ApiError(HiveError::Conflict(format!(
            "execution {id} is not sealed yet"
        ))));
    }
    Ok(Json(json!({
        "execution_id": record.id,
        "status": record.status,
        "transcript": record.transcript.unwrap_or_default(),
        "error": record.error,
    })))
}

/// Live activity stream for one execution. Emits the ledger deltas that
/// reference the execution and closes once the row seals. Requires proxy
/// buffering off end to end.
pub async fn stream(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path((name, id)): Path<(String, i64)>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let name = parse_name(&name)?;
    require_manage(&state, &caller, &name).await?;
    state
        .store
        .execution_by_id(id)
        .await?
        .filter(|r| r.agent == name)
        .ok_or_else(|| ApiError(HiveError::NotFound(format!("execution {id}"))))?;

    let events = state.ledger.subscribe_local();
    let store = state.store.clone();
    let stream = async_stream(events, store, id);
    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}

/// Forward ledger deltas for one execution into an SSE stream, sealing it
/// when the row reaches a terminal status.
fn async_stream(
    mut events: tokio::sync::broadcast::Receiver<hive_ledger::ActivityEvent>,
    store: hive_store::StateStore,
    execution_id: i64,
) -> impl Stream<Item = Result<Event, Infallible>> {
    let (tx, rx) = tokio::sync::mpsc::channel::<Event>(64);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                received = events.recv() => {
                    match received {
                        Ok(event) if event.related_execution_id == Some(execution_id) => {
                            let payload = serde_json::to_string(&event)
                                .unwrap_or_else(|_| "{}".to_string());
                            if tx.send(Event::default().event("activity").data(payload))
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                        Ok(_) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
                _ = tokio::time::sleep(Duration::from_millis(500)) => {
                    match store.execution_by_id(execution_id).await {
                        Ok(Some(record)) if record.status.is_terminal() => {
                            let payload = serde_json::json!({
                                "execution_id": execution_id,
                                "status": record.status,
                            })
                            .to_string();
                            let _ = tx.send(Event::default().event("sealed").data(payload)).await;
                            break;
                        }
                        Ok(_) => {}
                        Err(_) => break,
                    }
                }
            }
        }
    });
    tokio_stream::wrappers::ReceiverStream::new(rx).map(Ok)
}

#[derive(Deserialize, Default)]
pub struct TerminateBody {
    #[serde(default)]
    pub reason: Option<String>,
}

/// Terminate an in-flight execution.
pub async fn terminate(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path((name, id)): Path<(String, i64)>,
    body: Option<Json<TerminateBody>>,
) -> Result<StatusCode, ApiError> {
    let name = parse_name(&name)?;
    require_manage(&state, &caller, &name).await?;
    let reason = body.and_then(|Json(b)| b.reason);
    state.gateway.terminate(&name, id, &caller, reason).await?;
    Ok(StatusCode::NO_CONTENT)
}
