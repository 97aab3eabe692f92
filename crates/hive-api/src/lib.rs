#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **hive-api** – Orchestrator HTTP API for the hive control plane.
//!
//! The only component that speaks to untrusted callers. Each request is
//! authenticated, resolved to a [`CallerIdentity`], and passed through to
//! the lifecycle manager, the execution queue, the RPC gateway, the
//! scheduler, or the ledger, with no business logic beyond the access checks
//! that belong to the HTTP surface (e.g. only the owner may delete).
//!
//! `/ws/events` subscribers get the activity stream filtered to their
//! visible agent set, computed once per socket.

use std::sync::Arc;

use axum::routing::{get, post, put};
use axum::Router;
use hive_auth::KeyResolver;
use hive_coord::CoordStore;
use hive_gateway::RpcGateway;
use hive_ledger::ActivityLedger;
use hive_lifecycle::LifecycleManager;
use hive_queue::ExecutionQueue;
use hive_scheduler::Scheduler;
use hive_store::{AgentRecord, StateStore};
use hive_types::{AgentName, CallerIdentity, HiveError, HiveResult};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

mod auth;
mod dto;
mod error;
mod handlers;

pub use auth::Caller;
pub use dto::{ActivityDto, AgentDto, ExecutionDto, ScheduleDto};
pub use error::{status_for, ApiError};

/// Shared service state. Cheap to clone; handles are Arc'd or pooled.
#[derive(Clone)]
pub struct AppState {
    /// Relational store.
    pub store: StateStore,
    /// API-key resolver.
    pub resolver: Arc<dyn KeyResolver>,
    /// Coordination store (credential blobs, event channel).
    pub coord: Arc<dyn CoordStore>,
    /// Per-agent execution queue.
    pub queue: ExecutionQueue,
    /// Activity/execution ledger.
    pub ledger: ActivityLedger,
    /// Agent lifecycle manager.
    pub lifecycle: LifecycleManager,
    /// Inter-agent RPC gateway.
    pub gateway: RpcGateway,
    /// Scheduler handle, for manual triggers only. The evaluation loop runs
    /// in its own single-instance process.
    pub scheduler: Scheduler,
}

/// Build the full route table.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/activities", get(handlers::recent_activities))
        .route("/agents", get(handlers::agents::list).post(handlers::agents::create))
        .route("/agents/busy", get(handlers::agents::busy))
        .route(
            "/agents/:name",
            get(handlers::agents::show).delete(handlers::agents::destroy),
        )
        .route("/agents/:name/start", post(handlers::agents::start))
        .route("/agents/:name/stop", post(handlers::agents::stop))
        .route("/agents/:name/logs", get(handlers::agents::logs))
        .route("/agents/:name/stats", get(handlers::agents::stats))
        .route(
            "/agents/:name/resources",
            get(handlers::agents::get_resources).put(handlers::agents::put_resources),
        )
        .route(
            "/agents/:name/folders",
            get(handlers::agents::get_folders).put(handlers::agents::put_folders),
        )
        .route(
            "/agents/:name/permissions",
            get(handlers::agents::get_permissions).put(handlers::agents::put_permissions),
        )
        .route(
            "/agents/:name/autonomy",
            get(handlers::agents::get_autonomy).put(handlers::agents::put_autonomy),
        )
        .route(
            "/agents/:name/read-only",
            get(handlers::agents::get_read_only).put(handlers::agents::put_read_only),
        )
        .route(
            "/agents/:name/tags",
            get(handlers::agents::get_tags).put(handlers::agents::put_tags),
        )
        .route(
            "/agents/:name/credentials",
            put(handlers::agents::put_credentials).delete(handlers::agents::delete_credentials),
        )
        .route("/agents/:name/messages", get(handlers::agents::messages))
        .route("/agents/:name/chat", post(handlers::executions::chat))
        .route("/agents/:name/task", post(handlers::executions::task))
        .route("/agents/:name/executions", get(handlers::executions::list))
        .route("/agents/:name/executions/:id", get(handlers::executions::show))
        .route("/agents/:name/executions/:id/log", get(handlers::executions::log))
        .route("/agents/:name/executions/:id/stream", get(handlers::executions::stream))
        .route(
            "/agents/:name/executions/:id/terminate",
            post(handlers::executions::terminate),
        )
        .route(
            "/agents/:name/schedules",
            get(handlers::schedules::list).post(handlers::schedules::create),
        )
        .route(
            "/agents/:name/schedules/:id",
            get(handlers::schedules::show)
                .put(handlers::schedules::update)
                .delete(handlers::schedules::destroy),
        )
        .route("/agents/:name/schedules/:id/enable", post(handlers::schedules::enable))
        .route("/agents/:name/schedules/:id/disable", post(handlers::schedules::disable))
        .route("/agents/:name/schedules/:id/trigger", post(handlers::schedules::trigger))
        .route(
            "/agents/:name/schedules/:id/executions",
            get(handlers::schedules::executions),
        )
        .route("/internal/chat", post(handlers::internal::chat))
        .route("/internal/task", post(handlers::internal::task))
        .route(
            "/internal/executions/:id/complete",
            post(handlers::internal::complete),
        )
        .route("/ws/events", get(handlers::events::subscribe))
        .with_state(state)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()).into_inner())
}

//─────────────────────────────
//  Access checks
//─────────────────────────────

/// The agent set a caller may observe: owned ∪ shared for users, permitted
/// targets plus self for agents, everything for system and admins.
pub async fn visible_agents(
    state: &AppState,
    caller: &CallerIdentity,
) -> HiveResult<Vec<AgentName>> {
    match caller {
        CallerIdentity::System => {
            Ok(state.store.list_agents(false).await?.into_iter().map(|a| a.name).collect())
        }
        CallerIdentity::User { id, admin } => Ok(state
            .store
            .accessible_agents(*id, *admin)
            .await?
            .into_iter()
            .map(|a| a.name)
            .collect()),
        CallerIdentity::Agent { name } => {
            let mut visible = state.store.permitted_targets(name).await?;
            visible.push(name.clone());
            visible.sort();
            visible.dedup();
            Ok(visible)
        }
    }
}

/// Management access: users need ownership/share/admin; agents may manage
/// only themselves; system manages everything.
pub(crate) async fn require_manage(
    state: &AppState,
    caller: &CallerIdentity,
    agent: &AgentName,
) -> Result<AgentRecord, ApiError> {
    let record = state.store.agent_required(agent).await?;
    match caller {
        CallerIdentity::System => Ok(record),
        CallerIdentity::User { id, admin } => {
            if state.store.user_can_access(*id, *admin, agent).await? {
                Ok(record)
            } else {
                Err(denied(caller, agent))
            }
        }
        CallerIdentity::Agent { name } => {
            if name == agent {
                Ok(record)
            } else {
                Err(denied(caller, agent))
            }
        }
    }
}

/// Destructive access: owner or admin only (and system).
pub(crate) async fn require_owner(
    state: &AppState,
    caller: &CallerIdentity,
    agent: &AgentName,
) -> Result<AgentRecord, ApiError> {
    let record = state.store.agent_required(agent).await?;
    match caller {
        CallerIdentity::System => Ok(record),
        CallerIdentity::User { id, admin } => {
            if *admin || record.owner_id == *id {
                Ok(record)
            } else {
                Err(denied(caller, agent))
            }
        }
        CallerIdentity::Agent { .. } => Err(denied(caller, agent)),
    }
}

pub(crate) fn denied(caller: &CallerIdentity, agent: &AgentName) -> ApiError {
    ApiError(HiveError::PermissionDenied {
        caller: caller.holder_label(),
        target: agent.to_string(),
    })
}

pub(crate) fn parse_name(raw: &str) -> Result<AgentName, ApiError> {
    Ok(AgentName::parse(raw)?)
}

#[cfg(test)]
mod tests;
