//! Typed records and row mapping.
//!
//! Enum fields are stored in their stable string forms and JSON blobs in
//! their tagged forms; mapping back is explicit so schema drift surfaces as
//! an `internal` error instead of a silent misread.

use chrono::{DateTime, Utc};
use hive_types::{
    ActivityDetails, ActivityState, ActivityType, AgentConfig, AgentName, AgentStatus,
    ExecutionStatus, HiveError, HiveResult, RuntimeKind, TranscriptEntry, TriggerKind,
};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

use crate::parse_ts;

//─────────────────────────────
//  Records
//─────────────────────────────

/// A user row.
#[derive(Debug, Clone, PartialEq)]
pub struct UserRecord {
    /// User id.
    pub id: Uuid,
    /// Email address.
    pub email: String,
    /// Admin flag.
    pub is_admin: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// An agent row with its declared configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentRecord {
    /// Sanitized unique name.
    pub name: AgentName,
    /// Owning user.
    pub owner_id: Uuid,
    /// Template reference the agent was created from.
    pub template: String,
    /// Runtime kind.
    pub kind: RuntimeKind,
    /// Steady lifecycle state.
    pub status: AgentStatus,
    /// Whether this is the designated system agent.
    pub is_system: bool,
    /// Whether reconciliation found a container without a row for it.
    pub orphaned: bool,
    /// Declared configuration.
    pub config: AgentConfig,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// A stored API key (digest only; the clear value exists only at issuance).
#[derive(Debug, Clone, PartialEq)]
pub struct ApiKeyRecord {
    /// Row id.
    pub id: i64,
    /// Salted digest of the key.
    pub digest: String,
    /// Per-key salt.
    pub salt: String,
    /// Scope tag: `user`, `agent`, or `system`.
    pub scope: String,
    /// Bound user for user-scoped keys.
    pub user_id: Option<Uuid>,
    /// Bound agent for agent-scoped keys.
    pub agent: Option<AgentName>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// A schedule row.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleRecord {
    /// Row id.
    pub id: i64,
    /// Owning agent.
    pub agent: AgentName,
    /// Five-field cron expression.
    pub cron: String,
    /// IANA timezone name the expression is evaluated in.
    pub timezone: String,
    /// Static message dispatched on fire.
    pub message: String,
    /// Enabled flag. The agent's autonomy flag gates fires in aggregate
    /// without clearing this.
    pub enabled: bool,
    /// Whether fires take the parallel path instead of the queue.
    pub parallel: bool,
    /// Last fire time.
    pub last_run_at: Option<DateTime<Utc>>,
    /// Next due time.
    pub next_run_at: Option<DateTime<Utc>>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// A durable execution row.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionRecord {
    /// Durable id, distinct from the volatile queue id.
    pub id: i64,
    /// Agent the work ran on.
    pub agent: AgentName,
    /// Producing schedule, if any.
    pub schedule_id: Option<i64>,
    /// Volatile queue id while the slot was held.
    pub queue_id: Option<Uuid>,
    /// Input message.
    pub input: String,
    /// Identity kind that initiated the execution.
    pub triggered_by: TriggerKind,
    /// Calling agent for agent-triggered executions.
    pub source_agent: Option<AgentName>,
    /// Status, monotonic queued → running → terminal.
    pub status: ExecutionStatus,
    /// Dispatch time.
    pub started_at: Option<DateTime<Utc>>,
    /// Seal time.
    pub completed_at: Option<DateTime<Utc>>,
    /// Wall-clock duration.
    pub duration_ms: Option<i64>,
    /// Cost in USD.
    pub cost_usd: Option<f64>,
    /// Tokens consumed.
    pub tokens: Option<i64>,
    /// Sealed transcript.
    pub transcript: Option<Vec<TranscriptEntry>>,
    /// Error message for failed executions.
    pub error: Option<String>,
    /// Row creation time.
    pub created_at: DateTime<Utc>,
}

/// Fields for inserting an execution row.
#[derive(Debug, Clone)]
pub struct NewExecution {
    /// Agent the work targets.
    pub agent: AgentName,
    /// Producing schedule, if any.
    pub schedule_id: Option<i64>,
    /// Volatile queue id when the sequential path admitted the work.
    pub queue_id: Option<Uuid>,
    /// Input message.
    pub input: String,
    /// Identity kind that initiated the execution.
    pub triggered_by: TriggerKind,
    /// Calling agent for agent-triggered executions.
    pub source_agent: Option<AgentName>,
    /// Initial status; `queued` or `running`.
    pub status: ExecutionStatus,
}

/// An activity row.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityRecord {
    /// Row id; tiebreaker for per-agent insertion order.
    pub id: i64,
    /// Agent the event belongs to.
    pub agent: AgentName,
    /// Activity kind.
    pub activity_type: ActivityType,
    /// Lifecycle state.
    pub state: ActivityState,
    /// Start time.
    pub started_at: DateTime<Utc>,
    /// Completion time.
    pub completed_at: Option<DateTime<Utc>>,
    /// Duration between start and completion.
    pub duration_ms: Option<i64>,
    /// Parent activity (tool calls point at their chat/schedule start).
    pub parent_activity_id: Option<i64>,
    /// Linked execution row.
    pub related_execution_id: Option<i64>,
    /// Linked chat message row.
    pub related_message_id: Option<i64>,
    /// Identity kind that triggered the activity.
    pub triggered_by: TriggerKind,
    /// Typed details blob.
    pub details: ActivityDetails,
    /// Row creation time.
    pub created_at: DateTime<Utc>,
}

/// Fields for inserting an activity row.
#[derive(Debug, Clone)]
pub struct NewActivity {
    /// Agent the event belongs to.
    pub agent: AgentName,
    /// Activity kind.
    pub activity_type: ActivityType,
    /// Lifecycle state at insertion.
    pub state: ActivityState,
    /// Parent activity, if structured.
    pub parent_activity_id: Option<i64>,
    /// Linked execution row. When inserted together with its execution the
    /// ledger fills this in.
    pub related_execution_id: Option<i64>,
    /// Linked chat message row.
    pub related_message_id: Option<i64>,
    /// Identity kind that triggered the activity.
    pub triggered_by: TriggerKind,
    /// Typed details blob.
    pub details: ActivityDetails,
}

/// A chat session row.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatSessionRecord {
    /// Row id.
    pub id: i64,
    /// Agent side of the pair.
    pub agent: AgentName,
    /// User side of the pair.
    pub user_id: Uuid,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// A chat message row.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessageRecord {
    /// Row id.
    pub id: i64,
    /// Owning session.
    pub session_id: i64,
    /// Message role: `user` or `assistant`.
    pub role: String,
    /// Message content.
    pub content: String,
    /// Cost of producing an assistant message.
    pub cost_usd: Option<f64>,
    /// Context tokens in use when the message was produced.
    pub context_tokens: Option<i64>,
    /// Summary of tool calls made while producing the message.
    pub tool_summary: Option<String>,
    /// Execution wall-clock time.
    pub execution_ms: Option<i64>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

//─────────────────────────────
//  Row mapping
//─────────────────────────────

fn get_uuid(row: &SqliteRow, col: &str) -> HiveResult<Uuid> {
    let raw: String = row.get(col);
    Uuid::parse_str(&raw).map_err(|e| HiveError::Internal(format!("bad uuid in {col}: {e}")))
}

fn get_opt_uuid(row: &SqliteRow, col: &str) -> HiveResult<Option<Uuid>> {
    let raw: Option<String> = row.get(col);
    raw.map(|r| {
        Uuid::parse_str(&r).map_err(|e| HiveError::Internal(format!("bad uuid in {col}: {e}")))
    })
    .transpose()
}

fn get_ts(row: &SqliteRow, col: &str) -> HiveResult<DateTime<Utc>> {
    let raw: String = row.get(col);
    parse_ts(&raw)
}

fn get_opt_ts(row: &SqliteRow, col: &str) -> HiveResult<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(col);
    raw.map(|r| parse_ts(&r)).transpose()
}

fn get_name(row: &SqliteRow, col: &str) -> HiveResult<AgentName> {
    let raw: String = row.get(col);
    AgentName::parse(&raw)
}

fn get_opt_name(row: &SqliteRow, col: &str) -> HiveResult<Option<AgentName>> {
    let raw: Option<String> = row.get(col);
    raw.map(|r| AgentName::parse(&r)).transpose()
}

impl UserRecord {
    pub(crate) fn from_row(row: &SqliteRow) -> HiveResult<Self> {
        Ok(Self {
            id: get_uuid(row, "id")?,
            email: row.get("email"),
            is_admin: row.get::<i64, _>("is_admin") != 0,
            created_at: get_ts(row, "created_at")?,
        })
    }
}

impl AgentRecord {
    pub(crate) fn from_row(row: &SqliteRow) -> HiveResult<Self> {
        let config_raw: String = row.get("config");
        let config: AgentConfig = serde_json::from_str(&config_raw)
            .map_err(|e| HiveError::Internal(format!("bad agent config blob: {e}")))?;
        let kind_raw: String = row.get("kind");
        let status_raw: String = row.get("status");
        Ok(Self {
            name: get_name(row, "name")?,
            owner_id: get_uuid(row, "owner_id")?,
            template: row.get("template"),
            kind: RuntimeKind::parse(&kind_raw)?,
            status: AgentStatus::parse(&status_raw)?,
            is_system: row.get::<i64, _>("is_system") != 0,
            orphaned: row.get::<i64, _>("orphaned") != 0,
            config,
            created_at: get_ts(row, "created_at")?,
        })
    }
}

impl ApiKeyRecord {
    pub(crate) fn from_row(row: &SqliteRow) -> HiveResult<Self> {
        Ok(Self {
            id: row.get("id"),
            digest: row.get("digest"),
            salt: row.get("salt"),
            scope: row.get("scope"),
            user_id: get_opt_uuid(row, "user_id")?,
            agent: get_opt_name(row, "agent")?,
            created_at: get_ts(row, "created_at")?,
        })
    }
}

impl ScheduleRecord {
    pub(crate) fn from_row(row: &SqliteRow) -> HiveResult<Self> {
        Ok(Self {
            id: row.get("id"),
            agent: get_name(row, "agent")?,
            cron: row.get("cron"),
            timezone: row.get("timezone"),
            message: row.get("message"),
            enabled: row.get::<i64, _>("enabled") != 0,
            parallel: row.get::<i64, _>("parallel") != 0,
            last_run_at: get_opt_ts(row, "last_run_at")?,
            next_run_at: get_opt_ts(row, "next_run_at")?,
            created_at: get_ts(row, "created_at")?,
        })
    }
}

impl ExecutionRecord {
    pub(crate) fn from_row(row: &SqliteRow) -> HiveResult<Self> {
        let triggered_raw: String = row.get("triggered_by");
        let status_raw: String = row.get("status");
        let transcript_raw: Option<String> = row.get("transcript");
        let transcript = transcript_raw
            .map(|t| {
                serde_json::from_str::<Vec<TranscriptEntry>>(&t)
                    .map_err(|e| HiveError::Internal(format!("bad transcript blob: {e}")))
            })
            .transpose()?;
        Ok(Self {
            id: row.get("id"),
            agent: get_name(row, "agent")?,
            schedule_id: row.get("schedule_id"),
            queue_id: get_opt_uuid(row, "queue_id")?,
            input: row.get("input"),
            triggered_by: TriggerKind::parse(&triggered_raw)?,
            source_agent: get_opt_name(row, "source_agent")?,
            status: ExecutionStatus::parse(&status_raw)?,
            started_at: get_opt_ts(row, "started_at")?,
            completed_at: get_opt_ts(row, "completed_at")?,
            duration_ms: row.get("duration_ms"),
            cost_usd: row.get("cost_usd"),
            tokens: row.get("tokens"),
            transcript,
            error: row.get("error"),
            created_at: get_ts(row, "created_at")?,
        })
    }
}

impl ActivityRecord {
    pub(crate) fn from_row(row: &SqliteRow) -> HiveResult<Self> {
        let type_raw: String = row.get("activity_type");
        let state_raw: String = row.get("state");
        let details_raw: String = row.get("details");
        let details: ActivityDetails = serde_json::from_str(&details_raw)
            .map_err(|e| HiveError::Internal(format!("bad activity details blob: {e}")))?;
        let triggered_raw: String = row.get("triggered_by");
        Ok(Self {
            id: row.get("id"),
            agent: get_name(row, "agent")?,
            activity_type: ActivityType::parse(&type_raw)?,
            state: ActivityState::parse(&state_raw)?,
            started_at: get_ts(row, "started_at")?,
            completed_at: get_opt_ts(row, "completed_at")?,
            duration_ms: row.get("duration_ms"),
            parent_activity_id: row.get("parent_activity_id"),
            related_execution_id: row.get("related_execution_id"),
            related_message_id: row.get("related_message_id"),
            triggered_by: TriggerKind::parse(&triggered_raw)?,
            details,
            created_at: get_ts(row, "created_at")?,
        })
    }
}

impl ChatSessionRecord {
    pub(crate) fn from_row(row: &SqliteRow) -> HiveResult<Self> {
        Ok(Self {
            id: row.get("id"),
            agent: get_name(row, "agent")?,
            user_id: get_uuid(row, "user_id")?,
            created_at: get_ts(row, "created_at")?,
        })
    }
}

impl ChatMessageRecord {
    pub(crate) fn from_row(row: &SqliteRow) -> HiveResult<Self> {
        Ok(Self {
            id: row.get("id"),
            session_id: row.get("session_id"),
            role: row.get("role"),
            content: row.get("content"),
            cost_usd: row.get("cost_usd"),
            context_tokens: row.get("context_tokens"),
            tool_summary: row.get("tool_summary"),
            execution_ms: row.get("execution_ms"),
            created_at: get_ts(row, "created_at")?,
        })
    }
}
