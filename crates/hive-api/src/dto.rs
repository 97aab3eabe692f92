//! Wire shapes returned by the API.

use chrono::{DateTime, Utc};
use hive_store::{ActivityRecord, AgentRecord, ExecutionRecord, ScheduleRecord};
use hive_types::{
    ActivityDetails, ActivityState, ActivityType, AgentConfig, AgentName, AgentStatus,
    ExecutionStatus, RuntimeKind, TriggerKind,
};
use serde::Serialize;
use uuid::Uuid;

/// Agent listing/detail shape.
#[derive(Debug, Clone, Serialize)]
pub struct AgentDto {
    /// Sanitized unique name.
    pub name: AgentName,
    /// Owning user.
    pub owner_id: Uuid,
    /// Template the agent was created from.
    pub template: String,
    /// Runtime kind.
    pub kind: RuntimeKind,
    /// Steady lifecycle state.
    pub status: AgentStatus,
    /// Whether reconciliation flagged the agent as an orphan.
    pub orphaned: bool,
    /// Declared configuration.
    pub config: AgentConfig,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl From<AgentRecord> for AgentDto {
    fn from(record: AgentRecord) -> Self {
        Self {
            name: record.name,
            owner_id: record.owner_id,
            template: record.template,
            kind: record.kind,
            status: record.status,
            orphaned: record.orphaned,
            config: record.config,
            created_at: record.created_at,
        }
    }
}

/// Execution detail shape.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionDto {
    /// Durable id.
    pub id: i64,
    /// Agent the work ran on.
    pub agent: AgentName,
    /// Producing schedule, if any.
    pub schedule_id: Option<i64>,
    /// Input message.
    pub input: String,
    /// Identity kind that initiated the execution.
    pub triggered_by: TriggerKind,
    /// Calling agent for agent-triggered executions.
    pub source_agent: Option<AgentName>,
    /// Status.
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
    /// Error message for failed executions.
    pub error: Option<String>,
    /// Row creation time.
    pub created_at: DateTime<Utc>,
}

impl From<ExecutionRecord> for ExecutionDto {
    fn from(record: ExecutionRecord) -> Self {
        Self {
            id: record.id,
            agent: record.agent,
            schedule_id: record.schedule_id,
            input: record.input,
            triggered_by: record.triggered_by,
            source_agent: record.source_agent,
            status: record.status,
            started_at: record.started_at,
            completed_at: record.completed_at,
            duration_ms: record.duration_ms,
            cost_usd: record.cost_usd,
            tokens: record.tokens,
            error: record.error,
            created_at: record.created_at,
        }
    }
}

/// Schedule detail shape.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduleDto {
    /// Row id.
    pub id: i64,
    /// Owning agent.
    pub agent: AgentName,
    /// Five-field cron expression.
    pub cron: String,
    /// IANA timezone the expression is evaluated in.
    pub timezone: String,
    /// Message dispatched on fire.
    pub message: String,
    /// Enabled flag.
    pub enabled: bool,
    /// Whether fires take the parallel path.
    pub parallel: bool,
    /// Last fire time.
    pub last_run_at: Option<DateTime<Utc>>,
    /// Next due time.
    pub next_run_at: Option<DateTime<Utc>>,
}

impl From<ScheduleRecord> for ScheduleDto {
    fn from(record: ScheduleRecord) -> Self {
        Self {
            id: record.id,
            agent: record.agent,
            cron: record.cron,
            timezone: record.timezone,
            message: record.message,
            enabled: record.enabled,
            parallel: record.parallel,
            last_run_at: record.last_run_at,
            next_run_at: record.next_run_at,
        }
    }
}

/// Activity shape for the dashboard feed.
#[derive(Debug, Clone, Serialize)]
pub struct ActivityDto {
    /// Row id.
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
    /// Parent activity.
    pub parent_activity_id: Option<i64>,
    /// Linked execution row.
    pub related_execution_id: Option<i64>,
    /// Identity kind that triggered the activity.
    pub triggered_by: TriggerKind,
    /// Typed details blob.
    pub details: ActivityDetails,
}

impl From<ActivityRecord> for ActivityDto {
    fn from(record: ActivityRecord) -> Self {
        Self {
            id: record.id,
            agent: record.agent,
            activity_type: record.activity_type,
            state: record.state,
            started_at: record.started_at,
            completed_at: record.completed_at,
            duration_ms: record.duration_ms,
            parent_activity_id: record.parent_activity_id,
            related_execution_id: record.related_execution_id,
            triggered_by: record.triggered_by,
            details: record.details,
        }
    }
}
